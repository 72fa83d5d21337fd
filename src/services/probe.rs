//! Probing run: roster, probes, classification, persistence

use std::sync::Arc;
use std::time::{Duration, Instant};

use chrono::Utc;
use tokio::sync::watch;
use tracing::{info, instrument};

use crate::config::ProbeConfig;
use crate::controller::ControlPlane;
use crate::error::Result;
use crate::models::{ClassifiedResults, ProbeProgress};
use crate::probe::{ProbeEngine, ProbeEngineConfig};
use crate::repository::ResultsRepository;

/// Outcome of a finished probing run
#[derive(Debug, Clone)]
pub struct ProbeReport {
    pub results: ClassifiedResults,
    pub elapsed: Duration,
}

/// Probes one group and writes the classified results
pub struct ProbeService {
    engine: ProbeEngine,
    repository: ResultsRepository,
    group: String,
}

impl ProbeService {
    pub fn new(
        controller: Arc<dyn ControlPlane>,
        config: &ProbeConfig,
        repository: ResultsRepository,
    ) -> Self {
        Self {
            engine: ProbeEngine::new(controller, ProbeEngineConfig::from(config)),
            repository,
            group: config.group.clone(),
        }
    }

    pub fn subscribe(&self) -> watch::Receiver<ProbeProgress> {
        self.engine.subscribe()
    }

    /// Run to completion; only roster and file errors abort
    #[instrument(skip(self), fields(group = %self.group))]
    pub async fn run(&self) -> Result<ProbeReport> {
        let started = Instant::now();

        let outcomes = self.engine.run(&self.group).await?;
        let results = ClassifiedResults::classify(&outcomes).with_generated_at(Utc::now());

        self.repository.save(&results).await?;

        let elapsed = started.elapsed();
        info!(
            "Probe run finished in {:.1}s: {} usable, {} unusable",
            elapsed.as_secs_f64(),
            results.usable.len(),
            results.unusable.len()
        );

        Ok(ProbeReport { results, elapsed })
    }
}
