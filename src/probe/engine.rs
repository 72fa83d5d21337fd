//! Bounded fan-out liveness probing
//!
//! One probe per roster entry, at most `concurrency` in flight. The
//! `buffer_unordered` window is the only admission gate: a probe task is spawned
//! when its slot is first polled, so nothing starts ahead of the gate.

use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;

use futures::StreamExt;
use tokio::sync::watch;
use tracing::{debug, info, instrument, warn};

use crate::config::ProbeConfig;
use crate::controller::ControlPlane;
use crate::error::Result;
use crate::models::{ProbeError, ProbeOutcome, ProbeProgress};

/// Probe engine configuration
#[derive(Debug, Clone)]
pub struct ProbeEngineConfig {
    /// URL the controller measures each node against
    pub target_url: String,
    /// Per-probe timeout
    pub timeout: Duration,
    /// Maximum probes in flight
    pub concurrency: usize,
}

impl Default for ProbeEngineConfig {
    fn default() -> Self {
        Self {
            target_url: "https://www.google.com".to_string(),
            timeout: Duration::from_secs(8),
            concurrency: 20,
        }
    }
}

impl From<&ProbeConfig> for ProbeEngineConfig {
    fn from(config: &ProbeConfig) -> Self {
        Self {
            target_url: config.target_url.clone(),
            timeout: config.timeout,
            concurrency: config.concurrency,
        }
    }
}

/// Runs one liveness probe per node under a fixed concurrency cap
pub struct ProbeEngine {
    controller: Arc<dyn ControlPlane>,
    config: ProbeEngineConfig,
    progress: watch::Sender<ProbeProgress>,
}

impl ProbeEngine {
    pub fn new(controller: Arc<dyn ControlPlane>, config: ProbeEngineConfig) -> Self {
        let (progress, _) = watch::channel(ProbeProgress::default());
        Self {
            controller,
            config,
            progress,
        }
    }

    /// Watch completed/total as probes finish
    pub fn subscribe(&self) -> watch::Receiver<ProbeProgress> {
        self.progress.subscribe()
    }

    /// Fetch the roster of `group` and probe every member
    ///
    /// Only roster acquisition can fail; individual probe faults are outcomes.
    #[instrument(skip(self))]
    pub async fn run(&self, group: &str) -> Result<Vec<ProbeOutcome>> {
        let members = self.controller.list_group_members(group).await?;
        let roster = dedupe_roster(members);

        info!(
            "Probing {} nodes from group {} (concurrency: {}, timeout: {}ms)",
            roster.len(),
            group,
            self.config.concurrency,
            self.config.timeout.as_millis()
        );

        Ok(self.probe_all(roster).await)
    }

    /// Probe every name, returning exactly one outcome per name in completion order
    pub async fn probe_all(&self, roster: Vec<String>) -> Vec<ProbeOutcome> {
        let total = roster.len();
        let mut progress = ProbeProgress::new(total);
        self.progress.send_replace(progress);

        let mut outcomes = Vec::with_capacity(total);
        let mut completions = futures::stream::iter(roster)
            .map(|name| self.spawn_probe(name))
            .buffer_unordered(self.config.concurrency.max(1));

        while let Some(outcome) = completions.next().await {
            progress.completed += 1;
            match &outcome.result {
                Ok(latency) => {
                    progress.ok += 1;
                    debug!(
                        "[{}/{}] {} -> {:.0} ms",
                        progress.completed, total, outcome.node_name, latency
                    );
                }
                Err(e) => {
                    progress.failed += 1;
                    debug!(
                        "[{}/{}] {} -> {}",
                        progress.completed, total, outcome.node_name, e
                    );
                }
            }
            self.progress.send_replace(progress);
            outcomes.push(outcome);
        }

        info!(
            "Probe run complete: {} ok, {} failed, {} total",
            progress.ok, progress.failed, total
        );

        outcomes
    }

    /// One probe in its own task so a panic stays local to the node
    async fn spawn_probe(&self, name: String) -> ProbeOutcome {
        let controller = self.controller.clone();
        let target_url = self.config.target_url.clone();
        let timeout = self.config.timeout;
        let node = name.clone();

        let task = tokio::spawn(async move {
            let result = controller.probe_delay(&node, &target_url, timeout).await;
            ProbeOutcome {
                node_name: node,
                result,
            }
        });

        match task.await {
            Ok(outcome) => outcome,
            Err(e) => {
                warn!("Probe task for {} did not complete: {}", name, e);
                ProbeOutcome::failed(name, ProbeError::Transport(format!("probe task failed: {}", e)))
            }
        }
    }
}

/// Drop repeated names, keeping the first occurrence
fn dedupe_roster(members: Vec<String>) -> Vec<String> {
    let mut seen = HashSet::with_capacity(members.len());
    let mut roster = Vec::with_capacity(members.len());

    for name in members {
        if seen.insert(name.clone()) {
            roster.push(name);
        } else {
            warn!("Duplicate node name in roster: {}", name);
        }
    }

    roster
}
