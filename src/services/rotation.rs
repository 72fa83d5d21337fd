//! Rotation run: a fixed number of sequential select/switch/verify cycles

use std::collections::HashSet;
use std::net::IpAddr;
use std::time::Duration;

use rand::Rng;
use tokio::sync::watch;
use tracing::{info, instrument, warn};

use crate::config::{IntervalMode, RotationConfig};
use crate::error::{Result, RotaError};
use crate::rotation::RotationPool;

/// Shortest wait between cycles in poisson mode
const MIN_POISSON_INTERVAL: Duration = Duration::from_secs(2);

/// Rotation service configuration
#[derive(Debug, Clone)]
pub struct RotationServiceConfig {
    pub cycles: u32,
    pub interval_mode: IntervalMode,
    pub interval: Duration,
}

impl Default for RotationServiceConfig {
    fn default() -> Self {
        Self {
            cycles: 3,
            interval_mode: IntervalMode::Fixed,
            interval: Duration::from_secs(3),
        }
    }
}

impl From<&RotationConfig> for RotationServiceConfig {
    fn from(config: &RotationConfig) -> Self {
        Self {
            cycles: config.cycles,
            interval_mode: config.interval_mode,
            interval: config.interval,
        }
    }
}

/// How a single cycle ended
#[derive(Debug, Clone, PartialEq)]
pub enum CycleOutcome {
    Switched { identity: Option<IpAddr> },
    SwitchFailed { reason: String },
}

/// One line of the rotation report
#[derive(Debug, Clone, PartialEq)]
pub struct CycleReport {
    /// 1-based
    pub index: u32,
    pub node: String,
    pub latency_ms: Option<f64>,
    pub outcome: CycleOutcome,
}

/// How distinct the observed egress identities were
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IdentityVerdict {
    /// Every cycle switched and reported a different IP
    AllDistinct,
    /// More than one IP, but some repeated or some cycles unverified
    PartiallyShared,
    /// Only one IP seen across several observations
    AllIdentical,
    /// Nothing to judge
    Inconclusive,
}

/// Aggregate of a rotation run
#[derive(Debug, Clone, Default)]
pub struct RotationSummary {
    pub cycles: Vec<CycleReport>,
    pub requested: u32,
    /// Stopped early by shutdown
    pub interrupted: bool,
}

impl RotationSummary {
    pub fn succeeded(&self) -> usize {
        self.cycles
            .iter()
            .filter(|c| matches!(c.outcome, CycleOutcome::Switched { .. }))
            .count()
    }

    pub fn failed(&self) -> usize {
        self.cycles.len() - self.succeeded()
    }

    /// Identities observed, in cycle order
    pub fn identities(&self) -> Vec<IpAddr> {
        self.cycles
            .iter()
            .filter_map(|c| match c.outcome {
                CycleOutcome::Switched { identity } => identity,
                CycleOutcome::SwitchFailed { .. } => None,
            })
            .collect()
    }

    pub fn distinct_identities(&self) -> usize {
        self.identities().into_iter().collect::<HashSet<_>>().len()
    }

    pub fn verdict(&self) -> IdentityVerdict {
        let observed = self.identities().len();
        let distinct = self.distinct_identities();

        if observed == 0 {
            IdentityVerdict::Inconclusive
        } else if distinct == observed && observed == self.requested as usize {
            IdentityVerdict::AllDistinct
        } else if distinct > 1 {
            IdentityVerdict::PartiallyShared
        } else if observed > 1 {
            IdentityVerdict::AllIdentical
        } else {
            IdentityVerdict::Inconclusive
        }
    }
}

/// Drives a `RotationPool` for a configured number of cycles
pub struct RotationService {
    pool: RotationPool,
    config: RotationServiceConfig,
}

impl RotationService {
    pub fn new(pool: RotationPool, config: RotationServiceConfig) -> Self {
        Self { pool, config }
    }

    /// Run all cycles back to back; shutdown is honoured between cycles only
    ///
    /// Fatal errors such as `PoolExhausted` abort the run. A failed switch is
    /// recorded and the next cycle picks again.
    #[instrument(skip(self, shutdown))]
    pub async fn run(&mut self, mut shutdown: watch::Receiver<bool>) -> Result<RotationSummary> {
        info!(
            "Starting rotation: {} cycles over {} usable nodes ({} interval, mean {}s)",
            self.config.cycles,
            self.pool.len(),
            self.config.interval_mode.as_str(),
            self.config.interval.as_secs()
        );

        let mut summary = RotationSummary {
            requested: self.config.cycles,
            ..Default::default()
        };

        for index in 1..=self.config.cycles {
            if *shutdown.borrow() {
                summary.interrupted = true;
                break;
            }

            let report = match self.pool.rotate().await {
                Ok(rotation) => CycleReport {
                    index,
                    node: rotation.node,
                    latency_ms: rotation.latency_ms,
                    outcome: CycleOutcome::Switched {
                        identity: rotation.identity,
                    },
                },
                Err(RotaError::SwitchFailed { node, reason }) => CycleReport {
                    index,
                    node,
                    latency_ms: None,
                    outcome: CycleOutcome::SwitchFailed { reason },
                },
                Err(e) if e.is_fatal() => return Err(e),
                Err(e) => CycleReport {
                    index,
                    node: self.pool.active_node().unwrap_or("-").to_string(),
                    latency_ms: None,
                    outcome: CycleOutcome::SwitchFailed {
                        reason: e.to_string(),
                    },
                },
            };

            match &report.outcome {
                CycleOutcome::Switched { identity: Some(ip) } => {
                    info!("Cycle {}: {} -> {}", index, report.node, ip)
                }
                CycleOutcome::Switched { identity: None } => {
                    info!("Cycle {}: {} -> identity unknown", index, report.node)
                }
                CycleOutcome::SwitchFailed { reason } => {
                    warn!("Cycle {}: switch to {} failed: {}", index, report.node, reason)
                }
            }
            summary.cycles.push(report);

            if index < self.config.cycles {
                let wait = next_interval(
                    self.config.interval_mode,
                    self.config.interval,
                    &mut rand::thread_rng(),
                );
                if wait_or_shutdown(wait, &mut shutdown).await {
                    info!("Rotation interrupted after {} cycles", index);
                    summary.interrupted = true;
                    break;
                }
            }
        }

        info!(
            "Rotation finished: {} succeeded, {} failed, {} distinct identities",
            summary.succeeded(),
            summary.failed(),
            summary.distinct_identities()
        );

        Ok(summary)
    }
}

/// Sleep for `wait`; true if shutdown was signalled first
async fn wait_or_shutdown(wait: Duration, shutdown: &mut watch::Receiver<bool>) -> bool {
    let sleep = tokio::time::sleep(wait);
    tokio::pin!(sleep);

    loop {
        tokio::select! {
            _ = &mut sleep => return false,
            changed = shutdown.changed() => {
                if changed.is_err() {
                    // Sender gone; nobody can ask us to stop any more.
                    (&mut sleep).await;
                    return false;
                }
                if *shutdown.borrow() {
                    return true;
                }
            }
        }
    }
}

/// Wait before the next cycle
///
/// Poisson mode draws from an exponential distribution with the given mean,
/// floored at two seconds.
pub fn next_interval<R: Rng>(mode: IntervalMode, mean: Duration, rng: &mut R) -> Duration {
    match mode {
        IntervalMode::Fixed => mean,
        IntervalMode::Poisson => {
            let u: f64 = rng.gen();
            let sample = mean.as_secs_f64() * (1.0 - u).ln().abs();
            Duration::try_from_secs_f64(sample)
                .unwrap_or(Duration::MAX)
                .max(MIN_POISSON_INTERVAL)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::controller::testing::FakeControlPlane;
    use crate::models::{ClassifiedResults, UsableNode};
    use crate::rotation::RotationPoolConfig;
    use rand::rngs::StdRng;
    use rand::SeedableRng;
    use std::sync::Arc;

    fn results_with(names: &[&str]) -> ClassifiedResults {
        ClassifiedResults {
            generated_at: None,
            usable: names
                .iter()
                .map(|n| UsableNode {
                    name: n.to_string(),
                    latency_ms: 50.0,
                })
                .collect(),
            unusable: Vec::new(),
        }
    }

    fn service(fake: Arc<FakeControlPlane>, names: &[&str], cycles: u32) -> RotationService {
        let pool = RotationPool::new(
            fake,
            &results_with(names),
            RotationPoolConfig {
                switch_group: "GLOBAL".to_string(),
                settle_delay: Duration::from_millis(300),
            },
        );
        RotationService::new(
            pool,
            RotationServiceConfig {
                cycles,
                interval_mode: IntervalMode::Fixed,
                interval: Duration::from_secs(3),
            },
        )
    }

    #[tokio::test(start_paused = true)]
    async fn test_run_records_every_cycle() {
        let fake = Arc::new(
            FakeControlPlane::new()
                .with_identity("a", "198.51.100.1")
                .with_switch_status("b", 400),
        );
        let (_tx, rx) = watch::channel(false);

        let summary = service(fake.clone(), &["a", "b"], 6).run(rx).await.unwrap();

        assert_eq!(summary.cycles.len(), 6);
        assert!(!summary.interrupted);
        assert_eq!(summary.succeeded() + summary.failed(), 6);
        for cycle in &summary.cycles {
            match (&cycle.node[..], &cycle.outcome) {
                ("a", CycleOutcome::Switched { identity }) => {
                    assert_eq!(*identity, Some("198.51.100.1".parse().unwrap()))
                }
                ("b", CycleOutcome::SwitchFailed { reason }) => assert_eq!(reason, "HTTP 400"),
                other => panic!("unexpected cycle: {:?}", other),
            }
        }
        assert_eq!(fake.switch_count(), 6);
    }

    #[tokio::test(start_paused = true)]
    async fn test_run_empty_pool_is_fatal() {
        let fake = Arc::new(FakeControlPlane::new());
        let (_tx, rx) = watch::channel(false);

        let err = service(fake.clone(), &[], 3).run(rx).await.unwrap_err();
        assert!(matches!(err, RotaError::PoolExhausted));
        assert_eq!(fake.switch_count(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_run_stops_between_cycles_on_shutdown() {
        let fake = Arc::new(FakeControlPlane::new());
        let (tx, rx) = watch::channel(false);

        let mut svc = service(fake.clone(), &["a"], 10);
        let run = tokio::spawn(async move { svc.run(rx).await });

        // First cycle completes at ~300ms, then the 3s interval starts.
        tokio::time::sleep(Duration::from_secs(1)).await;
        tx.send(true).unwrap();

        let summary = run.await.unwrap().unwrap();
        assert!(summary.interrupted);
        assert_eq!(summary.cycles.len(), 1);
        assert_eq!(fake.switch_count(), 1);
    }

    #[test]
    fn test_summary_verdicts() {
        let switched = |node: &str, ip: Option<&str>| CycleReport {
            index: 0,
            node: node.to_string(),
            latency_ms: Some(1.0),
            outcome: CycleOutcome::Switched {
                identity: ip.map(|i| i.parse().unwrap()),
            },
        };

        let all_distinct = RotationSummary {
            cycles: vec![switched("a", Some("1.1.1.1")), switched("b", Some("2.2.2.2"))],
            requested: 2,
            interrupted: false,
        };
        assert_eq!(all_distinct.verdict(), IdentityVerdict::AllDistinct);

        let shared = RotationSummary {
            cycles: vec![
                switched("a", Some("1.1.1.1")),
                switched("b", Some("2.2.2.2")),
                switched("c", Some("2.2.2.2")),
            ],
            requested: 3,
            interrupted: false,
        };
        assert_eq!(shared.verdict(), IdentityVerdict::PartiallyShared);
        assert_eq!(shared.distinct_identities(), 2);

        let identical = RotationSummary {
            cycles: vec![switched("a", Some("1.1.1.1")), switched("b", Some("1.1.1.1"))],
            requested: 2,
            interrupted: false,
        };
        assert_eq!(identical.verdict(), IdentityVerdict::AllIdentical);

        let unknown = RotationSummary {
            cycles: vec![switched("a", None)],
            requested: 1,
            interrupted: false,
        };
        assert_eq!(unknown.verdict(), IdentityVerdict::Inconclusive);
        assert_eq!(unknown.succeeded(), 1);
        assert!(unknown.identities().is_empty());
    }

    #[test]
    fn test_next_interval() {
        let mut rng = StdRng::seed_from_u64(7);
        let mean = Duration::from_secs(10);

        assert_eq!(next_interval(IntervalMode::Fixed, mean, &mut rng), mean);

        let samples: Vec<Duration> = (0..2000)
            .map(|_| next_interval(IntervalMode::Poisson, mean, &mut rng))
            .collect();
        assert!(samples.iter().all(|d| *d >= MIN_POISSON_INTERVAL));

        let avg = samples.iter().map(Duration::as_secs_f64).sum::<f64>() / samples.len() as f64;
        assert!(avg > 8.0 && avg < 13.0, "average {}", avg);
    }

    #[test]
    fn test_next_interval_huge_mean_saturates() {
        let mut rng = StdRng::seed_from_u64(11);
        for _ in 0..100 {
            let wait = next_interval(IntervalMode::Poisson, Duration::MAX, &mut rng);
            assert!(wait >= MIN_POISSON_INTERVAL);
        }
        assert_eq!(
            next_interval(IntervalMode::Fixed, Duration::MAX, &mut rng),
            Duration::MAX
        );
    }
}
