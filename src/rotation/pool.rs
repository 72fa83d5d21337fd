//! Select, switch and verify cycles over a loaded usable set

use std::net::IpAddr;
use std::sync::Arc;
use std::time::Duration;

use tracing::{debug, info, instrument, warn};

use super::{NodeSelector, RandomSelector};
use crate::config::RotationConfig;
use crate::controller::ControlPlane;
use crate::error::{Result, RotaError};
use crate::models::ClassifiedResults;

/// Rotation pool configuration
#[derive(Debug, Clone)]
pub struct RotationPoolConfig {
    /// Group whose active member is switched
    pub switch_group: String,
    /// Pause after an accepted switch before the route is used
    pub settle_delay: Duration,
}

impl Default for RotationPoolConfig {
    fn default() -> Self {
        Self {
            switch_group: "GLOBAL".to_string(),
            settle_delay: Duration::from_millis(300),
        }
    }
}

impl From<&RotationConfig> for RotationPoolConfig {
    fn from(config: &RotationConfig) -> Self {
        Self {
            switch_group: config.switch_group.clone(),
            settle_delay: config.settle_delay,
        }
    }
}

/// Where a cycle currently is
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum CycleState {
    #[default]
    Idle,
    Selecting,
    Switching,
    Settling,
    Verifying,
}

/// A completed cycle: the switch was accepted
#[derive(Debug, Clone, PartialEq)]
pub struct Rotation {
    pub node: String,
    /// `None` when the results file had no latency for the node
    pub latency_ms: Option<f64>,
    /// `None` means the identity is unknown, not that the switch failed
    pub identity: Option<IpAddr>,
}

/// In-memory view of one results snapshot that drives node switches
///
/// Cycles take `&mut self`, so one pool can never overlap two switches against
/// the controller's single active-node value.
pub struct RotationPool {
    controller: Arc<dyn ControlPlane>,
    selector: Box<dyn NodeSelector>,
    config: RotationPoolConfig,
    active_node: Option<String>,
    state: CycleState,
}

impl RotationPool {
    /// Build a random-selection pool from the usable part of `results`
    pub fn new(
        controller: Arc<dyn ControlPlane>,
        results: &ClassifiedResults,
        config: RotationPoolConfig,
    ) -> Self {
        let selector = RandomSelector::with_nodes(results.usable.clone());
        Self::with_selector(controller, Box::new(selector), config)
    }

    pub fn with_selector(
        controller: Arc<dyn ControlPlane>,
        selector: Box<dyn NodeSelector>,
        config: RotationPoolConfig,
    ) -> Self {
        Self {
            controller,
            selector,
            config,
            active_node: None,
            state: CycleState::Idle,
        }
    }

    pub fn len(&self) -> usize {
        self.selector.available_count()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Last node a switch was attempted for, confirmed or not
    pub fn active_node(&self) -> Option<&str> {
        self.active_node.as_deref()
    }

    pub fn state(&self) -> CycleState {
        self.state
    }

    /// Run one cycle: select, switch, settle, verify
    ///
    /// Fails with `PoolExhausted` (no switch attempted) or `SwitchFailed`
    /// (no identity lookup attempted). Picking another node is up to the caller.
    #[instrument(skip(self), fields(group = %self.config.switch_group))]
    pub async fn rotate(&mut self) -> Result<Rotation> {
        self.state = CycleState::Selecting;
        let node = match self.selector.select() {
            Ok(node) => node,
            Err(e) => {
                self.state = CycleState::Idle;
                return Err(e);
            }
        };
        match node.known_latency() {
            Some(ms) => debug!("Selected {} ({:.0} ms)", node.name, ms),
            None => debug!("Selected {} (latency unknown)", node.name),
        }

        self.state = CycleState::Switching;
        self.active_node = Some(node.name.clone());
        if let Err(e) = self
            .controller
            .switch_active(&self.config.switch_group, &node.name)
            .await
        {
            self.state = CycleState::Idle;
            let err = match e {
                RotaError::SwitchFailed { .. } => e,
                other => RotaError::SwitchFailed {
                    node: node.name.clone(),
                    reason: other.to_string(),
                },
            };
            warn!("{}", err);
            return Err(err);
        }

        // The controller acknowledges before the new route is in effect.
        self.state = CycleState::Settling;
        if !self.config.settle_delay.is_zero() {
            tokio::time::sleep(self.config.settle_delay).await;
        }

        self.state = CycleState::Verifying;
        let identity = self.controller.current_egress_identity().await;
        self.state = CycleState::Idle;

        match identity {
            Some(ip) => info!("Switched to {} (egress {})", node.name, ip),
            None => info!("Switched to {} (egress identity unknown)", node.name),
        }

        Ok(Rotation {
            node: node.name.clone(),
            latency_ms: node.known_latency(),
            identity,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::controller::testing::FakeControlPlane;
    use crate::models::UsableNode;
    use parking_lot::Mutex;
    use std::collections::VecDeque;
    use std::sync::atomic::Ordering;

    /// Hands out nodes in a fixed order
    struct ScriptedSelector {
        queue: Mutex<VecDeque<UsableNode>>,
    }

    impl ScriptedSelector {
        fn new(names: &[&str]) -> Self {
            Self {
                queue: Mutex::new(
                    names
                        .iter()
                        .map(|n| UsableNode {
                            name: n.to_string(),
                            latency_ms: 100.0,
                        })
                        .collect(),
                ),
            }
        }
    }

    impl NodeSelector for ScriptedSelector {
        fn select(&self) -> Result<Arc<UsableNode>> {
            self.queue
                .lock()
                .pop_front()
                .map(Arc::new)
                .ok_or(RotaError::PoolExhausted)
        }

        fn refresh(&self, nodes: Vec<UsableNode>) {
            *self.queue.lock() = nodes.into();
        }

        fn available_count(&self) -> usize {
            self.queue.lock().len()
        }
    }

    fn config() -> RotationPoolConfig {
        RotationPoolConfig {
            switch_group: "GLOBAL".to_string(),
            settle_delay: Duration::from_millis(5),
        }
    }

    fn results_with(names: &[&str]) -> ClassifiedResults {
        ClassifiedResults {
            generated_at: None,
            usable: names
                .iter()
                .map(|n| UsableNode {
                    name: n.to_string(),
                    latency_ms: 80.0,
                })
                .collect(),
            unusable: Vec::new(),
        }
    }

    #[tokio::test]
    async fn test_empty_pool_is_exhausted_without_switching() {
        let fake = Arc::new(FakeControlPlane::new());
        let mut pool = RotationPool::new(fake.clone(), &ClassifiedResults::default(), config());

        assert!(pool.is_empty());
        for _ in 0..3 {
            assert!(matches!(pool.rotate().await, Err(RotaError::PoolExhausted)));
        }
        assert_eq!(fake.switch_count(), 0);
        assert_eq!(fake.identity_calls.load(Ordering::SeqCst), 0);
        assert_eq!(pool.state(), CycleState::Idle);
        assert!(pool.active_node().is_none());
    }

    #[tokio::test]
    async fn test_switch_then_verify_then_switch_failure() {
        let fake = Arc::new(
            FakeControlPlane::new()
                .with_identity("a", "203.0.113.10")
                .with_switch_status("b", 400),
        );
        let mut pool = RotationPool::with_selector(
            fake.clone(),
            Box::new(ScriptedSelector::new(&["a", "b"])),
            config(),
        );

        let first = pool.rotate().await.unwrap();
        assert_eq!(first.node, "a");
        assert_eq!(first.identity, Some("203.0.113.10".parse().unwrap()));
        assert_eq!(pool.active_node(), Some("a"));

        let err = pool.rotate().await.unwrap_err();
        match err {
            RotaError::SwitchFailed { node, reason } => {
                assert_eq!(node, "b");
                assert_eq!(reason, "HTTP 400");
            }
            other => panic!("unexpected error: {:?}", other),
        }
        // Attempted, not confirmed.
        assert_eq!(pool.active_node(), Some("b"));

        assert_eq!(
            fake.events(),
            vec!["switch:GLOBAL:a", "identity", "switch:GLOBAL:b"]
        );
        assert_eq!(fake.identity_calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_unknown_identity_is_not_a_failure() {
        let fake = Arc::new(FakeControlPlane::new());
        let mut pool = RotationPool::new(fake.clone(), &results_with(&["solo"]), config());

        let rotation = pool.rotate().await.unwrap();
        assert_eq!(rotation.node, "solo");
        assert_eq!(rotation.latency_ms, Some(80.0));
        assert!(rotation.identity.is_none());
        assert_eq!(pool.state(), CycleState::Idle);
    }

    #[tokio::test]
    async fn test_node_without_recorded_latency_still_rotates() {
        let fake = Arc::new(FakeControlPlane::new().with_identity("old", "192.0.2.44"));
        let results = ClassifiedResults {
            generated_at: None,
            usable: vec![UsableNode {
                name: "old".to_string(),
                latency_ms: crate::models::UNKNOWN_LATENCY_MS,
            }],
            unusable: Vec::new(),
        };
        let mut pool = RotationPool::new(fake, &results, config());

        let rotation = pool.rotate().await.unwrap();
        assert_eq!(rotation.node, "old");
        assert_eq!(rotation.latency_ms, None);
        assert_eq!(rotation.identity, Some("192.0.2.44".parse().unwrap()));
    }

    #[tokio::test]
    async fn test_random_pool_only_picks_usable_nodes() {
        let fake = Arc::new(FakeControlPlane::new());
        let mut pool = RotationPool::new(
            fake.clone(),
            &results_with(&["a", "b", "c"]),
            RotationPoolConfig {
                settle_delay: Duration::ZERO,
                ..config()
            },
        );
        assert_eq!(pool.len(), 3);

        for _ in 0..20 {
            let rotation = pool.rotate().await.unwrap();
            assert!(["a", "b", "c"].contains(&rotation.node.as_str()));
        }
        assert_eq!(fake.switch_count(), 20);
    }

    #[tokio::test(start_paused = true)]
    async fn test_settle_delay_precedes_verification() {
        let fake = Arc::new(FakeControlPlane::new());
        let mut pool = RotationPool::new(
            fake,
            &results_with(&["a"]),
            RotationPoolConfig {
                switch_group: "GLOBAL".to_string(),
                settle_delay: Duration::from_secs(2),
            },
        );

        let started = tokio::time::Instant::now();
        pool.rotate().await.unwrap();
        assert!(started.elapsed() >= Duration::from_secs(2));
    }
}
