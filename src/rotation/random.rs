//! Random node selection

use parking_lot::RwLock;
use rand::seq::SliceRandom;
use std::sync::Arc;

use super::NodeSelector;
use crate::error::{Result, RotaError};
use crate::models::UsableNode;

/// Picks uniformly at random from the usable set; keeps no rotation state
pub struct RandomSelector {
    nodes: RwLock<Vec<Arc<UsableNode>>>,
}

impl RandomSelector {
    pub fn new() -> Self {
        Self {
            nodes: RwLock::new(Vec::new()),
        }
    }

    pub fn with_nodes(nodes: Vec<UsableNode>) -> Self {
        let selector = Self::new();
        selector.refresh(nodes);
        selector
    }
}

impl Default for RandomSelector {
    fn default() -> Self {
        Self::new()
    }
}

impl NodeSelector for RandomSelector {
    fn select(&self) -> Result<Arc<UsableNode>> {
        let nodes = self.nodes.read();

        let mut rng = rand::thread_rng();
        nodes
            .choose(&mut rng)
            .cloned()
            .ok_or(RotaError::PoolExhausted)
    }

    fn refresh(&self, nodes: Vec<UsableNode>) {
        *self.nodes.write() = nodes.into_iter().map(Arc::new).collect();
    }

    fn available_count(&self) -> usize {
        self.nodes.read().len()
    }
}
