//! Node rotation
//!
//! Selection is random on purpose: a rotation run holds no state between cycles
//! beyond the loaded usable set.

mod pool;
mod random;

pub use pool::{CycleState, Rotation, RotationPool, RotationPoolConfig};
pub use random::RandomSelector;

use std::sync::Arc;

use crate::error::Result;
use crate::models::UsableNode;

/// Chooses the next node to activate
pub trait NodeSelector: Send + Sync {
    /// Pick a node; `PoolExhausted` when there is nothing to pick
    fn select(&self) -> Result<Arc<UsableNode>>;

    /// Replace the candidate set
    fn refresh(&self, nodes: Vec<UsableNode>);

    /// Number of candidates
    fn available_count(&self) -> usize;
}
