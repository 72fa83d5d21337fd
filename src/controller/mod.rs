//! Control plane access
//!
//! The controller owns node membership, liveness measurement and the active route.
//! Everything here is network I/O; no local state is mutated.

mod client;
mod identity;
#[cfg(test)]
pub(crate) mod testing;

pub use client::{parse_delay, ControllerClient};
pub use identity::{parse_identity, IdentityProbe};

use async_trait::async_trait;
use std::net::IpAddr;
use std::time::Duration;

use crate::error::Result;
use crate::models::ProbeError;

/// Operations the probe engine and rotation pool need from the controller
#[async_trait]
pub trait ControlPlane: Send + Sync {
    /// Member names of `group`, in controller order
    ///
    /// Fails with `ControlPlaneUnreachable` or `ControlPlaneError`.
    async fn list_group_members(&self, group: &str) -> Result<Vec<String>>;

    /// Ask the controller to measure `node` against `target_url`
    ///
    /// Never fails the caller: every fault comes back as a `ProbeError`.
    async fn probe_delay(
        &self,
        node: &str,
        target_url: &str,
        timeout: Duration,
    ) -> std::result::Result<f64, ProbeError>;

    /// Make `node` the active member of `group`
    ///
    /// Only an explicit accepted status counts as success; anything else is
    /// `SwitchFailed`. The new route applies eventually, not on return.
    async fn switch_active(&self, group: &str, node: &str) -> Result<()>;

    /// Public IP observed through the active route, `None` when unknown
    async fn current_egress_identity(&self) -> Option<IpAddr>;
}
