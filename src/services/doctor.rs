//! Controller readiness check run before rotating

use tracing::{info, instrument, warn};

use crate::config::RotationConfig;
use crate::controller::ControllerClient;
use crate::error::Result;
use crate::models::{ProxyMode, RuntimeConfigs};

/// What the doctor found
#[derive(Debug, Clone)]
pub struct DoctorReport {
    /// Mode reported before any change
    pub initial_mode: String,
    /// True when the mode had to be patched to global
    pub mode_changed: bool,
    pub configs: RuntimeConfigs,
    pub switch_group: String,
    pub group_members: usize,
    /// Active member of the switch group
    pub active_node: Option<String>,
    /// Mixed proxy port from our configuration
    pub expected_port: u16,
    pub port_matches: bool,
}

/// Checks that the controller can serve a rotation run
pub struct ControllerDoctor {
    client: ControllerClient,
    switch_group: String,
    expected_port: u16,
}

impl ControllerDoctor {
    pub fn new(client: ControllerClient, config: &RotationConfig) -> Self {
        Self {
            client,
            switch_group: config.switch_group.clone(),
            expected_port: config.mixed_proxy.port,
        }
    }

    /// Every controller error is returned as-is
    #[instrument(skip(self), fields(group = %self.switch_group))]
    pub async fn run(&self) -> Result<DoctorReport> {
        let configs = self.client.configs().await?;
        info!(
            "Controller reachable: mode={}, port={:?}, socks-port={:?}, mixed-port={:?}",
            configs.mode, configs.port, configs.socks_port, configs.mixed_port
        );

        let initial_mode = configs.mode.clone();
        let mode_changed = configs.mode_enum() != Some(ProxyMode::Global);
        if mode_changed {
            info!("Switching controller mode from {:?} to global", initial_mode);
            self.client.set_mode(ProxyMode::Global).await?;
        }

        let group = self.client.group_info(&self.switch_group).await?;
        info!(
            "Group {} has {} members, active: {}",
            self.switch_group,
            group.all.len(),
            group.now.as_deref().unwrap_or("-")
        );

        let port_matches = [configs.mixed_port, configs.port]
            .into_iter()
            .flatten()
            .any(|p| p == self.expected_port);
        if !port_matches {
            warn!(
                "Configured mixed proxy port {} is not a controller listener",
                self.expected_port
            );
        }

        Ok(DoctorReport {
            initial_mode,
            mode_changed,
            configs,
            switch_group: self.switch_group.clone(),
            group_members: group.all.len(),
            active_node: group.now,
            expected_port: self.expected_port,
            port_matches,
        })
    }
}
