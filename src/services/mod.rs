//! Top-level runs: probing, rotation and the controller doctor

pub mod doctor;
pub mod probe;
pub mod rotation;

pub use doctor::{ControllerDoctor, DoctorReport};
pub use probe::{ProbeReport, ProbeService};
pub use rotation::{
    next_interval, CycleOutcome, CycleReport, IdentityVerdict, RotationService,
    RotationServiceConfig, RotationSummary,
};

use tokio::sync::watch;

/// Stops a rotation run between cycles
pub struct ShutdownHandle {
    shutdown_tx: watch::Sender<bool>,
}

impl ShutdownHandle {
    pub fn new() -> (Self, watch::Receiver<bool>) {
        let (tx, rx) = watch::channel(false);
        (Self { shutdown_tx: tx }, rx)
    }

    pub fn shutdown(&self) {
        let _ = self.shutdown_tx.send(true);
    }
}

impl Default for ShutdownHandle {
    fn default() -> Self {
        Self::new().0
    }
}
