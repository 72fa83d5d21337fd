//! In-memory control plane for engine and pool tests

use std::collections::HashMap;
use std::net::IpAddr;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use parking_lot::Mutex;

use super::ControlPlane;
use crate::error::{Result, RotaError};
use crate::models::ProbeError;

#[derive(Debug, Clone)]
pub enum FakeDelay {
    Ok(f64),
    Timeout,
    BadPayload,
    Status(u16),
    Panic,
}

pub struct FakeControlPlane {
    /// `None` makes roster fetches fail as unreachable
    roster: Option<Vec<String>>,
    delays: HashMap<String, FakeDelay>,
    probe_latency: Duration,
    switch_statuses: HashMap<String, u16>,
    identities: HashMap<String, IpAddr>,
    active: Mutex<Option<String>>,

    pub list_calls: AtomicUsize,
    pub probe_calls: AtomicUsize,
    pub identity_calls: AtomicUsize,
    pub in_flight: AtomicUsize,
    pub max_in_flight: AtomicUsize,
    /// Ordered log of mutating/observing calls, e.g. `switch:GLOBAL:a`, `identity`
    pub events: Mutex<Vec<String>>,
}

impl FakeControlPlane {
    pub fn new() -> Self {
        Self {
            roster: None,
            delays: HashMap::new(),
            probe_latency: Duration::ZERO,
            switch_statuses: HashMap::new(),
            identities: HashMap::new(),
            active: Mutex::new(None),
            list_calls: AtomicUsize::new(0),
            probe_calls: AtomicUsize::new(0),
            identity_calls: AtomicUsize::new(0),
            in_flight: AtomicUsize::new(0),
            max_in_flight: AtomicUsize::new(0),
            events: Mutex::new(Vec::new()),
        }
    }

    pub fn with_roster(self, names: &[&str]) -> Self {
        self.with_roster_owned(names.iter().map(|n| n.to_string()).collect())
    }

    pub fn with_roster_owned(mut self, names: Vec<String>) -> Self {
        self.roster = Some(names);
        self
    }

    pub fn with_delay(mut self, name: &str, delay: FakeDelay) -> Self {
        self.delays.insert(name.to_string(), delay);
        self
    }

    pub fn with_probe_latency(mut self, latency: Duration) -> Self {
        self.probe_latency = latency;
        self
    }

    /// HTTP status the switch endpoint answers for `node` (default 204)
    pub fn with_switch_status(mut self, node: &str, status: u16) -> Self {
        self.switch_statuses.insert(node.to_string(), status);
        self
    }

    /// Egress IP reported while `node` is active
    pub fn with_identity(mut self, node: &str, ip: &str) -> Self {
        self.identities
            .insert(node.to_string(), ip.parse().expect("valid test IP"));
        self
    }

    pub fn events(&self) -> Vec<String> {
        self.events.lock().clone()
    }

    pub fn switch_count(&self) -> usize {
        self.events
            .lock()
            .iter()
            .filter(|e| e.starts_with("switch:"))
            .count()
    }
}

#[async_trait]
impl ControlPlane for FakeControlPlane {
    async fn list_group_members(&self, _group: &str) -> Result<Vec<String>> {
        self.list_calls.fetch_add(1, Ordering::SeqCst);
        self.roster
            .clone()
            .ok_or_else(|| RotaError::ControlPlaneUnreachable("connection refused".into()))
    }

    async fn probe_delay(
        &self,
        node: &str,
        _target_url: &str,
        timeout: Duration,
    ) -> std::result::Result<f64, ProbeError> {
        self.probe_calls.fetch_add(1, Ordering::SeqCst);
        let now = self.in_flight.fetch_add(1, Ordering::SeqCst) + 1;
        self.max_in_flight.fetch_max(now, Ordering::SeqCst);

        if !self.probe_latency.is_zero() {
            tokio::time::sleep(self.probe_latency).await;
        }

        let delay = self
            .delays
            .get(node)
            .cloned()
            .unwrap_or(FakeDelay::Ok(50.0));

        self.in_flight.fetch_sub(1, Ordering::SeqCst);

        match delay {
            FakeDelay::Ok(ms) => Ok(ms),
            FakeDelay::Timeout => Err(ProbeError::Timeout {
                timeout_ms: timeout.as_millis() as u64,
            }),
            FakeDelay::BadPayload => Err(ProbeError::BadPayload("{\"message\":\"\"}".into())),
            FakeDelay::Status(code) => Err(ProbeError::Status {
                code,
                message: None,
            }),
            FakeDelay::Panic => panic!("probe for {} exploded", node),
        }
    }

    async fn switch_active(&self, group: &str, node: &str) -> Result<()> {
        self.events.lock().push(format!("switch:{}:{}", group, node));

        let status = self.switch_statuses.get(node).copied().unwrap_or(204);
        if status != 204 {
            return Err(RotaError::SwitchFailed {
                node: node.to_string(),
                reason: format!("HTTP {}", status),
            });
        }

        *self.active.lock() = Some(node.to_string());
        Ok(())
    }

    async fn current_egress_identity(&self) -> Option<IpAddr> {
        self.identity_calls.fetch_add(1, Ordering::SeqCst);
        self.events.lock().push("identity".to_string());

        let active = self.active.lock().clone()?;
        self.identities.get(&active).copied()
    }
}
