use std::fmt;

/// Why a single node probe did not produce a latency
///
/// This is data, not a propagated error: it ends up in the `failed` list.
#[derive(Debug, Clone, PartialEq)]
pub enum ProbeError {
    /// Controller answered with a non-success status
    Status { code: u16, message: Option<String> },
    /// No answer within the probe timeout
    Timeout { timeout_ms: u64 },
    /// Connect/TLS/IO failure talking to the controller
    Transport(String),
    /// Success status but the body had no usable `delay`
    BadPayload(String),
}

impl fmt::Display for ProbeError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ProbeError::Status {
                code,
                message: Some(message),
            } => write!(f, "HTTP {}: {}", code, message),
            ProbeError::Status {
                code,
                message: None,
            } => write!(f, "HTTP {}", code),
            ProbeError::Timeout { timeout_ms } => write!(f, "timeout after {}ms", timeout_ms),
            ProbeError::Transport(e) => write!(f, "transport error: {}", e),
            ProbeError::BadPayload(body) => write!(f, "bad payload: {}", body),
        }
    }
}

/// Terminal result of probing one node
#[derive(Debug, Clone, PartialEq)]
pub struct ProbeOutcome {
    pub node_name: String,
    pub result: Result<f64, ProbeError>,
}

impl ProbeOutcome {
    pub fn ok(node_name: impl Into<String>, latency_ms: f64) -> Self {
        Self {
            node_name: node_name.into(),
            result: Ok(latency_ms),
        }
    }

    pub fn failed(node_name: impl Into<String>, error: ProbeError) -> Self {
        Self {
            node_name: node_name.into(),
            result: Err(error),
        }
    }

    pub fn latency_ms(&self) -> Option<f64> {
        self.result.as_ref().ok().copied()
    }

    pub fn is_ok(&self) -> bool {
        self.result.is_ok()
    }
}

/// Running progress of a probing run
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct ProbeProgress {
    pub completed: usize,
    pub total: usize,
    pub ok: usize,
    pub failed: usize,
}

impl ProbeProgress {
    pub fn new(total: usize) -> Self {
        Self {
            total,
            ..Default::default()
        }
    }

    pub fn is_done(&self) -> bool {
        self.completed >= self.total
    }

    pub fn percent(&self) -> f64 {
        if self.total == 0 {
            100.0
        } else {
            self.completed as f64 * 100.0 / self.total as f64
        }
    }
}
