use thiserror::Error;

/// Unified error type for probing and rotation runs
#[derive(Error, Debug)]
pub enum RotaError {
    // Control plane errors
    #[error("Control plane unreachable: {0}")]
    ControlPlaneUnreachable(String),

    #[error("Control plane returned {status}: {message}")]
    ControlPlaneError { status: u16, message: String },

    // Rotation errors
    #[error("Switch to '{node}' failed: {reason}")]
    SwitchFailed { node: String, reason: String },

    #[error("No usable nodes in pool")]
    PoolExhausted,

    // Results artifact errors
    #[error("Invalid results file: {0}")]
    InvalidResults(String),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    // Configuration errors
    #[error("Invalid configuration: {0}")]
    InvalidConfig(String),

    // I/O errors
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Operation timed out")]
    Timeout,

    // Internal errors
    #[error("Internal error: {0}")]
    Internal(String),
}

/// Result type alias for Rota operations
pub type Result<T> = std::result::Result<T, RotaError>;

impl RotaError {
    /// Whether this error aborts the whole run rather than a single cycle
    pub fn is_fatal(&self) -> bool {
        !matches!(self, RotaError::SwitchFailed { .. } | RotaError::Timeout)
    }

    /// Process exit code reported by the binary
    pub fn exit_code(&self) -> i32 {
        match self {
            RotaError::ControlPlaneUnreachable(_) | RotaError::ControlPlaneError { .. } => 2,
            RotaError::PoolExhausted => 3,
            RotaError::InvalidConfig(_) => 4,
            RotaError::InvalidResults(_) | RotaError::Json(_) | RotaError::Io(_) => 5,
            _ => 1,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_fatality() {
        assert!(RotaError::PoolExhausted.is_fatal());
        assert!(RotaError::ControlPlaneUnreachable("refused".to_string()).is_fatal());
        assert!(!RotaError::SwitchFailed {
            node: "a".to_string(),
            reason: "HTTP 400".to_string()
        }
        .is_fatal());
    }

    #[test]
    fn test_error_exit_codes() {
        assert_eq!(
            RotaError::ControlPlaneError {
                status: 401,
                message: "Unauthorized".to_string()
            }
            .exit_code(),
            2
        );
        assert_eq!(RotaError::PoolExhausted.exit_code(), 3);
        assert_eq!(
            RotaError::InvalidConfig("bad".to_string()).exit_code(),
            4
        );
        assert_eq!(RotaError::Internal("x".to_string()).exit_code(), 1);
    }

    #[test]
    fn test_error_display() {
        let err = RotaError::SwitchFailed {
            node: "hk-01".to_string(),
            reason: "HTTP 400".to_string(),
        };
        assert_eq!(err.to_string(), "Switch to 'hk-01' failed: HTTP 400");
    }
}
