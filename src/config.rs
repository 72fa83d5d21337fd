use crate::error::{Result, RotaError};
use std::env;
use std::path::PathBuf;
use std::str::FromStr;
use std::time::Duration;
use url::Url;

/// Longest accepted mean wait between rotation cycles (one day)
const MAX_INTERVAL_SECS: u64 = 86_400;

/// Application configuration loaded from environment variables
#[derive(Debug, Clone)]
pub struct Config {
    /// Control plane connection
    pub controller: ControllerConfig,
    /// Probing run configuration
    pub probe: ProbeConfig,
    /// Rotation run configuration
    pub rotation: RotationConfig,
    /// Logging configuration
    pub log: LogConfig,
}

#[derive(Debug, Clone)]
pub struct ControllerConfig {
    /// Base URL of the controller API (default: http://127.0.0.1:9090)
    pub url: Url,
    /// Shared secret sent as a bearer token (empty = no auth header)
    pub secret: String,
    /// Timeout for non-probe controller requests
    pub request_timeout: Duration,
}

#[derive(Debug, Clone)]
pub struct ProbeConfig {
    /// Group whose members are probed
    pub group: String,
    /// URL the controller measures each node against
    pub target_url: String,
    /// Per-probe timeout
    pub timeout: Duration,
    /// Maximum probes in flight
    pub concurrency: usize,
    /// Where the classified results are written
    pub results_path: PathBuf,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IntervalMode {
    /// Wait exactly the configured mean between cycles
    Fixed,
    /// Exponentially distributed wait around the configured mean
    Poisson,
}

impl IntervalMode {
    pub fn from_str(s: &str) -> Option<Self> {
        match s.to_lowercase().as_str() {
            "fixed" => Some(Self::Fixed),
            "poisson" | "exponential" => Some(Self::Poisson),
            _ => None,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Fixed => "fixed",
            Self::Poisson => "poisson",
        }
    }
}

#[derive(Debug, Clone)]
pub struct RotationConfig {
    /// Group whose active member is switched
    pub switch_group: String,
    /// Results file the pool is loaded from
    pub results_path: PathBuf,
    /// Local HTTP proxy port that routes through the active node
    pub mixed_proxy: MixedProxyConfig,
    /// Endpoint echoing the caller's public IP (http, or https via CONNECT)
    pub identity_url: Url,
    /// Extra PEM trust anchors for an https identity endpoint
    pub identity_ca_file: Option<PathBuf>,
    /// Timeout for the identity lookup
    pub identity_timeout: Duration,
    /// Pause after an accepted switch before the route is used
    pub settle_delay: Duration,
    /// Number of rotation cycles per run
    pub cycles: u32,
    /// Inter-cycle wait strategy
    pub interval_mode: IntervalMode,
    /// Mean inter-cycle wait
    pub interval: Duration,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MixedProxyConfig {
    pub host: String,
    pub port: u16,
}

#[derive(Debug, Clone)]
pub struct LogConfig {
    /// Log level (debug, info, warn, error)
    pub level: String,
    /// Output format (json, pretty)
    pub format: String,
}

impl Config {
    /// Load configuration from environment variables
    pub fn from_env() -> Result<Self> {
        let results_path = PathBuf::from(get_env_or(
            "RESULTS_PATH",
            "proxies/proxy_test_results.json",
        ));

        let concurrency: usize = parse_env("PROBE_CONCURRENCY", "20")?;
        if concurrency == 0 {
            return Err(RotaError::InvalidConfig(
                "PROBE_CONCURRENCY must be at least 1".into(),
            ));
        }

        let interval_raw = get_env_or("ROTATION_INTERVAL_MODE", "fixed");
        let interval_mode = IntervalMode::from_str(&interval_raw).ok_or_else(|| {
            RotaError::InvalidConfig(format!(
                "ROTATION_INTERVAL_MODE has unsupported value: {}",
                interval_raw
            ))
        })?;

        let interval_secs: u64 = parse_env("ROTATION_INTERVAL_SECS", "3")?;
        if interval_secs > MAX_INTERVAL_SECS {
            return Err(RotaError::InvalidConfig(format!(
                "ROTATION_INTERVAL_SECS must be at most {}",
                MAX_INTERVAL_SECS
            )));
        }

        Ok(Config {
            controller: ControllerConfig {
                url: parse_controller_url(&get_env_or("CONTROLLER_URL", "http://127.0.0.1:9090"))?,
                secret: get_env_or("CONTROLLER_SECRET", ""),
                request_timeout: Duration::from_secs(parse_env("CONTROLLER_TIMEOUT_SECS", "5")?),
            },
            probe: ProbeConfig {
                group: get_env_or("PROBE_GROUP", "NODE_TEST"),
                target_url: get_env_or("PROBE_TARGET_URL", "https://www.google.com"),
                timeout: Duration::from_millis(parse_env("PROBE_TIMEOUT_MS", "8000")?),
                concurrency,
                results_path: results_path.clone(),
            },
            rotation: RotationConfig {
                switch_group: get_env_or("SWITCH_GROUP", "GLOBAL"),
                results_path,
                mixed_proxy: parse_mixed_proxy(&get_env_or(
                    "MIXED_PROXY_URL",
                    "http://127.0.0.1:7892",
                ))?,
                identity_url: parse_identity_url(&get_env_or(
                    "IDENTITY_URL",
                    "https://api.ipify.org/?format=json",
                ))?,
                identity_ca_file: env::var("IDENTITY_CA_FILE")
                    .ok()
                    .filter(|p| !p.trim().is_empty())
                    .map(PathBuf::from),
                identity_timeout: Duration::from_secs(parse_env("IDENTITY_TIMEOUT_SECS", "10")?),
                settle_delay: Duration::from_millis(parse_env("SETTLE_DELAY_MS", "300")?),
                cycles: parse_env("ROTATION_CYCLES", "3")?,
                interval_mode,
                interval: Duration::from_secs(interval_secs),
            },
            log: LogConfig {
                level: get_env_or("LOG_LEVEL", "info"),
                format: get_env_or("LOG_FORMAT", "pretty"),
            },
        })
    }
}

fn parse_controller_url(raw: &str) -> Result<Url> {
    let url = Url::parse(raw.trim()).map_err(|e| {
        RotaError::InvalidConfig(format!("CONTROLLER_URL must be a valid URL: {}", e))
    })?;

    if url.scheme() != "http" {
        return Err(RotaError::InvalidConfig(format!(
            "CONTROLLER_URL has unsupported scheme: {}",
            url.scheme()
        )));
    }
    if url.host_str().is_none() {
        return Err(RotaError::InvalidConfig(
            "CONTROLLER_URL must include a host".into(),
        ));
    }

    Ok(url)
}

fn parse_mixed_proxy(raw: &str) -> Result<MixedProxyConfig> {
    let url = Url::parse(raw.trim()).map_err(|e| {
        RotaError::InvalidConfig(format!("MIXED_PROXY_URL must be a valid URL: {}", e))
    })?;

    if url.scheme() != "http" {
        return Err(RotaError::InvalidConfig(format!(
            "MIXED_PROXY_URL has unsupported scheme: {}",
            url.scheme()
        )));
    }
    if !(url.path().is_empty() || url.path() == "/") {
        return Err(RotaError::InvalidConfig(
            "MIXED_PROXY_URL must not include a path".into(),
        ));
    }

    let host = url
        .host_str()
        .ok_or_else(|| RotaError::InvalidConfig("MIXED_PROXY_URL must include a host".into()))?;
    let host = host
        .strip_prefix('[')
        .and_then(|h| h.strip_suffix(']'))
        .unwrap_or(host);

    Ok(MixedProxyConfig {
        host: host.to_string(),
        port: url.port().unwrap_or(80),
    })
}

fn parse_identity_url(raw: &str) -> Result<Url> {
    let url = Url::parse(raw.trim()).map_err(|e| {
        RotaError::InvalidConfig(format!("IDENTITY_URL must be a valid URL: {}", e))
    })?;

    if !matches!(url.scheme(), "http" | "https") {
        return Err(RotaError::InvalidConfig(format!(
            "IDENTITY_URL has unsupported scheme: {}",
            url.scheme()
        )));
    }
    if url.host_str().is_none() {
        return Err(RotaError::InvalidConfig(
            "IDENTITY_URL must include a host".into(),
        ));
    }

    Ok(url)
}

/// Get environment variable with a default value
fn get_env_or(key: &str, default: &str) -> String {
    env::var(key).unwrap_or_else(|_| default.to_string())
}

/// Parse a numeric environment variable; malformed values are rejected
fn parse_env<T: FromStr>(key: &str, default: &str) -> Result<T> {
    let raw = get_env_or(key, default);
    raw.trim().parse().map_err(|_| {
        RotaError::InvalidConfig(format!("{} must be a valid number, got {:?}", key, raw))
    })
}
