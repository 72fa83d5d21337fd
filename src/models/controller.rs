use serde::{Deserialize, Serialize};

/// Group listing returned by `GET /proxies/{group}`
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct GroupInfo {
    #[serde(default)]
    pub name: String,
    #[serde(rename = "type", default)]
    pub kind: String,
    /// Member names in controller order
    #[serde(default)]
    pub all: Vec<String>,
    /// Currently active member
    #[serde(default)]
    pub now: Option<String>,
}

/// Reply of `GET /proxies/{name}/delay`
#[derive(Debug, Clone, Copy, PartialEq, Deserialize)]
pub struct DelayReply {
    /// Measured latency in milliseconds; absent when the controller sent something else
    #[serde(default)]
    pub delay: Option<f64>,
}

/// Routing mode of the controller
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ProxyMode {
    Rule,
    Global,
    Direct,
}

impl ProxyMode {
    pub fn as_str(&self) -> &'static str {
        match self {
            ProxyMode::Rule => "rule",
            ProxyMode::Global => "global",
            ProxyMode::Direct => "direct",
        }
    }

    pub fn from_str(s: &str) -> Option<Self> {
        match s.to_lowercase().as_str() {
            "rule" => Some(ProxyMode::Rule),
            "global" => Some(ProxyMode::Global),
            "direct" => Some(ProxyMode::Direct),
            _ => None,
        }
    }
}

impl std::fmt::Display for ProxyMode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// Subset of `GET /configs` the tooling cares about
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct RuntimeConfigs {
    /// Raw mode string; unknown values are kept as-is
    #[serde(default)]
    pub mode: String,
    #[serde(default)]
    pub port: Option<u16>,
    #[serde(rename = "socks-port", default)]
    pub socks_port: Option<u16>,
    #[serde(rename = "mixed-port", default)]
    pub mixed_port: Option<u16>,
}

impl RuntimeConfigs {
    pub fn mode_enum(&self) -> Option<ProxyMode> {
        ProxyMode::from_str(&self.mode)
    }

    /// Port to route traffic through, preferring the mixed listener
    pub fn http_port(&self) -> Option<u16> {
        self.mixed_port
            .filter(|p| *p != 0)
            .or(self.port.filter(|p| *p != 0))
    }
}
