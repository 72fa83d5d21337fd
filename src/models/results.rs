use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use super::ProbeOutcome;

/// Latency given to usable nodes from older files that recorded none; ranks last
pub const UNKNOWN_LATENCY_MS: f64 = f64::MAX;

/// A node that answered its probe
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct UsableNode {
    pub name: String,
    #[serde(alias = "delay", alias = "latency")]
    pub latency_ms: f64,
}

impl UsableNode {
    /// `None` for nodes loaded without a recorded latency
    pub fn known_latency(&self) -> Option<f64> {
        Some(self.latency_ms).filter(|ms| *ms != UNKNOWN_LATENCY_MS)
    }
}

/// A node whose probe failed, with the reason
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct UnusableNode {
    pub name: String,
    #[serde(default)]
    pub error: String,
}

/// Summary counts of a probing run
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
pub struct ResultCounts {
    pub ok: usize,
    pub failed: usize,
}

impl ResultCounts {
    pub fn total(&self) -> usize {
        self.ok + self.failed
    }
}

/// Usable/unusable partition of one probing run
#[derive(Debug, Clone, PartialEq, Default)]
pub struct ClassifiedResults {
    /// Unset until the run is stamped; legacy files carry no timestamp
    pub generated_at: Option<DateTime<Utc>>,
    /// Completion order, not sorted
    pub usable: Vec<UsableNode>,
    pub unusable: Vec<UnusableNode>,
}

impl ClassifiedResults {
    /// Partition outcomes by presence of a latency. Pure; order is preserved.
    pub fn classify(outcomes: &[ProbeOutcome]) -> Self {
        let mut usable = Vec::new();
        let mut unusable = Vec::new();

        for outcome in outcomes {
            match &outcome.result {
                Ok(latency_ms) => usable.push(UsableNode {
                    name: outcome.node_name.clone(),
                    latency_ms: *latency_ms,
                }),
                Err(e) => unusable.push(UnusableNode {
                    name: outcome.node_name.clone(),
                    error: e.to_string(),
                }),
            }
        }

        Self {
            generated_at: None,
            usable,
            unusable,
        }
    }

    pub fn with_generated_at(mut self, at: DateTime<Utc>) -> Self {
        self.generated_at = Some(at);
        self
    }

    pub fn counts(&self) -> ResultCounts {
        ResultCounts {
            ok: self.usable.len(),
            failed: self.unusable.len(),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.usable.is_empty() && self.unusable.is_empty()
    }

    /// Fastest usable node, if any
    pub fn fastest(&self) -> Option<&UsableNode> {
        self.usable
            .iter()
            .min_by(|a, b| a.latency_ms.total_cmp(&b.latency_ms))
    }
}
