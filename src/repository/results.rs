//! On-disk probe results
//!
//! The rotation run is a separate process that may read files written by older
//! tooling, so three layouts are accepted and normalized on load:
//!
//! - current: `{"meta": {...}, "ok": [...], "failed": [...]}`
//! - flat:    `{"ok": [...], "failed": [...]}`
//! - legacy:  `{"available": [...], "failed": [...]}`
//!
//! Flat and legacy files may lack a latency for a usable node. Such nodes stay
//! usable with `UNKNOWN_LATENCY_MS`.

use std::path::{Path, PathBuf};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use tracing::{debug, info, warn};

use crate::error::{Result, RotaError};
use crate::models::{ClassifiedResults, ResultCounts, UnusableNode, UsableNode, UNKNOWN_LATENCY_MS};

const GENERATED_BY: &str = concat!("egress-rota ", env!("CARGO_PKG_VERSION"));

#[derive(Debug, Serialize, Deserialize, Default)]
struct ArtifactMeta {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    generated_by: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    generated_at: Option<DateTime<Utc>>,
    #[serde(default)]
    counts: ResultCounts,
}

#[derive(Serialize)]
struct ArtifactRef<'a> {
    meta: ArtifactMeta,
    ok: &'a [UsableNode],
    failed: &'a [UnusableNode],
}

#[derive(Deserialize)]
struct CurrentArtifact {
    meta: ArtifactMeta,
    #[serde(default)]
    ok: Vec<UsableNode>,
    #[serde(default)]
    failed: Vec<UnusableNode>,
}

#[derive(Deserialize)]
struct FlatArtifact {
    ok: Vec<LooseUsableNode>,
    #[serde(default)]
    failed: Vec<UnusableNode>,
}

#[derive(Deserialize)]
struct LegacyArtifact {
    available: Vec<LooseUsableNode>,
    #[serde(default)]
    failed: Vec<UnusableNode>,
}

/// Usable entry from older tooling; latency may be absent, null or text
#[derive(Deserialize)]
struct LooseUsableNode {
    name: String,
    #[serde(default, alias = "delay", alias = "latency")]
    latency_ms: Option<Value>,
}

impl LooseUsableNode {
    fn normalize(self) -> UsableNode {
        let latency_ms = match self.latency_ms.as_ref().and_then(Value::as_f64) {
            Some(ms) => ms,
            None => {
                warn!("Node {} has no recorded latency; ranking it last", self.name);
                UNKNOWN_LATENCY_MS
            }
        };
        UsableNode {
            name: self.name,
            latency_ms,
        }
    }
}

fn normalize_all(nodes: Vec<LooseUsableNode>) -> Vec<UsableNode> {
    nodes.into_iter().map(LooseUsableNode::normalize).collect()
}

/// Layout of a results file, decided by which top-level keys are present
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ArtifactSchema {
    Current,
    Flat,
    Legacy,
}

impl ArtifactSchema {
    fn detect(object: &Map<String, Value>) -> Option<Self> {
        if object.contains_key("meta") {
            Some(Self::Current)
        } else if object.contains_key("ok") {
            Some(Self::Flat)
        } else if object.contains_key("available") {
            Some(Self::Legacy)
        } else {
            None
        }
    }
}

/// Encode results in the current layout
pub fn encode(results: &ClassifiedResults) -> Result<Vec<u8>> {
    let artifact = ArtifactRef {
        meta: ArtifactMeta {
            generated_by: Some(GENERATED_BY.to_string()),
            generated_at: results.generated_at,
            counts: results.counts(),
        },
        ok: &results.usable,
        failed: &results.unusable,
    };

    Ok(serde_json::to_vec_pretty(&artifact)?)
}

/// Decode any accepted layout into `ClassifiedResults`
pub fn decode(bytes: &[u8]) -> Result<ClassifiedResults> {
    let value: Value = serde_json::from_slice(bytes)?;
    let Value::Object(object) = value else {
        return Err(RotaError::InvalidResults(
            "top level must be a JSON object".into(),
        ));
    };

    let schema = ArtifactSchema::detect(&object).ok_or_else(|| {
        RotaError::InvalidResults("expected one of `meta`, `ok` or `available` keys".into())
    })?;
    debug!("Results layout detected: {:?}", schema);

    let invalid = |e: serde_json::Error| RotaError::InvalidResults(e.to_string());
    let value = Value::Object(object);

    let results = match schema {
        ArtifactSchema::Current => {
            let artifact: CurrentArtifact = serde_json::from_value(value).map_err(invalid)?;
            let results = ClassifiedResults {
                generated_at: artifact.meta.generated_at,
                usable: artifact.ok,
                unusable: artifact.failed,
            };
            if artifact.meta.counts != ResultCounts::default()
                && artifact.meta.counts != results.counts()
            {
                warn!(
                    "Results meta counts ({} ok, {} failed) disagree with entries ({} ok, {} failed)",
                    artifact.meta.counts.ok,
                    artifact.meta.counts.failed,
                    results.usable.len(),
                    results.unusable.len()
                );
            }
            results
        }
        ArtifactSchema::Flat => {
            let artifact: FlatArtifact = serde_json::from_value(value).map_err(invalid)?;
            ClassifiedResults {
                generated_at: None,
                usable: normalize_all(artifact.ok),
                unusable: artifact.failed,
            }
        }
        ArtifactSchema::Legacy => {
            let artifact: LegacyArtifact = serde_json::from_value(value).map_err(invalid)?;
            ClassifiedResults {
                generated_at: None,
                usable: normalize_all(artifact.available),
                unusable: artifact.failed,
            }
        }
    };

    if let Some(bad) = results
        .usable
        .iter()
        .find(|n| !n.latency_ms.is_finite() || n.latency_ms < 0.0)
    {
        return Err(RotaError::InvalidResults(format!(
            "node {} has invalid latency {}",
            bad.name, bad.latency_ms
        )));
    }

    Ok(results)
}

/// File-backed store for classified results
#[derive(Debug, Clone)]
pub struct ResultsRepository {
    path: PathBuf,
}

impl ResultsRepository {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Write via a sibling temp file and rename, so readers never see a partial file
    pub async fn save(&self, results: &ClassifiedResults) -> Result<()> {
        let bytes = encode(results)?;

        if let Some(parent) = self.path.parent().filter(|p| !p.as_os_str().is_empty()) {
            tokio::fs::create_dir_all(parent).await?;
        }

        let tmp = self.temp_path();
        tokio::fs::write(&tmp, &bytes).await?;
        if let Err(e) = tokio::fs::rename(&tmp, &self.path).await {
            let _ = tokio::fs::remove_file(&tmp).await;
            return Err(e.into());
        }

        info!(
            "Results written to {} ({} ok, {} failed)",
            self.path.display(),
            results.usable.len(),
            results.unusable.len()
        );
        Ok(())
    }

    pub async fn load(&self) -> Result<ClassifiedResults> {
        let bytes = tokio::fs::read(&self.path).await?;
        let results = decode(&bytes)?;

        info!(
            "Loaded {} usable and {} unusable nodes from {}",
            results.usable.len(),
            results.unusable.len(),
            self.path.display()
        );
        Ok(results)
    }

    fn temp_path(&self) -> PathBuf {
        let mut name = self
            .path
            .file_name()
            .map(|n| n.to_os_string())
            .unwrap_or_else(|| "results.json".into());
        name.push(format!(".{}.tmp", std::process::id()));
        self.path.with_file_name(name)
    }
}
