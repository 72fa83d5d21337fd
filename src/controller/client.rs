use std::error::Error as StdError;
use std::net::IpAddr;
use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
use http::header::{AUTHORIZATION, CONTENT_TYPE};
use http::{Method, Request, StatusCode};
use http_body_util::{BodyExt, Full};
use hyper_util::client::legacy::connect::HttpConnector;
use hyper_util::client::legacy::Client;
use hyper_util::rt::{TokioExecutor, TokioTimer};
use serde_json::{json, Value};
use tracing::{debug, instrument, warn};
use url::Url;

use super::{ControlPlane, IdentityProbe};
use crate::config::ControllerConfig;
use crate::error::{Result, RotaError};
use crate::models::{DelayReply, GroupInfo, ProbeError, ProxyMode, RuntimeConfigs};

/// Extra time granted on top of the controller-side probe timeout
const PROBE_GRACE: Duration = Duration::from_secs(1);

/// Longest body excerpt carried into error messages
const BODY_PREVIEW_LEN: usize = 200;

/// HTTP client for the controller REST API
#[derive(Clone)]
pub struct ControllerClient {
    base: Url,
    secret: String,
    request_timeout: Duration,
    http: Client<HttpConnector, Full<Bytes>>,
    identity: Option<IdentityProbe>,
}

impl ControllerClient {
    pub fn new(config: &ControllerConfig) -> Self {
        let http = Client::builder(TokioExecutor::new())
            .pool_timer(TokioTimer::new())
            .pool_idle_timeout(Duration::from_secs(30))
            .build_http();

        Self {
            base: config.url.clone(),
            secret: config.secret.clone(),
            request_timeout: config.request_timeout,
            http,
            identity: None,
        }
    }

    /// Attach the probe used by `current_egress_identity`
    pub fn with_identity_probe(mut self, probe: IdentityProbe) -> Self {
        self.identity = Some(probe);
        self
    }

    /// Full listing of a group, including its active member
    #[instrument(skip(self))]
    pub async fn group_info(&self, group: &str) -> Result<GroupInfo> {
        let url = self.endpoint(&["proxies", group])?;
        let (status, body) = self
            .send(Method::GET, &url, None, self.request_timeout)
            .await
            .map_err(as_unreachable)?;

        if !status.is_success() {
            return Err(RotaError::ControlPlaneError {
                status: status.as_u16(),
                message: error_message(&body),
            });
        }

        serde_json::from_slice(&body).map_err(|e| RotaError::ControlPlaneError {
            status: status.as_u16(),
            message: format!("invalid group payload: {}", e),
        })
    }

    /// Read the controller runtime configuration
    #[instrument(skip(self))]
    pub async fn configs(&self) -> Result<RuntimeConfigs> {
        let url = self.endpoint(&["configs"])?;
        let (status, body) = self
            .send(Method::GET, &url, None, self.request_timeout)
            .await
            .map_err(as_unreachable)?;

        if !status.is_success() {
            return Err(RotaError::ControlPlaneError {
                status: status.as_u16(),
                message: error_message(&body),
            });
        }

        serde_json::from_slice(&body).map_err(|e| RotaError::ControlPlaneError {
            status: status.as_u16(),
            message: format!("invalid configs payload: {}", e),
        })
    }

    /// Change the routing mode; accepted only on 204
    #[instrument(skip(self))]
    pub async fn set_mode(&self, mode: ProxyMode) -> Result<()> {
        let url = self.endpoint(&["configs"])?;
        let (status, body) = self
            .send(
                Method::PATCH,
                &url,
                Some(json!({ "mode": mode.as_str() })),
                self.request_timeout,
            )
            .await
            .map_err(as_unreachable)?;

        if status != StatusCode::NO_CONTENT {
            return Err(RotaError::ControlPlaneError {
                status: status.as_u16(),
                message: error_message(&body),
            });
        }

        Ok(())
    }

    /// Build `<base>/<segments...>` with each segment percent-encoded
    fn endpoint(&self, segments: &[&str]) -> Result<Url> {
        let mut url = self.base.clone();
        url.path_segments_mut()
            .map_err(|_| RotaError::InvalidConfig(format!("{} cannot be a base URL", self.base)))?
            .pop_if_empty()
            .extend(segments);
        Ok(url)
    }

    async fn send(
        &self,
        method: Method,
        url: &Url,
        body: Option<Value>,
        timeout: Duration,
    ) -> Result<(StatusCode, Bytes)> {
        let mut builder = Request::builder().method(method).uri(url.as_str());

        if !self.secret.is_empty() {
            builder = builder.header(AUTHORIZATION, format!("Bearer {}", self.secret));
        }

        let payload = match body {
            Some(value) => {
                builder = builder.header(CONTENT_TYPE, "application/json");
                Bytes::from(serde_json::to_vec(&value)?)
            }
            None => Bytes::new(),
        };

        let request = builder
            .body(Full::new(payload))
            .map_err(|e| RotaError::Internal(format!("Failed to build request: {}", e)))?;

        let exchange = async {
            let response = self
                .http
                .request(request)
                .await
                .map_err(|e| RotaError::ControlPlaneUnreachable(describe(&e)))?;
            let status = response.status();
            let bytes = response
                .into_body()
                .collect()
                .await
                .map_err(|e| RotaError::ControlPlaneUnreachable(describe(&e)))?
                .to_bytes();
            Ok::<_, RotaError>((status, bytes))
        };

        tokio::time::timeout(timeout, exchange)
            .await
            .map_err(|_| RotaError::Timeout)?
    }
}

#[async_trait]
impl ControlPlane for ControllerClient {
    async fn list_group_members(&self, group: &str) -> Result<Vec<String>> {
        Ok(self.group_info(group).await?.all)
    }

    #[instrument(skip(self, target_url, timeout))]
    async fn probe_delay(
        &self,
        node: &str,
        target_url: &str,
        timeout: Duration,
    ) -> std::result::Result<f64, ProbeError> {
        let timeout_ms = timeout.as_millis() as u64;

        let mut url = self
            .endpoint(&["proxies", node, "delay"])
            .map_err(|e| ProbeError::Transport(e.to_string()))?;
        url.query_pairs_mut()
            .append_pair("url", target_url)
            .append_pair("timeout", &timeout_ms.to_string());

        let (status, body) = match self
            .send(Method::GET, &url, None, timeout + PROBE_GRACE)
            .await
        {
            Ok(reply) => reply,
            Err(RotaError::Timeout) => return Err(ProbeError::Timeout { timeout_ms }),
            Err(RotaError::ControlPlaneUnreachable(e)) => return Err(ProbeError::Transport(e)),
            Err(e) => return Err(ProbeError::Transport(e.to_string())),
        };

        match status {
            StatusCode::OK => parse_delay(&body),
            StatusCode::REQUEST_TIMEOUT | StatusCode::GATEWAY_TIMEOUT => {
                Err(ProbeError::Timeout { timeout_ms })
            }
            _ => Err(ProbeError::Status {
                code: status.as_u16(),
                message: Some(error_message(&body)).filter(|m| !m.is_empty()),
            }),
        }
    }

    #[instrument(skip(self))]
    async fn switch_active(&self, group: &str, node: &str) -> Result<()> {
        let switch_failed = |reason: String| RotaError::SwitchFailed {
            node: node.to_string(),
            reason,
        };

        let url = self.endpoint(&["proxies", group])?;
        let (status, body) = self
            .send(
                Method::PUT,
                &url,
                Some(json!({ "name": node })),
                self.request_timeout,
            )
            .await
            .map_err(|e| switch_failed(e.to_string()))?;

        if status != StatusCode::NO_CONTENT {
            let message = error_message(&body);
            let reason = if message.is_empty() {
                format!("HTTP {}", status.as_u16())
            } else {
                format!("HTTP {}: {}", status.as_u16(), message)
            };
            return Err(switch_failed(reason));
        }

        debug!("Controller accepted switch of {} to {}", group, node);
        Ok(())
    }

    async fn current_egress_identity(&self) -> Option<IpAddr> {
        match &self.identity {
            Some(probe) => probe.lookup().await,
            None => {
                warn!("No identity probe configured; egress identity unknown");
                None
            }
        }
    }
}

/// Parse a delay reply body; only a finite, non-negative `delay` is accepted
pub fn parse_delay(body: &[u8]) -> std::result::Result<f64, ProbeError> {
    let reply: DelayReply =
        serde_json::from_slice(body).map_err(|_| ProbeError::BadPayload(preview(body)))?;

    match reply.delay {
        Some(delay) if delay.is_finite() && delay >= 0.0 => Ok(delay),
        _ => Err(ProbeError::BadPayload(preview(body))),
    }
}

/// Failure before any status was received means the controller is unreachable
fn as_unreachable(err: RotaError) -> RotaError {
    match err {
        RotaError::Timeout => RotaError::ControlPlaneUnreachable("request timed out".into()),
        other => other,
    }
}

/// Prefer the controller's `{"message": ...}` field over the raw body
fn error_message(body: &[u8]) -> String {
    serde_json::from_slice::<Value>(body)
        .ok()
        .and_then(|v| v.get("message").and_then(Value::as_str).map(str::to_string))
        .unwrap_or_else(|| preview(body))
}

fn preview(body: &[u8]) -> String {
    let text = String::from_utf8_lossy(body);
    let text = text.trim();
    match text.char_indices().nth(BODY_PREVIEW_LEN) {
        Some((idx, _)) => format!("{}...", &text[..idx]),
        None => text.to_string(),
    }
}

/// Flatten an error and its sources into one line
fn describe(err: &dyn StdError) -> String {
    let mut message = err.to_string();
    let mut source = err.source();
    while let Some(inner) = source {
        message.push_str(": ");
        message.push_str(&inner.to_string());
        source = inner.source();
    }
    message
}
