//! Egress identity lookup through the controller's local proxy listener
//!
//! `http` endpoints are requested in absolute form through the proxy. `https`
//! endpoints go through a CONNECT tunnel with TLS on top.

use std::io::BufReader;
use std::net::IpAddr;
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use http::header::{CONNECTION, HOST};
use http::{Request, StatusCode};
use http_body_util::{BodyExt, Empty};
use hyper_util::rt::TokioIo;
use pki_types::ServerName;
use rustls::{ClientConfig, RootCertStore};
use serde_json::Value;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::net::TcpStream;
use tokio_rustls::TlsConnector;
use tracing::{debug, warn};
use url::{Position, Url};

use crate::config::{MixedProxyConfig, RotationConfig};
use crate::error::{Result, RotaError};

/// Largest CONNECT reply head accepted from the proxy
const MAX_CONNECT_HEAD: usize = 8 * 1024;

/// Fetches the public IP seen by an echo endpoint, routed via the active node
#[derive(Debug, Clone)]
pub struct IdentityProbe {
    proxy: MixedProxyConfig,
    url: Url,
    timeout: Duration,
    /// Present for https endpoints
    tls: Option<Arc<ClientConfig>>,
}

impl IdentityProbe {
    /// Fails only when the trust store for an https endpoint cannot be built
    pub fn new(
        proxy: MixedProxyConfig,
        url: Url,
        timeout: Duration,
        ca_file: Option<&Path>,
    ) -> Result<Self> {
        let tls = match url.scheme() {
            "https" => Some(Arc::new(tls_config(ca_file)?)),
            _ => None,
        };

        Ok(Self {
            proxy,
            url,
            timeout,
            tls,
        })
    }

    pub fn from_config(config: &RotationConfig) -> Result<Self> {
        Self::new(
            config.mixed_proxy.clone(),
            config.identity_url.clone(),
            config.identity_timeout,
            config.identity_ca_file.as_deref(),
        )
    }

    /// Best-effort lookup; any failure is logged and reported as unknown
    pub async fn lookup(&self) -> Option<IpAddr> {
        match tokio::time::timeout(self.timeout, self.fetch()).await {
            Ok(Ok(ip)) => {
                debug!("Egress identity: {}", ip);
                Some(ip)
            }
            Ok(Err(e)) => {
                warn!("Egress identity lookup failed: {:#}", e);
                None
            }
            Err(_) => {
                warn!(
                    "Egress identity lookup timed out after {}s",
                    self.timeout.as_secs()
                );
                None
            }
        }
    }

    async fn fetch(&self) -> std::result::Result<IpAddr, anyhow::Error> {
        let host = self
            .url
            .host_str()
            .ok_or_else(|| anyhow::anyhow!("identity URL has no host"))?;
        let authority = match self.url.port() {
            Some(port) => format!("{}:{}", host, port),
            None => host.to_string(),
        };

        let proxy_addr = format_tcp_addr(&self.proxy.host, self.proxy.port);
        let stream = TcpStream::connect(&proxy_addr).await?;

        match &self.tls {
            // Absolute-form target so the proxy forwards it upstream.
            None => send_lookup(stream, self.url.as_str(), &authority).await,
            Some(config) => {
                let port = self.url.port_or_known_default().unwrap_or(443);
                let stream = connect_tunnel(stream, host, port).await?;

                let bare_host = host.trim_start_matches('[').trim_end_matches(']');
                let server_name = ServerName::try_from(bare_host.to_string())
                    .map_err(|e| anyhow::anyhow!("invalid TLS server name {}: {}", bare_host, e))?;
                let stream = TlsConnector::from(config.clone())
                    .connect(server_name, stream)
                    .await?;

                send_lookup(stream, &self.url[Position::BeforePath..], &authority).await
            }
        }
    }
}

/// One GET over an established stream; `target` is the request-line URI
async fn send_lookup<S>(
    stream: S,
    target: &str,
    authority: &str,
) -> std::result::Result<IpAddr, anyhow::Error>
where
    S: AsyncRead + AsyncWrite + Unpin + Send + 'static,
{
    let request = Request::builder()
        .uri(target)
        .header(HOST, authority)
        .header(CONNECTION, "close")
        .body(Empty::<Bytes>::new())?;

    let (mut sender, conn) = hyper::client::conn::http1::handshake(TokioIo::new(stream)).await?;

    tokio::spawn(async move {
        if let Err(e) = conn.await {
            debug!("Identity connection ended: {}", e);
        }
    });

    let response = sender.send_request(request).await?;
    let status = response.status();
    let body = response.into_body().collect().await?.to_bytes();

    if status != StatusCode::OK {
        anyhow::bail!("identity endpoint returned HTTP {}", status.as_u16());
    }

    parse_identity(&body).ok_or_else(|| anyhow::anyhow!("identity endpoint returned no IP address"))
}

/// Ask the proxy for a raw tunnel to `host:port`
async fn connect_tunnel(
    mut stream: TcpStream,
    host: &str,
    port: u16,
) -> std::result::Result<TcpStream, anyhow::Error> {
    let target = format!("{}:{}", host, port);
    let request = format!("CONNECT {0} HTTP/1.1\r\nHost: {0}\r\n\r\n", target);
    stream.write_all(request.as_bytes()).await?;

    let mut head = Vec::with_capacity(256);
    let mut buf = [0u8; 512];
    while !head.windows(4).any(|w| w == b"\r\n\r\n") {
        if head.len() > MAX_CONNECT_HEAD {
            anyhow::bail!("CONNECT reply from proxy is too large");
        }
        let n = stream.read(&mut buf).await?;
        if n == 0 {
            anyhow::bail!("proxy closed the connection during CONNECT");
        }
        head.extend_from_slice(&buf[..n]);
    }

    let reply = String::from_utf8_lossy(&head);
    let status_line = reply.lines().next().unwrap_or_default();
    if !status_line.starts_with("HTTP/1.1 200") && !status_line.starts_with("HTTP/1.0 200") {
        anyhow::bail!("CONNECT to {} refused: {}", target, status_line);
    }

    debug!("CONNECT tunnel to {} established", target);
    Ok(stream)
}

/// Public web roots, plus any PEM certificates from `ca_file`
fn tls_config(ca_file: Option<&Path>) -> Result<ClientConfig> {
    let mut roots = RootCertStore::empty();
    roots.extend(webpki_roots::TLS_SERVER_ROOTS.iter().cloned());

    if let Some(path) = ca_file {
        let file = std::fs::File::open(path).map_err(|e| {
            RotaError::InvalidConfig(format!("cannot open CA file {}: {}", path.display(), e))
        })?;

        let mut added = 0;
        for cert in rustls_pemfile::certs(&mut BufReader::new(file)) {
            let cert = cert.map_err(|e| {
                RotaError::InvalidConfig(format!("bad PEM in {}: {}", path.display(), e))
            })?;
            roots.add(cert).map_err(|e| {
                RotaError::InvalidConfig(format!("bad certificate in {}: {}", path.display(), e))
            })?;
            added += 1;
        }
        if added == 0 {
            return Err(RotaError::InvalidConfig(format!(
                "no certificates found in {}",
                path.display()
            )));
        }
    }

    let config = ClientConfig::builder_with_provider(Arc::new(
        rustls::crypto::ring::default_provider(),
    ))
    .with_safe_default_protocol_versions()
    .map_err(|e| RotaError::Internal(format!("TLS setup failed: {}", e)))?
    .with_root_certificates(roots)
    .with_no_client_auth();

    Ok(config)
}

/// Accepts `{"ip": "..."}` or a bare address in the body
pub fn parse_identity(body: &[u8]) -> Option<IpAddr> {
    if let Ok(value) = serde_json::from_slice::<Value>(body) {
        return value
            .get("ip")
            .and_then(Value::as_str)
            .and_then(|ip| ip.trim().parse().ok());
    }

    std::str::from_utf8(body).ok()?.trim().parse().ok()
}

fn format_tcp_addr(host: &str, port: u16) -> String {
    if host.contains(':') && !(host.starts_with('[') && host.ends_with(']')) {
        format!("[{}]:{}", host, port)
    } else {
        format!("{}:{}", host, port)
    }
}
