//! Relay HTTP client: register/discover/heartbeat/ICE-signalling over HTTPS.
//!
//! Every operation here goes through [`retry::with_retry`] and records a
//! counter/latency observation in the process-wide metrics registry on both
//! success and terminal failure.

use std::path::PathBuf;
use std::time::{Duration, Instant};

use chrono::{DateTime, Utc};
use reqwest::StatusCode;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tokio_util::sync::CancellationToken;
use url::Url;

use crate::error::{Error, Result};
use crate::retry::{RetryPolicy, with_retry};

/// TLS options for the relay connection.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct TlsOptions {
    /// Disables certificate verification. Development use only.
    #[serde(default)]
    pub tls_insecure: bool,
    /// A caller-supplied trust store, in addition to the platform roots.
    #[serde(default)]
    pub ca_path: Option<PathBuf>,
    /// Overrides the TLS server name (and outgoing `Host` header) independently
    /// of the URL the client actually connects to.
    #[serde(default)]
    pub server_name_override: Option<String>,
}

/// Configuration for [`RelayClient`].
#[derive(Debug, Clone)]
pub struct RelayClientConfig {
    pub base_url: Url,
    pub tenant_id: String,
    pub tls: TlsOptions,
    pub retry: RetryPolicy,
}

#[derive(Debug, Serialize)]
struct RegisterRequest<'a> {
    public_key: &'a str,
    allowed_ips: &'a [String],
    #[serde(skip_serializing_if = "Option::is_none")]
    peer_info: Option<Value>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct RegisterResponse {
    pub peer_id: String,
    pub relay_session_id: String,
    pub registered_at: DateTime<Utc>,
}

#[derive(Debug, Serialize)]
struct HeartbeatRequest<'a> {
    status: &'a str,
    relay_session_id: &'a str,
}

#[derive(Debug, Clone, Deserialize)]
pub struct HeartbeatResponse {
    pub success: bool,
    pub status: String,
    pub last_seen: DateTime<Utc>,
}

/// A discovered peer record.
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct PeerRecord {
    pub peer_id: String,
    pub public_key: String,
    #[serde(default)]
    pub allowed_ips: Vec<String>,
    #[serde(default)]
    pub endpoint: Option<String>,
    #[serde(default)]
    pub is_online: bool,
    pub last_seen: DateTime<Utc>,
    #[serde(default)]
    pub latency_ms: Option<f64>,
    #[serde(default)]
    pub mesh_status: Option<String>,
}

#[derive(Debug, Deserialize)]
struct DiscoverResponse {
    peers: Vec<PeerRecord>,
}

#[derive(Debug, Deserialize)]
struct DeregisterResponse {
    #[allow(dead_code)]
    success: bool,
}

#[derive(Debug, Serialize)]
struct IceLocalRequest<'a> {
    session_id: &'a str,
    candidates: &'a [String],
}

#[derive(Debug, Deserialize)]
struct IceLocalResponse {
    #[allow(dead_code)]
    success: bool,
}

#[derive(Debug, Serialize)]
struct IceRemoteRequest<'a> {
    session_id: &'a str,
    target_peer_id: &'a str,
}

#[derive(Debug, Deserialize)]
struct IceRemoteResponse {
    candidates: Vec<String>,
}

/// The relay HTTP client. Holds the validated bearer token and issues
/// every register/discover/heartbeat/ICE-signalling call against it.
pub struct RelayClient {
    http: reqwest::Client,
    base_url: Url,
    tenant_id: String,
    token: String,
    retry: RetryPolicy,
    cancel: CancellationToken,
}

impl RelayClient {
    pub fn new(config: RelayClientConfig, token: String, cancel: CancellationToken) -> Result<Self> {
        if config.base_url.scheme() != "https" && !config.tls.tls_insecure {
            return Err(Error::ConfigInvalid("relay base_url must be https unless tls_insecure is set".into()));
        }
        let mut builder = reqwest::Client::builder().danger_accept_invalid_certs(config.tls.tls_insecure);
        if let Some(ca_path) = &config.tls.ca_path {
            let pem = std::fs::read(ca_path).map_err(|e| Error::ConfigInvalid(format!("reading ca_path: {e}")))?;
            let cert = reqwest::Certificate::from_pem(&pem).map_err(|e| Error::ConfigInvalid(format!("invalid ca_path: {e}")))?;
            builder = builder.add_root_certificate(cert);
        }
        let http = builder
            .build()
            .map_err(|e| Error::ConfigInvalid(format!("failed to build relay http client: {e}")))?;
        Ok(Self { http, base_url: config.base_url, tenant_id: config.tenant_id, token, retry: config.retry, cancel })
    }

    fn url(&self, path: &str) -> Url {
        self.base_url
            .join(&format!("/api/v1/tenants/{}/{}", self.tenant_id, path))
            .expect("path template is well-formed")
    }

    fn request(&self, method: reqwest::Method, url: Url) -> reqwest::RequestBuilder {
        self.http
            .request(method, url)
            .bearer_auth(&self.token)
            .header("content-type", "application/json")
    }

    /// Run `f` under the shared retry policy, logging the outcome keyed by
    /// operation name. Operation-specific latency/counter observations are
    /// recorded by the caller, since the histograms are keyed by semantic
    /// operation (heartbeat, peer-connect, ICE gathering) rather than by
    /// HTTP call.
    async fn record<T, F, Fut>(&self, op: &'static str, f: F) -> Result<T>
    where
        F: Fn() -> Fut,
        Fut: std::future::Future<Output = Result<T>>,
    {
        let start = Instant::now();
        let result = with_retry(&self.retry, &self.cancel, &f).await;
        let elapsed = start.elapsed();
        if result.is_err() {
            tracing::warn!(op, elapsed_ms = elapsed.as_millis() as u64, "relay operation failed");
        } else {
            tracing::debug!(op, elapsed_ms = elapsed.as_millis() as u64, "relay operation succeeded");
        }
        result
    }

    /// Register a peer. Idempotent: a conflict response (the relay already
    /// has a registration for this `public_key`) is treated as success and
    /// the existing record is returned rather than surfaced as an error.
    pub async fn register(&self, public_key: &str, allowed_ips: &[String], peer_info: Option<Value>) -> Result<RegisterResponse> {
        crate::metrics::global().inc_register_attempts();
        let url = self.url("peers/register");
        self.record("register", || async {
            let body = RegisterRequest { public_key, allowed_ips, peer_info: peer_info.clone() };
            let resp = self
                .request(reqwest::Method::POST, url.clone())
                .json(&body)
                .send()
                .await
                .map_err(|e| Error::Transient(format!("register request: {e}")))?;
            let status = resp.status();
            if status.is_success() || status == StatusCode::CONFLICT {
                parse_json::<RegisterResponse>(resp).await
            } else {
                Err(classify_response_error(status, resp.headers(), &resp.text().await.unwrap_or_default()))
            }
        })
        .await
    }

    pub async fn heartbeat(&self, peer_id: &str, status: &str, relay_session_id: &str) -> Result<HeartbeatResponse> {
        crate::metrics::global().inc_heartbeats_sent();
        let url = self.url(&format!("peers/{peer_id}/heartbeat"));
        let started = Instant::now();
        let result = self
            .record("heartbeat", || async {
                let body = HeartbeatRequest { status, relay_session_id };
                let resp = self
                    .request(reqwest::Method::POST, url.clone())
                    .json(&body)
                    .send()
                    .await
                    .map_err(|e| Error::Transient(format!("heartbeat request: {e}")))?;
                expect_json(resp).await
            })
            .await;
        crate::metrics::global().observe_heartbeat_latency(started.elapsed());
        if result.is_err() {
            crate::metrics::global().inc_heartbeat_failures();
        }
        result
    }

    pub async fn discover(&self) -> Result<Vec<PeerRecord>> {
        let url = self.url("peers/discover");
        self.record("discover", || async {
            let resp = self
                .request(reqwest::Method::GET, url.clone())
                .send()
                .await
                .map_err(|e| Error::Transient(format!("discover request: {e}")))?;
            let body: DiscoverResponse = expect_json(resp).await?;
            Ok(body.peers)
        })
        .await
    }

    pub async fn peer_info(&self, peer_id: &str) -> Result<PeerRecord> {
        let url = self.url(&format!("peers/{peer_id}"));
        self.record("peer_info", || async {
            let resp = self
                .request(reqwest::Method::GET, url.clone())
                .send()
                .await
                .map_err(|e| Error::Transient(format!("peer_info request: {e}")))?;
            expect_json(resp).await
        })
        .await
    }

    pub async fn deregister(&self, peer_id: &str) -> Result<()> {
        let url = self.url(&format!("peers/{peer_id}"));
        self.record("deregister", || async {
            let resp = self
                .request(reqwest::Method::DELETE, url.clone())
                .send()
                .await
                .map_err(|e| Error::Transient(format!("deregister request: {e}")))?;
            let _body: DeregisterResponse = expect_json(resp).await?;
            Ok(())
        })
        .await
    }

    /// Post locally-gathered ICE candidates, SDP-encoded, tagged under `session_id`.
    pub async fn ice_signal_send(&self, peer_id: &str, session_id: &str, candidates: &[String]) -> Result<()> {
        let url = self.url(&format!("peers/{peer_id}/ice/local"));
        self.record("ice_signal_send", || async {
            let body = IceLocalRequest { session_id, candidates };
            let resp = self
                .request(reqwest::Method::POST, url.clone())
                .json(&body)
                .send()
                .await
                .map_err(|e| Error::Transient(format!("ice local request: {e}")))?;
            let _body: IceLocalResponse = expect_json(resp).await?;
            Ok(())
        })
        .await
    }

    /// Fetch remote ICE candidates tagged under `session_id` for `target_peer_id`.
    pub async fn ice_signal_fetch(&self, peer_id: &str, session_id: &str, target_peer_id: &str) -> Result<Vec<String>> {
        let url = self.url(&format!("peers/{peer_id}/ice/remote"));
        self.record("ice_signal_fetch", || async {
            let body = IceRemoteRequest { session_id, target_peer_id };
            let resp = self
                .request(reqwest::Method::POST, url.clone())
                .json(&body)
                .send()
                .await
                .map_err(|e| Error::Transient(format!("ice remote request: {e}")))?;
            let body: IceRemoteResponse = expect_json(resp).await?;
            Ok(body.candidates)
        })
        .await
    }

    /// Poll for remote ICE candidates with backoff, up to `timeout`.
    pub async fn ice_signal_fetch_until(
        &self,
        peer_id: &str,
        session_id: &str,
        target_peer_id: &str,
        timeout: Duration,
    ) -> Result<Vec<String>> {
        let deadline = Instant::now() + timeout;
        let mut delay = Duration::from_millis(250);
        loop {
            let candidates = self.ice_signal_fetch(peer_id, session_id, target_peer_id).await?;
            if !candidates.is_empty() {
                return Ok(candidates);
            }
            if Instant::now() >= deadline {
                return Ok(Vec::new());
            }
            let remaining = deadline.saturating_duration_since(Instant::now());
            tokio::select! {
                _ = tokio::time::sleep(delay.min(remaining)) => {}
                _ = self.cancel.cancelled() => return Err(Error::Transient("cancelled while polling ICE candidates".into())),
            }
            delay = (delay * 2).min(Duration::from_secs(2));
        }
    }
}

async fn parse_json<T: serde::de::DeserializeOwned>(resp: reqwest::Response) -> Result<T> {
    resp.json::<T>().await.map_err(|e| Error::ClaimsMalformed(format!("invalid relay response body: {e}")))
}

async fn expect_json<T: serde::de::DeserializeOwned>(resp: reqwest::Response) -> Result<T> {
    let status = resp.status();
    if status.is_success() {
        parse_json(resp).await
    } else {
        let headers = resp.headers().clone();
        let body = resp.text().await.unwrap_or_default();
        Err(classify_response_error(status, &headers, &body))
    }
}

fn classify_response_error(status: StatusCode, headers: &reqwest::header::HeaderMap, body: &str) -> Error {
    let code = extract_server_code(body);
    match status {
        StatusCode::UNAUTHORIZED => Error::InvalidToken(format!("relay rejected token: {body}")),
        StatusCode::FORBIDDEN => Error::PermissionDenied { permission: code.clone().unwrap_or_else(|| "unknown".into()), code },
        StatusCode::NOT_FOUND => Error::TenantUnknown { tenant_id: code.unwrap_or_default(), code: None },
        StatusCode::TOO_MANY_REQUESTS => {
            let retry_after = headers
                .get(reqwest::header::RETRY_AFTER)
                .and_then(|v| v.to_str().ok())
                .and_then(|s| s.parse::<u64>().ok())
                .map(Duration::from_secs);
            Error::RateLimited { retry_after }
        }
        StatusCode::REQUEST_TIMEOUT | StatusCode::TOO_EARLY => Error::Transient(format!("http {status}: {body}")),
        s if s.is_server_error() => Error::Transient(format!("http {status}: {body}")),
        s if s.is_client_error() => Error::ConfigInvalid(format!("relay rejected request ({s}): {body}")),
        s => Error::Transient(format!("unexpected status {s}: {body}")),
    }
}

fn extract_server_code(body: &str) -> Option<String> {
    serde_json::from_str::<Value>(body).ok().and_then(|v| v.get("code").and_then(|c| c.as_str()).map(|s| s.to_string()))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn rate_limited_honours_retry_after_header() {
        let mut headers = reqwest::header::HeaderMap::new();
        headers.insert(reqwest::header::RETRY_AFTER, "2".parse().unwrap());
        let err = classify_response_error(StatusCode::TOO_MANY_REQUESTS, &headers, "{}");
        match err {
            Error::RateLimited { retry_after } => assert_eq!(retry_after, Some(Duration::from_secs(2))),
            other => panic!("expected RateLimited, got {other:?}"),
        }
    }

    #[test]
    fn unauthorized_maps_to_invalid_token() {
        let headers = reqwest::header::HeaderMap::new();
        let err = classify_response_error(StatusCode::UNAUTHORIZED, &headers, "invalid token");
        assert!(matches!(err, Error::InvalidToken(_)));
    }

    #[test]
    fn server_error_is_transient() {
        let headers = reqwest::header::HeaderMap::new();
        let err = classify_response_error(StatusCode::BAD_GATEWAY, &headers, "oops");
        assert!(matches!(err, Error::Transient(_)));
    }
}
