//! Configuration snapshot.
//!
//! [`Config`] is the single typed shape every component in this crate is
//! configured from. Loading it from a TOML file plus environment overrides
//! is the CLI binary's job (`meshline-cli`), not this crate's — this module
//! only defines the shape, its defaults, and the fail-fast validation that
//! has to happen before any network call.

use std::net::SocketAddr;
use std::path::PathBuf;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use url::Url;

use crate::auth::AuthConfig;
use crate::error::{Error, Result};
use crate::mesh_router::RoutingPolicy;
use crate::relay_client::TlsOptions;
use crate::retry::RetryPolicy;

fn default_heartbeat_secs() -> u64 {
    30
}
fn default_discovery_interval_secs() -> u64 {
    30
}
fn default_discovery_ttl_secs() -> u64 {
    300
}
fn default_shutdown_deadline_secs() -> u64 {
    10
}
fn default_deregister_deadline_secs() -> u64 {
    3
}
fn default_max_direct_latency_ms() -> f64 {
    150.0
}
fn default_alpn() -> Vec<String> {
    vec!["meshline/1".to_string()]
}

/// TOML-friendly form of [`RetryPolicy`] — plain `Duration` doesn't
/// round-trip through `serde` without a helper crate this workspace doesn't
/// otherwise need, so the wire shape is seconds/millis and this converts.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RetryConfig {
    pub max_retries: u32,
    pub base_delay_ms: u64,
    pub backoff_multiplier: f64,
    pub max_backoff_secs: u64,
}

impl Default for RetryConfig {
    fn default() -> Self {
        let defaults = RetryPolicy::default();
        Self {
            max_retries: defaults.max_retries,
            base_delay_ms: defaults.base_delay.as_millis() as u64,
            backoff_multiplier: defaults.backoff_multiplier,
            max_backoff_secs: defaults.max_backoff.as_secs(),
        }
    }
}

impl RetryConfig {
    pub fn to_policy(&self) -> RetryPolicy {
        RetryPolicy {
            max_retries: self.max_retries,
            base_delay: Duration::from_millis(self.base_delay_ms),
            backoff_multiplier: self.backoff_multiplier,
            max_backoff: Duration::from_secs(self.max_backoff_secs),
        }
    }
}

fn default_metrics_push_interval_secs() -> u64 {
    15
}

/// Optional pushgateway-style metrics push target.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MetricsPushConfig {
    pub endpoint: Url,
    pub job: String,
    #[serde(default = "default_metrics_push_interval_secs")]
    pub interval_secs: u64,
}

impl MetricsPushConfig {
    pub fn to_push_config(&self) -> crate::metrics::PushConfig {
        crate::metrics::PushConfig {
            endpoint: self.endpoint.clone(),
            job: self.job.clone(),
            interval: Duration::from_secs(self.interval_secs),
        }
    }
}

/// The configuration snapshot passed into [`crate::session::SessionManager::start`].
/// Cloned once by the caller and never mutated for the session's lifetime.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    pub tenant_id: String,
    pub relay_base_url: Url,

    /// The relay's QUIC endpoint. Mandatory: there is no hard-coded internal
    /// fallback, so a missing value fails fast in [`Config::validate`]
    /// rather than being silently assumed.
    pub relay_quic_addr: Option<SocketAddr>,

    /// Local address this process's QUIC listener binds to.
    pub quic_listen_addr: SocketAddr,
    /// PEM certificate chain for this process's QUIC listener identity.
    pub quic_cert_path: PathBuf,
    /// PEM private key matching `quic_cert_path`.
    pub quic_key_path: PathBuf,

    pub local_public_key: String,
    #[serde(default)]
    pub local_allowed_ips: Vec<String>,

    #[serde(default = "default_heartbeat_secs")]
    pub heartbeat_interval_secs: u64,
    #[serde(default = "default_discovery_interval_secs")]
    pub discovery_interval_secs: u64,
    #[serde(default = "default_discovery_ttl_secs")]
    pub discovery_ttl_secs: u64,
    #[serde(default = "default_shutdown_deadline_secs")]
    pub shutdown_deadline_secs: u64,
    #[serde(default = "default_deregister_deadline_secs")]
    pub deregister_deadline_secs: u64,

    #[serde(default)]
    pub routing_policy: RoutingPolicy,
    #[serde(default = "default_max_direct_latency_ms")]
    pub max_direct_latency_ms: f64,

    #[serde(default)]
    pub stun_servers: Vec<Url>,
    #[serde(default)]
    pub turn_servers: Vec<Url>,

    #[serde(default)]
    pub tls: TlsOptions,
    #[serde(default = "default_alpn")]
    pub alpn: Vec<String>,

    pub auth: AuthConfig,

    #[serde(default)]
    pub retry: RetryConfig,

    #[serde(default)]
    pub metrics_push: Option<MetricsPushConfig>,
}

impl Config {
    pub fn heartbeat_interval(&self) -> Duration {
        Duration::from_secs(self.heartbeat_interval_secs)
    }

    pub fn discovery_interval(&self) -> Duration {
        Duration::from_secs(self.discovery_interval_secs)
    }

    pub fn discovery_ttl(&self) -> Duration {
        Duration::from_secs(self.discovery_ttl_secs)
    }

    pub fn shutdown_deadline(&self) -> Duration {
        Duration::from_secs(self.shutdown_deadline_secs)
    }

    pub fn deregister_deadline(&self) -> Duration {
        Duration::from_secs(self.deregister_deadline_secs)
    }

    pub fn alpn_bytes(&self) -> Vec<Vec<u8>> {
        self.alpn.iter().map(|s| s.as_bytes().to_vec()).collect()
    }

    /// Checks that fields with no safe default are present. Surfaced before
    /// any network call.
    pub fn validate(&self) -> Result<()> {
        if self.tenant_id.trim().is_empty() {
            return Err(Error::ConfigInvalid("tenant_id is required".into()));
        }
        if self.local_public_key.trim().is_empty() {
            return Err(Error::ConfigInvalid("local_public_key is required".into()));
        }
        if self.quic_cert_path.as_os_str().is_empty() || self.quic_key_path.as_os_str().is_empty() {
            return Err(Error::ConfigInvalid("quic_cert_path and quic_key_path are required".into()));
        }
        if self.relay_quic_addr.is_none() {
            return Err(Error::ConfigInvalid(
                "relay_quic_addr is required (no hard-coded default is assumed)".into(),
            ));
        }
        if self.alpn.is_empty() {
            return Err(Error::ConfigInvalid("alpn must name at least one protocol".into()));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn minimal() -> Config {
        Config {
            tenant_id: "t-1".into(),
            relay_base_url: "https://relay.example".parse().unwrap(),
            relay_quic_addr: Some("127.0.0.1:4433".parse().unwrap()),
            quic_listen_addr: "0.0.0.0:0".parse().unwrap(),
            quic_cert_path: PathBuf::from("/etc/meshline/cert.pem"),
            quic_key_path: PathBuf::from("/etc/meshline/key.pem"),
            local_public_key: "pk-1".into(),
            local_allowed_ips: vec![],
            heartbeat_interval_secs: default_heartbeat_secs(),
            discovery_interval_secs: default_discovery_interval_secs(),
            discovery_ttl_secs: default_discovery_ttl_secs(),
            shutdown_deadline_secs: default_shutdown_deadline_secs(),
            deregister_deadline_secs: default_deregister_deadline_secs(),
            routing_policy: RoutingPolicy::default(),
            max_direct_latency_ms: default_max_direct_latency_ms(),
            stun_servers: vec![],
            turn_servers: vec![],
            tls: TlsOptions::default(),
            alpn: default_alpn(),
            auth: AuthConfig {
                key_family: crate::auth::KeyFamily::Symmetric,
                primary_secret: Some("s".into()),
                fallback_secret: None,
                issuer_url: None,
                audience: None,
                jwks_url: None,
                skip_validation: false,
                cache_dir: None,
                jwks_ttl: Duration::from_secs(3600),
            },
            retry: RetryConfig::default(),
            metrics_push: None,
        }
    }

    #[test]
    fn missing_relay_quic_addr_fails_fast() {
        let mut config = minimal();
        config.relay_quic_addr = None;
        let err = config.validate().unwrap_err();
        assert!(matches!(err, Error::ConfigInvalid(_)));
    }

    #[test]
    fn valid_config_passes() {
        assert!(minimal().validate().is_ok());
    }
}
