//! Authenticator: validates bearer tokens and extracts typed claims.
//!
//! The authenticator exclusively owns the JWKS cache. A lookup that
//! misses the cache acquires a single-flight guard so that N concurrent
//! validators for an unknown `kid` trigger exactly one JWKS fetch.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};

use jsonwebtoken::{Algorithm, DecodingKey, Validation, decode, decode_header};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tokio::sync::Mutex as AsyncMutex;
use url::Url;

use crate::error::{Error, Result};

const FALLBACK_KID: &str = "fallback-key";
const CLAIMS_LEEWAY_SECS: u64 = 60;

/// Which key family the configured authenticator accepts.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum KeyFamily {
    Symmetric,
    Asymmetric,
}

/// Configuration for the authenticator.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AuthConfig {
    #[serde(rename = "type")]
    pub key_family: KeyFamily,
    pub primary_secret: Option<String>,
    pub fallback_secret: Option<String>,
    pub issuer_url: Option<String>,
    pub audience: Option<Vec<String>>,
    pub jwks_url: Option<Url>,
    /// Dev-only: parses without verifying. Never treated as verified by
    /// the session manager regardless of this flag.
    #[serde(default)]
    pub skip_validation: bool,
    /// Directory the JWKS cache may be persisted to (mode 0600), if any.
    #[serde(default)]
    pub cache_dir: Option<std::path::PathBuf>,
    /// How long a cached JWKS key is considered live before a re-fetch.
    #[serde(default = "default_jwks_ttl")]
    pub jwks_ttl: Duration,
}

fn default_jwks_ttl() -> Duration {
    Duration::from_secs(3600)
}

/// How a token ended up verified, or that it was not (dev mode only).
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum VerifiedBy {
    Primary,
    Fallback,
    Jwks(String),
    /// `skip_validation` was set. Carries no cryptographic guarantee; the
    /// session manager must reject this when authentication is required.
    Unverified,
}

impl VerifiedBy {
    pub fn is_verified(&self) -> bool {
        !matches!(self, VerifiedBy::Unverified)
    }
}

/// The closed set of connection types a token can claim, with the legacy
/// `"wireguard"` alias normalised to `P2PMesh`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum ConnectionType {
    ClientServer,
    ServerServer,
    P2PMesh,
}

impl ConnectionType {
    pub fn from_wire(s: &str) -> Option<Self> {
        match s {
            "client-server" => Some(ConnectionType::ClientServer),
            "server-server" => Some(ConnectionType::ServerServer),
            "p2p-mesh" | "wireguard" => Some(ConnectionType::P2PMesh),
            _ => None,
        }
    }
}

/// Either a single audience string or a list of them.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(untagged)]
enum Audience {
    One(String),
    Many(Vec<String>),
}

impl Audience {
    fn contains(&self, expected: &[String]) -> bool {
        match self {
            Audience::One(a) => expected.iter().any(|e| e == a),
            Audience::Many(list) => list.iter().any(|a| expected.iter().any(|e| e == a)),
        }
    }
}

/// The typed claims carried by an identity token. Unknown fields are
/// preserved opaquely in `extra` for forward compatibility rather than
/// rejected by a strict schema.
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct Claims {
    pub sub: String,
    pub tenant_id: Option<String>,
    pub connection_type: Option<String>,
    #[serde(default)]
    pub permissions: Vec<String>,
    pub mesh_config: Option<Value>,
    pub network_config: Option<Value>,
    pub peer_whitelist: Option<Vec<String>>,
    pub exp: Option<i64>,
    pub nbf: Option<i64>,
    pub iss: Option<String>,
    aud: Option<Audience>,
    #[serde(flatten)]
    pub extra: serde_json::Map<String, Value>,
}

/// A token that has gone through [`Authenticator::validate`].
#[derive(Debug, Clone)]
pub struct ValidatedToken {
    pub claims: Claims,
    pub verified_by: VerifiedBy,
}

impl Claims {
    /// Tenant id is a required field of the identity token; a token
    /// that lacks one is structurally malformed.
    pub fn extract_tenant_id(&self) -> Result<&str> {
        self.tenant_id
            .as_deref()
            .ok_or_else(|| Error::ClaimsMalformed("missing tenant_id".into()))
    }

    pub fn extract_connection_type(&self) -> Result<ConnectionType> {
        let raw = self
            .connection_type
            .as_deref()
            .ok_or_else(|| Error::ClaimsMalformed("missing connection_type".into()))?;
        ConnectionType::from_wire(raw)
            .ok_or_else(|| Error::ClaimsMalformed(format!("unknown connection_type: {raw}")))
    }

    /// Missing optional fields yield typed defaults, not errors.
    pub fn extract_network_config(&self) -> Value {
        self.network_config.clone().unwrap_or(Value::Null)
    }

    pub fn extract_mesh_config(&self) -> Value {
        self.mesh_config.clone().unwrap_or(Value::Null)
    }

    pub fn extract_peer_whitelist(&self) -> Vec<String> {
        self.peer_whitelist.clone().unwrap_or_default()
    }

    pub fn extract_permissions(&self) -> &[String] {
        &self.permissions
    }

    pub fn has_permission(&self, permission: &str) -> bool {
        self.permissions.iter().any(|p| p == permission)
    }
}

struct CachedKey {
    key: DecodingKey,
    fetched_at: Instant,
}

/// JWKS cache: `kid -> public_key`, with a single-flight refresh guard.
struct JwksCache {
    entries: AsyncMutex<HashMap<String, CachedKey>>,
    refresh_guard: AsyncMutex<()>,
    ttl: Duration,
    cache_dir: Option<std::path::PathBuf>,
}

impl JwksCache {
    fn new(ttl: Duration, cache_dir: Option<std::path::PathBuf>) -> Self {
        let cache = Self {
            entries: AsyncMutex::new(HashMap::new()),
            refresh_guard: AsyncMutex::new(()),
            ttl,
            cache_dir,
        };
        cache.load_persisted();
        cache
    }

    fn persisted_path(&self) -> Option<std::path::PathBuf> {
        self.cache_dir.as_ref().map(|d| d.join("jwks.json"))
    }

    fn load_persisted(&self) {
        let Some(path) = self.persisted_path() else { return };
        let Ok(bytes) = std::fs::read(&path) else { return };
        let Ok(set) = serde_json::from_slice::<jsonwebtoken::jwk::JwkSet>(&bytes) else { return };
        let mut entries = HashMap::new();
        for jwk in &set.keys {
            if let (Some(kid), Ok(key)) = (jwk.common.key_id.clone(), DecodingKey::from_jwk(jwk)) {
                entries.insert(kid, CachedKey { key, fetched_at: Instant::now() });
            }
        }
        if let Ok(mut guard) = self.entries.try_lock() {
            *guard = entries;
        }
    }

    fn persist(&self, set: &jsonwebtoken::jwk::JwkSet) {
        let Some(path) = self.persisted_path() else { return };
        let Some(parent) = path.parent() else { return };
        if std::fs::create_dir_all(parent).is_err() {
            return;
        }
        let Ok(bytes) = serde_json::to_vec(set) else { return };
        if std::fs::write(&path, bytes).is_err() {
            return;
        }
        #[cfg(unix)]
        {
            use std::os::unix::fs::PermissionsExt;
            let _ = std::fs::set_permissions(&path, std::fs::Permissions::from_mode(0o600));
        }
    }

    async fn lookup(&self, kid: &str) -> Option<DecodingKey> {
        let entries = self.entries.lock().await;
        entries.get(kid).and_then(|cached| {
            if cached.fetched_at.elapsed() < self.ttl {
                Some(cached.key.clone())
            } else {
                None
            }
        })
    }

    /// Refresh under a single-flight guard: the first caller through does
    /// the HTTP fetch; everyone else waits on the guard and re-checks the
    /// now-populated cache instead of issuing their own fetch.
    async fn refresh_and_lookup(&self, http: &reqwest::Client, jwks_url: &Url, kid: &str) -> Result<Option<DecodingKey>> {
        let _permit = self.refresh_guard.lock().await;

        // Another caller may have refreshed while we waited for the guard.
        if let Some(key) = self.lookup(kid).await {
            return Ok(Some(key));
        }

        let resp = http
            .get(jwks_url.clone())
            .send()
            .await
            .map_err(|e| Error::Transient(format!("jwks fetch: {e}")))?;
        if !resp.status().is_success() {
            return Err(Error::Transient(format!("jwks fetch returned {}", resp.status())));
        }
        let set: jsonwebtoken::jwk::JwkSet = resp
            .json()
            .await
            .map_err(|e| Error::ClaimsMalformed(format!("invalid jwks body: {e}")))?;

        let mut entries = self.entries.lock().await;
        let now = Instant::now();
        for jwk in &set.keys {
            if let (Some(k), Ok(key)) = (jwk.common.key_id.clone(), DecodingKey::from_jwk(jwk)) {
                entries.insert(k, CachedKey { key, fetched_at: now });
            }
        }
        let found = entries.get(kid).map(|c| c.key.clone());
        drop(entries);
        self.persist(&set);
        Ok(found)
    }
}

/// Validates bearer tokens and extracts typed claims.
pub struct Authenticator {
    config: AuthConfig,
    http: reqwest::Client,
    jwks: JwksCache,
}

impl Authenticator {
    pub fn new(config: AuthConfig) -> Result<Self> {
        if config.key_family == KeyFamily::Asymmetric && config.jwks_url.is_none() {
            return Err(Error::ConfigInvalid("asymmetric authenticator requires jwks_url".into()));
        }
        let http = reqwest::Client::builder()
            .build()
            .map_err(|e| Error::ConfigInvalid(format!("failed to build http client: {e}")))?;
        let jwks = JwksCache::new(config.jwks_ttl, config.cache_dir.clone());
        Ok(Self { config, http, jwks })
    }

    /// Decode, verify, and extract claims from a bearer token.
    pub async fn validate(&self, token: &str) -> Result<ValidatedToken> {
        let header = decode_header(token).map_err(|e| Error::InvalidToken(format!("bad header: {e}")))?;

        if self.config.skip_validation {
            let mut insecure = Validation::new(header.alg);
            insecure.insecure_disable_signature_validation();
            insecure.validate_exp = false;
            insecure.validate_nbf = false;
            insecure.validate_aud = false;
            insecure.required_spec_claims.clear();
            let data = decode::<Claims>(token, &DecodingKey::from_secret(b""), &insecure)
                .map_err(|e| Error::InvalidToken(format!("unparsable token: {e}")))?;
            return Ok(ValidatedToken { claims: data.claims, verified_by: VerifiedBy::Unverified });
        }

        let (decoding_key, verified_by) = match self.config.key_family {
            KeyFamily::Symmetric => {
                if !matches!(header.alg, Algorithm::HS256 | Algorithm::HS384 | Algorithm::HS512) {
                    return Err(Error::InvalidToken(format!("algorithm {:?} is not HMAC", header.alg)));
                }
                let use_fallback = header.kid.as_deref() == Some(FALLBACK_KID) && self.config.fallback_secret.is_some();
                let (secret, verified_by) = if use_fallback {
                    (self.config.fallback_secret.as_ref().unwrap(), VerifiedBy::Fallback)
                } else {
                    let primary = self
                        .config
                        .primary_secret
                        .as_ref()
                        .ok_or_else(|| Error::ConfigInvalid("symmetric authenticator requires primary_secret".into()))?;
                    (primary, VerifiedBy::Primary)
                };
                (DecodingKey::from_secret(secret.as_bytes()), verified_by)
            }
            KeyFamily::Asymmetric => {
                if !matches!(
                    header.alg,
                    Algorithm::RS256 | Algorithm::RS384 | Algorithm::RS512 | Algorithm::ES256 | Algorithm::ES384
                ) {
                    return Err(Error::InvalidToken(format!("algorithm {:?} is not asymmetric", header.alg)));
                }
                let kid = header.kid.clone().ok_or_else(|| Error::InvalidToken("missing kid".into()))?;
                let jwks_url = self.config.jwks_url.as_ref().expect("checked in new()");
                let key = match self.jwks.lookup(&kid).await {
                    Some(key) => key,
                    None => self
                        .jwks
                        .refresh_and_lookup(&self.http, jwks_url, &kid)
                        .await?
                        .ok_or_else(|| Error::UnknownKey { kid: kid.clone() })?,
                };
                (key, VerifiedBy::Jwks(kid))
            }
        };

        let mut validation = Validation::new(header.alg);
        validation.leeway = CLAIMS_LEEWAY_SECS;
        validation.validate_exp = true;
        validation.validate_nbf = true;
        // iss/aud are checked manually below so trailing-slash and
        // string-or-list audiences can be handled 
        validation.validate_aud = false;
        validation.required_spec_claims.clear();

        let data = decode::<Claims>(token, &decoding_key, &validation).map_err(|e| match e.kind() {
            jsonwebtoken::errors::ErrorKind::ExpiredSignature => Error::ExpiredToken,
            _ => Error::InvalidToken(format!("{e}")),
        })?;
        let claims = data.claims;

        if let Some(expected_iss) = &self.config.issuer_url {
            let actual = claims.iss.as_deref().unwrap_or("");
            if normalize_issuer(actual) != normalize_issuer(expected_iss) {
                return Err(Error::InvalidToken(format!("issuer mismatch: {actual}")));
            }
        }

        if let Some(expected_aud) = &self.config.audience {
            let ok = claims.aud.as_ref().map(|aud| aud.contains(expected_aud)).unwrap_or(false);
            if !ok {
                return Err(Error::InvalidToken("audience mismatch".into()));
            }
        }

        Ok(ValidatedToken { claims, verified_by })
    }
}

fn normalize_issuer(iss: &str) -> &str {
    iss.strip_suffix('/').unwrap_or(iss)
}

#[cfg(test)]
mod tests {
    use super::*;
    use jsonwebtoken::{Algorithm, EncodingKey, Header, encode};

    fn claims(tenant: &str, conn: &str) -> serde_json::Value {
        serde_json::json!({
            "sub": "s1",
            "tenant_id": tenant,
            "connection_type": conn,
            "exp": (chrono::Utc::now().timestamp() + 3600),
        })
    }

    fn sign(secret: &str, kid: Option<&str>, payload: &serde_json::Value) -> String {
        let mut header = Header::new(Algorithm::HS256);
        header.kid = kid.map(|s| s.to_string());
        encode(&header, payload, &EncodingKey::from_secret(secret.as_bytes())).unwrap()
    }

    fn symmetric_config(primary: &str, fallback: Option<&str>) -> AuthConfig {
        AuthConfig {
            key_family: KeyFamily::Symmetric,
            primary_secret: Some(primary.to_string()),
            fallback_secret: fallback.map(|s| s.to_string()),
            issuer_url: None,
            audience: None,
            jwks_url: None,
            skip_validation: false,
            cache_dir: None,
            jwks_ttl: Duration::from_secs(3600),
        }
    }

    #[tokio::test]
    async fn fallback_key_prefers_fallback_secret() {
        let auth = Authenticator::new(symmetric_config("A", Some("B"))).unwrap();
        let token = sign("B", Some(FALLBACK_KID), &claims("t-1", "p2p-mesh"));
        let validated = auth.validate(&token).await.unwrap();
        assert_eq!(validated.verified_by, VerifiedBy::Fallback);
    }

    #[tokio::test]
    async fn non_fallback_kid_uses_primary_secret() {
        let auth = Authenticator::new(symmetric_config("A", Some("B"))).unwrap();
        let token = sign("A", Some("primary-key"), &claims("t-1", "p2p-mesh"));
        let validated = auth.validate(&token).await.unwrap();
        assert_eq!(validated.verified_by, VerifiedBy::Primary);
    }

    #[tokio::test]
    async fn wrong_secret_is_rejected() {
        let auth = Authenticator::new(symmetric_config("A", Some("B"))).unwrap();
        let token = sign("wrong", None, &claims("t-1", "p2p-mesh"));
        let err = auth.validate(&token).await.unwrap_err();
        assert!(matches!(err, Error::InvalidToken(_)));
    }

    #[tokio::test]
    async fn expired_token_is_rejected_even_with_leeway() {
        let auth = Authenticator::new(symmetric_config("A", None)).unwrap();
        let mut payload = claims("t-1", "p2p-mesh");
        payload["exp"] = serde_json::json!(chrono::Utc::now().timestamp() - 3600);
        let token = sign("A", None, &payload);
        let err = auth.validate(&token).await.unwrap_err();
        assert!(matches!(err, Error::ExpiredToken));
    }

    #[tokio::test]
    async fn skip_validation_is_never_verified() {
        let mut config = symmetric_config("A", None);
        config.skip_validation = true;
        let auth = Authenticator::new(config).unwrap();
        let token = sign("anything-unsigned", None, &claims("t-1", "p2p-mesh"));
        let validated = auth.validate(&token).await.unwrap();
        assert!(!validated.verified_by.is_verified());
    }

    #[test]
    fn legacy_wireguard_connection_type_maps_to_p2p_mesh() {
        assert_eq!(ConnectionType::from_wire("wireguard"), Some(ConnectionType::P2PMesh));
        assert_eq!(ConnectionType::from_wire("p2p-mesh"), Some(ConnectionType::P2PMesh));
        assert_eq!(ConnectionType::from_wire("bogus"), None);
    }

    #[test]
    fn extract_functions_default_missing_optional_fields() {
        let claims: Claims = serde_json::from_value(claims("t-1", "p2p-mesh")).unwrap();
        assert_eq!(claims.extract_peer_whitelist(), Vec::<String>::new());
        assert_eq!(claims.extract_mesh_config(), Value::Null);
        assert!(claims.extract_permissions().is_empty());
    }

    #[test]
    fn issuer_comparison_is_trailing_slash_insensitive() {
        assert_eq!(normalize_issuer("https://relay.example/"), normalize_issuer("https://relay.example"));
    }

    /// `refresh_and_lookup`'s single-flight guard: a kid that is cold in the
    /// local cache but present in the JWKS the server publishes must still
    /// be fetched only once no matter how many validators race to resolve
    /// it concurrently.
    #[tokio::test]
    async fn concurrent_refreshes_of_a_cold_key_issue_exactly_one_fetch() {
        let fetch_count = Arc::new(std::sync::atomic::AtomicUsize::new(0));
        let counter_for_server = Arc::clone(&fetch_count);

        let server = tiny_http::Server::http("127.0.0.1:0").expect("bind ephemeral port");
        let addr = match server.server_addr() {
            tiny_http::ListenAddr::IP(addr) => addr,
            tiny_http::ListenAddr::Unix(_) => unreachable!("bound a TCP socket"),
        };
        std::thread::spawn(move || {
            // RFC 7515 Appendix A.3's ES256 example key, public components only.
            let body = r#"{"keys":[{"kty":"EC","crv":"P-256","kid":"test-ec-key-1","alg":"ES256","use":"sig","x":"f83OJ3D2xF1Bg8vub9tLe1gHMzV76e8Tus9uPHvRVEU","y":"x_FEzRu9m36HLN_tue659LNpXW6pCyStikYjKIWI5a0"}]}"#;
            for request in server.incoming_requests() {
                counter_for_server.fetch_add(1, std::sync::atomic::Ordering::SeqCst);
                let _ = request.respond(tiny_http::Response::from_string(body).with_status_code(200));
            }
        });

        let jwks_url: Url = format!("http://{addr}/jwks").parse().unwrap();
        let http = reqwest::Client::new();
        let cache = Arc::new(JwksCache::new(Duration::from_secs(60), None));

        let mut tasks = Vec::new();
        for _ in 0..8 {
            let cache = Arc::clone(&cache);
            let http = http.clone();
            let jwks_url = jwks_url.clone();
            tasks.push(tokio::spawn(async move { cache.refresh_and_lookup(&http, &jwks_url, "test-ec-key-1").await }));
        }
        for task in tasks {
            let found = task.await.unwrap().unwrap();
            assert!(found.is_some(), "every concurrent caller must observe the key once it's fetched");
        }

        assert_eq!(
            fetch_count.load(std::sync::atomic::Ordering::SeqCst),
            1,
            "a cold cache key shared by concurrent callers must be fetched exactly once"
        );
    }
}
