//! Typed error taxonomy shared by every component.
//!
//! Every network-facing operation in this crate returns `Result<T, Error>`.
//! The session manager is the only component that turns an `Error` into a
//! lifecycle decision (retry, fallback, degrade, or shut down) — see
//! [`crate::retry`] for the retry classification and [`crate::session`] for
//! the state machine that consumes it.

/// A server-provided error code, when the relay attached one to its response.
pub type ServerCode = Option<String>;

/// The full failure taxonomy for this crate.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    /// Configuration was invalid; surfaced before any network call.
    #[error("invalid configuration: {0}")]
    ConfigInvalid(String),

    /// Token signature, format, or algorithm family did not verify.
    #[error("invalid token: {0}")]
    InvalidToken(String),

    /// Token `exp` (beyond the leeway) has passed.
    #[error("token expired")]
    ExpiredToken,

    /// JWKS has no key for the token's `kid`, even after a refresh.
    #[error("unknown signing key: {kid}")]
    UnknownKey { kid: String },

    /// Claims were present but failed to parse into their typed shape.
    #[error("malformed claims: {0}")]
    ClaimsMalformed(String),

    /// Token verified, but lacks a permission the operation requires.
    #[error("permission denied: missing {permission}")]
    PermissionDenied { permission: String, code: ServerCode },

    /// The relay rejected the tenant referenced by the token.
    #[error("unknown tenant: {tenant_id}")]
    TenantUnknown { tenant_id: String, code: ServerCode },

    /// Rate limited; retry after the given delay (server-specified or computed).
    #[error("rate limited{}", retry_after_suffix(.retry_after))]
    RateLimited { retry_after: Option<std::time::Duration> },

    /// Transient umbrella: DNS, TCP/UDP I/O, 5xx, TLS handshake blips.
    #[error("transient failure: {0}")]
    Transient(String),

    /// ICE failed to establish connectivity within its deadline.
    #[error("ice failed: {0}")]
    IceFailed(String),

    /// The QUIC `AUTH` handshake was rejected by the remote side.
    #[error("auth rejected over quic: {0}")]
    AuthRejected(String),

    /// Unexpected wire framing on an otherwise-established connection.
    #[error("protocol violation: {0}")]
    ProtocolViolation(String),

    /// Wraps a lower-level I/O failure. Classified `Transient` by the retry policy.
    #[error("io error: {0}")]
    Io(#[source] std::sync::Arc<std::io::Error>),

    /// Wraps a `reqwest` failure. Classified by HTTP status when one is present.
    #[error("http error: {0}")]
    Http(#[source] std::sync::Arc<reqwest::Error>),

    /// Wraps a JSON (de)serialization failure.
    #[error("json error: {0}")]
    Json(#[source] std::sync::Arc<serde_json::Error>),

    /// Wraps a QUIC-layer failure not otherwise classified above.
    #[error("quic error: {0}")]
    Quic(String),
}

fn retry_after_suffix(retry_after: &Option<std::time::Duration>) -> String {
    match retry_after {
        Some(d) => format!(" (retry after {d:?})"),
        None => String::new(),
    }
}

impl Error {
    /// The server-provided error code, if this variant carries one.
    pub fn server_code(&self) -> ServerCode {
        match self {
            Error::PermissionDenied { code, .. } => code.clone(),
            Error::TenantUnknown { code, .. } => code.clone(),
            _ => None,
        }
    }

    /// The taxonomy key used for `errors_total{kind=...}`.
    pub fn kind(&self) -> &'static str {
        match self {
            Error::ConfigInvalid(_) => "config_invalid",
            Error::InvalidToken(_) => "invalid_token",
            Error::ExpiredToken => "expired_token",
            Error::UnknownKey { .. } => "unknown_key",
            Error::ClaimsMalformed(_) => "claims_malformed",
            Error::PermissionDenied { .. } => "permission_denied",
            Error::TenantUnknown { .. } => "tenant_unknown",
            Error::RateLimited { .. } => "rate_limited",
            Error::Transient(_) => "transient",
            Error::IceFailed(_) => "ice_failed",
            Error::AuthRejected(_) => "auth_rejected",
            Error::ProtocolViolation(_) => "protocol_violation",
            Error::Io(_) => "transient",
            Error::Http(_) => "transient",
            Error::Json(_) => "claims_malformed",
            Error::Quic(_) => "transient",
        }
    }

    /// Whether this error is fatal to a running session (forces `Closing`).
    pub fn is_fatal_to_session(&self) -> bool {
        matches!(
            self,
            Error::InvalidToken(_)
                | Error::ExpiredToken
                | Error::UnknownKey { .. }
                | Error::ClaimsMalformed(_)
                | Error::PermissionDenied { .. }
                | Error::TenantUnknown { .. }
        )
    }

    /// The process exit code this error maps to, if it is fatal at startup.
    pub fn exit_code(&self) -> Option<i32> {
        match self {
            Error::ConfigInvalid(_) => Some(1),
            Error::InvalidToken(_) | Error::ExpiredToken | Error::UnknownKey { .. } => Some(2),
            Error::PermissionDenied { .. } | Error::TenantUnknown { .. } => Some(3),
            _ => None,
        }
    }
}

impl From<std::io::Error> for Error {
    fn from(e: std::io::Error) -> Self {
        Error::Io(std::sync::Arc::new(e))
    }
}

impl From<reqwest::Error> for Error {
    fn from(e: reqwest::Error) -> Self {
        Error::Http(std::sync::Arc::new(e))
    }
}

impl From<serde_json::Error> for Error {
    fn from(e: serde_json::Error) -> Self {
        Error::Json(std::sync::Arc::new(e))
    }
}

pub type Result<T> = std::result::Result<T, Error>;
