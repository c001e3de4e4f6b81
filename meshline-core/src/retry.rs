//! Shared bounded-retry/backoff strategy.
//!
//! Every network operation in this crate — HTTP to the relay, STUN
//! connectivity checks, QUIC dials — goes through [`with_retry`] rather than
//! rolling its own backoff loop.

use std::time::Duration;

use rand::Rng;
use tokio_util::sync::CancellationToken;

use crate::error::Error;

/// Configuration for the exponential backoff schedule.
#[derive(Debug, Clone)]
pub struct RetryPolicy {
    pub max_retries: u32,
    pub base_delay: Duration,
    pub backoff_multiplier: f64,
    pub max_backoff: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_retries: 5,
            base_delay: Duration::from_millis(500),
            backoff_multiplier: 2.0,
            max_backoff: Duration::from_secs(30),
        }
    }
}

/// The outcome of classifying a single error against the policy.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Decision {
    pub should_retry: bool,
}

impl RetryPolicy {
    /// Classify `err` at `attempt` (0-indexed) and compute the next delay.
    ///
    /// `should_retry` is false once `attempt >= max_retries` even for an
    /// otherwise-transient error. Delay uses full jitter: `uniform(0, base *
    /// multiplier^attempt)`, capped at `max_backoff`. A server-provided
    /// `Retry-After` (via [`Error::RateLimited`]) overrides the computed
    /// delay when present.
    pub fn classify(&self, err: &Error, attempt: u32) -> (Decision, Duration) {
        let retryable = is_transient(err);
        let should_retry = retryable && attempt < self.max_retries;

        let delay = if let Error::RateLimited { retry_after: Some(d) } = err {
            *d
        } else {
            let exp = self.backoff_multiplier.powi(attempt as i32);
            let ceiling = (self.base_delay.as_secs_f64() * exp).min(self.max_backoff.as_secs_f64());
            let jittered = rand::thread_rng().gen_range(0.0..=ceiling.max(0.0));
            Duration::from_secs_f64(jittered)
        };

        (Decision { should_retry }, delay)
    }
}

/// Errors classified `Transient` (including the umbrella variant, rate
/// limiting, and the wrapped I/O/HTTP kinds) are retryable; everything else
/// — auth failures, malformed requests, and 4xx other than 408/425/429 — is
/// terminal.
fn is_transient(err: &Error) -> bool {
    matches!(
        err,
        Error::Transient(_) | Error::RateLimited { .. } | Error::Io(_) | Error::Http(_) | Error::Quic(_)
    )
}

/// Run `op` under the retry policy, sleeping between attempts.
///
/// `cancel` is polled at every sleep point so `stop()` can unwind a loop
/// stuck in backoff without waiting out the remaining delay.
pub async fn with_retry<T, F, Fut>(
    policy: &RetryPolicy,
    cancel: &CancellationToken,
    mut op: F,
) -> Result<T, Error>
where
    F: FnMut() -> Fut,
    Fut: std::future::Future<Output = Result<T, Error>>,
{
    let mut attempt = 0u32;
    loop {
        match op().await {
            Ok(v) => return Ok(v),
            Err(err) => {
                crate::metrics::global().inc_error(err.kind());
                let (decision, delay) = policy.classify(&err, attempt);
                if !decision.should_retry {
                    return Err(err);
                }
                tracing::warn!(
                    kind = err.kind(),
                    attempt,
                    delay_ms = delay.as_millis() as u64,
                    "operation failed, retrying"
                );
                tokio::select! {
                    _ = tokio::time::sleep(delay) => {}
                    _ = cancel.cancelled() => return Err(err),
                }
                attempt += 1;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn policy() -> RetryPolicy {
        RetryPolicy {
            max_retries: 3,
            base_delay: Duration::from_millis(100),
            backoff_multiplier: 2.0,
            max_backoff: Duration::from_secs(5),
        }
    }

    #[test]
    fn terminal_errors_never_retry() {
        let p = policy();
        for err in [
            Error::InvalidToken("bad sig".into()),
            Error::ExpiredToken,
            Error::PermissionDenied { permission: "mesh.connect".into(), code: None },
            Error::TenantUnknown { tenant_id: "t-1".into(), code: None },
            Error::ConfigInvalid("missing tenant_id".into()),
            Error::ClaimsMalformed("bad aud".into()),
            Error::UnknownKey { kid: "k1".into() },
        ] {
            let (decision, _) = p.classify(&err, 0);
            assert!(!decision.should_retry, "{err:?} should not retry");
        }
    }

    #[test]
    fn transient_errors_retry_until_max() {
        let p = policy();
        for attempt in 0..p.max_retries {
            let (decision, _) = p.classify(&Error::Transient("dns blip".into()), attempt);
            assert!(decision.should_retry, "attempt {attempt} should retry");
        }
        let (decision, _) = p.classify(&Error::Transient("dns blip".into()), p.max_retries);
        assert!(!decision.should_retry, "exceeding max_retries must stop");
    }

    #[test]
    fn rate_limited_honours_retry_after() {
        let p = policy();
        let err = Error::RateLimited { retry_after: Some(Duration::from_secs(2)) };
        let (decision, delay) = p.classify(&err, 0);
        assert!(decision.should_retry);
        assert_eq!(delay, Duration::from_secs(2));
    }

    #[test]
    fn jitter_is_bounded_by_backoff_ceiling() {
        let p = policy();
        for attempt in 0..p.max_retries {
            let ceiling = (p.base_delay.as_secs_f64() * p.backoff_multiplier.powi(attempt as i32))
                .min(p.max_backoff.as_secs_f64());
            for _ in 0..20 {
                let (_, delay) = p.classify(&Error::Transient("x".into()), attempt);
                assert!(delay.as_secs_f64() <= ceiling + f64::EPSILON);
                assert!(delay.as_secs_f64() >= 0.0);
            }
        }
    }
}
