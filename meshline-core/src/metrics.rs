//! Process-wide metrics registry.
//!
//! Every component records through [`global`] rather than threading a
//! metrics handle through every call site — this is the one piece of
//! module-level mutable state this crate allows. Counters and gauges
//! are plain atomics; histograms keep a small set of cumulative buckets
//! matching the Prometheus exposition format. An optional background task
//! pushes a text-exposition snapshot to a pushgateway-style endpoint.

use std::collections::HashMap;
use std::sync::atomic::{AtomicI64, AtomicU64, Ordering};
use std::sync::{Arc, OnceLock, RwLock};
use std::time::Duration;

use rand::Rng;

const LATENCY_BUCKETS_MS: &[f64] = &[5.0, 10.0, 25.0, 50.0, 100.0, 250.0, 500.0, 1000.0, 5000.0, 15000.0, 30000.0];

/// A monotonic counter, optionally labelled (e.g. `errors_total{kind=...}`).
#[derive(Default)]
struct Counter {
    value: AtomicU64,
}

impl Counter {
    fn inc(&self) {
        self.value.fetch_add(1, Ordering::Relaxed);
    }

    fn get(&self) -> u64 {
        self.value.load(Ordering::Relaxed)
    }
}

/// A point-in-time gauge.
#[derive(Default)]
struct Gauge {
    value: AtomicI64,
}

impl Gauge {
    fn set(&self, v: i64) {
        self.value.store(v, Ordering::Relaxed);
    }

    fn add(&self, delta: i64) {
        self.value.fetch_add(delta, Ordering::Relaxed);
    }

    fn get(&self) -> i64 {
        self.value.load(Ordering::Relaxed)
    }
}

/// A cumulative histogram over [`LATENCY_BUCKETS_MS`].
struct Histogram {
    buckets: Vec<AtomicU64>,
    sum_ms: AtomicU64,
    count: AtomicU64,
}

impl Default for Histogram {
    fn default() -> Self {
        Self {
            buckets: (0..=LATENCY_BUCKETS_MS.len()).map(|_| AtomicU64::new(0)).collect(),
            sum_ms: AtomicU64::new(0),
            count: AtomicU64::new(0),
        }
    }
}

impl Histogram {
    fn observe(&self, value_ms: f64) {
        let idx = LATENCY_BUCKETS_MS
            .iter()
            .position(|b| value_ms <= *b)
            .unwrap_or(LATENCY_BUCKETS_MS.len());
        for bucket in &self.buckets[idx..] {
            bucket.fetch_add(1, Ordering::Relaxed);
        }
        self.sum_ms.fetch_add(value_ms as u64, Ordering::Relaxed);
        self.count.fetch_add(1, Ordering::Relaxed);
    }

    fn render(&self, name: &str, out: &mut String) {
        let mut cumulative = 0u64;
        for (bucket, le) in self.buckets.iter().zip(LATENCY_BUCKETS_MS.iter()) {
            cumulative = bucket.load(Ordering::Relaxed);
            out.push_str(&format!("{name}_bucket{{le=\"{le}\"}} {cumulative}\n"));
        }
        let total = self.count.load(Ordering::Relaxed);
        out.push_str(&format!("{name}_bucket{{le=\"+Inf\"}} {}\n", total.max(cumulative)));
        out.push_str(&format!("{name}_sum {}\n", self.sum_ms.load(Ordering::Relaxed)));
        out.push_str(&format!("{name}_count {total}\n"));
    }
}

/// The metrics sink. A single instance lives behind the
/// process-wide registry returned by [`global`].
pub struct Metrics {
    client_bytes_sent: Counter,
    client_bytes_recv: Counter,
    heartbeats_sent: Counter,
    heartbeat_failures: Counter,
    register_attempts: Counter,
    peer_connect_attempts: Counter,
    errors_total: RwLock<HashMap<&'static str, Arc<Counter>>>,

    p2p_sessions: Gauge,
    active_connections: Gauge,
    transport_mode: Gauge,

    heartbeat_latency: Histogram,
    peer_connect_latency: Histogram,
    ice_gathering_duration: Histogram,
}

/// `transport_mode` gauge values.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransportMode {
    Quic = 0,
    Fallback = 1,
    ControlPlane = 2,
}

impl Default for Metrics {
    fn default() -> Self {
        Self {
            client_bytes_sent: Counter::default(),
            client_bytes_recv: Counter::default(),
            heartbeats_sent: Counter::default(),
            heartbeat_failures: Counter::default(),
            register_attempts: Counter::default(),
            peer_connect_attempts: Counter::default(),
            errors_total: RwLock::new(HashMap::new()),
            p2p_sessions: Gauge::default(),
            active_connections: Gauge::default(),
            transport_mode: Gauge::default(),
            heartbeat_latency: Histogram::default(),
            peer_connect_latency: Histogram::default(),
            ice_gathering_duration: Histogram::default(),
        }
    }
}

impl Metrics {
    pub fn add_bytes_sent(&self, n: u64) {
        self.client_bytes_sent.value.fetch_add(n, Ordering::Relaxed);
    }

    pub fn add_bytes_recv(&self, n: u64) {
        self.client_bytes_recv.value.fetch_add(n, Ordering::Relaxed);
    }

    pub fn inc_heartbeats_sent(&self) {
        self.heartbeats_sent.inc();
    }

    pub fn inc_heartbeat_failures(&self) {
        self.heartbeat_failures.inc();
    }

    pub fn inc_register_attempts(&self) {
        self.register_attempts.inc();
    }

    pub fn inc_peer_connect_attempts(&self) {
        self.peer_connect_attempts.inc();
    }

    /// Record an `errors_total{kind=...}` observation. Idempotent registration:
    /// the label's counter is created lazily on first use.
    pub fn inc_error(&self, kind: &'static str) {
        if let Some(counter) = self.errors_total.read().unwrap().get(kind) {
            counter.inc();
            return;
        }
        let mut map = self.errors_total.write().unwrap();
        map.entry(kind).or_insert_with(|| Arc::new(Counter::default())).inc();
    }

    pub fn set_p2p_sessions(&self, n: i64) {
        self.p2p_sessions.set(n);
    }

    pub fn inc_active_connections(&self) {
        self.active_connections.add(1);
    }

    pub fn dec_active_connections(&self) {
        self.active_connections.add(-1);
    }

    pub fn active_connections(&self) -> i64 {
        self.active_connections.get()
    }

    pub fn set_transport_mode(&self, mode: TransportMode) {
        self.transport_mode.set(mode as i64);
    }

    pub fn observe_heartbeat_latency(&self, d: Duration) {
        self.heartbeat_latency.observe(d.as_secs_f64() * 1000.0);
    }

    pub fn observe_peer_connect_latency(&self, d: Duration) {
        self.peer_connect_latency.observe(d.as_secs_f64() * 1000.0);
    }

    pub fn observe_ice_gathering_duration(&self, d: Duration) {
        self.ice_gathering_duration.observe(d.as_secs_f64() * 1000.0);
    }

    /// Render the registry in Prometheus text exposition format.
    pub fn render(&self) -> String {
        let mut out = String::new();
        out.push_str(&format!("client_bytes_sent {}\n", self.client_bytes_sent.get()));
        out.push_str(&format!("client_bytes_recv {}\n", self.client_bytes_recv.get()));
        out.push_str(&format!("heartbeats_sent {}\n", self.heartbeats_sent.get()));
        out.push_str(&format!("heartbeat_failures {}\n", self.heartbeat_failures.get()));
        out.push_str(&format!("register_attempts {}\n", self.register_attempts.get()));
        out.push_str(&format!("peer_connect_attempts {}\n", self.peer_connect_attempts.get()));
        for (kind, counter) in self.errors_total.read().unwrap().iter() {
            out.push_str(&format!("errors_total{{kind=\"{kind}\"}} {}\n", counter.get()));
        }
        out.push_str(&format!("p2p_sessions {}\n", self.p2p_sessions.get()));
        out.push_str(&format!("active_connections {}\n", self.active_connections.get()));
        out.push_str(&format!("transport_mode {}\n", self.transport_mode.get()));
        self.heartbeat_latency.render("heartbeat_latency", &mut out);
        self.peer_connect_latency.render("peer_connect_latency", &mut out);
        self.ice_gathering_duration.render("ice_gathering_duration", &mut out);
        out
    }
}

static REGISTRY: OnceLock<Metrics> = OnceLock::new();

/// The process-wide metrics registry. Registration is idempotent: the first
/// caller initialises it, every later caller observes the same instance.
pub fn global() -> &'static Metrics {
    REGISTRY.get_or_init(Metrics::default)
}

/// Configuration for the optional pushgateway-style push loop.
#[derive(Debug, Clone)]
pub struct PushConfig {
    pub endpoint: url::Url,
    pub job: String,
    pub interval: Duration,
}

/// Push the current registry snapshot to `config.endpoint` on a fixed
/// interval until `cancel` fires. Each push attempt gets its own bounded
/// exponential backoff of up to 3 attempts per window — a failed
/// window is logged and dropped rather than retried into the next tick.
pub async fn run_push_loop(config: PushConfig, cancel: tokio_util::sync::CancellationToken, client: reqwest::Client) {
    let mut ticker = tokio::time::interval(config.interval);
    loop {
        tokio::select! {
            _ = ticker.tick() => {}
            _ = cancel.cancelled() => return,
        }
        push_once(&config, &client).await;
    }
}

async fn push_once(config: &PushConfig, client: &reqwest::Client) {
    let body = global().render();
    let mut attempt = 0u32;
    let max_attempts = 3u32;
    let mut delay = Duration::from_millis(200);
    loop {
        let result = client
            .post(config.endpoint.clone())
            .header("content-type", "text/plain; version=0.0.4")
            .body(body.clone())
            .send()
            .await;
        match result {
            Ok(resp) if resp.status().is_success() => return,
            Ok(resp) => {
                tracing::warn!(status = %resp.status(), job = %config.job, "metrics push rejected");
            }
            Err(err) => {
                tracing::warn!(error = %err, job = %config.job, "metrics push failed");
            }
        }
        attempt += 1;
        if attempt >= max_attempts {
            tracing::warn!(job = %config.job, "metrics push window exhausted");
            return;
        }
        let jittered = rand::thread_rng().gen_range(0.0..=delay.as_secs_f64());
        tokio::time::sleep(Duration::from_secs_f64(jittered)).await;
        delay *= 2;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn error_counter_is_idempotent_per_kind() {
        let m = Metrics::default();
        m.inc_error("transient");
        m.inc_error("transient");
        m.inc_error("expired_token");
        let rendered = m.render();
        assert!(rendered.contains("errors_total{kind=\"transient\"} 2"));
        assert!(rendered.contains("errors_total{kind=\"expired_token\"} 1"));
    }

    #[test]
    fn histogram_buckets_are_cumulative() {
        let h = Histogram::default();
        h.observe(7.0);
        h.observe(2000.0);
        let mut out = String::new();
        h.render("x", &mut out);
        assert!(out.contains("x_bucket{le=\"10\"} 1"));
        assert!(out.contains("x_bucket{le=\"5000\"} 2"));
        assert!(out.contains("x_count 2"));
    }

    #[test]
    fn gauge_tracks_active_connections() {
        let m = Metrics::default();
        m.inc_active_connections();
        m.inc_active_connections();
        m.dec_active_connections();
        assert_eq!(m.active_connections(), 1);
    }
}
