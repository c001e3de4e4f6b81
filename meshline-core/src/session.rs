//! Session manager — the orchestration core — and the control surface it
//! exposes to embedders and the CLI as [`SessionHandle`].
//!
//! This is the only component that turns a component-level [`Error`] into a
//! lifecycle decision: retry, fallback, degrade, or shut down. Every
//! other component surfaces typed results and lets this one decide.

use std::future::Future;
use std::pin::Pin;
use std::sync::atomic::{AtomicU32, AtomicU64, Ordering};
use std::sync::{Arc, RwLock};
use std::time::{Duration, Instant};

use dashmap::DashMap;
use tokio::sync::Mutex as AsyncMutex;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use crate::auth::{Authenticator, ConnectionType};
use crate::config::Config;
use crate::error::{Error, Result};
use crate::ice::{Candidate, IceAgent};
use crate::mesh_router::{MeshRouter, RoutingPolicy};
use crate::metrics::TransportMode;
use crate::quic::{QuicTlsConfig, QuicTransport};
use crate::relay_client::{PeerRecord, RelayClient, RelayClientConfig};

/// Stable id this crate uses for the relay itself as a routing next hop.
const RELAY_PEER_ID: &str = "__relay__";
/// Permission a `p2p-mesh` token must carry to start a session.
pub const MESH_CONNECT_PERMISSION: &str = "mesh.connect";
/// Consecutive heartbeat failures before `Running -> Degraded`.
const DEGRADED_AFTER_FAILURES: u32 = 3;
/// How long a gathered local candidate set is reused before re-gathering.
const CANDIDATE_REUSE_WINDOW: Duration = Duration::from_secs(30);
/// Deadline for polling remote ICE candidates.
const ICE_SIGNAL_POLL_TIMEOUT: Duration = Duration::from_secs(15);

/// Session lifecycle state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    Init,
    Authenticating,
    Registering,
    Running,
    Degraded,
    Closing,
    Closed,
}

/// Snapshot returned by [`SessionHandle::status`].
#[derive(Debug, Clone)]
pub struct StatusSnapshot {
    pub state: SessionState,
    pub is_connected: bool,
    pub connection_type: Option<ConnectionType>,
    pub peer_id: Option<String>,
    pub relay_session_id: Option<String>,
    pub active_connections: i64,
    pub routing_policy: RoutingPolicy,
    pub connected_peers: usize,
    pub discovered_peers: usize,
    pub last_error: Option<String>,
}

struct CachedCandidates {
    gathered_at: Instant,
    candidates: Vec<Candidate>,
}

/// Everything the session manager exclusively owns.
struct Inner {
    config: Config,
    token: String,
    authenticator: Arc<Authenticator>,
    relay: Arc<RelayClient>,
    quic: Arc<QuicTransport>,
    quic_tls: QuicTlsConfig,
    router: Arc<MeshRouter>,
    cancel: CancellationToken,

    state: RwLock<SessionState>,
    connection_type: ConnectionType,
    peer_id: RwLock<Option<String>>,
    relay_session_id: RwLock<Option<String>>,
    last_error: RwLock<Option<String>>,
    peer_table: DashMap<String, PeerRecord>,
    heartbeat_failure_streak: AtomicU32,

    local_candidates: DashMap<String, CachedCandidates>,
    connect_guards: DashMap<String, Arc<AsyncMutex<()>>>,
    session_counter: AtomicU64,

    tasks: std::sync::Mutex<Vec<JoinHandle<()>>>,
}

impl Inner {
    fn set_state(&self, state: SessionState) {
        let mut guard = self.state.write().unwrap();
        if *guard != state {
            tracing::info!(from = ?*guard, to = ?state, "session state transition");
        }
        *guard = state;
    }

    fn state(&self) -> SessionState {
        *self.state.read().unwrap()
    }

    fn set_last_error(&self, err: &Error) {
        crate::metrics::global().inc_error(err.kind());
        *self.last_error.write().unwrap() = Some(err.to_string());
    }
}

/// Orchestrates authentication, relay registration, ICE, and QUIC through
/// one session's lifetime. Constructing one validates the token and brings
/// the session to `Running`/`Degraded`; the resulting [`SessionHandle`] is
/// the public contract.
pub struct SessionManager;

impl SessionManager {
    /// Start a session: authenticate, register, begin heartbeating, and
    /// bring up the QUIC listener. Returns only once the peer is registered,
    /// heartbeat is running, and the listener is up, or a terminal error is
    /// surfaced — in which case any partial registration is unwound.
    pub async fn start(config: Config, token: String) -> Result<SessionHandle> {
        config.validate()?;
        let cancel = CancellationToken::new();

        let authenticator = Arc::new(Authenticator::new(config.auth.clone())?);
        let validated = authenticator.validate(&token).await?;
        if !validated.verified_by.is_verified() {
            return Err(Error::InvalidToken("skip_validation tokens are never accepted by the session manager".into()));
        }
        let claims = validated.claims;
        let tenant_id = claims.extract_tenant_id()?.to_string();
        if tenant_id != config.tenant_id {
            return Err(Error::TenantUnknown { tenant_id, code: None });
        }
        let connection_type = claims.extract_connection_type()?;
        if connection_type == ConnectionType::P2PMesh && !claims.has_permission(MESH_CONNECT_PERMISSION) {
            return Err(Error::PermissionDenied { permission: MESH_CONNECT_PERMISSION.to_string(), code: None });
        }

        let relay = Arc::new(RelayClient::new(
            RelayClientConfig {
                base_url: config.relay_base_url.clone(),
                tenant_id: config.tenant_id.clone(),
                tls: config.tls.clone(),
                retry: config.retry.to_policy(),
            },
            token.clone(),
            cancel.clone(),
        )?);

        let register_resp = relay.register(&config.local_public_key, &config.local_allowed_ips, None).await?;
        let peer_id = register_resp.peer_id;
        let relay_session_id = register_resp.relay_session_id;
        tracing::info!(peer_id, tenant_id = %config.tenant_id, "registered with relay");

        let quic_cert_path = config.quic_cert_path.clone();
        let quic_key_path = config.quic_key_path.clone();
        let quic_tls = match QuicTlsConfig::from_paths(config.tls.tls_insecure, &quic_cert_path, &quic_key_path, config.alpn_bytes()) {
            Ok(tls) => tls,
            Err(err) => {
                let _ = relay.deregister(&peer_id).await;
                return Err(err);
            }
        };

        let quic = Arc::new(QuicTransport::new(config.alpn_bytes()));
        let router = Arc::new(MeshRouter::new(config.routing_policy, RELAY_PEER_ID, config.max_direct_latency_ms));

        let inner = Arc::new(Inner {
            config: config.clone(),
            token,
            authenticator: Arc::clone(&authenticator),
            relay,
            quic: Arc::clone(&quic),
            quic_tls: quic_tls.clone(),
            router,
            cancel: cancel.clone(),
            state: RwLock::new(SessionState::Registering),
            connection_type,
            peer_id: RwLock::new(Some(peer_id.clone())),
            relay_session_id: RwLock::new(Some(relay_session_id.clone())),
            last_error: RwLock::new(None),
            peer_table: DashMap::new(),
            heartbeat_failure_streak: AtomicU32::new(0),
            local_candidates: DashMap::new(),
            connect_guards: DashMap::new(),
            session_counter: AtomicU64::new(0),
            tasks: std::sync::Mutex::new(Vec::new()),
        });

        let listen_validator_auth = Arc::clone(&authenticator);
        let validator: crate::quic::TokenValidator = Arc::new(move |candidate_token: String| {
            let auth = Arc::clone(&listen_validator_auth);
            Box::pin(async move {
                let validated = auth.validate(&candidate_token).await?;
                if !validated.verified_by.is_verified() {
                    return Err(Error::InvalidToken("unverified token presented over quic AUTH".into()));
                }
                Ok(())
            }) as Pin<Box<dyn Future<Output = Result<()>> + Send>>
        });

        if let Err(err) = quic.listen(config.quic_listen_addr, quic_tls, validator, cancel.clone()) {
            let _ = inner.relay.deregister(&peer_id).await;
            return Err(err);
        }

        let first_heartbeat = inner.relay.heartbeat(&peer_id, "active", &relay_session_id).await;
        if let Err(err) = first_heartbeat {
            let _ = inner.relay.deregister(&peer_id).await;
            return Err(err);
        }

        let ice_ready = if config.routing_policy == RoutingPolicy::Relay {
            true
        } else {
            let mut probe = IceAgent::new();
            probe.start(&config.stun_servers, &config.turn_servers).await.is_ok()
        };
        inner.set_state(if ice_ready { SessionState::Running } else { SessionState::Degraded });
        crate::metrics::global().set_transport_mode(if ice_ready { TransportMode::Quic } else { TransportMode::Fallback });
        crate::metrics::global().set_p2p_sessions(1);

        spawn_heartbeat_loop(Arc::clone(&inner));
        spawn_discovery_loop(Arc::clone(&inner));
        if let Some(push) = &config.metrics_push {
            let push_config = push.to_push_config();
            let push_cancel = cancel.clone();
            let http = reqwest::Client::new();
            let handle = tokio::spawn(crate::metrics::run_push_loop(push_config, push_cancel, http));
            inner.tasks.lock().unwrap().push(handle);
        }

        Ok(SessionHandle { inner })
    }
}

fn spawn_heartbeat_loop(inner: Arc<Inner>) {
    let task_inner = Arc::clone(&inner);
    let handle = tokio::spawn(async move {
        let inner = task_inner;
        let mut ticker = tokio::time::interval(inner.config.heartbeat_interval());
        ticker.tick().await; // first tick fires immediately; the initial heartbeat already ran in start()
        loop {
            tokio::select! {
                _ = ticker.tick() => {}
                _ = inner.cancel.cancelled() => return,
            }

            let peer_id = inner.peer_id.read().unwrap().clone();
            let relay_session_id = inner.relay_session_id.read().unwrap().clone();
            let (Some(peer_id), Some(relay_session_id)) = (peer_id, relay_session_id) else { continue };

            match inner.relay.heartbeat(&peer_id, "active", &relay_session_id).await {
                Ok(_) => {
                    inner.heartbeat_failure_streak.store(0, Ordering::SeqCst);
                    if inner.state() == SessionState::Degraded {
                        inner.set_state(SessionState::Running);
                    }
                }
                Err(Error::InvalidToken(_)) | Err(Error::ExpiredToken) => {
                    inner.set_last_error(&Error::ExpiredToken);
                    inner.set_state(SessionState::Closing);
                    inner.cancel.cancel();
                    return;
                }
                Err(err @ Error::TenantUnknown { .. }) => {
                    inner.set_last_error(&err);
                    inner.set_state(SessionState::Closing);
                    inner.cancel.cancel();
                    return;
                }
                Err(err) => {
                    inner.set_last_error(&err);
                    let streak = inner.heartbeat_failure_streak.fetch_add(1, Ordering::SeqCst) + 1;
                    if streak >= DEGRADED_AFTER_FAILURES && inner.state() == SessionState::Running {
                        inner.set_state(SessionState::Degraded);
                    }
                }
            }
        }
    });
    inner.tasks.lock().unwrap().push(handle);
}

fn spawn_discovery_loop(inner: Arc<Inner>) {
    let task_inner = Arc::clone(&inner);
    let handle = tokio::spawn(async move {
        let inner = task_inner;
        let mut ticker = tokio::time::interval(inner.config.discovery_interval());
        loop {
            tokio::select! {
                _ = ticker.tick() => {}
                _ = inner.cancel.cancelled() => return,
            }
            match inner.relay.discover().await {
                Ok(records) => {
                    inner.router.reconcile_discovered(&records);
                    for record in records {
                        inner.peer_table.insert(record.peer_id.clone(), record);
                    }
                    inner.router.evict_expired(inner.config.discovery_ttl());
                    let ttl = chrono::Duration::from_std(inner.config.discovery_ttl()).unwrap_or(chrono::Duration::zero());
                    let now = chrono::Utc::now();
                    inner.peer_table.retain(|_, r| now.signed_duration_since(r.last_seen) < ttl);
                }
                Err(err) => inner.set_last_error(&err),
            }
        }
    });
    inner.tasks.lock().unwrap().push(handle);
}

/// The public contract: start/stop, status snapshots, and per-peer
/// connect. Cheap to clone — every clone shares the same
/// underlying session.
#[derive(Clone)]
pub struct SessionHandle {
    inner: Arc<Inner>,
}

impl SessionHandle {
    /// Idempotent; cancels all background tasks, closes QUIC connections,
    /// issues a best-effort deregister, and frees resources. Returns within
    /// the configured shutdown deadline even if the relay is unreachable.
    pub async fn stop(&self) {
        if self.inner.state() == SessionState::Closed {
            return;
        }
        self.inner.set_state(SessionState::Closing);
        self.inner.cancel.cancel();

        let deadline = self.inner.config.shutdown_deadline();
        let shutdown = async {
            self.inner.quic.close().await;

            if let Some(peer_id) = self.inner.peer_id.read().unwrap().clone() {
                let dereg = tokio::time::timeout(self.inner.config.deregister_deadline(), self.inner.relay.deregister(&peer_id)).await;
                if dereg.is_err() {
                    tracing::warn!(peer_id, "deregister did not complete within its deadline");
                }
            }

            let handles: Vec<_> = self.inner.tasks.lock().unwrap().drain(..).collect();
            for handle in handles {
                handle.abort();
            }
        };

        if tokio::time::timeout(deadline, shutdown).await.is_err() {
            tracing::warn!("shutdown deadline exceeded; remaining tasks forcibly dropped");
        }
        self.inner.set_state(SessionState::Closed);
        crate::metrics::global().set_p2p_sessions(0);
    }

    pub fn status(&self) -> StatusSnapshot {
        let router_stats = self.inner.router.stats();
        StatusSnapshot {
            state: self.inner.state(),
            is_connected: matches!(self.inner.state(), SessionState::Running | SessionState::Degraded),
            connection_type: Some(self.inner.connection_type),
            peer_id: self.inner.peer_id.read().unwrap().clone(),
            relay_session_id: self.inner.relay_session_id.read().unwrap().clone(),
            active_connections: crate::metrics::global().active_connections(),
            routing_policy: self.inner.router.policy(),
            connected_peers: router_stats.connected_peers,
            discovered_peers: router_stats.discovered_peers,
            last_error: self.inner.last_error.read().unwrap().clone(),
        }
    }

    /// Change the routing policy at runtime.
    pub fn set_routing_policy(&self, policy: RoutingPolicy) {
        self.inner.router.set_policy(policy);
    }

    /// Idempotent; concurrent calls for the same `target` coalesce onto one
    /// attempt.
    pub async fn connect_to_peer(&self, target_peer_id: &str) -> Result<()> {
        let guard = self
            .inner
            .connect_guards
            .entry(target_peer_id.to_string())
            .or_insert_with(|| Arc::new(AsyncMutex::new(())))
            .clone();
        let _permit = guard.lock().await;
        self.connect_to_peer_locked(target_peer_id).await
    }

    async fn connect_to_peer_locked(&self, target_peer_id: &str) -> Result<()> {
        let inner = &self.inner;
        crate::metrics::global().inc_peer_connect_attempts();
        let started = Instant::now();

        let peer_id = inner.peer_id.read().unwrap().clone().ok_or_else(|| Error::ConfigInvalid("session has no peer_id".into()))?;

        // Step 1: gather local candidates, reusing a recent set.
        let reuse = inner
            .local_candidates
            .get(target_peer_id)
            .map(|c| c.gathered_at.elapsed() < CANDIDATE_REUSE_WINDOW)
            .unwrap_or(false);
        if !reuse {
            let gather_started = Instant::now();
            let mut agent = IceAgent::new();
            let candidates = agent.start(&inner.config.stun_servers, &inner.config.turn_servers).await?;
            let candidates = candidates.to_vec();
            crate::metrics::global().observe_ice_gathering_duration(gather_started.elapsed());
            inner.local_candidates.insert(target_peer_id.to_string(), CachedCandidates { gathered_at: Instant::now(), candidates });
        }
        let local_candidates = inner.local_candidates.get(target_peer_id).map(|c| c.candidates.clone()).unwrap_or_default();

        // Step 2: POST local candidates under a session id unique to this attempt.
        let session_id = format!(
            "{peer_id}:{target_peer_id}:{}",
            inner.session_counter.fetch_add(1, Ordering::SeqCst)
        );
        let encoded: Vec<String> = local_candidates.iter().map(Candidate::encode).collect();
        inner.relay.ice_signal_send(&peer_id, &session_id, &encoded).await?;

        // Step 3: poll for remote candidates with backoff up to the deadline.
        let remote_lines = inner
            .relay
            .ice_signal_fetch_until(&peer_id, &session_id, target_peer_id, ICE_SIGNAL_POLL_TIMEOUT)
            .await?;

        // Step 4: run connectivity checks over the gathered local set against
        // the polled remote set.
        let selected = self.run_ice_checks(&local_candidates, &remote_lines).await?;

        match selected {
            Some(pair) => {
                let addr = pair.remote.socket_addr();
                match inner.quic.dial(addr, target_peer_id, &inner.quic_tls, &inner.token).await {
                    Ok(_conn) => {
                        inner.router.add_peer(target_peer_id, true, true, None);
                        crate::metrics::global().observe_peer_connect_latency(started.elapsed());
                        crate::metrics::global().set_transport_mode(TransportMode::Quic);
                        Ok(())
                    }
                    Err(err) if inner.router.policy() != RoutingPolicy::Direct => {
                        self.fallback_to_relay(target_peer_id).await?;
                        tracing::warn!(target_peer_id, error = %err, "direct quic dial failed, falling back to relay");
                        Ok(())
                    }
                    Err(err) => Err(err),
                }
            }
            None if inner.router.policy() != RoutingPolicy::Direct => {
                self.fallback_to_relay(target_peer_id).await?;
                Ok(())
            }
            None => Err(Error::IceFailed(format!("no connectivity to {target_peer_id} and policy is direct-only"))),
        }
    }

    async fn run_ice_checks(&self, local_candidates: &[Candidate], remote_lines: &[String]) -> Result<Option<crate::ice::SelectedPair>> {
        let mut agent = IceAgent::new();
        agent.set_local_candidates(local_candidates.to_vec());
        for line in remote_lines {
            if let Ok(remote) = Candidate::parse(line) {
                agent.add_remote_candidate(remote);
            }
        }
        agent.run_checks(&self.inner.config.retry.to_policy()).await
    }

    /// Dial the relay's QUIC endpoint (reusing an already-open connection if
    /// one exists) and open a stream named `tunnel_id` on it. This is the
    /// `client-server` connection type's single data channel — the caller is
    /// responsible for servicing it (the session manager only authenticates
    /// and opens it, per this crate's scope).
    pub async fn open_relay_tunnel(&self, tunnel_id: &str) -> Result<Arc<crate::quic::QuicConnection>> {
        let inner = &self.inner;
        let relay_addr = inner
            .config
            .relay_quic_addr
            .ok_or_else(|| Error::ConfigInvalid("relay_quic_addr is required for a client-server tunnel".into()))?;
        let conn = match inner.quic.connection(relay_addr) {
            Some(conn) => conn,
            None => inner.quic.dial(relay_addr, "relay", &inner.quic_tls, &inner.token).await?,
        };
        conn.open_stream(tunnel_id).await?;
        Ok(conn)
    }

    /// Open a relay-multiplexed QUIC stream to `target_peer_id` instead of a
    /// direct session.
    async fn fallback_to_relay(&self, target_peer_id: &str) -> Result<()> {
        let relay_addr = self
            .inner
            .config
            .relay_quic_addr
            .ok_or_else(|| Error::ConfigInvalid("relay_quic_addr is required for relay-assisted fallback".into()))?;
        let conn = self.inner.quic.dial(relay_addr, "relay", &self.inner.quic_tls, &self.inner.token).await?;
        conn.open_stream(target_peer_id).await?;
        self.inner.router.add_peer(target_peer_id, true, false, None);
        crate::metrics::global().set_transport_mode(TransportMode::Fallback);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn degraded_threshold_matches_spec() {
        assert_eq!(DEGRADED_AFTER_FAILURES, 3);
    }
}
