//! Mesh router: topology, next-hop selection, and peer health.
//!
//! Routes are never mutated in place: [`MeshRouter::optimal_route`]
//! recomputes the full ordered next-hop list from the current snapshot on
//! every call, so a disconnected next hop is never handed back twice and
//! route preemption falls out of the recompute rather than
//! needing its own invalidation path.

use std::collections::HashMap;
use std::sync::RwLock;
use std::time::{Duration, Instant};

use serde::{Deserialize, Serialize};

use crate::relay_client::PeerRecord;

/// Peers are marked stale after this long without a `last_seen` update.
pub const STALE_AFTER: Duration = Duration::from_secs(5 * 60);
pub const DEFAULT_TOPOLOGY_INTERVAL: Duration = Duration::from_secs(30);
pub const DEFAULT_ROUTE_RECOMPUTE_INTERVAL: Duration = Duration::from_secs(60);

/// Routing policy. `Hybrid` is the default.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum RoutingPolicy {
    /// Only directly-connected next hops; no relay fallback.
    Direct,
    /// Always route via the relay peer, regardless of direct reachability.
    Relay,
    /// Prefer direct if reachable and within the configured latency bound,
    /// otherwise fall back to the relay.
    #[default]
    Hybrid,
}

/// The router's view of one peer.
#[derive(Debug, Clone)]
struct RouterPeer {
    is_connected: bool,
    /// True once a direct QUIC session exists; false for relay-assisted or
    /// merely-discovered peers.
    is_direct: bool,
    latency_ms: Option<f64>,
    last_seen: Instant,
}

impl RouterPeer {
    fn is_stale(&self) -> bool {
        self.last_seen.elapsed() > STALE_AFTER
    }
}

/// Aggregate counts returned by [`MeshRouter::stats`].
#[derive(Debug, Clone, Copy, Default)]
pub struct RouterStats {
    pub connected_peers: usize,
    pub discovered_peers: usize,
    pub stale_peers: usize,
}

/// Maintains the topology and selects next hops per the configured policy.
pub struct MeshRouter {
    policy: RwLock<RoutingPolicy>,
    relay_peer_id: String,
    max_direct_latency_ms: f64,
    peers: RwLock<HashMap<String, RouterPeer>>,
}

impl MeshRouter {
    pub fn new(policy: RoutingPolicy, relay_peer_id: impl Into<String>, max_direct_latency_ms: f64) -> Self {
        Self {
            policy: RwLock::new(policy),
            relay_peer_id: relay_peer_id.into(),
            max_direct_latency_ms,
            peers: RwLock::new(HashMap::new()),
        }
    }

    pub fn policy(&self) -> RoutingPolicy {
        *self.policy.read().unwrap()
    }

    /// Change the routing policy for future route computations without
    /// disturbing the topology itself.
    pub fn set_policy(&self, policy: RoutingPolicy) {
        *self.policy.write().unwrap() = policy;
    }

    pub fn add_peer(&self, peer_id: &str, is_connected: bool, is_direct: bool, latency_ms: Option<f64>) {
        self.peers
            .write()
            .unwrap()
            .insert(peer_id.to_string(), RouterPeer { is_connected, is_direct, latency_ms, last_seen: Instant::now() });
    }

    pub fn remove_peer(&self, peer_id: &str) {
        self.peers.write().unwrap().remove(peer_id);
    }

    pub fn mark_seen(&self, peer_id: &str) {
        if let Some(p) = self.peers.write().unwrap().get_mut(peer_id) {
            p.last_seen = Instant::now();
        }
    }

    /// Fold freshly-discovered peer records into the topology. Existing
    /// connection state for a peer already known as directly connected is
    /// preserved; discovery only refreshes liveness and latency.
    pub fn reconcile_discovered(&self, records: &[PeerRecord]) {
        let mut peers = self.peers.write().unwrap();
        for record in records {
            let entry = peers.entry(record.peer_id.clone()).or_insert_with(|| RouterPeer {
                is_connected: false,
                is_direct: false,
                latency_ms: record.latency_ms,
                last_seen: Instant::now(),
            });
            if !entry.is_direct {
                entry.is_connected = record.is_online;
            }
            entry.latency_ms = record.latency_ms.or(entry.latency_ms);
            entry.last_seen = Instant::now();
        }
    }

    /// Evict entries untouched for longer than `ttl`.
    pub fn evict_expired(&self, ttl: Duration) {
        self.peers.write().unwrap().retain(|_, p| p.last_seen.elapsed() < ttl);
    }

    /// Recompute the ordered next-hop list to `dest`. Empty means no
    /// route is currently available under the active policy.
    pub fn optimal_route(&self, dest: &str) -> Vec<String> {
        let peers = self.peers.read().unwrap();
        let policy = self.policy();
        let direct_reachable = |id: &str| {
            peers
                .get(id)
                .map(|p| p.is_connected && p.is_direct && p.latency_ms.map(|l| l <= self.max_direct_latency_ms).unwrap_or(true))
                .unwrap_or(false)
        };
        let relay_reachable = peers.get(&self.relay_peer_id).map(|p| p.is_connected).unwrap_or(false);

        match policy {
            RoutingPolicy::Direct => {
                if direct_reachable(dest) {
                    vec![dest.to_string()]
                } else {
                    Vec::new()
                }
            }
            RoutingPolicy::Relay => {
                if relay_reachable {
                    vec![self.relay_peer_id.clone()]
                } else {
                    Vec::new()
                }
            }
            RoutingPolicy::Hybrid => {
                if direct_reachable(dest) {
                    vec![dest.to_string()]
                } else if relay_reachable {
                    vec![self.relay_peer_id.clone()]
                } else {
                    Vec::new()
                }
            }
        }
    }

    pub fn route_latency(&self, dest: &str) -> Option<f64> {
        let route = self.optimal_route(dest);
        let hop = route.first()?;
        self.peers.read().unwrap().get(hop).and_then(|p| p.latency_ms)
    }

    pub fn stats(&self) -> RouterStats {
        let peers = self.peers.read().unwrap();
        RouterStats {
            connected_peers: peers.values().filter(|p| p.is_connected && p.is_direct).count(),
            discovered_peers: peers.len(),
            stale_peers: peers.values().filter(|p| p.is_stale()).count(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn direct_policy_has_no_fallback() {
        let router = MeshRouter::new(RoutingPolicy::Direct, "relay", 150.0);
        router.add_peer("relay", true, false, None);
        assert!(router.optimal_route("peer-a").is_empty());
    }

    #[test]
    fn hybrid_prefers_direct_then_falls_back_to_relay() {
        let router = MeshRouter::new(RoutingPolicy::Hybrid, "relay", 150.0);
        router.add_peer("relay", true, false, None);
        router.add_peer("peer-a", true, true, Some(20.0));
        assert_eq!(router.optimal_route("peer-a"), vec!["peer-a".to_string()]);

        router.add_peer("peer-a", false, true, None);
        assert_eq!(router.optimal_route("peer-a"), vec!["relay".to_string()]);
    }

    #[test]
    fn hybrid_falls_back_when_direct_latency_exceeds_bound() {
        let router = MeshRouter::new(RoutingPolicy::Hybrid, "relay", 50.0);
        router.add_peer("relay", true, false, None);
        router.add_peer("peer-a", true, true, Some(500.0));
        assert_eq!(router.optimal_route("peer-a"), vec!["relay".to_string()]);
    }

    #[test]
    fn route_preemption_drops_disconnected_next_hop() {
        let router = MeshRouter::new(RoutingPolicy::Direct, "relay", 150.0);
        router.add_peer("peer-a", true, true, Some(10.0));
        assert_eq!(router.optimal_route("peer-a"), vec!["peer-a".to_string()]);
        router.remove_peer("peer-a");
        assert!(router.optimal_route("peer-a").is_empty());
    }

    #[test]
    fn stats_count_stale_peers() {
        let router = MeshRouter::new(RoutingPolicy::Hybrid, "relay", 150.0);
        router.add_peer("peer-a", true, true, None);
        {
            let mut peers = router.peers.write().unwrap();
            peers.get_mut("peer-a").unwrap().last_seen = Instant::now() - STALE_AFTER - Duration::from_secs(1);
        }
        let stats = router.stats();
        assert_eq!(stats.stale_peers, 1);
        assert_eq!(stats.discovered_peers, 1);
    }
}
