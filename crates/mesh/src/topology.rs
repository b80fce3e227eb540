//! Topology optimizer: neighbor gossip, distance learning and rewiring.
//!
//! Each node knows only its own links, its neighbors' links (from single-hop
//! neighbor gossip) and a rough distance to every node whose envelopes it has
//! seen (hop count at receipt). From that it makes two kinds of decisions:
//!
//! - **Rewiring**: trade an edge that closes a triangle for a link to the
//!   most distant known node. The dropped edge is redundant (both ends still
//!   reach each other through the third node); the new one is a probable
//!   long-range shortcut.
//! - **Island discovery**: a saturated node drops a redundant edge and opens
//!   a short discovery window, so that two saturated clusters that never look
//!   for peers can still find each other.
//!
//! Both analyses can disconnect and connect, so they run behind one gate.

use crate::connection::ConnectionManager;
use crate::envelope::{Frame, NeighborAnnouncement};
use crate::error::MeshResult;
use crate::gossip::Fanout;
use crate::peer::{PeerId, RequestKind};
use parking_lot::Mutex;
use std::collections::{HashMap, HashSet};
use std::time::Duration;
use tokio::time::Instant;
use tracing::{debug, info, warn};

/// A peer's connected-peer list as last reported by that peer
#[derive(Debug, Clone)]
pub struct NeighborSnapshot {
    /// Peers the neighbor is connected to
    pub peers: HashSet<PeerId>,
    /// When the announcement arrived
    pub received_at: Instant,
}

/// Last observed distance to a node
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct HopEstimate {
    /// Hop count of the most recent envelope from that node
    pub hop_count: u32,
    /// When it was observed
    pub observed_at: Instant,
}

/// Two of our peers that are also connected to each other
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Triangle {
    /// Peer whose snapshot revealed the shared edge
    pub via: PeerId,
    /// Peer whose edge to us can be dropped
    pub redundant: PeerId,
}

/// Outcome of a rewiring analysis that acted
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RewirePlan {
    /// Peer disconnected
    pub drop: PeerId,
    /// Node chosen as the long-range target
    pub connect: PeerId,
    /// Its hop estimate at decision time
    pub hop_count: u32,
    /// Whether the transport took the connection request
    pub requested: bool,
}

/// Timing knobs for the optimizer
#[derive(Debug, Clone, Copy)]
pub struct OptimizerSettings {
    /// Snapshot freshness window
    pub neighbor_ttl: Duration,
    /// Hop estimate freshness window
    pub hop_estimate_ttl: Duration,
    /// Minimum spacing between rewires
    pub rewire_cooldown: Duration,
    /// Length of the island discovery window
    pub discovery_window: Duration,
}

/// Per-node topology knowledge and control loop
#[derive(Debug)]
pub struct TopologyOptimizer {
    node_id: PeerId,
    settings: OptimizerSettings,
    neighbors: Mutex<HashMap<PeerId, NeighborSnapshot>>,
    hops: Mutex<HashMap<PeerId, HopEstimate>>,
    last_rewire: Mutex<Option<Instant>>,
    /// Serializes rewiring and island analyses
    gate: Mutex<()>,
}

impl TopologyOptimizer {
    /// Create an optimizer for `node_id`
    pub fn new(node_id: PeerId, settings: OptimizerSettings) -> Self {
        Self {
            node_id,
            settings,
            neighbors: Mutex::new(HashMap::new()),
            hops: Mutex::new(HashMap::new()),
            last_rewire: Mutex::new(None),
            gate: Mutex::new(()),
        }
    }

    /// Send our connected-peer list to each direct peer (single hop)
    pub fn gossip_neighbors(&self, fanout: &dyn Fanout) -> MeshResult<usize> {
        let peers = fanout.peers();
        let bytes = Frame::Neighbors(NeighborAnnouncement {
            peers: peers.clone(),
        })
        .encode()?;

        let mut sent = 0;
        for peer_id in &peers {
            match fanout.send(peer_id, bytes.clone()) {
                Ok(()) => sent += 1,
                Err(e) => debug!(peer_id = %peer_id, "Neighbor gossip send failed: {}", e),
            }
        }
        Ok(sent)
    }

    /// Replace `from`'s snapshot with a fresh announcement
    pub fn record_neighbors(&self, from: &str, announcement: NeighborAnnouncement, now: Instant) {
        let peers: HashSet<PeerId> = announcement
            .peers
            .into_iter()
            .filter(|peer| peer != from)
            .collect();
        self.neighbors.lock().insert(
            from.to_string(),
            NeighborSnapshot {
                peers,
                received_at: now,
            },
        );
    }

    /// Drop what we know about a peer's links once it disconnects
    pub fn forget_peer(&self, peer_id: &str) {
        self.neighbors.lock().remove(peer_id);
    }

    /// Learn distance from an envelope seen for the first time.
    ///
    /// The latest observation replaces the previous one, even if larger.
    pub fn observe_envelope(&self, origin: &str, hop_count: u32, now: Instant) {
        if origin == self.node_id {
            return;
        }
        self.hops.lock().insert(
            origin.to_string(),
            HopEstimate {
                hop_count,
                observed_at: now,
            },
        );
    }

    /// Current estimate for `node_id`, ignoring stale entries
    pub fn hop_estimate(&self, node_id: &str, now: Instant) -> Option<u32> {
        self.hops
            .lock()
            .get(node_id)
            .filter(|estimate| self.is_fresh(estimate.observed_at, self.settings.hop_estimate_ttl, now))
            .map(|estimate| estimate.hop_count)
    }

    fn is_fresh(&self, at: Instant, ttl: Duration, now: Instant) -> bool {
        now.saturating_duration_since(at) < ttl
    }

    /// Purge expired snapshots and hop estimates
    pub fn sweep(&self, now: Instant) -> (usize, usize) {
        let neighbor_ttl = self.settings.neighbor_ttl;
        let hop_ttl = self.settings.hop_estimate_ttl;

        let mut neighbors = self.neighbors.lock();
        let before = neighbors.len();
        neighbors.retain(|_, snapshot| now.saturating_duration_since(snapshot.received_at) < neighbor_ttl);
        let neighbors_removed = before - neighbors.len();
        drop(neighbors);

        let mut hops = self.hops.lock();
        let before = hops.len();
        hops.retain(|_, estimate| now.saturating_duration_since(estimate.observed_at) < hop_ttl);
        let hops_removed = before - hops.len();

        (neighbors_removed, hops_removed)
    }

    /// Find two of `my_peers` that are connected to each other
    pub fn find_triangle(&self, my_peers: &[PeerId], now: Instant) -> Option<Triangle> {
        let mine: HashSet<&str> = my_peers.iter().map(String::as_str).collect();
        let neighbors = self.neighbors.lock();

        for via in my_peers {
            let snapshot = match neighbors.get(via) {
                Some(snapshot) if self.is_fresh(snapshot.received_at, self.settings.neighbor_ttl, now) => snapshot,
                _ => continue,
            };
            let mut shared: Vec<&PeerId> = snapshot
                .peers
                .iter()
                .filter(|peer| peer.as_str() != via.as_str() && mine.contains(peer.as_str()))
                .collect();
            shared.sort();
            if let Some(redundant) = shared.first() {
                return Some(Triangle {
                    via: via.clone(),
                    redundant: (*redundant).clone(),
                });
            }
        }
        None
    }

    /// Most distant non-peer node, if it is farther than every direct peer
    pub fn most_distant_node(&self, my_peers: &[PeerId], now: Instant) -> Option<(PeerId, u32)> {
        let mine: HashSet<&str> = my_peers.iter().map(String::as_str).collect();
        let hops = self.hops.lock();
        let ttl = self.settings.hop_estimate_ttl;

        let fresh = hops
            .iter()
            .filter(|(_, estimate)| self.is_fresh(estimate.observed_at, ttl, now));

        let mut baseline = 0;
        let mut best: Option<(&PeerId, u32)> = None;
        for (node_id, estimate) in fresh {
            if mine.contains(node_id.as_str()) {
                baseline = baseline.max(estimate.hop_count);
                continue;
            }
            if node_id == &self.node_id {
                continue;
            }
            let better = match best {
                None => true,
                Some((best_id, best_hops)) => {
                    estimate.hop_count > best_hops
                        || (estimate.hop_count == best_hops && node_id < best_id)
                }
            };
            if better {
                best = Some((node_id, estimate.hop_count));
            }
        }

        best.filter(|(_, hop_count)| *hop_count > baseline)
            .map(|(node_id, hop_count)| (node_id.clone(), hop_count))
    }

    /// Every node id this node has topology knowledge of
    pub fn known_nodes(&self) -> HashSet<PeerId> {
        let mut known = HashSet::new();
        for (peer_id, snapshot) in self.neighbors.lock().iter() {
            known.insert(peer_id.clone());
            known.extend(snapshot.peers.iter().cloned());
        }
        known.extend(self.hops.lock().keys().cloned());
        known.remove(&self.node_id);
        known
    }

    /// Rewiring analysis. Drops a redundant peer and requests a link to the
    /// most distant known node. Returns the plan if it acted.
    pub fn run_rewiring(&self, connections: &ConnectionManager) -> Option<RewirePlan> {
        let _gate = self.gate.lock();
        let now = Instant::now();

        if let Some(last) = *self.last_rewire.lock() {
            if now.saturating_duration_since(last) < self.settings.rewire_cooldown {
                debug!("Rewiring skipped: cooldown");
                return None;
            }
        }

        let peers = connections.connected_peers();
        let triangle = self.find_triangle(&peers, now)?;
        let (target, hop_count) = self.most_distant_node(&peers, now)?;

        info!(
            drop = %triangle.redundant,
            via = %triangle.via,
            connect = %target,
            hop_count,
            "Rewiring: trading redundant edge for long-range link"
        );
        connections.disconnect(&triangle.redundant);
        self.forget_peer(&triangle.redundant);
        *self.last_rewire.lock() = Some(now);

        // A failed request leaves the slot for ordinary discovery.
        // The dropped peer is not asked back.
        let requested = match connections.connect(&target, RequestKind::Rewire) {
            Ok(()) => true,
            Err(e) => {
                warn!(connect = %target, "Rewiring connect failed: {}", e);
                false
            }
        };

        Some(RewirePlan {
            drop: triangle.redundant,
            connect: target,
            hop_count,
            requested,
        })
    }

    /// Island-discovery analysis. When saturated with a redundant edge,
    /// drops it and opens discovery mode. Returns the dropped peer.
    pub fn run_island_discovery(&self, connections: &ConnectionManager) -> Option<PeerId> {
        let _gate = self.gate.lock();
        let now = Instant::now();

        let peers = connections.connected_peers();
        if peers.len() < connections.limits().target {
            debug!(peers = peers.len(), "Island discovery skipped: below target");
            return None;
        }
        let triangle = self.find_triangle(&peers, now)?;

        let mut known = self.known_nodes();
        known.extend(peers.iter().cloned());

        info!(
            drop = %triangle.redundant,
            window_ms = self.settings.discovery_window.as_millis() as u64,
            "Island discovery: dropping redundant edge and opening discovery mode"
        );
        connections.disconnect(&triangle.redundant);
        self.forget_peer(&triangle.redundant);
        connections.enter_discovery_mode(known, self.settings.discovery_window);

        Some(triangle.redundant)
    }

    /// Number of stored neighbor snapshots
    pub fn neighbor_snapshot_count(&self) -> usize {
        self.neighbors.lock().len()
    }

    /// Number of stored hop estimates
    pub fn hop_estimate_count(&self) -> usize {
        self.hops.lock().len()
    }

    /// Forget everything
    pub fn clear(&self) {
        self.neighbors.lock().clear();
        self.hops.lock().clear();
        *self.last_rewire.lock() = None;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn create_test_settings() -> OptimizerSettings {
        OptimizerSettings {
            neighbor_ttl: Duration::from_secs(15),
            hop_estimate_ttl: Duration::from_secs(60),
            rewire_cooldown: Duration::from_secs(30),
            discovery_window: Duration::from_secs(20),
        }
    }

    fn announce(peers: &[&str]) -> NeighborAnnouncement {
        NeighborAnnouncement {
            peers: peers.iter().map(|p| p.to_string()).collect(),
        }
    }

    fn ids(peers: &[&str]) -> Vec<PeerId> {
        peers.iter().map(|p| p.to_string()).collect()
    }

    #[test]
    fn test_find_triangle() {
        let optimizer = TopologyOptimizer::new("a".to_string(), create_test_settings());
        let now = Instant::now();

        optimizer.record_neighbors("b", announce(&["a", "c"]), now);
        optimizer.record_neighbors("c", announce(&["a", "b", "d"]), now);

        let triangle = optimizer.find_triangle(&ids(&["b", "c"]), now).unwrap();
        assert_eq!(triangle.via, "b");
        assert_eq!(triangle.redundant, "c");
    }

    #[test]
    fn test_no_triangle_in_a_line() {
        let optimizer = TopologyOptimizer::new("a".to_string(), create_test_settings());
        let now = Instant::now();

        optimizer.record_neighbors("b", announce(&["a", "x"]), now);
        optimizer.record_neighbors("c", announce(&["a", "y"]), now);

        assert!(optimizer.find_triangle(&ids(&["b", "c"]), now).is_none());
    }

    #[test]
    fn test_stale_snapshot_ignored() {
        let optimizer = TopologyOptimizer::new("a".to_string(), create_test_settings());
        let start = Instant::now();

        optimizer.record_neighbors("b", announce(&["a", "c"]), start);
        let later = start + Duration::from_secs(16);
        assert!(optimizer.find_triangle(&ids(&["b", "c"]), later).is_none());
    }

    #[test]
    fn test_latest_hop_count_wins() {
        let optimizer = TopologyOptimizer::new("a".to_string(), create_test_settings());
        let now = Instant::now();

        optimizer.observe_envelope("d", 1, now);
        optimizer.observe_envelope("d", 4, now);
        assert_eq!(optimizer.hop_estimate("d", now), Some(4));
        optimizer.observe_envelope("d", 2, now);
        assert_eq!(optimizer.hop_estimate("d", now), Some(2));
    }

    #[test]
    fn test_own_envelopes_not_tracked() {
        let optimizer = TopologyOptimizer::new("a".to_string(), create_test_settings());
        optimizer.observe_envelope("a", 3, Instant::now());
        assert_eq!(optimizer.hop_estimate_count(), 0);
    }

    #[test]
    fn test_most_distant_node_must_beat_peers() {
        let optimizer = TopologyOptimizer::new("a".to_string(), create_test_settings());
        let now = Instant::now();
        let peers = ids(&["b", "c"]);

        optimizer.observe_envelope("b", 0, now);
        optimizer.observe_envelope("c", 1, now);
        optimizer.observe_envelope("d", 1, now);
        // Not farther than a direct peer
        assert!(optimizer.most_distant_node(&peers, now).is_none());

        optimizer.observe_envelope("e", 3, now);
        optimizer.observe_envelope("f", 2, now);
        assert_eq!(
            optimizer.most_distant_node(&peers, now),
            Some(("e".to_string(), 3))
        );
    }

    #[test]
    fn test_sweep_purges_expired_entries() {
        let optimizer = TopologyOptimizer::new("a".to_string(), create_test_settings());
        let start = Instant::now();

        optimizer.record_neighbors("b", announce(&["c"]), start);
        optimizer.observe_envelope("d", 2, start);

        assert_eq!(optimizer.sweep(start + Duration::from_secs(5)), (0, 0));
        assert_eq!(optimizer.sweep(start + Duration::from_secs(20)), (1, 0));
        assert_eq!(optimizer.sweep(start + Duration::from_secs(61)), (0, 1));
    }

    #[test]
    fn test_known_nodes_covers_two_hop_view() {
        let optimizer = TopologyOptimizer::new("a".to_string(), create_test_settings());
        let now = Instant::now();

        optimizer.record_neighbors("b", announce(&["a", "c"]), now);
        optimizer.observe_envelope("z", 5, now);

        let known = optimizer.known_nodes();
        assert!(known.contains("b"));
        assert!(known.contains("c"));
        assert!(known.contains("z"));
        assert!(!known.contains("a"));
    }
}
