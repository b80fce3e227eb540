//! Flood-fill gossip router.
//!
//! Every new envelope is forwarded to all direct peers except the one it came
//! from. A node drops any envelope id it has already seen, which is enough to
//! stop loops and broadcast storms without global sequencing: each envelope
//! crosses each edge at most twice, once in each direction.

use crate::dedup::SeenCache;
use crate::envelope::{Envelope, Frame, Payload};
use crate::error::MeshResult;
use crate::peer::PeerId;
use serde::{Deserialize, Serialize};
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;
use tokio::time::Instant;
use tracing::{debug, trace};

/// Peers the router can reach directly
pub trait Fanout {
    /// Currently connected peers
    fn peers(&self) -> Vec<PeerId>;

    /// Send an encoded frame to one peer
    fn send(&self, peer_id: &str, bytes: Vec<u8>) -> MeshResult<()>;
}

/// Result of processing an incoming envelope
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RouteOutcome {
    /// First sighting; delivered locally and forwarded
    Delivered {
        /// Number of peers the copy was handed to
        forwarded_to: usize,
    },
    /// Already seen; dropped
    Duplicate,
}

/// Router counters, readable without locking
#[derive(Debug, Default)]
struct RouterStats {
    originated: AtomicU64,
    delivered: AtomicU64,
    duplicates: AtomicU64,
    forwarded: AtomicU64,
    send_failures: AtomicU64,
    malformed: AtomicU64,
}

/// Point-in-time copy of the router counters
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct RouterCounters {
    /// Envelopes created here
    pub originated: u64,
    /// Envelopes processed locally (first sightings)
    pub delivered: u64,
    /// Envelopes dropped as already seen
    pub duplicates: u64,
    /// Individual sends of forwarded copies
    pub forwarded: u64,
    /// Sends that failed (peer gone mid-fanout)
    pub send_failures: u64,
    /// Frames that failed to decode
    pub malformed: u64,
}

/// Gossip router with per-node duplicate suppression
#[derive(Debug)]
pub struct GossipRouter {
    /// Node's own ID
    node_id: PeerId,
    /// Recently seen envelope ids
    seen: SeenCache,
    stats: RouterStats,
}

impl GossipRouter {
    /// Create a router for `node_id`
    pub fn new(node_id: PeerId, seen_ttl: Duration) -> Self {
        Self {
            node_id,
            seen: SeenCache::new(seen_ttl),
            stats: RouterStats::default(),
        }
    }

    /// The local node id
    pub fn node_id(&self) -> &str {
        &self.node_id
    }

    /// Create a new envelope and send it to every peer
    pub fn originate(
        &self,
        fanout: &dyn Fanout,
        payload: Payload,
        now: Instant,
    ) -> MeshResult<Envelope> {
        let envelope = Envelope::new(self.node_id.clone(), payload);
        let bytes = Frame::Gossip(envelope.clone()).encode()?;
        self.seen.check_and_insert(&envelope.id, now);
        self.stats.originated.fetch_add(1, Ordering::Relaxed);

        let sent = self.fan_out(fanout, bytes, None);
        debug!(envelope_id = %envelope.id, peers = sent, "Originated envelope");
        Ok(envelope)
    }

    /// Process an envelope received from `from`.
    ///
    /// On first sighting `deliver` runs before the copy is forwarded.
    pub fn on_receive<F>(
        &self,
        fanout: &dyn Fanout,
        from: &str,
        envelope: Envelope,
        now: Instant,
        deliver: F,
    ) -> RouteOutcome
    where
        F: FnOnce(&Envelope),
    {
        // Our own envelope echoed back after its id was swept
        if envelope.origin == self.node_id || !self.seen.check_and_insert(&envelope.id, now) {
            self.stats.duplicates.fetch_add(1, Ordering::Relaxed);
            trace!(envelope_id = %envelope.id, from = %from, "Dropped duplicate envelope");
            return RouteOutcome::Duplicate;
        }

        self.stats.delivered.fetch_add(1, Ordering::Relaxed);
        deliver(&envelope);

        let forwarded = envelope.forwarded();
        let bytes = match Frame::Gossip(forwarded).encode() {
            Ok(bytes) => bytes,
            Err(e) => {
                debug!(envelope_id = %envelope.id, "Failed to encode forwarded copy: {}", e);
                return RouteOutcome::Delivered { forwarded_to: 0 };
            }
        };

        let skip = [from, envelope.origin.as_str()];
        let forwarded_to = self.fan_out(fanout, bytes, Some(&skip[..]));
        trace!(
            envelope_id = %envelope.id,
            hop_count = envelope.hop_count,
            forwarded_to,
            "Forwarded envelope"
        );
        RouteOutcome::Delivered { forwarded_to }
    }

    /// Send to every peer not in `skip`. A failed send never stops the rest.
    fn fan_out(&self, fanout: &dyn Fanout, bytes: Vec<u8>, skip: Option<&[&str]>) -> usize {
        let mut sent = 0;
        for peer_id in fanout.peers() {
            if skip.map_or(false, |skip| skip.contains(&peer_id.as_str())) {
                continue;
            }
            match fanout.send(&peer_id, bytes.clone()) {
                Ok(()) => {
                    sent += 1;
                    self.stats.forwarded.fetch_add(1, Ordering::Relaxed);
                }
                Err(e) => {
                    self.stats.send_failures.fetch_add(1, Ordering::Relaxed);
                    debug!(peer_id = %peer_id, "Send failed during fanout: {}", e);
                }
            }
        }
        sent
    }

    /// Count a frame that failed to decode
    pub fn record_malformed(&self) {
        self.stats.malformed.fetch_add(1, Ordering::Relaxed);
    }

    /// Evict expired seen ids
    pub fn sweep(&self, now: Instant) -> usize {
        self.seen.sweep(now)
    }

    /// Whether an envelope id is currently remembered
    pub fn has_seen(&self, envelope_id: &str) -> bool {
        self.seen.contains(envelope_id)
    }

    /// Size of the seen cache
    pub fn seen_count(&self) -> usize {
        self.seen.len()
    }

    /// Snapshot of the counters
    pub fn counters(&self) -> RouterCounters {
        RouterCounters {
            originated: self.stats.originated.load(Ordering::Relaxed),
            delivered: self.stats.delivered.load(Ordering::Relaxed),
            duplicates: self.stats.duplicates.load(Ordering::Relaxed),
            forwarded: self.stats.forwarded.load(Ordering::Relaxed),
            send_failures: self.stats.send_failures.load(Ordering::Relaxed),
            malformed: self.stats.malformed.load(Ordering::Relaxed),
        }
    }

    /// Forget all seen ids
    pub fn clear(&self) {
        self.seen.clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::MeshError;
    use parking_lot::Mutex;

    /// Records sends; peers listed in `dead` fail
    struct RecordingFanout {
        peers: Vec<PeerId>,
        dead: Vec<PeerId>,
        sent: Mutex<Vec<(PeerId, Vec<u8>)>>,
    }

    impl RecordingFanout {
        fn new(peers: &[&str]) -> Self {
            Self {
                peers: peers.iter().map(|p| p.to_string()).collect(),
                dead: Vec::new(),
                sent: Mutex::new(Vec::new()),
            }
        }

        fn sent_to(&self) -> Vec<PeerId> {
            self.sent.lock().iter().map(|(peer, _)| peer.clone()).collect()
        }
    }

    impl Fanout for RecordingFanout {
        fn peers(&self) -> Vec<PeerId> {
            self.peers.clone()
        }

        fn send(&self, peer_id: &str, bytes: Vec<u8>) -> MeshResult<()> {
            if self.dead.iter().any(|p| p == peer_id) {
                return Err(MeshError::NotConnected {
                    peer_id: peer_id.to_string(),
                });
            }
            self.sent.lock().push((peer_id.to_string(), bytes));
            Ok(())
        }
    }

    fn create_test_envelope(origin: &str) -> Envelope {
        Envelope::new(origin.to_string(), Payload::Command(b"sync".to_vec()))
    }

    #[test]
    fn test_originate_sends_to_all_peers() {
        let router = GossipRouter::new("node1".to_string(), Duration::from_secs(30));
        let fanout = RecordingFanout::new(&["node2", "node3"]);

        let envelope = router
            .originate(&fanout, Payload::Command(vec![1]), Instant::now())
            .unwrap();

        assert_eq!(envelope.hop_count, 0);
        assert!(router.has_seen(&envelope.id));
        assert_eq!(fanout.sent_to(), vec!["node2".to_string(), "node3".to_string()]);
        assert_eq!(router.counters().originated, 1);
    }

    #[test]
    fn test_receive_forwards_to_all_but_sender() {
        let router = GossipRouter::new("node1".to_string(), Duration::from_secs(30));
        let fanout = RecordingFanout::new(&["node2", "node3", "node4"]);
        let envelope = create_test_envelope("node9");

        let mut delivered = 0;
        let outcome = router.on_receive(&fanout, "node2", envelope.clone(), Instant::now(), |_| {
            delivered += 1
        });

        assert_eq!(outcome, RouteOutcome::Delivered { forwarded_to: 2 });
        assert_eq!(delivered, 1);
        assert_eq!(fanout.sent_to(), vec!["node3".to_string(), "node4".to_string()]);

        // Forwarded copy carries hop count + 1
        let (_, bytes) = fanout.sent.lock()[0].clone();
        match Frame::decode(&bytes).unwrap() {
            Frame::Gossip(forwarded) => {
                assert_eq!(forwarded.id, envelope.id);
                assert_eq!(forwarded.hop_count, envelope.hop_count + 1);
            }
            other => panic!("Expected gossip frame, got {:?}", other),
        }
    }

    #[test]
    fn test_redelivery_is_not_reprocessed_or_forwarded() {
        let router = GossipRouter::new("node1".to_string(), Duration::from_secs(30));
        let fanout = RecordingFanout::new(&["node2", "node3"]);
        let envelope = create_test_envelope("node9");
        let now = Instant::now();

        let mut delivered = 0;
        router.on_receive(&fanout, "node2", envelope.clone(), now, |_| delivered += 1);
        let sends_after_first = fanout.sent_to().len();

        for from in ["node2", "node3"] {
            let outcome = router.on_receive(&fanout, from, envelope.forwarded(), now, |_| {
                delivered += 1
            });
            assert_eq!(outcome, RouteOutcome::Duplicate);
        }

        assert_eq!(delivered, 1);
        assert_eq!(fanout.sent_to().len(), sends_after_first);
        assert_eq!(router.counters().duplicates, 2);
    }

    #[test]
    fn test_own_envelope_echo_dropped() {
        let router = GossipRouter::new("node1".to_string(), Duration::from_secs(30));
        let fanout = RecordingFanout::new(&["node2"]);
        let echo = create_test_envelope("node1");

        let outcome = router.on_receive(&fanout, "node2", echo, Instant::now(), |_| {
            panic!("own envelope must not be delivered")
        });
        assert_eq!(outcome, RouteOutcome::Duplicate);
    }

    #[test]
    fn test_dead_peer_does_not_abort_fanout() {
        let router = GossipRouter::new("node1".to_string(), Duration::from_secs(30));
        let mut fanout = RecordingFanout::new(&["node2", "node3", "node4"]);
        fanout.dead.push("node3".to_string());

        let outcome = router.on_receive(
            &fanout,
            "node5",
            create_test_envelope("node9"),
            Instant::now(),
            |_| {},
        );

        assert_eq!(outcome, RouteOutcome::Delivered { forwarded_to: 2 });
        assert_eq!(fanout.sent_to(), vec!["node2".to_string(), "node4".to_string()]);
        assert_eq!(router.counters().send_failures, 1);
    }

    #[test]
    fn test_not_forwarded_back_to_origin() {
        let router = GossipRouter::new("node1".to_string(), Duration::from_secs(30));
        let fanout = RecordingFanout::new(&["node2", "node3"]);

        // node3 originated it, node2 relayed it
        router.on_receive(
            &fanout,
            "node2",
            create_test_envelope("node3").forwarded(),
            Instant::now(),
            |_| {},
        );
        assert!(fanout.sent_to().is_empty());
    }

    #[test]
    fn test_sweep_forgets_old_ids() {
        let router = GossipRouter::new("node1".to_string(), Duration::from_secs(10));
        let fanout = RecordingFanout::new(&[]);
        let start = Instant::now();

        router.on_receive(&fanout, "node2", create_test_envelope("node9"), start, |_| {});
        assert_eq!(router.seen_count(), 1);
        assert_eq!(router.sweep(start + Duration::from_secs(11)), 1);
        assert_eq!(router.seen_count(), 0);
    }
}
