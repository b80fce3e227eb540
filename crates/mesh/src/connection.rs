//! Connection management over an abstract transport.
//!
//! The radio layer (advertising, discovery, handshakes) sits behind
//! [`Transport`]. It reports everything that happens through a stream of
//! [`TransportEvent`]s. [`ConnectionManager`] turns those events into the
//! admission state machine in [`crate::peer`] and exposes the live
//! connected-peer set the router and optimizer work from.

use crate::config::MeshConfig;
use crate::error::{MeshError, MeshResult};
use crate::gossip::Fanout;
use crate::peer::{Admission, ConnectionLimits, PeerId, PeerTable, RequestKind, RetryPolicy};
use parking_lot::Mutex;
use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;
use tokio::time::Instant;
use tracing::{debug, info, warn};

/// Radio-level capability consumed by the mesh.
///
/// Calls are non-blocking requests; outcomes arrive later as
/// [`TransportEvent`]s on the channel handed out with the transport.
pub trait Transport: Send + Sync {
    /// Id other nodes know us by
    fn local_id(&self) -> &str;

    /// Begin advertising and discovery
    fn start(&self) -> MeshResult<()>;

    /// Stop advertising/discovery and drop every link
    fn stop(&self);

    /// Ask a discovered peer for a connection
    fn request_connection(&self, peer_id: &str) -> MeshResult<()>;

    /// Accept an inbound request
    fn accept_connection(&self, peer_id: &str) -> MeshResult<()>;

    /// Refuse an inbound request
    fn reject_connection(&self, peer_id: &str) -> MeshResult<()>;

    /// Tear down a link
    fn disconnect(&self, peer_id: &str);

    /// Send bytes over an established link
    fn send(&self, peer_id: &str, bytes: Vec<u8>) -> MeshResult<()>;
}

/// Something the transport observed
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TransportEvent {
    /// A peer is advertising within range
    PeerDiscovered(PeerId),
    /// A previously discovered peer went out of range
    PeerLost(PeerId),
    /// A peer asks to connect to us
    ConnectionRequested(PeerId),
    /// A link is up
    Connected(PeerId),
    /// An outbound request did not complete
    ConnectionFailed {
        /// Peer we tried to reach
        peer_id: PeerId,
        /// Transport-specific reason
        reason: String,
    },
    /// A link went down
    Disconnected(PeerId),
    /// Bytes arrived over a link
    Received {
        /// Sending peer
        from: PeerId,
        /// Raw frame
        bytes: Vec<u8>,
    },
}

/// Admission and link bookkeeping for one node
pub struct ConnectionManager {
    transport: Arc<dyn Transport>,
    table: Mutex<PeerTable>,
    connect_timeout: Duration,
    drop_cooldown: Duration,
}

impl ConnectionManager {
    /// Create a manager over `transport` with limits from `config`
    pub fn new(transport: Arc<dyn Transport>, config: &MeshConfig) -> Self {
        let table = PeerTable::new(
            ConnectionLimits {
                max: config.max_connections,
                target: config.target_connections,
            },
            RetryPolicy {
                base_delay: config.retry_base_delay(),
                max_delay: config.retry_max_delay(),
                max_retries: config.max_connection_retries,
            },
        );
        Self {
            transport,
            table: Mutex::new(table),
            connect_timeout: config.connect_timeout(),
            drop_cooldown: config.rewire_cooldown(),
        }
    }

    /// Local node id
    pub fn local_id(&self) -> &str {
        self.transport.local_id()
    }

    /// Slot limits
    pub fn limits(&self) -> ConnectionLimits {
        self.table.lock().limits()
    }

    /// Start the underlying transport
    pub fn start(&self) -> MeshResult<()> {
        self.transport.start()
    }

    /// Connected peers, sorted
    pub fn connected_peers(&self) -> Vec<PeerId> {
        self.table.lock().connected_peers()
    }

    /// Number of live links
    pub fn connected_count(&self) -> usize {
        self.table.lock().connected_count()
    }

    /// Whether `peer_id` is connected right now
    pub fn is_connected(&self, peer_id: &str) -> bool {
        self.connected_peers().iter().any(|p| p == peer_id)
    }

    /// Whether discovery mode is open
    pub fn discovery_mode_active(&self) -> bool {
        self.table.lock().discovery_mode_open(Instant::now())
    }

    /// Discovery reported a peer
    pub fn on_peer_discovered(&self, peer_id: &str) {
        let admission = self.table.lock().on_discovered(peer_id, Instant::now());
        match admission {
            Admission::Request(kind) => {
                if kind == RequestKind::Island {
                    info!(peer_id = %peer_id, "Discovery mode: connecting to unknown peer");
                }
                // Failure is already recorded for retry
                let _ = self.send_request(peer_id, kind);
            }
            Admission::Ignore => {
                debug!(peer_id = %peer_id, "Discovered peer, no free slot");
            }
        }
    }

    /// Discovery lost a peer
    pub fn on_peer_lost(&self, peer_id: &str) {
        self.table.lock().on_lost(peer_id);
    }

    /// A peer asked to connect. Only the hard cap is enforced here.
    pub fn on_connection_requested(&self, peer_id: &str) {
        let accept = self
            .table
            .lock()
            .on_inbound_request(peer_id, Instant::now());

        if accept {
            if let Err(e) = self.transport.accept_connection(peer_id) {
                warn!(peer_id = %peer_id, "Accept failed: {}", e);
                self.on_connection_failed(peer_id, &e.to_string());
            }
        } else {
            let max = self.limits().max;
            debug!(peer_id = %peer_id, max, "Rejecting inbound connection: at capacity");
            if let Err(e) = self.transport.reject_connection(peer_id) {
                debug!(peer_id = %peer_id, "Reject failed: {}", e);
            }
        }
    }

    /// A link came up. Returns false if it was refused for capacity.
    pub fn on_connected(&self, peer_id: &str) -> bool {
        let admitted = self.table.lock().on_connected(peer_id, Instant::now());
        if admitted {
            info!(peer_id = %peer_id, "Peer connected");
        } else {
            let err = MeshError::CapacityExceeded {
                peer_id: peer_id.to_string(),
                max: self.limits().max,
            };
            warn!("Dropping new link: {}", err);
            self.transport.disconnect(peer_id);
        }
        admitted
    }

    /// An outbound request failed
    pub fn on_connection_failed(&self, peer_id: &str, reason: &str) {
        let retry = self
            .table
            .lock()
            .on_connection_failed(peer_id, Instant::now());
        match retry {
            Some(delay) => debug!(
                peer_id = %peer_id,
                reason = %reason,
                retry_in_ms = delay.as_millis() as u64,
                "Connection failed, retry scheduled"
            ),
            None => debug!(peer_id = %peer_id, reason = %reason, "Connection failed, not retrying"),
        }
    }

    /// A link went down. Returns whether the peer had been connected.
    pub fn on_disconnected(&self, peer_id: &str) -> bool {
        let was_connected = self.table.lock().on_disconnected(peer_id);
        if was_connected {
            info!(peer_id = %peer_id, "Peer disconnected");
        }
        was_connected
    }

    /// Forced outbound request, bounded by max but not by target.
    /// A transport refusal releases the reserved slot and is returned.
    pub fn connect(&self, peer_id: &str, kind: RequestKind) -> MeshResult<()> {
        if peer_id == self.local_id() {
            return Err(MeshError::InvalidState("cannot connect to self".to_string()));
        }
        self.table
            .lock()
            .reserve_forced(peer_id, kind, Instant::now())?;
        self.send_request(peer_id, kind)
    }

    /// Deliberately drop a link
    pub fn disconnect(&self, peer_id: &str) {
        let was_connected = self.table.lock().mark_dropped(peer_id, Instant::now());
        self.transport.disconnect(peer_id);
        if was_connected {
            info!(peer_id = %peer_id, "Disconnected peer");
        }
    }

    /// Open discovery mode for `window`. Peers in `known` do not count as
    /// new. Returns the waiting peer a request went out to, if any.
    pub fn enter_discovery_mode(&self, known: HashSet<PeerId>, window: Duration) -> Option<PeerId> {
        let now = Instant::now();
        let picked = self
            .table
            .lock()
            .enter_discovery_mode(known, now + window, now)?;
        info!(peer_id = %picked, "Discovery mode: connecting to waiting unknown peer");
        self.send_request(&picked, RequestKind::Island).ok()?;
        Some(picked)
    }

    /// Periodic upkeep: expire discovery mode, time out hung requests, fire
    /// due retries and refill free slots below target.
    pub fn maintain(&self) {
        let now = Instant::now();

        let (expired, stale) = {
            let mut table = self.table.lock();
            (
                table.expire_discovery_mode(now),
                table.stale_requests(now, self.connect_timeout),
            )
        };
        if expired {
            info!("Discovery mode timed out");
        }
        for peer_id in stale {
            self.transport.disconnect(&peer_id);
            self.on_connection_failed(&peer_id, "request timed out");
        }

        let (retries, refills) = {
            let mut table = self.table.lock();
            let retries = table.due_retries(now);
            let refills = table.refill(now, self.drop_cooldown);
            (retries, refills)
        };
        for peer_id in retries.iter().chain(refills.iter()) {
            let _ = self.send_request(peer_id, RequestKind::Discovery);
        }
    }

    /// Disconnect everything, stop the transport and forget all state
    pub fn shutdown(&self) {
        let peers = self.connected_peers();
        for peer_id in &peers {
            self.transport.disconnect(peer_id);
        }
        self.transport.stop();
        self.table.lock().clear();
    }

    /// Hand a request to the transport. A refusal is recorded as a failed
    /// attempt before it is returned.
    fn send_request(&self, peer_id: &str, kind: RequestKind) -> MeshResult<()> {
        self.transport.request_connection(peer_id).map_err(|e| {
            debug!(peer_id = %peer_id, kind = ?kind, "Connection request refused: {}", e);
            self.on_connection_failed(peer_id, &e.to_string());
            e
        })
    }
}

impl Fanout for ConnectionManager {
    fn peers(&self) -> Vec<PeerId> {
        self.connected_peers()
    }

    fn send(&self, peer_id: &str, bytes: Vec<u8>) -> MeshResult<()> {
        self.transport.send(peer_id, bytes)
    }
}
