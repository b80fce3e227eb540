//! Peer admission table.
//!
//! Tracks every peer the transport has told us about and where it sits in the
//! admission state machine:
//!
//! ```text
//! Discovered -> Requesting -> Connected
//!                   |
//!                   v
//!                Failed --(backoff)--> Requesting ... -> Abandoned
//! ```
//!
//! The table is pure bookkeeping with no I/O. Every "is there a free slot,
//! then claim it" decision is made by a single method call, so a caller that
//! holds the table's lock gets check-and-reserve atomically.

use crate::error::{MeshError, MeshResult};
use rand::Rng;
use std::collections::{HashMap, HashSet};
use std::time::Duration;
use tokio::time::Instant;

/// Unique identifier for a node in the mesh
pub type PeerId = String;

/// Why an outbound request was made
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RequestKind {
    /// Ordinary admission below target; retried with backoff
    Discovery,
    /// Long-range shortcut chosen by rewiring analysis
    Rewire,
    /// Cross-island link made while discovery mode was open
    Island,
}

impl RequestKind {
    /// Forced requests ignore the target and are bounded by max only
    pub fn is_forced(&self) -> bool {
        !matches!(self, RequestKind::Discovery)
    }
}

/// Admission state of one peer
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PeerState {
    /// Seen by discovery, not connected
    Discovered,
    /// Outbound request in flight
    Requesting {
        /// Why the request was made
        kind: RequestKind,
        /// When it was sent
        since: Instant,
    },
    /// Inbound request accepted, waiting for the link
    Accepting {
        /// When it was accepted
        since: Instant,
    },
    /// Live connection
    Connected {
        /// When the link came up
        since: Instant,
    },
    /// Last request failed; retry scheduled
    Failed {
        /// Earliest time of the next attempt
        retry_at: Instant,
    },
    /// Retry limit reached; ignored until rediscovered
    Abandoned,
}

impl PeerState {
    fn holds_slot(&self) -> bool {
        matches!(
            self,
            PeerState::Requesting { .. } | PeerState::Accepting { .. } | PeerState::Connected { .. }
        )
    }
}

/// One row of the table
#[derive(Debug, Clone)]
pub struct PeerEntry {
    /// Current admission state
    pub state: PeerState,
    /// Consecutive failed attempts
    pub attempts: u32,
    /// Whether discovery currently reports this peer
    pub discovered: bool,
}

impl PeerEntry {
    fn new(discovered: bool) -> Self {
        Self {
            state: PeerState::Discovered,
            attempts: 0,
            discovered,
        }
    }
}

/// Connection slot limits
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ConnectionLimits {
    /// Hard cap, enforced on inbound accept and forced requests
    pub max: usize,
    /// Soft goal for ordinary outbound admission
    pub target: usize,
}

/// Retry backoff parameters
#[derive(Debug, Clone, Copy)]
pub struct RetryPolicy {
    /// Delay after the first failure
    pub base_delay: Duration,
    /// Cap before jitter
    pub max_delay: Duration,
    /// Failures before a peer is abandoned
    pub max_retries: u32,
}

impl RetryPolicy {
    /// Exponential delay for the given failure count, capped, without jitter
    pub fn backoff(&self, attempts: u32) -> Duration {
        let exponent = attempts.saturating_sub(1).min(16);
        self.base_delay
            .saturating_mul(1u32 << exponent)
            .min(self.max_delay)
    }

    /// Backoff plus up to 50% random jitter
    pub fn jittered_backoff(&self, attempts: u32) -> Duration {
        let delay = self.backoff(attempts);
        let spread = delay.as_millis() as u64 / 2;
        let jitter = if spread == 0 {
            0
        } else {
            rand::thread_rng().gen_range(0..=spread)
        };
        delay + Duration::from_millis(jitter)
    }
}

/// Result of an admission check on discovery
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Admission {
    /// Slot reserved; send a connection request
    Request(RequestKind),
    /// Nothing to do
    Ignore,
}

/// Time-boxed relaxation of the below-target rule
#[derive(Debug, Clone)]
pub struct DiscoveryMode {
    /// When the window closes
    pub deadline: Instant,
    /// Peers that do not count as newly encountered
    pub known: HashSet<PeerId>,
}

/// Peer admission table
#[derive(Debug)]
pub struct PeerTable {
    entries: HashMap<PeerId, PeerEntry>,
    limits: ConnectionLimits,
    retry: RetryPolicy,
    discovery_mode: Option<DiscoveryMode>,
    /// Peers this node deliberately disconnected, with when
    dropped: HashMap<PeerId, Instant>,
}

impl PeerTable {
    /// Create an empty table
    pub fn new(limits: ConnectionLimits, retry: RetryPolicy) -> Self {
        Self {
            entries: HashMap::new(),
            limits,
            retry,
            discovery_mode: None,
            dropped: HashMap::new(),
        }
    }

    /// Configured limits
    pub fn limits(&self) -> ConnectionLimits {
        self.limits
    }

    /// Look up a peer's state
    pub fn state(&self, peer_id: &str) -> Option<PeerState> {
        self.entries.get(peer_id).map(|entry| entry.state)
    }

    /// Connected peers, sorted for deterministic iteration
    pub fn connected_peers(&self) -> Vec<PeerId> {
        let mut peers: Vec<PeerId> = self
            .entries
            .iter()
            .filter(|(_, entry)| matches!(entry.state, PeerState::Connected { .. }))
            .map(|(id, _)| id.clone())
            .collect();
        peers.sort();
        peers
    }

    /// Number of live connections
    pub fn connected_count(&self) -> usize {
        self.entries
            .values()
            .filter(|entry| matches!(entry.state, PeerState::Connected { .. }))
            .count()
    }

    /// Connections plus requests that may still become connections
    pub fn occupied_slots(&self) -> usize {
        self.entries
            .values()
            .filter(|entry| entry.state.holds_slot())
            .count()
    }

    fn reserve(&mut self, peer_id: &str, kind: RequestKind, now: Instant) {
        let entry = self
            .entries
            .entry(peer_id.to_string())
            .or_insert_with(|| PeerEntry::new(false));
        entry.state = PeerState::Requesting { kind, since: now };
    }

    fn release(&mut self, peer_id: &str) {
        let remove = match self.entries.get_mut(peer_id) {
            Some(entry) if entry.discovered => {
                entry.state = PeerState::Discovered;
                false
            }
            Some(_) => true,
            None => false,
        };
        if remove {
            self.entries.remove(peer_id);
        }
    }

    /// Discovery reported a peer. Reserves a slot when admission allows.
    pub fn on_discovered(&mut self, peer_id: &str, now: Instant) -> Admission {
        let entry = self
            .entries
            .entry(peer_id.to_string())
            .or_insert_with(|| PeerEntry::new(true));
        entry.discovered = true;

        match entry.state {
            PeerState::Discovered => {}
            PeerState::Abandoned => {
                entry.state = PeerState::Discovered;
                entry.attempts = 0;
            }
            // Busy, or a retry is already scheduled
            _ => return Admission::Ignore,
        }

        let occupied = self.occupied_slots();
        if self.discovery_mode_open(now) && occupied < self.limits.max {
            let unknown = self
                .discovery_mode
                .as_ref()
                .map(|mode| !mode.known.contains(peer_id))
                .unwrap_or(false);
            if unknown {
                self.discovery_mode = None;
                self.reserve(peer_id, RequestKind::Island, now);
                return Admission::Request(RequestKind::Island);
            }
        }

        if occupied < self.limits.target {
            self.reserve(peer_id, RequestKind::Discovery, now);
            Admission::Request(RequestKind::Discovery)
        } else {
            Admission::Ignore
        }
    }

    /// Discovery no longer sees a peer
    pub fn on_lost(&mut self, peer_id: &str) {
        let remove = match self.entries.get_mut(peer_id) {
            Some(entry) if entry.state.holds_slot() => {
                entry.discovered = false;
                false
            }
            Some(_) => true,
            None => false,
        };
        if remove {
            self.entries.remove(peer_id);
        }
    }

    /// Forced outbound request, bounded by max only
    pub fn reserve_forced(
        &mut self,
        peer_id: &str,
        kind: RequestKind,
        now: Instant,
    ) -> MeshResult<()> {
        if let Some(state) = self.state(peer_id) {
            if state.holds_slot() {
                return Err(MeshError::InvalidState(format!(
                    "peer {} already connected or pending",
                    peer_id
                )));
            }
        }
        if self.occupied_slots() >= self.limits.max {
            return Err(MeshError::CapacityExceeded {
                peer_id: peer_id.to_string(),
                max: self.limits.max,
            });
        }
        self.reserve(peer_id, kind, now);
        Ok(())
    }

    /// Inbound request. Only the hard cap applies.
    pub fn on_inbound_request(&mut self, peer_id: &str, now: Instant) -> bool {
        match self.state(peer_id) {
            Some(PeerState::Connected { .. }) | Some(PeerState::Accepting { .. }) => true,
            // Slot already held by our own outbound request
            Some(PeerState::Requesting { .. }) => {
                if let Some(entry) = self.entries.get_mut(peer_id) {
                    entry.state = PeerState::Accepting { since: now };
                }
                true
            }
            _ => {
                if self.occupied_slots() >= self.limits.max {
                    return false;
                }
                let entry = self
                    .entries
                    .entry(peer_id.to_string())
                    .or_insert_with(|| PeerEntry::new(false));
                entry.state = PeerState::Accepting { since: now };
                true
            }
        }
    }

    /// Link established. Returns false when accepting it would exceed max.
    pub fn on_connected(&mut self, peer_id: &str, now: Instant) -> bool {
        match self.state(peer_id) {
            Some(PeerState::Connected { .. }) => true,
            Some(PeerState::Requesting { .. }) | Some(PeerState::Accepting { .. }) => {
                self.mark_connected(peer_id, now);
                true
            }
            _ => {
                if self.occupied_slots() >= self.limits.max {
                    return false;
                }
                self.mark_connected(peer_id, now);
                true
            }
        }
    }

    fn mark_connected(&mut self, peer_id: &str, now: Instant) {
        let entry = self
            .entries
            .entry(peer_id.to_string())
            .or_insert_with(|| PeerEntry::new(false));
        entry.state = PeerState::Connected { since: now };
        entry.attempts = 0;
    }

    /// A request failed. Returns the retry delay, or `None` when the peer
    /// will not be retried.
    pub fn on_connection_failed(&mut self, peer_id: &str, now: Instant) -> Option<Duration> {
        let retryable = match self.entries.get(peer_id) {
            Some(entry) => match entry.state {
                PeerState::Requesting { kind, .. } => !kind.is_forced() && entry.discovered,
                // Inbound handshakes are the remote side's to retry
                PeerState::Accepting { .. } => false,
                _ => return None,
            },
            None => return None,
        };

        if !retryable {
            self.release(peer_id);
            return None;
        }

        let retry = self.retry;
        let entry = self.entries.get_mut(peer_id)?;
        entry.attempts += 1;
        if entry.attempts >= retry.max_retries {
            entry.state = PeerState::Abandoned;
            return None;
        }
        let delay = retry.jittered_backoff(entry.attempts);
        entry.state = PeerState::Failed {
            retry_at: now + delay,
        };
        Some(delay)
    }

    /// Link dropped. Returns whether the peer had been connected.
    pub fn on_disconnected(&mut self, peer_id: &str) -> bool {
        let was_connected = matches!(self.state(peer_id), Some(PeerState::Connected { .. }));
        if let Some(entry) = self.entries.get_mut(peer_id) {
            entry.attempts = 0;
        }
        self.release(peer_id);
        was_connected
    }

    /// Deliberate local disconnect; remembered so refill skips it for a while
    pub fn mark_dropped(&mut self, peer_id: &str, now: Instant) -> bool {
        let was_connected = self.on_disconnected(peer_id);
        self.dropped.insert(peer_id.to_string(), now);
        was_connected
    }

    /// Failed peers whose backoff elapsed, re-reserved while below target
    pub fn due_retries(&mut self, now: Instant) -> Vec<PeerId> {
        let mut due: Vec<PeerId> = self
            .entries
            .iter()
            .filter(|(_, entry)| matches!(entry.state, PeerState::Failed { retry_at } if retry_at <= now))
            .map(|(id, _)| id.clone())
            .collect();
        due.sort();

        let mut retried = Vec::new();
        for peer_id in due {
            if self.occupied_slots() < self.limits.target {
                self.reserve(&peer_id, RequestKind::Discovery, now);
                retried.push(peer_id);
            } else if let Some(entry) = self.entries.get_mut(&peer_id) {
                // No slot; keep the attempt count and wait for refill
                entry.state = PeerState::Discovered;
            }
        }
        retried
    }

    /// Pending requests older than `timeout`
    pub fn stale_requests(&self, now: Instant, timeout: Duration) -> Vec<PeerId> {
        let mut stale: Vec<PeerId> = self
            .entries
            .iter()
            .filter(|(_, entry)| match entry.state {
                PeerState::Requesting { since, .. } | PeerState::Accepting { since } => {
                    now.saturating_duration_since(since) >= timeout
                }
                _ => false,
            })
            .map(|(id, _)| id.clone())
            .collect();
        stale.sort();
        stale
    }

    /// Reserve discovered peers while below target, skipping recent drops
    pub fn refill(&mut self, now: Instant, drop_cooldown: Duration) -> Vec<PeerId> {
        self.dropped
            .retain(|_, at| now.saturating_duration_since(*at) < drop_cooldown);

        let mut candidates: Vec<PeerId> = self
            .entries
            .iter()
            .filter(|(id, entry)| {
                entry.discovered
                    && entry.state == PeerState::Discovered
                    && !self.dropped.contains_key(id.as_str())
            })
            .map(|(id, _)| id.clone())
            .collect();
        candidates.sort();

        let mut reserved = Vec::new();
        for peer_id in candidates {
            if self.occupied_slots() >= self.limits.target {
                break;
            }
            self.reserve(&peer_id, RequestKind::Discovery, now);
            reserved.push(peer_id);
        }
        reserved
    }

    /// Open discovery mode. If a discovered peer outside `known` is already
    /// waiting, it is reserved immediately and the mode closes again.
    pub fn enter_discovery_mode(
        &mut self,
        known: HashSet<PeerId>,
        deadline: Instant,
        now: Instant,
    ) -> Option<PeerId> {
        self.discovery_mode = Some(DiscoveryMode { deadline, known });

        let mut waiting: Vec<PeerId> = self
            .entries
            .iter()
            .filter(|(id, entry)| {
                entry.discovered
                    && entry.state == PeerState::Discovered
                    && self
                        .discovery_mode
                        .as_ref()
                        .map(|mode| !mode.known.contains(id.as_str()))
                        .unwrap_or(false)
            })
            .map(|(id, _)| id.clone())
            .collect();
        waiting.sort();

        let peer_id = waiting.into_iter().next()?;
        if self.occupied_slots() >= self.limits.max {
            return None;
        }
        self.discovery_mode = None;
        self.reserve(&peer_id, RequestKind::Island, now);
        Some(peer_id)
    }

    /// Whether discovery mode is open at `now`
    pub fn discovery_mode_open(&self, now: Instant) -> bool {
        self.discovery_mode
            .as_ref()
            .map(|mode| now < mode.deadline)
            .unwrap_or(false)
    }

    /// Close an expired discovery mode. Returns true if it just closed.
    pub fn expire_discovery_mode(&mut self, now: Instant) -> bool {
        match &self.discovery_mode {
            Some(mode) if now >= mode.deadline => {
                self.discovery_mode = None;
                true
            }
            _ => false,
        }
    }

    /// Forget everything
    pub fn clear(&mut self) {
        self.entries.clear();
        self.dropped.clear();
        self.discovery_mode = None;
    }
}
