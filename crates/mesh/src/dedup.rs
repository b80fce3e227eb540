//! Seen-envelope cache for duplicate suppression.

use crate::envelope::EnvelopeId;
use parking_lot::Mutex;
use std::collections::HashMap;
use std::time::Duration;
use tokio::time::Instant;

/// Envelope ids this node has already processed, with first-seen time
#[derive(Debug)]
pub struct SeenCache {
    entries: Mutex<HashMap<EnvelopeId, Instant>>,
    ttl: Duration,
}

impl SeenCache {
    /// Create a cache that forgets ids after `ttl`
    pub fn new(ttl: Duration) -> Self {
        Self {
            entries: Mutex::new(HashMap::new()),
            ttl,
        }
    }

    /// Record `id`. Returns true the first time, false for a duplicate.
    ///
    /// An id past its TTL but not yet swept still counts as seen.
    pub fn check_and_insert(&self, id: &str, now: Instant) -> bool {
        let mut entries = self.entries.lock();
        if entries.contains_key(id) {
            return false;
        }
        entries.insert(id.to_string(), now);
        true
    }

    /// Whether `id` is currently remembered
    pub fn contains(&self, id: &str) -> bool {
        self.entries.lock().contains_key(id)
    }

    /// Drop ids older than the TTL. Returns how many were evicted.
    pub fn sweep(&self, now: Instant) -> usize {
        let mut entries = self.entries.lock();
        let before = entries.len();
        entries.retain(|_, first_seen| now.saturating_duration_since(*first_seen) < self.ttl);
        before - entries.len()
    }

    /// Number of remembered ids
    pub fn len(&self) -> usize {
        self.entries.lock().len()
    }

    /// True when nothing is remembered
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Forget everything
    pub fn clear(&self) {
        self.entries.lock().clear();
    }
}
