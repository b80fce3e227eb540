//! Mesh node configuration.
//!
//! Limits and timer periods are core-level settings, independent of whatever
//! transport the node runs on. All periods are stored in milliseconds so the
//! config round-trips cleanly through JSON and TOML.

use crate::envelope::MAX_FRAME_BYTES;
use crate::error::{MeshError, MeshResult};
use serde::{Deserialize, Serialize};
use std::path::Path;
use std::time::Duration;

/// Tunables for a single mesh node
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct MeshConfig {
    /// Hard cap on simultaneous connections (inbound accept limit)
    pub max_connections: usize,
    /// Soft outbound goal, strictly below `max_connections`
    pub target_connections: usize,

    /// Neighbor-list gossip period (G)
    pub gossip_interval_ms: u64,
    /// Age after which a seen envelope id is forgotten
    pub seen_ttl_ms: u64,
    /// Seen-cache sweep period
    pub seen_sweep_interval_ms: u64,

    /// Age after which a neighbor snapshot is ignored and purged
    pub neighbor_ttl_ms: u64,
    /// Age after which a hop estimate is ignored and purged
    pub hop_estimate_ttl_ms: u64,
    /// Neighbor snapshot / hop estimate sweep period
    pub topology_sweep_interval_ms: u64,

    /// Rewiring analysis period (R)
    pub rewire_interval_ms: u64,
    /// Minimum spacing between two rewires (C)
    pub rewire_cooldown_ms: u64,
    /// Island-discovery analysis period (I)
    pub island_interval_ms: u64,
    /// How long discovery mode stays open
    pub discovery_window_ms: u64,

    /// Idle time after which a partial file transfer is discarded
    pub file_timeout_ms: u64,
    /// Reassembly sweep period
    pub file_sweep_interval_ms: u64,
    /// Bytes per outgoing file chunk
    pub chunk_size: usize,

    /// Connection maintenance period (retries, timeouts, slot refill)
    pub maintenance_interval_ms: u64,
    /// Requests that have not resolved after this long count as failed
    pub connect_timeout_ms: u64,
    /// First retry delay after a failed connection
    pub retry_base_delay_ms: u64,
    /// Upper bound on the retry delay
    pub retry_max_delay_ms: u64,
    /// Failed attempts before a peer is abandoned until rediscovered
    pub max_connection_retries: u32,
}

impl Default for MeshConfig {
    fn default() -> Self {
        Self {
            max_connections: 4,
            target_connections: 3,
            gossip_interval_ms: 5_000,
            seen_ttl_ms: 30_000,
            seen_sweep_interval_ms: 10_000,
            neighbor_ttl_ms: 15_000,
            hop_estimate_ttl_ms: 60_000,
            topology_sweep_interval_ms: 10_000,
            rewire_interval_ms: 30_000,
            rewire_cooldown_ms: 30_000,
            island_interval_ms: 300_000,
            discovery_window_ms: 20_000,
            file_timeout_ms: 300_000,
            file_sweep_interval_ms: 30_000,
            chunk_size: 16 * 1024,
            maintenance_interval_ms: 1_000,
            connect_timeout_ms: 10_000,
            retry_base_delay_ms: 1_000,
            retry_max_delay_ms: 30_000,
            max_connection_retries: 5,
        }
    }
}

impl MeshConfig {
    /// Load from a `.toml` or `.json` file, chosen by extension
    pub fn from_file<P: AsRef<Path>>(path: P) -> MeshResult<Self> {
        let path = path.as_ref();
        let content = std::fs::read_to_string(path)?;
        let config = match path.extension().and_then(|ext| ext.to_str()) {
            Some("toml") => Self::from_toml_str(&content)?,
            _ => Self::from_json_str(&content)?,
        };
        Ok(config)
    }

    /// Parse and validate a TOML document
    pub fn from_toml_str(content: &str) -> MeshResult<Self> {
        let config: Self = toml::from_str(content)?;
        config.validate()?;
        Ok(config)
    }

    /// Parse and validate a JSON document
    pub fn from_json_str(content: &str) -> MeshResult<Self> {
        let config: Self = serde_json::from_str(content)?;
        config.validate()?;
        Ok(config)
    }

    /// Check cross-field constraints
    pub fn validate(&self) -> MeshResult<()> {
        if self.target_connections == 0 {
            return Err(MeshError::Config(
                "target_connections must be at least 1".to_string(),
            ));
        }
        if self.target_connections >= self.max_connections {
            return Err(MeshError::Config(format!(
                "target_connections ({}) must be below max_connections ({})",
                self.target_connections, self.max_connections
            )));
        }
        if self.chunk_size == 0 {
            return Err(MeshError::Config("chunk_size must be non-zero".to_string()));
        }
        // Leave room for the envelope around the chunk
        if self.chunk_size as u64 > MAX_FRAME_BYTES / 2 {
            return Err(MeshError::Config(format!(
                "chunk_size must not exceed {} bytes",
                MAX_FRAME_BYTES / 2
            )));
        }

        let periods = [
            ("gossip_interval_ms", self.gossip_interval_ms),
            ("seen_ttl_ms", self.seen_ttl_ms),
            ("seen_sweep_interval_ms", self.seen_sweep_interval_ms),
            ("neighbor_ttl_ms", self.neighbor_ttl_ms),
            ("hop_estimate_ttl_ms", self.hop_estimate_ttl_ms),
            ("topology_sweep_interval_ms", self.topology_sweep_interval_ms),
            ("rewire_interval_ms", self.rewire_interval_ms),
            ("rewire_cooldown_ms", self.rewire_cooldown_ms),
            ("island_interval_ms", self.island_interval_ms),
            ("discovery_window_ms", self.discovery_window_ms),
            ("file_timeout_ms", self.file_timeout_ms),
            ("file_sweep_interval_ms", self.file_sweep_interval_ms),
            ("maintenance_interval_ms", self.maintenance_interval_ms),
            ("connect_timeout_ms", self.connect_timeout_ms),
        ];
        if let Some((name, _)) = periods.iter().find(|(_, value)| *value == 0) {
            return Err(MeshError::Config(format!("{} must be non-zero", name)));
        }

        if self.seen_ttl_ms < self.gossip_interval_ms {
            return Err(MeshError::Config(format!(
                "seen_ttl_ms ({}) must be at least gossip_interval_ms ({})",
                self.seen_ttl_ms, self.gossip_interval_ms
            )));
        }
        // Island discovery relaxes admission, so it must run less often
        if self.island_interval_ms <= self.rewire_interval_ms {
            return Err(MeshError::Config(format!(
                "island_interval_ms ({}) must be above rewire_interval_ms ({})",
                self.island_interval_ms, self.rewire_interval_ms
            )));
        }
        if self.retry_max_delay_ms < self.retry_base_delay_ms {
            return Err(MeshError::Config(
                "retry_max_delay_ms must not be below retry_base_delay_ms".to_string(),
            ));
        }
        Ok(())
    }

    /// Neighbor gossip period
    pub fn gossip_interval(&self) -> Duration {
        Duration::from_millis(self.gossip_interval_ms)
    }

    /// Seen-cache entry lifetime
    pub fn seen_ttl(&self) -> Duration {
        Duration::from_millis(self.seen_ttl_ms)
    }

    /// Seen-cache sweep period
    pub fn seen_sweep_interval(&self) -> Duration {
        Duration::from_millis(self.seen_sweep_interval_ms)
    }

    /// Neighbor snapshot lifetime
    pub fn neighbor_ttl(&self) -> Duration {
        Duration::from_millis(self.neighbor_ttl_ms)
    }

    /// Hop estimate lifetime
    pub fn hop_estimate_ttl(&self) -> Duration {
        Duration::from_millis(self.hop_estimate_ttl_ms)
    }

    /// Topology sweep period
    pub fn topology_sweep_interval(&self) -> Duration {
        Duration::from_millis(self.topology_sweep_interval_ms)
    }

    /// Rewiring analysis period
    pub fn rewire_interval(&self) -> Duration {
        Duration::from_millis(self.rewire_interval_ms)
    }

    /// Minimum spacing between rewires, also the drop cooldown
    pub fn rewire_cooldown(&self) -> Duration {
        Duration::from_millis(self.rewire_cooldown_ms)
    }

    /// Island-discovery analysis period
    pub fn island_interval(&self) -> Duration {
        Duration::from_millis(self.island_interval_ms)
    }

    /// Discovery mode window
    pub fn discovery_window(&self) -> Duration {
        Duration::from_millis(self.discovery_window_ms)
    }

    /// Idle timeout for partial transfers
    pub fn file_timeout(&self) -> Duration {
        Duration::from_millis(self.file_timeout_ms)
    }

    /// Reassembly sweep period
    pub fn file_sweep_interval(&self) -> Duration {
        Duration::from_millis(self.file_sweep_interval_ms)
    }

    /// Connection maintenance period
    pub fn maintenance_interval(&self) -> Duration {
        Duration::from_millis(self.maintenance_interval_ms)
    }

    /// Pending request timeout
    pub fn connect_timeout(&self) -> Duration {
        Duration::from_millis(self.connect_timeout_ms)
    }

    /// First retry delay
    pub fn retry_base_delay(&self) -> Duration {
        Duration::from_millis(self.retry_base_delay_ms)
    }

    /// Retry delay ceiling
    pub fn retry_max_delay(&self) -> Duration {
        Duration::from_millis(self.retry_max_delay_ms)
    }
}
