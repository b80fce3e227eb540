//! Error types for Tidemesh mesh operations.
//!
//! Every failure here is local to one message, peer or transfer. Callers log
//! and carry on; nothing in this enum is meant to stop a running node.

use thiserror::Error;

/// Errors that can occur in mesh operations.
#[derive(Debug, Error)]
pub enum MeshError {
    /// Transport refused or failed a connect/send
    #[error("Transport error with peer {peer_id}: {reason}")]
    Transport {
        /// Peer the operation targeted
        peer_id: String,
        /// Transport-specific reason
        reason: String,
    },

    /// Peer is not currently connected
    #[error("Peer not connected: {peer_id}")]
    NotConnected {
        /// Peer that has no live link
        peer_id: String,
    },

    /// Connection slots are exhausted
    #[error("Capacity exceeded for peer {peer_id}: max {max} connections")]
    CapacityExceeded {
        /// Peer that could not be admitted
        peer_id: String,
        /// Configured hard cap
        max: usize,
    },

    /// Frame failed to decode or violates a wire invariant
    #[error("Malformed envelope: {0}")]
    MalformedEnvelope(String),

    /// Frame failed to encode
    #[error("Encoding error: {0}")]
    Encoding(#[from] bincode::Error),

    /// Configuration errors
    #[error("Configuration error: {0}")]
    Config(String),

    /// Invalid state
    #[error("Invalid state: {0}")]
    InvalidState(String),

    /// Local I/O errors (file persistence)
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// The external command dispatcher rejected a command
    #[error("Dispatch error: {0}")]
    Dispatch(String),

    /// JSON (de)serialization errors
    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// TOML configuration parse errors
    #[error("TOML error: {0}")]
    TomlDe(#[from] toml::de::Error),
}

impl MeshError {
    /// Shorthand for a transport failure
    pub fn transport(peer_id: impl Into<String>, reason: impl Into<String>) -> Self {
        MeshError::Transport {
            peer_id: peer_id.into(),
            reason: reason.into(),
        }
    }
}

/// Result type for mesh operations.
pub type MeshResult<T> = Result<T, MeshError>;
