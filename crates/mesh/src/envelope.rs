//! Wire types: envelopes, file chunks and the frames that carry them.
//!
//! Frames are encoded with bincode, which writes `Vec<u8>` fields as a length
//! prefix followed by the raw bytes. Chunk data therefore crosses the wire
//! untouched; nothing here ever passes payload bytes through a string.

use crate::error::{MeshError, MeshResult};
use crate::peer::PeerId;
use bincode::Options;
use serde::{Deserialize, Serialize};

/// Envelope identifier, the deduplication key
pub type EnvelopeId = String;

/// Groups the chunks of one file transfer
pub type FileId = String;

/// Largest frame accepted off the wire
pub const MAX_FRAME_BYTES: u64 = 1024 * 1024;

/// One slice of a file transfer
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FileChunk {
    /// Transfer this chunk belongs to
    pub file_id: FileId,
    /// Where the receiver should save the finished file
    pub destination_path: String,
    /// Position of this chunk, `0..total_chunks`
    pub chunk_index: u32,
    /// Number of chunks in the transfer
    pub total_chunks: u32,
    /// Raw chunk bytes
    pub data: Vec<u8>,
}

impl FileChunk {
    /// Check the index/total invariant
    pub fn validate(&self) -> MeshResult<()> {
        if self.file_id.is_empty() {
            return Err(MeshError::MalformedEnvelope("empty file id".to_string()));
        }
        if self.total_chunks == 0 {
            return Err(MeshError::MalformedEnvelope(format!(
                "file {} declares zero chunks",
                self.file_id
            )));
        }
        if self.chunk_index >= self.total_chunks {
            return Err(MeshError::MalformedEnvelope(format!(
                "chunk index {} out of range for {} chunks (file {})",
                self.chunk_index, self.total_chunks, self.file_id
            )));
        }
        Ok(())
    }
}

/// What an envelope carries
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum Payload {
    /// Opaque command descriptor, interpreted only by the dispatcher
    Command(Vec<u8>),
    /// Part of a file transfer
    FileChunk(FileChunk),
}

/// Flood-forwarded message
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Envelope {
    /// Unique id, fixed at origin
    pub id: EnvelopeId,
    /// Node that originated the envelope
    pub origin: PeerId,
    /// Number of forwards so far
    pub hop_count: u32,
    /// Carried payload
    pub payload: Payload,
}

impl Envelope {
    /// Create a fresh envelope at its origin
    pub fn new(origin: PeerId, payload: Payload) -> Self {
        Self {
            id: uuid::Uuid::new_v4().to_string(),
            origin,
            hop_count: 0,
            payload,
        }
    }

    /// Copy for the next hop
    pub fn forwarded(&self) -> Self {
        Self {
            hop_count: self.hop_count.saturating_add(1),
            ..self.clone()
        }
    }

    fn validate(&self) -> MeshResult<()> {
        if self.id.is_empty() {
            return Err(MeshError::MalformedEnvelope("empty envelope id".to_string()));
        }
        if self.origin.is_empty() {
            return Err(MeshError::MalformedEnvelope(format!(
                "envelope {} has no origin",
                self.id
            )));
        }
        match &self.payload {
            Payload::Command(_) => Ok(()),
            Payload::FileChunk(chunk) => chunk.validate(),
        }
    }
}

/// A node's current direct peers, sent one hop only
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NeighborAnnouncement {
    /// Connected peer ids of the sender
    pub peers: Vec<PeerId>,
}

/// Unit exchanged between directly connected peers
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum Frame {
    /// Flood-forwarded envelope
    Gossip(Envelope),
    /// Single-hop topology gossip
    Neighbors(NeighborAnnouncement),
}

fn codec() -> impl Options {
    bincode::DefaultOptions::new().with_limit(MAX_FRAME_BYTES)
}

impl Frame {
    /// Serialize for the transport
    pub fn encode(&self) -> MeshResult<Vec<u8>> {
        Ok(codec().serialize(self)?)
    }

    /// Parse and validate bytes received from a peer
    pub fn decode(bytes: &[u8]) -> MeshResult<Self> {
        let frame: Frame = codec()
            .deserialize(bytes)
            .map_err(|e| MeshError::MalformedEnvelope(e.to_string()))?;
        if let Frame::Gossip(envelope) = &frame {
            envelope.validate()?;
        }
        Ok(frame)
    }
}
