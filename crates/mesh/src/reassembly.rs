//! File transfer chunking and reassembly.
//!
//! Chunks travel as independent gossip envelopes, so they arrive in any order
//! and possibly more than once. A transfer completes when every index in
//! `0..total_chunks` is present; partial transfers that stop making progress
//! are discarded after a timeout.

use crate::envelope::{FileChunk, FileId};
use parking_lot::Mutex;
use std::collections::{BTreeMap, HashMap};
use std::time::Duration;
use tokio::time::Instant;
use tracing::{debug, info, warn};
use uuid::Uuid;

/// A fully reassembled file, ready to save
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CompletedFile {
    /// Transfer id
    pub file_id: FileId,
    /// Where to save it
    pub destination_path: String,
    /// File contents, in chunk order
    pub bytes: Vec<u8>,
}

#[derive(Debug)]
struct PartialTransfer {
    destination_path: String,
    total_chunks: u32,
    chunks: BTreeMap<u32, Vec<u8>>,
    last_chunk_at: Instant,
}

/// Split `bytes` into chunks of at most `chunk_size` under a fresh file id.
///
/// An empty file still produces one (empty) chunk.
pub fn chunk_file(destination_path: &str, bytes: &[u8], chunk_size: usize) -> Vec<FileChunk> {
    let file_id = Uuid::new_v4().to_string();
    let chunk_size = chunk_size.max(1);

    let pieces: Vec<&[u8]> = if bytes.is_empty() {
        vec![&[][..]]
    } else {
        bytes.chunks(chunk_size).collect()
    };
    let total_chunks = pieces.len() as u32;

    pieces
        .into_iter()
        .enumerate()
        .map(|(index, data)| FileChunk {
            file_id: file_id.clone(),
            destination_path: destination_path.to_string(),
            chunk_index: index as u32,
            total_chunks,
            data: data.to_vec(),
        })
        .collect()
}

#[derive(Debug, Default)]
struct ReassemblyState {
    transfers: HashMap<FileId, PartialTransfer>,
    /// Recently finished ids, so stragglers do not reopen a transfer
    completed: HashMap<FileId, Instant>,
}

/// Collects chunks per file id until each transfer is complete
#[derive(Debug)]
pub struct FileReassemblyManager {
    state: Mutex<ReassemblyState>,
    timeout: Duration,
}

impl FileReassemblyManager {
    /// Create a manager that abandons idle transfers after `timeout`
    pub fn new(timeout: Duration) -> Self {
        Self {
            state: Mutex::new(ReassemblyState::default()),
            timeout,
        }
    }

    /// Store one chunk. Returns the file once its last missing chunk arrives.
    pub fn handle_chunk(&self, chunk: FileChunk, now: Instant) -> Option<CompletedFile> {
        if let Err(e) = chunk.validate() {
            warn!("Dropping invalid file chunk: {}", e);
            return None;
        }

        let mut state = self.state.lock();
        if state.completed.contains_key(&chunk.file_id) {
            debug!(file_id = %chunk.file_id, "Ignoring chunk of completed file");
            return None;
        }

        let transfer = state
            .transfers
            .entry(chunk.file_id.clone())
            .or_insert_with(|| PartialTransfer {
                destination_path: chunk.destination_path.clone(),
                total_chunks: chunk.total_chunks,
                chunks: BTreeMap::new(),
                last_chunk_at: now,
            });

        if transfer.total_chunks != chunk.total_chunks
            || transfer.destination_path != chunk.destination_path
        {
            warn!(
                file_id = %chunk.file_id,
                chunk_index = chunk.chunk_index,
                "Dropping chunk inconsistent with earlier chunks of the same file"
            );
            return None;
        }

        transfer.last_chunk_at = now;
        transfer.chunks.insert(chunk.chunk_index, chunk.data);

        if transfer.chunks.len() < transfer.total_chunks as usize {
            debug!(
                file_id = %chunk.file_id,
                received = transfer.chunks.len(),
                total = transfer.total_chunks,
                "Stored file chunk"
            );
            return None;
        }

        let transfer = state.transfers.remove(&chunk.file_id)?;
        state.completed.insert(chunk.file_id.clone(), now);
        let bytes: Vec<u8> = transfer.chunks.into_values().flatten().collect();
        info!(
            file_id = %chunk.file_id,
            destination = %transfer.destination_path,
            size = bytes.len(),
            "File reassembled"
        );
        Some(CompletedFile {
            file_id: chunk.file_id,
            destination_path: transfer.destination_path,
            bytes,
        })
    }

    /// Discard transfers with no new chunk within the timeout
    pub fn sweep(&self, now: Instant) -> usize {
        let timeout = self.timeout;
        let mut state = self.state.lock();
        state
            .completed
            .retain(|_, finished_at| now.saturating_duration_since(*finished_at) < timeout);

        let before = state.transfers.len();
        state.transfers.retain(|file_id, transfer| {
            let alive = now.saturating_duration_since(transfer.last_chunk_at) < timeout;
            if !alive {
                warn!(
                    file_id = %file_id,
                    received = transfer.chunks.len(),
                    total = transfer.total_chunks,
                    "Discarding incomplete file transfer"
                );
            }
            alive
        });
        before - state.transfers.len()
    }

    /// Number of incomplete transfers
    pub fn in_progress(&self) -> usize {
        self.state.lock().transfers.len()
    }

    /// Drop all partial transfers
    pub fn clear(&self) {
        let mut state = self.state.lock();
        state.transfers.clear();
        state.completed.clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rand::rngs::StdRng;
    use rand::seq::SliceRandom;
    use rand::SeedableRng;

    fn sample_bytes(len: usize) -> Vec<u8> {
        (0..len).map(|i| (i % 256) as u8).collect()
    }

    #[test]
    fn test_chunk_file_sizes() {
        let chunks = chunk_file("out/a.bin", &sample_bytes(40), 16);
        assert_eq!(chunks.len(), 3);
        assert!(chunks.iter().all(|c| c.total_chunks == 3));
        assert_eq!(chunks[2].data.len(), 8);
        assert!(chunks.iter().all(|c| c.file_id == chunks[0].file_id));
    }

    #[test]
    fn test_empty_file_is_one_chunk() {
        let chunks = chunk_file("empty", &[], 16);
        assert_eq!(chunks.len(), 1);

        let manager = FileReassemblyManager::new(Duration::from_secs(300));
        let done = manager
            .handle_chunk(chunks[0].clone(), Instant::now())
            .unwrap();
        assert!(done.bytes.is_empty());
    }

    #[test]
    fn test_out_of_order_with_duplicates() {
        let data = sample_bytes(1000);
        let mut chunks = chunk_file("dir/file.bin", &data, 64);
        let extra: Vec<FileChunk> = chunks.iter().step_by(3).cloned().collect();
        chunks.extend(extra);

        let mut rng = StdRng::seed_from_u64(7);
        chunks.shuffle(&mut rng);

        let manager = FileReassemblyManager::new(Duration::from_secs(300));
        let now = Instant::now();
        let mut completed = Vec::new();
        for chunk in chunks {
            if let Some(file) = manager.handle_chunk(chunk, now) {
                completed.push(file);
            }
        }

        assert_eq!(completed.len(), 1);
        assert_eq!(completed[0].bytes, data);
        assert_eq!(completed[0].destination_path, "dir/file.bin");
        assert_eq!(manager.in_progress(), 0);
    }

    #[test]
    fn test_inconsistent_total_dropped() {
        let manager = FileReassemblyManager::new(Duration::from_secs(300));
        let now = Instant::now();
        let mut chunks = chunk_file("f", &sample_bytes(32), 16);

        assert!(manager.handle_chunk(chunks[0].clone(), now).is_none());
        chunks[1].total_chunks = 5;
        assert!(manager.handle_chunk(chunks[1].clone(), now).is_none());
        assert_eq!(manager.in_progress(), 1);
    }

    #[test]
    fn test_idle_transfer_discarded() {
        let manager = FileReassemblyManager::new(Duration::from_secs(300));
        let start = Instant::now();
        let chunks = chunk_file("f", &sample_bytes(32), 16);

        manager.handle_chunk(chunks[0].clone(), start);
        assert_eq!(manager.sweep(start + Duration::from_secs(299)), 0);
        assert_eq!(manager.sweep(start + Duration::from_secs(300)), 1);

        // The late chunk starts a fresh transfer rather than completing
        assert!(manager
            .handle_chunk(chunks[1].clone(), start + Duration::from_secs(301))
            .is_none());
        assert_eq!(manager.in_progress(), 1);
    }

    #[test]
    fn test_straggler_after_completion_ignored() {
        let manager = FileReassemblyManager::new(Duration::from_secs(300));
        let start = Instant::now();
        let chunks = chunk_file("f", &sample_bytes(32), 16);

        assert!(manager.handle_chunk(chunks[0].clone(), start).is_none());
        assert!(manager.handle_chunk(chunks[1].clone(), start).is_some());
        assert!(manager.handle_chunk(chunks[0].clone(), start).is_none());
        assert_eq!(manager.in_progress(), 0);

        manager.sweep(start + Duration::from_secs(300));
        assert!(manager.handle_chunk(chunks[0].clone(), start + Duration::from_secs(301)).is_none());
        assert_eq!(manager.in_progress(), 1);
    }
}
