//! Local delivery of commands and reassembled files.
//!
//! The inbound loop only enqueues; a separate worker calls the application
//! hooks so a slow dispatcher or disk never stalls routing.

use crate::error::{MeshError, MeshResult};
use crate::peer::PeerId;
use crate::reassembly::CompletedFile;
use std::path::{Component, Path, PathBuf};
use std::sync::Arc;
use tokio::sync::mpsc;
use tracing::{debug, error};

/// Receives command payloads addressed to this node
pub trait CommandDispatcher: Send + Sync {
    /// Handle an opaque command descriptor originated by `origin`
    fn dispatch(&self, origin: &str, command: &[u8]) -> MeshResult<()>;
}

/// Persists reassembled files
pub trait FileSink: Send + Sync {
    /// Save `bytes` at `destination_path`. May block.
    fn save(&self, destination_path: &str, bytes: &[u8]) -> MeshResult<()>;
}

/// Work item for the delivery worker
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Delivery {
    /// A command envelope's payload
    Command {
        /// Originating node
        origin: PeerId,
        /// Opaque command bytes
        bytes: Vec<u8>,
    },
    /// A fully reassembled file
    File(CompletedFile),
}

/// Dispatcher that only logs, for nodes without a command handler
#[derive(Debug, Default, Clone, Copy)]
pub struct LoggingDispatcher;

impl CommandDispatcher for LoggingDispatcher {
    fn dispatch(&self, origin: &str, command: &[u8]) -> MeshResult<()> {
        debug!(origin = %origin, size = command.len(), "Command received");
        Ok(())
    }
}

/// Writes files under a root directory
#[derive(Debug, Clone)]
pub struct DirectoryFileSink {
    root: PathBuf,
}

impl DirectoryFileSink {
    /// Create a sink rooted at `root`
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    /// Root directory
    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Resolve `destination_path` under the root, refusing escapes
    pub fn resolve(&self, destination_path: &str) -> MeshResult<PathBuf> {
        let relative = Path::new(destination_path);
        if destination_path.is_empty() {
            return Err(MeshError::InvalidState("empty destination path".to_string()));
        }
        for component in relative.components() {
            match component {
                Component::Normal(_) | Component::CurDir => {}
                _ => {
                    return Err(MeshError::InvalidState(format!(
                        "destination path escapes sink root: {}",
                        destination_path
                    )))
                }
            }
        }
        Ok(self.root.join(relative))
    }
}

impl FileSink for DirectoryFileSink {
    fn save(&self, destination_path: &str, bytes: &[u8]) -> MeshResult<()> {
        let path = self.resolve(destination_path)?;
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        std::fs::write(&path, bytes)?;
        debug!(path = %path.display(), size = bytes.len(), "File saved");
        Ok(())
    }
}

/// Consume deliveries until the channel closes or the task is aborted
pub async fn run_delivery_worker(
    mut deliveries: mpsc::UnboundedReceiver<Delivery>,
    dispatcher: Arc<dyn CommandDispatcher>,
    sink: Arc<dyn FileSink>,
) {
    while let Some(delivery) = deliveries.recv().await {
        match delivery {
            Delivery::Command { origin, bytes } => {
                if let Err(e) = dispatcher.dispatch(&origin, &bytes) {
                    error!(origin = %origin, "Command dispatch failed: {}", e);
                }
            }
            Delivery::File(file) => {
                let sink = sink.clone();
                let file_id = file.file_id.clone();
                let result = tokio::task::spawn_blocking(move || {
                    sink.save(&file.destination_path, &file.bytes)
                })
                .await;
                match result {
                    Ok(Ok(())) => {}
                    Ok(Err(e)) => error!(file_id = %file_id, "Failed to save file: {}", e),
                    Err(e) => error!(file_id = %file_id, "File save task failed: {}", e),
                }
            }
        }
    }
    debug!("Delivery worker finished");
}
