//! Tidemesh Mesh - self-healing gossip overlay for short-range radio links
//!
//! Nodes hold a handful of direct links each (bounded by a soft target and a
//! hard maximum) and flood application messages across them. There is no
//! central coordinator and no global view: the overlay keeps itself connected
//! and short using only what each node can see locally.
//!
//! # Core Components
//!
//! - **Gossip Router**: flood-fill forwarding with per-node duplicate suppression
//! - **Connection Manager**: target/max admission, retries with backoff, discovery mode
//! - **Topology Optimizer**: neighbor gossip, hop estimates, rewiring, island discovery
//! - **File Reassembly**: chunked file transfer over the gossip layer
//! - **Memory Network**: in-process transport for simulations and tests
//!
//! # Example Usage
//!
//! ```rust,no_run
//! use std::sync::Arc;
//! use tidemesh_mesh::{DirectoryFileSink, LoggingDispatcher, MemoryNetwork, MeshConfig, MeshNode};
//!
//! # async fn run() -> Result<(), Box<dyn std::error::Error>> {
//! let network = MemoryNetwork::new();
//! let (transport, events) = network.register("node-1");
//! let node = MeshNode::new(
//!     MeshConfig::default(),
//!     transport,
//!     events,
//!     Arc::new(LoggingDispatcher),
//!     Arc::new(DirectoryFileSink::new("received")),
//! )?;
//!
//! node.start()?;
//! node.broadcast_command(b"status".to_vec())?;
//! println!("Peers: {}", node.status().peer_count);
//! node.stop().await;
//! # Ok(())
//! # }
//! ```

#![warn(missing_docs)]

pub mod config;
pub mod connection;
pub mod dedup;
pub mod delivery;
pub mod envelope;
pub mod error;
pub mod gossip;
pub mod memory;
pub mod node;
pub mod peer;
pub mod reassembly;
pub mod topology;

// Re-export main types
pub use config::MeshConfig;
pub use connection::{ConnectionManager, Transport, TransportEvent};
pub use delivery::{CommandDispatcher, Delivery, DirectoryFileSink, FileSink, LoggingDispatcher};
pub use envelope::{Envelope, EnvelopeId, FileChunk, FileId, Frame, NeighborAnnouncement, Payload};
pub use error::{MeshError, MeshResult};
pub use gossip::{Fanout, GossipRouter, RouteOutcome, RouterCounters};
pub use memory::{MemoryNetwork, MemoryTransport};
pub use node::{MeshNode, MeshStatus};
pub use peer::{ConnectionLimits, PeerId, PeerState, PeerTable, RequestKind, RetryPolicy};
pub use reassembly::{chunk_file, CompletedFile, FileReassemblyManager};
pub use topology::{RewirePlan, TopologyOptimizer, Triangle};
