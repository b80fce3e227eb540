//! Mesh node - per-node coordinator
//!
//! Owns the connection manager, gossip router, topology optimizer and file
//! reassembly for one node, runs the inbound event loop over the transport's
//! event channel and drives every periodic task. All tasks share one
//! lifecycle: `start` spawns them together and `stop` cancels them together
//! and clears every piece of in-memory state.

use crate::config::MeshConfig;
use crate::connection::{ConnectionManager, Transport, TransportEvent};
use crate::delivery::{run_delivery_worker, CommandDispatcher, Delivery, FileSink};
use crate::envelope::{Envelope, EnvelopeId, FileId, Frame, Payload};
use crate::error::{MeshError, MeshResult};
use crate::gossip::{GossipRouter, RouterCounters};
use crate::peer::PeerId;
use crate::reassembly::{chunk_file, FileReassemblyManager};
use crate::topology::{OptimizerSettings, RewirePlan, TopologyOptimizer};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio::time::{Instant, MissedTickBehavior};
use tracing::{debug, error, info, trace, warn};

/// State shared by the node handle and its tasks
struct NodeShared {
    node_id: PeerId,
    config: MeshConfig,
    connections: ConnectionManager,
    router: GossipRouter,
    optimizer: TopologyOptimizer,
    reassembly: FileReassemblyManager,
    deliveries: Mutex<Option<mpsc::UnboundedSender<Delivery>>>,
    dispatcher: Arc<dyn CommandDispatcher>,
    sink: Arc<dyn FileSink>,
}

impl NodeShared {
    fn handle_event(&self, event: TransportEvent) {
        match event {
            TransportEvent::PeerDiscovered(peer_id) => {
                self.connections.on_peer_discovered(&peer_id)
            }
            TransportEvent::PeerLost(peer_id) => self.connections.on_peer_lost(&peer_id),
            TransportEvent::ConnectionRequested(peer_id) => {
                self.connections.on_connection_requested(&peer_id)
            }
            TransportEvent::Connected(peer_id) => {
                self.connections.on_connected(&peer_id);
            }
            TransportEvent::ConnectionFailed { peer_id, reason } => {
                self.connections.on_connection_failed(&peer_id, &reason)
            }
            TransportEvent::Disconnected(peer_id) => {
                self.connections.on_disconnected(&peer_id);
                self.optimizer.forget_peer(&peer_id);
            }
            TransportEvent::Received { from, bytes } => self.handle_frame(&from, &bytes),
        }
    }

    fn handle_frame(&self, from: &str, bytes: &[u8]) {
        let now = Instant::now();
        match Frame::decode(bytes) {
            Ok(Frame::Gossip(envelope)) => {
                self.router
                    .on_receive(&self.connections, from, envelope, now, |envelope| {
                        self.deliver_locally(envelope, now)
                    });
            }
            Ok(Frame::Neighbors(announcement)) => {
                trace!(from = %from, peers = announcement.peers.len(), "Neighbor announcement");
                self.optimizer.record_neighbors(from, announcement, now);
            }
            Err(e) => {
                self.router.record_malformed();
                warn!(from = %from, size = bytes.len(), "Dropping malformed frame: {}", e);
            }
        }
    }

    fn deliver_locally(&self, envelope: &Envelope, now: Instant) {
        self.optimizer
            .observe_envelope(&envelope.origin, envelope.hop_count, now);

        match &envelope.payload {
            Payload::Command(bytes) => self.enqueue(Delivery::Command {
                origin: envelope.origin.clone(),
                bytes: bytes.clone(),
            }),
            Payload::FileChunk(chunk) => {
                if let Some(file) = self.reassembly.handle_chunk(chunk.clone(), now) {
                    self.enqueue(Delivery::File(file));
                }
            }
        }
    }

    fn enqueue(&self, delivery: Delivery) {
        match self.deliveries.lock().as_ref() {
            Some(tx) => {
                if tx.send(delivery).is_err() {
                    error!(node_id = %self.node_id, "Delivery worker is gone; dropping delivery");
                }
            }
            None => debug!(node_id = %self.node_id, "Node stopped; dropping delivery"),
        }
    }

    fn clear(&self) {
        self.router.clear();
        self.optimizer.clear();
        self.reassembly.clear();
    }
}

/// Operational snapshot of a node
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MeshStatus {
    /// Node identifier
    pub node_id: String,
    /// Whether the node's tasks are running
    pub running: bool,
    /// Connected peers, sorted
    pub peers: Vec<PeerId>,
    /// Number of connected peers
    pub peer_count: usize,
    /// Whether discovery mode is open
    pub discovery_mode: bool,
    /// Envelope ids currently remembered
    pub seen_envelopes: usize,
    /// Stored neighbor snapshots
    pub neighbor_snapshots: usize,
    /// Stored hop estimates
    pub hop_estimates: usize,
    /// Incomplete inbound file transfers
    pub transfers_in_progress: usize,
    /// Gossip router counters
    pub router: RouterCounters,
}

/// A single mesh participant
pub struct MeshNode {
    shared: Arc<NodeShared>,
    events: Arc<tokio::sync::Mutex<mpsc::UnboundedReceiver<TransportEvent>>>,
    tasks: Mutex<Vec<JoinHandle<()>>>,
    running: AtomicBool,
}

impl MeshNode {
    /// Create a node over `transport`, reading transport events from `events`
    pub fn new(
        config: MeshConfig,
        transport: Arc<dyn Transport>,
        events: mpsc::UnboundedReceiver<TransportEvent>,
        dispatcher: Arc<dyn CommandDispatcher>,
        sink: Arc<dyn FileSink>,
    ) -> MeshResult<Self> {
        config.validate()?;
        let node_id = transport.local_id().to_string();
        if node_id.is_empty() {
            return Err(MeshError::Config("node id must not be empty".to_string()));
        }

        let settings = OptimizerSettings {
            neighbor_ttl: config.neighbor_ttl(),
            hop_estimate_ttl: config.hop_estimate_ttl(),
            rewire_cooldown: config.rewire_cooldown(),
            discovery_window: config.discovery_window(),
        };
        let shared = NodeShared {
            node_id: node_id.clone(),
            connections: ConnectionManager::new(transport, &config),
            router: GossipRouter::new(node_id.clone(), config.seen_ttl()),
            optimizer: TopologyOptimizer::new(node_id, settings),
            reassembly: FileReassemblyManager::new(config.file_timeout()),
            deliveries: Mutex::new(None),
            dispatcher,
            sink,
            config,
        };

        Ok(Self {
            shared: Arc::new(shared),
            events: Arc::new(tokio::sync::Mutex::new(events)),
            tasks: Mutex::new(Vec::new()),
            running: AtomicBool::new(false),
        })
    }

    /// Node identifier
    pub fn node_id(&self) -> &str {
        &self.shared.node_id
    }

    /// Active configuration
    pub fn config(&self) -> &MeshConfig {
        &self.shared.config
    }

    /// Whether the node is running
    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::SeqCst)
    }

    /// Start the transport, the event loop, the delivery worker and every
    /// periodic task. Must be called from within a tokio runtime.
    pub fn start(&self) -> MeshResult<()> {
        if self.running.swap(true, Ordering::SeqCst) {
            return Err(MeshError::InvalidState(format!(
                "node {} already running",
                self.shared.node_id
            )));
        }

        let mut tasks = self.tasks.lock();

        let (tx, rx) = mpsc::unbounded_channel();
        *self.shared.deliveries.lock() = Some(tx);
        tasks.push(tokio::spawn(run_delivery_worker(
            rx,
            Arc::clone(&self.shared.dispatcher),
            Arc::clone(&self.shared.sink),
        )));

        let shared = Arc::clone(&self.shared);
        let events = Arc::clone(&self.events);
        tasks.push(tokio::spawn(async move {
            let mut events = events.lock().await;
            while let Some(event) = events.recv().await {
                shared.handle_event(event);
            }
            debug!(node_id = %shared.node_id, "Transport event stream closed");
        }));

        let config = &self.shared.config;
        tasks.push(self.spawn_periodic("neighbor-gossip", config.gossip_interval(), |shared| {
            if let Err(e) = shared.optimizer.gossip_neighbors(&shared.connections) {
                warn!(node_id = %shared.node_id, "Neighbor gossip failed: {}", e);
            }
        }));
        tasks.push(self.spawn_periodic("rewiring", config.rewire_interval(), |shared| {
            shared.optimizer.run_rewiring(&shared.connections);
        }));
        tasks.push(self.spawn_periodic("island-discovery", config.island_interval(), |shared| {
            shared.optimizer.run_island_discovery(&shared.connections);
        }));
        tasks.push(self.spawn_periodic("seen-sweep", config.seen_sweep_interval(), |shared| {
            let evicted = shared.router.sweep(Instant::now());
            if evicted > 0 {
                trace!(node_id = %shared.node_id, evicted, "Swept seen cache");
            }
        }));
        tasks.push(self.spawn_periodic("topology-sweep", config.topology_sweep_interval(), |shared| {
            let (snapshots, estimates) = shared.optimizer.sweep(Instant::now());
            if snapshots + estimates > 0 {
                trace!(node_id = %shared.node_id, snapshots, estimates, "Swept topology state");
            }
        }));
        tasks.push(self.spawn_periodic("file-sweep", config.file_sweep_interval(), |shared| {
            shared.reassembly.sweep(Instant::now());
        }));
        tasks.push(self.spawn_periodic("maintenance", config.maintenance_interval(), |shared| {
            shared.connections.maintain();
        }));
        drop(tasks);

        if let Err(e) = self.shared.connections.start() {
            error!(node_id = %self.shared.node_id, "Transport failed to start: {}", e);
            self.abort_tasks();
            self.shared.deliveries.lock().take();
            self.running.store(false, Ordering::SeqCst);
            return Err(e);
        }

        info!(node_id = %self.shared.node_id, "Mesh node started");
        Ok(())
    }

    fn spawn_periodic<F>(&self, name: &'static str, period: Duration, tick: F) -> JoinHandle<()>
    where
        F: Fn(&NodeShared) + Send + 'static,
    {
        let shared = Arc::clone(&self.shared);
        tokio::spawn(async move {
            let mut interval = tokio::time::interval_at(Instant::now() + period, period);
            interval.set_missed_tick_behavior(MissedTickBehavior::Delay);
            loop {
                interval.tick().await;
                trace!(node_id = %shared.node_id, task = name, "Periodic task tick");
                tick(&shared);
            }
        })
    }

    fn abort_tasks(&self) -> Vec<JoinHandle<()>> {
        let handles = std::mem::take(&mut *self.tasks.lock());
        for handle in &handles {
            handle.abort();
        }
        handles
    }

    /// Cancel every task, disconnect all peers, stop the transport and clear
    /// all in-memory state. The node can be started again afterwards.
    pub async fn stop(&self) {
        if !self.running.swap(false, Ordering::SeqCst) {
            return;
        }

        for handle in self.abort_tasks() {
            // Cancelled tasks resolve with a JoinError
            let _ = handle.await;
        }
        self.shared.deliveries.lock().take();
        self.shared.connections.shutdown();
        self.shared.clear();

        // Events that arrived while shutting down belong to the old session
        if let Ok(mut events) = self.events.try_lock() {
            while events.try_recv().is_ok() {}
        }

        info!(node_id = %self.shared.node_id, "Mesh node stopped");
    }

    /// Originate an envelope and flood it to the mesh
    pub fn originate(&self, payload: Payload) -> MeshResult<EnvelopeId> {
        let envelope = self
            .shared
            .router
            .originate(&self.shared.connections, payload, Instant::now())?;
        Ok(envelope.id)
    }

    /// Broadcast an opaque command to every reachable node
    pub fn broadcast_command(&self, command: Vec<u8>) -> MeshResult<EnvelopeId> {
        self.originate(Payload::Command(command))
    }

    /// Split `bytes` into chunks and originate one envelope per chunk
    pub fn send_file(&self, destination_path: &str, bytes: &[u8]) -> MeshResult<FileId> {
        let chunks = chunk_file(destination_path, bytes, self.shared.config.chunk_size);
        let file_id = chunks
            .first()
            .map(|chunk| chunk.file_id.clone())
            .ok_or_else(|| MeshError::InvalidState("file produced no chunks".to_string()))?;

        let total = chunks.len();
        for chunk in chunks {
            self.originate(Payload::FileChunk(chunk))?;
        }
        info!(
            node_id = %self.shared.node_id,
            file_id = %file_id,
            destination = %destination_path,
            chunks = total,
            "File sent"
        );
        Ok(file_id)
    }

    /// Currently connected peers, sorted
    pub fn connected_peers(&self) -> Vec<PeerId> {
        self.shared.connections.connected_peers()
    }

    /// Run one rewiring analysis now
    pub fn run_rewiring_analysis(&self) -> Option<RewirePlan> {
        self.shared.optimizer.run_rewiring(&self.shared.connections)
    }

    /// Run one island-discovery analysis now
    pub fn run_island_discovery(&self) -> Option<PeerId> {
        self.shared
            .optimizer
            .run_island_discovery(&self.shared.connections)
    }

    /// Send our neighbor list to every peer now
    pub fn gossip_neighbors(&self) -> MeshResult<usize> {
        self.shared
            .optimizer
            .gossip_neighbors(&self.shared.connections)
    }

    /// Run one connection maintenance pass now
    pub fn maintain(&self) {
        self.shared.connections.maintain();
    }

    /// Last observed hop count to `node_id`
    pub fn hop_estimate(&self, node_id: &str) -> Option<u32> {
        self.shared.optimizer.hop_estimate(node_id, Instant::now())
    }

    /// Snapshot of the node's state
    pub fn status(&self) -> MeshStatus {
        let shared = &self.shared;
        let peers = shared.connections.connected_peers();
        MeshStatus {
            node_id: shared.node_id.clone(),
            running: self.is_running(),
            peer_count: peers.len(),
            peers,
            discovery_mode: shared.connections.discovery_mode_active(),
            seen_envelopes: shared.router.seen_count(),
            neighbor_snapshots: shared.optimizer.neighbor_snapshot_count(),
            hop_estimates: shared.optimizer.hop_estimate_count(),
            transfers_in_progress: shared.reassembly.in_progress(),
            router: shared.router.counters(),
        }
    }
}

impl Drop for MeshNode {
    fn drop(&mut self) {
        self.abort_tasks();
    }
}
