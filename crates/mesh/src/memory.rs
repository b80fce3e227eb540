//! In-process radio for simulations and tests.
//!
//! A [`MemoryNetwork`] plays the role of the air: it knows which nodes are in
//! range of each other, which links are up and which requests are pending, and
//! it reports everything to each node through that node's event channel, the
//! same way a real radio layer would.

use crate::connection::{Transport, TransportEvent};
use crate::error::{MeshError, MeshResult};
use crate::peer::PeerId;
use parking_lot::Mutex;
use std::collections::{BTreeSet, HashMap, HashSet};
use std::sync::Arc;
use tokio::sync::mpsc;
use tracing::trace;

fn pair(a: &str, b: &str) -> (PeerId, PeerId) {
    if a <= b {
        (a.to_string(), b.to_string())
    } else {
        (b.to_string(), a.to_string())
    }
}

#[derive(Debug)]
struct Station {
    events: mpsc::UnboundedSender<TransportEvent>,
    started: bool,
}

#[derive(Debug, Default)]
struct Air {
    stations: HashMap<PeerId, Station>,
    in_range: HashSet<(PeerId, PeerId)>,
    links: HashSet<(PeerId, PeerId)>,
    /// (requester, target)
    pending: HashSet<(PeerId, PeerId)>,
    attempts: Vec<(PeerId, PeerId)>,
}

impl Air {
    fn emit(&self, to: &str, event: TransportEvent) {
        if let Some(station) = self.stations.get(to) {
            trace!(to = %to, event = ?event, "Memory network event");
            // Receiver gone means the node was dropped
            let _ = station.events.send(event);
        }
    }

    fn is_started(&self, id: &str) -> bool {
        self.stations.get(id).map(|s| s.started).unwrap_or(false)
    }

    fn sever(&mut self, a: &str, b: &str) -> bool {
        self.pending
            .retain(|(from, to)| !((from == a && to == b) || (from == b && to == a)));
        self.links.remove(&pair(a, b))
    }
}

/// Shared medium connecting [`MemoryTransport`]s
#[derive(Debug)]
pub struct MemoryNetwork {
    air: Mutex<Air>,
    /// Every pair is in range unless this is false
    open_air: bool,
}

impl MemoryNetwork {
    /// Network where every node can discover every other node
    pub fn new() -> Arc<Self> {
        Arc::new(Self {
            air: Mutex::new(Air::default()),
            open_air: true,
        })
    }

    /// Network where nodes only see pairs made visible explicitly
    pub fn isolated() -> Arc<Self> {
        Arc::new(Self {
            air: Mutex::new(Air::default()),
            open_air: false,
        })
    }

    fn in_range(&self, air: &Air, a: &str, b: &str) -> bool {
        a != b && (self.open_air || air.in_range.contains(&pair(a, b)))
    }

    /// Add a node. Returns its transport and the event stream it reports on.
    pub fn register(
        self: &Arc<Self>,
        id: impl Into<PeerId>,
    ) -> (Arc<MemoryTransport>, mpsc::UnboundedReceiver<TransportEvent>) {
        let id = id.into();
        let (tx, rx) = mpsc::unbounded_channel();
        self.air.lock().stations.insert(
            id.clone(),
            Station {
                events: tx,
                started: false,
            },
        );
        let transport = Arc::new(MemoryTransport {
            id,
            network: Arc::clone(self),
        });
        (transport, rx)
    }

    /// Make `a` and `b` visible to each other's discovery
    pub fn set_in_range(&self, a: &str, b: &str) {
        let mut air = self.air.lock();
        let newly = air.in_range.insert(pair(a, b));
        if newly && !self.open_air && air.is_started(a) && air.is_started(b) {
            air.emit(a, TransportEvent::PeerDiscovered(b.to_string()));
            air.emit(b, TransportEvent::PeerDiscovered(a.to_string()));
        }
    }

    /// Move `a` and `b` out of range, dropping any link between them
    pub fn set_out_of_range(&self, a: &str, b: &str) {
        let mut air = self.air.lock();
        air.in_range.remove(&pair(a, b));
        if air.sever(a, b) {
            air.emit(a, TransportEvent::Disconnected(b.to_string()));
            air.emit(b, TransportEvent::Disconnected(a.to_string()));
        }
        air.emit(a, TransportEvent::PeerLost(b.to_string()));
        air.emit(b, TransportEvent::PeerLost(a.to_string()));
    }

    /// Bring up a link directly, as if the handshake had already happened.
    /// The pair is also marked in range.
    pub fn link(&self, a: &str, b: &str) {
        let mut air = self.air.lock();
        air.in_range.insert(pair(a, b));
        air.links.insert(pair(a, b));
        air.emit(a, TransportEvent::Connected(b.to_string()));
        air.emit(b, TransportEvent::Connected(a.to_string()));
    }

    /// Whether a link between `a` and `b` is up
    pub fn is_linked(&self, a: &str, b: &str) -> bool {
        self.air.lock().links.contains(&pair(a, b))
    }

    /// Every live link, each pair ordered
    pub fn links(&self) -> BTreeSet<(PeerId, PeerId)> {
        self.air.lock().links.iter().cloned().collect()
    }

    /// Every connection request made so far, as (requester, target)
    pub fn connection_attempts(&self) -> Vec<(PeerId, PeerId)> {
        self.air.lock().attempts.clone()
    }

    /// Connected components of the live link graph, including lone nodes
    pub fn components(&self) -> Vec<BTreeSet<PeerId>> {
        let air = self.air.lock();
        let mut adjacency: HashMap<&str, Vec<&str>> = HashMap::new();
        for (a, b) in &air.links {
            adjacency.entry(a).or_default().push(b);
            adjacency.entry(b).or_default().push(a);
        }

        let mut ids: Vec<&str> = air.stations.keys().map(String::as_str).collect();
        ids.sort_unstable();

        let mut visited: HashSet<&str> = HashSet::new();
        let mut components = Vec::new();
        for start in ids {
            if !visited.insert(start) {
                continue;
            }
            let mut component = BTreeSet::new();
            let mut stack = vec![start];
            while let Some(node) = stack.pop() {
                component.insert(node.to_string());
                for &next in adjacency.get(node).into_iter().flatten() {
                    if visited.insert(next) {
                        stack.push(next);
                    }
                }
            }
            components.push(component);
        }
        components
    }
}

/// One node's view of a [`MemoryNetwork`]
#[derive(Debug)]
pub struct MemoryTransport {
    id: PeerId,
    network: Arc<MemoryNetwork>,
}

impl MemoryTransport {
    /// The network this transport is attached to
    pub fn network(&self) -> &Arc<MemoryNetwork> {
        &self.network
    }
}

impl Transport for MemoryTransport {
    fn local_id(&self) -> &str {
        &self.id
    }

    fn start(&self) -> MeshResult<()> {
        let network = &self.network;
        let mut air = network.air.lock();
        let station = air
            .stations
            .get_mut(&self.id)
            .ok_or_else(|| MeshError::InvalidState(format!("{} is not registered", self.id)))?;
        if station.started {
            return Ok(());
        }
        station.started = true;

        let mut visible: Vec<PeerId> = air
            .stations
            .iter()
            .filter(|(other, station)| station.started && network.in_range(&air, &self.id, other))
            .map(|(other, _)| other.clone())
            .collect();
        visible.sort();
        for other in visible {
            air.emit(&self.id, TransportEvent::PeerDiscovered(other.clone()));
            air.emit(&other, TransportEvent::PeerDiscovered(self.id.clone()));
        }
        Ok(())
    }

    fn stop(&self) {
        let network = &self.network;
        let mut air = network.air.lock();
        match air.stations.get_mut(&self.id) {
            Some(station) if station.started => station.started = false,
            _ => return,
        }

        let others: Vec<PeerId> = air
            .stations
            .iter()
            .filter(|(other, station)| station.started && network.in_range(&air, &self.id, other))
            .map(|(other, _)| other.clone())
            .collect();
        for other in others {
            if air.sever(&self.id, &other) {
                air.emit(&other, TransportEvent::Disconnected(self.id.clone()));
            }
            air.emit(&other, TransportEvent::PeerLost(self.id.clone()));
        }
    }

    fn request_connection(&self, peer_id: &str) -> MeshResult<()> {
        let mut air = self.network.air.lock();
        air.attempts.push((self.id.clone(), peer_id.to_string()));

        if !air.is_started(&self.id) || !air.is_started(peer_id) {
            return Err(MeshError::transport(peer_id, "peer not reachable"));
        }
        if !self.network.in_range(&air, &self.id, peer_id) {
            return Err(MeshError::transport(peer_id, "peer out of range"));
        }
        air.pending.insert((self.id.clone(), peer_id.to_string()));
        air.emit(peer_id, TransportEvent::ConnectionRequested(self.id.clone()));
        Ok(())
    }

    fn accept_connection(&self, peer_id: &str) -> MeshResult<()> {
        let mut air = self.network.air.lock();
        let request = (peer_id.to_string(), self.id.clone());
        if !air.pending.remove(&request) {
            return Err(MeshError::transport(peer_id, "no pending request"));
        }
        air.links.insert(pair(&self.id, peer_id));
        air.emit(&self.id, TransportEvent::Connected(peer_id.to_string()));
        air.emit(peer_id, TransportEvent::Connected(self.id.clone()));
        Ok(())
    }

    fn reject_connection(&self, peer_id: &str) -> MeshResult<()> {
        let mut air = self.network.air.lock();
        let request = (peer_id.to_string(), self.id.clone());
        if !air.pending.remove(&request) {
            return Err(MeshError::transport(peer_id, "no pending request"));
        }
        air.emit(
            peer_id,
            TransportEvent::ConnectionFailed {
                peer_id: self.id.clone(),
                reason: "rejected".to_string(),
            },
        );
        Ok(())
    }

    fn disconnect(&self, peer_id: &str) {
        let mut air = self.network.air.lock();
        if air.sever(&self.id, peer_id) {
            air.emit(peer_id, TransportEvent::Disconnected(self.id.clone()));
        }
    }

    fn send(&self, peer_id: &str, bytes: Vec<u8>) -> MeshResult<()> {
        let air = self.network.air.lock();
        if !air.links.contains(&pair(&self.id, peer_id)) {
            return Err(MeshError::NotConnected {
                peer_id: peer_id.to_string(),
            });
        }
        air.emit(
            peer_id,
            TransportEvent::Received {
                from: self.id.clone(),
                bytes,
            },
        );
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn drain(rx: &mut mpsc::UnboundedReceiver<TransportEvent>) -> Vec<TransportEvent> {
        let mut events = Vec::new();
        while let Ok(event) = rx.try_recv() {
            events.push(event);
        }
        events
    }

    #[test]
    fn test_start_announces_in_range_nodes() {
        let network = MemoryNetwork::new();
        let (a, mut a_rx) = network.register("a");
        let (b, mut b_rx) = network.register("b");

        a.start().unwrap();
        assert!(drain(&mut a_rx).is_empty());

        b.start().unwrap();
        assert_eq!(drain(&mut a_rx), vec![TransportEvent::PeerDiscovered("b".to_string())]);
        assert_eq!(drain(&mut b_rx), vec![TransportEvent::PeerDiscovered("a".to_string())]);
    }

    #[test]
    fn test_isolated_network_needs_explicit_range() {
        let network = MemoryNetwork::isolated();
        let (a, mut a_rx) = network.register("a");
        let (b, _b_rx) = network.register("b");
        a.start().unwrap();
        b.start().unwrap();
        assert!(drain(&mut a_rx).is_empty());

        assert!(a.request_connection("b").is_err());
        network.set_in_range("a", "b");
        assert_eq!(drain(&mut a_rx), vec![TransportEvent::PeerDiscovered("b".to_string())]);
        assert!(a.request_connection("b").is_ok());
        assert_eq!(network.connection_attempts().len(), 2);
    }

    #[test]
    fn test_handshake_and_send() {
        let network = MemoryNetwork::new();
        let (a, mut a_rx) = network.register("a");
        let (b, mut b_rx) = network.register("b");
        a.start().unwrap();
        b.start().unwrap();
        drain(&mut a_rx);
        drain(&mut b_rx);

        assert!(a.send("b", vec![1]).is_err());
        a.request_connection("b").unwrap();
        assert_eq!(
            drain(&mut b_rx),
            vec![TransportEvent::ConnectionRequested("a".to_string())]
        );

        b.accept_connection("a").unwrap();
        assert!(network.is_linked("a", "b"));
        assert_eq!(drain(&mut a_rx), vec![TransportEvent::Connected("b".to_string())]);
        drain(&mut b_rx);

        a.send("b", vec![0, 255]).unwrap();
        assert_eq!(
            drain(&mut b_rx),
            vec![TransportEvent::Received {
                from: "a".to_string(),
                bytes: vec![0, 255]
            }]
        );

        a.disconnect("b");
        assert!(drain(&mut a_rx).is_empty());
        assert_eq!(drain(&mut b_rx), vec![TransportEvent::Disconnected("a".to_string())]);
    }

    #[test]
    fn test_reject_reports_failure() {
        let network = MemoryNetwork::new();
        let (a, mut a_rx) = network.register("a");
        let (b, _b_rx) = network.register("b");
        a.start().unwrap();
        b.start().unwrap();
        drain(&mut a_rx);

        a.request_connection("b").unwrap();
        b.reject_connection("a").unwrap();
        assert!(matches!(
            drain(&mut a_rx).as_slice(),
            [TransportEvent::ConnectionFailed { peer_id, .. }] if peer_id == "b"
        ));
        assert!(b.accept_connection("a").is_err());
    }

    #[test]
    fn test_components() {
        let network = MemoryNetwork::isolated();
        for id in ["a", "b", "c", "d"] {
            let _ = network.register(id);
        }
        network.link("a", "b");
        network.link("c", "d");
        assert_eq!(network.components().len(), 2);

        network.link("b", "c");
        assert_eq!(network.components().len(), 1);
    }
}
