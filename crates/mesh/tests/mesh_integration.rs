//! Multi-node scenarios over the in-memory network.
//!
//! Every test runs with a paused clock, so periodic tasks only fire when the
//! test lets time pass.

use parking_lot::Mutex;
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use std::collections::{BTreeSet, HashMap};
use std::sync::Arc;
use std::time::Duration;
use tidemesh_mesh::{
    CommandDispatcher, FileSink, MemoryNetwork, MeshConfig, MeshNode, MeshResult,
};

#[derive(Default)]
struct RecordingDispatcher {
    commands: Mutex<Vec<(String, Vec<u8>)>>,
}

impl CommandDispatcher for RecordingDispatcher {
    fn dispatch(&self, origin: &str, command: &[u8]) -> MeshResult<()> {
        self.commands
            .lock()
            .push((origin.to_string(), command.to_vec()));
        Ok(())
    }
}

#[derive(Default)]
struct MemorySink {
    files: Mutex<Vec<(String, Vec<u8>)>>,
}

impl FileSink for MemorySink {
    fn save(&self, destination_path: &str, bytes: &[u8]) -> MeshResult<()> {
        self.files
            .lock()
            .push((destination_path.to_string(), bytes.to_vec()));
        Ok(())
    }
}

struct TestNode {
    node: MeshNode,
    commands: Arc<RecordingDispatcher>,
    files: Arc<MemorySink>,
}

/// Config with the topology analyses pushed out of the test's time range
fn create_test_config(max: usize, target: usize) -> MeshConfig {
    MeshConfig {
        max_connections: max,
        target_connections: target,
        rewire_interval_ms: 3_600_000,
        island_interval_ms: 7_200_000,
        ..MeshConfig::default()
    }
}

fn spawn_nodes(
    network: &Arc<MemoryNetwork>,
    ids: &[&str],
    config: &MeshConfig,
) -> HashMap<String, TestNode> {
    let mut nodes = HashMap::new();
    for id in ids {
        let (transport, events) = network.register(*id);
        let commands = Arc::new(RecordingDispatcher::default());
        let files = Arc::new(MemorySink::default());
        let node = MeshNode::new(
            config.clone(),
            transport,
            events,
            commands.clone(),
            files.clone(),
        )
        .unwrap();
        node.start().unwrap();
        nodes.insert(
            id.to_string(),
            TestNode {
                node,
                commands,
                files,
            },
        );
    }
    nodes
}

async fn settle() {
    tokio::time::sleep(Duration::from_millis(50)).await;
}

async fn wait_until<F: Fn() -> bool>(condition: F) {
    for _ in 0..200 {
        if condition() {
            return;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
}

fn node_ids(count: usize) -> Vec<String> {
    (0..count).map(|i| format!("node{:02}", i)).collect()
}

/// Every node originates one command; every other node must get each
/// command exactly once.
async fn assert_exactly_once(network: Arc<MemoryNetwork>, ids: &[String], edges: &[(usize, usize)]) {
    let refs: Vec<&str> = ids.iter().map(String::as_str).collect();
    let nodes = spawn_nodes(&network, &refs, &create_test_config(16, 1));
    for &(a, b) in edges {
        network.link(&ids[a], &ids[b]);
    }
    settle().await;

    for id in ids {
        nodes[id]
            .node
            .broadcast_command(format!("hello from {}", id).into_bytes())
            .unwrap();
    }
    settle().await;

    for id in ids {
        let received = nodes[id].commands.commands.lock().clone();
        assert_eq!(received.len(), ids.len() - 1, "node {} received {:?}", id, received);

        let origins: BTreeSet<String> = received.iter().map(|(origin, _)| origin.clone()).collect();
        assert_eq!(origins.len(), ids.len() - 1);
        assert!(!origins.contains(id));
        for (origin, bytes) in &received {
            assert_eq!(bytes, &format!("hello from {}", origin).into_bytes());
        }
        assert_eq!(nodes[id].node.status().router.delivered, (ids.len() - 1) as u64);
    }

    for test_node in nodes.values() {
        test_node.node.stop().await;
    }
}

#[tokio::test(start_paused = true)]
async fn test_broadcast_exactly_once_on_line() {
    let ids = node_ids(6);
    let edges: Vec<(usize, usize)> = (0..5).map(|i| (i, i + 1)).collect();
    assert_exactly_once(MemoryNetwork::isolated(), &ids, &edges).await;
}

#[tokio::test(start_paused = true)]
async fn test_broadcast_exactly_once_on_ring() {
    let ids = node_ids(6);
    let edges: Vec<(usize, usize)> = (0..6).map(|i| (i, (i + 1) % 6)).collect();
    assert_exactly_once(MemoryNetwork::isolated(), &ids, &edges).await;
}

#[tokio::test(start_paused = true)]
async fn test_broadcast_exactly_once_on_full_graph() {
    let ids = node_ids(6);
    let mut edges = Vec::new();
    for a in 0..6 {
        for b in (a + 1)..6 {
            edges.push((a, b));
        }
    }
    assert_exactly_once(MemoryNetwork::isolated(), &ids, &edges).await;
}

#[tokio::test(start_paused = true)]
async fn test_broadcast_exactly_once_on_random_graph() {
    let mut rng = StdRng::seed_from_u64(42);
    let ids = node_ids(12);

    let mut edges = BTreeSet::new();
    // Random spanning tree keeps the graph connected
    for i in 1..12 {
        edges.insert((rng.gen_range(0..i), i));
    }
    for _ in 0..8 {
        let a = rng.gen_range(0..12);
        let b = rng.gen_range(0..12);
        if a != b {
            edges.insert((a.min(b), a.max(b)));
        }
    }
    let edges: Vec<(usize, usize)> = edges.into_iter().collect();
    assert_exactly_once(MemoryNetwork::isolated(), &ids, &edges).await;
}

/// Triangle a-b-c with a tail c-d, with hop estimates and neighbor
/// snapshots already exchanged. Target 1 keeps ordinary discovery quiet.
async fn build_triangle_with_tail(
    network: &Arc<MemoryNetwork>,
    config_for_a: &MeshConfig,
) -> HashMap<String, TestNode> {
    let mut nodes = spawn_nodes(network, &["a"], config_for_a);
    nodes.extend(spawn_nodes(network, &["b", "c", "d"], &create_test_config(4, 1)));

    network.link("a", "b");
    network.link("a", "c");
    network.link("b", "c");
    network.link("c", "d");
    settle().await;

    for id in ["a", "b", "c", "d"] {
        nodes[id].node.broadcast_command(b"ping".to_vec()).unwrap();
    }
    settle().await;
    for id in ["a", "b", "c", "d"] {
        nodes[id].node.gossip_neighbors().unwrap();
    }
    settle().await;
    nodes
}

#[tokio::test(start_paused = true)]
async fn test_rewiring_drops_triangle_edge_and_reaches_for_distant_node() {
    let network = MemoryNetwork::isolated();
    let nodes = build_triangle_with_tail(&network, &create_test_config(4, 1)).await;

    let a = &nodes["a"].node;
    assert_eq!(a.hop_estimate("b"), Some(0));
    assert_eq!(a.hop_estimate("d"), Some(1));

    // Both already at target, so discovery alone does not link them
    network.set_in_range("a", "d");
    settle().await;
    assert!(!network.is_linked("a", "d"));

    let plan = a.run_rewiring_analysis().expect("triangle and distant node known");
    assert!(plan.drop == "b" || plan.drop == "c");
    assert_eq!(plan.connect, "d");
    assert_eq!(plan.hop_count, 1);
    assert!(plan.requested);

    settle().await;
    assert!(network.is_linked("a", "d"));
    assert!(!network.is_linked("a", &plan.drop));
    assert_eq!(a.connected_peers().len(), 2);

    // Cooldown blocks an immediate second rewire
    assert!(a.run_rewiring_analysis().is_none());
}

#[tokio::test(start_paused = true)]
async fn test_rewiring_reports_refused_request_and_keeps_slot_open() {
    let network = MemoryNetwork::isolated();
    let nodes = build_triangle_with_tail(&network, &create_test_config(4, 1)).await;
    let a = &nodes["a"].node;

    // d is known but out of radio range
    let plan = a.run_rewiring_analysis().expect("triangle and distant node known");
    assert_eq!(plan.connect, "d");
    assert!(!plan.requested);
    assert!(network
        .connection_attempts()
        .contains(&("a".to_string(), "d".to_string())));

    settle().await;
    assert!(!network.is_linked("a", "d"));
    assert!(!network.is_linked("a", &plan.drop));
    assert_eq!(a.connected_peers().len(), 1);
}

#[tokio::test(start_paused = true)]
async fn test_periodic_rewiring_fires_and_stop_silences_node() {
    let network = MemoryNetwork::isolated();
    let fast = MeshConfig {
        rewire_interval_ms: 10_000,
        rewire_cooldown_ms: 10_000,
        ..create_test_config(4, 1)
    };
    let nodes = build_triangle_with_tail(&network, &fast).await;
    network.set_in_range("a", "d");
    settle().await;
    assert!(!network.is_linked("a", "d"));

    // Nobody calls the analysis; the rewiring timer does
    tokio::time::sleep(Duration::from_secs(11)).await;
    assert!(network.is_linked("a", "d"));
    assert_eq!(nodes["a"].node.connected_peers().len(), 2);
    assert!(nodes["d"].node.status().neighbor_snapshots >= 1);

    nodes["a"].node.stop().await;
    let attempts_from_a = |network: &MemoryNetwork| {
        network
            .connection_attempts()
            .iter()
            .filter(|(from, _)| from == "a")
            .count()
    };
    let attempts_before = attempts_from_a(&network);
    settle().await;

    // Several gossip, rewiring and snapshot TTL periods
    tokio::time::sleep(Duration::from_secs(60)).await;
    assert_eq!(attempts_from_a(&network), attempts_before);
    for id in ["b", "c", "d"] {
        let peers = nodes[id].node.connected_peers();
        assert!(!peers.contains(&"a".to_string()));
        // Snapshots from a would have outlived its link if it kept gossiping
        assert!(nodes[id].node.status().neighbor_snapshots <= peers.len());
    }
    let status = nodes["a"].node.status();
    assert_eq!(status.peer_count, 0);
    assert_eq!(status.neighbor_snapshots, 0);
    assert_eq!(status.hop_estimates, 0);
}

#[tokio::test(start_paused = true)]
async fn test_no_rewire_without_triangle() {
    let network = MemoryNetwork::isolated();
    let nodes = spawn_nodes(&network, &["a", "b", "c"], &create_test_config(4, 3));

    network.link("a", "b");
    network.link("b", "c");
    settle().await;
    for id in ["a", "b", "c"] {
        nodes[id].node.broadcast_command(b"ping".to_vec()).unwrap();
        nodes[id].node.gossip_neighbors().unwrap();
    }
    settle().await;

    assert!(nodes["a"].node.run_rewiring_analysis().is_none());
    assert!(network.is_linked("a", "b"));
}

#[tokio::test(start_paused = true)]
async fn test_island_discovery_merges_saturated_clusters() {
    let network = MemoryNetwork::isolated();
    let ids = ["x1", "x2", "x3", "y1", "y2", "y3"];
    let nodes = spawn_nodes(&network, &ids, &create_test_config(3, 2));

    for cluster in [["x1", "x2", "x3"], ["y1", "y2", "y3"]] {
        network.link(cluster[0], cluster[1]);
        network.link(cluster[1], cluster[2]);
        network.link(cluster[0], cluster[2]);
    }
    settle().await;
    for id in ids {
        nodes[id].node.broadcast_command(b"ping".to_vec()).unwrap();
        nodes[id].node.gossip_neighbors().unwrap();
    }
    settle().await;
    assert_eq!(network.components().len(), 2);

    // Saturated nodes ignore each other under ordinary discovery
    network.set_in_range("x2", "y2");
    tokio::time::sleep(Duration::from_secs(10)).await;
    assert_eq!(network.components().len(), 2);
    assert!(!network.is_linked("x2", "y2"));

    let dropped = nodes["x1"].node.run_island_discovery().expect("x1 is saturated");
    assert!(dropped == "x2" || dropped == "x3");
    settle().await;
    assert!(nodes["x1"].node.status().discovery_mode);

    network.set_in_range("x1", "y1");
    settle().await;

    assert!(network.is_linked("x1", "y1"));
    assert_eq!(network.components().len(), 1);
    assert!(!nodes["x1"].node.status().discovery_mode);
}

#[tokio::test(start_paused = true)]
async fn test_discovery_burst_respects_limits() {
    let network = MemoryNetwork::new();
    let ids = node_ids(10);
    let refs: Vec<&str> = ids.iter().map(String::as_str).collect();
    let config = create_test_config(4, 3);
    let nodes = spawn_nodes(&network, &refs, &config);

    tokio::time::sleep(Duration::from_secs(30)).await;

    let mut degree: HashMap<String, usize> = HashMap::new();
    for (a, b) in network.links() {
        *degree.entry(a).or_default() += 1;
        *degree.entry(b).or_default() += 1;
    }
    for id in &ids {
        let status = nodes[id].node.status();
        assert!(status.peer_count <= config.max_connections, "{:?}", status);
        assert!(degree.get(id).copied().unwrap_or(0) <= config.max_connections);
    }
}

#[tokio::test(start_paused = true)]
async fn test_file_transfer_across_line() {
    let network = MemoryNetwork::isolated();
    let config = MeshConfig {
        chunk_size: 1024,
        ..create_test_config(4, 1)
    };
    let nodes = spawn_nodes(&network, &["a", "b", "c", "d"], &config);
    network.link("a", "b");
    network.link("b", "c");
    network.link("c", "d");
    settle().await;

    let mut rng = StdRng::seed_from_u64(9);
    let data: Vec<u8> = (0..40_000).map(|_| rng.gen()).collect();
    nodes["a"].node.send_file("maps/grid.bin", &data).unwrap();

    wait_until(|| {
        ["b", "c", "d"]
            .iter()
            .all(|id| !nodes[*id].files.files.lock().is_empty())
    })
    .await;

    for id in ["b", "c", "d"] {
        let files = nodes[id].files.files.lock().clone();
        assert_eq!(files.len(), 1, "node {}", id);
        assert_eq!(files[0].0, "maps/grid.bin");
        assert_eq!(files[0].1, data);
        assert_eq!(nodes[id].node.status().transfers_in_progress, 0);
    }
    assert!(nodes["a"].files.files.lock().is_empty());
}

#[tokio::test(start_paused = true)]
async fn test_neighbor_gossip_runs_periodically() {
    let network = MemoryNetwork::isolated();
    let nodes = spawn_nodes(&network, &["a", "b", "c"], &create_test_config(4, 1));
    network.link("a", "b");
    network.link("b", "c");
    settle().await;
    assert_eq!(nodes["b"].node.status().neighbor_snapshots, 0);

    tokio::time::sleep(Duration::from_secs(6)).await;
    assert_eq!(nodes["b"].node.status().neighbor_snapshots, 2);
    assert_eq!(nodes["a"].node.status().neighbor_snapshots, 1);
}

#[tokio::test(start_paused = true)]
async fn test_stop_clears_state_and_restart_reconnects() {
    let network = MemoryNetwork::new();
    let nodes = spawn_nodes(&network, &["a", "b"], &create_test_config(4, 3));
    settle().await;
    assert_eq!(nodes["a"].node.connected_peers(), vec!["b".to_string()]);

    nodes["a"].node.broadcast_command(b"ping".to_vec()).unwrap();
    settle().await;
    assert_eq!(nodes["a"].node.status().seen_envelopes, 1);

    nodes["a"].node.stop().await;
    let status = nodes["a"].node.status();
    assert!(!status.running);
    assert_eq!(status.peer_count, 0);
    assert_eq!(status.seen_envelopes, 0);
    settle().await;
    assert!(nodes["b"].node.connected_peers().is_empty());

    nodes["a"].node.start().unwrap();
    settle().await;
    assert_eq!(nodes["a"].node.connected_peers(), vec!["b".to_string()]);
    assert_eq!(nodes["b"].node.connected_peers(), vec!["a".to_string()]);
}
