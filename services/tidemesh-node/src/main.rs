use anyhow::{bail, Context};
use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tidemesh_core::logging::{self, LogFormat};
use tidemesh_mesh::{
    DirectoryFileSink, LoggingDispatcher, MemoryNetwork, MeshConfig, MeshNode, MeshStatus,
};
use tracing::{info, warn};

const NODE_PROTOCOL_VERSION: u32 = 1;
const NODE_RUNTIME_VERSION: u32 = 1;

#[derive(Debug, Serialize)]
struct NodeVersionHandshake {
    version: &'static str,
    runtime_version: u32,
    protocol_version: u32,
}

/// One in-process mesh simulation
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
struct SimulationConfig {
    node_count: usize,
    run_secs: u64,
    log_format: String,
    log_level: String,
    /// Split nodes into this many clusters that cannot see each other
    clusters: Option<usize>,
    /// Bring one node of each neighboring cluster pair into range after this long
    bridge_after_secs: Option<u64>,
    /// Where reassembled files are written
    output_dir: PathBuf,
    mesh: MeshConfig,
}

impl Default for SimulationConfig {
    fn default() -> Self {
        Self {
            node_count: 8,
            run_secs: 30,
            log_format: "pretty".to_string(),
            log_level: "info".to_string(),
            clusters: None,
            bridge_after_secs: None,
            output_dir: std::env::temp_dir().join("tidemesh-sim"),
            mesh: MeshConfig::default(),
        }
    }
}

impl SimulationConfig {
    fn validate(&self) -> anyhow::Result<()> {
        if self.node_count < 2 {
            bail!("node_count must be at least 2");
        }
        if let Some(clusters) = self.clusters {
            if clusters == 0 || clusters > self.node_count {
                bail!("clusters must be between 1 and node_count");
            }
        }
        self.mesh.validate().context("invalid mesh config")?;
        Ok(())
    }

    fn cluster_of(&self, index: usize) -> usize {
        self.clusters.map(|clusters| index % clusters).unwrap_or(0)
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args: Vec<String> = std::env::args().collect();

    if args.iter().any(|arg| arg == "--version-json") {
        let handshake = NodeVersionHandshake {
            version: env!("CARGO_PKG_VERSION"),
            runtime_version: NODE_RUNTIME_VERSION,
            protocol_version: NODE_PROTOCOL_VERSION,
        };
        println!("{}", serde_json::to_string(&handshake)?);
        return Ok(());
    }

    let config = match parse_config_path(&args)? {
        Some(path) => {
            let raw = std::fs::read_to_string(&path)
                .with_context(|| format!("reading {}", path.display()))?;
            serde_json::from_str::<SimulationConfig>(&raw)
                .with_context(|| format!("parsing {}", path.display()))?
        }
        None => SimulationConfig::default(),
    };
    config.validate()?;

    logging::init_with_filter(LogFormat::from_name(&config.log_format), &config.log_level);

    let statuses = run_simulation(&config).await?;
    println!("{}", serde_json::to_string_pretty(&statuses)?);
    Ok(())
}

fn node_name(index: usize) -> String {
    format!("node-{:03}", index)
}

async fn run_simulation(config: &SimulationConfig) -> anyhow::Result<Vec<MeshStatus>> {
    let network = if config.clusters.is_some() {
        MemoryNetwork::isolated()
    } else {
        MemoryNetwork::new()
    };

    let sink = Arc::new(DirectoryFileSink::new(&config.output_dir));
    let mut nodes = Vec::with_capacity(config.node_count);
    for index in 0..config.node_count {
        let (transport, events) = network.register(node_name(index));
        let node = MeshNode::new(
            config.mesh.clone(),
            transport,
            events,
            Arc::new(LoggingDispatcher),
            sink.clone(),
        )?;
        nodes.push(node);
    }

    if config.clusters.is_some() {
        for a in 0..config.node_count {
            for b in (a + 1)..config.node_count {
                if config.cluster_of(a) == config.cluster_of(b) {
                    network.set_in_range(&node_name(a), &node_name(b));
                }
            }
        }
    }

    for node in &nodes {
        node.start()
            .with_context(|| format!("starting {}", node.node_id()))?;
    }
    info!(
        nodes = config.node_count,
        clusters = config.clusters.unwrap_or(1),
        run_secs = config.run_secs,
        "Simulation started"
    );

    // Let the first admission round finish before probing
    tokio::time::sleep(Duration::from_secs(2)).await;
    let probe = nodes[0].broadcast_command(b"probe".to_vec())?;
    info!(envelope_id = %probe, origin = %nodes[0].node_id(), "Probe broadcast");

    let run = Duration::from_secs(config.run_secs);
    match (config.clusters, config.bridge_after_secs) {
        (Some(clusters), Some(after)) if clusters > 1 && Duration::from_secs(after) < run => {
            tokio::time::sleep(Duration::from_secs(after)).await;
            for cluster in 0..clusters {
                let next = (cluster + 1) % clusters;
                // Node index == cluster id is the first member of each cluster
                network.set_in_range(&node_name(cluster), &node_name(next));
                info!(a = %node_name(cluster), b = %node_name(next), "Clusters bridged");
            }
            tokio::time::sleep(run - Duration::from_secs(after)).await;
        }
        _ => tokio::time::sleep(run).await,
    }

    let statuses: Vec<MeshStatus> = nodes.iter().map(MeshNode::status).collect();
    let components = network.components();
    if components.len() > 1 {
        warn!(components = components.len(), "Mesh is partitioned");
    } else {
        info!(links = network.links().len(), "Mesh is connected");
    }

    for node in &nodes {
        node.stop().await;
    }
    Ok(statuses)
}

fn parse_config_path(args: &[String]) -> anyhow::Result<Option<PathBuf>> {
    let mut args_iter = args.iter();
    while let Some(arg) = args_iter.next() {
        if arg == "--config" {
            if let Some(path) = args_iter.next() {
                return Ok(Some(PathBuf::from(path)));
            }
            bail!("--config was provided without a path");
        }
    }
    Ok(None)
}
