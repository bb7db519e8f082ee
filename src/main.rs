use std::sync::Arc;
use std::time::Duration;

use clap::{Parser, ValueEnum};
use serde::Serialize;
use tokio::sync::Mutex;
use tokio::task::JoinHandle;
use tracing_subscriber::EnvFilter;

use queue_raft::config::NodeConfig;
use queue_raft::raft::{
    LocalNetwork, MemorySnapshotStore, MemoryStateMachine, PeerId, RaftClient, RaftNode, Role,
};
use queue_raft::shutdown::install_shutdown_handler;
use queue_raft::RaftError;

/// Client endpoint id; node ids start at 1.
const CLIENT_ID: PeerId = PeerId(0);

#[derive(Parser, Debug)]
#[command(name = "queue-raft")]
#[command(version)]
#[command(about = "Raft consensus core for a replicated message-queue log")]
#[command(propagate_version = true)]
struct Args {
    #[command(subcommand)]
    command: Commands,
}

#[derive(clap::Subcommand, Debug)]
enum Commands {
    /// Boot an in-process cluster, replicate commands through it and report
    /// each node's state
    LocalCluster(LocalClusterArgs),
}

#[derive(Parser, Debug)]
struct LocalClusterArgs {
    /// Number of nodes
    #[arg(long, default_value = "3")]
    nodes: u64,

    /// Number of commands to replicate
    #[arg(long, default_value = "10")]
    commands: usize,

    /// Minimum election timeout in milliseconds
    #[arg(long, default_value = "300")]
    election_timeout_min_ms: u64,

    /// Maximum election timeout in milliseconds
    #[arg(long, default_value = "500")]
    election_timeout_max_ms: u64,

    /// Heartbeat interval in milliseconds
    #[arg(long, default_value = "100")]
    heartbeat_ms: u64,

    /// Committed entries that trigger log compaction (0 disables)
    #[arg(long, default_value = "1000")]
    compaction_threshold: u64,

    /// Output format
    #[arg(long, short = 'o', default_value = "table")]
    output: OutputFormat,
}

#[derive(Debug, Clone, ValueEnum)]
enum OutputFormat {
    Table,
    Json,
}

// =============================================================================
// JSON Output Types
// =============================================================================

#[derive(Serialize)]
struct NodeStatusOutput {
    node_id: u64,
    role: Role,
    term: u64,
    leader: Option<u64>,
    commit_index: u64,
    last_index: u64,
    snapshot_index: u64,
    applied: usize,
}

#[derive(Serialize)]
struct ClusterOutput {
    committed_commands: usize,
    nodes: Vec<NodeStatusOutput>,
}

struct LocalNode {
    raft: Arc<RaftNode>,
    state_machine: Arc<Mutex<MemoryStateMachine>>,
    handle: JoinHandle<()>,
}

// =============================================================================
// Local cluster
// =============================================================================

async fn run_local_cluster(args: LocalClusterArgs) -> Result<(), Box<dyn std::error::Error>> {
    if args.nodes == 0 {
        return Err("--nodes must be at least 1".into());
    }
    let shutdown = install_shutdown_handler();
    let network = Arc::new(LocalNetwork::new());

    let ids: Vec<u64> = (1..=args.nodes).collect();
    let mut nodes = Vec::new();
    for &node_id in &ids {
        let mut config = NodeConfig::new(node_id)
            .with_election_timeout(args.election_timeout_min_ms, args.election_timeout_max_ms)
            .with_heartbeat_interval(args.heartbeat_ms)
            .with_discovery_interval(args.heartbeat_ms * 5)
            .with_keep_init_until_found(ids.len())
            .with_compaction_threshold(args.compaction_threshold);
        for &peer in ids.iter().filter(|&&p| p != node_id) {
            config = config.with_peer(peer);
        }

        let state_machine = Arc::new(Mutex::new(MemoryStateMachine::new()));
        let (raft, inbox_rx) = RaftNode::new(
            config,
            network.clone(),
            state_machine.clone(),
            Arc::new(MemorySnapshotStore::new()),
        )?;
        let raft = Arc::new(raft);
        network.register(raft.id, raft.inbox());

        let runner = raft.clone();
        let token = shutdown.child_token();
        let handle = tokio::spawn(async move {
            runner.run(inbox_rx, token).await;
        });
        nodes.push(LocalNode {
            raft,
            state_machine,
            handle,
        });
    }

    tracing::info!(nodes = ids.len(), commands = args.commands, "Local cluster started");

    let client = RaftClient::attach(CLIENT_ID, network.clone(), Duration::from_secs(2));
    let committed = tokio::select! {
        committed = replicate(&client, &ids, args.commands) => committed,
        _ = shutdown.cancelled() => 0,
    };

    // Let the last commit index reach the followers.
    tokio::time::sleep(Duration::from_millis(args.heartbeat_ms * 2)).await;

    let mut statuses = Vec::new();
    for node in &nodes {
        let state = node.raft.state.read().await;
        statuses.push(NodeStatusOutput {
            node_id: state.id.0,
            role: state.role,
            term: state.current_term().value(),
            leader: state.leader_hint().map(|p| p.0),
            commit_index: state.commit_index(),
            last_index: state.log.last_index(),
            snapshot_index: state.log.prev_index(),
            applied: node.state_machine.lock().await.len(),
        });
    }

    shutdown.cancel();
    for node in nodes {
        let _ = node.handle.await;
    }

    print_cluster(
        &ClusterOutput {
            committed_commands: committed,
            nodes: statuses,
        },
        &args.output,
    )
}

/// Submit `count` commands, retrying through whichever node claims to lead.
async fn replicate(client: &RaftClient, ids: &[u64], count: usize) -> usize {
    let mut via = PeerId(ids[0]);
    let mut committed = 0;
    let mut attempts = 0;
    while committed < count && attempts < count * 20 + 50 {
        attempts += 1;
        let command = format!("message-{}", committed + 1).into_bytes();
        match client.submit(via, command).await {
            Ok((index, result)) => {
                committed += 1;
                tracing::info!(
                    index,
                    result = %String::from_utf8_lossy(&result),
                    "Command committed"
                );
            }
            Err(RaftError::NotLeader(Some(leader))) => via = leader,
            Err(e) => {
                tracing::debug!(error = %e, via = %via, "Submit failed, retrying");
                let next = ids.iter().position(|&id| id == via.0).map_or(0, |i| i + 1);
                via = PeerId(ids[next % ids.len()]);
                tokio::time::sleep(Duration::from_millis(100)).await;
            }
        }
    }
    committed
}

fn print_cluster(
    output: &ClusterOutput,
    format: &OutputFormat,
) -> Result<(), Box<dyn std::error::Error>> {
    match format {
        OutputFormat::Json => {
            println!("{}", serde_json::to_string_pretty(output)?);
        }
        OutputFormat::Table => {
            println!("Local Cluster");
            println!("{}", "=".repeat(40));
            println!("Committed commands: {}", output.committed_commands);
            println!();
            println!(
                "{:<6} {:<10} {:<6} {:<8} {:<8} {:<8} {:<9} APPLIED",
                "ID", "ROLE", "TERM", "LEADER", "COMMIT", "LAST", "SNAPSHOT"
            );
            println!("{}", "-".repeat(70));
            for node in &output.nodes {
                let leader = node
                    .leader
                    .map_or_else(|| "-".to_string(), |l| l.to_string());
                println!(
                    "{:<6} {:<10} {:<6} {:<8} {:<8} {:<8} {:<9} {}",
                    node.node_id,
                    node.role.to_string(),
                    node.term,
                    leader,
                    node.commit_index,
                    node.last_index,
                    node.snapshot_index,
                    node.applied
                );
            }
        }
    }
    Ok(())
}

// =============================================================================
// Main Entry Point
// =============================================================================

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    let args = Args::parse();

    match args.command {
        Commands::LocalCluster(cluster_args) => {
            run_local_cluster(cluster_args).await?;
        }
    }

    Ok(())
}
