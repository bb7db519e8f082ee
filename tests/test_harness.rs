//! Test harness for multi-node Raft cluster integration tests.
//!
//! Nodes run their real event loops and talk over an in-process
//! `LocalNetwork`. Tests run with `start_paused = true`, so timers advance on
//! tokio's virtual clock whenever every task is idle.

#![allow(dead_code)]

use std::collections::HashMap;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::Mutex;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use queue_raft::config::NodeConfig;
use queue_raft::raft::{
    ClusterConfiguration, LocalNetwork, LogIndex, MemorySnapshotStore, MemoryStateMachine,
    NodeState, PeerId, RaftClient, RaftNode, Role,
};
use queue_raft::RaftError;

/// Endpoint id used by the cluster's client.
pub const CLIENT_ID: u64 = 1000;

/// Test node configuration with shorter timeouts for faster tests
pub fn test_node_config(node_id: u64, peers: &[u64]) -> NodeConfig {
    let mut config = NodeConfig::new(node_id)
        .with_election_timeout(150, 300)
        .with_heartbeat_interval(50)
        .with_discovery_interval(100)
        .with_keep_init_until_found(peers.len() + 1);
    for &peer in peers {
        config = config.with_peer(peer);
    }
    config
}

/// Handle to a running test node
pub struct TestNode {
    pub node_id: u64,
    pub raft_node: Arc<RaftNode>,
    pub state_machine: Arc<Mutex<MemoryStateMachine>>,
    pub snapshots: Arc<MemorySnapshotStore>,
    shutdown: CancellationToken,
    raft_handle: JoinHandle<()>,
}

impl TestNode {
    /// Check if this node is the leader
    pub async fn is_leader(&self) -> bool {
        self.raft_node.is_leader().await
    }

    pub async fn role(&self) -> Role {
        self.raft_node.role().await
    }

    /// Get the current term
    pub async fn current_term(&self) -> u64 {
        self.raft_node.current_term().await.value()
    }

    pub async fn commit_index(&self) -> LogIndex {
        self.raft_node.commit_index().await
    }

    pub async fn last_index(&self) -> LogIndex {
        self.raft_node.state.read().await.log.last_index()
    }

    /// Index covered by this node's snapshot (0 without one).
    pub async fn snapshot_index(&self) -> LogIndex {
        self.raft_node.state.read().await.log.prev_index()
    }

    pub async fn config(&self) -> ClusterConfiguration {
        self.raft_node.state.read().await.config().clone()
    }

    pub async fn state(&self) -> NodeState {
        self.raft_node.state.read().await.clone()
    }

    /// Commands applied to this node's state machine, in order.
    pub async fn applied(&self) -> Vec<Vec<u8>> {
        self.state_machine.lock().await.applied().to_vec()
    }
}

impl Drop for TestNode {
    fn drop(&mut self) {
        self.shutdown.cancel();
        self.raft_handle.abort();
    }
}

/// Test cluster managing multiple nodes
pub struct TestCluster {
    pub nodes: HashMap<u64, TestNode>,
    pub network: Arc<LocalNetwork>,
    pub client: RaftClient,
}

impl TestCluster {
    /// Create and start a cluster with n nodes that find each other through
    /// discovery.
    pub async fn new(num_nodes: u64) -> Self {
        Self::with_config(num_nodes, |config| config).await
    }

    pub async fn with_config<F>(num_nodes: u64, customize: F) -> Self
    where
        F: Fn(NodeConfig) -> NodeConfig,
    {
        let network = Arc::new(LocalNetwork::new());
        let client = RaftClient::attach(
            PeerId(CLIENT_ID),
            network.clone(),
            Duration::from_millis(1000),
        );
        let mut cluster = Self {
            nodes: HashMap::new(),
            network,
            client,
        };

        let ids: Vec<u64> = (1..=num_nodes).collect();
        for &node_id in &ids {
            let peers: Vec<u64> = ids.iter().copied().filter(|&id| id != node_id).collect();
            let config = customize(test_node_config(node_id, &peers));
            cluster.start_node(config);
        }

        cluster
    }

    /// Start a node and attach it to the cluster's network.
    pub fn start_node(&mut self, config: NodeConfig) {
        let node_id = config.node_id;
        let state_machine = Arc::new(Mutex::new(MemoryStateMachine::new()));
        let snapshots = Arc::new(MemorySnapshotStore::new());

        let (raft_node, raft_rx) = RaftNode::new(
            config,
            self.network.clone(),
            state_machine.clone(),
            snapshots.clone(),
        )
        .expect("test config is valid");
        let raft_node = Arc::new(raft_node);
        self.network.register(raft_node.id, raft_node.inbox());

        let shutdown = CancellationToken::new();
        let runner = raft_node.clone();
        let token = shutdown.clone();
        let raft_handle = tokio::spawn(async move {
            runner.run(raft_rx, token).await;
        });

        self.nodes.insert(
            node_id,
            TestNode {
                node_id,
                raft_node,
                state_machine,
                snapshots,
                shutdown,
                raft_handle,
            },
        );
    }

    /// Wait for leader election with timeout
    pub async fn wait_for_leader(&self, timeout_duration: Duration) -> Option<u64> {
        let result = wait_for(
            || async { self.get_leader_id().await.is_some() },
            timeout_duration,
            Duration::from_millis(20),
        )
        .await;

        if result {
            self.get_leader_id().await
        } else {
            None
        }
    }

    /// Get current leader ID (the leader with the highest term)
    pub async fn get_leader_id(&self) -> Option<u64> {
        let mut best: Option<(u64, u64)> = None;
        for node in self.nodes.values() {
            if node.is_leader().await {
                let term = node.current_term().await;
                if best.map_or(true, |(_, t)| term > t) {
                    best = Some((node.node_id, term));
                }
            }
        }
        best.map(|(id, _)| id)
    }

    /// Get a reference to a specific node
    pub fn get_node(&self, node_id: u64) -> Option<&TestNode> {
        self.nodes.get(&node_id)
    }

    /// Submit a command, retrying through redirects until it commits.
    pub async fn submit(
        &self,
        command: &str,
        timeout_duration: Duration,
    ) -> Result<(LogIndex, Vec<u8>), RaftError> {
        let start = tokio::time::Instant::now();
        let mut via = self
            .get_leader_id()
            .await
            .or_else(|| self.active_node_ids().first().copied())
            .map(PeerId)
            .ok_or_else(|| RaftError::NotLeader(None))?;
        loop {
            match self.client.submit(via, command.as_bytes().to_vec()).await {
                Ok(result) => return Ok(result),
                Err(RaftError::NotLeader(Some(leader))) => via = leader,
                Err(e) => {
                    if start.elapsed() >= timeout_duration {
                        return Err(e);
                    }
                    tokio::time::sleep(Duration::from_millis(50)).await;
                    if let Some(leader) = self.get_leader_id().await {
                        via = PeerId(leader);
                    }
                }
            }
            if start.elapsed() >= timeout_duration {
                return Err(RaftError::Timeout(format!("command {command} not committed")));
            }
        }
    }

    /// Wait until every node's commit index reaches `min_index`
    pub async fn wait_for_commit_on_all(&self, min_index: LogIndex, timeout_duration: Duration) -> bool {
        let ids = self.active_node_ids();
        self.wait_for_commit_on_nodes(&ids, min_index, timeout_duration)
            .await
    }

    /// Wait for a commit index on a specific set of nodes
    pub async fn wait_for_commit_on_nodes(
        &self,
        node_ids: &[u64],
        min_index: LogIndex,
        timeout_duration: Duration,
    ) -> bool {
        wait_for(
            || async {
                for &node_id in node_ids {
                    match self.nodes.get(&node_id) {
                        Some(node) if node.commit_index().await >= min_index => {}
                        _ => return false,
                    }
                }
                true
            },
            timeout_duration,
            Duration::from_millis(20),
        )
        .await
    }

    /// Wait until every node has applied at least `count` commands
    pub async fn wait_for_applied_on_all(&self, count: usize, timeout_duration: Duration) -> bool {
        wait_for(
            || async {
                for node in self.nodes.values() {
                    if node.applied().await.len() < count {
                        return false;
                    }
                }
                true
            },
            timeout_duration,
            Duration::from_millis(20),
        )
        .await
    }

    /// Verify committed entries agree across nodes wherever both still hold them
    pub async fn verify_log_consistency(&self) -> bool {
        let mut states = Vec::new();
        for node in self.nodes.values() {
            states.push(node.state().await);
        }
        for a in &states {
            for b in &states {
                let from = a.log.prev_index().max(b.log.prev_index()) + 1;
                let to = a.commit_index().min(b.commit_index());
                for index in from..=to {
                    if a.log.term_at(index) != b.log.term_at(index) {
                        return false;
                    }
                    let ca = a.log.get(index).map(|e| &e.command);
                    let cb = b.log.get(index).map(|e| &e.command);
                    if ca != cb {
                        return false;
                    }
                }
            }
        }
        true
    }

    /// Count the number of leaders in the cluster
    pub async fn count_leaders(&self) -> usize {
        let mut count = 0;
        for node in self.nodes.values() {
            if node.is_leader().await {
                count += 1;
            }
        }
        count
    }

    /// Leaders per term; election safety means every count is at most 1
    pub async fn leaders_by_term(&self) -> HashMap<u64, usize> {
        let mut leaders = HashMap::new();
        for node in self.nodes.values() {
            if node.is_leader().await {
                *leaders.entry(node.current_term().await).or_insert(0) += 1;
            }
        }
        leaders
    }

    /// Shutdown a specific node (simulates crash)
    pub fn shutdown_node(&mut self, node_id: u64) -> bool {
        self.network.unregister(PeerId(node_id));
        self.nodes.remove(&node_id).is_some()
    }

    /// Get IDs of all active nodes
    pub fn active_node_ids(&self) -> Vec<u64> {
        let mut ids: Vec<u64> = self.nodes.keys().copied().collect();
        ids.sort_unstable();
        ids
    }

    /// Wait for a new leader among remaining nodes (excluding a specific node)
    pub async fn wait_for_new_leader(
        &self,
        excluded_node: u64,
        timeout_duration: Duration,
    ) -> Option<u64> {
        let group: Vec<u64> = self
            .active_node_ids()
            .into_iter()
            .filter(|&id| id != excluded_node)
            .collect();
        self.wait_for_leader_in_group(&group, timeout_duration)
            .await
    }

    /// Wait for a leader to emerge within a specific group of nodes
    pub async fn wait_for_leader_in_group(
        &self,
        group: &[u64],
        timeout_duration: Duration,
    ) -> Option<u64> {
        let find = || async {
            for &node_id in group {
                if let Some(node) = self.nodes.get(&node_id) {
                    if node.is_leader().await {
                        return Some(node_id);
                    }
                }
            }
            None
        };
        let result = wait_for(
            || async { find().await.is_some() },
            timeout_duration,
            Duration::from_millis(20),
        )
        .await;

        if result {
            find().await
        } else {
            None
        }
    }

    /// Create a network partition: group_a can't communicate with group_b and vice versa
    pub fn create_partition(&self, group_a: &[u64], group_b: &[u64]) {
        for &a in group_a {
            for &b in group_b {
                self.network.disconnect(PeerId(a), PeerId(b));
            }
        }
    }

    /// Heal a network partition: restore communication between groups
    pub fn heal_partition(&self, group_a: &[u64], group_b: &[u64]) {
        for &a in group_a {
            for &b in group_b {
                self.network.reconnect(PeerId(a), PeerId(b));
            }
        }
    }

    /// Isolate a node from all other nodes and from the client
    pub fn isolate_node(&self, node_id: u64) {
        let mut others: Vec<u64> = self
            .active_node_ids()
            .into_iter()
            .filter(|&id| id != node_id)
            .collect();
        others.push(CLIENT_ID);
        self.create_partition(&[node_id], &others);
    }

    /// Heal an isolated node (reconnect to all others)
    pub fn heal_node(&self, node_id: u64) {
        let mut others: Vec<u64> = self
            .active_node_ids()
            .into_iter()
            .filter(|&id| id != node_id)
            .collect();
        others.push(CLIENT_ID);
        self.heal_partition(&[node_id], &others);
    }
}

/// Wait for a condition to become true with timeout
pub async fn wait_for<F, Fut>(
    condition: F,
    timeout_duration: Duration,
    poll_interval: Duration,
) -> bool
where
    F: Fn() -> Fut,
    Fut: Future<Output = bool>,
{
    let start = tokio::time::Instant::now();
    while start.elapsed() < timeout_duration {
        if condition().await {
            return true;
        }
        tokio::time::sleep(poll_interval).await;
    }
    false
}

/// Assert a condition eventually becomes true
pub async fn assert_eventually<F, Fut>(condition: F, timeout_duration: Duration, message: &str)
where
    F: Fn() -> Fut,
    Fut: Future<Output = bool>,
{
    let result = wait_for(condition, timeout_duration, Duration::from_millis(20)).await;
    assert!(result, "{}", message);
}
