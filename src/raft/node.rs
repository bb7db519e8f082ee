use std::sync::Arc;
use std::time::Duration;

use tokio::sync::{mpsc, Mutex, RwLock};
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;

use crate::config::NodeConfig;
use crate::error::{RaftError, Result};
use crate::raft::fsm::{SnapshotStore, StateMachine};
use crate::raft::log::{Command, LogEntry, SnapshotMetadata};
use crate::raft::machine::{step, Transition};
use crate::raft::message::{Effect, Input, RaftMessage, Timer};
use crate::raft::state::{NodeState, Role};
use crate::raft::timer::{random_election_timeout, TimerSet};
use crate::raft::transport::Transport;
use crate::raft::types::{LogIndex, PeerId, Term};

/// Fallback sleep when no timer is armed; the branch is disabled anyway.
const IDLE_WAIT: Duration = Duration::from_secs(3600);

/// A running consensus node.
///
/// Owns the [`NodeState`], feeds it one [`Input`] at a time through the pure
/// transition function and carries out the resulting effects: sending
/// messages, arming timers, applying committed commands and preparing
/// snapshots.
pub struct RaftNode {
    pub id: PeerId,
    pub state: Arc<RwLock<NodeState>>,
    config: NodeConfig,
    transport: Arc<dyn Transport>,
    state_machine: Arc<Mutex<dyn StateMachine>>,
    snapshots: Arc<dyn SnapshotStore>,
    inbox_tx: mpsc::Sender<Input>,
}

impl RaftNode {
    pub fn new(
        config: NodeConfig,
        transport: Arc<dyn Transport>,
        state_machine: Arc<Mutex<dyn StateMachine>>,
        snapshots: Arc<dyn SnapshotStore>,
    ) -> Result<(Self, mpsc::Receiver<Input>)> {
        let state = NodeState::new(config.id(), config.core_settings());
        Self::from_state(config, state, transport, state_machine, snapshots)
    }

    /// Start from an existing state, e.g. one rebuilt with
    /// [`NodeState::restored`].
    pub fn from_state(
        config: NodeConfig,
        state: NodeState,
        transport: Arc<dyn Transport>,
        state_machine: Arc<Mutex<dyn StateMachine>>,
        snapshots: Arc<dyn SnapshotStore>,
    ) -> Result<(Self, mpsc::Receiver<Input>)> {
        config.validate()?;
        if state.id != config.id() {
            return Err(RaftError::Config(format!(
                "state belongs to {} but config is for {}",
                state.id,
                config.id()
            )));
        }
        let (inbox_tx, inbox_rx) = mpsc::channel(config.inbox_capacity);

        let node = Self {
            id: config.id(),
            state: Arc::new(RwLock::new(state)),
            config,
            transport,
            state_machine,
            snapshots,
            inbox_tx,
        };

        Ok((node, inbox_rx))
    }

    /// Sender for this node's inbox; register it with the transport.
    pub fn inbox(&self) -> mpsc::Sender<Input> {
        self.inbox_tx.clone()
    }

    /// Queue a local input, e.g. [`Input::CompactLog`].
    pub async fn submit(&self, input: Input) -> Result<()> {
        self.inbox_tx
            .send(input)
            .await
            .map_err(|_| RaftError::ChannelClosed(format!("inbox of {} closed", self.id)))
    }

    /// Run the node's event loop until `shutdown` fires or the inbox closes.
    pub async fn run(&self, mut inbox_rx: mpsc::Receiver<Input>, shutdown: CancellationToken) {
        let mut timers = TimerSet::new();
        self.start(&mut timers).await;

        loop {
            let next = timers.next_deadline();
            let deadline = next.map_or_else(|| Instant::now() + IDLE_WAIT, |(_, at)| at);

            tokio::select! {
                _ = shutdown.cancelled() => {
                    tracing::info!(node_id = %self.id, "Shutting down raft node");
                    break;
                }
                input = inbox_rx.recv() => match input {
                    Some(input) => self.handle(input, &mut timers).await,
                    None => {
                        tracing::info!(node_id = %self.id, "Inbox closed, stopping raft node");
                        break;
                    }
                },
                _ = tokio::time::sleep_until(deadline), if next.is_some() => {
                    if let Some((timer, _)) = next {
                        timers.cancel(timer);
                        self.handle(Input::Timeout(timer), &mut timers).await;
                    }
                }
            }
        }
    }

    async fn start(&self, timers: &mut TimerSet) {
        let (role, snapshot) = {
            let state = self.state.read().await;
            (state.role, state.log.snapshot().cloned())
        };
        if let Some(snapshot) = snapshot {
            tracing::info!(
                node_id = %self.id,
                index = snapshot.meta.last_included_index,
                "Restoring state machine from snapshot"
            );
            if let Err(e) = self.state_machine.lock().await.restore(&snapshot.data) {
                tracing::error!(node_id = %self.id, error = %e, "Failed to restore state machine");
            }
        }
        tracing::info!(node_id = %self.id, %role, "Starting raft node");
        match role {
            // Probe seeds right away rather than after the first interval.
            Role::Init => self.handle(Input::Timeout(Timer::Discovery), timers).await,
            Role::Follower | Role::Candidate => self.arm(timers, Timer::Election),
            Role::Leader => self.arm(timers, Timer::Heartbeat),
        }
    }

    async fn handle(&self, input: Input, timers: &mut TimerSet) {
        let effects = {
            let mut state = self.state.write().await;
            match step(&state, input) {
                Ok(Transition { state: next, effects }) => {
                    *state = next;
                    effects
                }
                Err(e) => {
                    tracing::error!(
                        node_id = %self.id,
                        error = %e,
                        "Transition aborted, keeping previous state"
                    );
                    return;
                }
            }
        };
        for effect in effects {
            self.execute(effect, timers).await;
        }
    }

    async fn execute(&self, effect: Effect, timers: &mut TimerSet) {
        match effect {
            Effect::Send { to, message } => self.transport.deliver(self.id, to, message),
            Effect::Forward { from, to, message } => self.transport.deliver(from, to, message),
            Effect::ArmTimer(timer) => self.arm(timers, timer),
            Effect::CancelTimer(timer) => timers.cancel(timer),
            Effect::Apply { entry, respond } => self.apply_entry(entry, respond).await,
            Effect::Restore(snapshot) => {
                if let Err(e) = self.state_machine.lock().await.restore(&snapshot.data) {
                    tracing::error!(
                        node_id = %self.id,
                        index = snapshot.meta.last_included_index,
                        error = %e,
                        "Failed to restore state machine from snapshot"
                    );
                }
            }
            Effect::PrepareSnapshot(meta) => self.prepare_snapshot(meta).await,
        }
    }

    fn arm(&self, timers: &mut TimerSet, timer: Timer) {
        let after = match timer {
            Timer::Election => random_election_timeout(
                self.config.election_timeout_min_ms,
                self.config.election_timeout_max_ms,
            ),
            Timer::Heartbeat => self.config.heartbeat_interval(),
            Timer::Discovery => self.config.discovery_interval(),
        };
        timers.arm(timer, after);
    }

    async fn apply_entry(&self, entry: LogEntry, respond: bool) {
        let Command::Application(command) = &entry.command else {
            return;
        };
        let result = self.state_machine.lock().await.apply(command);
        if !respond {
            return;
        }
        if let Some(client) = entry.client {
            self.transport.deliver(
                self.id,
                client,
                RaftMessage::ClientResponse {
                    index: entry.index,
                    result,
                },
            );
        }
    }

    /// Capture the state machine now, then let the store persist it in the
    /// background. The outcome comes back through the inbox.
    async fn prepare_snapshot(&self, meta: SnapshotMetadata) {
        let data = self.state_machine.lock().await.snapshot();
        let store = self.snapshots.clone();
        let inbox = self.inbox_tx.clone();
        let node_id = self.id;
        tokio::spawn(async move {
            let result = match data {
                Ok(data) => store
                    .prepare_snapshot(meta, data)
                    .await
                    .map_err(|e| e.to_string()),
                Err(e) => Err(e.to_string()),
            };
            if inbox.send(Input::SnapshotPrepared(result)).await.is_err() {
                tracing::warn!(node_id = %node_id, "Node stopped before snapshot completed");
            }
        });
    }

    /// Check if this node is the leader
    pub async fn is_leader(&self) -> bool {
        self.state.read().await.is_leader()
    }

    pub async fn role(&self) -> Role {
        self.state.read().await.role
    }

    pub async fn current_term(&self) -> Term {
        self.state.read().await.current_term()
    }

    pub async fn commit_index(&self) -> LogIndex {
        self.state.read().await.commit_index()
    }

    /// Get the current leader ID as far as this node knows
    pub async fn leader_hint(&self) -> Option<PeerId> {
        self.state.read().await.leader_hint()
    }
}
