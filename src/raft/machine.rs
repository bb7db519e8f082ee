//! The consensus core as a pure transition function.
//!
//! [`step`] takes the current [`NodeState`] and one [`Input`] and returns the
//! next state plus the [`Effect`]s the driver must carry out. Nothing here
//! touches the network, a clock or the application; that keeps every
//! transition testable on its own.
//!
//! Follow-up events a handler raises for itself (re-delivering a message after
//! stepping down, submitting the stable configuration once a joint one
//! commits) go onto an internal queue that is drained before `step` returns.

use std::collections::{BTreeSet, VecDeque};

use crate::error::{RaftError, Result};
use crate::raft::cluster::ClusterConfiguration;
use crate::raft::log::{Command, Snapshot, SnapshotMetadata};
use crate::raft::message::{ClientRequest, Effect, Input, RaftMessage, Timer};
use crate::raft::metadata::DomainEvent;
use crate::raft::state::{NodeState, Role};
use crate::raft::types::{LogIndex, PeerId, Term};

/// Upper bound on internally queued follow-up events per step.
const MAX_FOLLOW_UPS: usize = 64;

/// Result of processing one input.
#[derive(Debug, Clone)]
pub struct Transition {
    pub state: NodeState,
    pub effects: Vec<Effect>,
}

/// Process one input against `state`.
///
/// An `Err` means the transition was aborted because an internal contract
/// was violated; the caller should keep `state` unchanged.
pub fn step(state: &NodeState, input: Input) -> Result<Transition> {
    let mut machine = Machine::new(state.clone());
    machine.process(input)?;
    Ok(Transition {
        state: machine.state,
        effects: machine.effects,
    })
}

pub(crate) struct Machine {
    pub(crate) state: NodeState,
    effects: Vec<Effect>,
    follow_ups: VecDeque<Input>,
}

impl Machine {
    fn new(state: NodeState) -> Self {
        Self {
            state,
            effects: Vec::new(),
            follow_ups: VecDeque::new(),
        }
    }

    fn process(&mut self, input: Input) -> Result<()> {
        self.follow_ups.push_back(input);
        let mut processed = 0;
        while let Some(input) = self.follow_ups.pop_front() {
            processed += 1;
            if processed > MAX_FOLLOW_UPS {
                return Err(RaftError::IllegalTransition(format!(
                    "more than {} follow-up events in a single step",
                    MAX_FOLLOW_UPS
                )));
            }
            self.dispatch(input)?;
        }
        Ok(())
    }

    fn dispatch(&mut self, input: Input) -> Result<()> {
        match input {
            Input::Message { from, message } => {
                tracing::trace!(
                    node_id = %self.state.id,
                    from = %from,
                    role = %self.state.role,
                    message = message.name(),
                    "Processing message"
                );
                match self.state.role {
                    Role::Init => self.on_init(from, message),
                    Role::Follower => self.on_follower(from, message),
                    Role::Candidate => self.on_candidate(from, message),
                    Role::Leader => self.on_leader(from, message),
                }
            }
            Input::Timeout(timer) => self.on_timeout(timer),
            Input::CompactLog => self.init_log_snapshot(),
            Input::SnapshotPrepared(result) => {
                self.on_snapshot_prepared(result);
                Ok(())
            }
        }
    }

    fn on_timeout(&mut self, timer: Timer) -> Result<()> {
        match (timer, self.state.role) {
            (Timer::Election, Role::Follower) => self.begin_election(),
            (Timer::Election, Role::Candidate) => self.on_candidate_timeout(),
            (Timer::Heartbeat, Role::Leader) => {
                self.send_heartbeat()?;
                self.arm(Timer::Heartbeat);
                Ok(())
            }
            (Timer::Discovery, Role::Init) => {
                self.on_discovery_timeout();
                Ok(())
            }
            (timer, role) => {
                tracing::debug!(node_id = %self.state.id, ?timer, %role, "Ignoring timer");
                Ok(())
            }
        }
    }

    // ==================== Effects ====================

    pub(super) fn send(&mut self, to: PeerId, message: RaftMessage) {
        self.effects.push(Effect::Send { to, message });
    }

    pub(super) fn forward(&mut self, from: PeerId, to: PeerId, message: RaftMessage) {
        self.effects.push(Effect::Forward { from, to, message });
    }

    pub(super) fn arm(&mut self, timer: Timer) {
        self.effects.push(Effect::ArmTimer(timer));
    }

    pub(super) fn cancel(&mut self, timer: Timer) {
        self.effects.push(Effect::CancelTimer(timer));
    }

    pub(super) fn emit(&mut self, effect: Effect) {
        self.effects.push(effect);
    }

    /// Queue an input to be processed right after the current one.
    pub(super) fn redeliver(&mut self, from: PeerId, message: RaftMessage) {
        self.follow_ups.push_front(Input::Message { from, message });
    }

    /// Queue an input behind everything already pending.
    pub(super) fn enqueue(&mut self, from: PeerId, message: RaftMessage) {
        self.follow_ups.push_back(Input::Message { from, message });
    }

    pub(super) fn reset_election_deadline(&mut self) {
        self.arm(Timer::Election);
    }

    // ==================== Metadata & roles ====================

    pub(super) fn apply(&mut self, event: DomainEvent) -> Result<()> {
        self.state.metadata = self.state.metadata.apply(event)?;
        Ok(())
    }

    pub(super) fn term(&self) -> Term {
        self.state.metadata.current_term
    }

    /// Adopt a newer term seen on any message.
    pub(super) fn observe_term(&mut self, term: Term) -> Result<()> {
        if term > self.term() {
            tracing::info!(
                node_id = %self.state.id,
                received = term.value(),
                current = self.term().value(),
                "Received newer term"
            );
            self.apply(DomainEvent::UpdateTerm(term))?;
        }
        Ok(())
    }

    pub(super) fn goto(&mut self, role: Role) {
        let previous = self.state.role;
        if previous == role {
            return;
        }
        tracing::info!(
            node_id = %self.state.id,
            term = self.term().value(),
            from = %previous,
            to = %role,
            "Role change"
        );
        self.state.role = role;

        if previous == Role::Init {
            self.cancel(Timer::Discovery);
        }
        if previous == Role::Leader {
            self.cancel(Timer::Heartbeat);
        }
        if previous == Role::Candidate {
            self.state.granted_votes.clear();
        }
        match role {
            Role::Follower | Role::Candidate => self.arm(Timer::Election),
            Role::Leader => self.cancel(Timer::Election),
            Role::Init => {}
        }
    }

    pub(super) fn step_down(&mut self, term: Option<Term>) -> Result<()> {
        self.apply(DomainEvent::BecomeFollower(term))?;
        self.goto(Role::Follower);
        Ok(())
    }

    // ==================== Elections ====================

    /// Follower election timeout.
    pub(super) fn begin_election(&mut self) -> Result<()> {
        self.reset_election_deadline();
        if self.awaiting_configuration() {
            return Ok(());
        }
        let members = self.state.metadata.members();
        if members.is_empty() || !members.contains(&self.state.id) {
            tracing::debug!(
                node_id = %self.state.id,
                members = members.len(),
                "Not a voting member, staying follower"
            );
            self.apply(DomainEvent::KeepState)?;
            self.goto(Role::Follower);
            return Ok(());
        }
        self.apply(DomainEvent::StartElection)?;
        self.goto(Role::Candidate);
        self.campaign()
    }

    /// A node that joined through a leader's `AppendEntries` does not know
    /// the real membership yet; ask again instead of campaigning.
    pub(super) fn awaiting_configuration(&mut self) -> bool {
        let Some(peer) = self.state.config_requested_from else {
            return false;
        };
        tracing::debug!(node_id = %self.state.id, peer = %peer, "Still waiting for configuration");
        self.send(peer, RaftMessage::RequestConfiguration);
        true
    }

    /// Make the configuration in force match the newest one in the log.
    ///
    /// Configuration entries take effect as soon as they are appended, so a
    /// truncation that drops one must undo it as well.
    pub(super) fn sync_config_with_log(&mut self, term: Term) -> Result<()> {
        let target = match self.state.log.latest_configuration() {
            Some(config) => {
                let config = config.clone();
                self.state.config_requested_from = None;
                config
            }
            None => match &self.state.initial_config {
                Some(config) => config.clone(),
                None => return Ok(()),
            },
        };
        if &target == self.state.config() {
            return Ok(());
        }
        tracing::info!(node_id = %self.state.id, config = %target, "Adopting configuration from log");
        self.use_config(Some(term), target)
    }

    /// Switch to a configuration carried by the log.
    pub(super) fn use_config(
        &mut self,
        term: Option<Term>,
        config: ClusterConfiguration,
    ) -> Result<()> {
        if self.state.initial_config.is_none() {
            self.state.initial_config = Some(self.state.metadata.config.clone());
        }
        self.apply(DomainEvent::WithNewConfig { term, config })
    }

    /// Ask every other member for its vote and vote for ourselves.
    pub(super) fn campaign(&mut self) -> Result<()> {
        let members = self.state.metadata.members();
        if members.is_empty() {
            tracing::warn!(node_id = %self.state.id, "Tried to start an election with no members");
            return self.step_down(None);
        }
        tracing::info!(
            node_id = %self.state.id,
            term = self.term().value(),
            members = members.len(),
            "Starting election"
        );
        let request = RaftMessage::RequestVote {
            term: self.term(),
            candidate: self.state.id,
            last_log_term: self.state.log.last_term(),
            last_log_index: self.state.log.last_index(),
        };
        for member in self.state.metadata.members_without(self.state.id) {
            self.send(member, request.clone());
        }
        let me = self.state.id;
        self.apply(DomainEvent::VoteForSelf(me))?;
        self.state.granted_votes = BTreeSet::from([me]);
        if self.state.metadata.has_majority() {
            self.become_leader()?;
        }
        Ok(())
    }

    /// A vote request from outside our configuration, e.g. from a node that
    /// was removed and never saw its removal commit.
    pub(super) fn is_foreign_candidate(&self, candidate: PeerId) -> bool {
        let members = self.state.metadata.members();
        !members.is_empty() && !members.contains(&candidate)
    }

    /// Whether a candidate's log is at least as up to date as ours.
    pub(super) fn candidate_log_is_current(
        &self,
        last_log_term: Term,
        last_log_index: LogIndex,
    ) -> bool {
        let our_term = self.state.log.last_term();
        last_log_term > our_term
            || (last_log_term == our_term && last_log_index >= self.state.log.last_index())
    }

    // ==================== Commit & apply ====================

    /// Commit up to `index`, emitting application effects for every newly
    /// committed entry.
    pub(super) fn commit_until(&mut self, index: LogIndex, respond: bool) {
        let committed = self.state.log.committed_index();
        let target = index.min(self.state.log.last_index());
        if target <= committed {
            return;
        }
        for entry in self.state.log.slice(committed, target) {
            match &entry.command {
                Command::Application(_) => {
                    tracing::debug!(
                        node_id = %self.state.id,
                        index = entry.index,
                        client = ?entry.client,
                        "Applying committed entry"
                    );
                    let respond = respond && entry.client.is_some();
                    self.emit(Effect::Apply { entry, respond });
                }
                Command::Configuration(config) if !config.is_transitioning() => {
                    tracing::info!(node_id = %self.state.id, %config, "Now on stable configuration");
                }
                Command::Configuration(_) | Command::Noop => {}
            }
        }
        let log = std::mem::take(&mut self.state.log);
        self.state.log = log.commit(target);
        self.maybe_schedule_compaction();
    }

    // ==================== Shared behaviour ====================

    /// Cluster management, discovery and diagnostics, common to every role.
    pub(super) fn on_common(&mut self, from: PeerId, message: RaftMessage) -> Result<()> {
        match message {
            RaftMessage::WhoIsTheLeader => {
                match (self.state.role, self.state.leader) {
                    (Role::Follower, Some(leader)) if leader != self.state.id => {
                        self.forward(from, leader, RaftMessage::WhoIsTheLeader);
                    }
                    _ => {
                        let leader = self.state.leader_hint();
                        self.send(
                            from,
                            RaftMessage::LeaderIs {
                                leader,
                                pending: None,
                            },
                        );
                    }
                }
                Ok(())
            }
            RaftMessage::ClientMessage(request) => {
                let leader = self.state.leader_hint();
                tracing::info!(
                    node_id = %self.state.id,
                    client = %request.client,
                    leader = ?leader,
                    "Not the leader, redirecting client"
                );
                self.send(
                    from,
                    RaftMessage::LeaderIs {
                        leader,
                        pending: Some(request),
                    },
                );
                Ok(())
            }
            RaftMessage::ChangeConfiguration { new_config } => {
                // Outside of Init a configuration only arrives out of the log
                // as the answer to our own RequestConfiguration.
                let requested = self.state.config_requested_from == Some(from);
                let unconfigured = self.state.metadata.members().is_empty();
                if requested || unconfigured {
                    self.state.config_requested_from = None;
                    if unconfigured || new_config.is_newer(self.state.config()) {
                        tracing::info!(
                            node_id = %self.state.id,
                            config = %new_config,
                            "Adopting configuration from cluster"
                        );
                        self.apply(DomainEvent::WithNewConfig {
                            term: None,
                            config: new_config,
                        })?;
                        self.goto(Role::Follower);
                    } else {
                        tracing::debug!(
                            node_id = %self.state.id,
                            config = %new_config,
                            "Requested configuration is not newer than ours"
                        );
                    }
                } else if &new_config == self.state.config() {
                    tracing::debug!(node_id = %self.state.id, "Already on this configuration");
                } else if let Some(leader) = self.state.leader_hint() {
                    self.forward(from, leader, RaftMessage::ChangeConfiguration { new_config });
                } else {
                    tracing::warn!(
                        node_id = %self.state.id,
                        "Dropping configuration change, no known leader"
                    );
                }
                Ok(())
            }
            RaftMessage::RequestConfiguration => {
                if let Some(leader) = self.state.leader_hint() {
                    self.forward(from, leader, RaftMessage::RequestConfiguration);
                }
                Ok(())
            }
            RaftMessage::RaftMembersDiscoveryRequest => {
                let member = self.state.id;
                self.send(from, RaftMessage::RaftMembersDiscoveryResponse { member });
                Ok(())
            }
            RaftMessage::RaftMembersDiscoveryResponse { member } => {
                if self.state.role == Role::Init {
                    tracing::info!(node_id = %self.state.id, member = %member, "Discovered raft member");
                    let keep_init_until = self.state.settings.keep_init_until_found;
                    let me = self.state.id;
                    self.enqueue(
                        me,
                        RaftMessage::RaftMemberAdded {
                            member,
                            keep_init_until,
                        },
                    );
                }
                Ok(())
            }
            RaftMessage::AskForState => {
                let state = self.state.role;
                self.send(from, RaftMessage::IAmInState { state });
                Ok(())
            }
            other => {
                if let Some(term) = other.term() {
                    match self.state.role {
                        Role::Follower => self.observe_term(term)?,
                        Role::Candidate if term > self.term() => self.step_down(Some(term))?,
                        _ => {}
                    }
                }
                tracing::debug!(
                    node_id = %self.state.id,
                    role = %self.state.role,
                    from = %from,
                    message = other.name(),
                    "Ignoring message"
                );
                Ok(())
            }
        }
    }

    pub(super) fn client_request(&self, command: Command) -> RaftMessage {
        RaftMessage::ClientMessage(ClientRequest {
            client: self.state.id,
            command,
        })
    }

    // ==================== Snapshots ====================

    /// Ask the driver for a snapshot of the state machine at the committed index.
    pub(super) fn init_log_snapshot(&mut self) -> Result<()> {
        if self.state.role == Role::Init {
            return Ok(());
        }
        if self.state.snapshot_in_flight {
            tracing::debug!(node_id = %self.state.id, "Snapshot already in progress");
            return Ok(());
        }
        let committed = self.state.log.committed_index();
        if committed == 0 || committed <= self.state.log.prev_index() {
            return Ok(());
        }
        let last_included_term = self.state.log.term_at(committed).ok_or_else(|| {
            RaftError::IllegalTransition(format!("no term for committed index {}", committed))
        })?;
        let meta = SnapshotMetadata {
            last_included_index: committed,
            last_included_term,
            config: self
                .state
                .log
                .configuration_at(committed)
                .or(self.state.initial_config.as_ref())
                .unwrap_or(&self.state.metadata.config)
                .clone(),
        };
        tracing::info!(
            node_id = %self.state.id,
            index = committed,
            term = last_included_term.value(),
            "Init snapshot"
        );
        self.state.snapshot_in_flight = true;
        self.emit(Effect::PrepareSnapshot(meta));
        Ok(())
    }

    fn maybe_schedule_compaction(&mut self) {
        let threshold = self.state.settings.compaction_threshold;
        if threshold == 0 || self.state.role == Role::Init {
            return;
        }
        let uncompacted = self.state.log.committed_index() - self.state.log.prev_index();
        if uncompacted >= threshold {
            if let Err(e) = self.init_log_snapshot() {
                tracing::error!(node_id = %self.state.id, error = %e, "Unable to schedule compaction");
            }
        }
    }

    fn on_snapshot_prepared(&mut self, result: std::result::Result<Option<Snapshot>, String>) {
        self.state.snapshot_in_flight = false;
        match result {
            Ok(Some(snapshot)) => {
                let index = snapshot.meta.last_included_index;
                let log = std::mem::take(&mut self.state.log);
                self.state.log = log.compact_with(snapshot);
                tracing::info!(
                    node_id = %self.state.id,
                    index,
                    live_entries = self.state.log.len(),
                    "Compacted log"
                );
            }
            Ok(None) => {
                tracing::info!(node_id = %self.state.id, "No snapshot data obtained");
            }
            Err(e) => {
                tracing::error!(node_id = %self.state.id, error = %e, "Unable to prepare snapshot");
            }
        }
    }
}
