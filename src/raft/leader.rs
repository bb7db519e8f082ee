//! Leader role: replication, commitment and membership changes.

use crate::error::{RaftError, Result};
use crate::raft::index_map::LogIndexMap;
use crate::raft::log::{Command, LogEntry};
use crate::raft::machine::Machine;
use crate::raft::message::{ClientRequest, RaftMessage, Timer};
use crate::raft::metadata::DomainEvent;
use crate::raft::state::Role;
use crate::raft::types::{LogIndex, PeerId};

impl Machine {
    pub(super) fn on_leader(&mut self, from: PeerId, message: RaftMessage) -> Result<()> {
        let current = self.term();
        match message {
            RaftMessage::ClientMessage(request) => self.append_client_request(request),

            RaftMessage::AppendEntries { member: peer, term, .. }
            | RaftMessage::InstallSnapshot { leader: peer, term, .. } => {
                if term > current {
                    tracing::info!(
                        node_id = %self.state.id,
                        leader = %peer,
                        term = term.value(),
                        "Leader with newer term found, stepping down"
                    );
                    self.step_down(Some(term))?;
                    self.redeliver(from, message);
                    Ok(())
                } else {
                    tracing::warn!(
                        node_id = %self.state.id,
                        rogue = %peer,
                        term = term.value(),
                        "Rogue leader detected, replying with our entries"
                    );
                    self.send_entries(peer)
                }
            }

            RaftMessage::AppendSuccessful { term, last_index }
            | RaftMessage::InstallSnapshotSuccessful { term, last_index } => {
                if term > current {
                    return self.step_down(Some(term));
                }
                if term < current {
                    tracing::debug!(node_id = %self.state.id, follower = %from, "Ignoring stale replication reply");
                    return Ok(());
                }
                self.record_progress(from, last_index)?;
                self.maybe_commit()
            }

            RaftMessage::AppendRejected { term } | RaftMessage::InstallSnapshotRejected { term } => {
                if term > current {
                    return self.step_down(Some(term));
                }
                if term == current {
                    let next = self.state.next_index.decrement_for(from);
                    tracing::debug!(
                        node_id = %self.state.id,
                        follower = %from,
                        next_index = next,
                        "Follower rejected entries, backing off"
                    );
                    return self.send_entries(from);
                }
                Ok(())
            }

            RaftMessage::RequestVote { term, candidate, .. } => {
                if term > current && !self.is_foreign_candidate(candidate) {
                    tracing::info!(
                        node_id = %self.state.id,
                        candidate = %candidate,
                        term = term.value(),
                        "Election with newer term, stepping down"
                    );
                    self.step_down(Some(term))?;
                    self.redeliver(from, message);
                } else {
                    self.send(from, RaftMessage::DeclineCandidate { term: current });
                }
                Ok(())
            }

            RaftMessage::VoteCandidate { term } | RaftMessage::DeclineCandidate { term } => {
                if term > current {
                    self.step_down(Some(term))
                } else {
                    Ok(())
                }
            }

            RaftMessage::RequestConfiguration => {
                let new_config = self.state.metadata.config.clone();
                self.send(from, RaftMessage::ChangeConfiguration { new_config });
                Ok(())
            }

            RaftMessage::ChangeConfiguration { new_config } => {
                let config = self.state.config();
                if config.is_transitioning() {
                    tracing::warn!(
                        node_id = %self.state.id,
                        current = %config,
                        "Configuration change already in progress, ignoring"
                    );
                    return Ok(());
                }
                let joint = config.transition_to(&new_config);
                tracing::info!(
                    node_id = %self.state.id,
                    config = %joint,
                    "Starting transition to new configuration"
                );
                let request = self.client_request(Command::Configuration(joint));
                let me = self.state.id;
                self.enqueue(me, request);
                Ok(())
            }

            other => self.on_common(from, other),
        }
    }

    pub(super) fn become_leader(&mut self) -> Result<()> {
        self.apply(DomainEvent::BecomeLeader)?;
        self.goto(Role::Leader);
        let me = self.state.id;
        self.state.leader = Some(me);

        let last_index = self.state.log.last_index();
        self.state.next_index = LogIndexMap::new(last_index);
        self.state.match_index = LogIndexMap::new(0);
        tracing::info!(
            node_id = %me,
            term = self.term().value(),
            last_index,
            "Became leader"
        );

        // A no-op from the new term lets earlier entries commit.
        let noop = LogEntry::new(self.term(), self.state.log.next_index(), Command::Noop);
        let index = noop.index;
        let log = std::mem::take(&mut self.state.log);
        self.state.log = log.append(noop);
        self.state.match_index.put(me, index);

        self.send_heartbeat()?;
        self.arm(Timer::Heartbeat);
        self.maybe_commit()
    }

    fn append_client_request(&mut self, request: ClientRequest) -> Result<()> {
        let me = self.state.id;
        let term = self.term();
        let index = self.state.log.next_index();
        tracing::info!(
            node_id = %me,
            client = %request.client,
            index,
            term = term.value(),
            "Appending client command"
        );
        let entry =
            LogEntry::new(term, index, request.command.clone()).with_client(request.client);
        let log = std::mem::take(&mut self.state.log);
        self.state.log = log.append(entry);
        self.state.match_index.put(me, index);

        if let Some(config) = request.command.as_configuration() {
            if config.is_newer(self.state.config()) {
                tracing::info!(node_id = %me, %config, "Appended new configuration, using it now");
                self.use_config(None, config.clone())?;
            }
        }

        self.send_heartbeat()?;
        self.maybe_commit()?;

        if self.state.role == Role::Leader && !self.state.config().contains_on_new_state(me) {
            tracing::info!(
                node_id = %me,
                config = %self.state.config(),
                "Removed from configuration, stepping down"
            );
            return self.step_down(None);
        }
        self.apply(DomainEvent::KeepState)
    }

    fn record_progress(&mut self, follower: PeerId, last_index: LogIndex) -> Result<()> {
        let our_last = self.state.log.last_index();
        if last_index > our_last {
            return Err(RaftError::IllegalTransition(format!(
                "{} reports index {} beyond leader log {}",
                follower, last_index, our_last
            )));
        }
        self.state.next_index.put_if_greater(follower, last_index + 1);
        let matched = self.state.match_index.put_if_greater(follower, last_index);
        tracing::debug!(
            node_id = %self.state.id,
            follower = %follower,
            match_index = matched,
            "Follower progress"
        );
        Ok(())
    }

    pub(super) fn send_heartbeat(&mut self) -> Result<()> {
        for member in self.state.metadata.members_without(self.state.id) {
            self.send_entries(member)?;
        }
        Ok(())
    }

    /// Send `follower` whatever it is missing: the snapshot when its next
    /// index is already compacted away, entries otherwise.
    pub(super) fn send_entries(&mut self, follower: PeerId) -> Result<()> {
        let term = self.term();
        let me = self.state.id;
        let from = self.state.next_index.index_for(follower);

        if let Some(snapshot) = self.state.log.snapshot() {
            if snapshot.meta.last_included_index >= from {
                tracing::debug!(
                    node_id = %me,
                    follower = %follower,
                    index = snapshot.meta.last_included_index,
                    "Sending snapshot"
                );
                let snapshot = snapshot.clone();
                self.send(
                    follower,
                    RaftMessage::InstallSnapshot {
                        leader: me,
                        term,
                        snapshot,
                    },
                );
                return Ok(());
            }
        }

        let next = self.state.log.next_index();
        if from > next {
            return Err(RaftError::IllegalTransition(format!(
                "next index {} for {} is beyond log end {}",
                from, follower, next
            )));
        }

        let entries = self
            .state
            .log
            .entries_batch_from(from, self.state.settings.max_entries_batch);
        let prev_log_index = entries
            .first()
            .map_or(from.saturating_sub(1), |e| e.index - 1);
        let prev_log_term = self.state.log.term_at(prev_log_index).ok_or_else(|| {
            RaftError::IllegalTransition(format!("no term known for index {}", prev_log_index))
        })?;

        tracing::trace!(
            node_id = %me,
            follower = %follower,
            prev_log_index,
            count = entries.len(),
            "Sending entries"
        );
        self.send(
            follower,
            RaftMessage::AppendEntries {
                member: me,
                term,
                prev_log_term,
                prev_log_index,
                entries,
                leader_commit: self.state.log.committed_index(),
            },
        );
        Ok(())
    }

    /// Commit everything a quorum holds, provided the newest such entry is
    /// from the current term.
    fn maybe_commit(&mut self) -> Result<()> {
        let consensus = self
            .state
            .match_index
            .consensus_for_index(self.state.config());
        let committed = self.state.log.committed_index();
        if consensus > committed {
            if self.state.log.term_at(consensus) == Some(self.term()) {
                tracing::info!(
                    node_id = %self.state.id,
                    consensus,
                    committed,
                    "Consensus reached"
                );
                self.commit_until(consensus, true);
            } else {
                tracing::debug!(
                    node_id = %self.state.id,
                    consensus,
                    "Quorum entry is from an earlier term, not committing yet"
                );
            }
        }
        self.maybe_finish_transition();
        Ok(())
    }

    /// Once the joint configuration in force has committed, submit its
    /// stable successor.
    fn maybe_finish_transition(&mut self) {
        if self.state.role != Role::Leader {
            return;
        }
        let config = self.state.config().clone();
        if !config.is_transitioning() {
            return;
        }
        let committed = self.state.log.committed_index();
        let joint_index = self
            .state
            .log
            .entries()
            .iter()
            .rev()
            .find(|e| e.command.as_configuration() == Some(&config))
            .map(|e| e.index);
        let joint_committed = match joint_index {
            Some(index) => index <= committed,
            // Compacted into the snapshot, so committed.
            None => self.state.log.has_snapshot(),
        };
        if joint_committed {
            let stable = config.transition_to_stable();
            tracing::info!(
                node_id = %self.state.id,
                config = %stable,
                "Joint configuration committed, moving to stable"
            );
            let request = self.client_request(Command::Configuration(stable));
            let me = self.state.id;
            self.enqueue(me, request);
        }
    }
}
