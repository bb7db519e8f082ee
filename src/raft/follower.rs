//! Follower role: voting, accepting entries and installing snapshots.

use crate::error::Result;
use crate::raft::log::{LogEntry, Snapshot};
use crate::raft::machine::Machine;
use crate::raft::message::{Effect, RaftMessage};
use crate::raft::metadata::DomainEvent;
use crate::raft::types::{LogIndex, PeerId, Term};

impl Machine {
    pub(super) fn on_follower(&mut self, from: PeerId, message: RaftMessage) -> Result<()> {
        match message {
            RaftMessage::RequestVote {
                term,
                candidate,
                last_log_term,
                last_log_index,
            } => self.handle_request_vote(from, term, candidate, last_log_term, last_log_index),
            RaftMessage::AppendEntries {
                member,
                term,
                prev_log_term,
                prev_log_index,
                entries,
                leader_commit,
            } => self.handle_append_entries(
                from,
                member,
                term,
                prev_log_term,
                prev_log_index,
                entries,
                leader_commit,
            ),
            RaftMessage::InstallSnapshot {
                leader,
                term,
                snapshot,
            } => self.handle_install_snapshot(from, leader, term, snapshot),
            other => self.on_common(from, other),
        }
    }

    fn handle_request_vote(
        &mut self,
        from: PeerId,
        term: Term,
        candidate: PeerId,
        last_log_term: Term,
        last_log_index: LogIndex,
    ) -> Result<()> {
        if self.is_foreign_candidate(candidate) {
            tracing::debug!(
                node_id = %self.state.id,
                candidate = %candidate,
                "Ignoring vote request from non-member"
            );
            let current = self.term();
            self.send(from, RaftMessage::DeclineCandidate { term: current });
            return Ok(());
        }
        self.observe_term(term)?;
        let current = self.term();

        if term < current {
            tracing::debug!(
                node_id = %self.state.id,
                candidate = %candidate,
                term = term.value(),
                current = current.value(),
                "Rejecting vote for stale term"
            );
            self.send(from, RaftMessage::DeclineCandidate { term: current });
            return Ok(());
        }
        if !self.state.metadata.can_vote_for(current, candidate) {
            tracing::debug!(
                node_id = %self.state.id,
                candidate = %candidate,
                voted_for = ?self.state.metadata.voted_for,
                "Already voted in this term"
            );
            self.send(from, RaftMessage::DeclineCandidate { term: current });
            return Ok(());
        }
        if !self.candidate_log_is_current(last_log_term, last_log_index) {
            tracing::debug!(
                node_id = %self.state.id,
                candidate = %candidate,
                last_log_index,
                "Candidate log is behind ours"
            );
            self.send(from, RaftMessage::DeclineCandidate { term: current });
            return Ok(());
        }

        tracing::info!(
            node_id = %self.state.id,
            candidate = %candidate,
            term = current.value(),
            "Voting for candidate"
        );
        self.apply(DomainEvent::VoteFor(candidate))?;
        self.reset_election_deadline();
        self.send(from, RaftMessage::VoteCandidate { term: current });
        Ok(())
    }

    #[allow(clippy::too_many_arguments)]
    fn handle_append_entries(
        &mut self,
        from: PeerId,
        leader: PeerId,
        term: Term,
        prev_log_term: Term,
        prev_log_index: LogIndex,
        entries: Vec<LogEntry>,
        leader_commit: LogIndex,
    ) -> Result<()> {
        self.observe_term(term)?;
        let current = self.term();

        if term < current {
            tracing::debug!(
                node_id = %self.state.id,
                leader = %leader,
                term = term.value(),
                current = current.value(),
                "Rejecting append from stale leader"
            );
            self.send(from, RaftMessage::AppendRejected { term: current });
            return Ok(());
        }

        self.state.leader = Some(leader);
        self.reset_election_deadline();

        if !self
            .state
            .log
            .contains_matching_entry(prev_log_term, prev_log_index)
        {
            tracing::debug!(
                node_id = %self.state.id,
                prev_log_index,
                prev_log_term = prev_log_term.value(),
                last_index = self.state.log.last_index(),
                "Log does not contain matching entry, rejecting"
            );
            self.send(from, RaftMessage::AppendRejected { term: current });
            return Ok(());
        }

        let matched = entries.last().map_or(prev_log_index, |e| e.index);
        if !entries.is_empty() {
            tracing::debug!(
                node_id = %self.state.id,
                count = entries.len(),
                after = prev_log_index,
                "Appending entries"
            );
            let log = std::mem::take(&mut self.state.log);
            self.state.log = log.append_after(entries, prev_log_index);
            self.sync_config_with_log(term)?;
        }

        self.commit_until(leader_commit.min(matched), false);
        self.send(
            from,
            RaftMessage::AppendSuccessful {
                term: current,
                last_index: matched,
            },
        );
        Ok(())
    }

    fn handle_install_snapshot(
        &mut self,
        from: PeerId,
        leader: PeerId,
        term: Term,
        snapshot: Snapshot,
    ) -> Result<()> {
        self.observe_term(term)?;
        let current = self.term();

        if term < current {
            self.send(from, RaftMessage::InstallSnapshotRejected { term: current });
            return Ok(());
        }

        self.state.leader = Some(leader);
        self.reset_election_deadline();

        let boundary = snapshot.meta.last_included_index;
        if boundary > self.state.log.committed_index() {
            tracing::info!(
                node_id = %self.state.id,
                leader = %leader,
                index = boundary,
                term = snapshot.meta.last_included_term.value(),
                "Installing snapshot"
            );
            self.emit(Effect::Restore(snapshot.clone()));
            let log = std::mem::take(&mut self.state.log);
            self.state.log = log.compact_with(snapshot);
            self.sync_config_with_log(term)?;
        } else {
            tracing::debug!(
                node_id = %self.state.id,
                index = boundary,
                committed = self.state.log.committed_index(),
                "Snapshot already covered by committed log"
            );
        }

        self.send(
            from,
            RaftMessage::InstallSnapshotSuccessful {
                term: current,
                last_index: boundary,
            },
        );
        Ok(())
    }
}
