//! Candidate role: collecting votes.

use crate::error::Result;
use crate::raft::machine::Machine;
use crate::raft::message::RaftMessage;
use crate::raft::metadata::DomainEvent;
use crate::raft::types::PeerId;

impl Machine {
    pub(super) fn on_candidate(&mut self, from: PeerId, message: RaftMessage) -> Result<()> {
        let current = self.term();
        match message {
            RaftMessage::RequestVote { term, candidate, .. } => {
                if term > current && !self.is_foreign_candidate(candidate) {
                    tracing::info!(
                        node_id = %self.state.id,
                        candidate = %candidate,
                        term = term.value(),
                        "Newer election in progress, stepping down"
                    );
                    self.step_down(Some(term))?;
                    self.redeliver(from, message);
                } else {
                    // Already voted for ourselves this term.
                    self.send(from, RaftMessage::DeclineCandidate { term: current });
                }
                Ok(())
            }
            RaftMessage::VoteCandidate { term } => {
                if term > current {
                    return self.step_down(Some(term));
                }
                if term < current {
                    tracing::debug!(node_id = %self.state.id, voter = %from, "Ignoring vote from earlier election");
                    return Ok(());
                }
                if !self.state.metadata.members().contains(&from) {
                    tracing::warn!(node_id = %self.state.id, voter = %from, "Vote from non-member ignored");
                    return Ok(());
                }
                if !self.state.granted_votes.insert(from) {
                    tracing::debug!(node_id = %self.state.id, voter = %from, "Duplicate vote ignored");
                    return Ok(());
                }
                self.apply(DomainEvent::IncrementVote)?;
                tracing::info!(
                    node_id = %self.state.id,
                    voter = %from,
                    votes = self.state.metadata.votes_received,
                    members = self.state.metadata.members().len(),
                    term = current.value(),
                    "Received vote"
                );
                if self.state.metadata.has_majority() {
                    self.become_leader()?;
                }
                Ok(())
            }
            RaftMessage::DeclineCandidate { term } => {
                if term > current {
                    self.step_down(Some(term))
                } else {
                    tracing::debug!(node_id = %self.state.id, voter = %from, "Vote declined");
                    Ok(())
                }
            }
            RaftMessage::AppendEntries { term, .. } | RaftMessage::InstallSnapshot { term, .. } => {
                if term >= current {
                    tracing::info!(
                        node_id = %self.state.id,
                        leader = %from,
                        term = term.value(),
                        "Leader elected, stepping down"
                    );
                    self.step_down(Some(term))?;
                    self.redeliver(from, message);
                } else if matches!(message, RaftMessage::AppendEntries { .. }) {
                    self.send(from, RaftMessage::AppendRejected { term: current });
                } else {
                    self.send(from, RaftMessage::InstallSnapshotRejected { term: current });
                }
                Ok(())
            }
            other => self.on_common(from, other),
        }
    }

    pub(super) fn on_candidate_timeout(&mut self) -> Result<()> {
        if self.awaiting_configuration() {
            self.reset_election_deadline();
            return Ok(());
        }
        if self.state.metadata.members().len() > 1 {
            tracing::info!(
                node_id = %self.state.id,
                term = self.term().value(),
                "Election timed out, starting new election"
            );
            self.apply(DomainEvent::StartElection)?;
            self.reset_election_deadline();
            self.campaign()
        } else {
            tracing::info!(node_id = %self.state.id, "Election timed out with no peers, stepping down");
            self.step_down(None)
        }
    }
}

#[cfg(test)]
mod tests {
    use crate::raft::machine::step;
    use crate::raft::message::{Input, RaftMessage, Timer};
    use crate::raft::metadata::RaftMetadata;
    use crate::raft::state::{CoreSettings, NodeState, Role};
    use crate::raft::types::{PeerId, Term};
    use crate::raft::ClusterConfiguration;

    fn candidate(members: &[u64]) -> NodeState {
        let mut state = NodeState::new(PeerId(1), CoreSettings::default());
        state.role = Role::Follower;
        state.metadata = RaftMetadata::new(
            Term(1),
            ClusterConfiguration::stable(1, members.iter().copied().map(PeerId)),
        );
        let t = step(&state, Input::Timeout(Timer::Election)).unwrap();
        assert_eq!(t.state.role, Role::Candidate);
        t.state
    }

    fn from(peer: u64, message: RaftMessage) -> Input {
        Input::message(PeerId(peer), message)
    }

    #[test]
    fn test_duplicate_votes_count_once() {
        let state = candidate(&[1, 2, 3, 4, 5]);
        let vote = RaftMessage::VoteCandidate { term: Term(2) };
        let t = step(&state, from(2, vote.clone())).unwrap();
        let t = step(&t.state, from(2, vote)).unwrap();
        assert_eq!(t.state.role, Role::Candidate);
        assert_eq!(t.state.metadata.votes_received, 2);
    }

    #[test]
    fn test_vote_from_non_member_ignored() {
        let state = candidate(&[1, 2, 3]);
        let t = step(&state, from(9, RaftMessage::VoteCandidate { term: Term(2) })).unwrap();
        assert_eq!(t.state.role, Role::Candidate);
        assert_eq!(t.state.metadata.votes_received, 1);
    }

    #[test]
    fn test_stale_vote_ignored() {
        let state = candidate(&[1, 2, 3]);
        let t = step(&state, from(2, RaftMessage::VoteCandidate { term: Term(1) })).unwrap();
        assert_eq!(t.state.role, Role::Candidate);
    }

    #[test]
    fn test_any_newer_term_steps_down() {
        let state = candidate(&[1, 2, 3]);
        let t = step(
            &state,
            from(
                3,
                RaftMessage::AppendSuccessful {
                    term: Term(6),
                    last_index: 0,
                },
            ),
        )
        .unwrap();
        assert_eq!(t.state.role, Role::Follower);
        assert_eq!(t.state.current_term(), Term(6));
    }

    #[test]
    fn test_timeout_restarts_election() {
        let state = candidate(&[1, 2, 3]);
        let t = step(&state, Input::Timeout(Timer::Election)).unwrap();
        assert_eq!(t.state.role, Role::Candidate);
        assert_eq!(t.state.current_term(), Term(3));
        assert_eq!(t.state.metadata.voted_for, Some(PeerId(1)));
        assert_eq!(t.state.granted_votes.len(), 1);
    }

    #[test]
    fn test_stale_append_rejected() {
        let state = candidate(&[1, 2, 3]);
        let t = step(
            &state,
            from(
                2,
                RaftMessage::AppendEntries {
                    member: PeerId(2),
                    term: Term(1),
                    prev_log_term: Term::ZERO,
                    prev_log_index: 0,
                    entries: Vec::new(),
                    leader_commit: 0,
                },
            ),
        )
        .unwrap();
        assert_eq!(t.state.role, Role::Candidate);
        assert!(t.effects.iter().any(|e| matches!(
            e,
            crate::raft::Effect::Send {
                message: RaftMessage::AppendRejected { term: Term(2) },
                ..
            }
        )));
    }
}
