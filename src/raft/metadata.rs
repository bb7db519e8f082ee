use std::collections::BTreeSet;

use crate::error::{RaftError, Result};
use crate::raft::cluster::ClusterConfiguration;
use crate::raft::types::{PeerId, Term};

/// Consensus-relevant node state: term, configuration and vote record.
///
/// Values are immutable; every change goes through [`RaftMetadata::apply`]
/// with a [`DomainEvent`], which returns the next value.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RaftMetadata {
    pub current_term: Term,
    pub config: ClusterConfiguration,
    pub voted_for: Option<PeerId>,
    /// Only meaningful while campaigning.
    pub votes_received: usize,
}

/// The closed set of metadata transitions.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DomainEvent {
    UpdateTerm(Term),
    BecomeFollower(Option<Term>),
    BecomeLeader,
    StartElection,
    KeepState,
    VoteFor(PeerId),
    IncrementVote,
    VoteForSelf(PeerId),
    WithNewConfig {
        term: Option<Term>,
        config: ClusterConfiguration,
    },
}

impl RaftMetadata {
    pub fn new(current_term: Term, config: ClusterConfiguration) -> Self {
        Self {
            current_term,
            config,
            voted_for: None,
            votes_received: 0,
        }
    }

    pub fn members(&self) -> BTreeSet<PeerId> {
        self.config.members()
    }

    pub fn members_without(&self, member: PeerId) -> BTreeSet<PeerId> {
        let mut members = self.config.members();
        members.remove(&member);
        members
    }

    /// One vote per term; repeating it for the same candidate is allowed.
    pub fn can_vote_for(&self, term: Term, candidate: PeerId) -> bool {
        term == self.current_term && self.voted_for.map_or(true, |voted| voted == candidate)
    }

    pub fn has_majority(&self) -> bool {
        self.votes_received > self.config.members().len() / 2
    }

    /// Apply one domain event.
    ///
    /// Moving the term backwards is a contract violation and aborts the
    /// transition with [`RaftError::IllegalTransition`].
    pub fn apply(&self, event: DomainEvent) -> Result<RaftMetadata> {
        let next = match event {
            DomainEvent::UpdateTerm(term) => self.with_term(term)?,
            DomainEvent::BecomeFollower(term) => {
                let base = match term {
                    Some(term) => self.with_term(term)?,
                    None => self.clone(),
                };
                RaftMetadata {
                    votes_received: 0,
                    ..base
                }
            }
            DomainEvent::BecomeLeader => RaftMetadata {
                votes_received: 0,
                ..self.clone()
            },
            DomainEvent::StartElection => {
                RaftMetadata::new(self.current_term.next(), self.config.clone())
            }
            DomainEvent::KeepState => self.clone(),
            DomainEvent::VoteFor(candidate) => RaftMetadata {
                voted_for: Some(candidate),
                ..self.clone()
            },
            DomainEvent::IncrementVote => RaftMetadata {
                votes_received: self.votes_received + 1,
                ..self.clone()
            },
            DomainEvent::VoteForSelf(me) => RaftMetadata {
                voted_for: Some(me),
                votes_received: self.votes_received + 1,
                ..self.clone()
            },
            DomainEvent::WithNewConfig { term, config } => {
                let base = match term {
                    Some(term) if term > self.current_term => self.with_term(term)?,
                    _ => self.clone(),
                };
                RaftMetadata { config, ..base }
            }
        };
        Ok(next)
    }

    /// Adopt `term`. A newer term clears the vote record; the same term is a
    /// no-op so a vote already cast in this term is never forgotten.
    fn with_term(&self, term: Term) -> Result<RaftMetadata> {
        if term < self.current_term {
            return Err(RaftError::IllegalTransition(format!(
                "term would move backwards from {} to {}",
                self.current_term, term
            )));
        }
        if term == self.current_term {
            return Ok(self.clone());
        }
        Ok(RaftMetadata {
            current_term: term,
            config: self.config.clone(),
            voted_for: None,
            votes_received: 0,
        })
    }
}
