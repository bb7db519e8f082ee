use std::collections::BTreeSet;

use serde::{Deserialize, Serialize};

use crate::raft::cluster::ClusterConfiguration;
use crate::raft::index_map::LogIndexMap;
use crate::raft::log::{ReplicatedLog, Snapshot};
use crate::raft::metadata::RaftMetadata;
use crate::raft::types::{PeerId, Term};

/// Raft node role
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Role {
    Init,
    Follower,
    Candidate,
    Leader,
}

impl std::fmt::Display for Role {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Role::Init => write!(f, "init"),
            Role::Follower => write!(f, "follower"),
            Role::Candidate => write!(f, "candidate"),
            Role::Leader => write!(f, "leader"),
        }
    }
}

/// Static knobs the transition function needs.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CoreSettings {
    /// Peers probed for discovery while in Init.
    pub seeds: BTreeSet<PeerId>,
    /// Members that must be discovered before leaving Init.
    pub keep_init_until_found: usize,
    /// Maximum entries per `AppendEntries`.
    pub max_entries_batch: usize,
    /// Committed live entries that trigger a snapshot. 0 disables it.
    pub compaction_threshold: u64,
}

impl Default for CoreSettings {
    fn default() -> Self {
        Self {
            seeds: BTreeSet::new(),
            keep_init_until_found: 3,
            max_entries_batch: 1000,
            compaction_threshold: 1000,
        }
    }
}

/// Complete state of one node's consensus core.
///
/// `metadata` is the durable consensus state and only changes through domain
/// events. The other fields are per-role scratch that the transition
/// function rewrites directly.
#[derive(Debug, Clone)]
pub struct NodeState {
    pub id: PeerId,
    pub role: Role,
    pub metadata: RaftMetadata,
    pub log: ReplicatedLog,
    pub next_index: LogIndexMap,
    pub match_index: LogIndexMap,
    /// Leader that last sent us valid entries; used to redirect clients.
    pub leader: Option<PeerId>,
    /// Voters that granted us a vote in the current election.
    pub granted_votes: BTreeSet<PeerId>,
    pub snapshot_in_flight: bool,
    /// Set while a speculative candidate waits for the configuration it
    /// asked this peer for.
    pub config_requested_from: Option<PeerId>,
    /// Configuration in force before the log carried one. A follower falls
    /// back to it when every configuration entry is truncated away.
    pub initial_config: Option<ClusterConfiguration>,
    pub settings: CoreSettings,
}

impl NodeState {
    pub fn new(id: PeerId, settings: CoreSettings) -> Self {
        Self {
            id,
            role: Role::Init,
            metadata: RaftMetadata::default(),
            log: ReplicatedLog::new(),
            next_index: LogIndexMap::default(),
            match_index: LogIndexMap::default(),
            leader: None,
            granted_votes: BTreeSet::new(),
            snapshot_in_flight: false,
            config_requested_from: None,
            initial_config: None,
            settings,
        }
    }

    /// Start from a persisted snapshot; the snapshot's configuration becomes
    /// the starting configuration.
    pub fn restored(id: PeerId, settings: CoreSettings, snapshot: Snapshot) -> Self {
        let config = snapshot.meta.config.clone();
        let mut state = Self::new(id, settings);
        state.metadata = RaftMetadata::new(Term::ZERO, config);
        state.log = ReplicatedLog::restored(snapshot);
        state
    }

    pub fn current_term(&self) -> Term {
        self.metadata.current_term
    }

    pub fn config(&self) -> &ClusterConfiguration {
        &self.metadata.config
    }

    pub fn is_leader(&self) -> bool {
        self.role == Role::Leader
    }

    pub fn commit_index(&self) -> u64 {
        self.log.committed_index()
    }

    /// Best guess of the current leader, for client redirects.
    pub fn leader_hint(&self) -> Option<PeerId> {
        match self.role {
            Role::Leader => Some(self.id),
            Role::Follower => self.leader,
            Role::Init | Role::Candidate => None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::raft::log::SnapshotMetadata;

    #[test]
    fn test_new_state_is_init() {
        let state = NodeState::new(PeerId(1), CoreSettings::default());
        assert_eq!(state.role, Role::Init);
        assert_eq!(state.current_term(), Term::ZERO);
        assert!(state.log.is_empty());
        assert!(state.config().members().is_empty());
        assert_eq!(state.leader_hint(), None);
    }

    #[test]
    fn test_restored_from_snapshot() {
        let config = ClusterConfiguration::stable(2, [PeerId(1), PeerId(2), PeerId(3)]);
        let snapshot = Snapshot {
            meta: SnapshotMetadata {
                last_included_index: 12,
                last_included_term: Term(3),
                config: config.clone(),
            },
            data: Vec::new(),
        };
        let state = NodeState::restored(PeerId(2), CoreSettings::default(), snapshot);
        assert_eq!(state.config(), &config);
        assert_eq!(state.log.last_index(), 12);
        assert_eq!(state.commit_index(), 12);
    }

    #[test]
    fn test_role_display() {
        assert_eq!(Role::Init.to_string(), "init");
        assert_eq!(Role::Leader.to_string(), "leader");
    }
}
