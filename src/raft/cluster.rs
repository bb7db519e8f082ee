use std::collections::BTreeSet;

use serde::{Deserialize, Serialize};

use crate::raft::types::PeerId;

/// The set of voting members, either settled or mid-transition.
///
/// A `Joint` configuration requires majorities in both member sets before an
/// entry commits (see [`LogIndexMap::consensus_for_index`]). Sequence numbers
/// strictly increase across configuration changes.
///
/// [`LogIndexMap::consensus_for_index`]: crate::raft::LogIndexMap::consensus_for_index
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum ClusterConfiguration {
    Stable {
        sequence: u64,
        members: BTreeSet<PeerId>,
    },
    Joint {
        sequence: u64,
        old_members: BTreeSet<PeerId>,
        new_members: BTreeSet<PeerId>,
    },
}

impl Default for ClusterConfiguration {
    fn default() -> Self {
        ClusterConfiguration::Stable {
            sequence: 0,
            members: BTreeSet::new(),
        }
    }
}

impl ClusterConfiguration {
    pub fn stable(sequence: u64, members: impl IntoIterator<Item = PeerId>) -> Self {
        ClusterConfiguration::Stable {
            sequence,
            members: members.into_iter().collect(),
        }
    }

    pub fn sequence(&self) -> u64 {
        match self {
            ClusterConfiguration::Stable { sequence, .. } => *sequence,
            ClusterConfiguration::Joint { sequence, .. } => *sequence,
        }
    }

    /// Every peer that votes under this configuration. For a joint
    /// configuration this is the union, used for elections and heartbeats;
    /// commit quorums are computed per side instead.
    pub fn members(&self) -> BTreeSet<PeerId> {
        match self {
            ClusterConfiguration::Stable { members, .. } => members.clone(),
            ClusterConfiguration::Joint {
                old_members,
                new_members,
                ..
            } => old_members.union(new_members).copied().collect(),
        }
    }

    /// Members that remain once any pending transition completes.
    pub fn new_members(&self) -> &BTreeSet<PeerId> {
        match self {
            ClusterConfiguration::Stable { members, .. } => members,
            ClusterConfiguration::Joint { new_members, .. } => new_members,
        }
    }

    pub fn is_transitioning(&self) -> bool {
        matches!(self, ClusterConfiguration::Joint { .. })
    }

    pub fn is_newer(&self, other: &ClusterConfiguration) -> bool {
        self.sequence() > other.sequence()
    }

    pub fn contains_on_new_state(&self, peer: PeerId) -> bool {
        self.new_members().contains(&peer)
    }

    /// Start moving from the current effective members to `target`'s.
    pub fn transition_to(&self, target: &ClusterConfiguration) -> ClusterConfiguration {
        ClusterConfiguration::Joint {
            sequence: self.sequence().max(target.sequence()) + 1,
            old_members: self.members(),
            new_members: target.new_members().clone(),
        }
    }

    pub fn transition_to_stable(&self) -> ClusterConfiguration {
        match self {
            ClusterConfiguration::Stable { .. } => self.clone(),
            ClusterConfiguration::Joint {
                sequence,
                new_members,
                ..
            } => ClusterConfiguration::Stable {
                sequence: sequence + 1,
                members: new_members.clone(),
            },
        }
    }
}

impl std::fmt::Display for ClusterConfiguration {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let ids = |set: &BTreeSet<PeerId>| {
            set.iter()
                .map(|p| p.0.to_string())
                .collect::<Vec<_>>()
                .join(",")
        };
        match self {
            ClusterConfiguration::Stable { sequence, members } => {
                write!(f, "stable#{}[{}]", sequence, ids(members))
            }
            ClusterConfiguration::Joint {
                sequence,
                old_members,
                new_members,
            } => write!(
                f,
                "joint#{}[{}]->[{}]",
                sequence,
                ids(old_members),
                ids(new_members)
            ),
        }
    }
}
