use std::collections::{BTreeSet, HashMap};

use crate::raft::cluster::ClusterConfiguration;
use crate::raft::types::{LogIndex, PeerId};

/// Per-peer replication progress with a default for peers not yet seen.
///
/// A leader keeps two of these per term: `next_index` (next entry to send to
/// each follower) and `match_index` (highest entry known to be replicated).
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct LogIndexMap {
    backing: HashMap<PeerId, LogIndex>,
    default_index: LogIndex,
}

impl LogIndexMap {
    pub fn new(default_index: LogIndex) -> Self {
        Self {
            backing: HashMap::new(),
            default_index,
        }
    }

    pub fn index_for(&self, peer: PeerId) -> LogIndex {
        self.backing
            .get(&peer)
            .copied()
            .unwrap_or(self.default_index)
    }

    /// Step a follower's index back by one, never below 1.
    pub fn decrement_for(&mut self, peer: PeerId) -> LogIndex {
        let value = self.index_for(peer).saturating_sub(1).max(1);
        self.backing.insert(peer, value);
        value
    }

    pub fn put(&mut self, peer: PeerId, value: LogIndex) {
        self.backing.insert(peer, value);
    }

    /// Store `value` only if it moves the peer forward; returns the value in effect.
    pub fn put_if_greater(&mut self, peer: PeerId, value: LogIndex) -> LogIndex {
        match self.backing.get(&peer) {
            Some(&prev) if prev >= value => prev,
            _ => {
                self.backing.insert(peer, value);
                value
            }
        }
    }

    /// Highest index replicated on a majority of `config`.
    ///
    /// A joint configuration needs a majority on both sides, so the result is
    /// the smaller of the two per-side values.
    pub fn consensus_for_index(&self, config: &ClusterConfiguration) -> LogIndex {
        match config {
            ClusterConfiguration::Stable { members, .. } => self.index_on_majority(members),
            ClusterConfiguration::Joint {
                old_members,
                new_members,
                ..
            } => self
                .index_on_majority(old_members)
                .min(self.index_on_majority(new_members)),
        }
    }

    fn index_on_majority(&self, members: &BTreeSet<PeerId>) -> LogIndex {
        if members.is_empty() {
            return 0;
        }
        let mut indices: Vec<LogIndex> = members.iter().map(|&m| self.index_for(m)).collect();
        indices.sort_unstable();
        indices[members.len().div_ceil(2) - 1]
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn peers(ids: &[u64]) -> Vec<PeerId> {
        ids.iter().copied().map(PeerId).collect()
    }

    fn map_with(values: &[(u64, LogIndex)]) -> LogIndexMap {
        let mut map = LogIndexMap::new(0);
        for &(peer, index) in values {
            map.put(PeerId(peer), index);
        }
        map
    }

    #[test]
    fn test_default_for_unknown_peer() {
        let map = LogIndexMap::new(7);
        assert_eq!(map.index_for(PeerId(1)), 7);
    }

    #[test]
    fn test_decrement_floors_at_one() {
        let mut map = LogIndexMap::new(3);
        assert_eq!(map.decrement_for(PeerId(1)), 2);
        assert_eq!(map.decrement_for(PeerId(1)), 1);
        assert_eq!(map.decrement_for(PeerId(1)), 1);

        let mut empty = LogIndexMap::new(0);
        assert_eq!(empty.decrement_for(PeerId(2)), 1);
    }

    #[test]
    fn test_put_if_greater_is_monotonic() {
        let mut map = LogIndexMap::new(0);
        assert_eq!(map.put_if_greater(PeerId(1), 5), 5);
        assert_eq!(map.put_if_greater(PeerId(1), 3), 5);
        assert_eq!(map.index_for(PeerId(1)), 5);
        assert_eq!(map.put_if_greater(PeerId(1), 8), 8);
    }

    #[test]
    fn test_stable_majority_odd() {
        let map = map_with(&[(1, 5), (2, 5), (3, 3)]);
        let config = ClusterConfiguration::stable(0, peers(&[1, 2, 3]));
        // Two of three members hold index 5.
        assert_eq!(map.consensus_for_index(&config), 5);

        let lagging = map_with(&[(1, 5), (2, 3), (3, 3)]);
        assert_eq!(lagging.consensus_for_index(&config), 3);
    }

    #[test]
    fn test_stable_majority_even_takes_lower_middle() {
        let map = map_with(&[(1, 1), (2, 2), (3, 3), (4, 4)]);
        let config = ClusterConfiguration::stable(0, peers(&[1, 2, 3, 4]));
        assert_eq!(map.consensus_for_index(&config), 2);
    }

    #[test]
    fn test_empty_members_commit_nothing() {
        let map = map_with(&[(1, 9)]);
        assert_eq!(
            map.consensus_for_index(&ClusterConfiguration::default()),
            0
        );
    }

    #[test]
    fn test_joint_requires_both_majorities() {
        let old = ClusterConfiguration::stable(0, peers(&[1, 2, 3]));
        let joint = old.transition_to(&ClusterConfiguration::stable(0, peers(&[4, 5, 6])));

        // Only the old side has replicated index 5.
        let map = map_with(&[(1, 5), (2, 5), (3, 5), (4, 5), (5, 0), (6, 0)]);
        assert_eq!(map.consensus_for_index(&joint), 0);

        let map = map_with(&[(1, 5), (2, 5), (3, 0), (4, 5), (5, 4), (6, 0)]);
        assert_eq!(map.consensus_for_index(&joint), 4);
    }

    #[test]
    fn test_consensus_monotonic_under_progress() {
        let config = ClusterConfiguration::stable(0, peers(&[1, 2, 3, 4, 5]));
        let mut map = LogIndexMap::new(0);
        let mut last = 0;
        let updates = [(1, 2), (3, 1), (2, 4), (5, 3), (4, 4), (1, 1), (3, 6), (5, 7)];
        for (peer, index) in updates {
            map.put_if_greater(PeerId(peer), index);
            let consensus = map.consensus_for_index(&config);
            assert!(consensus >= last, "consensus regressed");
            last = consensus;
        }
        assert_eq!(last, 4);
    }
}
