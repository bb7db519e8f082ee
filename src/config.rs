use std::collections::BTreeSet;
use std::time::Duration;

use crate::error::{RaftError, Result};
use crate::raft::{CoreSettings, PeerId};

#[derive(Debug, Clone)]
pub struct NodeConfig {
    pub node_id: u64,
    /// Seed peers probed during discovery.
    pub peers: Vec<u64>,
    pub election_timeout_min_ms: u64,
    pub election_timeout_max_ms: u64,
    pub heartbeat_interval_ms: u64,
    pub discovery_interval_ms: u64,
    /// Members that must be known before leaving Init, self included.
    pub keep_init_until_found: usize,
    pub max_entries_batch: usize,
    /// Committed entries kept live before compaction kicks in (0 disables).
    pub compaction_threshold: u64,
    pub inbox_capacity: usize,
}

impl Default for NodeConfig {
    fn default() -> Self {
        Self {
            node_id: 1,
            peers: Vec::new(),
            election_timeout_min_ms: 2000,
            election_timeout_max_ms: 3000,
            heartbeat_interval_ms: 1000,
            discovery_interval_ms: 10_000,
            keep_init_until_found: 3,
            max_entries_batch: 1000,
            compaction_threshold: 1000,
            inbox_capacity: 1024,
        }
    }
}

impl NodeConfig {
    pub fn new(node_id: u64) -> Self {
        Self {
            node_id,
            ..Default::default()
        }
    }

    pub fn with_peer(mut self, node_id: u64) -> Self {
        self.peers.push(node_id);
        self
    }

    pub fn with_election_timeout(mut self, min_ms: u64, max_ms: u64) -> Self {
        self.election_timeout_min_ms = min_ms;
        self.election_timeout_max_ms = max_ms;
        self
    }

    pub fn with_heartbeat_interval(mut self, interval_ms: u64) -> Self {
        self.heartbeat_interval_ms = interval_ms;
        self
    }

    pub fn with_discovery_interval(mut self, interval_ms: u64) -> Self {
        self.discovery_interval_ms = interval_ms;
        self
    }

    pub fn with_compaction_threshold(mut self, threshold: u64) -> Self {
        self.compaction_threshold = threshold;
        self
    }

    pub fn with_keep_init_until_found(mut self, members: usize) -> Self {
        self.keep_init_until_found = members;
        self
    }

    pub fn id(&self) -> PeerId {
        PeerId(self.node_id)
    }

    pub fn heartbeat_interval(&self) -> Duration {
        Duration::from_millis(self.heartbeat_interval_ms)
    }

    pub fn discovery_interval(&self) -> Duration {
        Duration::from_millis(self.discovery_interval_ms)
    }

    /// Reject settings the node cannot run with.
    pub fn validate(&self) -> Result<()> {
        if self.election_timeout_min_ms == 0
            || self.election_timeout_min_ms > self.election_timeout_max_ms
        {
            return Err(RaftError::Config(format!(
                "invalid election timeout range {}..={} ms",
                self.election_timeout_min_ms, self.election_timeout_max_ms
            )));
        }
        if self.heartbeat_interval_ms == 0
            || self.heartbeat_interval_ms >= self.election_timeout_min_ms
        {
            return Err(RaftError::Config(format!(
                "heartbeat interval {} ms must be non-zero and below the election timeout",
                self.heartbeat_interval_ms
            )));
        }
        if self.discovery_interval_ms == 0 {
            return Err(RaftError::Config("discovery interval must be non-zero".into()));
        }
        if self.max_entries_batch == 0 {
            return Err(RaftError::Config("max_entries_batch must be non-zero".into()));
        }
        if self.inbox_capacity == 0 {
            return Err(RaftError::Config("inbox_capacity must be non-zero".into()));
        }
        Ok(())
    }

    /// The subset of settings the consensus core reads.
    pub fn core_settings(&self) -> CoreSettings {
        CoreSettings {
            seeds: self.peers.iter().copied().map(PeerId).collect::<BTreeSet<_>>(),
            keep_init_until_found: self.keep_init_until_found,
            max_entries_batch: self.max_entries_batch,
            compaction_threshold: self.compaction_threshold,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn node_config_default() {
        let cfg = NodeConfig::default();
        assert_eq!(cfg.node_id, 1);
        assert!(cfg.peers.is_empty());
        assert_eq!(cfg.election_timeout_min_ms, 2000);
        assert_eq!(cfg.election_timeout_max_ms, 3000);
        assert_eq!(cfg.heartbeat_interval_ms, 1000);
        assert_eq!(cfg.keep_init_until_found, 3);
        assert!(cfg.validate().is_ok());
    }

    #[test]
    fn node_config_with_peer() {
        let cfg = NodeConfig::new(1).with_peer(2).with_peer(3);
        assert_eq!(cfg.peers, vec![2, 3]);

        let settings = cfg.core_settings();
        assert_eq!(
            settings.seeds.into_iter().collect::<Vec<_>>(),
            vec![PeerId(2), PeerId(3)]
        );
    }

    #[test]
    fn node_config_builders() {
        let cfg = NodeConfig::new(4)
            .with_election_timeout(50, 100)
            .with_heartbeat_interval(20)
            .with_compaction_threshold(0);
        assert_eq!(cfg.id(), PeerId(4));
        assert_eq!(cfg.heartbeat_interval(), Duration::from_millis(20));
        assert_eq!(cfg.core_settings().compaction_threshold, 0);
        assert!(cfg.validate().is_ok());
    }

    #[test]
    fn validate_rejects_bad_timers() {
        let cfg = NodeConfig::default().with_election_timeout(300, 150);
        assert!(matches!(cfg.validate(), Err(RaftError::Config(_))));

        let cfg = NodeConfig::default().with_heartbeat_interval(5000);
        assert!(matches!(cfg.validate(), Err(RaftError::Config(_))));

        let cfg = NodeConfig {
            max_entries_batch: 0,
            ..Default::default()
        };
        assert!(cfg.validate().is_err());
    }
}
