//! Collaborators the node drives: the application state machine and the
//! snapshot store.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tokio::sync::Mutex;

use crate::error::{RaftError, Result};
use crate::raft::log::{Snapshot, SnapshotMetadata};

/// Deterministic application fed with committed commands in log order.
pub trait StateMachine: Send {
    /// Apply one committed command and return the reply for the client.
    fn apply(&mut self, command: &[u8]) -> Vec<u8>;

    /// Serialize the current state.
    fn snapshot(&self) -> Result<Vec<u8>>;

    /// Replace the current state with a serialized one.
    fn restore(&mut self, data: &[u8]) -> Result<()>;
}

/// Persists snapshots prepared from the state machine.
#[async_trait]
pub trait SnapshotStore: Send + Sync {
    /// Turn captured state into a snapshot. `Ok(None)` means nothing worth
    /// snapshotting was produced.
    async fn prepare_snapshot(
        &self,
        meta: SnapshotMetadata,
        data: Vec<u8>,
    ) -> Result<Option<Snapshot>>;
}

/// In-memory state machine that records every applied command.
#[derive(Debug, Default, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MemoryStateMachine {
    applied: Vec<Vec<u8>>,
}

impl MemoryStateMachine {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn applied(&self) -> &[Vec<u8>] {
        &self.applied
    }

    pub fn len(&self) -> usize {
        self.applied.len()
    }

    pub fn is_empty(&self) -> bool {
        self.applied.is_empty()
    }
}

impl StateMachine for MemoryStateMachine {
    /// Replies with the number of commands applied so far.
    fn apply(&mut self, command: &[u8]) -> Vec<u8> {
        self.applied.push(command.to_vec());
        self.applied.len().to_string().into_bytes()
    }

    fn snapshot(&self) -> Result<Vec<u8>> {
        serde_json::to_vec(self).map_err(|e| RaftError::Snapshot(e.to_string()))
    }

    fn restore(&mut self, data: &[u8]) -> Result<()> {
        *self = serde_json::from_slice(data).map_err(|e| RaftError::Snapshot(e.to_string()))?;
        Ok(())
    }
}

/// Keeps the most recent snapshot in memory.
#[derive(Debug, Default)]
pub struct MemorySnapshotStore {
    latest: Mutex<Option<Snapshot>>,
}

impl MemorySnapshotStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn latest(&self) -> Option<Snapshot> {
        self.latest.lock().await.clone()
    }
}

#[async_trait]
impl SnapshotStore for MemorySnapshotStore {
    async fn prepare_snapshot(
        &self,
        meta: SnapshotMetadata,
        data: Vec<u8>,
    ) -> Result<Option<Snapshot>> {
        let mut latest = self.latest.lock().await;
        if let Some(existing) = latest.as_ref() {
            if existing.meta.last_included_index >= meta.last_included_index {
                return Ok(None);
            }
        }
        let snapshot = Snapshot { meta, data };
        *latest = Some(snapshot.clone());
        Ok(Some(snapshot))
    }
}
