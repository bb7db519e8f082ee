use std::sync::Arc;

use serde::{Deserialize, Serialize};

use crate::raft::cluster::ClusterConfiguration;
use crate::raft::types::{LogIndex, PeerId, Term};

/// Commands that can be replicated through Raft
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum Command {
    /// No-op command (appended by a new leader so earlier entries can commit)
    Noop,
    /// Cluster membership change, stable or joint
    Configuration(ClusterConfiguration),
    /// Opaque payload for the application state machine
    Application(Vec<u8>),
}

impl Command {
    pub fn as_configuration(&self) -> Option<&ClusterConfiguration> {
        match self {
            Command::Configuration(config) => Some(config),
            _ => None,
        }
    }
}

/// A single entry in the Raft log
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LogEntry {
    pub term: Term,
    pub index: LogIndex,
    pub command: Command,
    /// Client to answer once the entry is applied on the leader
    pub client: Option<PeerId>,
}

impl LogEntry {
    pub fn new(term: Term, index: LogIndex, command: Command) -> Self {
        Self {
            term,
            index,
            command,
            client: None,
        }
    }

    pub fn with_client(mut self, client: PeerId) -> Self {
        self.client = Some(client);
        self
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SnapshotMetadata {
    pub last_included_index: LogIndex,
    pub last_included_term: Term,
    pub config: ClusterConfiguration,
}

/// Checkpoint replacing every log entry up to `meta.last_included_index`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Snapshot {
    pub meta: SnapshotMetadata,
    pub data: Vec<u8>,
}

/// Ordered log of entries plus the commit watermark and an optional
/// compaction snapshot.
///
/// Mutating operations consume the log and return the new value. Entries
/// live behind an `Arc`, so cloning a log is cheap and an update only copies
/// the entry vector when it is shared.
///
/// Invariants:
/// - live entries are contiguous, starting at `prev_index() + 1`
/// - `committed_index() <= last_index()`
/// - entries at or below the snapshot boundary exist only as the snapshot
#[derive(Debug, Clone, Default)]
pub struct ReplicatedLog {
    entries: Arc<Vec<LogEntry>>,
    committed_index: LogIndex,
    snapshot: Option<Arc<Snapshot>>,
}

impl ReplicatedLog {
    pub fn new() -> Self {
        Self::default()
    }

    /// Rebuild a log from a persisted snapshot. Everything up to the
    /// snapshot boundary counts as committed.
    pub fn restored(snapshot: Snapshot) -> Self {
        Self {
            entries: Arc::new(Vec::new()),
            committed_index: snapshot.meta.last_included_index,
            snapshot: Some(Arc::new(snapshot)),
        }
    }

    pub fn entries(&self) -> &[LogEntry] {
        &self.entries
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn committed_index(&self) -> LogIndex {
        self.committed_index
    }

    pub fn snapshot(&self) -> Option<&Snapshot> {
        self.snapshot.as_deref()
    }

    pub fn has_snapshot(&self) -> bool {
        self.snapshot.is_some()
    }

    /// Last index before the first live entry: 0, or the snapshot boundary.
    pub fn prev_index(&self) -> LogIndex {
        self.snapshot
            .as_ref()
            .map(|s| s.meta.last_included_index)
            .unwrap_or(0)
    }

    pub fn last_index(&self) -> LogIndex {
        self.entries
            .last()
            .map(|e| e.index)
            .unwrap_or_else(|| self.prev_index())
    }

    pub fn last_term(&self) -> Term {
        match self.entries.last() {
            Some(entry) => entry.term,
            None => self
                .snapshot
                .as_ref()
                .map(|s| s.meta.last_included_term)
                .unwrap_or(Term::ZERO),
        }
    }

    pub fn next_index(&self) -> LogIndex {
        self.last_index() + 1
    }

    fn position(&self, index: LogIndex) -> Option<usize> {
        let prev = self.prev_index();
        if index <= prev {
            return None;
        }
        let pos = (index - prev - 1) as usize;
        (pos < self.entries.len()).then_some(pos)
    }

    pub fn get(&self, index: LogIndex) -> Option<&LogEntry> {
        self.position(index).map(|pos| &self.entries[pos])
    }

    /// Newest configuration recorded at or below `index`, from the live
    /// entries first and then the snapshot.
    pub fn configuration_at(&self, index: LogIndex) -> Option<&ClusterConfiguration> {
        self.entries
            .iter()
            .rev()
            .filter(|e| e.index <= index)
            .find_map(|e| e.command.as_configuration())
            .or_else(|| self.snapshot.as_ref().map(|s| &s.meta.config))
    }

    pub fn latest_configuration(&self) -> Option<&ClusterConfiguration> {
        self.configuration_at(self.last_index())
    }

    /// Term of the entry at `index`. Index 0 has term 0 and the snapshot
    /// boundary reports the snapshot's term; compacted or missing indices
    /// have none.
    pub fn term_at(&self, index: LogIndex) -> Option<Term> {
        if index == 0 {
            return Some(Term::ZERO);
        }
        if let Some(snapshot) = &self.snapshot {
            if index == snapshot.meta.last_included_index {
                return Some(snapshot.meta.last_included_term);
            }
        }
        self.get(index).map(|e| e.term)
    }

    /// Log-matching check for `AppendEntries`.
    pub fn contains_matching_entry(&self, term: Term, index: LogIndex) -> bool {
        if index == 0 {
            return term == Term::ZERO;
        }
        // Anything strictly inside the snapshot is committed, hence identical
        // on every log that has it.
        if self.has_snapshot() && index < self.prev_index() {
            return true;
        }
        self.term_at(index) == Some(term)
    }

    pub fn append(self, entry: LogEntry) -> Self {
        debug_assert_eq!(entry.index, self.next_index(), "appended out of order");
        let mut log = self;
        Arc::make_mut(&mut log.entries).push(entry);
        log
    }

    /// Merge `entries` (which follow `after`) into the log.
    ///
    /// Entries already present with the same term are left alone, so a
    /// re-delivered batch is a no-op. The first entry whose term differs
    /// truncates the conflicting suffix before the rest is appended.
    pub fn append_after(self, entries: Vec<LogEntry>, after: LogIndex) -> Self {
        if entries.is_empty() {
            return self;
        }
        let prev = self.prev_index();
        let needs_change = entries
            .iter()
            .any(|e| e.index > prev && self.term_at(e.index) != Some(e.term));
        if !needs_change {
            return self;
        }

        let mut log = self;
        let committed = log.committed_index;
        let live = Arc::make_mut(&mut log.entries);
        for entry in entries {
            if entry.index <= prev || entry.index <= after {
                continue;
            }
            let pos = (entry.index - prev - 1) as usize;
            match live.get(pos) {
                Some(existing) if existing.term == entry.term => {}
                Some(_) => {
                    debug_assert!(entry.index > committed, "truncating committed entry");
                    live.truncate(pos);
                    live.push(entry);
                }
                None if pos == live.len() => live.push(entry),
                None => break,
            }
        }
        log
    }

    /// Advance the commit watermark. Never regresses and never passes the
    /// last entry.
    pub fn commit(self, index: LogIndex) -> Self {
        let mut log = self;
        let target = index.min(log.last_index());
        if target > log.committed_index {
            log.committed_index = target;
        }
        log
    }

    /// Contiguous entries starting at `from`, at most `max` of them.
    pub fn entries_batch_from(&self, from: LogIndex, max: usize) -> Vec<LogEntry> {
        let start = from.max(self.prev_index() + 1);
        match self.position(start) {
            Some(pos) => self.entries[pos..].iter().take(max).cloned().collect(),
            None => Vec::new(),
        }
    }

    /// Entries with `from_exclusive < index <= to_inclusive`.
    pub fn slice(&self, from_exclusive: LogIndex, to_inclusive: LogIndex) -> Vec<LogEntry> {
        self.entries
            .iter()
            .filter(|e| e.index > from_exclusive && e.index <= to_inclusive)
            .cloned()
            .collect()
    }

    /// Replace everything up to the snapshot boundary with the snapshot.
    ///
    /// Entries after the boundary survive only when the log agrees with the
    /// snapshot at the boundary; otherwise the whole live log is discarded.
    /// Snapshots older than the current one are ignored.
    pub fn compact_with(self, snapshot: Snapshot) -> Self {
        let boundary = snapshot.meta.last_included_index;
        if self.has_snapshot() && boundary <= self.prev_index() {
            return self;
        }

        let keeps_tail = self.term_at(boundary) == Some(snapshot.meta.last_included_term);
        let remaining: Vec<LogEntry> = if keeps_tail {
            self.entries
                .iter()
                .filter(|e| e.index > boundary)
                .cloned()
                .collect()
        } else {
            Vec::new()
        };

        Self {
            entries: Arc::new(remaining),
            committed_index: self.committed_index.max(boundary),
            snapshot: Some(Arc::new(snapshot)),
        }
    }
}

impl std::fmt::Display for ReplicatedLog {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "log(prev={}, last={}, committed={}, live={})",
            self.prev_index(),
            self.last_index(),
            self.committed_index,
            self.entries.len()
        )
    }
}
