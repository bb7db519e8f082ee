use serde::{Deserialize, Serialize};

use crate::raft::cluster::ClusterConfiguration;
use crate::raft::log::{Command, LogEntry, Snapshot, SnapshotMetadata};
use crate::raft::state::Role;
use crate::raft::types::{LogIndex, PeerId, Term};

/// A command submitted by a client, kept intact so it can be re-sent to the
/// leader after a redirect.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ClientRequest {
    pub client: PeerId,
    pub command: Command,
}

/// Everything peers and clients exchange with a node.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum RaftMessage {
    // Leader election
    RequestVote {
        term: Term,
        candidate: PeerId,
        last_log_term: Term,
        last_log_index: LogIndex,
    },
    VoteCandidate {
        term: Term,
    },
    DeclineCandidate {
        term: Term,
    },

    // Log replication & heartbeats
    AppendEntries {
        member: PeerId,
        term: Term,
        prev_log_term: Term,
        prev_log_index: LogIndex,
        entries: Vec<LogEntry>,
        leader_commit: LogIndex,
    },
    AppendSuccessful {
        term: Term,
        last_index: LogIndex,
    },
    AppendRejected {
        term: Term,
    },

    // Snapshot transfer
    InstallSnapshot {
        leader: PeerId,
        term: Term,
        snapshot: Snapshot,
    },
    InstallSnapshotSuccessful {
        term: Term,
        last_index: LogIndex,
    },
    InstallSnapshotRejected {
        term: Term,
    },

    // Cluster management
    ChangeConfiguration {
        new_config: ClusterConfiguration,
    },
    RequestConfiguration,
    RaftMembersDiscoveryRequest,
    RaftMembersDiscoveryResponse {
        member: PeerId,
    },
    RaftMemberAdded {
        member: PeerId,
        keep_init_until: usize,
    },

    // Clients
    ClientMessage(ClientRequest),
    ClientResponse {
        index: LogIndex,
        result: Vec<u8>,
    },
    WhoIsTheLeader,
    LeaderIs {
        leader: Option<PeerId>,
        pending: Option<ClientRequest>,
    },

    // Diagnostics
    AskForState,
    IAmInState {
        state: Role,
    },
}

impl RaftMessage {
    /// Term carried by the message, if it has one.
    pub fn term(&self) -> Option<Term> {
        match self {
            RaftMessage::RequestVote { term, .. }
            | RaftMessage::VoteCandidate { term }
            | RaftMessage::DeclineCandidate { term }
            | RaftMessage::AppendEntries { term, .. }
            | RaftMessage::AppendSuccessful { term, .. }
            | RaftMessage::AppendRejected { term }
            | RaftMessage::InstallSnapshot { term, .. }
            | RaftMessage::InstallSnapshotSuccessful { term, .. }
            | RaftMessage::InstallSnapshotRejected { term } => Some(*term),
            _ => None,
        }
    }

    pub fn name(&self) -> &'static str {
        match self {
            RaftMessage::RequestVote { .. } => "RequestVote",
            RaftMessage::VoteCandidate { .. } => "VoteCandidate",
            RaftMessage::DeclineCandidate { .. } => "DeclineCandidate",
            RaftMessage::AppendEntries { .. } => "AppendEntries",
            RaftMessage::AppendSuccessful { .. } => "AppendSuccessful",
            RaftMessage::AppendRejected { .. } => "AppendRejected",
            RaftMessage::InstallSnapshot { .. } => "InstallSnapshot",
            RaftMessage::InstallSnapshotSuccessful { .. } => "InstallSnapshotSuccessful",
            RaftMessage::InstallSnapshotRejected { .. } => "InstallSnapshotRejected",
            RaftMessage::ChangeConfiguration { .. } => "ChangeConfiguration",
            RaftMessage::RequestConfiguration => "RequestConfiguration",
            RaftMessage::RaftMembersDiscoveryRequest => "RaftMembersDiscoveryRequest",
            RaftMessage::RaftMembersDiscoveryResponse { .. } => "RaftMembersDiscoveryResponse",
            RaftMessage::RaftMemberAdded { .. } => "RaftMemberAdded",
            RaftMessage::ClientMessage(_) => "ClientMessage",
            RaftMessage::ClientResponse { .. } => "ClientResponse",
            RaftMessage::WhoIsTheLeader => "WhoIsTheLeader",
            RaftMessage::LeaderIs { .. } => "LeaderIs",
            RaftMessage::AskForState => "AskForState",
            RaftMessage::IAmInState { .. } => "IAmInState",
        }
    }
}

/// Named timers. Arming a timer replaces any pending instance of it.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Timer {
    Election,
    Heartbeat,
    Discovery,
}

/// One event for the consensus core to process.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Input {
    Message { from: PeerId, message: RaftMessage },
    Timeout(Timer),
    /// Snapshot the state machine at the committed index and compact.
    CompactLog,
    /// Result of an earlier [`Effect::PrepareSnapshot`].
    SnapshotPrepared(std::result::Result<Option<Snapshot>, String>),
}

impl Input {
    pub fn message(from: PeerId, message: RaftMessage) -> Self {
        Input::Message { from, message }
    }
}

/// Side effects requested by a transition, executed in order by the driver.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Effect {
    Send {
        to: PeerId,
        message: RaftMessage,
    },
    /// Deliver `message` to `to` as if `from` had sent it.
    Forward {
        from: PeerId,
        to: PeerId,
        message: RaftMessage,
    },
    ArmTimer(Timer),
    CancelTimer(Timer),
    /// Apply a committed application entry. When `respond` is set the result
    /// goes back to `entry.client`.
    Apply {
        entry: LogEntry,
        respond: bool,
    },
    /// Replace application state with the snapshot's.
    Restore(Snapshot),
    PrepareSnapshot(SnapshotMetadata),
}
