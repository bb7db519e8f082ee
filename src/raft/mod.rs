//! Raft consensus for a replicated command log.
//!
//! The core is the pure [`step`] function over [`NodeState`]; [`RaftNode`]
//! drives it on tokio, and [`LocalNetwork`] wires nodes and [`RaftClient`]s
//! together in-process.

mod candidate;
pub mod client;
pub mod cluster;
mod follower;
pub mod fsm;
pub mod index_map;
mod init;
mod leader;
pub mod log;
pub mod machine;
pub mod message;
pub mod metadata;
pub mod node;
pub mod state;
pub mod timer;
pub mod transport;
pub mod types;

pub use client::RaftClient;
pub use cluster::ClusterConfiguration;
pub use fsm::{MemorySnapshotStore, MemoryStateMachine, SnapshotStore, StateMachine};
pub use index_map::LogIndexMap;
pub use log::{Command, LogEntry, ReplicatedLog, Snapshot, SnapshotMetadata};
pub use machine::{step, Transition};
pub use message::{ClientRequest, Effect, Input, RaftMessage, Timer};
pub use metadata::{DomainEvent, RaftMetadata};
pub use node::RaftNode;
pub use state::{CoreSettings, NodeState, Role};
pub use transport::{LocalNetwork, Transport};
pub use types::{LogIndex, PeerId, Term};
