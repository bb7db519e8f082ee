use thiserror::Error;

use crate::raft::PeerId;

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum RaftError {
    #[error("Not the leader, current leader is {0:?}")]
    NotLeader(Option<PeerId>),

    #[error("Illegal transition: {0}")]
    IllegalTransition(String),

    #[error("Snapshot error: {0}")]
    Snapshot(String),

    #[error("Timed out: {0}")]
    Timeout(String),

    #[error("Channel closed: {0}")]
    ChannelClosed(String),

    #[error("Invalid configuration: {0}")]
    Config(String),
}

pub type Result<T> = std::result::Result<T, RaftError>;
