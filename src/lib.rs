pub mod config;
pub mod error;
pub mod raft;
pub mod shutdown;

pub use error::{RaftError, Result};
