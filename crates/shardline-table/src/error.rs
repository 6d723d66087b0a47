//! Error types for the table manager.

use shardline_raft::ConsensusError;
use shardline_state::StateError;
use thiserror::Error;

/// Result type alias for table manager operations.
pub type TableResult<T> = Result<T, TableError>;

#[derive(Debug, Error)]
pub enum TableError {
    /// The caller handed over an identity the manager cannot run with.
    #[error("invalid table manager identity: {0}")]
    InvalidIdentity(&'static str),

    #[error("operation cancelled")]
    Cancelled,

    #[error("persistence failed: {0}")]
    Persistence(#[from] StateError),

    #[error("consensus member failed: {0}")]
    Consensus(#[from] ConsensusError),
}
