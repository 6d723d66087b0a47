//! Errors raised while bringing up a consensus member.

use thiserror::Error;

pub type ConsensusResult<T> = Result<T, ConsensusError>;

#[derive(Debug, Error)]
pub enum ConsensusError {
    #[error("invalid raft config: {0}")]
    Config(String),

    #[error("raft failed to start: {0}")]
    Fatal(String),
}
