//! Validation errors for table configurations.

use thiserror::Error;

/// Reasons a proposed `TableConfigAndShards` is rejected.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum ConfigError {
    #[error("table name must not be empty")]
    EmptyName,

    #[error("primary key must not be empty")]
    EmptyPrimaryKey,

    #[error("table must have at least one shard")]
    NoShards,

    #[error("shard scheme describes {scheme} shards but config has {config}")]
    ShardCountMismatch { scheme: usize, config: usize },

    #[error("split points must be strictly increasing")]
    UnsortedSplitPoints,

    #[error("shard {shard}: primary replica is not one of its replicas")]
    PrimaryNotReplica { shard: usize },

    #[error("shard {shard}: non-voting replica is not one of its replicas")]
    NonvotingNotReplica { shard: usize },

    #[error("shard {shard}: no voting replicas")]
    NoVoters { shard: usize },
}
