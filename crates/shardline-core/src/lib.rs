//! shardline-core — shared vocabulary for the per-table coordination core.
//!
//! Identifiers, the replicated table model (config, shard scheme,
//! contracts, committed state) and the TOML-backed manager configuration.

pub mod config;
pub mod error;
pub mod ids;
pub mod types;

pub use config::{LeaderSettings, ManagerConfig, RaftSettings};
pub use error::ConfigError;
pub use ids::*;
pub use types::*;
