//! shardline.toml manager configuration.
//!
//! Every field has a default, so an empty file (or no file at all) gives a
//! working configuration tuned for a LAN cluster.

use std::path::Path;
use std::time::Duration;

use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ManagerConfig {
    pub raft: RaftSettings,
    pub leader: LeaderSettings,
}

/// Timing knobs for the consensus member.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct RaftSettings {
    pub heartbeat_interval_ms: u64,
    pub election_timeout_min_ms: u64,
    pub election_timeout_max_ms: u64,
    /// Upper bound on a single consensus RPC round trip.
    pub rpc_timeout_ms: u64,
}

impl Default for RaftSettings {
    fn default() -> Self {
        Self {
            heartbeat_interval_ms: 100,
            election_timeout_min_ms: 300,
            election_timeout_max_ms: 600,
            rpc_timeout_ms: 1000,
        }
    }
}

impl RaftSettings {
    pub fn rpc_timeout(&self) -> Duration {
        Duration::from_millis(self.rpc_timeout_ms)
    }
}

/// Settings for the transient leader role.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct LeaderSettings {
    /// A `set_config` request that has not committed within this bound is
    /// answered with an empty reply.
    pub set_config_timeout_ms: u64,
}

impl Default for LeaderSettings {
    fn default() -> Self {
        Self {
            set_config_timeout_ms: 10_000,
        }
    }
}

impl LeaderSettings {
    pub fn set_config_timeout(&self) -> Duration {
        Duration::from_millis(self.set_config_timeout_ms)
    }
}

impl ManagerConfig {
    pub fn from_file(path: &Path) -> anyhow::Result<Self> {
        let content = std::fs::read_to_string(path)?;
        Self::from_toml_str(&content)
    }

    pub fn from_toml_str(content: &str) -> anyhow::Result<Self> {
        let config: ManagerConfig = toml::from_str(content)?;
        if config.raft.election_timeout_min_ms >= config.raft.election_timeout_max_ms {
            anyhow::bail!(
                "raft.election_timeout_min_ms ({}) must be below election_timeout_max_ms ({})",
                config.raft.election_timeout_min_ms,
                config.raft.election_timeout_max_ms
            );
        }
        Ok(config)
    }

    pub fn to_toml_string(&self) -> anyhow::Result<String> {
        Ok(toml::to_string_pretty(self)?)
    }
}
