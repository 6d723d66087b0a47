//! The replicated table model.
//!
//! `TableRaftState` is what the consensus log agrees on: the user-visible
//! table configuration plus the contracts that tell each server what role
//! it plays for each shard. All types are JSON-serializable so they can be
//! carried in log entries and persisted records.

use std::collections::{BTreeMap, BTreeSet};

use serde::{Deserialize, Serialize};

use crate::error::ConfigError;
use crate::ids::{ContractId, DatabaseId, LogIndex, ServerId};

// ── Configuration ──────────────────────────────────────────────────

/// Name, database and primary key of a table.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TableBasicConfig {
    pub name: String,
    pub database: DatabaseId,
    pub primary_key: String,
}

/// Replica assignment of one shard.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ShardConfig {
    pub replicas: BTreeSet<ServerId>,
    /// Replicas that hold data but do not count towards write acks.
    #[serde(default)]
    pub nonvoting_replicas: BTreeSet<ServerId>,
    pub primary_replica: ServerId,
}

impl ShardConfig {
    pub fn voting_replicas(&self) -> BTreeSet<ServerId> {
        self.replicas
            .difference(&self.nonvoting_replicas)
            .copied()
            .collect()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum WriteAckConfig {
    Single,
    #[default]
    Majority,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Durability {
    #[default]
    Hard,
    Soft,
}

/// Definition of a secondary index. The function body is opaque here.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SindexConfig {
    pub func: String,
    #[serde(default)]
    pub multi: bool,
    #[serde(default)]
    pub geo: bool,
}

/// User-visible configuration of a table.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TableConfig {
    pub basic: TableBasicConfig,
    pub shards: Vec<ShardConfig>,
    #[serde(default)]
    pub sindexes: BTreeMap<String, SindexConfig>,
    #[serde(default)]
    pub write_ack_config: WriteAckConfig,
    #[serde(default)]
    pub durability: Durability,
}

/// Key-space split points; `n` split points make `n + 1` shards.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct TableShardScheme {
    pub split_points: Vec<String>,
}

impl TableShardScheme {
    pub fn num_shards(&self) -> usize {
        self.split_points.len() + 1
    }
}

/// A table config together with the shard boundaries it applies to.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TableConfigAndShards {
    pub config: TableConfig,
    pub shard_scheme: TableShardScheme,
}

impl TableConfigAndShards {
    /// Check the structural rules every committed config must satisfy.
    pub fn validate(&self) -> Result<(), ConfigError> {
        let basic = &self.config.basic;
        if basic.name.is_empty() {
            return Err(ConfigError::EmptyName);
        }
        if basic.primary_key.is_empty() {
            return Err(ConfigError::EmptyPrimaryKey);
        }
        if self.config.shards.is_empty() {
            return Err(ConfigError::NoShards);
        }
        if self.shard_scheme.num_shards() != self.config.shards.len() {
            return Err(ConfigError::ShardCountMismatch {
                scheme: self.shard_scheme.num_shards(),
                config: self.config.shards.len(),
            });
        }
        if self
            .shard_scheme
            .split_points
            .windows(2)
            .any(|w| w[0] >= w[1])
        {
            return Err(ConfigError::UnsortedSplitPoints);
        }
        for (shard, cfg) in self.config.shards.iter().enumerate() {
            if !cfg.replicas.contains(&cfg.primary_replica) {
                return Err(ConfigError::PrimaryNotReplica { shard });
            }
            if !cfg.nonvoting_replicas.is_subset(&cfg.replicas) {
                return Err(ConfigError::NonvotingNotReplica { shard });
            }
            if cfg.voting_replicas().is_empty() {
                return Err(ConfigError::NoVoters { shard });
            }
        }
        Ok(())
    }
}

// ── Contracts ──────────────────────────────────────────────────────

/// The role every replica of a shard is expected to play.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Contract {
    pub replicas: BTreeSet<ServerId>,
    pub voters: BTreeSet<ServerId>,
    /// `None` while the shard has no primary (e.g. during failover).
    pub primary: Option<ServerId>,
}

impl Contract {
    /// The contract a freshly configured shard starts from.
    pub fn for_shard(shard: &ShardConfig) -> Self {
        Self {
            replicas: shard.replicas.clone(),
            voters: shard.voting_replicas(),
            primary: Some(shard.primary_replica),
        }
    }

    pub fn involves(&self, server: &ServerId) -> bool {
        self.replicas.contains(server)
    }
}

/// Everything the consensus log agrees on for one table.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TableRaftState {
    pub config: TableConfigAndShards,
    /// Contract id → (shard index, contract).
    pub contracts: BTreeMap<ContractId, (usize, Contract)>,
}

impl TableRaftState {
    /// Initial state for a new table: one fresh contract per shard.
    pub fn new(config: TableConfigAndShards) -> Self {
        let contracts = config
            .config
            .shards
            .iter()
            .enumerate()
            .map(|(shard, cfg)| (ContractId::new_random(), (shard, Contract::for_shard(cfg))))
            .collect();
        Self { config, contracts }
    }

    /// Contracts for `new_config`, reusing the id of every existing contract
    /// whose shard and replica assignment is unchanged.
    pub fn plan_contracts(
        &self,
        new_config: &TableConfigAndShards,
    ) -> BTreeMap<ContractId, (usize, Contract)> {
        let mut planned = BTreeMap::new();
        for (shard, cfg) in new_config.config.shards.iter().enumerate() {
            let wanted = Contract::for_shard(cfg);
            let reused = self
                .contracts
                .iter()
                .find(|(_, (s, c))| *s == shard && *c == wanted)
                .map(|(id, _)| *id);
            planned.insert(reused.unwrap_or_else(ContractId::new_random), (shard, wanted));
        }
        planned
    }
}

/// The consensus member's committed state at a given log position.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CommittedState {
    pub state: TableRaftState,
    pub log_index: LogIndex,
}
