//! Raft type configuration for a table's consensus member.
//!
//! Defines the `TypeConfig` that wires together all openraft
//! associated types: node IDs, change/response payloads, and
//! the async runtime.

use std::collections::BTreeMap;
use std::io::Cursor;

use openraft::TokioRuntime;
use shardline_core::{Contract, ContractId, TableConfigAndShards, TableRaftState};

/// A change proposed to the table's replicated state.
#[derive(Debug, Clone, PartialEq, serde::Serialize, serde::Deserialize)]
pub enum TableChange {
    /// Replace the table configuration and the contract set derived from it.
    SetConfig {
        config: TableConfigAndShards,
        contracts: BTreeMap<ContractId, (usize, Contract)>,
    },
}

impl TableChange {
    /// Build a config change against `current`, keeping contract ids for
    /// shards whose replica assignment did not move.
    pub fn set_config(current: &TableRaftState, config: TableConfigAndShards) -> Self {
        let contracts = current.plan_contracts(&config);
        TableChange::SetConfig { config, contracts }
    }

    pub fn apply_to(self, state: &mut TableRaftState) {
        match self {
            TableChange::SetConfig { config, contracts } => {
                state.config = config;
                state.contracts = contracts;
            }
        }
    }
}

/// Returned once a change is applied to the state machine.
#[derive(Debug, Clone, serde::Serialize, serde::Deserialize)]
pub struct ChangeResponse {
    pub applied: bool,
}

openraft::declare_raft_types!(
    /// Table consensus type configuration.
    pub TypeConfig:
        D = TableChange,
        R = ChangeResponse,
        NodeId = u64,
        Node = openraft::BasicNode,
        Entry = openraft::Entry<TypeConfig>,
        SnapshotData = Cursor<Vec<u8>>,
        AsyncRuntime = TokioRuntime,
);

/// Convenience alias for the Raft instance.
pub type TableRaft = openraft::Raft<TypeConfig>;
