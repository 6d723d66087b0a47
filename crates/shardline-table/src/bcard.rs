//! What a table manager advertises about itself, and what it persists.

use serde::{Deserialize, Serialize};
use shardline_cluster::{Address, MinidirBcard};
use shardline_core::{
    DatabaseId, Epoch, MemberId, ServerId, TableConfigAndShards, TableTimestamp,
};
use shardline_raft::{RaftBcard, RaftPersistentState};
use uuid::Uuid;

use crate::executor::{AckKey, ContractAck, ExecutionBcard, ExecutionKey};
use crate::sindex::SindexStatusMap;

/// Asks a table manager for the status of its secondary indexes.
#[derive(Debug, Clone, Copy)]
pub struct GetStatusRequest {
    pub reply: Address<SindexStatusMap>,
}

/// Asks the leader to replace the table configuration.
#[derive(Debug, Clone)]
pub struct SetConfigRequest {
    pub config: TableConfigAndShards,
    pub reply: Address<Option<TableTimestamp>>,
}

/// Present on a business card only while its manager is the ready leader.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct LeaderBcard {
    /// Fresh for every leader role, so acks never cross leaderships.
    pub uuid: Uuid,
    pub set_config_mailbox: Address<SetConfigRequest>,
    pub contract_ack_minidir_bcard: MinidirBcard<AckKey, ContractAck>,
}

/// A table manager's entry in the cluster-wide directory.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TableManagerBcard {
    pub timestamp: TableTimestamp,
    pub database: DatabaseId,
    pub name: String,
    pub primary_key: String,
    pub raft_member_id: MemberId,
    pub raft_business_card: RaftBcard,
    pub execution_bcard_minidir_bcard: MinidirBcard<ExecutionKey, ExecutionBcard>,
    pub get_status_mailbox: Address<GetStatusRequest>,
    pub server_id: ServerId,
    pub leader: Option<LeaderBcard>,
}

/// The durable record kept for a table on this server.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TablePersistentState {
    Active {
        epoch: Epoch,
        member_id: MemberId,
        raft_state: RaftPersistentState,
    },
}

impl TablePersistentState {
    pub fn epoch(&self) -> Epoch {
        match self {
            TablePersistentState::Active { epoch, .. } => *epoch,
        }
    }

    pub fn member_id(&self) -> MemberId {
        match self {
            TablePersistentState::Active { member_id, .. } => *member_id,
        }
    }

    pub fn into_raft_state(self) -> RaftPersistentState {
        match self {
            TablePersistentState::Active { raft_state, .. } => raft_state,
        }
    }
}
