//! The consensus member's durable record and the sink it is written to.

use std::collections::{BTreeMap, BTreeSet};

use async_trait::async_trait;
use openraft::{BasicNode, Entry, LogId, SnapshotMeta, StoredMembership, Vote};
use serde::{Deserialize, Serialize};
use shardline_core::{LogIndex, MemberId, TableRaftState};

use crate::typ::TypeConfig;

/// A snapshot of the state machine, kept so lagging members can be caught up.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StoredSnapshot {
    pub meta: SnapshotMeta<u64, BasicNode>,
    pub data: Vec<u8>,
}

/// Everything a consensus member must find again after a restart.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RaftPersistentState {
    pub vote: Option<Vote<u64>>,
    pub committed: Option<LogId<u64>>,
    pub last_purged: Option<LogId<u64>>,
    pub log: BTreeMap<u64, Entry<TypeConfig>>,
    pub applied: Option<LogId<u64>>,
    pub membership: StoredMembership<u64, BasicNode>,
    pub state: TableRaftState,
    pub snapshot: Option<StoredSnapshot>,
    /// Voters to bootstrap with if this member has never run.
    pub initial_members: BTreeMap<u64, BasicNode>,
}

impl RaftPersistentState {
    /// Record for a brand-new table whose founding voters are `members`.
    pub fn make_initial(state: TableRaftState, members: &BTreeSet<MemberId>) -> Self {
        let initial_members = members
            .iter()
            .map(|m| (m.raft_node_id(), BasicNode::new(m.to_string())))
            .collect();
        Self {
            vote: None,
            committed: None,
            last_purged: None,
            log: BTreeMap::new(),
            applied: None,
            membership: StoredMembership::default(),
            state,
            snapshot: None,
            initial_members,
        }
    }

    /// True until the member has voted, logged or applied anything.
    pub fn is_pristine(&self) -> bool {
        self.vote.is_none() && self.log.is_empty() && self.applied.is_none() && self.snapshot.is_none()
    }

    pub fn applied_index(&self) -> LogIndex {
        self.applied.map_or(0, |log_id| log_id.index)
    }
}

/// Durable sink for the consensus record.
///
/// `write_persistent_state` must not return until the record is durable.
/// The in-memory copy only moves forward after it succeeds.
#[async_trait]
pub trait RaftStorageInterface: Send + Sync + 'static {
    async fn write_persistent_state(&self, state: &RaftPersistentState) -> anyhow::Result<()>;
}
