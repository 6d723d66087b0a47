//! Durable storage of table records.

use std::sync::Arc;

use async_trait::async_trait;
use shardline_core::{Epoch, MemberId, TableId};
use shardline_raft::{RaftPersistentState, RaftStorageInterface};
use shardline_state::TableStore;
use tokio_util::sync::CancellationToken;
use tracing::debug;

use crate::bcard::TablePersistentState;
use crate::error::{TableError, TableResult};

#[async_trait]
pub trait TablePersistence: Send + Sync + 'static {
    /// Store `record` for `table_id`. Returns only once it is durable.
    /// A cancelled call writes nothing.
    async fn update_table(
        &self,
        table_id: TableId,
        record: &TablePersistentState,
        cancel: &CancellationToken,
    ) -> TableResult<()>;

    async fn read_table(&self, table_id: TableId) -> TableResult<Option<TablePersistentState>>;
}

#[async_trait]
impl TablePersistence for TableStore {
    async fn update_table(
        &self,
        table_id: TableId,
        record: &TablePersistentState,
        cancel: &CancellationToken,
    ) -> TableResult<()> {
        if cancel.is_cancelled() {
            return Err(TableError::Cancelled);
        }
        self.put_table(table_id, record)?;
        Ok(())
    }

    async fn read_table(&self, table_id: TableId) -> TableResult<Option<TablePersistentState>> {
        Ok(self.get_table(table_id)?)
    }
}

/// Wraps the consensus member's record with this manager's identity and
/// hands it to the persistence layer.
pub struct TableStorage {
    table_id: TableId,
    epoch: Epoch,
    member_id: MemberId,
    persistence: Arc<dyn TablePersistence>,
}

impl TableStorage {
    pub fn new(
        table_id: TableId,
        epoch: Epoch,
        member_id: MemberId,
        persistence: Arc<dyn TablePersistence>,
    ) -> Self {
        Self {
            table_id,
            epoch,
            member_id,
            persistence,
        }
    }

    pub async fn write(
        &self,
        raft_state: &RaftPersistentState,
        cancel: &CancellationToken,
    ) -> TableResult<()> {
        let record = TablePersistentState::Active {
            epoch: self.epoch,
            member_id: self.member_id,
            raft_state: raft_state.clone(),
        };
        self.persistence
            .update_table(self.table_id, &record, cancel)
            .await?;
        debug!(table_id = %self.table_id, applied = raft_state.applied_index(), "table record stored");
        Ok(())
    }
}

#[async_trait]
impl RaftStorageInterface for TableStorage {
    async fn write_persistent_state(&self, state: &RaftPersistentState) -> anyhow::Result<()> {
        // Consensus writes are never abandoned halfway.
        self.write(state, &CancellationToken::new()).await?;
        Ok(())
    }
}
