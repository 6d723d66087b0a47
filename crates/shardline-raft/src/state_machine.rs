//! Raft state machine over the table's replicated state.
//!
//! Applies committed changes to the `TableRaftState` and publishes the
//! result on the committed-state channel. Supports snapshots for log
//! compaction and for catching up lagging members.

use std::io::Cursor;

use openraft::storage::{RaftSnapshotBuilder, RaftStateMachine};
use openraft::{
    BasicNode, Entry, EntryPayload, LogId, Snapshot, SnapshotMeta, StorageError, StoredMembership,
};
use shardline_core::TableRaftState;
use tracing::{debug, info};

use crate::persistent::StoredSnapshot;
use crate::store::{RaftStore, read_err, write_err};
use crate::typ::{ChangeResponse, TypeConfig};

/// Raft state machine.
pub struct StateMachine {
    store: RaftStore,
}

/// Snapshot builder that captures the current table state.
pub struct SmSnapshotBuilder {
    store: RaftStore,
}

impl StateMachine {
    pub fn new(store: RaftStore) -> Self {
        Self { store }
    }
}

impl RaftStateMachine<TypeConfig> for StateMachine {
    type SnapshotBuilder = SmSnapshotBuilder;

    async fn applied_state(
        &mut self,
    ) -> Result<(Option<LogId<u64>>, StoredMembership<u64, BasicNode>), StorageError<u64>> {
        Ok(self.store.read(|s| (s.applied, s.membership.clone())).await)
    }

    async fn apply<I>(&mut self, entries: I) -> Result<Vec<ChangeResponse>, StorageError<u64>>
    where
        I: IntoIterator<Item = Entry<TypeConfig>> + Send,
        I::IntoIter: Send,
    {
        let entries: Vec<Entry<TypeConfig>> = entries.into_iter().collect();
        self.store
            .update_committed(move |s| {
                let mut responses = Vec::with_capacity(entries.len());
                for entry in entries {
                    let log_id = entry.log_id;
                    match entry.payload {
                        EntryPayload::Blank => {}
                        EntryPayload::Normal(change) => {
                            change.apply_to(&mut s.state);
                            debug!(index = log_id.index, "applied table change");
                        }
                        EntryPayload::Membership(membership) => {
                            s.membership = StoredMembership::new(Some(log_id), membership);
                        }
                    }
                    s.applied = Some(log_id);
                    responses.push(ChangeResponse { applied: true });
                }
                Ok(responses)
            })
            .await
    }

    async fn get_snapshot_builder(&mut self) -> Self::SnapshotBuilder {
        SmSnapshotBuilder {
            store: self.store.clone(),
        }
    }

    async fn begin_receiving_snapshot(
        &mut self,
    ) -> Result<Box<Cursor<Vec<u8>>>, StorageError<u64>> {
        Ok(Box::new(Cursor::new(Vec::new())))
    }

    async fn install_snapshot(
        &mut self,
        meta: &SnapshotMeta<u64, BasicNode>,
        snapshot: Box<Cursor<Vec<u8>>>,
    ) -> Result<(), StorageError<u64>> {
        let data = snapshot.into_inner();
        let state: TableRaftState = serde_json::from_slice(&data).map_err(read_err)?;

        self.store
            .update_committed(|s| {
                s.state = state;
                s.applied = meta.last_log_id;
                s.membership = meta.last_membership.clone();
                s.snapshot = Some(StoredSnapshot {
                    meta: meta.clone(),
                    data,
                });
                Ok(())
            })
            .await?;

        info!(snapshot_id = %meta.snapshot_id, "installed snapshot");
        Ok(())
    }

    async fn get_current_snapshot(
        &mut self,
    ) -> Result<Option<Snapshot<TypeConfig>>, StorageError<u64>> {
        Ok(self
            .store
            .read(|s| {
                s.snapshot.clone().map(|snap| Snapshot {
                    meta: snap.meta,
                    snapshot: Box::new(Cursor::new(snap.data)),
                })
            })
            .await)
    }
}

impl RaftSnapshotBuilder<TypeConfig> for SmSnapshotBuilder {
    async fn build_snapshot(&mut self) -> Result<Snapshot<TypeConfig>, StorageError<u64>> {
        let stored = self
            .store
            .update(|s| {
                let data = serde_json::to_vec(&s.state).map_err(write_err)?;
                let snapshot_id = format!("snap-{}", s.applied_index());
                let stored = StoredSnapshot {
                    meta: SnapshotMeta {
                        last_log_id: s.applied,
                        last_membership: s.membership.clone(),
                        snapshot_id,
                    },
                    data,
                };
                s.snapshot = Some(stored.clone());
                Ok(stored)
            })
            .await?;

        debug!(snapshot_id = %stored.meta.snapshot_id, "built snapshot");
        Ok(Snapshot {
            meta: stored.meta,
            snapshot: Box::new(Cursor::new(stored.data)),
        })
    }
}
