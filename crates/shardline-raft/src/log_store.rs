//! Raft log storage over the shared consensus record.
//!
//! Vote, committed id and log entries live in `RaftPersistentState`;
//! every write goes through `RaftStore::update`, so it is durable
//! before openraft is told it completed.

use std::fmt::Debug;
use std::ops::RangeBounds;

use openraft::storage::{LogFlushed, LogState, RaftLogReader, RaftLogStorage};
use openraft::{Entry, LogId, StorageError, Vote};
use tracing::debug;

use crate::store::RaftStore;
use crate::typ::TypeConfig;

/// Raft log storage.
pub struct LogStore {
    store: RaftStore,
}

/// Read-only log reader (cloned from LogStore).
pub struct LogReader {
    store: RaftStore,
}

impl LogStore {
    pub fn new(store: RaftStore) -> Self {
        Self { store }
    }
}

impl RaftLogReader<TypeConfig> for LogReader {
    async fn try_get_log_entries<RB: RangeBounds<u64> + Clone + Debug + Send>(
        &mut self,
        range: RB,
    ) -> Result<Vec<Entry<TypeConfig>>, StorageError<u64>> {
        Ok(self
            .store
            .read(|s| s.log.range(range).map(|(_, entry)| entry.clone()).collect())
            .await)
    }
}

impl RaftLogReader<TypeConfig> for LogStore {
    async fn try_get_log_entries<RB: RangeBounds<u64> + Clone + Debug + Send>(
        &mut self,
        range: RB,
    ) -> Result<Vec<Entry<TypeConfig>>, StorageError<u64>> {
        let mut reader = LogReader {
            store: self.store.clone(),
        };
        reader.try_get_log_entries(range).await
    }
}

impl RaftLogStorage<TypeConfig> for LogStore {
    type LogReader = LogReader;

    async fn get_log_state(&mut self) -> Result<LogState<TypeConfig>, StorageError<u64>> {
        Ok(self
            .store
            .read(|s| {
                let last_log_id = s
                    .log
                    .values()
                    .next_back()
                    .map(|entry| entry.log_id)
                    .or(s.last_purged);
                LogState {
                    last_purged_log_id: s.last_purged,
                    last_log_id,
                }
            })
            .await)
    }

    async fn get_log_reader(&mut self) -> Self::LogReader {
        LogReader {
            store: self.store.clone(),
        }
    }

    async fn save_vote(&mut self, vote: &Vote<u64>) -> Result<(), StorageError<u64>> {
        self.store
            .update(|s| {
                s.vote = Some(vote.clone());
                Ok(())
            })
            .await?;
        debug!(?vote, "saved vote");
        Ok(())
    }

    async fn read_vote(&mut self) -> Result<Option<Vote<u64>>, StorageError<u64>> {
        Ok(self.store.read(|s| s.vote.clone()).await)
    }

    async fn save_committed(
        &mut self,
        committed: Option<LogId<u64>>,
    ) -> Result<(), StorageError<u64>> {
        self.store
            .update(|s| {
                s.committed = committed;
                Ok(())
            })
            .await
    }

    async fn read_committed(&mut self) -> Result<Option<LogId<u64>>, StorageError<u64>> {
        Ok(self.store.read(|s| s.committed).await)
    }

    async fn append<I>(
        &mut self,
        entries: I,
        callback: LogFlushed<TypeConfig>,
    ) -> Result<(), StorageError<u64>>
    where
        I: IntoIterator<Item = Entry<TypeConfig>> + Send,
        I::IntoIter: Send,
    {
        let entries: Vec<Entry<TypeConfig>> = entries.into_iter().collect();
        self.store
            .update(move |s| {
                for entry in entries {
                    s.log.insert(entry.log_id.index, entry);
                }
                Ok(())
            })
            .await?;
        callback.log_io_completed(Ok(()));
        Ok(())
    }

    async fn truncate(&mut self, log_id: LogId<u64>) -> Result<(), StorageError<u64>> {
        debug!(%log_id, "truncating log");
        self.store
            .update(|s| {
                s.log.retain(|index, _| *index < log_id.index);
                Ok(())
            })
            .await
    }

    async fn purge(&mut self, log_id: LogId<u64>) -> Result<(), StorageError<u64>> {
        debug!(%log_id, "purging log");
        self.store
            .update(|s| {
                s.log.retain(|index, _| *index > log_id.index);
                s.last_purged = Some(log_id);
                Ok(())
            })
            .await
    }
}
