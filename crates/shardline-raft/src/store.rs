//! In-memory consensus record shared by the log store and state machine.

use std::sync::Arc;

use openraft::{ErrorSubject, ErrorVerb, StorageError};
use shardline_core::CommittedState;
use tokio::sync::{Mutex, watch};
use tracing::warn;

use crate::persistent::{RaftPersistentState, RaftStorageInterface};

pub(crate) fn read_err(e: impl std::fmt::Display) -> StorageError<u64> {
    StorageError::from_io_error(
        ErrorSubject::Store,
        ErrorVerb::Read,
        std::io::Error::other(e.to_string()),
    )
}

pub(crate) fn write_err(e: impl std::fmt::Display) -> StorageError<u64> {
    StorageError::from_io_error(
        ErrorSubject::Store,
        ErrorVerb::Write,
        std::io::Error::other(e.to_string()),
    )
}

/// The consensus record plus the channel committed state is published on.
///
/// Every mutation is made on a copy, written through the storage interface,
/// and only then adopted, so memory never runs ahead of what is durable.
#[derive(Clone)]
pub struct RaftStore {
    inner: Arc<Mutex<RaftPersistentState>>,
    storage: Arc<dyn RaftStorageInterface>,
    committed: Arc<watch::Sender<CommittedState>>,
}

impl RaftStore {
    pub fn new(initial: RaftPersistentState, storage: Arc<dyn RaftStorageInterface>) -> Self {
        let (committed, _rx) = watch::channel(CommittedState {
            state: initial.state.clone(),
            log_index: initial.applied_index(),
        });
        Self {
            inner: Arc::new(Mutex::new(initial)),
            storage,
            committed: Arc::new(committed),
        }
    }

    /// Receiver that fires on every commit applied to the state machine.
    pub fn committed(&self) -> watch::Receiver<CommittedState> {
        self.committed.subscribe()
    }

    pub async fn read<R>(&self, f: impl FnOnce(&RaftPersistentState) -> R) -> R {
        let guard = self.inner.lock().await;
        f(&guard)
    }

    /// Mutate, persist, then adopt.
    pub(crate) async fn update<R>(
        &self,
        f: impl FnOnce(&mut RaftPersistentState) -> Result<R, StorageError<u64>>,
    ) -> Result<R, StorageError<u64>> {
        let mut guard = self.inner.lock().await;
        let mut next = guard.clone();
        let out = f(&mut next)?;
        self.persist(&next).await?;
        *guard = next;
        Ok(out)
    }

    /// Like `update`, and also publish the resulting committed state.
    pub(crate) async fn update_committed<R>(
        &self,
        f: impl FnOnce(&mut RaftPersistentState) -> Result<R, StorageError<u64>>,
    ) -> Result<R, StorageError<u64>> {
        let mut guard = self.inner.lock().await;
        let mut next = guard.clone();
        let out = f(&mut next)?;
        self.persist(&next).await?;
        *guard = next;
        let published = CommittedState {
            state: guard.state.clone(),
            log_index: guard.applied_index(),
        };
        self.committed.send_modify(|c| *c = published);
        Ok(out)
    }

    async fn persist(&self, state: &RaftPersistentState) -> Result<(), StorageError<u64>> {
        self.storage.write_persistent_state(state).await.map_err(|e| {
            warn!(error = %e, "failed to persist consensus state");
            write_err(e)
        })
    }
}
