//! Per-table performance counters.
//!
//! A process keeps one `PerfmonCollection`. Each table manager registers a
//! `TableMetrics` bucket in it under its table id and holds the returned
//! `PerfmonMembership` for as long as it lives. Counters are plain atomics,
//! bumped from the manager's subscriptions, the leader role and the
//! contract executor.

use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

use parking_lot::RwLock;
use serde::Serialize;
use shardline_core::TableId;
use tracing::{debug, warn};

/// Counters for one table on this server.
#[derive(Debug, Default)]
pub struct TableMetrics {
    commits_observed: AtomicU64,
    bcard_republications: AtomicU64,
    directory_changes: AtomicU64,
    leader_roles_created: AtomicU64,
    leader_roles_destroyed: AtomicU64,
    set_config_committed: AtomicU64,
    set_config_failed: AtomicU64,
    execution_updates: AtomicU64,
}

/// Point-in-time copy of a table's counters.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct TableMetricsSnapshot {
    pub commits_observed: u64,
    pub bcard_republications: u64,
    pub directory_changes: u64,
    pub leader_roles_created: u64,
    pub leader_roles_destroyed: u64,
    pub set_config_committed: u64,
    /// Empty replies: rejected, timed out, or cut short by leadership loss.
    pub set_config_failed: u64,
    /// Times the contract executor published new bcards or acks.
    pub execution_updates: u64,
}

impl TableMetrics {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn record_commit(&self) {
        self.commits_observed.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_republication(&self) {
        self.bcard_republications.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_directory_change(&self) {
        self.directory_changes.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_leader_created(&self) {
        self.leader_roles_created.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_leader_destroyed(&self) {
        self.leader_roles_destroyed.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_set_config(&self, committed: bool) {
        let counter = if committed {
            &self.set_config_committed
        } else {
            &self.set_config_failed
        };
        counter.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_execution_update(&self) {
        self.execution_updates.fetch_add(1, Ordering::Relaxed);
    }

    pub fn snapshot(&self) -> TableMetricsSnapshot {
        TableMetricsSnapshot {
            commits_observed: self.commits_observed.load(Ordering::Relaxed),
            bcard_republications: self.bcard_republications.load(Ordering::Relaxed),
            directory_changes: self.directory_changes.load(Ordering::Relaxed),
            leader_roles_created: self.leader_roles_created.load(Ordering::Relaxed),
            leader_roles_destroyed: self.leader_roles_destroyed.load(Ordering::Relaxed),
            set_config_committed: self.set_config_committed.load(Ordering::Relaxed),
            set_config_failed: self.set_config_failed.load(Ordering::Relaxed),
            execution_updates: self.execution_updates.load(Ordering::Relaxed),
        }
    }
}

/// Every table's metrics on this server, keyed by table id.
#[derive(Clone, Default)]
pub struct PerfmonCollection {
    tables: Arc<RwLock<HashMap<TableId, Arc<TableMetrics>>>>,
}

impl PerfmonCollection {
    pub fn new() -> Self {
        Self::default()
    }

    /// Add a fresh bucket for `table_id`. The bucket is removed when the
    /// returned membership is dropped.
    pub fn register(&self, table_id: TableId) -> PerfmonMembership {
        let metrics = Arc::new(TableMetrics::new());
        let replaced = self
            .tables
            .write()
            .insert(table_id, Arc::clone(&metrics))
            .is_some();
        if replaced {
            warn!(%table_id, "table registered twice for perfmon, replacing bucket");
        } else {
            debug!(%table_id, "registered for perfmon");
        }
        PerfmonMembership {
            collection: self.clone(),
            table_id,
            metrics,
        }
    }

    pub fn get(&self, table_id: TableId) -> Option<TableMetricsSnapshot> {
        self.tables.read().get(&table_id).map(|m| m.snapshot())
    }

    pub fn snapshot(&self) -> BTreeMap<TableId, TableMetricsSnapshot> {
        self.tables
            .read()
            .iter()
            .map(|(id, m)| (*id, m.snapshot()))
            .collect()
    }
}

/// A table's registration in the collection.
pub struct PerfmonMembership {
    collection: PerfmonCollection,
    table_id: TableId,
    metrics: Arc<TableMetrics>,
}

impl PerfmonMembership {
    pub fn metrics(&self) -> Arc<TableMetrics> {
        Arc::clone(&self.metrics)
    }
}

impl Drop for PerfmonMembership {
    fn drop(&mut self) {
        let mut tables = self.collection.tables.write();
        // A later registration for the same table owns the entry now.
        if tables
            .get(&self.table_id)
            .is_some_and(|m| Arc::ptr_eq(m, &self.metrics))
        {
            tables.remove(&self.table_id);
            debug!(table_id = %self.table_id, "unregistered from perfmon");
        }
    }
}
