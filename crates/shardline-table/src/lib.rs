//! shardline-table — per-table coordination.
//!
//! A `TableManager` runs on every server hosting a table. It wraps the
//! table's consensus member, publishes a business card describing how to
//! reach it, and keeps three peer directories in step with the cluster-wide
//! directory. While its consensus member is the ready leader it also runs a
//! leader role that accepts config changes and gathers contract acks.
//!
//! # Architecture
//!
//! - **`manager`** — `TableManager` and the subscriptions that drive it
//! - **`leader`** — transient leader role and the slot that serializes it
//! - **`coordinator`** — proposes config changes, aggregates acks
//! - **`directories`** — consensus-peer, execution-bcard and ack directories
//! - **`executor`** — contract executor seam and the acking executor
//! - **`sindex`** — index runtime seam and the sindex manager
//! - **`perfmon`** — per-table counters registered in a shared collection
//! - **`persistence`** — durable table records
//! - **`bcard`** — business card, leader card, requests and records
//! - **`client`** / **`publisher`** — talking to and advertising managers

pub mod bcard;
pub mod client;
pub mod coordinator;
pub mod directories;
pub mod error;
pub mod executor;
mod leader;
pub mod manager;
pub mod perfmon;
pub mod persistence;
pub mod publisher;
pub mod sindex;

#[cfg(test)]
pub(crate) mod test_util;

pub use bcard::{
    GetStatusRequest, LeaderBcard, SetConfigRequest, TableManagerBcard, TablePersistentState,
};
pub use client::{request_set_config, request_status};
pub use coordinator::{ContractAcks, Coordinator};
pub use directories::PeerDirectories;
pub use error::{TableError, TableResult};
pub use executor::{
    AckKey, AckState, AckingExecutor, AckingExecutorFactory, ContractAck, ContractExecutor,
    ExecutionBcard, ExecutionKey, ExecutionRole, ExecutorFactory,
};
pub use manager::{TableDirectory, TableManager, TableManagerDeps, initial_table_state};
pub use perfmon::{PerfmonCollection, PerfmonMembership, TableMetrics, TableMetricsSnapshot};
pub use persistence::{TablePersistence, TableStorage};
pub use publisher::spawn_bcard_publisher;
pub use sindex::{
    IndexRuntime, IndexRuntimeFactory, SindexManager, SindexManagerFactory, SindexStatus,
    SindexStatusMap,
};
