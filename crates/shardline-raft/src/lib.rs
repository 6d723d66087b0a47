// openraft's StorageError is large.
#![allow(clippy::result_large_err)]

//! shardline-raft — the consensus member of one table.
//!
//! Binds openraft to the table model: the replicated state is a
//! `TableRaftState`, every durable mutation of the log or state machine is
//! handed to a `RaftStorageInterface` as a complete `RaftPersistentState`,
//! and Raft RPCs travel over the cluster mailbox transport to whichever
//! address the consensus-peer directory currently lists for a member.
//!
//! # Architecture
//!
//! - **`typ`** — Type configuration (`TypeConfig`, `TableChange`, `ChangeResponse`)
//! - **`persistent`** — `RaftPersistentState` and the storage interface
//! - **`store`** — shared in-memory state, persisted before it is adopted
//! - **`log_store`** — Raft log storage over the shared store
//! - **`state_machine`** — applies committed changes, publishes committed state
//! - **`network`** — mailbox transport for inter-member Raft RPCs
//! - **`member`** — `RaftMember`: committed state, readiness, proposals

pub mod error;
pub mod log_store;
pub mod member;
pub mod network;
pub mod persistent;
pub mod state_machine;
pub mod store;
pub mod typ;

pub use error::{ConsensusError, ConsensusResult};
pub use log_store::LogStore;
pub use member::{Proposer, RaftMember};
pub use network::{NetworkConnection, NetworkFactory, RaftBcard, RaftPeers, RaftRpc};
pub use persistent::{RaftPersistentState, RaftStorageInterface, StoredSnapshot};
pub use state_machine::StateMachine;
pub use store::RaftStore;
pub use typ::{ChangeResponse, TableChange, TableRaft, TypeConfig};
