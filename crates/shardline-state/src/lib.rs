//! shardline-state — embedded record store for per-table metadata.
//!
//! Backed by [redb](https://docs.rs/redb), provides persistent and in-memory
//! storage for the record each table manager keeps about itself.
//!
//! # Architecture
//!
//! Records are JSON-serialized into redb's `&[u8]` value columns and keyed
//! by the table's id. The store does not interpret the record; callers pick
//! the type they read and write.
//!
//! The `TableStore` is `Clone` + `Send` + `Sync` (backed by `Arc<Database>`)
//! and can be shared across async tasks.

pub mod error;
pub mod store;
pub mod tables;

pub use error::{StateError, StateResult};
pub use store::TableStore;
