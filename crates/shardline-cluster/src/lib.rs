//! shardline-cluster — message routing plumbing shared by every table.
//!
//! # Architecture
//!
//! ```text
//! Transport (one per process)
//!   └── MailboxManager (one per peer)
//!       ├── Mailbox<T>          typed endpoint, handler per message
//!       └── call()              request with one-shot reply address
//!
//! Directory<K, V>               watchable map, change-only notifications
//!   └── DirectorySubscription   per-key (key, Option<value>) stream
//!
//! MinidirWriteManager ──snapshots──▶ MinidirReadManager
//!   (local map + reader directory)    (merged (peer, key) → value map)
//!
//! View<S, T>                    read-only projection of a watched value
//! ```

pub mod directory;
pub mod mailbox;
pub mod minidir;
pub mod view;

pub use directory::{Directory, DirectorySubscription};
pub use mailbox::{Address, Mailbox, MailboxManager, Transport, call};
pub use minidir::{MinidirBcard, MinidirReadManager, MinidirUpdate, MinidirValues, MinidirWriteManager};
pub use view::View;
