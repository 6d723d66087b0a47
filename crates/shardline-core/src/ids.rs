//! Identifiers shared across the cluster.
//!
//! Every entity is named by a random UUID wrapped in its own newtype so
//! that a `TableId` can never be passed where a `ServerId` is expected.

use std::fmt;
use std::time::{SystemTime, UNIX_EPOCH};

use serde::{Deserialize, Serialize};
use uuid::Uuid;

macro_rules! uuid_id {
    ($(#[$meta:meta])* $name:ident) => {
        $(#[$meta])*
        #[derive(
            Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default, Serialize, Deserialize,
        )]
        #[serde(transparent)]
        pub struct $name(pub Uuid);

        impl $name {
            /// Generate a fresh random identifier.
            pub fn new_random() -> Self {
                Self(Uuid::new_v4())
            }

            /// The all-zero identifier.
            pub fn nil() -> Self {
                Self(Uuid::nil())
            }

            pub fn is_nil(&self) -> bool {
                self.0.is_nil()
            }
        }

        impl fmt::Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                fmt::Display::fmt(&self.0, f)
            }
        }
    };
}

uuid_id!(
    /// Persistent identity of a server, stable across restarts.
    ServerId
);
uuid_id!(
    /// Identity of a live connection to a server; changes on reconnect.
    PeerId
);
uuid_id!(
    /// Identity of a table. Reused when a table is dropped and recreated.
    TableId
);
uuid_id!(
    /// Identity of a database.
    DatabaseId
);
uuid_id!(
    /// Identity of one consensus participant of one table.
    MemberId
);
uuid_id!(
    /// Identity of a contract in the committed state.
    ContractId
);

impl MemberId {
    /// The `u64` node id used by the consensus layer for this member.
    ///
    /// FNV-1a over the UUID bytes; never zero, since zero means "no
    /// leader" to openraft.
    pub fn raft_node_id(&self) -> u64 {
        let mut hash: u64 = 0xcbf29ce484222325;
        for byte in self.0.as_bytes() {
            hash ^= u64::from(*byte);
            hash = hash.wrapping_mul(0x100000001b3);
        }
        if hash == 0 {
            hash = 1;
        }
        hash
    }
}

/// Index of an entry in a table's consensus log.
pub type LogIndex = u64;

/// Generation of a table id.
///
/// Dropping and recreating a table keeps its `TableId` but produces a new
/// epoch. Epochs order by `timestamp` first, then by `id`.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default, Serialize, Deserialize,
)]
pub struct Epoch {
    /// Microseconds since the Unix epoch when this generation was minted.
    pub timestamp: u64,
    pub id: Uuid,
}

impl Epoch {
    /// Mint a new epoch stamped with the current wall-clock time.
    pub fn now() -> Self {
        let timestamp = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .unwrap_or_default()
            .as_micros() as u64;
        Self {
            timestamp,
            id: Uuid::new_v4(),
        }
    }

    /// An epoch with no identity. Never valid for a live table.
    pub fn unset() -> Self {
        Self::default()
    }

    pub fn is_unset(&self) -> bool {
        self.id.is_nil()
    }
}

impl fmt::Display for Epoch {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}@{}", self.id, self.timestamp)
    }
}

/// Position of a published business card: which incarnation of the table,
/// and how far into its log the card's contents were taken from.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct TableTimestamp {
    pub epoch: Epoch,
    pub log_index: LogIndex,
}
