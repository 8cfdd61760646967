use std::fmt;

use serde::{Deserialize, Serialize};

macro_rules! define_id {
    ($(#[$meta:meta])* $name:ident, $prefix:literal) => {
        $(#[$meta])*
        #[derive(
            Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize, Default,
        )]
        pub struct $name(pub u64);

        impl fmt::Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                write!(f, concat!($prefix, "-{}"), self.0)
            }
        }
    };
}

define_id!(
    /// Identifies a table registered in the table manager.
    TableId,
    "table"
);
define_id!(
    /// Identifies one tablet. Reshard always allocates fresh ids.
    TabletId,
    "tablet"
);
define_id!(CellId, "cell");
define_id!(ChunkId, "chunk");
define_id!(NodeId, "node");
define_id!(TxnId, "tx");
define_id!(JournalId, "journal");
define_id!(StoreId, "store");
define_id!(ActionId, "action");

/// Logical commit/read timestamp issued by the cluster timestamp provider.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct Timestamp(pub u64);

impl Timestamp {
    pub const MIN: Timestamp = Timestamp(1);
    /// Read everything committed so far.
    pub const MAX: Timestamp = Timestamp(u64::MAX - 16);
    /// Latest committed state, routed through the leader.
    pub const SYNC_LAST_COMMITTED: Timestamp = Timestamp(u64::MAX - 2);
    /// Whatever the serving peer has applied; permits follower reads.
    pub const ASYNC_LAST_COMMITTED: Timestamp = Timestamp(u64::MAX - 1);

    pub fn is_sentinel(self) -> bool {
        self == Self::SYNC_LAST_COMMITTED || self == Self::ASYNC_LAST_COMMITTED
    }
}

impl fmt::Display for Timestamp {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match *self {
            Self::SYNC_LAST_COMMITTED => write!(f, "sync_last_committed"),
            Self::ASYNC_LAST_COMMITTED => write!(f, "async_last_committed"),
            Self::MAX => write!(f, "max"),
            Timestamp(ts) => write!(f, "{ts}"),
        }
    }
}

/// Transaction atomicity of a table or a write request.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum Atomicity {
    #[default]
    Full,
    None,
}

impl fmt::Display for Atomicity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Atomicity::Full => write!(f, "full"),
            Atomicity::None => write!(f, "none"),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum OptimizedFor {
    #[default]
    Lookup,
    Scan,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum InMemoryMode {
    #[default]
    None,
    Compressed,
    Uncompressed,
}

impl InMemoryMode {
    pub fn is_enabled(self) -> bool {
        self != InMemoryMode::None
    }
}

/// Which peer of the owning cell serves a read.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum ReadFrom {
    #[default]
    Leader,
    Follower,
}

/// Storage medium a chunk replica lives on.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Medium(pub String);

impl Medium {
    pub fn default_medium() -> Self {
        Medium("default".to_string())
    }
}

impl Default for Medium {
    fn default() -> Self {
        Self::default_medium()
    }
}

impl fmt::Display for Medium {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}
