//! Request options of the cluster operations.

use tabula_balancer::TableBalancerConfig;
use tabula_chunk::ReplicationParams;
use tabula_common::schema::TableSchema;
use tabula_common::security::Acl;
use tabula_common::{Atomicity, CellId, InMemoryMode, Key, OptimizedFor, ReadFrom, Timestamp, TxnId};

/// Mutable table attributes. Tablet-level settings take effect on mount or
/// remount.
#[derive(Debug, Clone, PartialEq)]
pub struct TableAttributes {
    pub atomicity: Atomicity,
    pub optimized_for: OptimizedFor,
    pub in_memory_mode: InMemoryMode,
    pub enable_lookup_hash_table: bool,
    pub read_only: bool,
    /// Placement of every chunk the table writes.
    pub replication: ReplicationParams,
    pub max_dynamic_store_row_count: Option<usize>,
    pub max_partition_row_count: Option<usize>,
    pub max_partition_store_count: Option<usize>,
    pub tablet_balancer_config: TableBalancerConfig,
}

impl Default for TableAttributes {
    fn default() -> Self {
        Self {
            atomicity: Atomicity::Full,
            optimized_for: OptimizedFor::Lookup,
            in_memory_mode: InMemoryMode::None,
            enable_lookup_hash_table: false,
            read_only: false,
            replication: ReplicationParams::default(),
            max_dynamic_store_row_count: None,
            max_partition_row_count: None,
            max_partition_store_count: None,
            tablet_balancer_config: TableBalancerConfig::default(),
        }
    }
}

#[derive(Debug, Clone)]
pub struct TableOptions {
    pub schema: TableSchema,
    pub dynamic: bool,
    pub attributes: TableAttributes,
    /// Defaults to the `default` bundle.
    pub bundle: Option<String>,
    /// Initial pivots of a dynamic table; one tablet when unset.
    pub pivot_keys: Option<Vec<Key>>,
    pub acl: Acl,
}

impl TableOptions {
    pub fn dynamic(schema: TableSchema) -> Self {
        Self {
            schema,
            dynamic: true,
            attributes: TableAttributes::default(),
            bundle: None,
            pivot_keys: None,
            acl: Acl::default(),
        }
    }

    pub fn static_table(schema: TableSchema) -> Self {
        Self {
            dynamic: false,
            ..Self::dynamic(schema)
        }
    }

    pub fn with_atomicity(mut self, atomicity: Atomicity) -> Self {
        self.attributes.atomicity = atomicity;
        self
    }

    pub fn with_optimized_for(mut self, optimized_for: OptimizedFor) -> Self {
        self.attributes.optimized_for = optimized_for;
        self
    }

    pub fn with_in_memory_mode(mut self, mode: InMemoryMode) -> Self {
        self.attributes.in_memory_mode = mode;
        self
    }

    pub fn with_lookup_hash_table(mut self) -> Self {
        self.attributes.enable_lookup_hash_table = true;
        self
    }

    pub fn with_replication(mut self, replication: ReplicationParams) -> Self {
        self.attributes.replication = replication;
        self
    }

    pub fn with_pivot_keys(mut self, pivot_keys: Vec<Key>) -> Self {
        self.pivot_keys = Some(pivot_keys);
        self
    }

    pub fn with_bundle(mut self, bundle: impl Into<String>) -> Self {
        self.bundle = Some(bundle.into());
        self
    }

    pub fn with_acl(mut self, acl: Acl) -> Self {
        self.acl = acl;
        self
    }

    pub fn with_attributes(mut self, f: impl FnOnce(&mut TableAttributes)) -> Self {
        f(&mut self.attributes);
        self
    }
}

/// Inclusive tablet index range; unset bounds extend to the table's ends.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct TabletRange {
    pub first: Option<usize>,
    pub last: Option<usize>,
}

impl TabletRange {
    pub fn all() -> Self {
        Self::default()
    }

    pub fn new(first: usize, last: usize) -> Self {
        Self {
            first: Some(first),
            last: Some(last),
        }
    }

    pub fn single(index: usize) -> Self {
        Self::new(index, index)
    }
}

#[derive(Debug, Clone, Default)]
pub struct MountOptions {
    pub range: TabletRange,
    /// Target cell; the least loaded cell of the bundle when unset.
    pub cell: Option<CellId>,
    pub freeze: bool,
}

impl MountOptions {
    pub fn range(range: TabletRange) -> Self {
        Self {
            range,
            ..Default::default()
        }
    }

    pub fn on_cell(mut self, cell: CellId) -> Self {
        self.cell = Some(cell);
        self
    }

    pub fn frozen(mut self) -> Self {
        self.freeze = true;
        self
    }
}

#[derive(Debug, Clone, Default)]
pub struct ReshardOptions {
    pub range: TabletRange,
    pub pivot_keys: Option<Vec<Key>>,
    pub tablet_count: Option<usize>,
    /// Reshard mounted tablets: they are flushed, resharded and mounted again.
    pub enable_slicing: bool,
}

impl ReshardOptions {
    pub fn pivot_keys(pivot_keys: Vec<Key>) -> Self {
        Self {
            pivot_keys: Some(pivot_keys),
            ..Default::default()
        }
    }

    pub fn tablet_count(count: usize) -> Self {
        Self {
            tablet_count: Some(count),
            ..Default::default()
        }
    }

    pub fn in_range(mut self, first: usize, last: usize) -> Self {
        self.range = TabletRange::new(first, last);
        self
    }

    pub fn with_slicing(mut self) -> Self {
        self.enable_slicing = true;
        self
    }
}

#[derive(Debug, Clone, Copy, Default)]
pub struct WriteOptions {
    /// Write only the supplied columns.
    pub update: bool,
    /// Merge supplied aggregate columns instead of overwriting them.
    pub aggregate: bool,
    /// Must match the table's atomicity when set.
    pub atomicity: Option<Atomicity>,
    pub tx: Option<TxnId>,
}

impl WriteOptions {
    pub fn update() -> Self {
        Self {
            update: true,
            ..Default::default()
        }
    }

    pub fn aggregate() -> Self {
        Self {
            aggregate: true,
            ..Default::default()
        }
    }

    pub fn with_atomicity(mut self, atomicity: Atomicity) -> Self {
        self.atomicity = Some(atomicity);
        self
    }

    pub fn in_tx(mut self, tx: TxnId) -> Self {
        self.tx = Some(tx);
        self
    }
}

#[derive(Debug, Clone, Default)]
pub struct ReadOptions {
    /// Latest committed data when unset.
    pub timestamp: Option<Timestamp>,
    pub read_from: ReadFrom,
    pub tx: Option<TxnId>,
    /// Column projection; every column when unset.
    pub columns: Option<Vec<String>>,
}

impl ReadOptions {
    pub fn at(timestamp: Timestamp) -> Self {
        Self {
            timestamp: Some(timestamp),
            ..Default::default()
        }
    }

    /// Follower read bounded by the async last committed timestamp.
    pub fn from_followers() -> Self {
        Self {
            timestamp: Some(Timestamp::ASYNC_LAST_COMMITTED),
            read_from: ReadFrom::Follower,
            ..Default::default()
        }
    }

    pub fn in_tx(mut self, tx: TxnId) -> Self {
        self.tx = Some(tx);
        self
    }

    pub fn with_columns(mut self, columns: &[&str]) -> Self {
        self.columns = Some(columns.iter().map(|c| c.to_string()).collect());
        self
    }
}

#[derive(Debug, Clone, Default)]
pub struct SelectQuery {
    pub columns: Option<Vec<String>>,
    /// Predicate in the expression language, e.g. `value > 3 and key < 10`.
    pub filter: Option<String>,
}

impl SelectQuery {
    pub fn all() -> Self {
        Self::default()
    }

    pub fn filter(filter: impl Into<String>) -> Self {
        Self {
            columns: None,
            filter: Some(filter.into()),
        }
    }

    pub fn with_columns(mut self, columns: &[&str]) -> Self {
        self.columns = Some(columns.iter().map(|c| c.to_string()).collect());
        self
    }
}
