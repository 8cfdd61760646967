//! Tablet engine: sorted, MVCC-versioned tablets hosted by replicated cells.
//!
//! Writes land in an active dynamic store; full stores rotate to passive,
//! are flushed into chunks and leveled into partitions, where compaction
//! merges them and splits oversized partitions.

pub mod host;
pub mod row;
pub mod slot;
pub mod store;
pub mod tablet;
pub mod write;

pub use host::{HostMetricsSnapshot, StoreUpdate, TabletCellHost};
pub use row::{to_named_row, ColumnWrite, RowModification, VersionedRow};
pub use slot::{MutationOutcome, TabletMutation, TabletSlot};
pub use store::{PreloadState, StaticStoreDescriptor, StoreState};
pub use tablet::{ReadStats, Tablet, TabletDescriptor, TabletSettings, TabletState, TabletStatistics};
pub use write::RowPreparer;
