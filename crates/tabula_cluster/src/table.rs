//! Table metadata owned by the cluster: schema, attributes, tablets and the
//! root of the table's chunk tree.
//!
//! # Invariants
//! - Tablet pivots are strictly increasing and the first one is the empty key.
//! - Child `i` of a dynamic table's root list backs tablet `i`.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use serde::Serialize;

use tabula_chunk::ChunkListId;
use tabula_common::config::TabletConfig;
use tabula_common::error::{StateError, TabulaError, TabulaResult};
use tabula_common::schema::TableSchema;
use tabula_common::security::Acl;
use tabula_common::{CellId, Key, TableId, TabletId};
use tabula_tablet::{ReadStats, TabletDescriptor, TabletSettings, TabletState, TabletStatistics};

use crate::options::{TableAttributes, TabletRange};

#[derive(Debug, Default)]
pub struct TabletCounters {
    dynamic_row_write_count: AtomicU64,
    dynamic_row_read_count: AtomicU64,
    dynamic_row_lookup_count: AtomicU64,
    static_chunk_row_read_count: AtomicU64,
    static_chunk_row_lookup_count: AtomicU64,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct PerformanceCounters {
    pub dynamic_row_write_count: u64,
    pub dynamic_row_read_count: u64,
    pub dynamic_row_lookup_count: u64,
    pub static_chunk_row_read_count: u64,
    pub static_chunk_row_lookup_count: u64,
}

impl TabletCounters {
    pub fn record_writes(&self, rows: usize) {
        self.dynamic_row_write_count.fetch_add(rows as u64, Ordering::Relaxed);
    }

    pub fn record_lookup(&self, keys: usize, stats: &ReadStats) {
        self.dynamic_row_lookup_count.fetch_add(keys as u64, Ordering::Relaxed);
        self.record_read(stats);
        self.static_chunk_row_lookup_count
            .fetch_add(stats.static_chunk_row_lookups, Ordering::Relaxed);
    }

    pub fn record_read(&self, stats: &ReadStats) {
        self.dynamic_row_read_count
            .fetch_add(stats.dynamic_row_reads, Ordering::Relaxed);
        self.static_chunk_row_read_count
            .fetch_add(stats.static_chunk_row_reads, Ordering::Relaxed);
    }

    pub fn snapshot(&self) -> PerformanceCounters {
        PerformanceCounters {
            dynamic_row_write_count: self.dynamic_row_write_count.load(Ordering::Relaxed),
            dynamic_row_read_count: self.dynamic_row_read_count.load(Ordering::Relaxed),
            dynamic_row_lookup_count: self.dynamic_row_lookup_count.load(Ordering::Relaxed),
            static_chunk_row_read_count: self.static_chunk_row_read_count.load(Ordering::Relaxed),
            static_chunk_row_lookup_count: self.static_chunk_row_lookup_count.load(Ordering::Relaxed),
        }
    }
}

#[derive(Debug, Clone)]
pub struct TabletRecord {
    pub id: TabletId,
    pub pivot_key: Key,
    pub state: TabletState,
    pub cell: Option<CellId>,
    pub counters: Arc<TabletCounters>,
}

impl TabletRecord {
    pub fn new(id: TabletId, pivot_key: Key) -> Self {
        Self {
            id,
            pivot_key,
            state: TabletState::Unmounted,
            cell: None,
            counters: Arc::new(TabletCounters::default()),
        }
    }

    pub fn is_readable(&self) -> bool {
        matches!(
            self.state,
            TabletState::Mounted | TabletState::Frozen | TabletState::Freezing | TabletState::Unfreezing
        )
    }

    pub fn invalid_state(&self, operation: &str) -> TabulaError {
        StateError::InvalidTabletState {
            tablet: self.id,
            state: self.state.name().to_string(),
            operation: operation.to_string(),
        }
        .into()
    }
}

/// Tablet as reported by `tablet_info`.
#[derive(Debug, Clone, Serialize)]
pub struct TabletInfo {
    pub index: usize,
    pub id: TabletId,
    pub pivot_key: Key,
    pub state: TabletState,
    pub cell: Option<CellId>,
    pub statistics: Option<TabletStatistics>,
    pub performance_counters: PerformanceCounters,
}

#[derive(Debug, Clone)]
pub struct TableRecord {
    pub id: TableId,
    pub path: String,
    pub schema: TableSchema,
    pub dynamic: bool,
    pub attributes: TableAttributes,
    pub bundle: String,
    pub acl: Acl,
    pub tablets: Vec<TabletRecord>,
    pub root: ChunkListId,
}

impl TableRecord {
    pub fn require_dynamic(&self) -> TabulaResult<()> {
        if self.dynamic {
            Ok(())
        } else {
            Err(StateError::NotDynamic(self.path.clone()).into())
        }
    }

    pub fn require_static(&self) -> TabulaResult<()> {
        if self.dynamic {
            Err(StateError::IsDynamic(self.path.clone()).into())
        } else {
            Ok(())
        }
    }

    pub fn next_pivot(&self, index: usize) -> Option<Key> {
        self.tablets.get(index + 1).map(|t| t.pivot_key.clone())
    }

    /// Index of the tablet whose range holds `key`.
    pub fn tablet_index_for(&self, key: &Key) -> usize {
        self.tablets
            .partition_point(|t| t.pivot_key <= *key)
            .saturating_sub(1)
    }

    pub fn tablet_index(&self, id: TabletId) -> Option<usize> {
        self.tablets.iter().position(|t| t.id == id)
    }

    pub fn all_in_state(&self, state: TabletState) -> bool {
        self.tablets.iter().all(|t| t.state == state)
    }

    pub fn resolve_range(&self, range: TabletRange) -> TabulaResult<(usize, usize)> {
        if self.tablets.is_empty() {
            return Err(TabulaError::argument(format!("table {} has no tablets", self.path)));
        }
        let first = range.first.unwrap_or(0);
        let last = range.last.unwrap_or(self.tablets.len() - 1);
        if first > last || last >= self.tablets.len() {
            return Err(TabulaError::argument(format!(
                "invalid tablet range [{first}, {last}] for table {} with {} tablets",
                self.path,
                self.tablets.len()
            )));
        }
        Ok((first, last))
    }

    pub fn tablet_settings(&self, config: &TabletConfig) -> TabletSettings {
        let a = &self.attributes;
        let mut settings = TabletSettings::from_config(config);
        if let Some(rows) = a.max_dynamic_store_row_count {
            settings.max_dynamic_store_row_count = rows;
        }
        if let Some(rows) = a.max_partition_row_count {
            settings.max_partition_row_count = rows;
        }
        if let Some(stores) = a.max_partition_store_count {
            settings.max_partition_store_count = stores;
        }
        settings.in_memory_mode = a.in_memory_mode;
        settings.enable_lookup_hash_table = a.enable_lookup_hash_table;
        settings.atomicity = a.atomicity;
        settings.optimized_for = a.optimized_for;
        settings.read_only = a.read_only;
        settings.chunk_params = a.replication.clone();
        settings
    }

    pub fn descriptor(&self, index: usize, config: &TabletConfig) -> TabletDescriptor {
        let tablet = &self.tablets[index];
        TabletDescriptor {
            id: tablet.id,
            table: self.id,
            schema: self.schema.clone(),
            pivot_key: tablet.pivot_key.clone(),
            next_pivot_key: self.next_pivot(index),
            settings: self.tablet_settings(config),
        }
    }

    pub fn pivot_keys(&self) -> Vec<Key> {
        self.tablets.iter().map(|t| t.pivot_key.clone()).collect()
    }
}

/// Check pivots replacing the tablets between `lower` (pivot of the first
/// replaced tablet) and `upper` (pivot of the first untouched tablet after
/// the range, if any).
pub fn validate_pivot_keys(schema: &TableSchema, pivots: &[Key], lower: &Key, upper: Option<&Key>) -> TabulaResult<()> {
    let Some(first) = pivots.first() else {
        return Err(TabulaError::pivot_keys("at least one pivot key is required"));
    };
    if first != lower {
        return Err(TabulaError::pivot_keys(if lower.is_empty() {
            format!("first pivot key must be the empty key, got {first}")
        } else {
            format!("first pivot key must be {lower}, got {first}")
        }));
    }
    for pivot in pivots {
        schema.check_key_types(pivot)?;
    }
    if let Some(pair) = pivots.windows(2).find(|w| w[0] >= w[1]) {
        return Err(TabulaError::pivot_keys(format!(
            "pivot keys must be strictly increasing: {} is followed by {}",
            pair[0], pair[1]
        )));
    }
    if let (Some(upper), Some(last)) = (upper, pivots.last()) {
        if last >= upper {
            return Err(TabulaError::pivot_keys(format!(
                "pivot key {last} overlaps the next tablet starting at {upper}"
            )));
        }
    }
    Ok(())
}

/// Up to `count - 1` evenly spaced split keys from sorted `keys`, strictly
/// above `lower`.
pub fn pick_split_keys(keys: &[Key], lower: &Key, count: usize) -> Vec<Key> {
    let mut pivots = vec![lower.clone()];
    if keys.is_empty() {
        return pivots;
    }
    for k in 1..count {
        let key = &keys[k * keys.len() / count];
        if pivots.last().map_or(true, |last| key > last) {
            pivots.push(key.clone());
        }
    }
    pivots
}

#[cfg(test)]
mod tests {
    use tabula_common::schema::{ColumnSchema, ColumnType};

    use super::*;

    fn schema() -> TableSchema {
        TableSchema::new(vec![
            ColumnSchema::new("key", ColumnType::Int64).key(),
            ColumnSchema::new("value", ColumnType::String),
        ])
    }

    fn k(v: i64) -> Key {
        Key::from(vec![v])
    }

    fn record(pivots: Vec<Key>) -> TableRecord {
        TableRecord {
            id: TableId(1),
            path: "//t".into(),
            schema: schema(),
            dynamic: true,
            attributes: TableAttributes::default(),
            bundle: "default".into(),
            acl: Acl::default(),
            tablets: pivots
                .into_iter()
                .enumerate()
                .map(|(i, p)| TabletRecord::new(TabletId(i as u64 + 1), p))
                .collect(),
            root: ChunkListId(0),
        }
    }

    #[test]
    fn test_whole_table_pivots_must_start_empty() {
        let s = schema();
        assert!(validate_pivot_keys(&s, &[Key::empty(), k(10), k(20)], &Key::empty(), None).is_ok());
        let err = validate_pivot_keys(&s, &[k(1), k(10)], &Key::empty(), None).unwrap_err();
        assert!(matches!(
            err,
            TabulaError::Validation(tabula_common::error::ValidationError::InvalidPivotKeys(_))
        ));
        assert!(validate_pivot_keys(&s, &[], &Key::empty(), None).is_err());
    }

    #[test]
    fn test_pivots_strictly_increasing() {
        let s = schema();
        assert!(validate_pivot_keys(&s, &[Key::empty(), k(10), k(10)], &Key::empty(), None).is_err());
        assert!(validate_pivot_keys(&s, &[Key::empty(), k(20), k(10)], &Key::empty(), None).is_err());
    }

    #[test]
    fn test_range_pivots_must_stay_inside() {
        let s = schema();
        assert!(validate_pivot_keys(&s, &[k(10), k(15)], &k(10), Some(&k(20))).is_ok());
        assert!(validate_pivot_keys(&s, &[k(10), k(20)], &k(10), Some(&k(20))).is_err());
        assert!(validate_pivot_keys(&s, &[k(11)], &k(10), Some(&k(20))).is_err());
    }

    #[test]
    fn test_pivot_types_and_width() {
        let s = schema();
        let wrong = Key::from(vec!["x"]);
        assert!(validate_pivot_keys(&s, &[Key::empty(), wrong], &Key::empty(), None).is_err());
        let wide = Key::from(vec![1i64, 2]);
        assert!(validate_pivot_keys(&s, &[Key::empty(), wide], &Key::empty(), None).is_err());
    }

    #[test]
    fn test_routing_by_pivot() {
        let table = record(vec![Key::empty(), k(10), k(20)]);
        assert_eq!(table.tablet_index_for(&k(-5)), 0);
        assert_eq!(table.tablet_index_for(&k(10)), 1);
        assert_eq!(table.tablet_index_for(&k(19)), 1);
        assert_eq!(table.tablet_index_for(&k(500)), 2);
        assert_eq!(table.next_pivot(1), Some(k(20)));
        assert_eq!(table.next_pivot(2), None);
    }

    #[test]
    fn test_resolve_range() {
        let table = record(vec![Key::empty(), k(10), k(20)]);
        assert_eq!(table.resolve_range(TabletRange::all()).unwrap(), (0, 2));
        assert_eq!(table.resolve_range(TabletRange::single(1)).unwrap(), (1, 1));
        assert!(table.resolve_range(TabletRange::new(2, 1)).is_err());
        assert!(table.resolve_range(TabletRange::new(0, 3)).is_err());
    }

    #[test]
    fn test_settings_follow_attributes() {
        let mut table = record(vec![Key::empty()]);
        table.attributes.read_only = true;
        table.attributes.max_dynamic_store_row_count = Some(10);
        let settings = table.tablet_settings(&TabletConfig::default());
        assert!(settings.read_only);
        assert_eq!(settings.max_dynamic_store_row_count, 10);
        let descriptor = table.descriptor(0, &TabletConfig::default());
        assert_eq!(descriptor.next_pivot_key, None);
    }

    #[test]
    fn test_pick_split_keys() {
        let keys: Vec<Key> = (0..10).map(k).collect();
        assert_eq!(pick_split_keys(&keys, &Key::empty(), 2), vec![Key::empty(), k(5)]);
        assert_eq!(pick_split_keys(&[], &Key::empty(), 4), vec![Key::empty()]);
        let dup = vec![k(1), k(1), k(1), k(1)];
        assert_eq!(pick_split_keys(&dup, &Key::empty(), 4), vec![Key::empty(), k(1)]);
    }

    #[test]
    fn test_counters() {
        let counters = TabletCounters::default();
        counters.record_writes(3);
        counters.record_lookup(
            2,
            &ReadStats {
                static_chunk_row_lookups: 1,
                static_chunk_row_reads: 1,
                dynamic_row_reads: 2,
            },
        );
        let snapshot = counters.snapshot();
        assert_eq!(snapshot.dynamic_row_write_count, 3);
        assert_eq!(snapshot.dynamic_row_lookup_count, 2);
        assert_eq!(snapshot.dynamic_row_read_count, 2);
        assert_eq!(snapshot.static_chunk_row_lookup_count, 1);
    }
}
