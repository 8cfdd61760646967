//! A mounted tablet: dynamic stores in eden, static stores leveled into
//! partitions, MVCC reads across all of them.

use std::collections::{BTreeMap, HashMap};
use std::fmt;
use std::sync::Arc;

use serde::{Deserialize, Serialize};
use serde_json::json;

use tabula_chunk::{ChunkStore, ReplicationParams};
use tabula_common::config::TabletConfig;
use tabula_common::datum::key_in_range;
use tabula_common::error::{TabulaError, TabulaResult};
use tabula_common::expression::Expression;
use tabula_common::schema::TableSchema;
use tabula_common::{
    Atomicity, ChunkId, InMemoryMode, Key, OptimizedFor, StoreId, TableId, TabletId, Timestamp,
    Value,
};

use crate::row::{RowModification, VersionedRow};
use crate::store::{DynamicStore, PreloadState, StaticStore, StaticStoreDescriptor, StoreRows};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum TabletState {
    #[default]
    Unmounted,
    Mounting,
    Mounted,
    Freezing,
    Frozen,
    Unfreezing,
    Unmounting,
}

impl TabletState {
    pub fn name(self) -> &'static str {
        match self {
            TabletState::Unmounted => "unmounted",
            TabletState::Mounting => "mounting",
            TabletState::Mounted => "mounted",
            TabletState::Freezing => "freezing",
            TabletState::Frozen => "frozen",
            TabletState::Unfreezing => "unfreezing",
            TabletState::Unmounting => "unmounting",
        }
    }

    /// Whether a peer hosts the tablet in this state.
    pub fn is_hosted(self) -> bool {
        !matches!(self, TabletState::Unmounted)
    }
}

impl fmt::Display for TabletState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

/// Per-tablet knobs, derived from table attributes and [`TabletConfig`].
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TabletSettings {
    pub max_dynamic_store_row_count: usize,
    pub max_dynamic_store_byte_size: usize,
    pub max_partition_row_count: usize,
    pub max_partition_store_count: usize,
    pub in_memory_mode: InMemoryMode,
    pub enable_lookup_hash_table: bool,
    pub atomicity: Atomicity,
    pub optimized_for: OptimizedFor,
    pub read_only: bool,
    /// Placement of chunks written by flush and compaction.
    pub chunk_params: ReplicationParams,
}

impl TabletSettings {
    pub fn from_config(config: &TabletConfig) -> Self {
        Self {
            max_dynamic_store_row_count: config.max_dynamic_store_row_count,
            max_dynamic_store_byte_size: config.max_dynamic_store_byte_size,
            max_partition_row_count: config.max_partition_row_count,
            max_partition_store_count: config.max_partition_store_count,
            in_memory_mode: InMemoryMode::None,
            enable_lookup_hash_table: false,
            atomicity: Atomicity::Full,
            optimized_for: OptimizedFor::Lookup,
            read_only: false,
            chunk_params: ReplicationParams::default(),
        }
    }
}

impl Default for TabletSettings {
    fn default() -> Self {
        Self::from_config(&TabletConfig::default())
    }
}

/// Everything needed to host a tablet on a cell.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TabletDescriptor {
    pub id: TabletId,
    pub table: TableId,
    pub schema: TableSchema,
    pub pivot_key: Key,
    pub next_pivot_key: Option<Key>,
    pub settings: TabletSettings,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Partition {
    pub pivot_key: Key,
    pub next_pivot_key: Option<Key>,
    pub stores: Vec<StaticStore>,
}

impl Partition {
    fn covers(&self, store: &StaticStore) -> bool {
        let d = &store.descriptor;
        key_in_range(&d.min_key, &self.pivot_key, self.next_pivot_key.as_ref())
            && key_in_range(&d.max_key, &self.pivot_key, self.next_pivot_key.as_ref())
    }

    pub fn row_count(&self) -> u64 {
        self.stores.iter().map(|s| s.descriptor.row_count).sum()
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ReadStats {
    /// Looked-up keys that had to consult static stores.
    pub static_chunk_row_lookups: u64,
    pub static_chunk_row_reads: u64,
    pub dynamic_row_reads: u64,
}

impl ReadStats {
    pub fn add(&mut self, other: ReadStats) {
        self.static_chunk_row_lookups += other.static_chunk_row_lookups;
        self.static_chunk_row_reads += other.static_chunk_row_reads;
        self.dynamic_row_reads += other.dynamic_row_reads;
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct TabletStatistics {
    pub unmerged_row_count: u64,
    pub uncompressed_data_size: u64,
    pub dynamic_row_count: u64,
    pub dynamic_store_count: u64,
    pub static_store_count: u64,
    pub eden_store_count: u64,
    pub partition_count: u64,
    pub preload_pending_store_count: u64,
    pub preload_completed_store_count: u64,
    pub preload_failed_store_count: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Tablet {
    pub id: TabletId,
    pub table: TableId,
    pub schema: TableSchema,
    pub pivot_key: Key,
    pub next_pivot_key: Option<Key>,
    pub state: TabletState,
    pub settings: TabletSettings,
    pub active_store: DynamicStore,
    pub passive_stores: Vec<DynamicStore>,
    /// Static stores spanning several partitions.
    pub eden: Vec<StaticStore>,
    pub partitions: Vec<Partition>,
}

/// Next deterministic store id of a slot.
pub fn allocate_store_id(counter: &mut u64) -> StoreId {
    *counter += 1;
    StoreId(*counter)
}

impl Tablet {
    pub fn new(descriptor: TabletDescriptor, active_store: StoreId) -> Self {
        let partition = Partition {
            pivot_key: descriptor.pivot_key.clone(),
            next_pivot_key: descriptor.next_pivot_key.clone(),
            stores: Vec::new(),
        };
        Self {
            id: descriptor.id,
            table: descriptor.table,
            schema: descriptor.schema,
            pivot_key: descriptor.pivot_key,
            next_pivot_key: descriptor.next_pivot_key,
            state: TabletState::Mounted,
            settings: descriptor.settings,
            active_store: DynamicStore::new(active_store),
            passive_stores: Vec::new(),
            eden: Vec::new(),
            partitions: vec![partition],
        }
    }

    pub fn key_width(&self) -> usize {
        self.schema.key_column_count()
    }

    pub fn contains_key(&self, key: &Key) -> bool {
        key_in_range(key, &self.pivot_key, self.next_pivot_key.as_ref())
    }

    fn initial_preload_state(&self) -> PreloadState {
        if self.settings.in_memory_mode.is_enabled() {
            PreloadState::Pending
        } else {
            PreloadState::Disabled
        }
    }

    // ── Store set ─────────────────────────────────────────────────────

    fn partition_index(&self, key: &Key) -> usize {
        self.partitions
            .partition_point(|p| p.pivot_key <= *key)
            .saturating_sub(1)
    }

    fn level(&mut self, store: StaticStore) {
        let index = self.partition_index(&store.descriptor.min_key);
        match self.partitions.get_mut(index) {
            Some(partition) if partition.covers(&store) => partition.stores.push(store),
            _ => self.eden.push(store),
        }
    }

    /// Register a flushed or compacted chunk as a static store.
    pub fn add_static_store(&mut self, id: StoreId, mut descriptor: StaticStoreDescriptor) {
        let width = self.key_width();
        descriptor.min_key = descriptor.min_key.padded(width);
        descriptor.max_key = descriptor.max_key.padded(width);
        let store = StaticStore::new(id, descriptor, self.initial_preload_state());
        self.level(store);
    }

    pub fn static_stores(&self) -> impl Iterator<Item = &StaticStore> {
        self.eden
            .iter()
            .chain(self.partitions.iter().flat_map(|p| p.stores.iter()))
    }

    pub fn static_stores_mut(&mut self) -> impl Iterator<Item = &mut StaticStore> {
        self.eden
            .iter_mut()
            .chain(self.partitions.iter_mut().flat_map(|p| p.stores.iter_mut()))
    }

    pub fn has_static_store(&self, id: StoreId) -> bool {
        self.static_stores().any(|s| s.id == id)
    }

    pub fn chunk_ids(&self) -> Vec<ChunkId> {
        self.static_stores().map(StaticStore::chunk_id).collect()
    }

    pub fn remove_static_stores(&mut self, ids: &[StoreId]) -> Vec<StaticStore> {
        let mut removed = Vec::new();
        let mut take = |stores: &mut Vec<StaticStore>| {
            let (gone, kept): (Vec<_>, Vec<_>) = stores.drain(..).partition(|s| ids.contains(&s.id));
            *stores = kept;
            removed.extend(gone);
        };
        take(&mut self.eden);
        for partition in &mut self.partitions {
            take(&mut partition.stores);
        }
        removed
    }

    /// Split the partition starting at `pivot` at the given keys, re-leveling
    /// its stores. Keys outside the partition are ignored.
    pub fn split_partition(&mut self, pivot: &Key, split_keys: &[Key]) {
        let Some(index) = self.partitions.iter().position(|p| p.pivot_key == *pivot) else {
            return;
        };
        let old = self.partitions.remove(index);
        let mut bounds: Vec<Key> = split_keys
            .iter()
            .filter(|k| **k > old.pivot_key && old.next_pivot_key.as_ref().map_or(true, |n| *k < n))
            .cloned()
            .collect();
        bounds.sort();
        bounds.dedup();
        let mut pivots = vec![old.pivot_key.clone()];
        pivots.extend(bounds);
        let mut fresh = Vec::with_capacity(pivots.len());
        for (i, pivot_key) in pivots.iter().enumerate() {
            fresh.push(Partition {
                pivot_key: pivot_key.clone(),
                next_pivot_key: pivots.get(i + 1).cloned().or_else(|| old.next_pivot_key.clone()),
                stores: Vec::new(),
            });
        }
        let count = fresh.len();
        for (offset, partition) in fresh.into_iter().enumerate() {
            self.partitions.insert(index + offset, partition);
        }
        for store in old.stores {
            self.level(store);
        }
        tracing::debug!(tablet = %self.id, partitions = count, "partition split");
    }

    pub fn passive_store(&self, id: StoreId) -> Option<&DynamicStore> {
        self.passive_stores.iter().find(|s| s.id == id)
    }

    pub fn take_passive_store(&mut self, id: StoreId) -> Option<DynamicStore> {
        let pos = self.passive_stores.iter().position(|s| s.id == id)?;
        Some(self.passive_stores.remove(pos))
    }

    pub fn dynamic_row_count(&self) -> usize {
        self.active_store.row_count() + self.passive_stores.iter().map(DynamicStore::row_count).sum::<usize>()
    }

    pub fn needs_rotation(&self) -> bool {
        self.active_store.row_count() >= self.settings.max_dynamic_store_row_count
            || self.active_store.data_size() >= self.settings.max_dynamic_store_byte_size
    }

    /// Freeze the active store and start a fresh one. An empty active store
    /// is kept as is.
    pub fn rotate(&mut self, fresh: StoreId) -> bool {
        if self.active_store.is_empty() {
            return false;
        }
        let mut frozen = std::mem::replace(&mut self.active_store, DynamicStore::new(fresh));
        frozen.freeze();
        tracing::debug!(
            tablet = %self.id,
            store = %frozen.id,
            rows = frozen.row_count(),
            bytes = frozen.data_size(),
            "dynamic store rotated"
        );
        self.passive_stores.push(frozen);
        true
    }

    // ── Writes ────────────────────────────────────────────────────────

    pub fn check_write_allowed(&self, batch_size: usize) -> TabulaResult<()> {
        if self.state != TabletState::Mounted {
            return Err(tabula_common::error::StateError::InvalidTabletState {
                tablet: self.id,
                state: self.state.name().to_string(),
                operation: "write".to_string(),
            }
            .into());
        }
        if self.settings.read_only {
            return Err(tabula_common::error::StateError::ReadOnly(self.table.to_string()).into());
        }
        if self.settings.enable_lookup_hash_table && batch_size > self.settings.max_dynamic_store_row_count {
            return Err(TabulaError::argument(format!(
                "write batch of {batch_size} rows does not fit into one dynamic store of {} (capacity {})",
                self.id, self.settings.max_dynamic_store_row_count
            )));
        }
        Ok(())
    }

    /// Apply a committed batch, rotating the active store around it when it
    /// reaches its bound.
    pub fn write(&mut self, ts: Timestamp, modifications: &[RowModification], store_counter: &mut u64) {
        if !self.active_store.is_empty()
            && self.active_store.row_count() + modifications.len() > self.settings.max_dynamic_store_row_count
        {
            let fresh = allocate_store_id(store_counter);
            self.rotate(fresh);
        }
        for modification in modifications {
            self.active_store.apply(ts, modification);
        }
        if self.needs_rotation() {
            let fresh = allocate_store_id(store_counter);
            self.rotate(fresh);
        }
    }

    // ── Settings and preload ──────────────────────────────────────────

    /// Apply remounted settings; preload states follow the in-memory mode.
    pub fn apply_settings(&mut self, settings: TabletSettings) {
        let was_enabled = self.settings.in_memory_mode.is_enabled();
        let hash_changed = settings.enable_lookup_hash_table != self.settings.enable_lookup_hash_table;
        self.settings = settings;
        let enabled = self.settings.in_memory_mode.is_enabled();
        for store in self.static_stores_mut() {
            if !enabled {
                store.drop_preloaded();
                store.preload_state = PreloadState::Disabled;
            } else if !was_enabled
                || hash_changed
                || matches!(
                    store.preload_state,
                    PreloadState::Disabled | PreloadState::None | PreloadState::Failed
                )
            {
                store.drop_preloaded();
                store.preload_state = PreloadState::Pending;
            }
        }
    }

    /// After recovery no store holds preloaded rows.
    pub fn reset_preload(&mut self) {
        for store in self.static_stores_mut() {
            if store.preload_state != PreloadState::Disabled {
                store.drop_preloaded();
                store.preload_state = PreloadState::Pending;
            }
        }
    }

    /// Preload every pending store. Returns (completed, failed).
    pub fn preload_pending(&mut self, chunks: &dyn ChunkStore) -> (usize, usize) {
        let width = self.key_width();
        let with_index = self.settings.enable_lookup_hash_table;
        let tablet = self.id;
        let (mut completed, mut failed) = (0, 0);
        for store in self.static_stores_mut() {
            if store.preload_state != PreloadState::Pending {
                continue;
            }
            store.preload_state = PreloadState::Running;
            let loaded = chunks
                .read_chunk(store.chunk_id())
                .and_then(|records| crate::store::decode_store_rows(&records, width));
            match loaded {
                Ok(rows) => {
                    store.set_preloaded(Arc::new(StoreRows::new(rows, with_index)));
                    completed += 1;
                }
                Err(e) => {
                    tracing::warn!(tablet = %tablet, store = %store.id, error = %e, "store preload failed");
                    store.preload_state = PreloadState::Failed;
                    failed += 1;
                }
            }
        }
        (completed, failed)
    }

    // ── Reads ─────────────────────────────────────────────────────────

    fn store_rows(
        store: &StaticStore,
        cache: &mut HashMap<StoreId, Arc<StoreRows>>,
        chunks: &dyn ChunkStore,
        width: usize,
    ) -> TabulaResult<Arc<StoreRows>> {
        if let Some(rows) = cache.get(&store.id) {
            return Ok(rows.clone());
        }
        let rows = store.load_rows(chunks, width)?;
        cache.insert(store.id, rows.clone());
        Ok(rows)
    }

    fn dynamic_stores(&self) -> impl Iterator<Item = &DynamicStore> {
        std::iter::once(&self.active_store).chain(self.passive_stores.iter())
    }

    /// Point lookups; result positions match `keys`.
    pub fn lookup(
        &self,
        keys: &[Key],
        ts: Timestamp,
        chunks: &dyn ChunkStore,
    ) -> TabulaResult<(Vec<Option<Vec<Value>>>, ReadStats)> {
        let width = self.key_width();
        let mut cache = HashMap::new();
        let mut stats = ReadStats::default();
        let mut result = Vec::with_capacity(keys.len());
        for key in keys {
            let key = key.padded(width);
            let mut merged = VersionedRow::default();
            for store in self.dynamic_stores() {
                if let Some(row) = store.get(&key) {
                    merged.merge_from(row);
                    stats.dynamic_row_reads += 1;
                }
            }
            let partition = &self.partitions[self.partition_index(&key)];
            let mut consulted = false;
            for store in self.eden.iter().chain(partition.stores.iter()) {
                if !store.may_contain(&key) {
                    continue;
                }
                consulted = true;
                let rows = Self::store_rows(store, &mut cache, chunks, width)?;
                if let Some(row) = rows.get(&key) {
                    merged.merge_from(row);
                    stats.static_chunk_row_reads += 1;
                }
            }
            if consulted {
                stats.static_chunk_row_lookups += 1;
            }
            result.push(merged.read(&key, &self.schema, ts));
        }
        Ok((result, stats))
    }

    /// Every row visible at `ts` in key order, filtered by `predicate`.
    pub fn scan(
        &self,
        ts: Timestamp,
        predicate: Option<&Expression>,
        chunks: &dyn ChunkStore,
    ) -> TabulaResult<(Vec<Vec<Value>>, ReadStats)> {
        let width = self.key_width();
        let mut stats = ReadStats::default();
        let mut merged: BTreeMap<Key, VersionedRow> = BTreeMap::new();
        for store in self.dynamic_stores() {
            for (key, row) in store.rows() {
                merged.entry(key.clone()).or_default().merge_from(row);
                stats.dynamic_row_reads += 1;
            }
        }
        for store in self.static_stores() {
            let rows = store.load_rows(chunks, width)?;
            for (key, row) in rows.rows() {
                merged.entry(key.clone()).or_default().merge_from(row);
                stats.static_chunk_row_reads += 1;
            }
        }
        let mut out = Vec::new();
        for (key, row) in &merged {
            if !self.contains_key(key) {
                continue;
            }
            let Some(values) = row.read(key, &self.schema, ts) else {
                continue;
            };
            if let Some(predicate) = predicate {
                if !predicate.matches(&values)? {
                    continue;
                }
            }
            out.push(values);
        }
        Ok((out, stats))
    }

    // ── Introspection ─────────────────────────────────────────────────

    pub fn statistics(&self) -> TabletStatistics {
        let mut stats = TabletStatistics {
            dynamic_store_count: 1 + self.passive_stores.len() as u64,
            eden_store_count: 1 + self.passive_stores.len() as u64 + self.eden.len() as u64,
            partition_count: self.partitions.len() as u64,
            dynamic_row_count: self.dynamic_row_count() as u64,
            ..Default::default()
        };
        for store in self.dynamic_stores() {
            stats.unmerged_row_count += store.row_count() as u64;
            stats.uncompressed_data_size += store.data_size() as u64;
        }
        for store in self.static_stores() {
            stats.static_store_count += 1;
            stats.unmerged_row_count += store.descriptor.row_count;
            stats.uncompressed_data_size += store.descriptor.data_size;
            match store.preload_state {
                PreloadState::Pending | PreloadState::Running => stats.preload_pending_store_count += 1,
                PreloadState::Complete => stats.preload_completed_store_count += 1,
                PreloadState::Failed => stats.preload_failed_store_count += 1,
                PreloadState::Disabled | PreloadState::None => {}
            }
        }
        stats
    }

    /// Store structure as JSON.
    pub fn orchid(&self) -> serde_json::Value {
        let static_store = |s: &StaticStore| {
            json!({
                "store_state": "persistent",
                "preload_state": s.preload_state.name(),
                "lookup_hash_table": s.preloaded().map_or(false, |rows| rows.has_hash_index()),
                "chunk_id": s.chunk_id().to_string(),
                "row_count": s.descriptor.row_count,
                "min_key": s.descriptor.min_key.to_string(),
                "max_key": s.descriptor.max_key.to_string(),
            })
        };
        let mut eden = serde_json::Map::new();
        for store in self.dynamic_stores() {
            eden.insert(
                store.id.to_string(),
                json!({
                    "store_state": store.state.name(),
                    "row_count": store.row_count(),
                    "data_size": store.data_size(),
                }),
            );
        }
        for store in &self.eden {
            eden.insert(store.id.to_string(), static_store(store));
        }
        let partitions: Vec<serde_json::Value> = self
            .partitions
            .iter()
            .map(|p| {
                let stores: serde_json::Map<String, serde_json::Value> = p
                    .stores
                    .iter()
                    .map(|s| (s.id.to_string(), static_store(s)))
                    .collect();
                json!({
                    "pivot_key": p.pivot_key.to_string(),
                    "next_pivot_key": p.next_pivot_key.as_ref().map(ToString::to_string),
                    "stores": stores,
                })
            })
            .collect();
        json!({
            "tablet_id": self.id.to_string(),
            "state": self.state.name(),
            "pivot_key": self.pivot_key.to_string(),
            "next_pivot_key": self.next_pivot_key.as_ref().map(ToString::to_string),
            "eden": { "stores": eden },
            "partitions": partitions,
        })
    }
}
