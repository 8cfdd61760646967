//! Dynamic (in-memory, mutable) and static (chunk-backed) stores.

use std::collections::{BTreeMap, HashMap};
use std::fmt;
use std::ops::Bound;
use std::sync::Arc;

use serde::{Deserialize, Serialize};
use xxhash_rust::xxh64::xxh64;

use tabula_chunk::ChunkStore;
use tabula_common::error::{TabulaError, TabulaResult};
use tabula_common::{ChunkId, Key, StoreId, Timestamp};

use crate::row::{RowModification, VersionedRow};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StoreState {
    /// Accepts writes.
    ActiveDynamic,
    /// Frozen, waiting for flush.
    PassiveDynamic,
    Persistent,
}

impl StoreState {
    pub fn name(self) -> &'static str {
        match self {
            StoreState::ActiveDynamic => "active_dynamic",
            StoreState::PassiveDynamic => "passive_dynamic",
            StoreState::Persistent => "persistent",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PreloadState {
    /// In-memory mode is off for the tablet.
    Disabled,
    None,
    Pending,
    Running,
    Complete,
    Failed,
}

impl PreloadState {
    pub fn name(self) -> &'static str {
        match self {
            PreloadState::Disabled => "disabled",
            PreloadState::None => "none",
            PreloadState::Pending => "pending",
            PreloadState::Running => "running",
            PreloadState::Complete => "complete",
            PreloadState::Failed => "failed",
        }
    }
}

impl fmt::Display for PreloadState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

// ── Dynamic store ─────────────────────────────────────────────────────

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DynamicStore {
    pub id: StoreId,
    pub state: StoreState,
    rows: BTreeMap<Key, VersionedRow>,
    data_size: usize,
}

impl DynamicStore {
    pub fn new(id: StoreId) -> Self {
        Self {
            id,
            state: StoreState::ActiveDynamic,
            rows: BTreeMap::new(),
            data_size: 0,
        }
    }

    pub fn row_count(&self) -> usize {
        self.rows.len()
    }

    pub fn data_size(&self) -> usize {
        self.data_size
    }

    pub fn is_empty(&self) -> bool {
        self.rows.is_empty()
    }

    pub fn get(&self, key: &Key) -> Option<&VersionedRow> {
        self.rows.get(key)
    }

    pub fn rows(&self) -> impl Iterator<Item = (&Key, &VersionedRow)> {
        self.rows.iter()
    }

    pub fn range<'a>(
        &'a self,
        lower: &Key,
        upper: Option<&Key>,
    ) -> impl Iterator<Item = (&'a Key, &'a VersionedRow)> {
        let upper = upper.map_or(Bound::Unbounded, |u| Bound::Excluded(u.clone()));
        self.rows.range((Bound::Included(lower.clone()), upper))
    }

    pub fn apply(&mut self, ts: Timestamp, modification: &RowModification) {
        let key = modification.key();
        let row = self.rows.entry(key.clone()).or_default();
        let before = row.approx_bytes();
        match modification {
            RowModification::Write { columns, .. } => row.apply_write(ts, columns),
            RowModification::Delete { .. } => row.apply_delete(ts),
        }
        let after = row.approx_bytes();
        if before == 0 {
            self.data_size += key.approx_bytes();
        }
        self.data_size = (self.data_size + after).saturating_sub(before);
    }

    pub fn freeze(&mut self) {
        self.state = StoreState::PassiveDynamic;
    }
}

// ── Static store ──────────────────────────────────────────────────────

/// What a tablet needs to know about a persisted chunk.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StaticStoreDescriptor {
    pub chunk_id: ChunkId,
    pub min_key: Key,
    pub max_key: Key,
    pub row_count: u64,
    pub data_size: u64,
}

/// Decoded rows of a static store, optionally hash-indexed by key.
#[derive(Debug)]
pub struct StoreRows {
    rows: Vec<(Key, VersionedRow)>,
    hash_index: Option<HashMap<u64, Vec<u32>>>,
}

fn key_hash(key: &Key) -> u64 {
    xxh64(&key.encode(), 0)
}

impl StoreRows {
    pub fn new(rows: Vec<(Key, VersionedRow)>, with_hash_index: bool) -> Self {
        let hash_index = with_hash_index.then(|| {
            let mut index: HashMap<u64, Vec<u32>> = HashMap::with_capacity(rows.len());
            for (i, (key, _)) in rows.iter().enumerate() {
                index.entry(key_hash(key)).or_default().push(i as u32);
            }
            index
        });
        Self { rows, hash_index }
    }

    pub fn len(&self) -> usize {
        self.rows.len()
    }

    pub fn is_empty(&self) -> bool {
        self.rows.is_empty()
    }

    pub fn has_hash_index(&self) -> bool {
        self.hash_index.is_some()
    }

    pub fn rows(&self) -> &[(Key, VersionedRow)] {
        &self.rows
    }

    pub fn get(&self, key: &Key) -> Option<&VersionedRow> {
        match &self.hash_index {
            Some(index) => index
                .get(&key_hash(key))?
                .iter()
                .map(|&i| &self.rows[i as usize])
                .find(|(k, _)| k == key)
                .map(|(_, row)| row),
            None => self
                .rows
                .binary_search_by(|(k, _)| k.cmp(key))
                .ok()
                .map(|i| &self.rows[i].1),
        }
    }
}

/// Chunk records of a table store: one bincode-encoded `(key, row)` each.
pub fn encode_store_rows<'a>(
    rows: impl Iterator<Item = (&'a Key, &'a VersionedRow)>,
) -> TabulaResult<Vec<Vec<u8>>> {
    rows.map(|entry| bincode::serialize(&entry).map_err(TabulaError::from))
        .collect()
}

/// Decode chunk records, padding keys written before a key extension.
pub fn decode_store_rows(records: &[Vec<u8>], key_width: usize) -> TabulaResult<Vec<(Key, VersionedRow)>> {
    records
        .iter()
        .map(|record| {
            bincode::deserialize::<(Key, VersionedRow)>(record)
                .map(|(key, row)| (key.padded(key_width), row))
                .map_err(TabulaError::from)
        })
        .collect()
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StaticStore {
    pub id: StoreId,
    pub descriptor: StaticStoreDescriptor,
    pub preload_state: PreloadState,
    #[serde(skip)]
    preloaded: Option<Arc<StoreRows>>,
}

impl StaticStore {
    pub fn new(id: StoreId, descriptor: StaticStoreDescriptor, preload_state: PreloadState) -> Self {
        Self {
            id,
            descriptor,
            preload_state,
            preloaded: None,
        }
    }

    pub fn chunk_id(&self) -> ChunkId {
        self.descriptor.chunk_id
    }

    pub fn may_contain(&self, key: &Key) -> bool {
        *key >= self.descriptor.min_key && *key <= self.descriptor.max_key
    }

    pub fn overlaps(&self, lower: &Key, upper: Option<&Key>) -> bool {
        self.descriptor.max_key >= *lower && upper.map_or(true, |u| self.descriptor.min_key < *u)
    }

    pub fn preloaded(&self) -> Option<&Arc<StoreRows>> {
        self.preloaded.as_ref()
    }

    pub fn set_preloaded(&mut self, rows: Arc<StoreRows>) {
        self.preloaded = Some(rows);
        self.preload_state = PreloadState::Complete;
    }

    pub fn drop_preloaded(&mut self) {
        self.preloaded = None;
    }

    /// Rows of this store: preloaded ones when present, otherwise read from
    /// the chunk.
    pub fn load_rows(&self, chunks: &dyn ChunkStore, key_width: usize) -> TabulaResult<Arc<StoreRows>> {
        if let Some(rows) = &self.preloaded {
            return Ok(rows.clone());
        }
        let records = chunks.read_chunk(self.descriptor.chunk_id)?;
        Ok(Arc::new(StoreRows::new(decode_store_rows(&records, key_width)?, false)))
    }
}
