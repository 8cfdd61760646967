//! Leader-side background work of a tablet cell: store flush, compaction and
//! preload. Chunk writes happen outside the changelog; their results are
//! committed as mutations so every peer sees the same store set.

use std::collections::BTreeMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use tabula_chunk::{ChunkKind, ChunkManager, ChunkStore, ReplicationParams};
use tabula_common::datum::key_in_range;
use tabula_common::error::TabulaResult;
use tabula_common::{ChunkId, Key, StoreId, TabletId, Timestamp};
use tabula_hydra::Cell;

use crate::row::VersionedRow;
use crate::slot::{MutationOutcome, TabletMutation, TabletSlot};
use crate::store::{decode_store_rows, encode_store_rows, StaticStoreDescriptor};

/// Change of a tablet's chunk set, to be mirrored into the table's chunk tree.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct StoreUpdate {
    pub tablet: TabletId,
    pub added: Vec<ChunkId>,
    pub removed: Vec<ChunkId>,
}

#[derive(Debug, Default)]
pub struct HostMetrics {
    pub flushes: AtomicU64,
    pub compactions: AtomicU64,
    pub partition_splits: AtomicU64,
    pub preloads_completed: AtomicU64,
    pub preloads_failed: AtomicU64,
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct HostMetricsSnapshot {
    pub flushes: u64,
    pub compactions: u64,
    pub partition_splits: u64,
    pub preloads_completed: u64,
    pub preloads_failed: u64,
}

struct FlushTask {
    store: StoreId,
    records: Vec<Vec<u8>>,
    boundary: Option<(Key, Key)>,
    row_count: u64,
    data_size: u64,
}

struct CompactionTask {
    /// Pivot of the partition compacted; `None` for eden.
    partition: Option<Key>,
    stores: Vec<(StoreId, ChunkId)>,
    /// Output boundaries: eden output is cut at partition pivots.
    cut_points: Vec<Key>,
}

pub struct TabletCellHost {
    cell: Arc<Cell<TabletSlot>>,
    chunks: Arc<ChunkManager>,
    metrics: HostMetrics,
}

fn descriptor_for(
    chunk_id: ChunkId,
    rows: &[(Key, VersionedRow)],
) -> Option<StaticStoreDescriptor> {
    let (first, last) = (rows.first()?, rows.last()?);
    Some(StaticStoreDescriptor {
        chunk_id,
        min_key: first.0.clone(),
        max_key: last.0.clone(),
        row_count: rows.len() as u64,
        data_size: rows.iter().map(|(k, r)| (k.approx_bytes() + r.approx_bytes()) as u64).sum(),
    })
}

impl TabletCellHost {
    pub fn new(cell: Arc<Cell<TabletSlot>>, chunks: Arc<ChunkManager>) -> Self {
        Self {
            cell,
            chunks,
            metrics: HostMetrics::default(),
        }
    }

    pub fn cell(&self) -> &Arc<Cell<TabletSlot>> {
        &self.cell
    }

    pub fn metrics(&self) -> HostMetricsSnapshot {
        let m = &self.metrics;
        HostMetricsSnapshot {
            flushes: m.flushes.load(Ordering::Relaxed),
            compactions: m.compactions.load(Ordering::Relaxed),
            partition_splits: m.partition_splits.load(Ordering::Relaxed),
            preloads_completed: m.preloads_completed.load(Ordering::Relaxed),
            preloads_failed: m.preloads_failed.load(Ordering::Relaxed),
        }
    }

    fn write_rows(&self, params: &ReplicationParams, rows: &[(Key, VersionedRow)]) -> TabulaResult<Option<StaticStoreDescriptor>> {
        if rows.is_empty() {
            return Ok(None);
        }
        let records = encode_store_rows(rows.iter().map(|(k, r)| (k, r)))?;
        let boundary = Some((rows[0].0.clone(), rows[rows.len() - 1].0.clone()));
        let chunk_id = self
            .chunks
            .write_chunk(ChunkKind::Table, params, records, boundary)?;
        Ok(descriptor_for(chunk_id, rows))
    }

    /// Commit a mutation that references freshly written chunks; the chunks
    /// are dropped again when the commit fails.
    fn commit_with_chunks(&self, mutation: TabletMutation, written: &[ChunkId]) -> TabulaResult<MutationOutcome> {
        self.cell.commit(mutation).map_err(|e| {
            for chunk in written {
                self.chunks.remove_chunk(*chunk);
            }
            e
        })
    }

    // ── Flush ─────────────────────────────────────────────────────────

    /// Write every passive dynamic store of `tablet` to a chunk.
    pub fn flush_tablet(&self, tablet: TabletId) -> TabulaResult<StoreUpdate> {
        let (params, tasks) = self.cell.with_leader(|slot| -> TabulaResult<_> {
            let t = slot.tablet(tablet)?;
            let tasks = t
                .passive_stores
                .iter()
                .map(|store| {
                    let rows: Vec<(&Key, &VersionedRow)> = store.rows().collect();
                    let boundary = rows
                        .first()
                        .zip(rows.last())
                        .map(|(f, l)| (f.0.clone(), l.0.clone()));
                    Ok(FlushTask {
                        store: store.id,
                        records: encode_store_rows(rows.into_iter())?,
                        boundary,
                        row_count: store.row_count() as u64,
                        data_size: store.data_size() as u64,
                    })
                })
                .collect::<TabulaResult<Vec<_>>>()?;
            Ok((t.settings.chunk_params.clone(), tasks))
        })??;

        let mut update = StoreUpdate {
            tablet,
            ..Default::default()
        };
        for task in tasks {
            let chunk = match task.boundary {
                Some((min_key, max_key)) => {
                    let chunk_id = self.chunks.write_chunk(
                        ChunkKind::Table,
                        &params,
                        task.records,
                        Some((min_key.clone(), max_key.clone())),
                    )?;
                    Some(StaticStoreDescriptor {
                        chunk_id,
                        min_key,
                        max_key,
                        row_count: task.row_count,
                        data_size: task.data_size,
                    })
                }
                None => None,
            };
            let written: Vec<ChunkId> = chunk.iter().map(|c| c.chunk_id).collect();
            self.commit_with_chunks(
                TabletMutation::CommitFlush {
                    tablet,
                    store: task.store,
                    chunk,
                },
                &written,
            )?;
            self.metrics.flushes.fetch_add(1, Ordering::Relaxed);
            tracing::debug!(cell = %self.cell.id(), tablet = %tablet, store = %task.store, chunks = ?written, "flush committed");
            update.added.extend(written);
        }
        Ok(update)
    }

    /// Rotate the active store and flush everything dynamic.
    pub fn rotate_and_flush(&self, tablet: TabletId) -> TabulaResult<StoreUpdate> {
        self.cell.commit(TabletMutation::RotateStore { tablet })?;
        self.flush_tablet(tablet)
    }

    fn tablets_with_passive_stores(&self) -> TabulaResult<Vec<TabletId>> {
        self.cell.with_leader(|slot| {
            slot.tablets()
                .filter(|t| !t.passive_stores.is_empty())
                .map(|t| t.id)
                .collect()
        })
    }

    // ── Compaction ────────────────────────────────────────────────────

    fn compaction_tasks(&self, tablet: TabletId, force: bool) -> TabulaResult<(Vec<CompactionTask>, ReplicationParams, usize)> {
        self.cell.with_leader(|slot| -> TabulaResult<_> {
            let t = slot.tablet(tablet)?;
            let mut tasks = Vec::new();
            if !t.eden.is_empty() {
                tasks.push(CompactionTask {
                    partition: None,
                    stores: t.eden.iter().map(|s| (s.id, s.chunk_id())).collect(),
                    cut_points: t.partitions.iter().skip(1).map(|p| p.pivot_key.clone()).collect(),
                });
            }
            for partition in &t.partitions {
                let crowded = partition.stores.len() > t.settings.max_partition_store_count;
                let oversized = partition.stores.len() > 1
                    && partition.row_count() > t.settings.max_partition_row_count as u64;
                if partition.stores.is_empty() || !(crowded || oversized || force) {
                    continue;
                }
                tasks.push(CompactionTask {
                    partition: Some(partition.pivot_key.clone()),
                    stores: partition.stores.iter().map(|s| (s.id, s.chunk_id())).collect(),
                    cut_points: Vec::new(),
                });
            }
            Ok((tasks, t.settings.chunk_params.clone(), t.settings.max_partition_row_count))
        })?
    }

    fn read_merged(&self, tablet: TabletId, stores: &[(StoreId, ChunkId)]) -> TabulaResult<BTreeMap<Key, VersionedRow>> {
        let width = self.cell.with_leader(|slot| slot.tablet(tablet).map(|t| t.key_width()))??;
        let mut merged: BTreeMap<Key, VersionedRow> = BTreeMap::new();
        for (_, chunk) in stores {
            let records = self.chunks.read_chunk(*chunk)?;
            for (key, row) in decode_store_rows(&records, width)? {
                merged.entry(key).or_default().merge_from(&row);
            }
        }
        Ok(merged)
    }

    /// Merge partition stores, collapsing versions at or below `retention`.
    pub fn compact_tablet(&self, tablet: TabletId, retention: Timestamp, force: bool) -> TabulaResult<StoreUpdate> {
        let (tasks, params, max_partition_rows) = self.compaction_tasks(tablet, force)?;
        let (schema, pivot_key, next_pivot_key) = self.cell.with_leader(|slot| {
            slot.tablet(tablet)
                .map(|t| (t.schema.clone(), t.pivot_key.clone(), t.next_pivot_key.clone()))
        })??;
        let mut update = StoreUpdate {
            tablet,
            ..Default::default()
        };
        for task in tasks {
            let merged = self.read_merged(tablet, &task.stores)?;
            // Stores shared with a sibling after a sliced reshard carry rows
            // outside this tablet; they are dropped here.
            let rows: Vec<(Key, VersionedRow)> = merged
                .into_iter()
                .filter(|(key, _)| key_in_range(key, &pivot_key, next_pivot_key.as_ref()))
                .filter_map(|(key, row)| row.compact(retention, &schema).map(|r| (key, r)))
                .collect();

            let mut pieces: Vec<&[(Key, VersionedRow)]> = Vec::new();
            let mut split = None;
            match &task.partition {
                None => {
                    let mut rest = rows.as_slice();
                    for cut in &task.cut_points {
                        let at = rest.partition_point(|(k, _)| k < cut);
                        pieces.push(&rest[..at]);
                        rest = &rest[at..];
                    }
                    pieces.push(rest);
                }
                Some(pivot) if rows.len() > max_partition_rows && rows.len() >= 2 => {
                    let mid = rows.len() / 2;
                    split = Some((pivot.clone(), vec![rows[mid].0.clone()]));
                    pieces.push(&rows[..mid]);
                    pieces.push(&rows[mid..]);
                }
                Some(_) => pieces.push(&rows),
            }

            let mut added = Vec::new();
            for piece in pieces {
                match self.write_rows(&params, piece) {
                    Ok(Some(descriptor)) => added.push(descriptor),
                    Ok(None) => {}
                    Err(e) => {
                        for d in &added {
                            self.chunks.remove_chunk(d.chunk_id);
                        }
                        return Err(e);
                    }
                }
            }
            let written: Vec<ChunkId> = added.iter().map(|d| d.chunk_id).collect();
            let split_happened = split.is_some();
            self.commit_with_chunks(
                TabletMutation::CommitCompaction {
                    tablet,
                    removed: task.stores.iter().map(|(id, _)| *id).collect(),
                    added,
                    split,
                },
                &written,
            )?;
            self.metrics.compactions.fetch_add(1, Ordering::Relaxed);
            if split_happened {
                self.metrics.partition_splits.fetch_add(1, Ordering::Relaxed);
            }
            tracing::debug!(
                cell = %self.cell.id(),
                tablet = %tablet,
                inputs = task.stores.len(),
                outputs = written.len(),
                eden = task.partition.is_none(),
                "compaction finished"
            );
            update.removed.extend(task.stores.iter().map(|(_, c)| *c));
            update.added.extend(written);
        }
        Ok(update)
    }

    // ── Preload ───────────────────────────────────────────────────────

    /// Preload pending stores on every peer.
    pub fn run_preload(&self) {
        self.cell.for_each_peer(|peer, _, slot| {
            let (completed, failed) = slot.preload_pending();
            if completed + failed > 0 {
                tracing::debug!(cell = %self.cell.id(), peer, completed, failed, "stores preloaded");
            }
            self.metrics
                .preloads_completed
                .fetch_add(completed as u64, Ordering::Relaxed);
            self.metrics
                .preloads_failed
                .fetch_add(failed as u64, Ordering::Relaxed);
        });
    }

    /// One background pass: flush rotated stores, compact crowded
    /// partitions, preload in-memory stores. Failures are logged and retried
    /// on the next pass.
    pub fn run_background(&self, retention: Timestamp) -> Vec<StoreUpdate> {
        let mut updates = Vec::new();
        let Ok(tablets) = self.tablets_with_passive_stores() else {
            return updates;
        };
        for tablet in tablets {
            match self.flush_tablet(tablet) {
                Ok(update) => updates.push(update),
                Err(e) => tracing::warn!(cell = %self.cell.id(), tablet = %tablet, error = %e, "store flush failed"),
            }
        }
        let all: Vec<TabletId> = self
            .cell
            .with_leader(|slot| slot.tablets().map(|t| t.id).collect())
            .unwrap_or_default();
        for tablet in all {
            match self.compact_tablet(tablet, retention, false) {
                Ok(update) if !update.added.is_empty() || !update.removed.is_empty() => updates.push(update),
                Ok(_) => {}
                Err(e) => tracing::warn!(cell = %self.cell.id(), tablet = %tablet, error = %e, "compaction failed"),
            }
        }
        self.run_preload();
        updates
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use tabula_chunk::NodeDirectory;
    use tabula_common::config::{ConfigHandle, TabletManagerConfig};
    use tabula_common::{CellId, InMemoryMode, Medium, Value};

    use crate::row::{ColumnWrite, RowModification};
    use crate::store::PreloadState;
    use crate::tablet::tests::descriptor;

    use super::*;

    fn setup(max_rows: usize) -> (Arc<ChunkManager>, TabletCellHost) {
        let nodes = Arc::new(NodeDirectory::new());
        for i in 0..3 {
            nodes.add_node(format!("node{i}"), Medium::default()).unwrap();
        }
        let chunks = Arc::new(ChunkManager::new(nodes.clone(), Duration::from_secs(1)));
        let store: Arc<dyn ChunkStore> = chunks.clone();
        let cell = Cell::new(
            CellId(0),
            "default",
            1,
            nodes,
            ConfigHandle::new(TabletManagerConfig::default()),
            Arc::new(move || TabletSlot::new(CellId(0), store.clone())),
        )
        .unwrap();
        cell.commit(TabletMutation::MountTablet {
            descriptor: descriptor(max_rows),
            stores: vec![],
            frozen: false,
        })
        .unwrap();
        let host = TabletCellHost::new(Arc::new(cell), chunks.clone());
        (chunks, host)
    }

    fn write(host: &TabletCellHost, ts: u64, keys: std::ops::Range<i64>) {
        let modifications = keys
            .map(|k| RowModification::Write {
                key: Key::from(vec![k]),
                columns: vec![ColumnWrite::new("value", format!("v{k}"))],
            })
            .collect();
        host.cell()
            .commit(TabletMutation::WriteRows {
                tablet: TabletId(1),
                timestamp: Timestamp(ts),
                modifications,
            })
            .unwrap();
    }

    fn lookup(host: &TabletCellHost, k: i64) -> Option<Vec<Value>> {
        host.cell()
            .with_leader(|slot| {
                let t = slot.tablet(TabletId(1)).unwrap();
                t.lookup(&[Key::from(vec![k])], Timestamp::MAX, slot.chunks())
                    .unwrap()
                    .0
                    .into_iter()
                    .next()
                    .flatten()
            })
            .unwrap()
    }

    #[test]
    fn test_flush_moves_rotated_store_into_partition() {
        let (chunks, host) = setup(10);
        write(&host, 1, 0..10);
        let updates = host.run_background(Timestamp(1));
        assert_eq!(updates.len(), 1);
        assert_eq!(updates[0].added.len(), 1);
        assert!(chunks.contains(updates[0].added[0]));

        let (eden, partitions) = host
            .cell()
            .with_leader(|slot| {
                let orchid = slot.tablet(TabletId(1)).unwrap().orchid();
                (
                    orchid["eden"]["stores"].as_object().unwrap().len(),
                    orchid["partitions"][0]["stores"].as_object().unwrap().len(),
                )
            })
            .unwrap();
        assert_eq!((eden, partitions), (1, 1));
        assert_eq!(lookup(&host, 3).unwrap()[1], Value::from("v3"));
    }

    #[test]
    fn test_compaction_merges_and_splits() {
        let (chunks, host) = setup(4);
        for round in 0..3u64 {
            write(&host, round + 1, 0..4);
            host.flush_tablet(TabletId(1)).unwrap();
        }
        let stores_before = host
            .cell()
            .with_leader(|slot| slot.tablet(TabletId(1)).unwrap().partitions[0].stores.len())
            .unwrap();
        assert_eq!(stores_before, 3);

        let update = host.compact_tablet(TabletId(1), Timestamp(10), true).unwrap();
        assert_eq!(update.removed.len(), 3);
        assert_eq!(update.added.len(), 1);
        let merged = chunks.meta(update.added[0]).unwrap();
        assert_eq!(merged.row_count, 4);
        assert_eq!(lookup(&host, 2).unwrap()[1], Value::from("v2"));
        assert_eq!(host.metrics().compactions, 1);
    }

    #[test]
    fn test_oversized_partition_is_split() {
        let (_, host) = setup(3);
        write(&host, 1, 0..3);
        write(&host, 2, 3..6);
        host.flush_tablet(TabletId(1)).unwrap();
        host.cell()
            .commit(TabletMutation::RemountTablet {
                tablet: TabletId(1),
                settings: crate::tablet::TabletSettings {
                    max_dynamic_store_row_count: 3,
                    max_partition_row_count: 4,
                    ..Default::default()
                },
            })
            .unwrap();
        host.compact_tablet(TabletId(1), Timestamp(5), false).unwrap();
        let partitions = host
            .cell()
            .with_leader(|slot| slot.tablet(TabletId(1)).unwrap().partitions.len())
            .unwrap();
        assert_eq!(partitions, 2);
        assert_eq!(host.metrics().partition_splits, 1);
        for k in 0..6 {
            assert!(lookup(&host, k).is_some());
        }
    }

    #[test]
    fn test_preload_runs_on_every_peer() {
        let (_, host) = setup(5);
        write(&host, 1, 0..5);
        host.flush_tablet(TabletId(1)).unwrap();
        let mut settings = crate::tablet::TabletSettings {
            max_dynamic_store_row_count: 5,
            ..Default::default()
        };
        settings.in_memory_mode = InMemoryMode::Uncompressed;
        settings.enable_lookup_hash_table = true;
        host.cell()
            .commit(TabletMutation::RemountTablet {
                tablet: TabletId(1),
                settings,
            })
            .unwrap();
        host.run_preload();
        let state = host
            .cell()
            .with_leader(|slot| {
                let t = slot.tablet(TabletId(1)).unwrap();
                let s = t.static_stores().next().unwrap();
                (s.preload_state, s.preloaded().map_or(false, |r| r.has_hash_index()))
            })
            .unwrap();
        assert_eq!(state, (PreloadState::Complete, true));
        assert_eq!(host.metrics().preloads_completed, 1);
        assert_eq!(lookup(&host, 4).unwrap()[1], Value::from("v4"));
    }
}
