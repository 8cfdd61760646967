//! Journal registry: create, append with chunk rotation, quorum reads and
//! truncation of sealed journals.

use std::collections::BTreeMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use parking_lot::{Mutex, RwLock};

use tabula_chunk::{ChunkKind, ChunkManager};
use tabula_common::config::JournalConfig;
use tabula_common::error::{StateError, TabulaError, TabulaResult};
use tabula_common::{ChunkId, JournalId, NamedRow};

use crate::journal::{Journal, JournalAttributes, JournalWriterOptions, OpenChunk};

#[derive(Debug, Default)]
pub struct JournalMetrics {
    pub rows_written: AtomicU64,
    pub chunks_rotated: AtomicU64,
    pub truncations: AtomicU64,
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct JournalMetricsSnapshot {
    pub rows_written: u64,
    pub chunks_rotated: u64,
    pub truncations: u64,
}

impl JournalMetrics {
    pub fn snapshot(&self) -> JournalMetricsSnapshot {
        JournalMetricsSnapshot {
            rows_written: self.rows_written.load(Ordering::Relaxed),
            chunks_rotated: self.chunks_rotated.load(Ordering::Relaxed),
            truncations: self.truncations.load(Ordering::Relaxed),
        }
    }
}

pub struct JournalManager {
    chunks: Arc<ChunkManager>,
    config: JournalConfig,
    journals: RwLock<BTreeMap<String, Arc<Mutex<Journal>>>>,
    next_id: AtomicU64,
    metrics: JournalMetrics,
}

impl JournalManager {
    pub fn new(chunks: Arc<ChunkManager>, config: JournalConfig) -> Self {
        Self {
            chunks,
            config,
            journals: RwLock::new(BTreeMap::new()),
            next_id: AtomicU64::new(0),
            metrics: JournalMetrics::default(),
        }
    }

    pub fn metrics(&self) -> JournalMetricsSnapshot {
        self.metrics.snapshot()
    }

    fn journal(&self, path: &str) -> TabulaResult<Arc<Mutex<Journal>>> {
        self.journals
            .read()
            .get(path)
            .cloned()
            .ok_or_else(|| TabulaError::not_found(format!("journal {path}")))
    }

    pub fn exists(&self, path: &str) -> bool {
        self.journals.read().contains_key(path)
    }

    pub fn paths(&self) -> Vec<String> {
        self.journals.read().keys().cloned().collect()
    }

    pub fn create(&self, path: &str, attributes: JournalAttributes) -> TabulaResult<JournalId> {
        attributes.validate()?;
        let mut journals = self.journals.write();
        if journals.contains_key(path) {
            return Err(TabulaError::argument(format!("journal {path} already exists")));
        }
        let id = JournalId(self.next_id.fetch_add(1, Ordering::SeqCst) + 1);
        journals.insert(
            path.to_string(),
            Arc::new(Mutex::new(Journal::new(id, path.to_string(), attributes))),
        );
        tracing::info!(journal = %id, path, "journal created");
        Ok(id)
    }

    /// Drop a journal together with its chunks.
    pub fn remove(&self, path: &str) -> TabulaResult<()> {
        let handle = self
            .journals
            .write()
            .remove(path)
            .ok_or_else(|| TabulaError::not_found(format!("journal {path}")))?;
        let journal = handle.lock();
        for chunk in &journal.chunks {
            self.chunks.remove_chunk(*chunk);
        }
        tracing::info!(journal = %journal.id, path, chunks = journal.chunks.len(), "journal removed");
        Ok(())
    }

    pub fn attributes(&self, path: &str) -> TabulaResult<JournalAttributes> {
        Ok(self.journal(path)?.lock().attributes.clone())
    }

    pub fn chunk_ids(&self, path: &str) -> TabulaResult<Vec<ChunkId>> {
        Ok(self.journal(path)?.lock().chunks.clone())
    }

    // ── Writes ────────────────────────────────────────────────────────

    fn close_chunk(&self, journal: &mut Journal) -> TabulaResult<()> {
        let Some(open) = journal.open.take() else {
            return Ok(());
        };
        let sealed = self.chunks.request_seal(open.id)?;
        tracing::debug!(journal = %journal.id, chunk = %open.id, rows = open.rows, sealed, "journal chunk closed");
        Ok(())
    }

    /// Append `rows`. The writer rotates to a fresh chunk whenever the open
    /// one reaches its row or byte bound, and closes the last chunk unless
    /// `dont_close` is set. A write of no rows only closes an open writer.
    pub fn write(&self, path: &str, rows: &[NamedRow], options: &JournalWriterOptions) -> TabulaResult<u64> {
        let records = rows
            .iter()
            .map(|row| bincode::serialize(row).map_err(TabulaError::from))
            .collect::<TabulaResult<Vec<Vec<u8>>>>()?;
        let handle = self.journal(path)?;
        let mut journal = handle.lock();
        let (max_rows, max_bytes) = options.bounds(&self.config);

        let mut pending = records.as_slice();
        while !pending.is_empty() {
            let mut open = match journal.open {
                Some(open) => open,
                None => {
                    let id = self
                        .chunks
                        .create_chunk(ChunkKind::Journal, &journal.attributes.params)?;
                    journal.chunks.push(id);
                    OpenChunk::new(id)
                }
            };
            let take = open.fitting(pending, max_rows, max_bytes);
            let (batch, rest) = pending.split_at(take);
            if let Err(e) = self.chunks.append(open.id, batch) {
                // The chunk is left for the sealer; the next write starts a new one.
                journal.open = None;
                tracing::warn!(journal = %journal.id, chunk = %open.id, error = %e, "journal append failed");
                return Err(e);
            }
            open.rows += batch.len();
            open.bytes += batch.iter().map(Vec::len).sum::<usize>();
            journal.open = Some(open);
            pending = rest;
            self.metrics
                .rows_written
                .fetch_add(batch.len() as u64, Ordering::Relaxed);

            if open.is_full(max_rows, max_bytes) {
                self.close_chunk(&mut journal)?;
                self.metrics.chunks_rotated.fetch_add(1, Ordering::Relaxed);
            }
        }
        if !options.dont_close {
            self.close_chunk(&mut journal)?;
        }
        Ok(records.len() as u64)
    }

    // ── Reads ─────────────────────────────────────────────────────────

    /// Rows acknowledged by a write quorum across all chunks.
    pub fn quorum_row_count(&self, path: &str) -> TabulaResult<u64> {
        let chunks = self.chunk_ids(path)?;
        chunks
            .iter()
            .map(|id| self.chunks.quorum_row_count(*id))
            .sum()
    }

    /// No writer is open and every chunk has an agreed final row count.
    pub fn is_sealed(&self, path: &str) -> TabulaResult<bool> {
        let handle = self.journal(path)?;
        let journal = handle.lock();
        self.sealed(&journal)
    }

    fn sealed(&self, journal: &Journal) -> TabulaResult<bool> {
        if journal.has_open_writer() {
            return Ok(false);
        }
        for id in &journal.chunks {
            if !self.chunks.meta(*id)?.sealed {
                return Ok(false);
            }
        }
        Ok(true)
    }

    /// Rows `[from, to)` of the quorum prefix; `to = None` reads to the end.
    pub fn read(&self, path: &str, from: u64, to: Option<u64>) -> TabulaResult<Vec<NamedRow>> {
        let to = to.unwrap_or(u64::MAX);
        let mut rows = Vec::new();
        if from >= to {
            return Ok(rows);
        }
        let mut offset = 0u64;
        for id in self.chunk_ids(path)? {
            let count = self.chunks.quorum_row_count(id)?;
            let (lo, hi) = (offset, offset + count);
            if hi > from && lo < to {
                let records = self
                    .chunks
                    .read(id, from.saturating_sub(lo), Some(to.min(hi) - lo))?;
                for record in records {
                    rows.push(bincode::deserialize(&record)?);
                }
            }
            offset = hi;
            if offset >= to {
                break;
            }
        }
        Ok(rows)
    }

    // ── Truncation ────────────────────────────────────────────────────

    /// Keep the first `row_count` rows of a sealed journal. A chunk cut in
    /// the middle is rewritten as a new sealed chunk holding its prefix.
    pub fn truncate(&self, path: &str, row_count: u64) -> TabulaResult<()> {
        let handle = self.journal(path)?;
        let mut journal = handle.lock();
        if !self.sealed(&journal)? {
            return Err(StateError::JournalNotSealed(path.to_string()).into());
        }
        let mut kept = Vec::new();
        let mut dropped = Vec::new();
        let mut rewritten = Vec::new();
        if let Err(e) = self.split_at_row(&journal, row_count, &mut kept, &mut dropped, &mut rewritten) {
            for id in rewritten {
                self.chunks.remove_chunk(id);
            }
            tracing::warn!(journal = %journal.id, path, row_count, error = %e, "journal truncation failed");
            return Err(e);
        }
        if dropped.is_empty() {
            return Ok(());
        }
        journal.chunks = kept;
        for id in &dropped {
            self.chunks.remove_chunk(*id);
        }
        self.metrics.truncations.fetch_add(1, Ordering::Relaxed);
        tracing::info!(journal = %journal.id, path, row_count, dropped_chunks = dropped.len(), "journal truncated");
        Ok(())
    }

    /// Sort the chunks of `journal` into those kept whole and those dropped
    /// by a cut at `row_count`. Prefix chunks written along the way are
    /// listed in `rewritten` so a failed cut can remove them.
    fn split_at_row(
        &self,
        journal: &Journal,
        row_count: u64,
        kept: &mut Vec<ChunkId>,
        dropped: &mut Vec<ChunkId>,
        rewritten: &mut Vec<ChunkId>,
    ) -> TabulaResult<()> {
        let mut offset = 0u64;
        for &id in &journal.chunks {
            let count = self.chunks.meta(id)?.row_count;
            if offset + count <= row_count {
                kept.push(id);
            } else if offset < row_count {
                let prefix = self.chunks.read(id, 0, Some(row_count - offset))?;
                let prefix_chunk = self.chunks.write_sealed(
                    ChunkKind::Journal,
                    &journal.attributes.params,
                    &prefix,
                    None,
                )?;
                rewritten.push(prefix_chunk);
                kept.push(prefix_chunk);
                dropped.push(id);
            } else {
                dropped.push(id);
            }
            offset += count;
        }
        Ok(())
    }
}
