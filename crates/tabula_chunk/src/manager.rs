//! Chunk registry: placement, quorum writes, sealing, reads and repair.
//!
//! # Invariants
//! - A chunk's per-chunk lock serializes append, seal, repair and relocation,
//!   so concurrent repair of a healthy chunk is a no-op.
//! - After seal every listed `Sealed` replica holds exactly `row_count` rows.
//! - Reads never return rows past the quorum row count of an unsealed chunk.

use std::collections::{BTreeSet, HashMap};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use parking_lot::{Mutex, RwLock};

use tabula_common::error::{
    AvailabilityError, ConsistencyError, StateError, TabulaError, TabulaResult,
};
use tabula_common::{ChunkId, Key, Medium, NodeId};

use crate::chunk::{ChunkKind, ChunkMeta, ChunkReplica, ChunkStatus, ReplicationParams};
use crate::erasure::ErasureCodec;
use crate::node::{DataNode, Fragment, NodeDirectory, ReplicaState, StoredPart};

/// Read/write access to immutable chunks, as used by tablet flushes.
pub trait ChunkStore: Send + Sync {
    fn write_chunk(
        &self,
        kind: ChunkKind,
        params: &ReplicationParams,
        records: Vec<Vec<u8>>,
        boundary_keys: Option<(Key, Key)>,
    ) -> TabulaResult<ChunkId>;

    fn read_chunk(&self, id: ChunkId) -> TabulaResult<Vec<Vec<u8>>>;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RepairOutcome {
    /// Nothing was missing.
    Healthy,
    Repaired { replicas: usize },
}

#[derive(Debug, Default)]
pub struct ChunkMetrics {
    pub chunks_created: AtomicU64,
    pub chunks_removed: AtomicU64,
    pub rows_appended: AtomicU64,
    pub seals: AtomicU64,
    pub reads: AtomicU64,
    pub repairs: AtomicU64,
    pub replicas_repaired: AtomicU64,
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ChunkMetricsSnapshot {
    pub chunks_created: u64,
    pub chunks_removed: u64,
    pub rows_appended: u64,
    pub seals: u64,
    pub reads: u64,
    pub repairs: u64,
    pub replicas_repaired: u64,
}

impl ChunkMetrics {
    pub fn snapshot(&self) -> ChunkMetricsSnapshot {
        ChunkMetricsSnapshot {
            chunks_created: self.chunks_created.load(Ordering::Relaxed),
            chunks_removed: self.chunks_removed.load(Ordering::Relaxed),
            rows_appended: self.rows_appended.load(Ordering::Relaxed),
            seals: self.seals.load(Ordering::Relaxed),
            reads: self.reads.load(Ordering::Relaxed),
            repairs: self.repairs.load(Ordering::Relaxed),
            replicas_repaired: self.replicas_repaired.load(Ordering::Relaxed),
        }
    }
}

struct ChunkEntry {
    meta: ChunkMeta,
    /// Rows the writer has pushed so far; replicas lagging behind stop
    /// receiving appends.
    written_row_count: u64,
}

pub struct ChunkManager {
    nodes: Arc<NodeDirectory>,
    chunks: RwLock<HashMap<ChunkId, Arc<Mutex<ChunkEntry>>>>,
    next_id: AtomicU64,
    operation_timeout: Duration,
    metrics: ChunkMetrics,
}

fn encode_record(codec: ErasureCodec, record: &[u8]) -> Vec<Fragment> {
    codec
        .encode(record)
        .into_iter()
        .map(|shard| Fragment::new(record.len(), shard))
        .collect()
}

impl ChunkManager {
    pub fn new(nodes: Arc<NodeDirectory>, operation_timeout: Duration) -> Self {
        Self {
            nodes,
            chunks: RwLock::new(HashMap::new()),
            next_id: AtomicU64::new(0),
            operation_timeout,
            metrics: ChunkMetrics::default(),
        }
    }

    pub fn nodes(&self) -> &Arc<NodeDirectory> {
        &self.nodes
    }

    pub fn metrics(&self) -> &ChunkMetrics {
        &self.metrics
    }

    fn entry(&self, id: ChunkId) -> TabulaResult<Arc<Mutex<ChunkEntry>>> {
        self.chunks
            .read()
            .get(&id)
            .cloned()
            .ok_or_else(|| TabulaError::not_found(format!("chunk {id}")))
    }

    /// Least loaded reachable nodes on `medium`, skipping `exclude`.
    fn pick_nodes(&self, count: usize, medium: &Medium, exclude: &[NodeId]) -> Vec<Arc<DataNode>> {
        let mut candidates: Vec<Arc<DataNode>> = self
            .nodes
            .reachable()
            .into_iter()
            .filter(|n| &n.medium == medium && !exclude.contains(&n.id))
            .collect();
        candidates.sort_by_key(|n| (n.block_count(), n.id));
        candidates.truncate(count);
        candidates
    }

    fn reachable_node(&self, id: NodeId) -> Option<Arc<DataNode>> {
        self.nodes.get(id).filter(|n| !n.is_banned())
    }

    pub fn chunk_ids(&self) -> Vec<ChunkId> {
        let mut ids: Vec<ChunkId> = self.chunks.read().keys().copied().collect();
        ids.sort();
        ids
    }

    pub fn meta(&self, id: ChunkId) -> TabulaResult<ChunkMeta> {
        Ok(self.entry(id)?.lock().meta.clone())
    }

    pub fn contains(&self, id: ChunkId) -> bool {
        self.chunks.read().contains_key(&id)
    }

    // ── Write path ────────────────────────────────────────────────────

    /// Allocate a chunk and open an empty replica (or part) on each target node.
    pub fn create_chunk(&self, kind: ChunkKind, params: &ReplicationParams) -> TabulaResult<ChunkId> {
        params.validate()?;
        let targets = self.pick_nodes(params.replica_count(), &params.medium, &[]);
        if targets.len() < params.write_quorum {
            return Err(AvailabilityError::NotEnoughNodes {
                required: params.write_quorum,
                available: targets.len(),
            }
            .into());
        }
        let id = ChunkId(self.next_id.fetch_add(1, Ordering::SeqCst) + 1);
        let erasure = params.erasure_codec.is_erasure();
        let mut replicas = Vec::with_capacity(targets.len());
        for (i, node) in targets.iter().enumerate() {
            let part_index = if erasure { i } else { 0 };
            node.put_block(
                id,
                StoredPart {
                    part_index,
                    state: ReplicaState::Writing,
                    fragments: Vec::new(),
                },
            );
            replicas.push(ChunkReplica {
                node: node.id,
                part_index,
                state: ReplicaState::Writing,
            });
        }
        let meta = ChunkMeta {
            id,
            kind,
            params: params.clone(),
            stored_replicas: replicas,
            sealed: false,
            row_count: 0,
            data_size: 0,
            boundary_keys: None,
            seal_requested: false,
        };
        self.chunks.write().insert(
            id,
            Arc::new(Mutex::new(ChunkEntry {
                meta,
                written_row_count: 0,
            })),
        );
        self.metrics.chunks_created.fetch_add(1, Ordering::Relaxed);
        tracing::debug!(chunk = %id, ?kind, replicas = targets.len(), codec = %params.erasure_codec, "chunk created");
        Ok(id)
    }

    /// Append rows to every reachable, in-sync replica. Succeeds once
    /// `write_quorum` replicas acknowledged; returns the ack count.
    pub fn append(&self, id: ChunkId, records: &[Vec<u8>]) -> TabulaResult<usize> {
        let entry = self.entry(id)?;
        let mut entry = entry.lock();
        if entry.meta.sealed {
            return Err(StateError::ChunkSealed(id).into());
        }
        let codec = entry.meta.params.erasure_codec;
        let encoded: Vec<Vec<Fragment>> = records.iter().map(|r| encode_record(codec, r)).collect();
        let expected = entry.written_row_count;
        let mut acked = 0;
        for replica in &entry.meta.stored_replicas {
            let Some(node) = self.nodes.get(replica.node) else {
                continue;
            };
            if !node.round_trip(self.operation_timeout) {
                continue;
            }
            let appended = node.with_block_mut(id, |part| {
                if part.row_count() != expected {
                    return false;
                }
                let index = if codec.is_erasure() { part.part_index } else { 0 };
                part.fragments
                    .extend(encoded.iter().map(|frags| frags[index].clone()));
                true
            });
            if appended == Some(true) {
                acked += 1;
            }
        }
        entry.written_row_count += records.len() as u64;
        entry.meta.data_size += records.iter().map(|r| r.len() as u64).sum::<u64>();
        let required = entry.meta.params.write_quorum;
        if acked < required {
            entry.meta.seal_requested = true;
            tracing::warn!(chunk = %id, acked, required, "chunk append missed write quorum");
            return Err(ConsistencyError::WriteQuorumNotReached {
                chunk: id,
                acked,
                required,
            }
            .into());
        }
        self.metrics
            .rows_appended
            .fetch_add(records.len() as u64, Ordering::Relaxed);
        Ok(acked)
    }

    fn quorum_row_count_locked(&self, meta: &ChunkMeta) -> TabulaResult<u64> {
        if meta.sealed {
            return Ok(meta.row_count);
        }
        let mut counts: Vec<u64> = meta
            .stored_replicas
            .iter()
            .filter_map(|r| self.reachable_node(r.node)?.read_block(meta.id))
            .map(|p| p.row_count())
            .collect();
        if counts.len() < meta.params.read_quorum {
            return Err(AvailabilityError::QuorumMissing(meta.id).into());
        }
        counts.sort_unstable_by(|a, b| b.cmp(a));
        let unreachable = meta.params.replica_count().saturating_sub(counts.len());
        // A row is durable once `write_quorum` replicas hold it; every
        // unreachable replica might be one of them.
        let need = meta
            .params
            .write_quorum
            .saturating_sub(unreachable)
            .clamp(1, counts.len());
        Ok(counts[need - 1])
    }

    /// Rows acknowledged by a write quorum (the final count once sealed).
    pub fn quorum_row_count(&self, id: ChunkId) -> TabulaResult<u64> {
        let entry = self.entry(id)?;
        let entry = entry.lock();
        self.quorum_row_count_locked(&entry.meta)
    }

    /// Finalize the row count at the quorum prefix and seal every reachable
    /// replica. Replicas missing part of that prefix are dropped for repair.
    pub fn seal(&self, id: ChunkId) -> TabulaResult<u64> {
        let entry = self.entry(id)?;
        let mut entry = entry.lock();
        if entry.meta.sealed {
            return Ok(entry.meta.row_count);
        }
        let row_count = match self.quorum_row_count_locked(&entry.meta) {
            Ok(count) => count,
            Err(e) => {
                entry.meta.seal_requested = true;
                return Err(e);
            }
        };
        let meta = &mut entry.meta;
        let mut dropped = Vec::new();
        for replica in meta.stored_replicas.iter_mut() {
            let Some(node) = self.reachable_node(replica.node) else {
                continue;
            };
            let sealed = node
                .with_block_mut(id, |part| {
                    if part.row_count() < row_count {
                        return false;
                    }
                    part.fragments.truncate(row_count as usize);
                    part.state = ReplicaState::Sealed;
                    true
                })
                .unwrap_or(false);
            if sealed {
                replica.state = ReplicaState::Sealed;
            } else {
                node.remove_block(id);
                dropped.push(replica.node);
            }
        }
        meta.stored_replicas.retain(|r| !dropped.contains(&r.node));
        meta.sealed = true;
        meta.seal_requested = false;
        meta.row_count = row_count;
        entry.written_row_count = row_count;
        self.metrics.seals.fetch_add(1, Ordering::Relaxed);
        tracing::debug!(chunk = %id, row_count, dropped = dropped.len(), "chunk sealed");
        Ok(row_count)
    }

    /// Seal now if possible; otherwise leave the chunk for the periodic sealer.
    pub fn request_seal(&self, id: ChunkId) -> TabulaResult<bool> {
        {
            let entry = self.entry(id)?;
            entry.lock().meta.seal_requested = true;
        }
        match self.seal(id) {
            Ok(_) => Ok(true),
            Err(e) if e.is_transient() || e.is_retryable() => {
                tracing::info!(chunk = %id, error = %e, "seal deferred");
                Ok(false)
            }
            Err(e) => Err(e),
        }
    }

    /// Retry sealing of every chunk whose writer closed; returns the number sealed.
    pub fn seal_pending(&self) -> usize {
        let pending: Vec<ChunkId> = self
            .chunks
            .read()
            .iter()
            .filter(|(_, e)| {
                let e = e.lock();
                e.meta.seal_requested && !e.meta.sealed
            })
            .map(|(id, _)| *id)
            .collect();
        pending
            .into_iter()
            .filter(|id| self.seal(*id).is_ok())
            .count()
    }

    /// Create, fill and seal a chunk in one go. The chunk is discarded on failure.
    pub fn write_sealed(
        &self,
        kind: ChunkKind,
        params: &ReplicationParams,
        records: &[Vec<u8>],
        boundary_keys: Option<(Key, Key)>,
    ) -> TabulaResult<ChunkId> {
        let id = self.create_chunk(kind, params)?;
        let result = self.append(id, records).and_then(|_| self.seal(id));
        match result {
            Ok(_) => {
                if let Ok(entry) = self.entry(id) {
                    entry.lock().meta.boundary_keys = boundary_keys;
                }
                Ok(id)
            }
            Err(e) => {
                self.remove_chunk(id);
                Err(e)
            }
        }
    }

    pub fn remove_chunk(&self, id: ChunkId) -> bool {
        let Some(entry) = self.chunks.write().remove(&id) else {
            return false;
        };
        let entry = entry.lock();
        for replica in &entry.meta.stored_replicas {
            if let Some(node) = self.nodes.get(replica.node) {
                node.remove_block(id);
            }
        }
        self.metrics.chunks_removed.fetch_add(1, Ordering::Relaxed);
        tracing::debug!(chunk = %id, "chunk removed");
        true
    }

    // ── Status and reads ──────────────────────────────────────────────

    fn status_locked(&self, meta: &ChunkMeta) -> ChunkStatus {
        let live: Vec<&ChunkReplica> = meta
            .stored_replicas
            .iter()
            .filter(|r| {
                self.reachable_node(r.node).map_or(false, |n| n.has_block(meta.id))
                    && (!meta.sealed || r.state == ReplicaState::Sealed)
            })
            .collect();
        let params = &meta.params;
        if params.erasure_codec.is_erasure() {
            let parts: BTreeSet<usize> = live.iter().map(|r| r.part_index).collect();
            if parts.len() < params.erasure_codec.data_parts() {
                ChunkStatus::Lost
            } else if !meta.sealed && parts.len() < params.read_quorum {
                ChunkStatus::QuorumMissing
            } else if parts.len() < params.erasure_codec.total_parts() {
                ChunkStatus::Underreplicated
            } else {
                ChunkStatus::Healthy
            }
        } else if live.is_empty() {
            ChunkStatus::Lost
        } else if live.len() < params.read_quorum {
            ChunkStatus::QuorumMissing
        } else if live.len() < params.replication_factor {
            ChunkStatus::Underreplicated
        } else {
            ChunkStatus::Healthy
        }
    }

    pub fn status(&self, id: ChunkId) -> TabulaResult<ChunkStatus> {
        let entry = self.entry(id)?;
        let entry = entry.lock();
        Ok(self.status_locked(&entry.meta))
    }

    /// Read rows `[from, to)`, clipped to the quorum prefix.
    pub fn read(&self, id: ChunkId, from: u64, to: Option<u64>) -> TabulaResult<Vec<Vec<u8>>> {
        let (meta, limit) = {
            let entry = self.entry(id)?;
            let entry = entry.lock();
            match self.status_locked(&entry.meta) {
                ChunkStatus::Lost => return Err(AvailabilityError::Lost(id).into()),
                ChunkStatus::QuorumMissing => {
                    return Err(AvailabilityError::QuorumMissing(id).into())
                }
                _ => {}
            }
            let limit = self.quorum_row_count_locked(&entry.meta)?;
            (entry.meta.clone(), limit)
        };
        self.metrics.reads.fetch_add(1, Ordering::Relaxed);
        let to = to.map_or(limit, |t| t.min(limit));
        if from >= to {
            return Ok(Vec::new());
        }
        let (from, to) = (from as usize, to as usize);
        let codec = meta.params.erasure_codec;
        let mut timed_out = false;
        let mut parts: Vec<StoredPart> = Vec::new();
        for replica in &meta.stored_replicas {
            let Some(node) = self.reachable_node(replica.node) else {
                continue;
            };
            if !node.round_trip(self.operation_timeout) {
                timed_out = true;
                continue;
            }
            let Some(part) = node.read_block(id) else {
                continue;
            };
            if part.fragments.len() < to || !part.fragments[from..to].iter().all(Fragment::verify) {
                continue;
            }
            if !codec.is_erasure() {
                return Ok(part.fragments[from..to].iter().map(|f| f.bytes.clone()).collect());
            }
            parts.push(part);
            if parts.len() == codec.data_parts() {
                break;
            }
        }
        if codec.is_erasure() && parts.len() >= codec.data_parts() {
            let mut rows = Vec::with_capacity(to - from);
            for row in from..to {
                let mut shards: Vec<Option<Vec<u8>>> = vec![None; codec.total_parts()];
                let mut original_len = 0;
                for part in &parts {
                    let frag = &part.fragments[row];
                    original_len = frag.original_len as usize;
                    shards[part.part_index] = Some(frag.bytes.clone());
                }
                rows.push(codec.decode(&shards, original_len)?);
            }
            return Ok(rows);
        }
        if timed_out {
            return Err(ConsistencyError::Timeout(self.operation_timeout.as_millis() as u64).into());
        }
        Err(AvailabilityError::Lost(id).into())
    }

    // ── Repair and placement ──────────────────────────────────────────

    /// Rebuild missing replicas (or erasure parts) of a sealed chunk on fresh
    /// nodes. Running it on a healthy chunk changes nothing.
    pub fn repair(&self, id: ChunkId) -> TabulaResult<RepairOutcome> {
        let entry = self.entry(id)?;
        let mut entry = entry.lock();
        let meta = &mut entry.meta;
        if !meta.sealed {
            return Err(StateError::ChunkNotSealed(id).into());
        }
        let row_count = meta.row_count;

        // Replicas that were away during sealing either catch up or go.
        let mut dropped = Vec::new();
        for replica in meta.stored_replicas.iter_mut() {
            if replica.state == ReplicaState::Sealed {
                continue;
            }
            let Some(node) = self.reachable_node(replica.node) else {
                continue;
            };
            let settled = node
                .with_block_mut(id, |part| {
                    if part.row_count() < row_count {
                        return false;
                    }
                    part.fragments.truncate(row_count as usize);
                    part.state = ReplicaState::Sealed;
                    true
                })
                .unwrap_or(false);
            if settled {
                replica.state = ReplicaState::Sealed;
            } else {
                node.remove_block(id);
                dropped.push(replica.node);
            }
        }
        meta.stored_replicas.retain(|r| !dropped.contains(&r.node));

        let healthy: Vec<(ChunkReplica, StoredPart)> = meta
            .stored_replicas
            .iter()
            .filter(|r| r.state == ReplicaState::Sealed)
            .filter_map(|r| {
                let part = self.reachable_node(r.node)?.read_block(id)?;
                part.is_intact().then(|| (r.clone(), part))
            })
            .collect();

        let codec = meta.params.erasure_codec;
        let missing: Vec<usize> = if codec.is_erasure() {
            let present: BTreeSet<usize> = healthy.iter().map(|(r, _)| r.part_index).collect();
            (0..codec.total_parts()).filter(|i| !present.contains(i)).collect()
        } else {
            vec![0; meta.params.replication_factor.saturating_sub(healthy.len())]
        };
        if missing.is_empty() {
            let healthy_nodes: Vec<NodeId> = healthy.iter().map(|(r, _)| r.node).collect();
            meta.stored_replicas.retain(|r| healthy_nodes.contains(&r.node));
            return Ok(RepairOutcome::Healthy);
        }

        let sources: Vec<&StoredPart> = healthy.iter().map(|(_, p)| p).collect();
        if sources.is_empty() || (codec.is_erasure() && sources.len() < codec.data_parts()) {
            return Err(AvailabilityError::Lost(id).into());
        }

        let mut exclude: Vec<NodeId> = meta.stored_replicas.iter().map(|r| r.node).collect();
        let mut repaired = 0;
        for part_index in missing.iter().copied() {
            let Some(target) = self.pick_nodes(1, &meta.params.medium, &exclude).pop() else {
                break;
            };
            let fragments = if codec.is_erasure() {
                rebuild_part(codec, &sources, part_index, row_count as usize)?
            } else {
                sources[0].fragments.clone()
            };
            target.put_block(
                id,
                StoredPart {
                    part_index,
                    state: ReplicaState::Sealed,
                    fragments,
                },
            );
            let healthy_nodes: Vec<NodeId> = healthy.iter().map(|(r, _)| r.node).collect();
            let stale = meta.stored_replicas.iter().position(|r| {
                !healthy_nodes.contains(&r.node) && (!codec.is_erasure() || r.part_index == part_index)
            });
            if let Some(pos) = stale {
                let old = meta.stored_replicas.remove(pos);
                if let Some(node) = self.nodes.get(old.node) {
                    node.remove_block(id);
                }
            }
            meta.stored_replicas.push(ChunkReplica {
                node: target.id,
                part_index,
                state: ReplicaState::Sealed,
            });
            exclude.push(target.id);
            repaired += 1;
        }
        if repaired == 0 {
            return Err(AvailabilityError::NotEnoughNodes {
                required: missing.len(),
                available: 0,
            }
            .into());
        }
        self.metrics.repairs.fetch_add(1, Ordering::Relaxed);
        self.metrics
            .replicas_repaired
            .fetch_add(repaired as u64, Ordering::Relaxed);
        tracing::info!(chunk = %id, repaired, missing = missing.len(), "chunk repaired");
        Ok(RepairOutcome::Repaired { replicas: repaired })
    }

    /// Run repair over every sealed chunk that is not healthy.
    pub fn repair_all(&self) -> usize {
        let ids = self.chunk_ids();
        ids.into_iter()
            .filter(|id| {
                matches!(
                    self.status(*id),
                    Ok(ChunkStatus::Underreplicated | ChunkStatus::QuorumMissing)
                ) && self.meta(*id).map_or(false, |m| m.sealed)
            })
            .filter(|id| matches!(self.repair(*id), Ok(RepairOutcome::Repaired { .. })))
            .count()
    }

    /// Move every replica onto nodes of `medium`, keeping the replica count.
    pub fn relocate(&self, id: ChunkId, medium: &Medium) -> TabulaResult<()> {
        let entry = self.entry(id)?;
        let mut entry = entry.lock();
        let meta = &mut entry.meta;
        if !meta.sealed {
            return Err(StateError::ChunkNotSealed(id).into());
        }
        let movers: Vec<usize> = meta
            .stored_replicas
            .iter()
            .enumerate()
            .filter(|(_, r)| self.nodes.get(r.node).map_or(true, |n| &n.medium != medium))
            .map(|(i, _)| i)
            .collect();
        let exclude: Vec<NodeId> = meta.stored_replicas.iter().map(|r| r.node).collect();
        let targets = self.pick_nodes(movers.len(), medium, &exclude);
        if targets.len() < movers.len() {
            return Err(AvailabilityError::NotEnoughNodes {
                required: movers.len(),
                available: targets.len(),
            }
            .into());
        }
        let mut blocks = Vec::with_capacity(movers.len());
        for &i in &movers {
            let replica = &meta.stored_replicas[i];
            let part = self
                .reachable_node(replica.node)
                .and_then(|n| n.read_block(id))
                .ok_or(AvailabilityError::QuorumMissing(id))?;
            blocks.push(part);
        }
        for ((i, target), part) in movers.into_iter().zip(targets).zip(blocks) {
            let old = meta.stored_replicas[i].node;
            target.put_block(id, part);
            if let Some(node) = self.nodes.get(old) {
                node.remove_block(id);
            }
            meta.stored_replicas[i].node = target.id;
        }
        meta.params.medium = medium.clone();
        tracing::info!(chunk = %id, medium = %medium, "chunk relocated");
        Ok(())
    }
}

fn rebuild_part(
    codec: ErasureCodec,
    sources: &[&StoredPart],
    part_index: usize,
    row_count: usize,
) -> TabulaResult<Vec<Fragment>> {
    let mut out = Vec::with_capacity(row_count);
    for row in 0..row_count {
        let mut shards: Vec<Option<Vec<u8>>> = vec![None; codec.total_parts()];
        let mut original_len = 0;
        for part in sources {
            let frag = &part.fragments[row];
            original_len = frag.original_len as usize;
            shards[part.part_index] = Some(frag.bytes.clone());
        }
        let record = codec.decode(&shards, original_len)?;
        let mut fragments = encode_record(codec, &record);
        out.push(fragments.swap_remove(part_index));
    }
    Ok(out)
}

impl ChunkStore for ChunkManager {
    fn write_chunk(
        &self,
        kind: ChunkKind,
        params: &ReplicationParams,
        records: Vec<Vec<u8>>,
        boundary_keys: Option<(Key, Key)>,
    ) -> TabulaResult<ChunkId> {
        self.write_sealed(kind, params, &records, boundary_keys)
    }

    fn read_chunk(&self, id: ChunkId) -> TabulaResult<Vec<Vec<u8>>> {
        self.read(id, 0, None)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn manager(nodes: usize) -> ChunkManager {
        let dir = Arc::new(NodeDirectory::new());
        for i in 0..nodes {
            dir.add_node(format!("n{i}"), Medium::default()).unwrap();
        }
        ChunkManager::new(dir, Duration::from_secs(1))
    }

    fn rows(n: usize) -> Vec<Vec<u8>> {
        (0..n).map(|i| format!("row-{i}").into_bytes()).collect()
    }

    fn ban_replicas(m: &ChunkManager, id: ChunkId, count: usize) -> Vec<String> {
        let meta = m.meta(id).unwrap();
        meta.stored_replicas
            .iter()
            .take(count)
            .map(|r| {
                let node = m.nodes().get(r.node).unwrap();
                m.nodes().set_banned(&node.address, true).unwrap();
                node.address.clone()
            })
            .collect()
    }

    #[test]
    fn test_write_seal_read() {
        let m = manager(3);
        let id = m
            .write_sealed(ChunkKind::Journal, &ReplicationParams::default(), &rows(5), None)
            .unwrap();
        let meta = m.meta(id).unwrap();
        assert!(meta.sealed);
        assert_eq!(meta.row_count, 5);
        assert_eq!(meta.stored_replicas.len(), 3);
        assert_eq!(m.read(id, 1, Some(3)).unwrap(), rows(5)[1..3].to_vec());
        assert_eq!(m.status(id).unwrap(), ChunkStatus::Healthy);
    }

    #[test]
    fn test_append_requires_write_quorum() {
        let m = manager(3);
        let id = m.create_chunk(ChunkKind::Journal, &ReplicationParams::default()).unwrap();
        m.append(id, &rows(2)).unwrap();
        ban_replicas(&m, id, 2);
        let err = m.append(id, &rows(1)).unwrap_err();
        assert!(err.is_retryable());
    }

    #[test]
    fn test_quorum_row_count_excludes_minority_rows() {
        let m = manager(3);
        let id = m.create_chunk(ChunkKind::Journal, &ReplicationParams::default()).unwrap();
        m.append(id, &rows(4)).unwrap();
        let banned = ban_replicas(&m, id, 1);
        m.append(id, &rows(2)).unwrap();
        assert_eq!(m.quorum_row_count(id).unwrap(), 6);
        m.nodes().set_banned(&banned[0], false).unwrap();
        // Lagging replica has 4 rows; two others have 6.
        assert_eq!(m.quorum_row_count(id).unwrap(), 6);
        assert_eq!(m.seal(id).unwrap(), 6);
        assert_eq!(m.meta(id).unwrap().stored_replicas.len(), 2);
    }

    #[test]
    fn test_status_transitions_and_repair() {
        let m = manager(5);
        let id = m
            .write_sealed(ChunkKind::Table, &ReplicationParams::default(), &rows(3), None)
            .unwrap();
        let banned = ban_replicas(&m, id, 1);
        assert_eq!(m.status(id).unwrap(), ChunkStatus::Underreplicated);
        assert_eq!(m.read(id, 0, None).unwrap(), rows(3));

        assert_eq!(m.repair(id).unwrap(), RepairOutcome::Repaired { replicas: 1 });
        assert_eq!(m.status(id).unwrap(), ChunkStatus::Healthy);
        assert_eq!(m.repair(id).unwrap(), RepairOutcome::Healthy);

        // The returning node no longer serves the chunk.
        m.nodes().set_banned(&banned[0], false).unwrap();
        assert!(!m.nodes().by_address(&banned[0]).unwrap().has_block(id));
        assert_eq!(m.meta(id).unwrap().stored_replicas.len(), 3);
    }

    #[test]
    fn test_quorum_missing_and_lost() {
        let m = manager(3);
        let id = m
            .write_sealed(ChunkKind::Table, &ReplicationParams::default(), &rows(2), None)
            .unwrap();
        let mut banned = ban_replicas(&m, id, 2);
        assert_eq!(m.status(id).unwrap(), ChunkStatus::QuorumMissing);
        assert!(matches!(
            m.read(id, 0, None),
            Err(TabulaError::Availability(AvailabilityError::QuorumMissing(_)))
        ));
        banned.extend(ban_replicas(&m, id, 3));
        assert_eq!(m.status(id).unwrap(), ChunkStatus::Lost);
        for address in banned {
            m.nodes().set_banned(&address, false).unwrap();
        }
        assert_eq!(m.read(id, 0, None).unwrap(), rows(2));
    }

    #[test]
    fn test_erasure_read_and_repair() {
        let m = manager(12);
        let params = ReplicationParams::erasure(ErasureCodec::ReedSolomon6_3);
        let id = m.write_sealed(ChunkKind::Journal, &params, &rows(7), None).unwrap();
        let banned = ban_replicas(&m, id, 3);
        assert_eq!(m.read(id, 0, None).unwrap(), rows(7));
        assert_eq!(m.repair(id).unwrap(), RepairOutcome::Repaired { replicas: 3 });
        for address in &banned {
            m.nodes().set_banned(address, false).unwrap();
        }
        // Lose three freshly rebuilt parts as well: still decodable.
        let meta = m.meta(id).unwrap();
        for r in meta.stored_replicas.iter().rev().take(3) {
            let node = m.nodes().get(r.node).unwrap();
            m.nodes().set_banned(&node.address, true).unwrap();
        }
        assert_eq!(m.read(id, 0, None).unwrap(), rows(7));
    }

    #[test]
    fn test_erasure_beyond_parity_is_lost() {
        let m = manager(9);
        let params = ReplicationParams::erasure(ErasureCodec::ReedSolomon6_3);
        let id = m.write_sealed(ChunkKind::Journal, &params, &rows(2), None).unwrap();
        let banned = ban_replicas(&m, id, 4);
        assert_eq!(m.status(id).unwrap(), ChunkStatus::Lost);
        assert!(m.read(id, 0, None).is_err());
        for address in &banned {
            m.nodes().set_banned(address, false).unwrap();
        }
        assert_eq!(m.read(id, 0, None).unwrap(), rows(2));
    }

    #[test]
    fn test_corrupted_replica_is_skipped_and_repaired() {
        let m = manager(4);
        let id = m
            .write_sealed(ChunkKind::Table, &ReplicationParams::default(), &rows(2), None)
            .unwrap();
        let first = m.meta(id).unwrap().stored_replicas[0].node;
        assert!(m.nodes().get(first).unwrap().corrupt_block(id));
        assert_eq!(m.read(id, 0, None).unwrap(), rows(2));
        assert_eq!(m.repair(id).unwrap(), RepairOutcome::Repaired { replicas: 1 });
        assert!(m.meta(id).unwrap().replica_on(first).is_none());
    }

    #[test]
    fn test_relocate_requires_seal_and_keeps_count() {
        let dir = Arc::new(NodeDirectory::new());
        for i in 0..3 {
            dir.add_node(format!("hdd{i}"), Medium::default()).unwrap();
            dir.add_node(format!("ssd{i}"), Medium("ssd".into())).unwrap();
        }
        let m = ChunkManager::new(dir, Duration::from_secs(1));
        let open = m.create_chunk(ChunkKind::Journal, &ReplicationParams::default()).unwrap();
        assert!(m.relocate(open, &Medium("ssd".into())).is_err());

        let id = m
            .write_sealed(ChunkKind::Table, &ReplicationParams::default(), &rows(3), None)
            .unwrap();
        m.relocate(id, &Medium("ssd".into())).unwrap();
        let meta = m.meta(id).unwrap();
        assert_eq!(meta.stored_replicas.len(), 3);
        for r in &meta.stored_replicas {
            assert_eq!(m.nodes().get(r.node).unwrap().medium, Medium("ssd".into()));
        }
        assert_eq!(m.read(id, 0, None).unwrap(), rows(3));
    }

    #[test]
    fn test_sealed_chunk_rejects_append() {
        let m = manager(3);
        let id = m
            .write_sealed(ChunkKind::Journal, &ReplicationParams::default(), &rows(1), None)
            .unwrap();
        assert!(matches!(
            m.append(id, &rows(1)),
            Err(TabulaError::State(StateError::ChunkSealed(_)))
        ));
    }

    #[test]
    fn test_pending_seal_after_outage() {
        let m = manager(3);
        let id = m.create_chunk(ChunkKind::Journal, &ReplicationParams::default()).unwrap();
        m.append(id, &rows(3)).unwrap();
        let banned = ban_replicas(&m, id, 2);
        assert!(!m.request_seal(id).unwrap());
        assert_eq!(m.seal_pending(), 0);
        for address in &banned {
            m.nodes().set_banned(address, false).unwrap();
        }
        assert_eq!(m.seal_pending(), 1);
        assert_eq!(m.meta(id).unwrap().row_count, 3);
    }
}
