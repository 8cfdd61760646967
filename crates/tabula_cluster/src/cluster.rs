//! Cluster core: nodes, bundles, cells, users and the periodic tick that
//! drives cell supervision and background store maintenance.
//!
//! Lock order: `control` before `state`. Metadata operations that talk to
//! cells (mount, unmount, reshard, tick) serialize on `control`; readers and
//! writers only take `state`.

use std::collections::{BTreeMap, BTreeSet};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use parking_lot::{Mutex, RwLock};

use tabula_chunk::{ChunkManager, ChunkMeta, ChunkStatus, ChunkTree, NodeDirectory, RepairOutcome, ReplicationParams};
use tabula_common::config::{ConfigHandle, TabletManagerConfig, TabulaConfig};
use tabula_common::error::{StateError, TabulaError, TabulaResult};
use tabula_common::security::{Acl, Permission, SecurityManager};
use tabula_common::{CellId, ChunkId, Medium, NodeId, TableId, TabletId, Timestamp};
use tabula_hydra::{AutomatonFactory, Cell, CellHealth, CellMetricsSnapshot, PeerInfo, Supervised};
use tabula_journal::JournalManager;
use tabula_tablet::{HostMetricsSnapshot, StoreUpdate, TabletCellHost, TabletMutation, TabletSlot};

use crate::table::TableRecord;
use crate::transaction::{TimestampProvider, TransactionManager};

pub const DEFAULT_BUNDLE: &str = "default";

#[derive(Debug, Clone)]
pub(crate) struct BundleRecord {
    pub balancer_config: serde_json::Value,
}

pub(crate) struct ClusterState {
    pub tables: BTreeMap<String, TableRecord>,
    pub journal_acls: BTreeMap<String, Acl>,
    pub bundles: BTreeMap<String, BundleRecord>,
    pub cells: BTreeMap<CellId, Arc<TabletCellHost>>,
    pub tree: ChunkTree,
}

/// What one [`Cluster::tick`] did.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct TickReport {
    pub store_updates: usize,
    pub sealed_chunks: usize,
    pub commits_retried: usize,
    pub commits_pending: usize,
}

pub struct Cluster {
    pub(crate) config: TabulaConfig,
    pub(crate) nodes: Arc<NodeDirectory>,
    pub(crate) chunks: Arc<ChunkManager>,
    pub(crate) manager_config: ConfigHandle<TabletManagerConfig>,
    pub(crate) journals: JournalManager,
    pub(crate) security: SecurityManager,
    pub(crate) timestamps: TimestampProvider,
    pub(crate) transactions: TransactionManager,
    pub(crate) state: RwLock<ClusterState>,
    pub(crate) control: Mutex<()>,
    next_table_id: AtomicU64,
    next_tablet_id: AtomicU64,
    next_cell_id: AtomicU64,
}

impl Cluster {
    /// Start a cluster with `cluster.node_count` data nodes and
    /// `cluster.cell_count` cells in the default bundle.
    pub fn new(config: TabulaConfig) -> TabulaResult<Self> {
        config.validate()?;
        let nodes = Arc::new(NodeDirectory::new());
        for i in 0..config.cluster.node_count {
            nodes.add_node(format!("node-{i}"), Medium::default())?;
        }
        let chunks = Arc::new(ChunkManager::new(nodes.clone(), config.chunk.operation_timeout()));
        let cluster = Self {
            nodes,
            manager_config: ConfigHandle::new(config.tablet_manager.clone()),
            journals: JournalManager::new(chunks.clone(), config.journal.clone()),
            security: SecurityManager::new(config.security.default_permissions.clone()),
            chunks,
            timestamps: TimestampProvider::new(),
            transactions: TransactionManager::new(),
            state: RwLock::new(ClusterState {
                tables: BTreeMap::new(),
                journal_acls: BTreeMap::new(),
                bundles: BTreeMap::new(),
                cells: BTreeMap::new(),
                tree: ChunkTree::new(),
            }),
            control: Mutex::new(()),
            next_table_id: AtomicU64::new(0),
            next_tablet_id: AtomicU64::new(0),
            next_cell_id: AtomicU64::new(0),
            config,
        };
        cluster.create_bundle(DEFAULT_BUNDLE)?;
        for _ in 0..cluster.config.cluster.cell_count {
            cluster.create_cell(DEFAULT_BUNDLE, None)?;
        }
        tracing::info!(
            nodes = cluster.config.cluster.node_count,
            cells = cluster.config.cluster.cell_count,
            "cluster started"
        );
        Ok(cluster)
    }

    pub fn config(&self) -> &TabulaConfig {
        &self.config
    }

    pub fn nodes(&self) -> &Arc<NodeDirectory> {
        &self.nodes
    }

    pub fn chunks(&self) -> &Arc<ChunkManager> {
        &self.chunks
    }

    /// Runtime-mutable tablet manager settings shared by every cell.
    pub fn tablet_manager_config(&self) -> &ConfigHandle<TabletManagerConfig> {
        &self.manager_config
    }

    /// Latest timestamp whose commits are fully applied.
    pub fn current_timestamp(&self) -> Timestamp {
        self.timestamps.last_committed()
    }

    pub(crate) fn allocate_table_id(&self) -> TableId {
        TableId(self.next_table_id.fetch_add(1, Ordering::Relaxed) + 1)
    }

    pub(crate) fn allocate_tablet_id(&self) -> TabletId {
        TabletId(self.next_tablet_id.fetch_add(1, Ordering::Relaxed) + 1)
    }

    /// Run `op` until it succeeds, fails with a non-retryable error, or the
    /// operation timeout runs out.
    pub(crate) fn with_retry<T>(&self, mut op: impl FnMut() -> TabulaResult<T>) -> TabulaResult<T> {
        let timeout = self.config.chunk.operation_timeout();
        let started = Instant::now();
        let mut backoff = Duration::from_millis(5);
        loop {
            match op() {
                Err(e) if e.is_retryable() && started.elapsed() + backoff < timeout => {
                    tracing::debug!(error = %e, backoff_ms = backoff.as_millis() as u64, "retrying");
                    std::thread::sleep(backoff);
                    backoff = (backoff * 2).min(Duration::from_millis(100));
                }
                result => return result,
            }
        }
    }

    // ── Access control ───────────────────────────────────────────────

    pub fn create_user(&self, name: &str) -> TabulaResult<()> {
        self.security.create_user(name)
    }

    /// Look up a table and check `permission` for `user` on it.
    pub(crate) fn table_for<'a>(
        &self,
        state: &'a ClusterState,
        user: &str,
        path: &str,
        permission: Permission,
    ) -> TabulaResult<&'a TableRecord> {
        let table = state
            .tables
            .get(path)
            .ok_or_else(|| TabulaError::not_found(format!("table {path}")))?;
        self.security.check(user, path, &table.acl, permission)?;
        Ok(table)
    }

    /// Replace the ACL of a table or journal. Needs `administer`.
    pub fn set_acl(&self, user: &str, path: &str, acl: Acl) -> TabulaResult<()> {
        let mut state = self.state.write();
        if let Some(table) = state.tables.get_mut(path) {
            self.security.check(user, path, &table.acl, Permission::Administer)?;
            table.acl = acl;
        } else if let Some(current) = state.journal_acls.get_mut(path) {
            self.security.check(user, path, current, Permission::Administer)?;
            *current = acl;
        } else {
            return Err(TabulaError::not_found(format!("node {path}")));
        }
        tracing::info!(path, user, "acl updated");
        Ok(())
    }

    pub fn acl(&self, path: &str) -> TabulaResult<Acl> {
        let state = self.state.read();
        state
            .tables
            .get(path)
            .map(|t| t.acl.clone())
            .or_else(|| state.journal_acls.get(path).cloned())
            .ok_or_else(|| TabulaError::not_found(format!("node {path}")))
    }

    // ── Nodes ────────────────────────────────────────────────────────

    pub fn add_node(&self, address: &str, medium: Medium) -> TabulaResult<NodeId> {
        self.nodes.add_node(address, medium)
    }

    /// Ban or unban a data node. Banned nodes serve no replicas and host no
    /// peers; the next tick moves affected cells.
    pub fn set_node_banned(&self, address: &str, banned: bool) -> TabulaResult<()> {
        self.nodes.set_banned(address, banned)
    }

    pub fn set_node_latency(&self, address: &str, latency: Duration) -> TabulaResult<()> {
        self.nodes.set_latency(address, latency)
    }

    // ── Bundles and cells ────────────────────────────────────────────

    pub fn create_bundle(&self, name: &str) -> TabulaResult<()> {
        if name.is_empty() {
            return Err(TabulaError::argument("bundle name must be non-empty"));
        }
        let mut state = self.state.write();
        if state.bundles.contains_key(name) {
            return Err(TabulaError::argument(format!("bundle {name} already exists")));
        }
        state.bundles.insert(
            name.to_string(),
            BundleRecord {
                balancer_config: serde_json::json!({}),
            },
        );
        tracing::info!(bundle = name, "bundle created");
        Ok(())
    }

    pub fn bundles(&self) -> Vec<String> {
        self.state.read().bundles.keys().cloned().collect()
    }

    /// Set the raw `tablet_balancer_config` of a bundle. It is parsed by the
    /// balancer on every iteration.
    pub fn set_bundle_balancer_config(&self, bundle: &str, config: serde_json::Value) -> TabulaResult<()> {
        let mut state = self.state.write();
        let record = state
            .bundles
            .get_mut(bundle)
            .ok_or_else(|| TabulaError::not_found(format!("bundle {bundle}")))?;
        record.balancer_config = config;
        Ok(())
    }

    /// Create a cell in `bundle` with `peer_count` peers (defaults to the
    /// tablet manager setting).
    pub fn create_cell(&self, bundle: &str, peer_count: Option<usize>) -> TabulaResult<CellId> {
        let mut state = self.state.write();
        if !state.bundles.contains_key(bundle) {
            return Err(TabulaError::not_found(format!("bundle {bundle}")));
        }
        let peer_count = peer_count.unwrap_or(self.manager_config.get().peer_count);
        let id = CellId(self.next_cell_id.fetch_add(1, Ordering::Relaxed) + 1);
        let store: Arc<dyn tabula_chunk::ChunkStore> = self.chunks.clone();
        let factory: AutomatonFactory<TabletSlot> = Arc::new(move || TabletSlot::new(id, store.clone()));
        let cell = Cell::new(id, bundle, peer_count, self.nodes.clone(), self.manager_config.clone(), factory)?;
        state
            .cells
            .insert(id, Arc::new(TabletCellHost::new(Arc::new(cell), self.chunks.clone())));
        Ok(id)
    }

    /// Remove an empty cell.
    pub fn remove_cell(&self, cell: CellId) -> TabulaResult<()> {
        let _control = self.control.lock();
        let mut state = self.state.write();
        let host = Self::host(&state, cell)?;
        let assigned = state
            .tables
            .values()
            .flat_map(|t| &t.tablets)
            .any(|t| t.cell == Some(cell));
        let hosted = host.cell().with_leader(|slot| slot.tablet_count()).unwrap_or(0);
        if assigned || hosted > 0 {
            return Err(StateError::CellInUse(cell).into());
        }
        host.cell().remove();
        state.cells.remove(&cell);
        tracing::info!(cell = %cell, "cell removed");
        Ok(())
    }

    pub fn cells(&self, bundle: &str) -> Vec<CellId> {
        self.state
            .read()
            .cells
            .iter()
            .filter(|(_, h)| h.cell().bundle() == bundle)
            .map(|(id, _)| *id)
            .collect()
    }

    pub(crate) fn host(state: &ClusterState, cell: CellId) -> TabulaResult<Arc<TabletCellHost>> {
        state
            .cells
            .get(&cell)
            .cloned()
            .ok_or_else(|| TabulaError::not_found(format!("cell {cell}")))
    }

    fn cell_host(&self, cell: CellId) -> TabulaResult<Arc<TabletCellHost>> {
        Self::host(&self.state.read(), cell)
    }

    pub fn cell_health(&self, cell: CellId) -> TabulaResult<CellHealth> {
        Ok(self.cell_host(cell)?.cell().health())
    }

    pub fn cell_peers(&self, cell: CellId) -> TabulaResult<Vec<PeerInfo>> {
        Ok(self.cell_host(cell)?.cell().peers())
    }

    pub fn cell_metrics(&self, cell: CellId) -> TabulaResult<CellMetricsSnapshot> {
        Ok(self.cell_host(cell)?.cell().metrics())
    }

    pub fn cell_host_metrics(&self, cell: CellId) -> TabulaResult<HostMetricsSnapshot> {
        Ok(self.cell_host(cell)?.metrics())
    }

    /// Snapshot the cell's automaton and truncate its changelog.
    pub fn build_snapshot(&self, cell: CellId) -> TabulaResult<u64> {
        self.cell_host(cell)?.cell().build_snapshot()
    }

    /// Stop every peer and recover it from snapshot and changelog.
    pub fn restart_cell(&self, cell: CellId) -> TabulaResult<()> {
        self.cell_host(cell)?.cell().restart()
    }

    // ── Chunks ───────────────────────────────────────────────────────

    pub fn chunk_meta(&self, chunk: ChunkId) -> TabulaResult<ChunkMeta> {
        self.chunks.meta(chunk)
    }

    pub fn chunk_status(&self, chunk: ChunkId) -> TabulaResult<ChunkStatus> {
        self.chunks.status(chunk)
    }

    pub fn repair_chunk(&self, chunk: ChunkId) -> TabulaResult<RepairOutcome> {
        self.chunks.repair(chunk)
    }

    pub fn relocate_chunk(&self, chunk: ChunkId, medium: &Medium) -> TabulaResult<()> {
        self.chunks.relocate(chunk, medium)
    }

    pub(crate) fn release_chunks(&self, chunks: &[ChunkId]) {
        for chunk in chunks {
            if self.chunks.remove_chunk(*chunk) {
                tracing::debug!(chunk = %chunk, "chunk released");
            }
        }
    }

    pub(crate) fn default_replication(&self) -> ReplicationParams {
        let c = &self.config.chunk;
        ReplicationParams::replicated(c.replication_factor, c.read_quorum, c.write_quorum)
    }

    /// Mirror a flush or compaction into the owning table's chunk tree.
    pub(crate) fn apply_store_update(&self, state: &mut ClusterState, update: &StoreUpdate) -> TabulaResult<()> {
        let ClusterState { tables, tree, .. } = state;
        let owner = tables
            .values_mut()
            .find_map(|t| t.tablet_index(update.tablet).map(|i| (t, i)));
        let Some((table, index)) = owner else {
            tracing::warn!(tablet = %update.tablet, "store update for unknown tablet");
            self.release_chunks(&update.added);
            return Ok(());
        };
        table.root = tree.cow_root(table.root)?;
        let list = tree.make_exclusive_child(table.root, index)?;
        for chunk in &update.added {
            tree.attach_chunk(list, *chunk)?;
        }
        let mut released = Vec::new();
        for chunk in &update.removed {
            if tree.detach_chunk(list, *chunk)? {
                released.push(*chunk);
            }
        }
        self.release_chunks(&released);
        Ok(())
    }

    // ── Tick ─────────────────────────────────────────────────────────

    /// Oldest timestamp any reader may still ask for.
    pub(crate) fn retention_timestamp(&self) -> Timestamp {
        self.transactions
            .oldest_start()
            .unwrap_or_else(|| self.timestamps.last_committed())
    }

    fn retry_pending_commits(&self) -> usize {
        let pending = self.transactions.take_pending();
        if pending.is_empty() {
            return 0;
        }
        let state = self.state.read();
        let timestamps: BTreeSet<Timestamp> = pending.iter().map(|c| c.timestamp).collect();
        let mut applied = 0;
        for commit in pending {
            let Some(host) = state.cells.get(&commit.cell) else {
                tracing::warn!(cell = %commit.cell, txn = %commit.txn, "dropping commit for removed cell");
                continue;
            };
            let mutation = TabletMutation::CommitTransaction {
                txn: commit.txn,
                timestamp: commit.timestamp,
            };
            match host.cell().commit(mutation) {
                Ok(_) => applied += 1,
                Err(TabulaError::State(StateError::TransactionNotActive(_))) => {}
                Err(e) => {
                    tracing::debug!(cell = %commit.cell, txn = %commit.txn, error = %e, "commit still pending");
                    self.transactions.push_pending(commit);
                }
            }
        }
        let still_pending = self.transactions.pending_timestamps();
        for ts in timestamps.difference(&still_pending) {
            self.timestamps.finish_commit(*ts);
        }
        applied
    }

    /// One supervision pass: cell elections and peer revocation, pending
    /// commits, flushes and compactions, chunk sealing.
    pub fn tick(&self) -> TickReport {
        let _control = self.control.lock();
        let now = Instant::now();
        let hosts: Vec<Arc<TabletCellHost>> = self.state.read().cells.values().cloned().collect();
        for host in &hosts {
            let cell = host.cell();
            if let Err(e) = cell.supervise_at(now) {
                tracing::warn!(cell = %cell.id(), error = %e, "cell supervision failed");
            }
            tabula_observability::record_cell_health(&cell.id().to_string(), cell.health().name());
        }

        let mut report = TickReport {
            commits_retried: self.retry_pending_commits(),
            ..TickReport::default()
        };

        let retention = self.retention_timestamp();
        let updates: Vec<StoreUpdate> = hosts.iter().flat_map(|h| h.run_background(retention)).collect();
        if !updates.is_empty() {
            let mut state = self.state.write();
            for update in &updates {
                if let Err(e) = self.apply_store_update(&mut state, update) {
                    tracing::warn!(tablet = %update.tablet, error = %e, "cannot apply store update");
                }
            }
        }
        report.store_updates = updates.len();
        tabula_observability::record_store_updates(updates.len());

        report.sealed_chunks = self.chunks.seal_pending();
        report.commits_pending = self.transactions.pending_count();
        tabula_observability::record_chunk_counts(self.chunks.chunk_ids().len(), report.sealed_chunks);
        report
    }
}

impl Supervised for Cluster {
    fn supervise(&self, _now: Instant) {
        let report = self.tick();
        if report != TickReport::default() {
            tracing::debug!(?report, "cluster tick");
        }
    }
}

#[cfg(test)]
mod tests {
    use tabula_common::schema::{ColumnSchema, ColumnType, TableSchema};
    use tabula_common::security::{AccessControlEntry, ROOT_USER};
    use tabula_journal::JournalAttributes;

    use crate::TableOptions;

    use super::*;

    fn small_config() -> TabulaConfig {
        let mut config = TabulaConfig::default();
        config.cluster.node_count = 3;
        config.cluster.cell_count = 2;
        config.chunk.operation_timeout_ms = 200;
        config
    }

    #[test]
    fn test_new_cluster_has_default_bundle_and_cells() {
        let cluster = Cluster::new(small_config()).unwrap();
        assert_eq!(cluster.bundles(), vec![DEFAULT_BUNDLE.to_string()]);
        assert_eq!(cluster.cells(DEFAULT_BUNDLE).len(), 2);
        assert_eq!(cluster.nodes().all().len(), 3);
    }

    #[test]
    fn test_bundles_and_cells() {
        let cluster = Cluster::new(small_config()).unwrap();
        cluster.create_bundle("analytics").unwrap();
        assert!(cluster.create_bundle("analytics").is_err());
        assert!(cluster.create_cell("missing", None).is_err());
        let cell = cluster.create_cell("analytics", Some(3)).unwrap();
        assert_eq!(cluster.cells("analytics"), vec![cell]);
        assert_eq!(cluster.cell_peers(cell).unwrap().len(), 3);
        assert_eq!(cluster.cell_health(cell).unwrap(), CellHealth::Good);
        cluster.remove_cell(cell).unwrap();
        assert!(cluster.cells("analytics").is_empty());
        assert!(cluster.cell_health(cell).is_err());
    }

    #[test]
    fn test_cell_needs_enough_nodes() {
        let cluster = Cluster::new(small_config()).unwrap();
        assert!(cluster.create_cell(DEFAULT_BUNDLE, Some(5)).is_err());
    }

    #[test]
    fn test_set_acl_requires_existing_node() {
        let cluster = Cluster::new(small_config()).unwrap();
        let acl = Acl::new(vec![AccessControlEntry::allow("alice", &[Permission::Read])]);
        assert!(matches!(
            cluster.set_acl(ROOT_USER, "//missing", acl),
            Err(TabulaError::NotFound(_))
        ));
    }

    #[test]
    fn test_default_replication_comes_from_config() {
        let mut config = small_config();
        config.chunk.replication_factor = 1;
        config.chunk.read_quorum = 1;
        config.chunk.write_quorum = 1;
        let cluster = Cluster::new(config).unwrap();
        let schema = TableSchema::new(vec![ColumnSchema::new("key", ColumnType::Int64)]);
        cluster
            .create_table(ROOT_USER, "//s", TableOptions::static_table(schema))
            .unwrap();
        let replication = cluster.table_attributes(ROOT_USER, "//s").unwrap().replication;
        assert_eq!(replication, ReplicationParams::replicated(1, 1, 1));

        cluster
            .create_journal(ROOT_USER, "//j", JournalAttributes::default(), Acl::default())
            .unwrap();
        let params = cluster.journal_attributes(ROOT_USER, "//j").unwrap().params;
        assert_eq!(params, ReplicationParams::replicated(1, 1, 1));
    }

    #[test]
    fn test_idle_tick_reports_nothing() {
        let cluster = Cluster::new(small_config()).unwrap();
        assert_eq!(cluster.tick(), TickReport::default());
    }

    #[test]
    fn test_with_retry_gives_up_after_timeout() {
        let cluster = Cluster::new(small_config()).unwrap();
        let mut attempts = 0;
        let started = Instant::now();
        let result: TabulaResult<()> = cluster.with_retry(|| {
            attempts += 1;
            Err(tabula_common::error::ConsistencyError::NoLeader { cell: CellId(1) }.into())
        });
        assert!(result.is_err());
        assert!(attempts > 1);
        assert!(started.elapsed() < Duration::from_secs(2));
    }
}
