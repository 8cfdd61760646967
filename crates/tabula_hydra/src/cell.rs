//! A replicated cell: peers on data nodes running one [`Automaton`].
//!
//! # Invariants
//! - A mutation is appended to the changelog only after leader validation and
//!   only while a quorum (`peer_count / 2 + 1`) of active peers is reachable.
//! - Every peer reaches the same state by loading the latest snapshot and
//!   replaying the changelog after it; records are checksummed.
//! - A leader is elected only from reachable peers, preferring the highest
//!   persisted index, and each election bumps the epoch.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Instant;

use parking_lot::{Mutex, RwLock};

use tabula_chunk::NodeDirectory;
use tabula_common::config::{ConfigHandle, TabletManagerConfig};
use tabula_common::error::{AvailabilityError, ConsistencyError, TabulaError, TabulaResult};
use tabula_common::{CellId, NodeId};

use crate::automaton::Automaton;
use crate::changelog::{CellStore, ChangelogRecord, Snapshot};
use crate::peer::PeerState;
use crate::supervisor::Supervised;

pub type AutomatonFactory<A> = Arc<dyn Fn() -> A + Send + Sync>;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CellHealth {
    /// Leader reachable and a quorum of peers active.
    Good,
    Degraded,
    Failed,
}

impl CellHealth {
    pub fn name(self) -> &'static str {
        match self {
            CellHealth::Good => "good",
            CellHealth::Degraded => "degraded",
            CellHealth::Failed => "failed",
        }
    }
}

impl std::fmt::Display for CellHealth {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.name())
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PeerInfo {
    pub peer_id: usize,
    pub node: NodeId,
    pub address: String,
    pub state: String,
    pub persisted_index: u64,
    pub applied_index: u64,
}

/// A peer's automaton together with where it lives.
pub struct PeerHandle<A> {
    pub peer_id: usize,
    pub node: NodeId,
    pub automaton: Arc<RwLock<A>>,
}

impl<A> Clone for PeerHandle<A> {
    fn clone(&self) -> Self {
        Self {
            peer_id: self.peer_id,
            node: self.node,
            automaton: self.automaton.clone(),
        }
    }
}

#[derive(Debug, Default)]
pub struct CellMetrics {
    pub mutations_committed: AtomicU64,
    pub mutations_rejected: AtomicU64,
    pub elections: AtomicU64,
    pub revocations: AtomicU64,
    pub snapshots_built: AtomicU64,
    pub recoveries: AtomicU64,
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CellMetricsSnapshot {
    pub mutations_committed: u64,
    pub mutations_rejected: u64,
    pub elections: u64,
    pub revocations: u64,
    pub snapshots_built: u64,
    pub recoveries: u64,
}

struct Peer<A> {
    peer_id: usize,
    node: NodeId,
    state: PeerState,
    persisted_index: u64,
    applied_index: u64,
    automaton: Option<Arc<RwLock<A>>>,
    unreachable_since: Option<Instant>,
}

struct CellInner<A> {
    epoch: u64,
    store: CellStore,
    peers: Vec<Peer<A>>,
    /// When the last leader stopped; elections wait out the reassignment timeout.
    leader_lost_at: Option<Instant>,
    removed: bool,
}

impl<A> CellInner<A> {
    fn leader_index(&self) -> Option<usize> {
        self.peers.iter().position(|p| p.state.is_leading())
    }
}

pub struct Cell<A: Automaton> {
    id: CellId,
    bundle: String,
    nodes: Arc<NodeDirectory>,
    config: ConfigHandle<TabletManagerConfig>,
    factory: AutomatonFactory<A>,
    inner: Mutex<CellInner<A>>,
    metrics: CellMetrics,
}

fn quorum(peer_count: usize) -> usize {
    peer_count / 2 + 1
}

/// Bring `peer` up to the end of the changelog, rebuilding it from the latest
/// snapshot when it has no state or fell behind compaction.
fn catch_up<A: Automaton>(
    cell: CellId,
    store: &CellStore,
    peer: &mut Peer<A>,
    factory: &AutomatonFactory<A>,
) -> TabulaResult<bool> {
    let mut recovered = false;
    let reusable = peer
        .automaton
        .as_ref()
        .filter(|_| peer.applied_index + 1 >= store.first_replayable_index())
        .cloned();
    let automaton = match reusable {
        Some(a) => a,
        None => {
            let mut fresh = factory();
            let mut applied = 0;
            if let Some(snapshot) = store.latest_snapshot() {
                fresh.load_snapshot(snapshot.verify()?)?;
                applied = snapshot.index;
            }
            let fresh = Arc::new(RwLock::new(fresh));
            peer.automaton = Some(fresh.clone());
            peer.applied_index = applied;
            recovered = true;
            fresh
        }
    };
    let records = store.records_after(peer.applied_index);
    if !records.is_empty() {
        let mut guard = automaton.write();
        for record in records {
            let mutation: A::Mutation = record.decode()?;
            if let Err(e) = guard.apply(record.index, &mutation) {
                tracing::debug!(cell = %cell, index = record.index, error = %e, "replayed mutation rejected");
            }
            peer.applied_index = record.index;
        }
    }
    peer.persisted_index = store.last_index();
    if recovered {
        tracing::info!(
            cell = %cell,
            peer = peer.peer_id,
            node = %peer.node,
            applied = peer.applied_index,
            "peer recovered from snapshot and changelog"
        );
    }
    Ok(recovered)
}

impl<A: Automaton> Cell<A> {
    /// Place `peer_count` peers on distinct reachable nodes and elect a leader.
    pub fn new(
        id: CellId,
        bundle: impl Into<String>,
        peer_count: usize,
        nodes: Arc<NodeDirectory>,
        config: ConfigHandle<TabletManagerConfig>,
        factory: AutomatonFactory<A>,
    ) -> TabulaResult<Self> {
        if peer_count == 0 {
            return Err(TabulaError::argument("cell needs at least one peer"));
        }
        let mut candidates = nodes.reachable();
        if candidates.len() < peer_count {
            return Err(AvailabilityError::NotEnoughNodes {
                required: peer_count,
                available: candidates.len(),
            }
            .into());
        }
        // Spread consecutive cells over different nodes.
        let offset = id.0 as usize % candidates.len();
        candidates.rotate_left(offset);
        let now = Instant::now();
        let peers = candidates
            .iter()
            .take(peer_count)
            .enumerate()
            .map(|(peer_id, node)| Peer {
                peer_id,
                node: node.id,
                state: PeerState::Elections { since: now },
                persisted_index: 0,
                applied_index: 0,
                automaton: None,
                unreachable_since: None,
            })
            .collect();
        let cell = Self {
            id,
            bundle: bundle.into(),
            nodes,
            config,
            factory,
            inner: Mutex::new(CellInner {
                epoch: 0,
                store: CellStore::default(),
                peers,
                leader_lost_at: None,
                removed: false,
            }),
            metrics: CellMetrics::default(),
        };
        {
            let mut inner = cell.inner.lock();
            cell.elect_locked(&mut inner, now)?;
        }
        tracing::info!(cell = %id, bundle = %cell.bundle, peer_count, "cell created");
        Ok(cell)
    }

    pub fn id(&self) -> CellId {
        self.id
    }

    pub fn bundle(&self) -> &str {
        &self.bundle
    }

    pub fn peer_count(&self) -> usize {
        self.inner.lock().peers.len()
    }

    pub fn epoch(&self) -> u64 {
        self.inner.lock().epoch
    }

    pub fn last_index(&self) -> u64 {
        self.inner.lock().store.last_index()
    }

    pub fn snapshot_count(&self) -> usize {
        self.inner.lock().store.snapshot_count()
    }

    pub fn changelog_record_count(&self) -> usize {
        self.inner.lock().store.record_count()
    }

    pub fn metrics(&self) -> CellMetricsSnapshot {
        let m = &self.metrics;
        CellMetricsSnapshot {
            mutations_committed: m.mutations_committed.load(Ordering::Relaxed),
            mutations_rejected: m.mutations_rejected.load(Ordering::Relaxed),
            elections: m.elections.load(Ordering::Relaxed),
            revocations: m.revocations.load(Ordering::Relaxed),
            snapshots_built: m.snapshots_built.load(Ordering::Relaxed),
            recoveries: m.recoveries.load(Ordering::Relaxed),
        }
    }

    fn alive_count(&self, inner: &CellInner<A>) -> usize {
        inner
            .peers
            .iter()
            .filter(|p| p.state.is_active() && self.nodes.is_reachable(p.node))
            .count()
    }

    // ── Mutations ─────────────────────────────────────────────────────

    /// Validate on the leader, log, and apply on every reachable peer.
    pub fn commit(&self, mutation: A::Mutation) -> TabulaResult<A::Response> {
        let mut inner = self.inner.lock();
        let no_leader = || TabulaError::from(ConsistencyError::NoLeader { cell: self.id });
        let leader = inner.leader_index().ok_or_else(no_leader)?;
        if !self.nodes.is_reachable(inner.peers[leader].node) {
            return Err(no_leader());
        }
        let automaton = inner.peers[leader].automaton.clone().ok_or_else(no_leader)?;
        if let Err(e) = automaton.read().validate(&mutation) {
            self.metrics.mutations_rejected.fetch_add(1, Ordering::Relaxed);
            return Err(e);
        }
        let alive = self.alive_count(&inner);
        let required = quorum(inner.peers.len());
        if alive < required {
            return Err(ConsistencyError::QuorumUnreachable {
                cell: self.id,
                alive,
                required,
            }
            .into());
        }

        let index = inner.store.last_index() + 1;
        let record = ChangelogRecord::encode(index, inner.epoch, &mutation)?;
        inner.store.append(record);
        for peer in inner.peers.iter_mut() {
            if peer.state.is_active() && self.nodes.is_reachable(peer.node) {
                peer.persisted_index = index;
            }
        }

        let response = automaton.write().apply(index, &mutation);
        inner.peers[leader].applied_index = index;

        let CellInner { store, peers, .. } = &mut *inner;
        for peer in peers.iter_mut() {
            if matches!(peer.state, PeerState::Following { .. }) && self.nodes.is_reachable(peer.node) {
                if let Err(e) = catch_up(self.id, store, peer, &self.factory) {
                    tracing::warn!(cell = %self.id, peer = peer.peer_id, error = %e, "follower failed to apply");
                }
            }
        }
        self.metrics.mutations_committed.fetch_add(1, Ordering::Relaxed);
        response
    }

    /// Persist the leader's state and compact the changelog behind it.
    pub fn build_snapshot(&self) -> TabulaResult<u64> {
        let mut inner = self.inner.lock();
        let leader = inner
            .leader_index()
            .filter(|&l| self.nodes.is_reachable(inner.peers[l].node))
            .ok_or(ConsistencyError::NoLeader { cell: self.id })?;
        let peer = &inner.peers[leader];
        let automaton = peer
            .automaton
            .clone()
            .ok_or(ConsistencyError::NoLeader { cell: self.id })?;
        let index = peer.applied_index;
        let data = automaton.read().save_snapshot()?;
        let size = data.len();
        inner.store.add_snapshot(Snapshot::new(index, data));
        self.metrics.snapshots_built.fetch_add(1, Ordering::Relaxed);
        tracing::info!(cell = %self.id, index, bytes = size, "snapshot built");
        Ok(index)
    }

    // ── Reads ─────────────────────────────────────────────────────────

    pub fn leader(&self) -> TabulaResult<PeerHandle<A>> {
        let inner = self.inner.lock();
        inner
            .leader_index()
            .map(|l| &inner.peers[l])
            .filter(|p| self.nodes.is_reachable(p.node))
            .and_then(|p| {
                Some(PeerHandle {
                    peer_id: p.peer_id,
                    node: p.node,
                    automaton: p.automaton.clone()?,
                })
            })
            .ok_or_else(|| ConsistencyError::NoLeader { cell: self.id }.into())
    }

    /// Reachable followers that hold state.
    pub fn followers(&self) -> Vec<PeerHandle<A>> {
        let inner = self.inner.lock();
        inner
            .peers
            .iter()
            .filter(|p| matches!(p.state, PeerState::Following { .. }))
            .filter(|p| self.nodes.is_reachable(p.node))
            .filter_map(|p| {
                Some(PeerHandle {
                    peer_id: p.peer_id,
                    node: p.node,
                    automaton: p.automaton.clone()?,
                })
            })
            .collect()
    }

    pub fn with_leader<R>(&self, f: impl FnOnce(&A) -> R) -> TabulaResult<R> {
        let leader = self.leader()?;
        let guard = leader.automaton.read();
        Ok(f(&guard))
    }

    /// Run `f` against every peer that holds state (leader first).
    pub fn for_each_peer(&self, mut f: impl FnMut(usize, bool, &mut A)) {
        let handles: Vec<(usize, bool, Arc<RwLock<A>>)> = {
            let inner = self.inner.lock();
            let mut v: Vec<_> = inner
                .peers
                .iter()
                .filter(|p| p.state.is_active() && self.nodes.is_reachable(p.node))
                .filter_map(|p| Some((p.peer_id, p.state.is_leading(), p.automaton.clone()?)))
                .collect();
            v.sort_by_key(|(_, leading, _)| !*leading);
            v
        };
        for (peer_id, leading, automaton) in handles {
            f(peer_id, leading, &mut automaton.write());
        }
    }

    pub fn peers(&self) -> Vec<PeerInfo> {
        let inner = self.inner.lock();
        inner
            .peers
            .iter()
            .map(|p| PeerInfo {
                peer_id: p.peer_id,
                node: p.node,
                address: self
                    .nodes
                    .get(p.node)
                    .map(|n| n.address.clone())
                    .unwrap_or_default(),
                state: p.state.name().to_string(),
                persisted_index: p.persisted_index,
                applied_index: p.applied_index,
            })
            .collect()
    }

    pub fn health(&self) -> CellHealth {
        let inner = self.inner.lock();
        if inner.removed {
            return CellHealth::Failed;
        }
        let alive = self.alive_count(&inner);
        let leader_ok = inner
            .leader_index()
            .map_or(false, |l| self.nodes.is_reachable(inner.peers[l].node));
        if leader_ok && alive >= quorum(inner.peers.len()) {
            CellHealth::Good
        } else if alive > 0 {
            CellHealth::Degraded
        } else {
            CellHealth::Failed
        }
    }

    // ── Supervision ───────────────────────────────────────────────────

    fn elect_locked(&self, inner: &mut CellInner<A>, now: Instant) -> TabulaResult<bool> {
        let candidates: Vec<usize> = inner
            .peers
            .iter()
            .filter(|p| !p.state.is_stopped() && self.nodes.is_reachable(p.node))
            .map(|p| p.peer_id)
            .collect();
        if candidates.len() < quorum(inner.peers.len()) {
            tracing::debug!(cell = %self.id, candidates = candidates.len(), "not enough peers for elections");
            return Ok(false);
        }
        let winner = candidates
            .iter()
            .copied()
            .max_by_key(|&i| (inner.peers[i].persisted_index, std::cmp::Reverse(i)))
            .ok_or_else(|| TabulaError::internal("empty candidate set"))?;
        inner.epoch += 1;
        let epoch = inner.epoch;
        for &i in &candidates {
            let peer = &mut inner.peers[i];
            let state = peer.state.start_elections(now);
            peer.state = if i == winner {
                state.win_election(epoch)?
            } else {
                state.follow(epoch, winner)
            };
        }
        inner.leader_lost_at = None;
        let CellInner { store, peers, .. } = &mut *inner;
        for &i in &candidates {
            if catch_up(self.id, store, &mut peers[i], &self.factory)? {
                self.metrics.recoveries.fetch_add(1, Ordering::Relaxed);
            }
        }
        self.metrics.elections.fetch_add(1, Ordering::Relaxed);
        tracing::info!(
            cell = %self.id,
            epoch,
            leader = winner,
            node = %peers[winner].node,
            "cell leader elected"
        );
        Ok(true)
    }

    fn spare_node(&self, inner: &CellInner<A>) -> Option<NodeId> {
        let used: Vec<NodeId> = inner.peers.iter().map(|p| p.node).collect();
        self.nodes
            .reachable()
            .into_iter()
            .map(|n| n.id)
            .find(|id| !used.contains(id))
    }

    /// One supervision pass: stop unreachable peers, revoke long-dead ones onto
    /// spare nodes, re-elect when the leader is gone, and catch up followers.
    pub fn supervise_at(&self, now: Instant) -> TabulaResult<()> {
        let config = self.config.get();
        let mut guard = self.inner.lock();
        let inner = &mut *guard;
        if inner.removed {
            return Ok(());
        }
        let leader = inner.leader_index();

        for i in 0..inner.peers.len() {
            let reachable = self.nodes.is_reachable(inner.peers[i].node);
            let peer = &mut inner.peers[i];
            if !reachable {
                if peer.unreachable_since.is_none() {
                    peer.unreachable_since = Some(now);
                }
                if !peer.state.is_stopped() {
                    let was_leading = peer.state.is_leading();
                    peer.state = peer.state.stop(now);
                    peer.automaton = None;
                    tracing::warn!(cell = %self.id, peer = i, node = %peer.node, "peer stopped: node unreachable");
                    if was_leading {
                        inner.leader_lost_at = Some(now);
                    }
                }
                continue;
            }
            peer.unreachable_since = None;
            if peer.state.is_stopped() {
                peer.state = match leader.filter(|&l| l != i) {
                    Some(l) if inner.leader_lost_at.is_none() => {
                        peer.state.follow(inner.epoch, l)
                    }
                    _ => peer.state.start_elections(now),
                };
                tracing::info!(cell = %self.id, peer = i, state = %peer.state, "peer rejoined");
            }
        }

        let revocation = config.peer_revocation_timeout();
        for i in 0..inner.peers.len() {
            let expired = inner.peers[i]
                .unreachable_since
                .map_or(false, |t| now.saturating_duration_since(t) >= revocation);
            if !expired {
                continue;
            }
            let Some(spare) = self.spare_node(inner) else {
                tracing::debug!(cell = %self.id, peer = i, "no spare node to revoke peer onto");
                break;
            };
            let leader = inner.leader_index();
            let epoch = inner.epoch;
            let peer = &mut inner.peers[i];
            let from = peer.node;
            peer.node = spare;
            peer.unreachable_since = None;
            peer.automaton = None;
            peer.applied_index = 0;
            peer.persisted_index = 0;
            peer.state = match leader {
                Some(l) => peer.state.follow(epoch, l),
                None => peer.state.start_elections(now),
            };
            self.metrics.revocations.fetch_add(1, Ordering::Relaxed);
            tracing::info!(cell = %self.id, peer = i, from = %from, to = %spare, "peer revoked");
        }

        let reassignment = config.leader_reassignment_timeout();
        let leader_alive = inner.leader_index().is_some();
        let waited = inner
            .leader_lost_at
            .map_or(true, |t| now.saturating_duration_since(t) >= reassignment);
        if !leader_alive && waited {
            self.elect_locked(inner, now)?;
        }

        let CellInner { store, peers, .. } = inner;
        for peer in peers.iter_mut() {
            if peer.state.is_active() && self.nodes.is_reachable(peer.node) {
                if catch_up(self.id, store, peer, &self.factory)? {
                    self.metrics.recoveries.fetch_add(1, Ordering::Relaxed);
                }
            }
        }
        Ok(())
    }

    /// Drop every peer's in-memory state and recover from persistence.
    pub fn restart(&self) -> TabulaResult<()> {
        let now = Instant::now();
        let mut inner = self.inner.lock();
        for peer in inner.peers.iter_mut() {
            peer.automaton = None;
            peer.applied_index = 0;
            if !peer.state.is_stopped() {
                peer.state = peer.state.start_elections(now);
            }
        }
        inner.leader_lost_at = None;
        tracing::info!(cell = %self.id, "cell restarting");
        self.elect_locked(&mut inner, now)?;
        Ok(())
    }

    /// Tear the cell down; later commits fail.
    pub fn remove(&self) {
        let now = Instant::now();
        let mut inner = self.inner.lock();
        inner.removed = true;
        inner.store.clear();
        for peer in inner.peers.iter_mut() {
            peer.state = peer.state.stop(now);
            peer.automaton = None;
        }
        tracing::info!(cell = %self.id, "cell removed");
    }
}

impl<A: Automaton> Supervised for Cell<A> {
    fn supervise(&self, now: Instant) {
        if let Err(e) = self.supervise_at(now) {
            tracing::error!(cell = %self.id, error = %e, "cell supervision failed");
        }
    }
}

#[cfg(test)]
mod tests {
    use std::collections::BTreeMap;
    use std::time::Duration;

    use serde::{Deserialize, Serialize};

    use tabula_common::Medium;

    use super::*;

    #[derive(Default)]
    struct Counters {
        values: BTreeMap<String, i64>,
    }

    #[derive(Debug, Clone, Serialize, Deserialize)]
    enum CounterOp {
        Add(String, i64),
        Reset(String),
    }

    impl Automaton for Counters {
        type Mutation = CounterOp;
        type Response = i64;

        fn validate(&self, mutation: &CounterOp) -> TabulaResult<()> {
            match mutation {
                CounterOp::Reset(name) if !self.values.contains_key(name) => {
                    Err(TabulaError::not_found(name.clone()))
                }
                _ => Ok(()),
            }
        }

        fn apply(&mut self, _index: u64, mutation: &CounterOp) -> TabulaResult<i64> {
            match mutation {
                CounterOp::Add(name, delta) => {
                    let v = self.values.entry(name.clone()).or_insert(0);
                    *v += delta;
                    Ok(*v)
                }
                CounterOp::Reset(name) => Ok(self.values.insert(name.clone(), 0).unwrap_or(0)),
            }
        }

        fn save_snapshot(&self) -> TabulaResult<Vec<u8>> {
            Ok(bincode::serialize(&self.values)?)
        }

        fn load_snapshot(&mut self, data: &[u8]) -> TabulaResult<()> {
            self.values = bincode::deserialize(data)?;
            Ok(())
        }
    }

    fn setup(nodes: usize, peers: usize) -> (Arc<NodeDirectory>, Cell<Counters>) {
        let dir = Arc::new(NodeDirectory::new());
        for i in 0..nodes {
            dir.add_node(format!("node{i}"), Medium::default()).unwrap();
        }
        let config = ConfigHandle::new(TabletManagerConfig {
            peer_count: peers,
            leader_reassignment_timeout_ms: 100,
            peer_revocation_timeout_ms: 300,
            ..Default::default()
        });
        let cell = Cell::new(
            CellId(0),
            "default",
            peers,
            dir.clone(),
            config,
            Arc::new(Counters::default),
        )
        .unwrap();
        (dir, cell)
    }

    fn value(cell: &Cell<Counters>, name: &str) -> Option<i64> {
        cell.with_leader(|c| c.values.get(name).copied()).unwrap()
    }

    fn address_of(cell: &Cell<Counters>, state: &str) -> Vec<String> {
        cell.peers()
            .into_iter()
            .filter(|p| p.state == state)
            .map(|p| p.address)
            .collect()
    }

    #[test]
    fn test_commit_replicates_to_followers() {
        let (_, cell) = setup(3, 3);
        assert_eq!(cell.commit(CounterOp::Add("a".into(), 2)).unwrap(), 2);
        assert_eq!(cell.commit(CounterOp::Add("a".into(), 3)).unwrap(), 5);
        let followers = cell.followers();
        assert_eq!(followers.len(), 2);
        for f in followers {
            assert_eq!(f.automaton.read().values.get("a"), Some(&5));
        }
        assert_eq!(cell.health(), CellHealth::Good);
        assert_eq!(address_of(&cell, "leading").len(), 1);
    }

    #[test]
    fn test_rejected_mutation_is_not_logged() {
        let (_, cell) = setup(1, 1);
        assert!(cell.commit(CounterOp::Reset("missing".into())).is_err());
        assert_eq!(cell.last_index(), 0);
        assert_eq!(cell.metrics().mutations_rejected, 1);
    }

    #[test]
    fn test_follower_catches_up_after_unban() {
        let (dir, cell) = setup(3, 3);
        let follower = address_of(&cell, "following")[0].clone();
        dir.set_banned(&follower, true).unwrap();
        let now = Instant::now();
        cell.supervise_at(now).unwrap();
        for _ in 0..10 {
            cell.commit(CounterOp::Add("a".into(), 1)).unwrap();
        }
        assert_eq!(address_of(&cell, "stopped"), vec![follower.clone()]);

        dir.set_banned(&follower, false).unwrap();
        cell.supervise_at(now + Duration::from_millis(10)).unwrap();
        assert!(cell.followers().iter().all(|f| f.automaton.read().values["a"] == 10));
        assert!(cell.peers().iter().all(|p| p.applied_index == 10));
    }

    #[test]
    fn test_leader_reassignment_waits_for_timeout() {
        let (dir, cell) = setup(3, 2);
        cell.commit(CounterOp::Add("k".into(), 7)).unwrap();
        let leader = address_of(&cell, "leading")[0].clone();
        let follower = address_of(&cell, "following")[0].clone();
        dir.set_banned(&leader, true).unwrap();
        assert!(cell.commit(CounterOp::Add("k".into(), 1)).unwrap_err().is_retryable());

        let t0 = Instant::now();
        cell.supervise_at(t0).unwrap();
        assert!(address_of(&cell, "leading").is_empty());

        // Leader peer is revoked onto a spare node, then a leader is elected.
        cell.supervise_at(t0 + Duration::from_millis(400)).unwrap();
        assert_eq!(cell.health(), CellHealth::Good);
        let leaders = address_of(&cell, "leading");
        assert_eq!(leaders, vec![follower]);
        assert_eq!(value(&cell, "k"), Some(7));
        assert_eq!(cell.metrics().revocations, 1);
    }

    #[test]
    fn test_leader_loss_elects_follower_after_timeout() {
        let (dir, cell) = setup(3, 3);
        cell.commit(CounterOp::Add("k".into(), 1)).unwrap();
        let leader = address_of(&cell, "leading")[0].clone();
        dir.set_banned(&leader, true).unwrap();
        let t0 = Instant::now();
        cell.supervise_at(t0).unwrap();
        cell.supervise_at(t0 + Duration::from_millis(150)).unwrap();
        assert_eq!(address_of(&cell, "leading").len(), 1);
        assert_ne!(address_of(&cell, "leading")[0], leader);
        assert_eq!(cell.commit(CounterOp::Add("k".into(), 1)).unwrap(), 2);
    }

    #[test]
    fn test_all_peers_banned_recover_on_other_nodes() {
        let (dir, cell) = setup(5, 2);
        cell.commit(CounterOp::Add("k".into(), 3)).unwrap();
        for p in cell.peers() {
            dir.set_banned(&p.address, true).unwrap();
        }
        let t0 = Instant::now();
        cell.supervise_at(t0).unwrap();
        assert_eq!(cell.health(), CellHealth::Failed);
        cell.supervise_at(t0 + Duration::from_millis(500)).unwrap();
        assert_eq!(cell.health(), CellHealth::Good);
        assert_eq!(value(&cell, "k"), Some(3));
    }

    #[test]
    fn test_recover_from_snapshot() {
        let (dir, cell) = setup(5, 2);
        cell.commit(CounterOp::Add("k".into(), 1)).unwrap();
        cell.commit(CounterOp::Add("k".into(), 1)).unwrap();
        assert_eq!(cell.build_snapshot().unwrap(), 2);
        assert_eq!(cell.snapshot_count(), 1);
        assert_eq!(cell.changelog_record_count(), 0);
        cell.commit(CounterOp::Add("k".into(), 1)).unwrap();

        for p in cell.peers() {
            dir.set_banned(&p.address, true).unwrap();
        }
        let t0 = Instant::now();
        cell.supervise_at(t0).unwrap();
        cell.supervise_at(t0 + Duration::from_millis(500)).unwrap();
        assert_eq!(cell.health(), CellHealth::Good);
        assert_eq!(value(&cell, "k"), Some(3));
    }

    #[test]
    fn test_restart_replays_state() {
        let (_, cell) = setup(3, 3);
        cell.commit(CounterOp::Add("x".into(), 4)).unwrap();
        cell.build_snapshot().unwrap();
        cell.commit(CounterOp::Add("x".into(), 1)).unwrap();
        let epoch = cell.epoch();
        cell.restart().unwrap();
        assert!(cell.epoch() > epoch);
        assert_eq!(value(&cell, "x"), Some(5));
    }

    #[test]
    fn test_quorum_loss_without_spare_nodes() {
        let (dir, cell) = setup(3, 3);
        for address in address_of(&cell, "following") {
            dir.set_banned(&address, true).unwrap();
        }
        let err = cell.commit(CounterOp::Add("a".into(), 1)).unwrap_err();
        assert!(matches!(
            err,
            TabulaError::Consistency(ConsistencyError::QuorumUnreachable { alive: 1, required: 2, .. })
        ));
        assert_eq!(cell.health(), CellHealth::Degraded);
    }

    #[test]
    fn test_not_enough_nodes_for_peers() {
        let dir = Arc::new(NodeDirectory::new());
        dir.add_node("only", Medium::default()).unwrap();
        let result = Cell::new(
            CellId(1),
            "default",
            2,
            dir,
            ConfigHandle::new(TabletManagerConfig::default()),
            Arc::new(Counters::default),
        );
        assert!(result.is_err());
    }
}
