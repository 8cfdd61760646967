//! Timestamps and client transactions.
//!
//! A transaction reads at its start timestamp and buffers its writes until
//! commit. Snapshot locks pin the locked table's chunk tree root; the pin is
//! released when the transaction ends either way.

use std::collections::{BTreeMap, BTreeSet};
use std::sync::atomic::{AtomicU64, Ordering};

use parking_lot::Mutex;
use serde::Serialize;

use tabula_chunk::ChunkListId;
use tabula_common::error::{StateError, TabulaError, TabulaResult};
use tabula_common::{CellId, Timestamp, TxnId};
use tabula_tablet::RowModification;

#[derive(Debug, Default)]
struct Clock {
    last: u64,
    /// Commit timestamps handed out whose writes are not applied everywhere.
    in_flight: BTreeSet<u64>,
}

/// Monotonic timestamps with a commit fence.
///
/// A write takes its commit timestamp with [`begin_commit`] once it is ready
/// to apply and hands it back with [`finish_commit`] when every participant
/// applied it. [`last_committed`] never reaches an in-flight commit, so a read
/// at that timestamp sees every commit completely or not at all.
///
/// [`begin_commit`]: TimestampProvider::begin_commit
/// [`finish_commit`]: TimestampProvider::finish_commit
/// [`last_committed`]: TimestampProvider::last_committed
#[derive(Debug)]
pub struct TimestampProvider {
    clock: Mutex<Clock>,
}

impl Default for TimestampProvider {
    fn default() -> Self {
        Self {
            clock: Mutex::new(Clock {
                last: Timestamp::MIN.0,
                in_flight: BTreeSet::new(),
            }),
        }
    }
}

impl TimestampProvider {
    pub fn new() -> Self {
        Self::default()
    }

    /// A fresh commit timestamp, above every timestamp handed to readers.
    pub fn begin_commit(&self) -> Timestamp {
        let mut clock = self.clock.lock();
        clock.last += 1;
        let ts = clock.last;
        clock.in_flight.insert(ts);
        Timestamp(ts)
    }

    pub fn finish_commit(&self, ts: Timestamp) {
        self.clock.lock().in_flight.remove(&ts.0);
    }

    /// Newest timestamp at or below which every commit is fully applied.
    pub fn last_committed(&self) -> Timestamp {
        let clock = self.clock.lock();
        match clock.in_flight.first() {
            Some(oldest) => Timestamp(oldest - 1),
            None => Timestamp(clock.last),
        }
    }

    /// Last timestamp handed out, applied or not.
    pub fn current(&self) -> Timestamp {
        Timestamp(self.clock.lock().last)
    }

    pub fn in_flight_count(&self) -> usize {
        self.clock.lock().in_flight.len()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum LockMode {
    /// Pin the current chunk tree; reads see it until the transaction ends.
    Snapshot,
    Shared,
    Exclusive,
}

#[derive(Debug, Clone)]
pub struct TxLock {
    pub path: String,
    pub mode: LockMode,
    /// Pinned root for snapshot locks.
    pub root: Option<ChunkListId>,
}

#[derive(Debug, Clone)]
pub struct BufferedWrite {
    pub path: String,
    pub modifications: Vec<RowModification>,
}

#[derive(Debug, Clone)]
pub struct Transaction {
    pub id: TxnId,
    pub start_timestamp: Timestamp,
    pub writes: Vec<BufferedWrite>,
    pub locks: Vec<TxLock>,
}

/// A commit decision not yet applied on one cell.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PendingCommit {
    pub cell: CellId,
    pub txn: TxnId,
    pub timestamp: Timestamp,
}

#[derive(Debug, Default)]
pub struct TransactionManager {
    next_id: AtomicU64,
    active: Mutex<BTreeMap<TxnId, Transaction>>,
    pending: Mutex<Vec<PendingCommit>>,
}

fn not_active(tx: TxnId) -> TabulaError {
    StateError::TransactionNotActive(tx).into()
}

impl TransactionManager {
    pub fn new() -> Self {
        Self::default()
    }

    /// Id for a transaction or an internal two-phase commit.
    pub fn allocate_id(&self) -> TxnId {
        TxnId(self.next_id.fetch_add(1, Ordering::Relaxed) + 1)
    }

    pub fn start(&self, start_timestamp: Timestamp) -> TxnId {
        let id = self.allocate_id();
        self.active.lock().insert(
            id,
            Transaction {
                id,
                start_timestamp,
                writes: Vec::new(),
                locks: Vec::new(),
            },
        );
        tracing::debug!(txn = %id, start = start_timestamp.0, "transaction started");
        id
    }

    pub fn is_active(&self, tx: TxnId) -> bool {
        self.active.lock().contains_key(&tx)
    }

    pub fn start_timestamp(&self, tx: TxnId) -> TabulaResult<Timestamp> {
        self.active
            .lock()
            .get(&tx)
            .map(|t| t.start_timestamp)
            .ok_or_else(|| not_active(tx))
    }

    pub fn buffer_write(&self, tx: TxnId, path: &str, modifications: Vec<RowModification>) -> TabulaResult<()> {
        let mut active = self.active.lock();
        let t = active.get_mut(&tx).ok_or_else(|| not_active(tx))?;
        t.writes.push(BufferedWrite {
            path: path.to_string(),
            modifications,
        });
        Ok(())
    }

    /// Check `mode` on `path` against locks of other transactions.
    pub fn check_lock(&self, tx: TxnId, path: &str, mode: LockMode) -> TabulaResult<()> {
        let active = self.active.lock();
        if !active.contains_key(&tx) {
            return Err(not_active(tx));
        }
        let conflict = active
            .values()
            .filter(|t| t.id != tx)
            .flat_map(|t| t.locks.iter().map(move |l| (t.id, l)))
            .find(|(_, l)| {
                l.path == path
                    && match (mode, l.mode) {
                        (LockMode::Snapshot, _) | (_, LockMode::Snapshot) => false,
                        (LockMode::Shared, LockMode::Shared) => false,
                        _ => true,
                    }
            });
        match conflict {
            Some((holder, lock)) => Err(StateError::Other(format!(
                "cannot take {mode:?} lock on {path}: {holder} holds a {:?} lock",
                lock.mode
            ))
            .into()),
            None => Ok(()),
        }
    }

    pub fn add_lock(&self, tx: TxnId, lock: TxLock) -> TabulaResult<()> {
        let mut active = self.active.lock();
        let t = active.get_mut(&tx).ok_or_else(|| not_active(tx))?;
        t.locks.push(lock);
        Ok(())
    }

    /// Root pinned by `tx` for `path`, if it holds a snapshot lock there.
    pub fn snapshot_root(&self, tx: TxnId, path: &str) -> TabulaResult<Option<ChunkListId>> {
        let active = self.active.lock();
        let t = active.get(&tx).ok_or_else(|| not_active(tx))?;
        Ok(t.locks
            .iter()
            .rev()
            .find(|l| l.path == path && l.mode == LockMode::Snapshot)
            .and_then(|l| l.root))
    }

    /// End a transaction, handing back what it buffered and pinned.
    pub fn take(&self, tx: TxnId) -> TabulaResult<Transaction> {
        self.active.lock().remove(&tx).ok_or_else(|| not_active(tx))
    }

    /// Start timestamp of the oldest active transaction.
    pub fn oldest_start(&self) -> Option<Timestamp> {
        self.active.lock().values().map(|t| t.start_timestamp).min()
    }

    pub fn active_count(&self) -> usize {
        self.active.lock().len()
    }

    pub fn push_pending(&self, commit: PendingCommit) {
        self.pending.lock().push(commit);
    }

    pub fn take_pending(&self) -> Vec<PendingCommit> {
        std::mem::take(&mut *self.pending.lock())
    }

    pub fn pending_timestamps(&self) -> BTreeSet<Timestamp> {
        self.pending.lock().iter().map(|c| c.timestamp).collect()
    }

    pub fn pending_count(&self) -> usize {
        self.pending.lock().len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_timestamps_are_monotonic() {
        let ts = TimestampProvider::new();
        let a = ts.begin_commit();
        let b = ts.begin_commit();
        assert!(a < b);
        assert!(a > Timestamp::MIN);
        assert_eq!(ts.current(), b);
    }

    #[test]
    fn test_last_committed_stops_below_in_flight_commits() {
        let ts = TimestampProvider::new();
        let a = ts.begin_commit();
        ts.finish_commit(a);
        assert_eq!(ts.last_committed(), a);

        let b = ts.begin_commit();
        let c = ts.begin_commit();
        assert_eq!(ts.in_flight_count(), 2);
        ts.finish_commit(c);
        assert_eq!(ts.last_committed(), a);
        ts.finish_commit(b);
        assert_eq!(ts.last_committed(), c);

        // Commits started after a read outrank it.
        let read = ts.last_committed();
        assert!(ts.begin_commit() > read);
    }

    #[test]
    fn test_transaction_lifecycle() {
        let manager = TransactionManager::new();
        let tx = manager.start(Timestamp(10));
        assert!(manager.is_active(tx));
        assert_eq!(manager.start_timestamp(tx).unwrap(), Timestamp(10));
        manager.buffer_write(tx, "//t", Vec::new()).unwrap();
        let t = manager.take(tx).unwrap();
        assert_eq!(t.writes.len(), 1);
        assert!(matches!(
            manager.take(tx),
            Err(TabulaError::State(StateError::TransactionNotActive(_)))
        ));
        assert!(manager.buffer_write(tx, "//t", Vec::new()).is_err());
    }

    #[test]
    fn test_oldest_start_bounds_retention() {
        let manager = TransactionManager::new();
        assert_eq!(manager.oldest_start(), None);
        let a = manager.start(Timestamp(5));
        let _b = manager.start(Timestamp(9));
        assert_eq!(manager.oldest_start(), Some(Timestamp(5)));
        manager.take(a).unwrap();
        assert_eq!(manager.oldest_start(), Some(Timestamp(9)));
        assert_eq!(manager.active_count(), 1);
    }

    #[test]
    fn test_lock_conflicts() {
        let manager = TransactionManager::new();
        let a = manager.start(Timestamp(2));
        let b = manager.start(Timestamp(2));
        manager
            .add_lock(
                a,
                TxLock {
                    path: "//t".into(),
                    mode: LockMode::Exclusive,
                    root: None,
                },
            )
            .unwrap();
        assert!(manager.check_lock(b, "//t", LockMode::Shared).is_err());
        assert!(manager.check_lock(b, "//t", LockMode::Snapshot).is_ok());
        assert!(manager.check_lock(b, "//other", LockMode::Exclusive).is_ok());
        assert!(manager.check_lock(a, "//t", LockMode::Exclusive).is_ok());
    }

    #[test]
    fn test_snapshot_root_lookup() {
        let manager = TransactionManager::new();
        let tx = manager.start(Timestamp(2));
        assert_eq!(manager.snapshot_root(tx, "//t").unwrap(), None);
        manager
            .add_lock(
                tx,
                TxLock {
                    path: "//t".into(),
                    mode: LockMode::Snapshot,
                    root: Some(ChunkListId(4)),
                },
            )
            .unwrap();
        assert_eq!(manager.snapshot_root(tx, "//t").unwrap(), Some(ChunkListId(4)));
    }

    #[test]
    fn test_pending_commits_drain() {
        let manager = TransactionManager::new();
        manager.push_pending(PendingCommit {
            cell: CellId(1),
            txn: TxnId(3),
            timestamp: Timestamp(7),
        });
        assert_eq!(manager.pending_count(), 1);
        assert_eq!(manager.take_pending().len(), 1);
        assert_eq!(manager.pending_count(), 0);
    }
}
