//! The replicated state of one tablet cell: every tablet it hosts plus the
//! transactions prepared against them.

use std::collections::BTreeMap;
use std::sync::Arc;

use serde::{Deserialize, Serialize};

use tabula_chunk::ChunkStore;
use tabula_common::error::{StateError, TabulaError, TabulaResult};
use tabula_common::{CellId, ChunkId, Key, StoreId, TabletId, Timestamp, TxnId};
use tabula_hydra::Automaton;

use crate::row::RowModification;
use crate::store::StaticStoreDescriptor;
use crate::tablet::{allocate_store_id, Tablet, TabletDescriptor, TabletSettings, TabletState};

#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum TabletMutation {
    MountTablet {
        descriptor: TabletDescriptor,
        stores: Vec<StaticStoreDescriptor>,
        frozen: bool,
    },
    /// Forget a tablet. Without `force` its dynamic stores must be flushed.
    UnmountTablet { tablet: TabletId, force: bool },
    RemountTablet { tablet: TabletId, settings: TabletSettings },
    SetTabletState { tablet: TabletId, state: TabletState },
    WriteRows {
        tablet: TabletId,
        timestamp: Timestamp,
        modifications: Vec<RowModification>,
    },
    PrepareTransaction {
        txn: TxnId,
        writes: Vec<(TabletId, Vec<RowModification>)>,
    },
    CommitTransaction { txn: TxnId, timestamp: Timestamp },
    AbortTransaction { txn: TxnId },
    RotateStore { tablet: TabletId },
    CommitFlush {
        tablet: TabletId,
        store: StoreId,
        chunk: Option<StaticStoreDescriptor>,
    },
    CommitCompaction {
        tablet: TabletId,
        removed: Vec<StoreId>,
        added: Vec<StaticStoreDescriptor>,
        /// Partition (by pivot) to split, and where.
        split: Option<(Key, Vec<Key>)>,
    },
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum MutationOutcome {
    Applied,
    /// Chunks the tablet referenced when it was unmounted.
    Unmounted(Vec<ChunkId>),
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
struct SlotState {
    tablets: BTreeMap<TabletId, Tablet>,
    prepared: BTreeMap<TxnId, Vec<(TabletId, Vec<RowModification>)>>,
    next_store_id: u64,
}

/// Automaton of a tablet cell.
pub struct TabletSlot {
    cell: CellId,
    chunks: Arc<dyn ChunkStore>,
    state: SlotState,
}

fn missing(tablet: TabletId) -> TabulaError {
    TabulaError::not_found(format!("{tablet} is not hosted by this cell"))
}

impl TabletSlot {
    pub fn new(cell: CellId, chunks: Arc<dyn ChunkStore>) -> Self {
        Self {
            cell,
            chunks,
            state: SlotState::default(),
        }
    }

    pub fn cell(&self) -> CellId {
        self.cell
    }

    pub fn chunks(&self) -> &dyn ChunkStore {
        self.chunks.as_ref()
    }

    pub fn tablet(&self, id: TabletId) -> TabulaResult<&Tablet> {
        self.state.tablets.get(&id).ok_or_else(|| missing(id))
    }

    pub fn tablets(&self) -> impl Iterator<Item = &Tablet> {
        self.state.tablets.values()
    }

    pub fn tablet_count(&self) -> usize {
        self.state.tablets.len()
    }

    pub fn prepared_transactions(&self) -> Vec<TxnId> {
        self.state.prepared.keys().copied().collect()
    }

    /// Preload pending stores of every in-memory tablet on this peer.
    pub fn preload_pending(&mut self) -> (usize, usize) {
        let chunks = self.chunks.clone();
        self.state
            .tablets
            .values_mut()
            .filter(|t| t.settings.in_memory_mode.is_enabled())
            .map(|t| t.preload_pending(chunks.as_ref()))
            .fold((0, 0), |acc, (c, f)| (acc.0 + c, acc.1 + f))
    }

    fn check_writes(&self, tablet: TabletId, modifications: &[RowModification]) -> TabulaResult<()> {
        let t = self.tablet(tablet)?;
        t.check_write_allowed(modifications.len())?;
        if let Some(m) = modifications.iter().find(|m| !t.contains_key(m.key())) {
            return Err(TabulaError::internal(format!(
                "key {} routed to {tablet} outside of its range",
                m.key()
            )));
        }
        Ok(())
    }

    fn check(&self, mutation: &TabletMutation) -> TabulaResult<()> {
        match mutation {
            TabletMutation::MountTablet { descriptor, .. } => {
                if self.state.tablets.contains_key(&descriptor.id) {
                    return Err(TabulaError::state(format!(
                        "{} is already mounted on {}",
                        descriptor.id, self.cell
                    )));
                }
                Ok(())
            }
            TabletMutation::UnmountTablet { tablet, force } => {
                let t = self.tablet(*tablet)?;
                if !force && (!t.active_store.is_empty() || !t.passive_stores.is_empty()) {
                    return Err(StateError::InvalidTabletState {
                        tablet: *tablet,
                        state: t.state.name().to_string(),
                        operation: "unmount with unflushed dynamic stores".to_string(),
                    }
                    .into());
                }
                Ok(())
            }
            TabletMutation::RemountTablet { tablet, .. }
            | TabletMutation::SetTabletState { tablet, .. }
            | TabletMutation::RotateStore { tablet } => self.tablet(*tablet).map(|_| ()),
            TabletMutation::WriteRows {
                tablet,
                modifications,
                ..
            } => self.check_writes(*tablet, modifications),
            TabletMutation::PrepareTransaction { txn, writes } => {
                if self.state.prepared.contains_key(txn) {
                    return Err(TabulaError::state(format!("{txn} is already prepared")));
                }
                for (tablet, modifications) in writes {
                    self.check_writes(*tablet, modifications)?;
                }
                Ok(())
            }
            TabletMutation::CommitTransaction { txn, .. } => {
                if !self.state.prepared.contains_key(txn) {
                    return Err(StateError::TransactionNotActive(*txn).into());
                }
                Ok(())
            }
            TabletMutation::AbortTransaction { .. } => Ok(()),
            TabletMutation::CommitFlush { tablet, store, .. } => {
                if self.tablet(*tablet)?.passive_store(*store).is_none() {
                    return Err(TabulaError::not_found(format!("passive {store} of {tablet}")));
                }
                Ok(())
            }
            TabletMutation::CommitCompaction { tablet, removed, .. } => {
                let t = self.tablet(*tablet)?;
                if let Some(id) = removed.iter().find(|id| !t.has_static_store(**id)) {
                    return Err(TabulaError::not_found(format!("static {id} of {tablet}")));
                }
                Ok(())
            }
        }
    }

    fn tablet_mut(&mut self, id: TabletId) -> TabulaResult<&mut Tablet> {
        self.state.tablets.get_mut(&id).ok_or_else(|| missing(id))
    }

    fn write_tablet(&mut self, id: TabletId, ts: Timestamp, modifications: &[RowModification]) -> TabulaResult<()> {
        let SlotState {
            tablets,
            next_store_id,
            ..
        } = &mut self.state;
        let tablet = tablets.get_mut(&id).ok_or_else(|| missing(id))?;
        tablet.write(ts, modifications, next_store_id);
        Ok(())
    }
}

impl Automaton for TabletSlot {
    type Mutation = TabletMutation;
    type Response = MutationOutcome;

    fn validate(&self, mutation: &TabletMutation) -> TabulaResult<()> {
        self.check(mutation)
    }

    fn apply(&mut self, _index: u64, mutation: &TabletMutation) -> TabulaResult<MutationOutcome> {
        // Replayed mutations were validated against the same state.
        self.check(mutation)?;
        match mutation {
            TabletMutation::MountTablet {
                descriptor,
                stores,
                frozen,
            } => {
                let active = allocate_store_id(&mut self.state.next_store_id);
                let mut tablet = Tablet::new(descriptor.clone(), active);
                for store in stores {
                    let id = allocate_store_id(&mut self.state.next_store_id);
                    tablet.add_static_store(id, store.clone());
                }
                if *frozen {
                    tablet.state = TabletState::Frozen;
                }
                tracing::info!(
                    cell = %self.cell,
                    tablet = %tablet.id,
                    stores = stores.len(),
                    state = %tablet.state,
                    "tablet mounted"
                );
                self.state.tablets.insert(tablet.id, tablet);
            }
            TabletMutation::UnmountTablet { tablet, force } => {
                let removed = self
                    .state
                    .tablets
                    .remove(tablet)
                    .ok_or_else(|| missing(*tablet))?;
                let chunks = removed.chunk_ids();
                tracing::info!(cell = %self.cell, tablet = %tablet, force, chunks = chunks.len(), "tablet unmounted");
                return Ok(MutationOutcome::Unmounted(chunks));
            }
            TabletMutation::RemountTablet { tablet, settings } => {
                self.tablet_mut(*tablet)?.apply_settings(settings.clone());
            }
            TabletMutation::SetTabletState { tablet, state } => {
                let t = self.tablet_mut(*tablet)?;
                tracing::debug!(tablet = %tablet, from = %t.state, to = %state, "tablet state changed");
                t.state = *state;
            }
            TabletMutation::WriteRows {
                tablet,
                timestamp,
                modifications,
            } => self.write_tablet(*tablet, *timestamp, modifications)?,
            TabletMutation::PrepareTransaction { txn, writes } => {
                self.state.prepared.insert(*txn, writes.clone());
            }
            TabletMutation::CommitTransaction { txn, timestamp } => {
                let writes = self.state.prepared.remove(txn).unwrap_or_default();
                for (tablet, modifications) in &writes {
                    // A tablet force-unmounted after prepare drops its part.
                    if let Err(e) = self.write_tablet(*tablet, *timestamp, modifications) {
                        tracing::warn!(txn = %txn, tablet = %tablet, error = %e, "prepared write dropped");
                    }
                }
            }
            TabletMutation::AbortTransaction { txn } => {
                self.state.prepared.remove(txn);
            }
            TabletMutation::RotateStore { tablet } => {
                let SlotState {
                    tablets,
                    next_store_id,
                    ..
                } = &mut self.state;
                let t = tablets.get_mut(tablet).ok_or_else(|| missing(*tablet))?;
                if !t.active_store.is_empty() {
                    let fresh = allocate_store_id(next_store_id);
                    t.rotate(fresh);
                }
            }
            TabletMutation::CommitFlush {
                tablet,
                store,
                chunk,
            } => {
                let SlotState {
                    tablets,
                    next_store_id,
                    ..
                } = &mut self.state;
                let t = tablets.get_mut(tablet).ok_or_else(|| missing(*tablet))?;
                t.take_passive_store(*store);
                if let Some(descriptor) = chunk {
                    let id = allocate_store_id(next_store_id);
                    t.add_static_store(id, descriptor.clone());
                    tracing::debug!(tablet = %tablet, store = %id, chunk = %descriptor.chunk_id, "store flushed");
                }
            }
            TabletMutation::CommitCompaction {
                tablet,
                removed,
                added,
                split,
            } => {
                let SlotState {
                    tablets,
                    next_store_id,
                    ..
                } = &mut self.state;
                let t = tablets.get_mut(tablet).ok_or_else(|| missing(*tablet))?;
                t.remove_static_stores(removed);
                if let Some((pivot, keys)) = split {
                    t.split_partition(pivot, keys);
                }
                for descriptor in added {
                    let id = allocate_store_id(next_store_id);
                    t.add_static_store(id, descriptor.clone());
                }
                tracing::debug!(
                    tablet = %tablet,
                    removed = removed.len(),
                    added = added.len(),
                    "compaction committed"
                );
            }
        }
        Ok(MutationOutcome::Applied)
    }

    fn save_snapshot(&self) -> TabulaResult<Vec<u8>> {
        Ok(bincode::serialize(&self.state)?)
    }

    fn load_snapshot(&mut self, data: &[u8]) -> TabulaResult<()> {
        let mut state: SlotState = bincode::deserialize(data)?;
        for tablet in state.tablets.values_mut() {
            tablet.reset_preload();
        }
        self.state = state;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use tabula_common::Value;

    use crate::row::ColumnWrite;
    use crate::tablet::tests::{descriptor, NoChunks};

    use super::*;

    fn slot() -> TabletSlot {
        let mut slot = TabletSlot::new(CellId(1), Arc::new(NoChunks));
        let mount = TabletMutation::MountTablet {
            descriptor: descriptor(100),
            stores: vec![],
            frozen: false,
        };
        slot.apply(1, &mount).unwrap();
        slot
    }

    fn put(k: i64) -> RowModification {
        RowModification::Write {
            key: Key::from(vec![k]),
            columns: vec![ColumnWrite::new("value", "v")],
        }
    }

    fn visible(slot: &TabletSlot, k: i64) -> bool {
        let (rows, _) = slot
            .tablet(TabletId(1))
            .unwrap()
            .lookup(&[Key::from(vec![k])], Timestamp::MAX, &NoChunks)
            .unwrap();
        rows[0].is_some()
    }

    #[test]
    fn test_prepared_writes_invisible_until_commit() {
        let mut slot = slot();
        let prepare = TabletMutation::PrepareTransaction {
            txn: TxnId(7),
            writes: vec![(TabletId(1), vec![put(1), put(2)])],
        };
        slot.apply(2, &prepare).unwrap();
        assert!(!visible(&slot, 1));
        assert_eq!(slot.prepared_transactions(), vec![TxnId(7)]);
        slot.apply(
            3,
            &TabletMutation::CommitTransaction {
                txn: TxnId(7),
                timestamp: Timestamp(10),
            },
        )
        .unwrap();
        assert!(visible(&slot, 1) && visible(&slot, 2));
        assert!(slot
            .validate(&TabletMutation::CommitTransaction {
                txn: TxnId(7),
                timestamp: Timestamp(11),
            })
            .is_err());
    }

    #[test]
    fn test_abort_discards_prepared_writes() {
        let mut slot = slot();
        slot.apply(
            2,
            &TabletMutation::PrepareTransaction {
                txn: TxnId(8),
                writes: vec![(TabletId(1), vec![put(5)])],
            },
        )
        .unwrap();
        slot.apply(3, &TabletMutation::AbortTransaction { txn: TxnId(8) })
            .unwrap();
        assert!(slot.prepared_transactions().is_empty());
        assert!(!visible(&slot, 5));
    }

    #[test]
    fn test_unmount_requires_flush() {
        let mut slot = slot();
        slot.apply(
            2,
            &TabletMutation::WriteRows {
                tablet: TabletId(1),
                timestamp: Timestamp(3),
                modifications: vec![put(1)],
            },
        )
        .unwrap();
        let unmount = TabletMutation::UnmountTablet {
            tablet: TabletId(1),
            force: false,
        };
        assert!(slot.validate(&unmount).is_err());
        slot.apply(3, &TabletMutation::RotateStore { tablet: TabletId(1) })
            .unwrap();
        let passive = slot.tablet(TabletId(1)).unwrap().passive_stores[0].id;
        slot.apply(
            4,
            &TabletMutation::CommitFlush {
                tablet: TabletId(1),
                store: passive,
                chunk: Some(StaticStoreDescriptor {
                    chunk_id: ChunkId(9),
                    min_key: Key::from(vec![1i64]),
                    max_key: Key::from(vec![1i64]),
                    row_count: 1,
                    data_size: 8,
                }),
            },
        )
        .unwrap();
        assert_eq!(
            slot.apply(5, &unmount).unwrap(),
            MutationOutcome::Unmounted(vec![ChunkId(9)])
        );
        assert_eq!(slot.tablet_count(), 0);
    }

    #[test]
    fn test_frozen_tablet_rejects_writes() {
        let mut slot = slot();
        slot.apply(
            2,
            &TabletMutation::SetTabletState {
                tablet: TabletId(1),
                state: TabletState::Frozen,
            },
        )
        .unwrap();
        let write = TabletMutation::WriteRows {
            tablet: TabletId(1),
            timestamp: Timestamp(3),
            modifications: vec![put(1)],
        };
        assert!(slot.validate(&write).unwrap_err().is_user_error());
    }

    #[test]
    fn test_snapshot_round_trip() {
        let mut slot = slot();
        slot.apply(
            2,
            &TabletMutation::WriteRows {
                tablet: TabletId(1),
                timestamp: Timestamp(3),
                modifications: vec![put(4)],
            },
        )
        .unwrap();
        let data = slot.save_snapshot().unwrap();
        let mut restored = TabletSlot::new(CellId(1), Arc::new(NoChunks));
        restored.load_snapshot(&data).unwrap();
        assert!(visible(&restored, 4));
        let (rows, _) = restored
            .tablet(TabletId(1))
            .unwrap()
            .lookup(&[Key::from(vec![4i64])], Timestamp::MAX, &NoChunks)
            .unwrap();
        assert_eq!(rows[0].as_ref().unwrap()[1], Value::from("v"));
    }
}
