//! Table lifecycle: create, alter, remove, mount, unmount, freeze, remount,
//! reshard, compact and introspection.

use std::collections::BTreeSet;
use std::sync::Arc;

use tabula_chunk::{ChunkListId, ChunkTree, ReplicationParams};
use tabula_common::datum::key_in_range;
use tabula_common::error::{TabulaError, TabulaResult};
use tabula_common::schema::TableSchema;
use tabula_common::security::{Acl, Permission};
use tabula_common::{CellId, ChunkId, Key, TableId, TabletId};
use tabula_tablet::store::decode_store_rows;
use tabula_tablet::{StaticStoreDescriptor, TabletCellHost, TabletMutation, TabletState};

use crate::cluster::{Cluster, ClusterState, DEFAULT_BUNDLE};
use crate::options::{MountOptions, ReshardOptions, TableAttributes, TableOptions, TabletRange};
use crate::table::{pick_split_keys, validate_pivot_keys, TableRecord, TabletInfo, TabletRecord};

fn table_mut<'a>(state: &'a mut ClusterState, path: &str) -> TabulaResult<&'a mut TableRecord> {
    state
        .tables
        .get_mut(path)
        .ok_or_else(|| TabulaError::not_found(format!("table {path}")))
}

fn tablet_mut<'a>(state: &'a mut ClusterState, path: &str, index: usize) -> TabulaResult<&'a mut TabletRecord> {
    table_mut(state, path)?
        .tablets
        .get_mut(index)
        .ok_or_else(|| TabulaError::internal(format!("table {path} has no tablet {index}")))
}

/// Cell of `bundle` hosting the fewest tablets.
fn least_loaded_cell(state: &ClusterState, bundle: &str) -> TabulaResult<CellId> {
    let mut load: Vec<(usize, CellId)> = state
        .cells
        .iter()
        .filter(|(_, host)| host.cell().bundle() == bundle)
        .map(|(id, _)| {
            let hosted = state
                .tables
                .values()
                .flat_map(|t| &t.tablets)
                .filter(|t| t.cell == Some(*id))
                .count();
            (hosted, *id)
        })
        .collect();
    load.sort();
    load.first()
        .map(|(_, id)| *id)
        .ok_or_else(|| TabulaError::state(format!("bundle {bundle} has no cells")))
}

fn overlaps(min: &Key, max: &Key, lower: &Key, upper: Option<&Key>) -> bool {
    max >= lower && upper.map_or(true, |u| min < u)
}

impl Cluster {
    // ── Create / alter / remove ──────────────────────────────────────

    /// Create a table. Replication left at its default takes the cluster's
    /// configured replication.
    pub fn create_table(&self, user: &str, path: &str, mut options: TableOptions) -> TabulaResult<TableId> {
        if path.is_empty() {
            return Err(TabulaError::argument("table path must be non-empty"));
        }
        if options.attributes.replication == ReplicationParams::default() {
            options.attributes.replication = self.default_replication();
        }
        options.schema.validate(options.dynamic)?;
        options.attributes.replication.validate()?;
        let pivots = match (options.dynamic, options.pivot_keys) {
            (true, pivots) => {
                let pivots = pivots.unwrap_or_else(|| vec![Key::empty()]);
                validate_pivot_keys(&options.schema, &pivots, &Key::empty(), None)?;
                pivots
            }
            (false, None) => Vec::new(),
            (false, Some(_)) => return Err(TabulaError::argument("static tables have no pivot keys")),
        };

        let _control = self.control.lock();
        let mut state = self.state.write();
        if state.tables.contains_key(path) || self.journals.exists(path) {
            return Err(TabulaError::argument(format!("node {path} already exists")));
        }
        self.security.check(user, path, &Acl::default(), Permission::Write)?;
        let bundle = options.bundle.unwrap_or_else(|| DEFAULT_BUNDLE.to_string());
        if !state.bundles.contains_key(&bundle) {
            return Err(TabulaError::not_found(format!("bundle {bundle}")));
        }

        let root = state.tree.create_list(None);
        let mut tablets = Vec::with_capacity(pivots.len());
        for pivot in pivots {
            state.tree.create_child_list(root, Some(pivot.clone()))?;
            tablets.push(TabletRecord::new(self.allocate_tablet_id(), pivot));
        }
        let id = self.allocate_table_id();
        tracing::info!(
            path,
            table = %id,
            dynamic = options.dynamic,
            tablets = tablets.len(),
            bundle = %bundle,
            "table created"
        );
        state.tables.insert(
            path.to_string(),
            TableRecord {
                id,
                path: path.to_string(),
                schema: options.schema,
                dynamic: options.dynamic,
                attributes: options.attributes,
                bundle,
                acl: options.acl,
                tablets,
                root,
            },
        );
        Ok(id)
    }

    /// Replace the schema. Dynamic tables must be fully unmounted; key
    /// columns may not change once the table holds rows.
    pub fn alter_table(&self, user: &str, path: &str, schema: TableSchema) -> TabulaResult<()> {
        let _control = self.control.lock();
        let mut state = self.state.write();
        let table = self.table_for(&state, user, path, Permission::Write)?;
        if let Some(t) = table.tablets.iter().find(|t| t.state != TabletState::Unmounted) {
            return Err(t.invalid_state("alter table"));
        }
        let has_rows = !state.tree.chunks_of(table.root).is_empty();
        table.schema.validate_alter(&schema, table.dynamic, has_rows)?;
        table_mut(&mut state, path)?.schema = schema;
        tracing::info!(path, "table altered");
        Ok(())
    }

    pub fn table_attributes(&self, user: &str, path: &str) -> TabulaResult<TableAttributes> {
        let state = self.state.read();
        Ok(self.table_for(&state, user, path, Permission::Read)?.attributes.clone())
    }

    /// Change table attributes. Mounted tablets pick up tablet settings on
    /// the next remount.
    pub fn update_table_attributes(
        &self,
        user: &str,
        path: &str,
        update: impl FnOnce(&mut TableAttributes),
    ) -> TabulaResult<()> {
        let mut state = self.state.write();
        let mut attributes = self.table_for(&state, user, path, Permission::Write)?.attributes.clone();
        update(&mut attributes);
        attributes.replication.validate()?;
        table_mut(&mut state, path)?.attributes = attributes;
        Ok(())
    }

    /// Remove a table, force-unmounting its tablets. Chunks still pinned by
    /// snapshot locks survive until the locks are released.
    pub fn remove_table(&self, user: &str, path: &str) -> TabulaResult<()> {
        let _control = self.control.lock();
        let mut state = self.state.write();
        self.table_for(&state, user, path, Permission::Write)?;
        let Some(table) = state.tables.remove(path) else {
            return Err(TabulaError::not_found(format!("table {path}")));
        };
        for tablet in &table.tablets {
            let Some(cell) = tablet.cell else { continue };
            let result = Self::host(&state, cell).and_then(|host| {
                host.cell().commit(TabletMutation::UnmountTablet {
                    tablet: tablet.id,
                    force: true,
                })
            });
            if let Err(e) = result {
                tracing::warn!(tablet = %tablet.id, cell = %cell, error = %e, "cannot unmount removed tablet");
            }
        }
        let released = state.tree.unref_list(table.root)?;
        self.release_chunks(&released);
        tracing::info!(path, released = released.len(), "table removed");
        Ok(())
    }

    // ── Move / copy ──────────────────────────────────────────────────

    fn move_one(&self, state: &mut ClusterState, user: &str, src: &str, dst: &str) -> TabulaResult<()> {
        if dst.is_empty() {
            return Err(TabulaError::argument("table path must be non-empty"));
        }
        let table = self.table_for(state, user, src, Permission::Write)?;
        if let Some(t) = table.tablets.iter().find(|t| t.state != TabletState::Unmounted) {
            return Err(t.invalid_state("move table"));
        }
        if state.tables.contains_key(dst) || self.journals.exists(dst) {
            return Err(TabulaError::argument(format!("node {dst} already exists")));
        }
        self.security.check(user, dst, &table.acl, Permission::Write)?;
        let mut table = state
            .tables
            .remove(src)
            .ok_or_else(|| TabulaError::not_found(format!("table {src}")))?;
        table.path = dst.to_string();
        state.tables.insert(dst.to_string(), table);
        Ok(())
    }

    /// Rename a table. Dynamic tables must be fully unmounted.
    pub fn move_table(&self, user: &str, src: &str, dst: &str) -> TabulaResult<()> {
        self.move_tables(user, &[(src, dst)])
    }

    /// Apply `moves` in order as one operation: when any move fails the
    /// ones already applied are undone. A swap is three moves through a
    /// temporary path.
    pub fn move_tables(&self, user: &str, moves: &[(&str, &str)]) -> TabulaResult<()> {
        let _control = self.control.lock();
        let mut state = self.state.write();
        for (done, &(src, dst)) in moves.iter().enumerate() {
            if let Err(e) = self.move_one(&mut state, user, src, dst) {
                for &(src, dst) in moves[..done].iter().rev() {
                    if let Some(mut table) = state.tables.remove(dst) {
                        table.path = src.to_string();
                        state.tables.insert(src.to_string(), table);
                    }
                }
                tracing::warn!(src, dst, undone = done, error = %e, "table move failed");
                return Err(e);
            }
            tracing::info!(src, dst, "table moved");
        }
        Ok(())
    }

    /// Copy a static table. The copy shares the source's chunk tree until
    /// either side writes. Dynamic tables cannot be copied.
    pub fn copy_table(&self, user: &str, src: &str, dst: &str) -> TabulaResult<TableId> {
        if dst.is_empty() {
            return Err(TabulaError::argument("table path must be non-empty"));
        }
        let _control = self.control.lock();
        let mut state = self.state.write();
        let table = self.table_for(&state, user, src, Permission::Read)?;
        table.require_static()?;
        if state.tables.contains_key(dst) || self.journals.exists(dst) {
            return Err(TabulaError::argument(format!("node {dst} already exists")));
        }
        self.security.check(user, dst, &table.acl, Permission::Write)?;
        let mut copy = table.clone();
        state.tree.ref_list(copy.root)?;
        copy.id = self.allocate_table_id();
        copy.path = dst.to_string();
        let id = copy.id;
        state.tables.insert(dst.to_string(), copy);
        tracing::info!(src, dst, table = %id, "table copied");
        Ok(id)
    }

    pub fn table_exists(&self, path: &str) -> bool {
        self.state.read().tables.contains_key(path)
    }

    pub fn table_schema(&self, user: &str, path: &str) -> TabulaResult<TableSchema> {
        let state = self.state.read();
        Ok(self.table_for(&state, user, path, Permission::Read)?.schema.clone())
    }

    // ── Mount / unmount ──────────────────────────────────────────────

    fn store_descriptors(&self, tree: &ChunkTree, list: ChunkListId) -> TabulaResult<Vec<StaticStoreDescriptor>> {
        let mut stores = Vec::new();
        for chunk in tree.chunks_of(list) {
            let meta = self.chunks.meta(chunk)?;
            if let Some((min_key, max_key)) = meta.boundary_keys {
                stores.push(StaticStoreDescriptor {
                    chunk_id: chunk,
                    min_key,
                    max_key,
                    row_count: meta.row_count,
                    data_size: meta.data_size,
                });
            }
        }
        Ok(stores)
    }

    pub(crate) fn mount_tablet(
        &self,
        state: &mut ClusterState,
        path: &str,
        index: usize,
        cell: CellId,
        frozen: bool,
    ) -> TabulaResult<()> {
        let table = state
            .tables
            .get(path)
            .ok_or_else(|| TabulaError::not_found(format!("table {path}")))?;
        let list = state
            .tree
            .child_lists(table.root)
            .get(index)
            .copied()
            .ok_or_else(|| TabulaError::internal(format!("table {path} has no chunk list for tablet {index}")))?;
        let stores = self.store_descriptors(&state.tree, list)?;
        let descriptor = table.descriptor(index, &self.config.tablet);
        let tablet_id = descriptor.id;
        let host = Self::host(state, cell)?;

        tablet_mut(state, path, index)?.state = TabletState::Mounting;
        let mutation = TabletMutation::MountTablet {
            descriptor,
            stores,
            frozen,
        };
        if let Err(e) = self.with_retry(|| host.cell().commit(mutation.clone())) {
            tablet_mut(state, path, index)?.state = TabletState::Unmounted;
            return Err(e);
        }
        let record = tablet_mut(state, path, index)?;
        record.state = if frozen { TabletState::Frozen } else { TabletState::Mounted };
        record.cell = Some(cell);
        tracing::info!(path, tablet = %tablet_id, cell = %cell, frozen, "tablet mounted");
        Ok(())
    }

    /// Mount the unmounted tablets of `options.range`. Tablets go to the
    /// requested cell or to the least loaded cell of the table's bundle.
    pub fn mount_table(&self, user: &str, path: &str, options: &MountOptions) -> TabulaResult<()> {
        let _control = self.control.lock();
        let mut state = self.state.write();
        let table = self.table_for(&state, user, path, Permission::Mount)?;
        table.require_dynamic()?;
        let (first, last) = table.resolve_range(options.range)?;
        let bundle = table.bundle.clone();
        if let Some(cell) = options.cell {
            let host = Self::host(&state, cell)?;
            if host.cell().bundle() != bundle {
                return Err(TabulaError::argument(format!(
                    "cell {cell} belongs to bundle {}, table {path} to {bundle}",
                    host.cell().bundle()
                )));
            }
        }
        for index in first..=last {
            if table_mut(&mut state, path)?.tablets[index].state != TabletState::Unmounted {
                continue;
            }
            let cell = match options.cell {
                Some(cell) => cell,
                None => least_loaded_cell(&state, &bundle)?,
            };
            self.mount_tablet(&mut state, path, index, cell, options.freeze)?;
        }
        Ok(())
    }

    pub(crate) fn unmount_tablet(&self, state: &mut ClusterState, path: &str, index: usize, force: bool) -> TabulaResult<()> {
        let record = tablet_mut(state, path, index)?;
        let (tablet, previous) = (record.id, record.state);
        let Some(cell) = record.cell else {
            return Err(record.invalid_state("unmount"));
        };
        let host = Self::host(state, cell)?;
        tablet_mut(state, path, index)?.state = TabletState::Unmounting;

        let result = self.unmount_on_cell(state, &host, tablet, force);
        let record = tablet_mut(state, path, index)?;
        match result {
            Ok(()) => {
                record.state = TabletState::Unmounted;
                record.cell = None;
                tracing::info!(path, tablet = %tablet, cell = %cell, force, "tablet unmounted");
                Ok(())
            }
            Err(e) => {
                record.state = previous;
                Err(e)
            }
        }
    }

    fn unmount_on_cell(&self, state: &mut ClusterState, host: &TabletCellHost, tablet: TabletId, force: bool) -> TabulaResult<()> {
        if !force {
            let update = self.with_retry(|| host.rotate_and_flush(tablet))?;
            self.apply_store_update(state, &update)?;
        }
        self.with_retry(|| host.cell().commit(TabletMutation::UnmountTablet { tablet, force }))?;
        Ok(())
    }

    /// Unmount hosted tablets of `range`. Without `force` dynamic stores are
    /// flushed first so nothing written is lost.
    pub fn unmount_table(&self, user: &str, path: &str, range: TabletRange, force: bool) -> TabulaResult<()> {
        let _control = self.control.lock();
        let mut state = self.state.write();
        let table = self.table_for(&state, user, path, Permission::Mount)?;
        table.require_dynamic()?;
        let (first, last) = table.resolve_range(range)?;
        for index in first..=last {
            if table_mut(&mut state, path)?.tablets[index].cell.is_none() {
                continue;
            }
            self.unmount_tablet(&mut state, path, index, force)?;
        }
        Ok(())
    }

    /// Move a hosted tablet to another cell of the same bundle.
    pub fn move_tablet(&self, user: &str, path: &str, tablet: TabletId, cell: CellId) -> TabulaResult<()> {
        let _control = self.control.lock();
        let mut state = self.state.write();
        let table = self.table_for(&state, user, path, Permission::Mount)?;
        let index = table
            .tablet_index(tablet)
            .ok_or_else(|| TabulaError::not_found(format!("{tablet} of table {path}")))?;
        let record = &table.tablets[index];
        let frozen = match record.state {
            TabletState::Mounted => false,
            TabletState::Frozen => true,
            _ => return Err(record.invalid_state("move")),
        };
        if record.cell == Some(cell) {
            return Ok(());
        }
        if Self::host(&state, cell)?.cell().bundle() != table.bundle {
            return Err(TabulaError::argument(format!("cell {cell} is not in bundle {}", table.bundle)));
        }
        self.unmount_tablet(&mut state, path, index, false)?;
        self.mount_tablet(&mut state, path, index, cell, frozen)
    }

    // ── Freeze / unfreeze / remount ──────────────────────────────────

    fn set_hosted_state(&self, host: &TabletCellHost, tablet: TabletId, state: TabletState) -> TabulaResult<()> {
        self.with_retry(|| host.cell().commit(TabletMutation::SetTabletState { tablet, state }))?;
        Ok(())
    }

    /// Flush and freeze mounted tablets; frozen tablets serve reads only.
    pub fn freeze_table(&self, user: &str, path: &str, range: TabletRange) -> TabulaResult<()> {
        let _control = self.control.lock();
        let mut state = self.state.write();
        let table = self.table_for(&state, user, path, Permission::Mount)?;
        table.require_dynamic()?;
        let (first, last) = table.resolve_range(range)?;
        for index in first..=last {
            let record = &table_mut(&mut state, path)?.tablets[index];
            match record.state {
                TabletState::Frozen => continue,
                TabletState::Mounted => {}
                _ => return Err(record.invalid_state("freeze")),
            }
            let (tablet, cell) = (record.id, record.cell);
            let host = Self::host(&state, cell.ok_or_else(|| TabulaError::internal("mounted tablet without cell"))?)?;

            tablet_mut(&mut state, path, index)?.state = TabletState::Freezing;
            let result = self.set_hosted_state(&host, tablet, TabletState::Freezing).and_then(|_| {
                let update = self.with_retry(|| host.rotate_and_flush(tablet))?;
                self.apply_store_update(&mut state, &update)?;
                self.set_hosted_state(&host, tablet, TabletState::Frozen)
            });
            let record = tablet_mut(&mut state, path, index)?;
            if let Err(e) = result {
                record.state = TabletState::Mounted;
                if let Err(restore) = self.set_hosted_state(&host, tablet, TabletState::Mounted) {
                    tracing::warn!(tablet = %tablet, error = %restore, "cannot restore tablet state");
                }
                return Err(e);
            }
            record.state = TabletState::Frozen;
            tracing::info!(path, tablet = %tablet, "tablet frozen");
        }
        Ok(())
    }

    pub fn unfreeze_table(&self, user: &str, path: &str, range: TabletRange) -> TabulaResult<()> {
        let _control = self.control.lock();
        let mut state = self.state.write();
        let table = self.table_for(&state, user, path, Permission::Mount)?;
        table.require_dynamic()?;
        let (first, last) = table.resolve_range(range)?;
        for index in first..=last {
            let record = &table_mut(&mut state, path)?.tablets[index];
            match record.state {
                TabletState::Mounted => continue,
                TabletState::Frozen => {}
                _ => return Err(record.invalid_state("unfreeze")),
            }
            let (tablet, cell) = (record.id, record.cell);
            let host = Self::host(&state, cell.ok_or_else(|| TabulaError::internal("frozen tablet without cell"))?)?;
            tablet_mut(&mut state, path, index)?.state = TabletState::Unfreezing;
            let result = self
                .set_hosted_state(&host, tablet, TabletState::Unfreezing)
                .and_then(|_| self.set_hosted_state(&host, tablet, TabletState::Mounted));
            let record = tablet_mut(&mut state, path, index)?;
            match result {
                Ok(()) => record.state = TabletState::Mounted,
                Err(e) => {
                    record.state = TabletState::Frozen;
                    return Err(e);
                }
            }
            tracing::info!(path, tablet = %tablet, "tablet unfrozen");
        }
        Ok(())
    }

    /// Push current table attributes to hosted tablets.
    pub fn remount_table(&self, user: &str, path: &str, range: TabletRange) -> TabulaResult<()> {
        let _control = self.control.lock();
        let state = self.state.read();
        let table = self.table_for(&state, user, path, Permission::Mount)?;
        table.require_dynamic()?;
        let (first, last) = table.resolve_range(range)?;
        let settings = table.tablet_settings(&self.config.tablet);
        for record in &table.tablets[first..=last] {
            let Some(cell) = record.cell else { continue };
            let host = Self::host(&state, cell)?;
            let mutation = TabletMutation::RemountTablet {
                tablet: record.id,
                settings: settings.clone(),
            };
            self.with_retry(|| host.cell().commit(mutation.clone()))?;
        }
        tracing::info!(path, first, last, "tablets remounted");
        Ok(())
    }

    // ── Reshard ──────────────────────────────────────────────────────

    /// Sorted distinct keys persisted for tablets `first..=last`, clipped to
    /// their combined range.
    fn persisted_keys(&self, state: &ClusterState, table: &TableRecord, first: usize, last: usize) -> TabulaResult<Vec<Key>> {
        let lists = state.tree.child_lists(table.root);
        let chunks: BTreeSet<ChunkId> = lists[first..=last]
            .iter()
            .flat_map(|list| state.tree.chunks_of(*list))
            .collect();
        let lower = &table.tablets[first].pivot_key;
        let upper = table.next_pivot(last);
        let width = table.schema.key_column_count();
        let mut keys = BTreeSet::new();
        for chunk in chunks {
            let records = self.chunks.read(chunk, 0, None)?;
            for (key, _) in decode_store_rows(&records, width)? {
                if key_in_range(&key, lower, upper.as_ref()) {
                    keys.insert(key);
                }
            }
        }
        Ok(keys.into_iter().collect())
    }

    /// Replace tablets `first..=last` by tablets starting at `pivots`. The
    /// new chunk lists share every chunk overlapping their range.
    fn reshard_tablets(&self, state: &mut ClusterState, path: &str, first: usize, last: usize, pivots: &[Key]) -> TabulaResult<()> {
        let ClusterState { tables, tree, .. } = state;
        let table = tables
            .get_mut(path)
            .ok_or_else(|| TabulaError::not_found(format!("table {path}")))?;
        let upper = table.next_pivot(last);
        // Everything fallible that reads chunks happens before the tree changes.
        let chunks: BTreeSet<ChunkId> = tree.child_lists(table.root)[first..=last]
            .iter()
            .flat_map(|list| tree.chunks_of(*list))
            .collect();
        let mut bounded = Vec::new();
        for chunk in chunks {
            if let Some((min, max)) = self.chunks.meta(chunk)?.boundary_keys {
                bounded.push((chunk, min, max));
            }
        }
        table.root = tree.cow_root(table.root)?;

        let mut new_lists = Vec::with_capacity(pivots.len());
        for (i, pivot) in pivots.iter().enumerate() {
            let next = pivots.get(i + 1).or(upper.as_ref());
            let list = tree.create_list(Some(pivot.clone()));
            for (chunk, min, max) in &bounded {
                if overlaps(min, max, pivot, next) {
                    tree.attach_chunk(list, *chunk)?;
                }
            }
            new_lists.push(list);
        }
        let released = tree.splice_lists(table.root, first..last + 1, new_lists)?;
        let tablets: Vec<TabletRecord> = pivots
            .iter()
            .map(|pivot| TabletRecord::new(self.allocate_tablet_id(), pivot.clone()))
            .collect();
        table.tablets.splice(first..=last, tablets).for_each(drop);
        self.release_chunks(&released);
        Ok(())
    }

    /// Pivots for the unmounted range `first..=last`, then the new layout.
    fn reshard_unmounted(
        &self,
        state: &mut ClusterState,
        path: &str,
        first: usize,
        last: usize,
        options: &ReshardOptions,
        lower: &Key,
    ) -> TabulaResult<Vec<Key>> {
        let pivots = match &options.pivot_keys {
            Some(pivots) => pivots.clone(),
            None => {
                let table = state
                    .tables
                    .get(path)
                    .ok_or_else(|| TabulaError::not_found(format!("table {path}")))?;
                let keys = self.persisted_keys(state, table, first, last)?;
                pick_split_keys(&keys, lower, options.tablet_count.unwrap_or(1))
            }
        };
        self.reshard_tablets(state, path, first, last, &pivots)?;
        Ok(pivots)
    }

    /// Change the pivots of tablets in `options.range`, either to explicit
    /// `pivot_keys` or to `tablet_count` tablets split by persisted data.
    /// Mounted tablets are resharded only with slicing enabled: they are
    /// flushed, unmounted, resharded and mounted back on their cell. When
    /// the reshard fails the unmounted tablets are mounted back as they were.
    pub fn reshard_table(&self, user: &str, path: &str, options: &ReshardOptions) -> TabulaResult<()> {
        let _control = self.control.lock();
        let mut state = self.state.write();
        let table = self.table_for(&state, user, path, Permission::Mount)?;
        table.require_dynamic()?;
        let (first, last) = table.resolve_range(options.range)?;
        let lower = table.tablets[first].pivot_key.clone();
        let upper = table.next_pivot(last);

        if let Some(pivots) = &options.pivot_keys {
            if options.tablet_count.is_some() {
                return Err(TabulaError::argument("pass either pivot keys or a tablet count, not both"));
            }
            validate_pivot_keys(&table.schema, pivots, &lower, upper.as_ref())?;
        } else {
            match options.tablet_count {
                Some(0) => return Err(TabulaError::argument("tablet count must be positive")),
                Some(_) => {}
                None => return Err(TabulaError::argument("pivot keys or a tablet count is required")),
            }
        }

        let hosted: Vec<(usize, CellId, bool)> = (first..=last)
            .filter_map(|i| {
                let t = &table.tablets[i];
                t.cell.map(|cell| (i, cell, t.state == TabletState::Frozen))
            })
            .collect();
        if let Some(t) = table.tablets[first..=last].iter().find(|t| t.state != TabletState::Unmounted) {
            if !options.enable_slicing {
                return Err(t.invalid_state("reshard"));
            }
            if !matches!(t.state, TabletState::Mounted | TabletState::Frozen) {
                return Err(t.invalid_state("reshard"));
            }
        }
        let mut unmounted = Vec::with_capacity(hosted.len());
        let mut result = Ok(Vec::new());
        for &(index, cell, frozen) in &hosted {
            if let Err(e) = self.unmount_tablet(&mut state, path, index, false) {
                result = Err(e);
                break;
            }
            unmounted.push((index, cell, frozen));
        }
        if result.is_ok() {
            result = self.reshard_unmounted(&mut state, path, first, last, options, &lower);
        }
        let pivots = match result {
            Ok(pivots) => pivots,
            Err(e) => {
                for (index, cell, frozen) in unmounted {
                    if let Err(restore) = self.mount_tablet(&mut state, path, index, cell, frozen) {
                        tracing::warn!(path, index, error = %restore, "cannot remount tablet after failed reshard");
                    }
                }
                return Err(e);
            }
        };
        tracing::info!(path, first, last, tablets = pivots.len(), "table resharded");

        if let Some((_, cell, frozen)) = hosted.first() {
            for index in first..first + pivots.len() {
                self.mount_tablet(&mut state, path, index, *cell, *frozen)?;
            }
        }
        Ok(())
    }

    // ── Compaction ───────────────────────────────────────────────────

    /// Flush and fully compact every hosted tablet.
    pub fn compact_table(&self, user: &str, path: &str) -> TabulaResult<()> {
        let _control = self.control.lock();
        let mut state = self.state.write();
        let table = self.table_for(&state, user, path, Permission::Mount)?;
        table.require_dynamic()?;
        let hosted: Vec<(TabletId, CellId)> = table
            .tablets
            .iter()
            .filter_map(|t| t.cell.map(|cell| (t.id, cell)))
            .collect();
        let retention = self.retention_timestamp();
        for (tablet, cell) in hosted {
            let host: Arc<TabletCellHost> = Self::host(&state, cell)?;
            let flushed = self.with_retry(|| host.rotate_and_flush(tablet))?;
            self.apply_store_update(&mut state, &flushed)?;
            let compacted = self.with_retry(|| host.compact_tablet(tablet, retention, true))?;
            self.apply_store_update(&mut state, &compacted)?;
        }
        tracing::info!(path, "table compacted");
        Ok(())
    }

    // ── Introspection ────────────────────────────────────────────────

    pub fn table_pivot_keys(&self, user: &str, path: &str) -> TabulaResult<Vec<Key>> {
        let state = self.state.read();
        Ok(self.table_for(&state, user, path, Permission::Read)?.pivot_keys())
    }

    pub fn tablet_info(&self, user: &str, path: &str) -> TabulaResult<Vec<TabletInfo>> {
        let state = self.state.read();
        let table = self.table_for(&state, user, path, Permission::Read)?;
        Ok(table
            .tablets
            .iter()
            .enumerate()
            .map(|(index, t)| {
                let statistics = t.cell.and_then(|cell| {
                    let host = state.cells.get(&cell)?;
                    host.cell()
                        .with_leader(|slot| slot.tablet(t.id).map(|tablet| tablet.statistics()))
                        .ok()?
                        .ok()
                });
                TabletInfo {
                    index,
                    id: t.id,
                    pivot_key: t.pivot_key.clone(),
                    state: t.state,
                    cell: t.cell,
                    statistics,
                    performance_counters: t.counters.snapshot(),
                }
            })
            .collect())
    }

    /// Stores, partitions and settings of a hosted tablet, as the leader
    /// sees them.
    pub fn tablet_orchid(&self, user: &str, path: &str, index: usize) -> TabulaResult<serde_json::Value> {
        let state = self.state.read();
        let table = self.table_for(&state, user, path, Permission::Read)?;
        let record = table
            .tablets
            .get(index)
            .ok_or_else(|| TabulaError::argument(format!("table {path} has no tablet {index}")))?;
        let Some(cell) = record.cell else {
            return Err(record.invalid_state("inspect"));
        };
        let host = Self::host(&state, cell)?;
        let tablet = record.id;
        host.cell().with_leader(|slot| slot.tablet(tablet).map(|t| t.orchid()))?
    }

    /// Chunks reachable from the table's chunk tree.
    pub fn table_chunk_ids(&self, user: &str, path: &str) -> TabulaResult<Vec<ChunkId>> {
        let state = self.state.read();
        let table = self.table_for(&state, user, path, Permission::Read)?;
        let mut chunks = state.tree.chunks_of(table.root);
        chunks.sort();
        chunks.dedup();
        Ok(chunks)
    }

    /// Reference counters of the table's root list and of each tablet list.
    pub fn chunk_tree_ref_counts(&self, path: &str) -> TabulaResult<(u32, Vec<u32>)> {
        let state = self.state.read();
        let table = state
            .tables
            .get(path)
            .ok_or_else(|| TabulaError::not_found(format!("table {path}")))?;
        let root = state.tree.ref_counter(table.root).unwrap_or(0);
        let lists = state
            .tree
            .child_lists(table.root)
            .into_iter()
            .map(|list| state.tree.ref_counter(list).unwrap_or(0))
            .collect();
        Ok((root, lists))
    }
}
