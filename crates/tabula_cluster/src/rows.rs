//! Row reads and writes, static table I/O and client transactions.

use std::collections::BTreeMap;
use std::time::{Duration, Instant};

use tabula_chunk::ChunkKind;
use tabula_common::datum::key_in_range;
use tabula_common::error::{ConsistencyError, TabulaError, TabulaResult, ValidationError};
use tabula_common::expression::Expression;
use tabula_common::schema::ColumnType;
use tabula_common::security::Permission;
use tabula_common::{Atomicity, CellId, Key, NamedRow, ReadFrom, TabletId, Timestamp, TxnId};
use tabula_tablet::store::decode_store_rows;
use tabula_tablet::{
    to_named_row, RowModification, RowPreparer, TabletCellHost, TabletMutation, TabletSlot, TabletState,
    VersionedRow,
};

use crate::cluster::{Cluster, ClusterState};
use crate::options::{ReadOptions, SelectQuery, WriteOptions};
use crate::reader::read_from_followers;
use crate::table::TableRecord;
use crate::transaction::{LockMode, PendingCommit, TxLock};

/// Modifications bound for one tablet.
struct Batch {
    index: usize,
    tablet: TabletId,
    cell: CellId,
    modifications: Vec<RowModification>,
}

/// Group modifications by target tablet. Every target must be mounted.
fn route(table: &TableRecord, modifications: Vec<RowModification>) -> TabulaResult<Vec<Batch>> {
    let mut groups: BTreeMap<usize, Vec<RowModification>> = BTreeMap::new();
    for modification in modifications {
        groups
            .entry(table.tablet_index_for(modification.key()))
            .or_default()
            .push(modification);
    }
    groups
        .into_iter()
        .map(|(index, modifications)| {
            let record = &table.tablets[index];
            match (record.state, record.cell) {
                (TabletState::Mounted, Some(cell)) => Ok(Batch {
                    index,
                    tablet: record.id,
                    cell,
                    modifications,
                }),
                _ => Err(record.invalid_state("write")),
            }
        })
        .collect()
}

fn check_atomicity(table: &TableRecord, requested: Option<Atomicity>) -> TabulaResult<()> {
    match requested {
        Some(requested) if requested != table.attributes.atomicity => Err(ValidationError::AtomicityMismatch {
            table: table.attributes.atomicity.to_string(),
            requested: requested.to_string(),
        }
        .into()),
        _ => Ok(()),
    }
}

fn compile_filter(table: &TableRecord, filter: &str) -> TabulaResult<Expression> {
    let schema = &table.schema;
    let expression = Expression::parse(filter, &|name| schema.column_index(name))?;
    let ty = expression.infer_type(&schema.column_types())?;
    if ty != ColumnType::Boolean {
        return Err(ValidationError::Expression {
            expression: filter.to_string(),
            reason: format!("predicate must be boolean, got {ty}"),
        }
        .into());
    }
    Ok(expression)
}

fn check_columns(table: &TableRecord, columns: Option<&[String]>) -> TabulaResult<()> {
    let Some(columns) = columns else {
        return Ok(());
    };
    match columns.iter().find(|c| table.schema.column(c).is_none()) {
        Some(missing) => Err(TabulaError::argument(format!(
            "table {} has no column {missing:?}",
            table.path
        ))),
        None => Ok(()),
    }
}

fn check_static_row(table: &TableRecord, row: &NamedRow) -> TabulaResult<()> {
    for column in row.columns() {
        let schema = table
            .schema
            .column(column)
            .ok_or_else(|| TabulaError::invalid_row(format!("unknown column {column:?}")))?;
        if let Some(value) = row.get(column) {
            if !value.fits(schema.column_type) {
                return Err(TabulaError::invalid_row(format!(
                    "column {column:?} expects {}, got {}",
                    schema.column_type,
                    value.type_name()
                )));
            }
        }
    }
    Ok(())
}

impl Cluster {
    // ── Writes ───────────────────────────────────────────────────────

    /// Insert or update rows of a dynamic table.
    pub fn insert_rows(&self, user: &str, path: &str, rows: &[NamedRow], options: &WriteOptions) -> TabulaResult<()> {
        let state = self.state.read();
        let table = self.table_for(&state, user, path, Permission::Write)?;
        table.require_dynamic()?;
        check_atomicity(table, options.atomicity)?;
        let preparer = RowPreparer::new(&table.schema)?;
        let modifications = rows
            .iter()
            .map(|row| preparer.prepare_write(row, options.update, options.aggregate))
            .collect::<TabulaResult<Vec<_>>>()?;
        self.write_modifications(&state, table, modifications, options.tx)
    }

    /// Delete rows by key. `keys` carry key columns only.
    pub fn delete_rows(&self, user: &str, path: &str, keys: &[NamedRow], options: &WriteOptions) -> TabulaResult<()> {
        let state = self.state.read();
        let table = self.table_for(&state, user, path, Permission::Write)?;
        table.require_dynamic()?;
        check_atomicity(table, options.atomicity)?;
        let preparer = RowPreparer::new(&table.schema)?;
        let modifications = keys
            .iter()
            .map(|key| preparer.prepare_delete(key))
            .collect::<TabulaResult<Vec<_>>>()?;
        self.write_modifications(&state, table, modifications, options.tx)
    }

    fn write_modifications(
        &self,
        state: &ClusterState,
        table: &TableRecord,
        modifications: Vec<RowModification>,
        tx: Option<TxnId>,
    ) -> TabulaResult<()> {
        if modifications.is_empty() {
            return Ok(());
        }
        if let Some(tx) = tx {
            return self.transactions.buffer_write(tx, &table.path, modifications);
        }
        let rows = modifications.len();
        let batches = route(table, modifications)?;
        let atomicity = table.attributes.atomicity;
        if atomicity == Atomicity::Full && batches.len() > 1 {
            let counts: Vec<(usize, usize)> = batches.iter().map(|b| (b.index, b.modifications.len())).collect();
            self.commit_two_phase(state, batches)?;
            for (index, written) in counts {
                table.tablets[index].counters.record_writes(written);
            }
        } else {
            // Without atomicity each tablet commits on its own; earlier
            // batches stay visible when a later one fails.
            for batch in batches {
                let (index, written) = (batch.index, batch.modifications.len());
                self.write_batch(state, batch)?;
                table.tablets[index].counters.record_writes(written);
            }
        }
        tabula_observability::record_rows_written(&table.path, rows, &atomicity.to_string());
        Ok(())
    }

    fn write_batch(&self, state: &ClusterState, batch: Batch) -> TabulaResult<()> {
        let host = Self::host(state, batch.cell)?;
        let timestamp = self.timestamps.begin_commit();
        let mutation = TabletMutation::WriteRows {
            tablet: batch.tablet,
            timestamp,
            modifications: batch.modifications,
        };
        let result = self.with_retry(|| host.cell().commit(mutation.clone()));
        self.timestamps.finish_commit(timestamp);
        result?;
        Ok(())
    }

    /// Prepare on every involved cell, then commit everywhere at one
    /// timestamp. A failed prepare aborts the prepared cells; a failed
    /// commit is retried by the tick and keeps the commit timestamp in
    /// flight until then, so latest reads stay below it.
    fn commit_two_phase(&self, state: &ClusterState, batches: Vec<Batch>) -> TabulaResult<Timestamp> {
        let mut per_cell: BTreeMap<CellId, Vec<(TabletId, Vec<RowModification>)>> = BTreeMap::new();
        for batch in batches {
            per_cell
                .entry(batch.cell)
                .or_default()
                .push((batch.tablet, batch.modifications));
        }
        let txn = self.transactions.allocate_id();
        let mut prepared: Vec<(CellId, std::sync::Arc<TabletCellHost>)> = Vec::new();
        for (cell, writes) in per_cell {
            let result = Self::host(state, cell).and_then(|host| {
                let mutation = TabletMutation::PrepareTransaction { txn, writes };
                self.with_retry(|| host.cell().commit(mutation.clone()))?;
                Ok(host)
            });
            match result {
                Ok(host) => prepared.push((cell, host)),
                Err(e) => {
                    for (cell, host) in &prepared {
                        if let Err(abort) = host.cell().commit(TabletMutation::AbortTransaction { txn }) {
                            tracing::warn!(cell = %cell, txn = %txn, error = %abort, "cannot abort prepared transaction");
                        }
                    }
                    tabula_observability::record_txn("abort");
                    return Err(e);
                }
            }
        }

        let timestamp = self.timestamps.begin_commit();
        let mut deferred = false;
        for (cell, host) in prepared {
            if let Err(e) = host.cell().commit(TabletMutation::CommitTransaction { txn, timestamp }) {
                tracing::warn!(cell = %cell, txn = %txn, error = %e, "commit deferred");
                self.transactions.push_pending(PendingCommit { cell, txn, timestamp });
                deferred = true;
            }
        }
        if !deferred {
            self.timestamps.finish_commit(timestamp);
        }
        tabula_observability::record_txn("commit");
        Ok(timestamp)
    }

    // ── Reads ────────────────────────────────────────────────────────

    /// One timestamp for the whole request. Sentinels resolve to the last
    /// fully applied commit, so every tablet reads the same point in time.
    fn read_timestamp(&self, options: &ReadOptions) -> TabulaResult<Timestamp> {
        if let Some(tx) = options.tx {
            return self.transactions.start_timestamp(tx);
        }
        let timestamp = options.timestamp.unwrap_or(Timestamp::SYNC_LAST_COMMITTED);
        if options.read_from == ReadFrom::Follower && timestamp == Timestamp::SYNC_LAST_COMMITTED {
            return Err(ConsistencyError::StaleReadUnbounded.into());
        }
        if timestamp.is_sentinel() {
            return Ok(self.timestamps.last_committed());
        }
        Ok(timestamp)
    }

    fn read_tablet<T, F>(&self, host: &TabletCellHost, read_from: ReadFrom, read: F) -> TabulaResult<T>
    where
        T: Send + 'static,
        F: Fn(&TabletSlot) -> TabulaResult<T> + Send + Sync + 'static,
    {
        match read_from {
            ReadFrom::Leader => self.with_retry(|| host.cell().with_leader(|slot| read(slot)).and_then(|r| r)),
            ReadFrom::Follower => read_from_followers(
                host.cell(),
                &self.nodes,
                Duration::from_millis(self.config.chunk.backup_request_delay_ms),
                self.config.chunk.operation_timeout(),
                read,
            ),
        }
    }

    /// Point lookups. Rows come back in request order; missing keys are
    /// skipped.
    pub fn lookup_rows(&self, user: &str, path: &str, keys: &[NamedRow], options: &ReadOptions) -> TabulaResult<Vec<NamedRow>> {
        let started = Instant::now();
        let result = self.lookup_rows_impl(user, path, keys, options);
        tabula_observability::record_lookup(
            path,
            "lookup",
            keys.len(),
            started.elapsed().as_micros() as u64,
            result.is_ok(),
        );
        result
    }

    fn lookup_rows_impl(&self, user: &str, path: &str, keys: &[NamedRow], options: &ReadOptions) -> TabulaResult<Vec<NamedRow>> {
        let state = self.state.read();
        let table = self.table_for(&state, user, path, Permission::Read)?;
        table.require_dynamic()?;
        check_columns(table, options.columns.as_deref())?;
        let preparer = RowPreparer::new(&table.schema)?;
        let keys = keys
            .iter()
            .map(|key| preparer.prepare_key(key))
            .collect::<TabulaResult<Vec<_>>>()?;
        let timestamp = self.read_timestamp(options)?;

        let mut groups: BTreeMap<usize, Vec<(usize, Key)>> = BTreeMap::new();
        for (position, key) in keys.into_iter().enumerate() {
            groups
                .entry(table.tablet_index_for(&key))
                .or_default()
                .push((position, key));
        }
        let mut results: Vec<Option<Vec<tabula_common::Value>>> = vec![None; groups.values().map(Vec::len).sum()];
        for (index, group) in groups {
            let record = &table.tablets[index];
            let cell = match record.cell {
                Some(cell) if record.is_readable() => cell,
                _ => return Err(record.invalid_state("lookup")),
            };
            let host = Self::host(&state, cell)?;
            let (positions, batch): (Vec<usize>, Vec<Key>) = group.into_iter().unzip();
            let tablet = record.id;
            let count = batch.len();
            let (values, stats) = self.read_tablet(&host, options.read_from, move |slot| {
                slot.tablet(tablet)?.lookup(&batch, timestamp, slot.chunks())
            })?;
            record.counters.record_lookup(count, &stats);
            for (position, value) in positions.into_iter().zip(values) {
                results[position] = value;
            }
        }
        Ok(results
            .into_iter()
            .flatten()
            .map(|values| to_named_row(&table.schema, &values, options.columns.as_deref()))
            .collect())
    }

    /// Full scan of a dynamic table filtered by an optional predicate, in
    /// key order.
    pub fn select_rows(&self, user: &str, path: &str, query: &SelectQuery, options: &ReadOptions) -> TabulaResult<Vec<NamedRow>> {
        let started = Instant::now();
        let result = self.select_rows_impl(user, path, query, options);
        tabula_observability::record_lookup(
            path,
            "select",
            result.as_ref().map_or(0, Vec::len),
            started.elapsed().as_micros() as u64,
            result.is_ok(),
        );
        result
    }

    fn select_rows_impl(&self, user: &str, path: &str, query: &SelectQuery, options: &ReadOptions) -> TabulaResult<Vec<NamedRow>> {
        let state = self.state.read();
        let table = self.table_for(&state, user, path, Permission::Read)?;
        table.require_dynamic()?;
        let columns = query.columns.as_deref().or(options.columns.as_deref());
        check_columns(table, columns)?;
        let predicate = query
            .filter
            .as_deref()
            .map(|filter| compile_filter(table, filter))
            .transpose()?;
        let timestamp = self.read_timestamp(options)?;

        let mut rows = Vec::new();
        for record in &table.tablets {
            let cell = match record.cell {
                Some(cell) if record.is_readable() => cell,
                _ => return Err(record.invalid_state("select")),
            };
            let host = Self::host(&state, cell)?;
            let tablet = record.id;
            let predicate = predicate.clone();
            let (values, stats) = self.read_tablet(&host, options.read_from, move |slot| {
                slot.tablet(tablet)?.scan(timestamp, predicate.as_ref(), slot.chunks())
            })?;
            record.counters.record_read(&stats);
            rows.extend(values.iter().map(|v| to_named_row(&table.schema, v, columns)));
        }
        Ok(rows)
    }

    // ── Static tables ────────────────────────────────────────────────

    /// Append rows to a static table as one new chunk.
    pub fn write_table(&self, user: &str, path: &str, rows: &[NamedRow]) -> TabulaResult<()> {
        let mut state = self.state.write();
        let table = self.table_for(&state, user, path, Permission::Write)?;
        table.require_static()?;
        if rows.is_empty() {
            return Ok(());
        }
        for row in rows {
            check_static_row(table, row)?;
        }
        let records = rows
            .iter()
            .map(bincode::serialize)
            .collect::<Result<Vec<_>, _>>()?;
        let chunk = self
            .chunks
            .write_sealed(ChunkKind::Static, &table.attributes.replication, &records, None)?;

        let ClusterState { tables, tree, .. } = &mut *state;
        let Some(table) = tables.get_mut(path) else {
            self.release_chunks(&[chunk]);
            return Err(TabulaError::not_found(format!("table {path}")));
        };
        table.root = tree.cow_root(table.root)?;
        tree.attach_chunk(table.root, chunk)?;
        tracing::debug!(path, chunk = %chunk, rows = rows.len(), "static rows written");
        Ok(())
    }

    /// Read a whole table from its chunks. Inside a transaction holding a
    /// snapshot lock the pinned chunk tree is read. Dynamic tables show
    /// their persisted rows only.
    pub fn read_table(&self, user: &str, path: &str, tx: Option<TxnId>) -> TabulaResult<Vec<NamedRow>> {
        let state = self.state.read();
        let table = self.table_for(&state, user, path, Permission::Read)?;
        let (root, timestamp) = match tx {
            Some(tx) => (
                self.transactions.snapshot_root(tx, path)?.unwrap_or(table.root),
                self.transactions.start_timestamp(tx)?,
            ),
            None => (table.root, self.timestamps.last_committed()),
        };

        if !table.dynamic {
            let mut rows = Vec::new();
            for chunk in state.tree.chunks_of(root) {
                for record in self.chunks.read(chunk, 0, None)? {
                    rows.push(bincode::deserialize::<NamedRow>(&record)?);
                }
            }
            return Ok(rows);
        }

        let width = table.schema.key_column_count();
        let lists = state.tree.child_lists(root);
        let pivot = |i: usize| lists.get(i).and_then(|l| state.tree.list(*l)).and_then(|n| n.pivot_key.clone());
        let mut rows = Vec::new();
        for (i, list) in lists.iter().enumerate() {
            let lower = pivot(i).unwrap_or_default();
            let upper = pivot(i + 1);
            let mut merged: BTreeMap<Key, VersionedRow> = BTreeMap::new();
            for chunk in state.tree.chunks_of(*list) {
                let records = self.chunks.read(chunk, 0, None)?;
                for (key, row) in decode_store_rows(&records, width)? {
                    if key_in_range(&key, &lower, upper.as_ref()) {
                        merged.entry(key).or_default().merge_from(&row);
                    }
                }
            }
            for (key, row) in &merged {
                if let Some(values) = row.read(key, &table.schema, timestamp) {
                    rows.push(to_named_row(&table.schema, &values, None));
                }
            }
        }
        Ok(rows)
    }

    // ── Transactions ─────────────────────────────────────────────────

    pub fn start_transaction(&self) -> TxnId {
        let tx = self.transactions.start(self.timestamps.last_committed());
        tabula_observability::record_txn("start");
        tx
    }

    /// Take a lock on a table for `tx`. A snapshot lock pins the table's
    /// current chunk tree until the transaction ends.
    pub fn lock(&self, user: &str, tx: TxnId, path: &str, mode: LockMode) -> TabulaResult<()> {
        let mut state = self.state.write();
        let table = self.table_for(&state, user, path, Permission::Read)?;
        let root = table.root;
        self.transactions.check_lock(tx, path, mode)?;
        let pinned = if mode == LockMode::Snapshot {
            state.tree.ref_list(root)?;
            Some(root)
        } else {
            None
        };
        let lock = TxLock {
            path: path.to_string(),
            mode,
            root: pinned,
        };
        if let Err(e) = self.transactions.add_lock(tx, lock) {
            if let Some(root) = pinned {
                let released = state.tree.unref_list(root)?;
                self.release_chunks(&released);
            }
            return Err(e);
        }
        tracing::debug!(txn = %tx, path, ?mode, "lock taken");
        Ok(())
    }

    /// Apply the buffered writes atomically and end the transaction.
    pub fn commit_transaction(&self, tx: TxnId) -> TabulaResult<Timestamp> {
        let transaction = self.transactions.take(tx)?;
        let result = self.commit_buffered(&transaction.writes);
        self.release_locks(&transaction.locks);
        if result.is_ok() {
            tracing::debug!(txn = %tx, writes = transaction.writes.len(), "transaction committed");
        }
        result
    }

    /// Drop the buffered writes and end the transaction.
    pub fn abort_transaction(&self, tx: TxnId) -> TabulaResult<()> {
        let transaction = self.transactions.take(tx)?;
        self.release_locks(&transaction.locks);
        tabula_observability::record_txn("abort");
        tracing::debug!(txn = %tx, "transaction aborted");
        Ok(())
    }

    fn commit_buffered(&self, writes: &[crate::transaction::BufferedWrite]) -> TabulaResult<Timestamp> {
        if writes.is_empty() {
            return Ok(self.timestamps.last_committed());
        }
        let state = self.state.read();
        let mut batches = Vec::new();
        let mut counts = Vec::new();
        for write in writes {
            let table = state
                .tables
                .get(&write.path)
                .ok_or_else(|| TabulaError::not_found(format!("table {}", write.path)))?;
            for batch in route(table, write.modifications.clone())? {
                counts.push((write.path.as_str(), batch.index, batch.modifications.len()));
                batches.push(batch);
            }
        }
        let timestamp = self.commit_two_phase(&state, batches)?;
        for (path, index, written) in counts {
            if let Some(record) = state.tables.get(path).and_then(|t| t.tablets.get(index)) {
                record.counters.record_writes(written);
            }
        }
        Ok(timestamp)
    }

    fn release_locks(&self, locks: &[TxLock]) {
        let roots: Vec<_> = locks.iter().filter_map(|l| l.root).collect();
        if roots.is_empty() {
            return;
        }
        let mut state = self.state.write();
        for root in roots {
            match state.tree.unref_list(root) {
                Ok(released) => self.release_chunks(&released),
                Err(e) => tracing::warn!(root = %root, error = %e, "cannot release snapshot"),
            }
        }
    }
}
