//! Multi-version rows.
//!
//! A row keeps a list of timestamped cells per value column plus the
//! timestamps of whole-row writes and deletes. Reads fold the cells visible at
//! a timestamp; compaction folds everything older than the retention
//! timestamp into a single version per column.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

use tabula_common::schema::TableSchema;
use tabula_common::{Key, NamedRow, Timestamp, Value};

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct VersionedValue {
    pub timestamp: Timestamp,
    pub value: Value,
    /// Merge into the previous value instead of replacing it.
    pub aggregate: bool,
}

/// One column assignment of a write.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ColumnWrite {
    pub column: String,
    pub value: Value,
    pub aggregate: bool,
}

impl ColumnWrite {
    pub fn new(column: impl Into<String>, value: impl Into<Value>) -> Self {
        Self {
            column: column.into(),
            value: value.into(),
            aggregate: false,
        }
    }

    pub fn aggregated(mut self) -> Self {
        self.aggregate = true;
        self
    }
}

/// A prepared change to a single key.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum RowModification {
    Write { key: Key, columns: Vec<ColumnWrite> },
    Delete { key: Key },
}

impl RowModification {
    pub fn key(&self) -> &Key {
        match self {
            RowModification::Write { key, .. } | RowModification::Delete { key } => key,
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct VersionedRow {
    pub write_timestamps: Vec<Timestamp>,
    pub delete_timestamps: Vec<Timestamp>,
    /// Cells per column, ascending by timestamp.
    pub columns: BTreeMap<String, Vec<VersionedValue>>,
}

fn latest_at(timestamps: &[Timestamp], ts: Timestamp) -> Option<Timestamp> {
    timestamps.iter().copied().filter(|t| *t <= ts).max()
}

fn insert_sorted(timestamps: &mut Vec<Timestamp>, ts: Timestamp) {
    let pos = timestamps.partition_point(|t| *t <= ts);
    if pos == 0 || timestamps[pos - 1] != ts {
        timestamps.insert(pos, ts);
    }
}

impl VersionedRow {
    pub fn is_empty(&self) -> bool {
        self.write_timestamps.is_empty()
            && self.delete_timestamps.is_empty()
            && self.columns.values().all(Vec::is_empty)
    }

    pub fn apply_write(&mut self, ts: Timestamp, columns: &[ColumnWrite]) {
        self.delete_timestamps.retain(|t| *t != ts);
        insert_sorted(&mut self.write_timestamps, ts);
        for write in columns {
            let cells = self.columns.entry(write.column.clone()).or_default();
            // Within one commit a later overwrite of the same column wins.
            if !write.aggregate {
                cells.retain(|c| c.timestamp != ts);
            }
            let pos = cells.partition_point(|c| c.timestamp <= ts);
            cells.insert(
                pos,
                VersionedValue {
                    timestamp: ts,
                    value: write.value.clone(),
                    aggregate: write.aggregate,
                },
            );
        }
    }

    pub fn apply_delete(&mut self, ts: Timestamp) {
        self.write_timestamps.retain(|t| *t != ts);
        for cells in self.columns.values_mut() {
            cells.retain(|c| c.timestamp != ts);
        }
        insert_sorted(&mut self.delete_timestamps, ts);
    }

    /// Union with the versions held by another store.
    pub fn merge_from(&mut self, other: &VersionedRow) {
        for ts in &other.write_timestamps {
            insert_sorted(&mut self.write_timestamps, *ts);
        }
        for ts in &other.delete_timestamps {
            insert_sorted(&mut self.delete_timestamps, *ts);
        }
        for (column, cells) in &other.columns {
            let mine = self.columns.entry(column.clone()).or_default();
            mine.extend(cells.iter().cloned());
            mine.sort_by_key(|c| c.timestamp);
        }
    }

    pub fn latest_timestamp(&self) -> Option<Timestamp> {
        let cells = self.columns.values().flatten().map(|c| c.timestamp);
        self.write_timestamps
            .iter()
            .chain(self.delete_timestamps.iter())
            .copied()
            .chain(cells)
            .max()
    }

    pub fn approx_bytes(&self) -> usize {
        let cells: usize = self
            .columns
            .iter()
            .map(|(name, cells)| {
                name.len() + cells.iter().map(|c| 9 + c.value.approx_bytes()).sum::<usize>()
            })
            .sum();
        8 * (self.write_timestamps.len() + self.delete_timestamps.len()) + cells
    }

    fn visible_cells(&self, column: &str, after: Option<Timestamp>, ts: Timestamp) -> Vec<&VersionedValue> {
        self.columns
            .get(column)
            .map(|cells| {
                cells
                    .iter()
                    .filter(|c| c.timestamp <= ts && after.map_or(true, |d| c.timestamp > d))
                    .collect()
            })
            .unwrap_or_default()
    }

    fn fold(cells: &[&VersionedValue], schema: &TableSchema, column: &str) -> Option<Value> {
        let last = cells.last()?;
        let function = schema.column(column).and_then(|c| c.aggregate);
        let Some(function) = function else {
            return Some(last.value.clone());
        };
        let base = cells.iter().rposition(|c| !c.aggregate);
        let mut acc = base.map_or(Value::Null, |i| cells[i].value.clone());
        let start = base.map_or(0, |i| i + 1);
        for cell in &cells[start..] {
            acc = function.combine(acc, cell.value.clone());
        }
        Some(acc)
    }

    /// Full positional row (schema order) visible at `ts`, or `None` when the
    /// row does not exist at that timestamp.
    pub fn read(&self, key: &Key, schema: &TableSchema, ts: Timestamp) -> Option<Vec<Value>> {
        let last_delete = latest_at(&self.delete_timestamps, ts);
        let last_write = latest_at(&self.write_timestamps, ts)?;
        if last_delete.map_or(false, |d| d >= last_write) {
            return None;
        }
        let key_width = schema.key_column_count();
        let mut values = key.padded(key_width).0;
        values.truncate(key_width);
        for column in schema.value_columns() {
            let cells = self.visible_cells(&column.name, last_delete, ts);
            values.push(Self::fold(&cells, schema, &column.name).unwrap_or(Value::Null));
        }
        Some(values)
    }

    /// Collapse all versions at or below `retention` into one version per
    /// column. Returns `None` when nothing observable remains.
    pub fn compact(&self, retention: Timestamp, schema: &TableSchema) -> Option<VersionedRow> {
        let mut out = VersionedRow::default();
        let old_delete = latest_at(&self.delete_timestamps, retention);
        let old_write = latest_at(&self.write_timestamps, retention);
        let alive = match (old_write, old_delete) {
            (Some(w), Some(d)) => w > d,
            (Some(_), None) => true,
            _ => false,
        };

        for column in self.columns.keys() {
            if schema.column(column).is_none() {
                continue;
            }
            let mut cells = Vec::new();
            if alive {
                let old = self.visible_cells(column, old_delete, retention);
                if let (Some(last), Some(value)) = (old.last(), Self::fold(&old, schema, column)) {
                    cells.push(VersionedValue {
                        timestamp: last.timestamp,
                        value,
                        aggregate: false,
                    });
                }
            }
            if let Some(all) = self.columns.get(column) {
                cells.extend(all.iter().filter(|c| c.timestamp > retention).cloned());
            }
            if !cells.is_empty() {
                out.columns.insert(column.clone(), cells);
            }
        }
        if alive {
            if let Some(w) = old_write {
                out.write_timestamps.push(w);
            }
        }
        out.write_timestamps
            .extend(self.write_timestamps.iter().copied().filter(|t| *t > retention));
        out.delete_timestamps
            .extend(self.delete_timestamps.iter().copied().filter(|t| *t > retention));

        (!out.is_empty()).then_some(out)
    }
}

/// Name the values of a positional row.
pub fn to_named_row(schema: &TableSchema, values: &[Value], columns: Option<&[String]>) -> NamedRow {
    let mut row = NamedRow::new();
    for (column, value) in schema.columns.iter().zip(values) {
        if columns.map_or(true, |wanted| wanted.iter().any(|w| *w == column.name)) {
            row.set(column.name.clone(), value.clone());
        }
    }
    row
}
