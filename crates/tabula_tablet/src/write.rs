//! Turn client rows into key-resolved row modifications.

use tabula_common::error::{TabulaError, TabulaResult};
use tabula_common::schema::{ComputedColumns, TableSchema};
use tabula_common::{Key, NamedRow, Value};

use crate::row::{ColumnWrite, RowModification};

/// Validates client rows against a schema and evaluates computed key columns.
pub struct RowPreparer<'a> {
    schema: &'a TableSchema,
    computed: ComputedColumns,
}

impl<'a> RowPreparer<'a> {
    pub fn new(schema: &'a TableSchema) -> TabulaResult<Self> {
        Ok(Self {
            schema,
            computed: ComputedColumns::compile(schema)?,
        })
    }

    fn check_value(&self, column: &str, value: &Value) -> TabulaResult<usize> {
        let index = self
            .schema
            .column_index(column)
            .ok_or_else(|| TabulaError::invalid_row(format!("unknown column {column:?}")))?;
        let schema = &self.schema.columns[index];
        if schema.is_computed() {
            return Err(TabulaError::invalid_row(format!(
                "column {column:?} is computed and cannot be supplied"
            )));
        }
        if !value.fits(schema.column_type) {
            return Err(TabulaError::invalid_row(format!(
                "value {value} of type {} does not fit column {column:?} of type {}",
                value.type_name(),
                schema.column_type
            )));
        }
        Ok(index)
    }

    fn build_key(&self, mut key: Vec<Value>) -> TabulaResult<Key> {
        self.computed.evaluate(&mut key)?;
        Ok(Key(key))
    }

    /// Resolve a key-only row (lookup or delete input).
    pub fn prepare_key(&self, row: &NamedRow) -> TabulaResult<Key> {
        let width = self.schema.key_column_count();
        let mut key = vec![Value::Null; width];
        for (column, value) in &row.0 {
            let index = self.check_value(column, value)?;
            if index >= width {
                return Err(TabulaError::invalid_row(format!(
                    "column {column:?} is not a key column"
                )));
            }
            key[index] = value.clone();
        }
        self.build_key(key)
    }

    /// `update` writes only the supplied columns; `aggregate` merges supplied
    /// values of aggregate columns instead of overwriting them.
    pub fn prepare_write(&self, row: &NamedRow, update: bool, aggregate: bool) -> TabulaResult<RowModification> {
        let width = self.schema.key_column_count();
        let mut key = vec![Value::Null; width];
        let mut writes = Vec::new();
        for (column, value) in &row.0 {
            let index = self.check_value(column, value)?;
            if index < width {
                key[index] = value.clone();
            } else {
                writes.push((index, value.clone()));
            }
        }
        let mut columns = Vec::with_capacity(self.schema.columns.len() - width);
        for (index, schema) in self.schema.columns.iter().enumerate().skip(width) {
            let supplied = writes.iter().find(|(i, _)| *i == index).map(|(_, v)| v.clone());
            if supplied.is_none() && update {
                continue;
            }
            columns.push(ColumnWrite {
                column: schema.name.clone(),
                value: supplied.unwrap_or(Value::Null),
                aggregate: aggregate && schema.aggregate.is_some(),
            });
        }
        Ok(RowModification::Write {
            key: self.build_key(key)?,
            columns,
        })
    }

    pub fn prepare_delete(&self, row: &NamedRow) -> TabulaResult<RowModification> {
        Ok(RowModification::Delete {
            key: self.prepare_key(row)?,
        })
    }
}

#[cfg(test)]
mod tests {
    use tabula_common::row;
    use tabula_common::schema::{AggregateFunction, ColumnSchema, ColumnType};

    use super::*;

    fn computed() -> TableSchema {
        TableSchema::new(vec![
            ColumnSchema::new("key1", ColumnType::Int64).key(),
            ColumnSchema::new("key2", ColumnType::Int64)
                .key()
                .computed("key1 * 100 + 3"),
            ColumnSchema::new("value1", ColumnType::String),
            ColumnSchema::new("value2", ColumnType::Int64).aggregate(AggregateFunction::Sum),
        ])
    }

    #[test]
    fn test_computed_key_is_evaluated() {
        let schema = computed();
        let preparer = RowPreparer::new(&schema).unwrap();
        let m = preparer
            .prepare_write(&row! {"key1" => 1i64, "value1" => "2"}, false, false)
            .unwrap();
        let RowModification::Write { key, columns } = m else {
            panic!("expected write");
        };
        assert_eq!(key, Key::from(vec![1i64, 103]));
        assert_eq!(columns.len(), 2);
        assert_eq!(columns[1].value, Value::Null);
    }

    #[test]
    fn test_supplying_computed_column_fails() {
        let schema = computed();
        let preparer = RowPreparer::new(&schema).unwrap();
        let input = row! {"key1" => 1i64, "key2" => 103i64, "value1" => "2"};
        assert!(preparer.prepare_write(&input, false, false).is_err());
        assert!(preparer.prepare_key(&row! {"key1" => 1i64, "key2" => 103i64}).is_err());
    }

    #[test]
    fn test_update_writes_only_supplied_columns() {
        let schema = computed();
        let preparer = RowPreparer::new(&schema).unwrap();
        let m = preparer
            .prepare_write(&row! {"key1" => 1i64, "value2" => 5i64}, true, true)
            .unwrap();
        let RowModification::Write { columns, .. } = m else {
            panic!("expected write");
        };
        assert_eq!(columns, vec![ColumnWrite::new("value2", 5i64).aggregated()]);
    }

    #[test]
    fn test_rejects_bad_input() {
        let schema = computed();
        let preparer = RowPreparer::new(&schema).unwrap();
        assert!(preparer
            .prepare_write(&row! {"key1" => 1i64, "nope" => 1i64}, false, false)
            .is_err());
        assert!(preparer
            .prepare_write(&row! {"key1" => "one"}, false, false)
            .is_err());
        assert!(preparer
            .prepare_key(&row! {"key1" => 1i64, "value1" => "x"})
            .is_err());
    }
}
