use std::collections::HashSet;
use std::fmt;

use serde::{Deserialize, Serialize};

use crate::datum::{Key, Value};
use crate::error::{TabulaError, TabulaResult};
use crate::expression::Expression;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ColumnType {
    Int64,
    Uint64,
    Double,
    Boolean,
    String,
    Any,
}

impl ColumnType {
    pub fn is_numeric(self) -> bool {
        matches!(self, ColumnType::Int64 | ColumnType::Uint64 | ColumnType::Double)
    }
}

impl fmt::Display for ColumnType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            ColumnType::Int64 => "int64",
            ColumnType::Uint64 => "uint64",
            ColumnType::Double => "double",
            ColumnType::Boolean => "boolean",
            ColumnType::String => "string",
            ColumnType::Any => "any",
        };
        f.write_str(s)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SortOrder {
    Ascending,
}

/// Associative, commutative merge function of an aggregate column.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AggregateFunction {
    Sum,
    Min,
    Max,
}

impl AggregateFunction {
    /// Merge two values; `null` is the identity element.
    pub fn combine(self, acc: Value, next: Value) -> Value {
        match (acc, next) {
            (Value::Null, v) | (v, Value::Null) => v,
            (a, b) => match self {
                AggregateFunction::Sum => match (a, b) {
                    (Value::Int64(x), Value::Int64(y)) => Value::Int64(x.wrapping_add(y)),
                    (Value::Uint64(x), Value::Uint64(y)) => Value::Uint64(x.wrapping_add(y)),
                    (Value::Double(x), Value::Double(y)) => Value::Double(x + y),
                    (_, b) => b,
                },
                AggregateFunction::Min => std::cmp::min(a, b),
                AggregateFunction::Max => std::cmp::max(a, b),
            },
        }
    }

    fn accepts(self, ty: ColumnType) -> bool {
        match self {
            AggregateFunction::Sum => ty.is_numeric(),
            AggregateFunction::Min | AggregateFunction::Max => {
                ty.is_numeric() || ty == ColumnType::String
            }
        }
    }
}

impl fmt::Display for AggregateFunction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            AggregateFunction::Sum => "sum",
            AggregateFunction::Min => "min",
            AggregateFunction::Max => "max",
        };
        f.write_str(s)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ColumnSchema {
    pub name: String,
    #[serde(rename = "type")]
    pub column_type: ColumnType,
    #[serde(default)]
    pub sort_order: Option<SortOrder>,
    #[serde(default)]
    pub expression: Option<String>,
    #[serde(default)]
    pub aggregate: Option<AggregateFunction>,
}

impl ColumnSchema {
    pub fn new(name: impl Into<String>, column_type: ColumnType) -> Self {
        Self {
            name: name.into(),
            column_type,
            sort_order: None,
            expression: None,
            aggregate: None,
        }
    }

    pub fn key(mut self) -> Self {
        self.sort_order = Some(SortOrder::Ascending);
        self
    }

    pub fn computed(mut self, expression: impl Into<String>) -> Self {
        self.expression = Some(expression.into());
        self
    }

    pub fn aggregate(mut self, function: AggregateFunction) -> Self {
        self.aggregate = Some(function);
        self
    }

    pub fn is_key(&self) -> bool {
        self.sort_order.is_some()
    }

    pub fn is_computed(&self) -> bool {
        self.expression.is_some()
    }
}

/// Ordered table schema; key columns form a strict prefix.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, Default)]
pub struct TableSchema {
    pub columns: Vec<ColumnSchema>,
}

impl TableSchema {
    pub fn new(columns: Vec<ColumnSchema>) -> Self {
        Self { columns }
    }

    pub fn key_column_count(&self) -> usize {
        self.columns.iter().take_while(|c| c.is_key()).count()
    }

    pub fn key_columns(&self) -> &[ColumnSchema] {
        &self.columns[..self.key_column_count()]
    }

    pub fn value_columns(&self) -> &[ColumnSchema] {
        &self.columns[self.key_column_count()..]
    }

    pub fn column_index(&self, name: &str) -> Option<usize> {
        self.columns.iter().position(|c| c.name == name)
    }

    pub fn column(&self, name: &str) -> Option<&ColumnSchema> {
        self.columns.iter().find(|c| c.name == name)
    }

    pub fn column_types(&self) -> Vec<ColumnType> {
        self.columns.iter().map(|c| c.column_type).collect()
    }

    pub fn has_computed_columns(&self) -> bool {
        self.columns.iter().any(ColumnSchema::is_computed)
    }

    /// Check the structural invariants. `dynamic` tables additionally need a key.
    pub fn validate(&self, dynamic: bool) -> TabulaResult<()> {
        if self.columns.is_empty() {
            return Err(TabulaError::schema("schema has no columns"));
        }
        let mut seen = HashSet::new();
        for c in &self.columns {
            if c.name.is_empty() {
                return Err(TabulaError::schema("column name must be non-empty"));
            }
            if !seen.insert(c.name.as_str()) {
                return Err(TabulaError::schema(format!("duplicate column {:?}", c.name)));
            }
        }
        let key_count = self.key_column_count();
        if let Some(c) = self.columns[key_count..].iter().find(|c| c.is_key()) {
            return Err(TabulaError::schema(format!(
                "key column {:?} does not belong to the key prefix",
                c.name
            )));
        }
        if dynamic && key_count == 0 {
            return Err(TabulaError::schema("dynamic table must have at least one key column"));
        }
        for c in &self.columns {
            if c.is_computed() && !c.is_key() {
                return Err(TabulaError::schema(format!(
                    "computed column {:?} must be a key column",
                    c.name
                )));
            }
            if let Some(agg) = c.aggregate {
                if c.is_key() {
                    return Err(TabulaError::schema(format!(
                        "key column {:?} cannot be aggregate",
                        c.name
                    )));
                }
                if !agg.accepts(c.column_type) {
                    return Err(TabulaError::schema(format!(
                        "aggregate {agg} is not defined for {} column {:?}",
                        c.column_type, c.name
                    )));
                }
            }
        }
        ComputedColumns::compile(self).map(|_| ())
    }

    /// Check that `new` is a legal alteration of `self`.
    pub fn validate_alter(&self, new: &TableSchema, dynamic: bool, has_rows: bool) -> TabulaResult<()> {
        new.validate(dynamic)?;
        let old_keys = self.key_columns();
        let new_keys = new.key_columns();
        if new_keys.len() < old_keys.len() {
            return Err(TabulaError::schema("key columns cannot be removed"));
        }
        for (old, new) in old_keys.iter().zip(new_keys) {
            if old.name != new.name {
                return Err(TabulaError::schema(format!(
                    "key column {:?} cannot be renamed or moved",
                    old.name
                )));
            }
            if old.column_type != new.column_type {
                return Err(TabulaError::schema(format!(
                    "type of key column {:?} cannot change",
                    old.name
                )));
            }
            if has_rows && old.expression != new.expression {
                return Err(TabulaError::schema(format!(
                    "expression of key column {:?} cannot change in a non-empty table",
                    old.name
                )));
            }
        }
        for added in &new_keys[old_keys.len()..] {
            if self.column(&added.name).is_some() {
                return Err(TabulaError::schema(format!(
                    "column {:?} cannot become a key column",
                    added.name
                )));
            }
            if has_rows && added.is_computed() {
                return Err(TabulaError::schema(format!(
                    "computed key column {:?} cannot be added to a non-empty table",
                    added.name
                )));
            }
        }
        for old in self.value_columns() {
            if let Some(new_col) = new.column(&old.name) {
                if new_col.is_key() {
                    return Err(TabulaError::schema(format!(
                        "column {:?} cannot become a key column",
                        old.name
                    )));
                }
                if new_col.column_type != old.column_type {
                    return Err(TabulaError::schema(format!(
                        "type of column {:?} cannot change",
                        old.name
                    )));
                }
            }
        }
        Ok(())
    }

    /// Collect key values from a full positional row.
    pub fn key_of(&self, row: &[Value]) -> Key {
        Key(row[..self.key_column_count()].to_vec())
    }

    /// Check that each value of `key` fits the matching key column.
    pub fn check_key_types(&self, key: &Key) -> TabulaResult<()> {
        let keys = self.key_columns();
        if key.len() > keys.len() {
            return Err(TabulaError::pivot_keys(format!(
                "key {key} is longer than the {} key columns",
                keys.len()
            )));
        }
        for (value, column) in key.values().iter().zip(keys) {
            if !value.fits(column.column_type) {
                return Err(TabulaError::pivot_keys(format!(
                    "value {value} does not fit key column {:?} of type {}",
                    column.name, column.column_type
                )));
            }
        }
        Ok(())
    }
}

/// Computed key columns compiled once per schema, in declaration order.
#[derive(Debug, Clone)]
pub struct ComputedColumns {
    columns: Vec<(usize, Expression)>,
}

impl ComputedColumns {
    pub fn compile(schema: &TableSchema) -> TabulaResult<Self> {
        let mut columns = Vec::new();
        let types = schema.column_types();
        for (index, column) in schema.columns.iter().enumerate() {
            let Some(source) = &column.expression else {
                continue;
            };
            let resolve = |name: &str| {
                schema.column_index(name).filter(|&i| {
                    let referenced = &schema.columns[i];
                    i < index && referenced.is_key() && !referenced.is_computed()
                })
            };
            let expr = Expression::parse(source, &resolve).map_err(|e| {
                TabulaError::schema(format!("computed column {:?}: {e}", column.name))
            })?;
            let result_type = expr.infer_type(&types)?;
            if result_type != column.column_type && result_type != ColumnType::Any {
                return Err(TabulaError::schema(format!(
                    "expression of {:?} yields {result_type}, column is {}",
                    column.name, column.column_type
                )));
            }
            columns.push((index, expr));
        }
        Ok(Self { columns })
    }

    pub fn is_empty(&self) -> bool {
        self.columns.is_empty()
    }

    pub fn is_computed(&self, index: usize) -> bool {
        self.columns.iter().any(|(i, _)| *i == index)
    }

    /// Fill computed positions of `row` in place.
    pub fn evaluate(&self, row: &mut [Value]) -> TabulaResult<()> {
        for (index, expr) in &self.columns {
            let value = expr.eval(row)?;
            row[*index] = value;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn simple() -> TableSchema {
        TableSchema::new(vec![
            ColumnSchema::new("key", ColumnType::Int64).key(),
            ColumnSchema::new("value", ColumnType::String),
        ])
    }

    fn computed() -> TableSchema {
        TableSchema::new(vec![
            ColumnSchema::new("key1", ColumnType::Int64).key(),
            ColumnSchema::new("key2", ColumnType::Int64)
                .key()
                .computed("key1 * 100 + 3"),
            ColumnSchema::new("value", ColumnType::String),
        ])
    }

    #[test]
    fn test_validate_structure() {
        assert!(simple().validate(true).is_ok());

        let mut unnamed = simple();
        unnamed.columns[1].name.clear();
        assert!(unnamed.validate(true).is_err());

        let gap = TableSchema::new(vec![
            ColumnSchema::new("a", ColumnType::Int64).key(),
            ColumnSchema::new("b", ColumnType::Int64),
            ColumnSchema::new("c", ColumnType::Int64).key(),
        ]);
        assert!(gap.validate(true).is_err());

        let keyless = TableSchema::new(vec![ColumnSchema::new("a", ColumnType::Int64)]);
        assert!(keyless.validate(true).is_err());
        assert!(keyless.validate(false).is_ok());
    }

    #[test]
    fn test_aggregate_rules() {
        let on_key = TableSchema::new(vec![
            ColumnSchema::new("k", ColumnType::Int64)
                .key()
                .aggregate(AggregateFunction::Sum),
        ]);
        assert!(on_key.validate(true).is_err());

        let sum_string = TableSchema::new(vec![
            ColumnSchema::new("k", ColumnType::Int64).key(),
            ColumnSchema::new("v", ColumnType::String).aggregate(AggregateFunction::Sum),
        ]);
        assert!(sum_string.validate(true).is_err());

        assert_eq!(
            AggregateFunction::Sum.combine(Value::Int64(10), Value::Int64(5)),
            Value::Int64(15)
        );
        assert_eq!(
            AggregateFunction::Min.combine(Value::Null, Value::Int64(5)),
            Value::Int64(5)
        );
        assert_eq!(
            AggregateFunction::Max.combine(Value::Int64(7), Value::Null),
            Value::Int64(7)
        );
    }

    #[test]
    fn test_computed_columns() {
        let schema = computed();
        schema.validate(true).unwrap();
        let compiled = ComputedColumns::compile(&schema).unwrap();
        let mut row = vec![Value::Int64(1), Value::Null, Value::from("2")];
        compiled.evaluate(&mut row).unwrap();
        assert_eq!(row[1], Value::Int64(103));
    }

    #[test]
    fn test_computed_reference_rules() {
        let forward = TableSchema::new(vec![
            ColumnSchema::new("hash", ColumnType::Uint64)
                .key()
                .computed("farm_hash(key)"),
            ColumnSchema::new("key", ColumnType::Int64).key(),
        ]);
        assert!(forward.validate(true).is_err());

        let non_key = TableSchema::new(vec![
            ColumnSchema::new("key", ColumnType::Int64).key(),
            ColumnSchema::new("value", ColumnType::Int64).computed("key + 1"),
        ]);
        assert!(non_key.validate(true).is_err());

        let wrong_type = TableSchema::new(vec![
            ColumnSchema::new("key", ColumnType::Int64).key(),
            ColumnSchema::new("hash", ColumnType::Int64)
                .key()
                .computed("farm_hash(key)"),
        ]);
        assert!(wrong_type.validate(true).is_err());
    }

    #[test]
    fn test_alter_rules() {
        let old = computed();

        let mut renamed_key = old.clone();
        renamed_key.columns[0].name = "key0".into();
        assert!(old.validate_alter(&renamed_key, true, false).is_err());

        let mut retyped_key = old.clone();
        retyped_key.columns[0].column_type = ColumnType::Uint64;
        assert!(old.validate_alter(&retyped_key, true, false).is_err());

        let mut dropped_expr = old.clone();
        dropped_expr.columns[1].expression = None;
        assert!(old.validate_alter(&dropped_expr, true, true).is_err());
        assert!(old.validate_alter(&dropped_expr, true, false).is_ok());

        let mut extended = old.clone();
        extended
            .columns
            .insert(2, ColumnSchema::new("key3", ColumnType::Int64).key());
        assert!(old.validate_alter(&extended, true, true).is_ok());

        let mut extended_computed = old.clone();
        extended_computed.columns.insert(
            2,
            ColumnSchema::new("key3", ColumnType::Int64)
                .key()
                .computed("key1 * 2"),
        );
        assert!(old.validate_alter(&extended_computed, true, true).is_err());
        assert!(old.validate_alter(&extended_computed, true, false).is_ok());

        let mut aggregated = simple();
        aggregated.columns[1] = ColumnSchema::new("value", ColumnType::Int64);
        let mut with_sum = aggregated.clone();
        with_sum.columns[1].aggregate = Some(AggregateFunction::Sum);
        assert!(aggregated.validate_alter(&with_sum, true, true).is_ok());
    }

    #[test]
    fn test_key_type_check() {
        let schema = TableSchema::new(vec![
            ColumnSchema::new("k", ColumnType::Int64).key(),
            ColumnSchema::new("l", ColumnType::Uint64).key(),
            ColumnSchema::new("value", ColumnType::Int64),
        ]);
        assert!(schema.check_key_types(&Key::from(vec![100i64])).is_ok());
        assert!(schema
            .check_key_types(&Key::new(vec![Value::Int64(100), Value::Uint64(200)]))
            .is_ok());
        assert!(schema
            .check_key_types(&Key::new(vec![Value::Int64(100), Value::Int64(200)]))
            .is_err());
        assert!(schema
            .check_key_types(&Key::from(vec![1i64, 2, 3]))
            .is_err());
    }
}
