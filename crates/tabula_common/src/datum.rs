use std::cmp::Ordering;
use std::collections::BTreeMap;
use std::fmt;
use std::hash::{Hash, Hasher};

use serde::{Deserialize, Serialize};

use crate::schema::ColumnType;

/// A single typed cell value. `Null` orders before everything else.
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub enum Value {
    #[default]
    Null,
    Int64(i64),
    Uint64(u64),
    Double(f64),
    Boolean(bool),
    String(String),
}

impl Value {
    fn rank(&self) -> u8 {
        match self {
            Value::Null => 0,
            Value::Int64(_) => 1,
            Value::Uint64(_) => 2,
            Value::Double(_) => 3,
            Value::Boolean(_) => 4,
            Value::String(_) => 5,
        }
    }

    pub fn is_null(&self) -> bool {
        matches!(self, Value::Null)
    }

    pub fn type_name(&self) -> &'static str {
        match self {
            Value::Null => "null",
            Value::Int64(_) => "int64",
            Value::Uint64(_) => "uint64",
            Value::Double(_) => "double",
            Value::Boolean(_) => "boolean",
            Value::String(_) => "string",
        }
    }

    /// Whether the value may be stored in a column of type `ty`.
    pub fn fits(&self, ty: ColumnType) -> bool {
        matches!(
            (self, ty),
            (Value::Null, _)
                | (_, ColumnType::Any)
                | (Value::Int64(_), ColumnType::Int64)
                | (Value::Uint64(_), ColumnType::Uint64)
                | (Value::Double(_), ColumnType::Double)
                | (Value::Boolean(_), ColumnType::Boolean)
                | (Value::String(_), ColumnType::String)
        )
    }

    pub fn as_i64(&self) -> Option<i64> {
        match self {
            Value::Int64(v) => Some(*v),
            Value::Uint64(v) => i64::try_from(*v).ok(),
            _ => None,
        }
    }

    pub fn as_f64(&self) -> Option<f64> {
        match self {
            Value::Int64(v) => Some(*v as f64),
            Value::Uint64(v) => Some(*v as f64),
            Value::Double(v) => Some(*v),
            _ => None,
        }
    }

    pub fn as_bool(&self) -> Option<bool> {
        match self {
            Value::Boolean(b) => Some(*b),
            _ => None,
        }
    }

    pub fn as_str(&self) -> Option<&str> {
        match self {
            Value::String(s) => Some(s),
            _ => None,
        }
    }

    /// Approximate in-memory footprint, used for store byte bounds.
    pub fn approx_bytes(&self) -> usize {
        match self {
            Value::String(s) => 8 + s.len(),
            _ => 8,
        }
    }

    /// Order-preserving binary encoding: a type tag, then sign-flipped
    /// big-endian integers, or NUL-terminated strings.
    pub fn encode_into(&self, buf: &mut Vec<u8>) {
        buf.push(self.rank());
        match self {
            Value::Null => {}
            Value::Int64(v) => buf.extend_from_slice(&((*v as u64) ^ (1 << 63)).to_be_bytes()),
            Value::Uint64(v) => buf.extend_from_slice(&v.to_be_bytes()),
            Value::Double(v) => {
                let bits = v.to_bits();
                let ordered = if bits >> 63 == 1 { !bits } else { bits ^ (1 << 63) };
                buf.extend_from_slice(&ordered.to_be_bytes());
            }
            Value::Boolean(b) => buf.push(u8::from(*b)),
            Value::String(s) => {
                buf.extend_from_slice(s.as_bytes());
                buf.push(0);
            }
        }
    }
}

impl PartialEq for Value {
    fn eq(&self, other: &Self) -> bool {
        self.cmp(other) == Ordering::Equal
    }
}

impl Eq for Value {}

impl PartialOrd for Value {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for Value {
    fn cmp(&self, other: &Self) -> Ordering {
        match (self, other) {
            (Value::Int64(a), Value::Int64(b)) => a.cmp(b),
            (Value::Uint64(a), Value::Uint64(b)) => a.cmp(b),
            (Value::Double(a), Value::Double(b)) => a.total_cmp(b),
            (Value::Boolean(a), Value::Boolean(b)) => a.cmp(b),
            (Value::String(a), Value::String(b)) => a.cmp(b),
            _ => self.rank().cmp(&other.rank()),
        }
    }
}

impl Hash for Value {
    fn hash<H: Hasher>(&self, state: &mut H) {
        let mut buf = Vec::with_capacity(16);
        self.encode_into(&mut buf);
        buf.hash(state);
    }
}

impl fmt::Display for Value {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Value::Null => write!(f, "null"),
            Value::Int64(v) => write!(f, "{v}"),
            Value::Uint64(v) => write!(f, "{v}u"),
            Value::Double(v) => write!(f, "{v:?}"),
            Value::Boolean(v) => write!(f, "%{v}"),
            Value::String(s) => write!(f, "{s:?}"),
        }
    }
}

impl From<i64> for Value {
    fn from(v: i64) -> Self {
        Value::Int64(v)
    }
}

impl From<i32> for Value {
    fn from(v: i32) -> Self {
        Value::Int64(i64::from(v))
    }
}

impl From<u64> for Value {
    fn from(v: u64) -> Self {
        Value::Uint64(v)
    }
}

impl From<f64> for Value {
    fn from(v: f64) -> Self {
        Value::Double(v)
    }
}

impl From<bool> for Value {
    fn from(v: bool) -> Self {
        Value::Boolean(v)
    }
}

impl From<&str> for Value {
    fn from(v: &str) -> Self {
        Value::String(v.to_string())
    }
}

impl From<String> for Value {
    fn from(v: String) -> Self {
        Value::String(v)
    }
}

impl<T: Into<Value>> From<Option<T>> for Value {
    fn from(v: Option<T>) -> Self {
        v.map_or(Value::Null, Into::into)
    }
}

// ── Keys ──────────────────────────────────────────────────────────────

/// A key tuple. Compares lexicographically; a strict prefix orders first,
/// so the empty key is the minimum of the key space.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize, Default)]
pub struct Key(pub Vec<Value>);

impl Key {
    pub fn empty() -> Self {
        Key(Vec::new())
    }

    pub fn new(values: Vec<Value>) -> Self {
        Key(values)
    }

    pub fn values(&self) -> &[Value] {
        &self.0
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    /// Extend with nulls up to `width` columns (rows written before a key
    /// extension carry shorter keys).
    pub fn padded(&self, width: usize) -> Key {
        let mut values = self.0.clone();
        while values.len() < width {
            values.push(Value::Null);
        }
        Key(values)
    }

    pub fn encode(&self) -> Vec<u8> {
        let mut buf = Vec::with_capacity(self.0.len() * 9);
        for v in &self.0 {
            v.encode_into(&mut buf);
        }
        buf
    }

    pub fn approx_bytes(&self) -> usize {
        self.0.iter().map(Value::approx_bytes).sum()
    }
}

impl fmt::Display for Key {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "[")?;
        for (i, v) in self.0.iter().enumerate() {
            if i > 0 {
                write!(f, ", ")?;
            }
            write!(f, "{v}")?;
        }
        write!(f, "]")
    }
}

impl<V: Into<Value>> From<Vec<V>> for Key {
    fn from(values: Vec<V>) -> Self {
        Key(values.into_iter().map(Into::into).collect())
    }
}

/// Whether `key` lies in the half-open range `[lower, upper)`; `None` upper is +∞.
pub fn key_in_range(key: &Key, lower: &Key, upper: Option<&Key>) -> bool {
    key >= lower && upper.map_or(true, |u| key < u)
}

// ── Named rows ────────────────────────────────────────────────────────

/// A row addressed by column name, as exchanged with clients.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct NamedRow(pub BTreeMap<String, Value>);

impl NamedRow {
    pub fn new() -> Self {
        NamedRow(BTreeMap::new())
    }

    pub fn set(&mut self, column: impl Into<String>, value: impl Into<Value>) {
        self.0.insert(column.into(), value.into());
    }

    pub fn with(mut self, column: impl Into<String>, value: impl Into<Value>) -> Self {
        self.set(column, value);
        self
    }

    pub fn get(&self, column: &str) -> Option<&Value> {
        self.0.get(column)
    }

    pub fn contains(&self, column: &str) -> bool {
        self.0.contains_key(column)
    }

    pub fn columns(&self) -> impl Iterator<Item = &str> {
        self.0.keys().map(String::as_str)
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }
}

/// Build a [`NamedRow`]: `row!{"key" => 1, "value" => "a"}`.
#[macro_export]
macro_rules! row {
    ($($column:expr => $value:expr),* $(,)?) => {{
        #[allow(unused_mut)]
        let mut row = $crate::datum::NamedRow::new();
        $( row.set($column, $value); )*
        row
    }};
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_null_orders_first() {
        assert!(Value::Null < Value::Int64(i64::MIN));
        assert!(Value::Null < Value::String(String::new()));
    }

    #[test]
    fn test_key_prefix_orders_first() {
        let empty = Key::empty();
        let short = Key::from(vec![100i64]);
        let long = Key::new(vec![Value::Int64(100), Value::Null]);
        assert!(empty < short);
        assert!(short < long);
        assert!(Key::from(vec![99i64]) < short);
    }

    #[test]
    fn test_encoding_preserves_order() {
        let values = [
            Value::Int64(-5),
            Value::Int64(0),
            Value::Int64(7),
            Value::Double(-1.5),
            Value::Double(2.0),
        ];
        for w in values.windows(2) {
            let (mut a, mut b) = (Vec::new(), Vec::new());
            w[0].encode_into(&mut a);
            w[1].encode_into(&mut b);
            assert!(a < b, "{} vs {}", w[0], w[1]);
        }
    }

    #[test]
    fn test_key_range() {
        let lo = Key::from(vec![10i64]);
        let hi = Key::from(vec![20i64]);
        assert!(key_in_range(&Key::from(vec![10i64]), &lo, Some(&hi)));
        assert!(!key_in_range(&Key::from(vec![20i64]), &lo, Some(&hi)));
        assert!(key_in_range(&Key::from(vec![1000i64]), &lo, None));
    }

    #[test]
    fn test_row_macro() {
        let r = row! {"key" => 1i64, "value" => "x"};
        assert_eq!(r.get("key"), Some(&Value::Int64(1)));
        assert_eq!(r.get("value"), Some(&Value::String("x".into())));
        assert_eq!(r.len(), 2);
    }
}
