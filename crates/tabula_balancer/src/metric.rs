//! Balancing metrics: built-in data size / row count, or a parameterized
//! formula over per-tablet statistics and performance counters, parsed once
//! into an expression tree.

use serde::{Deserialize, Serialize};

use tabula_common::error::{TabulaError, TabulaResult, ValidationError};
use tabula_common::expression::Expression;
use tabula_common::schema::ColumnType;
use tabula_common::Value;

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MetricConfig {
    #[default]
    DataSize,
    RowCount,
    /// Formula such as `double([/statistics/uncompressed_data_size]) * 2.0`.
    Parameterized(String),
}

/// Inputs a parameterized formula can reference, bound by position.
pub const METRIC_VARIABLES: &[&str] = &[
    "/statistics/uncompressed_data_size",
    "/statistics/unmerged_row_count",
    "/performance_counters/dynamic_row_write_count",
    "/performance_counters/dynamic_row_read_count",
    "/performance_counters/dynamic_row_lookup_count",
    "/performance_counters/static_chunk_row_read_count",
    "/performance_counters/static_chunk_row_lookup_count",
];

/// Statistics the balancer sees for one tablet.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct TabletMetrics {
    pub uncompressed_data_size: u64,
    pub unmerged_row_count: u64,
    pub dynamic_row_write_count: u64,
    pub dynamic_row_read_count: u64,
    pub dynamic_row_lookup_count: u64,
    pub static_chunk_row_read_count: u64,
    pub static_chunk_row_lookup_count: u64,
}

impl TabletMetrics {
    fn values(&self) -> [Value; 7] {
        let v = |x: u64| Value::Int64(x.min(i64::MAX as u64) as i64);
        [
            v(self.uncompressed_data_size),
            v(self.unmerged_row_count),
            v(self.dynamic_row_write_count),
            v(self.dynamic_row_read_count),
            v(self.dynamic_row_lookup_count),
            v(self.static_chunk_row_read_count),
            v(self.static_chunk_row_lookup_count),
        ]
    }
}

#[derive(Debug, Clone)]
pub enum Metric {
    DataSize,
    RowCount,
    Parameterized(Expression),
}

impl Metric {
    pub fn compile(config: &MetricConfig) -> TabulaResult<Self> {
        match config {
            MetricConfig::DataSize => Ok(Metric::DataSize),
            MetricConfig::RowCount => Ok(Metric::RowCount),
            MetricConfig::Parameterized(formula) => {
                let resolve = |name: &str| METRIC_VARIABLES.iter().position(|v| *v == name);
                let expression = Expression::parse(formula, &resolve)?;
                let types = vec![ColumnType::Int64; METRIC_VARIABLES.len()];
                match expression.infer_type(&types)? {
                    ColumnType::Int64 | ColumnType::Uint64 | ColumnType::Double => {
                        Ok(Metric::Parameterized(expression))
                    }
                    other => Err(ValidationError::Expression {
                        expression: formula.clone(),
                        reason: format!("metric must be numeric, got {other}"),
                    }
                    .into()),
                }
            }
        }
    }

    pub fn evaluate(&self, metrics: &TabletMetrics) -> TabulaResult<f64> {
        match self {
            Metric::DataSize => Ok(metrics.uncompressed_data_size as f64),
            Metric::RowCount => Ok(metrics.unmerged_row_count as f64),
            Metric::Parameterized(expression) => match expression.eval(&metrics.values())? {
                Value::Null => Ok(0.0),
                Value::Int64(v) => Ok(v as f64),
                Value::Uint64(v) => Ok(v as f64),
                Value::Double(v) if v.is_finite() => Ok(v),
                other => Err(TabulaError::argument(format!(
                    "metric {} evaluated to {other}",
                    expression.source()
                ))),
            },
        }
    }
}
