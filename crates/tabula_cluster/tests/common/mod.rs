#![allow(dead_code)]

use tabula_cluster::{Cluster, MountOptions, TableOptions};
use tabula_common::config::TabulaConfig;
use tabula_common::schema::{ColumnSchema, ColumnType, TableSchema};
use tabula_common::security::ROOT_USER;
use tabula_common::{row, NamedRow, Value};

pub fn test_config() -> TabulaConfig {
    let mut config = TabulaConfig::default();
    config.cluster.node_count = 5;
    config.cluster.cell_count = 2;
    config.chunk.operation_timeout_ms = 300;
    config.chunk.backup_request_delay_ms = 10;
    config
}

pub fn cluster() -> Cluster {
    Cluster::new(test_config()).expect("cluster starts")
}

pub fn kv_schema() -> TableSchema {
    TableSchema::new(vec![
        ColumnSchema::new("key", ColumnType::Int64).key(),
        ColumnSchema::new("value", ColumnType::String),
    ])
}

/// Create and mount a dynamic key/value table.
pub fn mounted_table(cluster: &Cluster, path: &str, options: TableOptions) {
    cluster.create_table(ROOT_USER, path, options).unwrap();
    cluster.mount_table(ROOT_USER, path, &MountOptions::default()).unwrap();
}

pub fn kv(key: i64) -> NamedRow {
    row! { "key" => key, "value" => format!("v{key}") }
}

pub fn key(key: i64) -> NamedRow {
    row! { "key" => key }
}

pub fn rows(keys: std::ops::Range<i64>) -> Vec<NamedRow> {
    keys.map(kv).collect()
}

pub fn keys(keys: std::ops::Range<i64>) -> Vec<NamedRow> {
    keys.map(key).collect()
}

pub fn keys_of(rows: &[NamedRow]) -> Vec<i64> {
    rows.iter()
        .map(|r| match r.get("key") {
            Some(Value::Int64(k)) => *k,
            other => panic!("unexpected key {other:?}"),
        })
        .collect()
}
