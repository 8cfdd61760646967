mod common;

use std::collections::BTreeSet;
use std::sync::Arc;

use common::*;
use tabula_balancer::TableBalancerConfig;
use tabula_cluster::{tablet_balancer, MountOptions, ReadOptions, TableOptions, WriteOptions, DEFAULT_BUNDLE};
use tabula_common::security::ROOT_USER;
use tabula_common::{row, Key, NamedRow};

fn wide_rows(keys: std::ops::Range<i64>) -> Vec<NamedRow> {
    keys.map(|k| row! { "key" => k, "value" => format!("{k:0>200}") }).collect()
}

#[test]
fn test_oversized_tablet_is_split() {
    let cluster = Arc::new(cluster());
    let options = TableOptions::dynamic(kv_schema()).with_attributes(|a| {
        a.tablet_balancer_config = TableBalancerConfig {
            min_tablet_size: Some(1),
            desired_tablet_size: Some(20_000),
            max_tablet_size: Some(40_000),
            ..Default::default()
        };
    });
    mounted_table(&cluster, "//t", options);
    cluster
        .insert_rows(ROOT_USER, "//t", &wide_rows(0..500), &WriteOptions::default())
        .unwrap();

    let balancer = tablet_balancer(&cluster);
    let report = balancer.run_iteration();
    assert_eq!(report.failed, 0);
    assert!(report.executed >= 1);
    assert!(balancer.metrics().reshards >= 1);

    let pivots = cluster.table_pivot_keys(ROOT_USER, "//t").unwrap();
    assert!(pivots.len() >= 2);
    assert_eq!(pivots[0], Key::empty());
    let found = cluster
        .lookup_rows(ROOT_USER, "//t", &keys(0..500), &ReadOptions::default())
        .unwrap();
    assert_eq!(found.len(), 500);
}

#[test]
fn test_loaded_cell_sheds_tablet() {
    let cluster = Arc::new(cluster());
    let options = TableOptions::dynamic(kv_schema())
        .with_pivot_keys(vec![Key::empty(), Key::from(vec![1000i64])])
        .with_attributes(|a| a.tablet_balancer_config.enable_auto_reshard = Some(false));
    cluster.create_table(ROOT_USER, "//t", options).unwrap();
    let cells = cluster.cells(DEFAULT_BUNDLE);
    cluster
        .mount_table(ROOT_USER, "//t", &MountOptions::default().on_cell(cells[0]))
        .unwrap();
    cluster
        .insert_rows(ROOT_USER, "//t", &wide_rows(0..20), &WriteOptions::default())
        .unwrap();
    cluster
        .insert_rows(ROOT_USER, "//t", &wide_rows(1000..1020), &WriteOptions::default())
        .unwrap();

    let balancer = tablet_balancer(&cluster);
    balancer.run_iteration();
    assert_eq!(balancer.metrics().moves, 1);

    let info = cluster.tablet_info(ROOT_USER, "//t").unwrap();
    let used: BTreeSet<_> = info.iter().map(|t| t.cell.unwrap()).collect();
    assert_eq!(used.len(), 2);
    let found = cluster
        .lookup_rows(ROOT_USER, "//t", &[key(5), key(1005)], &ReadOptions::default())
        .unwrap();
    assert_eq!(keys_of(&found), vec![5, 1005]);
}

#[test]
fn test_invalid_bundle_config_is_reported() {
    let cluster = Arc::new(cluster());
    cluster
        .set_bundle_balancer_config(DEFAULT_BUNDLE, serde_json::json!({ "unknown_option": true }))
        .unwrap();
    let balancer = tablet_balancer(&cluster);
    let report = balancer.run_iteration();
    assert_eq!(report.bundles, 0);
    let errors = balancer.retryable_bundle_errors();
    assert_eq!(errors.len(), 1);
    assert_eq!(errors[0].bundle, DEFAULT_BUNDLE);
}

#[test]
fn test_unmounted_tables_are_left_alone() {
    let cluster = Arc::new(cluster());
    let options = TableOptions::dynamic(kv_schema()).with_attributes(|a| {
        a.tablet_balancer_config.min_tablet_size = Some(1);
        a.tablet_balancer_config.desired_tablet_size = Some(20_000);
        a.tablet_balancer_config.max_tablet_size = Some(40_000);
    });
    mounted_table(&cluster, "//t", options);
    cluster
        .insert_rows(ROOT_USER, "//t", &wide_rows(0..500), &WriteOptions::default())
        .unwrap();
    cluster
        .unmount_table(ROOT_USER, "//t", tabula_cluster::TabletRange::all(), false)
        .unwrap();

    let report = tablet_balancer(&cluster).run_iteration();
    assert_eq!(report.executed, 0);
    assert_eq!(cluster.table_pivot_keys(ROOT_USER, "//t").unwrap().len(), 1);
}
