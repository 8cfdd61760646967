//! Cell failover, recovery and lifecycle as seen through the cluster.

mod common;

use common::*;
use tabula_cluster::{Cluster, MountOptions, ReadOptions, TableOptions, TabletRange, WriteOptions, DEFAULT_BUNDLE};
use tabula_common::error::{StateError, TabulaError};
use tabula_common::security::ROOT_USER;
use tabula_common::CellId;
use tabula_hydra::CellHealth;

fn replicated_cluster() -> (Cluster, CellId) {
    let mut config = test_config();
    config.tablet_manager.leader_reassignment_timeout_ms = 0;
    let cluster = Cluster::new(config).unwrap();
    cluster.create_bundle("replicated").unwrap();
    let cell = cluster.create_cell("replicated", Some(3)).unwrap();
    let options = TableOptions::dynamic(kv_schema()).with_bundle("replicated");
    cluster.create_table(ROOT_USER, "//t", options).unwrap();
    cluster
        .mount_table(ROOT_USER, "//t", &MountOptions::default().on_cell(cell))
        .unwrap();
    (cluster, cell)
}

fn leader_address(cluster: &Cluster, cell: CellId) -> String {
    cluster
        .cell_peers(cell)
        .unwrap()
        .into_iter()
        .find(|p| p.state == "leading")
        .map(|p| p.address)
        .unwrap()
}

#[test]
fn test_leader_failover_keeps_rows() {
    let (cluster, cell) = replicated_cluster();
    cluster
        .insert_rows(ROOT_USER, "//t", &rows(0..10), &WriteOptions::default())
        .unwrap();
    assert_eq!(cluster.cell_health(cell).unwrap(), CellHealth::Good);

    let old_leader = leader_address(&cluster, cell);
    cluster.set_node_banned(&old_leader, true).unwrap();
    cluster.tick();
    let new_leader = leader_address(&cluster, cell);
    assert_ne!(old_leader, new_leader);
    assert_eq!(cluster.cell_health(cell).unwrap(), CellHealth::Good);

    cluster
        .insert_rows(ROOT_USER, "//t", &rows(10..15), &WriteOptions::default())
        .unwrap();
    let found = cluster
        .lookup_rows(ROOT_USER, "//t", &keys(0..15), &ReadOptions::default())
        .unwrap();
    assert_eq!(keys_of(&found), (0..15).collect::<Vec<_>>());
    assert!(cluster.cell_metrics(cell).unwrap().elections >= 2);
}

#[test]
fn test_restart_recovers_from_snapshot_and_changelog() {
    let (cluster, cell) = replicated_cluster();
    cluster
        .insert_rows(ROOT_USER, "//t", &rows(0..5), &WriteOptions::default())
        .unwrap();
    let index = cluster.build_snapshot(cell).unwrap();
    assert!(index > 0);
    cluster
        .insert_rows(ROOT_USER, "//t", &rows(5..8), &WriteOptions::default())
        .unwrap();

    cluster.restart_cell(cell).unwrap();
    let found = cluster
        .lookup_rows(ROOT_USER, "//t", &keys(0..8), &ReadOptions::default())
        .unwrap();
    assert_eq!(found.len(), 8);
}

#[test]
fn test_busy_cell_cannot_be_removed() {
    let (cluster, cell) = replicated_cluster();
    assert!(matches!(
        cluster.remove_cell(cell),
        Err(TabulaError::State(StateError::CellInUse(_)))
    ));
    cluster.unmount_table(ROOT_USER, "//t", TabletRange::all(), false).unwrap();
    cluster.remove_cell(cell).unwrap();
    assert!(cluster.cells("replicated").is_empty());
    assert!(matches!(cluster.cell_health(cell), Err(TabulaError::NotFound(_))));
}

#[test]
fn test_move_tablet_between_cells() {
    let cluster = cluster();
    mounted_table(&cluster, "//t", TableOptions::dynamic(kv_schema()));
    cluster
        .insert_rows(ROOT_USER, "//t", &rows(0..10), &WriteOptions::default())
        .unwrap();
    let info = cluster.tablet_info(ROOT_USER, "//t").unwrap();
    let from = info[0].cell.unwrap();
    let to = cluster
        .cells(DEFAULT_BUNDLE)
        .into_iter()
        .find(|c| *c != from)
        .unwrap();

    cluster.move_tablet(ROOT_USER, "//t", info[0].id, to).unwrap();
    let moved = cluster.tablet_info(ROOT_USER, "//t").unwrap();
    assert_eq!(moved[0].cell, Some(to));
    let found = cluster
        .lookup_rows(ROOT_USER, "//t", &keys(0..10), &ReadOptions::default())
        .unwrap();
    assert_eq!(found.len(), 10);
}

#[test]
fn test_mount_rejects_cell_of_other_bundle() {
    let (cluster, cell) = replicated_cluster();
    cluster
        .create_table(ROOT_USER, "//other", TableOptions::dynamic(kv_schema()))
        .unwrap();
    assert!(cluster
        .mount_table(ROOT_USER, "//other", &MountOptions::default().on_cell(cell))
        .is_err());
}
