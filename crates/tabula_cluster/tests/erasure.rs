mod common;

use common::*;
use tabula_chunk::{ChunkStatus, ErasureCodec, RepairOutcome, ReplicationParams};
use tabula_cluster::{Cluster, MountOptions, ReadOptions, TableOptions, TabletRange, WriteOptions, DEFAULT_BUNDLE};
use tabula_common::security::ROOT_USER;
use tabula_common::ChunkId;

fn wide_cluster() -> Cluster {
    let mut config = test_config();
    config.cluster.node_count = 9;
    Cluster::new(config).unwrap()
}

/// Ban `count` nodes holding parts of `chunk`, sparing nodes that host
/// cell peers.
fn ban_parts(cluster: &Cluster, chunk: ChunkId, count: usize) {
    let peers: Vec<String> = cluster
        .cells(DEFAULT_BUNDLE)
        .into_iter()
        .flat_map(|cell| cluster.cell_peers(cell).unwrap())
        .map(|peer| peer.address)
        .collect();
    let meta = cluster.chunk_meta(chunk).unwrap();
    let victims: Vec<String> = meta
        .stored_replicas
        .iter()
        .map(|replica| cluster.nodes().get(replica.node).unwrap().address.clone())
        .filter(|address| !peers.contains(address))
        .take(count)
        .collect();
    assert_eq!(victims.len(), count);
    for address in victims {
        cluster.set_node_banned(&address, true).unwrap();
    }
}

#[test]
fn test_static_table_survives_lost_parts_and_repairs() {
    let cluster = wide_cluster();
    let options = TableOptions::static_table(kv_schema())
        .with_replication(ReplicationParams::erasure(ErasureCodec::ReedSolomon3_3));
    cluster.create_table(ROOT_USER, "//s", options).unwrap();
    cluster.write_table(ROOT_USER, "//s", &rows(0..50)).unwrap();
    let chunks = cluster.table_chunk_ids(ROOT_USER, "//s").unwrap();
    assert_eq!(chunks.len(), 1);
    let chunk = chunks[0];
    assert_eq!(cluster.chunk_meta(chunk).unwrap().stored_replicas.len(), 6);

    ban_parts(&cluster, chunk, 3);
    assert_eq!(cluster.chunk_status(chunk).unwrap(), ChunkStatus::Underreplicated);
    let read = cluster.read_table(ROOT_USER, "//s", None).unwrap();
    assert_eq!(keys_of(&read), (0..50).collect::<Vec<_>>());

    assert_eq!(
        cluster.repair_chunk(chunk).unwrap(),
        RepairOutcome::Repaired { replicas: 3 }
    );
    assert_eq!(cluster.chunk_status(chunk).unwrap(), ChunkStatus::Healthy);
}

#[test]
fn test_dynamic_table_reads_erasure_stores() {
    let cluster = wide_cluster();
    let options = TableOptions::dynamic(kv_schema())
        .with_replication(ReplicationParams::erasure(ErasureCodec::ReedSolomon3_3));
    mounted_table(&cluster, "//t", options);
    cluster
        .insert_rows(ROOT_USER, "//t", &rows(0..30), &WriteOptions::default())
        .unwrap();
    cluster.unmount_table(ROOT_USER, "//t", TabletRange::all(), false).unwrap();
    let chunks = cluster.table_chunk_ids(ROOT_USER, "//t").unwrap();
    assert_eq!(chunks.len(), 1);

    ban_parts(&cluster, chunks[0], 3);
    cluster.mount_table(ROOT_USER, "//t", &MountOptions::default()).unwrap();
    let found = cluster
        .lookup_rows(ROOT_USER, "//t", &keys(0..30), &ReadOptions::default())
        .unwrap();
    assert_eq!(found.len(), 30);
}

#[test]
fn test_erasure_needs_enough_nodes() {
    let cluster = cluster();
    let options = TableOptions::static_table(kv_schema())
        .with_replication(ReplicationParams::erasure(ErasureCodec::ReedSolomon6_3));
    cluster.create_table(ROOT_USER, "//s", options).unwrap();
    assert!(cluster.write_table(ROOT_USER, "//s", &rows(0..5)).is_err());
    assert!(cluster.table_chunk_ids(ROOT_USER, "//s").unwrap().is_empty());
}
