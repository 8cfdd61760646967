mod common;

use common::*;
use tabula_cluster::TableOptions;
use tabula_common::error::{StateError, TabulaError};
use tabula_common::row;
use tabula_common::security::{AccessControlEntry, Acl, Permission, ROOT_USER};
use tabula_common::NamedRow;
use tabula_journal::{JournalAttributes, JournalWriterOptions};

fn records(range: std::ops::Range<i64>) -> Vec<NamedRow> {
    range.map(|i| row! { "seq" => i, "payload" => format!("p{i}") }).collect()
}

#[test]
fn test_write_read_truncate() {
    let cluster = cluster();
    cluster
        .create_journal(ROOT_USER, "//j", JournalAttributes::default(), Acl::default())
        .unwrap();
    assert!(cluster.journal_exists("//j"));

    let options = JournalWriterOptions::default().with_max_chunk_row_count(4);
    assert_eq!(cluster.write_journal(ROOT_USER, "//j", &records(0..10), &options).unwrap(), 10);
    assert_eq!(cluster.journal_quorum_row_count(ROOT_USER, "//j").unwrap(), 10);
    assert_eq!(cluster.journal_chunk_ids(ROOT_USER, "//j").unwrap().len(), 3);
    assert_eq!(cluster.read_journal(ROOT_USER, "//j", 3, Some(7)).unwrap(), records(3..7));
    assert!(cluster.journal_sealed(ROOT_USER, "//j").unwrap());

    cluster.truncate_journal(ROOT_USER, "//j", 6).unwrap();
    assert_eq!(cluster.read_journal(ROOT_USER, "//j", 0, None).unwrap(), records(0..6));
    assert_eq!(cluster.journal_metrics().truncations, 1);
}

#[test]
fn test_open_writer_blocks_truncate() {
    let cluster = cluster();
    cluster
        .create_journal(ROOT_USER, "//j", JournalAttributes::default(), Acl::default())
        .unwrap();
    let open = JournalWriterOptions::default().dont_close();
    cluster.write_journal(ROOT_USER, "//j", &records(0..5), &open).unwrap();
    assert!(!cluster.journal_sealed(ROOT_USER, "//j").unwrap());
    assert!(matches!(
        cluster.truncate_journal(ROOT_USER, "//j", 1),
        Err(TabulaError::State(StateError::JournalNotSealed(_)))
    ));

    cluster
        .write_journal(ROOT_USER, "//j", &records(5..6), &JournalWriterOptions::default())
        .unwrap();
    assert!(cluster.journal_sealed(ROOT_USER, "//j").unwrap());
    cluster.truncate_journal(ROOT_USER, "//j", 1).unwrap();
}

#[test]
fn test_journal_reads_survive_banned_node() {
    let cluster = cluster();
    cluster
        .create_journal(ROOT_USER, "//j", JournalAttributes::default(), Acl::default())
        .unwrap();
    cluster
        .write_journal(ROOT_USER, "//j", &records(0..8), &JournalWriterOptions::default())
        .unwrap();
    cluster.set_node_banned("node-0", true).unwrap();
    assert_eq!(cluster.read_journal(ROOT_USER, "//j", 0, None).unwrap(), records(0..8));
    cluster
        .write_journal(ROOT_USER, "//j", &records(8..10), &JournalWriterOptions::default())
        .unwrap();
    assert_eq!(cluster.journal_quorum_row_count(ROOT_USER, "//j").unwrap(), 10);
}

#[test]
fn test_journal_acl_and_removal() {
    let cluster = cluster();
    cluster.create_user("reader").unwrap();
    let acl = Acl::new(vec![AccessControlEntry::deny("reader", &[Permission::Write])]);
    cluster
        .create_journal(ROOT_USER, "//j", JournalAttributes::default(), acl)
        .unwrap();
    cluster
        .write_journal(ROOT_USER, "//j", &records(0..2), &JournalWriterOptions::default())
        .unwrap();

    assert_eq!(cluster.read_journal("reader", "//j", 0, None).unwrap().len(), 2);
    assert!(matches!(
        cluster.write_journal("reader", "//j", &records(2..3), &JournalWriterOptions::default()),
        Err(TabulaError::PermissionDenied { .. })
    ));
    assert!(matches!(
        cluster.remove_journal("reader", "//j"),
        Err(TabulaError::PermissionDenied { .. })
    ));

    cluster.remove_journal(ROOT_USER, "//j").unwrap();
    assert!(!cluster.journal_exists("//j"));
    assert!(matches!(
        cluster.read_journal(ROOT_USER, "//j", 0, None),
        Err(TabulaError::NotFound(_))
    ));
}

#[test]
fn test_journal_and_table_paths_do_not_collide() {
    let cluster = cluster();
    cluster
        .create_table(ROOT_USER, "//x", TableOptions::static_table(kv_schema()))
        .unwrap();
    assert!(cluster
        .create_journal(ROOT_USER, "//x", JournalAttributes::default(), Acl::default())
        .is_err());
    assert!(cluster
        .create_journal(ROOT_USER, "", JournalAttributes::default(), Acl::default())
        .is_err());
}
