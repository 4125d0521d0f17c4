use quilldb::{Database, DbError, Options};
use std::collections::HashMap;
use tempfile::tempdir;

fn new_db(dir: &tempfile::TempDir, name: &str) -> Database {
    let db = Database::create(&dir.path().join(name), Options::default()).unwrap();
    db.create_collection("docs", &[]).unwrap();
    db
}

#[test]
fn exactly_one_of_two_conflicting_replaces_wins() {
    let dir = tempdir().unwrap();
    let db = new_db(&dir, "conflict.qdb");
    let no_fields = HashMap::new();
    let id = db.insert("docs", b"base", &no_fields).unwrap();

    let mut tx1 = db.begin_transaction();
    let mut tx2 = db.begin_transaction();
    assert!(tx1.replace("docs", id, b"from tx1", &no_fields, &no_fields).unwrap());
    assert!(tx2.replace("docs", id, b"from tx2", &no_fields, &no_fields).unwrap());

    tx1.commit().unwrap();
    let err = tx2.commit().unwrap_err();
    assert!(matches!(err, DbError::VersionConflict { .. }));
    assert_eq!(db.get_by_id("docs", id).unwrap().unwrap(), b"from tx1");

    // The loser may retry against the new head.
    let mut retry = db.begin_transaction();
    assert!(retry.replace("docs", id, b"retried", &no_fields, &no_fields).unwrap());
    retry.commit().unwrap();
    assert_eq!(db.get_by_id("docs", id).unwrap().unwrap(), b"retried");
}

#[test]
fn conflicting_deletes_also_collide() {
    let dir = tempdir().unwrap();
    let db = new_db(&dir, "del-conflict.qdb");
    let no_fields = HashMap::new();
    let id = db.insert("docs", b"victim", &no_fields).unwrap();
    let mut tx1 = db.begin_transaction();
    let mut tx2 = db.begin_transaction();
    assert!(tx1.delete("docs", id, &no_fields).unwrap());
    assert!(tx2.delete("docs", id, &no_fields).unwrap());
    tx1.commit().unwrap();
    assert!(matches!(tx2.commit(), Err(DbError::VersionConflict { .. })));
}

#[test]
fn read_only_snapshot_is_stable_across_commits_and_gc() {
    let dir = tempdir().unwrap();
    let db = new_db(&dir, "stable.qdb");
    let no_fields = HashMap::new();
    let before = db.insert("docs", b"old value", &no_fields).unwrap();

    let reader = db.begin_read_only_transaction();
    assert_eq!(reader.get("docs", before).unwrap().unwrap(), b"old value");

    // Another transaction inserts, replaces, and garbage collection runs.
    let mut writer = db.begin_transaction();
    let inserted = writer.insert("docs", b"new doc", &no_fields).unwrap();
    writer.replace("docs", before, b"new value", &no_fields, &no_fields).unwrap();
    writer.commit().unwrap();
    db.vacuum().unwrap();

    // The reader still sees exactly its snapshot: no new doc, old value.
    assert!(reader.get("docs", inserted).unwrap().is_none());
    assert_eq!(reader.get("docs", before).unwrap().unwrap(), b"old value");
    reader.abort().unwrap();

    // A fresh snapshot sees the committed state.
    assert_eq!(db.get_by_id("docs", inserted).unwrap().unwrap(), b"new doc");
    assert_eq!(db.get_by_id("docs", before).unwrap().unwrap(), b"new value");
}

#[test]
fn commits_become_visible_atomically() {
    let dir = tempdir().unwrap();
    let db = new_db(&dir, "atomic.qdb");
    let no_fields = HashMap::new();
    let mut tx = db.begin_transaction();
    let a = tx.insert("docs", b"a", &no_fields).unwrap();
    let b = tx.insert("docs", b"b", &no_fields).unwrap();
    let c = tx.insert("docs", b"c", &no_fields).unwrap();

    // Snapshot taken before the commit sees none of the three.
    let early = db.begin_read_only_transaction();
    tx.commit().unwrap();
    for id in [a, b, c] {
        assert!(early.get("docs", id).unwrap().is_none());
    }
    early.abort().unwrap();

    // A snapshot after the commit sees all of them.
    let late = db.begin_read_only_transaction();
    for id in [a, b, c] {
        assert!(late.get("docs", id).unwrap().is_some());
    }
    late.abort().unwrap();
}

#[test]
fn read_only_transactions_refuse_writes() {
    let dir = tempdir().unwrap();
    let db = new_db(&dir, "ro.qdb");
    let no_fields = HashMap::new();
    let mut tx = db.begin_read_only_transaction();
    assert!(matches!(
        tx.insert("docs", b"nope", &no_fields),
        Err(DbError::ReadOnlyTransaction)
    ));
}

#[test]
fn snapshot_scans_see_documents_deleted_later() {
    let dir = tempdir().unwrap();
    let db = new_db(&dir, "scan-snap.qdb");
    let no_fields = HashMap::new();
    for i in 0..10u32 {
        db.insert("docs", format!("{i}").as_bytes(), &no_fields).unwrap();
    }
    let reader = db.begin_read_only_transaction();
    db.delete_by_id("docs", 5, &no_fields).unwrap();
    let rows = reader.scan_primary("docs", None, None, true, true).unwrap();
    assert_eq!(rows.len(), 10);
    reader.abort().unwrap();
    assert_eq!(db.scan_primary("docs", None, None, true, true).unwrap().len(), 9);
}
