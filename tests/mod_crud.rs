use quilldb::{Database, Options};
use std::collections::HashMap;
use tempfile::tempdir;

fn new_db(dir: &tempfile::TempDir, name: &str) -> Database {
    let db = Database::create(&dir.path().join(name), Options::default()).unwrap();
    db.create_collection("docs", &[]).unwrap();
    db
}

#[test]
fn insert_assigns_monotonic_ids() {
    let dir = tempdir().unwrap();
    let db = new_db(&dir, "ids.qdb");
    let no_fields = HashMap::new();
    assert_eq!(db.insert("docs", b"a", &no_fields).unwrap(), 1);
    assert_eq!(db.insert("docs", b"b", &no_fields).unwrap(), 2);
    assert_eq!(db.insert("docs", b"c", &no_fields).unwrap(), 3);
    assert_eq!(db.get_by_id("docs", 2).unwrap().unwrap(), b"b");
}

#[test]
fn replace_swaps_the_visible_value() {
    let dir = tempdir().unwrap();
    let db = new_db(&dir, "replace.qdb");
    let no_fields = HashMap::new();
    let id = db.insert("docs", b"first", &no_fields).unwrap();
    assert!(db.replace("docs", id, b"second", &no_fields, &no_fields).unwrap());
    assert_eq!(db.get_by_id("docs", id).unwrap().unwrap(), b"second");
    // Replacing a missing id reports false.
    assert!(!db.replace("docs", 999, b"x", &no_fields, &no_fields).unwrap());
}

#[test]
fn delete_hides_the_document() {
    let dir = tempdir().unwrap();
    let db = new_db(&dir, "delete.qdb");
    let no_fields = HashMap::new();
    let id = db.insert("docs", b"gone soon", &no_fields).unwrap();
    assert!(db.delete_by_id("docs", id, &no_fields).unwrap());
    assert!(db.get_by_id("docs", id).unwrap().is_none());
    assert!(!db.delete_by_id("docs", id, &no_fields).unwrap());
}

#[test]
fn transaction_reads_its_own_writes() {
    let dir = tempdir().unwrap();
    let db = new_db(&dir, "ryow.qdb");
    let no_fields = HashMap::new();
    let mut tx = db.begin_transaction();
    let id = tx.insert("docs", b"buffered", &no_fields).unwrap();
    assert_eq!(tx.get("docs", id).unwrap().unwrap(), b"buffered");
    assert!(tx.replace("docs", id, b"rewritten", &no_fields, &no_fields).unwrap());
    assert_eq!(tx.get("docs", id).unwrap().unwrap(), b"rewritten");
    // Nothing is visible outside until commit.
    assert!(db.get_by_id("docs", id).unwrap().is_none());
    tx.commit().unwrap();
    assert_eq!(db.get_by_id("docs", id).unwrap().unwrap(), b"rewritten");
}

#[test]
fn abort_discards_everything() {
    let dir = tempdir().unwrap();
    let db = new_db(&dir, "abort.qdb");
    let no_fields = HashMap::new();
    let keep = db.insert("docs", b"keep", &no_fields).unwrap();
    let mut tx = db.begin_transaction();
    let id = tx.insert("docs", b"discard", &no_fields).unwrap();
    assert!(tx.delete("docs", keep, &no_fields).unwrap());
    tx.abort().unwrap();
    assert!(db.get_by_id("docs", id).unwrap().is_none());
    assert_eq!(db.get_by_id("docs", keep).unwrap().unwrap(), b"keep");
}

#[test]
fn insert_then_delete_in_one_transaction_cancels_out() {
    let dir = tempdir().unwrap();
    let db = new_db(&dir, "cancel.qdb");
    let no_fields = HashMap::new();
    let mut tx = db.begin_transaction();
    let id = tx.insert("docs", b"ephemeral", &no_fields).unwrap();
    assert!(tx.delete("docs", id, &no_fields).unwrap());
    assert!(tx.get("docs", id).unwrap().is_none());
    tx.commit().unwrap();
    assert!(db.get_by_id("docs", id).unwrap().is_none());
}

#[test]
fn primary_range_scan_matches_ground_truth() {
    let dir = tempdir().unwrap();
    let db = new_db(&dir, "scan.qdb");
    let no_fields = HashMap::new();
    for i in 0..200u32 {
        db.insert("docs", format!("doc-{i}").as_bytes(), &no_fields).unwrap();
    }
    let rows = db.scan_primary("docs", Some(50), Some(60), true, false).unwrap();
    let ids: Vec<i32> = rows.iter().map(|(id, _)| *id).collect();
    assert_eq!(ids, (50..60).collect::<Vec<i32>>());
    for (id, bytes) in rows {
        assert_eq!(bytes, format!("doc-{}", id - 1).into_bytes());
    }
    // Full scan.
    assert_eq!(db.scan_primary("docs", None, None, true, true).unwrap().len(), 200);
}

#[test]
fn collection_info_derives_document_count() {
    let dir = tempdir().unwrap();
    let db = new_db(&dir, "info.qdb");
    let no_fields = HashMap::new();
    for _ in 0..25 {
        db.insert("docs", b"row", &no_fields).unwrap();
    }
    db.delete_by_id("docs", 10, &no_fields).unwrap();
    let info = db.collection_info("docs").unwrap();
    assert_eq!(info.document_count, 24);
}

#[test]
fn many_inserts_and_deletes_keep_the_tree_consistent() {
    let dir = tempdir().unwrap();
    let db = new_db(&dir, "churn.qdb");
    let no_fields = HashMap::new();
    for i in 0..1500u32 {
        db.insert("docs", format!("row {i}").as_bytes(), &no_fields).unwrap();
    }
    // Delete every third document to force borrows and merges.
    for id in (1..=1500i32).filter(|id| id % 3 == 0) {
        assert!(db.delete_by_id("docs", id, &no_fields).unwrap());
    }
    db.vacuum().unwrap();
    let rows = db.scan_primary("docs", None, None, true, true).unwrap();
    assert_eq!(rows.len(), 1000);
    assert!(rows.iter().all(|(id, _)| id % 3 != 0));
    assert!(db.verify().unwrap().is_empty());
}
