use quilldb::{Database, Options};
use std::collections::HashMap;
use tempfile::tempdir;

fn new_db(dir: &tempfile::TempDir, name: &str) -> Database {
    // Manual GC only, so the tests control when collection happens.
    let options = Options { auto_gc: false, ..Default::default() };
    let db = Database::create(&dir.path().join(name), options).unwrap();
    db.create_collection("docs", &[]).unwrap();
    db
}

#[test]
fn vacuum_collects_replaced_versions() {
    let dir = tempdir().unwrap();
    let db = new_db(&dir, "gc.qdb");
    let no_fields = HashMap::new();
    let id = db.insert("docs", b"v1", &no_fields).unwrap();
    for value in [b"v2".as_slice(), b"v3", b"v4"] {
        db.replace("docs", id, value, &no_fields, &no_fields).unwrap();
    }
    let stats = db.vacuum().unwrap();
    assert_eq!(stats.versions_collected, 3);
    assert_eq!(db.get_by_id("docs", id).unwrap().unwrap(), b"v4");
    assert!(db.verify().unwrap().is_empty());
}

#[test]
fn vacuum_is_idempotent() {
    let dir = tempdir().unwrap();
    let db = new_db(&dir, "twice.qdb");
    let no_fields = HashMap::new();
    for i in 0..20u32 {
        let id = db.insert("docs", format!("{i}").as_bytes(), &no_fields).unwrap();
        if i % 2 == 0 {
            db.delete_by_id("docs", id, &no_fields).unwrap();
        }
    }
    let first = db.vacuum().unwrap();
    assert!(first.versions_collected > 0);
    // With no intervening writes the second run is a no-op.
    let second = db.vacuum().unwrap();
    assert_eq!(second.versions_collected, 0);
    assert_eq!(second.docs_processed, 0);
    assert_eq!(second.pages_compacted, 0);
}

#[test]
fn gc_spares_versions_an_active_snapshot_needs() {
    let dir = tempdir().unwrap();
    let db = new_db(&dir, "spared.qdb");
    let no_fields = HashMap::new();
    let id = db.insert("docs", b"original", &no_fields).unwrap();
    let reader = db.begin_read_only_transaction();
    db.replace("docs", id, b"updated", &no_fields, &no_fields).unwrap();

    let stats = db.vacuum().unwrap();
    assert_eq!(stats.versions_collected, 0, "reader still needs the original");
    assert_eq!(reader.get("docs", id).unwrap().unwrap(), b"original");
    reader.abort().unwrap();

    let stats = db.vacuum().unwrap();
    assert_eq!(stats.versions_collected, 1);
    assert_eq!(db.get_by_id("docs", id).unwrap().unwrap(), b"updated");
}

#[test]
fn auto_gc_runs_every_n_commits() {
    let dir = tempdir().unwrap();
    let options = Options { auto_gc: true, gc_threshold: 8, ..Default::default() };
    let db = Database::create(&dir.path().join("auto.qdb"), options).unwrap();
    db.create_collection("docs", &[]).unwrap();
    let no_fields = HashMap::new();
    let id = db.insert("docs", b"seed", &no_fields).unwrap();
    for i in 0..40u32 {
        db.replace("docs", id, format!("gen {i}").as_bytes(), &no_fields, &no_fields).unwrap();
    }
    // Old versions were collected along the way; an explicit vacuum has
    // little left to do.
    let stats = db.vacuum().unwrap();
    assert!(stats.versions_collected <= 8);
    assert_eq!(db.get_by_id("docs", id).unwrap().unwrap(), b"gen 39");
}

#[test]
fn vacuum_compacts_fragmented_pages() {
    let dir = tempdir().unwrap();
    let db = new_db(&dir, "frag.qdb");
    let no_fields = HashMap::new();
    // Fill pages with small documents, then delete most of them.
    let mut ids = Vec::new();
    for i in 0..300u32 {
        ids.push(db.insert("docs", format!("filler {i:04}").as_bytes(), &no_fields).unwrap());
    }
    for id in ids.iter().filter(|id| **id % 4 != 0) {
        db.delete_by_id("docs", *id, &no_fields).unwrap();
    }
    let stats = db.vacuum().unwrap();
    assert!(stats.versions_collected > 0);
    assert!(stats.pages_compacted > 0, "deleting three quarters must fragment pages");
    assert!(db.verify().unwrap().is_empty());
    assert_eq!(db.scan_primary("docs", None, None, true, true).unwrap().len(), 75);
}
