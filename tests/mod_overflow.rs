use quilldb::{Database, Options};
use std::collections::HashMap;
use tempfile::tempdir;

fn patterned(len: usize) -> Vec<u8> {
    (0..len).map(|i| (i % 251) as u8).collect()
}

#[test]
fn large_documents_read_back_byte_identical() {
    let dir = tempdir().unwrap();
    let db = Database::create(&dir.path().join("big.qdb"), Options::default()).unwrap();
    db.create_collection("blobs", &[]).unwrap();
    let no_fields = HashMap::new();
    for len in [5_000, 40_000, 300_000] {
        let payload = patterned(len);
        let id = db.insert("blobs", &payload, &no_fields).unwrap();
        assert_eq!(db.get_by_id("blobs", id).unwrap().unwrap(), payload);
    }
    assert!(db.verify().unwrap().is_empty());
}

#[test]
fn exact_page_multiples_round_trip() {
    let dir = tempdir().unwrap();
    let db = Database::create(&dir.path().join("exact.qdb"), Options::default()).unwrap();
    db.create_collection("blobs", &[]).unwrap();
    let no_fields = HashMap::new();
    // Sizes straddling page-multiple boundaries at pageSize 4096.
    for len in [4096, 4097, 8192, 12288, 12289] {
        let payload = patterned(len);
        let id = db.insert("blobs", &payload, &no_fields).unwrap();
        assert_eq!(db.get_by_id("blobs", id).unwrap().unwrap(), payload);
    }
}

#[test]
fn ten_megabyte_document_with_4k_pages() {
    let dir = tempdir().unwrap();
    let db = Database::create(&dir.path().join("huge.qdb"), Options::default()).unwrap();
    db.create_collection("blobs", &[]).unwrap();
    let no_fields = HashMap::new();
    let payload = patterned(10 * 1024 * 1024);
    let id = db.insert("blobs", &payload, &no_fields).unwrap();
    assert_eq!(db.get_by_id("blobs", id).unwrap().unwrap(), payload);

    // Delete it and vacuum: the continuation pages become free and a
    // same-sized re-insert reuses them instead of growing the file.
    db.delete_by_id("blobs", id, &no_fields).unwrap();
    let stats = db.vacuum().unwrap();
    assert!(stats.versions_collected >= 1);
    assert!(stats.docs_processed >= 1);
    db.checkpoint().unwrap();
    let len_after_vacuum = std::fs::metadata(dir.path().join("huge.qdb")).unwrap().len();

    let id2 = db.insert("blobs", &payload, &no_fields).unwrap();
    assert_eq!(db.get_by_id("blobs", id2).unwrap().unwrap(), payload);
    db.checkpoint().unwrap();
    let len_after_reinsert = std::fs::metadata(dir.path().join("huge.qdb")).unwrap().len();
    assert_eq!(
        len_after_vacuum, len_after_reinsert,
        "the reinserted document must reuse the freed contiguous run"
    );
}

#[test]
fn overflow_documents_survive_reopen() {
    let dir = tempdir().unwrap();
    let path = dir.path().join("persist.qdb");
    let payload = patterned(100_000);
    {
        let db = Database::create(&path, Options::default()).unwrap();
        db.create_collection("blobs", &[]).unwrap();
        db.insert("blobs", &payload, &HashMap::new()).unwrap();
    }
    let db = Database::open(&path, Options::default()).unwrap();
    assert_eq!(db.get_by_id("blobs", 1).unwrap().unwrap(), payload);
}
