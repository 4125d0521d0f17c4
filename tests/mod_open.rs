use quilldb::{Database, DbError, Options};
use std::collections::HashMap;
use tempfile::tempdir;

#[test]
fn create_then_open_round_trip() {
    let dir = tempdir().unwrap();
    let path = dir.path().join("open.qdb");
    {
        let db = Database::create(&path, Options::default()).unwrap();
        db.create_collection("docs", &[]).unwrap();
        db.insert("docs", b"hello", &HashMap::new()).unwrap();
    }
    let db = Database::open(&path, Options::default()).unwrap();
    assert_eq!(db.collection_names(), vec!["docs".to_string()]);
    assert_eq!(db.get_by_id("docs", 1).unwrap().unwrap(), b"hello");
}

#[test]
fn create_refuses_existing_file() {
    let dir = tempdir().unwrap();
    let path = dir.path().join("exists.qdb");
    let _db = Database::create(&path, Options::default()).unwrap();
    assert!(matches!(
        Database::create(&path, Options::default()),
        Err(DbError::FileExists(_))
    ));
}

#[test]
fn open_missing_file_fails() {
    let dir = tempdir().unwrap();
    let path = dir.path().join("missing.qdb");
    assert!(matches!(Database::open(&path, Options::default()), Err(DbError::FileNotFound(_))));
}

#[test]
fn stored_page_size_wins_over_options() {
    let dir = tempdir().unwrap();
    let path = dir.path().join("sizes.qdb");
    {
        let options = Options { page_size: 8192, ..Default::default() };
        let db = Database::create(&path, options).unwrap();
        db.create_collection("docs", &[]).unwrap();
        db.insert("docs", b"payload", &HashMap::new()).unwrap();
    }
    // Opening with a different configured page size must succeed; the
    // on-disk value is authoritative.
    let options = Options { page_size: 1024, ..Default::default() };
    let db = Database::open(&path, options).unwrap();
    assert_eq!(db.get_by_id("docs", 1).unwrap().unwrap(), b"payload");
    db.insert("docs", b"more", &HashMap::new()).unwrap();
    assert_eq!(db.get_by_id("docs", 2).unwrap().unwrap(), b"more");
}

#[test]
fn open_or_create_does_both() {
    let dir = tempdir().unwrap();
    let path = dir.path().join("either.qdb");
    {
        let db = Database::open_or_create(&path, Options::default()).unwrap();
        db.create_collection("docs", &[]).unwrap();
    }
    let db = Database::open_or_create(&path, Options::default()).unwrap();
    assert_eq!(db.collection_names(), vec!["docs".to_string()]);
}

#[test]
fn invalid_page_size_is_rejected() {
    let dir = tempdir().unwrap();
    let path = dir.path().join("bad.qdb");
    for page_size in [512, 3000, 1 << 20] {
        let options = Options { page_size, ..Default::default() };
        assert!(matches!(
            Database::create(&path, options),
            Err(DbError::InvalidHeader(_))
        ));
    }
}

#[test]
fn collections_survive_reopen_with_indexes() {
    use quilldb::{FieldType, IndexField, IndexSpec};
    let dir = tempdir().unwrap();
    let path = dir.path().join("catalog.qdb");
    {
        let db = Database::create(&path, Options::default()).unwrap();
        db.create_collection(
            "users",
            &[IndexSpec {
                fields: vec![IndexField { name: "email".into(), field_type: FieldType::String }],
                unique: true,
            }],
        )
        .unwrap();
    }
    let db = Database::open(&path, Options::default()).unwrap();
    let indexes = db.indexes("users").unwrap();
    assert_eq!(indexes.len(), 1);
    assert_eq!(indexes[0].name(), "email");
    assert!(indexes[0].unique);
}
