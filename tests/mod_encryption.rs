use quilldb::{Database, DbError, EncryptionOptions, KdfParams, Options};
use std::collections::HashMap;
use tempfile::tempdir;

fn enc_options(password: &str) -> Options {
    Options {
        encryption: Some(EncryptionOptions {
            password: password.into(),
            // Fast parameters keep the tests snappy; production uses the
            // defaults.
            kdf: KdfParams { t_cost: 1, m_cost_kib: 16, lanes: 1 },
        }),
        ..Default::default()
    }
}

#[test]
fn encrypted_database_round_trips() {
    let dir = tempdir().unwrap();
    let path = dir.path().join("secret.qdb");
    {
        let db = Database::create(&path, enc_options("hunter2")).unwrap();
        db.create_collection("docs", &[]).unwrap();
        let no_fields = HashMap::new();
        for i in 0..40u32 {
            db.insert("docs", format!("classified {i}").as_bytes(), &no_fields).unwrap();
        }
    }
    let db = Database::open(&path, enc_options("hunter2")).unwrap();
    assert_eq!(db.get_by_id("docs", 7).unwrap().unwrap(), b"classified 6");
    assert_eq!(db.scan_primary("docs", None, None, true, true).unwrap().len(), 40);
}

#[test]
fn wrong_password_fails_without_touching_the_wal() {
    let dir = tempdir().unwrap();
    let path = dir.path().join("locked.qdb");
    {
        let db = Database::create(&path, enc_options("right")).unwrap();
        db.create_collection("docs", &[]).unwrap();
        db.insert("docs", b"payload", &HashMap::new()).unwrap();
        db.checkpoint().unwrap();
    }
    // Remove the (truncated) log so a failed open that touched it would
    // be observable.
    let mut wal = path.as_os_str().to_owned();
    wal.push(".wal");
    std::fs::remove_file(&wal).unwrap();

    assert!(matches!(
        Database::open(&path, enc_options("wrong")),
        Err(DbError::InvalidPassword)
    ));
    assert!(!std::path::Path::new(&wal).exists(), "a failed open must not create the WAL");

    let db = Database::open(&path, enc_options("right")).unwrap();
    assert_eq!(db.get_by_id("docs", 1).unwrap().unwrap(), b"payload");
}

#[test]
fn opening_encrypted_without_password_is_a_mismatch() {
    let dir = tempdir().unwrap();
    let path = dir.path().join("nopw.qdb");
    let _db = Database::create(&path, enc_options("pw")).unwrap();
    assert!(matches!(
        Database::open(&path, Options::default()),
        Err(DbError::EncryptionMismatch(_))
    ));
}

#[test]
fn opening_plaintext_with_password_is_a_mismatch() {
    let dir = tempdir().unwrap();
    let path = dir.path().join("plain.qdb");
    let _db = Database::create(&path, Options::default()).unwrap();
    assert!(matches!(
        Database::open(&path, enc_options("pw")),
        Err(DbError::EncryptionMismatch(_))
    ));
}

#[test]
fn encrypted_overflow_documents_work() {
    let dir = tempdir().unwrap();
    let path = dir.path().join("bigsecret.qdb");
    let db = Database::create(&path, enc_options("pw")).unwrap();
    db.create_collection("blobs", &[]).unwrap();
    let payload: Vec<u8> = (0..50_000).map(|i| (i % 241) as u8).collect();
    let id = db.insert("blobs", &payload, &HashMap::new()).unwrap();
    assert_eq!(db.get_by_id("blobs", id).unwrap().unwrap(), payload);
}
