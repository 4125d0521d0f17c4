use quilldb::{
    Database, DbError, DbResult, FieldExtractor, FieldType, IndexField, IndexSpec, IndexValue,
    Options,
};
use std::collections::HashMap;
use tempfile::tempdir;

fn string_field(name: &str) -> IndexField {
    IndexField { name: name.into(), field_type: FieldType::String }
}

fn fields(pairs: &[(&str, IndexValue)]) -> HashMap<String, IndexValue> {
    pairs.iter().map(|(k, v)| ((*k).to_string(), v.clone())).collect()
}

#[test]
fn starts_with_query_matches_ground_truth() {
    let dir = tempdir().unwrap();
    let db = Database::create(&dir.path().join("names.qdb"), Options::default()).unwrap();
    db.create_collection(
        "people",
        &[IndexSpec { fields: vec![string_field("name")], unique: false }],
    )
    .unwrap();

    let names = [
        "alice", "albert", "alfred", "bob", "carol", "al", "zane", "ALEX", "aaron", "ally",
    ];
    let mut expected = Vec::new();
    for name in names {
        let id = db
            .insert(
                "people",
                name.as_bytes(),
                &fields(&[("name", IndexValue::String(name.into()))]),
            )
            .unwrap();
        if name.starts_with("al") {
            expected.push(id);
        }
    }
    let mut got: Vec<i32> = db
        .find_prefix("people", "name", &IndexValue::String("al".into()))
        .unwrap()
        .into_iter()
        .map(|(id, _)| id)
        .collect();
    got.sort_unstable();
    expected.sort_unstable();
    assert_eq!(got, expected);
}

#[test]
fn unique_index_rejects_duplicates_but_not_nulls() {
    let dir = tempdir().unwrap();
    let db = Database::create(&dir.path().join("unique.qdb"), Options::default()).unwrap();
    db.create_collection(
        "users",
        &[IndexSpec { fields: vec![string_field("email")], unique: true }],
    )
    .unwrap();

    db.insert("users", b"u1", &fields(&[("email", IndexValue::String("a@b".into()))])).unwrap();
    let err = db
        .insert("users", b"u2", &fields(&[("email", IndexValue::String("a@b".into()))]))
        .unwrap_err();
    assert!(matches!(err, DbError::UniqueViolation { .. }));

    // NULL is never equal to NULL: any number of null emails is fine.
    for i in 0..5 {
        db.insert(
            "users",
            format!("null-{i}").as_bytes(),
            &fields(&[("email", IndexValue::Null)]),
        )
        .unwrap();
    }

    // Replacing the holder with a different value frees the old one.
    db.replace(
        "users",
        1,
        b"u1v2",
        &fields(&[("email", IndexValue::String("c@d".into()))]),
        &fields(&[("email", IndexValue::String("a@b".into()))]),
    )
    .unwrap();
    db.insert("users", b"u3", &fields(&[("email", IndexValue::String("a@b".into()))])).unwrap();
}

#[test]
fn duplicate_inside_one_transaction_is_caught_at_stage_time() {
    let dir = tempdir().unwrap();
    let db = Database::create(&dir.path().join("dup-tx.qdb"), Options::default()).unwrap();
    db.create_collection(
        "users",
        &[IndexSpec { fields: vec![string_field("email")], unique: true }],
    )
    .unwrap();
    let mut tx = db.begin_transaction();
    tx.insert("users", b"u1", &fields(&[("email", IndexValue::String("x@y".into()))])).unwrap();
    let err = tx
        .insert("users", b"u2", &fields(&[("email", IndexValue::String("x@y".into()))]))
        .unwrap_err();
    assert!(matches!(err, DbError::UniqueViolation { .. }));
}

#[test]
fn concurrent_unique_insert_fails_at_commit() {
    let dir = tempdir().unwrap();
    let db = Database::create(&dir.path().join("dup-race.qdb"), Options::default()).unwrap();
    db.create_collection(
        "users",
        &[IndexSpec { fields: vec![string_field("email")], unique: true }],
    )
    .unwrap();
    let mut tx1 = db.begin_transaction();
    let mut tx2 = db.begin_transaction();
    let value = fields(&[("email", IndexValue::String("same@host".into()))]);
    tx1.insert("users", b"first", &value).unwrap();
    tx2.insert("users", b"second", &value).unwrap();
    tx1.commit().unwrap();
    assert!(matches!(tx2.commit(), Err(DbError::UniqueViolation { .. })));
}

#[test]
fn compound_index_queries_by_field_order() {
    let dir = tempdir().unwrap();
    let db = Database::create(&dir.path().join("compound.qdb"), Options::default()).unwrap();
    db.create_collection(
        "people",
        &[IndexSpec {
            fields: vec![string_field("last"), string_field("first")],
            unique: false,
        }],
    )
    .unwrap();
    let rows = [("smith", "ann"), ("smith", "bob"), ("stone", "ann"), ("doe", "jan")];
    for (last, first) in rows {
        db.insert(
            "people",
            format!("{last},{first}").as_bytes(),
            &fields(&[
                ("last", IndexValue::String(last.into())),
                ("first", IndexValue::String(first.into())),
            ]),
        )
        .unwrap();
    }
    let smiths = db
        .find_prefix("people", "last_first", &IndexValue::String("smith".into()))
        .unwrap();
    assert_eq!(smiths.len(), 2);
    let exact = db
        .find_eq(
            "people",
            "last_first",
            &[IndexValue::String("smith".into()), IndexValue::String("bob".into())],
        )
        .unwrap();
    assert_eq!(exact.len(), 1);
    assert_eq!(exact[0].1, b"smith,bob");
}

#[test]
fn int_range_query_is_ordered_and_bounded() {
    let dir = tempdir().unwrap();
    let db = Database::create(&dir.path().join("ages.qdb"), Options::default()).unwrap();
    db.create_collection(
        "people",
        &[IndexSpec {
            fields: vec![IndexField { name: "age".into(), field_type: FieldType::Int32 }],
            unique: false,
        }],
    )
    .unwrap();
    for age in [5, 17, 18, 33, 64, -2, 80] {
        db.insert(
            "people",
            format!("age={age}").as_bytes(),
            &fields(&[("age", IndexValue::Int32(age))]),
        )
        .unwrap();
    }
    let adults = db
        .find_range(
            "people",
            "age",
            &[IndexValue::Int32(18)],
            Some(&[IndexValue::Int32(64)]),
            true,
            true,
        )
        .unwrap();
    let mut got: Vec<Vec<u8>> = adults.into_iter().map(|(_, bytes)| bytes).collect();
    got.sort();
    assert_eq!(got, vec![b"age=18".to_vec(), b"age=33".to_vec(), b"age=64".to_vec()]);
}

struct NameExtractor;

impl FieldExtractor for NameExtractor {
    fn extract(&self, doc: &[u8], _field: &IndexField) -> DbResult<IndexValue> {
        Ok(IndexValue::String(String::from_utf8_lossy(doc).into_owned()))
    }
}

#[test]
fn ensure_indexes_backfills_existing_documents() {
    let dir = tempdir().unwrap();
    let db = Database::create(&dir.path().join("backfill.qdb"), Options::default()).unwrap();
    db.create_collection("people", &[]).unwrap();
    for name in ["mira", "milo", "ada"] {
        db.insert("people", name.as_bytes(), &HashMap::new()).unwrap();
    }
    db.ensure_indexes(
        "people",
        &[IndexSpec { fields: vec![string_field("name")], unique: false }],
        Some(&NameExtractor),
    )
    .unwrap();
    let found = db.find_prefix("people", "name", &IndexValue::String("mi".into())).unwrap();
    assert_eq!(found.len(), 2);
    assert!(db.verify().unwrap().is_empty());
}

#[test]
fn drop_index_removes_it() {
    let dir = tempdir().unwrap();
    let db = Database::create(&dir.path().join("dropix.qdb"), Options::default()).unwrap();
    db.create_collection(
        "people",
        &[IndexSpec { fields: vec![string_field("name")], unique: false }],
    )
    .unwrap();
    db.drop_index("people", "name").unwrap();
    assert!(db.indexes("people").unwrap().is_empty());
    assert!(matches!(
        db.find_prefix("people", "name", &IndexValue::String("x".into())),
        Err(DbError::NoSuchIndex(_))
    ));
    assert!(matches!(db.drop_index("people", "name"), Err(DbError::NoSuchIndex(_))));
}

#[test]
fn index_updates_follow_replace_and_delete() {
    let dir = tempdir().unwrap();
    let db = Database::create(&dir.path().join("ixupd.qdb"), Options::default()).unwrap();
    db.create_collection(
        "people",
        &[IndexSpec { fields: vec![string_field("name")], unique: false }],
    )
    .unwrap();
    let id = db
        .insert("people", b"v1", &fields(&[("name", IndexValue::String("old".into()))]))
        .unwrap();
    db.replace(
        "people",
        id,
        b"v2",
        &fields(&[("name", IndexValue::String("new".into()))]),
        &fields(&[("name", IndexValue::String("old".into()))]),
    )
    .unwrap();
    assert!(db.find_eq("people", "name", &[IndexValue::String("old".into())]).unwrap().is_empty());
    let found = db.find_eq("people", "name", &[IndexValue::String("new".into())]).unwrap();
    assert_eq!(found.len(), 1);
    db.delete_by_id("people", id, &fields(&[("name", IndexValue::String("new".into()))])).unwrap();
    assert!(db.find_eq("people", "name", &[IndexValue::String("new".into())]).unwrap().is_empty());
    assert!(db.verify().unwrap().is_empty());
}

#[test]
fn secondary_tree_handles_thousands_of_keys() {
    let dir = tempdir().unwrap();
    let db = Database::create(&dir.path().join("ixbig.qdb"), Options::default()).unwrap();
    db.create_collection(
        "people",
        &[IndexSpec { fields: vec![string_field("name")], unique: false }],
    )
    .unwrap();
    for i in 0..2000u32 {
        let name = format!("name-{i:05}");
        db.insert(
            "people",
            name.as_bytes(),
            &fields(&[("name", IndexValue::String(name.clone()))]),
        )
        .unwrap();
    }
    let page = db.find_prefix("people", "name", &IndexValue::String("name-001".into())).unwrap();
    assert_eq!(page.len(), 100);
    assert!(db.verify().unwrap().is_empty());
}
