use proptest::collection::vec;
use proptest::prelude::*;
use quilldb::{Database, Options};
use std::collections::HashMap;
use tempfile::tempdir;

proptest! {
    #![proptest_config(ProptestConfig::with_cases(12))]

    // Documents of arbitrary sizes, spanning the single-page/overflow
    // boundary at pageSize 1024, must read back byte-identical.
    #[test]
    fn documents_round_trip(sizes in vec(1usize..6000, 1..12)) {
        let dir = tempdir().unwrap();
        let options = Options { page_size: 1024, ..Default::default() };
        let db = Database::create(&dir.path().join("prop.qdb"), options).unwrap();
        db.create_collection("docs", &[]).unwrap();
        let no_fields = HashMap::new();

        let mut stored = Vec::new();
        for (i, size) in sizes.iter().enumerate() {
            let payload: Vec<u8> = (0..*size).map(|j| ((i * 31 + j) % 256) as u8).collect();
            let id = db.insert("docs", &payload, &no_fields).unwrap();
            stored.push((id, payload));
        }
        for (id, payload) in &stored {
            prop_assert_eq!(db.get_by_id("docs", *id).unwrap().unwrap(), payload.clone());
        }
        prop_assert!(db.verify().unwrap().is_empty());
    }

    // Random interleavings of inserts, replaces, and deletes agree with an
    // in-memory model.
    #[test]
    fn crud_agrees_with_a_model(ops in vec((0u8..3, 0usize..24, 1usize..200), 1..60)) {
        let dir = tempdir().unwrap();
        let db = Database::create(&dir.path().join("model.qdb"), Options::default()).unwrap();
        db.create_collection("docs", &[]).unwrap();
        let no_fields = HashMap::new();

        let mut model: std::collections::BTreeMap<i32, Vec<u8>> = std::collections::BTreeMap::new();
        let mut known_ids: Vec<i32> = Vec::new();

        for (kind, pick, size) in ops {
            let payload: Vec<u8> = (0..size).map(|j| (j % 256) as u8).collect();
            match kind {
                0 => {
                    let id = db.insert("docs", &payload, &no_fields).unwrap();
                    model.insert(id, payload);
                    known_ids.push(id);
                }
                1 if !known_ids.is_empty() => {
                    let id = known_ids[pick % known_ids.len()];
                    let replaced = db.replace("docs", id, &payload, &no_fields, &no_fields).unwrap();
                    prop_assert_eq!(replaced, model.contains_key(&id));
                    if replaced {
                        model.insert(id, payload);
                    }
                }
                2 if !known_ids.is_empty() => {
                    let id = known_ids[pick % known_ids.len()];
                    let deleted = db.delete_by_id("docs", id, &no_fields).unwrap();
                    prop_assert_eq!(deleted, model.remove(&id).is_some());
                }
                _ => {}
            }
        }

        let rows = db.scan_primary("docs", None, None, true, true).unwrap();
        let got: std::collections::BTreeMap<i32, Vec<u8>> = rows.into_iter().collect();
        prop_assert_eq!(got, model);
    }
}
