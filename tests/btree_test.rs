use std::sync::Arc;

use granite::btree::{node::int_key, BPlusTree, KeyComparator};
use granite::buffer_pool::BufferPoolConfig;
use granite::engine::StorageEngine;
use granite::record::{Column, Field, Row, Schema, TypeId};
use granite::RowId;
use rand::seq::SliceRandom;
use rand::SeedableRng;
use tempfile::tempdir;

fn int_comparator() -> KeyComparator {
    KeyComparator::new(Arc::new(Schema::new(vec![Column::new(
        "k",
        TypeId::Int,
        0,
        false,
        true,
    )])))
}

fn engine_fixture() -> (tempfile::TempDir, StorageEngine) {
    let dir = tempdir().unwrap();
    let engine = StorageEngine::open(
        dir.path().join("test.db"),
        BufferPoolConfig {
            size: 64,
            ..Default::default()
        },
    )
    .unwrap();
    (dir, engine)
}

fn key_of(cmp: &KeyComparator, v: i32) -> Vec<u8> {
    cmp.serialize_key(&int_key(v))
}

#[test]
fn random_insert_remove_holds_invariants() {
    let (_dir, engine) = engine_fixture();
    let cmp = int_comparator();
    let tree = BPlusTree::new(0, Arc::clone(engine.buffer_pool()), cmp.clone(), None, None).unwrap();

    let mut rng = rand::rngs::StdRng::seed_from_u64(17);
    let mut keys: Vec<i32> = (0..10_000).collect();
    keys.shuffle(&mut rng);
    for &k in &keys {
        assert!(tree.insert(&key_of(&cmp, k), RowId::new(2, k as u32)).unwrap());
    }
    tree.verify_integrity().unwrap();

    // In-order traversal must equal the sorted key set.
    let traversed: Vec<i32> = tree
        .iter()
        .unwrap()
        .map(|(key, _)| i32::from_le_bytes(key[1..5].try_into().unwrap()))
        .collect();
    assert_eq!(traversed, (0..10_000).collect::<Vec<_>>());

    // Delete a random half.
    keys.shuffle(&mut rng);
    let (deleted, kept) = keys.split_at(keys.len() / 2);
    for &k in deleted {
        tree.remove(&key_of(&cmp, k)).unwrap();
    }
    tree.verify_integrity().unwrap();

    for &k in kept {
        assert_eq!(
            tree.get_value(&key_of(&cmp, k)).unwrap(),
            Some(RowId::new(2, k as u32)),
            "key {k} should survive"
        );
    }
    for &k in deleted {
        assert_eq!(tree.get_value(&key_of(&cmp, k)).unwrap(), None);
    }
}

#[test]
fn duplicate_keys_are_rejected() {
    let (_dir, engine) = engine_fixture();
    let cmp = int_comparator();
    let tree = BPlusTree::new(0, Arc::clone(engine.buffer_pool()), cmp.clone(), None, None).unwrap();

    let key = key_of(&cmp, 42);
    assert!(tree.insert(&key, RowId::new(2, 1)).unwrap());
    assert!(!tree.insert(&key, RowId::new(2, 2)).unwrap());
    // The first mapping is untouched.
    assert_eq!(tree.get_value(&key).unwrap(), Some(RowId::new(2, 1)));
}

#[test]
fn small_fanout_tree_drains_to_empty() {
    let (_dir, engine) = engine_fixture();
    let cmp = int_comparator();
    // Tiny fan-outs force splits, redistribution and coalescing.
    let tree = BPlusTree::new(
        0,
        Arc::clone(engine.buffer_pool()),
        cmp.clone(),
        Some(4),
        Some(4),
    )
    .unwrap();

    let mut rng = rand::rngs::StdRng::seed_from_u64(5);
    let mut keys: Vec<i32> = (0..500).collect();
    keys.shuffle(&mut rng);
    for &k in &keys {
        tree.insert(&key_of(&cmp, k), RowId::new(2, k as u32)).unwrap();
    }
    tree.verify_integrity().unwrap();

    keys.shuffle(&mut rng);
    for &k in &keys {
        tree.remove(&key_of(&cmp, k)).unwrap();
    }
    assert!(tree.is_empty());
    assert_eq!(tree.iter().unwrap().count(), 0);

    // The tree is reusable after being drained.
    tree.insert(&key_of(&cmp, 1), RowId::new(2, 1)).unwrap();
    assert_eq!(tree.get_value(&key_of(&cmp, 1)).unwrap(), Some(RowId::new(2, 1)));
}

#[test]
fn range_scan_starts_at_the_requested_key() {
    let (_dir, engine) = engine_fixture();
    let cmp = int_comparator();
    let tree =
        BPlusTree::new(0, Arc::clone(engine.buffer_pool()), cmp.clone(), Some(4), Some(4)).unwrap();
    for k in (0..100).step_by(2) {
        tree.insert(&key_of(&cmp, k), RowId::new(2, k as u32)).unwrap();
    }

    // From an absent key: the scan begins at the next greater key.
    let from_absent: Vec<i32> = tree
        .iter_from(&key_of(&cmp, 31))
        .unwrap()
        .map(|(key, _)| i32::from_le_bytes(key[1..5].try_into().unwrap()))
        .collect();
    assert_eq!(from_absent, (32..100).step_by(2).collect::<Vec<_>>());

    let from_present: Vec<i32> = tree
        .iter_from(&key_of(&cmp, 90))
        .unwrap()
        .map(|(key, _)| i32::from_le_bytes(key[1..5].try_into().unwrap()))
        .collect();
    assert_eq!(from_present, vec![90, 92, 94, 96, 98]);
}

#[test]
fn composite_keys_order_by_column() {
    let (_dir, engine) = engine_fixture();
    let key_schema = Arc::new(Schema::new(vec![
        Column::new("id", TypeId::Int, 0, false, false),
        Column::with_length("name", 8, 1, true, false),
    ]));
    let cmp = KeyComparator::new(key_schema.clone());
    let tree = BPlusTree::new(0, Arc::clone(engine.buffer_pool()), cmp.clone(), None, None).unwrap();

    let key = |id: i32, name: &str| {
        cmp.serialize_key(&Row::new(vec![
            Field::Int(id),
            Field::Char(name.to_string()),
        ]))
    };
    tree.insert(&key(2, "b"), RowId::new(2, 0)).unwrap();
    tree.insert(&key(1, "z"), RowId::new(2, 1)).unwrap();
    tree.insert(&key(2, "a"), RowId::new(2, 2)).unwrap();

    let rids: Vec<RowId> = tree.iter().unwrap().map(|(_, rid)| rid).collect();
    assert_eq!(
        rids,
        vec![RowId::new(2, 1), RowId::new(2, 2), RowId::new(2, 0)]
    );
    assert_eq!(tree.get_value(&key(2, "a")).unwrap(), Some(RowId::new(2, 2)));
    assert_eq!(tree.get_value(&key(3, "a")).unwrap(), None);
}

#[test]
fn root_page_id_survives_reopen() {
    let dir = tempdir().unwrap();
    let path = dir.path().join("test.db");
    let cmp = int_comparator();
    {
        let engine = StorageEngine::open(&path, BufferPoolConfig::default()).unwrap();
        let tree =
            BPlusTree::new(7, Arc::clone(engine.buffer_pool()), cmp.clone(), None, None).unwrap();
        for k in 0..100 {
            tree.insert(&key_of(&cmp, k), RowId::new(2, k as u32)).unwrap();
        }
        engine.close().unwrap();
    }
    let engine = StorageEngine::open(&path, BufferPoolConfig::default()).unwrap();
    let tree = BPlusTree::new(7, Arc::clone(engine.buffer_pool()), cmp.clone(), None, None).unwrap();
    for k in 0..100 {
        assert_eq!(
            tree.get_value(&key_of(&cmp, k)).unwrap(),
            Some(RowId::new(2, k as u32))
        );
    }
}
