use std::sync::Arc;

use granite::btree::{BPlusTree, KeyComparator};
use granite::buffer_pool::BufferPoolConfig;
use granite::engine::StorageEngine;
use granite::record::{Column, Field, Row, Schema, SchemaRef, TypeId};
use granite::table_heap::TableHeap;
use granite::txn::IsolationLevel;
use tempfile::tempdir;

fn account_schema() -> SchemaRef {
    Arc::new(Schema::new(vec![
        Column::new("id", TypeId::Int, 0, false, true),
        Column::with_length("name", 64, 1, true, false),
        Column::new("account", TypeId::Float, 2, true, false),
    ]))
}

fn account_row(id: i32, name: &str, account: f32) -> Row {
    Row::new(vec![
        Field::Int(id),
        Field::Char(name.to_string()),
        Field::Float(account),
    ])
}

#[test]
fn heap_contents_survive_reopen() {
    let dir = tempdir().unwrap();
    let path = dir.path().join("test.db");
    let schema = account_schema();
    let first_page_id;
    {
        let engine = StorageEngine::open(&path, BufferPoolConfig::default()).unwrap();
        let heap = TableHeap::create(Arc::clone(engine.buffer_pool()), schema.clone()).unwrap();
        first_page_id = heap.first_page_id();
        for i in 0..500 {
            let mut row = account_row(i, &format!("user-{i}"), i as f32);
            assert!(heap.insert_tuple(&mut row).unwrap());
        }
        engine.close().unwrap();
    }

    let engine = StorageEngine::open(&path, BufferPoolConfig::default()).unwrap();
    let heap = TableHeap::open(Arc::clone(engine.buffer_pool()), schema, first_page_id).unwrap();
    let mut ids: Vec<i32> = heap
        .iter()
        .unwrap()
        .map(|row| match row.field(0) {
            Field::Int(v) => *v,
            _ => unreachable!(),
        })
        .collect();
    ids.sort_unstable();
    assert_eq!(ids, (0..500).collect::<Vec<_>>());

    // The reopened heap keeps inserting where it left off.
    let mut row = account_row(500, "late", 1.0);
    assert!(heap.insert_tuple(&mut row).unwrap());
}

/// Rows flow into the heap under exclusive row locks, and the index
/// maps each key back to the heap rid.
#[test]
fn indexed_inserts_under_locks() {
    let dir = tempdir().unwrap();
    let engine =
        StorageEngine::open(dir.path().join("test.db"), BufferPoolConfig::default()).unwrap();
    let schema = account_schema();
    let heap = TableHeap::create(Arc::clone(engine.buffer_pool()), schema.clone()).unwrap();

    let key_schema = Arc::new(Schema::new(vec![Column::new(
        "id",
        TypeId::Int,
        0,
        false,
        true,
    )]));
    let comparator = KeyComparator::new(key_schema.clone());
    let index = BPlusTree::new(
        0,
        Arc::clone(engine.buffer_pool()),
        comparator.clone(),
        None,
        None,
    )
    .unwrap();

    let txn_manager = engine.txn_manager();
    let lock_manager = engine.lock_manager();
    let txn = txn_manager.begin(IsolationLevel::RepeatableRead);
    for i in 0..100 {
        let mut row = account_row(i, &format!("user-{i}"), 0.5 * i as f32);
        assert!(heap.insert_tuple(&mut row).unwrap());
        assert!(lock_manager.lock_exclusive(&txn, row.rid()).unwrap());
        let key_row = row.key_from_row(&schema, &key_schema).unwrap();
        assert!(index.insert(&comparator.serialize_key(&key_row), row.rid()).unwrap());
    }
    txn_manager.commit(&txn);

    // Probe through the index and read back from the heap.
    let probe_key = comparator.serialize_key(&Row::new(vec![Field::Int(37)]));
    let rid = index.get_value(&probe_key).unwrap().expect("indexed key");
    let mut row = Row::with_rid(rid);
    assert!(heap.get_tuple(&mut row).unwrap());
    assert_eq!(row.field(0), &Field::Int(37));
    assert_eq!(row.field(1), &Field::Char("user-37".to_string()));
}

#[test]
fn deleted_rows_disappear_from_scans() {
    let dir = tempdir().unwrap();
    let engine =
        StorageEngine::open(dir.path().join("test.db"), BufferPoolConfig::default()).unwrap();
    let heap = TableHeap::create(Arc::clone(engine.buffer_pool()), account_schema()).unwrap();

    let mut rids = Vec::new();
    for i in 0..50 {
        let mut row = account_row(i, "victim", 0.0);
        heap.insert_tuple(&mut row).unwrap();
        rids.push(row.rid());
    }
    for rid in rids.iter().step_by(2) {
        assert!(heap.mark_delete(*rid).unwrap());
        heap.apply_delete(*rid).unwrap();
    }
    assert_eq!(heap.iter().unwrap().count(), 25);
}

#[test]
fn destroy_frees_every_page() {
    let dir = tempdir().unwrap();
    let engine =
        StorageEngine::open(dir.path().join("test.db"), BufferPoolConfig::default()).unwrap();
    let heap = TableHeap::create(Arc::clone(engine.buffer_pool()), account_schema()).unwrap();
    for i in 0..300 {
        let mut row = account_row(i, "bulk", 0.0);
        heap.insert_tuple(&mut row).unwrap();
    }
    let first = heap.first_page_id();
    heap.destroy().unwrap();
    assert!(engine.buffer_pool().is_page_free(first).unwrap());
}
