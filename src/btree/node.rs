//! Typed views over B+tree node pages.
//!
//! Node header (shared): `page_type:u32 | size:i32 | max_size:i32 |
//! parent:i32 | page_id:i32 | key_size:u32`; leaves append
//! `next_page_id:i32`. Entries are fixed-width `(key, value)` pairs where
//! a leaf value is a [`RowId`] and an internal value is a child page id.
//! The key at position `i` of an internal node is the minimum key of the
//! subtree under child `i`, so `key[0]` is meaningful.

use std::cmp::Ordering;

use crate::record::{Field, Row, SchemaRef};
use crate::{Page, PageId, RowId};

const OFFSET_PAGE_TYPE: usize = 0;
const OFFSET_SIZE: usize = 4;
const OFFSET_MAX_SIZE: usize = 8;
const OFFSET_PARENT: usize = 12;
const OFFSET_PAGE_ID: usize = 16;
const OFFSET_KEY_SIZE: usize = 20;
const OFFSET_NEXT_PAGE_ID: usize = 24;

pub const INTERNAL_HEADER_SIZE: usize = 24;
pub const LEAF_HEADER_SIZE: usize = 28;

/// Bytes of a leaf value.
pub const LEAF_VALUE_SIZE: usize = 8;
/// Bytes of an internal value (a child page id).
pub const INTERNAL_VALUE_SIZE: usize = 4;

const NODE_TYPE_LEAF: u32 = 1;
const NODE_TYPE_INTERNAL: u32 = 2;

impl Page {
    pub fn init_leaf_node(&mut self, page_id: PageId, parent: PageId, key_size: usize, max_size: usize) {
        self.write_u32(OFFSET_PAGE_TYPE, NODE_TYPE_LEAF);
        self.write_i32(OFFSET_SIZE, 0);
        self.write_i32(OFFSET_MAX_SIZE, max_size as i32);
        self.write_i32(OFFSET_PARENT, parent);
        self.write_i32(OFFSET_PAGE_ID, page_id);
        self.write_u32(OFFSET_KEY_SIZE, key_size as u32);
        self.write_i32(OFFSET_NEXT_PAGE_ID, crate::INVALID_PAGE_ID);
    }

    pub fn init_internal_node(
        &mut self,
        page_id: PageId,
        parent: PageId,
        key_size: usize,
        max_size: usize,
    ) {
        self.write_u32(OFFSET_PAGE_TYPE, NODE_TYPE_INTERNAL);
        self.write_i32(OFFSET_SIZE, 0);
        self.write_i32(OFFSET_MAX_SIZE, max_size as i32);
        self.write_i32(OFFSET_PARENT, parent);
        self.write_i32(OFFSET_PAGE_ID, page_id);
        self.write_u32(OFFSET_KEY_SIZE, key_size as u32);
    }

    pub fn is_leaf_node(&self) -> bool {
        let page_type = self.read_u32(OFFSET_PAGE_TYPE);
        assert!(
            page_type == NODE_TYPE_LEAF || page_type == NODE_TYPE_INTERNAL,
            "page {} is not a b+tree node",
            self.id
        );
        page_type == NODE_TYPE_LEAF
    }

    pub fn node_size(&self) -> usize {
        self.read_i32(OFFSET_SIZE) as usize
    }

    pub fn set_node_size(&mut self, size: usize) {
        self.write_i32(OFFSET_SIZE, size as i32);
    }

    pub fn node_max_size(&self) -> usize {
        self.read_i32(OFFSET_MAX_SIZE) as usize
    }

    pub fn node_min_size(&self) -> usize {
        self.node_max_size() / 2
    }

    pub fn node_key_size(&self) -> usize {
        self.read_u32(OFFSET_KEY_SIZE) as usize
    }

    pub fn node_parent(&self) -> PageId {
        self.read_i32(OFFSET_PARENT)
    }

    pub fn set_node_parent(&mut self, parent: PageId) {
        self.write_i32(OFFSET_PARENT, parent);
    }

    pub fn node_page_id(&self) -> PageId {
        self.read_i32(OFFSET_PAGE_ID)
    }

    // ---- leaf accessors ----

    pub fn leaf_next_page_id(&self) -> PageId {
        self.read_i32(OFFSET_NEXT_PAGE_ID)
    }

    pub fn leaf_set_next_page_id(&mut self, page_id: PageId) {
        self.write_i32(OFFSET_NEXT_PAGE_ID, page_id);
    }

    fn leaf_pair_at(&self, i: usize) -> usize {
        LEAF_HEADER_SIZE + i * (self.node_key_size() + LEAF_VALUE_SIZE)
    }

    pub fn leaf_key_at(&self, i: usize) -> &[u8] {
        debug_assert!(i < self.node_size());
        self.read_bytes(self.leaf_pair_at(i), self.node_key_size())
    }

    pub fn leaf_rid_at(&self, i: usize) -> RowId {
        debug_assert!(i < self.node_size());
        let at = self.leaf_pair_at(i) + self.node_key_size();
        RowId::from_le_bytes(self.read_bytes(at, LEAF_VALUE_SIZE).try_into().unwrap())
    }

    fn leaf_set_pair(&mut self, i: usize, key: &[u8], rid: RowId) {
        debug_assert_eq!(key.len(), self.node_key_size());
        let at = self.leaf_pair_at(i);
        self.write_bytes(at, key);
        let value_at = at + key.len();
        self.write_bytes(value_at, &rid.to_le_bytes());
    }

    /// First index whose key is `>= key`, i.e. the insert position.
    pub fn leaf_key_index(&self, key: &[u8], comparator: &KeyComparator) -> usize {
        let mut low = 0;
        let mut high = self.node_size();
        while low < high {
            let mid = low + (high - low) / 2;
            match comparator.compare(self.leaf_key_at(mid), key) {
                Ordering::Less => low = mid + 1,
                _ => high = mid,
            }
        }
        low
    }

    pub fn leaf_lookup(&self, key: &[u8], comparator: &KeyComparator) -> Option<RowId> {
        let idx = self.leaf_key_index(key, comparator);
        if idx < self.node_size() && comparator.compare(self.leaf_key_at(idx), key) == Ordering::Equal
        {
            Some(self.leaf_rid_at(idx))
        } else {
            None
        }
    }

    pub fn leaf_insert_at(&mut self, i: usize, key: &[u8], rid: RowId) {
        let size = self.node_size();
        debug_assert!(i <= size);
        let pair = self.node_key_size() + LEAF_VALUE_SIZE;
        let start = self.leaf_pair_at(i);
        let end = self.leaf_pair_at(size);
        self.data.copy_within(start..end, start + pair);
        self.leaf_set_pair(i, key, rid);
        self.set_node_size(size + 1);
    }

    pub fn leaf_remove_at(&mut self, i: usize) {
        let size = self.node_size();
        debug_assert!(i < size);
        let pair = self.node_key_size() + LEAF_VALUE_SIZE;
        let start = self.leaf_pair_at(i + 1);
        let end = self.leaf_pair_at(size);
        self.data.copy_within(start..end, start - pair);
        self.set_node_size(size - 1);
    }

    /// Moves the upper half of this leaf into an empty `recipient` and
    /// splices it into the sibling chain.
    pub fn leaf_move_half_to(&mut self, recipient: &mut Page) {
        let size = self.node_size();
        let split = size / 2;
        let pair = self.node_key_size() + LEAF_VALUE_SIZE;
        let start = self.leaf_pair_at(split);
        let moved = (size - split) * pair;
        recipient.data[LEAF_HEADER_SIZE..LEAF_HEADER_SIZE + moved]
            .copy_from_slice(&self.data[start..start + moved]);
        recipient.set_node_size(size - split);
        self.set_node_size(split);
        recipient.leaf_set_next_page_id(self.leaf_next_page_id());
        self.leaf_set_next_page_id(recipient.node_page_id());
    }

    /// Appends every entry of this leaf to its left sibling and takes
    /// over the chain pointer.
    pub fn leaf_move_all_to(&mut self, recipient: &mut Page) {
        let size = self.node_size();
        let recipient_size = recipient.node_size();
        let pair = self.node_key_size() + LEAF_VALUE_SIZE;
        let start = self.leaf_pair_at(0);
        let dst = recipient.leaf_pair_at(recipient_size);
        recipient.data[dst..dst + size * pair].copy_from_slice(&self.data[start..start + size * pair]);
        recipient.set_node_size(recipient_size + size);
        recipient.leaf_set_next_page_id(self.leaf_next_page_id());
        self.set_node_size(0);
    }

    pub fn leaf_move_first_to_end_of(&mut self, recipient: &mut Page) {
        let key = self.leaf_key_at(0).to_vec();
        let rid = self.leaf_rid_at(0);
        self.leaf_remove_at(0);
        let at = recipient.node_size();
        recipient.leaf_insert_at(at, &key, rid);
    }

    pub fn leaf_move_last_to_front_of(&mut self, recipient: &mut Page) {
        let last = self.node_size() - 1;
        let key = self.leaf_key_at(last).to_vec();
        let rid = self.leaf_rid_at(last);
        self.leaf_remove_at(last);
        recipient.leaf_insert_at(0, &key, rid);
    }

    // ---- internal accessors ----

    fn internal_pair_at(&self, i: usize) -> usize {
        INTERNAL_HEADER_SIZE + i * (self.node_key_size() + INTERNAL_VALUE_SIZE)
    }

    pub fn internal_key_at(&self, i: usize) -> &[u8] {
        debug_assert!(i < self.node_size());
        self.read_bytes(self.internal_pair_at(i), self.node_key_size())
    }

    pub fn internal_set_key_at(&mut self, i: usize, key: &[u8]) {
        debug_assert!(i < self.node_size());
        debug_assert_eq!(key.len(), self.node_key_size());
        let at = self.internal_pair_at(i);
        self.write_bytes(at, key);
    }

    pub fn internal_child_at(&self, i: usize) -> PageId {
        debug_assert!(i < self.node_size());
        let at = self.internal_pair_at(i) + self.node_key_size();
        self.read_i32(at)
    }

    fn internal_set_pair(&mut self, i: usize, key: &[u8], child: PageId) {
        debug_assert_eq!(key.len(), self.node_key_size());
        let at = self.internal_pair_at(i);
        self.write_bytes(at, key);
        let child_at = at + key.len();
        self.write_i32(child_at, child);
    }

    /// Position of `child` among this node's children.
    pub fn internal_child_index(&self, child: PageId) -> Option<usize> {
        (0..self.node_size()).find(|&i| self.internal_child_at(i) == child)
    }

    /// Child to descend into: the rightmost child whose separator is
    /// `<= key`, or the leftmost child when `key` sorts below every
    /// separator.
    pub fn internal_lookup(&self, key: &[u8], comparator: &KeyComparator) -> PageId {
        let mut low = 1;
        let mut high = self.node_size();
        while low < high {
            let mid = low + (high - low) / 2;
            match comparator.compare(self.internal_key_at(mid), key) {
                Ordering::Greater => high = mid,
                _ => low = mid + 1,
            }
        }
        self.internal_child_at(low - 1)
    }

    pub fn internal_insert_at(&mut self, i: usize, key: &[u8], child: PageId) {
        let size = self.node_size();
        debug_assert!(i <= size);
        let pair = self.node_key_size() + INTERNAL_VALUE_SIZE;
        let start = self.internal_pair_at(i);
        let end = self.internal_pair_at(size);
        self.data.copy_within(start..end, start + pair);
        self.internal_set_pair(i, key, child);
        self.set_node_size(size + 1);
    }

    pub fn internal_remove_at(&mut self, i: usize) {
        let size = self.node_size();
        debug_assert!(i < size);
        let pair = self.node_key_size() + INTERNAL_VALUE_SIZE;
        let start = self.internal_pair_at(i + 1);
        let end = self.internal_pair_at(size);
        self.data.copy_within(start..end, start - pair);
        self.set_node_size(size - 1);
    }

    /// Roots a new level: two children separated by their subtree
    /// minimums.
    pub fn internal_populate_new_root(
        &mut self,
        left_key: &[u8],
        left: PageId,
        right_key: &[u8],
        right: PageId,
    ) {
        self.set_node_size(2);
        self.internal_set_pair(0, left_key, left);
        self.internal_set_pair(1, right_key, right);
    }

    /// Moves the upper half of this node's entries into an empty
    /// `recipient`. The caller re-parents the moved children.
    pub fn internal_move_half_to(&mut self, recipient: &mut Page) {
        let size = self.node_size();
        let split = size / 2;
        let pair = self.node_key_size() + INTERNAL_VALUE_SIZE;
        let start = self.internal_pair_at(split);
        let moved = (size - split) * pair;
        recipient.data[INTERNAL_HEADER_SIZE..INTERNAL_HEADER_SIZE + moved]
            .copy_from_slice(&self.data[start..start + moved]);
        recipient.set_node_size(size - split);
        self.set_node_size(split);
    }

    /// Appends every entry to the left sibling. Entries carry their own
    /// subtree-minimum keys, so no separator has to be pulled from the
    /// parent. The caller re-parents the moved children.
    pub fn internal_move_all_to(&mut self, recipient: &mut Page) {
        let size = self.node_size();
        let recipient_size = recipient.node_size();
        let pair = self.node_key_size() + INTERNAL_VALUE_SIZE;
        let start = self.internal_pair_at(0);
        let dst = recipient.internal_pair_at(recipient_size);
        recipient.data[dst..dst + size * pair].copy_from_slice(&self.data[start..start + size * pair]);
        recipient.set_node_size(recipient_size + size);
        self.set_node_size(0);
    }

    pub fn internal_move_first_to_end_of(&mut self, recipient: &mut Page) -> PageId {
        let key = self.internal_key_at(0).to_vec();
        let child = self.internal_child_at(0);
        self.internal_remove_at(0);
        let at = recipient.node_size();
        recipient.internal_insert_at(at, &key, child);
        child
    }

    pub fn internal_move_last_to_front_of(&mut self, recipient: &mut Page) -> PageId {
        let last = self.node_size() - 1;
        let key = self.internal_key_at(last).to_vec();
        let child = self.internal_child_at(last);
        self.internal_remove_at(last);
        recipient.internal_insert_at(0, &key, child);
        child
    }
}

/// Schema-aware ordering over serialized keys.
///
/// Keys are `null-bitmap | fields` images of a key row; comparison
/// deserializes column by column so char padding and float encoding
/// never leak into the order.
#[derive(Clone)]
pub struct KeyComparator {
    key_schema: SchemaRef,
}

impl KeyComparator {
    pub fn new(key_schema: SchemaRef) -> Self {
        Self { key_schema }
    }

    pub fn key_schema(&self) -> &SchemaRef {
        &self.key_schema
    }

    /// Fixed byte width of every key this comparator orders.
    pub fn key_size(&self) -> usize {
        self.key_schema.fixed_row_size()
    }

    pub fn serialize_key(&self, row: &Row) -> Vec<u8> {
        row.serialize_key(&self.key_schema)
    }

    pub fn compare(&self, a: &[u8], b: &[u8]) -> Ordering {
        let null_size = self.key_schema.column_count().div_ceil(8);
        let mut offset = null_size;
        for (i, column) in self.key_schema.columns().iter().enumerate() {
            let a_null = a[i / 8] & (1 << (i % 8)) != 0;
            let b_null = b[i / 8] & (1 << (i % 8)) != 0;
            let len = column.len() as usize;
            let ordering = match (a_null, b_null) {
                (true, true) => Ordering::Equal,
                (true, false) => Ordering::Less,
                (false, true) => Ordering::Greater,
                (false, false) => match column.type_id() {
                    crate::record::TypeId::Int => {
                        let av = i32::from_le_bytes(a[offset..offset + 4].try_into().unwrap());
                        let bv = i32::from_le_bytes(b[offset..offset + 4].try_into().unwrap());
                        av.cmp(&bv)
                    }
                    crate::record::TypeId::Float => {
                        let av = f32::from_le_bytes(a[offset..offset + 4].try_into().unwrap());
                        let bv = f32::from_le_bytes(b[offset..offset + 4].try_into().unwrap());
                        av.partial_cmp(&bv).unwrap_or(Ordering::Equal)
                    }
                    _ => a[offset..offset + len].cmp(&b[offset..offset + len]),
                },
            };
            if ordering != Ordering::Equal {
                return ordering;
            }
            offset += len;
        }
        Ordering::Equal
    }
}

/// Convenience for tests and single-column integer indexes.
pub fn int_key(value: i32) -> Row {
    Row::new(vec![Field::Int(value)])
}
