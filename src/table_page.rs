//! Slotted-page layout for heap tuples.
//!
//! Header: `page_id:i32 | lsn:u32 | prev_page_id:i32 | next_page_id:i32 |
//! free_space_pointer:u32 | tuple_count:u32`, followed by an array of
//! `(offset:u32, size:u32)` slots growing down the page while tuple bytes
//! grow up from the end. Deleted tuples keep their slot with the high bit
//! of `size` set until the delete is applied.

use crate::{Page, PageId, RowId, INVALID_PAGE_ID, PAGE_SIZE};

const OFFSET_PAGE_ID: usize = 0;
const OFFSET_LSN: usize = 4;
const OFFSET_PREV_PAGE_ID: usize = 8;
const OFFSET_NEXT_PAGE_ID: usize = 12;
const OFFSET_FREE_SPACE_POINTER: usize = 16;
const OFFSET_TUPLE_COUNT: usize = 20;
const HEADER_SIZE: usize = 24;

/// Bytes of slot-array overhead per tuple.
pub const SIZE_TUPLE_SLOT: u32 = 8;

const DELETE_MASK: u32 = 1 << 31;

fn is_deleted(raw_size: u32) -> bool {
    raw_size & DELETE_MASK != 0
}

fn unmasked(raw_size: u32) -> u32 {
    raw_size & !DELETE_MASK
}

impl Page {
    pub fn table_init(&mut self, page_id: PageId, prev_page_id: PageId) {
        self.write_i32(OFFSET_PAGE_ID, page_id);
        self.write_u32(OFFSET_LSN, 0);
        self.write_i32(OFFSET_PREV_PAGE_ID, prev_page_id);
        self.write_i32(OFFSET_NEXT_PAGE_ID, INVALID_PAGE_ID);
        self.write_u32(OFFSET_FREE_SPACE_POINTER, PAGE_SIZE as u32);
        self.write_u32(OFFSET_TUPLE_COUNT, 0);
    }

    pub fn table_page_id(&self) -> PageId {
        self.read_i32(OFFSET_PAGE_ID)
    }

    pub fn table_prev_page_id(&self) -> PageId {
        self.read_i32(OFFSET_PREV_PAGE_ID)
    }

    pub fn table_set_prev_page_id(&mut self, page_id: PageId) {
        self.write_i32(OFFSET_PREV_PAGE_ID, page_id);
    }

    pub fn table_next_page_id(&self) -> PageId {
        self.read_i32(OFFSET_NEXT_PAGE_ID)
    }

    pub fn table_set_next_page_id(&mut self, page_id: PageId) {
        self.write_i32(OFFSET_NEXT_PAGE_ID, page_id);
    }

    fn free_space_pointer(&self) -> u32 {
        self.read_u32(OFFSET_FREE_SPACE_POINTER)
    }

    fn set_free_space_pointer(&mut self, fsp: u32) {
        self.write_u32(OFFSET_FREE_SPACE_POINTER, fsp);
    }

    pub fn table_tuple_count(&self) -> u32 {
        self.read_u32(OFFSET_TUPLE_COUNT)
    }

    fn set_tuple_count(&mut self, count: u32) {
        self.write_u32(OFFSET_TUPLE_COUNT, count);
    }

    fn slot_offset(&self, slot: u32) -> u32 {
        self.read_u32(HEADER_SIZE + slot as usize * 8)
    }

    fn slot_size(&self, slot: u32) -> u32 {
        self.read_u32(HEADER_SIZE + slot as usize * 8 + 4)
    }

    fn set_slot(&mut self, slot: u32, offset: u32, size: u32) {
        self.write_u32(HEADER_SIZE + slot as usize * 8, offset);
        self.write_u32(HEADER_SIZE + slot as usize * 8 + 4, size);
    }

    pub fn table_free_space_remaining(&self) -> u32 {
        self.free_space_pointer() - (HEADER_SIZE as u32 + self.table_tuple_count() * SIZE_TUPLE_SLOT)
    }

    /// Tuples that are neither vacated nor mark-deleted.
    pub fn table_live_tuple_count(&self) -> u32 {
        (0..self.table_tuple_count())
            .filter(|&i| {
                let raw = self.slot_size(i);
                raw != 0 && !is_deleted(raw)
            })
            .count() as u32
    }

    /// Copies `data` onto the page, reusing a vacated slot when one
    /// exists. Returns the slot number, or `None` when the page is full.
    pub fn table_insert_tuple(&mut self, data: &[u8]) -> Option<u32> {
        let size = data.len() as u32;
        let count = self.table_tuple_count();
        let slot = (0..count)
            .find(|&i| self.slot_size(i) == 0)
            .unwrap_or(count);
        let needed = if slot == count {
            size + SIZE_TUPLE_SLOT
        } else {
            size
        };
        if self.table_free_space_remaining() < needed {
            return None;
        }
        let fsp = self.free_space_pointer() - size;
        self.set_free_space_pointer(fsp);
        self.write_bytes(fsp as usize, data);
        self.set_slot(slot, fsp, size);
        if slot == count {
            self.set_tuple_count(count + 1);
        }
        Some(slot)
    }

    pub fn table_get_tuple(&self, slot: u32) -> Option<&[u8]> {
        if slot >= self.table_tuple_count() {
            return None;
        }
        let raw = self.slot_size(slot);
        if raw == 0 || is_deleted(raw) {
            return None;
        }
        Some(self.read_bytes(self.slot_offset(slot) as usize, raw as usize))
    }

    /// First phase of a delete: flags the slot so the tuple disappears
    /// from reads but can still be rolled back.
    pub fn table_mark_delete(&mut self, slot: u32) -> bool {
        if slot >= self.table_tuple_count() {
            return false;
        }
        let raw = self.slot_size(slot);
        if raw == 0 || is_deleted(raw) {
            return false;
        }
        let offset = self.slot_offset(slot);
        self.set_slot(slot, offset, raw | DELETE_MASK);
        true
    }

    pub fn table_rollback_delete(&mut self, slot: u32) -> bool {
        if slot >= self.table_tuple_count() {
            return false;
        }
        let raw = self.slot_size(slot);
        if raw == 0 {
            return false;
        }
        let offset = self.slot_offset(slot);
        self.set_slot(slot, offset, unmasked(raw));
        true
    }

    /// Second phase: reclaims the tuple bytes and vacates the slot.
    pub fn table_apply_delete(&mut self, slot: u32) {
        assert!(slot < self.table_tuple_count(), "slot out of range");
        let raw = self.slot_size(slot);
        assert!(raw != 0, "applying delete to a vacated slot");
        let size = unmasked(raw);
        let offset = self.slot_offset(slot);
        let fsp = self.free_space_pointer();

        self.data
            .copy_within(fsp as usize..offset as usize, (fsp + size) as usize);
        self.set_free_space_pointer(fsp + size);
        self.set_slot(slot, 0, 0);
        for i in 0..self.table_tuple_count() {
            let other_raw = self.slot_size(i);
            if other_raw != 0 && self.slot_offset(i) < offset {
                let moved = self.slot_offset(i) + size;
                self.set_slot(i, moved, other_raw);
            }
        }
    }

    /// In-place update; refuses when the page cannot absorb the growth
    /// or the tuple is (mark-)deleted.
    pub fn table_update_tuple(&mut self, slot: u32, new_data: &[u8]) -> bool {
        if slot >= self.table_tuple_count() {
            return false;
        }
        let raw = self.slot_size(slot);
        if raw == 0 || is_deleted(raw) {
            return false;
        }
        let old_size = raw;
        let new_size = new_data.len() as u32;
        if self.table_free_space_remaining() + old_size < new_size {
            return false;
        }
        let offset = self.slot_offset(slot);
        let fsp = self.free_space_pointer();
        let new_fsp = (fsp as i64 + old_size as i64 - new_size as i64) as u32;

        self.data
            .copy_within(fsp as usize..offset as usize, new_fsp as usize);
        self.set_free_space_pointer(new_fsp);
        let new_offset = (offset as i64 + old_size as i64 - new_size as i64) as u32;
        self.write_bytes(new_offset as usize, new_data);
        self.set_slot(slot, new_offset, new_size);
        for i in 0..self.table_tuple_count() {
            let other_raw = self.slot_size(i);
            if i != slot && other_raw != 0 && self.slot_offset(i) < offset {
                let moved = (self.slot_offset(i) as i64 + old_size as i64 - new_size as i64) as u32;
                self.set_slot(i, moved, other_raw);
            }
        }
        true
    }

    pub fn table_first_tuple_rid(&self) -> Option<RowId> {
        self.table_next_live_slot(0)
            .map(|slot| RowId::new(self.table_page_id(), slot))
    }

    pub fn table_next_tuple_rid(&self, current: RowId) -> Option<RowId> {
        self.table_next_live_slot(current.slot() + 1)
            .map(|slot| RowId::new(self.table_page_id(), slot))
    }

    fn table_next_live_slot(&self, from: u32) -> Option<u32> {
        (from..self.table_tuple_count()).find(|&i| {
            let raw = self.slot_size(i);
            raw != 0 && !is_deleted(raw)
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn heap_page() -> Page {
        let mut page = Page::new(2);
        page.table_init(2, INVALID_PAGE_ID);
        page
    }

    #[test]
    fn insert_and_read_back() {
        let mut page = heap_page();
        let a = page.table_insert_tuple(b"first").unwrap();
        let b = page.table_insert_tuple(b"second").unwrap();
        assert_eq!(a, 0);
        assert_eq!(b, 1);
        assert_eq!(page.table_get_tuple(a).unwrap(), b"first");
        assert_eq!(page.table_get_tuple(b).unwrap(), b"second");
        assert_eq!(page.table_tuple_count(), 2);
    }

    #[test]
    fn two_phase_delete() {
        let mut page = heap_page();
        let slot = page.table_insert_tuple(b"doomed").unwrap();
        let free_before = page.table_free_space_remaining();

        assert!(page.table_mark_delete(slot));
        assert!(page.table_get_tuple(slot).is_none());
        assert!(!page.table_mark_delete(slot));

        assert!(page.table_rollback_delete(slot));
        assert_eq!(page.table_get_tuple(slot).unwrap(), b"doomed");

        page.table_mark_delete(slot);
        page.table_apply_delete(slot);
        assert!(page.table_get_tuple(slot).is_none());
        assert_eq!(page.table_live_tuple_count(), 0);
        assert_eq!(
            page.table_free_space_remaining(),
            free_before + b"doomed".len() as u32
        );
    }

    #[test]
    fn apply_delete_compacts_and_vacated_slot_is_reused() {
        let mut page = heap_page();
        let a = page.table_insert_tuple(b"aaaa").unwrap();
        let b = page.table_insert_tuple(b"bbbb").unwrap();
        let c = page.table_insert_tuple(b"cccc").unwrap();

        page.table_mark_delete(b);
        page.table_apply_delete(b);
        assert_eq!(page.table_get_tuple(a).unwrap(), b"aaaa");
        assert_eq!(page.table_get_tuple(c).unwrap(), b"cccc");

        let reused = page.table_insert_tuple(b"dddd").unwrap();
        assert_eq!(reused, b);
        assert_eq!(page.table_get_tuple(reused).unwrap(), b"dddd");
        assert_eq!(page.table_tuple_count(), 3);
    }

    #[test]
    fn update_shrinks_and_grows() {
        let mut page = heap_page();
        let a = page.table_insert_tuple(b"0123456789").unwrap();
        let b = page.table_insert_tuple(b"tail").unwrap();

        assert!(page.table_update_tuple(a, b"short"));
        assert_eq!(page.table_get_tuple(a).unwrap(), b"short");
        assert_eq!(page.table_get_tuple(b).unwrap(), b"tail");

        assert!(page.table_update_tuple(a, b"a-much-longer-payload"));
        assert_eq!(page.table_get_tuple(a).unwrap(), b"a-much-longer-payload");
        assert_eq!(page.table_get_tuple(b).unwrap(), b"tail");
    }

    #[test]
    fn update_refuses_overgrowth() {
        let mut page = heap_page();
        let slot = page.table_insert_tuple(b"x").unwrap();
        let huge = vec![0u8; PAGE_SIZE];
        assert!(!page.table_update_tuple(slot, &huge));
        assert_eq!(page.table_get_tuple(slot).unwrap(), b"x");
    }

    #[test]
    fn iteration_skips_dead_tuples() {
        let mut page = heap_page();
        for payload in [b"r0", b"r1", b"r2", b"r3"] {
            page.table_insert_tuple(payload).unwrap();
        }
        page.table_mark_delete(1);
        page.table_mark_delete(3);
        page.table_apply_delete(3);

        let first = page.table_first_tuple_rid().unwrap();
        assert_eq!(first.slot(), 0);
        let second = page.table_next_tuple_rid(first).unwrap();
        assert_eq!(second.slot(), 2);
        assert!(page.table_next_tuple_rid(second).is_none());
    }

    #[test]
    fn insert_fails_when_full() {
        let mut page = heap_page();
        let big = vec![7u8; (PAGE_SIZE - HEADER_SIZE) / 2];
        assert!(page.table_insert_tuple(&big).is_some());
        assert!(page.table_insert_tuple(&big).is_none());
    }
}
