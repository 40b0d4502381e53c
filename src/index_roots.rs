//! The index-roots directory: logical page 1 maps every index id to the
//! page id of its B+tree root.
//!
//! Layout: `count:u32 | (index_id:u32, root_page_id:i32) * count`.

use crate::{Page, PageId, PAGE_SIZE};

const OFFSET_COUNT: usize = 0;
const ENTRIES_START: usize = 4;
const ENTRY_SIZE: usize = 8;

/// Entries that fit on the page.
pub const MAX_INDEX_ROOTS: usize = (PAGE_SIZE - ENTRIES_START) / ENTRY_SIZE;

impl Page {
    fn roots_count(&self) -> usize {
        self.read_u32(OFFSET_COUNT) as usize
    }

    fn roots_entry(&self, i: usize) -> (u32, PageId) {
        let at = ENTRIES_START + i * ENTRY_SIZE;
        (self.read_u32(at), self.read_i32(at + 4))
    }

    fn roots_set_entry(&mut self, i: usize, index_id: u32, root_page_id: PageId) {
        let at = ENTRIES_START + i * ENTRY_SIZE;
        self.write_u32(at, index_id);
        self.write_i32(at + 4, root_page_id);
    }

    fn roots_find(&self, index_id: u32) -> Option<usize> {
        (0..self.roots_count()).find(|&i| self.roots_entry(i).0 == index_id)
    }

    pub fn roots_get(&self, index_id: u32) -> Option<PageId> {
        self.roots_find(index_id).map(|i| self.roots_entry(i).1)
    }

    /// Registers a new index. Fails when the id is taken or the page is
    /// full.
    pub fn roots_insert(&mut self, index_id: u32, root_page_id: PageId) -> bool {
        if self.roots_find(index_id).is_some() {
            return false;
        }
        let count = self.roots_count();
        if count >= MAX_INDEX_ROOTS {
            return false;
        }
        self.roots_set_entry(count, index_id, root_page_id);
        self.write_u32(OFFSET_COUNT, (count + 1) as u32);
        true
    }

    pub fn roots_update(&mut self, index_id: u32, root_page_id: PageId) -> bool {
        match self.roots_find(index_id) {
            Some(i) => {
                self.roots_set_entry(i, index_id, root_page_id);
                true
            }
            None => false,
        }
    }

    pub fn roots_delete(&mut self, index_id: u32) -> bool {
        let Some(i) = self.roots_find(index_id) else {
            return false;
        };
        let count = self.roots_count();
        for j in i..count - 1 {
            let (id, root) = self.roots_entry(j + 1);
            self.roots_set_entry(j, id, root);
        }
        self.write_u32(OFFSET_COUNT, (count - 1) as u32);
        true
    }
}
