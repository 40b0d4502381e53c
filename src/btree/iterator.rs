//! Leaf-chain iterator.

use crate::buffer_pool::{BufferPoolManager, PageGuard};
use crate::{RowId, INVALID_PAGE_ID};

/// Walks leaf entries in key order, keeping exactly one leaf pinned at a
/// time. Reaching the end of a leaf swaps the guard for the next leaf in
/// the chain, which unpins the exhausted one.
pub struct IndexIterator<'a> {
    bpm: &'a BufferPoolManager,
    guard: Option<PageGuard<'a>>,
    slot: usize,
}

impl<'a> IndexIterator<'a> {
    pub(crate) fn new(bpm: &'a BufferPoolManager, guard: Option<PageGuard<'a>>, slot: usize) -> Self {
        Self { bpm, guard, slot }
    }
}

impl Iterator for IndexIterator<'_> {
    type Item = (Vec<u8>, RowId);

    fn next(&mut self) -> Option<(Vec<u8>, RowId)> {
        loop {
            let guard = self.guard.as_ref()?;
            let next_page_id = {
                let page = guard.read();
                if self.slot < page.node_size() {
                    let item = (
                        page.leaf_key_at(self.slot).to_vec(),
                        page.leaf_rid_at(self.slot),
                    );
                    self.slot += 1;
                    return Some(item);
                }
                page.leaf_next_page_id()
            };
            if next_page_id == INVALID_PAGE_ID {
                self.guard = None;
                return None;
            }
            self.guard = Some(self.bpm.fetch_page(next_page_id).ok()?);
            self.slot = 0;
        }
    }
}
