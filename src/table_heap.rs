//! A table heap: a doubly-linked list of slotted pages holding
//! serialized rows.

use std::collections::BTreeMap;
use std::sync::{Arc, Mutex};

use crate::buffer_pool::BufferPoolManager;
use crate::errors::DbResult;
use crate::record::{Row, SchemaRef};
use crate::table_page::SIZE_TUPLE_SLOT;
use crate::{PageId, RowId, INVALID_PAGE_ID, PAGE_SIZE};

pub struct TableHeap {
    bpm: Arc<BufferPoolManager>,
    schema: SchemaRef,
    first_page_id: PageId,
    /// Free bytes per page, kept warm so inserts rarely walk the chain.
    page_free_space: Mutex<BTreeMap<PageId, u32>>,
}

impl TableHeap {
    /// Creates an empty heap with one page.
    pub fn create(bpm: Arc<BufferPoolManager>, schema: SchemaRef) -> DbResult<Self> {
        let (first_page_id, free) = {
            let guard = bpm.new_page()?;
            let mut page = guard.write();
            page.table_init(guard.page_id(), INVALID_PAGE_ID);
            (guard.page_id(), page.table_free_space_remaining())
        };
        let mut page_free_space = BTreeMap::new();
        page_free_space.insert(first_page_id, free);
        Ok(Self {
            bpm,
            schema,
            first_page_id,
            page_free_space: Mutex::new(page_free_space),
        })
    }

    /// Opens an existing heap, rebuilding the free-space map from the
    /// page chain.
    pub fn open(
        bpm: Arc<BufferPoolManager>,
        schema: SchemaRef,
        first_page_id: PageId,
    ) -> DbResult<Self> {
        let mut page_free_space = BTreeMap::new();
        let mut page_id = first_page_id;
        while page_id != INVALID_PAGE_ID {
            let guard = bpm.fetch_page(page_id)?;
            let page = guard.read();
            page_free_space.insert(page_id, page.table_free_space_remaining());
            page_id = page.table_next_page_id();
        }
        Ok(Self {
            bpm,
            schema,
            first_page_id,
            page_free_space: Mutex::new(page_free_space),
        })
    }

    pub fn first_page_id(&self) -> PageId {
        self.first_page_id
    }

    pub fn schema(&self) -> &SchemaRef {
        &self.schema
    }

    /// Inserts a serialized row into the first page with room, growing
    /// the chain at the tail when none has any. Returns `false` when the
    /// row cannot fit on any page, and stores the assigned rid in `row`.
    pub fn insert_tuple(&self, row: &mut Row) -> DbResult<bool> {
        let row_size = row.serialized_size(&self.schema);
        if row_size as usize >= PAGE_SIZE {
            crate::granite_debug_log!("[TableHeap::insert_tuple] tuple too large: {row_size}");
            return Ok(false);
        }
        let mut data = vec![0u8; row_size as usize];
        row.serialize_to(&mut data, &self.schema);

        let mut free_space = self.page_free_space.lock().unwrap();
        let target = free_space
            .iter()
            .find(|(_, &free)| free >= row_size + SIZE_TUPLE_SLOT)
            .map(|(&page_id, _)| page_id);

        let (page_id, slot, remaining) = match target {
            Some(page_id) => {
                let guard = self.bpm.fetch_page(page_id)?;
                let mut page = guard.write();
                let slot = page
                    .table_insert_tuple(&data)
                    .expect("free-space map out of sync with page");
                (page_id, slot, page.table_free_space_remaining())
            }
            None => {
                // Link a fresh page behind the current tail.
                let tail_id = *free_space
                    .keys()
                    .next_back()
                    .expect("heap always has at least one page");
                let guard = self.bpm.new_page()?;
                let new_page_id = guard.page_id();
                let mut page = guard.write();
                page.table_init(new_page_id, tail_id);
                let slot = page
                    .table_insert_tuple(&data)
                    .expect("fresh page rejected a row that fits in a page");
                let remaining = page.table_free_space_remaining();
                drop(page);

                let tail_guard = self.bpm.fetch_page(tail_id)?;
                tail_guard.write().table_set_next_page_id(new_page_id);
                crate::granite_debug_log!(
                    "[TableHeap::insert_tuple] new page {new_page_id} after {tail_id}"
                );
                (new_page_id, slot, remaining)
            }
        };
        free_space.insert(page_id, remaining);
        row.set_rid(RowId::new(page_id, slot));
        Ok(true)
    }

    /// Updates in place when the page can absorb the new image, falling
    /// back to delete-then-insert (with rollback when the insert fails).
    pub fn update_tuple(&self, row: &mut Row, rid: RowId) -> DbResult<bool> {
        let row_size = row.serialized_size(&self.schema);
        if row_size as usize >= PAGE_SIZE {
            return Ok(false);
        }
        let mut data = vec![0u8; row_size as usize];
        row.serialize_to(&mut data, &self.schema);

        let (updated, remaining) = {
            let guard = self.bpm.fetch_page(rid.page_id())?;
            let mut page = guard.write();
            let updated = page.table_update_tuple(rid.slot(), &data);
            (updated, page.table_free_space_remaining())
        };
        if updated {
            self.page_free_space
                .lock()
                .unwrap()
                .insert(rid.page_id(), remaining);
            row.set_rid(rid);
            return Ok(true);
        }

        // The page refused in-place growth; move the row.
        if !self.mark_delete(rid)? {
            return Ok(false);
        }
        if !self.insert_tuple(row)? {
            self.rollback_delete(rid)?;
            return Ok(false);
        }
        self.apply_delete(rid)?;
        Ok(true)
    }

    pub fn mark_delete(&self, rid: RowId) -> DbResult<bool> {
        let guard = self.bpm.fetch_page(rid.page_id())?;
        let mut page = guard.write();
        Ok(page.table_mark_delete(rid.slot()))
    }

    pub fn rollback_delete(&self, rid: RowId) -> DbResult<()> {
        let guard = self.bpm.fetch_page(rid.page_id())?;
        let mut page = guard.write();
        page.table_rollback_delete(rid.slot());
        Ok(())
    }

    /// Completes a delete. A page left empty is unlinked from the chain
    /// and freed, unless it is the head page.
    pub fn apply_delete(&self, rid: RowId) -> DbResult<()> {
        let (live, prev_id, next_id, remaining) = {
            let guard = self.bpm.fetch_page(rid.page_id())?;
            let mut page = guard.write();
            page.table_apply_delete(rid.slot());
            (
                page.table_live_tuple_count(),
                page.table_prev_page_id(),
                page.table_next_page_id(),
                page.table_free_space_remaining(),
            )
        };
        self.page_free_space
            .lock()
            .unwrap()
            .insert(rid.page_id(), remaining);
        if live > 0 || rid.page_id() == self.first_page_id {
            return Ok(());
        }

        if next_id != INVALID_PAGE_ID {
            let guard = self.bpm.fetch_page(next_id)?;
            guard.write().table_set_prev_page_id(prev_id);
        }
        if prev_id != INVALID_PAGE_ID {
            let guard = self.bpm.fetch_page(prev_id)?;
            guard.write().table_set_next_page_id(next_id);
        }
        self.bpm.delete_page(rid.page_id())?;
        self.page_free_space.lock().unwrap().remove(&rid.page_id());
        crate::granite_debug_log!("[TableHeap::apply_delete] freed empty page {}", rid.page_id());
        Ok(())
    }

    /// Reads the tuple at `row.rid()` into `row`'s fields.
    pub fn get_tuple(&self, row: &mut Row) -> DbResult<bool> {
        let rid = row.rid();
        if rid.page_id() < 0 {
            return Ok(false);
        }
        let guard = self.bpm.fetch_page(rid.page_id())?;
        let page = guard.read();
        match page.table_get_tuple(rid.slot()) {
            Some(data) => {
                row.deserialize_from(data, &self.schema);
                Ok(true)
            }
            None => Ok(false),
        }
    }

    /// Iterates every live row in chain order.
    pub fn iter(&self) -> DbResult<TableIterator<'_>> {
        let mut page_id = self.first_page_id;
        let mut rid = RowId::INVALID;
        while page_id != INVALID_PAGE_ID {
            let guard = self.bpm.fetch_page(page_id)?;
            let page = guard.read();
            if let Some(first) = page.table_first_tuple_rid() {
                rid = first;
                break;
            }
            page_id = page.table_next_page_id();
        }
        Ok(TableIterator { heap: self, rid })
    }

    /// Frees every page of the heap.
    pub fn destroy(&self) -> DbResult<()> {
        let mut page_id = self.first_page_id;
        while page_id != INVALID_PAGE_ID {
            let next = {
                let guard = self.bpm.fetch_page(page_id)?;
                let page = guard.read();
                page.table_next_page_id()
            };
            self.bpm.delete_page(page_id)?;
            page_id = next;
        }
        self.page_free_space.lock().unwrap().clear();
        Ok(())
    }

    fn advance(&self, rid: RowId) -> DbResult<RowId> {
        let mut page_id = rid.page_id();
        {
            let guard = self.bpm.fetch_page(page_id)?;
            let page = guard.read();
            if let Some(next) = page.table_next_tuple_rid(rid) {
                return Ok(next);
            }
            page_id = page.table_next_page_id();
        }
        while page_id != INVALID_PAGE_ID {
            let guard = self.bpm.fetch_page(page_id)?;
            let page = guard.read();
            if let Some(first) = page.table_first_tuple_rid() {
                return Ok(first);
            }
            page_id = page.table_next_page_id();
        }
        Ok(RowId::INVALID)
    }
}

/// Walks live tuples in page-chain order, following `next_page_id` at
/// page boundaries. Exhausted iterators hold the invalid rid.
pub struct TableIterator<'a> {
    heap: &'a TableHeap,
    rid: RowId,
}

impl TableIterator<'_> {
    pub fn rid(&self) -> RowId {
        self.rid
    }
}

impl Iterator for TableIterator<'_> {
    type Item = Row;

    fn next(&mut self) -> Option<Row> {
        if self.rid.page_id() == INVALID_PAGE_ID {
            return None;
        }
        let mut row = Row::with_rid(self.rid);
        if !self.heap.get_tuple(&mut row).ok()? {
            self.rid = RowId::INVALID;
            return None;
        }
        self.rid = self.heap.advance(self.rid).ok()?;
        Some(row)
    }
}
