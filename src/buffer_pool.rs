//! Manages the buffer pool, a fixed array of frames caching disk pages.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use parking_lot::{RwLock, RwLockReadGuard, RwLockWriteGuard};

use crate::disk_manager::DiskManager;
use crate::errors::{DbError, DbResult};
use crate::replacer::{ClockReplacer, LruReplacer, Replacer};
use crate::{FrameId, Page, PageId, INVALID_PAGE_ID};

#[derive(Debug, Clone, Copy)]
pub enum ReplacementPolicy {
    Lru,
    Clock,
}

#[derive(Debug, Clone)]
pub struct BufferPoolConfig {
    pub size: usize,
    pub replacement_policy: ReplacementPolicy,
}

impl Default for BufferPoolConfig {
    fn default() -> Self {
        Self {
            size: 128,
            replacement_policy: ReplacementPolicy::Lru,
        }
    }
}

struct FrameMeta {
    page_id: PageId,
    pin_count: u32,
    is_dirty: bool,
}

struct PoolState {
    page_table: HashMap<PageId, FrameId>,
    free_list: Vec<FrameId>,
    replacer: Box<dyn Replacer>,
    metas: Vec<FrameMeta>,
}

/// The buffer pool manager.
///
/// Bookkeeping (page table, free list, replacer, pin counts) lives under
/// one pool latch; page bytes live in per-frame reader/writer locks that
/// double as the page latch.
pub struct BufferPoolManager {
    disk_manager: Arc<DiskManager>,
    frames: Vec<RwLock<Page>>,
    state: Mutex<PoolState>,
}

/// An RAII guard for a pinned page.
///
/// The pin taken at construction is released exactly once on drop, and
/// `write` marks the frame dirty before handing out the page latch, so a
/// mutated page can never be dropped without a write-back.
pub struct PageGuard<'a> {
    bpm: &'a BufferPoolManager,
    page_id: PageId,
    frame_id: FrameId,
}

impl PageGuard<'_> {
    pub fn page_id(&self) -> PageId {
        self.page_id
    }

    pub fn read(&self) -> RwLockReadGuard<'_, Page> {
        self.bpm.frames[self.frame_id].read()
    }

    pub fn write(&self) -> RwLockWriteGuard<'_, Page> {
        self.bpm.mark_dirty(self.frame_id);
        self.bpm.frames[self.frame_id].write()
    }
}

impl Drop for PageGuard<'_> {
    fn drop(&mut self) {
        self.bpm.unpin_frame(self.frame_id);
    }
}

impl BufferPoolManager {
    pub fn new(disk_manager: Arc<DiskManager>, config: BufferPoolConfig) -> Self {
        let mut frames = Vec::with_capacity(config.size);
        let mut metas = Vec::with_capacity(config.size);
        let mut free_list = Vec::with_capacity(config.size);
        for i in 0..config.size {
            frames.push(RwLock::new(Page::new(INVALID_PAGE_ID)));
            metas.push(FrameMeta {
                page_id: INVALID_PAGE_ID,
                pin_count: 0,
                is_dirty: false,
            });
            free_list.push(config.size - 1 - i);
        }
        let replacer: Box<dyn Replacer> = match config.replacement_policy {
            ReplacementPolicy::Lru => Box::new(LruReplacer::new(config.size)),
            ReplacementPolicy::Clock => Box::new(ClockReplacer::new(config.size)),
        };
        Self {
            disk_manager,
            frames,
            state: Mutex::new(PoolState {
                page_table: HashMap::new(),
                free_list,
                replacer,
                metas,
            }),
        }
    }

    /// Returns a pinned guard for `page_id`, reading it from disk on a
    /// miss.
    pub fn fetch_page(&self, page_id: PageId) -> DbResult<PageGuard<'_>> {
        assert!(page_id >= 0, "invalid page id: {page_id}");
        let mut state = self.state.lock().unwrap();
        if let Some(&frame_id) = state.page_table.get(&page_id) {
            state.metas[frame_id].pin_count += 1;
            state.replacer.pin(frame_id);
            return Ok(PageGuard {
                bpm: self,
                page_id,
                frame_id,
            });
        }

        let frame_id = self.find_free_frame(&mut state)?;
        state.page_table.insert(page_id, frame_id);
        {
            let mut page = self.frames[frame_id].write();
            page.id = page_id;
            self.disk_manager.read_page(page_id, &mut page.data)?;
        }
        let meta = &mut state.metas[frame_id];
        meta.page_id = page_id;
        meta.pin_count = 1;
        meta.is_dirty = false;
        state.replacer.pin(frame_id);
        crate::granite_debug_log!("[BufferPool::fetch_page] page {page_id} -> frame {frame_id}");
        Ok(PageGuard {
            bpm: self,
            page_id,
            frame_id,
        })
    }

    /// Allocates a fresh logical page and returns it pinned and zeroed.
    pub fn new_page(&self) -> DbResult<PageGuard<'_>> {
        let mut state = self.state.lock().unwrap();
        let frame_id = self.find_free_frame(&mut state)?;
        let page_id = match self.disk_manager.allocate_page() {
            Ok(id) => id,
            Err(e) => {
                state.free_list.push(frame_id);
                return Err(e);
            }
        };
        state.page_table.insert(page_id, frame_id);
        {
            let mut page = self.frames[frame_id].write();
            page.reset_memory();
            page.id = page_id;
        }
        let meta = &mut state.metas[frame_id];
        meta.page_id = page_id;
        meta.pin_count = 1;
        // A new page starts dirty so an eviction cannot lose it.
        meta.is_dirty = true;
        state.replacer.pin(frame_id);
        crate::granite_debug_log!("[BufferPool::new_page] page {page_id} -> frame {frame_id}");
        Ok(PageGuard {
            bpm: self,
            page_id,
            frame_id,
        })
    }

    /// Frees a page on disk and releases its frame. Returns `false`
    /// while the page is pinned.
    pub fn delete_page(&self, page_id: PageId) -> DbResult<bool> {
        let mut state = self.state.lock().unwrap();
        if let Some(&frame_id) = state.page_table.get(&page_id) {
            if state.metas[frame_id].pin_count != 0 {
                return Ok(false);
            }
            state.page_table.remove(&page_id);
            state.replacer.pin(frame_id);
            let meta = &mut state.metas[frame_id];
            meta.page_id = INVALID_PAGE_ID;
            meta.is_dirty = false;
            self.frames[frame_id].write().reset_memory();
            state.free_list.push(frame_id);
        }
        self.disk_manager.deallocate_page(page_id)?;
        Ok(true)
    }

    /// Writes the page through to disk if it is dirty. Returns `false`
    /// when the page is not resident.
    pub fn flush_page(&self, page_id: PageId) -> DbResult<bool> {
        let mut state = self.state.lock().unwrap();
        let Some(&frame_id) = state.page_table.get(&page_id) else {
            return Ok(false);
        };
        if state.metas[frame_id].is_dirty {
            let page = self.frames[frame_id].read();
            self.disk_manager.write_page(page_id, &page.data)?;
            state.metas[frame_id].is_dirty = false;
        }
        Ok(true)
    }

    pub fn flush_all_pages(&self) -> DbResult<()> {
        let mut state = self.state.lock().unwrap();
        let resident: Vec<(PageId, FrameId)> =
            state.page_table.iter().map(|(&p, &f)| (p, f)).collect();
        for (page_id, frame_id) in resident {
            if state.metas[frame_id].is_dirty {
                let page = self.frames[frame_id].read();
                self.disk_manager.write_page(page_id, &page.data)?;
                state.metas[frame_id].is_dirty = false;
            }
        }
        Ok(())
    }

    pub fn is_page_free(&self, page_id: PageId) -> DbResult<bool> {
        self.disk_manager.is_page_free(page_id)
    }

    pub fn disk_manager(&self) -> &Arc<DiskManager> {
        &self.disk_manager
    }

    pub fn pool_size(&self) -> usize {
        self.frames.len()
    }

    /// Current pin count of a resident page, for balance checks.
    pub fn pin_count(&self, page_id: PageId) -> Option<u32> {
        let state = self.state.lock().unwrap();
        state
            .page_table
            .get(&page_id)
            .map(|&frame_id| state.metas[frame_id].pin_count)
    }

    /// Debug check that every frame has been unpinned.
    pub fn check_all_unpinned(&self) -> bool {
        let state = self.state.lock().unwrap();
        let mut all_unpinned = true;
        for meta in &state.metas {
            if meta.pin_count != 0 {
                crate::granite_debug_log!(
                    "[BufferPool::check_all_unpinned] page {} pin count {}",
                    meta.page_id,
                    meta.pin_count
                );
                all_unpinned = false;
            }
        }
        all_unpinned
    }

    /// Hands out a frame: free list first, otherwise the replacer's
    /// victim, flushed if dirty and unmapped before reuse.
    fn find_free_frame(&self, state: &mut PoolState) -> DbResult<FrameId> {
        if let Some(frame_id) = state.free_list.pop() {
            return Ok(frame_id);
        }
        let Some(frame_id) = state.replacer.victim() else {
            return Err(DbError::BufferPoolFull);
        };
        let old_page_id = state.metas[frame_id].page_id;
        if state.metas[frame_id].is_dirty {
            let page = self.frames[frame_id].read();
            self.disk_manager.write_page(old_page_id, &page.data)?;
            state.metas[frame_id].is_dirty = false;
        }
        state.page_table.remove(&old_page_id);
        crate::granite_debug_log!(
            "[BufferPool::find_free_frame] evicted page {old_page_id} from frame {frame_id}"
        );
        Ok(frame_id)
    }

    fn mark_dirty(&self, frame_id: FrameId) {
        self.state.lock().unwrap().metas[frame_id].is_dirty = true;
    }

    fn unpin_frame(&self, frame_id: FrameId) {
        let mut state = self.state.lock().unwrap();
        let meta = &mut state.metas[frame_id];
        if meta.pin_count > 0 {
            meta.pin_count -= 1;
        }
        if meta.pin_count == 0 {
            state.replacer.unpin(frame_id);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::PAGE_SIZE;
    use tempfile::tempdir;

    fn pool(size: usize) -> (tempfile::TempDir, BufferPoolManager) {
        let dir = tempdir().unwrap();
        let dm = Arc::new(DiskManager::open(dir.path().join("test.db")).unwrap());
        let bpm = BufferPoolManager::new(
            dm,
            BufferPoolConfig {
                size,
                ..Default::default()
            },
        );
        (dir, bpm)
    }

    #[test]
    fn pin_counts_balance() {
        let (_dir, bpm) = pool(4);
        let page_id = {
            let guard = bpm.new_page().unwrap();
            assert_eq!(bpm.pin_count(guard.page_id()), Some(1));
            guard.page_id()
        };
        assert_eq!(bpm.pin_count(page_id), Some(0));

        let g1 = bpm.fetch_page(page_id).unwrap();
        let g2 = bpm.fetch_page(page_id).unwrap();
        assert_eq!(bpm.pin_count(page_id), Some(2));
        drop(g1);
        drop(g2);
        assert_eq!(bpm.pin_count(page_id), Some(0));
        assert!(bpm.check_all_unpinned());
    }

    #[test]
    fn fetch_fails_when_every_frame_is_pinned() {
        let (_dir, bpm) = pool(3);
        let guards: Vec<_> = (0..3).map(|_| bpm.new_page().unwrap()).collect();
        assert!(matches!(bpm.new_page(), Err(DbError::BufferPoolFull)));
        drop(guards);
        assert!(bpm.new_page().is_ok());
    }

    #[test]
    fn eviction_writes_dirty_pages_back() {
        let (_dir, bpm) = pool(2);
        let page_id = {
            let guard = bpm.new_page().unwrap();
            guard.write().write_u32(0, 777);
            guard.page_id()
        };
        // Force the dirty page out of the pool.
        let _a = bpm.new_page().unwrap();
        let _b = bpm.new_page().unwrap();
        assert!(bpm.pin_count(page_id).is_none());

        drop((_a, _b));
        let guard = bpm.fetch_page(page_id).unwrap();
        assert_eq!(guard.read().read_u32(0), 777);
    }

    #[test]
    fn delete_page_refuses_pinned_pages() {
        let (_dir, bpm) = pool(4);
        let guard = bpm.new_page().unwrap();
        let page_id = guard.page_id();
        assert!(!bpm.delete_page(page_id).unwrap());
        drop(guard);
        assert!(bpm.delete_page(page_id).unwrap());
        assert!(bpm.is_page_free(page_id).unwrap());
    }

    #[test]
    fn flush_then_refetch_preserves_bytes() {
        let (_dir, bpm) = pool(2);
        let page_id = {
            let guard = bpm.new_page().unwrap();
            let mut page = guard.write();
            for i in 0..PAGE_SIZE {
                page.data[i] = (i % 251) as u8;
            }
            guard.page_id()
        };
        bpm.flush_page(page_id).unwrap();
        let guard = bpm.fetch_page(page_id).unwrap();
        let page = guard.read();
        for i in 0..PAGE_SIZE {
            assert_eq!(page.data[i], (i % 251) as u8);
        }
    }
}
