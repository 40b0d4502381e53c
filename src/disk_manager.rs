//! Maps logical page ids onto a single database file laid out in extents.
//!
//! The file starts with a meta page, followed by extents of
//! `BITMAP_SIZE + 1` physical pages each: one bitmap page tracking
//! allocation state and `BITMAP_SIZE` data pages.

use std::fs::{create_dir_all, File, OpenOptions};
use std::io::{self, Read, Seek, SeekFrom, Write};
use std::path::Path;
use std::sync::Mutex;

use crate::errors::{DbError, DbResult};
use crate::{PageId, PAGE_SIZE};

/// Pages tracked by one bitmap page.
pub const BITMAP_SIZE: u32 = ((PAGE_SIZE - 8) * 8) as u32;
/// Extents addressable by the meta page.
pub const MAX_EXTENT_NUMS: u32 = ((PAGE_SIZE - 8) / 4) as u32;
/// Highest logical page id the file can ever hold.
pub const MAX_VALID_PAGE_ID: u32 = MAX_EXTENT_NUMS * BITMAP_SIZE;

const META_PHYSICAL_ID: u64 = 0;

/// The first page of an extent: one bit per data page in the extent.
///
/// Layout: `page_allocated:u32 | next_free_page:u32 | bytes[..]`.
/// `next_free_page` is an advisory hint; the bits are authoritative.
struct BitmapPage {
    data: [u8; PAGE_SIZE],
}

impl BitmapPage {
    fn new() -> Self {
        BitmapPage {
            data: [0; PAGE_SIZE],
        }
    }

    fn page_allocated(&self) -> u32 {
        u32::from_le_bytes(self.data[0..4].try_into().unwrap())
    }

    fn set_page_allocated(&mut self, n: u32) {
        self.data[0..4].copy_from_slice(&n.to_le_bytes());
    }

    fn next_free_page(&self) -> u32 {
        u32::from_le_bytes(self.data[4..8].try_into().unwrap())
    }

    fn set_next_free_page(&mut self, n: u32) {
        self.data[4..8].copy_from_slice(&n.to_le_bytes());
    }

    fn is_page_free(&self, page_offset: u32) -> bool {
        debug_assert!(page_offset < BITMAP_SIZE);
        self.data[8 + (page_offset / 8) as usize] & (1 << (page_offset % 8)) == 0
    }

    fn set_bit(&mut self, page_offset: u32, allocated: bool) {
        let byte = &mut self.data[8 + (page_offset / 8) as usize];
        if allocated {
            *byte |= 1 << (page_offset % 8);
        } else {
            *byte &= !(1 << (page_offset % 8));
        }
    }

    /// Allocates the page at the free hint and advances the hint
    /// circularly to the next free bit.
    fn allocate_page(&mut self) -> Option<u32> {
        let offset = self.next_free_page();
        if offset >= BITMAP_SIZE {
            return None;
        }
        assert!(self.is_page_free(offset), "free hint points at a live page");
        self.set_bit(offset, true);
        let allocated = self.page_allocated() + 1;
        self.set_page_allocated(allocated);
        if allocated == BITMAP_SIZE {
            self.set_next_free_page(BITMAP_SIZE);
            return Some(offset);
        }
        let mut next = offset;
        loop {
            next = (next + 1) % BITMAP_SIZE;
            if next == offset {
                next = BITMAP_SIZE;
                break;
            }
            if self.is_page_free(next) {
                break;
            }
        }
        self.set_next_free_page(next);
        Some(offset)
    }

    /// Clears the bit for `page_offset`. Freeing a free page is a no-op
    /// returning `false`.
    fn deallocate_page(&mut self, page_offset: u32) -> bool {
        assert!(page_offset < BITMAP_SIZE, "page offset out of range");
        if self.is_page_free(page_offset) {
            return false;
        }
        self.set_bit(page_offset, false);
        if page_offset < self.next_free_page() {
            self.set_next_free_page(page_offset);
        }
        self.set_page_allocated(self.page_allocated() - 1);
        true
    }
}

/// Physical page 0: allocation counters plus per-extent usage.
struct DiskFileMetaPage {
    data: [u8; PAGE_SIZE],
}

impl DiskFileMetaPage {
    fn num_allocated_pages(&self) -> u32 {
        u32::from_le_bytes(self.data[0..4].try_into().unwrap())
    }

    fn set_num_allocated_pages(&mut self, n: u32) {
        self.data[0..4].copy_from_slice(&n.to_le_bytes());
    }

    fn num_extents(&self) -> u32 {
        u32::from_le_bytes(self.data[4..8].try_into().unwrap())
    }

    fn set_num_extents(&mut self, n: u32) {
        self.data[4..8].copy_from_slice(&n.to_le_bytes());
    }

    fn extent_used_page(&self, extent: u32) -> u32 {
        let at = 8 + extent as usize * 4;
        u32::from_le_bytes(self.data[at..at + 4].try_into().unwrap())
    }

    fn set_extent_used_page(&mut self, extent: u32, used: u32) {
        let at = 8 + extent as usize * 4;
        self.data[at..at + 4].copy_from_slice(&used.to_le_bytes());
    }
}

struct DiskInner {
    file: File,
    meta: DiskFileMetaPage,
    closed: bool,
}

/// Owns the database file. A single latch guards all I/O and the
/// in-memory meta page, which is written back on [`DiskManager::close`].
pub struct DiskManager {
    inner: Mutex<DiskInner>,
}

impl DiskManager {
    pub fn open<P: AsRef<Path>>(path: P) -> io::Result<Self> {
        let path_ref = path.as_ref();
        crate::granite_debug_log!("[DiskManager::open] Opening database file at: {path_ref:?}");
        if let Some(parent) = path_ref.parent() {
            create_dir_all(parent)?;
        }
        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .truncate(false)
            .open(path_ref)?;

        let mut inner = DiskInner {
            file,
            meta: DiskFileMetaPage {
                data: [0; PAGE_SIZE],
            },
            closed: false,
        };
        let mut meta_buf = [0u8; PAGE_SIZE];
        inner.read_physical(META_PHYSICAL_ID, &mut meta_buf)?;
        inner.meta.data = meta_buf;

        Ok(Self {
            inner: Mutex::new(inner),
        })
    }

    /// Reads a logical page into `buf`. Pages past the end of the file
    /// read as zeroes, so freshly allocated pages start out blank.
    pub fn read_page(&self, logical_page_id: PageId, buf: &mut [u8; PAGE_SIZE]) -> DbResult<()> {
        assert!(logical_page_id >= 0, "invalid page id");
        let phys = Self::map_page_id(logical_page_id);
        let mut inner = self.inner.lock().unwrap();
        inner.read_physical(phys, buf)?;
        Ok(())
    }

    pub fn write_page(&self, logical_page_id: PageId, buf: &[u8; PAGE_SIZE]) -> DbResult<()> {
        assert!(logical_page_id >= 0, "invalid page id");
        let phys = Self::map_page_id(logical_page_id);
        let mut inner = self.inner.lock().unwrap();
        inner.write_physical(phys, buf)?;
        Ok(())
    }

    /// Allocates a logical page: first free bit of the first extent with
    /// room, growing the file by a new extent when every existing one is
    /// full.
    pub fn allocate_page(&self) -> DbResult<PageId> {
        let mut inner = self.inner.lock().unwrap();
        if inner.meta.num_allocated_pages() >= MAX_VALID_PAGE_ID
            && inner.meta.num_extents() >= MAX_EXTENT_NUMS
        {
            crate::granite_debug_log!("[DiskManager::allocate_page] no space left for a new page");
            return Err(DbError::NoSpace);
        }
        for extent in 0..inner.meta.num_extents() {
            if inner.meta.extent_used_page(extent) >= BITMAP_SIZE {
                continue;
            }
            let bitmap_phys = bitmap_physical_id(extent);
            let mut bitmap = BitmapPage::new();
            inner.read_physical(bitmap_phys, &mut bitmap.data)?;
            let offset = bitmap
                .allocate_page()
                .expect("meta page reports free pages the bitmap does not have");
            inner.write_physical(bitmap_phys, &bitmap.data)?;
            let allocated = inner.meta.num_allocated_pages() + 1;
            inner.meta.set_num_allocated_pages(allocated);
            let used = inner.meta.extent_used_page(extent) + 1;
            inner.meta.set_extent_used_page(extent, used);
            let logical = (extent * BITMAP_SIZE + offset) as PageId;
            crate::granite_debug_log!("[DiskManager::allocate_page] extent {extent} -> {logical}");
            return Ok(logical);
        }
        // Every extent is full; open a new one.
        if inner.meta.num_extents() >= MAX_EXTENT_NUMS {
            return Err(DbError::NoSpace);
        }
        let extent = inner.meta.num_extents();
        let mut bitmap = BitmapPage::new();
        let offset = bitmap.allocate_page().expect("fresh bitmap cannot be full");
        inner.write_physical(bitmap_physical_id(extent), &bitmap.data)?;
        inner.meta.set_extent_used_page(extent, 1);
        inner.meta.set_num_extents(extent + 1);
        let allocated = inner.meta.num_allocated_pages() + 1;
        inner.meta.set_num_allocated_pages(allocated);
        let logical = (extent * BITMAP_SIZE + offset) as PageId;
        crate::granite_debug_log!("[DiskManager::allocate_page] new extent {extent} -> {logical}");
        Ok(logical)
    }

    /// Clears the allocation bit for `logical_page_id`. Double frees are
    /// a no-op returning `false`.
    pub fn deallocate_page(&self, logical_page_id: PageId) -> DbResult<bool> {
        assert!(
            logical_page_id >= 0 && (logical_page_id as u32) < MAX_VALID_PAGE_ID,
            "invalid page id: {logical_page_id}"
        );
        let mut inner = self.inner.lock().unwrap();
        let extent = logical_page_id as u32 / BITMAP_SIZE;
        let bitmap_phys = bitmap_physical_id(extent);
        let mut bitmap = BitmapPage::new();
        inner.read_physical(bitmap_phys, &mut bitmap.data)?;
        if !bitmap.deallocate_page(logical_page_id as u32 % BITMAP_SIZE) {
            crate::granite_debug_log!(
                "[DiskManager::deallocate_page] page {logical_page_id} is already free"
            );
            return Ok(false);
        }
        inner.write_physical(bitmap_phys, &bitmap.data)?;
        let allocated = inner.meta.num_allocated_pages() - 1;
        inner.meta.set_num_allocated_pages(allocated);
        let used = inner.meta.extent_used_page(extent) - 1;
        inner.meta.set_extent_used_page(extent, used);
        Ok(true)
    }

    pub fn is_page_free(&self, logical_page_id: PageId) -> DbResult<bool> {
        assert!(
            logical_page_id >= 0 && (logical_page_id as u32) < MAX_VALID_PAGE_ID,
            "invalid page id: {logical_page_id}"
        );
        let mut inner = self.inner.lock().unwrap();
        let bitmap_phys = bitmap_physical_id(logical_page_id as u32 / BITMAP_SIZE);
        let mut bitmap = BitmapPage::new();
        inner.read_physical(bitmap_phys, &mut bitmap.data)?;
        Ok(bitmap.is_page_free(logical_page_id as u32 % BITMAP_SIZE))
    }

    pub fn num_allocated_pages(&self) -> u32 {
        self.inner.lock().unwrap().meta.num_allocated_pages()
    }

    /// Writes the meta page back and syncs the file.
    pub fn close(&self) -> io::Result<()> {
        let mut inner = self.inner.lock().unwrap();
        if inner.closed {
            return Ok(());
        }
        let meta = inner.meta.data;
        inner.write_physical(META_PHYSICAL_ID, &meta)?;
        inner.file.sync_all()?;
        inner.closed = true;
        Ok(())
    }

    /// Logical id `L` of extent `e` maps past the meta page plus one
    /// bitmap page per extent up to and including `e`.
    fn map_page_id(logical_page_id: PageId) -> u64 {
        assert!(
            (logical_page_id as u32) < MAX_VALID_PAGE_ID,
            "invalid page id: {logical_page_id}"
        );
        let extent = logical_page_id as u64 / BITMAP_SIZE as u64;
        1 + logical_page_id as u64 + (1 + extent)
    }
}

impl Drop for DiskManager {
    fn drop(&mut self) {
        let _ = self.close();
    }
}

fn bitmap_physical_id(extent: u32) -> u64 {
    1 + extent as u64 * (BITMAP_SIZE as u64 + 1)
}

impl DiskInner {
    fn read_physical(&mut self, physical_page_id: u64, buf: &mut [u8; PAGE_SIZE]) -> io::Result<()> {
        let offset = physical_page_id * PAGE_SIZE as u64;
        let file_len = self.file.metadata()?.len();
        if offset >= file_len {
            buf.fill(0);
            return Ok(());
        }
        self.file.seek(SeekFrom::Start(offset))?;
        let mut read = 0;
        while read < PAGE_SIZE {
            let n = self.file.read(&mut buf[read..])?;
            if n == 0 {
                break;
            }
            read += n;
        }
        if read < PAGE_SIZE {
            buf[read..].fill(0);
        }
        Ok(())
    }

    fn write_physical(&mut self, physical_page_id: u64, buf: &[u8; PAGE_SIZE]) -> io::Result<()> {
        let offset = physical_page_id * PAGE_SIZE as u64;
        self.file.seek(SeekFrom::Start(offset))?;
        self.file.write_all(buf)?;
        self.file.flush()?;
        Ok(())
    }
}
