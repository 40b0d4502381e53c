//! Composition root: wires the disk manager, buffer pool, lock manager
//! and transaction manager over one database file.

use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use crate::buffer_pool::{BufferPoolConfig, BufferPoolManager};
use crate::disk_manager::DiskManager;
use crate::errors::DbResult;
use crate::lock_manager::LockManager;
use crate::txn::TxnManager;
use crate::{CATALOG_META_PAGE_ID, INDEX_ROOTS_PAGE_ID};

const CYCLE_DETECTION_INTERVAL: Duration = Duration::from_millis(50);

pub struct StorageEngine {
    disk_manager: Arc<DiskManager>,
    buffer_pool: Arc<BufferPoolManager>,
    lock_manager: Arc<LockManager>,
    txn_manager: Arc<TxnManager>,
}

impl StorageEngine {
    /// Opens (or creates) a database file. A fresh file gets its two
    /// reserved pages allocated: the catalog meta page and the index
    /// roots page.
    pub fn open<P: AsRef<Path>>(path: P, config: BufferPoolConfig) -> DbResult<Self> {
        let disk_manager = Arc::new(DiskManager::open(path)?);
        if disk_manager.num_allocated_pages() == 0 {
            assert_eq!(disk_manager.allocate_page()?, CATALOG_META_PAGE_ID);
            assert_eq!(disk_manager.allocate_page()?, INDEX_ROOTS_PAGE_ID);
        }
        let buffer_pool = Arc::new(BufferPoolManager::new(Arc::clone(&disk_manager), config));
        let lock_manager = Arc::new(LockManager::new(CYCLE_DETECTION_INTERVAL));
        let txn_manager = TxnManager::new(Arc::clone(&lock_manager));
        lock_manager.start_deadlock_detection();
        Ok(Self {
            disk_manager,
            buffer_pool,
            lock_manager,
            txn_manager,
        })
    }

    pub fn buffer_pool(&self) -> &Arc<BufferPoolManager> {
        &self.buffer_pool
    }

    pub fn lock_manager(&self) -> &Arc<LockManager> {
        &self.lock_manager
    }

    pub fn txn_manager(&self) -> &Arc<TxnManager> {
        &self.txn_manager
    }

    /// Flushes every dirty page and writes the allocator meta page.
    pub fn close(&self) -> DbResult<()> {
        self.buffer_pool.flush_all_pages()?;
        self.disk_manager.close()?;
        Ok(())
    }
}
