// # Page Cache Entry
//
// One cached page: offset, state bits, logical reference count, waiter
// queue with BUSY-owner tracking, the backing page frame, and the list of
// block buffers carved out of the page when a filesystem's block size is
// smaller than the page size.
//
// State machine: pages start INVALID; the first read-in or write marks
// them CLEAN or DIRTY (which both imply valid). The BUSY bit is
// orthogonal and owned by exactly one thread between `pool.get` and
// `pool.put`. A DIRTY page must be written back before it may become
// CLEAN or be reused as INVALID.

use crate::bdev::buffer::BlockBuffer;
use crate::common::DeviceId;
use crate::error::{Result, VfsError};
use crate::page::{frame_allocator, PageFrame, PageUsage};
use crate::pcache::pool::PageCachePool;
use crate::sync::{RefCount, WaitQueue, WakeReason};
use bitflags::bitflags;
use parking_lot::{Mutex, RwLock, RwLockReadGuard, RwLockWriteGuard};
use std::sync::Arc;

bitflags! {
    /// Page cache state bits.
    ///
    /// CLEAN and DIRTY are mutually exclusive; either one implies the
    /// page contents are valid. BUSY is orthogonal ownership.
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct PcFlags: u32 {
        const CLEAN = 1 << 0;
        const DIRTY = 1 << 1;
        const BUSY  = 1 << 2;
    }
}

impl PcFlags {
    /// Contents have been read in or written since allocation
    #[inline]
    pub fn is_valid(self) -> bool {
        self.intersects(PcFlags::CLEAN | PcFlags::DIRTY)
    }
}

/// Which LRU a page is linked on, if any
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum LruList {
    Clean,
    Dirty,
}

/// Mutable page state, guarded by the page's own mutex.
///
/// Lock order: pool mutex before page-state mutex.
#[derive(Debug)]
pub(crate) struct PcState {
    pub(crate) flags: PcFlags,
    pub(crate) lru: Option<LruList>,
}

/// One cached page
pub struct PageCache {
    /// Byte offset of this page within its pool, page-aligned
    offset: u64,

    /// Logical reference count; the pool map holds one reference
    refs: RefCount,

    /// State bits and LRU membership
    state: Mutex<PcState>,

    /// Threads waiting for the BUSY bit; also records the BUSY owner
    waiters: WaitQueue,

    /// Owning pool; cleared during teardown to break the cycle
    pool: Mutex<Option<Arc<PageCachePool>>>,

    /// Page contents
    data: RwLock<PageFrame>,

    /// Block buffers mapped inside this page, in address order
    buffers: Mutex<Vec<Arc<BlockBuffer>>>,
}

impl PageCache {
    /// Allocate a new INVALID page for `pool` at `offset`.
    ///
    /// The returned page carries one logical reference, owned by the pool
    /// map entry that is about to be created. The pool's own logical
    /// count must already have been raised for the back-reference.
    pub(crate) fn alloc(offset: u64, pool: Arc<PageCachePool>) -> Result<Arc<PageCache>> {
        let frame = frame_allocator().allocate(PageUsage::PageCache)?;

        Ok(Arc::new(PageCache {
            offset,
            refs: RefCount::new(1),
            state: Mutex::new(PcState {
                flags: PcFlags::empty(),
                lru: None,
            }),
            waiters: WaitQueue::new(),
            pool: Mutex::new(Some(pool)),
            data: RwLock::new(frame),
            buffers: Mutex::new(Vec::new()),
        }))
    }

    /// Page-aligned byte offset within the pool
    #[inline]
    pub fn offset(&self) -> u64 {
        self.offset
    }

    /// Take a logical reference; false when the page is in teardown
    #[inline]
    pub fn ref_inc(&self) -> bool {
        self.refs.inc_if_valid()
    }

    /// Drop a logical reference; runs teardown and returns true on the
    /// last one.
    ///
    /// Teardown wakes any stragglers with `Destroyed`, unmaps the block
    /// buffers, and releases the back-reference to the pool.
    pub fn ref_dec(&self) -> bool {
        let last = self.refs.dec_and_test();
        if last {
            self.waiters.wake_all(WakeReason::Destroyed);
            self.unmap_block_buffers();

            let pool = self.pool.lock().take();
            if let Some(pool) = pool {
                pool.ref_dec();
            }
        }
        last
    }

    /// Current logical reference count
    #[inline]
    pub fn ref_count(&self) -> u64 {
        self.refs.read()
    }

    /// The owning pool, while the page is alive
    pub fn pool(&self) -> Option<Arc<PageCachePool>> {
        self.pool.lock().clone()
    }

    /// Device ID of the pool backing this page.
    ///
    /// Fails with `NoDevice` for file-pool pages and `ObjectReleased`
    /// when the page is in teardown.
    pub fn devid_get(&self) -> Result<DeviceId> {
        if !self.ref_inc() {
            return Err(VfsError::ObjectReleased("page cache".into()));
        }
        let result = match self.pool() {
            Some(pool) => pool
                .devid()
                .ok_or_else(|| VfsError::NoDevice("page is not device-backed".into())),
            None => Err(VfsError::ObjectReleased("page cache pool".into())),
        };
        self.ref_dec_arcless();
        result
    }

    /// Page size of the owning pool
    pub fn pagesize_get(&self) -> Result<usize> {
        if !self.ref_inc() {
            return Err(VfsError::ObjectReleased("page cache".into()));
        }
        let result = match self.pool() {
            Some(pool) => Ok(pool.page_size()),
            None => Err(VfsError::ObjectReleased("page cache pool".into())),
        };
        self.ref_dec_arcless();
        result
    }

    // Short-reference decrement for paths that provably never drop the
    // last reference (a map reference outlives the call).
    fn ref_dec_arcless(&self) {
        let last = self.refs.dec_and_test();
        debug_assert!(!last, "short reference outlived the map reference");
    }

    /// Read access to the page contents
    #[inline]
    pub fn data(&self) -> RwLockReadGuard<'_, PageFrame> {
        self.data.read()
    }

    /// Write access to the page contents.
    ///
    /// Writing does not itself change the state bits; the BUSY holder
    /// marks the page dirty (or clean, after write-back) explicitly.
    #[inline]
    pub fn data_mut(&self) -> RwLockWriteGuard<'_, PageFrame> {
        self.data.write()
    }

    /// Mark the page CLEAN. Requires BUSY ownership.
    pub fn mark_clean(&self) -> Result<()> {
        self.change_state(PcFlags::CLEAN)
    }

    /// Mark the page DIRTY. Requires BUSY ownership.
    pub fn mark_dirty(&self) -> Result<()> {
        self.change_state(PcFlags::DIRTY)
    }

    fn change_state(&self, new: PcFlags) -> Result<()> {
        debug_assert!(new == PcFlags::CLEAN || new == PcFlags::DIRTY);

        if !self.ref_inc() {
            return Err(VfsError::ObjectReleased("page cache".into()));
        }

        {
            let mut st = self.state.lock();
            debug_assert!(st.flags.contains(PcFlags::BUSY));
            self.waiters.debug_assert_owned();
            st.flags.remove(PcFlags::CLEAN | PcFlags::DIRTY);
            st.flags.insert(new);
        }

        self.ref_dec_arcless();
        Ok(())
    }

    /// Snapshot of the state bits
    pub fn flags(&self) -> PcFlags {
        self.state.lock().flags
    }

    #[inline]
    pub fn is_busy(&self) -> bool {
        self.flags().contains(PcFlags::BUSY)
    }

    #[inline]
    pub fn is_valid(&self) -> bool {
        self.flags().is_valid()
    }

    #[inline]
    pub fn is_dirty(&self) -> bool {
        self.flags().contains(PcFlags::DIRTY)
    }

    // ------------------------------------------------------------------
    // Block buffer list
    // ------------------------------------------------------------------

    /// Link a block buffer into the page, keeping address order.
    ///
    /// Fails with `AlreadyExists` when a buffer at the same in-page
    /// offset is already mapped.
    pub(crate) fn enqueue_block_buffer(&self, buf: Arc<BlockBuffer>) -> Result<()> {
        let mut buffers = self.buffers.lock();
        let pos = buffers
            .binary_search_by_key(&buf.page_offset(), |b| b.page_offset());
        match pos {
            Ok(_) => Err(VfsError::AlreadyExists(format!(
                "block buffer at page offset {}",
                buf.page_offset()
            ))),
            Err(idx) => {
                buffers.insert(idx, buf);
                Ok(())
            }
        }
    }

    /// Find the block buffer mapped at `page_offset`
    pub(crate) fn find_block_buffer(&self, page_offset: usize) -> Option<Arc<BlockBuffer>> {
        let buffers = self.buffers.lock();
        buffers
            .binary_search_by_key(&page_offset, |b| b.page_offset())
            .ok()
            .map(|idx| buffers[idx].clone())
    }

    /// True when the page has block buffers mapped
    pub fn has_block_buffers(&self) -> bool {
        !self.buffers.lock().is_empty()
    }

    /// Number of block buffers mapped into the page
    pub fn block_buffer_count(&self) -> usize {
        self.buffers.lock().len()
    }

    /// Drop every mapped block buffer. Idempotent on an empty list.
    pub(crate) fn unmap_block_buffers(&self) {
        self.buffers.lock().clear();
    }

    // ------------------------------------------------------------------
    // Pool-internal state access
    // ------------------------------------------------------------------

    pub(crate) fn state_lock(&self) -> parking_lot::MutexGuard<'_, PcState> {
        self.state.lock()
    }

    pub(crate) fn waiters(&self) -> &WaitQueue {
        &self.waiters
    }
}

impl std::fmt::Debug for PageCache {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PageCache")
            .field("offset", &self.offset)
            .field("flags", &self.flags())
            .field("refs", &self.refs.read())
            .finish_non_exhaustive()
    }
}

// ============================================================================
// Tests
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use crate::pcache::pool::PageCachePool;

    #[test]
    fn test_alloc_starts_invalid_with_one_reference() {
        let pool = PageCachePool::new_file_pool();
        assert!(pool.ref_inc());
        let pc = PageCache::alloc(4096, pool.clone()).unwrap();

        assert_eq!(pc.offset(), 4096);
        assert_eq!(pc.ref_count(), 1);
        assert!(!pc.is_valid());
        assert!(!pc.is_busy());
    }

    #[test]
    fn test_ref_inc_fails_after_teardown() {
        let pool = PageCachePool::new_file_pool();
        assert!(pool.ref_inc());
        let pc = PageCache::alloc(0, pool.clone()).unwrap();

        assert!(pc.ref_dec());
        assert!(!pc.ref_inc());
        assert!(pc.pool().is_none());
    }

    #[test]
    fn test_mark_dirty_then_clean_keeps_contents() {
        let pool = PageCachePool::new_file_pool();
        let pc = pool.get(0).unwrap();

        pc.data_mut().data_mut()[7] = 0x5a;
        pc.mark_dirty().unwrap();
        assert!(pc.is_dirty());

        pc.mark_clean().unwrap();
        assert!(!pc.is_dirty());
        assert!(pc.is_valid());
        assert_eq!(pc.data().data()[7], 0x5a);

        pool.put(&pc).unwrap();
    }

    #[test]
    fn test_devid_get_on_file_pool_is_nodev() {
        let pool = PageCachePool::new_file_pool();
        let pc = pool.get(0).unwrap();
        assert!(matches!(pc.devid_get(), Err(VfsError::NoDevice(_))));
        assert_eq!(pc.pagesize_get().unwrap(), pool.page_size());
        pool.put(&pc).unwrap();
    }
}
