// # Page Cache Pool
//
// The container holding every cached page of one device or one file:
// an offset-ordered map plus two LRU orders. Reclamation walks the clean
// LRU first (no write-back needed) and only then the dirty LRU.
//
// Device pools reach their secondary storage through the `BackingStore`
// seam, installed by the block-device layer at registration time; the
// pool itself never looks up drivers.

use crate::common::DeviceId;
use crate::error::{Result, VfsError};
use crate::page::PAGE_SIZE;
use crate::pcache::page::{LruList, PageCache, PcFlags};
use crate::sync::{RefCount, WakeReason};
use parking_lot::Mutex;
use std::collections::{BTreeMap, VecDeque};
use std::sync::{Arc, Weak};

/// Pool lifecycle state
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PoolState {
    /// Allocated but not yet bound to an owner
    Dormant,

    /// Bound to a device or v-node and serving pages
    Created,

    /// Tearing down
    Delete,
}

/// Secondary storage behind a device pool.
///
/// Implemented by the block-device layer; `write_back` and `read_in`
/// move one whole page between the cache and the device.
pub trait BackingStore: Send + Sync {
    /// Device this store writes to
    fn devid(&self) -> DeviceId;

    /// Read the page's contents in from the device
    fn read_in(&self, pc: &Arc<PageCache>) -> Result<()>;

    /// Write the page's contents out to the device
    fn write_back(&self, pc: &Arc<PageCache>) -> Result<()>;
}

/// Map and LRU orders, guarded by the pool mutex.
///
/// LRU entries are page offsets; the tail is the most recently released
/// page. A page is linked on an LRU iff it is valid and not BUSY.
struct PoolInner {
    map: BTreeMap<u64, Arc<PageCache>>,
    clean_lru: VecDeque<u64>,
    dirty_lru: VecDeque<u64>,
}

impl PoolInner {
    fn lru_mut(&mut self, which: LruList) -> &mut VecDeque<u64> {
        match which {
            LruList::Clean => &mut self.clean_lru,
            LruList::Dirty => &mut self.dirty_lru,
        }
    }

    fn lru_unlink(&mut self, which: LruList, offset: u64) {
        let lru = self.lru_mut(which);
        if let Some(pos) = lru.iter().position(|&o| o == offset) {
            lru.remove(pos);
        }
    }
}

/// Per-device or per-file page cache container
pub struct PageCachePool {
    me: Weak<PageCachePool>,
    state: Mutex<PoolState>,
    page_size: usize,
    refs: RefCount,
    backing: Option<Arc<dyn BackingStore>>,
    inner: Mutex<PoolInner>,
}

impl PageCachePool {
    fn new(backing: Option<Arc<dyn BackingStore>>) -> Arc<Self> {
        Arc::new_cyclic(|me| Self {
            me: me.clone(),
            state: Mutex::new(PoolState::Created),
            page_size: PAGE_SIZE,
            refs: RefCount::new(1),
            backing,
            inner: Mutex::new(PoolInner {
                map: BTreeMap::new(),
                clean_lru: VecDeque::new(),
                dirty_lru: VecDeque::new(),
            }),
        })
    }

    /// Pool for a file (v-node): no device behind it, fresh pages are
    /// eagerly CLEAN.
    pub fn new_file_pool() -> Arc<Self> {
        Self::new(None)
    }

    /// Pool for a block device: fresh pages stay INVALID until read in
    /// through `store`.
    pub fn new_device_pool(store: Arc<dyn BackingStore>) -> Arc<Self> {
        Self::new(Some(store))
    }

    /// Page size served by this pool
    #[inline]
    pub fn page_size(&self) -> usize {
        self.page_size
    }

    /// Device behind this pool, if any
    pub fn devid(&self) -> Option<DeviceId> {
        self.backing.as_ref().map(|b| b.devid())
    }

    /// Current lifecycle state
    pub fn state(&self) -> PoolState {
        *self.state.lock()
    }

    /// Number of pages currently cached
    pub fn cached_pages(&self) -> usize {
        self.inner.lock().map.len()
    }

    /// Take a logical reference; false when the pool is in teardown
    #[inline]
    pub fn ref_inc(&self) -> bool {
        self.refs.inc_if_valid()
    }

    /// Drop a logical reference; true on the last one.
    ///
    /// The owner's final drop only happens once every page is gone: each
    /// cached page holds a reference through its back-pointer.
    pub fn ref_dec(&self) -> bool {
        let last = self.refs.dec_and_test();
        if last {
            *self.state.lock() = PoolState::Delete;
            debug_assert!(self.inner.lock().map.is_empty());
        }
        last
    }

    /// Current logical reference count
    #[inline]
    pub fn ref_count(&self) -> u64 {
        self.refs.read()
    }

    // ------------------------------------------------------------------
    // get / put
    // ------------------------------------------------------------------

    /// Look up (or create) the page covering `offset` and acquire BUSY.
    ///
    /// The offset is rounded down to the page boundary. The returned page
    /// is BUSY, owned by the calling thread, and carries one caller
    /// reference; release it with [`put`](Self::put) (or drop it from the
    /// map with [`invalidate`](Self::invalidate) followed by `ref_dec`).
    ///
    /// A wait for another owner ends in `Interrupted` when an
    /// asynchronous event is delivered, and restarts the lookup when the
    /// page is destroyed under the waiter.
    pub fn get(&self, offset: u64) -> Result<Arc<PageCache>> {
        'restart: loop {
            if !self.ref_inc() {
                return Err(VfsError::ObjectReleased("page cache pool".into()));
            }

            let mut inner = self.inner.lock();
            let aligned = offset - (offset % self.page_size as u64);

            let pc = match inner.map.get(&aligned) {
                Some(pc) => pc.clone(),
                None => {
                    let Some(me) = self.me.upgrade() else {
                        drop(inner);
                        self.ref_dec();
                        return Err(VfsError::ObjectReleased("page cache pool".into()));
                    };
                    // Back-reference from the new page to the pool.
                    if !self.ref_inc() {
                        drop(inner);
                        self.ref_dec();
                        return Err(VfsError::ObjectReleased("page cache pool".into()));
                    }
                    let pc = match PageCache::alloc(aligned, me) {
                        Ok(pc) => pc,
                        Err(e) => {
                            self.ref_dec();
                            drop(inner);
                            self.ref_dec();
                            return Err(e);
                        }
                    };
                    inner.map.insert(aligned, pc.clone());
                    pc
                }
            };

            // In-map pages always admit new references; the map itself
            // holds one.
            let _got = pc.ref_inc();
            debug_assert!(_got);

            // BUSY acquisition, waiting out the current owner if any.
            loop {
                {
                    let mut st = pc.state_lock();
                    if !st.flags.contains(PcFlags::BUSY) {
                        st.flags.insert(PcFlags::BUSY);
                        if let Some(which) = st.lru.take() {
                            debug_assert!(st.flags.is_valid());
                            inner.lru_unlink(which, aligned);
                        }
                        // Pages of a file pool have no device to read
                        // from: fresh ones are complete as-is.
                        if !st.flags.is_valid() && self.backing.is_none() {
                            st.flags.insert(PcFlags::CLEAN);
                        }
                        drop(st);
                        pc.waiters().set_owner();
                        drop(inner);
                        self.ref_dec();
                        return Ok(pc);
                    }
                }

                match pc.waiters().wait(&mut inner) {
                    WakeReason::Released => continue,
                    WakeReason::Destroyed => {
                        drop(inner);
                        pc.ref_dec();
                        self.ref_dec();
                        continue 'restart;
                    }
                    WakeReason::EventDelivered | WakeReason::LockFail => {
                        drop(inner);
                        pc.ref_dec();
                        self.ref_dec();
                        return Err(VfsError::Interrupted(
                            "event delivered while waiting for page".into(),
                        ));
                    }
                }
            }
        }
    }

    /// Release a BUSY page acquired with [`get`](Self::get).
    ///
    /// Clears BUSY and the owner, wakes one waiter with `Released`,
    /// appends the page to the LRU matching its state, and drops the
    /// caller's reference. A page released while still INVALID has no
    /// contents worth caching and is discarded from the map instead;
    /// waiters restart their lookup.
    pub fn put(&self, pc: &Arc<PageCache>) -> Result<()> {
        if !pc.ref_inc() {
            return Err(VfsError::ObjectReleased("page cache".into()));
        }

        let mut inner = self.inner.lock();
        let discard = {
            let mut st = pc.state_lock();
            debug_assert!(st.flags.contains(PcFlags::BUSY));
            pc.waiters().debug_assert_owned();
            debug_assert!(st.lru.is_none());

            st.flags.remove(PcFlags::BUSY);
            if st.flags.is_valid() {
                let which = if st.flags.contains(PcFlags::DIRTY) {
                    LruList::Dirty
                } else {
                    LruList::Clean
                };
                inner.lru_mut(which).push_back(pc.offset());
                st.lru = Some(which);
                false
            } else {
                true
            }
        };
        pc.waiters().clear_owner();

        if discard {
            if inner.map.remove(&pc.offset()).is_some() {
                pc.ref_dec();
            }
            pc.waiters().wake_all(WakeReason::Destroyed);
        } else {
            pc.waiters().wake_one(WakeReason::Released);
        }
        drop(inner);

        pc.ref_dec();
        pc.ref_dec();
        Ok(())
    }

    // ------------------------------------------------------------------
    // invalidate / shrink / sync
    // ------------------------------------------------------------------

    /// Drop a BUSY page from the pool.
    ///
    /// A dirty page is written back first; a write-back failure is logged
    /// and the page is unmapped regardless. The map's reference is
    /// dropped here; the caller still owns the reference it took at
    /// `get` and releases it with `ref_dec` (not `put` -- the page no
    /// longer belongs on an LRU).
    pub fn invalidate(&self, pc: &Arc<PageCache>) -> Result<()> {
        if !pc.ref_inc() {
            return Err(VfsError::ObjectReleased("page cache".into()));
        }

        let mut inner = self.inner.lock();
        self.invalidate_locked(&mut inner, pc);
        drop(inner);

        pc.ref_dec();
        Ok(())
    }

    /// Unmap one page while holding the pool mutex. The page must be
    /// BUSY.
    fn invalidate_locked(&self, inner: &mut PoolInner, pc: &Arc<PageCache>) {
        debug_assert!(pc.is_busy());

        if pc.is_dirty() {
            if let Some(backing) = &self.backing {
                if let Err(e) = backing.write_back(pc) {
                    tracing::error!(
                        devid = backing.devid(),
                        offset = pc.offset(),
                        error = %e,
                        "write-back failed during invalidation; dropping page"
                    );
                }
            }
        }

        let _removed = inner.map.remove(&pc.offset());
        debug_assert!(_removed.is_some());

        {
            let mut st = pc.state_lock();
            if let Some(which) = st.lru.take() {
                inner.lru_unlink(which, pc.offset());
            }
        }

        // Anyone parked on the BUSY bit must restart its lookup; the
        // page is no longer reachable through the map.
        pc.waiters().wake_all(WakeReason::Destroyed);

        // The map's logical reference.
        pc.ref_dec();
    }

    /// Reclaim up to `reclaim_nr` pages; negative means try them all.
    ///
    /// Clean pages go first. Returns the number reclaimed, or `Busy` when
    /// some candidate could not be reclaimed.
    pub fn shrink(&self, reclaim_nr: i64) -> Result<u64> {
        if !self.ref_inc() {
            return Err(VfsError::ObjectReleased("page cache pool".into()));
        }

        let mut inner = self.inner.lock();
        let mut reclaimed: u64 = 0;
        let mut failed: u64 = 0;
        let mut remains = reclaim_nr;

        for which in [LruList::Clean, LruList::Dirty] {
            let candidates: Vec<u64> = match which {
                LruList::Clean => inner.clean_lru.iter().copied().collect(),
                LruList::Dirty => inner.dirty_lru.iter().copied().collect(),
            };

            for offset in candidates {
                if reclaim_nr > 0 && remains == 0 {
                    break;
                }

                let Some(pc) = inner.map.get(&offset).cloned() else {
                    continue;
                };
                if !pc.ref_inc() {
                    continue;
                }

                {
                    let mut st = pc.state_lock();
                    if st.flags.contains(PcFlags::BUSY) {
                        // LRU membership should have precluded this;
                        // count it and move on.
                        failed += 1;
                        drop(st);
                        pc.ref_dec();
                        continue;
                    }
                    st.flags.insert(PcFlags::BUSY);
                }

                self.invalidate_locked(&mut inner, &pc);
                pc.ref_dec();

                reclaimed += 1;
                if reclaim_nr > 0 {
                    remains -= 1;
                }
            }

            if reclaim_nr > 0 && remains == 0 {
                break;
            }
        }

        drop(inner);
        self.ref_dec();

        if failed > 0 {
            return Err(VfsError::Busy(format!(
                "{failed} pages could not be reclaimed ({reclaimed} were)"
            )));
        }
        Ok(reclaimed)
    }

    /// Write every dirty page back without evicting.
    ///
    /// Pages move from the dirty to the clean LRU. Returns the number of
    /// pages written.
    pub fn sync_dirty(&self) -> Result<u64> {
        if !self.ref_inc() {
            return Err(VfsError::ObjectReleased("page cache pool".into()));
        }

        let mut inner = self.inner.lock();
        let candidates: Vec<u64> = inner.dirty_lru.iter().copied().collect();
        let mut written: u64 = 0;
        let mut first_err: Option<VfsError> = None;

        for offset in candidates {
            let Some(pc) = inner.map.get(&offset).cloned() else {
                continue;
            };
            if !pc.ref_inc() {
                continue;
            }

            {
                let mut st = pc.state_lock();
                if st.flags.contains(PcFlags::BUSY) {
                    drop(st);
                    pc.ref_dec();
                    continue;
                }
                st.flags.insert(PcFlags::BUSY);
            }

            let result = match &self.backing {
                Some(backing) => backing.write_back(&pc),
                None => Ok(()),
            };

            {
                let mut st = pc.state_lock();
                st.flags.remove(PcFlags::BUSY);
                match &result {
                    Ok(()) => {
                        st.flags.remove(PcFlags::DIRTY);
                        st.flags.insert(PcFlags::CLEAN);
                        if let Some(which) = st.lru.take() {
                            inner.lru_unlink(which, offset);
                        }
                        inner.clean_lru.push_back(offset);
                        st.lru = Some(LruList::Clean);
                        written += 1;
                    }
                    Err(e) => {
                        tracing::warn!(
                            offset,
                            error = %e,
                            "write-back failed during pool sync; page stays dirty"
                        );
                        if first_err.is_none() {
                            first_err = Some(e.clone());
                        }
                    }
                }
            }

            pc.ref_dec();
        }

        drop(inner);
        self.ref_dec();

        match first_err {
            Some(e) => Err(e),
            None => Ok(written),
        }
    }

    /// (clean LRU length, dirty LRU length)
    pub fn lru_lengths(&self) -> (usize, usize) {
        let inner = self.inner.lock();
        (inner.clean_lru.len(), inner.dirty_lru.len())
    }
}

impl std::fmt::Debug for PageCachePool {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PageCachePool")
            .field("state", &self.state())
            .field("devid", &self.devid())
            .field("pages", &self.cached_pages())
            .finish_non_exhaustive()
    }
}

// ============================================================================
// Tests
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use std::thread;
    use std::time::Duration;

    #[test]
    fn test_get_rounds_offset_down() {
        let pool = PageCachePool::new_file_pool();
        let pc = pool.get(5000).unwrap();
        assert_eq!(pc.offset(), 4096);
        pool.put(&pc).unwrap();

        let again = pool.get(4096).unwrap();
        assert_eq!(again.offset(), 4096);
        assert_eq!(pool.cached_pages(), 1);
        pool.put(&again).unwrap();
    }

    #[test]
    fn test_file_pool_page_is_eagerly_clean() {
        let pool = PageCachePool::new_file_pool();
        let pc = pool.get(0).unwrap();
        assert!(pc.is_valid());
        assert!(!pc.is_dirty());
        pool.put(&pc).unwrap();

        let (clean, dirty) = pool.lru_lengths();
        assert_eq!((clean, dirty), (1, 0));
    }

    #[test]
    fn test_put_links_dirty_page_on_dirty_lru() {
        let pool = PageCachePool::new_file_pool();
        let pc = pool.get(0).unwrap();
        pc.mark_dirty().unwrap();
        pool.put(&pc).unwrap();

        assert_eq!(pool.lru_lengths(), (0, 1));

        // Re-acquiring takes it off the LRU while BUSY.
        let pc = pool.get(0).unwrap();
        assert_eq!(pool.lru_lengths(), (0, 0));
        pool.put(&pc).unwrap();
    }

    #[test]
    fn test_busy_page_blocks_second_getter_until_put() {
        let pool = PageCachePool::new_file_pool();
        let pc = pool.get(0).unwrap();

        let contender = {
            let pool = pool.clone();
            thread::spawn(move || {
                let pc = pool.get(0).unwrap();
                let byte = pc.data().data()[0];
                pool.put(&pc).unwrap();
                byte
            })
        };

        thread::sleep(Duration::from_millis(20));
        pc.data_mut().data_mut()[0] = 0xa5;
        pc.mark_dirty().unwrap();
        pool.put(&pc).unwrap();

        assert_eq!(contender.join().unwrap(), 0xa5);
    }

    #[test]
    fn test_shrink_reclaims_all_with_negative_count() {
        let pool = PageCachePool::new_file_pool();
        for i in 0..4u64 {
            let pc = pool.get(i * 4096).unwrap();
            if i % 2 == 0 {
                pc.mark_dirty().unwrap();
            }
            pool.put(&pc).unwrap();
        }
        assert_eq!(pool.cached_pages(), 4);

        let reclaimed = pool.shrink(-1).unwrap();
        assert_eq!(reclaimed, 4);
        assert_eq!(pool.cached_pages(), 0);
        assert_eq!(pool.lru_lengths(), (0, 0));
    }

    #[test]
    fn test_shrink_honours_reclaim_count_clean_first() {
        let pool = PageCachePool::new_file_pool();
        let clean = pool.get(0).unwrap();
        pool.put(&clean).unwrap();
        let dirty = pool.get(4096).unwrap();
        dirty.mark_dirty().unwrap();
        pool.put(&dirty).unwrap();

        let reclaimed = pool.shrink(1).unwrap();
        assert_eq!(reclaimed, 1);
        // The clean page went first; the dirty one survives.
        assert_eq!(pool.lru_lengths(), (0, 1));
    }

    #[test]
    fn test_invalidate_unmaps_busy_page() {
        let pool = PageCachePool::new_file_pool();
        let pc = pool.get(0).unwrap();
        pc.mark_dirty().unwrap();

        pool.invalidate(&pc).unwrap();
        assert_eq!(pool.cached_pages(), 0);

        // Final release of the caller's reference tears the page down.
        assert!(pc.ref_dec());
        assert!(!pc.ref_inc());
    }

    #[test]
    fn test_get_after_pool_release_fails() {
        let pool = PageCachePool::new_file_pool();
        assert!(pool.ref_dec());
        assert!(matches!(
            pool.get(0),
            Err(VfsError::ObjectReleased(_))
        ));
    }
}
