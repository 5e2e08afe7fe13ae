// # V-node Cache
//
// In-memory representation of one filesystem object. V-nodes live in
// their mount's map, keyed by v-node id, and are loaded lazily: a lookup
// miss inserts a BUSY placeholder, calls the filesystem's `getvnode`
// outside the map lock, and publishes the result by clearing BUSY and
// waking waiters. Concurrent lookups for the same id wait on the
// placeholder rather than loading twice.
//
// Flag machine: a live v-node is pure (VALID), dirty (VALID|DIRTY), or
// condemned (DELETE). BUSY is orthogonal single-thread ownership. The
// final reference drop dispatches `removevnode` when DELETE is set,
// `putvnode` otherwise.

use crate::common::{MountId, VnodeId};
use crate::error::{Result, VfsError};
use crate::pcache::PageCachePool;
use crate::sync::{RefCount, WaitQueue, WakeReason};
use crate::vfs::fs_calls::{FsPrivate, VnodeMode};
use crate::vfs::mount::{mount_get, mount_put, Mount};
use bitflags::bitflags;
use once_cell::sync::OnceCell;
use parking_lot::Mutex;
use std::sync::Arc;

bitflags! {
    /// V-node state bits
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct VnFlags: u32 {
        /// Loaded from the filesystem
        const VALID  = 1 << 0;

        /// Owned by one thread for update
        const BUSY   = 1 << 1;

        /// In-memory state is newer than the filesystem's
        const DIRTY  = 1 << 2;

        /// Remove the underlying object on the last reference
        const DELETE = 1 << 3;
    }
}

/// One cached filesystem object
pub struct Vnode {
    id: VnodeId,
    mount: Mutex<Option<Arc<Mount>>>,
    mode: Mutex<VnodeMode>,
    flags: Mutex<VnFlags>,
    refs: RefCount,
    waiters: WaitQueue,
    pool: OnceCell<Arc<PageCachePool>>,
    fs_node: Mutex<Option<FsPrivate>>,
}

impl Vnode {
    fn new_placeholder(id: VnodeId, mount: Arc<Mount>) -> Arc<Self> {
        Arc::new(Self {
            id,
            mount: Mutex::new(Some(mount)),
            mode: Mutex::new(VnodeMode::empty()),
            flags: Mutex::new(VnFlags::BUSY),
            refs: RefCount::new(1),
            waiters: WaitQueue::new(),
            pool: OnceCell::new(),
            fs_node: Mutex::new(None),
        })
    }

    #[inline]
    pub fn id(&self) -> VnodeId {
        self.id
    }

    /// The owning mount, while the v-node is alive
    pub fn mount(&self) -> Option<Arc<Mount>> {
        self.mount.lock().clone()
    }

    /// Mode bits set when the v-node became VALID
    pub fn mode(&self) -> VnodeMode {
        *self.mode.lock()
    }

    pub fn is_dir(&self) -> bool {
        self.mode().is_dir()
    }

    /// Snapshot of the flag word
    pub fn flags(&self) -> VnFlags {
        *self.flags.lock()
    }

    /// Take a reference; false once teardown has begun
    #[inline]
    pub fn ref_inc(&self) -> bool {
        self.refs.inc_if_valid()
    }

    #[inline]
    pub fn ref_count(&self) -> u64 {
        self.refs.read()
    }

    /// Filesystem-private node handle
    pub fn fs_node(&self) -> Option<FsPrivate> {
        self.fs_node.lock().clone()
    }

    /// The v-node's file page-cache pool, created on first use
    pub fn page_pool(&self) -> &Arc<PageCachePool> {
        self.pool.get_or_init(PageCachePool::new_file_pool)
    }

    /// The file page-cache pool, if anything has created it yet
    pub fn pool_if_created(&self) -> Option<&Arc<PageCachePool>> {
        self.pool.get()
    }

    /// Mark the in-memory state newer than the filesystem's
    pub fn mark_dirty(&self) {
        self.flags.lock().insert(VnFlags::DIRTY);
    }

    pub fn clear_dirty(&self) {
        self.flags.lock().remove(VnFlags::DIRTY);
    }

    /// Condemn the v-node: the last reference removes the object
    pub fn mark_delete(&self) {
        self.flags.lock().insert(VnFlags::DELETE);
    }

    pub fn unmark_delete(&self) {
        self.flags.lock().remove(VnFlags::DELETE);
    }

    pub(crate) fn waiters(&self) -> &WaitQueue {
        &self.waiters
    }
}

impl std::fmt::Debug for Vnode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Vnode")
            .field("id", &self.id)
            .field("flags", &self.flags())
            .field("refs", &self.refs.read())
            .finish_non_exhaustive()
    }
}

// ============================================================================
// Lookup and Lifecycle
// ============================================================================

/// Look a v-node up by (mount, id), taking a counted reference.
///
/// A miss loads the node through the filesystem's `getvnode`; a load
/// failure removes the placeholder and surfaces `NotFound`. An unknown
/// mount id is `InvalidArgument`.
pub fn vnode_get(mntid: MountId, vnid: VnodeId) -> Result<Arc<Vnode>> {
    let mnt = mount_get(mntid)
        .map_err(|_| VfsError::InvalidArgument(format!("mount {mntid}")))?;
    let result = find_vnode(&mnt, vnid);
    mount_put(&mnt);
    result
}

fn find_vnode(mnt: &Arc<Mount>, vnid: VnodeId) -> Result<Arc<Vnode>> {
    loop {
        let mut map = mnt.vnodes().lock();

        if let Some(v) = map.get(&vnid).cloned() {
            if !v.flags().contains(VnFlags::BUSY) {
                if v.ref_inc() {
                    return Ok(v);
                }
                // Raced against the final drop; the entry is about to
                // disappear. Re-examine the map.
                drop(map);
                std::thread::yield_now();
                continue;
            }

            match v.waiters().wait(&mut map) {
                WakeReason::Released | WakeReason::Destroyed => continue,
                WakeReason::EventDelivered | WakeReason::LockFail => {
                    return Err(VfsError::Interrupted(
                        "event delivered while waiting for v-node".into(),
                    ))
                }
            }
        }

        if mnt.is_unmounting() {
            return Err(VfsError::Busy(format!(
                "mount {} is unmounting",
                mnt.id()
            )));
        }

        // Miss: publish a BUSY placeholder, then load outside the lock.
        if !mnt.ref_inc() {
            return Err(VfsError::ObjectReleased("mount".into()));
        }
        let v = Vnode::new_placeholder(vnid, mnt.clone());
        map.insert(vnid, v.clone());
        drop(map);

        let loaded = mnt
            .superblock()
            .and_then(|sb| mnt.fs().ops().getvnode(&sb, vnid));

        let mut map = mnt.vnodes().lock();
        match loaded {
            Ok((mode, node)) => {
                *v.mode.lock() = mode;
                *v.fs_node.lock() = Some(node);
                {
                    let mut flags = v.flags.lock();
                    flags.insert(VnFlags::VALID);
                    flags.remove(VnFlags::BUSY);
                }
                v.waiters().wake_all(WakeReason::Released);
                return Ok(v);
            }
            Err(e) => {
                map.remove(&vnid);
                drop(map);

                v.waiters().wake_all(WakeReason::Destroyed);
                *v.mount.lock() = None;
                let _creator_was_last = v.refs.dec_and_test();
                debug_assert!(_creator_was_last);
                mount_put(mnt);

                tracing::debug!(vnid, error = %e, "v-node load failed");
                return Err(VfsError::NotFound(format!("v-node {vnid}: {e}")));
            }
        }
    }
}

/// Drop a v-node reference.
///
/// The last drop removes the node from its mount, dispatches
/// `removevnode` (DELETE set) or `putvnode`, drains the file page-cache
/// pool, and wakes any stale waiters with `Destroyed`.
pub fn vnode_put(v: &Arc<Vnode>) -> Result<()> {
    let Some(mnt) = v.mount() else {
        return Err(VfsError::ObjectReleased("v-node".into()));
    };

    let Some(mut map) = v.refs.dec_and_lock(mnt.vnodes()) else {
        return Ok(());
    };

    let _removed = map.remove(&v.id);
    debug_assert!(_removed.is_some());
    drop(map);

    let delete = v.flags().contains(VnFlags::DELETE);
    let node = v.fs_node.lock().take();
    if let (Ok(sb), Some(node)) = (mnt.superblock(), node) {
        let ops = mnt.fs().ops();
        let disposed = if delete {
            ops.removevnode(&sb, &node)
        } else {
            ops.putvnode(&sb, &node)
        };
        if let Err(e) = disposed {
            tracing::warn!(vnid = v.id, delete, error = %e, "v-node disposal failed");
        }
    }

    if let Some(pool) = v.pool.get() {
        if let Err(e) = pool.shrink(-1) {
            tracing::warn!(vnid = v.id, error = %e, "file pool drain left pages behind");
        }
        pool.ref_dec();
    }

    v.waiters().wake_all(WakeReason::Destroyed);
    *v.mount.lock() = None;
    mount_put(&mnt);
    Ok(())
}

/// Acquire the v-node's BUSY bit, waiting out the current owner.
pub fn vnode_lock(v: &Arc<Vnode>) -> Result<()> {
    let Some(mnt) = v.mount() else {
        return Err(VfsError::ObjectReleased("v-node".into()));
    };

    let mut map = mnt.vnodes().lock();
    loop {
        {
            let mut flags = v.flags.lock();
            if !flags.contains(VnFlags::BUSY) {
                flags.insert(VnFlags::BUSY);
                return Ok(());
            }
        }
        match v.waiters().wait(&mut map) {
            WakeReason::Released => continue,
            WakeReason::Destroyed => {
                return Err(VfsError::NotFound(format!("v-node {}", v.id)))
            }
            WakeReason::EventDelivered | WakeReason::LockFail => {
                return Err(VfsError::Interrupted(
                    "event delivered while locking v-node".into(),
                ))
            }
        }
    }
}

/// Release the v-node's BUSY bit and wake waiters.
pub fn vnode_unlock(v: &Arc<Vnode>) {
    let Some(mnt) = v.mount() else {
        return;
    };

    let _map = mnt.vnodes().lock();
    {
        let mut flags = v.flags.lock();
        debug_assert!(flags.contains(VnFlags::BUSY));
        flags.remove(VnFlags::BUSY);
    }
    v.waiters().wake_all(WakeReason::Released);
}
