// # Mount Table
//
// The process-wide table binding paths to mounted filesystems. Each
// mount owns its v-node cache; the mount id is allocated monotonically
// with wrap-around search, skipping the invalid id and ids in use. The
// final reference drop unlinks the mount from the table under the table
// mutex (`dec_and_lock`), so lookups never hand out a mount that is
// mid-teardown.

use crate::common::{DeviceId, MountId, VnodeId, INVALID_DEVICE_ID, INVALID_MOUNT_ID};
use crate::error::{Result, VfsError};
use crate::sync::RefCount;
use crate::vfs::fs_calls::{fs_get, fs_put, FsContainer, FsFlags, FsPrivate};
use crate::vfs::path::normalize_path;
use crate::vfs::vnode::{vnode_get, vnode_put, Vnode};
use bitflags::bitflags;
use once_cell::sync::{Lazy, OnceCell};
use parking_lot::Mutex;
use std::collections::BTreeMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

bitflags! {
    /// Mount state flags
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct MountFlags: u32 {
        /// Unmount in progress; no new v-nodes may be inserted
        const UNMOUNTING = 1 << 0;
    }
}

/// One mounted filesystem
pub struct Mount {
    id: AtomicU64,
    path: String,
    devid: DeviceId,
    fs: Arc<FsContainer>,
    sb: OnceCell<FsPrivate>,
    root_vnid: AtomicU64,
    root: Mutex<Option<Arc<Vnode>>>,
    flags: Mutex<MountFlags>,
    vnodes: Mutex<BTreeMap<VnodeId, Arc<Vnode>>>,
    refs: RefCount,
}

impl Mount {
    #[inline]
    pub fn id(&self) -> MountId {
        self.id.load(Ordering::Acquire)
    }

    /// Normalized mount point path
    #[inline]
    pub fn path(&self) -> &str {
        &self.path
    }

    #[inline]
    pub fn devid(&self) -> DeviceId {
        self.devid
    }

    #[inline]
    pub fn fs(&self) -> &Arc<FsContainer> {
        &self.fs
    }

    /// Superblock private returned by the filesystem's mount operation
    pub fn superblock(&self) -> Result<FsPrivate> {
        self.sb
            .get()
            .cloned()
            .ok_or_else(|| VfsError::ObjectReleased("mount superblock".into()))
    }

    /// Root v-node id of the mounted filesystem
    pub fn root_vnid(&self) -> VnodeId {
        self.root_vnid.load(Ordering::Acquire)
    }

    /// Counted reference to the root v-node
    pub fn root_vnode(&self) -> Result<Arc<Vnode>> {
        let root = self.root.lock().clone();
        let root = root.ok_or_else(|| VfsError::NoDevice("mount has no root".into()))?;
        if !root.ref_inc() {
            return Err(VfsError::ObjectReleased("root v-node".into()));
        }
        Ok(root)
    }

    pub fn is_unmounting(&self) -> bool {
        self.flags.lock().contains(MountFlags::UNMOUNTING)
    }

    /// The v-node cache; also the mutex v-node waiters pair with
    pub(crate) fn vnodes(&self) -> &Mutex<BTreeMap<VnodeId, Arc<Vnode>>> {
        &self.vnodes
    }

    /// Number of cached v-nodes
    pub fn cached_vnodes(&self) -> usize {
        self.vnodes.lock().len()
    }

    #[inline]
    pub fn ref_inc(&self) -> bool {
        self.refs.inc_if_valid()
    }

    /// Drop a reference; the last one unlinks the mount from the table
    /// and releases the filesystem container.
    pub fn ref_dec(&self) -> bool {
        let Some(mut table) = self.refs.dec_and_lock(&MOUNT_TABLE.inner) else {
            return false;
        };

        let id = self.id();
        if id != INVALID_MOUNT_ID {
            table.mounts.remove(&id);
            if table.last_id == id {
                table.last_id = id.wrapping_sub(1);
            }
            self.id.store(INVALID_MOUNT_ID, Ordering::Release);
        }
        drop(table);

        debug_assert!(self.vnodes.lock().is_empty());
        fs_put(&self.fs);
        true
    }

    #[inline]
    pub fn ref_count(&self) -> u64 {
        self.refs.read()
    }
}

impl std::fmt::Debug for Mount {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Mount")
            .field("id", &self.id())
            .field("path", &self.path)
            .field("fs", &self.fs.name())
            .field("refs", &self.refs.read())
            .finish_non_exhaustive()
    }
}

// ============================================================================
// Mount Table
// ============================================================================

struct MntTblInner {
    mounts: BTreeMap<MountId, Arc<Mount>>,
    last_id: MountId,
}

struct MountTable {
    inner: Mutex<MntTblInner>,
}

static MOUNT_TABLE: Lazy<MountTable> = Lazy::new(|| MountTable {
    inner: Mutex::new(MntTblInner {
        mounts: BTreeMap::new(),
        last_id: INVALID_MOUNT_ID,
    }),
});

fn alloc_mount_id(inner: &MntTblInner) -> Result<MountId> {
    let start = inner.last_id.wrapping_add(1);
    let mut candidate = start;
    loop {
        if candidate != INVALID_MOUNT_ID && !inner.mounts.contains_key(&candidate) {
            return Ok(candidate);
        }
        candidate = candidate.wrapping_add(1);
        if candidate == start {
            return Err(VfsError::NoSpace("mount ids exhausted".into()));
        }
    }
}

/// Look a mount up by id, taking a counted reference
pub fn mount_get(mntid: MountId) -> Result<Arc<Mount>> {
    let table = MOUNT_TABLE.inner.lock();
    let mnt = table
        .mounts
        .get(&mntid)
        .ok_or_else(|| VfsError::NotFound(format!("mount {mntid}")))?;
    if !mnt.ref_inc() {
        return Err(VfsError::ObjectReleased(format!("mount {mntid}")));
    }
    Ok(mnt.clone())
}

/// Return a reference taken with [`mount_get`] (or held on a path
/// lookup result)
pub fn mount_put(mnt: &Arc<Mount>) {
    mnt.ref_dec();
}

/// Find the mount whose mount point is exactly `path`
pub fn mount_lookup_by_path(path: &str) -> Option<Arc<Mount>> {
    let normalized = normalize_path(path).ok()?;
    let table = MOUNT_TABLE.inner.lock();
    for mnt in table.mounts.values() {
        if mnt.path() == normalized && mnt.ref_inc() {
            return Some(mnt.clone());
        }
    }
    None
}

/// Number of live mounts
pub fn mount_count() -> usize {
    MOUNT_TABLE.inner.lock().mounts.len()
}

/// Counted reference to the system root v-node (the root of the mount
/// at "/")
pub fn system_root_vnode() -> Result<Arc<Vnode>> {
    let mnt = mount_lookup_by_path("/")
        .ok_or_else(|| VfsError::NoDevice("no filesystem mounted at /".into()))?;
    let root = mnt.root_vnode();
    mount_put(&mnt);
    root
}

// ============================================================================
// Mount / Unmount
// ============================================================================

fn alloc_new_fsmount(path: String, fs: Arc<FsContainer>, devid: DeviceId) -> Arc<Mount> {
    Arc::new(Mount {
        id: AtomicU64::new(INVALID_MOUNT_ID),
        path,
        devid,
        fs,
        sb: OnceCell::new(),
        root_vnid: AtomicU64::new(0),
        root: Mutex::new(None),
        flags: Mutex::new(MountFlags::empty()),
        vnodes: Mutex::new(BTreeMap::new()),
        refs: RefCount::new(1),
    })
}

fn mount_with_fs(
    path: &str,
    fs: Arc<FsContainer>,
    devid: DeviceId,
    args: Option<&str>,
) -> Result<MountId> {
    let (sb, root_vnid) = match fs.ops().mount(devid, args) {
        Ok(ok) => ok,
        Err(e) => {
            fs_put(&fs);
            return Err(e);
        }
    };

    let mnt = alloc_new_fsmount(path.to_string(), fs, devid);
    let _sb_set = mnt.sb.set(sb);
    debug_assert!(_sb_set.is_ok());
    mnt.root_vnid.store(root_vnid, Ordering::Release);

    // Publish in the table so vnode_get can find the mount.
    let id = {
        let mut table = MOUNT_TABLE.inner.lock();
        match alloc_mount_id(&table) {
            Ok(id) => {
                mnt.id.store(id, Ordering::Release);
                table.mounts.insert(id, mnt.clone());
                table.last_id = id;
                id
            }
            Err(e) => {
                drop(table);
                if let Ok(sb) = mnt.superblock() {
                    let _ = mnt.fs().ops().unmount(&sb);
                }
                mnt.ref_dec();
                return Err(e);
            }
        }
    };

    match vnode_get(id, root_vnid) {
        Ok(root) => {
            *mnt.root.lock() = Some(root);
            tracing::info!(path, id, fs = mnt.fs().name(), "mounted");
            Ok(id)
        }
        Err(e) => {
            tracing::warn!(path, error = %e, "root v-node load failed; backing out mount");
            if let Ok(sb) = mnt.superblock() {
                let _ = mnt.fs().ops().unmount(&sb);
            }
            // Drop the creation reference; teardown unlinks from the table.
            mnt.ref_dec();
            Err(e)
        }
    }
}

/// Mount a filesystem at `path`.
///
/// With `fs_name` given, only that filesystem is tried; otherwise every
/// registered non-pseudo filesystem is offered the device in turn, and
/// `NotFound` is returned when none accepts it. The path must be
/// absolute, must not already be a mount point (`Busy`), and -- except
/// for the first mount -- must resolve to a directory (`NotADirectory`).
pub fn mount(
    path: &str,
    fs_name: Option<&str>,
    devid: DeviceId,
    args: Option<&str>,
) -> Result<MountId> {
    let normalized = normalize_path(path)?;

    if mount_count() > 0 {
        if let Some(existing) = mount_lookup_by_path(&normalized) {
            mount_put(&existing);
            return Err(VfsError::Busy(format!("{normalized} is already a mount point")));
        }
        let dir = crate::vfs::path::lookup_absolute(&normalized)?;
        let is_dir = dir.is_dir();
        vnode_put(&dir)?;
        if !is_dir {
            return Err(VfsError::NotADirectory(normalized));
        }
    } else if normalized != "/" {
        return Err(VfsError::NoDevice(
            "no root filesystem; mount / first".into(),
        ));
    }

    match fs_name {
        Some(name) => {
            let fs = fs_get(name)?;
            mount_with_fs(&normalized, fs, devid, args)
        }
        None => {
            if devid == INVALID_DEVICE_ID {
                return Err(VfsError::InvalidArgument(
                    "mounting without a filesystem name needs a device".into(),
                ));
            }
            for (name, flags) in crate::vfs::fs_calls::registered_filesystems() {
                if flags.contains(FsFlags::PSEUDO) {
                    continue;
                }
                let Ok(fs) = fs_get(&name) else { continue };
                match mount_with_fs(&normalized, fs, devid, args) {
                    Ok(id) => return Ok(id),
                    Err(e) => {
                        tracing::debug!(fs = %name, error = %e, "filesystem declined device");
                    }
                }
            }
            Err(VfsError::NotFound(format!(
                "no filesystem could mount device {devid:#x}"
            )))
        }
    }
}

/// Unmount the filesystem at `path`.
///
/// Fails with `Busy` while any v-node beyond the mount's own root
/// reference is externally referenced (open files keep their v-nodes
/// referenced). On success the filesystem's `sync` and `unmount` run and
/// the mount leaves the table.
pub fn unmount(path: &str) -> Result<()> {
    let normalized = normalize_path(path)?;
    let mnt = mount_lookup_by_path(&normalized)
        .ok_or_else(|| VfsError::NotFound(format!("{normalized} is not a mount point")))?;

    mnt.flags.lock().insert(MountFlags::UNMOUNTING);

    let busy = {
        let map = mnt.vnodes().lock();
        let root_vnid = mnt.root_vnid();
        map.iter().any(|(vnid, v)| {
            if *vnid == root_vnid {
                v.ref_count() > 1
            } else {
                true
            }
        })
    };
    if busy {
        mnt.flags.lock().remove(MountFlags::UNMOUNTING);
        mount_put(&mnt);
        return Err(VfsError::Busy(format!("{normalized} has referenced v-nodes")));
    }

    if let Ok(sb) = mnt.superblock() {
        if let Err(e) = mnt.fs().ops().sync(&sb) {
            tracing::warn!(path = %normalized, error = %e, "sync before unmount failed");
        }
    }

    // Drop the mount's own root reference; the root v-node leaves the
    // cache and dispatches putvnode.
    let root = mnt.root.lock().take();
    if let Some(root) = root {
        vnode_put(&root)?;
    }

    if let Ok(sb) = mnt.superblock() {
        if let Err(e) = mnt.fs().ops().unmount(&sb) {
            tracing::warn!(path = %normalized, error = %e, "filesystem unmount hook failed");
        }
    }

    tracing::info!(path = %normalized, "unmounted");

    mount_put(&mnt); // lookup reference
    mnt.ref_dec(); // creation reference; unlinks from the table
    Ok(())
}

/// Flush every mount: filesystem sync plus file-pool write-back
pub fn sync_all() -> Result<()> {
    let mounts: Vec<Arc<Mount>> = {
        let table = MOUNT_TABLE.inner.lock();
        table
            .mounts
            .values()
            .filter(|m| m.ref_inc())
            .cloned()
            .collect()
    };

    let mut first_err = None;
    for mnt in &mounts {
        if let Ok(sb) = mnt.superblock() {
            if let Err(e) = mnt.fs().ops().sync(&sb) {
                tracing::warn!(path = mnt.path(), error = %e, "sync failed");
                if first_err.is_none() {
                    first_err = Some(e);
                }
            }
        }
        mount_put(mnt);
    }

    match first_err {
        Some(e) => Err(e),
        None => Ok(()),
    }
}
