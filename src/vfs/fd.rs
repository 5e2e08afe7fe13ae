// # File Descriptors and I/O Contexts
//
// A file descriptor record binds a v-node, a byte position, the open
// mode, and the filesystem's per-open private state; one record may be
// shared by several descriptor numbers (dup) and by a forked child's
// table. The per-process I/O context holds the descriptor slot array,
// an allocation bitmap (bit i set iff slot i is occupied), and the root
// and current-directory v-nodes.
//
// Slot allocation scans the bitmap a 32-bit word at a time and only
// then bit-by-bit within the first word that has room.

use crate::common::{StorageConfig, DEFAULT_FD_TABLE_SIZE, MAX_FD_TABLE_SIZE};
use crate::error::{Result, VfsError};
use crate::sync::RefCount;
use crate::vfs::fs_calls::{FdPrivate, OpenMode};
use crate::vfs::mount::system_root_vnode;
use crate::vfs::path::lookup_absolute;
use crate::vfs::vnode::{vnode_put, Vnode};
use bitflags::bitflags;
use parking_lot::Mutex;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

bitflags! {
    /// Per-descriptor flags
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct FdFlags: u32 {
        /// Do not copy this descriptor across an exec-style clone
        const CLOEXEC = 1 << 0;
    }
}

/// One open file
pub struct FileDescriptor {
    vnode: Arc<Vnode>,
    pos: AtomicU64,
    omode: OpenMode,
    flags: Mutex<FdFlags>,
    private: Mutex<FdPrivate>,
    refs: RefCount,
}

impl FileDescriptor {
    fn new(vnode: Arc<Vnode>, omode: OpenMode, private: FdPrivate) -> Arc<Self> {
        let mut flags = FdFlags::empty();
        if omode.contains(OpenMode::CLOEXEC) {
            flags.insert(FdFlags::CLOEXEC);
        }
        Arc::new(Self {
            vnode,
            pos: AtomicU64::new(0),
            omode,
            flags: Mutex::new(flags),
            private: Mutex::new(private),
            refs: RefCount::new(1),
        })
    }

    /// The v-node this descriptor references
    #[inline]
    pub fn vnode(&self) -> &Arc<Vnode> {
        &self.vnode
    }

    /// Current byte position
    #[inline]
    pub fn pos(&self) -> u64 {
        self.pos.load(Ordering::Acquire)
    }

    #[inline]
    pub fn set_pos(&self, pos: u64) {
        self.pos.store(pos, Ordering::Release);
    }

    #[inline]
    pub fn omode(&self) -> OpenMode {
        self.omode
    }

    pub fn flags(&self) -> FdFlags {
        *self.flags.lock()
    }

    pub fn is_cloexec(&self) -> bool {
        self.flags().contains(FdFlags::CLOEXEC)
    }

    /// Per-open filesystem private state
    pub fn private(&self) -> FdPrivate {
        self.private.lock().clone()
    }

    #[inline]
    pub fn ref_inc(&self) -> bool {
        self.refs.inc_if_valid()
    }

    /// Drop a reference; the last one dispatches the filesystem's
    /// `close` and `release_fd` hooks and releases the v-node.
    pub fn ref_dec(&self) -> bool {
        let last = self.refs.dec_and_test();
        if last {
            if let Some(mnt) = self.vnode.mount() {
                if let (Ok(sb), Some(node)) = (mnt.superblock(), self.vnode.fs_node()) {
                    let fd_priv = self.private.lock().clone();
                    let ops = mnt.fs().ops();
                    if let Err(e) = ops.close(&sb, &node, &fd_priv) {
                        tracing::warn!(vnid = self.vnode.id(), error = %e, "close hook failed");
                    }
                    if let Err(e) = ops.release_fd(&sb, &node, &fd_priv) {
                        tracing::warn!(vnid = self.vnode.id(), error = %e, "release_fd hook failed");
                    }
                }
            }
            if let Err(e) = vnode_put(&self.vnode) {
                tracing::warn!(error = %e, "v-node release from descriptor failed");
            }
        }
        last
    }

    #[inline]
    pub fn ref_count(&self) -> u64 {
        self.refs.read()
    }
}

impl std::fmt::Debug for FileDescriptor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("FileDescriptor")
            .field("vnid", &self.vnode.id())
            .field("pos", &self.pos())
            .field("omode", &self.omode)
            .field("refs", &self.refs.read())
            .finish()
    }
}

// ============================================================================
// I/O Context
// ============================================================================

struct IoCtxInner {
    root: Arc<Vnode>,
    cwd: Arc<Vnode>,
    cwd_path: String,
    bitmap: Vec<u32>,
    fds: Vec<Option<Arc<FileDescriptor>>>,
}

impl IoCtxInner {
    fn bitmap_words(table_size: usize) -> usize {
        table_size.div_ceil(32)
    }

    fn set_bit(&mut self, slot: usize) {
        self.bitmap[slot / 32] |= 1 << (slot % 32);
    }

    fn clear_bit(&mut self, slot: usize) {
        self.bitmap[slot / 32] &= !(1 << (slot % 32));
    }

    fn bit_is_set(&self, slot: usize) -> bool {
        (self.bitmap[slot / 32] >> (slot % 32)) & 1 == 1
    }

    /// First free slot: whole words first, then the first clear bit
    fn find_free_slot(&self) -> Option<usize> {
        for (word_idx, word) in self.bitmap.iter().enumerate() {
            if *word == u32::MAX {
                continue;
            }
            let slot = word_idx * 32 + word.trailing_ones() as usize;
            if slot < self.fds.len() {
                return Some(slot);
            }
            return None;
        }
        None
    }
}

/// Per-process descriptor table plus root and current directory
pub struct IoContext {
    inner: Mutex<IoCtxInner>,
}

impl IoContext {
    /// Create an I/O context.
    ///
    /// With a parent, fork semantics apply: the table size is inherited,
    /// root and cwd are shared (reference bumped), and every descriptor
    /// without close-on-exec is copied with its reference count raised.
    /// Without a parent, root and cwd come from the system root v-node.
    pub fn new(parent: Option<&Arc<IoContext>>) -> Result<Arc<IoContext>> {
        match parent {
            Some(parent) => {
                let parent_inner = parent.inner.lock();
                let table_size = parent_inner.fds.len();

                if !parent_inner.root.ref_inc() {
                    return Err(VfsError::ObjectReleased("root v-node".into()));
                }
                if !parent_inner.cwd.ref_inc() {
                    let _ = vnode_put(&parent_inner.root);
                    return Err(VfsError::ObjectReleased("cwd v-node".into()));
                }

                let mut inner = IoCtxInner {
                    root: parent_inner.root.clone(),
                    cwd: parent_inner.cwd.clone(),
                    cwd_path: parent_inner.cwd_path.clone(),
                    bitmap: vec![0u32; IoCtxInner::bitmap_words(table_size)],
                    fds: vec![None; table_size],
                };

                for (slot, fd) in parent_inner.fds.iter().enumerate() {
                    if let Some(fd) = fd {
                        if fd.is_cloexec() {
                            continue;
                        }
                        if fd.ref_inc() {
                            inner.fds[slot] = Some(fd.clone());
                            inner.set_bit(slot);
                        }
                    }
                }

                Ok(Arc::new(IoContext {
                    inner: Mutex::new(inner),
                }))
            }
            None => Self::new_parentless(DEFAULT_FD_TABLE_SIZE),
        }
    }

    /// Create a parentless context sized from `config`
    pub fn with_config(config: &StorageConfig) -> Result<Arc<IoContext>> {
        if config.fd_table_size == 0 || config.fd_table_size > config.max_fd_table_size {
            return Err(VfsError::InvalidArgument(format!(
                "descriptor table size {} out of range",
                config.fd_table_size
            )));
        }
        Self::new_parentless(config.fd_table_size)
    }

    fn new_parentless(table_size: usize) -> Result<Arc<IoContext>> {
        let root = system_root_vnode()?;
        let cwd = match system_root_vnode() {
            Ok(cwd) => cwd,
            Err(e) => {
                let _ = vnode_put(&root);
                return Err(e);
            }
        };

        Ok(Arc::new(IoContext {
            inner: Mutex::new(IoCtxInner {
                root,
                cwd,
                cwd_path: "/".to_string(),
                bitmap: vec![0u32; IoCtxInner::bitmap_words(table_size)],
                fds: vec![None; table_size],
            }),
        }))
    }

    /// Current descriptor table size in slots
    pub fn table_size(&self) -> usize {
        self.inner.lock().fds.len()
    }

    /// Number of occupied slots
    pub fn open_count(&self) -> usize {
        self.inner.lock().fds.iter().filter(|f| f.is_some()).count()
    }

    /// Counted reference to the context's root v-node
    pub fn root(&self) -> Result<Arc<Vnode>> {
        let inner = self.inner.lock();
        if !inner.root.ref_inc() {
            return Err(VfsError::ObjectReleased("root v-node".into()));
        }
        Ok(inner.root.clone())
    }

    /// Counted reference to the current directory v-node
    pub fn cwd(&self) -> Result<Arc<Vnode>> {
        let inner = self.inner.lock();
        if !inner.cwd.ref_inc() {
            return Err(VfsError::ObjectReleased("cwd v-node".into()));
        }
        Ok(inner.cwd.clone())
    }

    /// Absolute path of the current directory
    pub fn cwd_path(&self) -> String {
        self.inner.lock().cwd_path.clone()
    }

    /// Change the current directory to `path` (absolute)
    pub fn set_cwd(&self, path: &str) -> Result<()> {
        let target = lookup_absolute(path)?;
        if !target.is_dir() {
            let name = path.to_string();
            vnode_put(&target)?;
            return Err(VfsError::NotADirectory(name));
        }

        let old = {
            let mut inner = self.inner.lock();
            let old = std::mem::replace(&mut inner.cwd, target);
            inner.cwd_path = crate::vfs::path::normalize_path(path)?;
            old
        };
        vnode_put(&old)
    }

    /// Debug invariant: bit i is set iff slot i holds a descriptor
    pub fn bitmap_matches_slots(&self) -> bool {
        let inner = self.inner.lock();
        inner
            .fds
            .iter()
            .enumerate()
            .all(|(slot, fd)| inner.bit_is_set(slot) == fd.is_some())
    }
}

impl Drop for IoContext {
    fn drop(&mut self) {
        let inner = self.inner.get_mut();
        for fd in inner.fds.iter().flatten() {
            fd.ref_dec();
        }
        if let Err(e) = vnode_put(&inner.root) {
            tracing::warn!(error = %e, "root release on context teardown failed");
        }
        if let Err(e) = vnode_put(&inner.cwd) {
            tracing::warn!(error = %e, "cwd release on context teardown failed");
        }
    }
}

// ============================================================================
// Descriptor Operations
// ============================================================================

/// Open `vnode` into `ioctx`, returning the descriptor number and a
/// borrowed record.
///
/// Opening a directory for writing fails with `PermissionDenied`; a full
/// table fails with `NoSpace`. The filesystem's `open` hook runs before
/// the slot is installed, so a failed open leaves the table untouched.
pub fn fd_alloc(
    ioctx: &Arc<IoContext>,
    vnode: &Arc<Vnode>,
    omode: OpenMode,
) -> Result<(usize, Arc<FileDescriptor>)> {
    if vnode.is_dir() && omode.contains(OpenMode::WRITE) {
        return Err(VfsError::PermissionDenied(
            "directories cannot be opened for writing".into(),
        ));
    }

    let mnt = vnode
        .mount()
        .ok_or_else(|| VfsError::ObjectReleased("v-node".into()))?;
    let sb = mnt.superblock()?;
    let node = vnode
        .fs_node()
        .ok_or_else(|| VfsError::ObjectReleased("v-node private".into()))?;

    let fd_priv = mnt.fs().ops().open(&sb, &node, omode)?;

    if !vnode.ref_inc() {
        return Err(VfsError::ObjectReleased("v-node".into()));
    }
    let fd = FileDescriptor::new(vnode.clone(), omode, fd_priv);

    let slot = {
        let mut inner = ioctx.inner.lock();
        match inner.find_free_slot() {
            Some(slot) => {
                debug_assert!(inner.fds[slot].is_none());
                inner.set_bit(slot);
                inner.fds[slot] = Some(fd.clone());
                slot
            }
            None => {
                drop(inner);
                fd.ref_dec();
                return Err(VfsError::NoSpace("descriptor table is full".into()));
            }
        }
    };

    Ok((slot, fd))
}

/// Take a counted reference on the descriptor in slot `fd`
pub fn fd_get(ioctx: &Arc<IoContext>, fd: usize) -> Result<Arc<FileDescriptor>> {
    let inner = ioctx.inner.lock();
    let record = inner
        .fds
        .get(fd)
        .and_then(|f| f.clone())
        .ok_or_else(|| VfsError::BadDescriptor(format!("fd {fd}")))?;
    if !record.ref_inc() {
        return Err(VfsError::BadDescriptor(format!("fd {fd} is closing")));
    }
    Ok(record)
}

/// Drop a reference taken with [`fd_get`]
pub fn fd_put(fd: &Arc<FileDescriptor>) {
    fd.ref_dec();
}

/// Remove slot `fd` from the context, dropping the table's reference
pub fn fd_del(ioctx: &Arc<IoContext>, fd: usize) -> Result<()> {
    let record = {
        let mut inner = ioctx.inner.lock();
        let record = inner
            .fds
            .get_mut(fd)
            .and_then(Option::take)
            .ok_or_else(|| VfsError::BadDescriptor(format!("fd {fd}")))?;
        debug_assert!(inner.bit_is_set(fd));
        inner.clear_bit(fd);
        record
    };
    record.ref_dec();
    Ok(())
}

/// Duplicate descriptor `fd` into the first free slot.
///
/// Both slots share one descriptor record: position and per-open state
/// are common, as after a POSIX `dup`.
pub fn fd_dup(ioctx: &Arc<IoContext>, fd: usize) -> Result<usize> {
    let record = fd_get(ioctx, fd)?;

    let mut inner = ioctx.inner.lock();
    match inner.find_free_slot() {
        Some(slot) => {
            debug_assert!(inner.fds[slot].is_none());
            inner.set_bit(slot);
            // The reference taken by fd_get becomes the table's.
            inner.fds[slot] = Some(record);
            Ok(slot)
        }
        None => {
            drop(inner);
            record.ref_dec();
            Err(VfsError::NoSpace("descriptor table is full".into()))
        }
    }
}

/// Resize the descriptor table.
///
/// Growing preserves everything; shrinking below an occupied slot fails
/// with `Busy`. Sizes of zero or above the table ceiling fail with
/// `InvalidArgument`.
pub fn resize_fd_table(ioctx: &Arc<IoContext>, new_size: usize) -> Result<()> {
    if new_size == 0 || new_size > MAX_FD_TABLE_SIZE {
        return Err(VfsError::InvalidArgument(format!(
            "table size {new_size} out of range (1..={MAX_FD_TABLE_SIZE})"
        )));
    }

    let mut inner = ioctx.inner.lock();
    if new_size < inner.fds.len() {
        for slot in new_size..inner.fds.len() {
            if inner.fds[slot].is_some() {
                return Err(VfsError::Busy(format!(
                    "slot {slot} is in use; cannot shrink to {new_size}"
                )));
            }
        }
    }

    inner.fds.resize(new_size, None);
    let mut bitmap = vec![0u32; IoCtxInner::bitmap_words(new_size)];
    for (slot, fd) in inner.fds.iter().enumerate() {
        if fd.is_some() {
            bitmap[slot / 32] |= 1 << (slot % 32);
        }
    }
    inner.bitmap = bitmap;
    Ok(())
}
