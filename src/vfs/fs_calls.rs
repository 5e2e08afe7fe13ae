// # Filesystem Dispatch
//
// The operation vtable a physical filesystem exports to the VFS core,
// and the name-keyed registry binding filesystem names to vtables.
//
// Required operations are required trait methods, so a filesystem that
// compiles satisfies the validity rules the VFS enforces. Optional
// operations carry default implementations returning the documented
// fallback, which is what the core dispatches when a filesystem leaves
// them out.

use crate::bdev::bio::BioEntry;
use crate::common::{DeviceId, VnodeId};
use crate::error::{Result, VfsError};
use crate::sync::RefCount;
use bitflags::bitflags;
use dashmap::DashMap;
use once_cell::sync::Lazy;
use std::any::Any;
use std::sync::Arc;

/// Filesystem-private object handle (superblock, disk inode, per-open
/// state). The VFS never looks inside; it only threads these back into
/// the owning filesystem's operations.
pub type FsPrivate = Arc<dyn Any + Send + Sync>;

/// Per-open private state, if the filesystem keeps any
pub type FdPrivate = Option<Arc<dyn Any + Send + Sync>>;

bitflags! {
    /// V-node mode bits: object type plus permissions
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct VnodeMode: u32 {
        const REG  = 0o100000;
        const DIR  = 0o040000;
        const BLK  = 0o060000;
        const CHR  = 0o020000;
        const FIFO = 0o010000;

        const PERM_MASK = 0o007777;
    }
}

impl VnodeMode {
    const TYPE_MASK: u32 = 0o170000;

    #[inline]
    pub fn is_dir(self) -> bool {
        (self.bits() & Self::TYPE_MASK) == Self::DIR.bits()
    }

    #[inline]
    pub fn is_regular(self) -> bool {
        (self.bits() & Self::TYPE_MASK) == Self::REG.bits()
    }
}

bitflags! {
    /// Flags for opening a file
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct OpenMode: u32 {
        const READ    = 1 << 0;
        const WRITE   = 1 << 1;
        const CREATE  = 1 << 2;
        const TRUNC   = 1 << 3;
        const APPEND  = 1 << 4;
        const CLOEXEC = 1 << 5;
    }
}

/// Seek origin
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SeekWhence {
    Set,
    Current,
    End,
}

/// One directory entry as reported by `getdents`
#[derive(Debug, Clone)]
pub struct DirEntry {
    pub name: String,
    pub vnid: VnodeId,
    pub mode: VnodeMode,
}

/// V-node attributes exchanged by `getattr`/`setattr`
#[derive(Debug, Clone, Default)]
pub struct VnodeAttr {
    pub mode_bits: u32,
    pub size: u64,
    pub nlink: u32,
}

bitflags! {
    /// Which attribute fields a `setattr` applies
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct AttrMask: u32 {
        const MODE = 1 << 0;
        const SIZE = 1 << 1;
    }
}

// ============================================================================
// The fs_calls vtable
// ============================================================================

/// Operations a physical filesystem implements for the VFS core.
///
/// `sb` is the superblock private handle returned by [`mount`]; node
/// handles are the per-v-node privates returned by [`getvnode`].
///
/// [`mount`]: FilesystemOps::mount
/// [`getvnode`]: FilesystemOps::getvnode
pub trait FilesystemOps: Send + Sync {
    /// Mount the filesystem from `devid` (may be the invalid device for
    /// pseudo filesystems). Returns the superblock private and the root
    /// v-node id.
    fn mount(&self, devid: DeviceId, args: Option<&str>) -> Result<(FsPrivate, VnodeId)>;

    /// Unmount; called after the v-node cache has drained
    fn unmount(&self, sb: &FsPrivate) -> Result<()>;

    /// Flush filesystem state to backing storage
    fn sync(&self, sb: &FsPrivate) -> Result<()>;

    /// Resolve `name` inside the directory `dir` to a v-node id
    fn lookup(&self, sb: &FsPrivate, dir: &FsPrivate, name: &str) -> Result<VnodeId>;

    /// Load one v-node, returning its mode and private handle
    fn getvnode(&self, sb: &FsPrivate, vnid: VnodeId) -> Result<(VnodeMode, FsPrivate)>;

    /// Release a v-node that fell out of the cache
    fn putvnode(&self, sb: &FsPrivate, node: &FsPrivate) -> Result<()>;

    /// Release a v-node marked for deletion; defaults to `putvnode`
    fn removevnode(&self, sb: &FsPrivate, node: &FsPrivate) -> Result<()> {
        self.putvnode(sb, node)
    }

    /// Per-open setup; the returned private rides on the descriptor
    fn open(&self, _sb: &FsPrivate, _node: &FsPrivate, _omode: OpenMode) -> Result<FdPrivate> {
        Ok(None)
    }

    /// Per-open teardown, called on the descriptor's last reference
    fn close(&self, _sb: &FsPrivate, _node: &FsPrivate, _fd_priv: &FdPrivate) -> Result<()> {
        Ok(())
    }

    /// Final descriptor release hook
    fn release_fd(&self, _sb: &FsPrivate, _node: &FsPrivate, _fd_priv: &FdPrivate) -> Result<()> {
        Ok(())
    }

    /// Flush one file; a no-op by default (memory filesystems)
    fn fsync(&self, _sb: &FsPrivate, _node: &FsPrivate) -> Result<()> {
        Ok(())
    }

    /// Read from `node` at byte `pos`
    fn read(&self, sb: &FsPrivate, node: &FsPrivate, pos: u64, buf: &mut [u8]) -> Result<usize>;

    /// Write to `node` at byte `pos`
    fn write(&self, sb: &FsPrivate, node: &FsPrivate, pos: u64, buf: &[u8]) -> Result<usize>;

    /// Compute a new file position. The default handles `Set` and
    /// `Current`; `End` needs `getattr` for the size.
    fn seek(
        &self,
        sb: &FsPrivate,
        node: &FsPrivate,
        offset: i64,
        whence: SeekWhence,
        current: u64,
    ) -> Result<u64> {
        let base = match whence {
            SeekWhence::Set => 0i64,
            SeekWhence::Current => current as i64,
            SeekWhence::End => self.getattr(sb, node)?.size as i64,
        };
        let target = base.checked_add(offset).ok_or_else(|| {
            VfsError::OutOfRange("seek position overflows".into())
        })?;
        if target < 0 {
            return Err(VfsError::InvalidArgument("seek before start of file".into()));
        }
        Ok(target as u64)
    }

    /// Device control; no default behaviour exists
    fn ioctl(
        &self,
        _sb: &FsPrivate,
        _node: &FsPrivate,
        _cmd: u32,
        _arg: &mut [u8],
    ) -> Result<i64> {
        Err(VfsError::NotSupported("ioctl".into()))
    }

    /// Create a regular file `name` in directory `dir`
    fn create(
        &self,
        _sb: &FsPrivate,
        _dir: &FsPrivate,
        _name: &str,
        _mode: VnodeMode,
    ) -> Result<VnodeId> {
        Err(VfsError::NotSupported("create".into()))
    }

    /// Remove the file `name` from directory `dir`
    fn unlink(&self, _sb: &FsPrivate, _dir: &FsPrivate, _name: &str) -> Result<()> {
        Err(VfsError::NotSupported("unlink".into()))
    }

    /// Rename an entry across (or within) directories
    fn rename(
        &self,
        _sb: &FsPrivate,
        _from_dir: &FsPrivate,
        _from_name: &str,
        _to_dir: &FsPrivate,
        _to_name: &str,
    ) -> Result<()> {
        Err(VfsError::NotSupported("rename".into()))
    }

    /// Create a directory `name` in `dir`
    fn mkdir(
        &self,
        _sb: &FsPrivate,
        _dir: &FsPrivate,
        _name: &str,
        _mode: VnodeMode,
    ) -> Result<VnodeId> {
        Err(VfsError::NotSupported("mkdir".into()))
    }

    /// Remove the empty directory `name` from `dir`
    fn rmdir(&self, _sb: &FsPrivate, _dir: &FsPrivate, _name: &str) -> Result<()> {
        Err(VfsError::NotSupported("rmdir".into()))
    }

    /// List directory entries starting at `pos`
    fn getdents(&self, _sb: &FsPrivate, _node: &FsPrivate, _pos: u64) -> Result<Vec<DirEntry>> {
        Err(VfsError::NotSupported("getdents".into()))
    }

    /// Report v-node attributes
    fn getattr(&self, _sb: &FsPrivate, _node: &FsPrivate) -> Result<VnodeAttr> {
        Err(VfsError::NotSupported("getattr".into()))
    }

    /// Apply v-node attributes selected by `mask`
    fn setattr(
        &self,
        _sb: &FsPrivate,
        _node: &FsPrivate,
        _attr: &VnodeAttr,
        _mask: AttrMask,
    ) -> Result<()> {
        Err(VfsError::NotSupported("setattr".into()))
    }

    /// Block-device strategy: move one BIO entry between its page and
    /// the device. Only block-device drivers implement this.
    fn strategy(&self, _ent: &BioEntry) -> Result<()> {
        Err(VfsError::NoDevice("no strategy for this filesystem".into()))
    }

    /// Device capacity in bytes, when the driver knows it
    fn device_capacity(&self) -> Option<u64> {
        None
    }
}

// ============================================================================
// Filesystem registry
// ============================================================================

bitflags! {
    /// Filesystem type flags
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct FsFlags: u32 {
        /// Not backed by a block device
        const PSEUDO = 1 << 0;
    }
}

/// Named, reference-counted binding of a filesystem to its vtable
pub struct FsContainer {
    name: String,
    flags: FsFlags,
    ops: Arc<dyn FilesystemOps>,
    refs: RefCount,
}

impl FsContainer {
    #[inline]
    pub fn name(&self) -> &str {
        &self.name
    }

    #[inline]
    pub fn flags(&self) -> FsFlags {
        self.flags
    }

    #[inline]
    pub fn is_pseudo(&self) -> bool {
        self.flags.contains(FsFlags::PSEUDO)
    }

    #[inline]
    pub fn ops(&self) -> &Arc<dyn FilesystemOps> {
        &self.ops
    }

    #[inline]
    pub fn ref_inc(&self) -> bool {
        self.refs.inc_if_valid()
    }

    #[inline]
    pub fn ref_dec(&self) -> bool {
        self.refs.dec_and_test()
    }

    #[inline]
    pub fn ref_count(&self) -> u64 {
        self.refs.read()
    }
}

impl std::fmt::Debug for FsContainer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("FsContainer")
            .field("name", &self.name)
            .field("flags", &self.flags)
            .field("refs", &self.refs.read())
            .finish()
    }
}

static FS_TABLE: Lazy<DashMap<String, Arc<FsContainer>>> = Lazy::new(DashMap::new);

/// Register a filesystem under `name`.
///
/// Fails with `AlreadyExists` when the name is taken and
/// `InvalidArgument` on an empty name.
pub fn register_filesystem(
    name: &str,
    flags: FsFlags,
    ops: Arc<dyn FilesystemOps>,
) -> Result<()> {
    if name.is_empty() {
        return Err(VfsError::InvalidArgument("empty filesystem name".into()));
    }

    let container = Arc::new(FsContainer {
        name: name.to_string(),
        flags,
        ops,
        refs: RefCount::new(1),
    });

    match FS_TABLE.entry(name.to_string()) {
        dashmap::mapref::entry::Entry::Occupied(_) => Err(VfsError::AlreadyExists(format!(
            "filesystem {name:?} already registered"
        ))),
        dashmap::mapref::entry::Entry::Vacant(slot) => {
            slot.insert(container);
            tracing::debug!(name, "filesystem registered");
            Ok(())
        }
    }
}

/// Unregister a filesystem.
///
/// Fails with `NotFound` for an unknown name and `Busy` while mounts
/// still hold the container.
pub fn unregister_filesystem(name: &str) -> Result<()> {
    let entry = FS_TABLE
        .get(name)
        .ok_or_else(|| VfsError::NotFound(format!("filesystem {name:?}")))?;

    if entry.ref_count() > 1 {
        return Err(VfsError::Busy(format!("filesystem {name:?} is in use")));
    }
    drop(entry);

    let (_, container) = FS_TABLE
        .remove(name)
        .ok_or_else(|| VfsError::NotFound(format!("filesystem {name:?}")))?;
    container.ref_dec();
    tracing::debug!(name, "filesystem unregistered");
    Ok(())
}

/// Look a filesystem up by name, taking a reference on the container
pub fn fs_get(name: &str) -> Result<Arc<FsContainer>> {
    let entry = FS_TABLE
        .get(name)
        .ok_or_else(|| VfsError::NotFound(format!("filesystem {name:?}")))?;
    let container = entry.value().clone();
    drop(entry);
    if !container.ref_inc() {
        return Err(VfsError::ObjectReleased(format!("filesystem {name:?}")));
    }
    Ok(container)
}

/// Return a reference taken with [`fs_get`]
pub fn fs_put(container: &Arc<FsContainer>) {
    container.ref_dec();
}

/// Names of all registered filesystems, pseudo or not
pub fn registered_filesystems() -> Vec<(String, FsFlags)> {
    FS_TABLE
        .iter()
        .map(|e| (e.key().clone(), e.value().flags()))
        .collect()
}

// ============================================================================
// Tests
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;

    struct NullFs;

    impl FilesystemOps for NullFs {
        fn mount(&self, _devid: DeviceId, _args: Option<&str>) -> Result<(FsPrivate, VnodeId)> {
            Ok((Arc::new(()), 1))
        }
        fn unmount(&self, _sb: &FsPrivate) -> Result<()> {
            Ok(())
        }
        fn sync(&self, _sb: &FsPrivate) -> Result<()> {
            Ok(())
        }
        fn lookup(&self, _sb: &FsPrivate, _dir: &FsPrivate, _name: &str) -> Result<VnodeId> {
            Err(VfsError::NotFound("nullfs has no entries".into()))
        }
        fn getvnode(&self, _sb: &FsPrivate, _vnid: VnodeId) -> Result<(VnodeMode, FsPrivate)> {
            Ok((VnodeMode::DIR, Arc::new(())))
        }
        fn putvnode(&self, _sb: &FsPrivate, _node: &FsPrivate) -> Result<()> {
            Ok(())
        }
        fn read(
            &self,
            _sb: &FsPrivate,
            _node: &FsPrivate,
            _pos: u64,
            _buf: &mut [u8],
        ) -> Result<usize> {
            Ok(0)
        }
        fn write(
            &self,
            _sb: &FsPrivate,
            _node: &FsPrivate,
            _pos: u64,
            _buf: &[u8],
        ) -> Result<usize> {
            Ok(0)
        }
    }

    #[test]
    fn test_register_unregister_round_trip() {
        register_filesystem("nullfs-rt", FsFlags::PSEUDO, Arc::new(NullFs)).unwrap();
        assert!(matches!(
            register_filesystem("nullfs-rt", FsFlags::PSEUDO, Arc::new(NullFs)),
            Err(VfsError::AlreadyExists(_))
        ));

        unregister_filesystem("nullfs-rt").unwrap();
        assert!(matches!(
            unregister_filesystem("nullfs-rt"),
            Err(VfsError::NotFound(_))
        ));
    }

    #[test]
    fn test_unregister_refuses_while_referenced() {
        register_filesystem("nullfs-busy", FsFlags::PSEUDO, Arc::new(NullFs)).unwrap();
        let held = fs_get("nullfs-busy").unwrap();

        assert!(matches!(
            unregister_filesystem("nullfs-busy"),
            Err(VfsError::Busy(_))
        ));

        fs_put(&held);
        unregister_filesystem("nullfs-busy").unwrap();
    }

    #[test]
    fn test_optional_ops_have_documented_defaults() {
        let fs = NullFs;
        let sb: FsPrivate = Arc::new(());
        let node: FsPrivate = Arc::new(());

        assert!(matches!(
            fs.ioctl(&sb, &node, 0, &mut []),
            Err(VfsError::NotSupported(_))
        ));
        assert!(fs.fsync(&sb, &node).is_ok());
        assert!(fs.open(&sb, &node, OpenMode::READ).unwrap().is_none());
        assert!(fs.device_capacity().is_none());
    }

    #[test]
    fn test_mode_type_predicates() {
        let dir = VnodeMode::DIR | VnodeMode::from_bits_retain(0o755);
        assert!(dir.is_dir());
        assert!(!dir.is_regular());

        let reg = VnodeMode::REG | VnodeMode::from_bits_retain(0o644);
        assert!(reg.is_regular());
    }
}
