// # File Operations
//
// The call surface a process uses: open/close/read/write and friends,
// resolved through the I/O context to a v-node and dispatched into the
// owning filesystem's operations. Optional filesystem operations that
// are absent surface their documented defaults from the vtable layer.

use crate::error::{Result, VfsError};
use crate::vfs::fd::{fd_alloc, fd_del, fd_get, fd_put, FileDescriptor, IoContext};
use crate::vfs::fs_calls::{
    AttrMask, DirEntry, FsPrivate, OpenMode, SeekWhence, VnodeAttr, VnodeMode,
};
use crate::vfs::mount::Mount;
use crate::vfs::path::{join_path, lookup_absolute, lookup_parent, normalize_path};
use crate::vfs::vnode::{vnode_get, vnode_put, Vnode};
use std::sync::Arc;

/// Resolve `path` against the context's current directory
fn resolve_path(ioctx: &Arc<IoContext>, path: &str) -> Result<String> {
    normalize_path(&join_path(&ioctx.cwd_path(), path))
}

fn vnode_dispatch_parts(v: &Arc<Vnode>) -> Result<(Arc<Mount>, FsPrivate, FsPrivate)> {
    let mnt = v
        .mount()
        .ok_or_else(|| VfsError::ObjectReleased("v-node".into()))?;
    let sb = mnt.superblock()?;
    let node = v
        .fs_node()
        .ok_or_else(|| VfsError::ObjectReleased("v-node private".into()))?;
    Ok((mnt, sb, node))
}

fn fd_dispatch_parts(f: &Arc<FileDescriptor>) -> Result<(Arc<Mount>, FsPrivate, FsPrivate)> {
    vnode_dispatch_parts(f.vnode())
}

// ============================================================================
// Open / Close
// ============================================================================

/// Open `path`, returning a descriptor number.
///
/// `CREATE` makes a missing regular file with `create_mode` permission
/// bits; `TRUNC` on a writable open truncates an existing file.
pub fn vfs_open(
    ioctx: &Arc<IoContext>,
    path: &str,
    omode: OpenMode,
    create_mode: VnodeMode,
) -> Result<usize> {
    let abs = resolve_path(ioctx, path)?;

    let v = match lookup_absolute(&abs) {
        Ok(v) => v,
        Err(VfsError::NotFound(_)) if omode.contains(OpenMode::CREATE) => {
            let (dir, name) = lookup_parent(&abs)?;
            let created = (|| {
                let (mnt, sb, dir_node) = vnode_dispatch_parts(&dir)?;
                let mode = VnodeMode::REG | (create_mode & VnodeMode::PERM_MASK);
                let vnid = mnt.fs().ops().create(&sb, &dir_node, &name, mode)?;
                vnode_get(mnt.id(), vnid)
            })();
            vnode_put(&dir)?;
            created?
        }
        Err(e) => return Err(e),
    };

    if omode.contains(OpenMode::TRUNC) && omode.contains(OpenMode::WRITE) && !v.is_dir() {
        let truncated = (|| {
            let (mnt, sb, node) = vnode_dispatch_parts(&v)?;
            let attr = VnodeAttr {
                size: 0,
                ..Default::default()
            };
            mnt.fs().ops().setattr(&sb, &node, &attr, AttrMask::SIZE)
        })();
        match truncated {
            Ok(()) | Err(VfsError::NotSupported(_)) => {}
            Err(e) => {
                vnode_put(&v)?;
                return Err(e);
            }
        }
    }

    let alloc = fd_alloc(ioctx, &v, omode);
    vnode_put(&v)?;
    let (slot, _record) = alloc?;
    Ok(slot)
}

/// Close descriptor `fd`
pub fn vfs_close(ioctx: &Arc<IoContext>, fd: usize) -> Result<()> {
    fd_del(ioctx, fd)
}

// ============================================================================
// Read / Write / Seek
// ============================================================================

/// Read from `fd` at its current position, advancing it
pub fn vfs_read(ioctx: &Arc<IoContext>, fd: usize, buf: &mut [u8]) -> Result<usize> {
    let f = fd_get(ioctx, fd)?;
    let result = (|| {
        if !f.omode().contains(OpenMode::READ) {
            return Err(VfsError::BadDescriptor(format!("fd {fd} is not open for reading")));
        }
        if f.vnode().is_dir() {
            return Err(VfsError::IsADirectory(format!("fd {fd}")));
        }
        let (mnt, sb, node) = fd_dispatch_parts(&f)?;
        let n = mnt.fs().ops().read(&sb, &node, f.pos(), buf)?;
        f.set_pos(f.pos() + n as u64);
        Ok(n)
    })();
    fd_put(&f);
    result
}

/// Write to `fd` at its current position (or the end, for APPEND opens)
pub fn vfs_write(ioctx: &Arc<IoContext>, fd: usize, buf: &[u8]) -> Result<usize> {
    let f = fd_get(ioctx, fd)?;
    let result = (|| {
        if !f.omode().contains(OpenMode::WRITE) {
            return Err(VfsError::BadDescriptor(format!("fd {fd} is not open for writing")));
        }
        if f.vnode().is_dir() {
            return Err(VfsError::IsADirectory(format!("fd {fd}")));
        }
        let (mnt, sb, node) = fd_dispatch_parts(&f)?;

        let mut pos = f.pos();
        if f.omode().contains(OpenMode::APPEND) {
            match mnt.fs().ops().getattr(&sb, &node) {
                Ok(attr) => pos = attr.size,
                Err(VfsError::NotSupported(_)) => {}
                Err(e) => return Err(e),
            }
        }

        let n = mnt.fs().ops().write(&sb, &node, pos, buf)?;
        f.set_pos(pos + n as u64);
        Ok(n)
    })();
    fd_put(&f);
    result
}

/// Reposition `fd`, returning the new absolute position
pub fn vfs_seek(
    ioctx: &Arc<IoContext>,
    fd: usize,
    offset: i64,
    whence: SeekWhence,
) -> Result<u64> {
    let f = fd_get(ioctx, fd)?;
    let result = (|| {
        let (mnt, sb, node) = fd_dispatch_parts(&f)?;
        let new_pos = mnt.fs().ops().seek(&sb, &node, offset, whence, f.pos())?;
        f.set_pos(new_pos);
        Ok(new_pos)
    })();
    fd_put(&f);
    result
}

/// Flush `fd`'s file: the filesystem hook plus the v-node's page pool
pub fn vfs_fsync(ioctx: &Arc<IoContext>, fd: usize) -> Result<()> {
    let f = fd_get(ioctx, fd)?;
    let result = (|| {
        let (mnt, sb, node) = fd_dispatch_parts(&f)?;
        mnt.fs().ops().fsync(&sb, &node)?;
        if let Some(pool) = f.vnode().pool_if_created() {
            pool.sync_dirty()?;
        }
        Ok(())
    })();
    fd_put(&f);
    result
}

/// Device control on `fd`
pub fn vfs_ioctl(ioctx: &Arc<IoContext>, fd: usize, cmd: u32, arg: &mut [u8]) -> Result<i64> {
    let f = fd_get(ioctx, fd)?;
    let result = (|| {
        let (mnt, sb, node) = fd_dispatch_parts(&f)?;
        mnt.fs().ops().ioctl(&sb, &node, cmd, arg)
    })();
    fd_put(&f);
    result
}

// ============================================================================
// Namespace Operations
// ============================================================================

fn dispatch_in_parent<T>(
    ioctx: &Arc<IoContext>,
    path: &str,
    op: impl FnOnce(&Arc<Mount>, &FsPrivate, &FsPrivate, &str) -> Result<T>,
) -> Result<T> {
    let abs = resolve_path(ioctx, path)?;
    let (dir, name) = lookup_parent(&abs)?;
    let result = (|| {
        let (mnt, sb, dir_node) = vnode_dispatch_parts(&dir)?;
        op(&mnt, &sb, &dir_node, &name)
    })();
    vnode_put(&dir)?;
    result
}

/// Create a regular file without opening it
pub fn vfs_create(ioctx: &Arc<IoContext>, path: &str, mode: VnodeMode) -> Result<()> {
    dispatch_in_parent(ioctx, path, |mnt, sb, dir, name| {
        let mode = VnodeMode::REG | (mode & VnodeMode::PERM_MASK);
        mnt.fs().ops().create(sb, dir, name, mode).map(|_| ())
    })
}

/// Remove a file name
pub fn vfs_unlink(ioctx: &Arc<IoContext>, path: &str) -> Result<()> {
    dispatch_in_parent(ioctx, path, |mnt, sb, dir, name| {
        mnt.fs().ops().unlink(sb, dir, name)
    })
}

/// Create a directory
pub fn vfs_mkdir(ioctx: &Arc<IoContext>, path: &str, mode: VnodeMode) -> Result<()> {
    dispatch_in_parent(ioctx, path, |mnt, sb, dir, name| {
        let mode = VnodeMode::DIR | (mode & VnodeMode::PERM_MASK);
        mnt.fs().ops().mkdir(sb, dir, name, mode).map(|_| ())
    })
}

/// Remove an empty directory
pub fn vfs_rmdir(ioctx: &Arc<IoContext>, path: &str) -> Result<()> {
    dispatch_in_parent(ioctx, path, |mnt, sb, dir, name| {
        mnt.fs().ops().rmdir(sb, dir, name)
    })
}

/// Rename an entry. Both paths must live on the same mount.
pub fn vfs_rename(ioctx: &Arc<IoContext>, from: &str, to: &str) -> Result<()> {
    let from_abs = resolve_path(ioctx, from)?;
    let to_abs = resolve_path(ioctx, to)?;

    let (from_dir, from_name) = lookup_parent(&from_abs)?;
    let (to_dir, to_name) = match lookup_parent(&to_abs) {
        Ok(ok) => ok,
        Err(e) => {
            vnode_put(&from_dir)?;
            return Err(e);
        }
    };

    let result = (|| {
        let (from_mnt, sb, from_node) = vnode_dispatch_parts(&from_dir)?;
        let (to_mnt, _, to_node) = vnode_dispatch_parts(&to_dir)?;
        if from_mnt.id() != to_mnt.id() {
            return Err(VfsError::InvalidArgument(
                "rename across mounts is not supported".into(),
            ));
        }
        from_mnt
            .fs()
            .ops()
            .rename(&sb, &from_node, &from_name, &to_node, &to_name)
    })();

    vnode_put(&from_dir)?;
    vnode_put(&to_dir)?;
    result
}

/// List the entries of the directory open on `fd`, advancing its
/// position by the number of entries returned.
pub fn vfs_getdents(ioctx: &Arc<IoContext>, fd: usize) -> Result<Vec<DirEntry>> {
    let f = fd_get(ioctx, fd)?;
    let result = (|| {
        if !f.vnode().is_dir() {
            return Err(VfsError::NotADirectory(format!("fd {fd}")));
        }
        let (mnt, sb, node) = fd_dispatch_parts(&f)?;
        let entries = mnt.fs().ops().getdents(&sb, &node, f.pos())?;
        f.set_pos(f.pos() + entries.len() as u64);
        Ok(entries)
    })();
    fd_put(&f);
    result
}

/// Attributes of the object at `path`
pub fn vfs_getattr(ioctx: &Arc<IoContext>, path: &str) -> Result<VnodeAttr> {
    let abs = resolve_path(ioctx, path)?;
    let v = lookup_absolute(&abs)?;
    let result = (|| {
        let (mnt, sb, node) = vnode_dispatch_parts(&v)?;
        mnt.fs().ops().getattr(&sb, &node)
    })();
    vnode_put(&v)?;
    result
}

/// Apply attributes selected by `mask` to the object at `path`
pub fn vfs_setattr(
    ioctx: &Arc<IoContext>,
    path: &str,
    attr: &VnodeAttr,
    mask: AttrMask,
) -> Result<()> {
    let abs = resolve_path(ioctx, path)?;
    let v = lookup_absolute(&abs)?;
    let result = (|| {
        let (mnt, sb, node) = vnode_dispatch_parts(&v)?;
        mnt.fs().ops().setattr(&sb, &node, attr, mask)
    })();
    vnode_put(&v)?;
    result
}
