// # VFS Core
//
// The filesystem-independent layer: the operation vtable physical
// filesystems plug into, the mount table, the v-node cache, per-process
// file descriptor tables, path resolution, and the file-operation call
// surface.

pub mod fd;
pub mod fs_calls;
pub mod mount;
pub mod ops;
pub mod path;
pub mod vnode;

pub use fd::{
    fd_alloc, fd_del, fd_dup, fd_get, fd_put, resize_fd_table, FdFlags, FileDescriptor,
    IoContext,
};
pub use fs_calls::{
    fs_get, fs_put, register_filesystem, registered_filesystems, unregister_filesystem,
    AttrMask, DirEntry, FdPrivate, FilesystemOps, FsContainer, FsFlags, FsPrivate, OpenMode,
    SeekWhence, VnodeAttr, VnodeMode,
};
pub use mount::{
    mount, mount_count, mount_get, mount_lookup_by_path, mount_put, sync_all, system_root_vnode,
    unmount, Mount, MountFlags,
};
pub use ops::{
    vfs_close, vfs_create, vfs_fsync, vfs_getattr, vfs_getdents, vfs_ioctl, vfs_mkdir, vfs_open,
    vfs_read, vfs_rename, vfs_rmdir, vfs_seek, vfs_setattr, vfs_unlink, vfs_write,
};
pub use path::{join_path, lookup_absolute, lookup_parent, normalize_path};
pub use vnode::{vnode_get, vnode_lock, vnode_put, vnode_unlock, VnFlags, Vnode};
