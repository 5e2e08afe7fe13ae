//! # RustyVFS
//!
//! The storage stack of a teaching UNIX-like kernel, as a hosted
//! library: the path from a file operation down to device blocks.
//!
//! ## Layers
//!
//! ```text
//! ┌──────────────────────────────────────────────────────┐
//! │  VFS core                                            │
//! │  mounts · v-node cache · fd tables · fs_calls vtable │
//! ├──────────────────────────────────────────────────────┤
//! │  Block buffers (sub-page ranges of device pages)     │
//! ├──────────────────────────────────────────────────────┤
//! │  Block devices + BIO request engine                  │
//! ├──────────────────────────────────────────────────────┤
//! │  Page-cache pools (per device / per file)            │
//! │  offset → page map · clean LRU · dirty LRU           │
//! ├──────────────────────────────────────────────────────┤
//! │  Page frames · refcount / wait-queue primitives      │
//! └──────────────────────────────────────────────────────┘
//! ```
//!
//! A read resolves a descriptor through the I/O context to a v-node,
//! the v-node's mount to a filesystem vtable, and the filesystem pulls
//! the bytes through its device's page-cache pool; releasing the page
//! drops it onto the pool's clean LRU for later reclamation.
//!
//! ## Example
//!
//! ```rust,ignore
//! use rusty_vfs::vfs::{self, OpenMode, VnodeMode};
//!
//! vfs::register_filesystem("ramfs", vfs::FsFlags::PSEUDO, my_ramfs)?;
//! vfs::mount("/", Some("ramfs"), rusty_vfs::common::INVALID_DEVICE_ID, None)?;
//!
//! let ioctx = vfs::IoContext::new(None)?;
//! let fd = vfs::vfs_open(&ioctx, "/hello", OpenMode::READ, VnodeMode::empty())?;
//! let mut buf = [0u8; 64];
//! let n = vfs::vfs_read(&ioctx, fd, &mut buf)?;
//! vfs::vfs_close(&ioctx, fd)?;
//! ```

pub mod bdev;
pub mod common;
pub mod error;
pub mod page;
pub mod pcache;
pub mod sync;
pub mod vfs;

pub use error::{Result, VfsError};
