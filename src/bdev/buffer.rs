// # Block Buffers
//
// Sub-page byte ranges carved out of a device page, for filesystems
// whose logical block size is smaller than the page size. A buffer is
// always mapped into exactly one page; its length is the device's block
// size and divides the page size, so a page carves into a whole number
// of non-overlapping buffers laid out in address order.
//
// Getting a buffer acquires its containing page BUSY; putting it
// releases the page. Reads and writes are page-granular through the BIO
// path: the whole containing page moves, not just the buffer's range.

use crate::bdev::bio::BioDirection;
use crate::bdev::{bdev_entry_get, bdev_entry_put, bdev_page_write, page_rw, BdevEntry};
use crate::common::{BlockNo, DeviceId};
use crate::error::{Result, VfsError};
use crate::page::PageFrame;
use crate::pcache::PageCache;
use parking_lot::{MappedRwLockReadGuard, MappedRwLockWriteGuard, RwLockReadGuard, RwLockWriteGuard};
use std::sync::Arc;

/// One sub-page byte range of a device page
pub struct BlockBuffer {
    /// Offset of the buffer within its page
    page_offset: usize,

    /// Byte offset of the buffer on the device
    dev_offset: u64,

    /// Buffer length; the device's block size
    len: usize,

    /// Containing page
    page: Arc<PageCache>,
}

impl BlockBuffer {
    #[inline]
    pub fn page_offset(&self) -> usize {
        self.page_offset
    }

    #[inline]
    pub fn dev_offset(&self) -> u64 {
        self.dev_offset
    }

    #[inline]
    pub fn len(&self) -> usize {
        self.len
    }

    #[inline]
    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    /// The page this buffer is mapped into
    #[inline]
    pub fn page(&self) -> &Arc<PageCache> {
        &self.page
    }

    /// Read access to the buffer's bytes
    pub fn data(&self) -> MappedRwLockReadGuard<'_, [u8]> {
        let guard: RwLockReadGuard<'_, PageFrame> = self.page.data();
        RwLockReadGuard::map(guard, |frame| {
            &frame.data()[self.page_offset..self.page_offset + self.len]
        })
    }

    /// Write access to the buffer's bytes.
    ///
    /// Writing does not mark anything dirty; pair with
    /// [`block_buffer_mark_dirty`].
    pub fn data_mut(&self) -> MappedRwLockWriteGuard<'_, [u8]> {
        let guard: RwLockWriteGuard<'_, PageFrame> = self.page.data_mut();
        RwLockWriteGuard::map(guard, |frame| {
            &mut frame.data_mut()[self.page_offset..self.page_offset + self.len]
        })
    }
}

impl std::fmt::Debug for BlockBuffer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BlockBuffer")
            .field("page_offset", &self.page_offset)
            .field("dev_offset", &self.dev_offset)
            .field("len", &self.len)
            .finish()
    }
}

// ============================================================================
// Page Carving
// ============================================================================

/// Carve an invalid device page into `page_size / block_size` buffers.
///
/// Buffers are enqueued onto the page in address order. Idempotent for a
/// page that already carries buffers.
pub fn block_buffer_device_page_setup(devid: DeviceId, pc: &Arc<PageCache>) -> Result<()> {
    if pc.devid_get()? != devid {
        return Err(VfsError::InvalidArgument(
            "page does not belong to this device".into(),
        ));
    }

    let bdev = bdev_entry_get(devid)?;
    let result = setup_page_buffers(&bdev, pc);
    bdev_entry_put(&bdev);
    result
}

fn setup_page_buffers(bdev: &Arc<BdevEntry>, pc: &Arc<PageCache>) -> Result<()> {
    if pc.has_block_buffers() {
        return Ok(());
    }

    let block_size = bdev.block_size();
    let page_size = bdev.pool().page_size();
    debug_assert!(page_size % block_size == 0);

    let base = pc.offset();
    for i in 0..(page_size / block_size) {
        let in_page = i * block_size;
        let buf = Arc::new(BlockBuffer {
            page_offset: in_page,
            dev_offset: base + in_page as u64,
            len: block_size,
            page: pc.clone(),
        });
        pc.enqueue_block_buffer(buf)?;
    }
    Ok(())
}

// ============================================================================
// Buffer Operations
// ============================================================================

/// Look up the buffer for `blkno`, acquiring its page BUSY.
///
/// Fails with `NotFound` past the end of the device when the driver
/// reports a capacity. Release with [`block_buffer_put`].
pub fn block_buffer_get(devid: DeviceId, blkno: BlockNo) -> Result<Arc<BlockBuffer>> {
    let bdev = bdev_entry_get(devid)?;
    let block_size = bdev.block_size() as u64;
    let offset = blkno * block_size;

    if let Some(capacity) = bdev.capacity() {
        if offset >= capacity {
            bdev_entry_put(&bdev);
            return Err(VfsError::NotFound(format!(
                "block {blkno} is past the end of device {devid:#x}"
            )));
        }
    }

    let pc = match bdev.pool().get(offset) {
        Ok(pc) => pc,
        Err(e) => {
            bdev_entry_put(&bdev);
            return Err(e);
        }
    };

    let result = setup_page_buffers(&bdev, &pc).and_then(|_| {
        let page_offset = (offset % bdev.pool().page_size() as u64) as usize;
        pc.find_block_buffer(page_offset).ok_or_else(|| {
            VfsError::Io(format!("no buffer mapped at page offset {page_offset}"))
        })
    });

    match result {
        Ok(buf) => {
            bdev_entry_put(&bdev);
            Ok(buf)
        }
        Err(e) => {
            if let Some(pool) = pc.pool() {
                let _ = pool.put(&pc);
            }
            bdev_entry_put(&bdev);
            Err(e)
        }
    }
}

/// Release a buffer's page, undoing [`block_buffer_get`]
pub fn block_buffer_put(buf: &Arc<BlockBuffer>) -> Result<()> {
    let pool = buf
        .page()
        .pool()
        .ok_or_else(|| VfsError::ObjectReleased("page cache pool".into()))?;
    pool.put(buf.page())
}

/// Get the buffer for `blkno`, reading its page in from the device if
/// the cached copy is not yet valid.
pub fn block_buffer_read(devid: DeviceId, blkno: BlockNo) -> Result<Arc<BlockBuffer>> {
    let buf = block_buffer_get(devid, blkno)?;

    if !buf.page().is_valid() {
        let fill = page_rw(devid, buf.page(), BioDirection::Read)
            .and_then(|_| buf.page().mark_clean());
        if let Err(e) = fill {
            let _ = block_buffer_put(&buf);
            return Err(e);
        }
    }
    Ok(buf)
}

/// Write the buffer's containing page out to the device
pub fn block_buffer_write(buf: &Arc<BlockBuffer>) -> Result<()> {
    bdev_page_write(buf.page())
}

/// Mark the buffer's containing page dirty.
///
/// Takes a short page reference for the duration; the caller must hold
/// the page BUSY (it does, between get and put).
pub fn block_buffer_mark_dirty(buf: &Arc<BlockBuffer>) -> Result<()> {
    let pc = buf.page();
    if !pc.ref_inc() {
        return Err(VfsError::ObjectReleased("page cache".into()));
    }
    let result = pc.mark_dirty();
    pc.ref_dec();
    result
}

// ============================================================================
// Tests
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use crate::common::{mkdev, VnodeId};
    use crate::vfs::fs_calls::{FilesystemOps, FsPrivate, VnodeMode};
    use crate::bdev::bio::BioEntry;
    use crate::bdev::{bdev_device_register, bdev_device_unregister};
    use parking_lot::Mutex;

    /// Driver backed by an in-memory byte vector
    struct RamDisk {
        bytes: Mutex<Vec<u8>>,
    }

    impl RamDisk {
        fn new(size: usize) -> Arc<Self> {
            Arc::new(Self {
                bytes: Mutex::new(vec![0u8; size]),
            })
        }
    }

    impl FilesystemOps for RamDisk {
        fn mount(&self, _devid: DeviceId, _args: Option<&str>) -> Result<(FsPrivate, VnodeId)> {
            Err(VfsError::NotSupported("driver only".into()))
        }
        fn unmount(&self, _sb: &FsPrivate) -> Result<()> {
            Ok(())
        }
        fn sync(&self, _sb: &FsPrivate) -> Result<()> {
            Ok(())
        }
        fn lookup(&self, _sb: &FsPrivate, _dir: &FsPrivate, _name: &str) -> Result<VnodeId> {
            Err(VfsError::NotFound("driver only".into()))
        }
        fn getvnode(&self, _sb: &FsPrivate, _vnid: VnodeId) -> Result<(VnodeMode, FsPrivate)> {
            Err(VfsError::NotFound("driver only".into()))
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
        fn strategy(&self, ent: &BioEntry) -> Result<()> {
            let pc = ent
                .page()
                .ok_or_else(|| VfsError::Io("entry has no page".into()))?;
            let start = (ent.dev_offset() + ent.page_offset() as u64) as usize;
            let end = start + ent.len();
            let mut bytes = self.bytes.lock();
            if end > bytes.len() {
                return Err(VfsError::Io("transfer past end of ramdisk".into()));
            }
            match ent.direction() {
                BioDirection::Read => {
                    let mut frame = pc.data_mut();
                    frame.data_mut()[ent.page_offset()..ent.page_offset() + ent.len()]
                        .copy_from_slice(&bytes[start..end]);
                }
                BioDirection::Write => {
                    let frame = pc.data();
                    bytes[start..end].copy_from_slice(
                        &frame.data()[ent.page_offset()..ent.page_offset() + ent.len()],
                    );
                }
            }
            Ok(())
        }
        fn device_capacity(&self) -> Option<u64> {
            Some(self.bytes.lock().len() as u64)
        }
    }

    #[test]
    fn test_device_page_carves_into_buffers() {
        let devid = mkdev(210, 1);
        bdev_device_register(devid, 1024, RamDisk::new(64 * 1024), None).unwrap();

        let buf = block_buffer_get(devid, 1).unwrap();
        assert_eq!(buf.page_offset(), 1024);
        assert_eq!(buf.dev_offset(), 1024);
        assert_eq!(buf.len(), 1024);
        assert_eq!(buf.page().block_buffer_count(), 4);
        assert!(buf.page().is_busy());

        block_buffer_put(&buf).unwrap();
        bdev_device_unregister(devid).unwrap();
    }

    #[test]
    fn test_block_write_then_read_round_trips() {
        let devid = mkdev(210, 2);
        bdev_device_register(devid, 1024, RamDisk::new(64 * 1024), None).unwrap();

        let buf = block_buffer_get(devid, 1).unwrap();
        buf.data_mut().fill(0x0a);
        block_buffer_mark_dirty(&buf).unwrap();
        block_buffer_write(&buf).unwrap();
        block_buffer_put(&buf).unwrap();

        // Drop the cached copy so the next read has to hit the device.
        let entry = bdev_entry_get(devid).unwrap();
        entry.pool().shrink(-1).unwrap();
        bdev_entry_put(&entry);

        let buf = block_buffer_read(devid, 1).unwrap();
        assert_eq!(buf.data()[0], 0x0a);
        assert_eq!(buf.data()[1023], 0x0a);
        block_buffer_put(&buf).unwrap();

        bdev_device_unregister(devid).unwrap();
    }

    #[test]
    fn test_get_past_end_of_device_is_noent() {
        let devid = mkdev(210, 3);
        bdev_device_register(devid, 1024, RamDisk::new(8 * 1024), None).unwrap();

        assert!(matches!(
            block_buffer_get(devid, 8),
            Err(VfsError::NotFound(_))
        ));
        let last = block_buffer_get(devid, 7).unwrap();
        block_buffer_put(&last).unwrap();

        bdev_device_unregister(devid).unwrap();
    }

    #[test]
    fn test_buffers_do_not_overlap_and_fill_page() {
        let devid = mkdev(210, 4);
        bdev_device_register(devid, 512, RamDisk::new(64 * 1024), None).unwrap();

        let buf = block_buffer_get(devid, 0).unwrap();
        let pc = buf.page().clone();
        assert_eq!(pc.block_buffer_count(), 8);

        let mut covered = 0usize;
        for i in 0..8 {
            let b = pc
                .find_block_buffer(i * 512)
                .expect("buffer at each block boundary");
            assert_eq!(b.len(), 512);
            covered += b.len();
        }
        assert_eq!(covered, 4096);

        block_buffer_put(&buf).unwrap();
        bdev_device_unregister(devid).unwrap();
    }
}
