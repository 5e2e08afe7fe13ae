// # Block Device Registry
//
// The process-wide database of registered block devices. Registration
// binds a device id, its logical block size, the driver's operations
// (`strategy` is the one the BIO engine needs), and driver-private
// state, and allocates the device's page-cache pool. The pool reaches
// the device back through the `BackingStore` seam, which resolves the
// driver through this registry on every transfer, so a pool never
// outlives an unregistered driver silently: its I/O simply starts
// failing with `NoDevice`.

pub mod bio;
pub mod buffer;

use crate::common::{DeviceId, INVALID_DEVICE_ID};
use crate::error::{Result, VfsError};
use crate::pcache::{BackingStore, PageCache, PageCachePool};
use crate::sync::RefCount;
use crate::vfs::fs_calls::FilesystemOps;
use bio::{BioDirection, BioRequest};
use once_cell::sync::Lazy;
use parking_lot::Mutex;
use std::any::Any;
use std::collections::BTreeMap;
use std::sync::{Arc, Weak};

/// Driver-private state attached at registration
pub type DriverPrivate = Option<Arc<dyn Any + Send + Sync>>;

/// One registered block device
pub struct BdevEntry {
    devid: DeviceId,
    block_size: usize,
    ops: Arc<dyn FilesystemOps>,
    private: DriverPrivate,
    pool: Arc<PageCachePool>,
    refs: RefCount,
    requests: Mutex<Vec<Weak<BioRequest>>>,
}

impl BdevEntry {
    #[inline]
    pub fn devid(&self) -> DeviceId {
        self.devid
    }

    /// Logical block size; divides the pool's page size
    #[inline]
    pub fn block_size(&self) -> usize {
        self.block_size
    }

    #[inline]
    pub fn ops(&self) -> &Arc<dyn FilesystemOps> {
        &self.ops
    }

    #[inline]
    pub fn private(&self) -> &DriverPrivate {
        &self.private
    }

    /// The device's page-cache pool
    #[inline]
    pub fn pool(&self) -> &Arc<PageCachePool> {
        &self.pool
    }

    /// Device capacity in bytes, when the driver reports one
    pub fn capacity(&self) -> Option<u64> {
        self.ops.device_capacity()
    }

    #[inline]
    pub fn ref_inc(&self) -> bool {
        self.refs.inc_if_valid()
    }

    pub fn ref_dec(&self) -> bool {
        let last = self.refs.dec_and_test();
        if last {
            debug_assert!(self.active_requests() == 0);
        }
        last
    }

    /// Number of live requests submitted against this device
    pub fn active_requests(&self) -> usize {
        self.requests.lock().iter().filter(|w| w.upgrade().is_some()).count()
    }

    fn track_request(&self, req: &Arc<BioRequest>) {
        let mut requests = self.requests.lock();
        requests.retain(|w| w.upgrade().is_some());
        requests.push(Arc::downgrade(req));
    }

    fn untrack_request(&self, req: &Arc<BioRequest>) {
        self.requests.lock().retain(|w| {
            w.upgrade().map(|r| !Arc::ptr_eq(&r, req)).unwrap_or(false)
        });
    }
}

impl std::fmt::Debug for BdevEntry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BdevEntry")
            .field("devid", &self.devid)
            .field("block_size", &self.block_size)
            .field("refs", &self.refs.read())
            .finish_non_exhaustive()
    }
}

// ============================================================================
// Device Database
// ============================================================================

struct BdevDb {
    devices: Mutex<BTreeMap<DeviceId, Arc<BdevEntry>>>,
}

static BDEV_DB: Lazy<BdevDb> = Lazy::new(|| BdevDb {
    devices: Mutex::new(BTreeMap::new()),
});

/// Register a block device driver.
///
/// `block_size` must be a power of two dividing the page size. A second
/// registration of the same id fails with `Busy`.
pub fn bdev_device_register(
    devid: DeviceId,
    block_size: usize,
    ops: Arc<dyn FilesystemOps>,
    private: DriverPrivate,
) -> Result<()> {
    if devid == INVALID_DEVICE_ID {
        return Err(VfsError::InvalidArgument("invalid device id".into()));
    }

    let backing: Arc<dyn BackingStore> = Arc::new(DeviceBacking { devid });
    let pool = PageCachePool::new_device_pool(backing);
    let page_size = pool.page_size();

    if block_size == 0 || !block_size.is_power_of_two() || page_size % block_size != 0 {
        pool.ref_dec();
        return Err(VfsError::InvalidArgument(format!(
            "block size {block_size} does not divide page size {page_size}"
        )));
    }

    let entry = Arc::new(BdevEntry {
        devid,
        block_size,
        ops,
        private,
        pool,
        refs: RefCount::new(1),
        requests: Mutex::new(Vec::new()),
    });

    let mut devices = BDEV_DB.devices.lock();
    if devices.contains_key(&devid) {
        drop(devices);
        entry.pool.ref_dec();
        return Err(VfsError::Busy(format!("device {devid:#x} already registered")));
    }
    devices.insert(devid, entry);
    tracing::debug!(devid, block_size, "block device registered");
    Ok(())
}

/// Unregister a block device driver.
///
/// The device pool is drained (dirty pages written back) and released.
/// Outstanding entry references keep the entry itself alive; its I/O
/// fails with `NoDevice` from here on.
pub fn bdev_device_unregister(devid: DeviceId) -> Result<()> {
    let entry = {
        let mut devices = BDEV_DB.devices.lock();
        devices
            .remove(&devid)
            .ok_or_else(|| VfsError::NoDevice(format!("device {devid:#x}")))?
    };

    if let Err(e) = entry.pool.shrink(-1) {
        tracing::warn!(devid, error = %e, "pages left behind while unregistering device");
    }
    entry.pool.ref_dec();
    entry.ref_dec();
    tracing::debug!(devid, "block device unregistered");
    Ok(())
}

/// Look up a registered device, taking a reference on its entry
pub fn bdev_entry_get(devid: DeviceId) -> Result<Arc<BdevEntry>> {
    let devices = BDEV_DB.devices.lock();
    let entry = devices
        .get(&devid)
        .ok_or_else(|| VfsError::NoDevice(format!("device {devid:#x}")))?;
    if !entry.ref_inc() {
        return Err(VfsError::NoDevice(format!("device {devid:#x} is shutting down")));
    }
    Ok(entry.clone())
}

/// Return a reference taken with [`bdev_entry_get`]
pub fn bdev_entry_put(entry: &Arc<BdevEntry>) {
    entry.ref_dec();
}

// ============================================================================
// Request Submission
// ============================================================================

/// Allocate an empty BIO request
pub fn bio_request_alloc() -> Arc<BioRequest> {
    BioRequest::new()
}

/// Free a BIO request, draining its entry lists
pub fn bio_request_free(req: &Arc<BioRequest>) {
    req.free();
}

/// Submit a request's entries to `devid`'s strategy, in FIFO order.
///
/// Entries carrying only an offset are resolved against the device pool
/// (acquiring and releasing each page around its dispatch); entries
/// bound to a page by the caller are dispatched as-is. Failed entries
/// move to the request's error list. Returns the number of entries
/// dispatched, or `NoDevice` when the device is not registered.
pub fn bio_request_submit(devid: DeviceId, req: &Arc<BioRequest>) -> Result<usize> {
    let bdev = bdev_entry_get(devid)?;
    bdev.track_request(req);

    let ops = bdev.ops().clone();
    let pool = bdev.pool().clone();

    let result = req.dispatch(
        |ent| ops.strategy(ent),
        |dev_offset| pool.get(dev_offset),
        |pc, _direction, resolved_here| {
            if resolved_here {
                // The strategy either filled the page from the device or
                // pushed it out; both leave cache and device coherent.
                if let Err(e) = pc.mark_clean() {
                    tracing::warn!(offset = pc.offset(), error = %e, "mark clean failed");
                }
                if let Err(e) = pool.put(pc) {
                    tracing::warn!(offset = pc.offset(), error = %e, "page release failed");
                }
            }
        },
    );

    bdev.untrack_request(req);
    bdev_entry_put(&bdev);
    result
}

// ============================================================================
// Page-Granular Transfers
// ============================================================================

/// Move one whole page between the cache and its device.
///
/// The caller holds the page BUSY. Builds a one-entry synchronous
/// request bound to `pc` and dispatches it.
pub(crate) fn page_rw(devid: DeviceId, pc: &Arc<PageCache>, direction: BioDirection) -> Result<()> {
    let bdev = bdev_entry_get(devid)?;
    let page_size = bdev.pool().page_size();
    let ops = bdev.ops().clone();

    let req = BioRequest::new();
    if let Err(e) = req.add_bound(direction, pc, 0, page_size) {
        bdev_entry_put(&bdev);
        return Err(e);
    }

    let dispatch_result = req.dispatch(
        |ent| ops.strategy(ent),
        |_| Err(VfsError::NoDevice("page transfer entries are pre-bound".into())),
        |_, _, _| {},
    );

    bdev_entry_put(&bdev);
    dispatch_result?;

    if let Some(e) = req.first_error() {
        return Err(e);
    }
    req.free();
    Ok(())
}

/// Fill a BUSY device page from its device and mark it CLEAN
pub fn bdev_page_read(pc: &Arc<PageCache>) -> Result<()> {
    let devid = pc.devid_get()?;
    page_rw(devid, pc, BioDirection::Read)?;
    pc.mark_clean()
}

/// Write a BUSY device page out to its device and mark it CLEAN
pub fn bdev_page_write(pc: &Arc<PageCache>) -> Result<()> {
    let devid = pc.devid_get()?;
    page_rw(devid, pc, BioDirection::Write)?;
    pc.mark_clean()
}

// ============================================================================
// Backing Store Seam
// ============================================================================

/// Resolves the driver through the registry on every transfer, so the
/// pool holds no direct driver reference.
struct DeviceBacking {
    devid: DeviceId,
}

impl BackingStore for DeviceBacking {
    fn devid(&self) -> DeviceId {
        self.devid
    }

    fn read_in(&self, pc: &Arc<PageCache>) -> Result<()> {
        page_rw(self.devid, pc, BioDirection::Read)
    }

    fn write_back(&self, pc: &Arc<PageCache>) -> Result<()> {
        page_rw(self.devid, pc, BioDirection::Write)
    }
}

// ============================================================================
// Tests
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use crate::common::mkdev;
    use crate::vfs::fs_calls::FsPrivate;
    use crate::common::VnodeId;
    use crate::vfs::fs_calls::VnodeMode;
    use std::sync::atomic::{AtomicUsize, Ordering};

    struct StubDriver {
        strategy_calls: AtomicUsize,
    }

    impl FilesystemOps for StubDriver {
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
        fn strategy(&self, _ent: &bio::BioEntry) -> Result<()> {
            self.strategy_calls.fetch_add(1, Ordering::SeqCst);
            Ok(())
        }
    }

    fn stub() -> Arc<StubDriver> {
        Arc::new(StubDriver {
            strategy_calls: AtomicUsize::new(0),
        })
    }

    #[test]
    fn test_register_duplicate_is_busy() {
        let devid = mkdev(200, 1);
        bdev_device_register(devid, 512, stub(), None).unwrap();
        assert!(matches!(
            bdev_device_register(devid, 512, stub(), None),
            Err(VfsError::Busy(_))
        ));
        bdev_device_unregister(devid).unwrap();
        assert!(matches!(
            bdev_device_unregister(devid),
            Err(VfsError::NoDevice(_))
        ));
    }

    #[test]
    fn test_register_rejects_bad_block_size() {
        let devid = mkdev(200, 2);
        assert!(matches!(
            bdev_device_register(devid, 3000, stub(), None),
            Err(VfsError::InvalidArgument(_))
        ));
        assert!(matches!(
            bdev_device_register(devid, 0, stub(), None),
            Err(VfsError::InvalidArgument(_))
        ));
        assert!(matches!(
            bdev_device_register(INVALID_DEVICE_ID, 512, stub(), None),
            Err(VfsError::InvalidArgument(_))
        ));
    }

    #[test]
    fn test_submit_to_unknown_device_is_nodev() {
        let req = bio_request_alloc();
        req.add(BioDirection::Read, 0).unwrap();
        assert!(matches!(
            bio_request_submit(mkdev(200, 99), &req),
            Err(VfsError::NoDevice(_))
        ));
    }

    #[test]
    fn test_async_submit_invokes_strategy_per_entry() {
        let devid = mkdev(200, 3);
        let driver = stub();
        bdev_device_register(devid, 512, driver.clone(), None).unwrap();

        let req = bio_request_alloc();
        req.set_async();
        req.add(BioDirection::Read, 0).unwrap();
        req.add(BioDirection::Write, 4096).unwrap();
        req.add(BioDirection::Read, 4096).unwrap();

        let dispatched = bio_request_submit(devid, &req).unwrap();
        assert_eq!(dispatched, 3);
        assert_eq!(driver.strategy_calls.load(Ordering::SeqCst), 3);
        assert_eq!(req.pending_len(), 0);
        assert_eq!(req.error_len(), 0);

        bdev_device_unregister(devid).unwrap();
    }
}
