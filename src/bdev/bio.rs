// # Block I/O Requests
//
// A BIO request groups entries that each target one cached page of one
// device. Entries are dispatched to the device strategy in insertion
// order; entries that fail migrate to the request's error list. In async
// mode completed entries are freed as they finish; in sync mode they are
// retained on the completed list until the request is freed.
//
// An entry is either bound to a page up front (the page-granular
// read/write path, where the caller already holds the page BUSY) or
// carries only a device offset and is resolved against the device pool
// during submission.

use crate::error::{Result, VfsError};
use crate::pcache::PageCache;
use crate::sync::{WaitQueue, WakeReason};
use bitflags::bitflags;
use parking_lot::Mutex;
use std::collections::VecDeque;
use std::sync::Arc;

/// Transfer direction
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BioDirection {
    Read,
    Write,
}

bitflags! {
    /// Request flags
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct BioFlags: u32 {
        /// Do not retain completed entries for the submitter
        const ASYNC = 1 << 0;
    }
}

/// Entry lifecycle
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BioStatus {
    None,
    Submitted,
    Done,
    Error,
}

struct EntryState {
    status: BioStatus,
    error: Option<VfsError>,
    page: Option<Arc<PageCache>>,
    /// Offset of the transfer within the page
    page_offset: usize,
    /// Transfer length; set at resolution for offset-only entries
    len: usize,
}

/// One transfer: a byte range of one page, to or from the device
pub struct BioEntry {
    direction: BioDirection,
    /// Byte offset on the device of the start of the containing page
    dev_offset: u64,
    state: Mutex<EntryState>,
}

impl BioEntry {
    fn new(
        direction: BioDirection,
        dev_offset: u64,
        page_offset: usize,
        len: usize,
        page: Option<Arc<PageCache>>,
    ) -> Arc<Self> {
        Arc::new(Self {
            direction,
            dev_offset,
            state: Mutex::new(EntryState {
                status: BioStatus::None,
                error: None,
                page,
                page_offset,
                len,
            }),
        })
    }

    #[inline]
    pub fn direction(&self) -> BioDirection {
        self.direction
    }

    /// Device byte offset of the containing page
    #[inline]
    pub fn dev_offset(&self) -> u64 {
        self.dev_offset
    }

    /// Transfer offset within the page
    pub fn page_offset(&self) -> usize {
        self.state.lock().page_offset
    }

    /// Transfer length
    pub fn len(&self) -> usize {
        self.state.lock().len
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// The page this entry targets, once bound
    pub fn page(&self) -> Option<Arc<PageCache>> {
        self.state.lock().page.clone()
    }

    /// Current status
    pub fn status(&self) -> BioStatus {
        self.state.lock().status
    }

    /// The error that moved this entry to the error list, if any
    pub fn error(&self) -> Option<VfsError> {
        self.state.lock().error.clone()
    }

    fn bind_page(&self, pc: &Arc<PageCache>) -> Result<()> {
        if !pc.ref_inc() {
            return Err(VfsError::ObjectReleased("page cache".into()));
        }
        self.state.lock().page = Some(pc.clone());
        Ok(())
    }

    /// Widen an offset-only entry to cover its whole resolved page
    fn set_whole_page(&self, page_size: usize) {
        let mut st = self.state.lock();
        if st.len == 0 {
            st.page_offset = 0;
            st.len = page_size;
        }
    }

    fn set_status(&self, status: BioStatus) {
        self.state.lock().status = status;
    }

    fn set_error(&self, error: VfsError) {
        let mut st = self.state.lock();
        st.status = BioStatus::Error;
        st.error = Some(error);
    }

    /// Drop the bound page, releasing its logical reference
    fn unbind(&self) {
        if let Some(pc) = self.state.lock().page.take() {
            pc.ref_dec();
        }
    }
}

impl std::fmt::Debug for BioEntry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BioEntry")
            .field("direction", &self.direction)
            .field("dev_offset", &self.dev_offset)
            .field("page_offset", &self.page_offset())
            .field("len", &self.len())
            .field("status", &self.status())
            .finish()
    }
}

// ============================================================================
// Request
// ============================================================================

struct BioInner {
    pending: VecDeque<Arc<BioEntry>>,
    error: VecDeque<Arc<BioEntry>>,
    completed: VecDeque<Arc<BioEntry>>,
}

/// One batched block I/O request against a single device
pub struct BioRequest {
    flags: Mutex<BioFlags>,
    waiters: WaitQueue,
    inner: Mutex<BioInner>,
}

impl BioRequest {
    /// Allocate an empty request
    pub fn new() -> Arc<Self> {
        Arc::new(Self {
            flags: Mutex::new(BioFlags::empty()),
            waiters: WaitQueue::new(),
            inner: Mutex::new(BioInner {
                pending: VecDeque::new(),
                error: VecDeque::new(),
                completed: VecDeque::new(),
            }),
        })
    }

    /// Switch the request to async completion
    pub fn set_async(&self) {
        self.flags.lock().insert(BioFlags::ASYNC);
    }

    #[inline]
    pub fn is_async(&self) -> bool {
        self.flags.lock().contains(BioFlags::ASYNC)
    }

    /// Queue a transfer of the page covering device byte `dev_offset`.
    ///
    /// The page is resolved against the device pool at submission.
    pub fn add(&self, direction: BioDirection, dev_offset: u64) -> Result<()> {
        let ent = BioEntry::new(direction, dev_offset, 0, 0, None);
        self.inner.lock().pending.push_back(ent);
        Ok(())
    }

    /// Queue a transfer bound to a page the caller already holds BUSY
    pub fn add_bound(
        &self,
        direction: BioDirection,
        pc: &Arc<PageCache>,
        page_offset: usize,
        len: usize,
    ) -> Result<()> {
        let pagesize = pc.pagesize_get()?;
        if page_offset + len > pagesize || len == 0 {
            return Err(VfsError::InvalidArgument(format!(
                "transfer {page_offset}+{len} exceeds page size {pagesize}"
            )));
        }
        let ent = BioEntry::new(direction, pc.offset(), page_offset, len, None);
        ent.bind_page(pc)?;
        self.inner.lock().pending.push_back(ent);
        Ok(())
    }

    /// Dequeue the next pending entry, in insertion order.
    ///
    /// Fails with `NotFound` on an empty queue.
    pub fn next_entry(&self) -> Result<Arc<BioEntry>> {
        self.inner
            .lock()
            .pending
            .pop_front()
            .ok_or_else(|| VfsError::NotFound("bio request queue is empty".into()))
    }

    /// Number of pending entries
    pub fn pending_len(&self) -> usize {
        self.inner.lock().pending.len()
    }

    /// Number of entries on the error list
    pub fn error_len(&self) -> usize {
        self.inner.lock().error.len()
    }

    /// First error recorded on the error list, if any
    pub fn first_error(&self) -> Option<VfsError> {
        self.inner.lock().error.front().and_then(|e| e.error())
    }

    /// Wait until all entries are resolved.
    ///
    /// `EventDelivered` surfaces as `Interrupted`; `Destroyed` means the
    /// request was freed under the waiter.
    pub fn wait_completion(&self) -> Result<()> {
        let mut inner = self.inner.lock();
        while !inner.pending.is_empty() {
            match self.waiters.wait(&mut inner) {
                WakeReason::Released => continue,
                WakeReason::Destroyed => {
                    return Err(VfsError::ObjectReleased("bio request".into()))
                }
                WakeReason::EventDelivered | WakeReason::LockFail => {
                    return Err(VfsError::Interrupted(
                        "event delivered while waiting for bio completion".into(),
                    ))
                }
            }
        }
        Ok(())
    }

    /// Free the request: drain every list and wake waiters with
    /// `Destroyed`. Entries drop their page references here.
    pub fn free(&self) {
        let mut inner = self.inner.lock();
        let inner = &mut *inner;
        for ent in inner
            .pending
            .drain(..)
            .chain(inner.error.drain(..))
            .chain(inner.completed.drain(..))
        {
            ent.unbind();
        }
        debug_assert!(inner.pending.is_empty() && inner.error.is_empty());

        self.waiters.wake_all(WakeReason::Destroyed);
    }

    /// Dispatch every pending entry through `strategy`, FIFO.
    ///
    /// Unbound entries are resolved against `resolve` (the device pool
    /// get/put cycle); bound entries are dispatched as-is. Returns the
    /// number of entries dispatched.
    pub(crate) fn dispatch<S, R, P>(
        &self,
        strategy: S,
        resolve: R,
        release: P,
    ) -> Result<usize>
    where
        S: Fn(&BioEntry) -> Result<()>,
        R: Fn(u64) -> Result<Arc<PageCache>>,
        P: Fn(&Arc<PageCache>, BioDirection, bool),
    {
        let is_async = self.is_async();
        let mut dispatched = 0usize;

        loop {
            let ent = {
                let mut inner = self.inner.lock();
                match inner.pending.pop_front() {
                    Some(ent) => ent,
                    None => break,
                }
            };

            ent.set_status(BioStatus::Submitted);

            // Resolve the target page when the entry carries only an
            // offset; such pages are released again after dispatch.
            let resolved_here = ent.page().is_none();
            if resolved_here {
                match resolve(ent.dev_offset()) {
                    Ok(pc) => {
                        if let Err(e) = ent.bind_page(&pc) {
                            ent.set_error(e);
                            self.inner.lock().error.push_back(ent);
                            continue;
                        }
                        if let Ok(page_size) = pc.pagesize_get() {
                            ent.set_whole_page(page_size);
                        }
                    }
                    Err(e) => {
                        ent.set_error(e);
                        self.inner.lock().error.push_back(ent);
                        continue;
                    }
                }
            }

            let result = strategy(&ent);
            dispatched += 1;

            let page = ent.page();
            match result {
                Ok(()) => {
                    ent.set_status(BioStatus::Done);
                    if let Some(pc) = &page {
                        release(pc, ent.direction(), resolved_here);
                    }
                    if is_async {
                        ent.unbind();
                    } else {
                        self.inner.lock().completed.push_back(ent);
                    }
                }
                Err(e) => {
                    tracing::warn!(
                        dev_offset = ent.dev_offset(),
                        error = %e,
                        "bio strategy dispatch failed"
                    );
                    ent.set_error(e);
                    if let Some(pc) = &page {
                        release(pc, ent.direction(), resolved_here);
                    }
                    self.inner.lock().error.push_back(ent);
                }
            }
        }

        self.waiters.wake_all(WakeReason::Released);
        Ok(dispatched)
    }
}

impl Drop for BioRequest {
    fn drop(&mut self) {
        self.free();
    }
}

impl std::fmt::Debug for BioRequest {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let inner = self.inner.lock();
        f.debug_struct("BioRequest")
            .field("pending", &inner.pending.len())
            .field("error", &inner.error.len())
            .field("completed", &inner.completed.len())
            .finish()
    }
}

// ============================================================================
// Tests
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_empty_queue_get_is_noent() {
        let req = BioRequest::new();
        assert!(matches!(req.next_entry(), Err(VfsError::NotFound(_))));
    }

    #[test]
    fn test_entries_dequeue_in_insertion_order() {
        let req = BioRequest::new();
        req.add(BioDirection::Read, 0).unwrap();
        req.add(BioDirection::Write, 4096).unwrap();
        req.add(BioDirection::Read, 4096).unwrap();
        assert_eq!(req.pending_len(), 3);

        let first = req.next_entry().unwrap();
        assert_eq!(first.dev_offset(), 0);
        assert_eq!(first.direction(), BioDirection::Read);

        let second = req.next_entry().unwrap();
        assert_eq!(second.dev_offset(), 4096);
        assert_eq!(second.direction(), BioDirection::Write);

        let third = req.next_entry().unwrap();
        assert_eq!(third.dev_offset(), 4096);
        assert_eq!(third.direction(), BioDirection::Read);

        assert!(req.next_entry().is_err());
    }

    #[test]
    fn test_free_drains_all_lists() {
        let req = BioRequest::new();
        req.add(BioDirection::Read, 0).unwrap();
        req.add(BioDirection::Read, 4096).unwrap();
        req.free();
        assert_eq!(req.pending_len(), 0);
        assert_eq!(req.error_len(), 0);
    }
}
