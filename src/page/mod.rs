// # Page Frames
//
// Page-aligned backing memory for the cache layers. `PageBuffer` is the
// raw 4KB aligned byte array; `PageFrame` is one allocated buffer tagged
// with its usage; `FrameAllocator` hands frames out and keeps per-usage
// accounting so reclamation pressure and leaks are observable. Tests may
// cap the allocator to provoke out-of-memory paths.

use crate::error::{Result, VfsError};
use once_cell::sync::Lazy;
use std::sync::atomic::{AtomicUsize, Ordering};

/// Cached page size (4KB)
pub const PAGE_SIZE: usize = 4096;

// ============================================================================
// Page Buffer - Aligned Memory
// ============================================================================

/// Page-aligned buffer.
///
/// `#[repr(C, align(4096))]` keeps the layout predictable and the start
/// address page-aligned, so a frame can later be handed to direct I/O
/// without copying.
#[repr(C, align(4096))]
#[derive(Clone)]
pub struct PageBuffer {
    data: [u8; PAGE_SIZE],
}

impl PageBuffer {
    /// Create a new zeroed page buffer
    #[inline]
    pub fn new() -> Self {
        Self {
            data: [0u8; PAGE_SIZE],
        }
    }

    /// Immutable page contents
    #[inline(always)]
    pub fn data(&self) -> &[u8] {
        &self.data
    }

    /// Mutable page contents
    #[inline(always)]
    pub fn data_mut(&mut self) -> &mut [u8] {
        &mut self.data
    }

    /// Zero the entire page
    #[inline]
    pub fn zero(&mut self) {
        self.data.fill(0);
    }

    /// Copy another buffer's contents into this one
    #[inline]
    pub fn copy_from(&mut self, other: &PageBuffer) {
        self.data.copy_from_slice(&other.data);
    }

    /// CRC32 of the page contents
    #[inline]
    pub fn checksum(&self) -> u32 {
        crc32fast::hash(&self.data)
    }
}

impl Default for PageBuffer {
    fn default() -> Self {
        Self::new()
    }
}

// ============================================================================
// Frame Allocator
// ============================================================================

/// What an allocated frame is used for
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PageUsage {
    /// Backing a page-cache page
    PageCache,

    /// Anonymous working memory
    Anonymous,

    /// Kernel-internal data
    KernelData,
}

impl PageUsage {
    fn index(self) -> usize {
        match self {
            PageUsage::PageCache => 0,
            PageUsage::Anonymous => 1,
            PageUsage::KernelData => 2,
        }
    }
}

/// One allocated, usage-tagged page frame.
///
/// Returning the frame to the allocator's accounting happens on drop.
pub struct PageFrame {
    buffer: Box<PageBuffer>,
    usage: PageUsage,
}

impl PageFrame {
    /// Frame usage tag
    #[inline]
    pub fn usage(&self) -> PageUsage {
        self.usage
    }

    /// Immutable frame contents
    #[inline(always)]
    pub fn data(&self) -> &[u8] {
        self.buffer.data()
    }

    /// Mutable frame contents
    #[inline(always)]
    pub fn data_mut(&mut self) -> &mut [u8] {
        self.buffer.data_mut()
    }

    /// The underlying aligned buffer
    #[inline]
    pub fn buffer(&self) -> &PageBuffer {
        &self.buffer
    }

    /// Zero the frame
    #[inline]
    pub fn zero(&mut self) {
        self.buffer.zero();
    }
}

impl Drop for PageFrame {
    fn drop(&mut self) {
        frame_allocator().note_freed(self.usage);
    }
}

impl std::fmt::Debug for PageFrame {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PageFrame")
            .field("usage", &self.usage)
            .finish_non_exhaustive()
    }
}

/// Per-usage outstanding counts
#[derive(Debug, Clone, Default)]
pub struct FrameStats {
    pub page_cache: usize,
    pub anonymous: usize,
    pub kernel_data: usize,
}

impl FrameStats {
    pub fn total(&self) -> usize {
        self.page_cache + self.anonymous + self.kernel_data
    }
}

/// Process-wide frame allocator with usage accounting
pub struct FrameAllocator {
    in_use: [AtomicUsize; 3],
    capacity: AtomicUsize,
}

/// Capacity sentinel meaning "unbounded"
const UNBOUNDED: usize = usize::MAX;

impl FrameAllocator {
    fn new() -> Self {
        Self {
            in_use: [AtomicUsize::new(0), AtomicUsize::new(0), AtomicUsize::new(0)],
            capacity: AtomicUsize::new(UNBOUNDED),
        }
    }

    /// Allocate a zeroed frame tagged with `usage`
    pub fn allocate(&self, usage: PageUsage) -> Result<PageFrame> {
        let cap = self.capacity.load(Ordering::Acquire);
        if cap != UNBOUNDED {
            let total: usize = self.in_use.iter().map(|c| c.load(Ordering::Acquire)).sum();
            if total >= cap {
                return Err(VfsError::OutOfMemory(format!(
                    "frame allocator at capacity ({cap} frames)"
                )));
            }
        }

        self.in_use[usage.index()].fetch_add(1, Ordering::AcqRel);
        Ok(PageFrame {
            buffer: Box::new(PageBuffer::new()),
            usage,
        })
    }

    fn note_freed(&self, usage: PageUsage) {
        let old = self.in_use[usage.index()].fetch_sub(1, Ordering::AcqRel);
        debug_assert!(old > 0, "frame accounting underflow");
    }

    /// Outstanding frame counts by usage
    pub fn stats(&self) -> FrameStats {
        FrameStats {
            page_cache: self.in_use[0].load(Ordering::Acquire),
            anonymous: self.in_use[1].load(Ordering::Acquire),
            kernel_data: self.in_use[2].load(Ordering::Acquire),
        }
    }

    /// Cap total outstanding frames; `None` removes the cap
    pub fn set_capacity(&self, frames: Option<usize>) {
        self.capacity
            .store(frames.unwrap_or(UNBOUNDED), Ordering::Release);
    }
}

static FRAME_ALLOCATOR: Lazy<FrameAllocator> = Lazy::new(FrameAllocator::new);

/// The process-wide frame allocator handle
pub fn frame_allocator() -> &'static FrameAllocator {
    &FRAME_ALLOCATOR
}

// ============================================================================
// Tests
// ============================================================================
