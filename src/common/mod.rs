// # Common Types
//
// Shared identifiers, device-number arithmetic, and crate-wide
// configuration used by every layer of the storage stack.

use serde::{Deserialize, Serialize};

// ============================================================================
// Type Aliases - Shared Identifiers
// ============================================================================

/// Block device identifier (major/minor packed, see [`mkdev`])
pub type DeviceId = u64;

/// Mount point identifier
pub type MountId = u64;

/// V-node identifier within one mount
pub type VnodeId = u64;

/// Device block number
pub type BlockNo = u64;

/// Invalid device ID sentinel
pub const INVALID_DEVICE_ID: DeviceId = 0;

/// Invalid mount ID sentinel
pub const INVALID_MOUNT_ID: MountId = 0;

/// Invalid v-node ID sentinel
pub const INVALID_VNODE_ID: VnodeId = u64::MAX;

// ============================================================================
// Device Number Arithmetic
// ============================================================================

const MINOR_BITS: u32 = 20;
const MINOR_MASK: u64 = (1 << MINOR_BITS) - 1;

/// Pack a major/minor pair into a device ID
#[inline]
pub fn mkdev(major: u32, minor: u32) -> DeviceId {
    ((major as u64) << MINOR_BITS) | (minor as u64 & MINOR_MASK)
}

/// Extract the major number from a device ID
#[inline]
pub fn dev_major(devid: DeviceId) -> u32 {
    (devid >> MINOR_BITS) as u32
}

/// Extract the minor number from a device ID
#[inline]
pub fn dev_minor(devid: DeviceId) -> u32 {
    (devid & MINOR_MASK) as u32
}

// ============================================================================
// Size Limits
// ============================================================================

/// Default cached page size (4KB)
pub const DEFAULT_PAGE_SIZE: usize = 4096;

/// Default file descriptor table size (entries)
pub const DEFAULT_FD_TABLE_SIZE: usize = 128;

/// Hard ceiling on a file descriptor table size (entries)
pub const MAX_FD_TABLE_SIZE: usize = 2048;

/// Maximum path walk depth before the lookup gives up
pub const MAX_LOOKUP_DEPTH: usize = 32;

// ============================================================================
// Configuration
// ============================================================================

/// Crate-wide tunables.
///
/// The defaults are the documented behaviour; tests override individual
/// fields to provoke boundary conditions.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StorageConfig {
    /// Cached page size in bytes (must be a power of two)
    pub page_size: usize,

    /// Initial file descriptor table size per I/O context
    pub fd_table_size: usize,

    /// Ceiling any FD table resize must stay under
    pub max_fd_table_size: usize,

    /// Optional cap on outstanding page frames (None = unbounded)
    pub max_page_frames: Option<usize>,
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            page_size: DEFAULT_PAGE_SIZE,
            fd_table_size: DEFAULT_FD_TABLE_SIZE,
            max_fd_table_size: MAX_FD_TABLE_SIZE,
            max_page_frames: None,
        }
    }
}

// ============================================================================
// Tracing Setup
// ============================================================================

/// Install a fmt subscriber at debug level.
///
/// Idempotent; later calls are no-ops so tests may call it freely.
pub fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_max_level(tracing::Level::DEBUG)
        .with_target(true)
        .try_init();
}

// ============================================================================
// Tests
// ============================================================================
