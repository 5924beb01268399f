//! Platform memory and clock interfaces
//!
//! Buffer ownership lives in an external buffer manager; the bridge only
//! resolves, imports and releases handles through it.

use crate::channel::DeviceAddr;
use crate::error::Result;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::sync::Arc;

/// Physical address
pub type PhysAddr = u64;

/// Opaque handle issued by the buffer manager
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct MemHandle(pub u64);

/// A physically contiguous region
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct PhysRegion {
    pub addr: PhysAddr,
    pub len: usize,
}

/// External buffer manager
pub trait BufferManager: Send + Sync {
    /// Import the buffer behind a descriptor
    fn import_fd(&self, fd: i32) -> Result<MemHandle>;

    /// Import every buffer behind a shared reference, at most `max`
    fn import_shared(&self, fd: i32, max: usize) -> Result<Vec<MemHandle>>;

    /// Resolve a handle to one contiguous region. Fails for page-scattered
    /// buffers.
    fn phys(&self, handle: MemHandle) -> Result<PhysRegion>;

    /// Map a handle for DMA and return the physical address of each page
    fn map_dma(&self, handle: MemHandle) -> Result<Vec<PhysAddr>>;

    /// Undo `map_dma`
    fn unmap_dma(&self, handle: MemHandle);

    /// Drop the caller's reference to a handle
    fn release(&self, handle: MemHandle);
}

/// A device-visible table of page addresses
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct DmaTable {
    /// Address the remote processor uses to walk the table
    pub dma_addr: DeviceAddr,
    /// Number of pointer-sized entries
    pub entries: usize,
}

/// Coherent DMA memory for page tables
pub trait DmaAllocator: Send + Sync {
    /// Allocate a table holding `pages` and fill it
    fn alloc_page_table(&self, pages: &[PhysAddr]) -> Result<DmaTable>;

    fn free_page_table(&self, table: DmaTable);
}

/// Host timer sources shared with the remote processor
pub trait Clock: Send + Sync {
    /// Free-running persistent counter
    fn persistent_ticks(&self) -> u64;

    /// 32 kHz sync timer register
    fn sync_32k(&self) -> u32;
}

/// Timer snapshot returned by the timer query
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct TimerSnapshot {
    pub persistent_timer: u64,
    pub clock32k: u32,
}

impl TimerSnapshot {
    pub fn capture(clock: &dyn Clock) -> Self {
        Self {
            persistent_timer: clock.persistent_ticks(),
            clock32k: clock.sync_32k(),
        }
    }
}

/// Platform services shared by every connection
#[derive(Clone)]
pub struct Platform {
    pub buffers: Arc<dyn BufferManager>,
    pub dma: Arc<dyn DmaAllocator>,
    pub clock: Arc<dyn Clock>,
}

impl Platform {
    pub fn new(
        buffers: Arc<dyn BufferManager>,
        dma: Arc<dyn DmaAllocator>,
        clock: Arc<dyn Clock>,
    ) -> Self {
        Self {
            buffers,
            dma,
            clock,
        }
    }
}

impl fmt::Debug for Platform {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Platform").finish_non_exhaustive()
    }
}
