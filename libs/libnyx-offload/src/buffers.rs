//! Per-connection buffer registry
//!
//! Registered buffers live in a small arena. Clients get back a 32-bit
//! [`BufferHandle`] that packs the entry kind, the arena slot and the slot's
//! generation, so lookups are O(1) and a handle outliving its entry is
//! rejected instead of aliasing whatever reused the slot.

use crate::error::{OffloadError, Result};
use crate::platform::{BufferManager, DmaAllocator, DmaTable, MemHandle};
use serde::{Deserialize, Serialize};
use std::fmt;

const KIND_SHIFT: u32 = 30;
const GEN_SHIFT: u32 = 16;
const GEN_MASK: u32 = 0x3FFF;
const SLOT_MASK: u32 = 0xFFFF;

/// Maximum registered buffers per connection
pub const MAX_BUFFERS: usize = SLOT_MASK as usize + 1;

/// Discriminant carried in every handle
#[repr(u32)]
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum BufferKind {
    /// Physically contiguous buffer, translated on every use
    Plain = 1,
    /// Page-scattered buffer wrapped with a device-visible page table
    Paged = 2,
}

/// Client-visible handle to a registered buffer. Never zero.
#[derive(Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct BufferHandle(u32);

impl BufferHandle {
    fn new(kind: BufferKind, generation: u16, slot: u16) -> Self {
        Self(
            ((kind as u32) << KIND_SHIFT)
                | ((generation as u32 & GEN_MASK) << GEN_SHIFT)
                | slot as u32,
        )
    }

    /// Reinterpret a raw value taken from a client payload
    pub fn from_raw(raw: u32) -> Self {
        Self(raw)
    }

    pub fn raw(self) -> u32 {
        self.0
    }

    pub fn kind(self) -> Option<BufferKind> {
        match self.0 >> KIND_SHIFT {
            1 => Some(BufferKind::Plain),
            2 => Some(BufferKind::Paged),
            _ => None,
        }
    }

    fn generation(self) -> u16 {
        ((self.0 >> GEN_SHIFT) & GEN_MASK) as u16
    }

    fn slot(self) -> usize {
        (self.0 & SLOT_MASK) as usize
    }
}

impl fmt::Debug for BufferHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "BufferHandle({:#010x})", self.0)
    }
}

/// Multi-page buffer with its page-address table
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BufferWrapper {
    pub mem: MemHandle,
    pub pages: usize,
    pub table: DmaTable,
}

/// A registered buffer
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum BufferEntry {
    Plain(MemHandle),
    Paged(BufferWrapper),
}

impl BufferEntry {
    pub fn kind(&self) -> BufferKind {
        match self {
            Self::Plain(_) => BufferKind::Plain,
            Self::Paged(_) => BufferKind::Paged,
        }
    }

    pub fn mem(&self) -> MemHandle {
        match self {
            Self::Plain(mem) => *mem,
            Self::Paged(wrapper) => wrapper.mem,
        }
    }

    /// Give everything this entry holds back to the platform
    pub fn release(self, buffers: &dyn BufferManager, dma: &dyn DmaAllocator) {
        match self {
            Self::Plain(mem) => buffers.release(mem),
            Self::Paged(wrapper) => {
                dma.free_page_table(wrapper.table);
                buffers.unmap_dma(wrapper.mem);
                buffers.release(wrapper.mem);
            }
        }
    }
}

#[derive(Debug, Default)]
struct Slot {
    generation: u16,
    entry: Option<BufferEntry>,
}

/// Arena of registered buffers
#[derive(Debug, Default)]
pub struct BufferRegistry {
    slots: Vec<Slot>,
    free: Vec<u16>,
    live: usize,
}

impl BufferRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register an entry and hand out its handle
    pub fn insert(&mut self, entry: BufferEntry) -> Result<BufferHandle> {
        let kind = entry.kind();
        let slot = match self.free.pop() {
            Some(slot) => slot,
            None => {
                if self.slots.len() >= MAX_BUFFERS {
                    return Err(OffloadError::ResourceExhausted(format!(
                        "buffer registry full ({} entries)",
                        MAX_BUFFERS
                    )));
                }
                self.slots.push(Slot::default());
                (self.slots.len() - 1) as u16
            }
        };

        let cell = &mut self.slots[slot as usize];
        cell.entry = Some(entry);
        self.live += 1;
        Ok(BufferHandle::new(kind, cell.generation, slot))
    }

    /// Look up a live entry; stale, forged or mistyped handles yield `None`
    pub fn get(&self, handle: BufferHandle) -> Option<&BufferEntry> {
        let kind = handle.kind()?;
        let cell = self.slots.get(handle.slot())?;
        if cell.generation & GEN_MASK as u16 != handle.generation() {
            return None;
        }
        cell.entry.as_ref().filter(|entry| entry.kind() == kind)
    }

    pub fn contains(&self, handle: BufferHandle) -> bool {
        self.get(handle).is_some()
    }

    /// Unregister an entry, retiring its handle
    pub fn remove(&mut self, handle: BufferHandle) -> Option<BufferEntry> {
        self.get(handle)?;

        let slot = handle.slot();
        let cell = &mut self.slots[slot];
        let entry = cell.entry.take();
        cell.generation = cell.generation.wrapping_add(1) & GEN_MASK as u16;
        self.free.push(slot as u16);
        self.live -= 1;
        entry
    }

    /// Remove every entry
    pub fn drain(&mut self) -> Vec<BufferEntry> {
        let mut entries = Vec::with_capacity(self.live);
        for (slot, cell) in self.slots.iter_mut().enumerate() {
            if let Some(entry) = cell.entry.take() {
                cell.generation = cell.generation.wrapping_add(1) & GEN_MASK as u16;
                self.free.push(slot as u16);
                entries.push(entry);
            }
        }
        self.live = 0;
        entries
    }

    pub fn len(&self) -> usize {
        self.live
    }

    pub fn is_empty(&self) -> bool {
        self.live == 0
    }
}
