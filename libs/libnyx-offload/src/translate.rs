//! Buffer reference translation
//!
//! Application payloads may embed up to three buffer references that the
//! remote processor has to dereference. Before a payload leaves the host,
//! each reference is replaced in place by an address valid on the remote
//! side. Payload layout:
//!
//! ```text
//! +---------------------+---------------+-------------+-----+----------------+
//! | packet header (20B) | map_type u32  | offset i32  | ... | ref slots (4B) |
//! +---------------------+---------------+-------------+-----+----------------+
//!                       ^ packet data   `-- offset from packet data start --^
//! ```

use crate::buffers::{BufferEntry, BufferHandle, BufferRegistry, BufferWrapper};
use crate::channel::{AddressMapper, DeviceAddr};
use crate::error::{OffloadError, Result};
use crate::platform::{BufferManager, DmaAllocator, MemHandle};
use crate::wire::read_u32;
use tracing::{debug, warn};

/// Packet header preceding the map info
pub const PACKET_HEADER_SIZE: usize = 20;

/// `map_type` plus `offset`
pub const MAP_INFO_SIZE: usize = 8;

/// Width of one reference slot on the remote side
pub const SLOT_SIZE: usize = 4;

/// How many references a payload carries
#[repr(u32)]
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum MapType {
    None = 0,
    OneBuf = 1,
    TwoBuf = 2,
    ThreeBuf = 3,
}

impl MapType {
    pub fn from_raw(raw: u32) -> Result<Self> {
        match raw {
            0 => Ok(Self::None),
            1 => Ok(Self::OneBuf),
            2 => Ok(Self::TwoBuf),
            3 => Ok(Self::ThreeBuf),
            other => Err(OffloadError::InvalidMapInfo(format!("map type {:#x}", other))),
        }
    }

    pub fn count(self) -> usize {
        self as usize
    }
}

/// Resolves registered buffer handles to remote device addresses
pub struct AddressTranslator<'a> {
    registry: &'a BufferRegistry,
    buffers: &'a dyn BufferManager,
    mapper: &'a dyn AddressMapper,
}

impl<'a> AddressTranslator<'a> {
    pub fn new(
        registry: &'a BufferRegistry,
        buffers: &'a dyn BufferManager,
        mapper: &'a dyn AddressMapper,
    ) -> Self {
        Self {
            registry,
            buffers,
            mapper,
        }
    }

    /// Translate one client reference.
    ///
    /// Plain buffers are resolved to a physical address and mapped into the
    /// remote processor's address space. Paged buffers hand over their page
    /// table address as is; the remote side walks the table itself.
    pub fn resolve(&self, raw: u32) -> Result<DeviceAddr> {
        match self.registry.get(BufferHandle::from_raw(raw)) {
            Some(BufferEntry::Plain(mem)) => {
                let region = self.buffers.phys(*mem).map_err(|e| {
                    warn!("Buffer {:#x} lost its physical backing: {}", raw, e);
                    OffloadError::UnresolvableBuffer(raw)
                })?;
                self.mapper.pa_to_da(region.addr)
            }
            Some(BufferEntry::Paged(wrapper)) => Ok(wrapper.table.dma_addr),
            None => Err(OffloadError::UnresolvableBuffer(raw)),
        }
    }

    /// Patch every reference in an outbound payload.
    ///
    /// Returns the number of slots rewritten. Payloads too short to carry a
    /// map type pass through untouched.
    pub fn patch(&self, payload: &mut [u8]) -> Result<usize> {
        if payload.len() < PACKET_HEADER_SIZE + 4 {
            return Ok(0);
        }
        let data = &mut payload[PACKET_HEADER_SIZE..];

        let map_type = MapType::from_raw(read_u32(data, 0))?;
        if map_type == MapType::None {
            return Ok(0);
        }
        if data.len() < MAP_INFO_SIZE {
            return Err(OffloadError::InvalidMapInfo("missing reference offset".into()));
        }

        let offset = read_u32(data, 4) as i32;
        if offset < MAP_INFO_SIZE as i32 {
            return Err(OffloadError::InvalidMapInfo(format!("reference offset {}", offset)));
        }
        let offset = offset as usize;
        let end = offset + map_type.count() * SLOT_SIZE;
        if end > data.len() {
            return Err(OffloadError::InvalidMapInfo(format!(
                "{} references at offset {} overrun {}-byte packet data",
                map_type.count(),
                offset,
                data.len()
            )));
        }

        let mut patched = 0;
        for index in 0..map_type.count() {
            let at = offset + index * SLOT_SIZE;
            let raw = read_u32(data, at);
            // Only the first reference is mandatory
            if index > 0 && raw == 0 {
                continue;
            }
            let da = self.resolve(raw).map_err(|e| {
                warn!("Buffer lookup failed for reference {}: {}", index, e);
                e
            })?;
            data[at..at + SLOT_SIZE].copy_from_slice(&da.to_le_bytes());
            patched += 1;
        }

        debug!("Translated {} buffer references", patched);
        Ok(patched)
    }
}

/// Classify an imported handle.
///
/// Contiguous buffers become plain entries. Page-scattered ones get a
/// device-visible table of their page addresses. On failure the DMA mapping
/// is undone; the handle itself stays with the caller.
pub fn wrap_handle(
    mem: MemHandle,
    buffers: &dyn BufferManager,
    dma: &dyn DmaAllocator,
) -> Result<BufferEntry> {
    if buffers.phys(mem).is_ok() {
        return Ok(BufferEntry::Plain(mem));
    }

    let pages = buffers.map_dma(mem).map_err(|e| {
        warn!("Failed to get scatter list for {:?}: {}", mem, e);
        OffloadError::PageTableAlloc(format!("scatter list unavailable: {}", e))
    })?;

    if pages.is_empty() {
        buffers.unmap_dma(mem);
        return Err(OffloadError::PageTableAlloc("empty scatter list".into()));
    }

    let table = match dma.alloc_page_table(&pages) {
        Ok(table) => table,
        Err(e) => {
            warn!("Failed to allocate {}-entry page table: {}", pages.len(), e);
            buffers.unmap_dma(mem);
            return Err(OffloadError::PageTableAlloc(e.to_string()));
        }
    };

    debug!(
        "Wrapped {:?}: {} pages, table at {:#x}",
        mem,
        pages.len(),
        table.dma_addr
    );

    Ok(BufferEntry::Paged(BufferWrapper {
        mem,
        pages: pages.len(),
        table,
    }))
}
