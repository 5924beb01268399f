//! In-process remote processor
//!
//! A deterministic stand-in for the channel, buffer manager, DMA allocator,
//! address mapper and clock. The simulated remote side runs a connection
//! broker that answers connect requests according to a [`HandshakePolicy`]
//! and an echo service that sends every application message straight back.
//! Replies are delivered synchronously from inside `send`, after the
//! channel's own lock is dropped, the way a fast remote would race a caller.

use crate::channel::{AddressMapper, Channel, DeviceAddr, EndpointAddr, EndpointHandler, RemoteLink};
use crate::error::{OffloadError, Result};
use crate::platform::{
    BufferManager, Clock, DmaAllocator, DmaTable, MemHandle, PhysAddr, PhysRegion, Platform,
};
use crate::wire::{self, ConnectRequest, ConnectResponse, Disconnect, Frame, MessageType};
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use tracing::{debug, trace};

/// Address of the remote connection broker
pub const BROKER_ADDR: EndpointAddr = 60;

/// First address handed to local endpoints
pub const FIRST_LOCAL_ADDR: EndpointAddr = 1024;

/// First address the broker assigns to remote sessions
pub const FIRST_REMOTE_ADDR: EndpointAddr = 0x1000;

/// Page size of the simulated memory
pub const PAGE_SIZE: u64 = 4096;

const LOOPBACK_FRAME_MAX: usize = 512;

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

// ============================================================================
// Channel
// ============================================================================

/// How the broker answers connect requests
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HandshakePolicy {
    /// Assign a remote address and reply with success
    Accept,
    /// Reply with the given non-zero status
    Reject(u32),
    /// Hold the reply until [`LoopbackChannel::release_deferred`]
    Defer,
    /// Never reply
    Ignore,
}

/// A frame observed on the wire
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SentFrame {
    pub src: EndpointAddr,
    pub dst: EndpointAddr,
    pub data: Vec<u8>,
}

impl SentFrame {
    pub fn message_type(&self) -> Option<MessageType> {
        Frame::decode(&self.data).ok().and_then(|f| f.message_type())
    }
}

struct Delivery {
    src: EndpointAddr,
    dst: EndpointAddr,
    data: Vec<u8>,
}

struct ChannelState {
    endpoints: HashMap<EndpointAddr, Arc<dyn EndpointHandler>>,
    next_local: EndpointAddr,
    next_remote: EndpointAddr,
    /// Remote session address -> (client endpoint, requested name)
    remote_sessions: HashMap<EndpointAddr, (EndpointAddr, String)>,
    policy: HandshakePolicy,
    deferred: Vec<Delivery>,
    sent: Vec<SentFrame>,
    alive: bool,
    echo: bool,
}

/// Simulated channel with a broker and an echo service behind it
pub struct LoopbackChannel {
    name: String,
    local_addr: EndpointAddr,
    state: Mutex<ChannelState>,
}

impl LoopbackChannel {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            local_addr: 0x35,
            state: Mutex::new(ChannelState {
                endpoints: HashMap::new(),
                next_local: FIRST_LOCAL_ADDR,
                next_remote: FIRST_REMOTE_ADDR,
                remote_sessions: HashMap::new(),
                policy: HandshakePolicy::Accept,
                deferred: Vec::new(),
                sent: Vec::new(),
                alive: true,
                echo: true,
            }),
        }
    }

    pub fn set_policy(&self, policy: HandshakePolicy) {
        lock(&self.state).policy = policy;
    }

    pub fn set_echo(&self, echo: bool) {
        lock(&self.state).echo = echo;
    }

    /// Stop (or resume) accepting sends, as a dead remote would
    pub fn set_alive(&self, alive: bool) {
        lock(&self.state).alive = alive;
    }

    /// Deliver every held broker reply. Returns how many were delivered.
    pub fn release_deferred(&self) -> usize {
        let deferred = std::mem::take(&mut lock(&self.state).deferred);
        let count = deferred.len();
        for delivery in deferred {
            self.deliver(delivery);
        }
        count
    }

    /// Deliver raw bytes to a local endpoint as if the remote sent them
    pub fn inject(&self, src: EndpointAddr, dst: EndpointAddr, data: &[u8]) {
        self.deliver(Delivery {
            src,
            dst,
            data: data.to_vec(),
        });
    }

    /// Send an application message from remote session `src` to its client
    pub fn push_to_client(&self, src: EndpointAddr, payload: &[u8]) -> Result<()> {
        let client = lock(&self.state)
            .remote_sessions
            .get(&src)
            .map(|(client, _)| *client)
            .ok_or_else(|| OffloadError::Transport(format!("no remote session {:#x}", src)))?;
        let frame = wire::encode(MessageType::ApplicationData, 0, payload, LOOPBACK_FRAME_MAX)?;
        self.inject(src, client, &frame);
        Ok(())
    }

    pub fn sent_frames(&self) -> Vec<SentFrame> {
        lock(&self.state).sent.clone()
    }

    pub fn sent_of_type(&self, msg_type: MessageType) -> Vec<SentFrame> {
        self.sent_frames()
            .into_iter()
            .filter(|frame| frame.message_type() == Some(msg_type))
            .collect()
    }

    pub fn clear_sent(&self) {
        lock(&self.state).sent.clear();
    }

    pub fn endpoint_count(&self) -> usize {
        lock(&self.state).endpoints.len()
    }

    pub fn has_endpoint(&self, addr: EndpointAddr) -> bool {
        lock(&self.state).endpoints.contains_key(&addr)
    }

    pub fn remote_session_count(&self) -> usize {
        lock(&self.state).remote_sessions.len()
    }

    fn deliver(&self, delivery: Delivery) {
        let handler = lock(&self.state).endpoints.get(&delivery.dst).cloned();
        match handler {
            Some(handler) => handler.on_message(&delivery.data, delivery.src),
            None => trace!("No endpoint at {:#x}, dropping", delivery.dst),
        }
    }

    /// Remote-side reaction to one frame
    fn remote_receive(state: &mut ChannelState, src: EndpointAddr, dst: EndpointAddr, data: &[u8]) -> Option<Delivery> {
        let frame = Frame::decode(data).ok()?;

        if dst == BROKER_ADDR {
            return match frame.message_type()? {
                MessageType::ConnectRequest => {
                    let name = ConnectRequest::parse_name(frame.payload).ok()?;
                    let response = match state.policy {
                        HandshakePolicy::Accept | HandshakePolicy::Defer => {
                            let addr = state.next_remote;
                            state.next_remote += 1;
                            state.remote_sessions.insert(addr, (src, name));
                            ConnectResponse { status: 0, addr }
                        }
                        HandshakePolicy::Reject(status) => ConnectResponse { status, addr: 0 },
                        HandshakePolicy::Ignore => return None,
                    };
                    let reply = wire::encode(
                        MessageType::ConnectResponse,
                        frame.header.flags,
                        &response.to_bytes(),
                        LOOPBACK_FRAME_MAX,
                    )
                    .ok()?;
                    let delivery = Delivery {
                        src: BROKER_ADDR,
                        dst: src,
                        data: reply,
                    };
                    if state.policy == HandshakePolicy::Defer {
                        state.deferred.push(delivery);
                        None
                    } else {
                        Some(delivery)
                    }
                }
                MessageType::Disconnect => {
                    let disconnect = Disconnect::decode(frame.payload).ok()?;
                    state.remote_sessions.remove(&disconnect.addr);
                    None
                }
                _ => None,
            };
        }

        if state.echo && state.remote_sessions.contains_key(&dst) {
            if frame.message_type()? == MessageType::ApplicationData {
                let echo = wire::encode(
                    MessageType::ApplicationData,
                    0,
                    frame.payload,
                    LOOPBACK_FRAME_MAX,
                )
                .ok()?;
                return Some(Delivery {
                    src: dst,
                    dst: src,
                    data: echo,
                });
            }
        }
        None
    }
}

impl Channel for LoopbackChannel {
    fn name(&self) -> &str {
        &self.name
    }

    fn local_addr(&self) -> EndpointAddr {
        self.local_addr
    }

    fn broker_addr(&self) -> EndpointAddr {
        BROKER_ADDR
    }

    fn create_endpoint(&self, handler: Arc<dyn EndpointHandler>) -> Result<EndpointAddr> {
        let mut state = lock(&self.state);
        let addr = state.next_local;
        state.next_local += 1;
        state.endpoints.insert(addr, handler);
        Ok(addr)
    }

    fn destroy_endpoint(&self, addr: EndpointAddr) {
        lock(&self.state).endpoints.remove(&addr);
    }

    fn send(&self, src: EndpointAddr, dst: EndpointAddr, data: &[u8]) -> Result<()> {
        let reply = {
            let mut state = lock(&self.state);
            if !state.alive {
                return Err(OffloadError::Transport("remote processor not responding".into()));
            }
            state.sent.push(SentFrame {
                src,
                dst,
                data: data.to_vec(),
            });
            Self::remote_receive(&mut state, src, dst, data)
        };

        debug!("Loopback {:#x} -> {:#x}: {} bytes", src, dst, data.len());
        if let Some(reply) = reply {
            self.deliver(reply);
        }
        Ok(())
    }
}

// ============================================================================
// Memory
// ============================================================================

/// Backing of a simulated buffer
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SimBuffer {
    Contiguous { pa: PhysAddr, len: usize },
    Scattered(Vec<PhysAddr>),
}

struct MemoryState {
    descriptors: HashMap<i32, Vec<SimBuffer>>,
    handles: HashMap<u64, SimBuffer>,
    next_handle: u64,
    releases: HashMap<u64, usize>,
    dma_mapped: HashMap<u64, usize>,
    tables: HashMap<DeviceAddr, Vec<PhysAddr>>,
    next_table: DeviceAddr,
    fail_table_alloc: bool,
    ignore_shared_limit: bool,
}

/// Simulated buffer manager and DMA allocator
pub struct LoopbackMemory {
    state: Mutex<MemoryState>,
}

impl Default for LoopbackMemory {
    fn default() -> Self {
        Self::new()
    }
}

impl LoopbackMemory {
    pub fn new() -> Self {
        Self {
            state: Mutex::new(MemoryState {
                descriptors: HashMap::new(),
                handles: HashMap::new(),
                next_handle: 1,
                releases: HashMap::new(),
                dma_mapped: HashMap::new(),
                tables: HashMap::new(),
                next_table: 0x9000_0000,
                fail_table_alloc: false,
                ignore_shared_limit: false,
            }),
        }
    }

    /// Make `buffers` importable through descriptor `fd`
    pub fn add_buffers(&self, fd: i32, buffers: Vec<SimBuffer>) {
        lock(&self.state).descriptors.insert(fd, buffers);
    }

    pub fn add_contiguous(&self, fd: i32, pa: PhysAddr, len: usize) {
        self.add_buffers(fd, vec![SimBuffer::Contiguous { pa, len }]);
    }

    pub fn add_scattered(&self, fd: i32, pages: Vec<PhysAddr>) {
        self.add_buffers(fd, vec![SimBuffer::Scattered(pages)]);
    }

    /// Import every buffer behind a shared reference, past the caller's limit
    pub fn ignore_shared_limit(&self) {
        lock(&self.state).ignore_shared_limit = true;
    }

    /// Make the next page table allocation fail
    pub fn fail_next_table_alloc(&self) {
        lock(&self.state).fail_table_alloc = true;
    }

    pub fn live_handles(&self) -> usize {
        lock(&self.state).handles.len()
    }

    /// How many times `handle` was released
    pub fn release_count(&self, handle: MemHandle) -> usize {
        lock(&self.state).releases.get(&handle.0).copied().unwrap_or(0)
    }

    pub fn live_dma_mappings(&self) -> usize {
        lock(&self.state).dma_mapped.values().sum()
    }

    pub fn live_tables(&self) -> usize {
        lock(&self.state).tables.len()
    }

    /// Contents of the page table at `dma_addr`
    pub fn page_table(&self, dma_addr: DeviceAddr) -> Option<Vec<PhysAddr>> {
        lock(&self.state).tables.get(&dma_addr).cloned()
    }

    fn import(state: &mut MemoryState, buffer: SimBuffer) -> MemHandle {
        let id = state.next_handle;
        state.next_handle += 1;
        state.handles.insert(id, buffer);
        MemHandle(id)
    }
}

impl BufferManager for LoopbackMemory {
    fn import_fd(&self, fd: i32) -> Result<MemHandle> {
        let mut state = lock(&self.state);
        let buffer = state
            .descriptors
            .get(&fd)
            .and_then(|buffers| buffers.first().cloned())
            .ok_or(OffloadError::BadDescriptor(fd))?;
        Ok(Self::import(&mut state, buffer))
    }

    fn import_shared(&self, fd: i32, max: usize) -> Result<Vec<MemHandle>> {
        let mut state = lock(&self.state);
        let buffers = state
            .descriptors
            .get(&fd)
            .cloned()
            .ok_or(OffloadError::BadDescriptor(fd))?;
        let limit = if state.ignore_shared_limit { usize::MAX } else { max };
        Ok(buffers
            .into_iter()
            .take(limit)
            .map(|buffer| Self::import(&mut state, buffer))
            .collect())
    }

    fn phys(&self, handle: MemHandle) -> Result<PhysRegion> {
        match lock(&self.state).handles.get(&handle.0) {
            Some(SimBuffer::Contiguous { pa, len }) => Ok(PhysRegion {
                addr: *pa,
                len: *len,
            }),
            Some(SimBuffer::Scattered(_)) => Err(OffloadError::UnresolvableBuffer(handle.0 as u32)),
            None => Err(OffloadError::UnresolvableBuffer(handle.0 as u32)),
        }
    }

    fn map_dma(&self, handle: MemHandle) -> Result<Vec<PhysAddr>> {
        let mut state = lock(&self.state);
        let pages = match state.handles.get(&handle.0) {
            Some(SimBuffer::Scattered(pages)) => pages.clone(),
            Some(SimBuffer::Contiguous { pa, len }) => {
                let count = (*len as u64).div_ceil(PAGE_SIZE);
                (0..count).map(|page| pa + page * PAGE_SIZE).collect()
            }
            None => return Err(OffloadError::UnresolvableBuffer(handle.0 as u32)),
        };
        *state.dma_mapped.entry(handle.0).or_insert(0) += 1;
        Ok(pages)
    }

    fn unmap_dma(&self, handle: MemHandle) {
        let mut state = lock(&self.state);
        if let Some(count) = state.dma_mapped.get_mut(&handle.0) {
            *count -= 1;
            if *count == 0 {
                state.dma_mapped.remove(&handle.0);
            }
        }
    }

    fn release(&self, handle: MemHandle) {
        let mut state = lock(&self.state);
        state.handles.remove(&handle.0);
        *state.releases.entry(handle.0).or_insert(0) += 1;
    }
}

impl DmaAllocator for LoopbackMemory {
    fn alloc_page_table(&self, pages: &[PhysAddr]) -> Result<DmaTable> {
        let mut state = lock(&self.state);
        if std::mem::take(&mut state.fail_table_alloc) {
            return Err(OffloadError::ResourceExhausted("coherent pool empty".into()));
        }

        let dma_addr = state.next_table;
        let bytes = (pages.len() * std::mem::size_of::<u32>()) as u32;
        state.next_table += bytes.div_ceil(64) * 64;
        state.tables.insert(dma_addr, pages.to_vec());
        Ok(DmaTable {
            dma_addr,
            entries: pages.len(),
        })
    }

    fn free_page_table(&self, table: DmaTable) {
        lock(&self.state).tables.remove(&table.dma_addr);
    }
}

// ============================================================================
// Mapper and clock
// ============================================================================

/// Maps one physical window linearly into the remote address space
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LinearMapper {
    pub pa_base: PhysAddr,
    pub da_base: DeviceAddr,
    pub len: u64,
}

impl LinearMapper {
    /// 256 MiB of RAM at 0x8000_0000 seen by the remote at 0xA000_0000
    pub fn carveout() -> Self {
        Self {
            pa_base: 0x8000_0000,
            da_base: 0xA000_0000,
            len: 0x1000_0000,
        }
    }
}

impl AddressMapper for LinearMapper {
    fn pa_to_da(&self, pa: PhysAddr) -> Result<DeviceAddr> {
        if pa < self.pa_base || pa - self.pa_base >= self.len {
            return Err(OffloadError::UnresolvableBuffer(pa as u32));
        }
        Ok(self.da_base + (pa - self.pa_base) as DeviceAddr)
    }
}

/// Clock advancing one tick per read
#[derive(Debug, Default)]
pub struct StepClock {
    ticks: AtomicU64,
}

impl StepClock {
    pub fn new(start: u64) -> Self {
        Self {
            ticks: AtomicU64::new(start),
        }
    }
}

impl Clock for StepClock {
    fn persistent_ticks(&self) -> u64 {
        self.ticks.fetch_add(1, Ordering::Relaxed)
    }

    fn sync_32k(&self) -> u32 {
        self.ticks.load(Ordering::Relaxed) as u32
    }
}

// ============================================================================
// Bundle
// ============================================================================

/// A complete simulated remote processor
#[derive(Clone)]
pub struct Loopback {
    pub channel: Arc<LoopbackChannel>,
    pub memory: Arc<LoopbackMemory>,
    pub mapper: Arc<LinearMapper>,
    pub clock: Arc<StepClock>,
}

impl Loopback {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            channel: Arc::new(LoopbackChannel::new(name)),
            memory: Arc::new(LoopbackMemory::new()),
            mapper: Arc::new(LinearMapper::carveout()),
            clock: Arc::new(StepClock::new(0)),
        }
    }

    /// Fresh channel for the same memory, as after a remote recovery
    pub fn recovered(&self) -> Self {
        Self {
            channel: Arc::new(LoopbackChannel::new(self.channel.name())),
            ..self.clone()
        }
    }

    pub fn link(&self) -> RemoteLink {
        RemoteLink::new(self.channel.clone(), self.mapper.clone())
    }

    pub fn platform(&self) -> Platform {
        Platform::new(self.memory.clone(), self.memory.clone(), self.clock.clone())
    }
}
