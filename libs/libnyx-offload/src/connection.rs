//! Client connections
//!
//! One [`Connection`] per opened session. It owns a local endpoint on the
//! service's channel, runs the connect handshake with the remote broker,
//! translates outbound buffer references and queues inbound application
//! messages.
//!
//! Two contexts touch a connection: client tasks (connect, read, write,
//! buffer registration) and the channel's receive callback. Both serialize
//! on the connection lock, which is only ever held for a state update and is
//! never held across a channel send.
//!
//! ```text
//!  UNCONNECTED --connect--> CONNECTING --reply ok--> CONNECTED
//!       ^                       |
//!       +---timeout/interrupt---+        any state --crash/reply err--> FAILED
//! ```

use crate::buffers::{BufferHandle, BufferRegistry};
use crate::channel::{EndpointAddr, EndpointHandler, RemoteLink};
use crate::config::OffloadConfig;
use crate::error::{OffloadError, Result};
use crate::platform::{MemHandle, Platform, TimerSnapshot};
use crate::queue::{DeliveryQueue, Interrupt};
use crate::service::Service;
use crate::translate::{wrap_handle, AddressTranslator};
use crate::wire::{self, ConnectRequest, ConnectResponse, Disconnect, Frame, MessageType};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::sync::{Arc, Mutex, MutexGuard, OnceLock, Weak};
use tokio::sync::Notify;
use tokio::time::Instant;
use tracing::{debug, error, info, trace, warn};

/// Connection states
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ConnectionState {
    /// Opened, no handshake yet (or the last one timed out)
    Unconnected,
    /// Handshake request sent, waiting for the broker
    Connecting,
    /// Remote endpoint assigned
    Connected,
    /// Remote processor lost or refused; terminal
    Failed,
}

bitflags::bitflags! {
    /// Readiness reported by a poll
    #[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
    pub struct Readiness: u32 {
        /// A queued message can be read
        const READABLE = 1 << 0;
        /// A write would be accepted
        const WRITABLE = 1 << 1;
        /// The connection failed
        const ERROR = 1 << 2;
    }
}

/// Snapshot of one connection
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SessionInfo {
    pub service: String,
    pub state: ConnectionState,
    pub local_addr: EndpointAddr,
    pub remote_addr: Option<EndpointAddr>,
    pub buffers: usize,
    pub queued: usize,
}

struct ConnectionInner {
    state: ConnectionState,
    remote_addr: Option<EndpointAddr>,
    /// Sequence of the outstanding connect request
    handshake: Option<u32>,
    last_sequence: u32,
    buffers: BufferRegistry,
    endpoint_live: bool,
    released: bool,
}

impl ConnectionInner {
    fn next_sequence(&mut self) -> u32 {
        self.last_sequence = self.last_sequence.wrapping_add(1).max(1);
        self.last_sequence
    }
}

/// Routes channel callbacks for one endpoint to its connection
#[derive(Default)]
struct InboundRoute {
    connection: OnceLock<Weak<Connection>>,
}

impl EndpointHandler for InboundRoute {
    fn on_message(&self, data: &[u8], src: EndpointAddr) {
        match self.connection.get().and_then(Weak::upgrade) {
            Some(connection) => connection.handle_inbound(data, src),
            None => debug!("Dropping message from {:#x} for detached endpoint", src),
        }
    }
}

/// A client connection
pub struct Connection {
    service: Weak<Service>,
    service_name: String,
    link: RemoteLink,
    local_addr: EndpointAddr,
    config: Arc<OffloadConfig>,
    platform: Platform,
    inner: Mutex<ConnectionInner>,
    handshake_done: Notify,
    interrupt: Interrupt,
    queue: DeliveryQueue,
}

impl Connection {
    /// Create a connection with a fresh local endpoint on `link`
    pub(crate) fn open(
        service: &Arc<Service>,
        link: RemoteLink,
        config: Arc<OffloadConfig>,
        platform: Platform,
    ) -> Result<Arc<Self>> {
        let route = Arc::new(InboundRoute::default());
        let local_addr = link.channel.create_endpoint(route.clone()).map_err(|e| {
            error!("Create endpoint failed on {}: {}", service.name(), e);
            e
        })?;

        let connection = Arc::new(Self {
            service: Arc::downgrade(service),
            service_name: service.name().to_string(),
            link,
            local_addr,
            config,
            platform,
            inner: Mutex::new(ConnectionInner {
                state: ConnectionState::Unconnected,
                remote_addr: None,
                handshake: None,
                last_sequence: 0,
                buffers: BufferRegistry::new(),
                endpoint_live: true,
                released: false,
            }),
            handshake_done: Notify::new(),
            interrupt: Interrupt::new(),
            queue: DeliveryQueue::new(),
        });
        let _ = route.connection.set(Arc::downgrade(&connection));

        debug!("Local addr assigned: {:#x}", local_addr);
        Ok(connection)
    }

    fn lock(&self) -> MutexGuard<'_, ConnectionInner> {
        self.inner.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    pub fn service_name(&self) -> &str {
        &self.service_name
    }

    pub fn local_addr(&self) -> EndpointAddr {
        self.local_addr
    }

    pub fn state(&self) -> ConnectionState {
        self.lock().state
    }

    pub fn remote_addr(&self) -> Option<EndpointAddr> {
        self.lock().remote_addr
    }

    pub fn buffer_count(&self) -> usize {
        self.lock().buffers.len()
    }

    pub fn info(&self) -> SessionInfo {
        let inner = self.lock();
        SessionInfo {
            service: self.service_name.clone(),
            state: inner.state,
            local_addr: self.local_addr,
            remote_addr: inner.remote_addr,
            buffers: inner.buffers.len(),
            queued: self.queue.len(),
        }
    }

    // ------------------------------------------------------------------
    // Handshake
    // ------------------------------------------------------------------

    /// Ask the remote broker for the endpoint `name` and wait for its reply
    pub async fn connect(&self, name: &str) -> Result<()> {
        ConnectRequest::validate_name(name, self.config.max_name_len)?;
        let epoch = self.interrupt.epoch();

        let sequence = {
            let mut inner = self.lock();
            match inner.state {
                ConnectionState::Connected => {
                    debug!("Endpoint {:#x} already connected", self.local_addr);
                    return Err(OffloadError::AlreadyConnected);
                }
                ConnectionState::Failed => return Err(OffloadError::RemoteUnavailable),
                ConnectionState::Connecting => return Err(OffloadError::HandshakeInProgress),
                ConnectionState::Unconnected => {}
            }
            let sequence = inner.next_sequence();
            inner.handshake = Some(sequence);
            inner.state = ConnectionState::Connecting;
            sequence
        };

        let sent = ConnectRequest { name }
            .encode(sequence, self.config.max_name_len, self.config.max_frame_size)
            .and_then(|frame| {
                self.link
                    .channel
                    .send(self.local_addr, self.link.channel.broker_addr(), &frame)
            });
        if let Err(e) = sent {
            error!("Connect request for {} failed: {}", name, e);
            return self.abort_handshake(sequence).unwrap_or(Err(e));
        }

        debug!(
            "Connect request #{} for {} sent from {:#x}",
            sequence, name, self.local_addr
        );
        self.await_handshake(sequence, epoch).await
    }

    async fn await_handshake(&self, sequence: u32, epoch: u64) -> Result<()> {
        let deadline = Instant::now() + self.config.connect_timeout();

        loop {
            let arrived = self.handshake_done.notified();
            let interrupted = self.interrupt.notified();
            tokio::pin!(arrived, interrupted);
            arrived.as_mut().enable();
            interrupted.as_mut().enable();

            if let Some(outcome) = self.handshake_outcome(sequence) {
                return outcome;
            }
            if self.interrupt.raised_since(epoch) {
                return self.interrupt_handshake(sequence);
            }

            tokio::select! {
                _ = &mut arrived => continue,
                _ = &mut interrupted => return self.interrupt_handshake(sequence),
                _ = tokio::time::sleep_until(deadline) => {
                    warn!(
                        "No connect response for #{} within {:?}",
                        sequence,
                        self.config.connect_timeout()
                    );
                    return self
                        .abort_handshake(sequence)
                        .unwrap_or(Err(OffloadError::Timeout));
                }
            }
        }
    }

    fn interrupt_handshake(&self, sequence: u32) -> Result<()> {
        debug!("Handshake #{} interrupted", sequence);
        self.abort_handshake(sequence)
            .unwrap_or(Err(OffloadError::Interrupted))
    }

    /// Outcome of handshake `sequence`, or `None` while it is still pending
    fn handshake_outcome(&self, sequence: u32) -> Option<Result<()>> {
        let inner = self.lock();
        match inner.state {
            ConnectionState::Connected => Some(Ok(())),
            ConnectionState::Failed => Some(Err(OffloadError::RemoteUnavailable)),
            ConnectionState::Connecting if inner.handshake == Some(sequence) => None,
            _ => Some(Err(OffloadError::Transport(
                "handshake abandoned before completion".into(),
            ))),
        }
    }

    /// Give up on handshake `sequence`. Returns `None` when the connection
    /// went back to UNCONNECTED, or the outcome the reply already settled.
    fn abort_handshake(&self, sequence: u32) -> Option<Result<()>> {
        {
            let mut inner = self.lock();
            if inner.state == ConnectionState::Connecting && inner.handshake == Some(sequence) {
                inner.state = ConnectionState::Unconnected;
                inner.handshake = None;
                return None;
            }
        }
        self.handshake_outcome(sequence)
    }

    // ------------------------------------------------------------------
    // Inbound path (channel receive context)
    // ------------------------------------------------------------------

    fn handle_inbound(&self, data: &[u8], src: EndpointAddr) {
        let frame = match Frame::decode(data) {
            Ok(frame) => frame,
            Err(e) => {
                warn!("Dropping message from {:#x}: {}", src, e);
                return;
            }
        };

        trace!(
            "Incoming msg src {:#x} type {} len {}",
            src,
            frame.header.msg_type,
            frame.header.len
        );

        match frame.message_type() {
            Some(MessageType::ConnectResponse) => self.on_connect_response(&frame),
            Some(MessageType::ApplicationData) => self.queue.push(frame.payload.to_vec()),
            _ => warn!(
                "Unexpected msg type {} from {:#x}",
                frame.header.msg_type, src
            ),
        }
    }

    fn on_connect_response(&self, frame: &Frame<'_>) {
        let response = match ConnectResponse::decode(frame.payload) {
            Ok(response) => response,
            Err(e) => {
                warn!("Incoming connect response dropped: {}", e);
                return;
            }
        };

        let failed = {
            let mut inner = self.lock();
            let Some(pending) = inner.handshake else {
                warn!(
                    "Connect response for {:#x} with no handshake outstanding",
                    self.local_addr
                );
                return;
            };
            let echoed = frame.header.flags;
            if echoed != 0 && echoed != pending {
                warn!(
                    "Stale connect response #{} (outstanding #{})",
                    echoed, pending
                );
                return;
            }

            debug!(
                "Conn rsp: status {} addr {:#x}",
                response.status, response.addr
            );
            inner.handshake = None;
            if response.is_success() {
                inner.remote_addr = Some(response.addr);
                inner.state = ConnectionState::Connected;
            } else {
                warn!(
                    "Broker refused {:#x} with status {}",
                    self.local_addr, response.status
                );
                inner.state = ConnectionState::Failed;
            }
            inner.state == ConnectionState::Failed
        };

        if failed {
            self.queue.fail();
        }
        self.handshake_done.notify_waiters();
    }

    // ------------------------------------------------------------------
    // Data path
    // ------------------------------------------------------------------

    /// Translate embedded buffer references and send one application message
    pub fn write(&self, data: &[u8]) -> Result<usize> {
        let mut payload = data.to_vec();

        let dst = {
            let inner = self.lock();
            match inner.state {
                ConnectionState::Unconnected | ConnectionState::Connecting => {
                    return Err(OffloadError::NotConnected)
                }
                ConnectionState::Failed => return Err(OffloadError::Unreachable),
                ConnectionState::Connected => {}
            }

            let max = self.config.max_payload();
            if payload.len() > max {
                return Err(OffloadError::MessageTooLarge {
                    len: payload.len(),
                    max,
                });
            }

            AddressTranslator::new(
                &inner.buffers,
                self.platform.buffers.as_ref(),
                self.link.mapper.as_ref(),
            )
            .patch(&mut payload)?;

            inner.remote_addr.ok_or(OffloadError::NotConnected)?
        };

        let frame = wire::encode(
            MessageType::ApplicationData,
            0,
            &payload,
            self.config.max_frame_size,
        )?;
        self.link
            .channel
            .send(self.local_addr, dst, &frame)
            .map_err(|e| {
                error!("Send to {:#x} failed: {}", dst, e);
                e
            })?;

        trace!("Sent {} bytes to {:#x}", payload.len(), dst);
        Ok(data.len())
    }

    /// Dequeue one message into `buf`, truncating to its size
    pub async fn read(&self, buf: &mut [u8], blocking: bool) -> Result<usize> {
        let epoch = self.interrupt.epoch();
        match self.state() {
            ConnectionState::Unconnected | ConnectionState::Connecting => {
                return Err(OffloadError::NotConnected)
            }
            ConnectionState::Failed => return Err(OffloadError::Unreachable),
            ConnectionState::Connected => {}
        }

        let message = self.queue.pop(blocking, &self.interrupt, epoch).await?;
        let used = buf.len().min(message.len());
        buf[..used].copy_from_slice(&message[..used]);
        Ok(used)
    }

    pub fn poll(&self) -> Readiness {
        if self.state() == ConnectionState::Failed {
            return Readiness::ERROR;
        }

        // No flow control from the channel: always writable
        let mut ready = Readiness::WRITABLE;
        if !self.queue.is_empty() {
            ready |= Readiness::READABLE;
        }
        ready
    }

    /// Fail every `connect` or `read` already in progress with `Interrupted`,
    /// including one that has not reached its wait yet
    pub fn interrupt(&self) {
        self.interrupt.raise();
    }

    // ------------------------------------------------------------------
    // Buffers
    // ------------------------------------------------------------------

    /// Import the buffer behind `fd` and register it
    pub fn register_buffer(&self, fd: i32) -> Result<BufferHandle> {
        let mem = self.platform.buffers.import_fd(fd)?;
        self.register_handle(mem)
    }

    /// Import and register every buffer behind a shared reference.
    /// Buffers that cannot be registered are skipped; imports past
    /// `max_shared_buffers` are released unregistered.
    pub fn register_shared(&self, fd: i32) -> Result<Vec<BufferHandle>> {
        let max = self.config.max_shared_buffers;
        let handles = self.platform.buffers.import_shared(fd, max)?;

        let mut registered = Vec::with_capacity(handles.len().min(max));
        for (index, mem) in handles.into_iter().enumerate() {
            if index >= max {
                warn!("Shared reference {} exceeds {} buffers, dropping {:?}", fd, max, mem);
                self.platform.buffers.release(mem);
                continue;
            }
            match self.register_handle(mem) {
                Ok(handle) => registered.push(handle),
                Err(e) => warn!("Skipping shared buffer {:?}: {}", mem, e),
            }
        }
        Ok(registered)
    }

    fn register_handle(&self, mem: MemHandle) -> Result<BufferHandle> {
        let entry = match wrap_handle(
            mem,
            self.platform.buffers.as_ref(),
            self.platform.dma.as_ref(),
        ) {
            Ok(entry) => entry,
            Err(e) => {
                self.platform.buffers.release(mem);
                return Err(e);
            }
        };

        let inserted = self.lock().buffers.insert(entry.clone());
        match inserted {
            Ok(handle) => {
                debug!("Registered {:?} as {:?}", mem, handle);
                Ok(handle)
            }
            Err(e) => {
                entry.release(self.platform.buffers.as_ref(), self.platform.dma.as_ref());
                Err(e)
            }
        }
    }

    /// Release a registered buffer
    pub fn unregister_buffer(&self, handle: BufferHandle) -> Result<()> {
        let entry = self
            .lock()
            .buffers
            .remove(handle)
            .ok_or(OffloadError::StaleHandle(handle.raw()))?;

        entry.release(self.platform.buffers.as_ref(), self.platform.dma.as_ref());
        debug!("Unregistered {:?}", handle);
        Ok(())
    }

    pub fn timer(&self) -> TimerSnapshot {
        TimerSnapshot::capture(self.platform.clock.as_ref())
    }

    // ------------------------------------------------------------------
    // Teardown
    // ------------------------------------------------------------------

    /// Crash path: the remote processor is gone
    pub(crate) fn fail(&self) {
        let destroy = {
            let mut inner = self.lock();
            inner.state = ConnectionState::Failed;
            inner.handshake = None;
            std::mem::replace(&mut inner.endpoint_live, false)
        };

        self.handshake_done.notify_waiters();
        self.queue.fail();
        if destroy {
            self.link.channel.destroy_endpoint(self.local_addr);
        }
        debug!("Connection {:#x} failed", self.local_addr);
    }

    /// Close path: disconnect, release buffers and the endpoint. Idempotent.
    pub(crate) fn release(&self) {
        let (disconnect, destroy, entries) = {
            let mut inner = self.lock();
            if inner.released {
                return;
            }
            inner.released = true;

            let disconnect = match inner.state {
                ConnectionState::Connected => inner.remote_addr,
                _ => None,
            };
            let destroy = std::mem::replace(&mut inner.endpoint_live, false);
            (disconnect, destroy, inner.buffers.drain())
        };

        if let Some(addr) = disconnect {
            debug!("Disconnecting from remote service at {:#x}", addr);
            let sent = Disconnect { addr }
                .encode(self.config.max_frame_size)
                .and_then(|frame| {
                    self.link
                        .channel
                        .send(self.local_addr, self.link.channel.broker_addr(), &frame)
                });
            if let Err(e) = sent {
                error!("Disconnect send failed: {}", e);
            }
        }

        for entry in entries {
            entry.release(self.platform.buffers.as_ref(), self.platform.dma.as_ref());
        }

        if let Some(service) = self.service.upgrade() {
            service.detach(self);
        }
        if destroy {
            self.link.channel.destroy_endpoint(self.local_addr);
        }

        info!(
            "Closed connection {:#x} on {}",
            self.local_addr, self.service_name
        );
    }
}

impl fmt::Debug for Connection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let inner = self.lock();
        f.debug_struct("Connection")
            .field("service", &self.service_name)
            .field("local_addr", &self.local_addr)
            .field("state", &inner.state)
            .field("remote_addr", &inner.remote_addr)
            .field("buffers", &inner.buffers.len())
            .finish()
    }
}
