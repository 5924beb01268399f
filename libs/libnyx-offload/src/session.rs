//! Client sessions
//!
//! A [`Session`] is what the hosting device-node layer holds per open file:
//! control requests, byte-stream read/write and readiness polling map
//! one-to-one onto it. Dropping a session closes it.

use crate::buffers::BufferHandle;
use crate::channel::EndpointAddr;
use crate::connection::{Connection, ConnectionState, Readiness, SessionInfo};
use crate::error::Result;
use crate::platform::TimerSnapshot;
use crate::service::OpenFlags;
use std::fmt;
use std::sync::Arc;

/// Control requests on an open session
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ControlRequest {
    /// Handshake with the named remote endpoint
    Connect { name: String },
    /// Import and register the buffer behind a descriptor
    RegisterBuffer { fd: i32 },
    /// Import and register the buffers behind a shared reference
    RegisterShared { fd: i32 },
    /// Release a registered buffer
    UnregisterBuffer { handle: BufferHandle },
    /// Read the host timers
    GetTimer,
}

/// Replies to [`ControlRequest`]s
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ControlReply {
    Connected,
    Registered(BufferHandle),
    RegisteredShared(Vec<BufferHandle>),
    Unregistered,
    Timer(TimerSnapshot),
}

/// An open client session
pub struct Session {
    connection: Arc<Connection>,
    flags: OpenFlags,
}

impl Session {
    pub(crate) fn new(connection: Arc<Connection>, flags: OpenFlags) -> Self {
        Self { connection, flags }
    }

    /// Dispatch a control request
    pub async fn control(&self, request: ControlRequest) -> Result<ControlReply> {
        match request {
            ControlRequest::Connect { name } => {
                self.connect(&name).await?;
                Ok(ControlReply::Connected)
            }
            ControlRequest::RegisterBuffer { fd } => {
                self.register_buffer(fd).map(ControlReply::Registered)
            }
            ControlRequest::RegisterShared { fd } => {
                self.register_shared(fd).map(ControlReply::RegisteredShared)
            }
            ControlRequest::UnregisterBuffer { handle } => {
                self.unregister_buffer(handle)?;
                Ok(ControlReply::Unregistered)
            }
            ControlRequest::GetTimer => Ok(ControlReply::Timer(self.timer())),
        }
    }

    pub async fn connect(&self, name: &str) -> Result<()> {
        self.connection.connect(name).await
    }

    pub fn register_buffer(&self, fd: i32) -> Result<BufferHandle> {
        self.connection.register_buffer(fd)
    }

    pub fn register_shared(&self, fd: i32) -> Result<Vec<BufferHandle>> {
        self.connection.register_shared(fd)
    }

    pub fn unregister_buffer(&self, handle: BufferHandle) -> Result<()> {
        self.connection.unregister_buffer(handle)
    }

    pub fn timer(&self) -> TimerSnapshot {
        self.connection.timer()
    }

    /// Read one queued message; waits unless the session was opened
    /// non-blocking
    pub async fn read(&self, buf: &mut [u8]) -> Result<usize> {
        self.connection.read(buf, !self.flags.nonblocking).await
    }

    pub fn write(&self, data: &[u8]) -> Result<usize> {
        self.connection.write(data)
    }

    pub fn poll(&self) -> Readiness {
        self.connection.poll()
    }

    /// Signal every caller blocked on this session
    pub fn interrupt(&self) {
        self.connection.interrupt();
    }

    pub fn flags(&self) -> OpenFlags {
        self.flags
    }

    pub fn state(&self) -> ConnectionState {
        self.connection.state()
    }

    pub fn local_addr(&self) -> EndpointAddr {
        self.connection.local_addr()
    }

    pub fn remote_addr(&self) -> Option<EndpointAddr> {
        self.connection.remote_addr()
    }

    pub fn buffer_count(&self) -> usize {
        self.connection.buffer_count()
    }

    pub fn info(&self) -> SessionInfo {
        self.connection.info()
    }

    /// Disconnect and release everything the session holds
    pub fn close(self) {
        self.connection.release();
    }
}

impl Drop for Session {
    fn drop(&mut self) {
        self.connection.release();
    }
}

impl fmt::Debug for Session {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Session")
            .field("connection", &self.connection)
            .field("flags", &self.flags)
            .finish()
    }
}
