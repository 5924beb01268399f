//! Error types for offload bridge operations

use thiserror::Error;

/// Offload bridge error types
#[derive(Debug, Error)]
pub enum OffloadError {
    /// `connect` on a session that already completed its handshake
    #[error("Endpoint already connected")]
    AlreadyConnected,

    /// `connect` on a session whose remote processor went away
    #[error("Remote processor unavailable")]
    RemoteUnavailable,

    /// Read or write on a session whose remote processor went away
    #[error("Remote endpoint unreachable")]
    Unreachable,

    /// A blocked reader observed the connection failing
    #[error("Connection failed while waiting for data")]
    ConnectionFailed,

    /// Read or write before the handshake completed
    #[error("Not connected")]
    NotConnected,

    /// Another caller is mid-handshake on the same session
    #[error("Connection handshake already in progress")]
    HandshakeInProgress,

    /// No handshake reply within the connect timeout
    #[error("Connection handshake timed out")]
    Timeout,

    /// The waiting caller was signalled
    #[error("Interrupted")]
    Interrupted,

    /// Non-blocking read with nothing queued
    #[error("Operation would block")]
    WouldBlock,

    /// Non-blocking open while the remote endpoint is not registered
    #[error("Service not available: {0}")]
    NotAvailable(String),

    /// The service was permanently withdrawn
    #[error("Service withdrawn: {0}")]
    ServiceWithdrawn(String),

    /// Outbound payload exceeds the frame budget
    #[error("Message too large: {len} bytes (max {max})")]
    MessageTooLarge { len: usize, max: usize },

    /// Endpoint name rejected
    #[error("Invalid endpoint name: {0}")]
    InvalidName(String),

    /// Map info in an outbound payload is malformed
    #[error("Invalid buffer map info: {0}")]
    InvalidMapInfo(String),

    /// A buffer reference resolves to nothing this session owns
    #[error("Unresolvable buffer reference: {0:#x}")]
    UnresolvableBuffer(u32),

    /// Unregister of a handle that is not (or no longer) registered
    #[error("Stale buffer handle: {0:#x}")]
    StaleHandle(u32),

    /// The buffer manager does not know the descriptor
    #[error("Bad buffer descriptor: {0}")]
    BadDescriptor(i32),

    /// Scatter list or page table could not be built
    #[error("Page table allocation failed: {0}")]
    PageTableAlloc(String),

    /// Channel send failure
    #[error("Transport error: {0}")]
    Transport(String),

    /// Malformed inbound traffic
    #[error("Protocol error: {0}")]
    Protocol(String),

    /// Allocation or capacity failure
    #[error("Resource exhausted: {0}")]
    ResourceExhausted(String),

    /// Configuration rejected
    #[error("Configuration error: {0}")]
    Config(String),

    /// IO error
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

/// Result type for offload bridge operations
pub type Result<T> = std::result::Result<T, OffloadError>;

impl OffloadError {
    /// Check if the caller may simply retry the operation
    pub fn is_recoverable(&self) -> bool {
        matches!(
            self,
            Self::Timeout | Self::WouldBlock | Self::Interrupted | Self::NotAvailable(_)
        )
    }

    /// Check if this error reports the terminal remote-failure state
    pub fn is_remote_failure(&self) -> bool {
        matches!(
            self,
            Self::RemoteUnavailable | Self::Unreachable | Self::ConnectionFailed
        )
    }

    /// Negative errno for the hosting device-node layer
    pub fn errno(&self) -> i32 {
        let code = match self {
            Self::AlreadyConnected => libc::EISCONN,
            Self::RemoteUnavailable | Self::Unreachable | Self::ConnectionFailed => libc::ENXIO,
            Self::NotConnected => libc::ENOTCONN,
            Self::HandshakeInProgress => libc::EALREADY,
            Self::Timeout => libc::ETIMEDOUT,
            Self::Interrupted => libc::EINTR,
            Self::WouldBlock => libc::EAGAIN,
            Self::NotAvailable(_) => libc::EBUSY,
            Self::ServiceWithdrawn(_) => libc::ENODEV,
            Self::MessageTooLarge { .. } => libc::EMSGSIZE,
            Self::InvalidName(_)
            | Self::InvalidMapInfo(_)
            | Self::StaleHandle(_)
            | Self::Config(_) => libc::EINVAL,
            Self::BadDescriptor(_) => libc::EBADF,
            Self::UnresolvableBuffer(_) | Self::Transport(_) | Self::Protocol(_) => libc::EIO,
            Self::PageTableAlloc(_) | Self::ResourceExhausted(_) => libc::ENOMEM,
            Self::Io(e) => e.raw_os_error().unwrap_or(libc::EIO),
        };
        -code
    }
}
