//! # libnyx-offload
//!
//! Bridge between host clients and services running on a remote processor.
//! Many client sessions share one message channel per remote endpoint name;
//! each session gets its own local endpoint, a connect handshake with the
//! remote broker, a queue of inbound messages and a set of registered
//! buffers whose references are rewritten into remote device addresses on
//! the way out.
//!
//! ## Architecture
//!
//! ```text
//!   device-node layer                     channel layer
//!         |                                     |
//!         v                                     v
//!  +---------------+  bind / lose / remove  +------------+
//!  | OffloadContext| <--------------------- | RemoteLink |
//!  +-------+-------+                        +-----+------+
//!          | open                                 | on_message
//!          v                                      v
//!    +-----------+     +------------+     +---------------+
//!    |  Service  |---->| Connection |---->| DeliveryQueue |
//!    +-----------+     +-----+------+     +---------------+
//!                            | write
//!                            v
//!                  +-------------------+     +----------+
//!                  | AddressTranslator |---->| Platform |
//!                  +-------------------+     +----------+
//! ```
//!
//! ## Usage
//!
//! ```rust,ignore
//! use libnyx_offload::{OffloadConfig, OffloadContext, OpenFlags};
//! use libnyx_offload::loopback::Loopback;
//!
//! let remote = Loopback::new("rpmsg-omx0");
//! let ctx = OffloadContext::new(OffloadConfig::default(), remote.platform())?;
//! ctx.bind_channel("rpmsg-omx0", remote.link())?;
//!
//! let session = ctx.open("rpmsg-omx0", OpenFlags::blocking()).await?;
//! session.connect("OMX").await?;
//! session.write(&packet)?;
//! let n = session.read(&mut reply).await?;
//! ```

pub mod buffers;
pub mod channel;
pub mod config;
pub mod connection;
pub mod context;
pub mod error;
pub mod loopback;
pub mod platform;
pub mod queue;
pub mod service;
pub mod session;
pub mod translate;
pub mod wire;

pub use buffers::{BufferHandle, BufferKind};
pub use channel::{AddressMapper, Channel, DeviceAddr, EndpointAddr, EndpointHandler, RemoteLink};
pub use config::OffloadConfig;
pub use connection::{ConnectionState, Readiness, SessionInfo};
pub use context::{OffloadContext, RemovalReason};
pub use error::{OffloadError, Result};
pub use platform::{BufferManager, Clock, DmaAllocator, MemHandle, Platform, TimerSnapshot};
pub use service::{OpenFlags, ServiceStatus};
pub use session::{ControlReply, ControlRequest, Session};
