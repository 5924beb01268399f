//! Remote channel interfaces
//!
//! The bridge sits on top of a shared, unreliable, asynchronous message
//! channel to one remote processor. The channel only knows how to create
//! addressable endpoints, send bytes between addresses and tear endpoints
//! down; it may silently stop delivering when the remote processor crashes.

use crate::error::Result;
use crate::platform::PhysAddr;
use std::fmt;
use std::sync::Arc;

/// Channel-level endpoint address
pub type EndpointAddr = u32;

/// Address as seen by the remote processor
pub type DeviceAddr = u32;

/// Receive side of one local endpoint.
///
/// Called from the channel's own receive context, never from a client
/// thread. Implementations must not block.
pub trait EndpointHandler: Send + Sync {
    fn on_message(&self, data: &[u8], src: EndpointAddr);
}

/// A shared message channel to a remote processor
pub trait Channel: Send + Sync {
    /// Remote endpoint name this channel was announced under
    fn name(&self) -> &str;

    /// Local address of the channel itself
    fn local_addr(&self) -> EndpointAddr;

    /// Address of the remote connection broker
    fn broker_addr(&self) -> EndpointAddr;

    /// Allocate a fresh local address routed to `handler`
    fn create_endpoint(&self, handler: Arc<dyn EndpointHandler>) -> Result<EndpointAddr>;

    /// Release a local address; no further callbacks arrive for it
    fn destroy_endpoint(&self, addr: EndpointAddr);

    /// Send one buffer from `src` to `dst`
    fn send(&self, src: EndpointAddr, dst: EndpointAddr, data: &[u8]) -> Result<()>;
}

/// Physical-to-device address translation for one remote processor instance
pub trait AddressMapper: Send + Sync {
    fn pa_to_da(&self, pa: PhysAddr) -> Result<DeviceAddr>;
}

/// A bound channel together with the mapper of the processor behind it
#[derive(Clone)]
pub struct RemoteLink {
    pub channel: Arc<dyn Channel>,
    pub mapper: Arc<dyn AddressMapper>,
}

impl RemoteLink {
    pub fn new(channel: Arc<dyn Channel>, mapper: Arc<dyn AddressMapper>) -> Self {
        Self { channel, mapper }
    }
}

impl fmt::Debug for RemoteLink {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RemoteLink")
            .field("name", &self.channel.name())
            .field("src", &self.channel.local_addr())
            .field("dst", &self.channel.broker_addr())
            .finish()
    }
}
