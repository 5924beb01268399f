//! Remote endpoint services
//!
//! A [`Service`] stands for one remote endpoint name. It outlives the
//! channel it is bound to: when the remote processor crashes the channel is
//! cleared and every live connection fails, but the service stays so that
//! new clients can wait for the remote endpoint to come back.

use crate::channel::RemoteLink;
use crate::config::OffloadConfig;
use crate::connection::Connection;
use crate::error::{OffloadError, Result};
use crate::platform::Platform;
use serde::{Deserialize, Serialize};
use std::sync::{Arc, Mutex, MutexGuard, OnceLock};
use tokio::sync::Notify;
use tracing::{debug, info, warn};

/// How a session is opened
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct OpenFlags {
    /// Fail with `NotAvailable` instead of waiting for the remote endpoint
    pub nonblocking: bool,
}

impl OpenFlags {
    pub fn blocking() -> Self {
        Self { nonblocking: false }
    }

    pub fn nonblocking() -> Self {
        Self { nonblocking: true }
    }
}

/// Service status snapshot
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServiceStatus {
    pub name: String,
    /// Device node index; absent until a channel first registers
    pub minor: Option<u16>,
    pub bound: bool,
    pub connections: usize,
    /// Times a channel was bound, first registration included
    pub bindings: u64,
}

struct ServiceState {
    link: Option<RemoteLink>,
    connections: Vec<Arc<Connection>>,
    bindings: u64,
    withdrawn: bool,
}

/// One remote endpoint name and its connections
pub struct Service {
    name: String,
    minor: OnceLock<u16>,
    state: Mutex<ServiceState>,
    available: Notify,
}

impl Service {
    pub(crate) fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            minor: OnceLock::new(),
            state: Mutex::new(ServiceState {
                link: None,
                connections: Vec::new(),
                bindings: 0,
                withdrawn: false,
            }),
            available: Notify::new(),
        }
    }

    fn lock(&self) -> MutexGuard<'_, ServiceState> {
        self.state.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// Device node index, claimed on the first channel registration
    pub fn minor(&self) -> Option<u16> {
        self.minor.get().copied()
    }

    pub(crate) fn assign_minor(&self, minor: u16) {
        let _ = self.minor.set(minor);
    }

    pub fn is_bound(&self) -> bool {
        self.lock().link.is_some()
    }

    pub fn connection_count(&self) -> usize {
        self.lock().connections.len()
    }

    pub fn status(&self) -> ServiceStatus {
        let state = self.lock();
        ServiceStatus {
            name: self.name.clone(),
            minor: self.minor(),
            bound: state.link.is_some(),
            connections: state.connections.len(),
            bindings: state.bindings,
        }
    }

    /// Publish a (re)registered channel and release waiting openers
    pub(crate) fn bind(&self, link: RemoteLink) {
        {
            let mut state = self.lock();
            info!(
                "New connection service channel {}: {:#x} -> {:#x}",
                self.name,
                link.channel.local_addr(),
                link.channel.broker_addr()
            );
            state.link = Some(link);
            state.bindings += 1;
        }
        self.available.notify_waiters();
    }

    /// Crash path: clear the channel and fail every live connection
    pub(crate) fn lose_channel(&self) {
        let mut state = self.lock();
        if state.link.take().is_none() {
            debug!("Channel for {} already gone", self.name);
        }
        for connection in &state.connections {
            connection.fail();
        }
        warn!(
            "Remote endpoint {} lost, {} connections failed",
            self.name,
            state.connections.len()
        );
    }

    /// Permanent removal: fail connections and wake blocked openers
    pub(crate) fn withdraw(&self) {
        {
            let mut state = self.lock();
            state.withdrawn = true;
            state.link = None;
            for connection in &state.connections {
                connection.fail();
            }
        }
        self.available.notify_waiters();
        info!("Service {} withdrawn", self.name);
    }

    /// Create a connection, waiting for a channel unless `flags` says not to
    pub(crate) async fn open_connection(
        self: &Arc<Self>,
        flags: OpenFlags,
        config: &Arc<OffloadConfig>,
        platform: &Platform,
    ) -> Result<Arc<Connection>> {
        loop {
            let available = self.available.notified();
            tokio::pin!(available);
            available.as_mut().enable();

            {
                let mut state = self.lock();
                if state.withdrawn {
                    return Err(OffloadError::ServiceWithdrawn(self.name.clone()));
                }

                if let Some(link) = state.link.clone() {
                    let connection =
                        Connection::open(self, link, config.clone(), platform.clone())?;
                    state.connections.push(connection.clone());
                    info!(
                        "Opened connection {:#x} on {}",
                        connection.local_addr(),
                        self.name
                    );
                    return Ok(connection);
                }

                if flags.nonblocking {
                    return Err(OffloadError::NotAvailable(self.name.clone()));
                }
            }

            debug!("Waiting for remote endpoint {} to register", self.name);
            available.await;
        }
    }

    pub(crate) fn detach(&self, connection: &Connection) {
        self.lock()
            .connections
            .retain(|live| !std::ptr::eq(Arc::as_ptr(live), connection));
    }
}

impl std::fmt::Debug for Service {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Service")
            .field("name", &self.name)
            .field("minor", &self.minor())
            .finish_non_exhaustive()
    }
}
