//! Process-wide bridge context
//!
//! Owns the table of services keyed by remote endpoint name. The channel
//! layer reports endpoint arrival and removal here; the device-node layer
//! opens sessions through it.

use crate::channel::RemoteLink;
use crate::config::OffloadConfig;
use crate::error::{OffloadError, Result};
use crate::platform::Platform;
use crate::service::{OpenFlags, Service, ServiceStatus};
use crate::session::Session;
use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard};
use tracing::{debug, info, warn};

/// Why a channel went away
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RemovalReason {
    /// Remote processor crashed; a recovery may follow
    Crashed,
    /// Remote endpoint is gone for good
    Withdrawn,
}

#[derive(Default)]
struct ServiceTable {
    by_name: HashMap<String, Arc<Service>>,
    minors: Vec<bool>,
}

impl ServiceTable {
    fn allocate_minor(&mut self, max: usize) -> Option<u16> {
        if let Some(free) = self.minors.iter().position(|used| !used) {
            self.minors[free] = true;
            return Some(free as u16);
        }
        if self.minors.len() < max {
            self.minors.push(true);
            return Some((self.minors.len() - 1) as u16);
        }
        None
    }

    fn free_minor(&mut self, minor: u16) {
        if let Some(used) = self.minors.get_mut(minor as usize) {
            *used = false;
        }
    }
}

/// Bridge context: configuration, platform hooks and the service table
pub struct OffloadContext {
    config: Arc<OffloadConfig>,
    platform: Platform,
    services: Mutex<ServiceTable>,
}

impl OffloadContext {
    /// Initialize a context
    pub fn new(config: OffloadConfig, platform: Platform) -> Result<Self> {
        config.validate()?;
        info!(
            "Offload bridge ready (max {} services, {}-byte frames)",
            config.max_services, config.max_frame_size
        );

        Ok(Self {
            config: Arc::new(config),
            platform,
            services: Mutex::new(ServiceTable::default()),
        })
    }

    fn lock(&self) -> MutexGuard<'_, ServiceTable> {
        self.services.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    pub fn config(&self) -> &OffloadConfig {
        &self.config
    }

    /// Service for `name`, created if absent. Needs no bound channel and
    /// claims no minor; only a channel registration does.
    pub fn acquire_service(&self, name: &str) -> Result<Arc<Service>> {
        Ok(Self::lookup_or_create(&mut self.lock(), name))
    }

    fn lookup_or_create(table: &mut ServiceTable, name: &str) -> Arc<Service> {
        if let Some(service) = table.by_name.get(name) {
            return service.clone();
        }

        let service = Arc::new(Service::new(name));
        table.by_name.insert(name.to_string(), service.clone());
        debug!("Created service {}", name);
        service
    }

    /// Existing service for `name`
    pub fn service(&self, name: &str) -> Option<Arc<Service>> {
        self.lock().by_name.get(name).cloned()
    }

    /// Remote endpoint `name` registered (first time or after recovery)
    pub fn bind_channel(&self, name: &str, link: RemoteLink) -> Result<Arc<Service>> {
        let service = {
            let mut table = self.lock();
            let known = table.by_name.get(name).cloned();
            match known {
                Some(service) if service.minor().is_some() => service,
                known => {
                    let minor = table.allocate_minor(self.config.max_services).ok_or_else(|| {
                        OffloadError::ResourceExhausted(format!(
                            "all {} service slots in use",
                            self.config.max_services
                        ))
                    })?;
                    let service =
                        known.unwrap_or_else(|| Self::lookup_or_create(&mut table, name));
                    service.assign_minor(minor);
                    info!("Service {} registered (minor {})", name, minor);
                    service
                }
            }
        };

        service.bind(link);
        Ok(service)
    }

    /// Remote processor behind `name` crashed
    pub fn on_channel_lost(&self, name: &str) {
        match self.service(name) {
            Some(service) => service.lose_channel(),
            None => warn!("Channel lost for unknown service {}", name),
        }
    }

    /// Single removal hook for the channel layer
    pub fn remove_channel(&self, name: &str, reason: RemovalReason) {
        match reason {
            RemovalReason::Crashed => self.on_channel_lost(name),
            RemovalReason::Withdrawn => {
                self.withdraw_service(name);
            }
        }
    }

    /// Destroy the service for `name`. Returns false if there was none.
    pub fn withdraw_service(&self, name: &str) -> bool {
        let service = {
            let mut table = self.lock();
            let Some(service) = table.by_name.remove(name) else {
                return false;
            };
            if let Some(minor) = service.minor() {
                table.free_minor(minor);
            }
            service
        };

        service.withdraw();
        true
    }

    /// Open a client session on `name`
    pub async fn open(&self, name: &str, flags: OpenFlags) -> Result<Session> {
        let service = self.acquire_service(name)?;
        let connection = service
            .open_connection(flags, &self.config, &self.platform)
            .await?;
        Ok(Session::new(connection, flags))
    }

    pub fn services(&self) -> Vec<ServiceStatus> {
        let services: Vec<Arc<Service>> = self.lock().by_name.values().cloned().collect();
        let mut status: Vec<ServiceStatus> = services.iter().map(|s| s.status()).collect();
        status.sort_by(|a, b| {
            (a.minor.is_none(), a.minor, &a.name).cmp(&(b.minor.is_none(), b.minor, &b.name))
        });
        status
    }

    /// Withdraw every service
    pub fn shutdown(&self) {
        let names: Vec<String> = self.lock().by_name.keys().cloned().collect();
        for name in names {
            self.withdraw_service(&name);
        }
        info!("Offload bridge shut down");
    }
}
