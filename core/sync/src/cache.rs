//! Device and profile caches refreshed from the server.
//!
//! A successful fetch replaces the cached copy; a failed one falls back to
//! whatever was cached last, so the field client keeps working offline.

use tracing::{info, warn};

use meterline_common::{Result, UserIdentity};
use meterline_store::{Device, User};

use crate::engine::SyncEngine;
use crate::transport::ReadingTransport;

/// Where a cached value came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CacheSource {
    /// Fresh from the server; the cache was replaced.
    Network,
    /// Server unavailable; last cached value.
    Cache,
}

/// A value together with its origin.
#[derive(Debug, Clone)]
pub struct Cached<V> {
    pub value: V,
    pub source: CacheSource,
}

impl<T: ReadingTransport + ?Sized> SyncEngine<T> {
    /// Refresh the device list.
    ///
    /// # Errors
    /// - `Storage` if the cache cannot be read or written
    pub async fn refresh_devices(&self, identity: &UserIdentity) -> Result<Cached<Vec<Device>>> {
        match self.transport.fetch_devices(identity).await {
            Ok(devices) => {
                self.store.replace_devices(&devices)?;
                info!("Device cache refreshed with {} devices", devices.len());
                Ok(Cached {
                    value: devices,
                    source: CacheSource::Network,
                })
            }
            Err(e) => {
                warn!("Could not fetch devices, using cached list: {}", e);
                Ok(Cached {
                    value: self.store.devices()?,
                    source: CacheSource::Cache,
                })
            }
        }
    }

    /// Refresh the caller's profile. `None` when the server is unavailable
    /// and nothing was cached before.
    ///
    /// # Errors
    /// - `Storage` if the cache cannot be read or written
    pub async fn refresh_profile(&self, identity: &UserIdentity) -> Result<Cached<Option<User>>> {
        match self.transport.fetch_profile(identity).await {
            Ok(user) => {
                self.store.put_user(&user)?;
                Ok(Cached {
                    value: Some(user),
                    source: CacheSource::Network,
                })
            }
            Err(e) => {
                warn!("Could not fetch profile, using cached copy: {}", e);
                Ok(Cached {
                    value: self.store.user(*identity)?,
                    source: CacheSource::Cache,
                })
            }
        }
    }
}
