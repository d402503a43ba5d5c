//! In-memory ingestion server for testing.

use async_trait::async_trait;
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicI64, AtomicUsize, Ordering};
use std::sync::{Mutex, MutexGuard};
use tokio::sync::{watch, Notify};

use meterline_common::{Error, Result, UserIdentity};
use meterline_store::{Device, User};

use crate::transport::{ReadingSubmission, ReadingTransport, ServerReading};

/// A submission accepted by [`MemoryTransport`].
#[derive(Debug, Clone)]
pub struct ReceivedReading {
    pub server_id: i64,
    pub submission: ReadingSubmission,
    pub identity: UserIdentity,
}

/// In-memory ingestion server.
///
/// Reachability can be toggled, individual upload attempts can be scripted
/// to fail with an HTTP status, and uploads can be paused to hold a sync
/// pass in flight.
pub struct MemoryTransport {
    reachable: AtomicBool,
    health_stalled: AtomicBool,
    next_id: AtomicI64,
    upload_attempts: AtomicUsize,
    probes: AtomicUsize,
    rejections: Mutex<HashMap<usize, u16>>,
    received: Mutex<Vec<ReceivedReading>>,
    devices: Mutex<Vec<Device>>,
    profiles: Mutex<HashMap<UserIdentity, User>>,
    paused: watch::Sender<bool>,
    upload_started: Notify,
}

impl MemoryTransport {
    /// Create a reachable server with no scripted failures.
    pub fn new() -> Self {
        let (paused, _) = watch::channel(false);
        Self {
            reachable: AtomicBool::new(true),
            health_stalled: AtomicBool::new(false),
            next_id: AtomicI64::new(1),
            upload_attempts: AtomicUsize::new(0),
            probes: AtomicUsize::new(0),
            rejections: Mutex::new(HashMap::new()),
            received: Mutex::new(Vec::new()),
            devices: Mutex::new(Vec::new()),
            profiles: Mutex::new(HashMap::new()),
            paused,
            upload_started: Notify::new(),
        }
    }

    pub fn set_reachable(&self, reachable: bool) {
        self.reachable.store(reachable, Ordering::SeqCst);
    }

    pub fn is_reachable(&self) -> bool {
        self.reachable.load(Ordering::SeqCst)
    }

    /// Make health checks hang until cancelled.
    pub fn stall_health(&self, stalled: bool) {
        self.health_stalled.store(stalled, Ordering::SeqCst);
    }

    /// Fail the `attempt`-th upload (1-based, counted over the transport's
    /// lifetime) with `status`.
    pub fn reject_attempt(&self, attempt: usize, status: u16) {
        lock(&self.rejections).insert(attempt, status);
    }

    /// Hold every upload until [`resume_uploads`](Self::resume_uploads).
    pub fn pause_uploads(&self) {
        self.paused.send_replace(true);
    }

    pub fn resume_uploads(&self) {
        self.paused.send_replace(false);
    }

    /// Wait until an upload has started since the last call.
    pub async fn upload_started(&self) {
        self.upload_started.notified().await;
    }

    pub fn set_devices(&self, devices: Vec<Device>) {
        *lock(&self.devices) = devices;
    }

    pub fn set_profile(&self, user: User) {
        lock(&self.profiles).insert(user.telegram_id, user);
    }

    /// Submissions accepted so far, in arrival order.
    pub fn received(&self) -> Vec<ReceivedReading> {
        lock(&self.received).clone()
    }

    /// Upload attempts so far, accepted or not.
    pub fn upload_attempts(&self) -> usize {
        self.upload_attempts.load(Ordering::SeqCst)
    }

    /// Liveness probes so far.
    pub fn probes(&self) -> usize {
        self.probes.load(Ordering::SeqCst)
    }

    fn ensure_reachable(&self) -> Result<()> {
        if self.is_reachable() {
            Ok(())
        } else {
            Err(Error::Network("Connection refused".to_string()))
        }
    }
}

impl Default for MemoryTransport {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl ReadingTransport for MemoryTransport {
    fn name(&self) -> &str {
        "memory"
    }

    async fn health(&self) -> Result<()> {
        self.probes.fetch_add(1, Ordering::SeqCst);
        if self.health_stalled.load(Ordering::SeqCst) {
            std::future::pending::<()>().await;
        }
        self.ensure_reachable()
    }

    async fn submit_reading(
        &self,
        submission: &ReadingSubmission,
        identity: &UserIdentity,
    ) -> Result<ServerReading> {
        let attempt = self.upload_attempts.fetch_add(1, Ordering::SeqCst) + 1;
        self.upload_started.notify_one();

        let mut paused = self.paused.subscribe();
        let resumed = paused.wait_for(|p| !*p).await.is_ok();
        if !resumed {
            return Err(Error::Network("Server shut down".to_string()));
        }

        self.ensure_reachable()?;

        if let Some(status) = lock(&self.rejections).remove(&attempt) {
            return Err(Error::Http {
                status,
                message: "Internal server error".to_string(),
            });
        }

        let server_id = self.next_id.fetch_add(1, Ordering::SeqCst);
        lock(&self.received).push(ReceivedReading {
            server_id,
            submission: submission.clone(),
            identity: *identity,
        });

        Ok(ServerReading {
            id: server_id,
            photo_path: None,
        })
    }

    async fn fetch_devices(&self, _identity: &UserIdentity) -> Result<Vec<Device>> {
        self.ensure_reachable()?;
        Ok(lock(&self.devices).clone())
    }

    async fn fetch_profile(&self, identity: &UserIdentity) -> Result<User> {
        self.ensure_reachable()?;
        lock(&self.profiles).get(identity).cloned().ok_or(Error::Http {
            status: 403,
            message: "User not registered".to_string(),
        })
    }
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;
    use meterline_common::{DeviceId, Photo};

    fn submission() -> ReadingSubmission {
        ReadingSubmission {
            device_id: DeviceId::new(1).unwrap(),
            counter_value: 3.5,
            photo: Photo::jpeg(vec![1, 2]),
            client_timestamp: Utc::now(),
            notes: None,
        }
    }

    #[tokio::test]
    async fn test_accepts_and_assigns_ids() {
        let transport = MemoryTransport::new();
        let identity = UserIdentity::new(9).unwrap();

        let first = transport.submit_reading(&submission(), &identity).await.unwrap();
        let second = transport.submit_reading(&submission(), &identity).await.unwrap();

        assert_ne!(first.id, second.id);
        assert_eq!(transport.received().len(), 2);
        assert_eq!(transport.received()[0].identity, identity);
    }

    #[tokio::test]
    async fn test_scripted_rejection() {
        let transport = MemoryTransport::new();
        let identity = UserIdentity::new(9).unwrap();
        transport.reject_attempt(2, 500);

        assert!(transport.submit_reading(&submission(), &identity).await.is_ok());
        let err = transport
            .submit_reading(&submission(), &identity)
            .await
            .unwrap_err();
        assert!(matches!(err, Error::Http { status: 500, .. }));
        assert!(transport.submit_reading(&submission(), &identity).await.is_ok());
        assert_eq!(transport.upload_attempts(), 3);
        assert_eq!(transport.received().len(), 2);
    }

    #[tokio::test]
    async fn test_unreachable() {
        let transport = MemoryTransport::new();
        transport.set_reachable(false);

        assert!(transport.health().await.is_err());
        assert!(transport
            .fetch_devices(&UserIdentity::new(1).unwrap())
            .await
            .is_err());
        assert_eq!(transport.probes(), 1);
    }
}
