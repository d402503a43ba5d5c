//! Core sync engine that drains queued readings to the ingestion server.

use serde::{Deserialize, Serialize};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::Notify;
use tracing::{debug, error, info, warn};

use meterline_common::{Error, ReadingId, Result, UserIdentity};
use meterline_store::{LocalStore, NewReading, Reading, ReadingUpdate, SyncStatus};

use crate::retry::RetryPolicy;
use crate::transport::{ReadingSubmission, ReadingTransport, ServerReading};

/// Configuration for the sync engine.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SyncConfig {
    /// Extra upload attempts per reading within one pass. `0` means one
    /// attempt per pass; failed readings are retried on the next pass.
    pub upload_retries: u32,
    /// First backoff delay between in-pass upload retries.
    pub retry_initial_delay: Duration,
    /// Bound on the liveness probe, whatever the transport.
    pub probe_timeout: Duration,
}

impl Default for SyncConfig {
    fn default() -> Self {
        Self {
            upload_retries: 0,
            retry_initial_delay: Duration::from_secs(1),
            probe_timeout: Duration::from_secs(5),
        }
    }
}

/// Aggregate result of one sync pass.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct SyncOutcome {
    /// Readings that ended the pass `synced`.
    pub success_count: usize,
    /// Readings that ended the pass `error`.
    pub failed_count: usize,
}

impl SyncOutcome {
    /// Readings attempted during the pass.
    pub fn attempted(&self) -> usize {
        self.success_count + self.failed_count
    }
}

/// Marks a sync pass in flight; the flag is cleared on drop, on every exit
/// path including panics and cancellation.
struct PassGuard<'a> {
    flag: &'a AtomicBool,
}

impl<'a> PassGuard<'a> {
    fn acquire(flag: &'a AtomicBool) -> Option<Self> {
        flag.compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .ok()
            .map(|_| Self { flag })
    }
}

impl Drop for PassGuard<'_> {
    fn drop(&mut self) {
        self.flag.store(false, Ordering::Release);
    }
}

/// Sync engine for one client session.
pub struct SyncEngine<T: ReadingTransport + ?Sized> {
    /// Local queue and caches.
    pub(crate) store: Arc<LocalStore>,
    /// Ingestion server.
    pub(crate) transport: Arc<T>,
    /// In-pass upload retries.
    retry: RetryPolicy,
    /// Set while a pass runs.
    in_progress: AtomicBool,
    /// "Sync requested" signal consumed by the scheduler.
    kick: Arc<Notify>,
    config: SyncConfig,
}

impl<T: ReadingTransport + ?Sized> SyncEngine<T> {
    /// Create a new sync engine.
    pub fn new(store: Arc<LocalStore>, transport: Arc<T>, config: SyncConfig) -> Self {
        Self {
            store,
            transport,
            retry: RetryPolicy::new(config.upload_retries, config.retry_initial_delay),
            in_progress: AtomicBool::new(false),
            kick: Arc::new(Notify::new()),
            config,
        }
    }

    pub fn store(&self) -> &Arc<LocalStore> {
        &self.store
    }

    pub fn transport(&self) -> &Arc<T> {
        &self.transport
    }

    pub fn config(&self) -> &SyncConfig {
        &self.config
    }

    /// Whether a sync pass is running right now.
    pub fn is_syncing(&self) -> bool {
        self.in_progress.load(Ordering::Acquire)
    }

    pub(crate) fn kick_signal(&self) -> Arc<Notify> {
        self.kick.clone()
    }

    /// Readings still waiting for delivery (`pending` or `error`).
    pub fn pending_count(&self) -> Result<usize> {
        self.store.count_by_status(&SyncStatus::ELIGIBLE)
    }

    /// Queue a reading and request a sync pass without waiting for it.
    ///
    /// The request is coalesced: several kicks before the scheduler wakes
    /// up result in a single pass.
    ///
    /// # Errors
    /// - `Validation` or `Storage` from the store; no kick is sent
    pub fn enqueue_and_kick(&self, reading: &NewReading) -> Result<ReadingId> {
        let id = self.store.save(reading)?;
        self.kick.notify_one();
        Ok(id)
    }

    /// Probe the ingestion server, bounded by the configured timeout.
    pub async fn is_reachable(&self) -> bool {
        match tokio::time::timeout(self.config.probe_timeout, self.transport.health()).await {
            Ok(Ok(())) => true,
            Ok(Err(e)) => {
                debug!("Liveness probe via {} failed: {}", self.transport.name(), e);
                false
            }
            Err(_) => {
                debug!(
                    "Liveness probe via {} timed out after {:?}",
                    self.transport.name(),
                    self.config.probe_timeout
                );
                false
            }
        }
    }

    /// Attempt delivery of every `pending` and `error` reading.
    ///
    /// Returns `{0, 0}` without touching any reading when another pass is
    /// already running or the server is unreachable. Readings are sent one
    /// at a time in queue order; a failed reading is marked `error` and the
    /// pass moves on.
    ///
    /// # Errors
    /// - `Storage` if the queue itself cannot be read
    pub async fn sync_all(&self, identity: &UserIdentity) -> Result<SyncOutcome> {
        let Some(_guard) = PassGuard::acquire(&self.in_progress) else {
            debug!("Sync pass already in progress");
            return Ok(SyncOutcome::default());
        };

        if !self.is_reachable().await {
            info!("Ingestion server unreachable, skipping sync pass");
            return Ok(SyncOutcome::default());
        }

        self.store.requeue_interrupted()?;
        let readings = self.store.query_by_status(&SyncStatus::ELIGIBLE)?;
        if readings.is_empty() {
            debug!("Nothing to sync");
            return Ok(SyncOutcome::default());
        }

        let start = Instant::now();
        info!("Starting sync pass for {} readings", readings.len());

        let mut outcome = SyncOutcome::default();
        for reading in &readings {
            match self.sync_reading(reading, identity).await {
                Ok(server_id) => {
                    outcome.success_count += 1;
                    debug!("Reading {} synced as {}", reading.id, server_id);
                }
                Err(e) => {
                    outcome.failed_count += 1;
                    warn!("Failed to sync reading {}: {}", reading.id, e);
                }
            }
        }

        info!(
            "Sync pass completed in {:?}: {} synced, {} failed",
            start.elapsed(),
            outcome.success_count,
            outcome.failed_count
        );
        Ok(outcome)
    }

    /// Drive one reading through `syncing` to `synced` or `error`.
    async fn sync_reading(&self, reading: &Reading, identity: &UserIdentity) -> Result<i64> {
        self.store.update(reading.id, &ReadingUpdate::syncing())?;

        let err = match self.transmit(reading, identity).await {
            Ok(ack) => match self.store.update(reading.id, &ReadingUpdate::synced(ack.id)) {
                Ok(()) => return Ok(ack.id),
                Err(store_err) => {
                    error!(
                        "Reading {} was accepted as {} but could not be marked synced: {}",
                        reading.id, ack.id, store_err
                    );
                    store_err
                }
            },
            Err(err) => err,
        };

        self.record_failure(reading.id, &err);
        Err(err)
    }

    /// Move a reading from `syncing` to `error`. If even that fails, the
    /// reading stays `syncing` until the next pass requeues it.
    fn record_failure(&self, id: ReadingId, err: &Error) {
        if let Err(store_err) = self
            .store
            .update(id, &ReadingUpdate::failed(failure_reason(err)))
        {
            error!(
                "Could not record failure of reading {}, it will be requeued: {}",
                id, store_err
            );
        }
    }

    async fn transmit(&self, reading: &Reading, identity: &UserIdentity) -> Result<ServerReading> {
        let submission = ReadingSubmission::from_reading(reading)?;
        let submission = &submission;
        let transport = &self.transport;

        self.retry
            .run(move || transport.submit_reading(submission, identity))
            .await
    }
}

/// Message stored on a failed reading.
fn failure_reason(err: &Error) -> String {
    match err {
        Error::Codec(msg) => format!("Stored photo is unreadable: {}", msg),
        other => other.to_string(),
    }
}
