//! Sync scheduling: save-time kicks, periodic ticks and reconnects.
//!
//! All triggers converge on a single consumer task that owns the calls into
//! [`SyncEngine::sync_all`], so passes never overlap. Commands are handled
//! ahead of kicks and ticks.

use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, oneshot, Notify, RwLock};
use tokio::time::{interval, Interval, MissedTickBehavior};
use tracing::{debug, error, info};

use meterline_common::{Error, Result, UserIdentity};

use crate::engine::{SyncEngine, SyncOutcome};
use crate::transport::ReadingTransport;

/// Sync mode configuration.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum SyncMode {
    /// Explicit requests only.
    Manual,
    /// Sync when a reading is queued or the network comes back.
    OnDemand,
    /// Sync at regular intervals and when the network comes back.
    Periodic { interval: Duration },
    /// Both on-demand and periodic.
    Hybrid { interval: Duration },
}

impl SyncMode {
    fn interval(&self) -> Option<Duration> {
        match self {
            SyncMode::Periodic { interval } | SyncMode::Hybrid { interval } => Some(*interval),
            _ => None,
        }
    }

    fn follows_kicks(&self) -> bool {
        matches!(self, SyncMode::OnDemand | SyncMode::Hybrid { .. })
    }

    fn follows_reconnects(&self) -> bool {
        !matches!(self, SyncMode::Manual)
    }
}

impl Default for SyncMode {
    fn default() -> Self {
        SyncMode::Hybrid {
            interval: Duration::from_secs(10),
        }
    }
}

/// Commands accepted by the scheduler task.
#[derive(Debug)]
pub enum SyncCommand {
    /// Run a pass now and report its outcome.
    SyncNow(oneshot::Sender<Result<SyncOutcome>>),
    /// Connectivity changed, as observed by the host.
    Connectivity(bool),
    /// The mode was replaced; re-read it.
    ModeChanged,
    /// Stop the scheduler.
    Shutdown,
}

/// Front end for talking to a running scheduler.
#[derive(Clone)]
pub struct SyncScheduler {
    mode: Arc<RwLock<SyncMode>>,
    command_tx: mpsc::Sender<SyncCommand>,
}

impl SyncScheduler {
    /// Create a scheduler for `engine` acting as `identity`.
    ///
    /// The returned handle must be run (usually spawned) for anything to
    /// happen.
    pub fn new<T>(
        engine: Arc<SyncEngine<T>>,
        identity: UserIdentity,
        mode: SyncMode,
    ) -> (Self, SyncSchedulerHandle<T>)
    where
        T: ReadingTransport + ?Sized + 'static,
    {
        let (command_tx, command_rx) = mpsc::channel(32);
        let mode = Arc::new(RwLock::new(mode));
        let kick = engine.kick_signal();

        let scheduler = Self {
            mode: mode.clone(),
            command_tx,
        };

        let handle = SyncSchedulerHandle {
            engine,
            identity,
            mode,
            command_rx,
            kick,
        };

        (scheduler, handle)
    }

    /// Run a pass now, bypassing the pending-count check.
    pub async fn request_sync(&self) -> Result<SyncOutcome> {
        let (response_tx, response_rx) = oneshot::channel();

        self.command_tx
            .send(SyncCommand::SyncNow(response_tx))
            .await
            .map_err(|_| Error::InvalidInput("Scheduler not running".to_string()))?;

        response_rx.await.map_err(|_| {
            Error::InvalidInput("Scheduler stopped before reporting".to_string())
        })?
    }

    /// Report a connectivity change; going online triggers a pass.
    pub async fn set_online(&self, online: bool) {
        let _ = self
            .command_tx
            .send(SyncCommand::Connectivity(online))
            .await;
    }

    /// Change the sync mode. Takes effect immediately on a running task.
    pub async fn set_mode(&self, mode: SyncMode) {
        *self.mode.write().await = mode;
        let _ = self.command_tx.send(SyncCommand::ModeChanged).await;
    }

    /// Get current sync mode.
    pub async fn get_mode(&self) -> SyncMode {
        self.mode.read().await.clone()
    }

    /// Shutdown the scheduler.
    pub async fn shutdown(&self) {
        let _ = self.command_tx.send(SyncCommand::Shutdown).await;
    }
}

/// The scheduler's consumer task.
pub struct SyncSchedulerHandle<T: ReadingTransport + ?Sized> {
    engine: Arc<SyncEngine<T>>,
    identity: UserIdentity,
    mode: Arc<RwLock<SyncMode>>,
    command_rx: mpsc::Receiver<SyncCommand>,
    kick: Arc<Notify>,
}

impl<T: ReadingTransport + ?Sized + 'static> SyncSchedulerHandle<T> {
    /// Run until shut down or every [`SyncScheduler`] is dropped.
    pub async fn run(self) {
        let Self {
            engine,
            identity,
            mode,
            mut command_rx,
            kick,
        } = self;

        let mut online = true;
        let mut current_interval = mode.read().await.interval();
        let mut ticker = current_interval.map(periodic);

        info!("Sync scheduler started");

        loop {
            tokio::select! {
                biased;

                command = command_rx.recv() => match command {
                    Some(SyncCommand::SyncNow(response_tx)) => {
                        debug!("Manual sync requested");
                        let _ = response_tx.send(engine.sync_all(&identity).await);
                    }
                    Some(SyncCommand::Connectivity(now_online)) => {
                        let reconnected = now_online && !online;
                        online = now_online;
                        if reconnected && mode.read().await.follows_reconnects() {
                            info!("Back online");
                            sync_if_pending(&engine, &identity, "reconnect").await;
                        }
                    }
                    Some(SyncCommand::ModeChanged) => {
                        debug!("Sync mode changed to {:?}", *mode.read().await);
                    }
                    Some(SyncCommand::Shutdown) | None => {
                        info!("Sync scheduler shutting down");
                        break;
                    }
                },

                _ = kick.notified() => {
                    if online && mode.read().await.follows_kicks() {
                        sync_if_pending(&engine, &identity, "new reading").await;
                    }
                }

                _ = wait_for_tick(&mut ticker) => {
                    if online && mode.read().await.interval().is_some() {
                        sync_if_pending(&engine, &identity, "periodic").await;
                    }
                }
            }

            let expected_interval = mode.read().await.interval();
            if expected_interval != current_interval {
                debug!("Sync interval changed to {:?}", expected_interval);
                current_interval = expected_interval;
                ticker = current_interval.map(periodic);
            }
        }
    }
}

fn periodic(period: Duration) -> Interval {
    let mut ticker = interval(period);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
    ticker
}

async fn wait_for_tick(ticker: &mut Option<Interval>) {
    match ticker {
        Some(ticker) => {
            ticker.tick().await;
        }
        None => std::future::pending::<()>().await,
    }
}

async fn sync_if_pending<T: ReadingTransport + ?Sized>(
    engine: &SyncEngine<T>,
    identity: &UserIdentity,
    reason: &str,
) {
    match engine.pending_count() {
        Ok(0) => debug!("No pending readings ({})", reason),
        Ok(pending) => {
            debug!("Syncing {} pending readings ({})", pending, reason);
            match engine.sync_all(identity).await {
                Ok(outcome) if outcome.attempted() > 0 => info!(
                    "Sync ({}) completed: {} synced, {} failed",
                    reason, outcome.success_count, outcome.failed_count
                ),
                Ok(_) => debug!("Sync ({}) did not run", reason),
                Err(e) => error!("Sync ({}) failed: {}", reason, e),
            }
        }
        Err(e) => error!("Could not count pending readings: {}", e),
    }
}
