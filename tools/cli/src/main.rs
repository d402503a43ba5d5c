//! Meterline CLI - Field client for recording meter readings.
//!
//! Readings are queued locally first and delivered to the ingestion server
//! whenever it can be reached.

mod config;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use tracing::{info, warn, Level};
use tracing_subscriber::FmtSubscriber;

use meterline_common::{DeviceId, Photo, UserIdentity};
use meterline_store::{LocalStore, NewReading, Reading, SyncStatus};
use meterline_sync::{CacheSource, HttpTransport, SyncEngine, SyncMode, SyncScheduler};

use crate::config::ClientConfig;

#[derive(Parser)]
#[command(name = "meterline")]
#[command(about = "Meterline - Offline meter reading client")]
#[command(version)]
struct Cli {
    /// Enable verbose logging.
    #[arg(short, long)]
    verbose: bool,

    /// Config file (default: <config dir>/meterline/config.json).
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// API base URL, overriding the config file.
    #[arg(long)]
    server: Option<String>,

    /// Telegram user id, overriding the config file.
    #[arg(short, long)]
    user: Option<i64>,

    /// Queue database, overriding the config file.
    #[arg(long)]
    database: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Record a reading and try to deliver it right away.
    Add {
        /// Device id.
        #[arg(short, long)]
        device: i64,

        /// Counter value.
        #[arg(long)]
        value: f64,

        /// Photo of the counter.
        #[arg(short, long)]
        photo: PathBuf,

        /// Device name; looked up in the device cache when omitted.
        #[arg(short, long)]
        name: Option<String>,

        /// Free-form notes.
        #[arg(long)]
        notes: Option<String>,

        /// Only queue the reading.
        #[arg(long)]
        offline: bool,
    },

    /// Deliver every queued reading now.
    Sync,

    /// Show queue counts and server reachability.
    Status,

    /// List queued readings, newest first.
    List {
        /// Only readings in this state: pending, syncing, synced or error.
        #[arg(short, long)]
        status: Option<SyncStatus>,
    },

    /// Refresh and show the device list.
    Devices,

    /// Refresh and show the current user's profile.
    Whoami,

    /// Keep syncing in the foreground until interrupted.
    Run {
        /// Seconds between periodic passes.
        #[arg(short, long)]
        interval: Option<u64>,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    // Setup logging
    let level = if cli.verbose {
        Level::DEBUG
    } else {
        Level::INFO
    };

    let subscriber = FmtSubscriber::builder()
        .with_max_level(level)
        .with_target(false)
        .compact()
        .finish();
    tracing::subscriber::set_global_default(subscriber)?;

    let config = load_config(&cli)?;

    match cli.command {
        Commands::Add {
            device,
            value,
            photo,
            name,
            notes,
            offline,
        } => cmd_add(&config, device, value, &photo, name, notes, offline).await,

        Commands::Sync => cmd_sync(&config).await,

        Commands::Status => cmd_status(&config).await,

        Commands::List { status } => cmd_list(&config, status),

        Commands::Devices => cmd_devices(&config).await,

        Commands::Whoami => cmd_whoami(&config).await,

        Commands::Run { interval } => cmd_run(&config, interval).await,
    }
}

/// Config file values with command-line overrides applied.
fn load_config(cli: &Cli) -> Result<ClientConfig> {
    let path = cli
        .config
        .clone()
        .or_else(ClientConfig::default_path)
        .context("Could not determine a config file location; pass --config")?;

    let mut config = ClientConfig::load(&path)?;
    if let Some(server) = &cli.server {
        config.server_url = server.clone();
    }
    if let Some(user) = cli.user {
        config.user_id = Some(user);
    }
    if let Some(database) = &cli.database {
        config.database_path = Some(database.clone());
    }
    Ok(config)
}

fn open_store(config: &ClientConfig) -> Result<Arc<LocalStore>> {
    let path = config.database_path();
    if let Some(parent) = path.parent() {
        if !parent.as_os_str().is_empty() {
            std::fs::create_dir_all(parent)
                .with_context(|| format!("Failed to create {}", parent.display()))?;
        }
    }

    let store = LocalStore::open(&path)
        .with_context(|| format!("Failed to open queue at {}", path.display()))?;
    Ok(Arc::new(store))
}

fn open_engine(config: &ClientConfig) -> Result<Arc<SyncEngine<HttpTransport>>> {
    let store = open_store(config)?;
    let transport =
        HttpTransport::new(config.http_config()).context("Failed to set up HTTP transport")?;
    Ok(Arc::new(SyncEngine::new(
        store,
        Arc::new(transport),
        config.sync_config(),
    )))
}

/// Record a reading.
async fn cmd_add(
    config: &ClientConfig,
    device: i64,
    value: f64,
    photo_path: &Path,
    name: Option<String>,
    notes: Option<String>,
    offline: bool,
) -> Result<()> {
    let device_id = DeviceId::new(device)?;
    let engine = open_engine(config)?;

    let content = tokio::fs::read(photo_path)
        .await
        .with_context(|| format!("Failed to read photo {}", photo_path.display()))?;
    let extension = photo_path.extension().and_then(|e| e.to_str());
    let photo = Photo::from_extension(extension, content);

    let device_name = match name {
        Some(name) => name,
        None => engine
            .store()
            .device(device_id)?
            .map(|d| d.name)
            .unwrap_or_else(|| format!("Device {}", device_id)),
    };

    let mut reading = NewReading::new(device_id, device_name, value, photo);
    if let Some(notes) = notes {
        reading = reading.with_notes(notes);
    }

    let id = engine
        .enqueue_and_kick(&reading)
        .context("Failed to queue reading")?;
    println!("Reading queued: #{}", id);

    if offline {
        return Ok(());
    }

    let identity = config.identity()?;
    let outcome = engine.sync_all(&identity).await?;
    match engine.store().get(id)? {
        Some(stored) if stored.sync_status == SyncStatus::Synced => {
            println!("Delivered to server.");
        }
        Some(stored) if stored.sync_status == SyncStatus::Error => {
            println!(
                "Delivery failed, will retry later: {}",
                stored.error_message.unwrap_or_default()
            );
        }
        _ if outcome.attempted() == 0 => println!("Server unreachable, kept for later."),
        _ => {}
    }

    Ok(())
}

/// Run one sync pass.
async fn cmd_sync(config: &ClientConfig) -> Result<()> {
    let identity = config.identity()?;
    let engine = open_engine(config)?;

    let pending = engine.pending_count()?;
    if pending == 0 {
        println!("Nothing to sync.");
        return Ok(());
    }

    info!("Syncing {} readings to {}", pending, config.server_url);
    let outcome = engine.sync_all(&identity).await?;

    if outcome.attempted() == 0 {
        println!("Server unreachable; {} readings still queued.", pending);
    } else {
        println!("Synced: {}", outcome.success_count);
        println!("Failed: {}", outcome.failed_count);
    }

    Ok(())
}

/// Show queue counts.
async fn cmd_status(config: &ClientConfig) -> Result<()> {
    let engine = open_engine(config)?;
    let counts = engine.store().status_counts()?;
    let count = |status: SyncStatus| counts.get(&status).copied().unwrap_or(0);

    println!("Queue:");
    println!("  Pending: {}", count(SyncStatus::Pending));
    println!("  Syncing: {}", count(SyncStatus::Syncing));
    println!("  Synced:  {}", count(SyncStatus::Synced));
    println!("  Error:   {}", count(SyncStatus::Error));
    println!("Server: {}", config.server_url);
    println!(
        "  Reachable: {}",
        if engine.is_reachable().await { "yes" } else { "no" }
    );

    Ok(())
}

/// List readings.
fn cmd_list(config: &ClientConfig, status: Option<SyncStatus>) -> Result<()> {
    let store = open_store(config)?;

    let mut readings = match status {
        Some(status) => store.query_by_status(&[status])?,
        None => store.all_readings()?,
    };
    readings.sort_by(|a, b| b.timestamp.cmp(&a.timestamp).then(b.id.cmp(&a.id)));

    if readings.is_empty() {
        println!("No readings.");
        return Ok(());
    }

    for reading in &readings {
        print_reading(reading);
    }

    Ok(())
}

fn print_reading(reading: &Reading) {
    let taken = reading.timestamp.with_timezone(&chrono::Local);
    println!(
        "#{:<5} {} {:<24} {:>12} [{}]",
        reading.id.get(),
        taken.format("%Y-%m-%d %H:%M"),
        reading.device_name,
        reading.counter_value,
        reading.sync_status
    );
    if let Some(server_id) = reading.server_reading_id {
        println!("       server id {}", server_id);
    }
    if let Some(error) = &reading.error_message {
        println!("       {} (attempts: {})", error, reading.attempts);
    }
    if let Some(notes) = &reading.notes {
        println!("       {}", notes);
    }
}

/// Show devices.
async fn cmd_devices(config: &ClientConfig) -> Result<()> {
    let identity = config.identity()?;
    let engine = open_engine(config)?;

    let devices = engine.refresh_devices(&identity).await?;
    if devices.source == CacheSource::Cache {
        warn!("Server unavailable, showing cached devices");
    }

    if devices.value.is_empty() {
        println!("No devices.");
        return Ok(());
    }

    for device in &devices.value {
        let location = device.location.as_deref().unwrap_or("-");
        println!("  [{}] {} ({})", device.id, device.name, location);
    }

    Ok(())
}

/// Show the current user.
async fn cmd_whoami(config: &ClientConfig) -> Result<()> {
    let identity = config.identity()?;
    let engine = open_engine(config)?;

    let profile = engine.refresh_profile(&identity).await?;
    if profile.source == CacheSource::Cache {
        warn!("Server unavailable, showing cached profile");
    }

    match profile.value {
        Some(user) => {
            println!("User: {}", user.display_name());
            println!("  Telegram ID: {}", user.telegram_id);
            println!("  Role: {}", user.role.as_str());
            if let Some(synced) = user.last_synced_at {
                println!("  Last synced: {}", synced.with_timezone(&chrono::Local));
            }
        }
        None => println!("Unknown user {}.", identity),
    }

    Ok(())
}

/// Foreground sync loop.
async fn cmd_run(config: &ClientConfig, interval: Option<u64>) -> Result<()> {
    let identity: UserIdentity = config.identity()?;
    let engine = open_engine(config)?;

    let mode = match interval {
        Some(secs) => SyncMode::Hybrid {
            interval: Duration::from_secs(secs.max(1)),
        },
        None => config.sync_mode(),
    };

    let (scheduler, handle) = SyncScheduler::new(engine.clone(), identity, mode.clone());
    let task = tokio::spawn(handle.run());

    info!("Syncing to {} ({:?}); press Ctrl-C to stop", config.server_url, mode);
    match scheduler.request_sync().await {
        Ok(outcome) if outcome.attempted() > 0 => info!(
            "Initial sync: {} synced, {} failed",
            outcome.success_count, outcome.failed_count
        ),
        Ok(_) => {}
        Err(e) => warn!("Initial sync failed: {}", e),
    }

    tokio::signal::ctrl_c()
        .await
        .context("Failed to listen for Ctrl-C")?;

    scheduler.shutdown().await;
    task.await.context("Scheduler task failed")?;
    println!("Stopped. {} readings still queued.", engine.pending_count()?);

    Ok(())
}
