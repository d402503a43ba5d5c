//! Meterline Sync Engine
//!
//! This module delivers queued meter readings to the ingestion server:
//! - Guarded, sequential sync passes with a liveness probe
//! - Save-time kicks, periodic ticks and reconnect triggers
//! - HTTP and in-memory transports
//! - Optional in-pass retry with exponential backoff
//! - Offline-tolerant device and profile caches

pub mod cache;
pub mod engine;
pub mod http;
pub mod memory;
pub mod retry;
pub mod scheduler;
pub mod transport;

// Re-export main types
pub use cache::{CacheSource, Cached};
pub use engine::{SyncConfig, SyncEngine, SyncOutcome};
pub use http::{HttpTransport, HttpTransportConfig, DEFAULT_BASE_URL};
pub use memory::{MemoryTransport, ReceivedReading};
pub use retry::RetryPolicy;
pub use scheduler::{SyncCommand, SyncMode, SyncScheduler, SyncSchedulerHandle};
pub use transport::{ReadingSubmission, ReadingTransport, ServerReading, IDENTITY_HEADER};
