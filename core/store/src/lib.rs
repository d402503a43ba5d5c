//! Durable local store for queued readings and cached reference data.
//!
//! Readings captured in the field are written here first and only later
//! drained to the ingestion server by the sync engine. The store also keeps
//! the last known device list and user profile so the client keeps working
//! without a network.

pub mod model;
pub mod store;

pub use model::{Device, NewReading, Reading, ReadingUpdate, Role, SyncStatus, User};
pub use store::LocalStore;
