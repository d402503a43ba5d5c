//! Common error types for meterline.

use thiserror::Error;

/// Top-level error type for meterline operations.
#[derive(Debug, Error)]
pub enum Error {
    /// Local persistence failed (disk, quota, corrupted database).
    #[error("Storage error: {0}")]
    Storage(String),

    /// Reading payload rejected before it reached the queue.
    #[error("Validation error: {0}")]
    Validation(String),

    /// Transport failure: timeout, DNS, connection refused.
    #[error("Network error: {0}")]
    Network(String),

    /// The ingestion server answered with a non-2xx status.
    #[error("Server responded with {status}: {message}")]
    Http { status: u16, message: String },

    /// A sync status change outside the reading state machine.
    #[error("Invalid status transition from {from} to {to}")]
    InvalidTransition { from: String, to: String },

    /// Photo payload could not be encoded or decoded.
    #[error("Codec error: {0}")]
    Codec(String),

    /// A response or cached record could not be decoded.
    #[error("Serialization error: {0}")]
    Serialization(String),

    /// Invalid input provided.
    #[error("Invalid input: {0}")]
    InvalidInput(String),

    /// Resource not found.
    #[error("Not found: {0}")]
    NotFound(String),
}

impl Error {
    /// Whether the failure came from talking to the ingestion server.
    pub fn is_network(&self) -> bool {
        matches!(self, Error::Network(_) | Error::Http { .. })
    }
}

/// Result type alias using the common Error.
pub type Result<T> = std::result::Result<T, Error>;
