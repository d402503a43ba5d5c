//! Common utilities and types shared across meterline modules.
//!
//! This module provides the error taxonomy, the identifiers that flow
//! between the local store, the sync engine and the ingestion server, and
//! the text-safe photo encoding used for persistence.

pub mod codec;
pub mod error;
pub mod types;

pub use codec::{decode_photo, encode_photo, is_valid_mime, Photo};
pub use error::{Error, Result};
pub use types::{DeviceId, ReadingId, UserIdentity};
