//! Common types used throughout meterline.

use serde::{Deserialize, Serialize};
use std::fmt;

/// Locally assigned identifier of a queued reading.
///
/// Stable for the lifetime of the record; never reused by the store.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ReadingId(i64);

impl ReadingId {
    /// Wrap a raw row id.
    pub fn new(id: i64) -> Self {
        Self(id)
    }

    /// Get the raw value.
    pub fn get(&self) -> i64 {
        self.0
    }
}

impl fmt::Display for ReadingId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Server-side identifier of a metered device.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(try_from = "i64", into = "i64")]
pub struct DeviceId(i64);

impl DeviceId {
    /// Create a new DeviceId.
    ///
    /// # Preconditions
    /// - `id` must be positive
    ///
    /// # Errors
    /// - Returns error if id is zero or negative
    pub fn new(id: i64) -> crate::Result<Self> {
        if id <= 0 {
            return Err(crate::Error::Validation(format!(
                "Device id must be positive, got {}",
                id
            )));
        }
        Ok(Self(id))
    }

    /// Get the raw value.
    pub fn get(&self) -> i64 {
        self.0
    }
}

impl fmt::Display for DeviceId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl TryFrom<i64> for DeviceId {
    type Error = crate::Error;

    fn try_from(id: i64) -> crate::Result<Self> {
        Self::new(id)
    }
}

impl From<DeviceId> for i64 {
    fn from(id: DeviceId) -> Self {
        id.0
    }
}

/// Identity of the caller, forwarded to the server out of band.
///
/// This is the Telegram user id of the field employee.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(try_from = "i64", into = "i64")]
pub struct UserIdentity(i64);

impl UserIdentity {
    /// Create a new identity.
    ///
    /// # Errors
    /// - Returns error if id is zero or negative
    pub fn new(id: i64) -> crate::Result<Self> {
        if id <= 0 {
            return Err(crate::Error::InvalidInput(format!(
                "User identity must be positive, got {}",
                id
            )));
        }
        Ok(Self(id))
    }

    /// Get the raw value.
    pub fn get(&self) -> i64 {
        self.0
    }

    /// Header value form.
    pub fn to_header_value(&self) -> String {
        self.0.to_string()
    }
}

impl fmt::Display for UserIdentity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl TryFrom<i64> for UserIdentity {
    type Error = crate::Error;

    fn try_from(id: i64) -> crate::Result<Self> {
        Self::new(id)
    }
}

impl From<UserIdentity> for i64 {
    fn from(identity: UserIdentity) -> Self {
        identity.0
    }
}
