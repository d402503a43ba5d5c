//! Records kept by the local store.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

use meterline_common::{
    decode_photo, DeviceId, Error, Photo, ReadingId, Result, UserIdentity,
};

/// Sync status of a single reading.
///
/// ```text
/// pending  -> syncing
/// syncing  -> synced   (terminal)
/// syncing  -> error
/// error    -> syncing  (retry)
/// ```
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SyncStatus {
    /// Captured, waiting for its first sync attempt.
    Pending,
    /// A sync pass is transmitting it right now.
    Syncing,
    /// Accepted by the server.
    Synced,
    /// Last attempt failed; eligible for retry.
    Error,
}

impl SyncStatus {
    /// Statuses a sync pass picks up.
    pub const ELIGIBLE: [SyncStatus; 2] = [SyncStatus::Pending, SyncStatus::Error];

    pub fn as_str(&self) -> &'static str {
        match self {
            SyncStatus::Pending => "pending",
            SyncStatus::Syncing => "syncing",
            SyncStatus::Synced => "synced",
            SyncStatus::Error => "error",
        }
    }

    /// Whether a sync attempt may start from this status.
    pub fn is_eligible(&self) -> bool {
        matches!(self, SyncStatus::Pending | SyncStatus::Error)
    }

    pub fn is_terminal(&self) -> bool {
        *self == SyncStatus::Synced
    }

    /// Check a transition against the reading state machine.
    pub fn can_transition_to(&self, next: SyncStatus) -> bool {
        matches!(
            (self, next),
            (SyncStatus::Pending, SyncStatus::Syncing)
                | (SyncStatus::Error, SyncStatus::Syncing)
                | (SyncStatus::Syncing, SyncStatus::Synced)
                | (SyncStatus::Syncing, SyncStatus::Error)
        )
    }
}

impl fmt::Display for SyncStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for SyncStatus {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "pending" => Ok(SyncStatus::Pending),
            "syncing" => Ok(SyncStatus::Syncing),
            "synced" => Ok(SyncStatus::Synced),
            "error" => Ok(SyncStatus::Error),
            other => Err(Error::InvalidInput(format!("Unknown sync status: {}", other))),
        }
    }
}

/// A queued counter reading.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Reading {
    pub id: ReadingId,
    pub device_id: DeviceId,
    /// Device name at capture time, kept for offline display.
    pub device_name: String,
    pub counter_value: f64,
    /// Photo in its data URL form; see [`meterline_common::codec`].
    pub photo: String,
    pub notes: Option<String>,
    /// Client-side capture time.
    pub timestamp: DateTime<Utc>,
    pub sync_status: SyncStatus,
    /// Server identity, present iff `sync_status` is `Synced`.
    pub server_reading_id: Option<i64>,
    /// Failure reason, present iff `sync_status` is `Error`.
    pub error_message: Option<String>,
    /// Number of sync attempts started for this reading.
    pub attempts: u32,
}

impl Reading {
    /// Decode the stored photo back to binary.
    pub fn decode_photo(&self) -> Result<Photo> {
        decode_photo(&self.photo)
    }
}

/// A reading as captured by the form, before it is queued.
#[derive(Debug, Clone)]
pub struct NewReading {
    pub device_id: DeviceId,
    pub device_name: String,
    pub counter_value: f64,
    pub photo: Photo,
    pub notes: Option<String>,
    pub timestamp: DateTime<Utc>,
}

impl NewReading {
    /// Capture a reading now.
    pub fn new(
        device_id: DeviceId,
        device_name: impl Into<String>,
        counter_value: f64,
        photo: Photo,
    ) -> Self {
        Self {
            device_id,
            device_name: device_name.into(),
            counter_value,
            photo,
            notes: None,
            timestamp: Utc::now(),
        }
    }

    /// Attach free-text notes; blank notes are dropped.
    pub fn with_notes(mut self, notes: impl Into<String>) -> Self {
        let notes = notes.into();
        self.notes = if notes.trim().is_empty() {
            None
        } else {
            Some(notes)
        };
        self
    }

    pub fn with_timestamp(mut self, timestamp: DateTime<Utc>) -> Self {
        self.timestamp = timestamp;
        self
    }

    /// Reject payloads that must never enter the queue.
    ///
    /// # Errors
    /// - Counter value negative, NaN or infinite
    /// - Empty photo, or a MIME type that is not a bare `type/subtype`
    pub fn validate(&self) -> Result<()> {
        if !self.counter_value.is_finite() {
            return Err(Error::Validation(
                "Counter value must be a finite number".to_string(),
            ));
        }
        if self.counter_value < 0.0 {
            return Err(Error::Validation(format!(
                "Counter value must be non-negative, got {}",
                self.counter_value
            )));
        }
        if self.photo.is_empty() {
            return Err(Error::Validation("Photo is required".to_string()));
        }
        if !self.photo.has_valid_mime() {
            return Err(Error::Validation(format!(
                "Unsupported photo type: {:?}",
                self.photo.mime()
            )));
        }
        Ok(())
    }
}

/// Partial mutation of a reading's sync fields.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ReadingUpdate {
    pub status: Option<SyncStatus>,
    pub server_reading_id: Option<i64>,
    pub error_message: Option<String>,
}

impl ReadingUpdate {
    /// A sync attempt starts.
    pub fn syncing() -> Self {
        Self {
            status: Some(SyncStatus::Syncing),
            ..Default::default()
        }
    }

    /// The server accepted the reading under `server_reading_id`.
    pub fn synced(server_reading_id: i64) -> Self {
        Self {
            status: Some(SyncStatus::Synced),
            server_reading_id: Some(server_reading_id),
            error_message: None,
        }
    }

    /// The attempt failed.
    pub fn failed(message: impl Into<String>) -> Self {
        Self {
            status: Some(SyncStatus::Error),
            server_reading_id: None,
            error_message: Some(message.into()),
        }
    }
}

/// Cached device, as served by `GET /devices`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Device {
    pub id: DeviceId,
    pub name: String,
    #[serde(default)]
    pub location: Option<String>,
    #[serde(default)]
    pub serial_number: Option<String>,
    #[serde(default)]
    pub description: Option<String>,
    #[serde(default)]
    pub last_synced_at: Option<DateTime<Utc>>,
}

/// Role of a user.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    Admin,
    Employee,
}

impl Role {
    pub fn as_str(&self) -> &'static str {
        match self {
            Role::Admin => "admin",
            Role::Employee => "employee",
        }
    }
}

impl FromStr for Role {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "admin" => Ok(Role::Admin),
            "employee" => Ok(Role::Employee),
            other => Err(Error::InvalidInput(format!("Unknown role: {}", other))),
        }
    }
}

/// Cached user profile, as served by `GET /me`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct User {
    pub telegram_id: UserIdentity,
    #[serde(default)]
    pub first_name: Option<String>,
    #[serde(default)]
    pub last_name: Option<String>,
    #[serde(default)]
    pub username: Option<String>,
    pub role: Role,
    #[serde(default)]
    pub last_synced_at: Option<DateTime<Utc>>,
}

impl User {
    /// Name to greet the user with.
    pub fn display_name(&self) -> String {
        match (&self.first_name, &self.last_name, &self.username) {
            (Some(first), Some(last), _) => format!("{} {}", first, last),
            (Some(first), None, _) => first.clone(),
            (None, _, Some(username)) => format!("@{}", username),
            _ => self.telegram_id.to_string(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_state_machine_transitions() {
        use SyncStatus::*;

        assert!(Pending.can_transition_to(Syncing));
        assert!(Error.can_transition_to(Syncing));
        assert!(Syncing.can_transition_to(Synced));
        assert!(Syncing.can_transition_to(Error));

        assert!(!Pending.can_transition_to(Synced));
        assert!(!Synced.can_transition_to(Syncing));
        assert!(!Synced.can_transition_to(Error));
        assert!(!Error.can_transition_to(Synced));
    }

    #[test]
    fn test_status_parse() {
        for status in [
            SyncStatus::Pending,
            SyncStatus::Syncing,
            SyncStatus::Synced,
            SyncStatus::Error,
        ] {
            assert_eq!(status.as_str().parse::<SyncStatus>().unwrap(), status);
        }
        assert!("done".parse::<SyncStatus>().is_err());
    }

    #[test]
    fn test_validation() {
        let device = DeviceId::new(1).unwrap();
        let ok = NewReading::new(device, "Boiler", 12.5, Photo::jpeg(vec![1, 2, 3]));
        assert!(ok.validate().is_ok());

        let negative = NewReading::new(device, "Boiler", -1.0, Photo::jpeg(vec![1]));
        assert!(matches!(negative.validate(), Err(Error::Validation(_))));

        let nan = NewReading::new(device, "Boiler", f64::NAN, Photo::jpeg(vec![1]));
        assert!(nan.validate().is_err());

        let no_photo = NewReading::new(device, "Boiler", 1.0, Photo::jpeg(Vec::new()));
        assert!(no_photo.validate().is_err());

        let bad_mime = NewReading::new(device, "Boiler", 1.0, Photo::new("image/x,y", vec![1]));
        assert!(matches!(bad_mime.validate(), Err(Error::Validation(_))));
    }

    #[test]
    fn test_blank_notes_dropped() {
        let reading = NewReading::new(DeviceId::new(1).unwrap(), "Boiler", 1.0, Photo::jpeg(vec![1]))
            .with_notes("   ");
        assert!(reading.notes.is_none());
    }

    #[test]
    fn test_device_from_server_json() {
        let json = r#"{
            "id": 3,
            "name": "Water meter #3",
            "location": "Basement",
            "serial_number": null,
            "created_by": 1,
            "is_active": true
        }"#;
        let device: Device = serde_json::from_str(json).unwrap();
        assert_eq!(device.id.get(), 3);
        assert_eq!(device.location.as_deref(), Some("Basement"));
        assert!(device.last_synced_at.is_none());

        let zero = r#"{"id": 0, "name": "Ghost"}"#;
        assert!(serde_json::from_str::<Device>(zero).is_err());
    }

    #[test]
    fn test_user_from_me_json() {
        let json = r#"{
            "id": 10,
            "telegram_id": 5294958157,
            "username": "ivan",
            "first_name": "Ivan",
            "last_name": null,
            "role": "admin"
        }"#;
        let user: User = serde_json::from_str(json).unwrap();
        assert_eq!(user.role, Role::Admin);
        assert_eq!(user.display_name(), "Ivan");
    }
}
