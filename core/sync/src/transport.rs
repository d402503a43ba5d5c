//! Ingestion server abstraction.

use async_trait::async_trait;
use chrono::{DateTime, SecondsFormat, Utc};
use serde::{Deserialize, Serialize};

use meterline_common::{DeviceId, Photo, Result, UserIdentity};
use meterline_store::{Device, Reading, User};

/// Name of the header carrying the caller identity.
pub const IDENTITY_HEADER: &str = "X-Telegram-User-Id";

/// One reading as transmitted to the server.
#[derive(Debug, Clone, PartialEq)]
pub struct ReadingSubmission {
    pub device_id: DeviceId,
    pub counter_value: f64,
    pub photo: Photo,
    pub client_timestamp: DateTime<Utc>,
    pub notes: Option<String>,
}

impl ReadingSubmission {
    /// Build a submission from a queued reading, decoding its photo.
    ///
    /// # Errors
    /// - Stored photo cannot be decoded
    pub fn from_reading(reading: &Reading) -> Result<Self> {
        Ok(Self {
            device_id: reading.device_id,
            counter_value: reading.counter_value,
            photo: reading.decode_photo()?,
            client_timestamp: reading.timestamp,
            notes: reading.notes.clone(),
        })
    }

    /// Decimal string form of the counter value.
    pub fn counter_value_text(&self) -> String {
        self.counter_value.to_string()
    }

    /// ISO-8601 UTC capture time with millisecond precision.
    pub fn client_timestamp_text(&self) -> String {
        self.client_timestamp
            .to_rfc3339_opts(SecondsFormat::Millis, true)
    }
}

/// Server acknowledgement of an accepted reading.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ServerReading {
    /// Server-assigned reading identity.
    pub id: i64,
    #[serde(default)]
    pub photo_path: Option<String>,
}

/// Reading ingestion server.
///
/// Implementations handle their own timeouts; every failure surfaces as
/// `Error::Network` or `Error::Http`.
#[async_trait]
pub trait ReadingTransport: Send + Sync {
    /// Transport name for logs (e.g. "http", "memory").
    fn name(&self) -> &str;

    /// Liveness probe. `Ok` means the server is reachable.
    async fn health(&self) -> Result<()>;

    /// Submit one reading on behalf of `identity`.
    ///
    /// # Errors
    /// - Network failure or timeout
    /// - Non-2xx response
    async fn submit_reading(
        &self,
        submission: &ReadingSubmission,
        identity: &UserIdentity,
    ) -> Result<ServerReading>;

    /// Fetch the device list.
    async fn fetch_devices(&self, identity: &UserIdentity) -> Result<Vec<Device>>;

    /// Fetch the caller's profile.
    async fn fetch_profile(&self, identity: &UserIdentity) -> Result<User>;
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;
    use meterline_common::{encode_photo, ReadingId};
    use meterline_store::SyncStatus;

    #[test]
    fn test_submission_from_reading() {
        let reading = Reading {
            id: ReadingId::new(1),
            device_id: DeviceId::new(12).unwrap(),
            device_name: "Boiler".to_string(),
            counter_value: 10.0,
            photo: encode_photo(&Photo::jpeg(vec![9, 8, 7])),
            notes: Some("ok".to_string()),
            timestamp: Utc.with_ymd_and_hms(2025, 2, 3, 4, 5, 6).unwrap(),
            sync_status: SyncStatus::Pending,
            server_reading_id: None,
            error_message: None,
            attempts: 0,
        };

        let submission = ReadingSubmission::from_reading(&reading).unwrap();
        assert_eq!(submission.photo.bytes(), &[9, 8, 7]);
        assert_eq!(submission.counter_value_text(), "10");
        assert_eq!(submission.client_timestamp_text(), "2025-02-03T04:05:06.000Z");
    }

    #[test]
    fn test_server_reading_ignores_extra_fields() {
        let json = r#"{"id": 77, "device_id": 3, "counter_value": 12.5, "photo_path": "a.jpg"}"#;
        let ack: ServerReading = serde_json::from_str(json).unwrap();
        assert_eq!(ack.id, 77);
        assert_eq!(ack.photo_path.as_deref(), Some("a.jpg"));
    }
}
