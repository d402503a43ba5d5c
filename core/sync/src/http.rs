//! HTTP client for the reading ingestion server.

use async_trait::async_trait;
use chrono::Utc;
use reqwest::multipart::{Form, Part};
use reqwest::{header, Client, StatusCode};
use serde::{Deserialize, Serialize};
use std::time::Duration;
use tracing::debug;
use url::Url;

use meterline_common::{Error, Result, UserIdentity};
use meterline_store::{Device, User};

use crate::transport::{ReadingSubmission, ReadingTransport, ServerReading, IDENTITY_HEADER};

/// Default API base URL.
pub const DEFAULT_BASE_URL: &str = "http://localhost:3000/api";

/// Configuration for the HTTP transport.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HttpTransportConfig {
    /// API base URL, e.g. `https://meters.example.org/api`.
    pub base_url: String,
    /// Bound on the liveness probe.
    pub probe_timeout: Duration,
    /// Bound on every other request, uploads included.
    pub request_timeout: Duration,
}

impl Default for HttpTransportConfig {
    fn default() -> Self {
        Self {
            base_url: DEFAULT_BASE_URL.to_string(),
            probe_timeout: Duration::from_secs(5),
            request_timeout: Duration::from_secs(30),
        }
    }
}

/// Error body shape used by the server (`{"error": "..."}`).
#[derive(Debug, Deserialize)]
struct ErrorBody {
    error: String,
}

/// Ingestion server reached over HTTP.
pub struct HttpTransport {
    http: Client,
    base_url: Url,
    probe_timeout: Duration,
}

impl HttpTransport {
    /// Create a new HTTP transport.
    ///
    /// # Errors
    /// - Base URL does not parse
    /// - HTTP client cannot be built
    pub fn new(config: HttpTransportConfig) -> Result<Self> {
        let mut base = config.base_url.trim().to_string();
        if !base.ends_with('/') {
            base.push('/');
        }
        let base_url = Url::parse(&base)
            .map_err(|e| Error::InvalidInput(format!("Invalid server URL {}: {}", base, e)))?;

        let http = Client::builder()
            .user_agent(concat!("meterline/", env!("CARGO_PKG_VERSION")))
            .timeout(config.request_timeout)
            .build()
            .map_err(|e| Error::Network(format!("Failed to create HTTP client: {}", e)))?;

        Ok(Self {
            http,
            base_url,
            probe_timeout: config.probe_timeout,
        })
    }

    /// The normalized base URL.
    pub fn base_url(&self) -> &Url {
        &self.base_url
    }

    fn endpoint(&self, path: &str) -> Result<Url> {
        self.base_url
            .join(path)
            .map_err(|e| Error::InvalidInput(format!("Invalid endpoint {}: {}", path, e)))
    }

    async fn get_json<T: serde::de::DeserializeOwned>(
        &self,
        path: &str,
        identity: &UserIdentity,
    ) -> Result<T> {
        let response = self
            .http
            .get(self.endpoint(path)?)
            .header(IDENTITY_HEADER, identity.to_header_value())
            .header(header::ACCEPT, "application/json")
            .send()
            .await
            .map_err(|e| Error::Network(format!("GET {} failed: {}", path, e)))?;

        self.handle_response(response).await
    }

    async fn handle_response<T: serde::de::DeserializeOwned>(
        &self,
        response: reqwest::Response,
    ) -> Result<T> {
        let status = response.status();

        if status.is_success() {
            let body = response
                .bytes()
                .await
                .map_err(|e| Error::Network(format!("Failed to read response: {}", e)))?;
            parse_body(&body)
        } else {
            let body = response.text().await.unwrap_or_default();
            Err(Error::Http {
                status: status.as_u16(),
                message: error_message(status, &body),
            })
        }
    }
}

#[async_trait]
impl ReadingTransport for HttpTransport {
    fn name(&self) -> &str {
        "http"
    }

    async fn health(&self) -> Result<()> {
        let response = self
            .http
            .get(self.endpoint("health")?)
            .timeout(self.probe_timeout)
            .send()
            .await
            .map_err(|e| Error::Network(format!("Health check failed: {}", e)))?;

        let status = response.status();
        if status == StatusCode::OK {
            Ok(())
        } else {
            Err(Error::Http {
                status: status.as_u16(),
                message: "Health check did not return 200".to_string(),
            })
        }
    }

    async fn submit_reading(
        &self,
        submission: &ReadingSubmission,
        identity: &UserIdentity,
    ) -> Result<ServerReading> {
        let photo = Part::bytes(submission.photo.bytes().to_vec())
            .file_name(submission.photo.file_name())
            .mime_str(submission.photo.mime())
            .map_err(|e| Error::InvalidInput(format!("Invalid photo MIME type: {}", e)))?;

        let mut form = Form::new()
            .text("device_id", submission.device_id.to_string())
            .text("counter_value", submission.counter_value_text())
            .part("photo", photo)
            .text("client_timestamp", submission.client_timestamp_text());
        if let Some(notes) = &submission.notes {
            form = form.text("notes", notes.clone());
        }

        debug!(
            "Uploading reading for device {} ({} byte photo)",
            submission.device_id,
            submission.photo.len()
        );

        let response = self
            .http
            .post(self.endpoint("readings")?)
            .header(IDENTITY_HEADER, identity.to_header_value())
            .multipart(form)
            .send()
            .await
            .map_err(|e| Error::Network(format!("Upload failed: {}", e)))?;

        self.handle_response(response).await
    }

    async fn fetch_devices(&self, identity: &UserIdentity) -> Result<Vec<Device>> {
        let mut devices: Vec<Device> = self.get_json("devices", identity).await?;
        let now = Utc::now();
        for device in &mut devices {
            device.last_synced_at = Some(now);
        }
        Ok(devices)
    }

    async fn fetch_profile(&self, identity: &UserIdentity) -> Result<User> {
        let mut user: User = self.get_json("me", identity).await?;
        user.last_synced_at = Some(Utc::now());
        Ok(user)
    }
}

/// Decode a successful response body.
fn parse_body<T: serde::de::DeserializeOwned>(body: &[u8]) -> Result<T> {
    serde_json::from_slice(body)
        .map_err(|e| Error::Serialization(format!("Unexpected response body: {}", e)))
}

/// Human-readable reason for a failed response.
fn error_message(status: StatusCode, body: &str) -> String {
    if let Ok(parsed) = serde_json::from_str::<ErrorBody>(body) {
        return parsed.error;
    }
    let body = body.trim();
    if body.is_empty() {
        status
            .canonical_reason()
            .unwrap_or("Unexpected status")
            .to_string()
    } else {
        body.chars().take(200).collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_endpoints_keep_api_prefix() {
        let transport = HttpTransport::new(HttpTransportConfig {
            base_url: "http://localhost:3000/api".to_string(),
            ..Default::default()
        })
        .unwrap();

        assert_eq!(
            transport.endpoint("health").unwrap().as_str(),
            "http://localhost:3000/api/health"
        );
        assert_eq!(
            transport.endpoint("readings").unwrap().as_str(),
            "http://localhost:3000/api/readings"
        );
    }

    #[test]
    fn test_invalid_base_url() {
        let result = HttpTransport::new(HttpTransportConfig {
            base_url: "not a url".to_string(),
            ..Default::default()
        });
        assert!(matches!(result, Err(Error::InvalidInput(_))));
    }

    #[test]
    fn test_error_message_from_json_body() {
        let message = error_message(
            StatusCode::NOT_FOUND,
            r#"{"error": "Device not found"}"#,
        );
        assert_eq!(message, "Device not found");
    }

    #[test]
    fn test_error_message_falls_back_to_reason() {
        assert_eq!(
            error_message(StatusCode::INTERNAL_SERVER_ERROR, ""),
            "Internal Server Error"
        );
        assert_eq!(error_message(StatusCode::BAD_GATEWAY, "upstream down"), "upstream down");
    }

    #[test]
    fn test_malformed_ack_is_serialization_error() {
        let ack: ServerReading = parse_body(br#"{"id": 17, "photo_path": null}"#).unwrap();
        assert_eq!(ack.id, 17);

        let err = parse_body::<ServerReading>(b"<html>502</html>").unwrap_err();
        assert!(matches!(err, Error::Serialization(_)));
        assert!(!err.is_network());
    }

    #[tokio::test]
    async fn test_unreachable_server_is_network_error() {
        let transport = HttpTransport::new(HttpTransportConfig {
            base_url: "http://127.0.0.1:9/api".to_string(),
            probe_timeout: Duration::from_millis(500),
            request_timeout: Duration::from_millis(500),
        })
        .unwrap();

        let err = transport.health().await.unwrap_err();
        assert!(err.is_network());
    }
}
