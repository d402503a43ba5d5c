//! Client configuration file.

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;

use meterline_common::UserIdentity;
use meterline_sync::{HttpTransportConfig, SyncConfig, SyncMode, DEFAULT_BASE_URL};

/// Settings read from `config.json`; every field is optional in the file.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ClientConfig {
    /// API base URL.
    pub server_url: String,
    /// Telegram user id sent with every request.
    pub user_id: Option<i64>,
    /// Queue database; defaults to the platform data directory.
    pub database_path: Option<PathBuf>,
    pub probe_timeout_secs: u64,
    pub request_timeout_secs: u64,
    pub sync_interval_secs: u64,
    pub upload_retries: u32,
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            server_url: DEFAULT_BASE_URL.to_string(),
            user_id: None,
            database_path: None,
            probe_timeout_secs: 5,
            request_timeout_secs: 30,
            sync_interval_secs: 10,
            upload_retries: 0,
        }
    }
}

impl ClientConfig {
    /// `<config dir>/meterline/config.json`, if the platform has one.
    pub fn default_path() -> Option<PathBuf> {
        dirs::config_dir().map(|dir| dir.join("meterline").join("config.json"))
    }

    /// Load from `path`. A missing file yields the defaults.
    pub fn load(path: &Path) -> Result<Self> {
        if !path.exists() {
            return Ok(Self::default());
        }

        let content = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read config file {}", path.display()))?;
        serde_json::from_str(&content)
            .with_context(|| format!("Invalid config file {}", path.display()))
    }

    pub fn database_path(&self) -> PathBuf {
        self.database_path.clone().unwrap_or_else(|| {
            dirs::data_dir()
                .unwrap_or_else(|| PathBuf::from("."))
                .join("meterline")
                .join("readings.db")
        })
    }

    /// The configured identity; required for anything that talks to the server.
    pub fn identity(&self) -> Result<UserIdentity> {
        let id = self
            .user_id
            .context("No user id configured; pass --user or set user_id in the config file")?;
        Ok(UserIdentity::new(id)?)
    }

    pub fn http_config(&self) -> HttpTransportConfig {
        HttpTransportConfig {
            base_url: self.server_url.clone(),
            probe_timeout: Duration::from_secs(self.probe_timeout_secs),
            request_timeout: Duration::from_secs(self.request_timeout_secs),
        }
    }

    pub fn sync_config(&self) -> SyncConfig {
        SyncConfig {
            upload_retries: self.upload_retries,
            probe_timeout: Duration::from_secs(self.probe_timeout_secs),
            ..SyncConfig::default()
        }
    }

    pub fn sync_mode(&self) -> SyncMode {
        SyncMode::Hybrid {
            interval: Duration::from_secs(self.sync_interval_secs.max(1)),
        }
    }
}
