//! Store configuration, loaded from TOML.
//!
//! Only `api_base_url` is required; every other field has a default.

use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::Deserialize;

use crate::error::{Result, StoreError};

#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct StoreConfig {
    pub api_base_url: String,
    #[serde(default = "default_request_timeout_ms")]
    pub request_timeout_ms: u64,
    #[serde(default = "default_batch_window_ms")]
    pub batch_window_ms: u64,
    #[serde(default = "default_status_interval_ms")]
    pub status_interval_ms: u64,
    #[serde(default = "default_frontend_version")]
    pub frontend_version: String,
    /// File holding local preferences. Without it they live in memory.
    #[serde(default)]
    pub preferences_path: Option<PathBuf>,
}

fn default_request_timeout_ms() -> u64 {
    10_000
}

fn default_batch_window_ms() -> u64 {
    5
}

fn default_status_interval_ms() -> u64 {
    60_000
}

fn default_frontend_version() -> String {
    "0.9.1".to_string()
}

impl StoreConfig {
    /// Defaults for everything but the base URL.
    pub fn new(api_base_url: impl Into<String>) -> Self {
        Self {
            api_base_url: api_base_url.into(),
            request_timeout_ms: default_request_timeout_ms(),
            batch_window_ms: default_batch_window_ms(),
            status_interval_ms: default_status_interval_ms(),
            frontend_version: default_frontend_version(),
            preferences_path: None,
        }
    }

    pub fn from_path(path: &Path) -> Result<Self> {
        let contents = std::fs::read_to_string(path)?;
        Self::from_toml_str(&contents)
    }

    /// Parse and validate.
    pub fn from_toml_str(contents: &str) -> Result<Self> {
        let config: StoreConfig = toml::from_str(contents)?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<()> {
        let base = self.api_base_url.trim();
        if base.is_empty() {
            return Err(StoreError::Config {
                field: "api_base_url",
                reason: "must not be empty".to_string(),
            });
        }
        if !(base.starts_with("http://") || base.starts_with("https://")) {
            return Err(StoreError::Config {
                field: "api_base_url",
                reason: "must start with http:// or https://".to_string(),
            });
        }
        if self.request_timeout_ms == 0 {
            return Err(StoreError::Config {
                field: "request_timeout_ms",
                reason: "must be > 0".to_string(),
            });
        }
        if self.status_interval_ms == 0 {
            return Err(StoreError::Config {
                field: "status_interval_ms",
                reason: "must be > 0".to_string(),
            });
        }
        if self.frontend_version.trim().is_empty() {
            return Err(StoreError::Config {
                field: "frontend_version",
                reason: "must not be empty".to_string(),
            });
        }
        if self
            .preferences_path
            .as_ref()
            .is_some_and(|path| path.as_os_str().is_empty())
        {
            return Err(StoreError::Config {
                field: "preferences_path",
                reason: "must not be empty when set".to_string(),
            });
        }
        Ok(())
    }

    pub fn request_timeout(&self) -> Duration {
        Duration::from_millis(self.request_timeout_ms)
    }

    pub fn batch_window(&self) -> Duration {
        Duration::from_millis(self.batch_window_ms)
    }

    pub fn status_interval(&self) -> Duration {
        Duration::from_millis(self.status_interval_ms)
    }
}
