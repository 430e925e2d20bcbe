//! Configuration System
//!
//! Handles loading configuration from files and environment variables.
//! Supports TOML config files; the auth token may be overridden via
//! `SEARCHLIGHT_AUTH_TOKEN`.

use serde::Deserialize;
use std::path::{Path, PathBuf};
use thiserror::Error;

/// Main configuration structure
#[derive(Debug, Clone, Default, Deserialize)]
pub struct ClientConfig {
    #[serde(default)]
    pub api: ApiConfig,

    #[serde(default)]
    pub search: SearchConfig,
}

/// Backend endpoint configuration
#[derive(Debug, Clone, Deserialize)]
pub struct ApiConfig {
    /// Base URL of the search backend (e.g., "http://localhost:8080")
    #[serde(default = "default_base_url")]
    pub base_url: String,

    /// Pre-issued auth token attached as a Bearer header
    #[serde(default)]
    pub auth_token: Option<String>,

    /// Request timeout for REST calls in milliseconds
    #[serde(default = "default_request_timeout")]
    pub request_timeout_ms: u64,
}

fn default_base_url() -> String {
    "http://localhost:8080".to_string()
}

fn default_request_timeout() -> u64 {
    5000
}

impl Default for ApiConfig {
    fn default() -> Self {
        Self {
            base_url: default_base_url(),
            auth_token: None,
            request_timeout_ms: default_request_timeout(),
        }
    }
}

/// Search subscription configuration
#[derive(Debug, Clone, Deserialize)]
pub struct SearchConfig {
    /// Path of the WebSocket subscription endpoint
    #[serde(default = "default_ws_path")]
    pub ws_path: String,

    /// Capacity of each output stream's broadcast channel
    #[serde(default = "default_stream_capacity")]
    pub stream_capacity: usize,

    /// Number of unparseable inbound frames tolerated before the session
    /// is terminated
    #[serde(default = "default_malformed_threshold")]
    pub malformed_frame_threshold: u32,
}

fn default_ws_path() -> String {
    "/api/ws/search".to_string()
}

fn default_stream_capacity() -> usize {
    1024
}

fn default_malformed_threshold() -> u32 {
    5
}

impl Default for SearchConfig {
    fn default() -> Self {
        Self {
            ws_path: default_ws_path(),
            stream_capacity: default_stream_capacity(),
            malformed_frame_threshold: default_malformed_threshold(),
        }
    }
}

impl ClientConfig {
    /// Load configuration from a TOML file
    pub fn load(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let content = std::fs::read_to_string(path.as_ref())
            .map_err(|e| ConfigError::Read(path.as_ref().to_path_buf(), e))?;
        let mut config: ClientConfig = toml::from_str(&content)?;
        config.apply_env_overrides();
        Ok(config)
    }

    /// Load from the default location, falling back to defaults if the file
    /// does not exist
    pub fn load_default() -> Result<Self, ConfigError> {
        match Self::default_path() {
            Some(path) if path.exists() => Self::load(path),
            _ => {
                let mut config = Self::default();
                config.apply_env_overrides();
                Ok(config)
            }
        }
    }

    /// Default config file location (`<config dir>/searchlight/config.toml`)
    pub fn default_path() -> Option<PathBuf> {
        dirs::config_dir().map(|p| p.join("searchlight").join("config.toml"))
    }

    /// Environment variables take precedence over file values
    fn apply_env_overrides(&mut self) {
        if let Ok(token) = std::env::var("SEARCHLIGHT_AUTH_TOKEN") {
            if !token.is_empty() {
                self.api.auth_token = Some(token);
            }
        }
        if let Ok(url) = std::env::var("SEARCHLIGHT_BASE_URL") {
            if !url.is_empty() {
                self.api.base_url = url;
            }
        }
    }

    /// WebSocket URL for the search subscription endpoint, derived from the
    /// base URL by swapping the scheme
    pub fn websocket_url(&self) -> String {
        let base = self.api.base_url.trim_end_matches('/');
        let ws_base = if let Some(rest) = base.strip_prefix("https://") {
            format!("wss://{}", rest)
        } else if let Some(rest) = base.strip_prefix("http://") {
            format!("ws://{}", rest)
        } else {
            base.to_string()
        };
        format!("{}{}", ws_base, self.search.ws_path)
    }
}

/// Errors that can occur when loading configuration
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("Failed to read config file {0}: {1}")]
    Read(PathBuf, #[source] std::io::Error),

    #[error("Failed to parse config file: {0}")]
    Parse(#[from] toml::de::Error),
}
