//! Configuration module for telewatch-rs
//!
//! This module holds every tunable of the telemetry core:
//! - Datastore capacity
//! - Throttling budget and estimator time constants
//! - Device request timing
//! - Client API chunking
//! - Logging output
//!
//! # Config Location
//!
//! When no explicit path is given the configuration is read from the
//! platform-appropriate data directory under `dev.telewatch.telewatch-rs`:
//!
//! - **Linux**: `~/.local/share/dev.telewatch.telewatch-rs/config.json`
//! - **macOS**: `~/Library/Application Support/dev.telewatch.telewatch-rs/config.json`
//! - **Windows**: `%APPDATA%\dev.telewatch.telewatch-rs\config.json`
//!
//! # Example
//!
//! ```ignore
//! use telewatch_rs::config::AppConfig;
//!
//! let config = AppConfig::load_or_default(None);
//! config.save("telewatch.json")?;
//! ```

use crate::error::{Result, TelewatchError};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Application identifier for data directories
pub const APP_ID: &str = "dev.telewatch.telewatch-rs";

/// Config filename
pub const CONFIG_FILE: &str = "config.json";

/// Default maximum number of datastore entries
pub const DEFAULT_MAX_ENTRIES: usize = 100_000;

/// Default streaming budget in bits per second
pub const DEFAULT_MEAN_BITRATE: f64 = 100_000.0;

/// Default time to wait for a device reply in milliseconds
pub const DEFAULT_RESPONSE_TIMEOUT_MS: u64 = 500;

// ==================== App Data Directory ====================

/// Get the application data directory path
pub fn app_data_dir() -> Option<PathBuf> {
    dirs_next::data_dir().map(|p| p.join(APP_ID))
}

/// Get the path to the default config file
pub fn default_config_path() -> Option<PathBuf> {
    app_data_dir().map(|p| p.join(CONFIG_FILE))
}

// ==================== App Config ====================

/// Complete telemetry core configuration
#[derive(Debug, Clone, Serialize, Deserialize, Default, PartialEq)]
pub struct AppConfig {
    /// Datastore configuration
    #[serde(default)]
    pub datastore: DatastoreConfig,

    /// Streaming bandwidth budget
    #[serde(default)]
    pub throttling: ThrottlingConfig,

    /// Device request timing
    #[serde(default)]
    pub device: DeviceConfig,

    /// Client API configuration
    #[serde(default)]
    pub api: ApiConfig,

    /// Logging output
    #[serde(default)]
    pub logging: LoggingConfig,
}

impl AppConfig {
    /// Create a new default configuration
    pub fn new() -> Self {
        Self::default()
    }

    /// Load a configuration file from disk
    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let content = std::fs::read_to_string(path).map_err(|e| {
            TelewatchError::Config(format!("Failed to read config file {:?}: {}", path, e))
        })?;

        let config: AppConfig = serde_json::from_str(&content).map_err(|e| {
            TelewatchError::Config(format!("Failed to parse config file {:?}: {}", path, e))
        })?;
        config.validate()?;
        Ok(config)
    }

    /// Load from `path` (or the default location), returning defaults on any error
    pub fn load_or_default(path: Option<&Path>) -> Self {
        let path = match path.map(Path::to_path_buf).or_else(default_config_path) {
            Some(p) => p,
            None => return Self::default(),
        };

        if !path.exists() {
            tracing::debug!("No config at {:?}, using defaults", path);
            return Self::default();
        }

        Self::load(&path).unwrap_or_else(|e| {
            tracing::warn!("Failed to load config, using defaults: {}", e);
            Self::default()
        })
    }

    /// Save configuration to disk as JSON
    pub fn save(&self, path: impl AsRef<Path>) -> Result<()> {
        let path = path.as_ref();

        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent).map_err(|e| {
                TelewatchError::Config(format!("Failed to create config directory: {}", e))
            })?;
        }

        let content = serde_json::to_string_pretty(self)
            .map_err(|e| TelewatchError::Config(format!("Failed to serialize config: {}", e)))?;

        std::fs::write(path, content).map_err(|e| {
            TelewatchError::Config(format!("Failed to write config file {:?}: {}", path, e))
        })
    }

    /// Reject settings the core cannot run with
    pub fn validate(&self) -> Result<()> {
        if self.datastore.max_entries == 0 {
            return Err(TelewatchError::Config(
                "datastore.max_entries must be greater than 0".to_string(),
            ));
        }
        if self.throttling.estimation_window_ms == 0 {
            return Err(TelewatchError::Config(
                "throttling.estimation_window_ms must be greater than 0".to_string(),
            ));
        }
        if self.device.response_timeout_ms == 0 {
            return Err(TelewatchError::Config(
                "device.response_timeout_ms must be greater than 0".to_string(),
            ));
        }
        if self.api.max_watchables_per_response == 0 {
            return Err(TelewatchError::Config(
                "api.max_watchables_per_response must be greater than 0".to_string(),
            ));
        }
        Ok(())
    }
}

// ==================== Datastore Config ====================

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct DatastoreConfig {
    /// Maximum number of entries the datastore accepts
    pub max_entries: usize,
}

impl Default for DatastoreConfig {
    fn default() -> Self {
        Self {
            max_entries: DEFAULT_MAX_ENTRIES,
        }
    }
}

// ==================== Throttling Config ====================

/// Bandwidth budget for value streaming
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ThrottlingConfig {
    /// Whether the throttler is enabled at startup
    pub enabled: bool,

    /// Budget in bits per second
    pub mean_bitrate: f64,

    /// Minimum time between two estimator updates
    pub estimation_window_ms: u64,

    /// Time constant of the fast moving average (clamped to >= 50 ms)
    pub fast_tau_ms: u64,

    /// Time constant of the slow moving average (clamped to >= 1 s)
    pub slow_tau_ms: u64,
}

impl Default for ThrottlingConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            mean_bitrate: DEFAULT_MEAN_BITRATE,
            estimation_window_ms: 100,
            fast_tau_ms: 50,
            slow_tau_ms: 1000,
        }
    }
}

impl ThrottlingConfig {
    pub fn estimation_window(&self) -> Duration {
        Duration::from_millis(self.estimation_window_ms)
    }

    pub fn fast_tau(&self) -> Duration {
        Duration::from_millis(self.fast_tau_ms)
    }

    pub fn slow_tau(&self) -> Duration {
        Duration::from_millis(self.slow_tau_ms)
    }
}

// ==================== Device Config ====================

/// Timing of the device-I/O actor
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct DeviceConfig {
    /// Time to wait for a reply before failing the request
    pub response_timeout_ms: u64,

    /// Interval between two polls of the watched variables
    pub poll_interval_ms: u64,

    /// Maximum number of requests waiting in the dispatcher
    pub max_pending_requests: usize,
}

impl Default for DeviceConfig {
    fn default() -> Self {
        Self {
            response_timeout_ms: DEFAULT_RESPONSE_TIMEOUT_MS,
            poll_interval_ms: 20,
            max_pending_requests: 256,
        }
    }
}

impl DeviceConfig {
    pub fn response_timeout(&self) -> Duration {
        Duration::from_millis(self.response_timeout_ms)
    }

    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.poll_interval_ms)
    }
}

// ==================== API Config ====================

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ApiConfig {
    /// Largest number of watchables listed in one `get_watchable_list` response
    pub max_watchables_per_response: usize,

    /// Bits assumed per streamed entry when asking the throttler for admission
    pub entry_size_bits_estimate: u64,
}

impl Default for ApiConfig {
    fn default() -> Self {
        Self {
            max_watchables_per_response: 1000,
            entry_size_bits_estimate: 256,
        }
    }
}

// ==================== Logging Config ====================

/// Logging output configuration
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct LoggingConfig {
    /// Filter directive used when `RUST_LOG` is not set
    pub filter: String,

    /// Optional log file; stdout only when absent
    #[serde(default)]
    pub file: Option<PathBuf>,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            filter: "info,telewatch_rs=debug".to_string(),
            file: None,
        }
    }
}

// ==================== Tests ====================
