//! # Client Configuration
//!
//! Configuration management for the sync client.
//!
//! ## Configuration Sources
//! ```text
//! ┌─────────────────────────────────────────────────────────────────────────┐
//! │                    Configuration Priority                               │
//! │                                                                         │
//! │  1. Environment Variables (highest priority)                           │
//! │     TAGSYNC_ENDPOINT=wss://db.example.com/                             │
//! │     TAGSYNC_PROJECT_BUCKET=proj1                                       │
//! │                                                                         │
//! │  2. TOML Config File                                                   │
//! │     ~/.config/tagsync/client.toml (Linux)                              │
//! │     ~/Library/Application Support/dev.tagsync.tagsync/client.toml      │
//! │                                                                         │
//! │  3. Default Values (lowest priority)                                   │
//! │     shared store endpoint, empty buckets, no credential                │
//! └─────────────────────────────────────────────────────────────────────────┘
//! ```
//!
//! ## Configuration File Format
//! ```toml
//! # client.toml
//! [namespace]
//! endpoint = "ws://127.0.0.1:8765/"
//! developer_bucket = "alice/"
//! project_bucket = "proj1"
//! credential = ""
//!
//! [transport]
//! connect_timeout_secs = 10
//! initial_backoff_ms = 500
//! max_backoff_secs = 60
//! max_retries = 0
//! ping_interval_secs = 30
//! ```
//!
//! Endpoints are not validated here. A malformed endpoint fails at the
//! store boundary and is reported through the error event.

use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::time::Duration;
use tagsync_core::{Namespace, DEFAULT_ENDPOINT};
use tracing::{debug, info, warn};

use crate::error::{SyncError, SyncResult};
use crate::store::ws::TransportConfig;

// =============================================================================
// Namespace Settings
// =============================================================================

/// Initial namespace and credential of a client.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NamespaceSettings {
    /// Base URL of the remote store.
    #[serde(default = "default_endpoint")]
    pub endpoint: String,

    /// Per-developer bucket, used on the shared store.
    #[serde(default)]
    pub developer_bucket: String,

    /// Per-project bucket.
    #[serde(default)]
    pub project_bucket: String,

    /// Authentication token. Empty means "issue one if possible".
    #[serde(default)]
    pub credential: String,
}

fn default_endpoint() -> String {
    DEFAULT_ENDPOINT.to_string()
}

impl Default for NamespaceSettings {
    fn default() -> Self {
        NamespaceSettings {
            endpoint: default_endpoint(),
            developer_bucket: String::new(),
            project_bucket: String::new(),
            credential: String::new(),
        }
    }
}

impl NamespaceSettings {
    /// The namespace segments, without the credential.
    pub fn namespace(&self) -> Namespace {
        Namespace::new(
            self.endpoint.clone(),
            self.developer_bucket.clone(),
            self.project_bucket.clone(),
        )
    }
}

// =============================================================================
// Transport Settings
// =============================================================================

/// WebSocket backend tuning.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TransportSettings {
    /// Connection timeout in seconds.
    #[serde(default = "default_connect_timeout")]
    pub connect_timeout_secs: u64,

    /// First reconnect delay in milliseconds.
    #[serde(default = "default_initial_backoff")]
    pub initial_backoff_ms: u64,

    /// Reconnect delay ceiling in seconds.
    #[serde(default = "default_max_backoff")]
    pub max_backoff_secs: u64,

    /// Maximum reconnection attempts (0 = infinite).
    #[serde(default)]
    pub max_retries: u32,

    /// Keepalive ping interval in seconds.
    #[serde(default = "default_ping_interval")]
    pub ping_interval_secs: u64,
}

fn default_connect_timeout() -> u64 {
    10
}
fn default_initial_backoff() -> u64 {
    500
}
fn default_max_backoff() -> u64 {
    60
}
fn default_ping_interval() -> u64 {
    30
}

impl Default for TransportSettings {
    fn default() -> Self {
        TransportSettings {
            connect_timeout_secs: default_connect_timeout(),
            initial_backoff_ms: default_initial_backoff(),
            max_backoff_secs: default_max_backoff(),
            max_retries: 0,
            ping_interval_secs: default_ping_interval(),
        }
    }
}

impl TransportSettings {
    /// Converts to the runtime transport configuration.
    pub fn transport_config(&self) -> TransportConfig {
        TransportConfig {
            connect_timeout: Duration::from_secs(self.connect_timeout_secs),
            initial_backoff: Duration::from_millis(self.initial_backoff_ms),
            max_backoff: Duration::from_secs(self.max_backoff_secs),
            max_retries: self.max_retries,
            ping_interval: Duration::from_secs(self.ping_interval_secs),
        }
    }
}

// =============================================================================
// Client Configuration
// =============================================================================

/// Complete client configuration.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ClientConfig {
    /// Namespace the client starts on.
    #[serde(default)]
    pub namespace: NamespaceSettings,

    /// WebSocket backend settings.
    #[serde(default)]
    pub transport: TransportSettings,
}

impl ClientConfig {
    /// Creates a config with defaults.
    pub fn new() -> Self {
        Self::default()
    }

    /// Loads configuration from file, environment, and defaults.
    ///
    /// ## Load Order (later overrides earlier)
    /// 1. Default values
    /// 2. Config file (client.toml)
    /// 3. Environment variables
    pub fn load(config_path: Option<PathBuf>) -> SyncResult<Self> {
        let mut config = Self::default();

        if let Some(path) = config_path.or_else(Self::default_config_path) {
            if path.exists() {
                info!(?path, "Loading client config from file");
                let contents = std::fs::read_to_string(&path)?;
                config = toml::from_str(&contents)?;
            } else {
                debug!(?path, "Config file not found, using defaults");
            }
        }

        config.apply_overrides(|key| std::env::var(key).ok());
        config.validate()?;

        Ok(config)
    }

    /// Loads config or returns default if load fails.
    pub fn load_or_default(config_path: Option<PathBuf>) -> Self {
        Self::load(config_path).unwrap_or_else(|e| {
            warn!("Failed to load client config: {}. Using defaults.", e);
            Self::default()
        })
    }

    /// Saves configuration to file.
    pub fn save(&self, config_path: Option<PathBuf>) -> SyncResult<()> {
        let path = config_path
            .or_else(Self::default_config_path)
            .ok_or_else(|| SyncError::ConfigSaveFailed("No config path available".into()))?;

        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)
                .map_err(|e| SyncError::ConfigSaveFailed(e.to_string()))?;
        }

        let contents = toml::to_string_pretty(self)?;
        std::fs::write(&path, contents).map_err(|e| SyncError::ConfigSaveFailed(e.to_string()))?;

        info!(?path, "Client config saved");
        Ok(())
    }

    /// Validates the transport numbers.
    pub fn validate(&self) -> SyncResult<()> {
        let t = &self.transport;
        if t.connect_timeout_secs == 0 {
            return Err(SyncError::InvalidConfig(
                "connect_timeout_secs must be greater than 0".into(),
            ));
        }
        if t.ping_interval_secs == 0 {
            return Err(SyncError::InvalidConfig(
                "ping_interval_secs must be greater than 0".into(),
            ));
        }
        if t.initial_backoff_ms == 0 || t.initial_backoff_ms > t.max_backoff_secs * 1000 {
            return Err(SyncError::InvalidConfig(format!(
                "initial_backoff_ms must be in 1..={}",
                t.max_backoff_secs * 1000
            )));
        }
        Ok(())
    }

    /// Applies overrides from a variable lookup (the process environment in
    /// [`ClientConfig::load`]).
    fn apply_overrides(&mut self, var: impl Fn(&str) -> Option<String>) {
        if let Some(endpoint) = var("TAGSYNC_ENDPOINT") {
            debug!(endpoint = %endpoint, "Overriding endpoint from environment");
            self.namespace.endpoint = endpoint;
        }

        if let Some(bucket) = var("TAGSYNC_DEVELOPER_BUCKET") {
            self.namespace.developer_bucket = bucket;
        }

        if let Some(bucket) = var("TAGSYNC_PROJECT_BUCKET") {
            self.namespace.project_bucket = bucket;
        }

        if let Some(token) = var("TAGSYNC_CREDENTIAL") {
            debug!("Overriding credential from environment");
            self.namespace.credential = token;
        }

        if let Some(secs) = var("TAGSYNC_CONNECT_TIMEOUT_SECS") {
            match secs.parse::<u64>() {
                Ok(s) => self.transport.connect_timeout_secs = s,
                Err(_) => warn!(value = %secs, "Ignoring non-numeric TAGSYNC_CONNECT_TIMEOUT_SECS"),
            }
        }
    }

    /// Returns the default config file path.
    fn default_config_path() -> Option<PathBuf> {
        directories::ProjectDirs::from("dev", "tagsync", "tagsync")
            .map(|dirs| dirs.config_dir().join("client.toml"))
    }
}
