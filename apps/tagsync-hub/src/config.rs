//! Hub configuration.
//!
//! Configuration is loaded from environment variables with fallback to defaults.

use std::env;

/// Default WebSocket port, matching the client's shared endpoint.
pub const DEFAULT_HUB_PORT: u16 = 8765;

/// Hub configuration.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HubConfig {
    /// Port to listen on (0 picks a free one).
    pub port: u16,

    /// Address to bind to.
    pub bind_addr: String,

    /// Secret that namespace credentials are signed with. When unset the
    /// shared subtree is unprotected and any non-empty token is accepted.
    pub jwt_secret: Option<String>,
}

impl Default for HubConfig {
    fn default() -> Self {
        HubConfig {
            port: DEFAULT_HUB_PORT,
            bind_addr: "127.0.0.1".to_string(),
            jwt_secret: None,
        }
    }
}

impl HubConfig {
    /// Load configuration from environment variables.
    pub fn load() -> Result<Self, ConfigError> {
        Self::from_lookup(|key| env::var(key).ok())
    }

    fn from_lookup(var: impl Fn(&str) -> Option<String>) -> Result<Self, ConfigError> {
        let mut config = HubConfig::default();

        if let Some(port) = var("TAGSYNC_HUB_PORT") {
            config.port = port
                .parse()
                .map_err(|_| ConfigError::InvalidValue("TAGSYNC_HUB_PORT".to_string()))?;
        }
        if let Some(addr) = var("TAGSYNC_HUB_BIND") {
            config.bind_addr = addr;
        }
        config.jwt_secret = var("TAGSYNC_HUB_SECRET").filter(|s| !s.is_empty());

        Ok(config)
    }

    /// Returns the bind address string.
    pub fn bind_address(&self) -> String {
        format!("{}:{}", self.bind_addr, self.port)
    }
}

/// Configuration error types.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("Invalid value for {0}")]
    InvalidValue(String),
}
