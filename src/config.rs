//! Configuration for resilient-session

use serde::{Deserialize, Serialize};
use std::path::Path;

use crate::backoff::BackoffConfig;
use crate::connection::TransportConfig;
use crate::error::{Result, SessionError};

/// Configuration
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SessionConfig {
    /// WebSocket endpoint. `client_id` is appended per connection.
    #[serde(default = "default_url")]
    pub url: String,

    /// Reconnect backoff for the raw socket
    #[serde(default = "BackoffConfig::transport")]
    pub transport_backoff: BackoffConfig,

    /// Backoff between authenticated connections
    #[serde(default = "BackoffConfig::session")]
    pub session_backoff: BackoffConfig,
}

fn default_url() -> String {
    "ws://localhost:8080".to_string()
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            url: default_url(),
            transport_backoff: BackoffConfig::transport(),
            session_backoff: BackoffConfig::session(),
        }
    }
}

impl SessionConfig {
    /// Defaults, pointed at `url`.
    pub fn new(url: impl Into<String>) -> Self {
        Self {
            url: url.into(),
            ..Self::default()
        }
    }

    /// Load config from a TOML file
    pub fn load<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref();
        let content = std::fs::read_to_string(path)
            .map_err(|e| SessionError::Config(format!("{}: {}", path.display(), e)))?;
        Self::from_toml_str(&content)
    }

    /// Save config as TOML
    pub fn save<P: AsRef<Path>>(&self, path: P) -> Result<()> {
        let path = path.as_ref();
        let content =
            toml::to_string_pretty(self).map_err(|e| SessionError::Config(e.to_string()))?;
        std::fs::write(path, content)
            .map_err(|e| SessionError::Config(format!("{}: {}", path.display(), e)))
    }

    pub fn from_toml_str(content: &str) -> Result<Self> {
        let config: Self =
            toml::from_str(content).map_err(|e| SessionError::Config(e.to_string()))?;
        config.validate()?;
        Ok(config)
    }

    /// Check that the URL parses.
    pub fn validate(&self) -> Result<()> {
        url::Url::parse(&self.url)?;
        Ok(())
    }

    /// Settings for each connection's transport session.
    pub fn transport_config(&self) -> TransportConfig {
        TransportConfig {
            backoff: self.transport_backoff.clone(),
        }
    }
}
