//! Channel configuration.

use std::path::Path;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use thiserror::Error;
use wsg_transport::{AllowFromPolicy, PolicyError, TransportConfig};

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to read config file: {0}")]
    Io(#[from] std::io::Error),

    #[error("failed to parse config file: {0}")]
    Json(#[from] serde_json::Error),

    #[error(transparent)]
    AllowFrom(#[from] PolicyError),
}

/// Settings for the WebSocket channel, as found in a JSON config file.
///
/// Every field has a default, so `{}` is a valid config.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct ChannelConfig {
    pub enabled: bool,
    pub host: String,
    pub port: u16,
    /// Remote IPs allowed to connect. Empty admits everyone.
    pub allow_from: Vec<String>,
    /// Seconds between transport pings; 0 disables them.
    pub ping_interval_secs: u64,
    pub ping_timeout_secs: u64,
    pub close_timeout_secs: u64,
    pub max_connections: Option<usize>,
    /// Seconds to let dispatched messages finish on stop.
    pub drain_timeout_secs: u64,
}

impl Default for ChannelConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            host: default_host(),
            port: DEFAULT_PORT,
            allow_from: Vec::new(),
            ping_interval_secs: 20,
            ping_timeout_secs: 120,
            close_timeout_secs: 10,
            max_connections: None,
            drain_timeout_secs: 5,
        }
    }
}

pub const DEFAULT_PORT: u16 = 8765;

fn default_host() -> String {
    "127.0.0.1".to_string()
}

impl ChannelConfig {
    pub fn from_json_file(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let contents = std::fs::read_to_string(path.as_ref())?;
        Ok(serde_json::from_str(&contents)?)
    }

    pub fn allow_from_policy(&self) -> Result<AllowFromPolicy, ConfigError> {
        Ok(AllowFromPolicy::parse(&self.allow_from)?)
    }

    pub fn drain_timeout(&self) -> Duration {
        Duration::from_secs(self.drain_timeout_secs)
    }

    pub fn transport_config(&self) -> Result<TransportConfig, ConfigError> {
        let ping_interval =
            (self.ping_interval_secs > 0).then(|| Duration::from_secs(self.ping_interval_secs));
        Ok(TransportConfig {
            hostname: self.host.clone(),
            port: self.port,
            allow_from: self.allow_from_policy()?,
            ping_interval,
            ping_timeout: Duration::from_secs(self.ping_timeout_secs),
            close_timeout: Duration::from_secs(self.close_timeout_secs),
            max_connections: self.max_connections,
            ..TransportConfig::default()
        })
    }
}
