//! pushrelay configuration file handling
//!
//! Loads and manages ~/.config/pushrelay/config.yaml.

use crate::Result;
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Reaper timeout value that disables reaping
pub const REAPER_DISABLED: i64 = -1;

/// Default idle timeout before an agent is reaped (7 days)
pub const DEFAULT_REAPER_TIMEOUT_MS: i64 = 604_800_000;

/// Default interval between resends of unacknowledged updates (60 seconds)
pub const DEFAULT_ACK_INTERVAL_MS: u64 = 60_000;

/// Secret shipped in the default config; validation warns about it
pub const DEFAULT_PASSWORD: &str = "changeme!!!";

/// Backend for the persistence port
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum DataStoreConfig {
    /// Process-local, lost on restart
    InMemory,
    /// SQLite database file
    Sqlite { path: PathBuf },
}

impl Default for DataStoreConfig {
    fn default() -> Self {
        DataStoreConfig::InMemory
    }
}

/// Server configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RelayConfig {
    /// Interface to bind
    #[serde(default = "default_host")]
    pub host: String,

    #[serde(default = "default_port")]
    pub port: u16,

    /// Server secret used to derive endpoint tokens
    #[serde(default = "default_password")]
    pub password: String,

    /// Public base URL that application servers use to reach this server
    #[serde(default = "default_endpoint_url")]
    pub endpoint_url: String,

    /// Path prefix of the notification endpoint
    #[serde(default = "default_endpoint_prefix")]
    pub endpoint_prefix: String,

    /// Path prefix of the user agent transports
    #[serde(default = "default_sockjs_prefix")]
    pub sockjs_prefix: String,

    /// Idle time in milliseconds before an agent is reaped; -1 disables
    #[serde(default = "default_reaper_timeout")]
    pub useragent_reaper_timeout: i64,

    /// Milliseconds between resends of unacknowledged updates
    #[serde(default = "default_ack_interval")]
    pub ack_interval: u64,

    /// Largest accepted request body in bytes
    #[serde(default = "default_max_body_size")]
    pub max_body_size: usize,

    #[serde(default)]
    pub datastore: DataStoreConfig,
}

fn default_host() -> String {
    "127.0.0.1".to_string()
}

fn default_port() -> u16 {
    7777
}

fn default_password() -> String {
    DEFAULT_PASSWORD.to_string()
}

fn default_endpoint_url() -> String {
    "http://127.0.0.1:7777".to_string()
}

fn default_endpoint_prefix() -> String {
    "/update".to_string()
}

fn default_sockjs_prefix() -> String {
    "/simplepush".to_string()
}

fn default_reaper_timeout() -> i64 {
    DEFAULT_REAPER_TIMEOUT_MS
}

fn default_ack_interval() -> u64 {
    DEFAULT_ACK_INTERVAL_MS
}

fn default_max_body_size() -> usize {
    64 * 1024
}

impl Default for RelayConfig {
    fn default() -> Self {
        Self::new()
    }
}

impl RelayConfig {
    pub fn new() -> Self {
        Self {
            host: default_host(),
            port: default_port(),
            password: default_password(),
            endpoint_url: default_endpoint_url(),
            endpoint_prefix: default_endpoint_prefix(),
            sockjs_prefix: default_sockjs_prefix(),
            useragent_reaper_timeout: default_reaper_timeout(),
            ack_interval: default_ack_interval(),
            max_body_size: default_max_body_size(),
            datastore: DataStoreConfig::default(),
        }
    }

    pub fn with_host(mut self, host: impl Into<String>) -> Self {
        self.host = host.into();
        self
    }

    pub fn with_port(mut self, port: u16) -> Self {
        self.port = port;
        self
    }

    pub fn with_password(mut self, password: impl Into<String>) -> Self {
        self.password = password.into();
        self
    }

    pub fn with_endpoint_url(mut self, url: impl Into<String>) -> Self {
        self.endpoint_url = url.into();
        self
    }

    /// Set the reaper timeout in milliseconds (-1 disables)
    pub fn with_reaper_timeout(mut self, millis: i64) -> Self {
        self.useragent_reaper_timeout = millis;
        self
    }

    /// Set the ack interval in milliseconds
    pub fn with_ack_interval(mut self, millis: u64) -> Self {
        self.ack_interval = millis;
        self
    }

    pub fn with_datastore(mut self, datastore: DataStoreConfig) -> Self {
        self.datastore = datastore;
        self
    }

    /// Reaper timeout, or `None` when reaping is disabled
    pub fn reaper_timeout(&self) -> Option<Duration> {
        if self.useragent_reaper_timeout <= 0 {
            return None;
        }
        Some(Duration::from_millis(self.useragent_reaper_timeout as u64))
    }

    pub fn ack_interval(&self) -> Duration {
        Duration::from_millis(self.ack_interval)
    }

    /// Full URL prefix of push endpoints handed to agents
    pub fn notification_url(&self) -> String {
        format!(
            "{}{}",
            self.endpoint_url.trim_end_matches('/'),
            self.endpoint_prefix
        )
    }

    /// Address to bind, `host:port`
    pub fn bind_addr(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }

    /// Load configuration from the default path
    pub fn load_default() -> Result<Self> {
        Self::load(Self::default_path())
    }

    /// Load configuration from a specific path
    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();

        if !path.exists() {
            return Err(crate::RelayError::Config(format!(
                "Config file not found: {}",
                path.display()
            )));
        }

        tracing::info!(path = %path.display(), "Loading pushrelay configuration");

        let content = fs::read_to_string(path)?;
        let config: Self = serde_yaml::from_str(&content)?;

        tracing::debug!(
            port = config.port,
            reaper_timeout_ms = config.useragent_reaper_timeout,
            ack_interval_ms = config.ack_interval,
            "Configuration loaded successfully"
        );

        Ok(config)
    }

    /// Save configuration to a specific path
    pub fn save(&self, path: impl AsRef<Path>) -> Result<()> {
        let path = path.as_ref();

        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)?;
        }

        tracing::info!(path = %path.display(), "Saving pushrelay configuration");

        let yaml = serde_yaml::to_string(self)?;
        fs::write(path, yaml)?;

        Ok(())
    }

    /// Get the default config path (~/.config/pushrelay/config.yaml)
    pub fn default_path() -> PathBuf {
        let mut path = dirs::home_dir().unwrap_or_else(|| PathBuf::from("."));
        path.push(".config");
        path.push("pushrelay");
        path.push("config.yaml");
        path
    }
}
