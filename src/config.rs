//! Configuration System
//!
//! Handles loading configuration from files and environment variables.
//! Supports TOML config files and environment variable overrides.
//!
//! Load order: defaults, then an optional TOML file, then environment
//! variables (a `.env` file is read first if present).

use serde::Deserialize;
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::bus::FailurePolicy;
use crate::relay::{
    HubConfig, CONNECTION_COUNT_KEY, CONNECTION_COUNT_UPDATE_CHANNEL, NEW_MESSAGE_CHANNEL,
};

/// Environment variable naming a config file
pub const CONFIG_PATH_ENV: &str = "CHAT_RELAY_CONFIG";

/// Config file picked up from the working directory when present
pub const DEFAULT_CONFIG_FILE: &str = "chat-relay.toml";

/// Main configuration structure
#[derive(Debug, Clone, Default, Deserialize)]
pub struct Config {
    #[serde(default)]
    pub server: ServerConfig,

    #[serde(default)]
    pub bus: BusConfig,

    #[serde(default)]
    pub relay: RelayConfig,

    #[serde(default)]
    pub logging: LoggingConfig,
}

/// HTTP/WebSocket listener configuration
#[derive(Debug, Clone, Deserialize)]
pub struct ServerConfig {
    #[serde(default = "default_host")]
    pub host: String,

    #[serde(default = "default_port")]
    pub port: u16,
}

fn default_host() -> String {
    "0.0.0.0".to_string()
}

fn default_port() -> u16 {
    8080
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            host: default_host(),
            port: default_port(),
        }
    }
}

impl ServerConfig {
    /// Get the socket address string
    pub fn addr(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }
}

/// Shared bus configuration
#[derive(Debug, Clone, Deserialize)]
pub struct BusConfig {
    /// Redis URI or `memory://`. Required.
    #[serde(default)]
    pub uri: Option<String>,

    /// Attempts per bus call; 1 means log-only
    #[serde(default = "default_retry_attempts")]
    pub retry_attempts: u32,

    #[serde(default = "default_retry_base_delay")]
    pub retry_base_delay_ms: u64,

    #[serde(default = "default_retry_max_delay")]
    pub retry_max_delay_ms: u64,
}

fn default_retry_attempts() -> u32 {
    1
}

fn default_retry_base_delay() -> u64 {
    100
}

fn default_retry_max_delay() -> u64 {
    2000
}

impl Default for BusConfig {
    fn default() -> Self {
        Self {
            uri: None,
            retry_attempts: default_retry_attempts(),
            retry_base_delay_ms: default_retry_base_delay(),
            retry_max_delay_ms: default_retry_max_delay(),
        }
    }
}

impl BusConfig {
    /// Failure policy for bus calls
    pub fn policy(&self) -> FailurePolicy {
        FailurePolicy::from_attempts(
            self.retry_attempts,
            Duration::from_millis(self.retry_base_delay_ms),
            Duration::from_millis(self.retry_max_delay_ms),
        )
    }
}

/// Relay channel names and fan-out tuning
#[derive(Debug, Clone, Deserialize)]
pub struct RelayConfig {
    #[serde(default = "default_message_channel")]
    pub message_channel: String,

    #[serde(default = "default_count_key")]
    pub count_key: String,

    #[serde(default = "default_count_channel")]
    pub count_channel: String,

    #[serde(default = "default_fanout_capacity")]
    pub fanout_capacity: usize,

    #[serde(default = "default_max_connections")]
    pub max_connections: usize,

    #[serde(default)]
    pub forward_count_updates: bool,
}

fn default_message_channel() -> String {
    NEW_MESSAGE_CHANNEL.to_string()
}

fn default_count_key() -> String {
    CONNECTION_COUNT_KEY.to_string()
}

fn default_count_channel() -> String {
    CONNECTION_COUNT_UPDATE_CHANNEL.to_string()
}

fn default_fanout_capacity() -> usize {
    1024
}

fn default_max_connections() -> usize {
    10_000
}

impl Default for RelayConfig {
    fn default() -> Self {
        Self {
            message_channel: default_message_channel(),
            count_key: default_count_key(),
            count_channel: default_count_channel(),
            fanout_capacity: default_fanout_capacity(),
            max_connections: default_max_connections(),
            forward_count_updates: false,
        }
    }
}

/// Logging configuration
#[derive(Debug, Clone, Deserialize)]
pub struct LoggingConfig {
    #[serde(default = "default_log_level")]
    pub level: String,

    #[serde(default = "default_log_format")]
    pub format: String,
}

fn default_log_level() -> String {
    "info".to_string()
}

fn default_log_format() -> String {
    "pretty".to_string()
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
            format: default_log_format(),
        }
    }
}

impl LoggingConfig {
    pub fn is_json(&self) -> bool {
        self.format.eq_ignore_ascii_case("json")
    }
}

impl Config {
    /// Load configuration from a file
    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        let content = std::fs::read_to_string(path).map_err(|e| ConfigError::Io {
            path: path.to_path_buf(),
            error: e.to_string(),
        })?;

        Self::parse(&content).map_err(|e| ConfigError::Parse {
            path: path.to_path_buf(),
            error: e.to_string(),
        })
    }

    /// Parse configuration from TOML text
    pub fn parse(content: &str) -> Result<Self, toml::de::Error> {
        toml::from_str(content)
    }

    /// Load configuration from environment variables only
    pub fn from_env() -> Result<Self, ConfigError> {
        let mut config = Config::default();
        config.apply_env_overrides()?;
        Ok(config)
    }

    /// Load configuration with environment variable overrides
    pub fn load_with_env(path: &Path) -> Result<Self, ConfigError> {
        let mut config = Self::load(path)?;
        config.apply_env_overrides()?;
        Ok(config)
    }

    /// Resolve and load configuration for the server binary.
    ///
    /// An explicit path must exist. Otherwise `CHAT_RELAY_CONFIG` and then
    /// `./chat-relay.toml` are tried, falling back to environment only.
    pub fn resolve(explicit: Option<&Path>) -> Result<Self, ConfigError> {
        // .env is optional; real environment variables take precedence
        let _ = dotenvy::dotenv();

        if let Some(path) = explicit {
            return Self::load_with_env(path);
        }

        let candidates = [
            std::env::var(CONFIG_PATH_ENV).ok().map(PathBuf::from),
            Some(PathBuf::from(DEFAULT_CONFIG_FILE)),
        ];

        for path in candidates.iter().flatten() {
            if path.exists() {
                return Self::load_with_env(path);
            }
        }

        Self::from_env()
    }

    /// Apply environment variable overrides to an existing config
    pub fn apply_env_overrides(&mut self) -> Result<(), ConfigError> {
        self.apply_overrides(|name| std::env::var(name).ok())
    }

    fn apply_overrides(
        &mut self,
        var: impl Fn(&str) -> Option<String>,
    ) -> Result<(), ConfigError> {
        // Bus overrides
        if let Some(uri) = var("REDIS_URI") {
            self.bus.uri = Some(uri);
        }

        // Server overrides
        if let Some(host) = var("CHAT_RELAY_HOST") {
            self.server.host = host;
        }
        if let Some(port) = var("PORT") {
            self.server.port = port.trim().parse().map_err(|_| {
                ConfigError::Invalid(format!("PORT must be a port number, got {:?}", port))
            })?;
        }

        // Logging overrides
        if let Some(level) = var("CHAT_RELAY_LOG_LEVEL") {
            self.logging.level = level;
        }
        if let Some(format) = var("CHAT_RELAY_LOG_FORMAT") {
            self.logging.format = format;
        }

        Ok(())
    }

    /// Check that the configuration can start a server
    pub fn validate(&self) -> Result<(), ConfigError> {
        match self.bus.uri.as_deref().map(str::trim) {
            None | Some("") => return Err(ConfigError::MissingBusUri),
            Some(_) => {}
        }
        if self.relay.fanout_capacity == 0 {
            return Err(ConfigError::Invalid(
                "relay.fanout_capacity must be greater than zero".to_string(),
            ));
        }
        if self.relay.max_connections == 0 {
            return Err(ConfigError::Invalid(
                "relay.max_connections must be greater than zero".to_string(),
            ));
        }
        Ok(())
    }

    /// Hub configuration; the listen port is the origin tag
    pub fn hub_config(&self) -> HubConfig {
        HubConfig {
            message_channel: self.relay.message_channel.clone(),
            count_key: self.relay.count_key.clone(),
            count_channel: self.relay.count_channel.clone(),
            origin: self.server.port.to_string(),
            fanout_capacity: self.relay.fanout_capacity,
            max_connections: self.relay.max_connections,
            forward_count_updates: self.relay.forward_count_updates,
            policy: self.bus.policy(),
        }
    }
}

/// Configuration errors
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("Failed to read config file {path:?}: {error}")]
    Io { path: PathBuf, error: String },

    #[error("Failed to parse config file {path:?}: {error}")]
    Parse { path: PathBuf, error: String },

    #[error("Bus URI cannot be empty (set REDIS_URI or bus.uri)")]
    MissingBusUri,

    #[error("Invalid configuration: {0}")]
    Invalid(String),
}

/// Generate a default config file content
pub fn generate_default_config() -> String {
    r#"# Chat Relay Configuration
#
# Environment variables override these settings:
# - REDIS_URI
# - PORT
# - CHAT_RELAY_HOST
# - CHAT_RELAY_LOG_LEVEL
# - CHAT_RELAY_LOG_FORMAT

[server]
# Listen host
host = "0.0.0.0"

# Listen port, also stamped on every delivered message
port = 8080

[bus]
# Redis address ("host:port" or "redis://...") or "memory://" for a single instance
uri = "localhost:6379"

# Attempts per bus call (1 = log failures, no retry)
retry_attempts = 1

# Backoff between retries (ms)
retry_base_delay_ms = 100
retry_max_delay_ms = 2000

[relay]
message_channel = "chat:new-message"
count_key = "chat:connection-count"
count_channel = "chat:connection-count-updated"

# Messages buffered per client before it starts dropping
fanout_capacity = 1024

# Concurrent clients on this instance
max_connections = 10000

# Also deliver connection count updates to clients
forward_count_updates = false

[logging]
# Log level: trace, debug, info, warn, error
level = "info"

# Log format: pretty (for development) or json (for production)
format = "pretty"
"#
    .to_string()
}
