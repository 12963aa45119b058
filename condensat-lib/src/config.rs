//! Configuration management with hierarchical overrides using figment.
//!
//! Sources, lowest precedence first:
//! 1. Embedded defaults
//! 2. System configuration file (/etc/condensat/config.toml)
//! 3. User configuration file (~/.config/condensat/config.toml)
//! 4. Explicit file passed on the command line
//! 5. Environment variables (`CONDENSAT_MONITOR_BUS__PORT`, `CONDENSAT_GRABBER_QUEUE__HOST`, ...)

use figment::{
    Figment,
    providers::{Env, Format, Serialized, Toml},
};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;
use thiserror::Error;

const SYSTEM_CONFIG_PATH: &str = "/etc/condensat/config.toml";
const DATA_DIR: &str = "/var/lib/condensat";

/// Configuration loading and validation errors.
#[derive(Debug, Error)]
#[non_exhaustive]
pub enum ConfigError {
    #[error("Configuration file not found: {path}")]
    FileNotFound { path: PathBuf },

    #[error("Invalid configuration format: {0}")]
    InvalidFormat(#[from] figment::Error),

    #[error("Configuration validation failed: {message}")]
    ValidationError { message: String },
}

/// Configuration shared by every Condensat component.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq, Default)]
pub struct Config {
    /// Message transport and RPC settings
    pub bus: BusConfig,
    /// Log queue settings
    pub queue: QueueConfig,
    /// Telemetry aggregation settings
    pub monitor: MonitorConfig,
    /// Durable storage settings
    pub database: DatabaseConfig,
    /// Logging configuration
    pub logging: LoggingConfig,
}

impl Config {
    /// Embedded defaults for one component
    pub fn for_component(component: &str) -> Self {
        Self {
            database: DatabaseConfig::for_component(component),
            ..Self::default()
        }
    }
}

/// Message transport configuration.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct BusConfig {
    /// Broker host
    pub host: String,
    /// Broker port
    pub port: u16,
    /// Default RPC timeout in milliseconds
    pub rpc_timeout_ms: u64,
    /// Handler slots per inbound subject
    pub worker_concurrency: usize,
    /// Per-subscription buffer size
    pub buffer_size: usize,
}

impl BusConfig {
    /// Default RPC timeout as a duration
    pub fn rpc_timeout(&self) -> Duration {
        Duration::from_millis(self.rpc_timeout_ms)
    }
}

impl Default for BusConfig {
    fn default() -> Self {
        Self {
            host: "127.0.0.1".to_owned(),
            port: 4222,
            rpc_timeout_ms: 5000,
            worker_concurrency: 4,
            buffer_size: 1024,
        }
    }
}

/// Redis log queue configuration.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct QueueConfig {
    /// Redis host
    pub host: String,
    /// Redis port
    pub port: u16,
    /// Redis password
    pub password: Option<String>,
    /// Redis logical database
    pub db: i64,
    /// List holding queued entries
    pub key: String,
    /// List holding entries reserved by the grabber
    pub processing_key: String,
    /// How long one blocking reserve waits, in milliseconds
    pub poll_interval_ms: u64,
    /// Failed delivery attempts after which an entry counts as parked
    pub max_attempts: u32,
    /// Base delay between delivery attempts, in milliseconds
    pub retry_backoff_ms: u64,
    /// Entries awaiting a retry before the grabber stops reserving
    pub max_pending: usize,
}

impl QueueConfig {
    /// Connection URL for the redis client
    pub fn redis_url(&self) -> String {
        match &self.password {
            Some(password) => format!(
                "redis://:{password}@{}:{}/{}",
                self.host, self.port, self.db
            ),
            None => format!("redis://{}:{}/{}", self.host, self.port, self.db),
        }
    }

    /// Blocking reserve wait as a duration
    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.poll_interval_ms)
    }

    /// Base retry delay as a duration
    pub fn retry_backoff(&self) -> Duration {
        Duration::from_millis(self.retry_backoff_ms)
    }
}

impl Default for QueueConfig {
    fn default() -> Self {
        Self {
            host: "127.0.0.1".to_owned(),
            port: 6379,
            password: None,
            db: 0,
            key: "condensat:logs".to_owned(),
            processing_key: "condensat:logs:processing".to_owned(),
            poll_interval_ms: 1000,
            max_attempts: 5,
            retry_backoff_ms: 100,
            max_pending: 1024,
        }
    }
}

/// Telemetry aggregation configuration.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct MonitorConfig {
    /// Default history bucket width in seconds
    pub step_secs: u64,
    /// Default timestamp rounding in seconds
    pub round_secs: u64,
    /// Samples older than this, relative to the newest sample, are evicted
    pub retention_secs: u64,
    /// Default look-back window of stack list queries in seconds
    pub since_secs: u64,
    /// Interval between process-info reports in seconds
    pub report_interval_secs: u64,
}

impl MonitorConfig {
    /// Default bucket width
    pub fn step(&self) -> Duration {
        Duration::from_secs(self.step_secs)
    }

    /// Default rounding
    pub fn round(&self) -> Duration {
        Duration::from_secs(self.round_secs)
    }

    /// Retention window
    pub fn retention(&self) -> Duration {
        Duration::from_secs(self.retention_secs)
    }

    /// Default look-back window
    pub fn since(&self) -> Duration {
        Duration::from_secs(self.since_secs)
    }

    /// Reporter cadence
    pub fn report_interval(&self) -> Duration {
        Duration::from_secs(self.report_interval_secs)
    }
}

impl Default for MonitorConfig {
    fn default() -> Self {
        Self {
            step_secs: 60,
            round_secs: 60,
            retention_secs: 86_400,
            since_secs: 300,
            report_interval_secs: 30,
        }
    }
}

/// Database configuration.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct DatabaseConfig {
    /// Database file path
    pub path: PathBuf,
}

impl DatabaseConfig {
    /// Default database file of one component; redb locks the file exclusively
    pub fn for_component(component: &str) -> Self {
        Self {
            path: PathBuf::from(DATA_DIR).join(format!("{component}.db")),
        }
    }
}

impl Default for DatabaseConfig {
    fn default() -> Self {
        Self::for_component("condensat")
    }
}

/// Logging configuration.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct LoggingConfig {
    /// Log level or filter directive (trace, debug, info, warn, error)
    pub level: String,
    /// Log format (json, human)
    pub format: String,
    /// Also push this component's own events into the log queue
    pub forward_to_queue: bool,
    /// Events buffered for the queue pusher before new ones are dropped
    pub forward_capacity: usize,
}

/// Default capacity of the forwarding channel
const FORWARD_CAPACITY: usize = 1024;

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: "info".to_owned(),
            format: "human".to_owned(),
            forward_to_queue: false,
            forward_capacity: FORWARD_CAPACITY,
        }
    }
}

/// Configuration loader with hierarchical override support.
pub struct ConfigLoader {
    component: String,
    file: Option<PathBuf>,
}

impl ConfigLoader {
    /// Create a new configuration loader for the specified component.
    pub fn new(component: &str) -> Self {
        Self {
            component: component.to_owned(),
            file: None,
        }
    }

    /// Merge an explicit configuration file above the system and user files.
    pub fn with_file(mut self, path: impl Into<PathBuf>) -> Self {
        self.file = Some(path.into());
        self
    }

    /// Environment variable prefix for this component.
    pub fn env_prefix(&self) -> String {
        format!("{}_", self.component.replace('-', "_").to_uppercase())
    }

    /// Load configuration with hierarchical overrides using figment.
    pub fn load(&self) -> Result<Config, ConfigError> {
        let mut figment = Figment::new().merge(Serialized::defaults(Config::for_component(&self.component)));

        if Path::new(SYSTEM_CONFIG_PATH).exists() {
            figment = figment.merge(Toml::file(SYSTEM_CONFIG_PATH));
        }

        if let Some(user_config_path) = Self::user_config_path()
            && user_config_path.exists()
        {
            figment = figment.merge(Toml::file(&user_config_path));
        }

        if let Some(path) = &self.file {
            if !path.exists() {
                return Err(ConfigError::FileNotFound { path: path.clone() });
            }
            figment = figment.merge(Toml::file(path));
        }

        figment = figment.merge(Env::prefixed(&self.env_prefix()).split("__"));

        let config = figment.extract()?;
        Self::validate_config(&config)?;
        Ok(config)
    }

    fn user_config_path() -> Option<PathBuf> {
        dirs::config_dir().map(|dir| dir.join("condensat").join("config.toml"))
    }

    /// Validate the final configuration.
    pub fn validate_config(config: &Config) -> Result<(), ConfigError> {
        let checks = [
            (config.bus.rpc_timeout_ms == 0, "bus.rpc_timeout_ms must be greater than 0"),
            (config.bus.worker_concurrency == 0, "bus.worker_concurrency must be greater than 0"),
            (config.bus.buffer_size == 0, "bus.buffer_size must be greater than 0"),
            (config.queue.key.is_empty(), "queue.key must not be empty"),
            (
                config.queue.key == config.queue.processing_key,
                "queue.processing_key must differ from queue.key",
            ),
            (config.queue.poll_interval_ms == 0, "queue.poll_interval_ms must be greater than 0"),
            (config.queue.max_attempts == 0, "queue.max_attempts must be greater than 0"),
            (config.queue.max_pending == 0, "queue.max_pending must be greater than 0"),
            (config.monitor.step_secs == 0, "monitor.step_secs must be greater than 0"),
            (config.monitor.round_secs == 0, "monitor.round_secs must be greater than 0"),
            (config.monitor.retention_secs == 0, "monitor.retention_secs must be greater than 0"),
            (
                config.monitor.report_interval_secs == 0,
                "monitor.report_interval_secs must be greater than 0",
            ),
            (
                !matches!(config.logging.format.as_str(), "json" | "human"),
                "logging.format must be 'json' or 'human'",
            ),
            (
                config.logging.forward_capacity == 0,
                "logging.forward_capacity must be greater than 0",
            ),
        ];

        match checks.iter().find(|(failed, _)| *failed) {
            Some((_, message)) => Err(ConfigError::ValidationError {
                message: (*message).to_owned(),
            }),
            None => Ok(()),
        }
    }
}
