//! Core data models shared by Condensat services.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;
use std::time::Duration;

/// Runtime metrics of one service instance at one point in time.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ProcessInfo {
    /// Service name
    pub app_name: String,
    /// Host the instance runs on
    pub hostname: String,
    /// Sampling timestamp
    pub timestamp: DateTime<Utc>,
    /// Process identifier
    pub pid: u32,
    /// CPU usage percentage
    pub cpu_usage: f64,
    /// Resident memory in bytes
    pub memory_rss: u64,
    /// Virtual memory in bytes
    pub memory_virtual: u64,
    /// Process uptime in seconds
    pub uptime_secs: u64,
    /// Number of threads
    pub thread_count: u32,
    /// Custom metric data
    pub custom: BTreeMap<String, f64>,
}

impl ProcessInfo {
    /// Create an empty sample for a service instance.
    pub fn new(
        app_name: impl Into<String>,
        hostname: impl Into<String>,
        timestamp: DateTime<Utc>,
    ) -> Self {
        Self {
            app_name: app_name.into(),
            hostname: hostname.into(),
            timestamp,
            pid: 0,
            cpu_usage: 0.0,
            memory_rss: 0,
            memory_virtual: 0,
            uptime_secs: 0,
            thread_count: 0,
            custom: BTreeMap::new(),
        }
    }

    /// Add a custom metric.
    pub fn add_custom_metric(&mut self, name: impl Into<String>, value: f64) {
        self.custom.insert(name.into(), value);
    }

    /// Storage key, ordered by app, host and time.
    pub fn storage_key(&self) -> String {
        format!(
            "{}/{}/{:020}",
            self.app_name,
            self.hostname,
            self.timestamp.timestamp_micros()
        )
    }
}

/// Latest status of every service seen within a look-back window.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct StackListService {
    /// Look-back window the snapshot covers
    pub since: Duration,
    /// Service names, ascending
    pub services: Vec<String>,
    /// Latest sample of each service, aligned with `services`
    pub processes: Vec<ProcessInfo>,
}

/// Request for a [`StackListService`] snapshot.
#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct StackListRequest {
    /// Look-back window in seconds, zero for the configured default
    pub since_secs: u64,
}

/// Bucketed history of one service.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct StackServiceHistory {
    /// Service name
    pub app_name: String,
    /// Window start
    pub from: DateTime<Utc>,
    /// Window end, inclusive
    pub to: DateTime<Utc>,
    /// Bucket width
    pub step: Duration,
    /// Timestamp rounding applied before bucketing
    pub round: Duration,
    /// One sample per non-empty bucket, ascending by time
    pub history: Vec<ProcessInfo>,
}

/// Request for a [`StackServiceHistory`].
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct StackServiceHistoryRequest {
    /// Service name
    pub app_name: String,
    /// Window start
    pub from: DateTime<Utc>,
    /// Window end, inclusive
    pub to: DateTime<Utc>,
    /// Bucket width in seconds, zero for the configured default
    pub step_secs: u64,
    /// Rounding in seconds, zero for the configured default
    pub round_secs: u64,
}

/// Severity of a log entry.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LogLevel {
    Trace,
    Debug,
    Info,
    Warn,
    Error,
}

impl fmt::Display for LogLevel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Trace => write!(f, "TRACE"),
            Self::Debug => write!(f, "DEBUG"),
            Self::Info => write!(f, "INFO"),
            Self::Warn => write!(f, "WARN"),
            Self::Error => write!(f, "ERROR"),
        }
    }
}

impl From<&tracing::Level> for LogLevel {
    fn from(level: &tracing::Level) -> Self {
        match *level {
            tracing::Level::TRACE => Self::Trace,
            tracing::Level::DEBUG => Self::Debug,
            tracing::Level::INFO => Self::Info,
            tracing::Level::WARN => Self::Warn,
            tracing::Level::ERROR => Self::Error,
        }
    }
}

/// Structured log record travelling through the log queue.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct LogEntry {
    /// Ordering token, unique and monotonic per producer
    pub token: String,
    /// Producer identity (`app@hostname`)
    pub producer: String,
    /// Event timestamp
    pub timestamp: DateTime<Utc>,
    /// Severity
    pub level: LogLevel,
    /// Event target (module path)
    pub target: String,
    /// Rendered message
    pub message: String,
    /// Structured fields
    pub fields: BTreeMap<String, String>,
}

impl LogEntry {
    /// Ordering token for the `sequence`-th entry of `producer`.
    ///
    /// The sequence is zero padded so tokens of one producer sort
    /// lexicographically in emission order.
    pub fn ordering_token(producer: &str, sequence: u64) -> String {
        format!("{producer}:{sequence:020}")
    }

    /// Producer identity for an app running on a host.
    pub fn producer_id(app_name: &str, hostname: &str) -> String {
        format!("{app_name}@{hostname}")
    }

    /// Token prefix of one running instance of a producer.
    ///
    /// Restarts and co-located instances of the same app get distinct
    /// `instance` values, so their sequences never share a token.
    pub fn instance_prefix(producer: &str, instance: &str) -> String {
        format!("{producer}#{instance}")
    }
}
