//! Log sinks fed by the grabber

use crate::error::{LoggerError, Result};
use async_trait::async_trait;
use condensat_lib::models::LogEntry;
use condensat_lib::storage::{Storage, StorageExt, Tables};
use std::fmt::Write as _;
use std::io::Write;
use std::str::FromStr;
use std::sync::{Arc, Mutex, PoisonError};

/// Destination for drained log entries
#[async_trait]
pub trait LogSink: Send + Sync {
    /// Sink name used in logs and retry bookkeeping
    fn name(&self) -> &str;

    /// Deliver one entry; an error means the entry must be retried
    async fn write(&self, entry: &LogEntry) -> Result<()>;

    /// Release the sink's resources
    async fn close(&self) -> Result<()>;
}

/// Line format of the console sink
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ConsoleFormat {
    #[default]
    Human,
    Json,
}

impl FromStr for ConsoleFormat {
    type Err = String;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s {
            "human" => Ok(Self::Human),
            "json" => Ok(Self::Json),
            other => Err(format!("unknown console format: {other}")),
        }
    }
}

/// Writes one line per entry, to stdout unless another writer is given
pub struct ConsoleSink {
    format: ConsoleFormat,
    writer: Mutex<Box<dyn Write + Send>>,
}

impl ConsoleSink {
    pub fn new(format: ConsoleFormat) -> Self {
        Self::with_writer(format, Box::new(std::io::stdout()))
    }

    pub fn with_writer(format: ConsoleFormat, writer: Box<dyn Write + Send>) -> Self {
        Self {
            format,
            writer: Mutex::new(writer),
        }
    }

    /// Render an entry as a single line
    pub fn format_entry(&self, entry: &LogEntry) -> Result<String> {
        match self.format {
            ConsoleFormat::Json => Ok(serde_json::to_string(entry)?),
            ConsoleFormat::Human => {
                let mut line = format!(
                    "{} {:>5} [{}] {}: {}",
                    entry.timestamp.to_rfc3339(),
                    entry.level.to_string(),
                    entry.producer,
                    entry.target,
                    entry.message
                );
                for (key, value) in &entry.fields {
                    let _ = write!(line, " {key}={value}");
                }
                Ok(line)
            }
        }
    }
}

#[async_trait]
impl LogSink for ConsoleSink {
    fn name(&self) -> &str {
        "console"
    }

    async fn write(&self, entry: &LogEntry) -> Result<()> {
        let line = self.format_entry(entry)?;
        let mut writer = self.writer.lock().unwrap_or_else(PoisonError::into_inner);
        writeln!(writer, "{line}").map_err(|e| LoggerError::sink(self.name(), e.to_string()))
    }

    async fn close(&self) -> Result<()> {
        self.writer
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .flush()
            .map_err(|e| LoggerError::sink(self.name(), e.to_string()))
    }
}

/// Stores entries in the `logs` table keyed by ordering token
///
/// Redelivered entries overwrite their earlier copy, so at-least-once
/// delivery leaves exactly one row per token.
pub struct DatabaseSink {
    storage: Arc<dyn Storage>,
}

impl DatabaseSink {
    pub fn new(storage: Arc<dyn Storage>) -> Self {
        Self { storage }
    }
}

#[async_trait]
impl LogSink for DatabaseSink {
    fn name(&self) -> &str {
        "database"
    }

    async fn write(&self, entry: &LogEntry) -> Result<()> {
        self.storage
            .upsert_json(Tables::LOGS.name, &entry.token, entry)?;
        Ok(())
    }

    async fn close(&self) -> Result<()> {
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{TimeZone, Utc};
    use condensat_lib::models::LogLevel;
    use condensat_lib::storage::RedbStorage;
    use std::collections::BTreeMap;

    fn entry(sequence: u64) -> LogEntry {
        let mut fields = BTreeMap::new();
        fields.insert("request_id".to_owned(), "42".to_owned());
        LogEntry {
            token: LogEntry::ordering_token("api@node-1", sequence),
            producer: "api@node-1".to_owned(),
            timestamp: Utc.with_ymd_and_hms(2024, 1, 1, 12, 0, 0).unwrap(),
            level: LogLevel::Info,
            target: "api::server".to_owned(),
            message: "request served".to_owned(),
            fields,
        }
    }

    #[test]
    fn test_human_format() {
        let sink = ConsoleSink::with_writer(ConsoleFormat::Human, Box::new(std::io::sink()));
        let line = sink.format_entry(&entry(1)).unwrap();
        assert_eq!(
            line,
            "2024-01-01T12:00:00+00:00  INFO [api@node-1] api::server: request served request_id=42"
        );
    }

    #[test]
    fn test_json_format_parses_back() {
        let sink = ConsoleSink::with_writer(ConsoleFormat::Json, Box::new(std::io::sink()));
        let line = sink.format_entry(&entry(1)).unwrap();
        let parsed: LogEntry = serde_json::from_str(&line).unwrap();
        assert_eq!(parsed, entry(1));
    }

    #[test]
    fn test_console_format_from_str() {
        assert_eq!("json".parse::<ConsoleFormat>().unwrap(), ConsoleFormat::Json);
        assert!("xml".parse::<ConsoleFormat>().is_err());
    }

    #[tokio::test]
    async fn test_database_sink_collapses_duplicates() {
        let dir = tempfile::tempdir().unwrap();
        let storage = RedbStorage::open(dir.path().join("logs.db")).unwrap();
        storage.migrate(&Tables::all()).unwrap();
        let storage: Arc<dyn Storage> = Arc::new(storage);
        let sink = DatabaseSink::new(storage.clone());

        sink.write(&entry(1)).await.unwrap();
        sink.write(&entry(1)).await.unwrap();
        sink.write(&entry(2)).await.unwrap();

        let rows: Vec<LogEntry> = storage.query_json(Tables::LOGS.name, "api@node-1:").unwrap();
        assert_eq!(rows.len(), 2);
        assert_eq!(rows[0].token, LogEntry::ordering_token("api@node-1", 1));
    }
}
