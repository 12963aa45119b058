//! Logger error types

use condensat_lib::storage::StorageError;
use thiserror::Error;

/// Result type alias for logger operations
pub type Result<T> = std::result::Result<T, LoggerError>;

/// Errors raised by the log queue, sinks and grabber
#[derive(Debug, Error)]
pub enum LoggerError {
    /// The queue backend failed; fatal for the grabber
    #[error("Queue error: {0}")]
    Queue(String),

    /// A sink rejected an entry
    #[error("Sink {sink} failed: {message}")]
    Sink { sink: String, message: String },

    /// An entry could not be serialized or parsed
    #[error("Decode error: {0}")]
    Decode(#[from] serde_json::Error),

    /// Database sink failure
    #[error("Storage error: {0}")]
    Storage(#[from] StorageError),
}

impl LoggerError {
    /// Create a sink error
    pub fn sink(sink: impl Into<String>, message: impl Into<String>) -> Self {
        Self::Sink {
            sink: sink.into(),
            message: message.into(),
        }
    }
}

impl From<redis::RedisError> for LoggerError {
    fn from(err: redis::RedisError) -> Self {
        Self::Queue(err.to_string())
    }
}
