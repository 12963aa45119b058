//! Monitor error types

use condensat_bus::{BusError, ErrorCode, HandlerError};
use condensat_lib::storage::StorageError;
use thiserror::Error;

/// Result type alias for monitor operations
pub type Result<T> = std::result::Result<T, MonitorError>;

/// Errors raised by telemetry ingestion and queries
#[derive(Debug, Error)]
pub enum MonitorError {
    /// A process-info sample was rejected
    #[error("Invalid process info: {0}")]
    AddProcessInfo(String),

    /// A query was well-formed but semantically invalid
    #[error("Invalid request: {0}")]
    InvalidRequest(String),

    /// Write-through or restore failed
    #[error("Storage error: {0}")]
    Storage(#[from] StorageError),

    /// Messaging failure
    #[error("Bus error: {0}")]
    Bus(#[from] BusError),
}

impl From<MonitorError> for HandlerError {
    fn from(err: MonitorError) -> Self {
        match err {
            MonitorError::AddProcessInfo(msg) => Self::new(ErrorCode::AddProcessInfo, msg),
            MonitorError::InvalidRequest(msg) => Self::invalid_request(msg),
            MonitorError::Bus(err) => err.into(),
            MonitorError::Storage(err) => Self::internal(err.to_string()),
        }
    }
}
