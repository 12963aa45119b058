//! Error types for the Condensat message bus

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Result type alias for bus operations
pub type Result<T> = std::result::Result<T, BusError>;

/// Errors that can occur in bus operations
#[derive(Error, Debug)]
pub enum BusError {
    /// The underlying transport connection is down
    #[error("Transport unavailable: {0}")]
    TransportUnavailable(String),

    /// A payload did not match the expected shape
    #[error("Decode error: {0}")]
    Decode(String),

    /// A value could not be serialized
    #[error("Encode error: {0}")]
    Encode(String),

    /// No reply arrived before the request deadline
    #[error("Request timeout after {timeout_ms}ms on subject {subject}")]
    RequestTimeout { subject: String, timeout_ms: u64 },

    /// The governing cancellation token fired
    #[error("Operation cancelled: {0}")]
    Cancelled(String),

    /// The remote handler answered with an error reply
    #[error("Remote error ({code}): {message}")]
    Remote { code: ErrorCode, message: String },

    /// Subject string is malformed
    #[error("Invalid subject: {0}")]
    InvalidSubject(String),

    /// Handler registry rejected a registration
    #[error("Registry error: {0}")]
    Registry(String),

    /// Component already shut down
    #[error("Shutdown error: {0}")]
    Shutdown(String),
}

impl BusError {
    /// Create a transport unavailable error
    pub fn transport(msg: impl Into<String>) -> Self {
        Self::TransportUnavailable(msg.into())
    }

    /// Create a decode error
    pub fn decode(msg: impl Into<String>) -> Self {
        Self::Decode(msg.into())
    }

    /// Create an encode error
    pub fn encode(msg: impl Into<String>) -> Self {
        Self::Encode(msg.into())
    }

    /// Create a cancellation error
    pub fn cancelled(msg: impl Into<String>) -> Self {
        Self::Cancelled(msg.into())
    }

    /// Create an invalid subject error
    pub fn invalid_subject(msg: impl Into<String>) -> Self {
        Self::InvalidSubject(msg.into())
    }

    /// Create a registry error
    pub fn registry(msg: impl Into<String>) -> Self {
        Self::Registry(msg.into())
    }

    /// Create a shutdown error
    pub fn shutdown(msg: impl Into<String>) -> Self {
        Self::Shutdown(msg.into())
    }

    /// Whether the caller may retry the operation under its own policy
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            Self::TransportUnavailable(_) | Self::RequestTimeout { .. }
        )
    }
}

/// Error indicator carried by error replies
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ErrorCode {
    /// Request payload could not be decoded
    Decode,
    /// Telemetry ingestion rejected the sample
    AddProcessInfo,
    /// Request was well-formed but semantically invalid
    InvalidRequest,
    /// Handler failed or panicked
    Internal,
}

impl std::fmt::Display for ErrorCode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Decode => write!(f, "ErrDecode"),
            Self::AddProcessInfo => write!(f, "ErrAddProcessInfo"),
            Self::InvalidRequest => write!(f, "ErrInvalidRequest"),
            Self::Internal => write!(f, "ErrInternalError"),
        }
    }
}

/// Failure returned by a message handler, converted into an error reply
#[derive(Error, Debug, Clone, PartialEq, Eq)]
#[error("{code}: {message}")]
pub struct HandlerError {
    /// Code published in the error reply
    pub code: ErrorCode,
    /// Human-readable detail
    pub message: String,
}

impl HandlerError {
    /// Create a handler error with an explicit code
    pub fn new(code: ErrorCode, message: impl Into<String>) -> Self {
        Self {
            code,
            message: message.into(),
        }
    }

    /// Create a decode failure
    pub fn decode(message: impl Into<String>) -> Self {
        Self::new(ErrorCode::Decode, message)
    }

    /// Create an internal failure
    pub fn internal(message: impl Into<String>) -> Self {
        Self::new(ErrorCode::Internal, message)
    }

    /// Create an invalid request failure
    pub fn invalid_request(message: impl Into<String>) -> Self {
        Self::new(ErrorCode::InvalidRequest, message)
    }
}

impl From<BusError> for HandlerError {
    fn from(err: BusError) -> Self {
        match err {
            BusError::Decode(msg) => Self::decode(msg),
            BusError::Remote { code, message } => Self::new(code, message),
            other => Self::internal(other.to_string()),
        }
    }
}
