//! Message envelope and payload codec
//!
//! Payloads travel as opaque bytes produced by [`encode`]. The envelope around
//! them ([`Message`]) carries the subject, the correlation metadata used by the
//! RPC layer, and an optional error indicator for error replies.

use crate::error::{BusError, ErrorCode, Result};
use serde::{Deserialize, Serialize, de::DeserializeOwned};
use std::time::SystemTime;
use uuid::Uuid;

/// Encode a typed payload into bytes.
///
/// Encoding is deterministic: identical values always produce identical bytes.
pub fn encode<T: Serialize + ?Sized>(value: &T) -> Result<Vec<u8>> {
    bincode::serde::encode_to_vec(value, bincode::config::standard())
        .map_err(|e| BusError::encode(e.to_string()))
}

/// Decode bytes into a typed payload.
///
/// Truncated input, type mismatches and trailing bytes all fail with
/// [`BusError::Decode`].
pub fn decode<T: DeserializeOwned>(bytes: &[u8]) -> Result<T> {
    let (value, read) =
        bincode::serde::decode_from_slice::<T, _>(bytes, bincode::config::standard())
            .map_err(|e| BusError::decode(e.to_string()))?;

    if read != bytes.len() {
        return Err(BusError::decode(format!(
            "{} trailing bytes after payload",
            bytes.len() - read
        )));
    }

    Ok(value)
}

/// Error indicator attached to an error reply
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ErrorReply {
    /// Error code
    pub code: ErrorCode,
    /// Error detail
    pub message: String,
}

/// A message sent through the bus
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Message {
    /// Unique message identifier
    pub id: Uuid,
    /// Subject this message is published to
    pub subject: String,
    /// Correlation ID linking a request to its reply
    pub correlation_id: Option<String>,
    /// Subject the receiver must publish its reply to
    pub reply_to: Option<String>,
    /// Error indicator, present only on error replies
    pub error: Option<ErrorReply>,
    /// Message payload (encoded data)
    pub payload: Vec<u8>,
    /// Timestamp when message was created
    pub timestamp: SystemTime,
}

impl Message {
    /// Create a new fire-and-forget message
    pub fn new(subject: impl Into<String>, payload: Vec<u8>) -> Self {
        Self {
            id: Uuid::new_v4(),
            subject: subject.into(),
            correlation_id: None,
            reply_to: None,
            error: None,
            payload,
            timestamp: SystemTime::now(),
        }
    }

    /// Create a request expecting a reply on `reply_to`
    pub fn request(
        subject: impl Into<String>,
        correlation_id: impl Into<String>,
        reply_to: impl Into<String>,
        payload: Vec<u8>,
    ) -> Self {
        Self {
            correlation_id: Some(correlation_id.into()),
            reply_to: Some(reply_to.into()),
            ..Self::new(subject, payload)
        }
    }

    /// Build the successful reply to this message, if it expects one
    pub fn reply(&self, payload: Vec<u8>) -> Option<Self> {
        let reply_to = self.reply_to.as_ref()?;
        Some(Self {
            correlation_id: self.correlation_id.clone(),
            ..Self::new(reply_to.clone(), payload)
        })
    }

    /// Build the error reply to this message, if it expects one
    pub fn error_reply(&self, code: ErrorCode, message: impl Into<String>) -> Option<Self> {
        let mut reply = self.reply(Vec::new())?;
        reply.error = Some(ErrorReply {
            code,
            message: message.into(),
        });
        Some(reply)
    }

    /// Whether this message is an error reply
    pub fn is_error(&self) -> bool {
        self.error.is_some()
    }

    /// Decode the payload into a typed value
    pub fn decode_payload<T: DeserializeOwned>(&self) -> Result<T> {
        decode(&self.payload)
    }

    /// Serialize the whole message for byte-oriented transports
    pub fn to_bytes(&self) -> Result<Vec<u8>> {
        encode(self)
    }

    /// Deserialize a whole message from bytes
    pub fn from_bytes(data: &[u8]) -> Result<Self> {
        decode(data)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::BTreeMap;

    #[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
    struct Sample {
        name: String,
        values: Vec<u32>,
        tags: BTreeMap<String, String>,
        ratio: Option<f64>,
    }

    fn sample() -> Sample {
        let mut tags = BTreeMap::new();
        tags.insert("host".to_string(), "node-1".to_string());
        Sample {
            name: "api".to_string(),
            values: vec![1, 2, 3],
            tags,
            ratio: Some(0.5),
        }
    }

    #[test]
    fn test_encode_is_deterministic() {
        assert_eq!(encode(&sample()).unwrap(), encode(&sample()).unwrap());
    }

    #[test]
    fn test_decode_truncated_payload_fails() {
        let bytes = encode(&sample()).unwrap();
        let result = decode::<Sample>(&bytes[..bytes.len() / 2]);
        assert!(matches!(result, Err(BusError::Decode(_))));
    }

    #[test]
    fn test_decode_trailing_bytes_fails() {
        let mut bytes = encode(&42u32).unwrap();
        bytes.push(0);
        assert!(matches!(decode::<u32>(&bytes), Err(BusError::Decode(_))));
    }

    #[test]
    fn test_decode_type_mismatch_fails() {
        let bytes = encode(&"plain string").unwrap();
        assert!(matches!(decode::<Sample>(&bytes), Err(BusError::Decode(_))));
    }

    #[test]
    fn test_message_roundtrip_bytes() {
        let msg = Message::request("Example.Request", "corr-1", "_INBOX.c.corr-1", vec![1, 2]);
        let restored = Message::from_bytes(&msg.to_bytes().unwrap()).unwrap();
        assert_eq!(restored, msg);
    }

    #[test]
    fn test_reply_carries_correlation() {
        let msg = Message::request("Example.Request", "corr-1", "_INBOX.c.corr-1", vec![]);
        let reply = msg.reply(vec![9]).unwrap();
        assert_eq!(reply.subject, "_INBOX.c.corr-1");
        assert_eq!(reply.correlation_id.as_deref(), Some("corr-1"));
        assert!(!reply.is_error());

        let err = msg.error_reply(ErrorCode::Internal, "boom").unwrap();
        assert!(err.is_error());
        assert_eq!(err.error.unwrap().code, ErrorCode::Internal);
    }

    #[test]
    fn test_fire_and_forget_has_no_reply() {
        let msg = Message::new("Condensat.Monitor.Inbound", vec![]);
        assert!(msg.reply(vec![]).is_none());
        assert!(msg.error_reply(ErrorCode::Decode, "x").is_none());
    }
}
