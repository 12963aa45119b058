//! Transport contract between the bus components and a pub/sub broker
//!
//! The RPC correlator and the worker pool only rely on this trait: a transport
//! must deliver published messages to every matching subscription, carry the
//! `reply_to` and `correlation_id` metadata untouched, and preserve publish
//! order per subject.

use crate::error::Result;
use crate::message::Message;
use async_trait::async_trait;
use tokio::sync::mpsc;
use uuid::Uuid;

/// An active subscription on a transport
#[derive(Debug)]
pub struct Subscription {
    /// Transport-side subscription identifier
    pub id: Uuid,
    /// Pattern the subscription was registered with
    pub pattern: String,
    /// Inbound message stream, closed when the subscription is released
    pub receiver: mpsc::Receiver<Message>,
}

impl Subscription {
    /// Receive the next message, `None` once the subscription is closed
    pub async fn recv(&mut self) -> Option<Message> {
        self.receiver.recv().await
    }
}

/// Pub/sub transport contract
#[async_trait]
pub trait Transport: Send + Sync {
    /// Publish a message; fails with `TransportUnavailable` when disconnected.
    /// Implementations must not retry internally.
    async fn publish(&self, message: Message) -> Result<()>;

    /// Register a subscription for a subject pattern
    async fn subscribe(&self, pattern: &str) -> Result<Subscription>;

    /// Release a subscription
    async fn unsubscribe(&self, subscription_id: Uuid) -> Result<()>;

    /// Whether the underlying connection is up
    fn is_connected(&self) -> bool;

    /// Close the connection and every subscription
    async fn close(&self) -> Result<()>;
}
