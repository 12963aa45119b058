//! Embedded in-process broker implementing the [`Transport`] contract

use crate::error::{BusError, Result};
use crate::message::Message;
use crate::subject::{SubjectMatcher, SubjectPattern, validate_subject};
use crate::transport::{Subscription, Transport};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Instant;
use tokio::sync::{Mutex, RwLock, mpsc};
use tracing::{debug, info, warn};
use uuid::Uuid;

/// Default per-subscription buffer size
pub const DEFAULT_BUFFER_SIZE: usize = 1024;

/// Statistics about broker operation
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct BrokerStatistics {
    /// Total messages published
    pub messages_published: u64,
    /// Total message deliveries (one per matching subscription)
    pub messages_delivered: u64,
    /// Messages published with no matching subscription
    pub messages_unrouted: u64,
    /// Active subscriptions
    pub active_subscriptions: usize,
    /// Broker uptime in seconds
    pub uptime_seconds: u64,
}

/// Embedded broker that routes messages between in-process subscriptions
pub struct EmbeddedBroker {
    /// Subject matcher for routing messages
    matcher: Arc<RwLock<SubjectMatcher>>,
    /// Subscriber senders for message delivery
    senders: Arc<Mutex<HashMap<Uuid, mpsc::Sender<Message>>>>,
    /// Connection flag
    connected: AtomicBool,
    /// Statistics
    stats: Arc<Mutex<BrokerStatistics>>,
    /// Buffer size of each subscription channel
    buffer_size: usize,
    /// Broker start time
    start_time: Instant,
}

impl EmbeddedBroker {
    /// Create a new broker with the default buffer size
    pub fn new() -> Self {
        Self::with_buffer_size(DEFAULT_BUFFER_SIZE)
    }

    /// Create a new broker with a custom per-subscription buffer size
    pub fn with_buffer_size(buffer_size: usize) -> Self {
        info!(buffer_size, "Embedded broker created");
        Self {
            matcher: Arc::new(RwLock::new(SubjectMatcher::new())),
            senders: Arc::new(Mutex::new(HashMap::new())),
            connected: AtomicBool::new(true),
            stats: Arc::new(Mutex::new(BrokerStatistics::default())),
            buffer_size: buffer_size.max(1),
            start_time: Instant::now(),
        }
    }

    /// Get current statistics
    pub async fn statistics(&self) -> BrokerStatistics {
        let mut stats = self.stats.lock().await.clone();
        stats.active_subscriptions = self.matcher.read().await.subscriber_count();
        stats.uptime_seconds = self.start_time.elapsed().as_secs();
        stats
    }

    fn ensure_connected(&self) -> Result<()> {
        if self.connected.load(Ordering::Acquire) {
            Ok(())
        } else {
            Err(BusError::transport("embedded broker is closed"))
        }
    }
}

impl Default for EmbeddedBroker {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl Transport for EmbeddedBroker {
    async fn publish(&self, message: Message) -> Result<()> {
        self.ensure_connected()?;
        validate_subject(&message.subject)?;

        let subscribers = self.matcher.read().await.find_subscribers(&message.subject);

        if subscribers.is_empty() {
            debug!(subject = %message.subject, "No subscribers for subject");
            let mut stats = self.stats.lock().await;
            stats.messages_published += 1;
            stats.messages_unrouted += 1;
            return Ok(());
        }

        // Clone senders so no lock is held while waiting on a full buffer
        let targets: Vec<(Uuid, mpsc::Sender<Message>)> = {
            let senders = self.senders.lock().await;
            subscribers
                .iter()
                .filter_map(|id| senders.get(id).map(|tx| (*id, tx.clone())))
                .collect()
        };

        let mut delivered = 0u64;
        let mut closed = Vec::new();
        for (id, sender) in targets {
            if sender.send(message.clone()).await.is_ok() {
                delivered += 1;
            } else {
                closed.push(id);
            }
        }

        if !closed.is_empty() {
            let mut senders = self.senders.lock().await;
            let mut matcher = self.matcher.write().await;
            for id in closed {
                debug!(subscription_id = %id, "Removing closed subscription");
                senders.remove(&id);
                matcher.unsubscribe(id);
            }
        }

        let mut stats = self.stats.lock().await;
        stats.messages_published += 1;
        stats.messages_delivered += delivered;

        debug!(subject = %message.subject, delivered, "Published message");
        Ok(())
    }

    async fn subscribe(&self, pattern: &str) -> Result<Subscription> {
        self.ensure_connected()?;
        let subject_pattern = SubjectPattern::new(pattern)?;

        let id = Uuid::new_v4();
        let (tx, rx) = mpsc::channel(self.buffer_size);

        self.senders.lock().await.insert(id, tx);
        self.matcher.write().await.subscribe(subject_pattern, id);

        debug!(subscription_id = %id, pattern, "Subscribed");
        Ok(Subscription {
            id,
            pattern: pattern.to_string(),
            receiver: rx,
        })
    }

    async fn unsubscribe(&self, subscription_id: Uuid) -> Result<()> {
        let removed = self.matcher.write().await.unsubscribe(subscription_id);
        self.senders.lock().await.remove(&subscription_id);

        if removed {
            debug!(%subscription_id, "Unsubscribed");
        } else {
            warn!(%subscription_id, "No subscription found");
        }
        Ok(())
    }

    fn is_connected(&self) -> bool {
        self.connected.load(Ordering::Acquire)
    }

    async fn close(&self) -> Result<()> {
        if !self.connected.swap(false, Ordering::AcqRel) {
            return Ok(());
        }

        info!("Closing embedded broker");
        self.senders.lock().await.clear();
        *self.matcher.write().await = SubjectMatcher::new();
        Ok(())
    }
}
