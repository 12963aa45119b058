//! Reliable log queue
//!
//! Entries are serialized [`LogEntry`] JSON strings. Consumption follows a
//! peek+ack model: [`LogQueue::reserve`] atomically moves the head entry into
//! a processing list, and the entry only leaves that list through
//! [`LogQueue::ack`]. Entries still in the processing list when a grabber
//! stops (crash, cancellation, exhausted retries) are moved back to the head
//! of the queue by [`LogQueue::recover`], so delivery is at-least-once.
//!
//! [`LogEntry`]: condensat_lib::models::LogEntry

use crate::error::Result;
use async_trait::async_trait;
use condensat_lib::config::QueueConfig;
use redis::aio::MultiplexedConnection;
use std::collections::VecDeque;
use std::sync::{Mutex, MutexGuard, PoisonError};
use std::time::Duration;
use tokio::sync::Notify;
use tracing::{debug, info, instrument};

/// Ordered queue with reserve/ack consumption
#[async_trait]
pub trait LogQueue: Send + Sync {
    /// Append a serialized entry to the tail
    async fn push(&self, payload: &str) -> Result<()>;

    /// Move the head entry into the processing list, waiting up to `wait`
    async fn reserve(&self, wait: Duration) -> Result<Option<String>>;

    /// Remove a reserved entry from the processing list
    async fn ack(&self, payload: &str) -> Result<()>;

    /// Move every processing entry back to the head, preserving order
    async fn recover(&self) -> Result<usize>;

    /// Number of entries waiting to be reserved
    async fn len(&self) -> Result<usize>;
}

/// Redis lists: `key` holds the queue, `processing_key` the reserved entries
pub struct RedisLogQueue {
    connection: MultiplexedConnection,
    key: String,
    processing_key: String,
}

impl RedisLogQueue {
    /// Connect to the configured redis instance
    #[instrument(skip_all, fields(host = %config.host, port = config.port))]
    pub async fn connect(config: &QueueConfig) -> Result<Self> {
        let client = redis::Client::open(config.redis_url())?;
        let connection = client.get_multiplexed_async_connection().await?;
        info!(key = %config.key, "Connected to redis log queue");
        Ok(Self {
            connection,
            key: config.key.clone(),
            processing_key: config.processing_key.clone(),
        })
    }

    /// Number of reserved, unacknowledged entries
    pub async fn processing_len(&self) -> Result<usize> {
        let mut conn = self.connection.clone();
        Ok(redis::cmd("LLEN")
            .arg(&self.processing_key)
            .query_async(&mut conn)
            .await?)
    }
}

#[async_trait]
impl LogQueue for RedisLogQueue {
    async fn push(&self, payload: &str) -> Result<()> {
        let mut conn = self.connection.clone();
        let _: usize = redis::cmd("RPUSH")
            .arg(&self.key)
            .arg(payload)
            .query_async(&mut conn)
            .await?;
        Ok(())
    }

    async fn reserve(&self, wait: Duration) -> Result<Option<String>> {
        let mut conn = self.connection.clone();
        // BLMOVE treats a zero timeout as "block forever"
        if wait.is_zero() {
            return Ok(redis::cmd("LMOVE")
                .arg(&self.key)
                .arg(&self.processing_key)
                .arg("LEFT")
                .arg("RIGHT")
                .query_async(&mut conn)
                .await?);
        }

        Ok(redis::cmd("BLMOVE")
            .arg(&self.key)
            .arg(&self.processing_key)
            .arg("LEFT")
            .arg("RIGHT")
            .arg(wait.as_secs_f64())
            .query_async(&mut conn)
            .await?)
    }

    async fn ack(&self, payload: &str) -> Result<()> {
        let mut conn = self.connection.clone();
        let removed: usize = redis::cmd("LREM")
            .arg(&self.processing_key)
            .arg(1)
            .arg(payload)
            .query_async(&mut conn)
            .await?;
        if removed == 0 {
            debug!("Acknowledged entry was not in the processing list");
        }
        Ok(())
    }

    async fn recover(&self) -> Result<usize> {
        let mut conn = self.connection.clone();
        let mut moved = 0;
        loop {
            let entry: Option<String> = redis::cmd("LMOVE")
                .arg(&self.processing_key)
                .arg(&self.key)
                .arg("RIGHT")
                .arg("LEFT")
                .query_async(&mut conn)
                .await?;
            if entry.is_none() {
                break;
            }
            moved += 1;
        }
        Ok(moved)
    }

    async fn len(&self) -> Result<usize> {
        let mut conn = self.connection.clone();
        Ok(redis::cmd("LLEN")
            .arg(&self.key)
            .query_async(&mut conn)
            .await?)
    }
}

#[derive(Debug, Default)]
struct MemoryLists {
    queue: VecDeque<String>,
    processing: Vec<String>,
}

/// In-process queue with the same reserve/ack semantics as [`RedisLogQueue`]
#[derive(Debug, Default)]
pub struct MemoryLogQueue {
    lists: Mutex<MemoryLists>,
    notify: Notify,
}

impl MemoryLogQueue {
    pub fn new() -> Self {
        Self::default()
    }

    fn lists(&self) -> MutexGuard<'_, MemoryLists> {
        self.lists.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn take(&self) -> Option<String> {
        let mut lists = self.lists();
        let entry = lists.queue.pop_front()?;
        lists.processing.push(entry.clone());
        Some(entry)
    }

    /// Snapshot of the reserved, unacknowledged entries
    pub fn processing(&self) -> Vec<String> {
        self.lists().processing.clone()
    }
}

#[async_trait]
impl LogQueue for MemoryLogQueue {
    async fn push(&self, payload: &str) -> Result<()> {
        self.lists().queue.push_back(payload.to_owned());
        self.notify.notify_one();
        Ok(())
    }

    async fn reserve(&self, wait: Duration) -> Result<Option<String>> {
        let deadline = tokio::time::Instant::now() + wait;
        loop {
            let notified = self.notify.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();

            if let Some(entry) = self.take() {
                return Ok(Some(entry));
            }
            if tokio::time::timeout_at(deadline, notified).await.is_err() {
                return Ok(None);
            }
        }
    }

    async fn ack(&self, payload: &str) -> Result<()> {
        let mut lists = self.lists();
        if let Some(position) = lists.processing.iter().position(|entry| entry == payload) {
            lists.processing.remove(position);
        }
        Ok(())
    }

    async fn recover(&self) -> Result<usize> {
        let mut lists = self.lists();
        let processing = std::mem::take(&mut lists.processing);
        let moved = processing.len();
        for entry in processing.into_iter().rev() {
            lists.queue.push_front(entry);
        }
        drop(lists);
        if moved > 0 {
            self.notify.notify_one();
        }
        Ok(moved)
    }

    async fn len(&self) -> Result<usize> {
        Ok(self.lists().queue.len())
    }
}
