//! Log producers: a direct queue logger and a `tracing` layer

use crate::error::Result;
use crate::queue::LogQueue;
use chrono::Utc;
use condensat_lib::models::{LogEntry, LogLevel};
use std::collections::BTreeMap;
use std::fmt;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::field::{Field, Visit};
use tracing::{Event, Subscriber, warn};
use tracing_subscriber::Layer;
use tracing_subscriber::layer::Context;
use uuid::Uuid;

/// Targets never forwarded by [`QueueLayer`]; their events are emitted while pushing
const IGNORED_TARGETS: &[&str] = &["condensat_logger", "redis"];

/// Pushes entries to the log queue with per-instance ordering tokens
pub struct QueueLogger {
    queue: Arc<dyn LogQueue>,
    producer: String,
    token_prefix: String,
    sequence: AtomicU64,
}

impl QueueLogger {
    /// Logger for a fresh instance; its tokens never repeat those of an
    /// earlier run or of another instance on the same host
    pub fn new(queue: Arc<dyn LogQueue>, app_name: &str, hostname: &str) -> Self {
        Self::with_instance(queue, app_name, hostname, &new_instance_id())
    }

    pub fn with_instance(
        queue: Arc<dyn LogQueue>,
        app_name: &str,
        hostname: &str,
        instance: &str,
    ) -> Self {
        let producer = LogEntry::producer_id(app_name, hostname);
        Self {
            queue,
            token_prefix: LogEntry::instance_prefix(&producer, instance),
            producer,
            sequence: AtomicU64::new(0),
        }
    }

    pub fn producer(&self) -> &str {
        &self.producer
    }

    /// Prefix shared by every token this logger issues
    pub fn token_prefix(&self) -> &str {
        &self.token_prefix
    }

    fn next_token(&self) -> String {
        let sequence = self.sequence.fetch_add(1, Ordering::Relaxed);
        LogEntry::ordering_token(&self.token_prefix, sequence)
    }

    /// Stamp an entry with this producer's identity and next token, then push it
    pub async fn push(&self, mut entry: LogEntry) -> Result<String> {
        entry.producer.clone_from(&self.producer);
        entry.token = self.next_token();
        let payload = serde_json::to_string(&entry)?;
        self.queue.push(&payload).await?;
        Ok(entry.token)
    }

    /// Build and push an entry
    pub async fn log(
        &self,
        level: LogLevel,
        target: &str,
        message: impl Into<String>,
        fields: BTreeMap<String, String>,
    ) -> Result<String> {
        self.push(LogEntry {
            token: String::new(),
            producer: String::new(),
            timestamp: Utc::now(),
            level,
            target: target.to_owned(),
            message: message.into(),
            fields,
        })
        .await
    }
}

/// Start time in hex microseconds followed by random bits, so later
/// instances usually sort after earlier ones
fn new_instance_id() -> String {
    let started = Utc::now().timestamp_micros().max(0);
    let (random, ..) = Uuid::new_v4().as_fields();
    format!("{started:014x}-{random:08x}")
}

/// `tracing` layer that forwards events to a [`QueueLogger`]
///
/// Events go through a bounded channel to a background pusher. When the
/// channel is full the event is dropped and counted, so logging never blocks
/// the instrumented code.
pub struct QueueLayer {
    sender: mpsc::Sender<LogEntry>,
    dropped: Arc<AtomicU64>,
}

impl QueueLayer {
    /// Create the layer and spawn its pusher; the pusher drains remaining
    /// events and exits once `cancel` fires or every layer is dropped
    pub fn spawn(
        logger: Arc<QueueLogger>,
        capacity: usize,
        cancel: CancellationToken,
    ) -> (Self, JoinHandle<()>) {
        let (sender, receiver) = mpsc::channel(capacity.max(1));
        let handle = tokio::spawn(push_events(logger, receiver, cancel));
        let layer = Self {
            sender,
            dropped: Arc::new(AtomicU64::new(0)),
        };
        (layer, handle)
    }

    /// Handle on the dropped-event counter
    pub fn dropped_counter(&self) -> Arc<AtomicU64> {
        self.dropped.clone()
    }
}

async fn push_events(
    logger: Arc<QueueLogger>,
    mut receiver: mpsc::Receiver<LogEntry>,
    cancel: CancellationToken,
) {
    loop {
        let entry = tokio::select! {
            biased;
            entry = receiver.recv() => match entry {
                Some(entry) => entry,
                None => return,
            },
            _ = cancel.cancelled() => break,
        };
        if let Err(e) = logger.push(entry).await {
            warn!(error = %e, "Failed to push log entry");
        }
    }

    receiver.close();
    while let Ok(entry) = receiver.try_recv() {
        if let Err(e) = logger.push(entry).await {
            warn!(error = %e, "Failed to push log entry");
        }
    }
}

#[derive(Default)]
struct EntryVisitor {
    message: String,
    fields: BTreeMap<String, String>,
}

impl Visit for EntryVisitor {
    fn record_str(&mut self, field: &Field, value: &str) {
        if field.name() == "message" {
            self.message = value.to_owned();
        } else {
            self.fields.insert(field.name().to_owned(), value.to_owned());
        }
    }

    fn record_debug(&mut self, field: &Field, value: &dyn fmt::Debug) {
        if field.name() == "message" {
            self.message = format!("{value:?}");
        } else {
            self.fields
                .insert(field.name().to_owned(), format!("{value:?}"));
        }
    }
}

impl<S: Subscriber> Layer<S> for QueueLayer {
    fn on_event(&self, event: &Event<'_>, _ctx: Context<'_, S>) {
        let metadata = event.metadata();
        let target = metadata.target();
        if IGNORED_TARGETS
            .iter()
            .any(|ignored| target.starts_with(ignored))
        {
            return;
        }

        let mut visitor = EntryVisitor::default();
        event.record(&mut visitor);

        let entry = LogEntry {
            token: String::new(),
            producer: String::new(),
            timestamp: Utc::now(),
            level: LogLevel::from(metadata.level()),
            target: target.to_owned(),
            message: visitor.message,
            fields: visitor.fields,
        };

        if self.sender.try_send(entry).is_err() {
            self.dropped.fetch_add(1, Ordering::Relaxed);
        }
    }
}
