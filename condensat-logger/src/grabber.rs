//! Drains the log queue into every configured sink
//!
//! An entry a sink rejects stays reserved in the processing list and is kept
//! in memory with the sinks still owed. Those sinks are retried from the drain
//! loop once their backoff has elapsed, so one failing sink never delays
//! delivery of new entries to the others.

use crate::error::Result;
use crate::queue::LogQueue;
use crate::sink::LogSink;
use condensat_lib::config::QueueConfig;
use condensat_lib::models::LogEntry;
use futures::future::join_all;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, instrument, warn};

/// Grabber tuning
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct GrabberSettings {
    /// Longest single wait on an empty queue
    pub poll_interval: Duration,
    /// Failed attempts after which an entry counts as parked; its backoff stops growing there
    pub max_attempts: u32,
    /// Delay before the second attempt, growing linearly afterwards
    pub retry_backoff: Duration,
    /// Entries awaiting a retry before the grabber stops reserving new ones
    pub max_pending: usize,
}

impl Default for GrabberSettings {
    fn default() -> Self {
        Self::from(&QueueConfig::default())
    }
}

impl From<&QueueConfig> for GrabberSettings {
    fn from(config: &QueueConfig) -> Self {
        Self {
            poll_interval: config.poll_interval(),
            max_attempts: config.max_attempts.max(1),
            retry_backoff: config.retry_backoff(),
            max_pending: config.max_pending.max(1),
        }
    }
}

impl GrabberSettings {
    fn backoff(&self, attempts: u32) -> Duration {
        self.retry_backoff
            .saturating_mul(attempts.min(self.max_attempts))
    }
}

/// Counters since the grabber was created
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct GrabberStats {
    pub recovered: u64,
    pub received: u64,
    pub delivered: u64,
    pub parked: u64,
    pub malformed: u64,
    /// Entries currently awaiting a retry
    pub pending: u64,
}

#[derive(Debug, Default)]
struct GrabberCounters {
    recovered: AtomicU64,
    received: AtomicU64,
    delivered: AtomicU64,
    parked: AtomicU64,
    malformed: AtomicU64,
    pending: AtomicU64,
}

/// A reserved entry some sinks have not accepted yet
struct PendingEntry {
    payload: String,
    entry: LogEntry,
    sinks: Vec<Arc<dyn LogSink>>,
    attempts: u32,
    due: Instant,
}

/// Single long-lived consumer of the log queue
pub struct Grabber {
    queue: Arc<dyn LogQueue>,
    sinks: Vec<Arc<dyn LogSink>>,
    settings: GrabberSettings,
    counters: GrabberCounters,
}

impl Grabber {
    pub fn new(
        queue: Arc<dyn LogQueue>,
        sinks: Vec<Arc<dyn LogSink>>,
        settings: GrabberSettings,
    ) -> Self {
        Self {
            queue,
            sinks,
            settings,
            counters: GrabberCounters::default(),
        }
    }

    pub fn stats(&self) -> GrabberStats {
        GrabberStats {
            recovered: self.counters.recovered.load(Ordering::Relaxed),
            received: self.counters.received.load(Ordering::Relaxed),
            delivered: self.counters.delivered.load(Ordering::Relaxed),
            parked: self.counters.parked.load(Ordering::Relaxed),
            malformed: self.counters.malformed.load(Ordering::Relaxed),
            pending: self.counters.pending.load(Ordering::Relaxed),
        }
    }

    /// Drain the queue until `cancel` fires or the queue fails
    ///
    /// Sinks are closed on every exit path. A queue error is returned to the
    /// caller; sink errors never are. Entries still pending on exit remain in
    /// the processing list for the next start to recover.
    #[instrument(skip_all, fields(sinks = self.sinks.len()))]
    pub async fn run(&self, cancel: CancellationToken) -> Result<()> {
        let result = self.drain(&cancel).await;
        if let Err(e) = &result {
            error!(error = %e, "Log queue failed, grabber stopping");
        }

        for sink in &self.sinks {
            if let Err(e) = sink.close().await {
                warn!(sink = sink.name(), error = %e, "Failed to close sink");
            }
        }

        info!(stats = ?self.stats(), "Grabber stopped");
        result
    }

    async fn drain(&self, cancel: &CancellationToken) -> Result<()> {
        let recovered = self.queue.recover().await?;
        self.counters
            .recovered
            .fetch_add(recovered as u64, Ordering::Relaxed);
        info!(recovered, "Grabber started");

        let mut pending: Vec<PendingEntry> = Vec::new();
        loop {
            if cancel.is_cancelled() {
                return Ok(());
            }

            self.retry_due(&mut pending).await?;
            self.counters
                .pending
                .store(pending.len() as u64, Ordering::Relaxed);

            let next_due = pending.iter().map(|p| p.due).min();
            if pending.len() >= self.settings.max_pending
                && let Some(due) = next_due
            {
                tokio::select! {
                    biased;
                    _ = cancel.cancelled() => return Ok(()),
                    _ = tokio::time::sleep_until(due) => continue,
                }
            }

            let wait = next_due.map_or(self.settings.poll_interval, |due| {
                due.saturating_duration_since(Instant::now())
                    .min(self.settings.poll_interval)
            });
            let reserved = tokio::select! {
                biased;
                _ = cancel.cancelled() => return Ok(()),
                reserved = self.queue.reserve(wait) => reserved?,
            };

            if let Some(payload) = reserved {
                self.counters.received.fetch_add(1, Ordering::Relaxed);
                if let Some(entry) = self.process(payload).await? {
                    pending.push(entry);
                }
            }
        }
    }

    /// First delivery attempt; returns the entry when some sink still owes it
    async fn process(&self, payload: String) -> Result<Option<PendingEntry>> {
        let entry: LogEntry = match serde_json::from_str(&payload) {
            Ok(entry) => entry,
            Err(e) => {
                warn!(error = %e, size = payload.len(), "Dropping malformed log entry");
                self.counters.malformed.fetch_add(1, Ordering::Relaxed);
                self.queue.ack(&payload).await?;
                return Ok(None);
            }
        };

        let failed = self.write_all(&entry, &self.sinks, 1).await;
        if failed.is_empty() {
            self.acknowledge(&payload, &entry).await?;
            return Ok(None);
        }

        Ok(Some(PendingEntry {
            payload,
            entry,
            sinks: failed,
            attempts: 1,
            due: Instant::now() + self.settings.backoff(1),
        }))
    }

    async fn retry_due(&self, pending: &mut Vec<PendingEntry>) -> Result<()> {
        let now = Instant::now();
        let mut index = 0;
        while index < pending.len() {
            if pending[index].due > now {
                index += 1;
                continue;
            }

            let retry = &mut pending[index];
            retry.attempts = retry.attempts.saturating_add(1);
            retry.sinks = self
                .write_all(&retry.entry, &retry.sinks, retry.attempts)
                .await;

            if retry.sinks.is_empty() {
                let done = pending.remove(index);
                self.acknowledge(&done.payload, &done.entry).await?;
                continue;
            }

            if retry.attempts == self.settings.max_attempts {
                self.counters.parked.fetch_add(1, Ordering::Relaxed);
                warn!(
                    token = %retry.entry.token,
                    sinks = retry.sinks.len(),
                    "Log entry parked, retrying at the slowest backoff"
                );
            }
            retry.due = Instant::now() + self.settings.backoff(retry.attempts);
            index += 1;
        }
        Ok(())
    }

    async fn acknowledge(&self, payload: &str, entry: &LogEntry) -> Result<()> {
        self.queue.ack(payload).await?;
        self.counters.delivered.fetch_add(1, Ordering::Relaxed);
        debug!(token = %entry.token, "Log entry delivered");
        Ok(())
    }

    /// Write to every given sink concurrently; returns the sinks that failed
    async fn write_all(
        &self,
        entry: &LogEntry,
        sinks: &[Arc<dyn LogSink>],
        attempt: u32,
    ) -> Vec<Arc<dyn LogSink>> {
        let results = join_all(
            sinks
                .iter()
                .map(|sink| async move { (sink, sink.write(entry).await) }),
        )
        .await;

        results
            .into_iter()
            .filter_map(|(sink, result)| match result {
                Ok(()) => None,
                Err(e) => {
                    warn!(
                        sink = sink.name(),
                        token = %entry.token,
                        attempt,
                        error = %e,
                        "Sink write failed"
                    );
                    Some(Arc::clone(sink))
                }
            })
            .collect()
    }
}
