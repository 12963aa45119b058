//! Worker pool dispatcher: bounded concurrent handling of one subject
//!
//! A pool owns one subscription and N execution slots. The dispatch loop
//! acquires a slot before taking the next message off the subscription, so a
//! saturated pool stops pulling and the transport buffers the backlog.

use crate::error::{BusError, ErrorCode, Result};
use crate::handler::MessageHandler;
use crate::message::Message;
use crate::subject::validate_pattern;
use crate::transport::{Subscription, Transport};
use futures::FutureExt;
use serde::{Deserialize, Serialize};
use std::any::Any;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use tokio::sync::{OwnedSemaphorePermit, Semaphore, watch};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

/// Lifecycle state of a worker pool
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum PoolState {
    /// Created, not yet subscribed
    Idle,
    /// Dispatching messages
    Running,
    /// No longer receiving, waiting for in-flight handlers
    Draining,
    /// All handlers finished and the subscription is released
    Stopped,
}

/// Snapshot of worker pool counters
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct WorkerPoolStats {
    /// Messages taken off the subscription
    pub received: u64,
    /// Handler invocations that returned successfully
    pub completed: u64,
    /// Handler invocations that returned an error
    pub failed: u64,
    /// Handler invocations that panicked
    pub panicked: u64,
    /// Handlers currently running
    pub active: usize,
    /// Highest number of handlers observed running at once
    pub peak_active: usize,
}

#[derive(Debug, Default)]
struct PoolCounters {
    received: AtomicU64,
    completed: AtomicU64,
    failed: AtomicU64,
    panicked: AtomicU64,
    active: AtomicUsize,
    peak_active: AtomicUsize,
}

impl PoolCounters {
    fn snapshot(&self) -> WorkerPoolStats {
        WorkerPoolStats {
            received: self.received.load(Ordering::Relaxed),
            completed: self.completed.load(Ordering::Relaxed),
            failed: self.failed.load(Ordering::Relaxed),
            panicked: self.panicked.load(Ordering::Relaxed),
            active: self.active.load(Ordering::Relaxed),
            peak_active: self.peak_active.load(Ordering::Relaxed),
        }
    }

    fn enter(&self) {
        let active = self.active.fetch_add(1, Ordering::AcqRel) + 1;
        self.peak_active.fetch_max(active, Ordering::AcqRel);
    }

    fn leave(&self) {
        self.active.fetch_sub(1, Ordering::AcqRel);
    }
}

/// Worker pool for one subject, not yet started
pub struct WorkerPool {
    subject: String,
    concurrency: usize,
    transport: Arc<dyn Transport>,
    handler: Arc<dyn MessageHandler>,
}

impl WorkerPool {
    /// Create a pool with `concurrency` execution slots
    pub fn new(
        transport: Arc<dyn Transport>,
        subject: impl Into<String>,
        concurrency: usize,
        handler: Arc<dyn MessageHandler>,
    ) -> Result<Self> {
        let subject = subject.into();
        validate_pattern(&subject)?;
        if concurrency == 0 {
            return Err(BusError::registry(format!(
                "worker pool for {subject} needs at least one slot"
            )));
        }

        Ok(Self {
            subject,
            concurrency,
            transport,
            handler,
        })
    }

    /// Subject this pool consumes
    pub fn subject(&self) -> &str {
        &self.subject
    }

    /// A pool that has not been started is always idle
    pub fn state(&self) -> PoolState {
        PoolState::Idle
    }

    /// Subscribe and start dispatching until `cancel` fires
    pub async fn start(self, cancel: &CancellationToken) -> Result<WorkerPoolHandle> {
        let subscription = self.transport.subscribe(&self.subject).await?;
        let (state_tx, state_rx) = watch::channel(PoolState::Running);
        let counters = Arc::new(PoolCounters::default());
        let cancel = cancel.child_token();

        info!(subject = %self.subject, concurrency = self.concurrency, "Worker pool started");

        let subject = self.subject.clone();
        let dispatcher = Dispatcher {
            subject: self.subject,
            concurrency: self.concurrency,
            transport: self.transport,
            handler: self.handler,
            counters: counters.clone(),
            state_tx,
        };
        let task = tokio::spawn(dispatcher.run(subscription, cancel.clone()));

        Ok(WorkerPoolHandle {
            subject,
            state_rx,
            counters,
            cancel,
            task,
        })
    }
}

/// Handle on a running worker pool
pub struct WorkerPoolHandle {
    subject: String,
    state_rx: watch::Receiver<PoolState>,
    counters: Arc<PoolCounters>,
    cancel: CancellationToken,
    task: JoinHandle<()>,
}

impl WorkerPoolHandle {
    /// Subject this pool consumes
    pub fn subject(&self) -> &str {
        &self.subject
    }

    /// Current lifecycle state
    pub fn state(&self) -> PoolState {
        *self.state_rx.borrow()
    }

    /// Counter snapshot
    pub fn stats(&self) -> WorkerPoolStats {
        self.counters.snapshot()
    }

    /// Begin draining this pool
    pub fn stop(&self) {
        self.cancel.cancel();
    }

    /// Wait until the pool reached `Stopped`
    pub async fn wait_stopped(self) -> Result<()> {
        self.task
            .await
            .map_err(|e| BusError::shutdown(format!("worker pool {} failed: {e}", self.subject)))
    }
}

struct Dispatcher {
    subject: String,
    concurrency: usize,
    transport: Arc<dyn Transport>,
    handler: Arc<dyn MessageHandler>,
    counters: Arc<PoolCounters>,
    state_tx: watch::Sender<PoolState>,
}

impl Dispatcher {
    async fn run(self, mut subscription: Subscription, cancel: CancellationToken) {
        let slots = Arc::new(Semaphore::new(self.concurrency));

        loop {
            let permit = tokio::select! {
                biased;
                _ = cancel.cancelled() => break,
                permit = slots.clone().acquire_owned() => match permit {
                    Ok(permit) => permit,
                    Err(_) => break,
                },
            };

            let message = tokio::select! {
                biased;
                _ = cancel.cancelled() => break,
                message = subscription.recv() => match message {
                    Some(message) => message,
                    None => {
                        warn!(subject = %self.subject, "Subscription closed by transport");
                        break;
                    }
                },
            };

            self.counters.received.fetch_add(1, Ordering::Relaxed);
            self.spawn_handler(message, permit);
        }

        self.state_tx.send_replace(PoolState::Draining);
        debug!(subject = %self.subject, "Worker pool draining");

        // Every slot back means every in-flight handler has finished
        let all_slots = u32::try_from(self.concurrency).unwrap_or(u32::MAX);
        if let Err(e) = slots.acquire_many(all_slots).await {
            warn!(subject = %self.subject, error = %e, "Slot semaphore closed while draining");
        }

        if let Err(e) = self.transport.unsubscribe(subscription.id).await {
            warn!(subject = %self.subject, error = %e, "Failed to release subscription");
        }

        self.state_tx.send_replace(PoolState::Stopped);
        info!(subject = %self.subject, stats = ?self.counters.snapshot(), "Worker pool stopped");
    }

    fn spawn_handler(&self, message: Message, permit: OwnedSemaphorePermit) {
        let handler = self.handler.clone();
        let transport = self.transport.clone();
        let counters = self.counters.clone();
        let subject = self.subject.clone();

        tokio::spawn(async move {
            let _permit = permit;

            counters.enter();
            let outcome = AssertUnwindSafe(handler.handle(&message))
                .catch_unwind()
                .await;
            counters.leave();

            let reply = match outcome {
                Ok(Ok(payload)) => {
                    counters.completed.fetch_add(1, Ordering::Relaxed);
                    message.reply(payload.unwrap_or_default())
                }
                Ok(Err(e)) => {
                    counters.failed.fetch_add(1, Ordering::Relaxed);
                    warn!(%subject, code = %e.code, error = %e.message, "Handler failed");
                    message.error_reply(e.code, e.message)
                }
                Err(panic) => {
                    counters.panicked.fetch_add(1, Ordering::Relaxed);
                    let detail = panic_message(panic.as_ref());
                    error!(%subject, panic = %detail, "Handler panicked");
                    message.error_reply(ErrorCode::Internal, format!("handler panicked: {detail}"))
                }
            };

            if let Some(reply) = reply
                && let Err(e) = transport.publish(reply).await
            {
                warn!(%subject, error = %e, "Failed to publish reply");
            }
        });
    }
}

fn panic_message(panic: &(dyn Any + Send)) -> String {
    if let Some(s) = panic.downcast_ref::<&str>() {
        (*s).to_string()
    } else if let Some(s) = panic.downcast_ref::<String>() {
        s.clone()
    } else {
        "unknown panic payload".to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::broker::EmbeddedBroker;
    use crate::handler::handler_fn;
    use crate::subject::EXAMPLE_REQUEST;
    use std::time::Duration;

    #[test]
    fn test_zero_concurrency_rejected() {
        let broker: Arc<dyn Transport> = Arc::new(EmbeddedBroker::new());
        let handler = handler_fn(|_msg: Message| async move { Ok(None) });
        assert!(WorkerPool::new(broker, EXAMPLE_REQUEST, 0, handler).is_err());
    }

    #[tokio::test]
    async fn test_pool_lifecycle_states() {
        let broker: Arc<dyn Transport> = Arc::new(EmbeddedBroker::new());
        let handler = handler_fn(|_msg: Message| async move { Ok(None) });
        let cancel = CancellationToken::new();

        let pool = WorkerPool::new(broker, EXAMPLE_REQUEST, 2, handler).unwrap();
        let handle = pool.start(&cancel).await.unwrap();
        assert_eq!(handle.state(), PoolState::Running);

        cancel.cancel();
        let mut state_rx = handle.state_rx.clone();
        state_rx
            .wait_for(|s| *s == PoolState::Stopped)
            .await
            .unwrap();
        handle.wait_stopped().await.unwrap();
    }

    #[tokio::test]
    async fn test_fire_and_forget_messages_are_handled() {
        let broker: Arc<dyn Transport> = Arc::new(EmbeddedBroker::new());
        let seen = Arc::new(AtomicUsize::new(0));
        let counter = seen.clone();
        let handler = handler_fn(move |_msg: Message| {
            let counter = counter.clone();
            async move {
                counter.fetch_add(1, Ordering::SeqCst);
                Ok(None)
            }
        });
        let cancel = CancellationToken::new();
        let handle = WorkerPool::new(broker.clone(), EXAMPLE_REQUEST, 3, handler)
            .unwrap()
            .start(&cancel)
            .await
            .unwrap();

        for _ in 0..10 {
            broker
                .publish(Message::new(EXAMPLE_REQUEST, vec![]))
                .await
                .unwrap();
        }

        tokio::time::timeout(Duration::from_secs(2), async {
            while seen.load(Ordering::SeqCst) < 10 {
                tokio::time::sleep(Duration::from_millis(5)).await;
            }
        })
        .await
        .unwrap();

        assert_eq!(handle.stats().completed, 10);
        cancel.cancel();
        handle.wait_stopped().await.unwrap();
    }

    #[test]
    fn test_panic_message_extraction() {
        let payload: Box<dyn Any + Send> = Box::new("boom");
        assert_eq!(panic_message(payload.as_ref()), "boom");
        let payload: Box<dyn Any + Send> = Box::new(String::from("bang"));
        assert_eq!(panic_message(payload.as_ref()), "bang");
    }
}
