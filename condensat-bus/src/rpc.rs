//! Request/reply correlation over a pub/sub transport
//!
//! Each [`RpcCorrelator`] owns one inbox subscription (`_INBOX.<client>.*`).
//! A request registers a pending record keyed by a fresh correlation id,
//! publishes with reply subject `_INBOX.<client>.<correlation>` and waits for
//! whichever comes first: the reply, the deadline, or cancellation. The
//! pending record is removed on every exit path, including when the caller
//! drops the request future.

use crate::error::{BusError, Result};
use crate::message::{Message, decode, encode};
use crate::subject::{inbox_pattern, inbox_subject, validate_subject};
use crate::transport::{Subscription, Transport};
use serde::{Serialize, de::DeserializeOwned};
use std::collections::HashMap;
use std::sync::{Arc, Mutex, PoisonError};
use std::time::{Duration, Instant};
use tokio::sync::oneshot;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};
use uuid::Uuid;

/// Default RPC timeout
pub const DEFAULT_RPC_TIMEOUT: Duration = Duration::from_secs(30);

/// Generate a correlation identifier
pub fn generate_correlation_id() -> String {
    Uuid::new_v4().to_string()
}

/// Outstanding request waiting for its reply
#[derive(Debug)]
struct PendingRequest {
    reply_tx: oneshot::Sender<Message>,
    subject: String,
    created_at: Instant,
    deadline: Instant,
}

/// Correlation id to pending request table
#[derive(Debug, Default)]
struct PendingRequests {
    inner: Mutex<HashMap<String, PendingRequest>>,
}

impl PendingRequests {
    fn lock(&self) -> std::sync::MutexGuard<'_, HashMap<String, PendingRequest>> {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn insert(&self, correlation_id: &str, request: PendingRequest) -> Result<()> {
        let mut pending = self.lock();
        if pending.contains_key(correlation_id) {
            return Err(BusError::registry(format!(
                "duplicate correlation id {correlation_id}"
            )));
        }
        pending.insert(correlation_id.to_string(), request);
        Ok(())
    }

    /// Route a reply to its waiter; false when the id is unknown
    fn complete(&self, correlation_id: &str, reply: Message) -> bool {
        let Some(request) = self.lock().remove(correlation_id) else {
            return false;
        };

        let latency = request.created_at.elapsed();
        if Instant::now() > request.deadline {
            debug!(correlation_id, subject = %request.subject, "Reply arrived after deadline");
        }
        if request.reply_tx.send(reply).is_err() {
            debug!(correlation_id, "Requester stopped waiting before reply");
        } else {
            debug!(correlation_id, latency_ms = latency.as_millis() as u64, "Reply routed");
        }
        true
    }

    fn remove(&self, correlation_id: &str) {
        self.lock().remove(correlation_id);
    }

    fn len(&self) -> usize {
        self.lock().len()
    }

    /// Drop every pending record, waking their waiters
    fn clear(&self) -> usize {
        let mut pending = self.lock();
        let count = pending.len();
        pending.clear();
        count
    }
}

/// Removes a pending record when the request leaves scope
struct PendingGuard {
    pending: Arc<PendingRequests>,
    correlation_id: String,
}

impl Drop for PendingGuard {
    fn drop(&mut self) {
        self.pending.remove(&self.correlation_id);
    }
}

/// Request/reply correlator bound to one transport
pub struct RpcCorrelator {
    client_id: String,
    transport: Arc<dyn Transport>,
    pending: Arc<PendingRequests>,
    inbox_id: Uuid,
    default_timeout: Duration,
    shutdown: CancellationToken,
    listener: Mutex<Option<JoinHandle<()>>>,
}

impl RpcCorrelator {
    /// Create a correlator with a random client id
    pub async fn new(transport: Arc<dyn Transport>, default_timeout: Duration) -> Result<Self> {
        Self::with_client_id(transport, Uuid::new_v4().simple().to_string(), default_timeout).await
    }

    /// Create a correlator with an explicit client id
    pub async fn with_client_id(
        transport: Arc<dyn Transport>,
        client_id: impl Into<String>,
        default_timeout: Duration,
    ) -> Result<Self> {
        let client_id = client_id.into();
        let subscription = transport.subscribe(&inbox_pattern(&client_id)).await?;
        let inbox_id = subscription.id;

        let pending = Arc::new(PendingRequests::default());
        let shutdown = CancellationToken::new();
        let listener = tokio::spawn(Self::route_replies(
            subscription,
            pending.clone(),
            shutdown.clone(),
        ));

        info!(%client_id, "RPC correlator started");
        Ok(Self {
            client_id,
            transport,
            pending,
            inbox_id,
            default_timeout,
            shutdown,
            listener: Mutex::new(Some(listener)),
        })
    }

    async fn route_replies(
        mut subscription: Subscription,
        pending: Arc<PendingRequests>,
        shutdown: CancellationToken,
    ) {
        loop {
            let message = tokio::select! {
                _ = shutdown.cancelled() => break,
                message = subscription.recv() => match message {
                    Some(message) => message,
                    None => {
                        debug!("Inbox subscription closed");
                        break;
                    }
                },
            };

            let Some(correlation_id) = message.correlation_id.clone() else {
                warn!(subject = %message.subject, "Dropping inbox message without correlation id");
                continue;
            };

            if !pending.complete(&correlation_id, message) {
                warn!(%correlation_id, "Dropping reply for unknown correlation id");
            }
        }
    }

    /// Client identifier used in inbox subjects
    pub fn client_id(&self) -> &str {
        &self.client_id
    }

    /// Default timeout applied by callers that do not pick one
    pub fn default_timeout(&self) -> Duration {
        self.default_timeout
    }

    /// Number of requests still waiting for a reply
    pub fn pending_count(&self) -> usize {
        self.pending.len()
    }

    /// Send a request and wait for its reply payload
    pub async fn request(
        &self,
        subject: &str,
        payload: Vec<u8>,
        timeout: Duration,
        cancel: &CancellationToken,
    ) -> Result<Vec<u8>> {
        if self.shutdown.is_cancelled() {
            return Err(BusError::shutdown("RPC correlator is shut down"));
        }
        validate_subject(subject)?;

        let correlation_id = generate_correlation_id();
        let reply_to = inbox_subject(&self.client_id, &correlation_id);
        let (reply_tx, reply_rx) = oneshot::channel();
        let created_at = Instant::now();

        self.pending.insert(
            &correlation_id,
            PendingRequest {
                reply_tx,
                subject: subject.to_string(),
                created_at,
                deadline: created_at + timeout,
            },
        )?;
        let _guard = PendingGuard {
            pending: self.pending.clone(),
            correlation_id: correlation_id.clone(),
        };

        self.transport
            .publish(Message::request(subject, &correlation_id, reply_to, payload))
            .await?;
        debug!(subject, %correlation_id, "Request published");

        let reply = tokio::select! {
            biased;
            _ = cancel.cancelled() => {
                return Err(BusError::cancelled(format!("request on {subject} cancelled")));
            }
            outcome = tokio::time::timeout(timeout, reply_rx) => match outcome {
                Ok(Ok(reply)) => reply,
                Ok(Err(_)) => {
                    return Err(BusError::cancelled("RPC correlator shut down"));
                }
                Err(_) => {
                    warn!(subject, %correlation_id, timeout_ms = timeout.as_millis() as u64, "Request timed out");
                    return Err(BusError::RequestTimeout {
                        subject: subject.to_string(),
                        timeout_ms: timeout.as_millis() as u64,
                    });
                }
            },
        };

        match reply.error {
            Some(error) => Err(BusError::Remote {
                code: error.code,
                message: error.message,
            }),
            None => Ok(reply.payload),
        }
    }

    /// Send a typed request and decode the typed reply
    pub async fn request_typed<Req, Resp>(
        &self,
        subject: &str,
        request: &Req,
        timeout: Duration,
        cancel: &CancellationToken,
    ) -> Result<Resp>
    where
        Req: Serialize + ?Sized,
        Resp: DeserializeOwned,
    {
        let payload = encode(request)?;
        let reply = self.request(subject, payload, timeout, cancel).await?;
        decode(&reply)
    }

    /// Fail every pending request and release the inbox subscription
    pub async fn shutdown(&self) -> Result<()> {
        if self.shutdown.is_cancelled() {
            return Ok(());
        }
        self.shutdown.cancel();

        let listener = self
            .listener
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take();
        if let Some(listener) = listener
            && let Err(e) = listener.await
        {
            warn!(error = %e, "Reply listener task failed");
        }

        let failed = self.pending.clear();
        self.transport.unsubscribe(self.inbox_id).await?;
        info!(client_id = %self.client_id, failed, "RPC correlator shut down");
        Ok(())
    }
}

impl Drop for RpcCorrelator {
    fn drop(&mut self) {
        self.shutdown.cancel();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::broker::EmbeddedBroker;
    use crate::error::ErrorCode;
    use crate::subject::EXAMPLE_REQUEST;

    async fn echo_responder(broker: Arc<EmbeddedBroker>) {
        let mut sub = broker.subscribe(EXAMPLE_REQUEST).await.unwrap();
        tokio::spawn(async move {
            while let Some(msg) = sub.recv().await {
                let reply = if msg.payload == b"fail" {
                    msg.error_reply(ErrorCode::InvalidRequest, "rejected")
                } else {
                    msg.reply(msg.payload.clone())
                };
                if let Some(reply) = reply {
                    broker.publish(reply).await.unwrap();
                }
            }
        });
    }

    #[tokio::test]
    async fn test_request_receives_reply() {
        let broker = Arc::new(EmbeddedBroker::new());
        echo_responder(broker.clone()).await;
        let rpc = RpcCorrelator::new(broker, DEFAULT_RPC_TIMEOUT).await.unwrap();

        let reply = rpc
            .request(
                EXAMPLE_REQUEST,
                b"ping".to_vec(),
                Duration::from_secs(1),
                &CancellationToken::new(),
            )
            .await
            .unwrap();
        assert_eq!(reply, b"ping");
        assert_eq!(rpc.pending_count(), 0);
    }

    #[tokio::test]
    async fn test_error_reply_surfaces_remote_code() {
        let broker = Arc::new(EmbeddedBroker::new());
        echo_responder(broker.clone()).await;
        let rpc = RpcCorrelator::new(broker, DEFAULT_RPC_TIMEOUT).await.unwrap();

        let err = rpc
            .request(
                EXAMPLE_REQUEST,
                b"fail".to_vec(),
                Duration::from_secs(1),
                &CancellationToken::new(),
            )
            .await
            .unwrap_err();
        assert!(matches!(
            err,
            BusError::Remote {
                code: ErrorCode::InvalidRequest,
                ..
            }
        ));
    }

    #[tokio::test]
    async fn test_cancelled_request_clears_pending() {
        let broker = Arc::new(EmbeddedBroker::new());
        let rpc = RpcCorrelator::new(broker, DEFAULT_RPC_TIMEOUT).await.unwrap();
        let cancel = CancellationToken::new();

        let canceller = cancel.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(20)).await;
            canceller.cancel();
        });

        let err = rpc
            .request(EXAMPLE_REQUEST, vec![], Duration::from_secs(10), &cancel)
            .await
            .unwrap_err();
        assert!(matches!(err, BusError::Cancelled(_)));
        assert_eq!(rpc.pending_count(), 0);
    }

    #[tokio::test]
    async fn test_publish_failure_clears_pending() {
        let broker = Arc::new(EmbeddedBroker::new());
        let rpc = RpcCorrelator::new(broker.clone(), DEFAULT_RPC_TIMEOUT)
            .await
            .unwrap();
        broker.close().await.unwrap();

        let err = rpc
            .request(
                EXAMPLE_REQUEST,
                vec![],
                Duration::from_secs(1),
                &CancellationToken::new(),
            )
            .await
            .unwrap_err();
        assert!(matches!(err, BusError::TransportUnavailable(_)));
        assert_eq!(rpc.pending_count(), 0);
    }

    #[tokio::test]
    async fn test_shutdown_rejects_new_requests() {
        let broker = Arc::new(EmbeddedBroker::new());
        let rpc = RpcCorrelator::new(broker.clone(), DEFAULT_RPC_TIMEOUT)
            .await
            .unwrap();
        rpc.shutdown().await.unwrap();

        let err = rpc
            .request(
                EXAMPLE_REQUEST,
                vec![],
                Duration::from_secs(1),
                &CancellationToken::new(),
            )
            .await
            .unwrap_err();
        assert!(matches!(err, BusError::Shutdown(_)));
        assert_eq!(broker.statistics().await.active_subscriptions, 0);
    }
}
