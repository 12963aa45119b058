//! Message bus: the single entry point services use for messaging

use crate::error::Result;
use crate::handler::MessageHandler;
use crate::message::{Message, decode, encode};
use crate::rpc::RpcCorrelator;
use crate::subject::validate_subject;
use crate::transport::Transport;
use crate::worker_pool::{WorkerPool, WorkerPoolHandle};
use serde::{Serialize, de::DeserializeOwned};
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

/// Publish/subscribe and request/reply over one transport
pub struct MessageBus {
    transport: Arc<dyn Transport>,
    correlator: RpcCorrelator,
}

impl MessageBus {
    /// Connect a bus to a transport; `rpc_timeout` is the default request timeout
    pub async fn new(transport: Arc<dyn Transport>, rpc_timeout: Duration) -> Result<Self> {
        let correlator = RpcCorrelator::new(transport.clone(), rpc_timeout).await?;
        info!(client_id = correlator.client_id(), "Message bus connected");
        Ok(Self {
            transport,
            correlator,
        })
    }

    /// Underlying transport
    pub fn transport(&self) -> &Arc<dyn Transport> {
        &self.transport
    }

    /// RPC correlator owned by this bus
    pub fn correlator(&self) -> &RpcCorrelator {
        &self.correlator
    }

    /// Default request timeout
    pub fn rpc_timeout(&self) -> Duration {
        self.correlator.default_timeout()
    }

    /// Publish a fire-and-forget payload
    pub async fn publish(&self, subject: &str, payload: Vec<u8>) -> Result<()> {
        validate_subject(subject)?;
        debug!(subject, size = payload.len(), "Publishing");
        self.transport.publish(Message::new(subject, payload)).await
    }

    /// Encode and publish a typed value
    pub async fn publish_typed<T: Serialize + ?Sized>(&self, subject: &str, value: &T) -> Result<()> {
        self.publish(subject, encode(value)?).await
    }

    /// Handle messages one at a time until `cancel` fires
    pub async fn subscribe(
        &self,
        subject: &str,
        handler: Arc<dyn MessageHandler>,
        cancel: &CancellationToken,
    ) -> Result<WorkerPoolHandle> {
        self.subscribe_workers(subject, 1, handler, cancel).await
    }

    /// Handle messages with up to `concurrency` handlers in flight
    pub async fn subscribe_workers(
        &self,
        subject: &str,
        concurrency: usize,
        handler: Arc<dyn MessageHandler>,
        cancel: &CancellationToken,
    ) -> Result<WorkerPoolHandle> {
        WorkerPool::new(self.transport.clone(), subject, concurrency, handler)?
            .start(cancel)
            .await
    }

    /// Send a request and wait for the reply payload
    pub async fn request(
        &self,
        subject: &str,
        payload: Vec<u8>,
        timeout: Duration,
        cancel: &CancellationToken,
    ) -> Result<Vec<u8>> {
        self.correlator.request(subject, payload, timeout, cancel).await
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
        let reply = self.request(subject, encode(request)?, timeout, cancel).await?;
        decode(&reply)
    }

    /// Shut down the correlator; the transport stays open for its other users
    pub async fn shutdown(&self) -> Result<()> {
        self.correlator.shutdown().await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::broker::EmbeddedBroker;
    use crate::error::{BusError, HandlerError};
    use crate::handler::typed_handler;
    use crate::subject::EXAMPLE_REQUEST;

    #[tokio::test]
    async fn test_typed_request_through_worker_pool() {
        let bus = MessageBus::new(Arc::new(EmbeddedBroker::new()), Duration::from_secs(1))
            .await
            .unwrap();
        let cancel = CancellationToken::new();
        let handler = typed_handler(|name: String| async move {
            Ok::<_, HandlerError>(format!("hello {name}"))
        });
        let pool = bus
            .subscribe_workers(EXAMPLE_REQUEST, 2, handler, &cancel)
            .await
            .unwrap();

        let reply: String = bus
            .request_typed(EXAMPLE_REQUEST, "bus", Duration::from_secs(1), &cancel)
            .await
            .unwrap();
        assert_eq!(reply, "hello bus");

        cancel.cancel();
        pool.wait_stopped().await.unwrap();
    }

    #[tokio::test]
    async fn test_publish_rejects_wildcard_subject() {
        let bus = MessageBus::new(Arc::new(EmbeddedBroker::new()), Duration::from_secs(1))
            .await
            .unwrap();
        let err = bus.publish("Condensat.*", vec![]).await.unwrap_err();
        assert!(matches!(err, BusError::InvalidSubject(_)));
    }
}
