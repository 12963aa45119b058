//! Message handler capability invoked by worker pools

use crate::error::HandlerError;
use crate::message::{Message, decode, encode};
use async_trait::async_trait;
use serde::{Serialize, de::DeserializeOwned};
use std::future::Future;
use std::marker::PhantomData;
use std::sync::Arc;

/// Outcome of one handler invocation: an optional reply payload or an error
/// that is turned into an error reply.
pub type HandlerResult = std::result::Result<Option<Vec<u8>>, HandlerError>;

/// Handler capability registered for a subject
#[async_trait]
pub trait MessageHandler: Send + Sync + 'static {
    /// Handle one inbound message
    async fn handle(&self, message: &Message) -> HandlerResult;
}

/// Handler backed by an async closure receiving the raw message
pub struct FnHandler<F> {
    func: F,
}

#[async_trait]
impl<F, Fut> MessageHandler for FnHandler<F>
where
    F: Fn(Message) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = HandlerResult> + Send + 'static,
{
    async fn handle(&self, message: &Message) -> HandlerResult {
        (self.func)(message.clone()).await
    }
}

/// Wrap an async closure into a shareable handler
pub fn handler_fn<F, Fut>(func: F) -> Arc<dyn MessageHandler>
where
    F: Fn(Message) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = HandlerResult> + Send + 'static,
{
    Arc::new(FnHandler { func })
}

/// Handler decoding a typed request and encoding a typed response
pub struct TypedHandler<Req, Resp, F> {
    func: F,
    _types: PhantomData<fn(Req) -> Resp>,
}

#[async_trait]
impl<Req, Resp, F, Fut> MessageHandler for TypedHandler<Req, Resp, F>
where
    Req: DeserializeOwned + Send + 'static,
    Resp: Serialize + Send + 'static,
    F: Fn(Req) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = std::result::Result<Resp, HandlerError>> + Send + 'static,
{
    async fn handle(&self, message: &Message) -> HandlerResult {
        let request: Req =
            decode(&message.payload).map_err(|e| HandlerError::decode(e.to_string()))?;
        let response = (self.func)(request).await?;
        let payload = encode(&response).map_err(|e| HandlerError::internal(e.to_string()))?;
        Ok(Some(payload))
    }
}

/// Wrap a typed async closure into a shareable handler
pub fn typed_handler<Req, Resp, F, Fut>(func: F) -> Arc<dyn MessageHandler>
where
    Req: DeserializeOwned + Send + 'static,
    Resp: Serialize + Send + 'static,
    F: Fn(Req) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = std::result::Result<Resp, HandlerError>> + Send + 'static,
{
    Arc::new(TypedHandler {
        func,
        _types: PhantomData,
    })
}
