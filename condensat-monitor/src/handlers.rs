//! Bus handlers for the monitor subjects

use crate::aggregator::Aggregator;
use async_trait::async_trait;
use chrono::Utc;
use condensat_bus::subject::monitor;
use condensat_bus::{
    BusError, HandlerError, HandlerRegistry, HandlerResult, Message, MessageHandler, encode,
};
use condensat_lib::models::{ProcessInfo, StackListRequest, StackServiceHistoryRequest};
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, warn};

fn decode_request<T: serde::de::DeserializeOwned>(message: &Message) -> Result<T, HandlerError> {
    message.decode_payload().map_err(|e| {
        warn!(subject = %message.subject, error = %e, "Failed to decode request");
        HandlerError::decode(e.to_string())
    })
}

fn encode_reply<T: serde::Serialize>(value: &T) -> HandlerResult {
    encode(value)
        .map(Some)
        .map_err(|e| HandlerError::internal(e.to_string()))
}

/// Ingests process-info samples published on the inbound subject
pub struct InboundHandler {
    aggregator: Arc<Aggregator>,
}

impl InboundHandler {
    pub fn new(aggregator: Arc<Aggregator>) -> Self {
        Self { aggregator }
    }
}

#[async_trait]
impl MessageHandler for InboundHandler {
    async fn handle(&self, message: &Message) -> HandlerResult {
        let info: ProcessInfo = decode_request(message)?;
        let (app_name, hostname) = (info.app_name.clone(), info.hostname.clone());

        if let Err(e) = self.aggregator.add_process_info(info).await {
            warn!(
                subject = %message.subject,
                app_name = %app_name,
                hostname = %hostname,
                error = %e,
                "Failed to add process info"
            );
            return Err(e.into());
        }

        debug!(app_name = %app_name, hostname = %hostname, "Process info added");
        Ok(None)
    }
}

/// Answers stack list queries
pub struct StackListHandler {
    aggregator: Arc<Aggregator>,
}

impl StackListHandler {
    pub fn new(aggregator: Arc<Aggregator>) -> Self {
        Self { aggregator }
    }
}

#[async_trait]
impl MessageHandler for StackListHandler {
    async fn handle(&self, message: &Message) -> HandlerResult {
        let request: StackListRequest = decode_request(message)?;
        let since = match request.since_secs {
            0 => self.aggregator.settings().since,
            secs => Duration::from_secs(secs),
        };

        let status = self.aggregator.last_services_status(Utc::now(), since).await;
        debug!(services = status.services.len(), "Stack list computed");
        encode_reply(&status)
    }
}

/// Answers service history queries
pub struct StackServiceHistoryHandler {
    aggregator: Arc<Aggregator>,
}

impl StackServiceHistoryHandler {
    pub fn new(aggregator: Arc<Aggregator>) -> Self {
        Self { aggregator }
    }
}

#[async_trait]
impl MessageHandler for StackServiceHistoryHandler {
    async fn handle(&self, message: &Message) -> HandlerResult {
        let request: StackServiceHistoryRequest = decode_request(message)?;
        let history = self
            .aggregator
            .service_history(
                &request.app_name,
                request.from,
                request.to,
                Duration::from_secs(request.step_secs),
                Duration::from_secs(request.round_secs),
            )
            .await?;
        encode_reply(&history)
    }
}

/// Register the three monitor handlers
pub fn register(
    registry: &mut HandlerRegistry,
    aggregator: Arc<Aggregator>,
    concurrency: usize,
) -> Result<(), BusError> {
    registry
        .register(
            monitor::INBOUND,
            concurrency,
            Arc::new(InboundHandler::new(aggregator.clone())),
        )?
        .register(
            monitor::STACK_LIST,
            concurrency,
            Arc::new(StackListHandler::new(aggregator.clone())),
        )?
        .register(
            monitor::STACK_SERVICE_HISTORY,
            concurrency,
            Arc::new(StackServiceHistoryHandler::new(aggregator)),
        )?;
    registry.validate(&monitor::all_subjects())
}
