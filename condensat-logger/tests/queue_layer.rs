//! Global subscriber forwarding service logs into the queue

#![allow(clippy::unwrap_used)]

use condensat_lib::config::LoggingConfig;
use condensat_lib::logging;
use condensat_lib::models::{LogEntry, LogLevel};
use condensat_logger::{LogQueue, MemoryLogQueue, QueueLayer, QueueLogger};
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;

#[tokio::test]
async fn test_installed_layer_respects_level_filter() {
    let queue = Arc::new(MemoryLogQueue::new());
    let logger = Arc::new(QueueLogger::new(queue.clone(), "wallet", "node-7"));
    let cancel = CancellationToken::new();
    let (layer, pusher) = QueueLayer::spawn(logger, 64, cancel.clone());

    let config = LoggingConfig {
        level: "info".to_owned(),
        format: "json".to_owned(),
        ..LoggingConfig::default()
    };
    logging::init_with_layer(&config, Some(layer)).unwrap();

    tracing::debug!(target: "wallet::sync", "filtered out");
    tracing::info!(target: "wallet::sync", height = 812_000, "block applied");
    tracing::error!(target: "wallet::sync", "peer lost");

    tokio::time::sleep(Duration::from_millis(50)).await;
    cancel.cancel();
    pusher.await.unwrap();

    let mut entries = Vec::new();
    while let Some(payload) = queue.reserve(Duration::ZERO).await.unwrap() {
        entries.push(serde_json::from_str::<LogEntry>(&payload).unwrap());
    }

    let levels: Vec<LogLevel> = entries.iter().map(|e| e.level).collect();
    assert_eq!(levels, vec![LogLevel::Info, LogLevel::Error]);
    assert_eq!(entries[0].producer, "wallet@node-7");
    assert_eq!(entries[0].fields.get("height").map(String::as_str), Some("812000"));
    assert!(entries[0].token < entries[1].token);
}
