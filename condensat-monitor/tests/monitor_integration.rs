//! End-to-end monitor tests over the embedded broker

#![allow(clippy::unwrap_used, clippy::expect_used)]

use chrono::{DateTime, Duration as ChronoDuration, TimeZone, Utc};
use condensat_bus::{
    BusError, CancellationToken, EmbeddedBroker, ErrorCode, HandlerRegistry, MessageBus,
    RegistryHandle,
};
use condensat_lib::models::ProcessInfo;
use condensat_lib::storage::{RedbStorage, Storage, Tables};
use condensat_monitor::{Aggregator, AggregatorSettings, MonitorClient, MonitorError, handlers};
use std::sync::Arc;
use std::time::Duration;
use tempfile::TempDir;

struct Harness {
    client: MonitorClient,
    bus: Arc<MessageBus>,
    handle: RegistryHandle,
    cancel: CancellationToken,
}

impl Harness {
    async fn start(aggregator: Arc<Aggregator>) -> Self {
        let broker = Arc::new(EmbeddedBroker::new());
        let bus = Arc::new(MessageBus::new(broker, Duration::from_secs(5)).await.unwrap());
        let cancel = CancellationToken::new();

        let mut registry = HandlerRegistry::new();
        handlers::register(&mut registry, aggregator, 2).unwrap();
        let handle = registry.start(&bus, &cancel).await.unwrap();

        Self {
            client: MonitorClient::new(bus.clone()),
            bus,
            handle,
            cancel,
        }
    }

    async fn stop(self) {
        self.cancel.cancel();
        self.handle.wait_stopped().await.unwrap();
        self.bus.shutdown().await.unwrap();
    }
}

fn sample(app: &str, host: &str, timestamp: DateTime<Utc>, cpu: f64) -> ProcessInfo {
    let mut info = ProcessInfo::new(app, host, timestamp);
    info.cpu_usage = cpu;
    info
}

async fn wait_for_services(client: &MonitorClient, cancel: &CancellationToken, expected: usize) {
    let deadline = tokio::time::Instant::now() + Duration::from_secs(5);
    loop {
        let status = client.stack_list(Duration::from_secs(300), cancel).await.unwrap();
        if status.services.len() >= expected {
            return;
        }
        assert!(
            tokio::time::Instant::now() < deadline,
            "services were not ingested in time"
        );
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
}

#[tokio::test]
async fn test_stack_list_reports_latest_status() {
    let aggregator = Arc::new(Aggregator::new(AggregatorSettings::default()));
    let harness = Harness::start(aggregator.clone()).await;
    let cancel = CancellationToken::new();
    let now = Utc::now();

    harness
        .client
        .push_process_info(&sample("wallet", "node-1", now - ChronoDuration::seconds(20), 1.0))
        .await
        .unwrap();
    harness
        .client
        .push_process_info(&sample("wallet", "node-1", now - ChronoDuration::seconds(10), 2.0))
        .await
        .unwrap();
    harness
        .client
        .push_process_info(&sample("api", "node-2", now - ChronoDuration::seconds(5), 3.0))
        .await
        .unwrap();
    harness
        .client
        .push_process_info(&sample("stale", "node-3", now - ChronoDuration::hours(2), 4.0))
        .await
        .unwrap();

    wait_for_services(&harness.client, &cancel, 2).await;
    // The inbound pool runs two workers; wait until the newest wallet sample lands.
    let deadline = tokio::time::Instant::now() + Duration::from_secs(5);
    let status = loop {
        let status = harness
            .client
            .stack_list(Duration::from_secs(300), &cancel)
            .await
            .unwrap();
        if status.processes.iter().any(|p| p.app_name == "wallet" && p.cpu_usage == 2.0) {
            break status;
        }
        assert!(tokio::time::Instant::now() < deadline);
        tokio::time::sleep(Duration::from_millis(10)).await;
    };

    assert_eq!(status.services, vec!["api".to_owned(), "wallet".to_owned()]);
    assert_eq!(status.processes.len(), 2);
    assert_eq!(status.since, Duration::from_secs(300));
    assert!(!status.services.contains(&"stale".to_owned()));

    harness.stop().await;
}

#[tokio::test]
async fn test_stack_list_uses_server_default_window() {
    let settings = AggregatorSettings {
        since: Duration::from_secs(60),
        ..AggregatorSettings::default()
    };
    let aggregator = Arc::new(Aggregator::new(settings));
    aggregator
        .add_process_info(sample("wallet", "node-1", Utc::now(), 1.0))
        .await
        .unwrap();

    let harness = Harness::start(aggregator).await;
    let cancel = CancellationToken::new();
    let status = harness.client.stack_list(Duration::ZERO, &cancel).await.unwrap();
    assert_eq!(status.since, Duration::from_secs(60));
    assert_eq!(status.services, vec!["wallet".to_owned()]);

    harness.stop().await;
}

#[tokio::test]
async fn test_service_history_buckets() {
    let aggregator = Arc::new(Aggregator::new(AggregatorSettings::default()));
    let from = Utc.with_ymd_and_hms(2024, 1, 1, 0, 0, 0).unwrap();
    for (offset, cpu) in [(5, 1.0), (12, 2.0), (61, 3.0)] {
        aggregator
            .add_process_info(sample("wallet", "node-1", from + ChronoDuration::seconds(offset), cpu))
            .await
            .unwrap();
    }

    let harness = Harness::start(aggregator).await;
    let cancel = CancellationToken::new();
    let history = harness
        .client
        .service_history(
            "wallet",
            from,
            from + ChronoDuration::seconds(120),
            Duration::from_secs(60),
            Duration::from_secs(1),
            &cancel,
        )
        .await
        .unwrap();

    let offsets: Vec<i64> = history
        .history
        .iter()
        .map(|p| (p.timestamp - from).num_seconds())
        .collect();
    assert_eq!(offsets, vec![12, 61]);
    assert_eq!(history.app_name, "wallet");
    assert_eq!(history.step, Duration::from_secs(60));

    let unknown = harness
        .client
        .service_history(
            "missing",
            from,
            from + ChronoDuration::seconds(120),
            Duration::from_secs(60),
            Duration::from_secs(1),
            &cancel,
        )
        .await
        .unwrap();
    assert!(unknown.history.is_empty());

    harness.stop().await;
}

#[tokio::test]
async fn test_service_history_rejects_inverted_window() {
    let aggregator = Arc::new(Aggregator::new(AggregatorSettings::default()));
    let harness = Harness::start(aggregator).await;
    let cancel = CancellationToken::new();
    let to = Utc::now();

    let err = harness
        .client
        .service_history(
            "wallet",
            to + ChronoDuration::seconds(1),
            to,
            Duration::from_secs(60),
            Duration::from_secs(60),
            &cancel,
        )
        .await
        .unwrap_err();

    match err {
        MonitorError::Bus(BusError::Remote { code, .. }) => {
            assert_eq!(code, ErrorCode::InvalidRequest);
        }
        other => panic!("unexpected error: {other}"),
    }

    harness.stop().await;
}

#[tokio::test]
async fn test_service_history_rejects_fractional_step() {
    let aggregator = Arc::new(Aggregator::new(AggregatorSettings::default()));
    let harness = Harness::start(aggregator).await;
    let cancel = CancellationToken::new();
    let to = Utc::now();

    let err = harness
        .client
        .service_history(
            "wallet",
            to - ChronoDuration::seconds(60),
            to,
            Duration::from_millis(500),
            Duration::from_secs(1),
            &cancel,
        )
        .await
        .unwrap_err();
    assert!(matches!(err, MonitorError::InvalidRequest(_)));

    harness.stop().await;
}

#[tokio::test]
async fn test_history_survives_restart() {
    let dir = TempDir::new().unwrap();
    let path = dir.path().join("monitor.db");
    let from = Utc.with_ymd_and_hms(2024, 1, 1, 0, 0, 0).unwrap();

    {
        let storage = RedbStorage::open(&path).unwrap();
        storage.migrate(&Tables::all()).unwrap();
        let aggregator = Aggregator::with_storage(AggregatorSettings::default(), Arc::new(storage));
        for offset in [5, 12, 61] {
            aggregator
                .add_process_info(sample("wallet", "node-1", from + ChronoDuration::seconds(offset), 1.0))
                .await
                .unwrap();
        }
    }

    let storage = RedbStorage::open(&path).unwrap();
    storage.migrate(&Tables::all()).unwrap();
    let aggregator = Aggregator::with_storage(AggregatorSettings::default(), Arc::new(storage));
    assert_eq!(aggregator.restore().await.unwrap(), 3);
    assert_eq!(aggregator.services().await, vec!["wallet".to_owned()]);

    let history = aggregator
        .service_history(
            "wallet",
            from,
            from + ChronoDuration::seconds(120),
            Duration::from_secs(60),
            Duration::from_secs(1),
        )
        .await
        .unwrap();
    assert_eq!(history.history.len(), 2);
}

#[tokio::test]
async fn test_restore_deletes_samples_past_retention() {
    let dir = TempDir::new().unwrap();
    let path = dir.path().join("monitor.db");
    let from = Utc.with_ymd_and_hms(2024, 1, 1, 0, 0, 0).unwrap();

    {
        let storage = RedbStorage::open(&path).unwrap();
        storage.migrate(&Tables::all()).unwrap();
        let aggregator = Aggregator::with_storage(AggregatorSettings::default(), Arc::new(storage));
        for offset in [0, 600, 1200] {
            aggregator
                .add_process_info(sample("wallet", "node-1", from + ChronoDuration::seconds(offset), 1.0))
                .await
                .unwrap();
        }
    }

    // Restart with a retention shorter than the persisted history
    let storage = Arc::new(RedbStorage::open(&path).unwrap());
    storage.migrate(&Tables::all()).unwrap();
    let settings = AggregatorSettings {
        retention: Duration::from_secs(900),
        ..AggregatorSettings::default()
    };
    let aggregator = Aggregator::with_storage(settings, storage.clone());
    assert_eq!(aggregator.restore().await.unwrap(), 3);

    let rows = storage.query(Tables::PROCESS_INFO.name, "wallet/").unwrap();
    assert_eq!(rows.len(), 2);

    drop(aggregator);
    let aggregator = Aggregator::with_storage(settings, storage);
    assert_eq!(aggregator.restore().await.unwrap(), 2);
}
