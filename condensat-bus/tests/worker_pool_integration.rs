//! Integration tests for worker pool concurrency, isolation and draining

#![allow(clippy::unwrap_used)]

use condensat_bus::{
    BusError, CancellationToken, EmbeddedBroker, ErrorCode, HandlerRegistry, Message, MessageBus,
    PoolState, Transport, handler_fn, subject::EXAMPLE_REQUEST,
};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::time::Duration;

async fn wait_until(mut condition: impl FnMut() -> bool) {
    tokio::time::timeout(Duration::from_secs(5), async {
        while !condition() {
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
    })
    .await
    .unwrap();
}

#[tokio::test]
async fn test_backpressure_bounds_concurrency() {
    let broker = Arc::new(EmbeddedBroker::new());
    let bus = MessageBus::new(broker.clone(), Duration::from_secs(5))
        .await
        .unwrap();
    let cancel = CancellationToken::new();

    let current = Arc::new(AtomicUsize::new(0));
    let peak = Arc::new(AtomicUsize::new(0));
    let done = Arc::new(AtomicUsize::new(0));

    let handler = {
        let (current, peak, done) = (current.clone(), peak.clone(), done.clone());
        handler_fn(move |_msg: Message| {
            let (current, peak, done) = (current.clone(), peak.clone(), done.clone());
            async move {
                let now = current.fetch_add(1, Ordering::SeqCst) + 1;
                peak.fetch_max(now, Ordering::SeqCst);
                tokio::time::sleep(Duration::from_millis(5)).await;
                current.fetch_sub(1, Ordering::SeqCst);
                done.fetch_add(1, Ordering::SeqCst);
                Ok(None)
            }
        })
    };

    let pool = bus
        .subscribe_workers(EXAMPLE_REQUEST, 4, handler, &cancel)
        .await
        .unwrap();

    for i in 0..100u8 {
        broker
            .publish(Message::new(EXAMPLE_REQUEST, vec![i]))
            .await
            .unwrap();
    }

    wait_until(|| done.load(Ordering::SeqCst) == 100).await;

    assert!(peak.load(Ordering::SeqCst) <= 4);
    let stats = pool.stats();
    assert_eq!(stats.received, 100);
    assert_eq!(stats.completed, 100);
    assert!(stats.peak_active <= 4);

    cancel.cancel();
    pool.wait_stopped().await.unwrap();
}

#[tokio::test]
async fn test_panicking_handler_does_not_stop_pool() {
    let bus = MessageBus::new(Arc::new(EmbeddedBroker::new()), Duration::from_secs(5))
        .await
        .unwrap();
    let cancel = CancellationToken::new();

    let handler = handler_fn(|msg: Message| async move {
        if msg.payload.first() == Some(&0) {
            panic!("poison message");
        }
        Ok(Some(msg.payload))
    });
    let pool = bus
        .subscribe_workers(EXAMPLE_REQUEST, 2, handler, &cancel)
        .await
        .unwrap();

    let err = bus
        .request(EXAMPLE_REQUEST, vec![0], Duration::from_secs(1), &cancel)
        .await
        .unwrap_err();
    assert!(matches!(
        err,
        BusError::Remote {
            code: ErrorCode::Internal,
            ..
        }
    ));

    let reply = bus
        .request(EXAMPLE_REQUEST, vec![1], Duration::from_secs(1), &cancel)
        .await
        .unwrap();
    assert_eq!(reply, vec![1]);

    assert_eq!(pool.stats().panicked, 1);
    assert_eq!(pool.state(), PoolState::Running);
    cancel.cancel();
    pool.wait_stopped().await.unwrap();
}

#[tokio::test]
async fn test_drain_waits_for_in_flight_handler() {
    let broker = Arc::new(EmbeddedBroker::new());
    let bus = MessageBus::new(broker.clone(), Duration::from_secs(5))
        .await
        .unwrap();
    let cancel = CancellationToken::new();
    let finished = Arc::new(AtomicBool::new(false));

    let handler = {
        let finished = finished.clone();
        handler_fn(move |_msg: Message| {
            let finished = finished.clone();
            async move {
                tokio::time::sleep(Duration::from_millis(100)).await;
                finished.store(true, Ordering::SeqCst);
                Ok(None)
            }
        })
    };
    let pool = bus
        .subscribe_workers(EXAMPLE_REQUEST, 2, handler, &cancel)
        .await
        .unwrap();

    broker
        .publish(Message::new(EXAMPLE_REQUEST, vec![]))
        .await
        .unwrap();
    wait_until(|| pool.stats().active == 1).await;

    cancel.cancel();
    pool.wait_stopped().await.unwrap();

    assert!(finished.load(Ordering::SeqCst));
    assert_eq!(broker.statistics().await.active_subscriptions, 1); // correlator inbox only
}

#[tokio::test]
async fn test_registry_starts_and_stops_every_pool() {
    let broker = Arc::new(EmbeddedBroker::new());
    let bus = MessageBus::new(broker.clone(), Duration::from_secs(5))
        .await
        .unwrap();
    let cancel = CancellationToken::new();

    let mut registry = HandlerRegistry::new();
    registry
        .register(
            EXAMPLE_REQUEST,
            2,
            handler_fn(|msg: Message| async move { Ok(Some(msg.payload)) }),
        )
        .unwrap()
        .register(
            "Example.Other",
            1,
            handler_fn(|_msg: Message| async move { Ok(None) }),
        )
        .unwrap();
    registry
        .validate(&[EXAMPLE_REQUEST, "Example.Other"])
        .unwrap();

    let handle = registry.start(&bus, &cancel).await.unwrap();
    assert_eq!(handle.state(EXAMPLE_REQUEST), Some(PoolState::Running));

    let reply = bus
        .request(EXAMPLE_REQUEST, vec![3], Duration::from_secs(1), &cancel)
        .await
        .unwrap();
    assert_eq!(reply, vec![3]);
    assert_eq!(handle.stats(EXAMPLE_REQUEST).unwrap().completed, 1);

    cancel.cancel();
    handle.wait_stopped().await.unwrap();
    assert_eq!(broker.statistics().await.active_subscriptions, 1);
}
