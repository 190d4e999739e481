//! Consumer loop tests: concurrency bound, redelivery, reconnects and shutdown.

#![allow(clippy::unwrap_used, clippy::expect_used)]

use registration_core::error::RegistrationError;
use registration_core::request::{ChangeRequest, RegistrationAction};
use registration_core::store::RegistrationStore;
use registration_core::transport::TransportError;
use registration_core::types::EventId;
use registration_service::{RequestConsumer, RequestDispatcher};
use registration_testing::helpers::{assert_consistent, init_test_tracing};
use registration_testing::{AckOutcome, FlakyRegistrationStore, InMemoryRegistrationStore, InMemoryRequestSource};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::broadcast;

fn register(event_id: EventId, user: &str) -> ChangeRequest {
    ChangeRequest::new(event_id.to_string(), user, RegistrationAction::Register)
}

/// Poll `condition` until it holds or five seconds pass.
async fn wait_until(mut condition: impl FnMut() -> bool) {
    let deadline = tokio::time::Instant::now() + Duration::from_secs(5);
    while !condition() {
        assert!(
            tokio::time::Instant::now() < deadline,
            "condition not reached in time"
        );
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
}

fn start(
    source: &InMemoryRequestSource,
    store: Arc<dyn RegistrationStore>,
    max_in_flight: usize,
) -> (broadcast::Sender<()>, tokio::task::JoinHandle<()>) {
    let (shutdown_tx, shutdown_rx) = broadcast::channel(1);
    let handle = RequestConsumer::new(
        "test-consumer",
        Arc::new(source.clone()),
        RequestDispatcher::new(store),
        shutdown_rx,
    )
    .with_retry_delay(Duration::from_millis(10))
    .with_max_in_flight(max_in_flight)
    .spawn();
    (shutdown_tx, handle)
}

async fn stop(shutdown_tx: &broadcast::Sender<()>, handle: tokio::task::JoinHandle<()>) {
    shutdown_tx.send(()).unwrap();
    tokio::time::timeout(Duration::from_secs(5), handle)
        .await
        .expect("consumer should stop after shutdown")
        .expect("consumer task should not panic");
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn concurrent_requests_never_oversell() {
    init_test_tracing();
    let store = InMemoryRegistrationStore::new();
    let event_id = store.insert_event(5);
    let source = InMemoryRequestSource::new();
    for i in 0..30 {
        source.push(register(event_id, &format!("user-{i}")));
    }

    let (shutdown_tx, handle) = start(&source, Arc::new(store.clone()), 8);
    let log = source.ack_log();
    wait_until(|| log.acked() == 30).await;
    stop(&shutdown_tx, handle).await;

    assert_eq!(log.nacked(), 0);
    assert_eq!(assert_consistent(&store, event_id).await.registered_count, 5);
}

#[tokio::test]
async fn transient_failures_are_redelivered_until_applied() {
    let inner = InMemoryRegistrationStore::new();
    let event_id = inner.insert_event(3);
    let store = Arc::new(FlakyRegistrationStore::new(
        inner.clone(),
        RegistrationError::StorageError("deadlock detected".into()),
        2,
    ));
    let source = InMemoryRequestSource::new();
    let id = source.push(register(event_id, "alice"));

    let (shutdown_tx, handle) = start(&source, store.clone(), 1);
    let log = source.ack_log();
    wait_until(|| log.acked() == 1).await;
    stop(&shutdown_tx, handle).await;

    assert_eq!(
        log.entries(),
        vec![
            (id, AckOutcome::Nacked),
            (id, AckOutcome::Nacked),
            (id, AckOutcome::Acked),
        ]
    );
    assert_eq!(store.attempts(), 3);
    assert_eq!(assert_consistent(&inner, event_id).await.registered_count, 1);
}

#[tokio::test]
async fn permanent_failures_are_acked_once() {
    let store = InMemoryRegistrationStore::new();
    let source = InMemoryRequestSource::new();
    source.push(register(EventId::new(), "alice"));
    source.push_undecodable("truncated payload");

    let (shutdown_tx, handle) = start(&source, Arc::new(store), 4);
    let log = source.ack_log();
    wait_until(|| log.acked() == 2).await;
    stop(&shutdown_tx, handle).await;

    assert_eq!(log.nacked(), 0);
    assert_eq!(source.pending(), 0);
}

#[tokio::test]
async fn subscribe_failures_are_retried() {
    let store = InMemoryRegistrationStore::new();
    let event_id = store.insert_event(1);
    let source = InMemoryRequestSource::new();
    source.fail_next_subscribes(3);
    source.push(register(event_id, "alice"));

    let (shutdown_tx, handle) = start(&source, Arc::new(store.clone()), 1);
    let log = source.ack_log();
    wait_until(|| log.acked() == 1).await;
    stop(&shutdown_tx, handle).await;

    assert_eq!(source.subscriptions(), 1);
    assert_eq!(assert_consistent(&store, event_id).await.registered_count, 1);
}

#[tokio::test]
async fn stream_errors_do_not_stop_processing() {
    let store = InMemoryRegistrationStore::new();
    let event_id = store.insert_event(2);
    let source = InMemoryRequestSource::new();
    source.push(register(event_id, "alice"));
    source.push_stream_error(TransportError::Transport("broker went away".into()));
    source.push(register(event_id, "bob"));

    let (shutdown_tx, handle) = start(&source, Arc::new(store.clone()), 1);
    let log = source.ack_log();
    wait_until(|| log.acked() == 2).await;
    stop(&shutdown_tx, handle).await;

    assert_eq!(assert_consistent(&store, event_id).await.registered_count, 2);
}

#[tokio::test]
async fn ended_stream_triggers_resubscribe() {
    let store = InMemoryRegistrationStore::new();
    let event_id = store.insert_event(1);
    let source = InMemoryRequestSource::new();
    source.push(register(event_id, "alice"));
    source.close();

    let (shutdown_tx, handle) = start(&source, Arc::new(store), 1);
    let log = source.ack_log();
    wait_until(|| log.acked() == 1 && source.subscriptions() >= 2).await;
    stop(&shutdown_tx, handle).await;
}

#[tokio::test]
async fn idle_consumer_stops_on_shutdown() {
    let source = InMemoryRequestSource::new();
    let (shutdown_tx, handle) = start(&source, Arc::new(InMemoryRegistrationStore::new()), 4);

    wait_until(|| source.subscriptions() == 1).await;
    stop(&shutdown_tx, handle).await;
}

#[tokio::test]
async fn consumer_stops_when_shutdown_sender_is_dropped() {
    let source = InMemoryRequestSource::new();
    let (shutdown_tx, handle) = start(&source, Arc::new(InMemoryRegistrationStore::new()), 4);
    wait_until(|| source.subscriptions() == 1).await;

    drop(shutdown_tx);

    tokio::time::timeout(Duration::from_secs(5), handle)
        .await
        .expect("consumer should stop when the shutdown channel closes")
        .unwrap();
}
