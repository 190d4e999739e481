//! Integration tests for [`RedpandaRequestSource`] with a real Kafka-compatible broker.
//!
//! These tests use testcontainers to spin up a Kafka instance and validate:
//! - JSON change requests are decoded and delivered
//! - Undecodable payloads are delivered as deserialization failures
//! - `ack` commits the offset for the consumer group
//! - `nack` rewinds so the same request is delivered again, and requests
//!   buffered behind it are applied once
//! - a later `ack` never commits past an earlier unacknowledged request
//!
//! # Running These Tests
//!
//! These tests are marked as `#[ignore]` by default because they:
//! - Require Docker to be running (for testcontainers)
//! - Take 15-60 seconds per test to spin up Kafka
//!
//! To run explicitly:
//! ```bash
//! cargo test -p registration-redpanda --test integration_tests -- --ignored
//! ```

#![allow(clippy::expect_used)]
#![allow(clippy::panic)]

use futures::StreamExt;
use rdkafka::ClientConfig;
use rdkafka::producer::{FutureProducer, FutureRecord};
use rdkafka::util::Timeout;
use registration_core::error::RegistrationError;
use registration_core::request::{ChangeRequest, RegistrationAction};
use registration_core::store::RegistrationStore;
use registration_core::transport::{DeliveryStream, RequestSource, TransportError};
use registration_core::types::EventId;
use registration_redpanda::RedpandaRequestSource;
use registration_testing::helpers::assert_consistent;
use registration_testing::{FlakyRegistrationStore, InMemoryRegistrationStore};
use std::time::Duration;
use testcontainers::runners::AsyncRunner;
use testcontainers::{ContainerAsync, ImageExt};
use testcontainers_modules::kafka::{KAFKA_PORT, Kafka};

/// Start Kafka and return the container with its broker address.
async fn start_kafka() -> (ContainerAsync<Kafka>, String) {
    let kafka = Kafka::default()
        .with_env_var("KAFKA_AUTO_CREATE_TOPICS_ENABLE", "true")
        .start()
        .await
        .expect("Failed to start Kafka container");

    let host = kafka.get_host().await.expect("Failed to get host");
    let port = kafka
        .get_host_port_ipv4(KAFKA_PORT)
        .await
        .expect("Failed to get port");
    (kafka, format!("{host}:{port}"))
}

fn producer(brokers: &str) -> FutureProducer {
    ClientConfig::new()
        .set("bootstrap.servers", brokers)
        .set("message.timeout.ms", "5000")
        .create()
        .expect("Failed to create producer")
}

/// Publish a raw payload, retrying until the broker and topic are ready.
async fn publish_raw(producer: &FutureProducer, topic: &str, payload: &[u8]) {
    for attempt in 1..=60 {
        let record: FutureRecord<'_, str, [u8]> = FutureRecord::to(topic).payload(payload);
        if producer
            .send(record, Timeout::After(Duration::from_secs(5)))
            .await
            .is_ok()
        {
            return;
        }
        tokio::time::sleep(Duration::from_millis(500)).await;
        assert!(attempt != 60, "Failed to publish to {topic}");
    }
}

async fn publish_request(producer: &FutureProducer, topic: &str, request: &ChangeRequest) {
    let payload = serde_json::to_vec(request).expect("Failed to encode request");
    publish_raw(producer, topic, &payload).await;
}

fn source(brokers: &str, topic: &str, group: &str) -> RedpandaRequestSource {
    RedpandaRequestSource::builder()
        .brokers(brokers)
        .topic(topic)
        .consumer_group(group)
        .auto_offset_reset("earliest")
        .session_timeout_ms(6000)
        .build()
        .expect("Failed to build request source")
}

async fn next_delivery(
    stream: &mut DeliveryStream,
) -> registration_core::transport::Delivery {
    tokio::time::timeout(Duration::from_secs(30), stream.next())
        .await
        .expect("Timeout waiting for delivery")
        .expect("Stream ended unexpectedly")
        .expect("Transport error while receiving")
}

#[tokio::test]
#[ignore]
async fn test_requests_are_decoded_and_poison_payloads_flagged() {
    let (_kafka, brokers) = start_kafka().await;
    let producer = producer(&brokers);
    let topic = "registration-requests-decode";

    let request = ChangeRequest::new(EventId::new().to_string(), "alice", RegistrationAction::Register);
    publish_request(&producer, topic, &request).await;
    publish_raw(&producer, topic, b"definitely not json").await;

    let mut stream = source(&brokers, topic, "decode-group")
        .subscribe()
        .await
        .expect("Failed to subscribe");

    let first = next_delivery(&mut stream).await;
    assert_eq!(first.request.as_ref().expect("first should decode"), &request);
    first.ack().await.expect("Failed to ack");

    let second = next_delivery(&mut stream).await;
    assert!(matches!(
        second.request,
        Err(TransportError::DeserializationFailed(_))
    ));
    second.ack().await.expect("Failed to ack poison payload");
}

#[tokio::test]
#[ignore]
async fn test_nack_redelivers_same_request() {
    let (_kafka, brokers) = start_kafka().await;
    let producer = producer(&brokers);
    let topic = "registration-requests-nack";

    let request = ChangeRequest::new(EventId::new().to_string(), "bob", RegistrationAction::Unregister);
    publish_request(&producer, topic, &request).await;

    let mut stream = source(&brokers, topic, "nack-group")
        .subscribe()
        .await
        .expect("Failed to subscribe");

    let first = next_delivery(&mut stream).await;
    assert_eq!(first.request.as_ref().expect("should decode"), &request);
    first.nack().await.expect("Failed to nack");

    let redelivered = next_delivery(&mut stream).await;
    assert_eq!(redelivered.request.as_ref().expect("should decode"), &request);
    redelivered.ack().await.expect("Failed to ack");
}

#[tokio::test]
#[ignore]
async fn test_acked_requests_are_not_redelivered_to_group() {
    let (_kafka, brokers) = start_kafka().await;
    let producer = producer(&brokers);
    let topic = "registration-requests-ack";
    let group = "ack-group";

    let acked = ChangeRequest::new(EventId::new().to_string(), "carol", RegistrationAction::Register);
    publish_request(&producer, topic, &acked).await;

    {
        let mut stream = source(&brokers, topic, group)
            .subscribe()
            .await
            .expect("Failed to subscribe");
        let delivery = next_delivery(&mut stream).await;
        assert_eq!(delivery.request.as_ref().expect("should decode"), &acked);
        delivery.ack().await.expect("Failed to ack");
        // Let the async commit reach the broker before the consumer leaves.
        tokio::time::sleep(Duration::from_secs(2)).await;
    }

    let marker = ChangeRequest::new(EventId::new().to_string(), "dave", RegistrationAction::Register);
    publish_request(&producer, topic, &marker).await;

    let mut stream = source(&brokers, topic, group)
        .subscribe()
        .await
        .expect("Failed to resubscribe");
    let delivery = next_delivery(&mut stream).await;
    assert_eq!(
        delivery.request.as_ref().expect("should decode"),
        &marker,
        "Acked request must not be redelivered to the same group"
    );
}

#[tokio::test]
#[ignore]
async fn test_nack_discards_buffered_requests_so_each_applies_once() {
    let (_kafka, brokers) = start_kafka().await;
    let producer = producer(&brokers);
    let topic = "registration-requests-rewind";

    let inner = InMemoryRegistrationStore::new();
    let event_id = inner.insert_event(5);
    let store = FlakyRegistrationStore::new(
        inner.clone(),
        RegistrationError::StorageError("connection reset".into()),
        1,
    );

    let alice = ChangeRequest::new(event_id.to_string(), "alice", RegistrationAction::Register);
    let bob = ChangeRequest::new(event_id.to_string(), "bob", RegistrationAction::Register);
    publish_request(&producer, topic, &alice).await;
    publish_request(&producer, topic, &bob).await;

    let mut stream = source(&brokers, topic, "rewind-group")
        .subscribe()
        .await
        .expect("Failed to subscribe");

    let first = next_delivery(&mut stream).await;
    assert_eq!(first.request.as_ref().expect("should decode"), &alice);
    // Give the forwarding task time to buffer bob behind alice.
    tokio::time::sleep(Duration::from_secs(1)).await;

    let command = first.request.as_ref().expect("should decode").validate().expect("valid");
    assert!(store.execute(&command).await.is_err());
    first.nack().await.expect("Failed to nack");

    let mut applied = Vec::new();
    while applied.len() < 2 {
        let delivery = next_delivery(&mut stream).await;
        let request = delivery.request.as_ref().expect("should decode").clone();
        store
            .execute(&request.validate().expect("valid"))
            .await
            .expect("store should accept the request");
        delivery.ack().await.expect("Failed to ack");
        applied.push(request.user_id);
    }
    assert_eq!(applied, ["alice", "bob"]);

    let extra = tokio::time::timeout(Duration::from_secs(3), stream.next()).await;
    assert!(extra.is_err(), "No request may be delivered twice");

    let registrations = inner.list_registrations(event_id).await.expect("list");
    let bobs = registrations.iter().filter(|r| r.user_id.as_str() == "bob").count();
    assert_eq!(bobs, 1);
    assert_eq!(assert_consistent(&inner, event_id).await.registered_count, 2);
}

#[tokio::test]
#[ignore]
async fn test_later_ack_does_not_commit_past_unacked_request() {
    let (_kafka, brokers) = start_kafka().await;
    let producer = producer(&brokers);
    let topic = "registration-requests-watermark";
    let group = "watermark-group";

    let carol = ChangeRequest::new(EventId::new().to_string(), "carol", RegistrationAction::Register);
    let dave = ChangeRequest::new(EventId::new().to_string(), "dave", RegistrationAction::Register);
    publish_request(&producer, topic, &carol).await;
    publish_request(&producer, topic, &dave).await;

    {
        let mut stream = source(&brokers, topic, group)
            .subscribe()
            .await
            .expect("Failed to subscribe");
        let held = next_delivery(&mut stream).await;
        assert_eq!(held.request.as_ref().expect("should decode"), &carol);
        let later = next_delivery(&mut stream).await;
        assert_eq!(later.request.as_ref().expect("should decode"), &dave);

        later.ack().await.expect("Failed to ack");
        tokio::time::sleep(Duration::from_secs(2)).await;
        // `held` is dropped without an ack, as if the process died mid-request.
    }

    let mut stream = source(&brokers, topic, group)
        .subscribe()
        .await
        .expect("Failed to resubscribe");
    let delivery = next_delivery(&mut stream).await;
    assert_eq!(
        delivery.request.as_ref().expect("should decode"),
        &carol,
        "Unacknowledged request must be redelivered"
    );
}
