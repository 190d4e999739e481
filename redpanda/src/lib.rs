//! Redpanda request source for capacity-controlled event registration.
//!
//! This crate implements the [`RequestSource`] contract from `registration-core`
//! on top of rdkafka, so change requests can be consumed from Redpanda (or any
//! Kafka-compatible broker: Apache Kafka, AWS MSK, Azure Event Hubs).
//!
//! # Architecture
//!
//! ```text
//! ┌──────────────────┐
//! │ registration     │  JSON ChangeRequest per message
//! │ requests topic   │
//! └────────┬─────────┘
//!          │
//!          ▼
//! ┌──────────────────┐      ┌────────────────────┐
//! │  StreamConsumer  │─────►│  forwarding task   │  decode + attach acker
//! │ (manual commits) │      └─────────┬──────────┘
//! └────────▲─────────┘                │ bounded channel
//!          │                          ▼
//!          │                 ┌────────────────────┐
//!          └─── commit/seek ─│  Delivery stream   │──► dispatcher
//!                            └────────────────────┘
//! ```
//!
//! # Delivery Semantics
//!
//! **At-least-once** with manual offset commits:
//! - Nothing is committed when a message is read
//! - `ack` marks the message done; the partition commits up to the lowest
//!   offset that is not yet done, never past one still in flight
//! - `nack` rewinds the partition to the message's offset. Deliveries of that
//!   partition buffered after it are discarded, and their late acks ignored,
//!   since the seek fetches them again
//! - If the process crashes before `ack`, the message is redelivered after the
//!   consumer group rebalances
//!
//! Deliveries already being processed when an earlier offset of the same
//! partition is nacked are fetched again as well. Run one request at a time
//! per consumer to rule that out.
//!
//! Payloads that are missing or not valid JSON are still delivered (as
//! [`TransportError::DeserializationFailed`]) together with their acknowledger,
//! so the caller decides whether to drop them.
//!
//! # Example
//!
//! ```no_run
//! use registration_core::transport::RequestSource;
//! use registration_redpanda::RedpandaRequestSource;
//! use futures::StreamExt;
//!
//! # async fn example() -> Result<(), Box<dyn std::error::Error>> {
//! let source = RedpandaRequestSource::builder()
//!     .brokers("localhost:9092")
//!     .topic("registration-requests")
//!     .consumer_group("registration-service")
//!     .build()?;
//!
//! let mut deliveries = source.subscribe().await?;
//! while let Some(delivery) = deliveries.next().await {
//!     let delivery = delivery?;
//!     println!("Received: {:?}", delivery.request);
//!     delivery.ack().await?;
//! }
//! # Ok(())
//! # }
//! ```

#![forbid(unsafe_code)]
#![warn(missing_docs)]

use rdkafka::config::ClientConfig;
use rdkafka::consumer::{CommitMode, Consumer, StreamConsumer};
use rdkafka::message::Message;
use rdkafka::{Offset, TopicPartitionList};
use registration_core::request::ChangeRequest;
use registration_core::transport::{
    Acknowledger, Delivery, DeliveryStream, RequestSource, TransportError, TransportFuture,
};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;
use tokio::sync::mpsc;

mod offsets;

use offsets::{OffsetTracker, Position, Rewind};

const DEFAULT_BUFFER_SIZE: usize = 1000;
const DEFAULT_SESSION_TIMEOUT_MS: u32 = 45_000;
const DEFAULT_AUTO_OFFSET_RESET: &str = "earliest";
const SEEK_TIMEOUT: Duration = Duration::from_secs(5);

/// Redpanda-backed [`RequestSource`].
///
/// Each call to [`subscribe`](RequestSource::subscribe) creates a fresh
/// consumer in the configured group. Building the source does not contact the
/// brokers.
pub struct RedpandaRequestSource {
    brokers: String,
    topics: Vec<String>,
    consumer_group: String,
    auto_offset_reset: String,
    session_timeout_ms: u32,
    buffer_size: usize,
    client_options: Vec<(String, String)>,
}

impl RedpandaRequestSource {
    /// Create a builder for configuring the source.
    #[must_use]
    pub fn builder() -> RedpandaRequestSourceBuilder {
        RedpandaRequestSourceBuilder::default()
    }

    /// Broker addresses.
    #[must_use]
    pub fn brokers(&self) -> &str {
        &self.brokers
    }

    /// Subscribed topics.
    #[must_use]
    pub fn topics(&self) -> &[String] {
        &self.topics
    }

    /// Consumer group the source joins.
    #[must_use]
    pub fn consumer_group(&self) -> &str {
        &self.consumer_group
    }

    fn client_config(&self) -> ClientConfig {
        let mut config = ClientConfig::new();
        config
            .set("bootstrap.servers", &self.brokers)
            .set("group.id", &self.consumer_group)
            .set("enable.auto.commit", "false")
            .set("auto.offset.reset", &self.auto_offset_reset)
            .set("session.timeout.ms", self.session_timeout_ms.to_string())
            .set("enable.partition.eof", "false");
        for (key, value) in &self.client_options {
            config.set(key, value);
        }
        config
    }
}

/// Builder for [`RedpandaRequestSource`].
///
/// # Example
///
/// ```no_run
/// use registration_redpanda::RedpandaRequestSource;
///
/// # fn example() -> Result<(), Box<dyn std::error::Error>> {
/// let source = RedpandaRequestSource::builder()
///     .brokers("broker-1:9092,broker-2:9092")
///     .topic("registration-requests")
///     .consumer_group("registration-service")
///     .auto_offset_reset("latest")
///     .security_protocol("SASL_SSL")
///     .sasl("SCRAM-SHA-256", "svc-registration", "secret")
///     .build()?;
/// # Ok(())
/// # }
/// ```
#[derive(Default)]
pub struct RedpandaRequestSourceBuilder {
    brokers: Option<String>,
    topics: Vec<String>,
    consumer_group: Option<String>,
    auto_offset_reset: Option<String>,
    session_timeout_ms: Option<u32>,
    buffer_size: Option<usize>,
    client_options: Vec<(String, String)>,
}

impl RedpandaRequestSourceBuilder {
    /// Set the broker addresses (comma-separated, e.g. `"localhost:9092"`).
    #[must_use]
    pub fn brokers(mut self, brokers: impl Into<String>) -> Self {
        self.brokers = Some(brokers.into());
        self
    }

    /// Add a topic to consume change requests from.
    #[must_use]
    pub fn topic(mut self, topic: impl Into<String>) -> Self {
        self.topics.push(topic.into());
        self
    }

    /// Set the consumer group.
    ///
    /// Instances sharing a group split the topic's partitions between them. If
    /// unset, the group is derived from the sorted topic names.
    #[must_use]
    pub fn consumer_group(mut self, consumer_group: impl Into<String>) -> Self {
        self.consumer_group = Some(consumer_group.into());
        self
    }

    /// Where a new consumer group starts reading: `"earliest"` (default),
    /// `"latest"` or `"error"`.
    #[must_use]
    pub fn auto_offset_reset(mut self, policy: impl Into<String>) -> Self {
        self.auto_offset_reset = Some(policy.into());
        self
    }

    /// Group session timeout in milliseconds (default: 45000).
    #[must_use]
    pub const fn session_timeout_ms(mut self, timeout_ms: u32) -> Self {
        self.session_timeout_ms = Some(timeout_ms);
        self
    }

    /// Number of decoded deliveries buffered ahead of the caller (default: 1000).
    ///
    /// A value of 0 is treated as 1.
    #[must_use]
    pub fn buffer_size(mut self, buffer_size: usize) -> Self {
        self.buffer_size = Some(buffer_size.max(1));
        self
    }

    /// Set `security.protocol` (`"plaintext"`, `"ssl"`, `"sasl_plaintext"`, `"sasl_ssl"`).
    #[must_use]
    pub fn security_protocol(self, protocol: impl Into<String>) -> Self {
        self.client_option("security.protocol", protocol)
    }

    /// Set SASL mechanism and credentials.
    #[must_use]
    pub fn sasl(
        self,
        mechanism: impl Into<String>,
        username: impl Into<String>,
        password: impl Into<String>,
    ) -> Self {
        self.client_option("sasl.mechanism", mechanism)
            .client_option("sasl.username", username)
            .client_option("sasl.password", password)
    }

    /// Pass an arbitrary librdkafka consumer property through.
    #[must_use]
    pub fn client_option(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.client_options.push((key.into(), value.into()));
        self
    }

    /// Build the [`RedpandaRequestSource`].
    ///
    /// # Errors
    ///
    /// - [`TransportError::ConnectionFailed`] if no brokers are configured
    /// - [`TransportError::SubscriptionFailed`] if no topic is configured
    pub fn build(self) -> Result<RedpandaRequestSource, TransportError> {
        let brokers = self
            .brokers
            .filter(|brokers| !brokers.trim().is_empty())
            .ok_or_else(|| TransportError::ConnectionFailed("Brokers not configured".to_string()))?;

        if self.topics.is_empty() {
            return Err(TransportError::SubscriptionFailed {
                topics: Vec::new(),
                reason: "No topics configured".to_string(),
            });
        }

        let consumer_group = self.consumer_group.unwrap_or_else(|| {
            let mut sorted = self.topics.clone();
            sorted.sort();
            format!("registration-{}", sorted.join("-"))
        });

        let source = RedpandaRequestSource {
            brokers,
            topics: self.topics,
            consumer_group,
            auto_offset_reset: self
                .auto_offset_reset
                .unwrap_or_else(|| DEFAULT_AUTO_OFFSET_RESET.to_string()),
            session_timeout_ms: self.session_timeout_ms.unwrap_or(DEFAULT_SESSION_TIMEOUT_MS),
            buffer_size: self.buffer_size.unwrap_or(DEFAULT_BUFFER_SIZE),
            client_options: self.client_options,
        };

        tracing::info!(
            brokers = %source.brokers,
            topics = ?source.topics,
            consumer_group = %source.consumer_group,
            auto_offset_reset = %source.auto_offset_reset,
            buffer_size = source.buffer_size,
            "RedpandaRequestSource configured"
        );

        Ok(source)
    }
}

/// Decode a message payload into a [`ChangeRequest`].
fn decode_payload(payload: Option<&[u8]>) -> Result<ChangeRequest, TransportError> {
    let payload = payload
        .ok_or_else(|| TransportError::DeserializationFailed("Message has no payload".to_string()))?;

    serde_json::from_slice(payload).map_err(|e| {
        TransportError::DeserializationFailed(format!("Failed to decode change request: {e}"))
    })
}

type SharedTracker = Arc<Mutex<OffsetTracker>>;

fn lock(tracker: &SharedTracker) -> MutexGuard<'_, OffsetTracker> {
    tracker.lock().unwrap_or_else(PoisonError::into_inner)
}

/// Commits or rewinds one message's position.
///
/// Acks go through the subscription's [`OffsetTracker`], so a commit never
/// passes an offset that is still in flight or waiting for redelivery. Nacks
/// only record the rewind; the forwarding task performs the seek.
struct OffsetAcknowledger {
    consumer: Arc<StreamConsumer>,
    tracker: SharedTracker,
    rewinds: mpsc::UnboundedSender<Rewind>,
    position: Position,
}

impl Acknowledger for OffsetAcknowledger {
    fn ack(self: Box<Self>) -> TransportFuture<'static, ()> {
        Box::pin(async move {
            let position = &self.position;
            let completed = lock(&self.tracker).complete(position);
            let Some(next) = completed else {
                tracing::trace!(
                    topic = %position.topic,
                    partition = position.partition,
                    offset = position.offset,
                    "Ack recorded, commit position unchanged"
                );
                return Ok(());
            };

            let mut positions = TopicPartitionList::new();
            positions
                .add_partition_offset(&position.topic, position.partition, Offset::Offset(next))
                .map_err(|e| TransportError::AcknowledgeFailed(e.to_string()))?;

            self.consumer
                .commit(&positions, CommitMode::Async)
                .map_err(|e| {
                    tracing::warn!(
                        topic = %position.topic,
                        partition = position.partition,
                        offset = next,
                        error = %e,
                        "Failed to commit offset (message may be redelivered)"
                    );
                    TransportError::AcknowledgeFailed(e.to_string())
                })
        })
    }

    fn nack(self: Box<Self>) -> TransportFuture<'static, ()> {
        Box::pin(async move {
            let rewound = lock(&self.tracker).rewind(&self.position);
            let Some(rewind) = rewound else {
                tracing::debug!(
                    topic = %self.position.topic,
                    partition = self.position.partition,
                    offset = self.position.offset,
                    "Nack for a delivery already covered by an earlier rewind"
                );
                return Ok(());
            };

            self.rewinds.send(rewind).map_err(|_| {
                tracing::warn!(
                    topic = %self.position.topic,
                    partition = self.position.partition,
                    offset = self.position.offset,
                    "Consumer task gone, message will be redelivered after rebalance"
                );
                TransportError::AcknowledgeFailed("Consumer task is not running".to_string())
            })
        })
    }
}

/// Seek the partition back and tell the tracker the rewind took effect.
///
/// The seek blocks inside librdkafka, so it runs on the blocking pool.
async fn perform_rewind(consumer: &Arc<StreamConsumer>, tracker: &SharedTracker, rewind: Rewind) {
    let seek_consumer = Arc::clone(consumer);
    let target = rewind.clone();
    let result = tokio::task::spawn_blocking(move || {
        seek_consumer
            .seek(&target.topic, target.partition, Offset::Offset(target.offset), SEEK_TIMEOUT)
            .map_err(|e| e.to_string())
    })
    .await
    .unwrap_or_else(|e| Err(e.to_string()));

    match &result {
        Ok(()) => tracing::debug!(
            topic = %rewind.topic,
            partition = rewind.partition,
            offset = rewind.offset,
            "Rewound partition for redelivery"
        ),
        Err(e) => tracing::error!(
            topic = %rewind.topic,
            partition = rewind.partition,
            offset = rewind.offset,
            error = %e,
            "Failed to rewind partition; commits held below the nacked offset"
        ),
    }

    lock(tracker).rewound(&rewind, result.is_ok());
}

impl RequestSource for RedpandaRequestSource {
    fn subscribe(&self) -> TransportFuture<'_, DeliveryStream> {
        Box::pin(async move {
            let topics = self.topics.clone();
            let consumer: StreamConsumer =
                self.client_config()
                    .create()
                    .map_err(|e| TransportError::SubscriptionFailed {
                        topics: topics.clone(),
                        reason: format!("Failed to create consumer: {e}"),
                    })?;

            let topic_refs: Vec<&str> = topics.iter().map(String::as_str).collect();
            consumer
                .subscribe(&topic_refs)
                .map_err(|e| TransportError::SubscriptionFailed {
                    topics: topics.clone(),
                    reason: format!("Failed to subscribe to topics: {e}"),
                })?;

            tracing::info!(
                topics = ?topics,
                consumer_group = %self.consumer_group,
                manual_commit = true,
                "Subscribed to registration requests"
            );

            let consumer = Arc::new(consumer);
            let tracker = SharedTracker::default();
            let (tx, rx) = mpsc::channel::<Result<(Position, Delivery), TransportError>>(self.buffer_size);
            let (rewind_tx, mut rewind_rx) = mpsc::unbounded_channel::<Rewind>();

            // The task owns a consumer handle and performs every seek; ackers
            // hold the others.
            let task_tracker = Arc::clone(&tracker);
            tokio::spawn(async move {
                use futures::StreamExt;

                let tracker = task_tracker;
                let mut messages = consumer.stream();

                loop {
                    let result = tokio::select! {
                        biased;
                        () = tx.closed() => {
                            tracing::debug!("Delivery receiver dropped, exiting consumer task");
                            break;
                        }
                        Some(rewind) = rewind_rx.recv() => {
                            perform_rewind(&consumer, &tracker, rewind).await;
                            continue;
                        }
                        next = messages.next() => match next {
                            Some(result) => result,
                            None => break,
                        },
                    };

                    let item = match result {
                        Ok(message) => {
                            let tracked =
                                lock(&tracker).track(message.topic(), message.partition(), message.offset());
                            let Some(position) = tracked else {
                                tracing::trace!(
                                    topic = message.topic(),
                                    partition = message.partition(),
                                    offset = message.offset(),
                                    "Dropped message read ahead of a pending rewind"
                                );
                                continue;
                            };
                            let request = decode_payload(message.payload());
                            tracing::trace!(
                                topic = message.topic(),
                                partition = message.partition(),
                                offset = message.offset(),
                                decoded = request.is_ok(),
                                "Received change request"
                            );
                            let acker = OffsetAcknowledger {
                                consumer: Arc::clone(&consumer),
                                tracker: Arc::clone(&tracker),
                                rewinds: rewind_tx.clone(),
                                position: position.clone(),
                            };
                            Ok((position, Delivery::new(request, Box::new(acker))))
                        },
                        Err(e) => Err(TransportError::Transport(format!(
                            "Failed to receive message: {e}"
                        ))),
                    };

                    if tx.send(item).await.is_err() {
                        tracing::debug!("Delivery receiver dropped, exiting consumer task");
                        break;
                    }
                }

                tracing::debug!("Consumer task exiting");
            });

            // Deliveries buffered before a rewind of their partition are
            // dropped here; the seek fetches them again.
            let stream = async_stream::stream! {
                let mut rx = rx;
                while let Some(item) = rx.recv().await {
                    match item {
                        Ok((position, delivery)) => {
                            let current = lock(&tracker).is_current(&position);
                            if current {
                                yield Ok(delivery);
                            } else {
                                tracing::trace!(
                                    topic = %position.topic,
                                    partition = position.partition,
                                    offset = position.offset,
                                    "Dropped buffered delivery superseded by a rewind"
                                );
                            }
                        }
                        Err(e) => yield Err(e),
                    }
                }
            };

            Ok(Box::pin(stream) as DeliveryStream)
        })
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)] // Test code can use unwrap/expect
mod tests {
    use super::*;

    #[test]
    fn redpanda_request_source_is_send_sync() {
        fn assert_send<T: Send>() {}
        fn assert_sync<T: Sync>() {}

        assert_send::<RedpandaRequestSource>();
        assert_sync::<RedpandaRequestSource>();
        assert_send::<OffsetAcknowledger>();
    }

    #[test]
    fn build_requires_brokers() {
        let result = RedpandaRequestSource::builder().topic("requests").build();
        assert!(matches!(result, Err(TransportError::ConnectionFailed(_))));
    }

    #[test]
    fn build_requires_a_topic() {
        let result = RedpandaRequestSource::builder().brokers("localhost:9092").build();
        assert!(matches!(result, Err(TransportError::SubscriptionFailed { .. })));
    }

    #[test]
    fn consumer_group_defaults_to_sorted_topics() {
        let source = RedpandaRequestSource::builder()
            .brokers("localhost:9092")
            .topic("b-requests")
            .topic("a-requests")
            .build()
            .unwrap();

        assert_eq!(source.consumer_group(), "registration-a-requests-b-requests");
        assert_eq!(source.topics(), ["b-requests", "a-requests"]);
    }

    #[test]
    fn client_config_disables_auto_commit_and_keeps_extra_options() {
        let source = RedpandaRequestSource::builder()
            .brokers("localhost:9092")
            .topic("requests")
            .consumer_group("svc")
            .security_protocol("sasl_ssl")
            .build()
            .unwrap();

        let config = source.client_config();
        assert_eq!(config.get("enable.auto.commit"), Some("false"));
        assert_eq!(config.get("group.id"), Some("svc"));
        assert_eq!(config.get("auto.offset.reset"), Some("earliest"));
        assert_eq!(config.get("session.timeout.ms"), Some("45000"));
        assert_eq!(config.get("security.protocol"), Some("sasl_ssl"));
    }

    #[test]
    fn decodes_json_change_request() {
        let payload = br#"{"eventId":"1c5f1a36-5d0e-4a49-9d4a-3f6f7c1e2b10","userId":"alice","action":"Register"}"#;
        let request = tokio_test::assert_ok!(decode_payload(Some(payload)));

        assert_eq!(request.user_id, "alice");
        assert_eq!(request.action, "Register");
    }

    #[test]
    fn missing_payload_is_a_deserialization_failure() {
        assert!(matches!(
            decode_payload(None),
            Err(TransportError::DeserializationFailed(_))
        ));
    }

    #[test]
    fn garbage_payload_is_a_deserialization_failure() {
        assert!(matches!(
            decode_payload(Some(b"\x00\x01not json")),
            Err(TransportError::DeserializationFailed(_))
        ));
    }
}
