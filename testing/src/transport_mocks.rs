//! In-memory transport doubles.
//!
//! [`InMemoryRequestSource`] is a queue-backed [`RequestSource`]. Every
//! delivery it hands out carries an acknowledger that records into an
//! [`AckLog`]; a nack puts the request back at the end of the queue, the way a
//! broker redelivers it.

use registration_core::request::ChangeRequest;
use registration_core::transport::{
    Acknowledger, Delivery, DeliveryStream, RequestSource, TransportError, TransportFuture,
};
use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use tokio::sync::Notify;

/// How a delivery was completed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AckOutcome {
    /// `ack` was called
    Acked,
    /// `nack` was called
    Nacked,
}

/// Shared record of every completed delivery, in completion order.
///
/// Entries are `(delivery_id, outcome)`. A redelivered request keeps its id.
#[derive(Debug, Clone, Default)]
pub struct AckLog {
    entries: Arc<Mutex<Vec<(u64, AckOutcome)>>>,
}

impl AckLog {
    /// Create an empty log.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    fn record(&self, id: u64, outcome: AckOutcome) {
        self.entries
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push((id, outcome));
    }

    /// All entries so far.
    #[must_use]
    pub fn entries(&self) -> Vec<(u64, AckOutcome)> {
        self.entries
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    /// Number of acks recorded.
    #[must_use]
    pub fn acked(&self) -> usize {
        self.count(AckOutcome::Acked)
    }

    /// Number of nacks recorded.
    #[must_use]
    pub fn nacked(&self) -> usize {
        self.count(AckOutcome::Nacked)
    }

    fn count(&self, outcome: AckOutcome) -> usize {
        self.entries
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .iter()
            .filter(|(_, o)| *o == outcome)
            .count()
    }
}

/// Acknowledger that records its outcome and optionally requeues on nack.
#[derive(Debug)]
pub struct RecordingAcknowledger {
    id: u64,
    log: AckLog,
    requeue: Option<(Arc<Inner>, Result<ChangeRequest, TransportError>)>,
}

impl RecordingAcknowledger {
    /// Standalone acknowledger that only records.
    #[must_use]
    pub const fn new(id: u64, log: AckLog) -> Self {
        Self {
            id,
            log,
            requeue: None,
        }
    }
}

impl Acknowledger for RecordingAcknowledger {
    fn ack(self: Box<Self>) -> TransportFuture<'static, ()> {
        self.log.record(self.id, AckOutcome::Acked);
        Box::pin(async { Ok(()) })
    }

    fn nack(self: Box<Self>) -> TransportFuture<'static, ()> {
        self.log.record(self.id, AckOutcome::Nacked);
        if let Some((inner, request)) = self.requeue {
            inner.push(QueueItem::Delivery { id: self.id, request });
        }
        Box::pin(async { Ok(()) })
    }
}

/// Build a single delivery whose completion is recorded in `log`.
#[must_use]
pub fn recorded_delivery(id: u64, request: Result<ChangeRequest, TransportError>, log: &AckLog) -> Delivery {
    Delivery::new(request, Box::new(RecordingAcknowledger::new(id, log.clone())))
}

#[derive(Debug)]
enum QueueItem {
    Delivery {
        id: u64,
        request: Result<ChangeRequest, TransportError>,
    },
    StreamError(TransportError),
}

#[derive(Debug, Default)]
struct Inner {
    queue: Mutex<VecDeque<QueueItem>>,
    notify: Notify,
    closed: AtomicBool,
    next_id: AtomicU64,
    subscribe_failures: AtomicUsize,
    subscriptions: AtomicUsize,
    log: AckLog,
}

impl Inner {
    fn push(&self, item: QueueItem) {
        self.queue
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push_back(item);
        self.notify.notify_one();
    }

    fn pop(&self) -> Option<QueueItem> {
        self.queue
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .pop_front()
    }
}

/// Queue-backed [`RequestSource`] for dispatcher and consumer tests.
///
/// Streams stay open until [`close`](Self::close) is called and the queue has
/// drained.
///
/// # Example
///
/// ```
/// use registration_core::request::{ChangeRequest, RegistrationAction};
/// use registration_core::transport::RequestSource;
/// use registration_testing::InMemoryRequestSource;
/// use futures::StreamExt;
///
/// # async fn example() -> Result<(), Box<dyn std::error::Error>> {
/// let source = InMemoryRequestSource::new();
/// source.push(ChangeRequest::new("not-a-uuid", "alice", RegistrationAction::Register));
/// source.close();
///
/// let mut deliveries = source.subscribe().await?;
/// let delivery = deliveries.next().await.unwrap()?;
/// delivery.ack().await?;
/// assert_eq!(source.ack_log().acked(), 1);
/// # Ok(())
/// # }
/// ```
#[derive(Debug, Clone, Default)]
pub struct InMemoryRequestSource {
    inner: Arc<Inner>,
}

impl InMemoryRequestSource {
    /// Create an empty, open source.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Enqueue a request. Returns the delivery id it will carry.
    pub fn push(&self, request: ChangeRequest) -> u64 {
        self.push_result(Ok(request))
    }

    /// Enqueue a delivery whose payload could not be decoded.
    pub fn push_undecodable(&self, reason: impl Into<String>) -> u64 {
        self.push_result(Err(TransportError::DeserializationFailed(reason.into())))
    }

    fn push_result(&self, request: Result<ChangeRequest, TransportError>) -> u64 {
        let id = self.inner.next_id.fetch_add(1, Ordering::SeqCst);
        self.inner.push(QueueItem::Delivery { id, request });
        id
    }

    /// Enqueue a stream-level error (not tied to any delivery).
    pub fn push_stream_error(&self, error: TransportError) {
        self.inner.push(QueueItem::StreamError(error));
    }

    /// Make the next `count` calls to `subscribe` fail.
    pub fn fail_next_subscribes(&self, count: usize) {
        self.inner.subscribe_failures.store(count, Ordering::SeqCst);
    }

    /// End open streams once the queue is empty.
    pub fn close(&self) {
        self.inner.closed.store(true, Ordering::SeqCst);
        self.inner.notify.notify_waiters();
        self.inner.notify.notify_one();
    }

    /// Successful subscriptions so far.
    #[must_use]
    pub fn subscriptions(&self) -> usize {
        self.inner.subscriptions.load(Ordering::SeqCst)
    }

    /// Requests still waiting to be delivered.
    #[must_use]
    pub fn pending(&self) -> usize {
        self.inner
            .queue
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .len()
    }

    /// Log of acks and nacks for deliveries from this source.
    #[must_use]
    pub fn ack_log(&self) -> AckLog {
        self.inner.log.clone()
    }
}

impl RequestSource for InMemoryRequestSource {
    fn subscribe(&self) -> TransportFuture<'_, DeliveryStream> {
        let inner = Arc::clone(&self.inner);
        Box::pin(async move {
            let failed = inner
                .subscribe_failures
                .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |left| left.checked_sub(1))
                .is_ok();
            if failed {
                return Err(TransportError::ConnectionFailed(
                    "in-memory source refused subscription".to_string(),
                ));
            }
            inner.subscriptions.fetch_add(1, Ordering::SeqCst);

            let stream = async_stream::stream! {
                loop {
                    match inner.pop() {
                        Some(QueueItem::Delivery { id, request }) => {
                            let acker = RecordingAcknowledger {
                                id,
                                log: inner.log.clone(),
                                requeue: Some((Arc::clone(&inner), request.clone())),
                            };
                            yield Ok(Delivery::new(request, Box::new(acker)));
                        },
                        Some(QueueItem::StreamError(error)) => yield Err(error),
                        None if inner.closed.load(Ordering::SeqCst) => break,
                        None => inner.notify.notified().await,
                    }
                }
            };

            Ok(Box::pin(stream) as DeliveryStream)
        })
    }
}
