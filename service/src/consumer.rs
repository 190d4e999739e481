//! Request consumer with automatic reconnection and bounded concurrency.
//!
//! `RequestConsumer` owns the subscribe-process-reconnect loop:
//!
//! ```text
//! loop {
//!     subscribe (or wait retry_delay and try again)
//!     for each delivery:
//!         wait for a free slot (at most max_in_flight in progress)
//!         spawn dispatcher.dispatch(delivery)
//!     stream ended or failed: wait retry_delay, resubscribe
//! }
//! on shutdown: stop reading, let in-flight dispatches finish
//! ```
//!
//! Undelivered or unacknowledged requests are left to the transport's
//! redelivery policy, so a reconnect never loses work.

use crate::dispatcher::RequestDispatcher;
use futures::StreamExt;
use registration_core::transport::{DeliveryStream, RequestSource};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{Semaphore, broadcast};
use tokio::task::JoinSet;
use tracing::{error, info, warn};

/// Why processing of one subscription stopped.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum StreamEnd {
    /// The stream ended; resubscribe
    Ended,
    /// Shutdown was requested
    Shutdown,
}

/// Consumes change requests from a [`RequestSource`] and dispatches them.
///
/// # Lifecycle
///
/// 1. Created via [`RequestConsumer::new`]
/// 2. Started with [`spawn`](Self::spawn) (or awaited directly with [`run`](Self::run))
/// 3. Runs until the shutdown channel fires or its sender is dropped, then
///    waits for in-flight requests before returning
pub struct RequestConsumer {
    name: String,
    source: Arc<dyn RequestSource>,
    dispatcher: RequestDispatcher,
    shutdown: broadcast::Receiver<()>,
    retry_delay: Duration,
    max_in_flight: usize,
}

impl RequestConsumer {
    /// Create a consumer with a 5 second retry delay and 32 requests in flight.
    #[must_use]
    pub fn new(
        name: impl Into<String>,
        source: Arc<dyn RequestSource>,
        dispatcher: RequestDispatcher,
        shutdown: broadcast::Receiver<()>,
    ) -> Self {
        Self {
            name: name.into(),
            source,
            dispatcher,
            shutdown,
            retry_delay: Duration::from_secs(5),
            max_in_flight: 32,
        }
    }

    /// Set the delay before resubscribing after a failure.
    #[must_use]
    pub const fn with_retry_delay(mut self, delay: Duration) -> Self {
        self.retry_delay = delay;
        self
    }

    /// Set the maximum number of requests processed at once (at least 1).
    #[must_use]
    pub fn with_max_in_flight(mut self, max_in_flight: usize) -> Self {
        self.max_in_flight = max_in_flight.max(1);
        self
    }

    /// Spawn the consumer as a background task.
    #[must_use]
    pub fn spawn(self) -> tokio::task::JoinHandle<()> {
        tokio::spawn(self.run())
    }

    /// Run the consumer until shutdown.
    pub async fn run(mut self) {
        info!(
            consumer = %self.name,
            max_in_flight = self.max_in_flight,
            "Request consumer started"
        );

        let permits = Arc::new(Semaphore::new(self.max_in_flight));
        let mut in_flight = JoinSet::new();

        loop {
            tokio::select! {
                _ = self.shutdown.recv() => {
                    info!(consumer = %self.name, "Request consumer received shutdown signal");
                    break;
                }
                subscribe_result = self.source.subscribe() => {
                    match subscribe_result {
                        Ok(mut stream) => {
                            info!(consumer = %self.name, "Subscribed to request source");
                            let end = self.process_stream(&mut stream, &permits, &mut in_flight).await;
                            if end == StreamEnd::Shutdown {
                                break;
                            }
                            warn!(
                                consumer = %self.name,
                                "Request stream ended, reconnecting in {:?}",
                                self.retry_delay
                            );
                        }
                        Err(e) => {
                            error!(
                                consumer = %self.name,
                                error = %e,
                                "Failed to subscribe to request source, retrying in {:?}",
                                self.retry_delay
                            );
                        }
                    }
                }
            }

            tokio::select! {
                _ = self.shutdown.recv() => {
                    info!(consumer = %self.name, "Request consumer received shutdown signal");
                    break;
                }
                () = tokio::time::sleep(self.retry_delay) => {}
            }
        }

        let pending = in_flight.len();
        if pending > 0 {
            info!(consumer = %self.name, pending, "Waiting for in-flight requests");
        }
        while let Some(joined) = in_flight.join_next().await {
            if let Err(e) = joined {
                error!(consumer = %self.name, error = %e, "Dispatch task failed");
            }
        }

        info!(consumer = %self.name, "Request consumer stopped");
    }

    /// Dispatch deliveries until the stream ends or shutdown is requested.
    async fn process_stream(
        &mut self,
        stream: &mut DeliveryStream,
        permits: &Arc<Semaphore>,
        in_flight: &mut JoinSet<()>,
    ) -> StreamEnd {
        loop {
            let permit = tokio::select! {
                _ = self.shutdown.recv() => return StreamEnd::Shutdown,
                permit = Arc::clone(permits).acquire_owned() => match permit {
                    Ok(permit) => permit,
                    Err(_) => return StreamEnd::Shutdown,
                },
            };

            tokio::select! {
                _ = self.shutdown.recv() => return StreamEnd::Shutdown,
                next = stream.next() => match next {
                    Some(Ok(delivery)) => {
                        let dispatcher = self.dispatcher.clone();
                        in_flight.spawn(async move {
                            let _permit = permit;
                            dispatcher.dispatch(delivery).await;
                        });
                    }
                    Some(Err(e)) => {
                        error!(consumer = %self.name, error = %e, "Error receiving request from stream");
                    }
                    None => {
                        warn!(consumer = %self.name, "Request stream ended");
                        return StreamEnd::Ended;
                    }
                },
            }

            while let Some(joined) = in_flight.try_join_next() {
                if let Err(e) = joined {
                    error!(consumer = %self.name, error = %e, "Dispatch task failed");
                }
            }
        }
    }
}

impl std::fmt::Debug for RequestConsumer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RequestConsumer")
            .field("name", &self.name)
            .field("retry_delay", &self.retry_delay)
            .field("max_in_flight", &self.max_in_flight)
            .finish_non_exhaustive()
    }
}
