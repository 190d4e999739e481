//! Applies one delivered change request to the store and completes the delivery.
//!
//! | Error kind          | Retryable | Delivery | Log level |
//! |---------------------|-----------|----------|-----------|
//! | `InvalidRequest`    | no        | ack      | warn      |
//! | `EventNotFound`     | no        | ack      | warn      |
//! | `CapacityExceeded`  | no        | ack      | info      |
//! | `StorageError`      | yes       | nack     | error     |
//! | `Timeout`           | yes       | nack     | error     |
//!
//! A successful request is acked and logged at debug level.

use crate::metrics::record_request;
use registration_core::error::RegistrationError;
use registration_core::request::ChangeRequest;
use registration_core::store::RegistrationStore;
use registration_core::transport::{Delivery, TransportError};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::{debug, error, info, warn};

/// What happened to a dispatched request.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DispatchOutcome {
    /// The store applied the request; the delivery was acked
    Completed,
    /// The request failed permanently; the delivery was acked
    Rejected(RegistrationError),
    /// The request failed transiently; the delivery was nacked
    Retry(RegistrationError),
}

impl DispatchOutcome {
    fn from_result(result: Result<(), RegistrationError>) -> Self {
        match result {
            Ok(()) => Self::Completed,
            Err(e) if e.is_retryable() => Self::Retry(e),
            Err(e) => Self::Rejected(e),
        }
    }

    /// Whether the delivery is acknowledged (as opposed to handed back).
    #[must_use]
    pub const fn acknowledges(&self) -> bool {
        !matches!(self, Self::Retry(_))
    }

    /// Metric label for the outcome.
    #[must_use]
    pub const fn label(&self) -> &'static str {
        match self {
            Self::Completed => "completed",
            Self::Rejected(_) => "rejected",
            Self::Retry(_) => "retry",
        }
    }

    const fn error(&self) -> Option<&RegistrationError> {
        match self {
            Self::Completed => None,
            Self::Rejected(e) | Self::Retry(e) => Some(e),
        }
    }
}

/// Validates requests, runs them against the store under a deadline and acks
/// or nacks the delivery according to the outcome.
#[derive(Clone)]
pub struct RequestDispatcher {
    store: Arc<dyn RegistrationStore>,
    request_timeout: Duration,
}

impl RequestDispatcher {
    /// Create a dispatcher with the default 5 second request deadline.
    #[must_use]
    pub fn new(store: Arc<dyn RegistrationStore>) -> Self {
        Self {
            store,
            request_timeout: Duration::from_secs(5),
        }
    }

    /// Set the deadline for one store call.
    #[must_use]
    pub const fn with_request_timeout(mut self, timeout: Duration) -> Self {
        self.request_timeout = timeout;
        self
    }

    /// Process a delivery and complete it.
    ///
    /// Failures to ack or nack are logged; the transport's own redelivery
    /// policy covers them.
    pub async fn dispatch(&self, delivery: Delivery) -> DispatchOutcome {
        let outcome = self.process(&delivery.request).await;

        let completion = if outcome.acknowledges() {
            delivery.ack().await
        } else {
            delivery.nack().await
        };
        if let Err(e) = completion {
            warn!(
                error = %e,
                outcome = outcome.label(),
                "Failed to complete delivery; it may be redelivered"
            );
        }

        outcome
    }

    /// Decide the outcome for a request without touching the delivery.
    pub async fn process(&self, request: &Result<ChangeRequest, TransportError>) -> DispatchOutcome {
        let started = Instant::now();

        let command = match request {
            Ok(request) => request.validate(),
            Err(e) => Err(RegistrationError::InvalidRequest(format!(
                "undecodable payload: {e}"
            ))),
        };

        let (action, outcome) = match command {
            Ok(command) => {
                let action = command.action().as_str();
                let result = tokio::time::timeout(self.request_timeout, self.store.execute(&command))
                    .await
                    .unwrap_or(Err(RegistrationError::Timeout(self.request_timeout)));
                let outcome = DispatchOutcome::from_result(result);
                log_outcome(&outcome, action, &command.event_id().to_string(), command.user_id().as_str());
                (action, outcome)
            },
            Err(e) => {
                let outcome = DispatchOutcome::from_result(Err(e));
                let (event_id, user_id) = request
                    .as_ref()
                    .map(|r| (r.event_id.as_str(), r.user_id.as_str()))
                    .unwrap_or_default();
                log_outcome(&outcome, "invalid", event_id, user_id);
                ("invalid", outcome)
            },
        };

        record_request(action, outcome.label(), outcome.error().map(RegistrationError::kind), started.elapsed());
        outcome
    }
}

impl std::fmt::Debug for RequestDispatcher {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RequestDispatcher")
            .field("request_timeout", &self.request_timeout)
            .finish_non_exhaustive()
    }
}

fn log_outcome(outcome: &DispatchOutcome, action: &str, event_id: &str, user_id: &str) {
    match outcome {
        DispatchOutcome::Completed => {
            debug!(action, event_id, user_id, "Change request applied");
        },
        DispatchOutcome::Rejected(e @ RegistrationError::CapacityExceeded { .. }) => {
            info!(action, event_id, user_id, error = %e, "Change request rejected: event is full");
        },
        DispatchOutcome::Rejected(e) => {
            warn!(action, event_id, user_id, kind = e.kind(), error = %e, "Change request rejected");
        },
        DispatchOutcome::Retry(e) => {
            error!(action, event_id, user_id, kind = e.kind(), error = %e, "Change request failed; will be redelivered");
        },
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn retryable_errors_are_not_acknowledged() {
        let retry = DispatchOutcome::from_result(Err(RegistrationError::StorageError("down".into())));
        let timeout = DispatchOutcome::from_result(Err(RegistrationError::Timeout(Duration::from_secs(1))));
        let rejected = DispatchOutcome::from_result(Err(RegistrationError::InvalidRequest("bad".into())));

        assert!(!retry.acknowledges());
        assert!(!timeout.acknowledges());
        assert!(rejected.acknowledges());
        assert!(DispatchOutcome::Completed.acknowledges());
    }

    #[test]
    fn labels_match_metric_values() {
        assert_eq!(DispatchOutcome::Completed.label(), "completed");
        assert_eq!(
            DispatchOutcome::Rejected(RegistrationError::InvalidRequest(String::new())).label(),
            "rejected"
        );
        assert_eq!(
            DispatchOutcome::Retry(RegistrationError::StorageError(String::new())).label(),
            "retry"
        );
    }

    #[test]
    fn dispatcher_is_send_sync() {
        fn assert_send<T: Send>() {}
        fn assert_sync<T: Sync>() {}

        assert_send::<RequestDispatcher>();
        assert_sync::<RequestDispatcher>();
    }
}
