//! Transport contract for inbound change requests.
//!
//! The registration core does not know which queue delivers its requests. It
//! consumes the contract below from any transport:
//!
//! ```text
//! ┌─────────────────┐   subscribe()   ┌──────────────────┐
//! │  RequestSource  │────────────────►│  DeliveryStream  │
//! └─────────────────┘                 └────────┬─────────┘
//!                                              │ one Delivery per attempt
//!                                              ▼
//!                                     ┌──────────────────┐
//!                                     │    Dispatcher    │
//!                                     └────────┬─────────┘
//!                                   ┌──────────┴──────────┐
//!                                   ▼                     ▼
//!                               ack()                 nack()
//!                         (done, never again)   (redeliver later)
//! ```
//!
//! # Delivery Semantics
//!
//! **At-least-once**: a delivery that is neither acknowledged nor negatively
//! acknowledged (for example because the process crashed) is redelivered by
//! the transport's own policy. No dead-lettering happens at this layer.

use crate::request::ChangeRequest;
use futures::Stream;
use std::future::Future;
use std::pin::Pin;
use thiserror::Error;

/// Errors that can occur while talking to the transport.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum TransportError {
    /// Failed to connect to the broker
    #[error("Connection failed: {0}")]
    ConnectionFailed(String),

    /// Failed to subscribe to the request topics
    #[error("Subscription failed for topics {topics:?}: {reason}")]
    SubscriptionFailed {
        /// The topics that failed to subscribe
        topics: Vec<String>,
        /// The reason for failure
        reason: String,
    },

    /// A delivered payload could not be decoded into a [`ChangeRequest`]
    #[error("Deserialization failed: {0}")]
    DeserializationFailed(String),

    /// Ack or nack could not be recorded by the broker
    #[error("Acknowledge failed: {0}")]
    AcknowledgeFailed(String),

    /// Network or transport error
    #[error("Transport error: {0}")]
    Transport(String),
}

/// Boxed future returned by transport operations.
pub type TransportFuture<'a, T> = Pin<Box<dyn Future<Output = Result<T, TransportError>> + Send + 'a>>;

/// Completion handle attached to a single delivery.
pub trait Acknowledger: Send {
    /// Mark the delivery as processed. The transport will not redeliver it.
    ///
    /// # Errors
    ///
    /// Returns [`TransportError::AcknowledgeFailed`] if the broker rejects the commit.
    fn ack(self: Box<Self>) -> TransportFuture<'static, ()>;

    /// Hand the delivery back for redelivery.
    ///
    /// # Errors
    ///
    /// Returns [`TransportError::AcknowledgeFailed`] if the broker rejects the request.
    fn nack(self: Box<Self>) -> TransportFuture<'static, ()>;
}

/// One delivery attempt of one change request.
pub struct Delivery {
    /// The decoded request, or the reason the payload could not be decoded
    pub request: Result<ChangeRequest, TransportError>,
    acker: Box<dyn Acknowledger>,
}

impl Delivery {
    /// Pair a decoded request with its completion handle.
    #[must_use]
    pub fn new(request: Result<ChangeRequest, TransportError>, acker: Box<dyn Acknowledger>) -> Self {
        Self { request, acker }
    }

    /// Acknowledge successful (or permanently failed) processing.
    ///
    /// # Errors
    ///
    /// Propagates the transport's acknowledge failure.
    pub async fn ack(self) -> Result<(), TransportError> {
        self.acker.ack().await
    }

    /// Leave the request for redelivery.
    ///
    /// # Errors
    ///
    /// Propagates the transport's failure to record the nack.
    pub async fn nack(self) -> Result<(), TransportError> {
        self.acker.nack().await
    }
}

impl std::fmt::Debug for Delivery {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Delivery")
            .field("request", &self.request)
            .field("acker", &"<acknowledger>")
            .finish()
    }
}

/// Stream of deliveries from a subscription.
pub type DeliveryStream = Pin<Box<dyn Stream<Item = Result<Delivery, TransportError>> + Send>>;

/// A transport that delivers change requests.
///
/// Implementations must be `Send + Sync` so a single source can be shared by
/// the consumer loop across reconnects.
pub trait RequestSource: Send + Sync {
    /// Open a subscription.
    ///
    /// # Errors
    ///
    /// Returns [`TransportError::SubscriptionFailed`] or
    /// [`TransportError::ConnectionFailed`] if the subscription cannot be opened.
    fn subscribe(&self) -> TransportFuture<'_, DeliveryStream>;
}
