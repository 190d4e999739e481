//! Error types for registration operations.

use crate::types::EventId;
use std::time::Duration;
use thiserror::Error;

/// Result type alias for registration operations.
pub type Result<T> = std::result::Result<T, RegistrationError>;

/// Every way a `Register` or `Unregister` request can fail.
///
/// Each variant is either *permanent* (retrying the same request cannot
/// succeed, so the request is acknowledged and reported) or *retryable*
/// (the request is left unacknowledged for redelivery). See
/// [`RegistrationError::is_retryable`].
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum RegistrationError {
    /// Malformed identifier, blank user, unknown action or undecodable payload.
    #[error("Invalid request: {0}")]
    InvalidRequest(String),

    /// No event with the given id exists.
    #[error("Event not found: {0}")]
    EventNotFound(EventId),

    /// The event has no spots left.
    #[error("Event {event_id} is at capacity ({total_spots} spots)")]
    CapacityExceeded {
        /// Event that is full
        event_id: EventId,
        /// Its fixed capacity
        total_spots: u32,
    },

    /// Connection, query or transaction failure. The transaction was rolled back.
    #[error("Storage error: {0}")]
    StorageError(String),

    /// The request deadline elapsed before the store call finished.
    #[error("Request timed out after {0:?}")]
    Timeout(Duration),
}

impl RegistrationError {
    /// Whether the request should be redelivered.
    ///
    /// Only infrastructure failures are retryable. Validation and business
    /// rule failures would fail identically on every redelivery.
    #[must_use]
    pub const fn is_retryable(&self) -> bool {
        matches!(self, Self::StorageError(_) | Self::Timeout(_))
    }

    /// Stable label for logs and metrics.
    #[must_use]
    pub const fn kind(&self) -> &'static str {
        match self {
            Self::InvalidRequest(_) => "invalid_request",
            Self::EventNotFound(_) => "event_not_found",
            Self::CapacityExceeded { .. } => "capacity_exceeded",
            Self::StorageError(_) => "storage_error",
            Self::Timeout(_) => "timeout",
        }
    }
}
