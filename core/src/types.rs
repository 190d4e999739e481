//! Domain types for event registration.
//!
//! Identifiers are newtypes so an event id can never be passed where a user id
//! is expected. Parsing constructors return [`RegistrationError::InvalidRequest`]
//! on malformed input.

use crate::error::RegistrationError;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use uuid::Uuid;

// ============================================================================
// Identifiers
// ============================================================================

/// Unique identifier for an event
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct EventId(Uuid);

impl EventId {
    /// Creates a new random `EventId`
    #[must_use]
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }

    /// Create an `EventId` from a `Uuid`
    #[must_use]
    pub const fn from_uuid(uuid: Uuid) -> Self {
        Self(uuid)
    }

    /// Get the inner UUID
    #[must_use]
    pub const fn as_uuid(&self) -> &Uuid {
        &self.0
    }

    /// Parse an `EventId` from its textual UUID form.
    ///
    /// # Errors
    ///
    /// Returns [`RegistrationError::InvalidRequest`] if `raw` is not a UUID.
    pub fn parse(raw: &str) -> Result<Self, RegistrationError> {
        Uuid::parse_str(raw.trim())
            .map(Self)
            .map_err(|e| RegistrationError::InvalidRequest(format!("malformed event id '{raw}': {e}")))
    }
}

impl Default for EventId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for EventId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Opaque identifier of a registrant.
///
/// The registration core never interprets user ids; it only requires them to
/// be non-empty.
#[derive(Clone, Debug, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct UserId(String);

impl UserId {
    /// Parse a `UserId`, rejecting empty or whitespace-only tokens.
    ///
    /// # Errors
    ///
    /// Returns [`RegistrationError::InvalidRequest`] if `raw` is blank.
    pub fn parse(raw: &str) -> Result<Self, RegistrationError> {
        if raw.trim().is_empty() {
            return Err(RegistrationError::InvalidRequest(
                "user id must not be empty".to_string(),
            ));
        }
        Ok(Self(raw.to_string()))
    }

    /// Borrow the raw token.
    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for UserId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

// ============================================================================
// Entities
// ============================================================================

/// A capacity-limited event.
///
/// `total_spots` is set by the event-management side and never changed here.
/// `registered_count` is owned by the registration store and always satisfies
/// `registered_count <= total_spots`.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Event {
    /// Event identifier
    pub id: EventId,
    /// Fixed capacity
    pub total_spots: u32,
    /// Live number of registrations
    pub registered_count: u32,
}

impl Event {
    /// Create an event with no registrations.
    #[must_use]
    pub const fn new(id: EventId, total_spots: u32) -> Self {
        Self {
            id,
            total_spots,
            registered_count: 0,
        }
    }

    /// Spots still open for registration.
    #[must_use]
    pub const fn available_spots(&self) -> u32 {
        self.total_spots.saturating_sub(self.registered_count)
    }

    /// Whether the next registration would exceed capacity.
    #[must_use]
    pub const fn is_full(&self) -> bool {
        self.registered_count >= self.total_spots
    }
}

/// A single registration row.
///
/// No uniqueness is enforced on `(event_id, user_id)`: a user who registers
/// twice holds two rows and two spots.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Registration {
    /// Event the user registered for
    pub event_id: EventId,
    /// Registrant
    pub user_id: UserId,
    /// When the row was inserted
    pub registered_at: DateTime<Utc>,
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)] // Test code can use unwrap/expect
mod tests {
    use super::*;

    #[test]
    fn event_id_parses_uuid() {
        let id = EventId::new();
        let parsed = EventId::parse(&id.to_string()).expect("valid uuid should parse");
        assert_eq!(id, parsed);
    }

    #[test]
    fn event_id_rejects_garbage() {
        let err = EventId::parse("not-a-uuid").unwrap_err();
        assert!(matches!(err, RegistrationError::InvalidRequest(_)));
    }

    #[test]
    fn user_id_rejects_blank() {
        assert!(UserId::parse("").is_err());
        assert!(UserId::parse("   ").is_err());
        assert_eq!(UserId::parse("alice").unwrap().as_str(), "alice");
    }

    #[test]
    fn event_capacity_helpers() {
        let mut event = Event::new(EventId::new(), 2);
        assert_eq!(event.available_spots(), 2);
        assert!(!event.is_full());

        event.registered_count = 2;
        assert_eq!(event.available_spots(), 0);
        assert!(event.is_full());
    }

    #[test]
    fn zero_capacity_event_is_full() {
        let event = Event::new(EventId::new(), 0);
        assert!(event.is_full());
    }
}
