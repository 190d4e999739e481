//! Change requests as delivered by the transport, and their validated form.
//!
//! The transport hands over a [`ChangeRequest`] whose fields are still plain
//! strings. [`ChangeRequest::validate`] turns it into a [`RegistrationCommand`]
//! carrying parsed identifiers, or rejects it with
//! [`RegistrationError::InvalidRequest`].

use crate::error::RegistrationError;
use crate::types::{EventId, UserId};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

/// The two registration-change actions.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum RegistrationAction {
    /// Take one spot for the user
    Register,
    /// Release the user's spot(s)
    Unregister,
}

impl RegistrationAction {
    /// Wire name of the action.
    #[must_use]
    pub const fn as_str(&self) -> &'static str {
        match self {
            Self::Register => "Register",
            Self::Unregister => "Unregister",
        }
    }
}

impl fmt::Display for RegistrationAction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for RegistrationAction {
    type Err = RegistrationError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "Register" => Ok(Self::Register),
            "Unregister" => Ok(Self::Unregister),
            other => Err(RegistrationError::InvalidRequest(format!(
                "unknown action '{other}'"
            ))),
        }
    }
}

/// A decoded change request, exactly as the transport delivered it.
///
/// ```
/// use registration_core::request::ChangeRequest;
///
/// let request: ChangeRequest = serde_json::from_str(
///     r#"{"eventId":"1c5f1a36-5d0e-4a49-9d4a-3f6f7c1e2b10","userId":"alice","action":"Register"}"#,
/// ).unwrap();
/// assert_eq!(request.user_id, "alice");
/// ```
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ChangeRequest {
    /// Event identifier, expected to be a UUID
    pub event_id: String,
    /// Opaque registrant identifier
    pub user_id: String,
    /// `"Register"` or `"Unregister"`
    pub action: String,
}

impl ChangeRequest {
    /// Build a request from its parts.
    #[must_use]
    pub fn new(
        event_id: impl Into<String>,
        user_id: impl Into<String>,
        action: RegistrationAction,
    ) -> Self {
        Self {
            event_id: event_id.into(),
            user_id: user_id.into(),
            action: action.as_str().to_string(),
        }
    }

    /// Parse identifiers and action.
    ///
    /// # Errors
    ///
    /// Returns [`RegistrationError::InvalidRequest`] for an unknown action, a
    /// malformed event id or a blank user id.
    pub fn validate(&self) -> Result<RegistrationCommand, RegistrationError> {
        let action = self.action.parse::<RegistrationAction>()?;
        let event_id = EventId::parse(&self.event_id)?;
        let user_id = UserId::parse(&self.user_id)?;

        Ok(match action {
            RegistrationAction::Register => RegistrationCommand::Register { event_id, user_id },
            RegistrationAction::Unregister => RegistrationCommand::Unregister { event_id, user_id },
        })
    }
}

/// A validated request, ready to run against a store.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum RegistrationCommand {
    /// Register `user_id` for `event_id`
    Register {
        /// Target event
        event_id: EventId,
        /// Registrant
        user_id: UserId,
    },
    /// Unregister `user_id` from `event_id`
    Unregister {
        /// Target event
        event_id: EventId,
        /// Registrant
        user_id: UserId,
    },
}

impl RegistrationCommand {
    /// Target event.
    #[must_use]
    pub const fn event_id(&self) -> EventId {
        match self {
            Self::Register { event_id, .. } | Self::Unregister { event_id, .. } => *event_id,
        }
    }

    /// Registrant.
    #[must_use]
    pub const fn user_id(&self) -> &UserId {
        match self {
            Self::Register { user_id, .. } | Self::Unregister { user_id, .. } => user_id,
        }
    }

    /// Which action this command performs.
    #[must_use]
    pub const fn action(&self) -> RegistrationAction {
        match self {
            Self::Register { .. } => RegistrationAction::Register,
            Self::Unregister { .. } => RegistrationAction::Unregister,
        }
    }
}
