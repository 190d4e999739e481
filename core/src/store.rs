//! The capacity-controlled registration store.
//!
//! # Guarantees
//!
//! Implementations must uphold, under any interleaving of concurrent calls:
//!
//! - `registered_count` equals the number of registration rows for the event
//!   whenever no transaction on that event is in flight
//! - `registered_count <= total_spots`
//! - `registered_count` never goes negative
//!
//! `register` serializes on an exclusive per-event lock and re-reads capacity
//! after acquiring it. `unregister` relies on a single guarded decrement.
//!
//! # Dyn Compatibility
//!
//! Methods return `Pin<Box<dyn Future>>` instead of `async fn` so the store can
//! be shared as `Arc<dyn RegistrationStore>` by the dispatcher.

use crate::error::RegistrationError;
use crate::request::RegistrationCommand;
use crate::types::{Event, EventId, Registration, UserId};
use std::future::Future;
use std::pin::Pin;

/// Boxed future returned by store operations.
pub type StoreFuture<'a, T> = Pin<Box<dyn Future<Output = Result<T, RegistrationError>> + Send + 'a>>;

/// Storage for events and their registrations.
pub trait RegistrationStore: Send + Sync {
    /// Register `user_id` for `event_id`.
    ///
    /// Runs in one transaction: lock the event row, check capacity, insert a
    /// registration and increment the counter. Both writes commit together or
    /// neither does.
    ///
    /// # Errors
    ///
    /// - [`RegistrationError::EventNotFound`] if the event does not exist
    /// - [`RegistrationError::CapacityExceeded`] if the event is full
    /// - [`RegistrationError::StorageError`] on connection or transaction failure
    fn register<'a>(&'a self, event_id: EventId, user_id: &'a UserId) -> StoreFuture<'a, ()>;

    /// Unregister `user_id` from `event_id`.
    ///
    /// Deletes the matching registration rows and decrements the counter by the
    /// number of rows removed, never below zero. Unregistering a user who holds
    /// no registration (or from an unknown event) succeeds without changes.
    ///
    /// # Errors
    ///
    /// Returns [`RegistrationError::StorageError`] on connection or transaction failure.
    fn unregister<'a>(&'a self, event_id: EventId, user_id: &'a UserId) -> StoreFuture<'a, ()>;

    /// Read an event's current counters.
    ///
    /// # Errors
    ///
    /// Returns [`RegistrationError::StorageError`] if the read fails.
    fn get_event(&self, event_id: EventId) -> StoreFuture<'_, Option<Event>>;

    /// Count registration rows for an event.
    ///
    /// # Errors
    ///
    /// Returns [`RegistrationError::StorageError`] if the read fails.
    fn count_registrations(&self, event_id: EventId) -> StoreFuture<'_, u64>;

    /// List registration rows for an event, oldest first.
    ///
    /// # Errors
    ///
    /// Returns [`RegistrationError::StorageError`] if the read fails.
    fn list_registrations(&self, event_id: EventId) -> StoreFuture<'_, Vec<Registration>>;

    /// Run a validated command.
    ///
    /// # Errors
    ///
    /// Propagates the error of the underlying `register` or `unregister` call.
    fn execute<'a>(&'a self, command: &'a RegistrationCommand) -> StoreFuture<'a, ()> {
        match command {
            RegistrationCommand::Register { event_id, user_id } => self.register(*event_id, user_id),
            RegistrationCommand::Unregister { event_id, user_id } => {
                self.unregister(*event_id, user_id)
            },
        }
    }
}
