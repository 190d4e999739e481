//! # Registration Core
//!
//! Core types and traits for capacity-controlled event registration.
//!
//! An event has a fixed number of spots. Users register for and unregister from
//! events through asynchronous change requests. The store behind the
//! [`store::RegistrationStore`] trait guarantees that an event's registered count
//! always equals the number of registration rows for it, never exceeds the
//! event's capacity and never drops below zero, regardless of how many requests
//! for the same event are processed concurrently.
//!
//! ## Building Blocks
//!
//! - **Types** ([`types`]): `EventId`, `UserId`, `Event`, `Registration`
//! - **Requests** ([`request`]): the decoded wire request and its validated command
//! - **Errors** ([`error`]): `RegistrationError` with retryable/permanent classification
//! - **Store** ([`store`]): the `Register`/`Unregister` operations
//! - **Transport** ([`transport`]): the deliver-then-ack/nack contract consumed from a queue
//! - **Environment** ([`environment`]): injected clock
//!
//! ## Example
//!
//! ```ignore
//! use registration_core::request::ChangeRequest;
//! use registration_core::store::RegistrationStore;
//! use registration_core::RegistrationError;
//!
//! async fn handle(store: &dyn RegistrationStore, request: ChangeRequest) -> Result<(), RegistrationError> {
//!     let command = request.validate()?;
//!     store.execute(&command).await
//! }
//! ```

#![forbid(unsafe_code)]
#![warn(missing_docs)]

pub mod environment;
pub mod error;
pub mod request;
pub mod store;
pub mod transport;
pub mod types;

// Re-export commonly used types
pub use chrono::{DateTime, Utc};
pub use error::{RegistrationError, Result};
pub use request::{ChangeRequest, RegistrationAction, RegistrationCommand};
pub use store::RegistrationStore;
pub use types::{Event, EventId, Registration, UserId};
