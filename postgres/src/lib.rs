//! `PostgreSQL` registration store for capacity-controlled events.
//!
//! This crate provides the production implementation of the
//! [`RegistrationStore`](registration_core::RegistrationStore) trait. It uses sqlx
//! with runtime-checked queries and supports:
//!
//! - Exclusive row locks (`SELECT ... FOR UPDATE`) to serialize registrations per event
//! - Guarded decrements so the registered count never goes negative
//! - Connection pooling
//! - Embedded migrations for the `events` and `event_registrations` tables
//!
//! # Example
//!
//! ```ignore
//! use registration_postgres::PostgresRegistrationStore;
//!
//! async fn example() -> Result<(), Box<dyn std::error::Error>> {
//!     let store = PostgresRegistrationStore::connect("postgres://localhost/registrations").await?;
//!     store.migrate().await?;
//!     Ok(())
//! }
//! ```

#![forbid(unsafe_code)]
#![warn(missing_docs)]

mod registration_store;

pub use registration_store::{PoolSettings, PostgresRegistrationStore};
