//! # Registration Testing
//!
//! Test doubles and helpers for capacity-controlled event registration.
//!
//! This crate provides:
//! - A deterministic [`FixedClock`]
//! - [`InMemoryRegistrationStore`] plus failing and slow wrappers around it
//! - [`InMemoryRequestSource`] with an [`AckLog`] recording acks and nacks
//! - Invariant assertions and proptest strategies over operation sequences
//!
//! ## Example
//!
//! ```ignore
//! use registration_testing::{InMemoryRegistrationStore, helpers::assert_consistent};
//!
//! #[tokio::test]
//! async fn last_spot_goes_to_one_user() {
//!     let store = InMemoryRegistrationStore::new();
//!     let event_id = store.insert_event(1);
//!     // ... run concurrent registrations ...
//!     let event = assert_consistent(&store, event_id).await;
//!     assert_eq!(event.registered_count, 1);
//! }
//! ```

use chrono::{DateTime, Utc};
use registration_core::environment::Clock;

mod store_mocks;
mod transport_mocks;

/// Mock implementations of injected dependencies.
pub mod mocks {
    use super::{Clock, DateTime, Utc};

    /// Fixed clock for deterministic tests
    ///
    /// Always returns the same time, making tests reproducible.
    ///
    /// # Example
    ///
    /// ```
    /// use registration_testing::mocks::FixedClock;
    /// use registration_core::environment::Clock;
    /// use chrono::Utc;
    ///
    /// let clock = FixedClock::new(Utc::now());
    /// assert_eq!(clock.now(), clock.now());
    /// ```
    #[derive(Debug, Clone)]
    pub struct FixedClock {
        time: DateTime<Utc>,
    }

    impl FixedClock {
        /// Create a new fixed clock with the given time
        #[must_use]
        pub const fn new(time: DateTime<Utc>) -> Self {
            Self { time }
        }
    }

    impl Clock for FixedClock {
        fn now(&self) -> DateTime<Utc> {
            self.time
        }
    }

    /// Create a default fixed clock for tests (2025-01-01 00:00:00 UTC)
    #[must_use]
    pub fn test_clock() -> FixedClock {
        FixedClock::new(DateTime::<Utc>::UNIX_EPOCH + chrono::Duration::days(20_089))
    }
}

/// Assertions shared by store and service tests.
pub mod helpers {
    use registration_core::store::RegistrationStore;
    use registration_core::types::{Event, EventId};

    /// Assert that an event's counter matches its rows and stays within capacity.
    ///
    /// Returns the event so callers can check the count itself.
    ///
    /// # Panics
    ///
    /// Panics if the event is missing, a read fails, or an invariant is violated.
    #[allow(clippy::expect_used)]
    pub async fn assert_consistent(store: &dyn RegistrationStore, event_id: EventId) -> Event {
        let event = store
            .get_event(event_id)
            .await
            .expect("event read should succeed")
            .expect("event should exist");
        let rows = store
            .count_registrations(event_id)
            .await
            .expect("registration count should succeed");

        assert_eq!(
            u64::from(event.registered_count),
            rows,
            "registered_count must equal the number of registration rows"
        );
        assert!(
            event.registered_count <= event.total_spots,
            "registered_count {} exceeds total_spots {}",
            event.registered_count,
            event.total_spots
        );
        event
    }

    /// Install a test-friendly tracing subscriber once per process.
    ///
    /// Honors `RUST_LOG`; output goes through the test harness capture.
    pub fn init_test_tracing() {
        let _ = tracing_subscriber::fmt()
            .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
            .with_test_writer()
            .try_init();
    }
}

/// Property-based testing utilities using proptest.
pub mod properties {
    use proptest::prelude::*;

    /// One step of a random registration workload against a single event.
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub enum Operation {
        /// Register user `n`
        Register(u8),
        /// Unregister user `n`
        Unregister(u8),
    }

    impl Operation {
        /// User id the operation targets.
        #[must_use]
        pub fn user(self) -> String {
            match self {
                Self::Register(n) | Self::Unregister(n) => format!("user-{n}"),
            }
        }
    }

    /// Operations over a pool of `users` distinct users (at least one).
    pub fn operation(users: u8) -> impl Strategy<Value = Operation> {
        let users = users.max(1);
        prop_oneof![
            3 => (0..users).prop_map(Operation::Register),
            2 => (0..users).prop_map(Operation::Unregister),
        ]
    }

    /// Sequences of up to `max_len` operations.
    pub fn operations(users: u8, max_len: usize) -> impl Strategy<Value = Vec<Operation>> {
        proptest::collection::vec(operation(users), 0..=max_len)
    }
}

// Re-export commonly used items
pub use mocks::{FixedClock, test_clock};
pub use store_mocks::{FlakyRegistrationStore, InMemoryRegistrationStore, SlowRegistrationStore};
pub use transport_mocks::{
    AckLog, AckOutcome, InMemoryRequestSource, RecordingAcknowledger, recorded_delivery,
};
