//! In-memory registration store doubles.
//!
//! - [`InMemoryRegistrationStore`]: `HashMap`-backed store with a per-event
//!   async mutex standing in for the database row lock
//! - [`FlakyRegistrationStore`]: fails a configurable number of writes before
//!   delegating
//! - [`SlowRegistrationStore`]: delays every write, for deadline tests

use registration_core::environment::{Clock, SystemClock};
use registration_core::error::RegistrationError;
use registration_core::store::{RegistrationStore, StoreFuture};
use registration_core::types::{Event, EventId, Registration, UserId};
use std::collections::HashMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, PoisonError, RwLock};
use std::time::Duration;
use tokio::sync::Mutex;

#[derive(Debug)]
struct EventRow {
    total_spots: u32,
    registered_count: u32,
    registrations: Vec<Registration>,
}

/// In-memory [`RegistrationStore`] for fast, deterministic tests.
///
/// Each event row sits behind its own `tokio::sync::Mutex`. `register` holds
/// it across the capacity check and the write, and yields to the scheduler in
/// between, so concurrent tests interleave the way database transactions do.
///
/// # Example
///
/// ```
/// use registration_core::store::RegistrationStore;
/// use registration_core::types::UserId;
/// use registration_testing::InMemoryRegistrationStore;
///
/// # async fn example() -> Result<(), Box<dyn std::error::Error>> {
/// let store = InMemoryRegistrationStore::new();
/// let event_id = store.insert_event(1);
///
/// store.register(event_id, &UserId::parse("alice")?).await?;
/// assert!(store.register(event_id, &UserId::parse("bob")?).await.is_err());
/// # Ok(())
/// # }
/// ```
#[derive(Clone)]
pub struct InMemoryRegistrationStore {
    events: Arc<RwLock<HashMap<EventId, Arc<Mutex<EventRow>>>>>,
    clock: Arc<dyn Clock>,
}

impl InMemoryRegistrationStore {
    /// Create an empty store stamping registrations with the system clock.
    #[must_use]
    pub fn new() -> Self {
        Self::with_clock(SystemClock)
    }

    /// Create an empty store stamping registrations with `clock`.
    #[must_use]
    pub fn with_clock(clock: impl Clock + 'static) -> Self {
        Self {
            events: Arc::new(RwLock::new(HashMap::new())),
            clock: Arc::new(clock),
        }
    }

    /// Create an event with a fresh id and no registrations.
    #[must_use]
    pub fn insert_event(&self, total_spots: u32) -> EventId {
        let event_id = EventId::new();
        self.insert_event_with_id(event_id, total_spots);
        event_id
    }

    /// Create (or replace) an event with a known id.
    pub fn insert_event_with_id(&self, event_id: EventId, total_spots: u32) {
        let row = EventRow {
            total_spots,
            registered_count: 0,
            registrations: Vec::new(),
        };
        self.events
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(event_id, Arc::new(Mutex::new(row)));
    }

    fn row(&self, event_id: EventId) -> Option<Arc<Mutex<EventRow>>> {
        self.events
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .get(&event_id)
            .cloned()
    }
}

impl Default for InMemoryRegistrationStore {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Debug for InMemoryRegistrationStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let events = self
            .events
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .len();
        f.debug_struct("InMemoryRegistrationStore")
            .field("events", &events)
            .finish_non_exhaustive()
    }
}

impl RegistrationStore for InMemoryRegistrationStore {
    fn register<'a>(&'a self, event_id: EventId, user_id: &'a UserId) -> StoreFuture<'a, ()> {
        Box::pin(async move {
            let row = self
                .row(event_id)
                .ok_or(RegistrationError::EventNotFound(event_id))?;
            let mut row = row.lock().await;

            if row.registered_count >= row.total_spots {
                return Err(RegistrationError::CapacityExceeded {
                    event_id,
                    total_spots: row.total_spots,
                });
            }

            // Other tasks run here while the row stays locked.
            tokio::task::yield_now().await;

            row.registrations.push(Registration {
                event_id,
                user_id: user_id.clone(),
                registered_at: self.clock.now(),
            });
            row.registered_count += 1;
            Ok(())
        })
    }

    fn unregister<'a>(&'a self, event_id: EventId, user_id: &'a UserId) -> StoreFuture<'a, ()> {
        Box::pin(async move {
            let Some(row) = self.row(event_id) else {
                return Ok(());
            };
            let mut row = row.lock().await;

            let before = row.registrations.len();
            row.registrations.retain(|r| &r.user_id != user_id);
            let removed = u32::try_from(before - row.registrations.len()).unwrap_or(u32::MAX);

            if removed > 0 {
                row.registered_count = row.registered_count.saturating_sub(removed);
            }
            Ok(())
        })
    }

    fn get_event(&self, event_id: EventId) -> StoreFuture<'_, Option<Event>> {
        Box::pin(async move {
            let Some(row) = self.row(event_id) else {
                return Ok(None);
            };
            let row = row.lock().await;
            Ok(Some(Event {
                id: event_id,
                total_spots: row.total_spots,
                registered_count: row.registered_count,
            }))
        })
    }

    fn count_registrations(&self, event_id: EventId) -> StoreFuture<'_, u64> {
        Box::pin(async move {
            let Some(row) = self.row(event_id) else {
                return Ok(0);
            };
            let count = row.lock().await.registrations.len();
            Ok(u64::try_from(count).unwrap_or(u64::MAX))
        })
    }

    fn list_registrations(&self, event_id: EventId) -> StoreFuture<'_, Vec<Registration>> {
        Box::pin(async move {
            let Some(row) = self.row(event_id) else {
                return Ok(Vec::new());
            };
            let registrations = row.lock().await.registrations.clone();
            Ok(registrations)
        })
    }
}

/// Store that fails the first `n` writes with a fixed error.
///
/// After the failures are used up, writes go to the wrapped
/// [`InMemoryRegistrationStore`]. Reads always go straight through.
#[derive(Debug)]
pub struct FlakyRegistrationStore {
    inner: InMemoryRegistrationStore,
    error: RegistrationError,
    failures_left: AtomicUsize,
    attempts: AtomicUsize,
}

impl FlakyRegistrationStore {
    /// Fail the next `failures` writes with `error`.
    #[must_use]
    pub const fn new(inner: InMemoryRegistrationStore, error: RegistrationError, failures: usize) -> Self {
        Self {
            inner,
            error,
            failures_left: AtomicUsize::new(failures),
            attempts: AtomicUsize::new(0),
        }
    }

    /// Fail every write with `error`.
    #[must_use]
    pub const fn always(inner: InMemoryRegistrationStore, error: RegistrationError) -> Self {
        Self::new(inner, error, usize::MAX)
    }

    /// Number of write attempts seen so far.
    #[must_use]
    pub fn attempts(&self) -> usize {
        self.attempts.load(Ordering::SeqCst)
    }

    /// The wrapped store.
    #[must_use]
    pub const fn inner(&self) -> &InMemoryRegistrationStore {
        &self.inner
    }

    fn take_failure(&self) -> Option<RegistrationError> {
        self.attempts.fetch_add(1, Ordering::SeqCst);
        self.failures_left
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |left| left.checked_sub(1))
            .ok()
            .map(|_| self.error.clone())
    }
}

impl RegistrationStore for FlakyRegistrationStore {
    fn register<'a>(&'a self, event_id: EventId, user_id: &'a UserId) -> StoreFuture<'a, ()> {
        match self.take_failure() {
            Some(error) => Box::pin(async move { Err(error) }),
            None => self.inner.register(event_id, user_id),
        }
    }

    fn unregister<'a>(&'a self, event_id: EventId, user_id: &'a UserId) -> StoreFuture<'a, ()> {
        match self.take_failure() {
            Some(error) => Box::pin(async move { Err(error) }),
            None => self.inner.unregister(event_id, user_id),
        }
    }

    fn get_event(&self, event_id: EventId) -> StoreFuture<'_, Option<Event>> {
        self.inner.get_event(event_id)
    }

    fn count_registrations(&self, event_id: EventId) -> StoreFuture<'_, u64> {
        self.inner.count_registrations(event_id)
    }

    fn list_registrations(&self, event_id: EventId) -> StoreFuture<'_, Vec<Registration>> {
        self.inner.list_registrations(event_id)
    }
}

/// Store that sleeps before every write.
///
/// The sleep happens before the wrapped store is touched, so a caller that
/// gives up early leaves no trace.
#[derive(Debug, Clone)]
pub struct SlowRegistrationStore {
    inner: InMemoryRegistrationStore,
    delay: Duration,
}

impl SlowRegistrationStore {
    /// Delay every write by `delay`.
    #[must_use]
    pub const fn new(inner: InMemoryRegistrationStore, delay: Duration) -> Self {
        Self { inner, delay }
    }

    /// The wrapped store.
    #[must_use]
    pub const fn inner(&self) -> &InMemoryRegistrationStore {
        &self.inner
    }
}

impl RegistrationStore for SlowRegistrationStore {
    fn register<'a>(&'a self, event_id: EventId, user_id: &'a UserId) -> StoreFuture<'a, ()> {
        Box::pin(async move {
            tokio::time::sleep(self.delay).await;
            self.inner.register(event_id, user_id).await
        })
    }

    fn unregister<'a>(&'a self, event_id: EventId, user_id: &'a UserId) -> StoreFuture<'a, ()> {
        Box::pin(async move {
            tokio::time::sleep(self.delay).await;
            self.inner.unregister(event_id, user_id).await
        })
    }

    fn get_event(&self, event_id: EventId) -> StoreFuture<'_, Option<Event>> {
        self.inner.get_event(event_id)
    }

    fn count_registrations(&self, event_id: EventId) -> StoreFuture<'_, u64> {
        self.inner.count_registrations(event_id)
    }

    fn list_registrations(&self, event_id: EventId) -> StoreFuture<'_, Vec<Registration>> {
        self.inner.list_registrations(event_id)
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)] // Test code can use unwrap/expect
mod tests {
    use super::*;
    use crate::mocks::test_clock;

    fn user(name: &str) -> UserId {
        UserId::parse(name).unwrap()
    }

    #[tokio::test]
    async fn register_stamps_with_injected_clock() {
        let clock = test_clock();
        let store = InMemoryRegistrationStore::with_clock(clock.clone());
        let event_id = store.insert_event(2);

        store.register(event_id, &user("alice")).await.unwrap();

        let registrations = store.list_registrations(event_id).await.unwrap();
        assert_eq!(registrations.len(), 1);
        assert_eq!(registrations[0].registered_at, clock.now());
    }

    #[tokio::test]
    async fn unknown_event_is_not_found_for_register_only() {
        let store = InMemoryRegistrationStore::new();
        let missing = EventId::new();

        assert_eq!(
            store.register(missing, &user("alice")).await,
            Err(RegistrationError::EventNotFound(missing))
        );
        assert_eq!(store.unregister(missing, &user("alice")).await, Ok(()));
        assert_eq!(store.get_event(missing).await, Ok(None));
    }

    #[tokio::test]
    async fn unregister_removes_every_row_for_user() {
        let store = InMemoryRegistrationStore::new();
        let event_id = store.insert_event(3);
        store.register(event_id, &user("alice")).await.unwrap();
        store.register(event_id, &user("alice")).await.unwrap();
        store.register(event_id, &user("bob")).await.unwrap();

        store.unregister(event_id, &user("alice")).await.unwrap();

        let event = store.get_event(event_id).await.unwrap().unwrap();
        assert_eq!(event.registered_count, 1);
        assert_eq!(store.count_registrations(event_id).await.unwrap(), 1);
    }

    #[tokio::test]
    async fn flaky_store_recovers_after_failures() {
        let inner = InMemoryRegistrationStore::new();
        let event_id = inner.insert_event(1);
        let store = FlakyRegistrationStore::new(
            inner,
            RegistrationError::StorageError("connection reset".into()),
            2,
        );

        tokio_test::assert_err!(store.register(event_id, &user("alice")).await);
        tokio_test::assert_err!(store.register(event_id, &user("alice")).await);
        tokio_test::assert_ok!(store.register(event_id, &user("alice")).await);
        assert_eq!(store.attempts(), 3);
        assert_eq!(store.inner().count_registrations(event_id).await.unwrap(), 1);
    }

    #[tokio::test]
    async fn slow_store_delays_writes() {
        let inner = InMemoryRegistrationStore::new();
        let event_id = inner.insert_event(1);
        let store = SlowRegistrationStore::new(inner, Duration::from_millis(500));

        let result = tokio::time::timeout(
            Duration::from_millis(20),
            store.register(event_id, &user("alice")),
        )
        .await;

        tokio_test::assert_err!(result);
        assert_eq!(store.inner().count_registrations(event_id).await.unwrap(), 0);
    }
}
