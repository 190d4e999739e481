//! `PostgreSQL`-backed [`RegistrationStore`].
//!
//! # Transaction flow
//!
//! Register:
//!
//! ```text
//! BEGIN
//!   SELECT total_spots, registered_count FROM events WHERE id = $1 FOR UPDATE
//!   -- missing row      -> ROLLBACK, EventNotFound
//!   -- count >= spots   -> ROLLBACK, CapacityExceeded
//!   INSERT INTO event_registrations ...
//!   UPDATE events SET registered_count = registered_count + 1
//! COMMIT
//! ```
//!
//! A second `Register` for the same event blocks on `FOR UPDATE` until the
//! first commits or rolls back, then reads the fresh count. Registrations for
//! different events never contend.
//!
//! Unregister:
//!
//! ```text
//! BEGIN
//!   DELETE FROM event_registrations WHERE event_id = $1 AND user_id = $2
//!   UPDATE events SET registered_count = GREATEST(registered_count - $n, 0)
//!     WHERE id = $1 AND registered_count > 0         -- only when $n > 0
//! COMMIT
//! ```
//!
//! The guarded update is atomic on the event row and waits for any `Register`
//! holding the row lock.

use registration_core::error::{RegistrationError, Result};
use registration_core::store::{RegistrationStore, StoreFuture};
use registration_core::types::{Event, EventId, Registration, UserId};
use registration_core::{DateTime, Utc};
use sqlx::postgres::{PgPool, PgPoolOptions};
use sqlx::PgConnection;
use std::time::Duration;
use uuid::Uuid;

/// Connection pool sizing.
#[derive(Debug, Clone, Copy)]
pub struct PoolSettings {
    /// Maximum number of pooled connections
    pub max_connections: u32,
    /// Connections kept open while idle
    pub min_connections: u32,
    /// How long to wait for a free connection
    pub acquire_timeout: Duration,
}

impl Default for PoolSettings {
    fn default() -> Self {
        Self {
            max_connections: 10,
            min_connections: 2,
            acquire_timeout: Duration::from_secs(30),
        }
    }
}

/// `PostgreSQL` registration store.
///
/// Every `register`/`unregister` call checks out its own connection and runs
/// one short transaction. The store itself holds no per-event state, so any
/// number of service instances may share one database.
#[derive(Clone)]
pub struct PostgresRegistrationStore {
    pool: PgPool,
}

impl PostgresRegistrationStore {
    /// Connect with default pool settings.
    ///
    /// # Errors
    ///
    /// Returns [`RegistrationError::StorageError`] if the connection fails.
    pub async fn connect(database_url: &str) -> Result<Self> {
        Self::connect_with(database_url, PoolSettings::default()).await
    }

    /// Connect with explicit pool settings.
    ///
    /// # Errors
    ///
    /// Returns [`RegistrationError::StorageError`] if the connection fails.
    pub async fn connect_with(database_url: &str, settings: PoolSettings) -> Result<Self> {
        let pool = PgPoolOptions::new()
            .max_connections(settings.max_connections)
            .min_connections(settings.min_connections)
            .acquire_timeout(settings.acquire_timeout)
            .connect(database_url)
            .await
            .map_err(|e| RegistrationError::StorageError(format!("Failed to connect: {e}")))?;

        tracing::info!(
            max_connections = settings.max_connections,
            min_connections = settings.min_connections,
            "Registration store connected"
        );

        Ok(Self::from_pool(pool))
    }

    /// Wrap an existing pool.
    #[must_use]
    pub const fn from_pool(pool: PgPool) -> Self {
        Self { pool }
    }

    /// The underlying pool.
    #[must_use]
    pub const fn pool(&self) -> &PgPool {
        &self.pool
    }

    /// Create the `events` and `event_registrations` tables if missing.
    ///
    /// # Errors
    ///
    /// Returns [`RegistrationError::StorageError`] if a migration fails.
    pub async fn migrate(&self) -> Result<()> {
        sqlx::migrate!("./migrations")
            .run(&self.pool)
            .await
            .map_err(|e| RegistrationError::StorageError(format!("Migration failed: {e}")))?;
        Ok(())
    }

    /// Insert an event with the given capacity and no registrations.
    ///
    /// Events are owned by the event-management side; this exists for seeding
    /// and tests.
    ///
    /// # Errors
    ///
    /// Returns [`RegistrationError::StorageError`] if the insert fails or
    /// `total_spots` does not fit the column.
    pub async fn create_event(&self, total_spots: u32) -> Result<EventId> {
        let event_id = EventId::new();
        let total_spots = to_db_int(u64::from(total_spots))?;

        sqlx::query("INSERT INTO events (id, total_spots, registered_count) VALUES ($1, $2, 0)")
            .bind(*event_id.as_uuid())
            .bind(total_spots)
            .execute(&self.pool)
            .await
            .map_err(|e| RegistrationError::StorageError(format!("Failed to create event: {e}")))?;

        Ok(event_id)
    }

    async fn register_event(&self, event_id: EventId, user_id: &UserId) -> Result<()> {
        let mut tx = self
            .pool
            .begin()
            .await
            .map_err(|e| RegistrationError::StorageError(format!("Failed to start transaction: {e}")))?;

        if let Err(e) = lock_and_insert(&mut tx, event_id, user_id).await {
            if let Err(rollback) = tx.rollback().await {
                tracing::warn!(%event_id, error = %rollback, "Rollback failed");
            }
            return Err(e);
        }

        tx.commit()
            .await
            .map_err(|e| RegistrationError::StorageError(format!("Failed to commit transaction: {e}")))
    }

    async fn unregister_event(&self, event_id: EventId, user_id: &UserId) -> Result<()> {
        let mut tx = self
            .pool
            .begin()
            .await
            .map_err(|e| RegistrationError::StorageError(format!("Failed to start transaction: {e}")))?;

        let removed = match delete_and_decrement(&mut tx, event_id, user_id).await {
            Ok(removed) => removed,
            Err(e) => {
                if let Err(rollback) = tx.rollback().await {
                    tracing::warn!(%event_id, error = %rollback, "Rollback failed");
                }
                return Err(e);
            },
        };

        tx.commit()
            .await
            .map_err(|e| RegistrationError::StorageError(format!("Failed to commit transaction: {e}")))?;

        if removed == 0 {
            tracing::debug!(%event_id, %user_id, "Unregister matched no registration");
        }
        Ok(())
    }
}

/// Lock the event row, check capacity, insert and increment.
async fn lock_and_insert(conn: &mut PgConnection, event_id: EventId, user_id: &UserId) -> Result<()> {
    let row: Option<(i32, i32)> = sqlx::query_as(
        r"
        SELECT total_spots, registered_count
        FROM events
        WHERE id = $1
        FOR UPDATE
        ",
    )
    .bind(*event_id.as_uuid())
    .fetch_optional(&mut *conn)
    .await
    .map_err(|e| RegistrationError::StorageError(format!("Failed to lock event: {e}")))?;

    let Some((total_spots, registered_count)) = row else {
        return Err(RegistrationError::EventNotFound(event_id));
    };

    if registered_count >= total_spots {
        return Err(RegistrationError::CapacityExceeded {
            event_id,
            total_spots: from_db_int(total_spots)?,
        });
    }

    sqlx::query("INSERT INTO event_registrations (event_id, user_id) VALUES ($1, $2)")
        .bind(*event_id.as_uuid())
        .bind(user_id.as_str())
        .execute(&mut *conn)
        .await
        .map_err(|e| RegistrationError::StorageError(format!("Failed to insert registration: {e}")))?;

    sqlx::query("UPDATE events SET registered_count = registered_count + 1 WHERE id = $1")
        .bind(*event_id.as_uuid())
        .execute(&mut *conn)
        .await
        .map_err(|e| RegistrationError::StorageError(format!("Failed to increment count: {e}")))?;

    Ok(())
}

/// Delete the user's rows and release that many spots. Returns rows removed.
async fn delete_and_decrement(conn: &mut PgConnection, event_id: EventId, user_id: &UserId) -> Result<u64> {
    let removed = sqlx::query("DELETE FROM event_registrations WHERE event_id = $1 AND user_id = $2")
        .bind(*event_id.as_uuid())
        .bind(user_id.as_str())
        .execute(&mut *conn)
        .await
        .map_err(|e| RegistrationError::StorageError(format!("Failed to delete registration: {e}")))?
        .rows_affected();

    if removed > 0 {
        sqlx::query(
            r"
            UPDATE events
            SET registered_count = GREATEST(registered_count - $2, 0)
            WHERE id = $1 AND registered_count > 0
            ",
        )
        .bind(*event_id.as_uuid())
        .bind(to_db_int(removed)?)
        .execute(&mut *conn)
        .await
        .map_err(|e| RegistrationError::StorageError(format!("Failed to decrement count: {e}")))?;
    }

    Ok(removed)
}

fn from_db_int(value: i32) -> Result<u32> {
    u32::try_from(value)
        .map_err(|_| RegistrationError::StorageError(format!("Negative counter in database: {value}")))
}

fn to_db_int(value: u64) -> Result<i32> {
    i32::try_from(value)
        .map_err(|_| RegistrationError::StorageError(format!("Value {value} exceeds i32::MAX")))
}

fn record_outcome(operation: &'static str, result: &Result<()>) {
    let outcome = match result {
        Ok(()) => "success",
        Err(e) => e.kind(),
    };
    metrics::counter!(
        "registration_store_operations_total",
        "operation" => operation,
        "result" => outcome
    )
    .increment(1);
}

impl RegistrationStore for PostgresRegistrationStore {
    fn register<'a>(&'a self, event_id: EventId, user_id: &'a UserId) -> StoreFuture<'a, ()> {
        Box::pin(async move {
            let result = self.register_event(event_id, user_id).await;
            record_outcome("register", &result);
            if result.is_ok() {
                tracing::debug!(%event_id, %user_id, "Registration committed");
            }
            result
        })
    }

    fn unregister<'a>(&'a self, event_id: EventId, user_id: &'a UserId) -> StoreFuture<'a, ()> {
        Box::pin(async move {
            let result = self.unregister_event(event_id, user_id).await;
            record_outcome("unregister", &result);
            result
        })
    }

    fn get_event(&self, event_id: EventId) -> StoreFuture<'_, Option<Event>> {
        Box::pin(async move {
            let row: Option<(Uuid, i32, i32)> = sqlx::query_as(
                "SELECT id, total_spots, registered_count FROM events WHERE id = $1",
            )
            .bind(*event_id.as_uuid())
            .fetch_optional(&self.pool)
            .await
            .map_err(|e| RegistrationError::StorageError(format!("Failed to get event: {e}")))?;

            row.map(|(id, total_spots, registered_count)| {
                Ok(Event {
                    id: EventId::from_uuid(id),
                    total_spots: from_db_int(total_spots)?,
                    registered_count: from_db_int(registered_count)?,
                })
            })
            .transpose()
        })
    }

    fn count_registrations(&self, event_id: EventId) -> StoreFuture<'_, u64> {
        Box::pin(async move {
            let (count,): (i64,) =
                sqlx::query_as("SELECT COUNT(*) FROM event_registrations WHERE event_id = $1")
                    .bind(*event_id.as_uuid())
                    .fetch_one(&self.pool)
                    .await
                    .map_err(|e| {
                        RegistrationError::StorageError(format!("Failed to count registrations: {e}"))
                    })?;

            u64::try_from(count)
                .map_err(|_| RegistrationError::StorageError(format!("Negative row count: {count}")))
        })
    }

    fn list_registrations(&self, event_id: EventId) -> StoreFuture<'_, Vec<Registration>> {
        Box::pin(async move {
            let rows: Vec<(String, DateTime<Utc>)> = sqlx::query_as(
                r"
                SELECT user_id, registered_at
                FROM event_registrations
                WHERE event_id = $1
                ORDER BY id ASC
                ",
            )
            .bind(*event_id.as_uuid())
            .fetch_all(&self.pool)
            .await
            .map_err(|e| RegistrationError::StorageError(format!("Failed to list registrations: {e}")))?;

            rows.into_iter()
                .map(|(user_id, registered_at)| {
                    Ok(Registration {
                        event_id,
                        user_id: UserId::parse(&user_id).map_err(|e| {
                            RegistrationError::StorageError(format!("Corrupt user id row: {e}"))
                        })?,
                        registered_at,
                    })
                })
                .collect()
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use metrics_exporter_prometheus::PrometheusBuilder;

    #[test]
    fn postgres_store_is_send_sync() {
        fn assert_send<T: Send>() {}
        fn assert_sync<T: Sync>() {}

        assert_send::<PostgresRegistrationStore>();
        assert_sync::<PostgresRegistrationStore>();
    }

    #[test]
    fn db_int_conversions_reject_out_of_range() {
        assert!(from_db_int(-1).is_err());
        assert_eq!(from_db_int(7).ok(), Some(7));
        assert!(to_db_int(u64::from(u32::MAX)).is_err());
        assert_eq!(to_db_int(3).ok(), Some(3));
    }

    #[test]
    fn store_operations_are_counted_by_operation_and_result() {
        let recorder = PrometheusBuilder::new().build_recorder();
        let handle = recorder.handle();

        metrics::with_local_recorder(&recorder, || {
            record_outcome("register", &Ok(()));
            record_outcome("register", &Ok(()));
            record_outcome(
                "register",
                &Err(RegistrationError::CapacityExceeded {
                    event_id: EventId::new(),
                    total_spots: 1,
                }),
            );
            record_outcome("unregister", &Err(RegistrationError::StorageError("gone".into())));
        });

        let rendered = handle.render();
        let value = |operation: &str, result: &str| {
            rendered
                .lines()
                .find(|line| {
                    line.starts_with("registration_store_operations_total{")
                        && line.contains(&format!("operation=\"{operation}\""))
                        && line.contains(&format!("result=\"{result}\""))
                })
                .and_then(|line| line.rsplit(' ').next())
                .map(str::to_string)
        };

        assert_eq!(value("register", "success").as_deref(), Some("2"));
        assert_eq!(value("register", "capacity_exceeded").as_deref(), Some("1"));
        assert_eq!(value("unregister", "storage_error").as_deref(), Some("1"));
        assert_eq!(value("unregister", "success"), None);
    }

    #[test]
    fn default_pool_settings() {
        let settings = PoolSettings::default();
        assert_eq!(settings.max_connections, 10);
        assert_eq!(settings.min_connections, 2);
    }
}
