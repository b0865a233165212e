//! Database-backed writer locks
//!
//! One row per protected resource in `sync_locks`. Acquisition is a single
//! conditional upsert that flips `is_writing` from 0 to 1; the database row is
//! the only shared state, so coordinators in different processes exclude each
//! other as long as they point at the same database.
//!
//! A lock older than `max_hold` is considered abandoned and may be taken over.
//! Release only clears a row still owned by the releasing holder, so a run
//! whose lock was reclaimed cannot free the new owner's lock.

#![allow(clippy::uninlined_format_args)]

use std::future::Future;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::Serialize;
use sqlx::{Row, SqlitePool};
use tokio::time::Instant;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use crate::sync::error::{SyncError, SyncResult};

/// Lock timing knobs
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LockConfig {
    /// Pause between acquisition attempts while the lock is held elsewhere
    pub poll_interval: Duration,
    /// Give up and fail the run after waiting this long
    pub acquire_timeout: Duration,
    /// A lock held longer than this is reclaimed as stale
    pub max_hold: Duration,
}

impl Default for LockConfig {
    fn default() -> Self {
        Self {
            poll_interval: Duration::from_secs(1),
            acquire_timeout: Duration::from_secs(300),
            max_hold: Duration::from_secs(1800),
        }
    }
}

/// A `sync_locks` row as reported by [`LockCoordinator::list`].
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct LockRecord {
    pub resource_name: String,
    pub is_writing: bool,
    pub locked_at: Option<DateTime<Utc>>,
    pub holder_id: Option<String>,
}

#[derive(Debug, Clone)]
pub struct LockCoordinator {
    pool: SqlitePool,
    config: LockConfig,
    holder_id: String,
}

impl LockCoordinator {
    /// Each coordinator gets its own holder id. Locks are not reentrant:
    /// acquiring a resource this coordinator already holds waits like any other writer.
    pub fn new(pool: SqlitePool, config: LockConfig) -> Self {
        Self {
            pool,
            config,
            holder_id: Uuid::new_v4().to_string(),
        }
    }

    pub fn holder_id(&self) -> &str {
        &self.holder_id
    }

    pub fn config(&self) -> &LockConfig {
        &self.config
    }

    /// One acquisition attempt. `Ok(None)` means somebody else holds the lock.
    pub async fn try_acquire(&self, resource: &str) -> SyncResult<Option<LockGuard>> {
        let now = Utc::now().timestamp_millis();

        let acquired = sqlx::query(
            r#"
            INSERT INTO sync_locks (resource_name, is_writing, locked_at, holder_id)
            VALUES (?1, 1, ?2, ?3)
            ON CONFLICT(resource_name) DO UPDATE SET
                is_writing = 1,
                locked_at = excluded.locked_at,
                holder_id = excluded.holder_id
            WHERE sync_locks.is_writing = 0
            "#,
        )
        .bind(resource)
        .bind(now)
        .bind(&self.holder_id)
        .execute(&self.pool)
        .await?
        .rows_affected()
            == 1;

        if acquired {
            return Ok(Some(self.guard(resource)));
        }

        let stale_before = now.saturating_sub(duration_millis(self.config.max_hold));
        let reclaimed = sqlx::query(
            r#"
            UPDATE sync_locks
            SET locked_at = ?1, holder_id = ?2
            WHERE resource_name = ?3 AND is_writing = 1 AND locked_at < ?4
            "#,
        )
        .bind(now)
        .bind(&self.holder_id)
        .bind(resource)
        .bind(stale_before)
        .execute(&self.pool)
        .await?
        .rows_affected()
            == 1;

        if reclaimed {
            warn!(
                "♻️ Reclaimed stale lock on '{}' (held longer than {:?})",
                resource, self.config.max_hold
            );
            return Ok(Some(self.guard(resource)));
        }

        Ok(None)
    }

    /// Polls until the lock is ours or `acquire_timeout` has passed.
    pub async fn acquire(&self, resource: &str) -> SyncResult<LockGuard> {
        let started = Instant::now();

        loop {
            if let Some(guard) = self.try_acquire(resource).await? {
                debug!(
                    "🔒 Lock on '{}' acquired by {} after {:?}",
                    resource,
                    self.holder_id,
                    started.elapsed()
                );
                return Ok(guard);
            }

            let waited = started.elapsed();
            if waited >= self.config.acquire_timeout {
                error!(
                    "Timed out after {:?} waiting for lock on '{}'",
                    self.config.acquire_timeout, resource
                );
                return Err(SyncError::LockTimeout {
                    resource: resource.to_string(),
                    waited,
                });
            }

            debug!("⏳ '{}' is locked by another writer, retrying", resource);
            let remaining = self.config.acquire_timeout - waited;
            tokio::time::sleep(self.config.poll_interval.min(remaining)).await;
        }
    }

    /// Releases a lock held by this coordinator. Returns whether a row was cleared;
    /// releasing twice is harmless.
    pub async fn release(&self, resource: &str) -> SyncResult<bool> {
        Ok(release_row(&self.pool, resource, &self.holder_id).await?)
    }

    /// Runs `critical` while holding the lock on `resource`.
    ///
    /// The lock is released before any error from the critical section is returned.
    pub async fn with_lock<T, F, Fut>(&self, resource: &str, critical: F) -> SyncResult<T>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = SyncResult<T>>,
    {
        let guard = self.acquire(resource).await?;
        let result = critical().await;
        let released = guard.release().await;

        match (result, released) {
            (Err(err), Err(release_err)) => {
                warn!("Failed to release lock on '{}': {}", resource, release_err);
                Err(err)
            }
            (Err(err), Ok(())) => Err(err),
            (Ok(_), Err(release_err)) => Err(release_err),
            (Ok(value), Ok(())) => Ok(value),
        }
    }

    pub async fn list(&self) -> SyncResult<Vec<LockRecord>> {
        let rows = sqlx::query(
            "SELECT resource_name, is_writing, locked_at, holder_id FROM sync_locks ORDER BY resource_name",
        )
        .fetch_all(&self.pool)
        .await?;

        Ok(rows
            .iter()
            .map(|row| LockRecord {
                resource_name: row.get("resource_name"),
                is_writing: row.get::<i64, _>("is_writing") != 0,
                locked_at: row
                    .get::<Option<i64>, _>("locked_at")
                    .and_then(DateTime::from_timestamp_millis),
                holder_id: row.get("holder_id"),
            })
            .collect())
    }

    /// Clears a lock no matter who holds it. Operator recovery only.
    pub async fn force_release(&self, resource: &str) -> SyncResult<bool> {
        let cleared = sqlx::query(
            "UPDATE sync_locks SET is_writing = 0 WHERE resource_name = ?1 AND is_writing = 1",
        )
        .bind(resource)
        .execute(&self.pool)
        .await?
        .rows_affected()
            == 1;

        if cleared {
            warn!("🔓 Lock on '{}' was force-released", resource);
        } else {
            info!("Lock on '{}' was not held", resource);
        }
        Ok(cleared)
    }

    fn guard(&self, resource: &str) -> LockGuard {
        LockGuard {
            pool: self.pool.clone(),
            resource: resource.to_string(),
            holder_id: self.holder_id.clone(),
            released: false,
        }
    }
}

async fn release_row(pool: &SqlitePool, resource: &str, holder_id: &str) -> Result<bool, sqlx::Error> {
    let result = sqlx::query(
        "UPDATE sync_locks SET is_writing = 0 WHERE resource_name = ?1 AND holder_id = ?2 AND is_writing = 1",
    )
    .bind(resource)
    .bind(holder_id)
    .execute(pool)
    .await?;
    Ok(result.rows_affected() == 1)
}

fn duration_millis(duration: Duration) -> i64 {
    i64::try_from(duration.as_millis()).unwrap_or(i64::MAX)
}

/// Proof of holding a resource lock.
///
/// Call [`LockGuard::release`] on every exit path. A guard dropped without
/// release (panic, cancelled task) schedules a release on the current tokio
/// runtime; without a runtime the lock stays until it goes stale.
#[derive(Debug)]
#[must_use = "the lock is held until the guard is released"]
pub struct LockGuard {
    pool: SqlitePool,
    resource: String,
    holder_id: String,
    released: bool,
}

impl LockGuard {
    pub fn resource(&self) -> &str {
        &self.resource
    }

    pub fn holder_id(&self) -> &str {
        &self.holder_id
    }

    pub async fn release(mut self) -> SyncResult<()> {
        let cleared = release_row(&self.pool, &self.resource, &self.holder_id).await?;
        self.released = true;
        if cleared {
            debug!("🔓 Lock on '{}' released", self.resource);
        } else {
            warn!(
                "Lock on '{}' was no longer held by {} at release",
                self.resource, self.holder_id
            );
        }
        Ok(())
    }
}

impl Drop for LockGuard {
    fn drop(&mut self) {
        if self.released {
            return;
        }

        let pool = self.pool.clone();
        let resource = std::mem::take(&mut self.resource);
        let holder_id = std::mem::take(&mut self.holder_id);

        match tokio::runtime::Handle::try_current() {
            Ok(handle) => {
                warn!("Lock guard for '{}' dropped without release, releasing in background", resource);
                handle.spawn(async move {
                    if let Err(e) = release_row(&pool, &resource, &holder_id).await {
                        warn!("Background release of '{}' failed: {}", resource, e);
                    }
                });
            }
            Err(_) => {
                warn!(
                    "Lock guard for '{}' dropped outside a runtime; it stays held until stale",
                    resource
                );
            }
        }
    }
}
