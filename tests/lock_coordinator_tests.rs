//! Writer lock behaviour against a real SQLite file

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use commondb_sync::infrastructure::database_connection::DatabaseConnection;
use commondb_sync::infrastructure::lock_coordinator::{LockConfig, LockCoordinator};
use commondb_sync::sync::error::{SyncError, SyncResult};
use tempfile::TempDir;
use tokio::sync::Barrier;
use tokio::time::Instant;

const RESOURCE: &str = "persons";

async fn database(dir: &TempDir) -> DatabaseConnection {
    let url = format!("sqlite:{}", dir.path().join("locks.db").display());
    let db = DatabaseConnection::new(&url, 4).await.unwrap();
    db.migrate().await.unwrap();
    db
}

fn fast() -> LockConfig {
    LockConfig {
        poll_interval: Duration::from_millis(25),
        acquire_timeout: Duration::from_secs(5),
        max_hold: Duration::from_secs(60),
    }
}

#[tokio::test]
async fn second_writer_is_excluded_until_release() -> anyhow::Result<()> {
    let dir = tempfile::tempdir()?;
    // Two pools on one file behave like two processes
    let first_db = database(&dir).await;
    let second_db = database(&dir).await;
    let a = LockCoordinator::new(first_db.pool().clone(), fast());
    let b = LockCoordinator::new(second_db.pool().clone(), fast());

    let guard = a.try_acquire(RESOURCE).await?.expect("lock is free");
    assert!(b.try_acquire(RESOURCE).await?.is_none());
    // Not reentrant either
    assert!(a.try_acquire(RESOURCE).await?.is_none());

    guard.release().await?;
    let guard = b.try_acquire(RESOURCE).await?.expect("lock was released");
    assert_eq!(guard.holder_id(), b.holder_id());
    guard.release().await?;
    Ok(())
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn exactly_one_of_many_racing_writers_wins() -> anyhow::Result<()> {
    const WRITERS: usize = 6;
    let dir = tempfile::tempdir()?;
    let mut coordinators = Vec::with_capacity(WRITERS);
    let mut databases = Vec::with_capacity(WRITERS);
    for _ in 0..WRITERS {
        let db = database(&dir).await;
        coordinators.push(LockCoordinator::new(db.pool().clone(), fast()));
        databases.push(db);
    }

    let start = Arc::new(Barrier::new(WRITERS));
    let attempts = coordinators
        .into_iter()
        .map(|locks| {
            let start = Arc::clone(&start);
            tokio::spawn(async move {
                start.wait().await;
                locks.try_acquire(RESOURCE).await
            })
        })
        .collect::<Vec<_>>();

    let mut winners = Vec::new();
    for attempt in attempts {
        if let Some(guard) = attempt.await?? {
            winners.push(guard);
        }
    }

    assert_eq!(winners.len(), 1);
    for guard in winners {
        guard.release().await?;
    }
    Ok(())
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn concurrent_acquires_never_overlap() -> anyhow::Result<()> {
    const WRITERS: usize = 4;
    let dir = tempfile::tempdir()?;
    let inside = Arc::new(AtomicUsize::new(0));
    let start = Arc::new(Barrier::new(WRITERS));
    let mut databases = Vec::with_capacity(WRITERS);
    let mut writers = Vec::with_capacity(WRITERS);

    for _ in 0..WRITERS {
        let db = database(&dir).await;
        let locks = LockCoordinator::new(db.pool().clone(), fast());
        databases.push(db);
        let (inside, start) = (Arc::clone(&inside), Arc::clone(&start));
        writers.push(tokio::spawn(async move {
            start.wait().await;
            let guard = locks.acquire(RESOURCE).await?;
            let others = inside.fetch_add(1, Ordering::SeqCst);
            tokio::time::sleep(Duration::from_millis(30)).await;
            inside.fetch_sub(1, Ordering::SeqCst);
            guard.release().await?;
            SyncResult::Ok(others)
        }));
    }

    for writer in writers {
        assert_eq!(writer.await??, 0, "another writer was inside the critical section");
    }
    Ok(())
}

#[tokio::test]
async fn huge_acquire_timeout_does_not_overflow() -> anyhow::Result<()> {
    let dir = tempfile::tempdir()?;
    let db = database(&dir).await;
    let locks = LockCoordinator::new(
        db.pool().clone(),
        LockConfig {
            acquire_timeout: Duration::MAX,
            ..fast()
        },
    );

    let guard = locks.acquire(RESOURCE).await?;
    guard.release().await?;
    Ok(())
}

#[tokio::test]
async fn different_resources_do_not_block_each_other() -> anyhow::Result<()> {
    let dir = tempfile::tempdir()?;
    let db = database(&dir).await;
    let a = LockCoordinator::new(db.pool().clone(), fast());
    let b = LockCoordinator::new(db.pool().clone(), fast());

    let persons = a.try_acquire("persons").await?.expect("free");
    let sessions = b.try_acquire("quiz_sessions").await?.expect("free");
    persons.release().await?;
    sessions.release().await?;
    Ok(())
}

#[tokio::test]
async fn acquire_times_out_while_lock_is_held() -> anyhow::Result<()> {
    let dir = tempfile::tempdir()?;
    let db = database(&dir).await;
    let holder = LockCoordinator::new(db.pool().clone(), fast());
    let waiter = LockCoordinator::new(
        db.pool().clone(),
        LockConfig {
            acquire_timeout: Duration::from_millis(150),
            ..fast()
        },
    );

    let guard = holder.acquire(RESOURCE).await?;
    let started = Instant::now();
    let err = waiter.acquire(RESOURCE).await.unwrap_err();

    assert!(matches!(err, SyncError::LockTimeout { ref resource, .. } if resource == RESOURCE));
    assert!(started.elapsed() >= Duration::from_millis(150));
    guard.release().await?;
    Ok(())
}

#[tokio::test]
async fn waiting_writer_takes_over_within_one_poll_interval() -> anyhow::Result<()> {
    let dir = tempfile::tempdir()?;
    let db = database(&dir).await;
    let holder = LockCoordinator::new(db.pool().clone(), fast());
    let waiter = LockCoordinator::new(db.pool().clone(), fast());

    let guard = holder.acquire(RESOURCE).await?;
    let waiting = tokio::spawn(async move {
        let guard = waiter.acquire(RESOURCE).await?;
        let acquired_at = Instant::now();
        guard.release().await?;
        SyncResult::Ok(acquired_at)
    });

    tokio::time::sleep(Duration::from_millis(100)).await;
    let released_at = Instant::now();
    guard.release().await?;

    let acquired_at = waiting.await??;
    assert!(acquired_at >= released_at);
    assert!(acquired_at - released_at < fast().poll_interval + Duration::from_millis(250));
    Ok(())
}

#[tokio::test]
async fn stale_lock_is_reclaimed_and_old_holder_cannot_free_it() -> anyhow::Result<()> {
    let dir = tempfile::tempdir()?;
    let db = database(&dir).await;
    let crashed = LockCoordinator::new(db.pool().clone(), fast());
    let rescuer = LockCoordinator::new(
        db.pool().clone(),
        LockConfig {
            max_hold: Duration::from_millis(50),
            ..fast()
        },
    );
    let bystander = LockCoordinator::new(db.pool().clone(), fast());

    let stale = crashed.try_acquire(RESOURCE).await?.expect("free");
    tokio::time::sleep(Duration::from_millis(120)).await;

    let fresh = rescuer.try_acquire(RESOURCE).await?.expect("stale lock reclaimed");

    // The old holder's release must not clear the new holder's lock
    assert!(!crashed.release(RESOURCE).await?);
    stale.release().await?;
    assert!(bystander.try_acquire(RESOURCE).await?.is_none());

    let locks = bystander.list().await?;
    assert_eq!(locks.len(), 1);
    assert!(locks[0].is_writing);
    assert_eq!(locks[0].holder_id.as_deref(), Some(rescuer.holder_id()));

    fresh.release().await?;
    Ok(())
}

#[tokio::test]
async fn release_is_idempotent() -> anyhow::Result<()> {
    let dir = tempfile::tempdir()?;
    let db = database(&dir).await;
    let locks = LockCoordinator::new(db.pool().clone(), fast());

    let guard = locks.acquire(RESOURCE).await?;
    assert!(locks.release(RESOURCE).await?);
    assert!(!locks.release(RESOURCE).await?);
    // Guard release after an explicit release is a no-op as well
    guard.release().await?;
    assert!(locks.try_acquire(RESOURCE).await?.is_some_and(|g| g.resource() == RESOURCE));
    Ok(())
}

#[tokio::test]
async fn with_lock_releases_when_the_critical_section_fails() -> anyhow::Result<()> {
    let dir = tempfile::tempdir()?;
    let db = database(&dir).await;
    let a = LockCoordinator::new(db.pool().clone(), fast());
    let b = LockCoordinator::new(db.pool().clone(), fast());

    let result: SyncResult<()> = a
        .with_lock(RESOURCE, || async {
            assert!(b.try_acquire(RESOURCE).await?.is_none());
            Err(SyncError::Cancelled)
        })
        .await;
    assert!(matches!(result, Err(SyncError::Cancelled)));

    let value = b.with_lock(RESOURCE, || async { Ok(42) }).await?;
    assert_eq!(value, 42);
    Ok(())
}

#[tokio::test]
async fn dropped_guard_is_released_in_background() -> anyhow::Result<()> {
    let dir = tempfile::tempdir()?;
    let db = database(&dir).await;
    let a = LockCoordinator::new(db.pool().clone(), fast());
    let b = LockCoordinator::new(db.pool().clone(), fast());

    drop(a.try_acquire(RESOURCE).await?.expect("free"));

    let guard = b.acquire(RESOURCE).await?;
    assert_eq!(guard.holder_id(), b.holder_id());
    guard.release().await?;
    Ok(())
}

#[tokio::test]
async fn force_release_clears_any_holder() -> anyhow::Result<()> {
    let dir = tempfile::tempdir()?;
    let db = database(&dir).await;
    let owner = LockCoordinator::new(db.pool().clone(), fast());
    let operator = LockCoordinator::new(db.pool().clone(), fast());

    let guard = owner.try_acquire(RESOURCE).await?.expect("free");
    assert!(operator.force_release(RESOURCE).await?);
    assert!(!operator.force_release(RESOURCE).await?);

    let listed = operator.list().await?;
    assert!(!listed[0].is_writing);
    assert!(listed[0].locked_at.is_some());

    guard.release().await?;
    Ok(())
}
