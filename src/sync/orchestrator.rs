//! # Sync Orchestrator
//!
//! Drives one import run:
//!
//! ```text
//! Init → Fetching → Accumulating → (LockWait → Merging → Flushing) → Fetching … → Done | Failed
//! ```
//!
//! Raw records from a [`SourceCursor`] are mapped into typed rows, buffered
//! in a [`BatchAccumulator`] and flushed under the destination's lock: the
//! stored rows are loaded by natural key, merged and written in a single
//! transaction. A run is one sequential task; the only thing it shares with
//! other runs is the lock table.

#![allow(clippy::uninlined_format_args)]

use std::collections::HashMap;
use std::fmt;

use async_trait::async_trait;
use serde::Serialize;
use sqlx::{SqliteConnection, SqlitePool};
use thiserror::Error;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info};
use uuid::Uuid;

use crate::domain::merge::{merge, MergeOutcome, Mergeable};
use crate::domain::record::SyncRecord;
use crate::infrastructure::lock_coordinator::LockCoordinator;
use crate::sync::batch::BatchAccumulator;
use crate::sync::cursor::SourceCursor;
use crate::sync::error::{RecordError, SyncError, SyncResult};

pub const DEFAULT_BATCH_SIZE: usize = 500;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum RunState {
    Init,
    Fetching,
    Accumulating,
    LockWait,
    Merging,
    Flushing,
    Done,
    Failed,
}

impl fmt::Display for RunState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::Init => "init",
            Self::Fetching => "fetching",
            Self::Accumulating => "accumulating",
            Self::LockWait => "lock-wait",
            Self::Merging => "merging",
            Self::Flushing => "flushing",
            Self::Done => "done",
            Self::Failed => "failed",
        };
        f.write_str(name)
    }
}

/// Per-run settings
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RunConfig {
    pub batch_size: usize,
    /// Approximate byte budget of the batch buffer
    pub max_batch_bytes: Option<usize>,
    /// Merge and write inside the transaction, then roll back
    pub dry_run: bool,
    pub run_id: Uuid,
}

impl Default for RunConfig {
    fn default() -> Self {
        Self {
            batch_size: DEFAULT_BATCH_SIZE,
            max_batch_bytes: None,
            dry_run: false,
            run_id: Uuid::new_v4(),
        }
    }
}

impl RunConfig {
    /// Half of the memory limit goes to the batch buffer, the rest covers the
    /// current page and the merge working set.
    pub fn with_memory_limit_mb(mut self, memory_limit_mb: Option<u64>) -> Self {
        self.max_batch_bytes = memory_limit_mb
            .filter(|mb| *mb > 0)
            .map(|mb| usize::try_from(mb.saturating_mul(1024 * 1024) / 2).unwrap_or(usize::MAX));
        self
    }
}

/// Progress counters of a run, returned on success and on failure.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct RunStats {
    pub pages: u32,
    pub fetched: u64,
    pub accepted: u64,
    pub skipped_invalid: u64,
    pub duplicates: u64,
    pub malformed: u64,
    pub inserted: u64,
    pub updated: u64,
    pub batches_flushed: u32,
}

impl RunStats {
    pub fn skipped(&self) -> u64 {
        self.skipped_invalid + self.duplicates + self.malformed
    }
}

#[derive(Debug, Error)]
#[error("sync run failed while {state}")]
pub struct RunFailure {
    pub state: RunState,
    pub stats: RunStats,
    #[source]
    pub error: SyncError,
}

/// Turns one raw source record into zero or more destination rows.
pub trait RecordMapper<T>: Send + Sync {
    type Row: SyncRecord + Mergeable;
    type Output: IntoIterator<Item = Self::Row>;

    fn map(&self, raw: T) -> Result<Self::Output, RecordError>;
}

/// Destination table access used while the lock is held.
///
/// Both calls run on the same open transaction.
#[async_trait]
pub trait DestinationStore<R: SyncRecord>: Send + Sync {
    /// Lock resource protecting this destination
    fn resource(&self) -> &str;

    async fn load_existing(
        &self,
        conn: &mut SqliteConnection,
        keys: &[R::Key],
    ) -> Result<HashMap<R::Key, R>, sqlx::Error>;

    async fn write_batch(
        &self,
        conn: &mut SqliteConnection,
        outcomes: &[MergeOutcome<R>],
    ) -> Result<(), sqlx::Error>;
}

#[derive(Debug, Clone, Copy, Default)]
struct FlushCounts {
    inserted: u64,
    updated: u64,
}

pub struct SyncOrchestrator {
    pool: SqlitePool,
    locks: LockCoordinator,
    config: RunConfig,
    cancel: CancellationToken,
    state: RunState,
    stats: RunStats,
}

impl SyncOrchestrator {
    pub fn new(pool: SqlitePool, locks: LockCoordinator, config: RunConfig) -> Self {
        Self {
            pool,
            locks,
            config,
            cancel: CancellationToken::new(),
            state: RunState::Init,
            stats: RunStats::default(),
        }
    }

    pub fn with_cancellation(mut self, cancel: CancellationToken) -> Self {
        self.cancel = cancel;
        self
    }

    pub fn state(&self) -> RunState {
        self.state
    }

    pub fn stats(&self) -> RunStats {
        self.stats
    }

    pub fn config(&self) -> &RunConfig {
        &self.config
    }

    /// Runs the source to exhaustion. Every batch that was flushed before a
    /// failure stays committed.
    pub async fn run<C, M, D>(
        &mut self,
        cursor: &mut C,
        mapper: &M,
        store: &D,
    ) -> Result<RunStats, RunFailure>
    where
        C: SourceCursor,
        M: RecordMapper<C::Item>,
        D: DestinationStore<M::Row>,
    {
        self.state = RunState::Init;
        self.stats = RunStats::default();
        info!(
            "🔄 Run {} started: {} → {} (batch size {}{})",
            self.config.run_id,
            cursor.name(),
            store.resource(),
            self.config.batch_size,
            if self.config.dry_run { ", dry run" } else { "" }
        );

        match self.drive(cursor, mapper, store).await {
            Ok(()) => {
                self.transition(RunState::Done);
                info!(
                    "✅ Run {} done: {} fetched, {} inserted, {} updated, {} skipped",
                    self.config.run_id,
                    self.stats.fetched,
                    self.stats.inserted,
                    self.stats.updated,
                    self.stats.skipped()
                );
                Ok(self.stats)
            }
            Err(error) => {
                let state = self.state;
                self.state = RunState::Failed;
                error!("❌ Run {} failed while {}: {}", self.config.run_id, state, error);
                Err(RunFailure {
                    state,
                    stats: self.stats,
                    error,
                })
            }
        }
    }

    async fn drive<C, M, D>(&mut self, cursor: &mut C, mapper: &M, store: &D) -> SyncResult<()>
    where
        C: SourceCursor,
        M: RecordMapper<C::Item>,
        D: DestinationStore<M::Row>,
    {
        let mut batch = BatchAccumulator::new(self.config.batch_size)
            .with_byte_budget(self.config.max_batch_bytes);

        loop {
            if self.cancel.is_cancelled() {
                return Err(SyncError::Cancelled);
            }

            self.transition(RunState::Fetching);
            let page = cursor.next().await?;
            self.stats.pages += 1;
            self.stats.fetched += page.items.len() as u64;
            self.stats.malformed = cursor.stats().malformed;

            self.transition(RunState::Accumulating);
            for raw in page.items {
                let rows = match mapper.map(raw) {
                    Ok(rows) => rows,
                    Err(e) => {
                        self.stats.skipped_invalid += 1;
                        debug!("Skipping record from {}: {}", cursor.name(), e);
                        continue;
                    }
                };
                for row in rows {
                    if batch.add(row) {
                        self.stats.accepted += 1;
                    } else {
                        self.stats.duplicates += 1;
                    }
                    if batch.should_flush() {
                        self.flush(&mut batch, store).await?;
                    }
                }
            }

            if !page.has_more {
                break;
            }
        }

        if !batch.is_empty() {
            self.flush(&mut batch, store).await?;
        }
        Ok(())
    }

    async fn flush<R, D>(&mut self, batch: &mut BatchAccumulator<R>, store: &D) -> SyncResult<()>
    where
        R: SyncRecord + Mergeable,
        D: DestinationStore<R>,
    {
        let rows = batch.drain();
        let size = rows.len();
        self.transition(RunState::LockWait);

        let counts = self
            .locks
            .with_lock(store.resource(), || {
                merge_and_write(&self.pool, self.config.dry_run, &mut self.state, rows, store)
            })
            .await?;

        self.stats.inserted += counts.inserted;
        self.stats.updated += counts.updated;
        self.stats.batches_flushed += 1;
        info!(
            "💾 Flushed batch {} of {} rows into {} ({} new, {} merged)",
            self.stats.batches_flushed,
            size,
            store.resource(),
            counts.inserted,
            counts.updated
        );
        Ok(())
    }

    fn transition(&mut self, next: RunState) {
        if self.state != next {
            debug!("Run {}: {} → {}", self.config.run_id, self.state, next);
            self.state = next;
        }
    }
}

/// Loads, merges and writes one batch. Dropping the transaction on an early
/// return rolls it back.
/// The database write lock is taken before the first read, so commits on other
/// connections wait on the busy timeout instead of invalidating the snapshot.
async fn merge_and_write<R, D>(
    pool: &SqlitePool,
    dry_run: bool,
    state: &mut RunState,
    rows: Vec<R>,
    store: &D,
) -> SyncResult<FlushCounts>
where
    R: SyncRecord + Mergeable,
    D: DestinationStore<R>,
{
    let batch_err = |source: sqlx::Error| SyncError::BatchWrite {
        resource: store.resource().to_string(),
        source,
    };

    *state = RunState::Merging;
    let mut tx = pool.begin_with("BEGIN IMMEDIATE").await.map_err(batch_err)?;
    let keys = rows.iter().map(R::natural_key).collect::<Vec<_>>();
    let mut existing = store.load_existing(&mut tx, &keys).await.map_err(batch_err)?;

    let outcomes = rows
        .into_iter()
        .map(|row| {
            let stored = existing.remove(&row.natural_key());
            merge(stored, row)
        })
        .collect::<Vec<_>>();

    let inserted = outcomes.iter().filter(|o| o.is_insert()).count() as u64;
    let counts = FlushCounts {
        inserted,
        updated: outcomes.len() as u64 - inserted,
    };

    *state = RunState::Flushing;
    store.write_batch(&mut tx, &outcomes).await.map_err(batch_err)?;

    if dry_run {
        tx.rollback().await.map_err(batch_err)?;
    } else {
        tx.commit().await.map_err(batch_err)?;
    }
    Ok(counts)
}
