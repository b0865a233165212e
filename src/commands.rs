//! CLI commands
//!
//! Each command module owns its `clap` arguments and returns a summary that
//! the binary prints. [`CommandContext`] carries what every command needs:
//! configuration, the migrated database and the run-wide cancellation token.

#![allow(clippy::uninlined_format_args)]

use std::fmt;
use std::time::Instant;

use anyhow::Result;
use serde::Serialize;
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use crate::infrastructure::config::AppConfig;
use crate::infrastructure::database_connection::DatabaseConnection;
use crate::infrastructure::lock_coordinator::LockCoordinator;
use crate::sync::cursor::SourceCursor;
use crate::sync::orchestrator::{
    DestinationStore, RecordMapper, RunConfig, RunState, RunStats, SyncOrchestrator,
};

pub mod import_crm;
pub mod import_csv;
pub mod locks;
pub mod quiz_sessions;

pub use import_crm::{import_crm, ImportCrmArgs};
pub use import_csv::{import_csv, ImportCsvArgs};
pub use locks::{list_locks, release_lock, LocksCommand};
pub use quiz_sessions::{quiz_sessions, QuizSessionsArgs};

/// Per-run flags shared by all import commands
#[derive(Debug, Clone, Default, clap::Args)]
pub struct RunOverrides {
    /// Rows per flush (defaults to sync.batch_size)
    #[arg(long)]
    pub batch_size: Option<usize>,

    /// Memory limit of the run in MB; bounds the batch buffer
    #[arg(long = "memory-limit", value_name = "MB")]
    pub memory_limit_mb: Option<u64>,

    /// Merge under the lock, then roll back instead of committing
    #[arg(long)]
    pub dry_run: bool,
}

/// Outcome of one import run
#[derive(Debug, Clone, Serialize)]
pub struct SyncSummary {
    pub run_id: Uuid,
    pub source: String,
    pub destination: String,
    pub dry_run: bool,
    pub state: RunState,
    pub stats: RunStats,
    pub duration_ms: u64,
    /// Error chain of a failed run
    pub error: Option<String>,
}

impl SyncSummary {
    pub fn succeeded(&self) -> bool {
        self.error.is_none()
    }
}

impl fmt::Display for SyncSummary {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = &self.stats;
        writeln!(
            f,
            "{} → {}{}: {} in {} ms",
            self.source,
            self.destination,
            if self.dry_run { " (dry run)" } else { "" },
            self.state,
            self.duration_ms
        )?;
        writeln!(
            f,
            "  processed: {} fetched / {} accepted in {} pages, {} batches",
            s.fetched, s.accepted, s.pages, s.batches_flushed
        )?;
        writeln!(f, "  written:   {} inserted, {} updated", s.inserted, s.updated)?;
        write!(
            f,
            "  skipped:   {} invalid, {} duplicate, {} malformed",
            s.skipped_invalid, s.duplicates, s.malformed
        )?;
        if let Some(error) = &self.error {
            write!(f, "\n  error:     {}", error)?;
        }
        Ok(())
    }
}

pub struct CommandContext {
    pub config: AppConfig,
    pub db: DatabaseConnection,
    pub cancel: CancellationToken,
}

impl CommandContext {
    /// Opens the configured database and brings its schema up to date.
    pub async fn open(config: AppConfig, cancel: CancellationToken) -> Result<Self> {
        let db = DatabaseConnection::new(&config.database.url, config.database.max_connections).await?;
        db.migrate().await?;
        Ok(Self { config, db, cancel })
    }

    pub fn lock_coordinator(&self) -> LockCoordinator {
        LockCoordinator::new(self.db.pool().clone(), self.config.lock.to_lock_config())
    }

    pub fn run_config(&self, overrides: &RunOverrides) -> RunConfig {
        RunConfig {
            batch_size: overrides.batch_size.unwrap_or(self.config.sync.batch_size),
            dry_run: overrides.dry_run,
            ..RunConfig::default()
        }
        .with_memory_limit_mb(overrides.memory_limit_mb.or(self.config.sync.memory_limit_mb))
    }

    /// Runs one source through the orchestrator and summarizes the outcome.
    pub async fn execute<C, M, D>(
        &self,
        cursor: &mut C,
        mapper: &M,
        store: &D,
        overrides: &RunOverrides,
    ) -> SyncSummary
    where
        C: SourceCursor,
        M: RecordMapper<C::Item>,
        D: DestinationStore<M::Row>,
    {
        let config = self.run_config(overrides);
        let started = Instant::now();
        let mut orchestrator = SyncOrchestrator::new(self.db.pool().clone(), self.lock_coordinator(), config.clone())
            .with_cancellation(self.cancel.clone());

        let (stats, error) = match orchestrator.run(cursor, mapper, store).await {
            Ok(stats) => (stats, None),
            Err(failure) => {
                let message = format!("{}: {}", failure, failure.error);
                (failure.stats, Some(message))
            }
        };

        SyncSummary {
            run_id: config.run_id,
            source: cursor.name().to_string(),
            destination: store.resource().to_string(),
            dry_run: config.dry_run,
            state: orchestrator.state(),
            stats,
            duration_ms: u64::try_from(started.elapsed().as_millis()).unwrap_or(u64::MAX),
            error,
        }
    }

    pub async fn close(&self) {
        self.db.close().await;
    }
}
