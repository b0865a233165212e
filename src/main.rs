//! commondb-sync command line entry point

#![allow(clippy::uninlined_format_args)]

use std::path::PathBuf;
use std::process::ExitCode;

use anyhow::Result;
use clap::{Parser, Subcommand};
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

use commondb_sync::commands::{
    import_crm, import_csv, list_locks, quiz_sessions, release_lock, CommandContext, ImportCrmArgs,
    ImportCsvArgs, LocksCommand, QuizSessionsArgs, SyncSummary,
};
use commondb_sync::infrastructure::config::ConfigManager;
use commondb_sync::infrastructure::logging::init_logging_with_config;

#[derive(Debug, Parser)]
#[command(name = "commondb-sync", version, about = "Sync marketing sources into the common database")]
struct Cli {
    /// Configuration file (JSON); created with defaults if missing
    #[arg(long, global = true, env = "COMMONDB_CONFIG")]
    config: Option<PathBuf>,

    /// Log level override: error, warn, info, debug, trace
    #[arg(long, global = true)]
    log_level: Option<String>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Debug, Subcommand)]
enum Command {
    /// Create or update the database schema
    Migrate,
    /// Import persons from the CRM API
    ImportCrm(ImportCrmArgs),
    /// Import persons from a CSV/TSV export
    ImportCsv(ImportCsvArgs),
    /// Rebuild quiz sessions from recorded actions
    QuizSessions(QuizSessionsArgs),
    /// Inspect or release writer locks
    Locks {
        #[command(subcommand)]
        action: LocksCommand,
    },
}

#[tokio::main]
async fn main() -> ExitCode {
    let cli = Cli::parse();
    match run(cli).await {
        Ok(code) => code,
        Err(e) => {
            error!("{:#}", e);
            eprintln!("Error: {:#}", e);
            ExitCode::FAILURE
        }
    }
}

async fn run(cli: Cli) -> Result<ExitCode> {
    let manager = match cli.config {
        Some(path) => ConfigManager::with_path(path),
        None => ConfigManager::new()?,
    };
    let mut config = manager.load_config().await?;
    if let Some(level) = cli.log_level {
        config.logging.level = level;
    }
    init_logging_with_config(&config.logging)?;

    let cancel = CancellationToken::new();
    let on_signal = cancel.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            warn!("🛑 Interrupt received, stopping after the current page");
            on_signal.cancel();
        }
    });

    let ctx = CommandContext::open(config, cancel).await?;
    let outcome = dispatch(&ctx, cli.command).await;
    ctx.close().await;
    outcome
}

async fn dispatch(ctx: &CommandContext, command: Command) -> Result<ExitCode> {
    let summary = match command {
        Command::Migrate => {
            info!("✅ Database at {} is migrated", ctx.config.database.url);
            return Ok(ExitCode::SUCCESS);
        }
        Command::ImportCrm(args) => import_crm(ctx, args).await?,
        Command::ImportCsv(args) => import_csv(ctx, args).await?,
        Command::QuizSessions(args) => quiz_sessions(ctx, args).await?,
        Command::Locks { action } => {
            match action {
                LocksCommand::List => {
                    let locks = list_locks(ctx).await?;
                    if locks.is_empty() {
                        println!("No locks recorded");
                    }
                    for lock in locks {
                        println!(
                            "{:<24} {:<8} {:<30} {}",
                            lock.resource_name,
                            if lock.is_writing { "HELD" } else { "free" },
                            lock.locked_at.map(|t| t.to_rfc3339()).unwrap_or_else(|| "-".into()),
                            lock.holder_id.unwrap_or_else(|| "-".into())
                        );
                    }
                }
                LocksCommand::Release { resource } => {
                    if release_lock(ctx, &resource).await? {
                        println!("Released lock on '{}'", resource);
                    } else {
                        println!("Lock on '{}' was not held", resource);
                    }
                }
            }
            return Ok(ExitCode::SUCCESS);
        }
    };

    Ok(report(&summary))
}

fn report(summary: &SyncSummary) -> ExitCode {
    println!("{}", summary);
    if summary.succeeded() {
        ExitCode::SUCCESS
    } else {
        ExitCode::FAILURE
    }
}
