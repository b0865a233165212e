//! Logging system configuration and initialization
//!
//! - Console output for interactive runs
//! - Optional daily log files through a non-blocking writer
//! - Optional JSON file format for log shippers
//! - `RUST_LOG` overrides the configured level; otherwise noisy dependency
//!   targets (sqlx statements, HTTP internals) are held back unless the
//!   level is `trace`

#![allow(clippy::uninlined_format_args)]

use std::path::{Path, PathBuf};
use std::sync::Mutex;

use anyhow::{anyhow, Context, Result};
use once_cell::sync::Lazy;
use tracing::{info, warn};
use tracing_appender::non_blocking::WorkerGuard;
use tracing_appender::{non_blocking, rolling};
use tracing_subscriber::fmt::{self, time::ChronoUtc};
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::{EnvFilter, Layer, Registry};

pub use crate::infrastructure::config::LoggingConfig;
use crate::infrastructure::config::ConfigManager;

const LOG_FILE_PREFIX: &str = "commondb-sync.log";

/// Dependency targets held back unless the level is `trace`
const QUIET_TARGETS: &[&str] = &[
    "sqlx::query=warn",
    "sqlx=warn",
    "reqwest=info",
    "hyper=warn",
    "hyper_util=warn",
    "h2=warn",
    "rustls=warn",
];

// Keeps the file writer alive for the lifetime of the process
static LOG_GUARDS: Lazy<Mutex<Vec<WorkerGuard>>> = Lazy::new(|| Mutex::new(Vec::new()));

/// Log directory: configured one, else `<data dir>/commondb-sync/logs`,
/// else `./logs`.
pub fn get_log_directory(config: &LoggingConfig) -> PathBuf {
    config.log_dir.clone().unwrap_or_else(|| {
        ConfigManager::get_app_data_dir()
            .map(|dir| dir.join("logs"))
            .unwrap_or_else(|_| PathBuf::from("logs"))
    })
}

/// Builds the level filter used when `RUST_LOG` is not set.
pub fn build_filter(level: &str) -> Result<EnvFilter> {
    let mut directives = vec![level.to_string()];
    if !level.to_lowercase().contains("trace") {
        directives.extend(QUIET_TARGETS.iter().map(|d| d.to_string()));
    }
    EnvFilter::try_new(directives.join(",")).with_context(|| format!("Invalid log level '{}'", level))
}

/// Initialize the global subscriber from configuration.
///
/// Calling it twice is an error from the second call on.
pub fn init_logging_with_config(config: &LoggingConfig) -> Result<()> {
    let env_filter = match EnvFilter::try_from_default_env() {
        Ok(filter) => filter,
        Err(_) => build_filter(&config.level)?,
    };

    let console_layer = config.console_output.then(|| {
        fmt::layer()
            .with_writer(std::io::stderr)
            .with_timer(ChronoUtc::new("%Y-%m-%d %H:%M:%S%.3f".to_string()))
            .with_target(false)
    });

    let log_dir = get_log_directory(config);
    let file_layer = if config.file_output {
        std::fs::create_dir_all(&log_dir)
            .with_context(|| format!("Failed to create log directory {:?}", log_dir))?;
        if config.auto_cleanup_logs {
            cleanup_old_logs(&log_dir, config.max_files)?;
        }

        let (writer, guard) = non_blocking(rolling::daily(&log_dir, LOG_FILE_PREFIX));
        LOG_GUARDS
            .lock()
            .map_err(|_| anyhow!("log guard store poisoned"))?
            .push(guard);

        let layer = fmt::layer()
            .with_writer(writer)
            .with_timer(ChronoUtc::rfc_3339())
            .with_ansi(false);
        Some(if config.json_format {
            layer.json().with_current_span(false).boxed()
        } else {
            layer.with_target(true).boxed()
        })
    } else {
        None
    };

    if console_layer.is_none() && file_layer.is_none() {
        return Err(anyhow!("No logging output configured"));
    }

    Registry::default()
        .with(env_filter)
        .with(console_layer)
        .with(file_layer)
        .try_init()
        .context("Failed to install tracing subscriber")?;

    info!("Logging initialized (level: {}, json: {})", config.level, config.json_format);
    if config.file_output {
        info!("Log directory: {:?}", log_dir);
    }
    Ok(())
}

/// Deletes the oldest `*.log*` files so that at most `max_files` remain.
pub fn cleanup_old_logs(log_dir: &Path, max_files: u32) -> Result<usize> {
    if !log_dir.exists() {
        return Ok(0);
    }

    let mut log_files = Vec::new();
    for entry in std::fs::read_dir(log_dir)? {
        let entry = entry?;
        let path = entry.path();
        let is_log = path
            .file_name()
            .and_then(|n| n.to_str())
            .is_some_and(|name| name.starts_with(LOG_FILE_PREFIX));
        if !is_log || !path.is_file() {
            continue;
        }
        if let Ok(modified) = entry.metadata().and_then(|m| m.modified()) {
            log_files.push((path, modified));
        }
    }

    // Newest first
    log_files.sort_by(|a, b| b.1.cmp(&a.1));

    let mut removed = 0;
    for (path, _) in log_files.iter().skip(max_files as usize) {
        match std::fs::remove_file(path) {
            Ok(()) => removed += 1,
            Err(e) => warn!("Failed to remove old log file {:?}: {}", path, e),
        }
    }
    Ok(removed)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::{Duration, SystemTime};
    use tempfile::tempdir;

    #[test]
    fn test_filter_quiets_dependencies_below_trace() {
        let filter = build_filter("debug").unwrap().to_string();
        assert!(filter.contains("sqlx::query=warn"));

        let trace = build_filter("trace").unwrap().to_string();
        assert!(!trace.contains("sqlx"));
    }

    #[test]
    fn test_invalid_level_is_rejected() {
        assert!(build_filter("loud=[").is_err());
    }

    #[test]
    fn test_cleanup_keeps_newest_files() {
        let dir = tempdir().unwrap();
        let now = SystemTime::now();
        for (i, name) in ["2024-01-01", "2024-01-02", "2024-01-03"].iter().enumerate() {
            let path = dir.path().join(format!("{}.{}", LOG_FILE_PREFIX, name));
            let file = std::fs::File::create(&path).unwrap();
            file.set_modified(now - Duration::from_secs(3600 * (3 - i as u64))).unwrap();
        }
        std::fs::write(dir.path().join("unrelated.txt"), "keep").unwrap();

        let removed = cleanup_old_logs(dir.path(), 2).unwrap();
        assert_eq!(removed, 1);
        assert!(!dir.path().join(format!("{}.2024-01-01", LOG_FILE_PREFIX)).exists());
        assert!(dir.path().join(format!("{}.2024-01-03", LOG_FILE_PREFIX)).exists());
        assert!(dir.path().join("unrelated.txt").exists());
    }

    #[test]
    fn test_log_directory_prefers_configured_path() {
        let config = LoggingConfig {
            log_dir: Some(PathBuf::from("/var/log/commondb")),
            ..LoggingConfig::default()
        };
        assert_eq!(get_log_directory(&config), PathBuf::from("/var/log/commondb"));
    }
}
