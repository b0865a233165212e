//! Configuration management for commondb-sync
//!
//! Settings live in a JSON file in the user config directory and can be
//! overridden per key with `COMMONDB__<SECTION>__<KEY>` environment variables.
//! Missing keys fall back to the values in [`defaults`]; the file is written
//! with the defaults on first run.

#![allow(clippy::uninlined_format_args)]

use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tokio::fs;
use tracing::info;

use crate::infrastructure::http_client::HttpClientConfig;
use crate::infrastructure::lock_coordinator::LockConfig;

pub const ENV_PREFIX: &str = "COMMONDB";
const APP_DIR_NAME: &str = "commondb-sync";
const CONFIG_FILE_NAME: &str = "commondb-sync.json";

#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("Failed to load config: {source}")]
    Load {
        #[from]
        source: config::ConfigError,
    },

    #[error("Configuration validation failed: {message}")]
    Validation { message: String },
}

/// Main application configuration
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct AppConfig {
    pub database: DatabaseConfig,
    pub sync: SyncConfig,
    pub lock: LockSettings,
    pub crm: CrmConfig,
    pub csv: CsvConfig,
    pub quiz: QuizConfig,
    pub logging: LoggingConfig,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct DatabaseConfig {
    /// sqlx connection URL, e.g. `sqlite:/var/lib/commondb/commondb.db`
    pub url: String,
    pub max_connections: u32,
}

/// Batch pipeline settings shared by all imports
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SyncConfig {
    pub batch_size: usize,
    /// Memory limit of one run in MB; half of it bounds the batch buffer
    pub memory_limit_mb: Option<u64>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct LockSettings {
    pub poll_interval_ms: u64,
    pub acquire_timeout_secs: u64,
    pub max_hold_secs: u64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct CrmConfig {
    /// Endpoint serving the paged person list
    pub persons_url: String,
    /// Bearer token; usually supplied as `COMMONDB__CRM__API_TOKEN`
    pub api_token: Option<String>,
    pub page_size: u32,
    pub request_delay_ms: u64,
    pub timeout_seconds: u64,
    pub max_requests_per_second: u32,
    pub user_agent: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct CsvConfig {
    pub delimiter: char,
    pub page_size: usize,
    /// Value written to `persons.source` when `--source` is not given
    pub default_source: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct QuizConfig {
    pub session_gap_seconds: u64,
    /// Subject/series groups loaded per page
    pub groups_per_page: u32,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct LoggingConfig {
    /// Log level: "error", "warn", "info", "debug", "trace"
    pub level: String,

    /// JSON formatted file logs
    pub json_format: bool,

    pub console_output: bool,

    pub file_output: bool,

    /// Directory for log files, defaults to the app data directory
    pub log_dir: Option<PathBuf>,

    /// Number of log files to keep (older files are deleted on startup)
    pub max_files: u32,

    pub auto_cleanup_logs: bool,
}

impl Default for DatabaseConfig {
    fn default() -> Self {
        let path = ConfigManager::get_app_data_dir()
            .map(|dir| dir.join("database").join(defaults::DATABASE_FILE))
            .unwrap_or_else(|_| PathBuf::from(defaults::DATABASE_FILE));
        Self {
            url: format!("sqlite:{}", path.display()),
            max_connections: defaults::MAX_CONNECTIONS,
        }
    }
}

impl Default for SyncConfig {
    fn default() -> Self {
        Self {
            batch_size: defaults::BATCH_SIZE,
            memory_limit_mb: None,
        }
    }
}

impl Default for LockSettings {
    fn default() -> Self {
        Self {
            poll_interval_ms: defaults::LOCK_POLL_INTERVAL_MS,
            acquire_timeout_secs: defaults::LOCK_ACQUIRE_TIMEOUT_SECS,
            max_hold_secs: defaults::LOCK_MAX_HOLD_SECS,
        }
    }
}

impl Default for CrmConfig {
    fn default() -> Self {
        Self {
            persons_url: defaults::CRM_PERSONS_URL.to_string(),
            api_token: None,
            page_size: defaults::CRM_PAGE_SIZE,
            request_delay_ms: defaults::CRM_REQUEST_DELAY_MS,
            timeout_seconds: defaults::REQUEST_TIMEOUT_SECONDS,
            max_requests_per_second: defaults::MAX_REQUESTS_PER_SECOND,
            user_agent: format!("commondb-sync/{}", env!("CARGO_PKG_VERSION")),
        }
    }
}

impl Default for CsvConfig {
    fn default() -> Self {
        Self {
            delimiter: ',',
            page_size: defaults::CSV_PAGE_SIZE,
            default_source: defaults::CSV_SOURCE.to_string(),
        }
    }
}

impl Default for QuizConfig {
    fn default() -> Self {
        Self {
            session_gap_seconds: defaults::SESSION_GAP_SECONDS,
            groups_per_page: defaults::QUIZ_GROUPS_PER_PAGE,
        }
    }
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
            json_format: false,
            console_output: true,
            file_output: false,
            log_dir: None,
            max_files: defaults::LOG_MAX_FILES,
            auto_cleanup_logs: true,
        }
    }
}

impl LockSettings {
    pub fn to_lock_config(&self) -> LockConfig {
        LockConfig {
            poll_interval: Duration::from_millis(self.poll_interval_ms),
            acquire_timeout: Duration::from_secs(self.acquire_timeout_secs),
            max_hold: Duration::from_secs(self.max_hold_secs),
        }
    }
}

impl CrmConfig {
    pub fn http_client_config(&self) -> HttpClientConfig {
        HttpClientConfig {
            user_agent: self.user_agent.clone(),
            timeout_seconds: self.timeout_seconds,
            max_requests_per_second: self.max_requests_per_second,
            bearer_token: self.api_token.clone(),
        }
    }
}

impl CsvConfig {
    /// The delimiter as the single byte the CSV reader expects
    pub fn delimiter_byte(&self) -> Result<u8, ConfigError> {
        delimiter_byte(self.delimiter)
    }
}

pub fn delimiter_byte(delimiter: char) -> Result<u8, ConfigError> {
    u8::try_from(delimiter)
        .ok()
        .filter(u8::is_ascii)
        .ok_or_else(|| ConfigError::Validation {
            message: format!("delimiter '{}' must be a single ASCII character", delimiter),
        })
}

impl AppConfig {
    /// Loads `path` (if present) and applies `COMMONDB__…` environment overrides.
    pub fn from_file(path: &Path) -> Result<Self, ConfigError> {
        let settings = config::Config::builder()
            .add_source(
                config::File::from(path)
                    .format(config::FileFormat::Json)
                    .required(false),
            )
            .add_source(
                config::Environment::with_prefix(ENV_PREFIX)
                    .separator("__")
                    .try_parsing(true),
            )
            .build()?;

        let config: Self = settings.try_deserialize()?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        let invalid = |message: &str| {
            Err(ConfigError::Validation {
                message: message.to_string(),
            })
        };

        if self.database.url.trim().is_empty() {
            return invalid("database.url must not be empty");
        }
        if self.database.max_connections == 0 {
            return invalid("database.max_connections must be greater than 0");
        }
        if self.sync.batch_size == 0 {
            return invalid("sync.batch_size must be greater than 0");
        }
        if self.lock.poll_interval_ms == 0 {
            return invalid("lock.poll_interval_ms must be greater than 0");
        }
        if self.lock.poll_interval_ms > self.lock.acquire_timeout_secs.saturating_mul(1000) {
            return invalid("lock.poll_interval_ms cannot exceed lock.acquire_timeout_secs");
        }
        if self.lock.max_hold_secs == 0 {
            return invalid("lock.max_hold_secs must be greater than 0");
        }
        if self.crm.page_size == 0 {
            return invalid("crm.page_size must be greater than 0");
        }
        if self.crm.max_requests_per_second == 0 {
            return invalid("crm.max_requests_per_second must be greater than 0");
        }
        self.csv.delimiter_byte()?;
        if self.csv.page_size == 0 {
            return invalid("csv.page_size must be greater than 0");
        }
        if self.quiz.session_gap_seconds == 0 {
            return invalid("quiz.session_gap_seconds must be greater than 0");
        }
        if self.quiz.groups_per_page == 0 {
            return invalid("quiz.groups_per_page must be greater than 0");
        }
        if !self.logging.console_output && !self.logging.file_output {
            return invalid("at least one of logging.console_output and logging.file_output must be enabled");
        }
        Ok(())
    }
}

/// Configuration manager for loading and saving settings
pub struct ConfigManager {
    pub config_path: PathBuf,
}

impl ConfigManager {
    /// Get the application configuration directory
    pub fn get_config_dir() -> Result<PathBuf> {
        let config_dir = dirs::config_dir()
            .context("Failed to get user config directory")?
            .join(APP_DIR_NAME);
        Ok(config_dir)
    }

    /// Get application data directory (database, logs)
    pub fn get_app_data_dir() -> Result<PathBuf> {
        let data_dir = dirs::data_local_dir()
            .context("Failed to get user data directory")?
            .join(APP_DIR_NAME);
        Ok(data_dir)
    }

    pub fn new() -> Result<Self> {
        Ok(Self {
            config_path: Self::get_config_dir()?.join(CONFIG_FILE_NAME),
        })
    }

    pub fn with_path(config_path: impl Into<PathBuf>) -> Self {
        Self {
            config_path: config_path.into(),
        }
    }

    /// Loads the configuration, writing the defaults first if the file does not exist yet.
    pub async fn load_config(&self) -> Result<AppConfig> {
        if !self.config_path.exists() {
            info!("🎉 First run detected - writing default configuration to {:?}", self.config_path);
            self.save_config(&AppConfig::default()).await?;
        }

        let config = AppConfig::from_file(&self.config_path)
            .with_context(|| format!("Invalid configuration in {:?}", self.config_path))?;
        info!("Loaded configuration from: {:?}", self.config_path);
        Ok(config)
    }

    pub async fn save_config(&self, config: &AppConfig) -> Result<()> {
        if let Some(dir) = self.config_path.parent().filter(|d| !d.as_os_str().is_empty()) {
            fs::create_dir_all(dir)
                .await
                .with_context(|| format!("Failed to create config directory {:?}", dir))?;
        }

        let content = serde_json::to_string_pretty(config).context("Failed to serialize configuration")?;
        fs::write(&self.config_path, content)
            .await
            .with_context(|| format!("Failed to write configuration to {:?}", self.config_path))?;

        info!("✅ Configuration saved to: {:?}", self.config_path);
        Ok(())
    }

    pub fn config_path(&self) -> &PathBuf {
        &self.config_path
    }
}

/// Default configuration values
pub mod defaults {
    pub const DATABASE_FILE: &str = "commondb.db";
    pub const MAX_CONNECTIONS: u32 = 5;

    /// Rows per flush
    pub const BATCH_SIZE: usize = 500;

    pub const LOCK_POLL_INTERVAL_MS: u64 = 1000;
    pub const LOCK_ACQUIRE_TIMEOUT_SECS: u64 = 300;
    /// Locks held longer than this are treated as abandoned
    pub const LOCK_MAX_HOLD_SECS: u64 = 1800;

    pub const CRM_PERSONS_URL: &str = "http://localhost:8080/api/v1/persons";
    pub const CRM_PAGE_SIZE: u32 = 100;
    pub const CRM_REQUEST_DELAY_MS: u64 = 200;
    pub const REQUEST_TIMEOUT_SECONDS: u64 = 30;
    pub const MAX_REQUESTS_PER_SECOND: u32 = 5;

    pub const CSV_PAGE_SIZE: usize = 1000;
    pub const CSV_SOURCE: &str = "csv";

    pub const SESSION_GAP_SECONDS: u64 = 600;
    pub const QUIZ_GROUPS_PER_PAGE: u32 = 200;

    pub const LOG_MAX_FILES: u32 = 7;
}
