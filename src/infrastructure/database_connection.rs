// Database connection and pool management
// SQLite through sqlx; the schema is created in place by `migrate`

use std::path::Path;
use std::str::FromStr;
use std::time::Duration;

use anyhow::{Context, Result};
use sqlx::sqlite::{SqliteConnectOptions, SqliteJournalMode, SqlitePoolOptions};
use sqlx::SqlitePool;

const SCHEMA: &[(&str, &str)] = &[
    (
        "sync_locks",
        r#"
            CREATE TABLE IF NOT EXISTS sync_locks (
                resource_name TEXT PRIMARY KEY,
                is_writing INTEGER NOT NULL DEFAULT 0,
                locked_at INTEGER,
                holder_id TEXT
            )
        "#,
    ),
    (
        "persons",
        r#"
            CREATE TABLE IF NOT EXISTS persons (
                email TEXT PRIMARY KEY,
                phone TEXT,
                first_name TEXT,
                last_name TEXT,
                city TEXT,
                company TEXT,
                position TEXT,
                crm_id INTEGER,
                quiz_count INTEGER,
                is_subscribed INTEGER NOT NULL DEFAULT 0,
                source TEXT NOT NULL,
                created_at DATETIME NOT NULL DEFAULT CURRENT_TIMESTAMP,
                updated_at DATETIME NOT NULL DEFAULT CURRENT_TIMESTAMP
            )
        "#,
    ),
    (
        "person_sources",
        r#"
            CREATE TABLE IF NOT EXISTS person_sources (
                email TEXT NOT NULL,
                source TEXT NOT NULL,
                first_seen_at DATETIME NOT NULL DEFAULT CURRENT_TIMESTAMP,
                PRIMARY KEY (email, source),
                FOREIGN KEY (email) REFERENCES persons (email) ON DELETE CASCADE
            )
        "#,
    ),
    (
        "quiz_actions",
        r#"
            CREATE TABLE IF NOT EXISTS quiz_actions (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                subject_id INTEGER NOT NULL,
                series_key TEXT NOT NULL,
                occurred_at INTEGER NOT NULL,
                is_answer INTEGER NOT NULL DEFAULT 0
            )
        "#,
    ),
    (
        "quiz_sessions",
        r#"
            CREATE TABLE IF NOT EXISTS quiz_sessions (
                subject_id INTEGER NOT NULL,
                series_key TEXT NOT NULL,
                window_start INTEGER NOT NULL,
                window_end INTEGER NOT NULL,
                event_count INTEGER NOT NULL,
                satisfied INTEGER NOT NULL DEFAULT 0,
                updated_at DATETIME NOT NULL DEFAULT CURRENT_TIMESTAMP,
                PRIMARY KEY (subject_id, series_key, window_start)
            )
        "#,
    ),
];

const INDEXES: &[&str] = &[
    "CREATE INDEX IF NOT EXISTS idx_quiz_actions_group ON quiz_actions (subject_id, series_key, occurred_at)",
    "CREATE INDEX IF NOT EXISTS idx_quiz_actions_occurred_at ON quiz_actions (occurred_at)",
    "CREATE INDEX IF NOT EXISTS idx_persons_crm_id ON persons (crm_id)",
];

pub struct DatabaseConnection {
    pool: SqlitePool,
}

impl DatabaseConnection {
    pub async fn new(database_url: &str, max_connections: u32) -> Result<Self> {
        let db_path = database_url
            .strip_prefix("sqlite://")
            .or_else(|| database_url.strip_prefix("sqlite:"))
            .unwrap_or(database_url);

        if let Some(parent) = Path::new(db_path).parent().filter(|p| !p.as_os_str().is_empty()) {
            tokio::fs::create_dir_all(parent)
                .await
                .with_context(|| format!("Failed to create database directory {}", parent.display()))?;
        }

        // WAL keeps readers from blocking the lock table while a batch is written
        let options = SqliteConnectOptions::from_str(database_url)
            .with_context(|| format!("Invalid database URL: {database_url}"))?
            .create_if_missing(true)
            .journal_mode(SqliteJournalMode::Wal)
            .busy_timeout(Duration::from_secs(5))
            .foreign_keys(true);

        let pool = SqlitePoolOptions::new()
            .max_connections(max_connections.max(1))
            .connect_with(options)
            .await
            .with_context(|| format!("Failed to open database {database_url}"))?;

        Ok(Self { pool })
    }

    pub fn pool(&self) -> &SqlitePool {
        &self.pool
    }

    pub async fn migrate(&self) -> Result<()> {
        for (table, sql) in SCHEMA {
            sqlx::query(sql)
                .execute(&self.pool)
                .await
                .with_context(|| format!("Failed to create table {table}"))?;
        }
        for sql in INDEXES {
            sqlx::query(sql).execute(&self.pool).await?;
        }

        tracing::info!("✅ Database schema is up to date ({} tables)", SCHEMA.len());
        Ok(())
    }

    pub async fn close(&self) {
        self.pool.close().await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[tokio::test]
    async fn test_database_connection_creates_missing_directories() -> Result<()> {
        let temp_dir = tempdir()?;
        let db_path = temp_dir.path().join("nested").join("commondb.db");
        let database_url = format!("sqlite:{}", db_path.display());

        let db = DatabaseConnection::new(&database_url, 2).await?;

        assert!(!db.pool().is_closed());
        assert!(db_path.exists());
        Ok(())
    }

    #[tokio::test]
    async fn test_database_migration_is_repeatable() -> Result<()> {
        let temp_dir = tempdir()?;
        let database_url = format!("sqlite:{}", temp_dir.path().join("migrate.db").display());

        let db = DatabaseConnection::new(&database_url, 2).await?;
        db.migrate().await?;
        db.migrate().await?;

        for (table, _) in SCHEMA {
            let found = sqlx::query("SELECT name FROM sqlite_master WHERE type = 'table' AND name = ?")
                .bind(table)
                .fetch_optional(db.pool())
                .await?;
            assert!(found.is_some(), "missing table {table}");
        }
        Ok(())
    }
}
