//! `quiz_sessions` destination and `quiz_actions` reads
//!
//! Windows are stored with millisecond timestamps and keyed by
//! `(subject_id, series_key, window_start)`.
//!
//! Every stored window starts at a recorded action, and every action falls in
//! exactly one recomputed window. A stored row whose start lies strictly inside
//! a recomputed window of its group was superseded (a backfilled action moved
//! the anchor) and is removed when that window is written.

use std::collections::HashMap;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::sqlite::SqliteRow;
use sqlx::{QueryBuilder, Row, Sqlite, SqliteConnection, SqlitePool};

use crate::domain::merge::MergeOutcome;
use crate::domain::session_window::{ActionEvent, SessionWindow};
use crate::sync::orchestrator::DestinationStore;

/// Three bound parameters per key
const LOOKUP_CHUNK: usize = 300;

type SessionKey = (i64, String, i64);

#[derive(Debug, Clone, Copy, Default)]
pub struct QuizSessionStore;

fn millis_to_utc(millis: i64) -> DateTime<Utc> {
    DateTime::from_timestamp_millis(millis).unwrap_or_default()
}

fn window_from_row(row: &SqliteRow) -> SessionWindow {
    SessionWindow {
        subject_id: row.get("subject_id"),
        series_key: row.get("series_key"),
        window_start: millis_to_utc(row.get("window_start")),
        window_end: millis_to_utc(row.get("window_end")),
        event_count: row.get::<i64, _>("event_count").try_into().unwrap_or(u32::MAX),
        satisfied: row.get("satisfied"),
    }
}

impl QuizSessionStore {
    pub async fn sessions_of(pool: &SqlitePool, subject_id: i64) -> Result<Vec<SessionWindow>, sqlx::Error> {
        let rows = sqlx::query(
            "SELECT subject_id, series_key, window_start, window_end, event_count, satisfied \
             FROM quiz_sessions WHERE subject_id = ? ORDER BY series_key, window_start",
        )
        .bind(subject_id)
        .fetch_all(pool)
        .await?;
        Ok(rows.iter().map(window_from_row).collect())
    }

    /// Appends raw actions; used by upstream collectors and tests.
    pub async fn record_actions(pool: &SqlitePool, events: &[ActionEvent]) -> Result<(), sqlx::Error> {
        let mut tx = pool.begin().await?;
        for event in events {
            sqlx::query(
                "INSERT INTO quiz_actions (subject_id, series_key, occurred_at, is_answer) VALUES (?, ?, ?, ?)",
            )
            .bind(event.subject_id)
            .bind(&event.series_key)
            .bind(event.occurred_at.timestamp_millis())
            .bind(event.is_answer)
            .execute(&mut *tx)
            .await?;
        }
        tx.commit().await
    }
}

#[async_trait]
impl DestinationStore<SessionWindow> for QuizSessionStore {
    fn resource(&self) -> &str {
        SessionWindow::CONTRACT.table
    }

    async fn load_existing(
        &self,
        conn: &mut SqliteConnection,
        keys: &[SessionKey],
    ) -> Result<HashMap<SessionKey, SessionWindow>, sqlx::Error> {
        let mut existing = HashMap::with_capacity(keys.len());

        for chunk in keys.chunks(LOOKUP_CHUNK) {
            let mut builder = QueryBuilder::<Sqlite>::new(
                "SELECT subject_id, series_key, window_start, window_end, event_count, satisfied \
                 FROM quiz_sessions WHERE ",
            );
            for (i, (subject_id, series_key, window_start)) in chunk.iter().enumerate() {
                if i > 0 {
                    builder.push(" OR ");
                }
                builder
                    .push("(subject_id = ")
                    .push_bind(*subject_id)
                    .push(" AND series_key = ")
                    .push_bind(series_key.clone())
                    .push(" AND window_start = ")
                    .push_bind(*window_start)
                    .push(")");
            }

            for row in builder.build().fetch_all(&mut *conn).await? {
                let window = window_from_row(&row);
                existing.insert(
                    (
                        window.subject_id,
                        window.series_key.clone(),
                        window.window_start.timestamp_millis(),
                    ),
                    window,
                );
            }
        }
        Ok(existing)
    }

    async fn write_batch(
        &self,
        conn: &mut SqliteConnection,
        outcomes: &[MergeOutcome<SessionWindow>],
    ) -> Result<(), sqlx::Error> {
        let mut superseded = 0;
        for outcome in outcomes {
            let window = outcome.row();
            superseded += sqlx::query(
                "DELETE FROM quiz_sessions \
                 WHERE subject_id = ? AND series_key = ? AND window_start > ? AND window_start <= ?",
            )
            .bind(window.subject_id)
            .bind(&window.series_key)
            .bind(window.window_start.timestamp_millis())
            .bind(window.window_end.timestamp_millis())
            .execute(&mut *conn)
            .await?
            .rows_affected();
        }
        if superseded > 0 {
            tracing::debug!("Removed {} superseded quiz session windows", superseded);
        }

        for outcome in outcomes {
            let sql = match outcome {
                MergeOutcome::Insert(_) => {
                    "INSERT INTO quiz_sessions (window_end, event_count, satisfied, subject_id, series_key, window_start) \
                     VALUES (?, ?, ?, ?, ?, ?)"
                }
                MergeOutcome::Update(_) => {
                    "UPDATE quiz_sessions SET window_end = ?, event_count = ?, satisfied = ?, \
                     updated_at = CURRENT_TIMESTAMP \
                     WHERE subject_id = ? AND series_key = ? AND window_start = ?"
                }
            };
            let window = outcome.row();
            sqlx::query(sql)
                .bind(window.window_end.timestamp_millis())
                .bind(i64::from(window.event_count))
                .bind(window.satisfied)
                .bind(window.subject_id)
                .bind(&window.series_key)
                .bind(window.window_start.timestamp_millis())
                .execute(&mut *conn)
                .await?;
        }
        Ok(())
    }
}
