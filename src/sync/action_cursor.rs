//! Cursor over recorded quiz actions
//!
//! Pages are made of whole `(subject_id, series_key)` groups that had any
//! action since `since`. Each group carries its complete, time-ordered action
//! history so that windows are always recomputed from the same anchor.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use futures::TryStreamExt;
use sqlx::{Row, SqlitePool};
use tracing::info;

use crate::domain::session_window::ActionEvent;
use crate::sync::cursor::{CursorStats, Page, SourceCursor};
use crate::sync::error::SyncResult;

/// All actions of one subject in one series, oldest first.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ActionGroup {
    pub subject_id: i64,
    pub series_key: String,
    pub events: Vec<ActionEvent>,
}

pub struct QuizActionCursor {
    pool: SqlitePool,
    since_ms: i64,
    groups_per_page: u32,
    /// Last group returned; the next page starts after it
    last_key: Option<(i64, String)>,
    page: u32,
    finished: bool,
    stats: CursorStats,
}

impl QuizActionCursor {
    pub fn new(pool: SqlitePool, since: Option<DateTime<Utc>>, groups_per_page: u32) -> Self {
        Self {
            pool,
            since_ms: since.map_or(i64::MIN, |s| s.timestamp_millis()),
            groups_per_page: groups_per_page.max(1),
            last_key: None,
            page: 0,
            finished: false,
            stats: CursorStats::default(),
        }
    }

    async fn next_groups(&self) -> SyncResult<Vec<(i64, String)>> {
        let (after_subject, after_series) = self
            .last_key
            .clone()
            .unwrap_or((i64::MIN, String::new()));

        let rows = sqlx::query(
            r#"
            SELECT DISTINCT subject_id, series_key
            FROM quiz_actions
            WHERE occurred_at >= ?1
              AND (subject_id > ?2 OR (subject_id = ?2 AND series_key > ?3))
            ORDER BY subject_id, series_key
            LIMIT ?4
            "#,
        )
        .bind(self.since_ms)
        .bind(after_subject)
        .bind(after_series)
        .bind(i64::from(self.groups_per_page))
        .fetch_all(&self.pool)
        .await?;

        Ok(rows
            .iter()
            .map(|row| (row.get("subject_id"), row.get("series_key")))
            .collect())
    }

    async fn load_group(&self, subject_id: i64, series_key: String) -> SyncResult<ActionGroup> {
        let events = sqlx::query(
            r#"
            SELECT occurred_at, is_answer
            FROM quiz_actions
            WHERE subject_id = ? AND series_key = ?
            ORDER BY occurred_at, id
            "#,
        )
        .bind(subject_id)
        .bind(&series_key)
        .fetch(&self.pool)
        .map_ok(|row| ActionEvent {
            subject_id,
            series_key: series_key.clone(),
            occurred_at: DateTime::from_timestamp_millis(row.get("occurred_at")).unwrap_or_default(),
            is_answer: row.get("is_answer"),
        })
        .try_collect::<Vec<_>>()
        .await?;

        Ok(ActionGroup {
            subject_id,
            series_key,
            events,
        })
    }
}

#[async_trait]
impl SourceCursor for QuizActionCursor {
    type Item = ActionGroup;

    async fn next(&mut self) -> SyncResult<Page<ActionGroup>> {
        if self.finished {
            return Ok(Page::exhausted(self.page));
        }

        let keys = self.next_groups().await?;
        let has_more = keys.len() >= self.groups_per_page as usize;
        self.last_key = keys.last().cloned();

        let mut items = Vec::with_capacity(keys.len());
        for (subject_id, series_key) in keys {
            let group = self.load_group(subject_id, series_key).await?;
            self.stats.items += group.events.len() as u64;
            items.push(group);
        }

        self.page += 1;
        self.stats.pages += 1;
        self.finished = !has_more;
        if self.finished {
            info!(
                "📄 quiz_actions exhausted after {} pages ({} actions)",
                self.stats.pages, self.stats.items
            );
        }

        Ok(Page {
            items,
            has_more,
            page: self.page,
        })
    }

    fn name(&self) -> &str {
        "quiz_actions"
    }

    fn stats(&self) -> CursorStats {
        self.stats
    }
}
