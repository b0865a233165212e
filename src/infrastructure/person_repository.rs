//! `persons` destination of the common database
//!
//! Rows are looked up by email and written inside the orchestrator's
//! transaction. The UPDATE statement is built from
//! [`PersonRow::CONTRACT`], so insert-only columns (`source`, `created_at`)
//! can never be overwritten by a merge. Every written person also gets a
//! `person_sources` link for the source of the current run.

#![allow(clippy::uninlined_format_args)]

use std::collections::HashMap;

use async_trait::async_trait;
use once_cell::sync::Lazy;
use sqlx::query::Query;
use sqlx::sqlite::{SqliteArguments, SqliteRow};
use sqlx::{QueryBuilder, Row, Sqlite, SqliteConnection};

use crate::domain::merge::MergeOutcome;
use crate::domain::person::PersonRow;
use crate::sync::orchestrator::DestinationStore;

/// Upper bound of bound parameters per lookup query
const LOOKUP_CHUNK: usize = 500;

const SELECT_COLUMNS: &str = "SELECT email, phone, first_name, last_name, city, company, position, \
     crm_id, quiz_count, is_subscribed, source FROM persons";

const INSERT_SQL: &str = r#"
    INSERT INTO persons (
        email, phone, first_name, last_name, city, company, position,
        crm_id, quiz_count, is_subscribed, source
    ) VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)
"#;

static UPDATE_SQL: Lazy<String> = Lazy::new(|| {
    let assignments = PersonRow::CONTRACT
        .mergeable_fields
        .iter()
        .map(|field| format!("{} = ?", field))
        .collect::<Vec<_>>()
        .join(", ");
    format!(
        "UPDATE {} SET {}, updated_at = CURRENT_TIMESTAMP WHERE email = ?",
        PersonRow::CONTRACT.table,
        assignments
    )
});

#[derive(Debug, Clone)]
pub struct PersonStore {
    /// Source name recorded in `person_sources` for this run
    source: String,
}

impl PersonStore {
    pub fn new(source: impl Into<String>) -> Self {
        Self {
            source: source.into(),
        }
    }

    pub fn source(&self) -> &str {
        &self.source
    }

    pub async fn find_by_email(
        conn: &mut SqliteConnection,
        email: &str,
    ) -> Result<Option<PersonRow>, sqlx::Error> {
        let row = sqlx::query(&format!("{} WHERE email = ?", SELECT_COLUMNS))
            .bind(email)
            .fetch_optional(&mut *conn)
            .await?;
        Ok(row.as_ref().map(person_from_row))
    }

    pub async fn sources_of(conn: &mut SqliteConnection, email: &str) -> Result<Vec<String>, sqlx::Error> {
        let rows = sqlx::query("SELECT source FROM person_sources WHERE email = ? ORDER BY source")
            .bind(email)
            .fetch_all(&mut *conn)
            .await?;
        Ok(rows.iter().map(|row| row.get("source")).collect())
    }
}

fn person_from_row(row: &SqliteRow) -> PersonRow {
    PersonRow {
        email: row.get("email"),
        phone: row.get("phone"),
        first_name: row.get("first_name"),
        last_name: row.get("last_name"),
        city: row.get("city"),
        company: row.get("company"),
        position: row.get("position"),
        crm_id: row.get("crm_id"),
        quiz_count: row.get("quiz_count"),
        is_subscribed: Some(row.get::<bool, _>("is_subscribed")),
        source: row.get("source"),
    }
}

/// Binds the mergeable columns of `row` in contract order.
fn bind_mergeable<'q>(
    mut query: Query<'q, Sqlite, SqliteArguments<'q>>,
    row: &'q PersonRow,
) -> Result<Query<'q, Sqlite, SqliteArguments<'q>>, sqlx::Error> {
    for field in PersonRow::CONTRACT.mergeable_fields {
        query = match *field {
            "phone" => query.bind(row.phone.as_deref()),
            "first_name" => query.bind(row.first_name.as_deref()),
            "last_name" => query.bind(row.last_name.as_deref()),
            "city" => query.bind(row.city.as_deref()),
            "company" => query.bind(row.company.as_deref()),
            "position" => query.bind(row.position.as_deref()),
            "crm_id" => query.bind(row.crm_id),
            "quiz_count" => query.bind(row.quiz_count),
            "is_subscribed" => query.bind(row.is_subscribed.unwrap_or(false)),
            other => return Err(sqlx::Error::ColumnNotFound(other.to_string())),
        };
    }
    Ok(query)
}

#[async_trait]
impl DestinationStore<PersonRow> for PersonStore {
    fn resource(&self) -> &str {
        PersonRow::CONTRACT.table
    }

    async fn load_existing(
        &self,
        conn: &mut SqliteConnection,
        keys: &[String],
    ) -> Result<HashMap<String, PersonRow>, sqlx::Error> {
        let mut existing = HashMap::with_capacity(keys.len());

        for chunk in keys.chunks(LOOKUP_CHUNK) {
            let mut builder = QueryBuilder::<Sqlite>::new(SELECT_COLUMNS);
            builder.push(" WHERE email IN (");
            let mut separated = builder.separated(", ");
            for email in chunk {
                separated.push_bind(email.clone());
            }
            separated.push_unseparated(")");

            let rows = builder.build().fetch_all(&mut *conn).await?;
            for row in &rows {
                let person = person_from_row(row);
                existing.insert(person.email.clone(), person);
            }
        }

        tracing::debug!("Found {} of {} persons already stored", existing.len(), keys.len());
        Ok(existing)
    }

    async fn write_batch(
        &self,
        conn: &mut SqliteConnection,
        outcomes: &[MergeOutcome<PersonRow>],
    ) -> Result<(), sqlx::Error> {
        for outcome in outcomes {
            match outcome {
                MergeOutcome::Insert(row) => {
                    sqlx::query(INSERT_SQL)
                        .bind(&row.email)
                        .bind(row.phone.as_deref())
                        .bind(row.first_name.as_deref())
                        .bind(row.last_name.as_deref())
                        .bind(row.city.as_deref())
                        .bind(row.company.as_deref())
                        .bind(row.position.as_deref())
                        .bind(row.crm_id)
                        .bind(row.quiz_count)
                        .bind(row.is_subscribed.unwrap_or(false))
                        .bind(&row.source)
                        .execute(&mut *conn)
                        .await?;
                }
                MergeOutcome::Update(row) => {
                    bind_mergeable(sqlx::query(UPDATE_SQL.as_str()), row)?
                        .bind(&row.email)
                        .execute(&mut *conn)
                        .await?;
                }
            }

            sqlx::query("INSERT OR IGNORE INTO person_sources (email, source) VALUES (?, ?)")
                .bind(&outcome.row().email)
                .bind(&self.source)
                .execute(&mut *conn)
                .await?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::merge::merge;
    use crate::infrastructure::database_connection::DatabaseConnection;
    use tempfile::tempdir;

    #[test]
    fn update_statement_follows_contract() {
        assert_eq!(
            UPDATE_SQL.matches('?').count(),
            PersonRow::CONTRACT.mergeable_fields.len() + 1
        );
        assert!(!UPDATE_SQL.contains("source ="));
        assert!(!UPDATE_SQL.contains("created_at"));
    }

    #[tokio::test]
    async fn insert_then_merge_keeps_stored_values() -> anyhow::Result<()> {
        let dir = tempdir()?;
        let db = DatabaseConnection::new(&format!("sqlite:{}", dir.path().join("p.db").display()), 1).await?;
        db.migrate().await?;
        let mut conn = db.pool().acquire().await?;

        let first = PersonRow::from_source("crm", Some("anna@example.com"), Some("+79161112233"))?
            .with_names(Some("Anna".into()), None);
        PersonStore::new("crm")
            .write_batch(&mut conn, &[merge(None, first)])
            .await?;

        let csv_store = PersonStore::new("events.csv");
        let incoming = PersonRow::from_source("events.csv", Some("anna@example.com"), Some("+70000000000"))?
            .with_names(Some("Anya".into()), Some("Ivanova".into()));
        let existing = csv_store
            .load_existing(&mut conn, &["anna@example.com".to_string()])
            .await?
            .remove("anna@example.com");
        assert!(existing.is_some());
        csv_store
            .write_batch(&mut conn, &[merge(existing, incoming)])
            .await?;

        let stored = PersonStore::find_by_email(&mut conn, "anna@example.com")
            .await?
            .expect("person stored");
        assert_eq!(stored.first_name.as_deref(), Some("Anna"));
        assert_eq!(stored.last_name.as_deref(), Some("Ivanova"));
        assert_eq!(stored.phone.as_deref(), Some("79161112233"));
        assert_eq!(stored.source, "crm");
        assert_eq!(stored.is_subscribed, Some(false));
        assert_eq!(
            PersonStore::sources_of(&mut conn, "anna@example.com").await?,
            vec!["crm".to_string(), "events.csv".to_string()]
        );
        Ok(())
    }
}
