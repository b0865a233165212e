//! Record mappers for the built-in sources
//!
//! CRM persons are mapped next to their API client in
//! `infrastructure::crm_client`.

use std::iter::{once, Once};

use crate::domain::person::PersonRow;
use crate::domain::session_window::{SessionWindow, SessionWindower};
use crate::sync::action_cursor::ActionGroup;
use crate::sync::error::RecordError;
use crate::sync::file_cursor::CsvRow;
use crate::sync::orchestrator::RecordMapper;

/// Header aliases accepted in person exports
const EMAIL_COLUMNS: &[&str] = &["email", "e-mail", "mail"];
const PHONE_COLUMNS: &[&str] = &["phone", "phone number", "mobile", "telephone"];
const FIRST_NAME_COLUMNS: &[&str] = &["first_name", "first name", "firstname", "name"];
const LAST_NAME_COLUMNS: &[&str] = &["last_name", "last name", "lastname", "surname"];
const SUBSCRIBED_COLUMNS: &[&str] = &["is_subscribed", "subscribed"];

/// Maps rows of a person export (CSV/TSV) to [`PersonRow`]s.
#[derive(Debug, Clone)]
pub struct CsvPersonMapper {
    source: String,
}

impl CsvPersonMapper {
    pub fn new(source: impl Into<String>) -> Self {
        Self {
            source: source.into(),
        }
    }
}

fn parse_flag(value: &str) -> Result<bool, RecordError> {
    match value.to_lowercase().as_str() {
        "1" | "true" | "yes" | "y" | "да" => Ok(true),
        "0" | "false" | "no" | "n" | "нет" => Ok(false),
        other => Err(RecordError::InvalidValue {
            field: "is_subscribed",
            reason: format!("'{other}' is not a yes/no value"),
        }),
    }
}

fn parse_count(field: &'static str, value: &str) -> Result<i64, RecordError> {
    value
        .parse::<i64>()
        .ok()
        .filter(|n| *n >= 0)
        .ok_or_else(|| RecordError::InvalidValue {
            field,
            reason: format!("'{value}' is not a non-negative number"),
        })
}

impl RecordMapper<CsvRow> for CsvPersonMapper {
    type Row = PersonRow;
    type Output = Once<PersonRow>;

    fn map(&self, raw: CsvRow) -> Result<Once<PersonRow>, RecordError> {
        let text = |columns: &[&str]| raw.first_of(columns).map(str::to_string);

        let row = PersonRow::from_source(&self.source, raw.first_of(EMAIL_COLUMNS), raw.first_of(PHONE_COLUMNS))
            .map_err(|e| match e {
                RecordError::MissingField(field) => RecordError::MalformedRow {
                    line: raw.line,
                    reason: format!("no {field} column value"),
                },
                other => other,
            })?
            .with_names(text(FIRST_NAME_COLUMNS), text(LAST_NAME_COLUMNS))
            .with_work(text(&["company"]), text(&["position"]), text(&["city"]));

        Ok(once(PersonRow {
            crm_id: raw.get("crm_id").map(|v| parse_count("crm_id", v)).transpose()?,
            quiz_count: raw.get("quiz_count").map(|v| parse_count("quiz_count", v)).transpose()?,
            is_subscribed: raw.first_of(SUBSCRIBED_COLUMNS).map(parse_flag).transpose()?,
            ..row
        }))
    }
}

/// Windows a subject's action history into session rows.
#[derive(Debug, Clone, Copy, Default)]
pub struct QuizSessionMapper {
    windower: SessionWindower,
}

impl QuizSessionMapper {
    pub fn new(windower: SessionWindower) -> Self {
        Self { windower }
    }
}

impl RecordMapper<ActionGroup> for QuizSessionMapper {
    type Row = SessionWindow;
    type Output = Vec<SessionWindow>;

    fn map(&self, raw: ActionGroup) -> Result<Vec<SessionWindow>, RecordError> {
        self.windower
            .windows(&raw.events)
            .map_err(|e| RecordError::InvalidValue {
                field: "occurred_at",
                reason: e.to_string(),
            })
    }
}
