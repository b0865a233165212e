//! Person rows of the common database
//!
//! A person is identified by a normalized email address. Every source adapter
//! (CRM API, CSV exports) maps its raw records into [`PersonRow`] and the
//! pipeline merges them with [`Mergeable::reconcile`].

#![allow(clippy::uninlined_format_args)]

use once_cell::sync::Lazy;
use regex::Regex;
use serde::{Deserialize, Serialize};

use crate::domain::merge::{first_filled, first_present, flag, Mergeable};
use crate::domain::record::{SyncRecord, UpsertContract};
use crate::sync::error::RecordError;

static EMAIL_RE: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"^[a-z0-9._%+\-]+@[a-z0-9\-]+(\.[a-z0-9\-]+)*\.[a-z]{2,}$")
        .unwrap_or_else(|e| panic!("invalid email pattern: {e}"))
});

static NON_DIGITS_RE: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"\D").unwrap_or_else(|e| panic!("invalid phone pattern: {e}")));

/// Lowercases and trims an email, rejecting anything that does not look like one.
pub fn normalize_email(raw: &str) -> Result<String, RecordError> {
    let email = raw.trim().to_lowercase();
    if EMAIL_RE.is_match(&email) {
        Ok(email)
    } else {
        Err(RecordError::InvalidEmail(raw.trim().to_string()))
    }
}

/// Strips formatting from a phone number. Russian numbers written with a
/// leading `8` are rewritten to the `7` country code.
pub fn normalize_phone(raw: &str) -> Option<String> {
    let digits = NON_DIGITS_RE.replace_all(raw, "");
    if digits.len() < 10 {
        return None;
    }
    let phone = if digits.len() == 11 && digits.starts_with('8') {
        format!("7{}", &digits[1..])
    } else if digits.len() == 10 {
        format!("7{}", digits)
    } else {
        digits.into_owned()
    };
    Some(phone)
}

fn clean(value: Option<String>) -> Option<String> {
    value
        .map(|v| v.trim().to_string())
        .filter(|v| !v.is_empty())
}

/// One person as written to the `persons` table.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct PersonRow {
    pub email: String,
    pub phone: Option<String>,
    pub first_name: Option<String>,
    pub last_name: Option<String>,
    pub city: Option<String>,
    pub company: Option<String>,
    pub position: Option<String>,
    /// Identifier in the CRM, `0`/`None` when unknown
    pub crm_id: Option<i64>,
    /// Number of quizzes the person completed (count field)
    pub quiz_count: Option<i64>,
    /// Marketing subscription flag
    pub is_subscribed: Option<bool>,
    /// Source that first created the row (insert-only)
    pub source: String,
}

impl PersonRow {
    pub const CONTRACT: UpsertContract = UpsertContract {
        table: "persons",
        natural_key: &["email"],
        mergeable_fields: &[
            "phone",
            "first_name",
            "last_name",
            "city",
            "company",
            "position",
            "crm_id",
            "quiz_count",
            "is_subscribed",
        ],
    };

    /// Builds a row from loosely typed source values, normalizing key fields.
    pub fn from_source(
        source: &str,
        email: Option<&str>,
        phone: Option<&str>,
    ) -> Result<Self, RecordError> {
        let email = email
            .filter(|e| !e.trim().is_empty())
            .ok_or(RecordError::MissingField("email"))?;
        Ok(Self {
            email: normalize_email(email)?,
            phone: phone.and_then(normalize_phone),
            source: source.to_string(),
            ..Self::default()
        })
    }

    pub fn with_names(
        mut self,
        first_name: Option<String>,
        last_name: Option<String>,
    ) -> Self {
        self.first_name = clean(first_name);
        self.last_name = clean(last_name);
        self
    }

    pub fn with_work(
        mut self,
        company: Option<String>,
        position: Option<String>,
        city: Option<String>,
    ) -> Self {
        self.company = clean(company);
        self.position = clean(position);
        self.city = clean(city);
        self
    }
}

impl Mergeable for PersonRow {
    fn normalized(mut self) -> Self {
        self.is_subscribed = Some(self.is_subscribed.unwrap_or(false));
        self
    }

    fn reconcile(existing: Self, incoming: Self) -> Self {
        Self {
            email: existing.email,
            phone: first_filled(existing.phone, incoming.phone),
            first_name: first_filled(existing.first_name, incoming.first_name),
            last_name: first_filled(existing.last_name, incoming.last_name),
            city: first_filled(existing.city, incoming.city),
            company: first_filled(existing.company, incoming.company),
            position: first_filled(existing.position, incoming.position),
            crm_id: first_filled(existing.crm_id, incoming.crm_id),
            quiz_count: first_present(existing.quiz_count, incoming.quiz_count),
            is_subscribed: Some(flag(existing.is_subscribed, incoming.is_subscribed)),
            source: existing.source,
        }
    }
}

impl SyncRecord for PersonRow {
    type Key = String;

    fn natural_key(&self) -> String {
        self.email.clone()
    }

    fn approx_size(&self) -> usize {
        let text = [
            &self.phone,
            &self.first_name,
            &self.last_name,
            &self.city,
            &self.company,
            &self.position,
        ]
        .iter()
        .map(|f| f.as_ref().map_or(0, String::capacity))
        .sum::<usize>();
        std::mem::size_of::<Self>() + self.email.capacity() + self.source.capacity() + text
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::merge::{merge, MergeOutcome};
    use proptest::prelude::*;
    use rstest::rstest;

    fn stored() -> PersonRow {
        PersonRow {
            email: "ivan@example.com".into(),
            phone: Some("79161234567".into()),
            first_name: Some("Ivan".into()),
            last_name: None,
            city: Some(String::new()),
            company: None,
            position: Some("CTO".into()),
            crm_id: Some(0),
            quiz_count: Some(0),
            is_subscribed: Some(false),
            source: "crm".into(),
        }
    }

    #[rstest]
    #[case(" Ivan@Example.COM ", Some("ivan@example.com"))]
    #[case("first.last+tag@mail.co.uk", Some("first.last+tag@mail.co.uk"))]
    #[case("not-an-email", None)]
    #[case("a@b", None)]
    fn normalizes_emails(#[case] raw: &str, #[case] expected: Option<&str>) {
        assert_eq!(normalize_email(raw).ok().as_deref(), expected);
    }

    #[rstest]
    #[case("+7 (916) 123-45-67", Some("79161234567"))]
    #[case("8 916 123 45 67", Some("79161234567"))]
    #[case("9161234567", Some("79161234567"))]
    #[case("123", None)]
    fn normalizes_phones(#[case] raw: &str, #[case] expected: Option<&str>) {
        assert_eq!(normalize_phone(raw).as_deref(), expected);
    }

    #[test]
    fn missing_email_is_a_record_error() {
        assert_eq!(
            PersonRow::from_source("csv", None, Some("+79161234567")),
            Err(RecordError::MissingField("email"))
        );
        assert_eq!(
            PersonRow::from_source("csv", Some("  "), None),
            Err(RecordError::MissingField("email"))
        );
    }

    #[test]
    fn insert_defaults_subscription_flag() {
        let row = PersonRow::from_source("csv", Some("a@b.io"), None).unwrap();
        match merge(None, row) {
            MergeOutcome::Insert(row) => assert_eq!(row.is_subscribed, Some(false)),
            MergeOutcome::Update(_) => panic!("expected insert"),
        }
    }

    #[test]
    fn update_fills_only_blank_fields() {
        let incoming = PersonRow {
            email: "ivan@example.com".into(),
            phone: Some("70000000000".into()),
            first_name: Some("Johann".into()),
            last_name: Some("Petrov".into()),
            city: Some("Moscow".into()),
            company: Some("Acme".into()),
            position: None,
            crm_id: Some(42),
            quiz_count: Some(3),
            is_subscribed: Some(true),
            source: "sendsay".into(),
        };

        let merged = merge(Some(stored()), incoming).into_row();
        assert_eq!(merged.phone.as_deref(), Some("79161234567"));
        assert_eq!(merged.first_name.as_deref(), Some("Ivan"));
        assert_eq!(merged.last_name.as_deref(), Some("Petrov"));
        assert_eq!(merged.city.as_deref(), Some("Moscow"));
        assert_eq!(merged.company.as_deref(), Some("Acme"));
        assert_eq!(merged.position.as_deref(), Some("CTO"));
        assert_eq!(merged.crm_id, Some(42));
        // 0 completed quizzes is a real value
        assert_eq!(merged.quiz_count, Some(0));
        // The defaulted `false` is filled by the first source that subscribes
        assert_eq!(merged.is_subscribed, Some(true));
        assert_eq!(merged.source, "crm");
    }

    #[test]
    fn contract_lists_insert_only_columns_as_not_mergeable() {
        assert!(PersonRow::CONTRACT.is_mergeable("phone"));
        assert!(!PersonRow::CONTRACT.is_mergeable("source"));
        assert!(!PersonRow::CONTRACT.is_mergeable("email"));
    }

    fn text() -> impl Strategy<Value = Option<String>> {
        prop_oneof![
            Just(None),
            Just(Some(String::new())),
            "[a-z]{1,8}".prop_map(Some),
        ]
    }

    prop_compose! {
        fn person()(
            phone in text(),
            first_name in text(),
            last_name in text(),
            city in text(),
            company in text(),
            position in text(),
            crm_id in proptest::option::of(0_i64..5),
            quiz_count in proptest::option::of(0_i64..5),
            is_subscribed in proptest::option::of(any::<bool>()),
        ) -> PersonRow {
            PersonRow {
                email: "p@example.com".into(),
                phone, first_name, last_name, city, company, position,
                crm_id, quiz_count, is_subscribed,
                source: "test".into(),
            }
        }
    }

    proptest! {
        #[test]
        fn populated_existing_values_always_win(existing in person(), incoming in person()) {
            let merged = PersonRow::reconcile(existing.clone(), incoming);
            for (before, after) in [
                (&existing.phone, &merged.phone),
                (&existing.first_name, &merged.first_name),
                (&existing.last_name, &merged.last_name),
                (&existing.city, &merged.city),
                (&existing.company, &merged.company),
                (&existing.position, &merged.position),
            ] {
                if before.as_deref().is_some_and(|v| !v.trim().is_empty()) {
                    prop_assert_eq!(before, after);
                }
            }
            if existing.crm_id.is_some_and(|id| id != 0) {
                prop_assert_eq!(existing.crm_id, merged.crm_id);
            }
            if existing.quiz_count.is_some() {
                prop_assert_eq!(existing.quiz_count, merged.quiz_count);
            }
            if existing.is_subscribed == Some(true) {
                prop_assert_eq!(Some(true), merged.is_subscribed);
            }
        }

        #[test]
        fn merging_twice_is_idempotent(existing in person(), incoming in person()) {
            let once = PersonRow::reconcile(existing, incoming.clone());
            let twice = PersonRow::reconcile(once.clone(), incoming);
            prop_assert_eq!(once, twice);
        }
    }
}
