//! CRM person source
//!
//! The CRM exposes persons through the generic paged protocol. This module
//! holds the wire DTO, the [`PageFetcher`] that calls the API and the mapper
//! turning CRM persons into [`PersonRow`]s.

use std::iter::{once, Once};

use anyhow::Result;
use async_trait::async_trait;
use serde::Deserialize;

use crate::domain::person::PersonRow;
use crate::infrastructure::http_client::HttpClient;
use crate::sync::cursor::{PageFetcher, PageRequest, PageResponse};
use crate::sync::error::RecordError;
use crate::sync::orchestrator::RecordMapper;

pub const CRM_SOURCE: &str = "crm";

/// A person as returned by the CRM API
#[derive(Debug, Clone, Default, PartialEq, Eq, Deserialize)]
#[serde(default)]
pub struct CrmPerson {
    pub id: i64,
    pub email: Option<String>,
    pub phone: Option<String>,
    #[serde(alias = "name")]
    pub first_name: Option<String>,
    #[serde(alias = "surname")]
    pub last_name: Option<String>,
    pub city: Option<String>,
    pub company: Option<String>,
    pub position: Option<String>,
    pub quiz_count: Option<i64>,
    pub is_subscribed: Option<bool>,
}

pub struct CrmPageFetcher {
    client: HttpClient,
    persons_url: String,
}

impl CrmPageFetcher {
    pub fn new(client: HttpClient, persons_url: impl Into<String>) -> Self {
        Self {
            client,
            persons_url: persons_url.into(),
        }
    }
}

#[async_trait]
impl PageFetcher for CrmPageFetcher {
    type Item = CrmPerson;

    async fn fetch(&self, request: &PageRequest) -> Result<PageResponse<CrmPerson>> {
        self.client.get_json(&self.persons_url, request).await
    }
}

#[derive(Debug, Clone, Copy, Default)]
pub struct CrmPersonMapper;

impl RecordMapper<CrmPerson> for CrmPersonMapper {
    type Row = PersonRow;
    type Output = Once<PersonRow>;

    fn map(&self, raw: CrmPerson) -> Result<Once<PersonRow>, RecordError> {
        if let Some(count) = raw.quiz_count.filter(|c| *c < 0) {
            return Err(RecordError::InvalidValue {
                field: "quiz_count",
                reason: format!("negative count {count}"),
            });
        }

        let row = PersonRow::from_source(CRM_SOURCE, raw.email.as_deref(), raw.phone.as_deref())?
            .with_names(raw.first_name, raw.last_name)
            .with_work(raw.company, raw.position, raw.city);

        Ok(once(PersonRow {
            crm_id: Some(raw.id).filter(|id| *id != 0),
            quiz_count: raw.quiz_count,
            is_subscribed: raw.is_subscribed,
            ..row
        }))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn maps_crm_page_payload() {
        let page: PageResponse<CrmPerson> = serde_json::from_str(
            r#"{
                "data": [
                    {"id": 17, "email": "Olga@Example.com", "name": "Olga", "phone": "8 (916) 555-44-33",
                     "quiz_count": 0, "is_subscribed": true, "unknown_field": 1}
                ],
                "next_page_url": null
            }"#,
        )
        .unwrap();

        let row = CrmPersonMapper
            .map(page.data[0].clone())
            .unwrap()
            .next()
            .unwrap();
        assert_eq!(row.email, "olga@example.com");
        assert_eq!(row.first_name.as_deref(), Some("Olga"));
        assert_eq!(row.phone.as_deref(), Some("79165554433"));
        assert_eq!(row.crm_id, Some(17));
        assert_eq!(row.quiz_count, Some(0));
        assert_eq!(row.is_subscribed, Some(true));
        assert_eq!(row.source, CRM_SOURCE);
    }

    #[test]
    fn rejects_person_without_valid_email() {
        let raw = CrmPerson {
            id: 3,
            email: Some("nobody".into()),
            ..CrmPerson::default()
        };
        assert_eq!(
            CrmPersonMapper.map(raw).err(),
            Some(RecordError::InvalidEmail("nobody".into()))
        );
    }

    #[test]
    fn rejects_negative_counts() {
        let raw = CrmPerson {
            email: Some("a@example.com".into()),
            quiz_count: Some(-1),
            ..CrmPerson::default()
        };
        assert!(matches!(
            CrmPersonMapper.map(raw),
            Err(RecordError::InvalidValue { field: "quiz_count", .. })
        ));
    }
}
