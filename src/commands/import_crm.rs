//! `import-crm`: pull persons from the CRM API into `persons`

use std::collections::BTreeMap;
use std::time::Duration;

use anyhow::Result;
use chrono::NaiveDate;
use tracing::info;

use super::{CommandContext, RunOverrides, SyncSummary};
use crate::infrastructure::crm_client::{CrmPageFetcher, CrmPersonMapper, CRM_SOURCE};
use crate::infrastructure::http_client::HttpClient;
use crate::infrastructure::person_repository::PersonStore;
use crate::sync::cursor::{PagedApiCursor, PagedApiOptions};

#[derive(Debug, Clone, Default, clap::Args)]
pub struct ImportCrmArgs {
    /// Persons requested per page (defaults to crm.page_size)
    #[arg(long)]
    pub chunk: Option<u32>,

    /// Only persons changed on or after this date (YYYY-MM-DD)
    #[arg(long)]
    pub updated_after: Option<NaiveDate>,

    #[command(flatten)]
    pub run: RunOverrides,
}

pub async fn import_crm(ctx: &CommandContext, args: ImportCrmArgs) -> Result<SyncSummary> {
    let crm = &ctx.config.crm;
    let client = HttpClient::new(crm.http_client_config())?;

    let mut filters = BTreeMap::new();
    if let Some(date) = args.updated_after {
        filters.insert("updated_after".to_string(), date.to_string());
    }

    let options = PagedApiOptions {
        page_size: args.chunk.unwrap_or(crm.page_size),
        delay: Duration::from_millis(crm.request_delay_ms),
        filters,
    };
    info!("Importing CRM persons from {} ({} per page)", crm.persons_url, options.page_size);

    let mut cursor = PagedApiCursor::new(CRM_SOURCE, CrmPageFetcher::new(client, &crm.persons_url), options);
    let store = PersonStore::new(CRM_SOURCE);

    Ok(ctx.execute(&mut cursor, &CrmPersonMapper, &store, &args.run).await)
}
