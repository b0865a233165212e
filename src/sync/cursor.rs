//! # Source cursors
//!
//! A cursor hands out a source in pages so that only one page (plus the batch
//! buffer) is ever held in memory. [`PagedApiCursor`] drives any HTTP API
//! that speaks the `{page, page_size, filters}` / `{data, next_page_url}`
//! protocol through a [`PageFetcher`].

use std::collections::BTreeMap;
use std::time::Duration;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tracing::{debug, info};

use crate::sync::error::{SyncError, SyncResult};

/// One page of raw source records.
#[derive(Debug, Clone, PartialEq)]
pub struct Page<T> {
    pub items: Vec<T>,
    pub has_more: bool,
    /// 1-based page number
    pub page: u32,
}

impl<T> Page<T> {
    pub fn exhausted(page: u32) -> Self {
        Self {
            items: Vec::new(),
            has_more: false,
            page,
        }
    }
}

/// Counters kept by a cursor while iterating.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct CursorStats {
    pub pages: u32,
    pub items: u64,
    /// Source rows that could not be decoded and were skipped
    pub malformed: u64,
}

#[async_trait]
pub trait SourceCursor: Send {
    type Item: Send;

    /// Fetches the next page. Once a page with `has_more == false` was
    /// returned, further calls yield empty pages without touching the source.
    async fn next(&mut self) -> SyncResult<Page<Self::Item>>;

    /// Name used in logs and errors
    fn name(&self) -> &str;

    fn stats(&self) -> CursorStats;
}

/// Request side of the paged source protocol.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct PageRequest {
    pub page: u32,
    pub page_size: u32,
    #[serde(flatten)]
    pub filters: BTreeMap<String, String>,
}

/// Response side of the paged source protocol.
#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct PageResponse<T> {
    #[serde(default = "Vec::new")]
    pub data: Vec<T>,
    #[serde(default)]
    pub next_page_url: Option<String>,
}

/// Performs one page request against a remote source.
#[async_trait]
pub trait PageFetcher: Send + Sync {
    type Item: Send;

    async fn fetch(&self, request: &PageRequest) -> anyhow::Result<PageResponse<Self::Item>>;
}

/// Settings of a paged API cursor
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PagedApiOptions {
    pub page_size: u32,
    /// Pause between two consecutive page requests
    pub delay: Duration,
    pub filters: BTreeMap<String, String>,
}

impl Default for PagedApiOptions {
    fn default() -> Self {
        Self {
            page_size: 100,
            delay: Duration::from_millis(200),
            filters: BTreeMap::new(),
        }
    }
}

pub struct PagedApiCursor<F: PageFetcher> {
    name: String,
    fetcher: F,
    options: PagedApiOptions,
    next_page: u32,
    finished: bool,
    stats: CursorStats,
}

impl<F: PageFetcher> PagedApiCursor<F> {
    pub fn new(name: impl Into<String>, fetcher: F, options: PagedApiOptions) -> Self {
        Self {
            name: name.into(),
            fetcher,
            options: PagedApiOptions {
                page_size: options.page_size.max(1),
                ..options
            },
            next_page: 1,
            finished: false,
            stats: CursorStats::default(),
        }
    }

    pub fn fetcher(&self) -> &F {
        &self.fetcher
    }
}

#[async_trait]
impl<F: PageFetcher> SourceCursor for PagedApiCursor<F> {
    type Item = F::Item;

    async fn next(&mut self) -> SyncResult<Page<F::Item>> {
        if self.finished {
            return Ok(Page::exhausted(self.next_page.saturating_sub(1)));
        }

        let page = self.next_page;
        if page > 1 && !self.options.delay.is_zero() {
            tokio::time::sleep(self.options.delay).await;
        }

        let request = PageRequest {
            page,
            page_size: self.options.page_size,
            filters: self.options.filters.clone(),
        };
        debug!("Requesting page {} from {}", page, self.name);

        let response = self
            .fetcher
            .fetch(&request)
            .await
            .map_err(|e| SyncError::page_fetch(&self.name, page, &e))?;

        let has_more = response.next_page_url.is_some()
            && !response.data.is_empty()
            && response.data.len() >= self.options.page_size as usize;

        self.next_page += 1;
        self.finished = !has_more;
        self.stats.pages += 1;
        self.stats.items += response.data.len() as u64;

        if self.finished {
            info!(
                "📄 {} exhausted after {} pages ({} items)",
                self.name, self.stats.pages, self.stats.items
            );
        }

        Ok(Page {
            items: response.data,
            has_more,
            page,
        })
    }

    fn name(&self) -> &str {
        &self.name
    }

    fn stats(&self) -> CursorStats {
        self.stats
    }
}
