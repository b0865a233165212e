//! Streamed delimited-file source
//!
//! Reads one record at a time from a CSV/TSV export and groups them into
//! pages, so an export of any size is processed with one page in memory.
//! Rows whose column count does not match the header, or that cannot be
//! decoded, are skipped and counted as malformed.

use std::collections::BTreeMap;
use std::fs::File;
use std::io::ErrorKind;
use std::path::{Path, PathBuf};

use async_trait::async_trait;
use csv::{ReaderBuilder, StringRecord, Trim};
use tracing::{debug, info};

use crate::sync::cursor::{CursorStats, Page, SourceCursor};
use crate::sync::error::{SyncError, SyncResult};

/// Options for reading a delimited export.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CsvOptions {
    /// Field delimiter. Default: `b','`
    pub delimiter: u8,
    /// Rows per page. Default: 1000
    pub page_size: usize,
}

impl Default for CsvOptions {
    fn default() -> Self {
        Self {
            delimiter: b',',
            page_size: 1000,
        }
    }
}

/// One data row keyed by lower-cased header name.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CsvRow {
    /// 1-based line in the file
    pub line: u64,
    pub fields: BTreeMap<String, String>,
}

impl CsvRow {
    /// Non-empty value of a column, looked up case-insensitively.
    pub fn get(&self, column: &str) -> Option<&str> {
        self.fields
            .get(&column.to_lowercase())
            .map(|v| v.trim())
            .filter(|v| !v.is_empty())
    }

    /// First non-empty value among several alternative column names.
    pub fn first_of(&self, columns: &[&str]) -> Option<&str> {
        columns.iter().find_map(|c| self.get(c))
    }
}

/// The blocking half of the cursor: owns the reader and fills one page.
struct PageReader {
    name: String,
    reader: csv::Reader<File>,
    headers: Vec<String>,
    record: StringRecord,
    page_size: usize,
}

#[derive(Debug, Default)]
struct PageRead {
    items: Vec<CsvRow>,
    malformed: u64,
    eof: bool,
}

impl PageReader {
    /// Reads up to one page. Only I/O failures are errors; undecodable or
    /// short rows are skipped.
    fn read_page(&mut self) -> Result<PageRead, csv::Error> {
        let mut read = PageRead {
            items: Vec::with_capacity(self.page_size),
            ..PageRead::default()
        };

        while read.items.len() < self.page_size {
            match self.reader.read_record(&mut self.record) {
                Ok(false) => {
                    read.eof = true;
                    break;
                }
                Ok(true) => {
                    let line = self.record.position().map_or(0, |p| p.line());
                    if self.record.len() != self.headers.len() {
                        let reason = format!(
                            "expected {} fields, found {}",
                            self.headers.len(),
                            self.record.len()
                        );
                        self.skip(&mut read, line, &reason);
                        continue;
                    }
                    let fields = self
                        .headers
                        .iter()
                        .cloned()
                        .zip(self.record.iter().map(str::to_string))
                        .collect();
                    read.items.push(CsvRow { line, fields });
                }
                Err(e) if e.is_io_error() => return Err(e),
                Err(e) => {
                    let line = e.position().map_or(0, |p| p.line());
                    self.skip(&mut read, line, &e.to_string());
                }
            }
        }
        Ok(read)
    }

    fn skip(&self, read: &mut PageRead, line: u64, reason: &str) {
        read.malformed += 1;
        debug!("Skipping malformed row {} of {}: {}", line, self.name, reason);
    }
}

pub struct CsvFileCursor {
    name: String,
    path: PathBuf,
    headers: Vec<String>,
    /// `None` only while a page is being read on the blocking pool
    reader: Option<PageReader>,
    page: u32,
    finished: bool,
    stats: CursorStats,
}

impl std::fmt::Debug for CsvFileCursor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CsvFileCursor")
            .field("path", &self.path)
            .field("headers", &self.headers)
            .field("page", &self.page)
            .field("finished", &self.finished)
            .finish()
    }
}

impl CsvFileCursor {
    pub fn open(path: impl AsRef<Path>, options: CsvOptions) -> SyncResult<Self> {
        let path = path.as_ref().to_path_buf();
        let file = File::open(&path).map_err(|e| match e.kind() {
            ErrorKind::NotFound => SyncError::SourceNotFound(path.clone()),
            _ => SyncError::Io(e),
        })?;

        let mut reader = ReaderBuilder::new()
            .delimiter(options.delimiter)
            .flexible(true)
            .trim(Trim::All)
            .from_reader(file);

        let headers = reader
            .headers()?
            .iter()
            .map(|h| h.trim_start_matches('\u{feff}').trim().to_lowercase())
            .collect::<Vec<_>>();

        info!("📂 Opened {} with columns {:?}", path.display(), headers);

        let name = path
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_else(|| path.display().to_string());

        Ok(Self {
            reader: Some(PageReader {
                name: name.clone(),
                reader,
                headers: headers.clone(),
                record: StringRecord::new(),
                page_size: options.page_size.max(1),
            }),
            name,
            path,
            headers,
            page: 0,
            finished: false,
            stats: CursorStats::default(),
        })
    }

    pub fn headers(&self) -> &[String] {
        &self.headers
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

#[async_trait]
impl SourceCursor for CsvFileCursor {
    type Item = CsvRow;

    async fn next(&mut self) -> SyncResult<Page<CsvRow>> {
        if self.finished {
            return Ok(Page::exhausted(self.page));
        }
        let Some(mut reader) = self.reader.take() else {
            return Err(SyncError::Io(std::io::Error::other(format!(
                "reader for {} was lost by an earlier failed read",
                self.name
            ))));
        };

        let (reader, read) = tokio::task::spawn_blocking(move || {
            let read = reader.read_page();
            (reader, read)
        })
        .await
        .map_err(|e| SyncError::Io(std::io::Error::other(e)))?;
        self.reader = Some(reader);

        let read = read?;
        self.finished = read.eof;
        self.page += 1;
        self.stats.pages += 1;
        self.stats.items += read.items.len() as u64;
        self.stats.malformed += read.malformed;

        Ok(Page {
            items: read.items,
            has_more: !self.finished,
            page: self.page,
        })
    }

    fn name(&self) -> &str {
        &self.name
    }

    fn stats(&self) -> CursorStats {
        self.stats
    }
}
