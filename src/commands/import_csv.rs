//! `import-csv`: load a delimited person export into `persons`

use std::path::PathBuf;

use anyhow::{Context, Result};

use super::{CommandContext, RunOverrides, SyncSummary};
use crate::infrastructure::config::delimiter_byte;
use crate::infrastructure::person_repository::PersonStore;
use crate::sync::file_cursor::{CsvFileCursor, CsvOptions};
use crate::sync::mappers::CsvPersonMapper;

#[derive(Debug, Clone, clap::Args)]
pub struct ImportCsvArgs {
    /// Export file to import
    pub file: PathBuf,

    /// Source name stored with new persons (defaults to csv.default_source)
    #[arg(long)]
    pub source: Option<String>,

    /// Field delimiter, e.g. ';' or '\t' (defaults to csv.delimiter)
    #[arg(long)]
    pub delimiter: Option<char>,

    /// Rows read per page (defaults to csv.page_size)
    #[arg(long)]
    pub chunk: Option<usize>,

    #[command(flatten)]
    pub run: RunOverrides,
}

pub async fn import_csv(ctx: &CommandContext, args: ImportCsvArgs) -> Result<SyncSummary> {
    let csv = &ctx.config.csv;
    let options = CsvOptions {
        delimiter: delimiter_byte(args.delimiter.unwrap_or(csv.delimiter))?,
        page_size: args.chunk.unwrap_or(csv.page_size),
    };
    let source = args.source.unwrap_or_else(|| csv.default_source.clone());

    let mut cursor = CsvFileCursor::open(&args.file, options)
        .with_context(|| format!("Cannot import {}", args.file.display()))?;
    let mapper = CsvPersonMapper::new(&source);
    let store = PersonStore::new(&source);

    Ok(ctx.execute(&mut cursor, &mapper, &store, &args.run).await)
}
