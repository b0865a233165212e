//! Batch synchronization pipeline
//!
//! Cursors page through a source, the accumulator buffers typed rows and the
//! orchestrator flushes them under the destination's lock.

pub mod action_cursor;
pub mod batch;
pub mod cursor;
pub mod error;
pub mod file_cursor;
pub mod mappers;
pub mod orchestrator;

pub use batch::BatchAccumulator;
pub use cursor::{Page, PageFetcher, PagedApiCursor, PagedApiOptions, SourceCursor};
pub use error::{RecordError, SyncError, SyncResult};
pub use file_cursor::{CsvFileCursor, CsvOptions, CsvRow};
pub use orchestrator::{RunConfig, RunFailure, RunState, RunStats, SyncOrchestrator};
