//! commondb-sync - imports marketing contacts and engagement events into one
//! common database of persons.
//!
//! Sources (CRM API, CSV exports, recorded quiz actions) are read page by page,
//! merged field by field into the destination tables and written in batches
//! under a database-backed writer lock, so overlapping jobs never interleave
//! their writes.

pub mod commands;
pub mod domain;
pub mod infrastructure;
pub mod sync;
