//! Shared traits for rows that are imported into a destination table

use std::fmt::Debug;
use std::hash::Hash;

/// A row that can travel through the batch pipeline.
pub trait SyncRecord: Send + Sync {
    /// Natural key identifying the row in its destination.
    type Key: Eq + Hash + Clone + Debug + Send + Sync;

    fn natural_key(&self) -> Self::Key;

    /// Rough heap + inline footprint, used for the memory budget.
    fn approx_size(&self) -> usize {
        std::mem::size_of_val(self)
    }
}

/// Which columns identify a row and which ones take part in conflict merge.
///
/// Columns that are neither are insert-only: written once, never updated.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct UpsertContract {
    pub table: &'static str,
    pub natural_key: &'static [&'static str],
    pub mergeable_fields: &'static [&'static str],
}

impl UpsertContract {
    pub fn is_mergeable(&self, column: &str) -> bool {
        self.mergeable_fields.contains(&column)
    }
}
