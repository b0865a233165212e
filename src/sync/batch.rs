//! # Batch Accumulator
//!
//! Buffers typed rows between flushes. Rows are deduplicated by natural key
//! inside one batch (the first occurrence wins, later ones are dropped, never
//! merged) and the buffer is flushed when it reaches the configured size or
//! its approximate byte budget.

use std::collections::HashSet;

use crate::domain::record::SyncRecord;

#[derive(Debug)]
pub struct BatchAccumulator<R: SyncRecord> {
    rows: Vec<R>,
    keys: HashSet<R::Key>,
    batch_size: usize,
    max_bytes: Option<usize>,
    buffered_bytes: usize,
    duplicates_dropped: u64,
}

impl<R: SyncRecord> BatchAccumulator<R> {
    pub fn new(batch_size: usize) -> Self {
        let batch_size = batch_size.max(1);
        Self {
            rows: Vec::with_capacity(batch_size),
            keys: HashSet::with_capacity(batch_size),
            batch_size,
            max_bytes: None,
            buffered_bytes: 0,
            duplicates_dropped: 0,
        }
    }

    /// Also flush once the buffered rows are estimated to exceed `max_bytes`.
    pub fn with_byte_budget(mut self, max_bytes: Option<usize>) -> Self {
        self.max_bytes = max_bytes.filter(|bytes| *bytes > 0);
        self
    }

    /// Adds a row. Returns `false` when a row with the same key is already buffered.
    pub fn add(&mut self, record: R) -> bool {
        let key = record.natural_key();
        if self.keys.contains(&key) {
            self.duplicates_dropped += 1;
            tracing::debug!("Dropping duplicate row in batch: {:?}", key);
            return false;
        }
        self.keys.insert(key);
        self.buffered_bytes += record.approx_size();
        self.rows.push(record);
        true
    }

    pub fn should_flush(&self) -> bool {
        self.rows.len() >= self.batch_size
            || self
                .max_bytes
                .is_some_and(|limit| self.buffered_bytes >= limit)
    }

    /// Takes the buffered rows in insertion order and resets the buffer.
    pub fn drain(&mut self) -> Vec<R> {
        let rows = std::mem::replace(&mut self.rows, Vec::with_capacity(self.batch_size));
        self.keys.clear();
        self.keys.shrink_to(self.batch_size);
        self.buffered_bytes = 0;
        rows
    }

    pub fn len(&self) -> usize {
        self.rows.len()
    }

    pub fn is_empty(&self) -> bool {
        self.rows.is_empty()
    }

    pub fn buffered_bytes(&self) -> usize {
        self.buffered_bytes
    }

    pub fn duplicates_dropped(&self) -> u64 {
        self.duplicates_dropped
    }

    pub fn batch_size(&self) -> usize {
        self.batch_size
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[derive(Debug, Clone, PartialEq)]
    struct Contact {
        email: String,
        name: &'static str,
    }

    impl SyncRecord for Contact {
        type Key = String;

        fn natural_key(&self) -> String {
            self.email.clone()
        }

        fn approx_size(&self) -> usize {
            self.email.len() + self.name.len()
        }
    }

    fn contact(email: &str, name: &'static str) -> Contact {
        Contact {
            email: email.to_string(),
            name,
        }
    }

    #[test]
    fn keeps_first_row_for_duplicate_key() {
        let mut batch = BatchAccumulator::new(10);
        assert!(batch.add(contact("a@example.com", "first")));
        assert!(!batch.add(contact("a@example.com", "second")));
        assert!(batch.add(contact("b@example.com", "other")));

        let rows = batch.drain();
        assert_eq!(rows.len(), 2);
        assert_eq!(rows[0].name, "first");
        assert_eq!(batch.duplicates_dropped(), 1);
    }

    #[test]
    fn flushes_at_batch_size() {
        let mut batch = BatchAccumulator::new(3);
        batch.add(contact("a@x.io", "a"));
        batch.add(contact("b@x.io", "b"));
        assert!(!batch.should_flush());
        batch.add(contact("c@x.io", "c"));
        assert!(batch.should_flush());
    }

    #[test]
    fn flushes_on_byte_budget() {
        let mut batch = BatchAccumulator::new(1000).with_byte_budget(Some(20));
        batch.add(contact("a@x.io", "aaaaaa"));
        assert!(!batch.should_flush());
        batch.add(contact("b@x.io", "bbbbbb"));
        assert!(batch.should_flush());
    }

    #[test]
    fn drain_resets_keys_and_size() {
        let mut batch = BatchAccumulator::new(2);
        batch.add(contact("a@x.io", "a"));
        batch.add(contact("b@x.io", "b"));
        assert_eq!(batch.drain().len(), 2);

        assert!(batch.is_empty());
        assert_eq!(batch.buffered_bytes(), 0);
        // Same key is accepted again in the next batch
        assert!(batch.add(contact("a@x.io", "again")));
    }

    #[test]
    fn zero_batch_size_is_clamped() {
        let mut batch = BatchAccumulator::new(0);
        assert_eq!(batch.batch_size(), 1);
        batch.add(contact("a@x.io", "a"));
        assert!(batch.should_flush());
    }
}
