//! Field-level conflict merge between stored and freshly imported rows
//!
//! The policy is "first non-empty value wins": a value already present in the
//! destination is never replaced by a re-import. Two field kinds bend the rule:
//!
//! - **count fields** (`Option<i64>`) only take the incoming value when the
//!   stored one is absent; a stored `0` is a real value and stays.
//! - **flag fields** (`Option<bool>`) fall back to `false` when neither side
//!   supplies a value. Since inserts store that default, a stored `false` is
//!   blank and a later `true` fills it.
//!
//! Everything here is pure so the merge can be tested without a database.

use chrono::{DateTime, Utc};

/// Values that can be "empty" in the sense of the merge policy.
pub trait Blank {
    fn is_blank(&self) -> bool;
}

impl Blank for String {
    fn is_blank(&self) -> bool {
        self.trim().is_empty()
    }
}

/// Zero is the "unset" sentinel for identifier-like numbers (external ids).
impl Blank for i64 {
    fn is_blank(&self) -> bool {
        *self == 0
    }
}

impl Blank for DateTime<Utc> {
    fn is_blank(&self) -> bool {
        false
    }
}

impl<T: Blank> Blank for Option<T> {
    fn is_blank(&self) -> bool {
        self.as_ref().is_none_or(Blank::is_blank)
    }
}

/// Keeps `existing` unless it is blank and `incoming` is not.
pub fn first_filled<T: Blank>(existing: Option<T>, incoming: Option<T>) -> Option<T> {
    if existing.is_blank() && !incoming.is_blank() {
        incoming
    } else {
        existing
    }
}

/// Count fields: only an absent stored value may be filled in.
pub fn first_present<T>(existing: Option<T>, incoming: Option<T>) -> Option<T> {
    existing.or(incoming)
}

/// Flag fields: `false` is the empty value, so any `true` sticks.
pub fn flag(existing: Option<bool>, incoming: Option<bool>) -> bool {
    existing.unwrap_or(false) || incoming.unwrap_or(false)
}

/// A destination row that knows how to reconcile itself with a stored copy.
pub trait Mergeable: Sized {
    /// Shape an incoming row for a plain insert (fill defaults such as flags).
    fn normalized(self) -> Self;

    /// Field-by-field reconciliation of a stored row with an incoming one.
    fn reconcile(existing: Self, incoming: Self) -> Self;
}

/// Result of merging one incoming row.
#[derive(Debug, Clone, PartialEq)]
pub enum MergeOutcome<R> {
    Insert(R),
    Update(R),
}

impl<R> MergeOutcome<R> {
    pub fn row(&self) -> &R {
        match self {
            Self::Insert(row) | Self::Update(row) => row,
        }
    }

    pub fn into_row(self) -> R {
        match self {
            Self::Insert(row) | Self::Update(row) => row,
        }
    }

    pub fn is_insert(&self) -> bool {
        matches!(self, Self::Insert(_))
    }
}

/// Merges an incoming row against whatever the destination already holds.
pub fn merge<R: Mergeable>(existing: Option<R>, incoming: R) -> MergeOutcome<R> {
    match existing {
        None => MergeOutcome::Insert(incoming.normalized()),
        Some(existing) => MergeOutcome::Update(R::reconcile(existing, incoming)),
    }
}
