//! Domain module - rows of the common database and the pure algorithms on them
//!
//! Nothing in here touches the database or the network:
//! - `merge`: field-level conflict merge policy
//! - `record`: traits shared by every importable row
//! - `person`: the `persons` row and its normalization rules
//! - `session_window`: gap-based session windowing of quiz actions

pub mod merge;
pub mod person;
pub mod record;
pub mod session_window;

pub use merge::{merge, MergeOutcome, Mergeable};
pub use person::PersonRow;
pub use record::{SyncRecord, UpsertContract};
pub use session_window::{ActionEvent, SessionWindow, SessionWindower};
