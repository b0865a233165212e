//! Gap-based session windowing of quiz/action events
//!
//! Events of one subject and series are clustered into windows. The gap that
//! closes a window is measured from the **window start**, not from the
//! previous event: events arriving every 500 s stay in one window only until
//! the window is 600 s old, then a new window begins.

use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::domain::merge::Mergeable;
use crate::domain::record::{SyncRecord, UpsertContract};
use crate::sync::error::{SyncError, SyncResult};

pub const DEFAULT_SESSION_GAP: Duration = Duration::from_secs(600);

/// A single user action (question shown, answer given, ...).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ActionEvent {
    pub subject_id: i64,
    pub series_key: String,
    pub occurred_at: DateTime<Utc>,
    pub is_answer: bool,
}

/// A cluster of actions of one subject in one series.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SessionWindow {
    pub subject_id: i64,
    pub series_key: String,
    pub window_start: DateTime<Utc>,
    pub window_end: DateTime<Utc>,
    pub event_count: u32,
    /// At least one event in the window was an answer
    pub satisfied: bool,
}

impl SessionWindow {
    fn open(event: &ActionEvent) -> Self {
        Self {
            subject_id: event.subject_id,
            series_key: event.series_key.clone(),
            window_start: event.occurred_at,
            window_end: event.occurred_at,
            event_count: 1,
            satisfied: event.is_answer,
        }
    }

    pub fn duration(&self) -> chrono::Duration {
        self.window_end - self.window_start
    }

    pub const CONTRACT: UpsertContract = UpsertContract {
        table: "quiz_sessions",
        natural_key: &["subject_id", "series_key", "window_start"],
        mergeable_fields: &["window_end", "event_count", "satisfied"],
    };
}

/// Windows are recomputed from the whole action history of a subject, so the
/// fresh aggregate replaces the stored one.
impl Mergeable for SessionWindow {
    fn normalized(self) -> Self {
        self
    }

    fn reconcile(existing: Self, incoming: Self) -> Self {
        Self {
            subject_id: existing.subject_id,
            series_key: existing.series_key,
            window_start: existing.window_start,
            ..incoming
        }
    }
}

impl SyncRecord for SessionWindow {
    type Key = (i64, String, i64);

    fn natural_key(&self) -> Self::Key {
        (
            self.subject_id,
            self.series_key.clone(),
            self.window_start.timestamp_millis(),
        )
    }

    fn approx_size(&self) -> usize {
        std::mem::size_of::<Self>() + self.series_key.capacity()
    }
}

#[derive(Debug, Clone, Copy)]
pub struct SessionWindower {
    gap: chrono::Duration,
}

impl Default for SessionWindower {
    fn default() -> Self {
        Self::new(DEFAULT_SESSION_GAP)
    }
}

impl SessionWindower {
    pub fn new(gap: Duration) -> Self {
        Self {
            gap: chrono::Duration::from_std(gap).unwrap_or(chrono::Duration::seconds(600)),
        }
    }

    pub fn gap(&self) -> chrono::Duration {
        self.gap
    }

    /// Windows one subject/series event list that is already sorted by time.
    pub fn windows(&self, events: &[ActionEvent]) -> SyncResult<Vec<SessionWindow>> {
        let mut windows = Vec::new();
        let Some(first) = events.first() else {
            return Ok(windows);
        };
        let mut current = SessionWindow::open(first);

        for (position, pair) in events.windows(2).enumerate() {
            let (previous, event) = (&pair[0], &pair[1]);
            if event.occurred_at < previous.occurred_at {
                return Err(SyncError::UnorderedEvents {
                    subject_id: event.subject_id,
                    series_key: event.series_key.clone(),
                    position: position + 1,
                });
            }

            if event.occurred_at - current.window_start > self.gap {
                windows.push(std::mem::replace(&mut current, SessionWindow::open(event)));
            } else {
                current.window_end = event.occurred_at;
                current.event_count += 1;
                current.satisfied |= event.is_answer;
            }
        }
        windows.push(current);
        Ok(windows)
    }

    /// Windows events sorted by `(subject_id, series_key, occurred_at)`,
    /// one group at a time.
    pub fn window_groups(&self, events: &[ActionEvent]) -> SyncResult<Vec<SessionWindow>> {
        let mut windows = Vec::new();
        for group in events.chunk_by(|a, b| a.subject_id == b.subject_id && a.series_key == b.series_key) {
            windows.extend(self.windows(group)?);
        }
        Ok(windows)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;
    use rstest::rstest;

    fn at(seconds: i64) -> DateTime<Utc> {
        DateTime::from_timestamp(1_700_000_000 + seconds, 0).unwrap()
    }

    fn events(offsets: &[i64]) -> Vec<ActionEvent> {
        offsets
            .iter()
            .map(|&s| ActionEvent {
                subject_id: 1,
                series_key: "wave-1".into(),
                occurred_at: at(s),
                is_answer: false,
            })
            .collect()
    }

    fn bounds(windows: &[SessionWindow]) -> Vec<(i64, i64)> {
        windows
            .iter()
            .map(|w| {
                (
                    w.window_start.timestamp() - 1_700_000_000,
                    w.window_end.timestamp() - 1_700_000_000,
                )
            })
            .collect()
    }

    #[rstest]
    #[case(&[0, 100, 650, 680], &[(0, 100), (650, 680)])]
    #[case(&[0, 500, 900], &[(0, 500), (900, 900)])]
    #[case(&[0, 600], &[(0, 600)])]
    #[case(&[0, 601], &[(0, 0), (601, 601)])]
    #[case(&[42], &[(42, 42)])]
    #[case(&[0, 0, 0], &[(0, 0)])]
    fn windows_are_anchored_at_window_start(
        #[case] offsets: &[i64],
        #[case] expected: &[(i64, i64)],
    ) {
        let windows = SessionWindower::default().windows(&events(offsets)).unwrap();
        assert_eq!(bounds(&windows), expected);
    }

    #[test]
    fn slow_drip_does_not_extend_window_forever() {
        // 500 s apart: each step is under the gap, but the window start is not
        let windows = SessionWindower::default()
            .windows(&events(&[0, 500, 1000, 1500, 2000]))
            .unwrap();
        assert_eq!(bounds(&windows), vec![(0, 500), (1000, 1500), (2000, 2000)]);
    }

    #[test]
    fn empty_input_has_no_windows() {
        assert!(SessionWindower::default().windows(&[]).unwrap().is_empty());
    }

    #[test]
    fn counts_events_and_answers() {
        let mut input = events(&[0, 10, 20, 700]);
        input[1].is_answer = true;
        let windows = SessionWindower::default().windows(&input).unwrap();

        assert_eq!(windows[0].event_count, 3);
        assert!(windows[0].satisfied);
        assert_eq!(windows[0].duration(), chrono::Duration::seconds(20));
        assert_eq!(windows[1].event_count, 1);
        assert!(!windows[1].satisfied);
    }

    #[test]
    fn rejects_unordered_events() {
        let err = SessionWindower::default()
            .windows(&events(&[0, 100, 50]))
            .unwrap_err();
        assert!(matches!(err, SyncError::UnorderedEvents { position: 2, .. }));
    }

    #[test]
    fn groups_are_windowed_independently() {
        let mut input = events(&[0, 100]);
        input.extend(events(&[50]).into_iter().map(|mut e| {
            e.series_key = "wave-2".into();
            e
        }));
        input.push(ActionEvent {
            subject_id: 2,
            series_key: "wave-1".into(),
            occurred_at: at(10),
            is_answer: true,
        });

        let windows = SessionWindower::default().window_groups(&input).unwrap();
        assert_eq!(windows.len(), 3);
        assert_eq!(windows[0].event_count, 2);
        assert_eq!(windows[1].series_key, "wave-2");
        assert_eq!(windows[2].subject_id, 2);
        assert!(windows[2].satisfied);
    }

    #[test]
    fn custom_gap_is_respected() {
        let windower = SessionWindower::new(Duration::from_secs(60));
        let windows = windower.windows(&events(&[0, 60, 61])).unwrap();
        assert_eq!(bounds(&windows), vec![(0, 60), (61, 61)]);
    }

    proptest! {
        #[test]
        fn every_event_lands_in_exactly_one_bounded_window(
            mut offsets in proptest::collection::vec(0_i64..20_000, 1..200)
        ) {
            offsets.sort_unstable();
            let windower = SessionWindower::default();
            let windows = windower.windows(&events(&offsets)).unwrap();

            let total: u32 = windows.iter().map(|w| w.event_count).sum();
            prop_assert_eq!(total as usize, offsets.len());
            for window in &windows {
                prop_assert!(window.duration() <= windower.gap());
            }
            for pair in windows.windows(2) {
                prop_assert!(pair[1].window_start - pair[0].window_start > windower.gap());
            }
        }
    }
}
