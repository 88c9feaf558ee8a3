//! Deduplicator
//!
//! Removes retransmitted usage records by exact content fingerprint, keeping
//! the first occurrence in input order. Records that differ only slightly (a
//! timestamp off by a second) are distinct; this is not a semantic dedup.

use crate::types::{format_duration, EventKind, JoinedRecord, Platform};
use std::collections::HashSet;
use tracing::debug;

/// Content fingerprint of a joined record
///
/// Datetimes and durations are compared through their canonical text forms,
/// so `15` and `15.0` minutes are the same content.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum Fingerprint {
    AppUsage {
        random_id: String,
        session_datetime: String,
        app_name: String,
        duration_minutes: String,
        platform: Platform,
    },
    ScreenUnlock {
        random_id: String,
        session_datetime: String,
        platform: Platform,
    },
}

impl Fingerprint {
    pub fn of(record: &JoinedRecord) -> Self {
        let event = &record.event;
        match &event.kind {
            EventKind::AppUsage {
                app_name,
                duration_minutes,
            } => Fingerprint::AppUsage {
                random_id: record.random_id.clone(),
                session_datetime: event.session_datetime_str(),
                app_name: app_name.clone(),
                duration_minutes: format_duration(*duration_minutes),
                platform: event.platform,
            },
            EventKind::ScreenUnlock => Fingerprint::ScreenUnlock {
                random_id: record.random_id.clone(),
                session_datetime: event.session_datetime_str(),
                platform: event.platform,
            },
        }
    }
}

/// Deduplicated records and how many were removed
#[derive(Debug, Clone, Default)]
pub struct DedupOutcome {
    pub records: Vec<JoinedRecord>,
    pub removed: usize,
}

/// Drop records whose fingerprint was already seen, preserving order
pub fn dedup_records(records: Vec<JoinedRecord>) -> DedupOutcome {
    let input = records.len();
    let mut seen = HashSet::with_capacity(input);
    let kept: Vec<JoinedRecord> = records
        .into_iter()
        .filter(|record| seen.insert(Fingerprint::of(record)))
        .collect();

    let removed = input - kept.len();
    debug!(input, kept = kept.len(), removed, "deduplicated records");
    DedupOutcome {
        records: kept,
        removed,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::{ParticipantContext, UsageEvent};
    use chrono::NaiveDate;
    use pretty_assertions::assert_eq;

    fn app_record(random_id: &str, minute: u32, app: &str, duration: f64, submission_id: &str) -> JoinedRecord {
        JoinedRecord {
            event: UsageEvent {
                kind: EventKind::AppUsage {
                    app_name: app.to_string(),
                    duration_minutes: Some(duration),
                },
                session_datetime: NaiveDate::from_ymd_opt(2025, 3, 1)
                    .and_then(|d| d.and_hms_opt(10, minute, 0)),
                submission_id: submission_id.to_string(),
                created_at_datetime: None,
                platform: Platform::Android,
            },
            random_id: random_id.to_string(),
            context: ParticipantContext::default(),
            study_day: Some(1),
        }
    }

    fn unlock_record(random_id: &str, minute: u32, submission_id: &str) -> JoinedRecord {
        let mut record = app_record(random_id, minute, "", 0.0, submission_id);
        record.event.kind = EventKind::ScreenUnlock;
        record
    }

    #[test]
    fn test_first_occurrence_wins() {
        let first = app_record("P001", 0, "Instagram", 15.0, "42");
        let retransmitted = app_record("P001", 0, "Instagram", 15.0, "43");

        let outcome = dedup_records(vec![first.clone(), retransmitted]);

        assert_eq!(outcome.removed, 1);
        assert_eq!(outcome.records, vec![first]);
    }

    #[test]
    fn test_dedup_is_idempotent() {
        let records = vec![
            app_record("P001", 0, "Instagram", 15.0, "42"),
            app_record("P001", 0, "Instagram", 15.0, "42"),
            app_record("P001", 1, "Instagram", 15.0, "42"),
            app_record("P002", 0, "Instagram", 15.0, "42"),
            unlock_record("P001", 0, "42"),
            unlock_record("P001", 0, "43"),
        ];
        let once = dedup_records(records).records;
        let twice = dedup_records(once.clone());

        assert_eq!(once.len(), 4);
        assert_eq!(twice.removed, 0);
        assert_eq!(twice.records, once);
    }

    #[test]
    fn test_near_duplicates_are_kept() {
        let outcome = dedup_records(vec![
            app_record("P001", 0, "Instagram", 15.0, "42"),
            app_record("P001", 1, "Instagram", 15.0, "42"),
            app_record("P001", 0, "Instagram", 15.5, "42"),
        ]);
        assert_eq!(outcome.removed, 0);
    }

    #[test]
    fn test_unlock_fingerprint_ignores_submission() {
        let a = Fingerprint::of(&unlock_record("P001", 5, "42"));
        let b = Fingerprint::of(&unlock_record("P001", 5, "99"));
        assert_eq!(a, b);
    }
}
