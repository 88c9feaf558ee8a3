//! Record linker
//!
//! Joins decoded usage events to participant identities and contact context.
//! The identity step is strict: events whose submission id does not resolve
//! are dropped and counted. The contact step is lenient: a participant missing
//! from the contact list gets empty context fields.

use crate::calendar::StudyCalendar;
use crate::error::{ErrorKind, PipelineError};
use crate::identity::IdentityMap;
use crate::sources::ContactBook;
use crate::types::{JoinedRecord, UsageEvent};
use serde::Serialize;
use std::collections::BTreeSet;
use tracing::{debug, warn};

/// Joined records plus what could not be joined
#[derive(Debug, Clone, Default)]
pub struct LinkOutcome {
    pub records: Vec<JoinedRecord>,
    /// Events dropped because their submission id is unmapped
    pub unmapped_records: usize,
    pub unmapped_ids: BTreeSet<String>,
    /// Every distinct submission id seen
    pub seen_ids: BTreeSet<String>,
    /// Events dropped for any other reason, such as a missing submission id
    pub link_errors: usize,
}

/// Submission id coverage across one or more link passes
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct LinkCoverage {
    pub total_ids: usize,
    pub mapped_ids: usize,
    pub unmapped_ids: usize,
    pub coverage_pct: f64,
    pub joined_records: usize,
    pub unmapped_records: usize,
    pub records_with_study_day: usize,
}

impl LinkCoverage {
    pub fn from_outcomes(outcomes: &[&LinkOutcome]) -> Self {
        let seen: BTreeSet<&String> = outcomes.iter().flat_map(|o| o.seen_ids.iter()).collect();
        let unmapped: BTreeSet<&String> = outcomes.iter().flat_map(|o| o.unmapped_ids.iter()).collect();
        let total_ids = seen.len();
        let mapped_ids = total_ids - unmapped.len();
        Self {
            total_ids,
            mapped_ids,
            unmapped_ids: unmapped.len(),
            coverage_pct: if total_ids == 0 {
                0.0
            } else {
                mapped_ids as f64 / total_ids as f64 * 100.0
            },
            joined_records: outcomes.iter().map(|o| o.records.len()).sum(),
            unmapped_records: outcomes.iter().map(|o| o.unmapped_records).sum(),
            records_with_study_day: outcomes
                .iter()
                .flat_map(|o| o.records.iter())
                .filter(|r| r.study_day.is_some())
                .count(),
        }
    }
}

/// Joins events against identities, contacts and the study calendar
pub struct RecordLinker<'a> {
    identities: &'a IdentityMap,
    contacts: &'a ContactBook,
    calendar: StudyCalendar,
}

impl<'a> RecordLinker<'a> {
    pub fn new(identities: &'a IdentityMap, contacts: &'a ContactBook, calendar: StudyCalendar) -> Self {
        Self {
            identities,
            contacts,
            calendar,
        }
    }

    /// Join a single event; an unmapped submission id is a `JoinMiss`, a
    /// missing one a `Decode` error
    pub fn link_event(&self, event: UsageEvent) -> Result<JoinedRecord, PipelineError> {
        if event.submission_id.trim().is_empty() {
            return Err(PipelineError::Decode("usage event has no submission id".to_string()));
        }
        let random_id = self.identities.resolve(&event.submission_id)?.to_string();
        let context = self.contacts.context_for(&random_id);
        let study_day = self
            .calendar
            .study_day(event.session_datetime, context.enrollment_date_str());
        Ok(JoinedRecord {
            event,
            random_id,
            context,
            study_day,
        })
    }

    /// Join a batch of events of one kind, keeping input order
    pub fn link(&self, events: Vec<UsageEvent>) -> LinkOutcome {
        let mut outcome = LinkOutcome {
            records: Vec::with_capacity(events.len()),
            ..Default::default()
        };

        for event in events {
            let submission_id = event.submission_id.clone();
            match self.link_event(event) {
                Ok(record) => {
                    outcome.seen_ids.insert(submission_id);
                    outcome.records.push(record);
                }
                Err(e) if e.kind() == ErrorKind::JoinMiss => {
                    outcome.seen_ids.insert(submission_id.clone());
                    outcome.unmapped_records += 1;
                    outcome.unmapped_ids.insert(submission_id);
                }
                Err(e) => {
                    outcome.link_errors += 1;
                    warn!(%submission_id, error = %e, "dropping event that cannot be linked");
                }
            }
        }

        debug!(
            joined = outcome.records.len(),
            unmapped = outcome.unmapped_records,
            errors = outcome.link_errors,
            "linked events"
        );
        outcome
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::sources::SurveyRow;
    use crate::types::{EventKind, ParticipantContext, Platform};
    use chrono::NaiveDate;

    fn event(submission_id: &str, day: u32) -> UsageEvent {
        UsageEvent {
            kind: EventKind::ScreenUnlock,
            session_datetime: NaiveDate::from_ymd_opt(2025, 3, day).and_then(|d| d.and_hms_opt(10, 0, 0)),
            submission_id: submission_id.to_string(),
            created_at_datetime: None,
            platform: Platform::Android,
        }
    }

    fn fixtures() -> (IdentityMap, ContactBook) {
        let (identities, _) = IdentityMap::from_diary(&[
            SurveyRow::new(["42"], Some("P001")),
            SurveyRow::new(["43"], Some("P002")),
        ]);
        let mut contacts = ContactBook::new();
        contacts.insert(
            "P001",
            ParticipantContext {
                condition: Some("control".into()),
                enrollment_date: Some("2025-03-01".into()),
                ..Default::default()
            },
        );
        (identities, contacts)
    }

    #[test]
    fn test_unresolvable_events_are_dropped_and_counted() {
        let (identities, contacts) = fixtures();
        let linker = RecordLinker::new(&identities, &contacts, StudyCalendar::default());

        let outcome = linker.link(vec![event("42", 1), event("999", 1), event("999", 2)]);

        assert_eq!(outcome.records.len(), 1);
        assert_eq!(outcome.unmapped_records, 2);
        assert_eq!(outcome.unmapped_ids.len(), 1);
        assert!(outcome.records.iter().all(|r| r.random_id != "999"));
    }

    #[test]
    fn test_event_without_submission_id_is_a_link_error() {
        let (identities, contacts) = fixtures();
        let linker = RecordLinker::new(&identities, &contacts, StudyCalendar::default());

        let err = linker.link_event(event("  ", 1)).unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Decode);

        let outcome = linker.link(vec![event("", 1), event("42", 1), event("999", 1)]);
        assert_eq!(outcome.records.len(), 1);
        assert_eq!(outcome.link_errors, 1);
        assert_eq!(outcome.unmapped_records, 1);
        assert_eq!(outcome.seen_ids.len(), 2);
        assert!(!outcome.seen_ids.contains(""));
    }

    #[test]
    fn test_missing_contact_gets_empty_context() {
        let (identities, contacts) = fixtures();
        let linker = RecordLinker::new(&identities, &contacts, StudyCalendar::default());

        let record = linker.link_event(event("43", 3)).unwrap();
        assert_eq!(record.random_id, "P002");
        assert_eq!(record.context, ParticipantContext::default());
        assert_eq!(record.study_day, None);
    }

    #[test]
    fn test_study_day_annotated() {
        let (identities, contacts) = fixtures();
        let linker = RecordLinker::new(&identities, &contacts, StudyCalendar::default());

        let record = linker.link_event(event("42", 3)).unwrap();
        assert_eq!(record.context.condition_str(), "control");
        assert_eq!(record.study_day, Some(3));
    }

    #[test]
    fn test_coverage_across_outcomes() {
        let (identities, contacts) = fixtures();
        let linker = RecordLinker::new(&identities, &contacts, StudyCalendar::default());
        let apps = linker.link(vec![event("42", 1), event("7", 1)]);
        let unlocks = linker.link(vec![event("43", 1), event("7", 2)]);

        let coverage = LinkCoverage::from_outcomes(&[&apps, &unlocks]);
        assert_eq!(coverage.total_ids, 3);
        assert_eq!(coverage.mapped_ids, 2);
        assert_eq!(coverage.unmapped_records, 2);
        assert_eq!(coverage.records_with_study_day, 1);
        assert!((coverage.coverage_pct - 66.666).abs() < 0.01);
    }
}
