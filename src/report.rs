//! Participant aggregator
//!
//! Folds joined, deduplicated records into one report row per participant,
//! plus a run-level summary across participants. The iOS report is built from
//! diary self-reports instead, since iOS devices do not upload usage records.

use crate::dedup::Fingerprint;
use crate::identity::IdentityMap;
use crate::sources::ContactBook;
use crate::types::{DataType, JoinedRecord, ParticipantContext, ParticipantReport};
use serde::Serialize;
use std::collections::{BTreeMap, BTreeSet, HashSet};

/// How many participants the run summary lists by submission count
const TOP_PARTICIPANTS: usize = 10;

#[derive(Default)]
struct ParticipantAccumulator {
    data_type: Option<DataType>,
    submission_ids: BTreeSet<String>,
    fingerprints: HashSet<Fingerprint>,
    total: usize,
    study_days: BTreeSet<u32>,
}

impl ParticipantAccumulator {
    fn absorb(&mut self, record: &JoinedRecord) {
        self.data_type = Some(DataType::absorb(self.data_type, record.record_kind()));
        if !record.event.submission_id.is_empty() {
            self.submission_ids.insert(record.event.submission_id.clone());
        }
        self.fingerprints.insert(Fingerprint::of(record));
        self.total += 1;
        if let Some(day) = record.study_day {
            self.study_days.insert(day);
        }
    }
}

/// Build one report per participant, sorted by RANDOM_ID
///
/// Unique donations are counted per participant from content fingerprints,
/// independently of any earlier global dedup pass.
pub fn build_participant_reports<'a, I>(records: I, contacts: &ContactBook) -> Vec<ParticipantReport>
where
    I: IntoIterator<Item = &'a JoinedRecord>,
{
    let mut participants: BTreeMap<String, ParticipantAccumulator> = BTreeMap::new();
    for record in records {
        if record.random_id.is_empty() {
            continue;
        }
        participants
            .entry(record.random_id.clone())
            .or_default()
            .absorb(record);
    }

    participants
        .into_iter()
        .filter_map(|(random_id, acc)| {
            let data_type = acc.data_type?;
            let unique = acc.fingerprints.len();
            Some(ParticipantReport {
                context: contacts.context_for(&random_id),
                random_id,
                data_type,
                num_submission_ids: acc.submission_ids.len(),
                num_unique_donations: unique,
                total_donation_records: acc.total,
                uniqueness_ratio: if acc.total == 0 {
                    0.0
                } else {
                    unique as f64 / acc.total as f64
                },
                study_days_with_data: acc.study_days.into_iter().collect(),
                submission_ids: acc.submission_ids.into_iter().collect(),
            })
        })
        .collect()
}

/// Participant and submission count for the summary's leaderboard
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ParticipantCount {
    pub random_id: String,
    pub num_submission_ids: usize,
}

/// Run-level totals over all participant reports
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct ReportSummary {
    pub participants: usize,
    pub participants_by_data_type: BTreeMap<String, usize>,
    pub total_submission_ids: usize,
    pub total_unique_donations: usize,
    pub total_donation_records: usize,
    pub participants_with_enrollment_date: usize,
    pub top_participants: Vec<ParticipantCount>,
}

impl ReportSummary {
    pub fn from_reports(reports: &[ParticipantReport]) -> Self {
        let mut summary = Self {
            participants: reports.len(),
            ..Default::default()
        };
        for report in reports {
            *summary
                .participants_by_data_type
                .entry(report.data_type.as_str().to_string())
                .or_insert(0) += 1;
            summary.total_submission_ids += report.num_submission_ids;
            summary.total_unique_donations += report.num_unique_donations;
            summary.total_donation_records += report.total_donation_records;
            if report.context.enrollment_date.is_some() {
                summary.participants_with_enrollment_date += 1;
            }
        }

        let mut ranked: Vec<&ParticipantReport> = reports.iter().collect();
        // Stable sort keeps RANDOM_ID order among ties
        ranked.sort_by(|a, b| b.num_submission_ids.cmp(&a.num_submission_ids));
        summary.top_participants = ranked
            .into_iter()
            .take(TOP_PARTICIPANTS)
            .map(|r| ParticipantCount {
                random_id: r.random_id.clone(),
                num_submission_ids: r.num_submission_ids,
            })
            .collect();
        summary
    }
}

/// One row of the iOS participant report
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct IosParticipantRow {
    pub random_id: String,
    pub context: ParticipantContext,
    /// Sorted submission ids reported in the diary
    pub submission_ids: Vec<String>,
    pub has_ios_data: bool,
}

impl IosParticipantRow {
    pub fn num_submission_ids(&self) -> usize {
        self.submission_ids.len()
    }
}

/// Whether the contact list places a participant on iOS
pub fn has_ios_data(context: &ParticipantContext) -> bool {
    context.platforms_str().contains("iOS") || context.phone_type_str().contains("iPhone")
}

/// One row per diary participant who is on the contact list, sorted by
/// RANDOM_ID
pub fn build_ios_participant_report(diary: &IdentityMap, contacts: &ContactBook) -> Vec<IosParticipantRow> {
    diary
        .submission_ids_by_participant()
        .into_iter()
        .filter_map(|(random_id, ids)| {
            let context = contacts.get(random_id)?.clone();
            Some(IosParticipantRow {
                random_id: random_id.to_string(),
                has_ios_data: has_ios_data(&context),
                context,
                submission_ids: ids.into_iter().map(str::to_string).collect(),
            })
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::sources::SurveyRow;
    use crate::types::{EventKind, Platform, UsageEvent};
    use chrono::NaiveDate;
    use pretty_assertions::assert_eq;

    fn record(random_id: &str, kind: EventKind, hour: u32, submission_id: &str, study_day: Option<u32>) -> JoinedRecord {
        JoinedRecord {
            event: UsageEvent {
                kind,
                session_datetime: NaiveDate::from_ymd_opt(2025, 3, 1).and_then(|d| d.and_hms_opt(hour, 0, 0)),
                submission_id: submission_id.to_string(),
                created_at_datetime: None,
                platform: Platform::Android,
            },
            random_id: random_id.to_string(),
            context: ParticipantContext::default(),
            study_day,
        }
    }

    fn app(name: &str, minutes: f64) -> EventKind {
        EventKind::AppUsage {
            app_name: name.to_string(),
            duration_minutes: Some(minutes),
        }
    }

    #[test]
    fn test_reports_fold_per_participant() {
        let records = vec![
            record("P002", app("YouTube", 5.0), 9, "50", Some(2)),
            record("P001", app("Instagram", 15.0), 10, "42", Some(1)),
            record("P001", app("Instagram", 15.0), 10, "43", Some(1)),
            record("P001", EventKind::ScreenUnlock, 11, "42", Some(3)),
        ];
        let mut contacts = ContactBook::new();
        contacts.insert(
            "P001",
            ParticipantContext {
                enrollment_date: Some("2025-03-01".into()),
                ..Default::default()
            },
        );

        let reports = build_participant_reports(&records, &contacts);

        assert_eq!(reports.len(), 2);
        let p1 = &reports[0];
        assert_eq!(p1.random_id, "P001");
        assert_eq!(p1.data_type, DataType::Mixed);
        assert_eq!(p1.num_submission_ids, 2);
        assert_eq!(p1.total_donation_records, 3);
        assert_eq!(p1.num_unique_donations, 2);
        assert!((p1.uniqueness_ratio - 2.0 / 3.0).abs() < 1e-9);
        assert_eq!(p1.study_days_with_data, vec![1, 3]);
        assert_eq!(p1.submission_ids, vec!["42".to_string(), "43".to_string()]);
        assert_eq!(p1.context.enrollment_date_str(), "2025-03-01");

        let p2 = &reports[1];
        assert_eq!(p2.random_id, "P002");
        assert_eq!(p2.data_type, DataType::AppUsage);
        assert_eq!(p2.uniqueness_ratio, 1.0);
    }

    #[test]
    fn test_unlocks_then_apps_is_mixed() {
        let records = vec![
            record("P001", EventKind::ScreenUnlock, 8, "42", None),
            record("P001", app("Maps", 1.0), 9, "42", None),
        ];
        let reports = build_participant_reports(&records, &ContactBook::new());
        assert_eq!(reports[0].data_type, DataType::Mixed);
        assert!(reports[0].study_days_with_data.is_empty());
    }

    #[test]
    fn test_no_records_no_reports() {
        let records: Vec<JoinedRecord> = Vec::new();
        let reports = build_participant_reports(&records, &ContactBook::new());
        assert!(reports.is_empty());
        assert_eq!(ReportSummary::from_reports(&reports), ReportSummary::default());
    }

    #[test]
    fn test_summary_totals() {
        let records = vec![
            record("P001", app("A", 1.0), 1, "1", Some(1)),
            record("P001", app("B", 1.0), 2, "2", Some(1)),
            record("P002", EventKind::ScreenUnlock, 1, "3", Some(1)),
        ];
        let reports = build_participant_reports(&records, &ContactBook::new());
        let summary = ReportSummary::from_reports(&reports);

        assert_eq!(summary.participants, 2);
        assert_eq!(summary.total_submission_ids, 3);
        assert_eq!(summary.participants_by_data_type.get("app_usage"), Some(&1));
        assert_eq!(summary.participants_by_data_type.get("screen_unlocks"), Some(&1));
        assert_eq!(summary.top_participants[0].random_id, "P001");
    }

    #[test]
    fn test_ios_report_from_diary_and_contacts() {
        let diary = vec![
            SurveyRow::new(["11", "10"], Some("P002")),
            SurveyRow::new(["20"], Some("P001")),
            SurveyRow::new(["30"], Some("P009")),
            SurveyRow::new(["40"], Some("P003")),
        ];
        let (diary_map, _) = IdentityMap::from_diary(&diary);
        let mut contacts = ContactBook::new();
        contacts.insert(
            "P001",
            ParticipantContext {
                platforms: Some("Android".into()),
                phone_type: Some("Pixel 8".into()),
                ..Default::default()
            },
        );
        contacts.insert(
            "P002",
            ParticipantContext {
                platforms: Some("iOS, Windows".into()),
                ..Default::default()
            },
        );
        contacts.insert(
            "P003",
            ParticipantContext {
                phone_type: Some("iPhone 15".into()),
                ..Default::default()
            },
        );

        let rows = build_ios_participant_report(&diary_map, &contacts);

        let summary: Vec<(&str, bool, usize)> = rows
            .iter()
            .map(|r| (r.random_id.as_str(), r.has_ios_data, r.num_submission_ids()))
            .collect();
        assert_eq!(summary, vec![("P001", false, 1), ("P002", true, 2), ("P003", true, 1)]);
        assert_eq!(rows[1].submission_ids, vec!["10".to_string(), "11".to_string()]);
    }
}
