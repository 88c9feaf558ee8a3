//! Pipeline orchestration
//!
//! Runs the linkage stages in order and owns every continue-vs-abort decision.
//!
//! Pipeline stages:
//! 0. Fetch - optionally refresh source exports with external commands
//! 1. Extract - read uploads, diary, exit survey and contact list
//! 2. Decode - turn upload JSON blobs into usage events
//! 3. Resolve - build the submission id to RANDOM_ID map
//! 4. Link - join events to participants, contact context and study day
//! 5. Dedup - drop retransmitted records
//! 6. Report - fold records into one row per participant, build the iOS
//!    report from diary self-reports and write outputs
//!
//! Uploads and diary are mandatory: without them nothing can be linked. The
//! exit survey and contact list are optional and their absence only narrows
//! the output.

use crate::calendar::StudyCalendar;
use crate::config::{CommandSpec, StudyConfig};
use crate::decoder::{decode_batch, DecodeStats};
use crate::dedup::dedup_records;
use crate::error::{ErrorKind, PipelineError};
use crate::fetch::{FetchStatus, SourceFetcher};
use crate::identity::{resolve_identities, IdentityMap, IdentityStats};
use crate::linker::{LinkCoverage, RecordLinker};
use crate::output::{write_ios_report_csv, write_joined_csv, write_report_csv, WriteStatus};
use crate::report::{build_ios_participant_report, build_participant_reports, IosParticipantRow, ReportSummary};
use crate::retry::RetryPolicy;
use crate::sources::{ContactBook, ContactReader, ContactStats, SurveyKind, SurveyReader, SurveyRow, UploadReader};
use crate::{PRODUCER_NAME, STUDY_LINK_VERSION};
use crate::types::{JoinedRecord, ParticipantReport, UploadRecord};
use serde::Serialize;
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;
use tracing::{info, warn};
use uuid::Uuid;

pub const JOINED_APP_USAGE_FILE: &str = "joined_app_usage.csv";
pub const JOINED_SCREEN_UNLOCKS_FILE: &str = "joined_screen_unlocks.csv";
pub const PARTICIPANT_REPORT_FILE: &str = "participant_report.csv";
pub const PARTICIPANT_REPORT_IOS_FILE: &str = "participant_report_ios.csv";
pub const LINKAGE_SUMMARY_FILE: &str = "linkage_summary.json";

/// Records removed by the deduplicator, per record kind
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct DuplicateCounts {
    pub app_usage: usize,
    pub screen_unlocks: usize,
}

/// Counters from every linkage stage
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct LinkageStats {
    pub malformed_upload_rows: usize,
    pub decode: DecodeStats,
    pub identity: IdentityStats,
    pub contacts: ContactStats,
    pub coverage: LinkCoverage,
    pub duplicates_removed: DuplicateCounts,
    /// Records the linker dropped for a reason other than an unmapped id
    pub link_errors: usize,
    pub report: ReportSummary,
    pub ios_report_rows: usize,
    /// iOS report rows whose contact entry names iOS or an iPhone
    pub ios_participants: usize,
    /// Optional sources that were unavailable and skipped
    pub missing_sources: Vec<String>,
}

/// Linked, deduplicated records and the participant reports built from them
#[derive(Debug, Clone, Default)]
pub struct LinkageResult {
    pub app_usage: Vec<JoinedRecord>,
    pub screen_unlocks: Vec<JoinedRecord>,
    pub reports: Vec<ParticipantReport>,
    pub ios_reports: Vec<IosParticipantRow>,
    pub stats: LinkageStats,
}

/// Link in-memory inputs (stages 2 to 6, without writing)
pub fn link_batch(
    uploads: &[UploadRecord],
    diary: &[SurveyRow],
    exit: Option<&[SurveyRow]>,
    contacts: &ContactBook,
    calendar: StudyCalendar,
) -> LinkageResult {
    // Stage 2: decode
    let decoded = decode_batch(uploads);

    // Stage 3: resolve identities
    let (identities, identity_stats) = resolve_identities(diary, exit);
    let contact_stats = contacts.stats();
    if !contact_stats.unrecognized_enrollment_dates.is_empty() {
        warn!(
            participants = ?contact_stats.unrecognized_enrollment_dates,
            "enrollment dates in no known format, study days stay unmapped"
        );
    }

    // Stage 4: link
    let linker = RecordLinker::new(&identities, contacts, calendar);
    let app_usage = linker.link(decoded.app_usage);
    let screen_unlocks = linker.link(decoded.screen_unlocks);
    let coverage = LinkCoverage::from_outcomes(&[&app_usage, &screen_unlocks]);
    let link_errors = app_usage.link_errors + screen_unlocks.link_errors;
    if coverage.unmapped_ids > 0 {
        let sample: Vec<&String> = app_usage
            .unmapped_ids
            .union(&screen_unlocks.unmapped_ids)
            .take(10)
            .collect();
        warn!(
            unmapped_ids = coverage.unmapped_ids,
            unmapped_records = coverage.unmapped_records,
            ?sample,
            "submission ids without a participant mapping"
        );
    }

    // Stage 5: dedup
    let app_usage = dedup_records(app_usage.records);
    let screen_unlocks = dedup_records(screen_unlocks.records);

    // Stage 6: aggregate
    let reports = build_participant_reports(
        app_usage.records.iter().chain(screen_unlocks.records.iter()),
        contacts,
    );
    let report = ReportSummary::from_reports(&reports);

    let (diary_identities, _) = IdentityMap::from_diary(diary);
    let ios_reports = build_ios_participant_report(&diary_identities, contacts);
    let ios_participants = ios_reports.iter().filter(|r| r.has_ios_data).count();
    info!(
        rows = ios_reports.len(),
        ios_participants,
        "built iOS participant report"
    );

    info!(
        app_usage = app_usage.records.len(),
        screen_unlocks = screen_unlocks.records.len(),
        participants = reports.len(),
        coverage_pct = coverage.coverage_pct,
        "linked records"
    );

    LinkageResult {
        stats: LinkageStats {
            malformed_upload_rows: 0,
            decode: decoded.stats,
            identity: identity_stats,
            contacts: contact_stats,
            coverage,
            duplicates_removed: DuplicateCounts {
                app_usage: app_usage.removed,
                screen_unlocks: screen_unlocks.removed,
            },
            link_errors,
            report,
            ios_report_rows: ios_reports.len(),
            ios_participants,
            missing_sources: Vec::new(),
        },
        app_usage: app_usage.records,
        screen_unlocks: screen_unlocks.records,
        reports,
        ios_reports,
    }
}

/// Source files as read from disk
#[derive(Debug, Clone, Default)]
pub struct LoadedSources {
    pub uploads: Vec<UploadRecord>,
    pub malformed_upload_rows: usize,
    pub diary: Vec<SurveyRow>,
    pub exit: Option<Vec<SurveyRow>>,
    pub contacts: ContactBook,
    pub missing_sources: Vec<String>,
}

/// An output file and what was written to it
#[derive(Debug, Clone, PartialEq)]
pub struct OutputFile {
    pub path: PathBuf,
    pub status: WriteStatus,
}

/// Everything a linkage run produced
#[derive(Debug, Clone)]
pub struct LinkageRun {
    pub run_id: Uuid,
    pub result: LinkageResult,
    pub outputs: Vec<OutputFile>,
}

#[derive(Serialize)]
struct RunSummary<'a> {
    producer: &'static str,
    version: &'static str,
    run_id: Uuid,
    #[serde(flatten)]
    stats: &'a LinkageStats,
}

/// File-driven linkage pipeline
pub struct LinkagePipeline {
    config: StudyConfig,
}

impl LinkagePipeline {
    pub fn new(config: StudyConfig) -> Self {
        Self { config }
    }

    pub fn config(&self) -> &StudyConfig {
        &self.config
    }

    /// Stage 0: refresh every source that has a fetch command
    ///
    /// A mandatory source that cannot be made available aborts; an optional
    /// one is reported and skipped.
    pub fn fetch_sources(&self) -> Result<Vec<(String, FetchStatus)>, PipelineError> {
        let fetch = &self.config.fetch;
        let fetcher = SourceFetcher::new(
            Duration::from_secs(fetch.reuse_recent_minutes * 60),
            RetryPolicy::from(&self.config.retry),
        );
        let paths = &self.config.paths;
        let sources: [(&str, &Path, Option<&CommandSpec>, bool); 4] = [
            ("uploads", paths.uploads.as_path(), fetch.uploads.as_ref(), true),
            ("diary", paths.diary.as_path(), fetch.diary.as_ref(), true),
            ("exit_survey", paths.exit_survey.as_path(), fetch.exit_survey.as_ref(), false),
            ("contacts", paths.contacts.as_path(), fetch.contacts.as_ref(), false),
        ];

        let mut statuses = Vec::with_capacity(sources.len());
        for (name, path, spec, mandatory) in sources {
            match fetcher.refresh(name, path, spec) {
                Ok(status) => statuses.push((name.to_string(), status)),
                Err(e) if mandatory => return Err(e),
                Err(e) => warn!(source = name, error = %e, "optional source fetch failed, continuing"),
            }
        }
        Ok(statuses)
    }

    /// Stage 1: read every source file
    pub fn load_sources(&self) -> Result<LoadedSources, PipelineError> {
        let paths = &self.config.paths;
        let uploads = UploadReader::from_path(&paths.uploads)?;
        if uploads.records.is_empty() {
            warn!(path = %paths.uploads.display(), "no upload rows found");
        }
        let diary = SurveyReader::from_path(&paths.diary, SurveyKind::Diary)?;
        if diary.is_empty() {
            return Err(PipelineError::unavailable(
                "diary",
                format!("{} has no responses; identities cannot be resolved", paths.diary.display()),
            ));
        }

        let mut missing_sources = Vec::new();
        let exit = optional(
            "exit_survey",
            SurveyReader::from_path(&paths.exit_survey, SurveyKind::Exit),
            &mut missing_sources,
        )?;
        let contacts = optional(
            "contacts",
            ContactReader::from_path(&paths.contacts),
            &mut missing_sources,
        )?
        .unwrap_or_default();

        info!(
            uploads = uploads.records.len(),
            diary = diary.len(),
            exit = exit.as_ref().map_or(0, Vec::len),
            contacts = contacts.len(),
            "loaded sources"
        );
        Ok(LoadedSources {
            uploads: uploads.records,
            malformed_upload_rows: uploads.malformed_rows,
            diary,
            exit,
            contacts,
            missing_sources,
        })
    }

    /// Run stages 0 through 6 and write the outputs
    pub fn run(&self, fetch: bool) -> Result<LinkageRun, PipelineError> {
        let run_id = Uuid::new_v4();
        info!(%run_id, "starting linkage run");

        if fetch {
            for (source, status) in self.fetch_sources()? {
                info!(source = %source, ?status, "source ready");
            }
        }

        let sources = self.load_sources()?;
        let calendar = StudyCalendar::new(self.config.calendar.study_days);
        let mut result = link_batch(
            &sources.uploads,
            &sources.diary,
            sources.exit.as_deref(),
            &sources.contacts,
            calendar,
        );
        result.stats.malformed_upload_rows = sources.malformed_upload_rows;
        result.stats.missing_sources = sources.missing_sources;

        let outputs = self.write_outputs(&result, run_id)?;
        Ok(LinkageRun {
            run_id,
            result,
            outputs,
        })
    }

    /// Write joined CSVs, both participant reports and the run summary
    pub fn write_outputs(&self, result: &LinkageResult, run_id: Uuid) -> Result<Vec<OutputFile>, PipelineError> {
        let dir = &self.config.paths.output_dir;
        let mut outputs = Vec::new();

        let path = dir.join(JOINED_APP_USAGE_FILE);
        let status = write_joined_csv(&path, &result.app_usage, "joined app usage")?;
        outputs.push(OutputFile { path, status });

        let path = dir.join(JOINED_SCREEN_UNLOCKS_FILE);
        let status = write_joined_csv(&path, &result.screen_unlocks, "joined screen unlocks")?;
        outputs.push(OutputFile { path, status });

        let path = dir.join(PARTICIPANT_REPORT_FILE);
        let status = write_report_csv(&path, &result.reports)?;
        outputs.push(OutputFile { path, status });

        let path = dir.join(PARTICIPANT_REPORT_IOS_FILE);
        let status = write_ios_report_csv(&path, &result.ios_reports)?;
        outputs.push(OutputFile { path, status });

        fs::create_dir_all(dir)?;
        let summary = RunSummary {
            producer: PRODUCER_NAME,
            version: STUDY_LINK_VERSION,
            run_id,
            stats: &result.stats,
        };
        fs::write(dir.join(LINKAGE_SUMMARY_FILE), serde_json::to_string_pretty(&summary)?)?;
        Ok(outputs)
    }
}

/// Downgrade an unavailable optional source to `None`
fn optional<T>(
    source: &str,
    loaded: Result<T, PipelineError>,
    missing: &mut Vec<String>,
) -> Result<Option<T>, PipelineError> {
    match loaded {
        Ok(value) => Ok(Some(value)),
        Err(e) if e.kind() == ErrorKind::ExternalUnavailable => {
            warn!(source, error = %e, "optional source unavailable, continuing without it");
            missing.push(source.to_string());
            Ok(None)
        }
        Err(e) => Err(e),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::PathsConfig;
    use crate::types::DataType;
    use pretty_assertions::assert_eq;

    const ENTRY: &str = r#"{"Date": "2025-03-01", "Time": "10:00", "App": "Instagram", "Duration (min)": 15}"#;

    fn upload(id: &str, submission_id: &str, json_data: &str) -> UploadRecord {
        UploadRecord {
            id: id.to_string(),
            created_at: "2025-03-01 12:00:00+00".to_string(),
            json_data: json_data.to_string(),
            submission_id: submission_id.to_string(),
            source_platform: "android".to_string(),
        }
    }

    fn app_usage_blob() -> String {
        format!(r#"[{{"AppUsage": [{}]}}]"#, ENTRY)
    }

    fn contacts() -> ContactBook {
        let mut book = ContactBook::new();
        book.insert(
            "P001",
            crate::types::ParticipantContext {
                condition: Some("control".into()),
                enrollment_date: Some("2025-03-01".into()),
                ..Default::default()
            },
        );
        book
    }

    #[test]
    fn test_end_to_end_single_record() {
        let uploads = vec![upload("1", "42", &app_usage_blob())];
        let diary = vec![SurveyRow::new(["42"], Some("P001"))];

        let result = link_batch(&uploads, &diary, None, &contacts(), StudyCalendar::default());

        assert_eq!(result.app_usage.len(), 1);
        let record = &result.app_usage[0];
        assert_eq!(record.random_id, "P001");
        assert_eq!(record.study_day, Some(1));
        assert_eq!(record.event.app_name(), Some("Instagram"));

        assert_eq!(result.reports.len(), 1);
        let report = &result.reports[0];
        assert_eq!(report.num_submission_ids, 1);
        assert_eq!(report.num_unique_donations, 1);
        assert_eq!(report.data_type, DataType::AppUsage);
        assert_eq!(report.study_days_with_data, vec![1]);
        assert_eq!(result.stats.coverage.coverage_pct, 100.0);
    }

    #[test]
    fn test_retransmission_collapses() {
        let uploads = vec![
            upload("1", "42", &app_usage_blob()),
            upload("2", "42", &app_usage_blob()),
        ];
        let diary = vec![SurveyRow::new(["42"], Some("P001"))];

        let result = link_batch(&uploads, &diary, None, &contacts(), StudyCalendar::default());

        assert_eq!(result.app_usage.len(), 1);
        assert_eq!(result.stats.duplicates_removed.app_usage, 1);
        assert_eq!(result.reports[0].total_donation_records, 1);
        assert_eq!(result.reports[0].num_unique_donations, 1);
    }

    #[test]
    fn test_unmapped_submission_dropped() {
        let uploads = vec![
            upload("1", "42", &app_usage_blob()),
            upload("2", "77", &app_usage_blob()),
        ];
        let diary = vec![SurveyRow::new(["42"], Some("P001"))];

        let result = link_batch(&uploads, &diary, None, &contacts(), StudyCalendar::default());

        assert_eq!(result.app_usage.len(), 1);
        assert_eq!(result.stats.coverage.unmapped_ids, 1);
        assert_eq!(result.stats.coverage.unmapped_records, 1);
    }

    fn write_uploads(path: &Path, uploads: &[UploadRecord]) {
        let mut writer = csv::Writer::from_path(path).unwrap();
        writer
            .write_record(["id", "created_at", "json_data", "submission_id", "platform"])
            .unwrap();
        for u in uploads {
            writer
                .write_record([&u.id, &u.created_at, &u.json_data, &u.submission_id, &u.source_platform])
                .unwrap();
        }
        writer.flush().unwrap();
    }

    fn config_in(dir: &Path) -> StudyConfig {
        StudyConfig {
            paths: PathsConfig {
                uploads: dir.join("uploads.csv"),
                diary: dir.join("diary.csv"),
                exit_survey: dir.join("exit.csv"),
                contacts: dir.join("contacts.csv"),
                output_dir: dir.join("out"),
                ..PathsConfig::default()
            },
            ..StudyConfig::default()
        }
    }

    #[test]
    fn test_run_writes_outputs_without_optional_sources() {
        let dir = tempfile::tempdir().unwrap();
        let config = config_in(dir.path());
        write_uploads(&config.paths.uploads, &[upload("1", "42", &app_usage_blob())]);
        fs::write(&config.paths.diary, "androidSubmissionID1,RANDOM_ID\n42,P001\n").unwrap();

        let run = LinkagePipeline::new(config.clone()).run(false).unwrap();

        assert_eq!(
            run.result.stats.missing_sources,
            vec!["exit_survey".to_string(), "contacts".to_string()]
        );
        assert_eq!(run.result.app_usage[0].random_id, "P001");
        assert_eq!(run.result.app_usage[0].context.condition_str(), "");
        assert_eq!(run.result.app_usage[0].study_day, None);

        let statuses: Vec<WriteStatus> = run.outputs.iter().map(|o| o.status).collect();
        assert_eq!(
            statuses,
            vec![
                WriteStatus::Written { rows: 1 },
                WriteStatus::SkippedEmpty,
                WriteStatus::Written { rows: 1 },
                WriteStatus::SkippedEmpty,
            ]
        );
        let out = &config.paths.output_dir;
        assert!(out.join(JOINED_APP_USAGE_FILE).exists());
        assert!(!out.join(JOINED_SCREEN_UNLOCKS_FILE).exists());
        assert!(out.join(LINKAGE_SUMMARY_FILE).exists());
    }

    #[test]
    fn test_run_writes_ios_report_and_summary() {
        let dir = tempfile::tempdir().unwrap();
        let config = config_in(dir.path());
        write_uploads(&config.paths.uploads, &[upload("1", "42", &app_usage_blob())]);
        fs::write(
            &config.paths.diary,
            "androidSubmissionID1,androidSubmissionID2,RANDOM_ID\n42,,P001\nA1,A2,P002\n",
        )
        .unwrap();
        fs::write(
            &config.paths.contacts,
            "RANDOM_ID,Condition,Platforms,phoneType,EnrollmentDate\n\
             P001,control,Android,Pixel,2025-03-01\n\
             P002,control,iOS,iPhone 13,whenever\n",
        )
        .unwrap();

        let run = LinkagePipeline::new(config.clone()).run(false).unwrap();

        let ios: Vec<(&str, bool)> = run
            .result
            .ios_reports
            .iter()
            .map(|r| (r.random_id.as_str(), r.has_ios_data))
            .collect();
        assert_eq!(ios, vec![("P001", false), ("P002", true)]);
        assert_eq!(run.result.stats.ios_participants, 1);
        assert_eq!(
            run.result.stats.contacts.unrecognized_enrollment_dates,
            vec!["P002".to_string()]
        );

        let out = &config.paths.output_dir;
        let ios_csv = fs::read_to_string(out.join(PARTICIPANT_REPORT_IOS_FILE)).unwrap();
        assert_eq!(ios_csv.lines().count(), 3);

        let summary: serde_json::Value =
            serde_json::from_str(&fs::read_to_string(out.join(LINKAGE_SUMMARY_FILE)).unwrap()).unwrap();
        assert_eq!(summary["producer"], "study-link");
        assert_eq!(summary["version"], STUDY_LINK_VERSION);
        assert_eq!(summary["identity"]["submissions_per_participant"]["1"], 1);
        assert_eq!(summary["identity"]["submissions_per_participant"]["2"], 1);
    }

    #[test]
    fn test_missing_diary_aborts() {
        let dir = tempfile::tempdir().unwrap();
        let config = config_in(dir.path());
        write_uploads(&config.paths.uploads, &[upload("1", "42", &app_usage_blob())]);

        let err = LinkagePipeline::new(config).run(false).unwrap_err();
        assert_eq!(err.kind(), ErrorKind::ExternalUnavailable);
        assert!(err.to_string().contains("diary"));
    }

    #[test]
    fn test_mandatory_fetch_failure_aborts() {
        let dir = tempfile::tempdir().unwrap();
        let mut config = config_in(dir.path());
        config.fetch.reuse_recent_minutes = 0;
        config.retry.base_delay_ms = 0;
        config.fetch.uploads = Some(CommandSpec {
            command: "false".into(),
            args: vec![],
            timeout_secs: 5,
        });

        let err = LinkagePipeline::new(config).fetch_sources().unwrap_err();
        assert_eq!(err.kind(), ErrorKind::ExternalUnavailable);
    }
}
