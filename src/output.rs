//! CSV writers for joined records and participant reports
//!
//! Rows are put into a canonical order at write time so identical inputs give
//! byte-identical files. An empty table is reported and no file is written.

use crate::error::PipelineError;
use crate::report::IosParticipantRow;
use crate::types::{format_duration, EventKind, JoinedRecord, ParticipantReport};
use std::collections::{BTreeMap, BTreeSet};
use std::fs;
use std::io;
use std::path::Path;
use tracing::{info, warn};

/// Fixed column order of the participant report
pub const REPORT_COLUMNS: [&str; 13] = [
    "RANDOM_ID",
    "Condition",
    "Platforms",
    "phoneType",
    "EnrollmentDate",
    "data_type",
    "num_submission_ids",
    "num_unique_donations",
    "total_donation_records",
    "uniqueness_ratio",
    "study_days_with_data",
    "num_study_days_with_data",
    "submission_ids_list",
];

/// Fixed column order of the iOS participant report
pub const IOS_REPORT_COLUMNS: [&str; 8] = [
    "RANDOM_ID",
    "Condition",
    "Platforms",
    "phoneType",
    "EnrollmentDate",
    "has_ios_data",
    "num_submission_ids",
    "submission_ids_list",
];

/// Result of a write request
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WriteStatus {
    Written { rows: usize },
    SkippedEmpty,
}

/// Flatten a joined record into named cells
pub fn joined_row(record: &JoinedRecord) -> BTreeMap<&'static str, String> {
    let event = &record.event;
    let mut row = BTreeMap::new();
    row.insert("session_datetime", event.session_datetime_str());
    row.insert("submission_id", event.submission_id.clone());
    row.insert("created_at_datetime", event.created_at_datetime_str());
    row.insert("platform", event.platform.to_string());
    if let EventKind::AppUsage {
        app_name,
        duration_minutes,
    } = &event.kind
    {
        row.insert("App", app_name.clone());
        row.insert("Duration (min)", format_duration(*duration_minutes));
    }
    row.insert("RANDOM_ID", record.random_id.clone());
    row.insert("Condition", record.context.condition_str().to_string());
    row.insert("Platforms", record.context.platforms_str().to_string());
    row.insert("phoneType", record.context.phone_type_str().to_string());
    row.insert("EnrollmentDate", record.context.enrollment_date_str().to_string());
    row.insert(
        "study_day",
        record.study_day.map(|d| d.to_string()).unwrap_or_default(),
    );
    row
}

fn sort_key(record: &JoinedRecord) -> (String, String, String, String, String) {
    let event = &record.event;
    (
        record.random_id.clone(),
        event.session_datetime_str(),
        event.submission_id.clone(),
        event.app_name().unwrap_or("").to_string(),
        format_duration(event.duration_minutes()),
    )
}

/// Write joined records as CSV; columns are the sorted union of row keys
pub fn write_joined<W: io::Write>(writer: W, records: &[JoinedRecord]) -> Result<usize, PipelineError> {
    let mut ordered: Vec<(_, &JoinedRecord)> = records.iter().map(|r| (sort_key(r), r)).collect();
    ordered.sort_by(|a, b| a.0.cmp(&b.0));

    let rows: Vec<_> = ordered.into_iter().map(|(_, r)| joined_row(r)).collect();
    let columns: BTreeSet<&'static str> = rows.iter().flat_map(|r| r.keys().copied()).collect();

    let mut csv_writer = csv::Writer::from_writer(writer);
    csv_writer.write_record(columns.iter())?;
    for row in &rows {
        csv_writer.write_record(columns.iter().map(|c| row.get(c).map(String::as_str).unwrap_or("")))?;
    }
    csv_writer.flush()?;
    Ok(rows.len())
}

/// Write the participant report in its fixed column order
pub fn write_report<W: io::Write>(writer: W, reports: &[ParticipantReport]) -> Result<usize, PipelineError> {
    let mut csv_writer = csv::Writer::from_writer(writer);
    csv_writer.write_record(REPORT_COLUMNS)?;
    for report in reports {
        csv_writer.write_record([
            report.random_id.clone(),
            report.context.condition_str().to_string(),
            report.context.platforms_str().to_string(),
            report.context.phone_type_str().to_string(),
            report.context.enrollment_date_str().to_string(),
            report.data_type.as_str().to_string(),
            report.num_submission_ids.to_string(),
            report.num_unique_donations.to_string(),
            report.total_donation_records.to_string(),
            report.uniqueness_ratio.to_string(),
            serde_json::to_string(&report.study_days_with_data)?,
            report.num_study_days_with_data().to_string(),
            serde_json::to_string(&report.submission_ids)?,
        ])?;
    }
    csv_writer.flush()?;
    Ok(reports.len())
}

/// Write the iOS participant report in its fixed column order
pub fn write_ios_report<W: io::Write>(writer: W, rows: &[IosParticipantRow]) -> Result<usize, PipelineError> {
    let mut csv_writer = csv::Writer::from_writer(writer);
    csv_writer.write_record(IOS_REPORT_COLUMNS)?;
    for row in rows {
        csv_writer.write_record([
            row.random_id.clone(),
            row.context.condition_str().to_string(),
            row.context.platforms_str().to_string(),
            row.context.phone_type_str().to_string(),
            row.context.enrollment_date_str().to_string(),
            row.has_ios_data.to_string(),
            row.num_submission_ids().to_string(),
            serde_json::to_string(&row.submission_ids)?,
        ])?;
    }
    csv_writer.flush()?;
    Ok(rows.len())
}

pub(crate) fn write_file<F>(path: &Path, rows: usize, label: &str, write: F) -> Result<WriteStatus, PipelineError>
where
    F: FnOnce(fs::File) -> Result<usize, PipelineError>,
{
    if rows == 0 {
        warn!(path = %path.display(), "no {} to write, skipping file", label);
        return Ok(WriteStatus::SkippedEmpty);
    }
    if let Some(parent) = path.parent() {
        if !parent.as_os_str().is_empty() {
            fs::create_dir_all(parent)?;
        }
    }
    let written = write(fs::File::create(path)?)?;
    let bytes = fs::metadata(path).map(|m| m.len()).unwrap_or(0);
    info!(path = %path.display(), rows = written, bytes, "wrote {}", label);
    Ok(WriteStatus::Written { rows: written })
}

pub fn write_joined_csv(path: &Path, records: &[JoinedRecord], label: &str) -> Result<WriteStatus, PipelineError> {
    write_file(path, records.len(), label, |file| write_joined(file, records))
}

pub fn write_report_csv(path: &Path, reports: &[ParticipantReport]) -> Result<WriteStatus, PipelineError> {
    write_file(path, reports.len(), "participant report", |file| write_report(file, reports))
}

pub fn write_ios_report_csv(path: &Path, rows: &[IosParticipantRow]) -> Result<WriteStatus, PipelineError> {
    write_file(path, rows.len(), "iOS participant report", |file| write_ios_report(file, rows))
}
