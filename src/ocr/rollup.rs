//! Per-participant roll-up of screenshot analyses
//!
//! Layout under the image root:
//!
//! ```text
//! <root>/<participant id>/<response id>/<image>
//! <root>/<participant id>/<response id>/<image stem>_analysis.json
//! ```
//!
//! An OCR output directory mirrors the same layout, so either tree can be
//! rolled up.
//!
//! Participant directories have numeric names. Response directories are named
//! by the survey response id (`R_...`), which keys the upload-based date.

use super::analyzer::load_artifact;
use super::batch::is_artifact;
use super::types::{AnalysisWarning, AppEntry, UNKNOWN};
use crate::error::PipelineError;
use crate::output::{write_file, WriteStatus};
use crate::sources::ResponseStartDates;
use crate::types::format_duration;
use chrono::{Duration, SecondsFormat, Utc};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet};
use std::fs;
use std::io;
use std::path::{Path, PathBuf};
use tracing::{info, warn};

/// Columns of the participant and aggregated CSVs
pub const SUMMARY_COLUMNS: [&str; 5] = ["PID", "DeviceType", "App", "Date", "Duration"];

pub const AGGREGATED_FILE: &str = "aggregated_participant_data.csv";

/// One analyzed screenshot inside a participant summary
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DailyEntry {
    pub response_id: String,
    pub source_image: String,
    /// Date as read off the screenshot
    pub screenshot_date: String,
    /// Day before the response was started
    pub screenshot_date_based_on_upload: Option<String>,
    pub screenshot_timestamp: String,
    pub device_type_confidence: f64,
    pub apps: Vec<AppEntry>,
    pub total_apps: usize,
    pub total_time_minutes: f64,
    pub analysis_warnings: usize,
    pub warning_details: Vec<AnalysisWarning>,
    pub date_normalized_to_reference_year: bool,
}

/// Entries grouped under one reported device type
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct DeviceSummary {
    pub daily_entries: Vec<DailyEntry>,
    pub total_entries: usize,
    pub total_apps_detected: usize,
    pub unique_apps: Vec<String>,
    pub unique_apps_count: usize,
    pub average_confidence: f64,
    pub total_time_minutes: f64,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct DateRange {
    pub earliest: Option<String>,
    pub latest: Option<String>,
}

impl DateRange {
    fn include(&mut self, date: &str) {
        if date.is_empty() || date == UNKNOWN {
            return;
        }
        if self.earliest.as_deref().map_or(true, |e| date < e) {
            self.earliest = Some(date.to_string());
        }
        if self.latest.as_deref().map_or(true, |l| date > l) {
            self.latest = Some(date.to_string());
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ArtifactError {
    pub file: String,
    pub response_folder: String,
    pub error: String,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ParsingSummary {
    pub total_json_files_found: usize,
    pub successfully_parsed: usize,
    pub parsing_errors: Vec<ArtifactError>,
}

/// Everything known about one participant's screenshots
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ParticipantSummary {
    pub participant_id: String,
    pub report_timestamp: String,
    pub device_types: BTreeMap<String, DeviceSummary>,
    pub total_daily_entries: usize,
    pub date_range: DateRange,
    pub processing_summary: ParsingSummary,
}

impl ParticipantSummary {
    /// Flat CSV rows; apps with no or zero minutes are left out
    pub fn csv_rows(&self) -> Vec<[String; 5]> {
        let mut rows = Vec::new();
        for (device_type, device) in &self.device_types {
            for entry in &device.daily_entries {
                let date = entry.screenshot_date_based_on_upload.clone().unwrap_or_default();
                for app in &entry.apps {
                    let Some(minutes) = app.time_spent_minutes.filter(|m| *m != 0.0) else {
                        continue;
                    };
                    rows.push([
                        self.participant_id.clone(),
                        device_type.clone(),
                        app.app_name.clone(),
                        date.clone(),
                        format_duration(Some(minutes)),
                    ]);
                }
            }
        }
        rows
    }
}

/// Files written for one participant
#[derive(Debug, Clone, PartialEq)]
pub struct ParticipantFiles {
    pub json: PathBuf,
    pub csv: WriteStatus,
}

/// Outcome of a roll-up run
#[derive(Debug, Clone)]
pub struct RollupResult {
    pub summaries: Vec<ParticipantSummary>,
    pub aggregated: Option<WriteStatus>,
}

/// Builds participant summaries from analysis artifacts
pub struct ParticipantRollup<'a> {
    root: PathBuf,
    start_dates: &'a ResponseStartDates,
}

impl<'a> ParticipantRollup<'a> {
    pub fn new(root: impl Into<PathBuf>, start_dates: &'a ResponseStartDates) -> Self {
        Self {
            root: root.into(),
            start_dates,
        }
    }

    /// Participant directories, sorted numerically
    ///
    /// With `only`, just that participant is returned if its directory exists.
    pub fn discover_participants(&self, only: Option<&str>) -> Result<Vec<(String, PathBuf)>, PipelineError> {
        if !self.root.is_dir() {
            return Err(PipelineError::unavailable(
                "screenshots",
                format!("{} does not exist", self.root.display()),
            ));
        }
        if let Some(id) = only {
            let dir = self.root.join(id);
            if dir.is_dir() {
                return Ok(vec![(id.to_string(), dir)]);
            }
            warn!(participant = id, root = %self.root.display(), "participant not found");
            return Ok(Vec::new());
        }

        let mut found: Vec<(u64, String, PathBuf)> = Vec::new();
        for entry in fs::read_dir(&self.root)? {
            let path = entry?.path();
            let Some(name) = path.file_name().and_then(|n| n.to_str()) else {
                continue;
            };
            if !path.is_dir() || name.is_empty() || !name.bytes().all(|b| b.is_ascii_digit()) {
                continue;
            }
            // numeric order; overlong ids sort last
            let key = name.parse().unwrap_or(u64::MAX);
            found.push((key, name.to_string(), path));
        }
        found.sort();
        info!(participants = found.len(), "discovered participants");
        Ok(found.into_iter().map(|(_, name, path)| (name, path)).collect())
    }

    /// Upload-based screenshot date: the response start date minus one day
    pub fn upload_date(&self, response_id: &str) -> Option<String> {
        let start = self.start_dates.get(response_id)?;
        let date = start.checked_sub_signed(Duration::days(1))?;
        Some(date.format("%Y-%m-%d").to_string())
    }

    /// Summarize every artifact under one participant directory
    pub fn summarize_participant(&self, participant_id: &str, dir: &Path) -> Result<ParticipantSummary, PipelineError> {
        let mut summary = ParticipantSummary {
            participant_id: participant_id.to_string(),
            report_timestamp: Utc::now().to_rfc3339_opts(SecondsFormat::Secs, true),
            device_types: BTreeMap::new(),
            total_daily_entries: 0,
            date_range: DateRange::default(),
            processing_summary: ParsingSummary::default(),
        };
        let mut unique_apps: BTreeMap<String, BTreeSet<String>> = BTreeMap::new();
        let mut confidences: BTreeMap<String, Vec<f64>> = BTreeMap::new();

        for (artifact, response_id) in artifacts_in(dir)? {
            summary.processing_summary.total_json_files_found += 1;
            let analysis = match load_artifact(&artifact) {
                Ok(analysis) => analysis,
                Err(e) => {
                    warn!(file = %artifact.display(), error = %e, "could not parse analysis");
                    summary.processing_summary.parsing_errors.push(ArtifactError {
                        file: artifact.display().to_string(),
                        response_folder: response_id,
                        error: e.to_string(),
                    });
                    continue;
                }
            };

            let response = analysis.response;
            let upload_date = self.upload_date(&response_id);
            summary.date_range.include(&response.date_of_screenshot);
            if let Some(date) = &upload_date {
                summary.date_range.include(date);
            }

            let device_type = response.device_type.clone();
            unique_apps
                .entry(device_type.clone())
                .or_default()
                .extend(response.apps.iter().map(|a| a.app_name.clone()));
            confidences
                .entry(device_type.clone())
                .or_default()
                .push(response.device_type_confidence);

            let device = summary.device_types.entry(device_type).or_default();
            device.total_entries += 1;
            device.total_apps_detected += response.apps.len();
            device.daily_entries.push(DailyEntry {
                response_id,
                source_image: analysis.metadata.source_image,
                screenshot_date: response.date_of_screenshot,
                screenshot_date_based_on_upload: upload_date,
                screenshot_timestamp: response.screenshot_timestamp,
                device_type_confidence: response.device_type_confidence,
                total_apps: response.apps.len(),
                total_time_minutes: response.apps.iter().map(AppEntry::minutes).sum(),
                apps: response.apps,
                analysis_warnings: analysis.metadata.analysis_warnings.len(),
                warning_details: analysis.metadata.analysis_warnings,
                date_normalized_to_reference_year: analysis.metadata.date_normalized_to_reference_year,
            });
            summary.total_daily_entries += 1;
            summary.processing_summary.successfully_parsed += 1;
        }

        for (device_type, device) in summary.device_types.iter_mut() {
            let apps = unique_apps.remove(device_type).unwrap_or_default();
            device.unique_apps_count = apps.len();
            device.unique_apps = apps.into_iter().collect();
            let scores = confidences.remove(device_type).unwrap_or_default();
            device.average_confidence = if scores.is_empty() {
                0.0
            } else {
                scores.iter().sum::<f64>() / scores.len() as f64
            };
            device.daily_entries.sort_by(|a, b| {
                (&a.screenshot_date, &a.screenshot_timestamp).cmp(&(&b.screenshot_date, &b.screenshot_timestamp))
            });
            device.total_time_minutes = device.daily_entries.iter().map(|e| e.total_time_minutes).sum();
        }

        Ok(summary)
    }

    /// Write `participant_<id>_summary.json` and `.csv` into `dir`
    pub fn write_participant(&self, summary: &ParticipantSummary, dir: &Path) -> Result<ParticipantFiles, PipelineError> {
        let json = dir.join(format!("participant_{}_summary.json", summary.participant_id));
        fs::write(&json, serde_json::to_string_pretty(summary)?)?;

        let rows = summary.csv_rows();
        let csv_path = dir.join(format!("participant_{}_summary.csv", summary.participant_id));
        let csv = write_file(&csv_path, rows.len(), "participant screenshot rows", |file| {
            write_summary_rows(file, &rows)
        })?;

        for (device_type, device) in &summary.device_types {
            info!(
                participant = %summary.participant_id,
                device_type = %device_type,
                entries = device.total_entries,
                unique_apps = device.unique_apps_count,
                average_confidence = device.average_confidence,
                "participant device summary"
            );
        }
        Ok(ParticipantFiles { json, csv })
    }

    /// Summarize and write every participant (or just `only`)
    ///
    /// The aggregated CSV is written for an unfiltered run over more than one
    /// participant.
    pub fn run(&self, only: Option<&str>) -> Result<RollupResult, PipelineError> {
        let participants = self.discover_participants(only)?;
        let mut summaries = Vec::with_capacity(participants.len());
        for (id, dir) in &participants {
            let summary = self.summarize_participant(id, dir)?;
            self.write_participant(&summary, dir)?;
            summaries.push(summary);
        }

        let aggregated = if only.is_none() && summaries.len() > 1 {
            let rows: Vec<[String; 5]> = summaries.iter().flat_map(ParticipantSummary::csv_rows).collect();
            let path = self.root.join(AGGREGATED_FILE);
            Some(write_file(&path, rows.len(), "aggregated screenshot rows", |file| {
                write_summary_rows(file, &rows)
            })?)
        } else {
            None
        };

        Ok(RollupResult { summaries, aggregated })
    }
}

fn artifacts_in(participant_dir: &Path) -> Result<Vec<(PathBuf, String)>, PipelineError> {
    let mut found = Vec::new();
    for response in fs::read_dir(participant_dir)? {
        let response_dir = response?.path();
        if !response_dir.is_dir() {
            continue;
        }
        let response_id = response_dir
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_default();
        for file in fs::read_dir(&response_dir)? {
            let path = file?.path();
            if path.is_file() && is_artifact(&path) {
                found.push((path, response_id.clone()));
            }
        }
    }
    found.sort();
    Ok(found)
}

fn write_summary_rows<W: io::Write>(writer: W, rows: &[[String; 5]]) -> Result<usize, PipelineError> {
    let mut csv_writer = csv::Writer::from_writer(writer);
    csv_writer.write_record(SUMMARY_COLUMNS)?;
    for row in rows {
        csv_writer.write_record(row)?;
    }
    csv_writer.flush()?;
    Ok(rows.len())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ocr::types::{AnalysisMetadata, ModelResponse, ScreenshotAnalysis};
    use chrono::NaiveDate;
    use pretty_assertions::assert_eq;

    fn app(name: &str, minutes: Option<f64>) -> AppEntry {
        AppEntry {
            app_name: name.into(),
            time_spent: None,
            time_spent_minutes: minutes,
        }
    }

    fn write_artifact(path: &Path, device: &str, date: &str, timestamp: &str, apps: Vec<AppEntry>) {
        fs::create_dir_all(path.parent().unwrap()).unwrap();
        let analysis = ScreenshotAnalysis {
            response: ModelResponse {
                device_type: device.into(),
                device_type_confidence: 0.8,
                date_of_screenshot: date.into(),
                screenshot_timestamp: timestamp.into(),
                apps,
                analysis_notes: None,
            },
            metadata: AnalysisMetadata {
                source_image: path.display().to_string(),
                analysis_timestamp: "2025-07-16T10:00:00Z".into(),
                model_used: "canned".into(),
                analysis_warnings: vec![],
                date_normalized_to_reference_year: false,
            },
        };
        fs::write(path, serde_json::to_string(&analysis).unwrap()).unwrap();
    }

    fn start_dates() -> ResponseStartDates {
        let mut store = ResponseStartDates::in_memory();
        store
            .insert("R_abc", NaiveDate::from_ymd_opt(2025, 7, 16).unwrap())
            .unwrap();
        store
    }

    #[test]
    fn test_participants_sorted_numerically() {
        let dir = tempfile::tempdir().unwrap();
        for name in ["10", "2", "1", "notes", "R_x"] {
            fs::create_dir_all(dir.path().join(name)).unwrap();
        }
        let dates = ResponseStartDates::in_memory();
        let rollup = ParticipantRollup::new(dir.path(), &dates);

        let ids: Vec<String> = rollup
            .discover_participants(None)
            .unwrap()
            .into_iter()
            .map(|(id, _)| id)
            .collect();
        assert_eq!(ids, vec!["1", "2", "10"]);
        assert_eq!(rollup.discover_participants(Some("2")).unwrap().len(), 1);
        assert!(rollup.discover_participants(Some("99")).unwrap().is_empty());
    }

    #[test]
    fn test_upload_date_is_day_before_start() {
        let dates = start_dates();
        let rollup = ParticipantRollup::new("unused", &dates);
        assert_eq!(rollup.upload_date("R_abc").as_deref(), Some("2025-07-15"));
        assert_eq!(rollup.upload_date("R_missing"), None);
    }

    #[test]
    fn test_summary_groups_by_device() {
        let dir = tempfile::tempdir().unwrap();
        let participant = dir.path().join("7");
        write_artifact(
            &participant.join("R_abc/IMG_2_analysis.json"),
            "iphone",
            "2025-07-15",
            "22:00",
            vec![app("YouTube", Some(30.0)), app("Maps", Some(0.0))],
        );
        write_artifact(
            &participant.join("R_abc/IMG_1_analysis.json"),
            "iphone",
            "2025-07-15",
            "09:00",
            vec![app("YouTube", Some(12.5)), app("Clock", None)],
        );
        write_artifact(
            &participant.join("R_def/IMG_3_analysis.json"),
            "ipad",
            "2025-07-10",
            "10:00",
            vec![app("Safari", Some(5.0))],
        );
        fs::write(participant.join("R_def/IMG_4_analysis.json"), "not json").unwrap();

        let dates = start_dates();
        let rollup = ParticipantRollup::new(dir.path(), &dates);
        let summary = rollup.summarize_participant("7", &participant).unwrap();

        assert_eq!(summary.total_daily_entries, 3);
        assert_eq!(summary.processing_summary.total_json_files_found, 4);
        assert_eq!(summary.processing_summary.parsing_errors.len(), 1);
        assert_eq!(summary.date_range.earliest.as_deref(), Some("2025-07-10"));
        assert_eq!(summary.date_range.latest.as_deref(), Some("2025-07-15"));

        let iphone = &summary.device_types["iphone"];
        assert_eq!(iphone.total_entries, 2);
        assert_eq!(iphone.total_apps_detected, 4);
        assert_eq!(iphone.unique_apps, vec!["Clock", "Maps", "YouTube"]);
        assert_eq!(iphone.daily_entries[0].screenshot_timestamp, "09:00");
        assert_eq!(iphone.total_time_minutes, 42.5);
        assert_eq!(
            iphone.daily_entries[0].screenshot_date_based_on_upload.as_deref(),
            Some("2025-07-15")
        );

        let rows = summary.csv_rows();
        assert_eq!(
            rows,
            vec![
                ["7", "ipad", "Safari", "", "5"].map(String::from),
                ["7", "iphone", "YouTube", "2025-07-15", "12.5"].map(String::from),
                ["7", "iphone", "YouTube", "2025-07-15", "30"].map(String::from),
            ]
        );
    }

    #[test]
    fn test_run_writes_files_and_aggregate() {
        let dir = tempfile::tempdir().unwrap();
        write_artifact(
            &dir.path().join("1/R_abc/a_analysis.json"),
            "iphone",
            "2025-07-15",
            "09:00",
            vec![app("YouTube", Some(10.0))],
        );
        write_artifact(
            &dir.path().join("2/R_xyz/b_analysis.json"),
            "iphone",
            "2025-07-12",
            "09:00",
            vec![app("Maps", Some(3.0))],
        );

        let dates = start_dates();
        let rollup = ParticipantRollup::new(dir.path(), &dates);
        let result = rollup.run(None).unwrap();
        assert_eq!(result.summaries.len(), 2);
        assert_eq!(result.aggregated, Some(WriteStatus::Written { rows: 2 }));
        assert!(dir.path().join("1/participant_1_summary.json").exists());

        let csv = fs::read_to_string(dir.path().join("1/participant_1_summary.csv")).unwrap();
        assert_eq!(csv, "PID,DeviceType,App,Date,Duration\n1,iphone,YouTube,2025-07-15,10\n");

        let filtered = rollup.run(Some("2")).unwrap();
        assert_eq!(filtered.summaries.len(), 1);
        assert_eq!(filtered.aggregated, None);
    }
}
