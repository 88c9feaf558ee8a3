//! Core types for the Study Link pipeline
//!
//! This module defines the records that flow through each stage: raw uploads,
//! decoded usage events, participant context, joined records, and the
//! per-participant report.

use chrono::NaiveDateTime;
use serde::{Deserialize, Serialize};
use std::fmt;

/// Canonical datetime rendering used in every output table and fingerprint
pub const DATETIME_FORMAT: &str = "%Y-%m-%d %H:%M:%S";

/// Coarse device platform classification
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub enum Platform {
    Android,
    #[serde(rename = "iOS")]
    Ios,
    Other,
}

impl Platform {
    pub fn as_str(&self) -> &'static str {
        match self {
            Platform::Android => "Android",
            Platform::Ios => "iOS",
            Platform::Other => "Other",
        }
    }
}

impl fmt::Display for Platform {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// One row of raw device telemetry as exported from the uploads table
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct UploadRecord {
    /// Row identifier in the uploads table
    pub id: String,
    /// Ingestion timestamp (raw text)
    pub created_at: String,
    /// Nested JSON payload: an array of single-key objects
    pub json_data: String,
    /// Opaque per-upload device identifier, not yet linked to a participant
    pub submission_id: String,
    /// Upload source label from the export (e.g. "ActivityWatch")
    pub source_platform: String,
}

/// Kind of usage record, used to keep app-usage and unlock tables apart
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RecordKind {
    AppUsage,
    ScreenUnlock,
}

/// Variant-specific payload of a decoded usage event
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum EventKind {
    AppUsage {
        app_name: String,
        duration_minutes: Option<f64>,
    },
    ScreenUnlock,
}

/// A decoded app-usage or screen-unlock row
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct UsageEvent {
    pub kind: EventKind,
    /// Local wall-clock session time; `None` when missing or unparseable
    pub session_datetime: Option<NaiveDateTime>,
    /// Canonical (trimmed) submission identifier
    pub submission_id: String,
    /// Ingestion time of the enclosing upload
    pub created_at_datetime: Option<NaiveDateTime>,
    /// Platform derived from the upload's bucket info
    pub platform: Platform,
}

impl UsageEvent {
    pub fn record_kind(&self) -> RecordKind {
        match self.kind {
            EventKind::AppUsage { .. } => RecordKind::AppUsage,
            EventKind::ScreenUnlock => RecordKind::ScreenUnlock,
        }
    }

    /// Session time in canonical form, or the empty string
    pub fn session_datetime_str(&self) -> String {
        format_datetime(self.session_datetime)
    }

    pub fn created_at_datetime_str(&self) -> String {
        format_datetime(self.created_at_datetime)
    }

    pub fn app_name(&self) -> Option<&str> {
        match &self.kind {
            EventKind::AppUsage { app_name, .. } => Some(app_name),
            EventKind::ScreenUnlock => None,
        }
    }

    pub fn duration_minutes(&self) -> Option<f64> {
        match &self.kind {
            EventKind::AppUsage {
                duration_minutes, ..
            } => *duration_minutes,
            EventKind::ScreenUnlock => None,
        }
    }
}

/// Render an optional datetime the way every output table does
pub fn format_datetime(value: Option<NaiveDateTime>) -> String {
    value
        .map(|dt| dt.format(DATETIME_FORMAT).to_string())
        .unwrap_or_default()
}

/// Render a duration so that `15` and `15.0` compare equal
pub fn format_duration(value: Option<f64>) -> String {
    match value {
        Some(v) if v.fract() == 0.0 && v.abs() < 1e15 => format!("{}", v as i64),
        Some(v) => v.to_string(),
        None => String::new(),
    }
}

/// Enrichment data for a participant, taken from the contact list
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ParticipantContext {
    /// Experimental arm
    pub condition: Option<String>,
    pub platforms: Option<String>,
    pub phone_type: Option<String>,
    /// First calendar day of study participation (raw text)
    pub enrollment_date: Option<String>,
}

impl ParticipantContext {
    pub fn condition_str(&self) -> &str {
        self.condition.as_deref().unwrap_or("")
    }

    pub fn platforms_str(&self) -> &str {
        self.platforms.as_deref().unwrap_or("")
    }

    pub fn phone_type_str(&self) -> &str {
        self.phone_type.as_deref().unwrap_or("")
    }

    pub fn enrollment_date_str(&self) -> &str {
        self.enrollment_date.as_deref().unwrap_or("")
    }
}

/// A usage event attributed to a participant and enriched with context
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct JoinedRecord {
    pub event: UsageEvent,
    pub random_id: String,
    pub context: ParticipantContext,
    /// Day 1..=study length relative to enrollment; `None` when unmapped
    pub study_day: Option<u32>,
}

impl JoinedRecord {
    pub fn record_kind(&self) -> RecordKind {
        self.event.record_kind()
    }
}

/// Which record kinds a participant contributed
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DataType {
    AppUsage,
    ScreenUnlocks,
    Mixed,
}

impl DataType {
    pub fn as_str(&self) -> &'static str {
        match self {
            DataType::AppUsage => "app_usage",
            DataType::ScreenUnlocks => "screen_unlocks",
            DataType::Mixed => "mixed",
        }
    }

    /// Fold one more record kind into the running classification
    pub fn absorb(current: Option<DataType>, kind: RecordKind) -> DataType {
        let incoming = match kind {
            RecordKind::AppUsage => DataType::AppUsage,
            RecordKind::ScreenUnlock => DataType::ScreenUnlocks,
        };
        match current {
            None => incoming,
            Some(existing) if existing == incoming => existing,
            Some(_) => DataType::Mixed,
        }
    }
}

/// One summary row per participant
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ParticipantReport {
    pub random_id: String,
    pub context: ParticipantContext,
    pub data_type: DataType,
    pub num_submission_ids: usize,
    pub num_unique_donations: usize,
    pub total_donation_records: usize,
    pub uniqueness_ratio: f64,
    /// Sorted study days with any data
    pub study_days_with_data: Vec<u32>,
    /// Sorted distinct submission ids
    pub submission_ids: Vec<String>,
}

impl ParticipantReport {
    pub fn num_study_days_with_data(&self) -> usize {
        self.study_days_with_data.len()
    }
}
