//! JSON-blob decoder
//!
//! Unpacks the `json_data` payload of each upload row into flat usage events.
//! The payload is a JSON array of single-key objects; the same key may repeat
//! across elements, so every `AppUsage` and `ScreenUnlocks` array found is
//! decoded.

use crate::error::PipelineError;
use crate::identity::canonical_submission_id;
use crate::types::{EventKind, Platform, UploadRecord, UsageEvent};
use chrono::{DateTime, NaiveDate, NaiveDateTime, NaiveTime};
use serde::Serialize;
use serde_json::{Map, Value};
use std::collections::BTreeMap;
use tracing::{debug, info};

const APP_USAGE_KEY: &str = "AppUsage";
const SCREEN_UNLOCKS_KEY: &str = "ScreenUnlocks";
const BUCKET_INFO_KEY: &str = "BucketInfo";
const DURATION_KEY: &str = "Duration (min)";

const SESSION_DATE_FORMATS: &[&str] = &["%Y-%m-%d", "%m/%d/%Y", "%Y/%m/%d"];
const SESSION_TIME_FORMATS: &[&str] = &["%H:%M:%S", "%H:%M:%S%.f", "%I:%M:%S %p"];

/// Events decoded from a single upload row
#[derive(Debug, Clone, PartialEq)]
pub struct DecodedUpload {
    pub app_usage: Vec<UsageEvent>,
    pub screen_unlocks: Vec<UsageEvent>,
    pub platform: Platform,
    /// Entries skipped because a field could not be decoded
    pub entry_errors: usize,
}

/// Counters for one decode batch
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct DecodeStats {
    pub rows: usize,
    pub row_errors: usize,
    pub entry_errors: usize,
    pub app_usage_events: usize,
    pub screen_unlock_events: usize,
    pub rows_by_platform: BTreeMap<String, usize>,
}

/// All events from a batch of uploads, in upload order
#[derive(Debug, Clone, Default)]
pub struct DecodedBatch {
    pub app_usage: Vec<UsageEvent>,
    pub screen_unlocks: Vec<UsageEvent>,
    pub stats: DecodeStats,
}

/// Decode one upload row
///
/// Fails only when the payload is not a JSON array; malformed entries are
/// skipped and counted in `entry_errors`.
pub fn decode_upload(upload: &UploadRecord) -> Result<DecodedUpload, PipelineError> {
    let payload: Value = serde_json::from_str(&upload.json_data).map_err(|e| {
        PipelineError::Decode(format!("upload {}: invalid json_data: {}", upload.id, e))
    })?;
    let Value::Array(items) = payload else {
        return Err(PipelineError::Decode(format!(
            "upload {}: json_data is not an array",
            upload.id
        )));
    };

    // Gather the arrays under each key we care about
    let mut app_entries = Vec::new();
    let mut unlock_entries = Vec::new();
    let mut bucket_info = Vec::new();
    for item in &items {
        let Value::Object(object) = item else {
            continue;
        };
        for (key, value) in object {
            let Value::Array(values) = value else {
                continue;
            };
            match key.as_str() {
                APP_USAGE_KEY => app_entries.extend(values.iter()),
                SCREEN_UNLOCKS_KEY => unlock_entries.extend(values.iter()),
                BUCKET_INFO_KEY => bucket_info.extend(values.iter()),
                _ => {}
            }
        }
    }

    let platform = detect_platform(&bucket_info);
    let submission_id = canonical_submission_id(&upload.submission_id);
    let created_at_datetime = parse_created_at(&upload.created_at);
    let make_event = |kind: EventKind, session_datetime: Option<NaiveDateTime>| UsageEvent {
        kind,
        session_datetime,
        submission_id: submission_id.clone(),
        created_at_datetime,
        platform,
    };

    let mut decoded = DecodedUpload {
        app_usage: Vec::with_capacity(app_entries.len()),
        screen_unlocks: Vec::with_capacity(unlock_entries.len()),
        platform,
        entry_errors: 0,
    };

    for entry in app_entries {
        match decode_app_usage(entry) {
            Ok((kind, session)) => decoded.app_usage.push(make_event(kind, session)),
            Err(reason) => {
                debug!(upload_id = %upload.id, %reason, "skipping app usage entry");
                decoded.entry_errors += 1;
            }
        }
    }

    for entry in unlock_entries {
        match entry.as_object() {
            Some(fields) => decoded
                .screen_unlocks
                .push(make_event(EventKind::ScreenUnlock, entry_session_datetime(fields))),
            None => {
                debug!(upload_id = %upload.id, "skipping non-object screen unlock entry");
                decoded.entry_errors += 1;
            }
        }
    }

    Ok(decoded)
}

/// Decode every upload, isolating failures per row
pub fn decode_batch(uploads: &[UploadRecord]) -> DecodedBatch {
    let mut batch = DecodedBatch::default();

    for upload in uploads {
        batch.stats.rows += 1;
        match decode_upload(upload) {
            Ok(decoded) => {
                *batch
                    .stats
                    .rows_by_platform
                    .entry(decoded.platform.to_string())
                    .or_insert(0) += 1;
                batch.stats.entry_errors += decoded.entry_errors;
                batch.app_usage.extend(decoded.app_usage);
                batch.screen_unlocks.extend(decoded.screen_unlocks);
            }
            Err(e) => {
                debug!(error = %e, "skipping upload row");
                batch.stats.row_errors += 1;
            }
        }
    }

    batch.stats.app_usage_events = batch.app_usage.len();
    batch.stats.screen_unlock_events = batch.screen_unlocks.len();
    info!(
        rows = batch.stats.rows,
        row_errors = batch.stats.row_errors,
        entry_errors = batch.stats.entry_errors,
        app_usage = batch.stats.app_usage_events,
        screen_unlocks = batch.stats.screen_unlock_events,
        "decoded uploads"
    );
    batch
}

fn decode_app_usage(entry: &Value) -> Result<(EventKind, Option<NaiveDateTime>), String> {
    let fields = entry
        .as_object()
        .ok_or_else(|| "entry is not an object".to_string())?;
    let duration_minutes = parse_duration(fields.get(DURATION_KEY))?;
    let app_name = fields.get("App").map(value_text).unwrap_or_default();
    Ok((
        EventKind::AppUsage {
            app_name,
            duration_minutes,
        },
        entry_session_datetime(fields),
    ))
}

fn entry_session_datetime(fields: &Map<String, Value>) -> Option<NaiveDateTime> {
    let date = fields.get("Date").map(value_text).unwrap_or_default();
    let time = fields.get("Time").map(value_text).unwrap_or_default();
    compose_session_datetime(&date, &time)
}

/// Parse a duration cell; absent or blank is `None`, negative is an error
fn parse_duration(value: Option<&Value>) -> Result<Option<f64>, String> {
    let minutes = match value {
        None | Some(Value::Null) => return Ok(None),
        Some(Value::Number(n)) => n.as_f64(),
        Some(Value::String(s)) if s.trim().is_empty() => return Ok(None),
        Some(Value::String(s)) => s.trim().parse::<f64>().ok(),
        Some(other) => return Err(format!("unsupported duration value {}", other)),
    };
    match minutes {
        Some(m) if m.is_finite() && m >= 0.0 => Ok(Some(m)),
        Some(m) => Err(format!("invalid duration {}", m)),
        None => Err("duration is not numeric".to_string()),
    }
}

/// Text of a JSON scalar; strings are taken verbatim
fn value_text(value: &Value) -> String {
    match value {
        Value::String(s) => s.clone(),
        Value::Null => String::new(),
        other => other.to_string(),
    }
}

/// Combine separate date and time fields into a session datetime
///
/// `HH:MM` is padded to `HH:MM:00` before parsing. Returns `None` when either
/// part is missing or no known format matches.
pub fn compose_session_datetime(date: &str, time: &str) -> Option<NaiveDateTime> {
    let date = date.trim();
    let time = time.trim();
    if date.is_empty() || time.is_empty() {
        return None;
    }

    let time = pad_seconds(time);
    let day = SESSION_DATE_FORMATS
        .iter()
        .find_map(|fmt| NaiveDate::parse_from_str(date, fmt).ok())?;
    let clock = SESSION_TIME_FORMATS
        .iter()
        .find_map(|fmt| NaiveTime::parse_from_str(&time, fmt).ok())?;
    Some(day.and_time(clock))
}

fn pad_seconds(time: &str) -> String {
    let (clock, suffix) = match time.split_once(char::is_whitespace) {
        Some((clock, rest)) => (clock, Some(rest.trim())),
        None => (time, None),
    };
    let clock = if clock.matches(':').count() == 1 {
        format!("{}:00", clock)
    } else {
        clock.to_string()
    };
    match suffix {
        Some(suffix) => format!("{} {}", clock, suffix),
        None => clock,
    }
}

/// Parse an ingestion timestamp, keeping its wall-clock time
pub fn parse_created_at(raw: &str) -> Option<NaiveDateTime> {
    let raw = raw.trim();
    if raw.is_empty() {
        return None;
    }
    if let Ok(dt) = DateTime::parse_from_rfc3339(raw) {
        return Some(dt.naive_local());
    }
    if let Ok(dt) = DateTime::parse_from_str(raw, "%Y-%m-%d %H:%M:%S%.f%#z") {
        return Some(dt.naive_local());
    }
    for fmt in ["%Y-%m-%d %H:%M:%S%.f", "%Y-%m-%dT%H:%M:%S%.f"] {
        if let Ok(dt) = NaiveDateTime::parse_from_str(raw, fmt) {
            return Some(dt);
        }
    }
    NaiveDate::parse_from_str(raw, "%Y-%m-%d")
        .ok()
        .and_then(|d| d.and_hms_opt(0, 0, 0))
}

/// Classify the upload's platform from its bucket info entries
pub fn detect_platform(bucket_info: &[&Value]) -> Platform {
    if bucket_info.is_empty() {
        return Platform::Other;
    }
    let text = bucket_info
        .iter()
        .map(|v| v.to_string())
        .collect::<Vec<_>>()
        .join(" ")
        .to_lowercase();
    if text.contains("android") || text.contains("com.") {
        Platform::Android
    } else {
        Platform::Other
    }
}
