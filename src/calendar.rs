//! Study-calendar mapper
//!
//! Maps session timestamps onto study days relative to each participant's
//! enrollment date. Day 1 is the enrollment date itself.

use crate::error::PipelineError;
use chrono::{NaiveDate, NaiveDateTime};

/// Default study length in days
pub const DEFAULT_STUDY_DAYS: u32 = 28;

/// Enrollment date formats, tried in order
const ENROLLMENT_DATE_FORMATS: &[&str] = &["%Y-%m-%d", "%m/%d/%Y", "%d/%m/%Y"];

/// Enrollment formats carrying a time component, tried after the date-only ones
const ENROLLMENT_DATETIME_FORMATS: &[&str] = &[
    "%Y-%m-%d %H:%M:%S",
    "%m/%d/%Y %H:%M:%S",
    "%d/%m/%Y %H:%M:%S",
    "%Y-%m-%dT%H:%M:%S",
    "%Y-%m-%d %H:%M",
    "%m/%d/%Y %H:%M",
    "%d/%m/%Y %H:%M",
];

/// Parse an enrollment date, returning the first format that matches
pub fn parse_enrollment_date(raw: &str) -> Option<NaiveDate> {
    let raw = raw.trim();
    if raw.is_empty() {
        return None;
    }
    ENROLLMENT_DATE_FORMATS
        .iter()
        .find_map(|fmt| NaiveDate::parse_from_str(raw, fmt).ok())
        .or_else(|| {
            ENROLLMENT_DATETIME_FORMATS
                .iter()
                .find_map(|fmt| NaiveDateTime::parse_from_str(raw, fmt).ok())
                .map(|dt| dt.date())
        })
}

/// Strict variant of [`parse_enrollment_date`]
pub fn try_parse_enrollment_date(raw: &str) -> Result<NaiveDate, PipelineError> {
    parse_enrollment_date(raw)
        .ok_or_else(|| PipelineError::DateParse(format!("unrecognized enrollment date '{}'", raw)))
}

/// Fixed-length study calendar
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct StudyCalendar {
    study_days: u32,
}

impl Default for StudyCalendar {
    fn default() -> Self {
        Self::new(DEFAULT_STUDY_DAYS)
    }
}

impl StudyCalendar {
    pub fn new(study_days: u32) -> Self {
        Self { study_days }
    }

    pub fn study_days(&self) -> u32 {
        self.study_days
    }

    /// Study day of `session_date`, or `None` outside `1..=study_days`
    pub fn day_for_date(&self, session_date: NaiveDate, enrollment: NaiveDate) -> Option<u32> {
        let day = (session_date - enrollment).num_days() + 1;
        if day >= 1 && day <= i64::from(self.study_days) {
            u32::try_from(day).ok()
        } else {
            None
        }
    }

    /// Study day for a session, given the raw enrollment date text
    ///
    /// Returns `None` when the session time is missing, the enrollment date does
    /// not parse, or the day falls outside the study window.
    pub fn study_day(&self, session: Option<NaiveDateTime>, enrollment_date: &str) -> Option<u32> {
        let session = session?;
        let enrollment = parse_enrollment_date(enrollment_date)?;
        self.day_for_date(session.date(), enrollment)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::ErrorKind;

    fn at(date: &str) -> Option<NaiveDateTime> {
        NaiveDateTime::parse_from_str(&format!("{} 12:30:00", date), "%Y-%m-%d %H:%M:%S").ok()
    }

    #[test]
    fn test_study_day_boundaries() {
        let calendar = StudyCalendar::default();
        assert_eq!(calendar.study_day(at("2025-01-01"), "2025-01-01"), Some(1));
        assert_eq!(calendar.study_day(at("2025-01-28"), "2025-01-01"), Some(28));
        assert_eq!(calendar.study_day(at("2025-01-29"), "2025-01-01"), None);
        assert_eq!(calendar.study_day(at("2024-12-31"), "2025-01-01"), None);
    }

    #[test]
    fn test_unparseable_inputs_are_unmapped() {
        let calendar = StudyCalendar::default();
        assert_eq!(calendar.study_day(None, "2025-01-01"), None);
        assert_eq!(calendar.study_day(at("2025-01-05"), "soon"), None);
        assert_eq!(calendar.study_day(at("2025-01-05"), ""), None);
    }

    #[test]
    fn test_enrollment_format_trial_order() {
        let jan_2 = NaiveDate::from_ymd_opt(2025, 1, 2);
        assert_eq!(parse_enrollment_date("2025-01-02"), jan_2);
        // Month-first wins over day-first when both would parse
        assert_eq!(parse_enrollment_date("01/02/2025"), jan_2);
        assert_eq!(
            parse_enrollment_date("25/01/2025"),
            NaiveDate::from_ymd_opt(2025, 1, 25)
        );
        assert_eq!(parse_enrollment_date("2025-01-02 09:00:00"), jan_2);
        assert_eq!(parse_enrollment_date("01/02/2025 09:00:00"), jan_2);
        assert_eq!(parse_enrollment_date("01/02/2025 09:00"), jan_2);
        assert_eq!(parse_enrollment_date("2025-01-02 17:45"), jan_2);
        assert_eq!(parse_enrollment_date("Jan 2"), None);
    }

    #[test]
    fn test_configurable_length() {
        let calendar = StudyCalendar::new(7);
        assert_eq!(calendar.study_day(at("2025-01-07"), "2025-01-01"), Some(7));
        assert_eq!(calendar.study_day(at("2025-01-08"), "2025-01-01"), None);
    }

    #[test]
    fn test_strict_parse_reports_date_error() {
        let err = try_parse_enrollment_date("later").unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Decode);
    }
}
