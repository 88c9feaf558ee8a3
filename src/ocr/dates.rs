//! Screenshot date year policy
//!
//! Some devices report screen-time dates with a wrong or missing year. When
//! enabled, the policy rewrites every screenshot date to the reference year.
//! Each rewrite is flagged in the artifact metadata and logged, since it would
//! corrupt correctly dated screenshots from other years.

use crate::error::PipelineError;
use chrono::NaiveDate;
use regex::{Captures, Regex};
use tracing::warn;

/// Whether and to which year screenshot dates are normalized
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct YearPolicy {
    pub reference_year: i32,
    pub enabled: bool,
}

impl Default for YearPolicy {
    fn default() -> Self {
        Self {
            reference_year: 2025,
            enabled: true,
        }
    }
}

const MONTHS: &str = "January|February|March|April|May|June|July|August|September|October|November|December|Sept|Jan|Feb|Mar|Apr|Jun|Jul|Aug|Sep|Oct|Nov|Dec";

/// Applies a [`YearPolicy`] to free-form screenshot dates
#[derive(Debug, Clone)]
pub struct DateNormalizer {
    policy: YearPolicy,
    explicit_year: Regex,
    month_day: Regex,
    day_month: Regex,
    numeric_month_day: Regex,
}

fn compile(pattern: &str) -> Result<Regex, PipelineError> {
    Regex::new(pattern).map_err(|e| PipelineError::Config(format!("invalid date pattern: {}", e)))
}

fn month_number(name: &str) -> Option<u32> {
    let prefix: String = name.chars().take(3).collect::<String>().to_lowercase();
    let month = match prefix.as_str() {
        "jan" => 1,
        "feb" => 2,
        "mar" => 3,
        "apr" => 4,
        "may" => 5,
        "jun" => 6,
        "jul" => 7,
        "aug" => 8,
        "sep" => 9,
        "oct" => 10,
        "nov" => 11,
        "dec" => 12,
        _ => return None,
    };
    Some(month)
}

/// `YYYY-MM-DD` for a real calendar day, `None` for "13/45" and the like
fn calendar_date(year: i32, month: u32, day: u32) -> Option<String> {
    NaiveDate::from_ymd_opt(year, month, day).map(|d| d.format("%Y-%m-%d").to_string())
}

impl DateNormalizer {
    pub fn new(policy: YearPolicy) -> Result<Self, PipelineError> {
        Ok(Self {
            policy,
            explicit_year: compile(r"\b20\d{2}\b")?,
            month_day: compile(&format!(r"(?i)\b({})\s+(\d{{1,2}})\b", MONTHS))?,
            day_month: compile(&format!(r"(?i)\b(\d{{1,2}})\s+({})\b", MONTHS))?,
            numeric_month_day: compile(r"\b(\d{1,2})[/-](\d{1,2})\b")?,
        })
    }

    pub fn policy(&self) -> YearPolicy {
        self.policy
    }

    /// Normalized form of `date`, or `None` when it is left unchanged
    pub fn normalize(&self, date: &str) -> Option<String> {
        let date = date.trim();
        if !self.policy.enabled || date.is_empty() || date.eq_ignore_ascii_case(super::types::UNKNOWN) {
            return None;
        }
        let reference_year = self.policy.reference_year;
        let year = reference_year.to_string();
        if date.contains(&year) {
            return None;
        }

        // A different explicit year is swapped out
        if self.explicit_year.is_match(date) {
            return Some(self.explicit_year.replace_all(date, year.as_str()).into_owned());
        }

        // "July 15" then "15 July"
        let with_year = |month: &str, day: &str| -> Option<String> {
            let month = month_number(month)?;
            let day: u32 = day.parse().ok()?;
            calendar_date(reference_year, month, day)
        };
        for (re, month_group, day_group) in [(&self.month_day, 1, 2), (&self.day_month, 2, 1)] {
            if let Some(caps) = re.captures(date) {
                let whole = caps.get(0)?;
                let replacement = with_year(group(&caps, month_group), group(&caps, day_group))?;
                let mut rewritten = String::with_capacity(date.len() + 4);
                rewritten.push_str(&date[..whole.start()]);
                rewritten.push_str(&replacement);
                rewritten.push_str(&date[whole.end()..]);
                return Some(rewritten);
            }
        }

        // MM-DD or MM/DD
        let caps = self.numeric_month_day.captures(date)?;
        let month: u32 = group(&caps, 1).parse().ok()?;
        let day: u32 = group(&caps, 2).parse().ok()?;
        calendar_date(reference_year, month, day)
    }

    /// Apply the policy in place, returning whether the date changed
    pub fn apply(&self, date: &mut String, source: &str) -> bool {
        match self.normalize(date) {
            Some(normalized) => {
                warn!(
                    source,
                    original = %date,
                    normalized = %normalized,
                    reference_year = self.policy.reference_year,
                    "screenshot date rewritten to reference year"
                );
                *date = normalized;
                true
            }
            None => false,
        }
    }
}

fn group<'t>(caps: &Captures<'t>, index: usize) -> &'t str {
    caps.get(index).map(|m| m.as_str()).unwrap_or("")
}
