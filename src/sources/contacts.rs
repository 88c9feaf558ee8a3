//! Contact-list export reader

use super::{is_qualtrics_metadata, non_empty, open_source};
use crate::calendar::try_parse_enrollment_date;
use crate::error::PipelineError;
use crate::types::ParticipantContext;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::io::Read;
use std::path::Path;
use tracing::debug;

#[derive(Debug, Deserialize)]
struct RawContactRow {
    #[serde(rename = "RANDOM_ID", default)]
    random_id: Option<String>,
    #[serde(rename = "Condition", default)]
    condition: Option<String>,
    #[serde(rename = "Platforms", default)]
    platforms: Option<String>,
    #[serde(rename = "phoneType", default)]
    phone_type: Option<String>,
    #[serde(rename = "EnrollmentDate", default)]
    enrollment_date: Option<String>,
}

/// Enrollment-date coverage of the contact list
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct ContactStats {
    pub participants: usize,
    pub with_enrollment_date: usize,
    /// RANDOM_IDs whose enrollment date matches no known format
    pub unrecognized_enrollment_dates: Vec<String>,
}

/// Participant context keyed by RANDOM_ID
#[derive(Debug, Clone, Default)]
pub struct ContactBook {
    by_id: HashMap<String, ParticipantContext>,
}

impl ContactBook {
    pub fn new() -> Self {
        Self::default()
    }

    /// Add or replace the context for a participant
    pub fn insert(&mut self, random_id: &str, context: ParticipantContext) {
        self.by_id.insert(random_id.trim().to_string(), context);
    }

    pub fn get(&self, random_id: &str) -> Option<&ParticipantContext> {
        self.by_id.get(random_id.trim())
    }

    /// Context for a participant; all fields empty when not listed
    pub fn context_for(&self, random_id: &str) -> ParticipantContext {
        self.get(random_id).cloned().unwrap_or_default()
    }

    pub fn len(&self) -> usize {
        self.by_id.len()
    }

    pub fn is_empty(&self) -> bool {
        self.by_id.is_empty()
    }

    /// Number of participants with a non-empty enrollment date
    pub fn with_enrollment_date(&self) -> usize {
        self.by_id
            .values()
            .filter(|c| c.enrollment_date.is_some())
            .count()
    }

    /// Participants whose enrollment date is present but unrecognized, by
    /// RANDOM_ID
    pub fn invalid_enrollment_dates(&self) -> Vec<(&str, PipelineError)> {
        let mut invalid: Vec<(&str, PipelineError)> = self
            .by_id
            .iter()
            .filter_map(|(random_id, context)| {
                let raw = context.enrollment_date.as_deref()?;
                try_parse_enrollment_date(raw).err().map(|e| (random_id.as_str(), e))
            })
            .collect();
        invalid.sort_by(|a, b| a.0.cmp(b.0));
        invalid
    }

    pub fn stats(&self) -> ContactStats {
        ContactStats {
            participants: self.len(),
            with_enrollment_date: self.with_enrollment_date(),
            unrecognized_enrollment_dates: self
                .invalid_enrollment_dates()
                .into_iter()
                .map(|(random_id, _)| random_id.to_string())
                .collect(),
        }
    }
}

/// Reader for the contact-list CSV
pub struct ContactReader;

impl ContactReader {
    pub fn from_path(path: &Path) -> Result<ContactBook, PipelineError> {
        let file = open_source(path, "contacts")?;
        Self::from_reader(file)
    }

    /// Read contacts; a later row for the same RANDOM_ID replaces an earlier one
    pub fn from_reader<R: Read>(reader: R) -> Result<ContactBook, PipelineError> {
        let mut csv_reader = csv::ReaderBuilder::new()
            .has_headers(true)
            .flexible(true)
            .from_reader(reader);

        let mut book = ContactBook::new();
        for result in csv_reader.deserialize::<RawContactRow>() {
            let raw = match result {
                Ok(raw) => raw,
                Err(e) => {
                    debug!(error = %e, "skipping unreadable contact row");
                    continue;
                }
            };
            let Some(random_id) = non_empty(raw.random_id) else {
                continue;
            };
            if is_qualtrics_metadata(&random_id) {
                continue;
            }
            book.insert(
                &random_id,
                ParticipantContext {
                    condition: non_empty(raw.condition),
                    platforms: non_empty(raw.platforms),
                    phone_type: non_empty(raw.phone_type),
                    enrollment_date: non_empty(raw.enrollment_date),
                },
            );
        }
        Ok(book)
    }
}
