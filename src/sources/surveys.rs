//! Diary and exit survey export readers
//!
//! Both surveys carry up to three self-reported device submission ids
//! (`androidSubmissionID1..3`) and the participant's `RANDOM_ID`.

use super::{is_qualtrics_metadata, non_empty, open_source};
use crate::error::PipelineError;
use serde::Deserialize;
use std::fmt;
use std::io::Read;
use std::path::Path;
use tracing::debug;

/// Which survey a row came from
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SurveyKind {
    Diary,
    Exit,
}

impl SurveyKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            SurveyKind::Diary => "diary",
            SurveyKind::Exit => "exit_survey",
        }
    }
}

impl fmt::Display for SurveyKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Deserialize)]
struct RawSurveyRow {
    #[serde(rename = "androidSubmissionID1", default)]
    submission_id_1: Option<String>,
    #[serde(rename = "androidSubmissionID2", default)]
    submission_id_2: Option<String>,
    #[serde(rename = "androidSubmissionID3", default)]
    submission_id_3: Option<String>,
    #[serde(rename = "RANDOM_ID", default)]
    random_id: Option<String>,
}

/// One survey response reduced to its identity fields
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SurveyRow {
    /// Non-empty, trimmed submission ids in column order
    pub submission_ids: Vec<String>,
    pub random_id: Option<String>,
}

impl SurveyRow {
    /// Build a row from raw cells, trimming and dropping empties
    pub fn new<I, S>(submission_ids: I, random_id: Option<&str>) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            submission_ids: submission_ids
                .into_iter()
                .filter_map(|s| non_empty(Some(s.into())))
                .collect(),
            random_id: non_empty(random_id.map(str::to_string)),
        }
    }

    fn is_metadata(raw: &RawSurveyRow) -> bool {
        let cells = [
            &raw.submission_id_1,
            &raw.submission_id_2,
            &raw.submission_id_3,
            &raw.random_id,
        ];
        cells
            .iter()
            .filter_map(|c| c.as_deref())
            .any(is_qualtrics_metadata)
            || raw.random_id.as_deref().map(str::trim) == Some("RANDOM_ID")
    }
}

/// Reader for survey exports
pub struct SurveyReader;

impl SurveyReader {
    pub fn from_path(path: &Path, kind: SurveyKind) -> Result<Vec<SurveyRow>, PipelineError> {
        let file = open_source(path, kind.as_str())?;
        Self::from_reader(file, kind)
    }

    pub fn from_reader<R: Read>(reader: R, kind: SurveyKind) -> Result<Vec<SurveyRow>, PipelineError> {
        let mut csv_reader = csv::ReaderBuilder::new()
            .has_headers(true)
            .flexible(true)
            .from_reader(reader);

        let mut rows = Vec::new();
        let mut skipped = 0usize;
        for result in csv_reader.deserialize::<RawSurveyRow>() {
            let raw = match result {
                Ok(raw) => raw,
                Err(e) => {
                    debug!(survey = %kind, error = %e, "skipping unreadable survey row");
                    skipped += 1;
                    continue;
                }
            };
            if SurveyRow::is_metadata(&raw) {
                continue;
            }
            rows.push(SurveyRow {
                submission_ids: [raw.submission_id_1, raw.submission_id_2, raw.submission_id_3]
                    .into_iter()
                    .filter_map(non_empty)
                    .collect(),
                random_id: non_empty(raw.random_id),
            });
        }
        if skipped > 0 {
            debug!(survey = %kind, skipped, "survey rows skipped");
        }
        Ok(rows)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    #[test]
    fn test_reads_identity_columns() {
        let csv = "ResponseId,androidSubmissionID1,androidSubmissionID2,androidSubmissionID3,RANDOM_ID\n\
            R_1, 42 ,,43,P001\n\
            R_2,,,,P002\n";
        let rows = SurveyReader::from_reader(csv.as_bytes(), SurveyKind::Diary).unwrap();

        assert_eq!(
            rows,
            vec![
                SurveyRow::new(["42", "43"], Some("P001")),
                SurveyRow::new(Vec::<String>::new(), Some("P002")),
            ]
        );
    }

    #[test]
    fn test_skips_qualtrics_metadata_rows() {
        let csv = "androidSubmissionID1,RANDOM_ID\n\
            androidSubmissionID1,RANDOM_ID\n\
            \"{\"\"ImportId\"\":\"\"QID1_TEXT\"\"}\",\"{\"\"ImportId\"\":\"\"RANDOM_ID\"\"}\"\n\
            42,P001\n";
        let rows = SurveyReader::from_reader(csv.as_bytes(), SurveyKind::Exit).unwrap();

        assert_eq!(rows, vec![SurveyRow::new(["42"], Some("P001"))]);
    }

    #[test]
    fn test_missing_columns_are_none() {
        let csv = "RANDOM_ID\nP001\n";
        let rows = SurveyReader::from_reader(csv.as_bytes(), SurveyKind::Diary).unwrap();

        assert_eq!(rows.len(), 1);
        assert!(rows[0].submission_ids.is_empty());
        assert_eq!(rows[0].random_id.as_deref(), Some("P001"));
    }
}
