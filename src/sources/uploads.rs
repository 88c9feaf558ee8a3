//! Raw device-upload export reader
//!
//! The uploads export has positional columns
//! `[id, created_at, json_data, submission_id, platform]` after a header row.

use super::open_source;
use crate::error::PipelineError;
use crate::types::UploadRecord;
use csv::{ReaderBuilder, StringRecord};
use std::io::Read;
use std::path::Path;
use tracing::debug;

const UPLOAD_COLUMNS: usize = 5;

/// Upload rows plus the count of rows that could not be read
#[derive(Debug, Default)]
pub struct UploadTable {
    pub records: Vec<UploadRecord>,
    pub malformed_rows: usize,
}

/// Reader for the raw uploads CSV
pub struct UploadReader;

impl UploadReader {
    pub fn from_path(path: &Path) -> Result<UploadTable, PipelineError> {
        let file = open_source(path, "uploads")?;
        Self::from_reader(file)
    }

    /// Read upload rows; short or unreadable rows are counted and skipped
    pub fn from_reader<R: Read>(reader: R) -> Result<UploadTable, PipelineError> {
        let mut csv_reader = ReaderBuilder::new()
            .has_headers(true)
            .flexible(true)
            .from_reader(reader);

        let mut table = UploadTable::default();
        for (index, row) in csv_reader.records().enumerate() {
            // Header is line 1
            let line = index + 2;
            match row {
                Ok(record) => match Self::parse_row(&record) {
                    Some(upload) => table.records.push(upload),
                    None => {
                        debug!(line, fields = record.len(), "upload row has too few columns");
                        table.malformed_rows += 1;
                    }
                },
                Err(e) => {
                    debug!(line, error = %e, "unreadable upload row");
                    table.malformed_rows += 1;
                }
            }
        }
        Ok(table)
    }

    fn parse_row(record: &StringRecord) -> Option<UploadRecord> {
        if record.len() < UPLOAD_COLUMNS {
            return None;
        }
        Some(UploadRecord {
            id: record.get(0)?.to_string(),
            created_at: record.get(1)?.to_string(),
            json_data: record.get(2)?.to_string(),
            submission_id: record.get(3)?.to_string(),
            source_platform: record.get(4)?.to_string(),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_reads_positional_columns() {
        let csv = "id,created_at,json_data,submission_id,platform\n\
            1,2025-03-02 08:00:00+00,\"[{\"\"AppUsage\"\": []}]\",42,ActivityWatch\n";
        let table = UploadReader::from_reader(csv.as_bytes()).unwrap();

        assert_eq!(table.records.len(), 1);
        assert_eq!(table.malformed_rows, 0);
        let upload = &table.records[0];
        assert_eq!(upload.submission_id, "42");
        assert_eq!(upload.json_data, "[{\"AppUsage\": []}]");
        assert_eq!(upload.source_platform, "ActivityWatch");
    }

    #[test]
    fn test_short_row_is_counted_not_fatal() {
        let csv = "id,created_at,json_data,submission_id,platform\n\
            1,2025-03-02,[],42,ActivityWatch\n\
            2,2025-03-02\n\
            3,2025-03-03,[],43,ActivityWatch\n";
        let table = UploadReader::from_reader(csv.as_bytes()).unwrap();

        assert_eq!(table.records.len(), 2);
        assert_eq!(table.malformed_rows, 1);
    }

    #[test]
    fn test_missing_file_is_unavailable() {
        let err = UploadReader::from_path(Path::new("/nonexistent/uploads.csv")).unwrap_err();
        assert_eq!(err.kind(), crate::error::ErrorKind::ExternalUnavailable);
    }
}
