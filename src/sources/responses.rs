//! Qualtrics response start dates
//!
//! Survey exports put the response id and `StartDate` on each data row. The
//! two rows directly under the header hold question text and import metadata.

use super::open_source;
use crate::error::PipelineError;
use crate::store::KeyValueStore;
use chrono::NaiveDate;
use serde::Serialize;
use std::path::Path;
use tracing::{debug, info, warn};

/// Response id to survey start date
pub type ResponseStartDates = KeyValueStore<NaiveDate>;

const METADATA_ROWS: usize = 2;

/// What a start date load kept and dropped
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct ResponseLoad {
    pub loaded: usize,
    /// Rows the CSV reader could not decode
    pub unreadable_rows: usize,
}

/// Load start dates for `R_` response ids into `store`
pub fn load_response_start_dates(
    path: &Path,
    store: &mut ResponseStartDates,
) -> Result<ResponseLoad, PipelineError> {
    let file = open_source(path, "qualtrics_responses")?;
    let mut csv_reader = csv::ReaderBuilder::new()
        .has_headers(true)
        .flexible(true)
        .from_reader(file);

    let headers = csv_reader.headers()?.clone();
    let column = |names: &[&str]| headers.iter().position(|h| names.contains(&h.trim()));
    let (Some(id_col), Some(date_col)) = (column(&["ResponseID", "ResponseId"]), column(&["StartDate"]))
    else {
        return Err(PipelineError::unavailable(
            "qualtrics_responses",
            format!("{}: missing ResponseID or StartDate column", path.display()),
        ));
    };

    let mut loaded = Vec::new();
    let mut unreadable_rows = 0;
    for record in csv_reader.records().skip(METADATA_ROWS) {
        let record = match record {
            Ok(record) => record,
            Err(e) => {
                debug!(error = %e, "skipping unreadable response row");
                unreadable_rows += 1;
                continue;
            }
        };
        let response_id = record.get(id_col).unwrap_or("").trim();
        let start_date = record.get(date_col).unwrap_or("").trim();
        if !response_id.starts_with("R_") || start_date.is_empty() {
            continue;
        }
        let day = start_date.split_whitespace().next().unwrap_or("");
        match NaiveDate::parse_from_str(day, "%Y-%m-%d") {
            Ok(date) => loaded.push((response_id.to_string(), date)),
            Err(e) => warn!(response_id, start_date, error = %e, "could not parse StartDate"),
        }
    }

    let count = loaded.len();
    store.insert_many(loaded)?;
    if unreadable_rows > 0 {
        warn!(unreadable_rows, path = %path.display(), "skipped unreadable response rows");
    }
    info!(count, path = %path.display(), "loaded response start dates");
    Ok(ResponseLoad {
        loaded: count,
        unreadable_rows,
    })
}
