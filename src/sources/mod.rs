//! Raw extractors
//!
//! Typed readers for the tabular exports the pipeline consumes. Each reader
//! turns one CSV file into typed rows; absent columns become `None` rather than
//! silent misses.

mod contacts;
mod responses;
mod surveys;
mod uploads;

pub use contacts::{ContactBook, ContactReader, ContactStats};
pub use responses::{load_response_start_dates, ResponseLoad, ResponseStartDates};
pub use surveys::{SurveyKind, SurveyReader, SurveyRow};
pub use uploads::{UploadReader, UploadTable};

use crate::error::PipelineError;
use std::fs::File;
use std::path::Path;

/// Open a source file, mapping a missing file to an unavailable-source error
pub(crate) fn open_source(path: &Path, source_name: &str) -> Result<File, PipelineError> {
    File::open(path).map_err(|e| {
        PipelineError::unavailable(source_name, format!("{}: {}", path.display(), e))
    })
}

/// Trim a cell and drop it when empty
pub(crate) fn non_empty(value: Option<String>) -> Option<String> {
    value
        .map(|v| v.trim().to_string())
        .filter(|v| !v.is_empty())
}

/// Qualtrics exports carry metadata rows under the header
pub(crate) fn is_qualtrics_metadata(value: &str) -> bool {
    value.trim_start().starts_with("{\"ImportId\"")
}
