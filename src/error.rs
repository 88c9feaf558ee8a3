//! Error types for Study Link

use thiserror::Error;

/// Errors that can occur while linking and reporting study data
#[derive(Debug, Error)]
pub enum PipelineError {
    #[error("Failed to decode upload data: {0}")]
    Decode(String),

    #[error("Screenshot analysis failed: {0}")]
    AnalysisFailure(String),

    #[error("No participant mapping for submission id: {0}")]
    JoinMiss(String),

    #[error("Rate limited by {source_name} after {attempts} attempt(s)")]
    RateLimited { source_name: String, attempts: u32 },

    #[error("External source '{source_name}' unavailable: {reason}")]
    ExternalUnavailable { source_name: String, reason: String },

    #[error("'{source_name}' timed out after {seconds}s")]
    Timeout { source_name: String, seconds: u64 },

    #[error("Date parse error: {0}")]
    DateParse(String),

    #[error("Invalid configuration: {0}")]
    Config(String),

    #[error("CSV error: {0}")]
    Csv(#[from] csv::Error),

    #[error("Invalid JSON: {0}")]
    Json(#[from] serde_json::Error),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

/// Coarse classification the orchestrator uses to decide continue-vs-abort
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    /// A single row or entry could not be decoded; skip it
    Decode,
    /// A screenshot analysis must be treated as failed
    AnalysisFailure,
    /// A record could not be attributed to a participant
    JoinMiss,
    /// Transient rate limiting; retryable
    RateLimited,
    /// A source, file, or external command is unavailable
    ExternalUnavailable,
    /// Invalid configuration or usage
    Config,
}

impl PipelineError {
    /// Classify this error for stage-level handling
    pub fn kind(&self) -> ErrorKind {
        match self {
            PipelineError::Decode(_) | PipelineError::DateParse(_) | PipelineError::Json(_) => {
                ErrorKind::Decode
            }
            PipelineError::AnalysisFailure(_) => ErrorKind::AnalysisFailure,
            PipelineError::JoinMiss(_) => ErrorKind::JoinMiss,
            PipelineError::RateLimited { .. } => ErrorKind::RateLimited,
            PipelineError::ExternalUnavailable { .. }
            | PipelineError::Timeout { .. }
            | PipelineError::Csv(_)
            | PipelineError::Io(_) => ErrorKind::ExternalUnavailable,
            PipelineError::Config(_) => ErrorKind::Config,
        }
    }

    /// Whether a retry may succeed
    pub fn is_retryable(&self) -> bool {
        self.kind() == ErrorKind::RateLimited
    }

    pub(crate) fn unavailable(source_name: &str, reason: impl Into<String>) -> Self {
        PipelineError::ExternalUnavailable {
            source_name: source_name.to_string(),
            reason: reason.into(),
        }
    }
}
