//! Pipeline configuration
//!
//! Loaded from a TOML file. Every section and field has a default, so an empty
//! file (or no file at all) yields a working configuration. CLI flags override
//! individual values after loading.

use crate::error::PipelineError;
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};

/// Top-level configuration
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct StudyConfig {
    pub paths: PathsConfig,
    pub calendar: CalendarConfig,
    pub ocr: OcrConfig,
    pub retry: RetryConfig,
    pub fetch: FetchConfig,
}

/// Input exports and output locations
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct PathsConfig {
    pub uploads: PathBuf,
    pub diary: PathBuf,
    pub exit_survey: PathBuf,
    pub contacts: PathBuf,
    pub output_dir: PathBuf,
    /// Root of the screenshot tree (`<participant>/<response>/<image>`)
    pub image_dir: PathBuf,
    /// Survey export used to look up response start dates
    pub qualtrics_responses: Option<PathBuf>,
}

impl Default for PathsConfig {
    fn default() -> Self {
        Self {
            uploads: PathBuf::from(".tmp/uploads.csv"),
            diary: PathBuf::from(".tmp/diary_responses_lifetime.csv"),
            exit_survey: PathBuf::from(".tmp/exit_responses_lifetime.csv"),
            contacts: PathBuf::from(".tmp/contact_list.csv"),
            output_dir: PathBuf::from(".tmp"),
            image_dir: PathBuf::from("downloads/diary_images/ios"),
            qualtrics_responses: None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct CalendarConfig {
    pub study_days: u32,
}

impl Default for CalendarConfig {
    fn default() -> Self {
        Self {
            study_days: crate::calendar::DEFAULT_STUDY_DAYS,
        }
    }
}

/// Screenshot structuring settings
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct OcrConfig {
    pub reference_year: i32,
    /// Rewrite screenshot dates to `reference_year`
    pub normalize_year: bool,
    pub concurrency: usize,
    /// Program invoked with the image path appended; prints the model response
    pub model_command: Option<String>,
    pub model_args: Vec<String>,
    pub model_name: String,
    pub timeout_secs: u64,
    pub reprocess_existing: bool,
    pub classifier_command: Option<String>,
    pub classifier_args: Vec<String>,
    pub classifier_cache: PathBuf,
    pub classifier_batch_size: usize,
}

impl Default for OcrConfig {
    fn default() -> Self {
        Self {
            reference_year: 2025,
            normalize_year: true,
            concurrency: 4,
            model_command: None,
            model_args: Vec::new(),
            model_name: "gemini-2.0-flash".to_string(),
            timeout_secs: 300,
            reprocess_existing: false,
            classifier_command: None,
            classifier_args: Vec::new(),
            classifier_cache: PathBuf::from("app_game_cache.json"),
            classifier_batch_size: 20,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RetryConfig {
    pub max_retries: u32,
    pub base_delay_ms: u64,
    pub max_delay_ms: u64,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_retries: 5,
            base_delay_ms: 1_000,
            max_delay_ms: 60_000,
        }
    }
}

/// External command that refreshes one source file
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CommandSpec {
    pub command: String,
    #[serde(default)]
    pub args: Vec<String>,
    #[serde(default = "default_fetch_timeout")]
    pub timeout_secs: u64,
}

fn default_fetch_timeout() -> u64 {
    30 * 60
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct FetchConfig {
    /// A source file modified within this many minutes is reused as-is
    pub reuse_recent_minutes: u64,
    pub uploads: Option<CommandSpec>,
    pub diary: Option<CommandSpec>,
    pub exit_survey: Option<CommandSpec>,
    pub contacts: Option<CommandSpec>,
}

impl Default for FetchConfig {
    fn default() -> Self {
        Self {
            reuse_recent_minutes: 10,
            uploads: None,
            diary: None,
            exit_survey: None,
            contacts: None,
        }
    }
}

impl StudyConfig {
    /// Parse and validate a TOML document
    pub fn from_toml_str(raw: &str) -> Result<Self, PipelineError> {
        let config: StudyConfig =
            toml::from_str(raw).map_err(|e| PipelineError::Config(e.to_string()))?;
        config.validate()?;
        Ok(config)
    }

    /// Load from a file
    pub fn load(path: &Path) -> Result<Self, PipelineError> {
        let raw = fs::read_to_string(path)
            .map_err(|e| PipelineError::Config(format!("{}: {}", path.display(), e)))?;
        Self::from_toml_str(&raw)
    }

    /// Load from a file when given, otherwise use defaults
    pub fn load_or_default(path: Option<&Path>) -> Result<Self, PipelineError> {
        match path {
            Some(path) => Self::load(path),
            None => Ok(Self::default()),
        }
    }

    pub fn validate(&self) -> Result<(), PipelineError> {
        if self.calendar.study_days == 0 {
            return Err(PipelineError::Config("calendar.study_days must be at least 1".into()));
        }
        if self.ocr.concurrency == 0 {
            return Err(PipelineError::Config("ocr.concurrency must be at least 1".into()));
        }
        if self.ocr.classifier_batch_size == 0 {
            return Err(PipelineError::Config(
                "ocr.classifier_batch_size must be at least 1".into(),
            ));
        }
        if !(2000..=2099).contains(&self.ocr.reference_year) {
            return Err(PipelineError::Config(format!(
                "ocr.reference_year {} is outside 2000..=2099",
                self.ocr.reference_year
            )));
        }
        if self.retry.base_delay_ms > self.retry.max_delay_ms {
            return Err(PipelineError::Config(
                "retry.base_delay_ms exceeds retry.max_delay_ms".into(),
            ));
        }
        Ok(())
    }

    /// Render the effective configuration as TOML
    pub fn to_toml_string(&self) -> Result<String, PipelineError> {
        toml::to_string_pretty(self).map_err(|e| PipelineError::Config(e.to_string()))
    }
}
