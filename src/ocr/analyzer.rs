//! Screenshot analysis against a vision model
//!
//! The model is a black box that turns an image into JSON text. The analyzer
//! owns everything around it: retrying rate limits, parsing, the year policy,
//! validation and the on-disk artifact cache.

use super::dates::DateNormalizer;
use super::response::parse_model_json;
use super::types::{AnalysisMetadata, ModelResponse, ScreenshotAnalysis};
use super::validate::validate_response;
use crate::error::PipelineError;
use crate::fetch::ExternalCommand;
use crate::retry::RetryPolicy;
use chrono::{SecondsFormat, Utc};
use std::fs;
use std::path::{Path, PathBuf};
use tracing::{debug, info, warn};

/// Suffix of the per-image artifact file
pub const ARTIFACT_SUFFIX: &str = "_analysis.json";

/// Vision-language model boundary
pub trait VisionModel: Send + Sync {
    /// Name recorded in `_metadata.model_used`
    fn model_name(&self) -> &str;

    /// Raw model output for one image
    fn analyze(&self, image: &Path) -> Result<String, PipelineError>;
}

/// Vision model backed by an external program
///
/// The image path is appended to the configured arguments and the program's
/// stdout is taken as the model response.
#[derive(Debug, Clone)]
pub struct CommandVisionModel {
    command: ExternalCommand,
    model_name: String,
}

impl CommandVisionModel {
    pub fn new(command: ExternalCommand, model_name: impl Into<String>) -> Self {
        Self {
            command,
            model_name: model_name.into(),
        }
    }
}

impl VisionModel for CommandVisionModel {
    fn model_name(&self) -> &str {
        &self.model_name
    }

    fn analyze(&self, image: &Path) -> Result<String, PipelineError> {
        let output = self.command.run("vision-model", [image.as_os_str()])?;
        Ok(output.stdout)
    }
}

/// Result of processing one image
#[derive(Debug, Clone, PartialEq)]
pub struct ImageOutcome {
    pub analysis: ScreenshotAnalysis,
    /// Loaded from an existing artifact instead of re-analyzed
    pub skipped: bool,
}

/// Where artifacts are written
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub enum ArtifactLayout {
    /// Next to each image
    #[default]
    Alongside,
    /// Under `output_dir`, mirroring each image's directory below `input_root`
    Mirrored { input_root: PathBuf, output_dir: PathBuf },
}

impl ArtifactLayout {
    pub fn new(input_root: &Path, output_dir: Option<&Path>) -> Self {
        match output_dir {
            Some(dir) => ArtifactLayout::Mirrored {
                input_root: input_root.to_path_buf(),
                output_dir: dir.to_path_buf(),
            },
            None => ArtifactLayout::Alongside,
        }
    }

    /// Location of the `<stem>_analysis.json` artifact for `image`
    ///
    /// A mirrored layout rejects images outside its input root.
    pub fn artifact_path(&self, image: &Path) -> Result<PathBuf, PipelineError> {
        let stem = image.file_stem().map(|s| s.to_string_lossy().into_owned()).unwrap_or_default();
        let file_name = format!("{}{}", stem, ARTIFACT_SUFFIX);
        let parent = image.parent().unwrap_or_else(|| Path::new(""));
        match self {
            ArtifactLayout::Alongside => Ok(parent.join(file_name)),
            ArtifactLayout::Mirrored { input_root, output_dir } => {
                let relative = parent.strip_prefix(input_root).map_err(|_| {
                    PipelineError::Config(format!(
                        "{} is outside the image directory {}",
                        image.display(),
                        input_root.display()
                    ))
                })?;
                Ok(output_dir.join(relative).join(file_name))
            }
        }
    }
}

/// Turns screenshots into validated [`ScreenshotAnalysis`] records
pub struct ScreenshotAnalyzer<M> {
    model: M,
    normalizer: DateNormalizer,
    retry: RetryPolicy,
}

impl<M: VisionModel> ScreenshotAnalyzer<M> {
    pub fn new(model: M, normalizer: DateNormalizer, retry: RetryPolicy) -> Self {
        Self {
            model,
            normalizer,
            retry,
        }
    }

    pub fn model(&self) -> &M {
        &self.model
    }

    /// Analyze one image without touching the artifact cache
    pub fn analyze(&self, image: &Path) -> Result<ScreenshotAnalysis, PipelineError> {
        let image_name = image
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_else(|| image.display().to_string());

        // step 1: model call, retried on rate limits
        let raw = self.retry.run(&image_name, |attempt| {
            if attempt > 0 {
                debug!(image = %image_name, attempt, "retrying vision model");
            }
            self.model.analyze(image)
        })?;

        // step 2: parse
        let mut response: ModelResponse = parse_model_json(&raw, &image_name)?;

        // step 3: year policy
        let normalized = self.normalizer.apply(&mut response.date_of_screenshot, &image_name);

        // step 4: validate
        let warnings = validate_response(&response, &image_name)?;

        Ok(ScreenshotAnalysis {
            response,
            metadata: AnalysisMetadata {
                source_image: image.display().to_string(),
                analysis_timestamp: Utc::now().to_rfc3339_opts(SecondsFormat::Secs, true),
                model_used: self.model.model_name().to_string(),
                analysis_warnings: warnings,
                date_normalized_to_reference_year: normalized,
            },
        })
    }

    /// Analyze `image` and persist it to `artifact`, reusing an existing
    /// artifact unless `force` is set
    pub fn process_image(&self, image: &Path, artifact: &Path, force: bool) -> Result<ImageOutcome, PipelineError> {
        if !force && artifact.exists() {
            match load_artifact(artifact) {
                Ok(analysis) => {
                    debug!(image = %image.display(), "skipping, already analyzed");
                    return Ok(ImageOutcome {
                        analysis,
                        skipped: true,
                    });
                }
                Err(e) => {
                    warn!(artifact = %artifact.display(), error = %e, "existing analysis unreadable, reprocessing");
                }
            }
        }

        let analysis = self.analyze(image)?;
        if let Some(parent) = artifact.parent() {
            if !parent.as_os_str().is_empty() {
                fs::create_dir_all(parent)?;
            }
        }
        fs::write(artifact, serde_json::to_string_pretty(&analysis)?)?;
        info!(
            image = %image.display(),
            device = %analysis.response.device_type,
            apps = analysis.response.apps.len(),
            warnings = analysis.metadata.analysis_warnings.len(),
            "analyzed screenshot"
        );
        Ok(ImageOutcome {
            analysis,
            skipped: false,
        })
    }
}

/// Read a persisted artifact
pub fn load_artifact(path: &Path) -> Result<ScreenshotAnalysis, PipelineError> {
    let raw = fs::read_to_string(path)?;
    Ok(serde_json::from_str(&raw)?)
}
