//! Bounded parallel screenshot processing

use super::analyzer::{ArtifactLayout, ImageOutcome, ScreenshotAnalyzer, VisionModel, ARTIFACT_SUFFIX};
use crate::error::PipelineError;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Mutex;
use std::thread;
use tracing::{error, info, warn};
use uuid::Uuid;

/// File written into the output directory after a batch
pub const SUMMARY_FILE: &str = "processing_summary.json";

const IMAGE_EXTENSIONS: [&str; 6] = ["png", "jpg", "jpeg", "bmp", "gif", "tiff"];

/// Whether `path` has a screenshot image extension (any case)
pub fn is_image(path: &Path) -> bool {
    path.extension()
        .and_then(|e| e.to_str())
        .map(|e| IMAGE_EXTENSIONS.iter().any(|known| e.eq_ignore_ascii_case(known)))
        .unwrap_or(false)
}

/// All images under `root`, recursively, sorted by path
pub fn discover_images(root: &Path) -> Result<Vec<PathBuf>, PipelineError> {
    let mut found = Vec::new();
    let mut pending = vec![root.to_path_buf()];
    while let Some(dir) = pending.pop() {
        for entry in fs::read_dir(&dir)? {
            let path = entry?.path();
            if path.is_dir() {
                pending.push(path);
            } else if is_image(&path) {
                found.push(path);
            }
        }
    }
    found.sort();
    Ok(found)
}

/// Image that could not be analyzed
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ImageFailure {
    pub image: String,
    pub error: String,
}

/// Counts for one batch run
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ProcessingSummary {
    pub run_id: Uuid,
    pub total_found: usize,
    pub processed: usize,
    pub skipped: usize,
    pub successful: usize,
    pub failed: usize,
    /// Successful analyses carrying at least one warning
    pub warnings: usize,
    pub failures: Vec<ImageFailure>,
}

/// Outcomes of a batch, in path order
#[derive(Debug)]
pub struct BatchResult {
    pub outcomes: Vec<(PathBuf, Result<ImageOutcome, PipelineError>)>,
    pub summary: ProcessingSummary,
}

impl BatchResult {
    pub fn successes(&self) -> impl Iterator<Item = (&PathBuf, &ImageOutcome)> {
        self.outcomes
            .iter()
            .filter_map(|(path, outcome)| outcome.as_ref().ok().map(|o| (path, o)))
    }
}

/// Batch options
#[derive(Debug, Clone)]
pub struct BatchOptions {
    pub concurrency: usize,
    /// Artifact directory mirroring the input tree; `None` writes next to
    /// each image
    pub output_dir: Option<PathBuf>,
    pub reprocess_existing: bool,
}

impl Default for BatchOptions {
    fn default() -> Self {
        Self {
            concurrency: 4,
            output_dir: None,
            reprocess_existing: false,
        }
    }
}

/// Analyze `images` with at most `options.concurrency` workers
///
/// Images are taken in path order. An image whose artifact path is already
/// claimed by an earlier image fails without reaching the model.
pub fn process_images<M: VisionModel>(
    analyzer: &ScreenshotAnalyzer<M>,
    mut images: Vec<PathBuf>,
    layout: &ArtifactLayout,
    options: &BatchOptions,
) -> BatchResult {
    images.sort();
    let total_found = images.len();
    let mut outcomes: Vec<(PathBuf, Result<ImageOutcome, PipelineError>)> = Vec::new();
    let mut jobs: Vec<(PathBuf, PathBuf)> = Vec::with_capacity(images.len());
    let mut claimed: HashMap<PathBuf, usize> = HashMap::new();
    for image in images {
        let target = layout.artifact_path(&image).and_then(|artifact| match claimed.get(&artifact) {
            Some(&owner) => Err(PipelineError::AnalysisFailure(format!(
                "artifact {} already belongs to {}",
                artifact.display(),
                jobs[owner].0.display()
            ))),
            None => Ok(artifact),
        });
        match target {
            Ok(artifact) => {
                claimed.insert(artifact.clone(), jobs.len());
                jobs.push((image, artifact));
            }
            Err(e) => {
                error!(image = %image.display(), error = %e, "screenshot analysis failed");
                outcomes.push((image, Err(e)));
            }
        }
    }

    let workers = options.concurrency.max(1).min(jobs.len().max(1));
    let next = AtomicUsize::new(0);
    let results = Mutex::new(Vec::with_capacity(jobs.len()));
    info!(images = jobs.len(), workers, "processing screenshots");

    thread::scope(|scope| {
        for _ in 0..workers {
            scope.spawn(|| loop {
                let index = next.fetch_add(1, Ordering::SeqCst);
                let Some((image, artifact)) = jobs.get(index) else {
                    break;
                };
                let outcome = analyzer.process_image(image, artifact, options.reprocess_existing);
                if let Err(e) = &outcome {
                    error!(image = %image.display(), error = %e, "screenshot analysis failed");
                }
                if let Ok(mut guard) = results.lock() {
                    guard.push((image.clone(), outcome));
                }
            });
        }
    });

    outcomes.extend(results.into_inner().unwrap_or_else(|poisoned| poisoned.into_inner()));
    outcomes.sort_by(|a, b| a.0.cmp(&b.0));

    let mut summary = ProcessingSummary {
        run_id: Uuid::new_v4(),
        total_found,
        processed: 0,
        skipped: 0,
        successful: 0,
        failed: 0,
        warnings: 0,
        failures: Vec::new(),
    };
    for (path, outcome) in &outcomes {
        match outcome {
            Ok(outcome) => {
                summary.successful += 1;
                if outcome.skipped {
                    summary.skipped += 1;
                } else {
                    summary.processed += 1;
                }
                if outcome.analysis.has_warnings() {
                    summary.warnings += 1;
                }
            }
            Err(e) => {
                summary.failed += 1;
                summary.failures.push(ImageFailure {
                    image: path.display().to_string(),
                    error: e.to_string(),
                });
            }
        }
    }

    BatchResult { outcomes, summary }
}

/// Discover, analyze and summarize every image under `input_dir`
///
/// The summary is written to `summary_dir/processing_summary.json`.
pub fn process_directory<M: VisionModel>(
    analyzer: &ScreenshotAnalyzer<M>,
    input_dir: &Path,
    summary_dir: &Path,
    options: &BatchOptions,
) -> Result<BatchResult, PipelineError> {
    if !input_dir.is_dir() {
        return Err(PipelineError::unavailable(
            "screenshots",
            format!("{} is not a directory", input_dir.display()),
        ));
    }
    let images = discover_images(input_dir)?;
    if images.is_empty() {
        warn!(dir = %input_dir.display(), "no image files found");
    }

    let layout = ArtifactLayout::new(input_dir, options.output_dir.as_deref());
    let result = process_images(analyzer, images, &layout, options);
    write_summary(&result.summary, summary_dir)?;
    info!(
        total = result.summary.total_found,
        processed = result.summary.processed,
        skipped = result.summary.skipped,
        failed = result.summary.failed,
        warnings = result.summary.warnings,
        "screenshot batch complete"
    );
    Ok(result)
}

/// Write `processing_summary.json` into `dir`
pub fn write_summary(summary: &ProcessingSummary, dir: &Path) -> Result<PathBuf, PipelineError> {
    fs::create_dir_all(dir)?;
    let path = dir.join(SUMMARY_FILE);
    fs::write(&path, serde_json::to_string_pretty(summary)?)?;
    Ok(path)
}

/// Whether `path` is an analysis artifact
pub fn is_artifact(path: &Path) -> bool {
    path.file_name()
        .and_then(|n| n.to_str())
        .map(|n| n.ends_with(ARTIFACT_SUFFIX))
        .unwrap_or(false)
}
