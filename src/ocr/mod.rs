//! Screenshot structuring
//!
//! Screen-time screenshots are turned into structured app-usage records by an
//! external vision model, validated, cached as per-image JSON artifacts and
//! rolled up per participant.

pub mod analyzer;
pub mod batch;
pub mod classify;
pub mod dates;
pub mod response;
pub mod rollup;
pub mod types;
pub mod validate;

pub use analyzer::{load_artifact, ArtifactLayout, CommandVisionModel, ImageOutcome, ScreenshotAnalyzer, VisionModel};
pub use batch::{discover_images, is_image, process_directory, BatchOptions, BatchResult, ProcessingSummary};
pub use classify::{AppClassifier, CachedClassification, CommandAppClassifier, EnrichStats, GameClassifierService};
pub use dates::{DateNormalizer, YearPolicy};
pub use rollup::{ParticipantRollup, ParticipantSummary, RollupResult};
pub use types::{AnalysisWarning, AppEntry, ModelResponse, ScreenshotAnalysis, WarningKind};
pub use validate::validate_response;
