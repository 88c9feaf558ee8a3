//! Study Link - identity resolution and record linkage for longitudinal
//! device-usage studies
//!
//! Raw device uploads carry anonymous submission ids. Study Link resolves them
//! to participant pseudonyms (`RANDOM_ID`) through survey answers, joins usage
//! records to participant context, removes retransmitted duplicates, maps
//! sessions onto the study calendar and writes per-participant reports.
//!
//! ## Modules
//!
//! - **Linkage**: sources → decoder → identity → linker → dedup → report
//! - **OCR**: screen-time screenshots structured by an external vision model

pub mod calendar;
pub mod config;
pub mod decoder;
pub mod dedup;
pub mod error;
pub mod fetch;
pub mod identity;
pub mod linker;
pub mod ocr;
pub mod output;
pub mod pipeline;
pub mod report;
pub mod retry;
pub mod sources;
pub mod store;
pub mod types;

pub use calendar::StudyCalendar;
pub use config::StudyConfig;
pub use error::{ErrorKind, PipelineError};
pub use identity::{resolve_identities, IdentityMap};
pub use pipeline::{link_batch, LinkagePipeline, LinkageResult};
pub use retry::RetryPolicy;
pub use store::KeyValueStore;
pub use types::{JoinedRecord, ParticipantContext, ParticipantReport, UploadRecord, UsageEvent};

/// Crate version recorded in run summaries
pub const STUDY_LINK_VERSION: &str = env!("CARGO_PKG_VERSION");

/// Producer name for run summaries and the CLI
pub const PRODUCER_NAME: &str = "study-link";
