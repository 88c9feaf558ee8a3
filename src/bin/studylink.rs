//! Study Link CLI
//!
//! Commands:
//! - link: Resolve identities, link, dedup and report (optionally fetching sources first)
//! - ocr: Analyze screen-time screenshots with the configured vision model
//! - summarize: Roll screenshot analyses up per participant
//! - classify: Add game classification columns to a CSV with an App column
//! - doctor: Diagnose configuration and source availability
//! - config: Print the effective configuration

use clap::{Parser, Subcommand};
use std::path::{Path, PathBuf};
use std::process::ExitCode;
use std::time::Duration;

use study_link::config::StudyConfig;
use study_link::error::{ErrorKind, PipelineError};
use study_link::fetch::ExternalCommand;
use study_link::ocr::{
    process_directory, BatchOptions, CachedClassification, CommandAppClassifier, CommandVisionModel, DateNormalizer,
    GameClassifierService, ParticipantRollup, ScreenshotAnalyzer, YearPolicy,
};
use study_link::pipeline::LinkagePipeline;
use study_link::retry::RetryPolicy;
use study_link::sources::{load_response_start_dates, ResponseStartDates};
use study_link::store::KeyValueStore;
use study_link::{PRODUCER_NAME, STUDY_LINK_VERSION};

/// Study Link - identity resolution and record linkage for device-usage studies
#[derive(Parser)]
#[command(name = "studylink")]
#[command(version = STUDY_LINK_VERSION)]
#[command(about = "Link device uploads to study participants", long_about = None)]
struct Cli {
    /// Configuration file (TOML)
    #[arg(short, long, global = true)]
    config: Option<PathBuf>,

    /// Debug logging
    #[arg(short, long, global = true)]
    verbose: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Link uploads to participants and write joined tables and reports
    Link {
        /// Refresh sources with their fetch commands first
        #[arg(long)]
        fetch: bool,

        /// Output directory
        #[arg(short, long)]
        output_dir: Option<PathBuf>,

        #[arg(long)]
        uploads: Option<PathBuf>,

        #[arg(long)]
        diary: Option<PathBuf>,

        #[arg(long)]
        exit_survey: Option<PathBuf>,

        #[arg(long)]
        contacts: Option<PathBuf>,

        /// Length of the study in days
        #[arg(long)]
        study_days: Option<u32>,

        /// Print run statistics as JSON
        #[arg(long)]
        json: bool,
    },

    /// Analyze screenshots under a directory
    Ocr {
        /// Image directory (defaults to paths.image_dir)
        input: Option<PathBuf>,

        /// Write artifacts here, mirroring the image tree, instead of next to
        /// each image
        #[arg(short, long)]
        output_dir: Option<PathBuf>,

        /// Worker count
        #[arg(long)]
        concurrency: Option<usize>,

        /// Re-analyze images that already have an artifact
        #[arg(long)]
        reprocess: bool,

        /// Leave screenshot dates as the model read them
        #[arg(long)]
        no_year_normalization: bool,

        #[arg(long)]
        reference_year: Option<i32>,
    },

    /// Write per-participant screenshot summaries
    Summarize {
        /// Image or OCR output directory (defaults to paths.image_dir)
        input: Option<PathBuf>,

        /// Only this participant
        #[arg(short, long)]
        participant: Option<String>,

        /// Survey export with ResponseID and StartDate columns
        #[arg(long)]
        responses: Option<PathBuf>,
    },

    /// Add ProbGame and LLM_conf columns to a CSV
    Classify {
        input: PathBuf,

        /// Output path (defaults to overwriting the input)
        #[arg(short, long)]
        output: Option<PathBuf>,

        /// Classification cache file
        #[arg(long)]
        cache: Option<PathBuf>,
    },

    /// Check configuration and sources
    Doctor {
        /// Output as JSON
        #[arg(long)]
        json: bool,
    },

    /// Print the effective configuration as TOML
    Config,
}

fn main() -> ExitCode {
    let cli = Cli::parse();
    init_tracing(cli.verbose);

    match run(cli) {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            eprintln!("{}", serde_json::to_string(&CliError::from(e)).unwrap_or_else(|_| "Unknown error".to_string()));
            ExitCode::FAILURE
        }
    }
}

fn init_tracing(verbose: bool) {
    use tracing_subscriber::EnvFilter;

    let level = if verbose { "debug" } else { "info" };
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(format!("study_link={level},studylink={level},warn")));

    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .with_target(false)
        .init();
}

fn run(cli: Cli) -> Result<(), StudyLinkCliError> {
    let mut config = StudyConfig::load_or_default(cli.config.as_deref())?;

    match cli.command {
        Commands::Link {
            fetch,
            output_dir,
            uploads,
            diary,
            exit_survey,
            contacts,
            study_days,
            json,
        } => {
            let paths = &mut config.paths;
            override_with(&mut paths.output_dir, output_dir);
            override_with(&mut paths.uploads, uploads);
            override_with(&mut paths.diary, diary);
            override_with(&mut paths.exit_survey, exit_survey);
            override_with(&mut paths.contacts, contacts);
            override_with(&mut config.calendar.study_days, study_days);
            config.validate()?;
            cmd_link(config, fetch, json)
        }

        Commands::Ocr {
            input,
            output_dir,
            concurrency,
            reprocess,
            no_year_normalization,
            reference_year,
        } => {
            override_with(&mut config.paths.image_dir, input);
            override_with(&mut config.ocr.concurrency, concurrency);
            override_with(&mut config.ocr.reference_year, reference_year);
            config.ocr.reprocess_existing |= reprocess;
            if no_year_normalization {
                config.ocr.normalize_year = false;
            }
            config.validate()?;
            cmd_ocr(&config, output_dir)
        }

        Commands::Summarize {
            input,
            participant,
            responses,
        } => {
            override_with(&mut config.paths.image_dir, input);
            if responses.is_some() {
                config.paths.qualtrics_responses = responses;
            }
            cmd_summarize(&config, participant.as_deref())
        }

        Commands::Classify { input, output, cache } => {
            override_with(&mut config.ocr.classifier_cache, cache);
            let output = output.unwrap_or_else(|| input.clone());
            cmd_classify(&config, &input, &output)
        }

        Commands::Doctor { json } => cmd_doctor(&config, json),

        Commands::Config => {
            print!("{}", config.to_toml_string()?);
            Ok(())
        }
    }
}

fn override_with<T>(slot: &mut T, value: Option<T>) {
    if let Some(value) = value {
        *slot = value;
    }
}

fn cmd_link(config: StudyConfig, fetch: bool, json: bool) -> Result<(), StudyLinkCliError> {
    let pipeline = LinkagePipeline::new(config);
    let run = pipeline.run(fetch)?;
    let stats = &run.result.stats;

    if json {
        println!("{}", serde_json::to_string_pretty(stats)?);
        return Ok(());
    }

    println!("Linkage run {}", run.run_id);
    println!("==========================================");
    println!(
        "Uploads:       {} rows ({} unreadable, {} undecodable)",
        stats.decode.rows, stats.malformed_upload_rows, stats.decode.row_errors
    );
    println!(
        "Identities:    {} links for {} participants ({} exit survey overrides)",
        stats.identity.merged_links, stats.identity.participants, stats.identity.conflicts_overridden
    );
    println!(
        "Coverage:      {}/{} submission ids ({:.1}%)",
        stats.coverage.mapped_ids, stats.coverage.total_ids, stats.coverage.coverage_pct
    );
    println!(
        "Duplicates:    {} app usage, {} screen unlocks removed",
        stats.duplicates_removed.app_usage, stats.duplicates_removed.screen_unlocks
    );
    println!("Participants:  {}", stats.report.participants);
    for source in &stats.missing_sources {
        println!("Missing:       {}", source);
    }
    println!("\nOutputs:");
    for output in &run.outputs {
        println!("  {} {:?}", output.path.display(), output.status);
    }
    Ok(())
}

fn retry_policy(config: &StudyConfig) -> RetryPolicy {
    RetryPolicy::from(&config.retry)
}

fn cmd_ocr(config: &StudyConfig, output_dir: Option<PathBuf>) -> Result<(), StudyLinkCliError> {
    let ocr = &config.ocr;
    let Some(program) = ocr.model_command.clone() else {
        return Err(StudyLinkCliError::NotConfigured("ocr.model_command"));
    };
    let command = ExternalCommand::new(program, ocr.model_args.clone(), Duration::from_secs(ocr.timeout_secs));
    let normalizer = DateNormalizer::new(YearPolicy {
        reference_year: ocr.reference_year,
        enabled: ocr.normalize_year,
    })?;
    let analyzer = ScreenshotAnalyzer::new(
        CommandVisionModel::new(command, ocr.model_name.clone()),
        normalizer,
        retry_policy(config),
    );

    let options = BatchOptions {
        concurrency: ocr.concurrency,
        output_dir: output_dir.clone(),
        reprocess_existing: ocr.reprocess_existing,
    };
    let summary_dir = output_dir.unwrap_or_else(|| config.paths.image_dir.clone());
    let result = process_directory(&analyzer, &config.paths.image_dir, &summary_dir, &options)?;
    println!("{}", serde_json::to_string_pretty(&result.summary)?);
    Ok(())
}

fn cmd_summarize(config: &StudyConfig, participant: Option<&str>) -> Result<(), StudyLinkCliError> {
    let mut start_dates = ResponseStartDates::in_memory();
    if let Some(path) = &config.paths.qualtrics_responses {
        load_response_start_dates(path, &mut start_dates)?;
    }

    let rollup = ParticipantRollup::new(&config.paths.image_dir, &start_dates);
    let result = rollup.run(participant)?;
    for summary in &result.summaries {
        println!(
            "participant {}: {} entries across {} device type(s), {} parse error(s)",
            summary.participant_id,
            summary.total_daily_entries,
            summary.device_types.len(),
            summary.processing_summary.parsing_errors.len()
        );
    }
    if let Some(status) = result.aggregated {
        println!("aggregated: {:?}", status);
    }
    Ok(())
}

fn cmd_classify(config: &StudyConfig, input: &Path, output: &Path) -> Result<(), StudyLinkCliError> {
    let ocr = &config.ocr;
    let Some(program) = ocr.classifier_command.clone() else {
        return Err(StudyLinkCliError::NotConfigured("ocr.classifier_command"));
    };
    let command = ExternalCommand::new(program, ocr.classifier_args.clone(), Duration::from_secs(ocr.timeout_secs));
    let cache: KeyValueStore<CachedClassification> = KeyValueStore::open(&ocr.classifier_cache)?;
    let mut service = GameClassifierService::new(
        CommandAppClassifier::new(command, ocr.model_name.clone()),
        cache,
        ocr.classifier_batch_size,
    );

    let stats = service.enrich_csv(input, output)?;
    println!(
        "{}: {} rows, {} unique apps, {} game rows",
        output.display(),
        stats.rows,
        stats.unique_apps,
        stats.games
    );
    Ok(())
}

fn cmd_doctor(config: &StudyConfig, json: bool) -> Result<(), StudyLinkCliError> {
    let mut checks: Vec<DoctorCheck> = Vec::new();

    checks.push(DoctorCheck {
        name: "version".to_string(),
        status: CheckStatus::Ok,
        message: format!("{} {}", PRODUCER_NAME, STUDY_LINK_VERSION),
    });

    checks.push(match config.validate() {
        Ok(()) => DoctorCheck {
            name: "config".to_string(),
            status: CheckStatus::Ok,
            message: "Configuration valid".to_string(),
        },
        Err(e) => DoctorCheck {
            name: "config".to_string(),
            status: CheckStatus::Error,
            message: e.to_string(),
        },
    });

    // Mandatory sources are errors when missing, optional ones warnings
    let paths = &config.paths;
    let sources = [
        ("uploads", &paths.uploads, config.fetch.uploads.is_some(), true),
        ("diary", &paths.diary, config.fetch.diary.is_some(), true),
        ("exit_survey", &paths.exit_survey, config.fetch.exit_survey.is_some(), false),
        ("contacts", &paths.contacts, config.fetch.contacts.is_some(), false),
    ];
    for (name, path, fetchable, mandatory) in sources {
        let check = if path.is_file() {
            DoctorCheck {
                name: name.to_string(),
                status: CheckStatus::Ok,
                message: format!("{} present", path.display()),
            }
        } else if fetchable {
            DoctorCheck {
                name: name.to_string(),
                status: CheckStatus::Warning,
                message: format!("{} missing; will be fetched with --fetch", path.display()),
            }
        } else {
            DoctorCheck {
                name: name.to_string(),
                status: if mandatory { CheckStatus::Error } else { CheckStatus::Warning },
                message: format!("{} missing and no fetch command configured", path.display()),
            }
        };
        checks.push(check);
    }

    checks.push(if config.ocr.model_command.is_some() {
        DoctorCheck {
            name: "vision_model".to_string(),
            status: CheckStatus::Ok,
            message: format!("Model {} via command", config.ocr.model_name),
        }
    } else {
        DoctorCheck {
            name: "vision_model".to_string(),
            status: CheckStatus::Warning,
            message: "ocr.model_command not set; screenshot analysis unavailable".to_string(),
        }
    });

    checks.push(if config.ocr.normalize_year {
        DoctorCheck {
            name: "year_policy".to_string(),
            status: CheckStatus::Warning,
            message: format!(
                "Screenshot dates are rewritten to {}; disable for multi-year data",
                config.ocr.reference_year
            ),
        }
    } else {
        DoctorCheck {
            name: "year_policy".to_string(),
            status: CheckStatus::Ok,
            message: "Screenshot dates kept as read".to_string(),
        }
    });

    let report = DoctorReport {
        producer: PRODUCER_NAME.to_string(),
        version: STUDY_LINK_VERSION.to_string(),
        checks,
    };

    if json {
        println!("{}", serde_json::to_string_pretty(&report)?);
    } else {
        println!("Study Link Doctor Report");
        println!("========================");
        println!("Producer: {}", report.producer);
        println!("Version:  {}", report.version);
        println!("\nChecks:");

        for check in &report.checks {
            let status_icon = match check.status {
                CheckStatus::Ok => "[OK]",
                CheckStatus::Warning => "[WARN]",
                CheckStatus::Error => "[ERR]",
            };
            println!("  {} {}: {}", status_icon, check.name, check.message);
        }
    }

    let has_errors = report.checks.iter().any(|c| matches!(c.status, CheckStatus::Error));
    if has_errors {
        Err(StudyLinkCliError::DoctorFailed)
    } else {
        Ok(())
    }
}

// Error types

#[derive(Debug)]
enum StudyLinkCliError {
    Pipeline(PipelineError),
    Json(serde_json::Error),
    NotConfigured(&'static str),
    DoctorFailed,
}

impl From<PipelineError> for StudyLinkCliError {
    fn from(e: PipelineError) -> Self {
        StudyLinkCliError::Pipeline(e)
    }
}

impl From<serde_json::Error> for StudyLinkCliError {
    fn from(e: serde_json::Error) -> Self {
        StudyLinkCliError::Json(e)
    }
}

#[derive(serde::Serialize)]
struct CliError {
    code: String,
    message: String,
    hint: Option<String>,
}

impl From<StudyLinkCliError> for CliError {
    fn from(e: StudyLinkCliError) -> Self {
        match e {
            StudyLinkCliError::Pipeline(e) => {
                let (code, hint) = match e.kind() {
                    ErrorKind::Decode => ("DECODE_ERROR", "Check the export format"),
                    ErrorKind::AnalysisFailure => ("ANALYSIS_FAILED", "Check the vision model output"),
                    ErrorKind::JoinMiss => ("JOIN_MISS", "Check diary and exit survey submission ids"),
                    ErrorKind::RateLimited => ("RATE_LIMITED", "Wait and retry, or raise retry.max_retries"),
                    ErrorKind::ExternalUnavailable => (
                        "SOURCE_UNAVAILABLE",
                        "Check file paths and fetch commands; run 'studylink doctor'",
                    ),
                    ErrorKind::Config => ("CONFIG_ERROR", "Run 'studylink config' to see effective values"),
                };
                CliError {
                    code: code.to_string(),
                    message: e.to_string(),
                    hint: Some(hint.to_string()),
                }
            }
            StudyLinkCliError::Json(e) => CliError {
                code: "JSON_ERROR".to_string(),
                message: e.to_string(),
                hint: None,
            },
            StudyLinkCliError::NotConfigured(key) => CliError {
                code: "NOT_CONFIGURED".to_string(),
                message: format!("{} is not set", key),
                hint: Some("Set it in the configuration file".to_string()),
            },
            StudyLinkCliError::DoctorFailed => CliError {
                code: "DOCTOR_FAILED".to_string(),
                message: "One or more health checks failed".to_string(),
                hint: Some("Review the doctor report for details".to_string()),
            },
        }
    }
}

// Report types

#[derive(serde::Serialize)]
struct DoctorReport {
    producer: String,
    version: String,
    checks: Vec<DoctorCheck>,
}

#[derive(serde::Serialize)]
struct DoctorCheck {
    name: String,
    status: CheckStatus,
    message: String,
}

#[derive(serde::Serialize)]
enum CheckStatus {
    Ok,
    Warning,
    Error,
}
