//! Game classification of app names
//!
//! App names are sent to a classifier in batches; answers are cached in a
//! [`KeyValueStore`] keyed by normalized app name so each app is classified
//! once across runs. A batch whose classification fails gets `No`/1 defaults
//! that are not cached, so the next run asks again.

use super::response::strip_code_fences;
use crate::error::PipelineError;
use crate::fetch::ExternalCommand;
use crate::store::KeyValueStore;
use chrono::{SecondsFormat, Utc};
use regex::Regex;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet};
use std::path::Path;
use tracing::{debug, info, warn};

pub const PROB_GAME_COLUMN: &str = "ProbGame";
pub const CONFIDENCE_COLUMN: &str = "LLM_conf";
pub const DEFAULT_BATCH_SIZE: usize = 20;

/// One classifier answer
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GameClassification {
    pub app_name: String,
    pub is_game: bool,
    /// 1 (guess) to 10 (certain)
    pub confidence: i64,
    #[serde(default)]
    pub reasoning: String,
}

#[derive(Debug, Deserialize)]
struct ClassificationResponse {
    classifications: Vec<GameClassification>,
}

/// Cached classification of one app
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CachedClassification {
    pub is_game: bool,
    pub confidence: u8,
    pub reasoning: String,
    pub classification_timestamp: String,
    pub model_used: String,
}

impl CachedClassification {
    pub fn prob_game(&self) -> &'static str {
        if self.is_game {
            "Yes"
        } else {
            "No"
        }
    }
}

/// Classifier boundary
pub trait AppClassifier {
    fn model_name(&self) -> &str;

    /// Classify a batch of app names
    fn classify(&self, app_names: &[String]) -> Result<Vec<GameClassification>, PipelineError>;
}

/// Classifier backed by an external program
///
/// App names are appended as arguments; stdout must be
/// `{"classifications": [{"app_name", "is_game", "confidence", "reasoning"}]}`,
/// optionally wrapped in a code fence.
#[derive(Debug, Clone)]
pub struct CommandAppClassifier {
    command: ExternalCommand,
    model_name: String,
}

impl CommandAppClassifier {
    pub fn new(command: ExternalCommand, model_name: impl Into<String>) -> Self {
        Self {
            command,
            model_name: model_name.into(),
        }
    }
}

impl AppClassifier for CommandAppClassifier {
    fn model_name(&self) -> &str {
        &self.model_name
    }

    fn classify(&self, app_names: &[String]) -> Result<Vec<GameClassification>, PipelineError> {
        let output = self.command.run("app-classifier", app_names)?;
        parse_classifications(&output.stdout)
    }
}

/// Parse classifier output, salvaging complete objects from a malformed reply
pub fn parse_classifications(raw: &str) -> Result<Vec<GameClassification>, PipelineError> {
    let text = strip_code_fences(raw);
    match serde_json::from_str::<ClassificationResponse>(text) {
        Ok(response) => Ok(response.classifications),
        Err(e) => {
            warn!(error = %e, "malformed classifier response, extracting partial results");
            let object = Regex::new(r#"\{[^{}]*"app_name"[^{}]*\}"#)
                .map_err(|e| PipelineError::Config(e.to_string()))?;
            let salvaged: Vec<GameClassification> = object
                .find_iter(text)
                .filter_map(|m| serde_json::from_str(m.as_str()).ok())
                .collect();
            if salvaged.is_empty() {
                return Err(PipelineError::AnalysisFailure(format!(
                    "classifier returned no usable classifications: {}",
                    e
                )));
            }
            Ok(salvaged)
        }
    }
}

/// Counts from enriching a CSV
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct EnrichStats {
    pub rows: usize,
    pub unique_apps: usize,
    pub games: usize,
    /// Every row already carried a classification
    pub already_classified: bool,
}

/// Classifies apps through a cache
pub struct GameClassifierService<C> {
    classifier: C,
    cache: KeyValueStore<CachedClassification>,
    batch_size: usize,
}

impl<C: AppClassifier> GameClassifierService<C> {
    pub fn new(classifier: C, cache: KeyValueStore<CachedClassification>, batch_size: usize) -> Self {
        Self {
            classifier,
            cache,
            batch_size: batch_size.max(1),
        }
    }

    pub fn cache(&self) -> &KeyValueStore<CachedClassification> {
        &self.cache
    }

    /// Classify one batch, consulting the cache first
    ///
    /// Results are keyed by the app name as given.
    pub fn classify_batch(&mut self, app_names: &[String]) -> Result<BTreeMap<String, CachedClassification>, PipelineError> {
        let mut results = BTreeMap::new();
        let mut uncached = Vec::new();
        for name in app_names {
            match self.cache.get(name) {
                Some(hit) => {
                    debug!(app = %name, "classification cache hit");
                    results.insert(name.clone(), hit.clone());
                }
                None => uncached.push(name.clone()),
            }
        }
        if uncached.is_empty() {
            return Ok(results);
        }

        info!(cached = results.len(), uncached = uncached.len(), "classifying apps");
        let timestamp = Utc::now().to_rfc3339_opts(SecondsFormat::Secs, true);
        let model_used = self.classifier.model_name().to_string();
        match self.classifier.classify(&uncached) {
            Ok(classifications) => {
                let mut fresh = Vec::with_capacity(classifications.len());
                for c in classifications {
                    let entry = CachedClassification {
                        is_game: c.is_game,
                        confidence: c.confidence.clamp(1, 10) as u8,
                        reasoning: c.reasoning,
                        classification_timestamp: timestamp.clone(),
                        model_used: model_used.clone(),
                    };
                    fresh.push((c.app_name, entry));
                }
                // answers are keyed back to the name as requested
                let normalize = KeyValueStore::<CachedClassification>::normalize_key;
                for (name, entry) in &fresh {
                    let requested = uncached.iter().find(|u| normalize(u) == normalize(name));
                    results.insert(requested.unwrap_or(name).clone(), entry.clone());
                }
                self.cache.insert_many(fresh)?;
            }
            Err(e) => {
                warn!(error = %e, apps = uncached.len(), "classification failed, defaulting to not a game");
                for name in uncached {
                    results.insert(
                        name,
                        CachedClassification {
                            is_game: false,
                            confidence: 1,
                            reasoning: format!("Classification failed: {}", e),
                            classification_timestamp: timestamp.clone(),
                            model_used: model_used.clone(),
                        },
                    );
                }
            }
        }
        Ok(results)
    }

    /// Classify any number of apps in batches
    pub fn classify_all(&mut self, app_names: &[String]) -> Result<BTreeMap<String, CachedClassification>, PipelineError> {
        let mut all = BTreeMap::new();
        let batches = app_names.len().div_ceil(self.batch_size);
        for (i, batch) in app_names.chunks(self.batch_size).enumerate() {
            all.extend(self.classify_batch(batch)?);
            debug!(batch = i + 1, batches, "classified batch");
        }
        Ok(all)
    }

    /// Add or refresh `ProbGame` and `LLM_conf` columns on a CSV with an `App` column
    pub fn enrich_csv(&mut self, input: &Path, output: &Path) -> Result<EnrichStats, PipelineError> {
        let mut reader = csv::ReaderBuilder::new()
            .flexible(true)
            .from_path(input)
            .map_err(|e| PipelineError::unavailable("classify", format!("{}: {}", input.display(), e)))?;
        let mut headers: Vec<String> = reader.headers()?.iter().map(str::to_string).collect();
        let rows: Vec<csv::StringRecord> = reader.records().collect::<Result<_, _>>()?;

        let Some(app_col) = headers.iter().position(|h| h == "App") else {
            return Err(PipelineError::Config(format!(
                "{} must contain an 'App' column",
                input.display()
            )));
        };

        // step 1: locate or append the output columns
        let column = |headers: &mut Vec<String>, name: &str| match headers.iter().position(|h| h == name) {
            Some(i) => (i, true),
            None => {
                headers.push(name.to_string());
                (headers.len() - 1, false)
            }
        };
        let (game_col, had_game) = column(&mut headers, PROB_GAME_COLUMN);
        let (conf_col, had_conf) = column(&mut headers, CONFIDENCE_COLUMN);

        let cell = |row: &csv::StringRecord, i: usize| row.get(i).unwrap_or("").trim().to_string();
        let already_classified = had_game
            && had_conf
            && rows
                .iter()
                .all(|r| !cell(r, game_col).is_empty() && !cell(r, conf_col).is_empty());

        // step 2: classify unique apps
        let mut seen = BTreeSet::new();
        let unique: Vec<String> = rows
            .iter()
            .map(|r| cell(r, app_col))
            .filter(|a| !a.is_empty() && seen.insert(a.clone()))
            .collect();
        let classified = if already_classified {
            info!(path = %input.display(), "all apps already classified");
            BTreeMap::new()
        } else {
            self.classify_all(&unique)?
        };

        // step 3: write
        if let Some(parent) = output.parent() {
            if !parent.as_os_str().is_empty() {
                std::fs::create_dir_all(parent)?;
            }
        }
        let mut writer = csv::Writer::from_path(output)?;
        writer.write_record(&headers)?;
        let mut games = 0;
        for row in &rows {
            let mut out: Vec<String> = row.iter().map(str::to_string).collect();
            out.resize(headers.len(), String::new());
            if !already_classified {
                let (prob, conf) = match classified.get(&cell(row, app_col)) {
                    Some(c) => (c.prob_game().to_string(), c.confidence.to_string()),
                    None => ("No".to_string(), "1".to_string()),
                };
                out[game_col] = prob;
                out[conf_col] = conf;
            }
            if out[game_col] == "Yes" {
                games += 1;
            }
            writer.write_record(&out)?;
        }
        writer.flush()?;

        let stats = EnrichStats {
            rows: rows.len(),
            unique_apps: unique.len(),
            games,
            already_classified,
        };
        info!(
            path = %output.display(),
            rows = stats.rows,
            unique_apps = stats.unique_apps,
            games = stats.games,
            "enriched csv with game classification"
        );
        Ok(stats)
    }
}
