//! Explicit key-value store
//!
//! Replaces ambient global caches (app classifications, response start dates)
//! with a store that is passed to the component that needs it. A file-backed
//! store loads once when opened and flushes after every write. Keys are
//! trimmed and case-folded before any lookup or insert.

use crate::error::PipelineError;
use serde::de::DeserializeOwned;
use serde::Serialize;
use std::collections::BTreeMap;
use std::fs;
use std::path::{Path, PathBuf};
use tracing::{debug, warn};

/// Key-value store with normalized keys and optional JSON persistence
#[derive(Debug, Clone)]
pub struct KeyValueStore<V> {
    path: Option<PathBuf>,
    entries: BTreeMap<String, V>,
}

impl<V> Default for KeyValueStore<V> {
    fn default() -> Self {
        Self {
            path: None,
            entries: BTreeMap::new(),
        }
    }
}

impl<V> KeyValueStore<V> {
    /// Create a store that is never persisted
    pub fn in_memory() -> Self {
        Self::default()
    }

    /// Normalize a key: surrounding whitespace trimmed, lowercased
    pub fn normalize_key(key: &str) -> String {
        key.trim().to_lowercase()
    }

    pub fn get(&self, key: &str) -> Option<&V> {
        self.entries.get(&Self::normalize_key(key))
    }

    pub fn contains(&self, key: &str) -> bool {
        self.entries.contains_key(&Self::normalize_key(key))
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn path(&self) -> Option<&Path> {
        self.path.as_deref()
    }

    pub fn iter(&self) -> impl Iterator<Item = (&String, &V)> {
        self.entries.iter()
    }
}

impl<V: Serialize + DeserializeOwned> KeyValueStore<V> {
    /// Open a file-backed store, loading existing entries
    ///
    /// A missing file yields an empty store. A file that cannot be parsed is
    /// logged and treated as empty; it is overwritten on the next flush.
    pub fn open(path: impl Into<PathBuf>) -> Result<Self, PipelineError> {
        let path = path.into();
        let entries = if path.exists() {
            let raw = fs::read_to_string(&path)?;
            match serde_json::from_str::<BTreeMap<String, V>>(&raw) {
                Ok(loaded) => loaded
                    .into_iter()
                    .map(|(k, v)| (Self::normalize_key(&k), v))
                    .collect(),
                Err(e) => {
                    warn!(path = %path.display(), error = %e, "could not load store, starting empty");
                    BTreeMap::new()
                }
            }
        } else {
            BTreeMap::new()
        };
        debug!(path = %path.display(), entries = entries.len(), "opened key-value store");
        Ok(Self {
            path: Some(path),
            entries,
        })
    }

    /// Insert a value and flush
    pub fn insert(&mut self, key: &str, value: V) -> Result<(), PipelineError> {
        self.entries.insert(Self::normalize_key(key), value);
        self.flush()
    }

    /// Insert several values with a single flush
    pub fn insert_many<I, K>(&mut self, items: I) -> Result<(), PipelineError>
    where
        I: IntoIterator<Item = (K, V)>,
        K: AsRef<str>,
    {
        for (key, value) in items {
            self.entries.insert(Self::normalize_key(key.as_ref()), value);
        }
        self.flush()
    }

    /// Write all entries to the backing file (no-op for in-memory stores)
    pub fn flush(&self) -> Result<(), PipelineError> {
        let Some(path) = &self.path else {
            return Ok(());
        };
        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() {
                fs::create_dir_all(parent)?;
            }
        }
        fs::write(path, serde_json::to_string_pretty(&self.entries)?)?;
        Ok(())
    }
}
