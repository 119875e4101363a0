// ⚙️ Configuration loading
//
// Config file lookup, first hit wins:
//   1. `--config` path
//   2. `SWIM_RECONCILE_CONFIG` environment variable
//   3. `./reconcile.toml` when present
//   4. compiled defaults
//
// `SWIM_RECONCILE_DB` and `SWIM_RECONCILE_SOURCE` then override the database
// path and the provenance tag regardless of where the file came from.

use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use tracing::debug;

use crate::error::{ReconcileError, Result};

pub const CONFIG_ENV: &str = "SWIM_RECONCILE_CONFIG";
pub const DB_ENV: &str = "SWIM_RECONCILE_DB";
pub const SOURCE_ENV: &str = "SWIM_RECONCILE_SOURCE";
pub const DEFAULT_CONFIG_FILE: &str = "reconcile.toml";

/// Bounds the auto-confirm floor is clamped into
pub const AUTO_CONFIRM_BOUNDS: (f64, f64) = (0.6, 0.99);

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ReconcileConfig {
    /// SQLite store location
    pub database_path: PathBuf,

    /// Provenance tag written on imported results and new mappings
    pub source_tag: String,

    /// Upsert batch size for imports
    pub import_batch_size: usize,

    /// Default floor for ad hoc candidate searches
    pub search_min_similarity: f64,

    /// Default floor for the auto-confirm sweep (clamped, see `AUTO_CONFIRM_BOUNDS`)
    pub auto_confirm_min_confidence: f64,

    /// Default number of candidates returned per search
    pub match_limit: usize,

    /// Candidate superset fetched per search = limit × factor
    pub candidate_fetch_factor: usize,

    /// HTTP bind address for the API server
    pub server_addr: String,
}

impl Default for ReconcileConfig {
    fn default() -> Self {
        Self {
            database_path: PathBuf::from("reconcile.db"),
            source_tag: "external-system".to_string(),
            import_batch_size: 500,
            search_min_similarity: 0.6,
            auto_confirm_min_confidence: 0.8,
            match_limit: 10,
            candidate_fetch_factor: 3,
            server_addr: "127.0.0.1:3000".to_string(),
        }
    }
}

impl ReconcileConfig {
    /// Resolve configuration from the process environment
    pub fn load(explicit: Option<&Path>) -> Result<Self> {
        Self::load_with(explicit, |key| std::env::var(key).ok())
    }

    /// Resolve configuration with an injectable environment lookup
    pub fn load_with<F>(explicit: Option<&Path>, env: F) -> Result<Self>
    where
        F: Fn(&str) -> Option<String>,
    {
        let file = match explicit {
            Some(path) => Some(path.to_path_buf()),
            None => env(CONFIG_ENV).map(PathBuf::from).or_else(|| {
                let local = PathBuf::from(DEFAULT_CONFIG_FILE);
                local.exists().then_some(local)
            }),
        };

        let mut config = match file {
            Some(path) => {
                debug!(path = %path.display(), "loading config file");
                Self::from_file(&path)?
            }
            None => Self::default(),
        };

        if let Some(db) = env(DB_ENV) {
            config.database_path = PathBuf::from(db);
        }
        if let Some(source) = env(SOURCE_ENV) {
            config.source_tag = source;
        }

        config.validate()?;
        Ok(config)
    }

    pub fn from_file(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path).map_err(|e| {
            ReconcileError::Config(format!("cannot read {}: {}", path.display(), e))
        })?;
        Self::from_toml(&content)
    }

    pub fn from_toml(content: &str) -> Result<Self> {
        toml::from_str(content).map_err(|e| ReconcileError::Config(e.to_string()))
    }

    pub fn validate(&self) -> Result<()> {
        if self.source_tag.trim().is_empty() {
            return Err(ReconcileError::Config("source_tag must not be empty".into()));
        }
        if self.import_batch_size == 0 {
            return Err(ReconcileError::Config("import_batch_size must be at least 1".into()));
        }
        if self.match_limit == 0 {
            return Err(ReconcileError::Config("match_limit must be at least 1".into()));
        }
        if self.candidate_fetch_factor == 0 {
            return Err(ReconcileError::Config(
                "candidate_fetch_factor must be at least 1".into(),
            ));
        }
        if !(0.0..=1.0).contains(&self.search_min_similarity) {
            return Err(ReconcileError::Config(format!(
                "search_min_similarity must be within [0, 1], got {}",
                self.search_min_similarity
            )));
        }
        if !(0.0..=1.0).contains(&self.auto_confirm_min_confidence) {
            return Err(ReconcileError::Config(format!(
                "auto_confirm_min_confidence must be within [0, 1], got {}",
                self.auto_confirm_min_confidence
            )));
        }
        Ok(())
    }

    /// Configured sweep floor after clamping
    pub fn auto_confirm_floor(&self) -> f64 {
        clamp_auto_confirm(self.auto_confirm_min_confidence)
    }
}

pub fn clamp_auto_confirm(min_confidence: f64) -> f64 {
    let (lo, hi) = AUTO_CONFIRM_BOUNDS;
    if min_confidence.is_nan() {
        return lo;
    }
    min_confidence.clamp(lo, hi)
}
