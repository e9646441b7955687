//! Sync configuration
//!
//! Stored as JSON; every field has a default so an empty object (or no
//! file at all) is a valid configuration.

use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};
use std::str::FromStr;
use std::time::Duration;

use crate::engine::{EngineConfig, DEFAULT_HIGH_WATER_MARK, DEFAULT_TRUNCATE_COUNT};
use crate::error::{Result, SyncError};
use crate::git::DEFAULT_CACHE_ROOT;

/// How documents are committed to the target.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum WriteStrategy {
    /// One document at a time with compare-and-swap retries.
    #[default]
    Cas,
    /// One all-or-nothing bulk request per commit.
    Atomic,
}

impl FromStr for WriteStrategy {
    type Err = SyncError;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "cas" => Ok(WriteStrategy::Cas),
            "atomic" => Ok(WriteStrategy::Atomic),
            other => Err(SyncError::Config(format!(
                "unknown write strategy {:?} (expected cas or atomic)",
                other
            ))),
        }
    }
}

impl std::fmt::Display for WriteStrategy {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            WriteStrategy::Cas => f.write_str("cas"),
            WriteStrategy::Atomic => f.write_str("atomic"),
        }
    }
}

/// Replication settings.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct SyncConfig {
    /// Cache size and worklist length that trigger overflow handling.
    pub high_water_mark: usize,
    /// Most recently pushed worklist entries dropped on overflow.
    pub truncate_count: usize,
    pub write_strategy: WriteStrategy,
    /// Give up on a document after this many conflicting writes.
    /// Absent means retry forever.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub max_write_attempts: Option<u64>,
    /// Pause between runs in polling mode.
    pub poll_interval_secs: u64,
    /// Where fetched git mirrors are kept.
    pub cache_root: PathBuf,
}

impl Default for SyncConfig {
    fn default() -> Self {
        Self {
            high_water_mark: DEFAULT_HIGH_WATER_MARK,
            truncate_count: DEFAULT_TRUNCATE_COUNT,
            write_strategy: WriteStrategy::Cas,
            max_write_attempts: None,
            poll_interval_secs: 60 * 60, // hourly
            cache_root: PathBuf::from(DEFAULT_CACHE_ROOT),
        }
    }
}

impl SyncConfig {
    /// Load a config file; a missing file yields the defaults.
    pub fn load(path: &Path) -> Result<Self> {
        if !path.exists() {
            return Ok(Self::default());
        }
        let data = fs::read_to_string(path).map_err(|e| {
            SyncError::Config(format!("failed to read {}: {}", path.display(), e))
        })?;
        let config: SyncConfig = serde_json::from_str(&data).map_err(|e| {
            SyncError::Config(format!("failed to parse {}: {}", path.display(), e))
        })?;
        config.validate()?;
        Ok(config)
    }

    pub fn save(&self, path: &Path) -> Result<()> {
        let tmp_path = path.with_extension("tmp");
        let data = serde_json::to_string_pretty(self)
            .map_err(|e| SyncError::Config(e.to_string()))?;
        fs::write(&tmp_path, data)
            .and_then(|_| fs::rename(&tmp_path, path))
            .map_err(|e| SyncError::Config(format!("failed to write {}: {}", path.display(), e)))
    }

    pub fn validate(&self) -> Result<()> {
        self.engine().validate()?;
        if self.max_write_attempts == Some(0) {
            return Err(SyncError::Config(
                "max_write_attempts must be at least 1".to_string(),
            ));
        }
        Ok(())
    }

    pub fn engine(&self) -> EngineConfig {
        EngineConfig {
            high_water_mark: self.high_water_mark,
            truncate_count: self.truncate_count,
        }
    }

    pub fn poll_interval(&self) -> Duration {
        Duration::from_secs(self.poll_interval_secs)
    }
}
