//! Durable token-usage statistics.
//!
//! The tracker's counters survive restarts as a small pretty-printed JSON
//! file holding both windowed totals, their window-start dates, and a bounded
//! history of individual spends.

use std::path::{Path, PathBuf};

use chrono::{Datelike, NaiveDate};
use serde::{Deserialize, Serialize};
use tracing::warn;

use crate::Result;

/// A single recorded spend.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct UsageEvent {
    pub timestamp: String,
    pub tokens: u64,
    #[serde(rename = "type")]
    pub kind: String,
}

/// Counters plus window-start dates, as persisted on disk.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct UsageStats {
    pub monthly_tokens: u64,
    pub daily_tokens: u64,
    pub last_reset_date: NaiveDate,
    pub monthly_reset_date: NaiveDate,
    #[serde(default)]
    pub usage_history: Vec<UsageEvent>,
}

impl UsageStats {
    /// Zeroed counters with windows anchored at `today`.
    pub fn empty(today: NaiveDate) -> Self {
        Self {
            monthly_tokens: 0,
            daily_tokens: 0,
            last_reset_date: today,
            monthly_reset_date: today.with_day(1).unwrap_or(today),
            usage_history: Vec::new(),
        }
    }
}

/// Persistence backend for [`UsageStats`].
///
/// Injected into the tracker so tests can run against an in-memory store.
pub trait StatsStore: Send + Sync {
    fn load(&self) -> Result<Option<UsageStats>>;
    fn save(&self, stats: &UsageStats) -> Result<()>;
}

/// Stats stored as JSON at a fixed path.
pub struct JsonFileStore {
    path: PathBuf,
}

impl JsonFileStore {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

impl StatsStore for JsonFileStore {
    fn load(&self) -> Result<Option<UsageStats>> {
        if !self.path.exists() {
            return Ok(None);
        }
        let txt = std::fs::read_to_string(&self.path)?;
        if txt.trim().is_empty() {
            return Ok(None);
        }
        match serde_json::from_str(&txt) {
            Ok(stats) => Ok(Some(stats)),
            Err(e) => {
                // An unreadable file means starting over, not crashing.
                warn!("ignoring unreadable stats file {}: {e}", self.path.display());
                Ok(None)
            }
        }
    }

    fn save(&self, stats: &UsageStats) -> Result<()> {
        if let Some(parent) = self.path.parent() {
            if !parent.as_os_str().is_empty() {
                std::fs::create_dir_all(parent)?;
            }
        }
        let txt = serde_json::to_string_pretty(stats)?;
        std::fs::write(&self.path, txt)?;
        Ok(())
    }
}
