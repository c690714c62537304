//! Cadence configuration system.

use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

use crate::error::{CadenceError, Result};

/// Root configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CadenceConfig {
    /// SQLite database path.
    #[serde(default = "default_db_path")]
    pub db_path: String,
    /// Number of dispatcher workers.
    #[serde(default = "default_workers")]
    pub workers: usize,
    /// Seconds between due-work polls.
    #[serde(default = "default_poll_interval")]
    pub poll_interval_secs: u64,
    /// Max enrollments claimed per poll.
    #[serde(default = "default_batch_size")]
    pub batch_size: usize,
    /// How long a claim lease lasts before another worker may reclaim it.
    #[serde(default = "default_lease_duration")]
    pub lease_duration_secs: u64,
    /// Advance past a step after a permanent delivery failure instead of
    /// parking the enrollment.
    #[serde(default = "default_true")]
    pub advance_on_permanent_failure: bool,
    #[serde(default)]
    pub retry: RetryConfig,
}

/// Backoff policy for transient delivery failures.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RetryConfig {
    /// Consecutive transient failures tolerated on one step. The last
    /// failure is reclassified as permanent.
    #[serde(default = "default_max_attempts")]
    pub max_attempts: u32,
    #[serde(default = "default_base_backoff")]
    pub base_backoff_secs: u64,
    #[serde(default = "default_max_backoff")]
    pub max_backoff_secs: u64,
    /// Add up to 10% random jitter to each delay.
    #[serde(default = "default_true")]
    pub jitter: bool,
}

fn default_db_path() -> String {
    CadenceConfig::home_dir()
        .join("cadence.db")
        .to_string_lossy()
        .into_owned()
}
fn default_workers() -> usize {
    2
}
fn default_poll_interval() -> u64 {
    15
}
fn default_batch_size() -> usize {
    16
}
fn default_lease_duration() -> u64 {
    120
}
fn default_max_attempts() -> u32 {
    5
}
fn default_base_backoff() -> u64 {
    60
}
fn default_max_backoff() -> u64 {
    3600
}
fn default_true() -> bool {
    true
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_attempts: default_max_attempts(),
            base_backoff_secs: default_base_backoff(),
            max_backoff_secs: default_max_backoff(),
            jitter: true,
        }
    }
}

impl Default for CadenceConfig {
    fn default() -> Self {
        Self {
            db_path: default_db_path(),
            workers: default_workers(),
            poll_interval_secs: default_poll_interval(),
            batch_size: default_batch_size(),
            lease_duration_secs: default_lease_duration(),
            advance_on_permanent_failure: true,
            retry: RetryConfig::default(),
        }
    }
}

impl CadenceConfig {
    /// Load config from the default path (~/.cadence/config.toml).
    pub fn load() -> Result<Self> {
        let path = Self::default_path();
        if path.exists() {
            Self::load_from(&path)
        } else {
            Ok(Self::default())
        }
    }

    /// Load config from a specific path.
    pub fn load_from(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)
            .map_err(|e| CadenceError::Config(format!("Failed to read config: {e}")))?;
        let config: Self = toml::from_str(&content)
            .map_err(|e| CadenceError::Config(format!("Failed to parse config: {e}")))?;
        Ok(config)
    }

    /// Save config to the default path.
    pub fn save(&self) -> Result<()> {
        let path = Self::default_path();
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let content = toml::to_string_pretty(self)
            .map_err(|e| CadenceError::Config(format!("Failed to serialize config: {e}")))?;
        std::fs::write(&path, content)?;
        Ok(())
    }

    /// Get the default config path.
    pub fn default_path() -> PathBuf {
        Self::home_dir().join("config.toml")
    }

    /// Get the Cadence home directory.
    pub fn home_dir() -> PathBuf {
        dirs::home_dir()
            .unwrap_or_else(|| PathBuf::from("."))
            .join(".cadence")
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let config = CadenceConfig::default();
        assert_eq!(config.workers, 2);
        assert_eq!(config.poll_interval_secs, 15);
        assert!(config.advance_on_permanent_failure);
        assert_eq!(config.retry.max_attempts, 5);
    }

    #[test]
    fn test_parse_partial_toml() {
        let config: CadenceConfig = toml::from_str(
            r#"
            workers = 8
            [retry]
            base_backoff_secs = 30
            "#,
        )
        .unwrap();
        assert_eq!(config.workers, 8);
        assert_eq!(config.retry.base_backoff_secs, 30);
        // Unspecified fields fall back to defaults
        assert_eq!(config.batch_size, 16);
        assert_eq!(config.retry.max_backoff_secs, 3600);
    }

    #[test]
    fn test_round_trip() {
        let config = CadenceConfig::default();
        let toml_str = toml::to_string_pretty(&config).unwrap();
        let back: CadenceConfig = toml::from_str(&toml_str).unwrap();
        assert_eq!(back.lease_duration_secs, config.lease_duration_secs);
    }
}
