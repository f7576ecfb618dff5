//! Runtime configuration.
//!
//! Loaded from an optional JSON file; every field has a default so a partial
//! file (or none at all) is valid. Command line flags override file values.

use rand::Rng;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::time::Duration;
use thiserror::Error;

use crate::model::{QuotaMetric, ScopeLevel};

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to read {path}: {source}")]
    Io {
        path: PathBuf,
        source: std::io::Error,
    },
    #[error("failed to parse config: {0}")]
    Parse(#[from] serde_json::Error),
    #[error("invalid config: {0}")]
    Invalid(String),
}

/// Backoff for retrying transient backend failures.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RetryConfig {
    /// Attempts per backend call, the first one included.
    pub max_attempts: u32,
    pub initial_delay_ms: u64,
    pub max_delay_ms: u64,
    pub backoff_multiplier: f64,
    /// Fraction of the delay that is randomized away (0.0 disables jitter).
    pub jitter: f64,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            initial_delay_ms: 1000,
            max_delay_ms: 30_000,
            backoff_multiplier: 2.0,
            jitter: 0.5,
        }
    }
}

impl RetryConfig {
    /// Delay after failed attempt `attempt` (1-based), without jitter.
    pub fn base_delay(&self, attempt: u32) -> Duration {
        let exponent = attempt.saturating_sub(1).min(32) as i32;
        let delay = self.initial_delay_ms as f64 * self.backoff_multiplier.powi(exponent);
        Duration::from_millis(delay.min(self.max_delay_ms as f64) as u64)
    }

    /// Delay after failed attempt `attempt`, with jitter applied.
    pub fn backoff(&self, attempt: u32) -> Duration {
        let base = self.base_delay(attempt);
        let jitter = self.jitter.clamp(0.0, 1.0);
        if jitter == 0.0 || base.is_zero() {
            return base;
        }
        let factor = rand::thread_rng().gen_range((1.0 - jitter)..=1.0);
        base.mul_f64(factor)
    }
}

/// Polling sub-loop bounds.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct PollConfig {
    pub max_checks: u32,
    pub initial_interval_ms: u64,
    pub max_interval_ms: u64,
    pub backoff_multiplier: f64,
}

impl Default for PollConfig {
    fn default() -> Self {
        Self {
            max_checks: 60,
            initial_interval_ms: 2000,
            max_interval_ms: 30_000,
            backoff_multiplier: 1.5,
        }
    }
}

impl PollConfig {
    /// Wait before status check `check` (1-based).
    pub fn interval(&self, check: u32) -> Duration {
        let exponent = check.saturating_sub(1).min(32) as i32;
        let delay = self.initial_interval_ms as f64 * self.backoff_multiplier.powi(exponent);
        Duration::from_millis(delay.min(self.max_interval_ms as f64) as u64)
    }
}

/// Pull reconciliation cadence.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ReconcileConfig {
    pub interval_secs: u64,
    /// Scopes reconciled concurrently.
    pub parallelism: usize,
    /// Age after which a transitional record without a run is resolved.
    pub stale_after_secs: u64,
}

impl Default for ReconcileConfig {
    fn default() -> Self {
        Self {
            interval_secs: 300,
            parallelism: 4,
            stale_after_secs: 900,
        }
    }
}

/// Ledger drift policy.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct QuotaConfig {
    /// Divergence per counter ignored by recomputation.
    pub drift_tolerance: i64,
    /// Consecutive passes a divergence must persist before it is corrected.
    pub drift_confirm_passes: u32,
}

impl Default for QuotaConfig {
    fn default() -> Self {
        Self {
            drift_tolerance: 0,
            drift_confirm_passes: 2,
        }
    }
}

/// Scope created at startup.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ScopeConfig {
    pub id: String,
    #[serde(default)]
    pub name: Option<String>,
    pub level: ScopeLevel,
    #[serde(default)]
    pub parent: Option<String>,
    #[serde(default)]
    pub limits: BTreeMap<QuotaMetric, i64>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SyncConfig {
    pub retry: RetryConfig,
    pub poll: PollConfig,
    pub reconcile: ReconcileConfig,
    pub quota: QuotaConfig,
    /// Deliveries of a scheduled task whose job failed with a retryable error.
    pub scheduler_max_attempts: u32,
    /// Remembered request ids for intent deduplication.
    pub idempotency_cache_size: usize,
    /// Scopes to create, parents first.
    pub scopes: Vec<ScopeConfig>,
}

impl Default for SyncConfig {
    fn default() -> Self {
        Self {
            retry: RetryConfig::default(),
            poll: PollConfig::default(),
            reconcile: ReconcileConfig::default(),
            quota: QuotaConfig::default(),
            scheduler_max_attempts: 3,
            idempotency_cache_size: 1000,
            scopes: Vec::new(),
        }
    }
}

impl SyncConfig {
    pub fn from_file(path: &Path) -> Result<Self, ConfigError> {
        let raw = std::fs::read_to_string(path).map_err(|source| ConfigError::Io {
            path: path.to_path_buf(),
            source,
        })?;
        let config: SyncConfig = serde_json::from_str(&raw)?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.retry.max_attempts == 0 {
            return Err(ConfigError::Invalid("retry.max_attempts must be at least 1".into()));
        }
        if self.poll.max_checks == 0 {
            return Err(ConfigError::Invalid("poll.max_checks must be at least 1".into()));
        }
        if self.reconcile.parallelism == 0 {
            return Err(ConfigError::Invalid(
                "reconcile.parallelism must be at least 1".into(),
            ));
        }
        if self.quota.drift_tolerance < 0 {
            return Err(ConfigError::Invalid(
                "quota.drift_tolerance must not be negative".into(),
            ));
        }
        if self.idempotency_cache_size == 0 {
            return Err(ConfigError::Invalid(
                "idempotency_cache_size must be at least 1".into(),
            ));
        }
        Ok(())
    }
}
