//! Engine configuration types.
//!
//! `EngineConfig` mirrors `config.toml` in the data directory. Every field has
//! a default so a missing or partial file still yields a usable config.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

/// Top-level configuration for stepflow.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct EngineConfig {
    /// SQLite URL. When unset, `stepflow.db` in the data directory is used.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub database_url: Option<String>,

    #[serde(default)]
    pub validation: ValidationConfig,

    #[serde(default)]
    pub resilience: ResilienceConfig,

    #[serde(default)]
    pub queue: QueueConfig,

    #[serde(default)]
    pub worker: WorkerConfig,
}

// ---------------------------------------------------------------------------
// Validation
// ---------------------------------------------------------------------------

/// How a reference to an `outputAs` defined by no step is treated.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ReferencePolicy {
    #[default]
    Error,
    Warning,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ValidationConfig {
    #[serde(default)]
    pub unknown_reference: ReferencePolicy,
}

// ---------------------------------------------------------------------------
// Resilience
// ---------------------------------------------------------------------------

/// Rate limit and circuit breaker settings for one module category.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GuardConfig {
    /// Token reservoir capacity (C).
    pub capacity: u32,
    /// Tokens added per refill (R).
    pub refill_amount: u32,
    /// Refill interval in milliseconds (I).
    pub refill_interval_ms: u64,
    /// Maximum in-flight calls (K).
    pub max_concurrent: u32,
    /// Consecutive failures that open the circuit (F).
    pub failure_threshold: u32,
    /// How long the circuit stays open before a trial call (T).
    pub cooldown_ms: u64,
    /// Per-call timeout unless a step overrides it.
    pub call_timeout_ms: u64,
}

impl Default for GuardConfig {
    fn default() -> Self {
        Self {
            capacity: 10,
            refill_amount: 10,
            refill_interval_ms: 1_000,
            max_concurrent: 5,
            failure_threshold: 5,
            cooldown_ms: 30_000,
            call_timeout_ms: 30_000,
        }
    }
}

/// Partial guard settings; unset fields fall back to the defaults.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct GuardOverride {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub capacity: Option<u32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub refill_amount: Option<u32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub refill_interval_ms: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub max_concurrent: Option<u32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub failure_threshold: Option<u32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub cooldown_ms: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub call_timeout_ms: Option<u64>,
}

impl GuardOverride {
    /// Apply this override on top of `base`.
    pub fn apply(&self, base: &GuardConfig) -> GuardConfig {
        GuardConfig {
            capacity: self.capacity.unwrap_or(base.capacity),
            refill_amount: self.refill_amount.unwrap_or(base.refill_amount),
            refill_interval_ms: self.refill_interval_ms.unwrap_or(base.refill_interval_ms),
            max_concurrent: self.max_concurrent.unwrap_or(base.max_concurrent),
            failure_threshold: self.failure_threshold.unwrap_or(base.failure_threshold),
            cooldown_ms: self.cooldown_ms.unwrap_or(base.cooldown_ms),
            call_timeout_ms: self.call_timeout_ms.unwrap_or(base.call_timeout_ms),
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ResilienceConfig {
    #[serde(default)]
    pub defaults: GuardConfig,

    /// Per-category overrides keyed by module category.
    #[serde(default)]
    pub categories: BTreeMap<String, GuardOverride>,
}

impl ResilienceConfig {
    /// Effective guard settings for `category`.
    pub fn for_category(&self, category: &str) -> GuardConfig {
        match self.categories.get(category) {
            Some(over) => over.apply(&self.defaults),
            None => self.defaults.clone(),
        }
    }
}

// ---------------------------------------------------------------------------
// Queue / worker
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct QueueConfig {
    /// When false, submissions always execute inline.
    pub enabled: bool,
    pub max_attempts: u32,
    pub initial_backoff_ms: u64,
    pub max_backoff_ms: u64,
    pub backoff_multiplier: f64,
    pub poll_interval_ms: u64,
    /// Claims older than this are treated as abandoned.
    pub lease_secs: u64,
}

impl Default for QueueConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            max_attempts: 3,
            initial_backoff_ms: 1_000,
            max_backoff_ms: 60_000,
            backoff_multiplier: 2.0,
            poll_interval_ms: 500,
            lease_secs: 600,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct WorkerConfig {
    /// Number of concurrent worker loops.
    pub concurrency: usize,
}

impl Default for WorkerConfig {
    fn default() -> Self {
        Self { concurrency: 4 }
    }
}
