//! Per-category guard composing the rate limiter and circuit breaker, and
//! the registry that owns one guard per module category.

use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use dashmap::DashMap;
use serde::Serialize;
use serde_json::Value;

use stepflow_types::config::{GuardConfig, ResilienceConfig};

use super::circuit_breaker::CircuitBreaker;
use super::rate_limiter::RateLimiter;
use crate::module::ModuleError;

#[derive(Debug, thiserror::Error)]
pub enum GuardError {
    #[error("circuit open for category '{category}' (retry in {}ms)", .retry_in.as_millis())]
    CircuitOpen { category: String, retry_in: Duration },

    #[error("call in category '{category}' timed out after {}ms", .after.as_millis())]
    Timeout { category: String, after: Duration },

    #[error(transparent)]
    Module(ModuleError),

    #[error("rate limiter for category '{0}' is closed")]
    LimiterClosed(String),
}

/// Rate limiting and circuit breaking for every module in one category.
#[derive(Debug)]
pub struct CategoryGuard {
    category: String,
    config: GuardConfig,
    limiter: RateLimiter,
    breaker: CircuitBreaker,
}

impl CategoryGuard {
    pub fn new(category: impl Into<String>, config: GuardConfig) -> Self {
        let category = category.into();
        Self {
            limiter: RateLimiter::new(category.clone(), &config),
            breaker: CircuitBreaker::new(
                category.clone(),
                config.failure_threshold,
                Duration::from_millis(config.cooldown_ms),
            ),
            category,
            config,
        }
    }

    pub fn category(&self) -> &str {
        &self.category
    }

    pub fn config(&self) -> &GuardConfig {
        &self.config
    }

    /// Run `call` under this guard.
    ///
    /// Order: open-circuit fast fail, limiter permit, breaker admission,
    /// timed call, outcome. `call` is only invoked once admitted. Timeouts
    /// and module errors both count as breaker failures.
    pub async fn call<F, Fut>(
        &self,
        timeout_override: Option<Duration>,
        call: F,
    ) -> Result<Value, GuardError>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<Value, ModuleError>>,
    {
        self.breaker.check().map_err(|r| self.open_error(r.retry_in))?;

        let _permit = self
            .limiter
            .acquire()
            .await
            .map_err(|_| GuardError::LimiterClosed(self.category.clone()))?;

        let admission = self
            .breaker
            .admit()
            .map_err(|r| self.open_error(r.retry_in))?;

        let timeout =
            timeout_override.unwrap_or_else(|| Duration::from_millis(self.config.call_timeout_ms));

        match tokio::time::timeout(timeout, call()).await {
            Ok(Ok(value)) => {
                admission.success();
                Ok(value)
            }
            Ok(Err(err)) => {
                admission.failure();
                Err(GuardError::Module(err))
            }
            Err(_) => {
                admission.failure();
                tracing::warn!(
                    category = %self.category,
                    timeout_ms = timeout.as_millis() as u64,
                    "module call timed out"
                );
                Err(GuardError::Timeout {
                    category: self.category.clone(),
                    after: timeout,
                })
            }
        }
    }

    fn open_error(&self, retry_in: Duration) -> GuardError {
        tracing::debug!(category = %self.category, "circuit open, failing fast");
        GuardError::CircuitOpen {
            category: self.category.clone(),
            retry_in,
        }
    }

    pub fn snapshot(&self) -> GuardSnapshot {
        let state = self.breaker.state();
        GuardSnapshot {
            category: self.category.clone(),
            circuit: state.label().to_string(),
            consecutive_failures: match state {
                super::CircuitState::Closed {
                    consecutive_failures,
                } => consecutive_failures,
                _ => 0,
            },
            available_tokens: self.limiter.available_tokens(),
            in_flight: self.limiter.in_flight(),
        }
    }
}

/// Point-in-time view of one guard.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct GuardSnapshot {
    pub category: String,
    pub circuit: String,
    pub consecutive_failures: u32,
    pub available_tokens: u32,
    pub in_flight: u32,
}

/// One guard per module category, created on first use.
///
/// Shared by every tenant and workflow in the process; constructed once and
/// handed to the engine as `Arc<GuardRegistry>`.
#[derive(Debug)]
pub struct GuardRegistry {
    config: ResilienceConfig,
    guards: DashMap<String, Arc<CategoryGuard>>,
}

impl GuardRegistry {
    pub fn new(config: ResilienceConfig) -> Self {
        Self {
            config,
            guards: DashMap::new(),
        }
    }

    /// The guard for `category`, creating it from config if needed.
    pub fn guard(&self, category: &str) -> Arc<CategoryGuard> {
        if let Some(existing) = self.guards.get(category) {
            return Arc::clone(existing.value());
        }
        let entry = self
            .guards
            .entry(category.to_string())
            .or_insert_with(|| {
                tracing::debug!(category, "creating resilience guard");
                Arc::new(CategoryGuard::new(
                    category,
                    self.config.for_category(category),
                ))
            });
        Arc::clone(entry.value())
    }

    pub fn config(&self) -> &ResilienceConfig {
        &self.config
    }

    /// Snapshots of all guards created so far, sorted by category.
    pub fn snapshot(&self) -> Vec<GuardSnapshot> {
        let mut snaps: Vec<GuardSnapshot> =
            self.guards.iter().map(|g| g.value().snapshot()).collect();
        snaps.sort_by(|a, b| a.category.cmp(&b.category));
        snaps
    }
}

impl Default for GuardRegistry {
    fn default() -> Self {
        Self::new(ResilienceConfig::default())
    }
}
