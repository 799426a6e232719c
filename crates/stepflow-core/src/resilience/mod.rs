//! Resilience wrapper for module invocations.
//!
//! - [`rate_limiter`]: token reservoir plus concurrency cap (waits, never fails)
//! - [`circuit_breaker`]: consecutive-failure breaker with one half-open trial
//! - [`guard`]: per-category composition and the [`GuardRegistry`]

pub mod circuit_breaker;
pub mod guard;
pub mod rate_limiter;

pub use circuit_breaker::{CallPermit, CircuitBreaker, CircuitState};
pub use guard::{CategoryGuard, GuardError, GuardRegistry, GuardSnapshot};
pub use rate_limiter::{RateLimiter, RatePermit};
