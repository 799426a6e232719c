//! Consecutive-failure circuit breaker with a single half-open trial.

use std::sync::Mutex;
use std::time::{Duration, Instant};

/// Circuit breaker state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CircuitState {
    /// Normal operation. Tracks consecutive failures toward the threshold.
    Closed { consecutive_failures: u32 },
    /// Calls fail fast until `until`.
    Open { until: Instant },
    /// Cooldown elapsed: one trial call decides whether to close or reopen.
    HalfOpen { trial_in_flight: bool },
}

impl CircuitState {
    pub fn label(&self) -> &'static str {
        match self {
            CircuitState::Closed { .. } => "closed",
            CircuitState::Open { .. } => "open",
            CircuitState::HalfOpen { .. } => "half_open",
        }
    }
}

/// Why a call was not admitted.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Rejected {
    /// Time until the next trial may be admitted (zero while a trial runs).
    pub retry_in: Duration,
}

#[derive(Debug)]
pub struct CircuitBreaker {
    name: String,
    state: Mutex<CircuitState>,
    failure_threshold: u32,
    cooldown: Duration,
}

impl CircuitBreaker {
    pub fn new(name: impl Into<String>, failure_threshold: u32, cooldown: Duration) -> Self {
        Self {
            name: name.into(),
            state: Mutex::new(CircuitState::Closed {
                consecutive_failures: 0,
            }),
            failure_threshold: failure_threshold.max(1),
            cooldown,
        }
    }

    pub fn state(&self) -> CircuitState {
        *self.lock()
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, CircuitState> {
        self.state.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Fast check without taking the trial slot.
    ///
    /// Rejects while the cooldown is running or a trial is in flight.
    pub fn check(&self) -> Result<(), Rejected> {
        let now = Instant::now();
        match *self.lock() {
            CircuitState::Open { until } if now < until => Err(Rejected {
                retry_in: until - now,
            }),
            CircuitState::HalfOpen {
                trial_in_flight: true,
            } => Err(Rejected {
                retry_in: Duration::ZERO,
            }),
            _ => Ok(()),
        }
    }

    /// Admit a call. After the cooldown only the first caller becomes the
    /// half-open trial; everyone else is rejected until it settles.
    pub fn admit(&self) -> Result<CallPermit<'_>, Rejected> {
        let now = Instant::now();
        let mut state = self.lock();
        match *state {
            CircuitState::Closed { .. } => Ok(CallPermit::new(self, false)),
            CircuitState::Open { until } if now < until => Err(Rejected {
                retry_in: until - now,
            }),
            CircuitState::Open { .. }
            | CircuitState::HalfOpen {
                trial_in_flight: false,
            } => {
                *state = CircuitState::HalfOpen {
                    trial_in_flight: true,
                };
                tracing::info!(category = %self.name, "circuit half-open, admitting trial call");
                Ok(CallPermit::new(self, true))
            }
            CircuitState::HalfOpen {
                trial_in_flight: true,
            } => Err(Rejected {
                retry_in: Duration::ZERO,
            }),
        }
    }

    fn record_success(&self, trial: bool) {
        let mut state = self.lock();
        match *state {
            CircuitState::Closed { .. } => {
                *state = CircuitState::Closed {
                    consecutive_failures: 0,
                };
            }
            CircuitState::HalfOpen { .. } if trial => {
                tracing::info!(category = %self.name, "trial call succeeded, circuit closed");
                *state = CircuitState::Closed {
                    consecutive_failures: 0,
                };
            }
            // Late outcomes of calls admitted before the circuit opened.
            _ => {}
        }
    }

    fn record_failure(&self, trial: bool) {
        let mut state = self.lock();
        match *state {
            CircuitState::Closed {
                consecutive_failures,
            } => {
                let count = consecutive_failures + 1;
                if count >= self.failure_threshold {
                    tracing::warn!(
                        category = %self.name,
                        failures = count,
                        cooldown_ms = self.cooldown.as_millis() as u64,
                        "circuit opened"
                    );
                    *state = CircuitState::Open {
                        until: Instant::now() + self.cooldown,
                    };
                } else {
                    *state = CircuitState::Closed {
                        consecutive_failures: count,
                    };
                }
            }
            CircuitState::HalfOpen { .. } if trial => {
                tracing::warn!(category = %self.name, "trial call failed, circuit reopened");
                *state = CircuitState::Open {
                    until: Instant::now() + self.cooldown,
                };
            }
            _ => {}
        }
    }
}

/// Admission ticket for one call. Dropping it without an outcome counts as
/// a failure, so an abandoned trial cannot leave the circuit stuck half-open.
#[derive(Debug)]
pub struct CallPermit<'a> {
    breaker: &'a CircuitBreaker,
    trial: bool,
    settled: bool,
}

impl<'a> CallPermit<'a> {
    fn new(breaker: &'a CircuitBreaker, trial: bool) -> Self {
        Self {
            breaker,
            trial,
            settled: false,
        }
    }

    pub fn success(mut self) {
        self.settled = true;
        self.breaker.record_success(self.trial);
    }

    pub fn failure(mut self) {
        self.settled = true;
        self.breaker.record_failure(self.trial);
    }
}

impl Drop for CallPermit<'_> {
    fn drop(&mut self) {
        if !self.settled {
            self.breaker.record_failure(self.trial);
        }
    }
}
