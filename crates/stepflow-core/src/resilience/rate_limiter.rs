//! Token reservoir with a hard concurrency cap.
//!
//! Capacity C refilled by R every interval I, computed lazily from elapsed
//! time and never above C, plus at most K calls in flight. Callers that
//! cannot proceed wait; they never fail. Waiters are served in arrival order:
//! the gate is a fair tokio mutex held while a caller waits for its slot and
//! token, and the slot semaphore is itself FIFO.

use std::sync::{Arc, Mutex};
use std::time::Duration;

use tokio::sync::{AcquireError, OwnedSemaphorePermit, Semaphore};
use tokio::time::Instant;

use stepflow_types::config::GuardConfig;

#[derive(Debug)]
struct Reservoir {
    tokens: u32,
    last_refill: Instant,
}

/// Per-category rate limiter.
#[derive(Debug)]
pub struct RateLimiter {
    name: String,
    gate: tokio::sync::Mutex<()>,
    reservoir: Mutex<Reservoir>,
    slots: Arc<Semaphore>,
    capacity: u32,
    refill_amount: u32,
    refill_interval: Duration,
    max_concurrent: u32,
}

/// Held for the duration of a call; frees the concurrency slot on drop.
#[derive(Debug)]
pub struct RatePermit {
    _slot: OwnedSemaphorePermit,
}

impl RateLimiter {
    /// Create a limiter with a full reservoir. Zero values are raised to 1.
    pub fn new(name: impl Into<String>, config: &GuardConfig) -> Self {
        let capacity = config.capacity.max(1);
        let max_concurrent = config.max_concurrent.max(1);
        Self {
            name: name.into(),
            gate: tokio::sync::Mutex::new(()),
            reservoir: Mutex::new(Reservoir {
                tokens: capacity,
                last_refill: Instant::now(),
            }),
            slots: Arc::new(Semaphore::new(max_concurrent as usize)),
            capacity,
            refill_amount: config.refill_amount.max(1),
            refill_interval: Duration::from_millis(config.refill_interval_ms.max(1)),
            max_concurrent,
        }
    }

    /// Wait for a concurrency slot and a token.
    ///
    /// Only fails if the slot semaphore has been closed.
    pub async fn acquire(&self) -> Result<RatePermit, AcquireError> {
        let _turn = self.gate.lock().await;

        if self.slots.available_permits() == 0 {
            tracing::debug!(category = %self.name, "concurrency cap reached, waiting for a slot");
        }
        let slot = Arc::clone(&self.slots).acquire_owned().await?;

        loop {
            let wait = self.try_take_token(Instant::now());
            match wait {
                None => break,
                Some(wait) => {
                    tracing::debug!(
                        category = %self.name,
                        wait_ms = wait.as_millis() as u64,
                        "rate limit reached, waiting for refill"
                    );
                    tokio::time::sleep(wait).await;
                }
            }
        }

        Ok(RatePermit { _slot: slot })
    }

    /// Take a token if one is available, else report how long until the
    /// next refill.
    fn try_take_token(&self, now: Instant) -> Option<Duration> {
        let mut reservoir = self.reservoir.lock().unwrap_or_else(|e| e.into_inner());
        self.refill(&mut reservoir, now);
        if reservoir.tokens > 0 {
            reservoir.tokens -= 1;
            return None;
        }
        let next = reservoir.last_refill + self.refill_interval;
        Some(next.saturating_duration_since(now).max(Duration::from_millis(1)))
    }

    fn refill(&self, reservoir: &mut Reservoir, now: Instant) {
        let elapsed = now.saturating_duration_since(reservoir.last_refill);
        let intervals = (elapsed.as_nanos() / self.refill_interval.as_nanos()) as u64;
        if intervals == 0 {
            return;
        }
        let added = intervals.saturating_mul(self.refill_amount as u64);
        reservoir.tokens = (reservoir.tokens as u64 + added).min(self.capacity as u64) as u32;
        // Whole intervals only, so partial progress carries over. A gap too
        // long to represent restarts the clock at `now`.
        reservoir.last_refill = u32::try_from(intervals)
            .ok()
            .and_then(|n| self.refill_interval.checked_mul(n))
            .and_then(|step| reservoir.last_refill.checked_add(step))
            .unwrap_or(now);
    }

    /// Tokens currently available, after applying any pending refill.
    pub fn available_tokens(&self) -> u32 {
        let mut reservoir = self.reservoir.lock().unwrap_or_else(|e| e.into_inner());
        self.refill(&mut reservoir, Instant::now());
        reservoir.tokens
    }

    /// Calls currently holding a slot.
    pub fn in_flight(&self) -> u32 {
        self.max_concurrent
            .saturating_sub(self.slots.available_permits() as u32)
    }
}
