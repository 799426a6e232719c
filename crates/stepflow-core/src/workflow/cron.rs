//! Cron triggers for workflows.
//!
//! Schedules are written as 5- or 6-field cron expressions or as short
//! phrases ("every 5 minutes", "daily", "every day at 09:30"), normalized to
//! 6-field cron. [`CronTrigger`] runs them on `tokio-cron-scheduler` and
//! hands each firing to a callback, which the worker wires to the queue.

use std::collections::HashMap;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use futures_util::future::BoxFuture;
use tokio::sync::RwLock;
use tokio_cron_scheduler::{Job, JobScheduler};
use uuid::Uuid;

#[derive(Debug, thiserror::Error)]
pub enum SchedulerError {
    #[error("scheduler error: {0}")]
    Job(String),

    #[error("invalid schedule: {0}")]
    InvalidSchedule(String),

    #[error("workflow {0} is not scheduled")]
    NotScheduled(Uuid),
}

// ---------------------------------------------------------------------------
// Schedule normalization
// ---------------------------------------------------------------------------

fn invalid(input: &str) -> SchedulerError {
    SchedulerError::InvalidSchedule(format!("unrecognized schedule format: '{input}'"))
}

/// Normalize a schedule to a 6-field cron expression (seconds first).
///
/// Five fields get a `0` seconds field prepended; six fields pass through.
/// Phrases (case-insensitive): `every minute`, `every hour`/`hourly`,
/// `every day`/`daily`, `every day at HH:MM`, `every N seconds|minutes|hours`.
pub fn normalize_schedule(input: &str) -> Result<String, SchedulerError> {
    let trimmed = input.trim();
    match trimmed.split_whitespace().count() {
        5 => return Ok(format!("0 {trimmed}")),
        6 => return Ok(trimmed.to_string()),
        _ => {}
    }

    let lower = trimmed.to_lowercase();
    match lower.as_str() {
        "every minute" => return Ok("0 * * * * *".to_string()),
        "every hour" | "hourly" => return Ok("0 0 * * * *".to_string()),
        "every day" | "daily" => return Ok("0 0 0 * * *".to_string()),
        _ => {}
    }

    let rest = lower.strip_prefix("every ").ok_or_else(|| invalid(trimmed))?;

    if let Some(at) = rest.strip_prefix("day at ") {
        let (hour, minute) = at.split_once(':').ok_or_else(|| invalid(trimmed))?;
        let hour: u32 = hour.trim().parse().map_err(|_| invalid(trimmed))?;
        let minute: u32 = minute.trim().parse().map_err(|_| invalid(trimmed))?;
        if hour >= 24 || minute >= 60 {
            return Err(invalid(trimmed));
        }
        return Ok(format!("0 {minute} {hour} * * *"));
    }

    let words: Vec<&str> = rest.split_whitespace().collect();
    let [count, unit] = words.as_slice() else {
        return Err(invalid(trimmed));
    };
    let n: u32 = count.parse().map_err(|_| invalid(trimmed))?;
    if n == 0 {
        return Err(SchedulerError::InvalidSchedule("interval must be > 0".to_string()));
    }
    match unit.trim_end_matches('s') {
        "second" => Ok(format!("*/{n} * * * * *")),
        "minute" => Ok(format!("0 */{n} * * * *")),
        "hour" => Ok(format!("0 0 */{n} * * *")),
        _ => Err(invalid(trimmed)),
    }
}

/// The next `count` fire times of `schedule` after `after`.
pub fn next_fire_times(
    schedule: &str,
    after: DateTime<Utc>,
    count: usize,
) -> Result<Vec<DateTime<Utc>>, SchedulerError> {
    let expr = normalize_schedule(schedule)?;
    let cron = expr
        .parse::<croner::Cron>()
        .map_err(|e| SchedulerError::InvalidSchedule(e.to_string()))?;
    Ok(cron.iter_after(after).take(count).collect())
}

// ---------------------------------------------------------------------------
// CronTrigger
// ---------------------------------------------------------------------------

/// Invoked with the workflow id and fire time each time a schedule fires.
pub type CronCallback = Arc<dyn Fn(Uuid, DateTime<Utc>) -> BoxFuture<'static, ()> + Send + Sync>;

/// Cron trigger registry on top of `tokio-cron-scheduler`.
pub struct CronTrigger {
    inner: RwLock<Option<JobScheduler>>,
    jobs: RwLock<HashMap<Uuid, Uuid>>,
}

impl CronTrigger {
    /// Create a trigger registry (not yet started).
    pub fn new() -> Self {
        Self {
            inner: RwLock::new(None),
            jobs: RwLock::new(HashMap::new()),
        }
    }

    pub async fn start(&self) -> Result<(), SchedulerError> {
        let scheduler = JobScheduler::new()
            .await
            .map_err(|e| SchedulerError::Job(e.to_string()))?;
        scheduler
            .start()
            .await
            .map_err(|e| SchedulerError::Job(e.to_string()))?;
        *self.inner.write().await = Some(scheduler);
        tracing::info!("cron trigger started");
        Ok(())
    }

    pub async fn stop(&self) -> Result<(), SchedulerError> {
        if let Some(mut scheduler) = self.inner.write().await.take() {
            scheduler
                .shutdown()
                .await
                .map_err(|e| SchedulerError::Job(e.to_string()))?;
            tracing::info!("cron trigger stopped");
        }
        self.jobs.write().await.clear();
        Ok(())
    }

    /// Fire `callback` for `workflow_id` on `schedule`. Replaces any
    /// existing schedule for the workflow.
    pub async fn schedule(
        &self,
        workflow_id: Uuid,
        schedule: &str,
        callback: CronCallback,
    ) -> Result<(), SchedulerError> {
        let expr = normalize_schedule(schedule)?;
        if self.jobs.read().await.contains_key(&workflow_id) {
            self.unschedule(workflow_id).await?;
        }

        let inner = self.inner.read().await;
        let scheduler = inner
            .as_ref()
            .ok_or_else(|| SchedulerError::Job("scheduler not started".to_string()))?;

        let job = Job::new_async(expr.as_str(), move |_job_id, _lock| {
            let cb = Arc::clone(&callback);
            Box::pin(async move {
                let fired_at = Utc::now();
                tracing::debug!(%workflow_id, %fired_at, "cron trigger fired");
                cb(workflow_id, fired_at).await;
            })
        })
        .map_err(|e| SchedulerError::InvalidSchedule(e.to_string()))?;

        let job_id = job.guid();
        scheduler
            .add(job)
            .await
            .map_err(|e| SchedulerError::Job(e.to_string()))?;
        self.jobs.write().await.insert(workflow_id, job_id);

        tracing::info!(%workflow_id, cron = %expr, "workflow scheduled");
        Ok(())
    }

    pub async fn unschedule(&self, workflow_id: Uuid) -> Result<(), SchedulerError> {
        let job_id = self
            .jobs
            .write()
            .await
            .remove(&workflow_id)
            .ok_or(SchedulerError::NotScheduled(workflow_id))?;

        if let Some(scheduler) = self.inner.read().await.as_ref() {
            scheduler
                .remove(&job_id)
                .await
                .map_err(|e| SchedulerError::Job(e.to_string()))?;
        }
        tracing::info!(%workflow_id, "workflow unscheduled");
        Ok(())
    }

    pub async fn scheduled_count(&self) -> usize {
        self.jobs.read().await.len()
    }
}

impl Default for CronTrigger {
    fn default() -> Self {
        Self::new()
    }
}
