//! Durable run queue: the `JobQueue` port, submission adapter, and workers.
//!
//! A submission creates a queued run and enqueues a job pointing at it.
//! Workers claim jobs, execute the run through the same engine path used
//! for inline execution, and decide on whole-run retries.

pub mod adapter;
pub mod backoff;
pub mod memory;
pub mod worker;

use chrono::{DateTime, Utc};
use uuid::Uuid;

use stepflow_types::queue::{JobStatus, NewJob, QueuedJob};

pub use adapter::{QueueAdapter, SubmitError};
pub use backoff::BackoffPolicy;
pub use memory::InMemoryJobQueue;
pub use worker::{spawn_workers, QueueWorker, WorkerError};

#[derive(Debug, thiserror::Error)]
pub enum QueueError {
    /// The backend cannot be reached; submitters fall back to inline execution.
    #[error("queue unavailable: {0}")]
    Unavailable(String),

    #[error("job {0} not found")]
    NotFound(Uuid),

    #[error("queue backend error: {0}")]
    Backend(String),
}

/// Where a rescheduled job goes next.
#[derive(Debug, Clone, Copy)]
pub struct Retry<'a> {
    pub run_id: Uuid,
    pub attempt: u32,
    pub available_at: DateTime<Utc>,
    pub error: &'a str,
}

/// Storage port for queued jobs.
///
/// Uses RPITIT (return-position `impl Trait` in traits) for async methods.
pub trait JobQueue: Send + Sync {
    fn enqueue(
        &self,
        job: &NewJob,
    ) -> impl std::future::Future<Output = Result<QueuedJob, QueueError>> + Send;

    /// Claim the next available job: highest priority first, FIFO within a
    /// priority, only jobs whose `available_at` has passed.
    fn claim_next(
        &self,
        worker_id: &str,
    ) -> impl std::future::Future<Output = Result<Option<QueuedJob>, QueueError>> + Send;

    /// Mark a claimed job done (its run reached a final outcome).
    ///
    /// This and the other settle operations apply only while the job is
    /// still `running` and pointing at `held_run`, the run its claimant
    /// executed. They return `false` when the claim was lost (recovered or
    /// settled elsewhere) and `NotFound` for an unknown job.
    fn complete(
        &self,
        job_id: &Uuid,
        held_run: &Uuid,
    ) -> impl std::future::Future<Output = Result<bool, QueueError>> + Send;

    /// Point the job at a retry run and make it available again later.
    fn reschedule(
        &self,
        job_id: &Uuid,
        held_run: &Uuid,
        retry: &Retry<'_>,
    ) -> impl std::future::Future<Output = Result<bool, QueueError>> + Send;

    /// Fail the job permanently.
    fn bury(
        &self,
        job_id: &Uuid,
        held_run: &Uuid,
        error: &str,
    ) -> impl std::future::Future<Output = Result<bool, QueueError>> + Send;

    fn cancel(
        &self,
        job_id: &Uuid,
        held_run: &Uuid,
    ) -> impl std::future::Future<Output = Result<bool, QueueError>> + Send;

    fn get(
        &self,
        job_id: &Uuid,
    ) -> impl std::future::Future<Output = Result<Option<QueuedJob>, QueueError>> + Send;

    /// Jobs newest first, optionally filtered by status.
    fn list(
        &self,
        status: Option<JobStatus>,
        limit: u32,
    ) -> impl std::future::Future<Output = Result<Vec<QueuedJob>, QueueError>> + Send;

    /// Running jobs claimed before `older_than`.
    fn list_abandoned(
        &self,
        older_than: DateTime<Utc>,
    ) -> impl std::future::Future<Output = Result<Vec<QueuedJob>, QueueError>> + Send;
}
