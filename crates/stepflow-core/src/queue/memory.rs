//! In-process `JobQueue`, used by tests and when no database is configured.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Mutex, MutexGuard};

use chrono::{DateTime, Utc};
use uuid::Uuid;

use stepflow_types::queue::{JobStatus, NewJob, QueuedJob};

use super::{JobQueue, QueueError, Retry};

#[derive(Debug)]
pub struct InMemoryJobQueue {
    jobs: Mutex<HashMap<Uuid, QueuedJob>>,
    available: AtomicBool,
}

impl InMemoryJobQueue {
    pub fn new() -> Self {
        Self {
            jobs: Mutex::new(HashMap::new()),
            available: AtomicBool::new(true),
        }
    }

    /// Simulate the backend going away (every call fails `Unavailable`).
    pub fn set_available(&self, available: bool) {
        self.available.store(available, Ordering::SeqCst);
    }

    fn jobs(&self) -> Result<MutexGuard<'_, HashMap<Uuid, QueuedJob>>, QueueError> {
        if !self.available.load(Ordering::SeqCst) {
            return Err(QueueError::Unavailable("in-memory queue is offline".to_string()));
        }
        self.jobs
            .lock()
            .map_err(|_| QueueError::Backend("queue lock poisoned".to_string()))
    }

    /// Apply `f` if `job_id` is still claimed for `held_run`.
    fn settle<F>(&self, job_id: &Uuid, held_run: &Uuid, f: F) -> Result<bool, QueueError>
    where
        F: FnOnce(&mut QueuedJob),
    {
        let mut jobs = self.jobs()?;
        let job = jobs.get_mut(job_id).ok_or(QueueError::NotFound(*job_id))?;
        if job.status != JobStatus::Running || job.run_id != *held_run {
            return Ok(false);
        }
        f(job);
        Ok(true)
    }
}

impl Default for InMemoryJobQueue {
    fn default() -> Self {
        Self::new()
    }
}

impl JobQueue for InMemoryJobQueue {
    async fn enqueue(&self, job: &NewJob) -> Result<QueuedJob, QueueError> {
        let queued = QueuedJob::from_new(job);
        self.jobs()?.insert(queued.id, queued.clone());
        Ok(queued)
    }

    async fn claim_next(&self, worker_id: &str) -> Result<Option<QueuedJob>, QueueError> {
        let now = Utc::now();
        let mut jobs = self.jobs()?;
        let next = jobs
            .values()
            .filter(|j| j.status == JobStatus::Pending && j.available_at <= now)
            .min_by(|a, b| {
                b.priority
                    .cmp(&a.priority)
                    .then(a.created_at.cmp(&b.created_at))
                    .then(a.id.cmp(&b.id))
            })
            .map(|j| j.id);

        Ok(next.and_then(|id| jobs.get_mut(&id)).map(|job| {
            job.status = JobStatus::Running;
            job.claimed_at = Some(now);
            job.claimed_by = Some(worker_id.to_string());
            job.clone()
        }))
    }

    async fn complete(&self, job_id: &Uuid, held_run: &Uuid) -> Result<bool, QueueError> {
        self.settle(job_id, held_run, |job| job.status = JobStatus::Succeeded)
    }

    async fn reschedule(
        &self,
        job_id: &Uuid,
        held_run: &Uuid,
        retry: &Retry<'_>,
    ) -> Result<bool, QueueError> {
        self.settle(job_id, held_run, |job| {
            job.status = JobStatus::Pending;
            job.run_id = retry.run_id;
            job.attempt = retry.attempt;
            job.available_at = retry.available_at;
            job.claimed_at = None;
            job.claimed_by = None;
            job.last_error = Some(retry.error.to_string());
        })
    }

    async fn bury(&self, job_id: &Uuid, held_run: &Uuid, error: &str) -> Result<bool, QueueError> {
        self.settle(job_id, held_run, |job| {
            job.status = JobStatus::Failed;
            job.last_error = Some(error.to_string());
        })
    }

    async fn cancel(&self, job_id: &Uuid, held_run: &Uuid) -> Result<bool, QueueError> {
        self.settle(job_id, held_run, |job| job.status = JobStatus::Cancelled)
    }

    async fn get(&self, job_id: &Uuid) -> Result<Option<QueuedJob>, QueueError> {
        Ok(self.jobs()?.get(job_id).cloned())
    }

    async fn list(&self, status: Option<JobStatus>, limit: u32) -> Result<Vec<QueuedJob>, QueueError> {
        let mut jobs: Vec<QueuedJob> = self
            .jobs()?
            .values()
            .filter(|j| status.is_none_or(|s| j.status == s))
            .cloned()
            .collect();
        jobs.sort_by(|a, b| b.created_at.cmp(&a.created_at).then(b.id.cmp(&a.id)));
        jobs.truncate(limit as usize);
        Ok(jobs)
    }

    async fn list_abandoned(&self, older_than: DateTime<Utc>) -> Result<Vec<QueuedJob>, QueueError> {
        Ok(self
            .jobs()?
            .values()
            .filter(|j| {
                j.status == JobStatus::Running && j.claimed_at.is_some_and(|at| at < older_than)
            })
            .cloned()
            .collect())
    }
}
