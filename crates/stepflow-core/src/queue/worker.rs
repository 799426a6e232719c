//! Queue workers: claim jobs, execute their run, decide on retries.

use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;

use stepflow_types::config::QueueConfig;
use stepflow_types::error::RepositoryError;
use stepflow_types::queue::{JobStatus, QueuedJob};
use stepflow_types::workflow::{
    ErrorKind, RunOutcome, RunResult, RunStatus, StepStatus, WorkflowRun,
};

use super::backoff::BackoffPolicy;
use super::{JobQueue, QueueError, Retry};
use crate::repository::RunStore;
use crate::workflow::{EngineError, WorkflowEngine};

#[derive(Debug, thiserror::Error)]
pub enum WorkerError {
    #[error(transparent)]
    Queue(#[from] QueueError),

    #[error(transparent)]
    Repository(#[from] RepositoryError),

    #[error(transparent)]
    Engine(#[from] EngineError),
}

const ABANDONED: &str = "abandoned by worker";

pub struct QueueWorker<S: RunStore, Q: JobQueue> {
    engine: Arc<WorkflowEngine<S>>,
    queue: Arc<Q>,
    config: QueueConfig,
    backoff: BackoffPolicy,
    worker_id: String,
}

impl<S, Q> QueueWorker<S, Q>
where
    S: RunStore + 'static,
    Q: JobQueue + 'static,
{
    pub fn new(
        engine: Arc<WorkflowEngine<S>>,
        queue: Arc<Q>,
        config: QueueConfig,
        worker_id: impl Into<String>,
    ) -> Self {
        Self {
            engine,
            queue,
            backoff: BackoffPolicy::from_config(&config),
            config,
            worker_id: worker_id.into(),
        }
    }

    pub fn worker_id(&self) -> &str {
        &self.worker_id
    }

    /// Poll until `shutdown` fires. A job in progress finishes first.
    pub async fn run(&self, shutdown: CancellationToken) {
        let poll = Duration::from_millis(self.config.poll_interval_ms.max(10));
        tracing::info!(worker = %self.worker_id, "worker started");

        loop {
            if shutdown.is_cancelled() {
                break;
            }
            let idle = match self.process_next().await {
                Ok(processed) => !processed,
                Err(e) => {
                    tracing::warn!(worker = %self.worker_id, error = %e, "worker iteration failed");
                    true
                }
            };
            if idle {
                tokio::select! {
                    _ = shutdown.cancelled() => break,
                    _ = tokio::time::sleep(poll) => {}
                }
            }
        }

        tracing::info!(worker = %self.worker_id, "worker stopped");
    }

    /// Claim and process one job. Returns `false` when nothing was available.
    pub async fn process_next(&self) -> Result<bool, WorkerError> {
        let Some(job) = self.queue.claim_next(&self.worker_id).await? else {
            return Ok(false);
        };
        tracing::debug!(
            worker = %self.worker_id,
            job_id = %job.id,
            run_id = %job.run_id,
            attempt = job.attempt,
            "job claimed"
        );

        let Some(run) = self.engine.store().get_run(&job.run_id).await? else {
            tracing::warn!(job_id = %job.id, run_id = %job.run_id, "job points at a missing run");
            self.queue.bury(&job.id, &job.run_id, "run not found").await?;
            return Ok(true);
        };

        let result = if run.status.is_terminal() {
            // Cancelled (or otherwise finished) while waiting in the queue.
            run.result()
        } else {
            match self.engine.execute(run.id).await {
                Ok(result) => result,
                Err(EngineError::AlreadyFinished { .. } | EngineError::NotQueued { .. }) => {
                    self.current_result(&run).await?
                }
                Err(e) => return Err(e.into()),
            }
        };

        self.settle(&job, &run, &result).await?;
        Ok(true)
    }

    async fn current_result(&self, run: &WorkflowRun) -> Result<RunResult, WorkerError> {
        Ok(self
            .engine
            .store()
            .get_run(&run.id)
            .await?
            .map(|r| r.result())
            .unwrap_or_else(|| run.result()))
    }

    /// Complete, retry, or bury `job` according to its run's result.
    ///
    /// Nothing is settled once the job no longer holds `run`: it was
    /// recovered and handed to another run meanwhile.
    async fn settle(
        &self,
        job: &QueuedJob,
        run: &WorkflowRun,
        result: &RunResult,
    ) -> Result<(), WorkerError> {
        let applied = match result.status {
            RunStatus::Success => self.queue.complete(&job.id, &run.id).await?,
            RunStatus::Cancelled => self.queue.cancel(&job.id, &run.id).await?,
            RunStatus::Error => {
                let error = result.error.clone().unwrap_or_else(|| "run failed".to_string());
                let retryable = result.error_kind.is_some_and(|k| k.is_retryable());

                if retryable && job.has_attempts_left() {
                    if !self.still_holds(job, run).await? {
                        return Ok(());
                    }
                    self.retry(job, run, &error).await?
                } else {
                    let buried = self.queue.bury(&job.id, &run.id, &error).await?;
                    if buried {
                        tracing::warn!(
                            job_id = %job.id,
                            run_id = %run.id,
                            attempt = job.attempt,
                            kind = result.error_kind.map(|k| k.as_str()).unwrap_or("unknown"),
                            "run failed permanently"
                        );
                    }
                    buried
                }
            }
            RunStatus::Queued | RunStatus::Running => {
                tracing::warn!(job_id = %job.id, run_id = %run.id, status = %result.status, "run not finished, leaving job claimed");
                return Ok(());
            }
        };

        if !applied {
            tracing::warn!(job_id = %job.id, run_id = %run.id, "job claim lost, outcome not settled");
        }
        Ok(())
    }

    async fn still_holds(&self, job: &QueuedJob, run: &WorkflowRun) -> Result<bool, WorkerError> {
        Ok(self
            .queue
            .get(&job.id)
            .await?
            .is_some_and(|current| current.status == JobStatus::Running && current.run_id == run.id))
    }

    /// Create the next attempt's run and point the job at it.
    async fn retry(&self, job: &QueuedJob, run: &WorkflowRun, error: &str) -> Result<bool, WorkerError> {
        let mut next = run.next_attempt();
        next.attempt = job.attempt + 1;
        self.engine.store().create_run(&next).await?;

        let delay = self.backoff.delay(job.attempt);
        let retry = Retry {
            run_id: next.id,
            attempt: next.attempt,
            available_at: Utc::now()
                + chrono::Duration::from_std(delay).unwrap_or(chrono::Duration::zero()),
            error,
        };
        if !self.queue.reschedule(&job.id, &run.id, &retry).await? {
            // Lost the claim after creating the run; nothing will pick it up.
            match self.engine.store().finish_run(&next.id, &RunOutcome::cancelled()).await {
                Ok(()) | Err(RepositoryError::Conflict(_)) => {}
                Err(e) => return Err(e.into()),
            }
            return Ok(false);
        }

        tracing::info!(
            job_id = %job.id,
            failed_run = %run.id,
            retry_run = %next.id,
            attempt = next.attempt,
            delay_ms = delay.as_millis() as u64,
            "run failed, retry scheduled"
        );
        Ok(true)
    }

    /// Recover jobs claimed longer than the lease ago: finish their run as
    /// an error and apply the normal retry decision.
    pub async fn recover_abandoned_jobs(&self) -> Result<usize, WorkerError> {
        let lease = chrono::Duration::seconds(self.config.lease_secs as i64);
        let abandoned = self.queue.list_abandoned(Utc::now() - lease).await?;

        for job in &abandoned {
            tracing::warn!(
                job_id = %job.id,
                run_id = %job.run_id,
                claimed_by = job.claimed_by.as_deref().unwrap_or(""),
                "recovering abandoned job"
            );
            let Some(run) = self.engine.store().get_run(&job.run_id).await? else {
                self.queue.bury(&job.id, &job.run_id, "run not found").await?;
                continue;
            };

            if !run.status.is_terminal() {
                let step = run
                    .steps
                    .iter()
                    .find(|s| s.status == StepStatus::Running)
                    .map(|s| s.step_name.clone());
                let outcome = RunOutcome::failed(ErrorKind::Internal, ABANDONED, step);
                match self.engine.store().finish_run(&run.id, &outcome).await {
                    Ok(()) | Err(RepositoryError::Conflict(_)) => {}
                    Err(e) => return Err(e.into()),
                }
            }

            let result = self.current_result(&run).await?;
            self.settle(job, &run, &result).await?;
        }

        Ok(abandoned.len())
    }
}

/// Start `concurrency` worker loops sharing one engine and queue, after
/// recovering abandoned jobs once.
pub async fn spawn_workers<S, Q>(
    engine: Arc<WorkflowEngine<S>>,
    queue: Arc<Q>,
    config: QueueConfig,
    concurrency: usize,
    shutdown: CancellationToken,
) -> Result<JoinSet<()>, WorkerError>
where
    S: RunStore + 'static,
    Q: JobQueue + 'static,
{
    let recovery = QueueWorker::new(Arc::clone(&engine), Arc::clone(&queue), config.clone(), "recovery");
    let recovered = recovery.recover_abandoned_jobs().await?;
    if recovered > 0 {
        tracing::warn!(count = recovered, "recovered abandoned jobs");
    }

    let host = std::process::id();
    let mut set = JoinSet::new();
    for n in 0..concurrency.max(1) {
        let worker = QueueWorker::new(
            Arc::clone(&engine),
            Arc::clone(&queue),
            config.clone(),
            format!("worker-{host}-{n}"),
        );
        let shutdown = shutdown.clone();
        set.spawn(async move { worker.run(shutdown).await });
    }
    Ok(set)
}
