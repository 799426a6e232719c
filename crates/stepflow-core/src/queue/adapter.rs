//! Trigger submission with inline fallback.
//!
//! `submit` prefers the durable queue. When the backend is unreachable, or
//! no queue is configured, the run executes inline through the same
//! `WorkflowEngine::execute` path a worker would use, so callers get an
//! identical `RunResult` either way.

use std::sync::Arc;

use uuid::Uuid;

use stepflow_types::config::QueueConfig;
use stepflow_types::error::RepositoryError;
use stepflow_types::queue::{NewJob, SubmissionReceipt, TriggerSubmission};
use stepflow_types::workflow::{ErrorKind, RunOutcome, RunResult, WorkflowDefinition, WorkflowRun};

use super::{JobQueue, QueueError};
use crate::repository::{RunStore, WorkflowStore};
use crate::workflow::{EngineError, WorkflowEngine};

#[derive(Debug, thiserror::Error)]
pub enum SubmitError {
    #[error("workflow {0} not found")]
    WorkflowNotFound(Uuid),

    #[error("workflow {workflow_id} does not belong to tenant '{tenant_id}'")]
    TenantMismatch { workflow_id: Uuid, tenant_id: String },

    #[error(transparent)]
    Queue(#[from] QueueError),

    #[error(transparent)]
    Repository(#[from] RepositoryError),

    #[error(transparent)]
    Engine(#[from] EngineError),
}

pub struct QueueAdapter<S: RunStore, W: WorkflowStore, Q: JobQueue> {
    engine: Arc<WorkflowEngine<S>>,
    workflows: Arc<W>,
    queue: Option<Arc<Q>>,
    config: QueueConfig,
}

impl<S, W, Q> QueueAdapter<S, W, Q>
where
    S: RunStore + 'static,
    W: WorkflowStore,
    Q: JobQueue,
{
    /// `queue: None` means every submission runs inline.
    pub fn new(
        engine: Arc<WorkflowEngine<S>>,
        workflows: Arc<W>,
        queue: Option<Arc<Q>>,
        config: QueueConfig,
    ) -> Self {
        Self {
            engine,
            workflows,
            queue,
            config,
        }
    }

    pub fn engine(&self) -> &Arc<WorkflowEngine<S>> {
        &self.engine
    }

    async fn definition_for(
        &self,
        submission: &TriggerSubmission,
    ) -> Result<WorkflowDefinition, SubmitError> {
        let def = self
            .workflows
            .get_definition(&submission.workflow_id)
            .await?
            .ok_or(SubmitError::WorkflowNotFound(submission.workflow_id))?;
        if def.tenant_id != submission.tenant_id {
            return Err(SubmitError::TenantMismatch {
                workflow_id: submission.workflow_id,
                tenant_id: submission.tenant_id.clone(),
            });
        }
        Ok(def)
    }

    async fn create_run(&self, submission: &TriggerSubmission) -> Result<WorkflowRun, SubmitError> {
        let def = self.definition_for(submission).await?;
        let run = WorkflowRun::queued(&def, submission.trigger_type, submission.trigger_data.clone());
        self.engine.store().create_run(&run).await?;
        Ok(run)
    }

    /// Queue a run, falling back to inline execution when the queue is
    /// unavailable.
    pub async fn submit(&self, submission: TriggerSubmission) -> Result<SubmissionReceipt, SubmitError> {
        let run = self.create_run(&submission).await?;

        match self.queue.as_ref().filter(|_| self.config.enabled) {
            Some(queue) => {
                let job = NewJob {
                    run_id: run.id,
                    workflow_id: run.workflow_id,
                    tenant_id: run.tenant_id.clone(),
                    trigger_type: run.trigger_type,
                    trigger_data: run.trigger_data.clone(),
                    priority: submission.priority.unwrap_or(0),
                    max_attempts: self.config.max_attempts.max(1),
                };
                match queue.enqueue(&job).await {
                    Ok(queued) => {
                        tracing::info!(
                            run_id = %run.id,
                            job_id = %queued.id,
                            workflow = %run.workflow_name,
                            trigger = %run.trigger_type,
                            "run queued"
                        );
                        return Ok(SubmissionReceipt {
                            job_id: Some(queued.id),
                            run_id: run.id,
                            queued: true,
                            result: None,
                        });
                    }
                    Err(QueueError::Unavailable(reason)) => {
                        tracing::warn!(
                            run_id = %run.id,
                            %reason,
                            "queue unavailable, executing run inline"
                        );
                    }
                    Err(e) => {
                        let outcome = RunOutcome::failed(ErrorKind::Internal, e.to_string(), None);
                        if let Err(finish) = self.engine.store().finish_run(&run.id, &outcome).await {
                            tracing::warn!(run_id = %run.id, error = %finish, "failed to finish unqueued run");
                        }
                        return Err(e.into());
                    }
                }
            }
            None => {
                tracing::debug!(run_id = %run.id, "no durable queue configured, executing inline");
            }
        }

        let result = self.engine.execute(run.id).await?;
        Ok(SubmissionReceipt {
            job_id: None,
            run_id: run.id,
            queued: false,
            result: Some(result),
        })
    }

    /// Execute a run synchronously, bypassing the queue.
    pub async fn execute_inline(&self, submission: TriggerSubmission) -> Result<RunResult, SubmitError> {
        let run = self.create_run(&submission).await?;
        Ok(self.engine.execute(run.id).await?)
    }
}
