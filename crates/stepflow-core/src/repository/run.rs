//! Run store trait definition.

use chrono::{DateTime, Utc};
use stepflow_types::error::RepositoryError;
use stepflow_types::workflow::{RunOutcome, StepRecord, WorkflowRun};
use uuid::Uuid;

/// Persistence for workflow runs and their step records.
///
/// A run is append-only once terminal: `finish_run` and `record_step` on a
/// terminal run fail with `RepositoryError::Conflict`. Retries create a new run.
///
/// Uses native async fn in traits (Rust 2024 edition, no async_trait macro).
pub trait RunStore: Send + Sync {
    /// Insert a new run with its pending step records.
    fn create_run(
        &self,
        run: &WorkflowRun,
    ) -> impl std::future::Future<Output = Result<(), RepositoryError>> + Send;

    /// Move a run from `queued` to `running`. Returns `false` if the run was
    /// in any other state.
    fn mark_running(
        &self,
        run_id: &Uuid,
        at: DateTime<Utc>,
    ) -> impl std::future::Future<Output = Result<bool, RepositoryError>> + Send;

    /// Upsert the record of the step at definition position `index`.
    /// Fails with `Conflict` once the run is terminal.
    fn record_step(
        &self,
        run_id: &Uuid,
        index: usize,
        record: &StepRecord,
    ) -> impl std::future::Future<Output = Result<(), RepositoryError>> + Send;

    /// Write the terminal outcome of a run.
    fn finish_run(
        &self,
        run_id: &Uuid,
        outcome: &RunOutcome,
    ) -> impl std::future::Future<Output = Result<(), RepositoryError>> + Send;

    /// Flag a run for cancellation. Returns `false` if it is already terminal.
    fn request_cancel(
        &self,
        run_id: &Uuid,
    ) -> impl std::future::Future<Output = Result<bool, RepositoryError>> + Send;

    /// Finish a run as `cancelled` only if it is still `queued`. Returns
    /// `false` if it already started or finished.
    fn cancel_queued(
        &self,
        run_id: &Uuid,
    ) -> impl std::future::Future<Output = Result<bool, RepositoryError>> + Send;

    fn is_cancel_requested(
        &self,
        run_id: &Uuid,
    ) -> impl std::future::Future<Output = Result<bool, RepositoryError>> + Send;

    /// Get a run with its step records in definition order.
    fn get_run(
        &self,
        run_id: &Uuid,
    ) -> impl std::future::Future<Output = Result<Option<WorkflowRun>, RepositoryError>> + Send;

    /// Most recent runs of a workflow, newest first.
    fn list_runs(
        &self,
        workflow_id: &Uuid,
        limit: u32,
    ) -> impl std::future::Future<Output = Result<Vec<WorkflowRun>, RepositoryError>> + Send;

    /// Most recent runs of a tenant, newest first.
    fn list_tenant_runs(
        &self,
        tenant_id: &str,
        limit: u32,
    ) -> impl std::future::Future<Output = Result<Vec<WorkflowRun>, RepositoryError>> + Send;

    /// Runs still marked `running`.
    fn list_stale_runs(
        &self,
    ) -> impl std::future::Future<Output = Result<Vec<WorkflowRun>, RepositoryError>> + Send;
}
