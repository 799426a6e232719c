//! SQLite run store.
//!
//! A run row carries its definition snapshot and terminal outcome; step
//! records live in `workflow_run_steps`, keyed by run and step name and
//! ordered by their index in the definition.

use chrono::{DateTime, Utc};
use sqlx::Row;
use uuid::Uuid;

use stepflow_core::repository::RunStore;
use stepflow_types::error::RepositoryError;
use stepflow_types::workflow::{RunOutcome, RunStatus, StepRecord, TriggerType, WorkflowRun};

use super::pool::DatabasePool;
use super::{
    format_datetime, from_json, from_opt_json, parse_datetime, parse_enum, parse_opt_datetime,
    parse_uuid, query_err, to_json,
};

const TERMINAL: &str = "('success', 'error', 'cancelled')";

/// SQLite-backed implementation of `RunStore`.
pub struct SqliteRunStore {
    pool: DatabasePool,
}

impl SqliteRunStore {
    pub fn new(pool: DatabasePool) -> Self {
        Self { pool }
    }

    async fn exists(&self, run_id: &Uuid) -> Result<bool, RepositoryError> {
        let row = sqlx::query("SELECT 1 FROM workflow_runs WHERE id = ?")
            .bind(run_id.to_string())
            .fetch_optional(&self.pool.writer)
            .await
            .map_err(query_err)?;
        Ok(row.is_some())
    }

    async fn load_steps(&self, run_id: &Uuid) -> Result<Vec<StepRecord>, RepositoryError> {
        let rows = sqlx::query(
            "SELECT * FROM workflow_run_steps WHERE run_id = ? ORDER BY step_index ASC",
        )
        .bind(run_id.to_string())
        .fetch_all(&self.pool.reader)
        .await
        .map_err(query_err)?;

        rows.iter()
            .map(|row| {
                StepRow::from_row(row)
                    .map_err(|e| RepositoryError::Query(e.to_string()))?
                    .into_record()
            })
            .collect()
    }

    async fn load_runs(
        &self,
        rows: Vec<sqlx::sqlite::SqliteRow>,
    ) -> Result<Vec<WorkflowRun>, RepositoryError> {
        let mut runs = Vec::with_capacity(rows.len());
        for row in &rows {
            let mut run = RunRow::from_row(row)
                .map_err(|e| RepositoryError::Query(e.to_string()))?
                .into_run()?;
            run.steps = self.load_steps(&run.id).await?;
            runs.push(run);
        }
        Ok(runs)
    }
}

// ---------------------------------------------------------------------------
// Internal row types
// ---------------------------------------------------------------------------

struct RunRow {
    id: String,
    workflow_id: String,
    tenant_id: String,
    workflow_name: String,
    trigger_type: String,
    trigger_data: String,
    status: String,
    output: Option<String>,
    error: Option<String>,
    error_kind: Option<String>,
    error_step: Option<String>,
    attempt: i64,
    retry_of: Option<String>,
    definition: String,
    cancel_requested: bool,
    queued_at: String,
    started_at: Option<String>,
    completed_at: Option<String>,
}

impl RunRow {
    fn from_row(row: &sqlx::sqlite::SqliteRow) -> Result<Self, sqlx::Error> {
        Ok(Self {
            id: row.try_get("id")?,
            workflow_id: row.try_get("workflow_id")?,
            tenant_id: row.try_get("tenant_id")?,
            workflow_name: row.try_get("workflow_name")?,
            trigger_type: row.try_get("trigger_type")?,
            trigger_data: row.try_get("trigger_data")?,
            status: row.try_get("status")?,
            output: row.try_get("output")?,
            error: row.try_get("error")?,
            error_kind: row.try_get("error_kind")?,
            error_step: row.try_get("error_step")?,
            attempt: row.try_get("attempt")?,
            retry_of: row.try_get("retry_of")?,
            definition: row.try_get("definition")?,
            cancel_requested: row.try_get("cancel_requested")?,
            queued_at: row.try_get("queued_at")?,
            started_at: row.try_get("started_at")?,
            completed_at: row.try_get("completed_at")?,
        })
    }

    fn into_run(self) -> Result<WorkflowRun, RepositoryError> {
        let trigger_type: TriggerType = self
            .trigger_type
            .parse()
            .map_err(RepositoryError::Query)?;

        Ok(WorkflowRun {
            id: parse_uuid(&self.id)?,
            workflow_id: parse_uuid(&self.workflow_id)?,
            tenant_id: self.tenant_id,
            workflow_name: self.workflow_name,
            trigger_type,
            trigger_data: from_json(&self.trigger_data, "trigger data")?,
            status: parse_enum(&self.status, "run status")?,
            steps: Vec::new(),
            output: from_opt_json(self.output.as_deref(), "run output")?,
            error: self.error,
            error_kind: self
                .error_kind
                .as_deref()
                .map(|k| parse_enum(k, "error kind"))
                .transpose()?,
            error_step: self.error_step,
            attempt: self.attempt as u32,
            retry_of: self.retry_of.as_deref().map(parse_uuid).transpose()?,
            definition: from_json(&self.definition, "definition snapshot")?,
            cancel_requested: self.cancel_requested,
            queued_at: parse_datetime(&self.queued_at)?,
            started_at: parse_opt_datetime(self.started_at.as_deref())?,
            completed_at: parse_opt_datetime(self.completed_at.as_deref())?,
        })
    }
}

struct StepRow {
    step_name: String,
    module: String,
    status: String,
    output: Option<String>,
    error: Option<String>,
    error_kind: Option<String>,
    error_details: Option<String>,
    started_at: Option<String>,
    finished_at: Option<String>,
}

impl StepRow {
    fn from_row(row: &sqlx::sqlite::SqliteRow) -> Result<Self, sqlx::Error> {
        Ok(Self {
            step_name: row.try_get("step_name")?,
            module: row.try_get("module")?,
            status: row.try_get("status")?,
            output: row.try_get("output")?,
            error: row.try_get("error")?,
            error_kind: row.try_get("error_kind")?,
            error_details: row.try_get("error_details")?,
            started_at: row.try_get("started_at")?,
            finished_at: row.try_get("finished_at")?,
        })
    }

    fn into_record(self) -> Result<StepRecord, RepositoryError> {
        Ok(StepRecord {
            step_name: self.step_name,
            module: self.module,
            status: parse_enum(&self.status, "step status")?,
            output: from_opt_json(self.output.as_deref(), "step output")?,
            error: self.error,
            error_kind: self
                .error_kind
                .as_deref()
                .map(|k| parse_enum(k, "error kind"))
                .transpose()?,
            error_details: from_opt_json(self.error_details.as_deref(), "error details")?,
            started_at: parse_opt_datetime(self.started_at.as_deref())?,
            finished_at: parse_opt_datetime(self.finished_at.as_deref())?,
        })
    }
}

const UPSERT_STEP: &str = r#"INSERT INTO workflow_run_steps
    (run_id, step_index, step_name, module, status, output, error, error_kind,
     error_details, started_at, finished_at)
    VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)
    ON CONFLICT(run_id, step_name) DO UPDATE SET
      step_index = excluded.step_index,
      module = excluded.module,
      status = excluded.status,
      output = excluded.output,
      error = excluded.error,
      error_kind = excluded.error_kind,
      error_details = excluded.error_details,
      started_at = excluded.started_at,
      finished_at = excluded.finished_at"#;

fn bind_step<'q>(
    query: sqlx::query::Query<'q, sqlx::Sqlite, sqlx::sqlite::SqliteArguments<'q>>,
    run_id: &Uuid,
    index: usize,
    record: &StepRecord,
) -> Result<sqlx::query::Query<'q, sqlx::Sqlite, sqlx::sqlite::SqliteArguments<'q>>, RepositoryError> {
    Ok(query
        .bind(run_id.to_string())
        .bind(index as i64)
        .bind(record.step_name.clone())
        .bind(record.module.clone())
        .bind(record.status.as_str())
        .bind(record.output.as_ref().map(to_json).transpose()?)
        .bind(record.error.clone())
        .bind(record.error_kind.map(|k| k.as_str()))
        .bind(record.error_details.as_ref().map(to_json).transpose()?)
        .bind(record.started_at.as_ref().map(format_datetime))
        .bind(record.finished_at.as_ref().map(format_datetime)))
}

// ---------------------------------------------------------------------------
// RunStore impl
// ---------------------------------------------------------------------------

impl RunStore for SqliteRunStore {
    async fn create_run(&self, run: &WorkflowRun) -> Result<(), RepositoryError> {
        let mut tx = self.pool.writer.begin().await.map_err(query_err)?;

        sqlx::query(
            r#"INSERT INTO workflow_runs
               (id, workflow_id, tenant_id, workflow_name, trigger_type, trigger_data, status,
                output, error, error_kind, error_step, attempt, retry_of, definition,
                cancel_requested, queued_at, started_at, completed_at)
               VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)"#,
        )
        .bind(run.id.to_string())
        .bind(run.workflow_id.to_string())
        .bind(&run.tenant_id)
        .bind(&run.workflow_name)
        .bind(run.trigger_type.as_str())
        .bind(to_json(&run.trigger_data)?)
        .bind(run.status.as_str())
        .bind(run.output.as_ref().map(to_json).transpose()?)
        .bind(&run.error)
        .bind(run.error_kind.map(|k| k.as_str()))
        .bind(&run.error_step)
        .bind(run.attempt as i64)
        .bind(run.retry_of.map(|id| id.to_string()))
        .bind(to_json(&run.definition)?)
        .bind(run.cancel_requested)
        .bind(format_datetime(&run.queued_at))
        .bind(run.started_at.as_ref().map(format_datetime))
        .bind(run.completed_at.as_ref().map(format_datetime))
        .execute(&mut *tx)
        .await
        .map_err(|e| match e {
            sqlx::Error::Database(db) if db.is_unique_violation() => {
                RepositoryError::Conflict(format!("run {} already exists", run.id))
            }
            other => query_err(other),
        })?;

        for (index, record) in run.steps.iter().enumerate() {
            bind_step(sqlx::query(UPSERT_STEP), &run.id, index, record)?
                .execute(&mut *tx)
                .await
                .map_err(query_err)?;
        }

        tx.commit().await.map_err(query_err)?;
        Ok(())
    }

    async fn mark_running(&self, run_id: &Uuid, at: DateTime<Utc>) -> Result<bool, RepositoryError> {
        let result = sqlx::query(
            "UPDATE workflow_runs SET status = 'running', started_at = ? WHERE id = ? AND status = 'queued'",
        )
        .bind(format_datetime(&at))
        .bind(run_id.to_string())
        .execute(&self.pool.writer)
        .await
        .map_err(query_err)?;

        if result.rows_affected() > 0 {
            return Ok(true);
        }
        if self.exists(run_id).await? {
            Ok(false)
        } else {
            Err(RepositoryError::NotFound)
        }
    }

    async fn record_step(
        &self,
        run_id: &Uuid,
        index: usize,
        record: &StepRecord,
    ) -> Result<(), RepositoryError> {
        let mut tx = self.pool.writer.begin().await.map_err(query_err)?;

        let status: String = sqlx::query("SELECT status FROM workflow_runs WHERE id = ?")
            .bind(run_id.to_string())
            .fetch_optional(&mut *tx)
            .await
            .map_err(query_err)?
            .ok_or(RepositoryError::NotFound)?
            .try_get("status")
            .map_err(query_err)?;
        let status: RunStatus = parse_enum(&status, "run status")?;
        if status.is_terminal() {
            return Err(RepositoryError::Conflict(format!(
                "run {run_id} already finished as {status}"
            )));
        }

        bind_step(sqlx::query(UPSERT_STEP), run_id, index, record)?
            .execute(&mut *tx)
            .await
            .map_err(query_err)?;
        tx.commit().await.map_err(query_err)?;
        Ok(())
    }

    async fn finish_run(&self, run_id: &Uuid, outcome: &RunOutcome) -> Result<(), RepositoryError> {
        let result = sqlx::query(&format!(
            r#"UPDATE workflow_runs
               SET status = ?, output = ?, error = ?, error_kind = ?, error_step = ?, completed_at = ?
               WHERE id = ? AND status NOT IN {TERMINAL}"#
        ))
        .bind(outcome.status.as_str())
        .bind(outcome.output.as_ref().map(to_json).transpose()?)
        .bind(&outcome.error)
        .bind(outcome.error_kind.map(|k| k.as_str()))
        .bind(&outcome.error_step)
        .bind(format_datetime(&outcome.completed_at))
        .bind(run_id.to_string())
        .execute(&self.pool.writer)
        .await
        .map_err(query_err)?;

        if result.rows_affected() > 0 {
            return Ok(());
        }
        if self.exists(run_id).await? {
            Err(RepositoryError::Conflict(format!("run {run_id} already finished")))
        } else {
            Err(RepositoryError::NotFound)
        }
    }

    async fn request_cancel(&self, run_id: &Uuid) -> Result<bool, RepositoryError> {
        let result = sqlx::query(&format!(
            "UPDATE workflow_runs SET cancel_requested = 1 WHERE id = ? AND status NOT IN {TERMINAL}"
        ))
        .bind(run_id.to_string())
        .execute(&self.pool.writer)
        .await
        .map_err(query_err)?;

        if result.rows_affected() > 0 {
            return Ok(true);
        }
        if self.exists(run_id).await? {
            Ok(false)
        } else {
            Err(RepositoryError::NotFound)
        }
    }

    async fn cancel_queued(&self, run_id: &Uuid) -> Result<bool, RepositoryError> {
        let outcome = RunOutcome::cancelled();
        let result = sqlx::query(
            r#"UPDATE workflow_runs
               SET status = ?, error = ?, error_kind = ?, cancel_requested = 1, completed_at = ?
               WHERE id = ? AND status = 'queued'"#,
        )
        .bind(outcome.status.as_str())
        .bind(&outcome.error)
        .bind(outcome.error_kind.map(|k| k.as_str()))
        .bind(format_datetime(&outcome.completed_at))
        .bind(run_id.to_string())
        .execute(&self.pool.writer)
        .await
        .map_err(query_err)?;

        if result.rows_affected() > 0 {
            return Ok(true);
        }
        if self.exists(run_id).await? {
            Ok(false)
        } else {
            Err(RepositoryError::NotFound)
        }
    }

    async fn is_cancel_requested(&self, run_id: &Uuid) -> Result<bool, RepositoryError> {
        let row = sqlx::query("SELECT cancel_requested FROM workflow_runs WHERE id = ?")
            .bind(run_id.to_string())
            .fetch_optional(&self.pool.reader)
            .await
            .map_err(query_err)?
            .ok_or(RepositoryError::NotFound)?;
        row.try_get::<bool, _>("cancel_requested")
            .map_err(|e| RepositoryError::Query(e.to_string()))
    }

    async fn get_run(&self, run_id: &Uuid) -> Result<Option<WorkflowRun>, RepositoryError> {
        let row = sqlx::query("SELECT * FROM workflow_runs WHERE id = ?")
            .bind(run_id.to_string())
            .fetch_optional(&self.pool.reader)
            .await
            .map_err(query_err)?;

        match row {
            Some(row) => Ok(self.load_runs(vec![row]).await?.pop()),
            None => Ok(None),
        }
    }

    async fn list_runs(&self, workflow_id: &Uuid, limit: u32) -> Result<Vec<WorkflowRun>, RepositoryError> {
        let rows = sqlx::query(
            "SELECT * FROM workflow_runs WHERE workflow_id = ? ORDER BY queued_at DESC, id DESC LIMIT ?",
        )
        .bind(workflow_id.to_string())
        .bind(limit as i64)
        .fetch_all(&self.pool.reader)
        .await
        .map_err(query_err)?;
        self.load_runs(rows).await
    }

    async fn list_tenant_runs(&self, tenant_id: &str, limit: u32) -> Result<Vec<WorkflowRun>, RepositoryError> {
        let rows = sqlx::query(
            "SELECT * FROM workflow_runs WHERE tenant_id = ? ORDER BY queued_at DESC, id DESC LIMIT ?",
        )
        .bind(tenant_id)
        .bind(limit as i64)
        .fetch_all(&self.pool.reader)
        .await
        .map_err(query_err)?;
        self.load_runs(rows).await
    }

    async fn list_stale_runs(&self) -> Result<Vec<WorkflowRun>, RepositoryError> {
        let rows = sqlx::query(
            "SELECT * FROM workflow_runs WHERE status = 'running' ORDER BY queued_at DESC, id DESC",
        )
        .fetch_all(&self.pool.reader)
        .await
        .map_err(query_err)?;
        self.load_runs(rows).await
    }
}
