//! SQLite-backed durable job queue.
//!
//! Claims go through the single-connection writer pool as one
//! `UPDATE ... RETURNING` statement, so two workers never claim the same job.

use chrono::{DateTime, Utc};
use sqlx::Row;
use uuid::Uuid;

use stepflow_core::queue::{JobQueue, QueueError, Retry};
use stepflow_types::queue::{JobStatus, NewJob, QueuedJob};
use stepflow_types::workflow::TriggerType;

use super::pool::DatabasePool;
use super::{format_datetime, parse_datetime, parse_opt_datetime, parse_uuid};

pub struct SqliteJobQueue {
    pool: DatabasePool,
}

impl SqliteJobQueue {
    pub fn new(pool: DatabasePool) -> Self {
        Self { pool }
    }

    async fn finish(&self, job_id: &Uuid, held_run: &Uuid, status: JobStatus) -> Result<bool, QueueError> {
        let result = sqlx::query(
            "UPDATE queue_jobs SET status = ? WHERE id = ? AND run_id = ? AND status = 'running'",
        )
        .bind(status.as_str())
        .bind(job_id.to_string())
        .bind(held_run.to_string())
        .execute(&self.pool.writer)
        .await
        .map_err(queue_err)?;
        self.settled(result.rows_affected(), job_id).await
    }

    /// `true` if a conditional settle touched the row; otherwise tell a lost
    /// claim (`false`) from an unknown job.
    async fn settled(&self, rows_affected: u64, job_id: &Uuid) -> Result<bool, QueueError> {
        if rows_affected > 0 {
            return Ok(true);
        }
        let exists = sqlx::query("SELECT 1 FROM queue_jobs WHERE id = ?")
            .bind(job_id.to_string())
            .fetch_optional(&self.pool.writer)
            .await
            .map_err(queue_err)?
            .is_some();
        if exists {
            Ok(false)
        } else {
            Err(QueueError::NotFound(*job_id))
        }
    }
}

fn queue_err(e: sqlx::Error) -> QueueError {
    match e {
        sqlx::Error::PoolClosed | sqlx::Error::PoolTimedOut | sqlx::Error::Io(_) => {
            QueueError::Unavailable(e.to_string())
        }
        other => QueueError::Backend(other.to_string()),
    }
}

// ---------------------------------------------------------------------------
// Internal row type
// ---------------------------------------------------------------------------

struct JobRow {
    id: String,
    run_id: String,
    workflow_id: String,
    tenant_id: String,
    trigger_type: String,
    trigger_data: String,
    priority: i64,
    attempt: i64,
    max_attempts: i64,
    status: String,
    available_at: String,
    claimed_at: Option<String>,
    claimed_by: Option<String>,
    last_error: Option<String>,
    created_at: String,
}

impl JobRow {
    fn from_row(row: &sqlx::sqlite::SqliteRow) -> Result<Self, sqlx::Error> {
        Ok(Self {
            id: row.try_get("id")?,
            run_id: row.try_get("run_id")?,
            workflow_id: row.try_get("workflow_id")?,
            tenant_id: row.try_get("tenant_id")?,
            trigger_type: row.try_get("trigger_type")?,
            trigger_data: row.try_get("trigger_data")?,
            priority: row.try_get("priority")?,
            attempt: row.try_get("attempt")?,
            max_attempts: row.try_get("max_attempts")?,
            status: row.try_get("status")?,
            available_at: row.try_get("available_at")?,
            claimed_at: row.try_get("claimed_at")?,
            claimed_by: row.try_get("claimed_by")?,
            last_error: row.try_get("last_error")?,
            created_at: row.try_get("created_at")?,
        })
    }

    fn into_job(self) -> Result<QueuedJob, QueueError> {
        let backend = |e: stepflow_types::error::RepositoryError| QueueError::Backend(e.to_string());
        Ok(QueuedJob {
            id: parse_uuid(&self.id).map_err(backend)?,
            run_id: parse_uuid(&self.run_id).map_err(backend)?,
            workflow_id: parse_uuid(&self.workflow_id).map_err(backend)?,
            tenant_id: self.tenant_id,
            trigger_type: self
                .trigger_type
                .parse::<TriggerType>()
                .map_err(QueueError::Backend)?,
            trigger_data: serde_json::from_str(&self.trigger_data)
                .map_err(|e| QueueError::Backend(format!("invalid trigger data JSON: {e}")))?,
            priority: self.priority as i32,
            attempt: self.attempt as u32,
            max_attempts: self.max_attempts as u32,
            status: self.status.parse::<JobStatus>().map_err(QueueError::Backend)?,
            available_at: parse_datetime(&self.available_at).map_err(backend)?,
            claimed_at: parse_opt_datetime(self.claimed_at.as_deref()).map_err(backend)?,
            claimed_by: self.claimed_by,
            last_error: self.last_error,
            created_at: parse_datetime(&self.created_at).map_err(backend)?,
        })
    }
}

fn decode(row: &sqlx::sqlite::SqliteRow) -> Result<QueuedJob, QueueError> {
    JobRow::from_row(row)
        .map_err(|e| QueueError::Backend(e.to_string()))?
        .into_job()
}

// ---------------------------------------------------------------------------
// JobQueue impl
// ---------------------------------------------------------------------------

impl JobQueue for SqliteJobQueue {
    async fn enqueue(&self, job: &NewJob) -> Result<QueuedJob, QueueError> {
        let queued = QueuedJob::from_new(job);
        let trigger_data = serde_json::to_string(&queued.trigger_data)
            .map_err(|e| QueueError::Backend(format!("serialize trigger data: {e}")))?;

        sqlx::query(
            r#"INSERT INTO queue_jobs
               (id, run_id, workflow_id, tenant_id, trigger_type, trigger_data, priority,
                attempt, max_attempts, status, available_at, created_at)
               VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)"#,
        )
        .bind(queued.id.to_string())
        .bind(queued.run_id.to_string())
        .bind(queued.workflow_id.to_string())
        .bind(&queued.tenant_id)
        .bind(queued.trigger_type.as_str())
        .bind(&trigger_data)
        .bind(queued.priority as i64)
        .bind(queued.attempt as i64)
        .bind(queued.max_attempts as i64)
        .bind(queued.status.as_str())
        .bind(format_datetime(&queued.available_at))
        .bind(format_datetime(&queued.created_at))
        .execute(&self.pool.writer)
        .await
        .map_err(queue_err)?;

        tracing::debug!(job_id = %queued.id, run_id = %queued.run_id, priority = queued.priority, "job enqueued");
        Ok(queued)
    }

    async fn claim_next(&self, worker_id: &str) -> Result<Option<QueuedJob>, QueueError> {
        let now = format_datetime(&Utc::now());
        let row = sqlx::query(
            r#"UPDATE queue_jobs
               SET status = 'running', claimed_at = ?, claimed_by = ?
               WHERE id = (
                 SELECT id FROM queue_jobs
                 WHERE status = 'pending' AND available_at <= ?
                 ORDER BY priority DESC, created_at ASC, id ASC
                 LIMIT 1
               )
               RETURNING *"#,
        )
        .bind(&now)
        .bind(worker_id)
        .bind(&now)
        .fetch_optional(&self.pool.writer)
        .await
        .map_err(queue_err)?;

        row.as_ref().map(decode).transpose()
    }

    async fn complete(&self, job_id: &Uuid, held_run: &Uuid) -> Result<bool, QueueError> {
        self.finish(job_id, held_run, JobStatus::Succeeded).await
    }

    async fn reschedule(
        &self,
        job_id: &Uuid,
        held_run: &Uuid,
        retry: &Retry<'_>,
    ) -> Result<bool, QueueError> {
        let result = sqlx::query(
            r#"UPDATE queue_jobs
               SET status = 'pending', run_id = ?, attempt = ?, available_at = ?,
                   claimed_at = NULL, claimed_by = NULL, last_error = ?
               WHERE id = ? AND run_id = ? AND status = 'running'"#,
        )
        .bind(retry.run_id.to_string())
        .bind(retry.attempt as i64)
        .bind(format_datetime(&retry.available_at))
        .bind(retry.error)
        .bind(job_id.to_string())
        .bind(held_run.to_string())
        .execute(&self.pool.writer)
        .await
        .map_err(queue_err)?;
        self.settled(result.rows_affected(), job_id).await
    }

    async fn bury(&self, job_id: &Uuid, held_run: &Uuid, error: &str) -> Result<bool, QueueError> {
        let result = sqlx::query(
            r#"UPDATE queue_jobs SET status = 'failed', last_error = ?
               WHERE id = ? AND run_id = ? AND status = 'running'"#,
        )
        .bind(error)
        .bind(job_id.to_string())
        .bind(held_run.to_string())
        .execute(&self.pool.writer)
        .await
        .map_err(queue_err)?;
        self.settled(result.rows_affected(), job_id).await
    }

    async fn cancel(&self, job_id: &Uuid, held_run: &Uuid) -> Result<bool, QueueError> {
        self.finish(job_id, held_run, JobStatus::Cancelled).await
    }

    async fn get(&self, job_id: &Uuid) -> Result<Option<QueuedJob>, QueueError> {
        let row = sqlx::query("SELECT * FROM queue_jobs WHERE id = ?")
            .bind(job_id.to_string())
            .fetch_optional(&self.pool.reader)
            .await
            .map_err(queue_err)?;
        row.as_ref().map(decode).transpose()
    }

    async fn list(&self, status: Option<JobStatus>, limit: u32) -> Result<Vec<QueuedJob>, QueueError> {
        let rows = match status {
            Some(status) => {
                sqlx::query(
                    "SELECT * FROM queue_jobs WHERE status = ? ORDER BY created_at DESC, id DESC LIMIT ?",
                )
                .bind(status.as_str())
                .bind(limit as i64)
                .fetch_all(&self.pool.reader)
                .await
            }
            None => {
                sqlx::query("SELECT * FROM queue_jobs ORDER BY created_at DESC, id DESC LIMIT ?")
                    .bind(limit as i64)
                    .fetch_all(&self.pool.reader)
                    .await
            }
        }
        .map_err(queue_err)?;

        rows.iter().map(decode).collect()
    }

    async fn list_abandoned(&self, older_than: DateTime<Utc>) -> Result<Vec<QueuedJob>, QueueError> {
        let rows = sqlx::query(
            "SELECT * FROM queue_jobs WHERE status = 'running' AND claimed_at < ? ORDER BY claimed_at ASC",
        )
        .bind(format_datetime(&older_than))
        .fetch_all(&self.pool.reader)
        .await
        .map_err(queue_err)?;

        rows.iter().map(decode).collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::sqlite::test_pool;
    use chrono::Duration;
    use serde_json::json;

    fn new_job(priority: i32) -> NewJob {
        NewJob {
            run_id: Uuid::now_v7(),
            workflow_id: Uuid::now_v7(),
            tenant_id: "acme".to_string(),
            trigger_type: TriggerType::Webhook,
            trigger_data: json!({"contactId": "c-1"}),
            priority,
            max_attempts: 3,
        }
    }

    #[tokio::test]
    async fn test_enqueue_and_get() {
        let queue = SqliteJobQueue::new(test_pool().await);
        let job = queue.enqueue(&new_job(0)).await.unwrap();

        let loaded = queue.get(&job.id).await.unwrap().unwrap();
        assert_eq!(loaded.status, JobStatus::Pending);
        assert_eq!(loaded.trigger_type, TriggerType::Webhook);
        assert_eq!(loaded.trigger_data, json!({"contactId": "c-1"}));
        assert_eq!(loaded.attempt, 1);
        assert!(queue.get(&Uuid::now_v7()).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_claim_order_priority_then_fifo() {
        let queue = SqliteJobQueue::new(test_pool().await);
        let low = queue.enqueue(&new_job(0)).await.unwrap();
        let first_high = queue.enqueue(&new_job(5)).await.unwrap();
        let second_high = queue.enqueue(&new_job(5)).await.unwrap();

        let order: Vec<Uuid> = [
            queue.claim_next("w1").await.unwrap().unwrap(),
            queue.claim_next("w1").await.unwrap().unwrap(),
            queue.claim_next("w2").await.unwrap().unwrap(),
        ]
        .iter()
        .map(|j| j.id)
        .collect();
        assert_eq!(order, vec![first_high.id, second_high.id, low.id]);
        assert!(queue.claim_next("w1").await.unwrap().is_none());

        let claimed = queue.get(&low.id).await.unwrap().unwrap();
        assert_eq!(claimed.status, JobStatus::Running);
        assert_eq!(claimed.claimed_by.as_deref(), Some("w2"));
    }

    #[tokio::test]
    async fn test_reschedule_delays_availability() {
        let queue = SqliteJobQueue::new(test_pool().await);
        let job = queue.enqueue(&new_job(0)).await.unwrap();
        queue.claim_next("w1").await.unwrap().unwrap();

        let retry = Retry {
            run_id: Uuid::now_v7(),
            attempt: 2,
            available_at: Utc::now() + Duration::hours(1),
            error: "timeout",
        };
        assert!(queue.reschedule(&job.id, &job.run_id, &retry).await.unwrap());
        assert!(queue.claim_next("w1").await.unwrap().is_none());

        let loaded = queue.get(&job.id).await.unwrap().unwrap();
        assert_eq!(loaded.status, JobStatus::Pending);
        assert_eq!(loaded.run_id, retry.run_id);
        assert_eq!(loaded.attempt, 2);
        assert_eq!(loaded.last_error.as_deref(), Some("timeout"));
        assert!(loaded.claimed_by.is_none());

        // A pending job is not held by anyone.
        let now = Retry {
            available_at: Utc::now() - Duration::seconds(1),
            ..retry
        };
        assert!(!queue.reschedule(&job.id, &retry.run_id, &now).await.unwrap());
        assert!(queue.claim_next("w1").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_terminal_transitions_and_listing() {
        let queue = SqliteJobQueue::new(test_pool().await);
        for _ in 0..3 {
            queue.enqueue(&new_job(0)).await.unwrap();
        }
        let done = queue.claim_next("w1").await.unwrap().unwrap();
        let buried = queue.claim_next("w1").await.unwrap().unwrap();
        let cancelled = queue.claim_next("w1").await.unwrap().unwrap();

        assert!(queue.complete(&done.id, &done.run_id).await.unwrap());
        assert!(queue.bury(&buried.id, &buried.run_id, "bad request").await.unwrap());
        assert!(queue.cancel(&cancelled.id, &cancelled.run_id).await.unwrap());

        let failed = queue.list(Some(JobStatus::Failed), 10).await.unwrap();
        assert_eq!(failed.len(), 1);
        assert_eq!(failed[0].last_error.as_deref(), Some("bad request"));
        assert_eq!(queue.list(None, 10).await.unwrap().len(), 3);
        assert_eq!(queue.list(None, 2).await.unwrap().len(), 2);

        assert!(matches!(
            queue.complete(&Uuid::now_v7(), &Uuid::now_v7()).await,
            Err(QueueError::NotFound(_))
        ));
    }

    #[tokio::test]
    async fn test_settle_after_lost_claim_is_refused() {
        let queue = SqliteJobQueue::new(test_pool().await);
        let job = queue.enqueue(&new_job(0)).await.unwrap();
        queue.claim_next("w1").await.unwrap().unwrap();

        let retry = Retry {
            run_id: Uuid::now_v7(),
            attempt: 2,
            available_at: Utc::now() - Duration::seconds(1),
            error: "abandoned by worker",
        };
        assert!(queue.reschedule(&job.id, &job.run_id, &retry).await.unwrap());

        // The first claimant reports late for the run it executed.
        assert!(!queue.reschedule(&job.id, &job.run_id, &retry).await.unwrap());
        assert!(!queue.bury(&job.id, &job.run_id, "late").await.unwrap());
        queue.claim_next("w2").await.unwrap().unwrap();
        assert!(!queue.complete(&job.id, &job.run_id).await.unwrap());

        let loaded = queue.get(&job.id).await.unwrap().unwrap();
        assert_eq!(loaded.status, JobStatus::Running);
        assert_eq!(loaded.run_id, retry.run_id);
        assert_eq!(loaded.attempt, 2);
        assert_eq!(loaded.claimed_by.as_deref(), Some("w2"));

        assert!(queue.complete(&job.id, &retry.run_id).await.unwrap());
    }

    #[tokio::test]
    async fn test_list_abandoned() {
        let queue = SqliteJobQueue::new(test_pool().await);
        let job = queue.enqueue(&new_job(0)).await.unwrap();
        queue.claim_next("w1").await.unwrap().unwrap();

        let cutoff_past = Utc::now() - Duration::hours(1);
        assert!(queue.list_abandoned(cutoff_past).await.unwrap().is_empty());

        let cutoff_future = Utc::now() + Duration::seconds(1);
        let abandoned = queue.list_abandoned(cutoff_future).await.unwrap();
        assert_eq!(abandoned.len(), 1);
        assert_eq!(abandoned[0].id, job.id);
    }

    #[tokio::test]
    async fn test_closed_pool_reports_unavailable() {
        let pool = test_pool().await;
        let queue = SqliteJobQueue::new(pool.clone());
        pool.close().await;

        let result = queue.enqueue(&new_job(0)).await;
        assert!(matches!(result, Err(QueueError::Unavailable(_))));
    }
}
