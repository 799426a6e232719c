//! Trigger submission and durable job types.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use uuid::Uuid;

use crate::workflow::{RunResult, TriggerType};

/// A request to start a workflow run.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TriggerSubmission {
    pub workflow_id: Uuid,
    pub tenant_id: String,
    pub trigger_type: TriggerType,
    #[serde(default = "empty_object")]
    pub trigger_data: Value,
    /// Higher values are claimed first. Defaults to 0.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub priority: Option<i32>,
}

fn empty_object() -> Value {
    Value::Object(serde_json::Map::new())
}

impl TriggerSubmission {
    pub fn new(workflow_id: Uuid, tenant_id: impl Into<String>, trigger_type: TriggerType) -> Self {
        Self {
            workflow_id,
            tenant_id: tenant_id.into(),
            trigger_type,
            trigger_data: empty_object(),
            priority: None,
        }
    }

    pub fn with_data(mut self, data: Value) -> Self {
        self.trigger_data = data;
        self
    }

    pub fn with_priority(mut self, priority: i32) -> Self {
        self.priority = Some(priority);
        self
    }
}

/// What the caller gets back from a submission.
///
/// `queued: true` carries the durable `job_id`; `queued: false` means the run
/// executed inline and `result` holds its outcome.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SubmissionReceipt {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub job_id: Option<Uuid>,
    pub run_id: Uuid,
    pub queued: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub result: Option<RunResult>,
}

/// Lifecycle of a durable job.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum JobStatus {
    Pending,
    Running,
    Succeeded,
    Failed,
    Cancelled,
}

impl JobStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            JobStatus::Pending => "pending",
            JobStatus::Running => "running",
            JobStatus::Succeeded => "succeeded",
            JobStatus::Failed => "failed",
            JobStatus::Cancelled => "cancelled",
        }
    }
}

impl std::fmt::Display for JobStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for JobStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "pending" => Ok(JobStatus::Pending),
            "running" => Ok(JobStatus::Running),
            "succeeded" => Ok(JobStatus::Succeeded),
            "failed" => Ok(JobStatus::Failed),
            "cancelled" => Ok(JobStatus::Cancelled),
            other => Err(format!("unknown job status '{other}'")),
        }
    }
}

/// A job to be inserted into the queue.
#[derive(Debug, Clone)]
pub struct NewJob {
    pub run_id: Uuid,
    pub workflow_id: Uuid,
    pub tenant_id: String,
    pub trigger_type: TriggerType,
    pub trigger_data: Value,
    pub priority: i32,
    pub max_attempts: u32,
}

/// A job as stored in the durable queue.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct QueuedJob {
    pub id: Uuid,
    /// Run executed by the current attempt.
    pub run_id: Uuid,
    pub workflow_id: Uuid,
    pub tenant_id: String,
    pub trigger_type: TriggerType,
    pub trigger_data: Value,
    pub priority: i32,
    /// 1-based attempt currently scheduled.
    pub attempt: u32,
    pub max_attempts: u32,
    pub status: JobStatus,
    pub available_at: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub claimed_at: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub claimed_by: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_error: Option<String>,
    pub created_at: DateTime<Utc>,
}

impl QueuedJob {
    /// Build the stored form of a new job, available immediately.
    pub fn from_new(job: &NewJob) -> Self {
        let now = Utc::now();
        Self {
            id: Uuid::now_v7(),
            run_id: job.run_id,
            workflow_id: job.workflow_id,
            tenant_id: job.tenant_id.clone(),
            trigger_type: job.trigger_type,
            trigger_data: job.trigger_data.clone(),
            priority: job.priority,
            attempt: 1,
            max_attempts: job.max_attempts,
            status: JobStatus::Pending,
            available_at: now,
            claimed_at: None,
            claimed_by: None,
            last_error: None,
            created_at: now,
        }
    }

    pub fn has_attempts_left(&self) -> bool {
        self.attempt < self.max_attempts
    }
}
