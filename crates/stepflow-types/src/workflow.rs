//! Workflow domain types for stepflow.
//!
//! `WorkflowDefinition` is the canonical shape a tenant authors (YAML or JSON)
//! and the engine persists. Execution tracking lives in `WorkflowRun` and its
//! ordered `StepRecord`s; `RunResult` is the query shape returned to callers.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use uuid::Uuid;

/// Tenant used when a definition does not name one.
pub const DEFAULT_TENANT: &str = "default";

// ---------------------------------------------------------------------------
// Workflow Definition
// ---------------------------------------------------------------------------

/// A tenant-owned workflow: a trigger plus an ordered list of steps.
///
/// Runs capture a snapshot of the definition when they are created, so a
/// definition may be edited without affecting runs already in flight.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct WorkflowDefinition {
    /// UUIDv7 assigned when the file does not carry one.
    #[serde(default = "Uuid::now_v7")]
    pub id: Uuid,
    /// Owning tenant.
    #[serde(default = "default_tenant")]
    pub tenant_id: String,
    /// Human-readable workflow name, unique per tenant.
    pub name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
    /// How runs of this workflow are started.
    #[serde(default)]
    pub trigger: TriggerDescriptor,
    /// Ordered step definitions.
    pub steps: Vec<StepDefinition>,
    /// External credentials the modules of this workflow need.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub required_credentials: Vec<String>,
    /// Step whose output becomes the run output. Defaults to the last step
    /// with an `outputAs`.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub output_step: Option<String>,
}

fn default_tenant() -> String {
    DEFAULT_TENANT.to_string()
}

impl WorkflowDefinition {
    /// Find a step by name.
    pub fn step(&self, name: &str) -> Option<&StepDefinition> {
        self.steps.iter().find(|s| s.name == name)
    }
}

/// A single module invocation within a workflow.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StepDefinition {
    /// Step name, unique within the workflow. Reported as `errorStep`.
    pub name: String,
    /// Three-part module path, `category.module.function`.
    pub module: String,
    /// Module input. String values may embed `{{...}}` variable references.
    #[serde(default = "empty_params")]
    pub params: Value,
    /// Name under which the step result is stored for later steps.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub output_as: Option<String>,
    /// Boolean expression; the step is skipped when it evaluates false.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub condition: Option<String>,
    /// Dispatch priority among steps that become ready together (higher first).
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub priority: Option<i32>,
    /// Per-call timeout override in milliseconds.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub timeout_ms: Option<u64>,
}

fn empty_params() -> Value {
    Value::Object(serde_json::Map::new())
}

// ---------------------------------------------------------------------------
// Triggers
// ---------------------------------------------------------------------------

/// How a workflow run was (or can be) started.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TriggerType {
    #[default]
    Manual,
    Cron,
    Webhook,
    Chat,
}

impl TriggerType {
    pub fn as_str(&self) -> &'static str {
        match self {
            TriggerType::Manual => "manual",
            TriggerType::Cron => "cron",
            TriggerType::Webhook => "webhook",
            TriggerType::Chat => "chat",
        }
    }
}

impl std::fmt::Display for TriggerType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for TriggerType {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "manual" => Ok(TriggerType::Manual),
            "cron" => Ok(TriggerType::Cron),
            "webhook" => Ok(TriggerType::Webhook),
            "chat" => Ok(TriggerType::Chat),
            other => Err(format!("unknown trigger type '{other}'")),
        }
    }
}

/// Trigger configuration of a workflow definition.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TriggerDescriptor {
    #[serde(rename = "type")]
    pub trigger_type: TriggerType,
    /// Cron expression or schedule phrase (cron triggers).
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub schedule: Option<String>,
    /// Inbound path (webhook triggers).
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub webhook_path: Option<String>,
}

// ---------------------------------------------------------------------------
// Status enums
// ---------------------------------------------------------------------------

/// Overall status of a workflow run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RunStatus {
    Queued,
    Running,
    Success,
    Error,
    Cancelled,
}

impl RunStatus {
    /// Terminal runs never change outcome again.
    pub fn is_terminal(&self) -> bool {
        matches!(self, RunStatus::Success | RunStatus::Error | RunStatus::Cancelled)
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            RunStatus::Queued => "queued",
            RunStatus::Running => "running",
            RunStatus::Success => "success",
            RunStatus::Error => "error",
            RunStatus::Cancelled => "cancelled",
        }
    }
}

impl std::fmt::Display for RunStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Status of a single step within a run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StepStatus {
    Pending,
    Skipped,
    Running,
    Succeeded,
    Failed,
}

impl StepStatus {
    /// Dependents may proceed once a producer reached one of these states.
    pub fn is_settled(&self) -> bool {
        matches!(self, StepStatus::Succeeded | StepStatus::Skipped)
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            StepStatus::Pending => "pending",
            StepStatus::Skipped => "skipped",
            StepStatus::Running => "running",
            StepStatus::Succeeded => "succeeded",
            StepStatus::Failed => "failed",
        }
    }
}

impl std::fmt::Display for StepStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Classification of a step or run failure.
///
/// Lets operators tell an unhealthy integration (`circuit_open`, `timeout`)
/// apart from a call whose arguments were bad (`module_execution`).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorKind {
    MissingVariable,
    MalformedVariable,
    ModuleExecution,
    CircuitOpen,
    Timeout,
    Condition,
    ModuleNotFound,
    /// The definition snapshot cannot be scheduled (e.g. a dependency cycle).
    InvalidDefinition,
    Cancelled,
    Internal,
}

impl ErrorKind {
    /// Whether a whole-run retry may help.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            ErrorKind::ModuleExecution
                | ErrorKind::CircuitOpen
                | ErrorKind::Timeout
                | ErrorKind::Internal
        )
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            ErrorKind::MissingVariable => "missing_variable",
            ErrorKind::MalformedVariable => "malformed_variable",
            ErrorKind::ModuleExecution => "module_execution",
            ErrorKind::CircuitOpen => "circuit_open",
            ErrorKind::Timeout => "timeout",
            ErrorKind::Condition => "condition",
            ErrorKind::ModuleNotFound => "module_not_found",
            ErrorKind::InvalidDefinition => "invalid_definition",
            ErrorKind::Cancelled => "cancelled",
            ErrorKind::Internal => "internal",
        }
    }
}

impl std::fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

// ---------------------------------------------------------------------------
// Workflow Run
// ---------------------------------------------------------------------------

/// One execution attempt of a workflow definition.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct WorkflowRun {
    pub id: Uuid,
    pub workflow_id: Uuid,
    pub tenant_id: String,
    /// Denormalized for display.
    pub workflow_name: String,
    pub trigger_type: TriggerType,
    pub trigger_data: Value,
    pub status: RunStatus,
    /// Per-step records in definition order.
    #[serde(default)]
    pub steps: Vec<StepRecord>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub output: Option<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error_kind: Option<ErrorKind>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error_step: Option<String>,
    /// 1-based attempt number; retries create a new run with `attempt + 1`.
    pub attempt: u32,
    /// The run this one retries.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub retry_of: Option<Uuid>,
    /// Definition snapshot taken when the run was created.
    pub definition: WorkflowDefinition,
    #[serde(default)]
    pub cancel_requested: bool,
    pub queued_at: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub started_at: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub completed_at: Option<DateTime<Utc>>,
}

impl WorkflowRun {
    /// Build a fresh queued run for `definition`.
    pub fn queued(
        definition: &WorkflowDefinition,
        trigger_type: TriggerType,
        trigger_data: Value,
    ) -> Self {
        Self {
            id: Uuid::now_v7(),
            workflow_id: definition.id,
            tenant_id: definition.tenant_id.clone(),
            workflow_name: definition.name.clone(),
            trigger_type,
            trigger_data,
            status: RunStatus::Queued,
            steps: definition
                .steps
                .iter()
                .map(|s| StepRecord::pending(&s.name, &s.module))
                .collect(),
            output: None,
            error: None,
            error_kind: None,
            error_step: None,
            attempt: 1,
            retry_of: None,
            definition: definition.clone(),
            cancel_requested: false,
            queued_at: Utc::now(),
            started_at: None,
            completed_at: None,
        }
    }

    /// Build the next attempt of this run: same trigger, same snapshot.
    pub fn next_attempt(&self) -> Self {
        let mut next = Self::queued(&self.definition, self.trigger_type, self.trigger_data.clone());
        next.attempt = self.attempt + 1;
        next.retry_of = Some(self.id);
        next
    }

    /// The query shape of this run.
    pub fn result(&self) -> RunResult {
        RunResult {
            run_id: self.id,
            status: self.status,
            output: self.output.clone(),
            error: self.error.clone(),
            error_kind: self.error_kind,
            error_step: self.error_step.clone(),
            started_at: self.started_at,
            completed_at: self.completed_at,
        }
    }
}

/// State of one step within a run.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StepRecord {
    pub step_name: String,
    pub module: String,
    pub status: StepStatus,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub output: Option<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error_kind: Option<ErrorKind>,
    /// Error payload reported by the module itself.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error_details: Option<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub started_at: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub finished_at: Option<DateTime<Utc>>,
}

impl StepRecord {
    pub fn pending(step_name: &str, module: &str) -> Self {
        Self {
            step_name: step_name.to_string(),
            module: module.to_string(),
            status: StepStatus::Pending,
            output: None,
            error: None,
            error_kind: None,
            error_details: None,
            started_at: None,
            finished_at: None,
        }
    }
}

/// Terminal outcome written when a run finishes.
#[derive(Debug, Clone)]
pub struct RunOutcome {
    pub status: RunStatus,
    pub output: Option<Value>,
    pub error: Option<String>,
    pub error_kind: Option<ErrorKind>,
    pub error_step: Option<String>,
    pub completed_at: DateTime<Utc>,
}

impl RunOutcome {
    pub fn cancelled() -> Self {
        Self {
            status: RunStatus::Cancelled,
            output: None,
            error: Some("run cancelled".to_string()),
            error_kind: Some(ErrorKind::Cancelled),
            error_step: None,
            completed_at: Utc::now(),
        }
    }

    pub fn failed(kind: ErrorKind, error: impl Into<String>, step: Option<String>) -> Self {
        Self {
            status: RunStatus::Error,
            output: None,
            error: Some(error.into()),
            error_kind: Some(kind),
            error_step: step,
            completed_at: Utc::now(),
        }
    }
}

/// Result of a run as reported to callers and the run query interface.
///
/// Identical in shape whether the run went through the durable queue or was
/// executed inline.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RunResult {
    pub run_id: Uuid,
    pub status: RunStatus,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub output: Option<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error_kind: Option<ErrorKind>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error_step: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub started_at: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub completed_at: Option<DateTime<Utc>>,
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn sample_definition() -> WorkflowDefinition {
        WorkflowDefinition {
            id: Uuid::now_v7(),
            tenant_id: "acme".to_string(),
            name: "lead-followup".to_string(),
            description: Some("Look up a lead and message them".to_string()),
            trigger: TriggerDescriptor {
                trigger_type: TriggerType::Webhook,
                schedule: None,
                webhook_path: Some("/hooks/lead".to_string()),
            },
            steps: vec![
                StepDefinition {
                    name: "lookup".to_string(),
                    module: "crm.contacts.get".to_string(),
                    params: json!({ "id": "{{input.contactId}}" }),
                    output_as: Some("contact".to_string()),
                    condition: None,
                    priority: None,
                    timeout_ms: None,
                },
                StepDefinition {
                    name: "notify".to_string(),
                    module: "messaging.sms.send".to_string(),
                    params: json!({ "to": "{{contact.phone}}" }),
                    output_as: None,
                    condition: Some("{{contact.optedIn}} == true".to_string()),
                    priority: Some(5),
                    timeout_ms: Some(2_000),
                },
            ],
            required_credentials: vec!["crm".to_string(), "sms".to_string()],
            output_step: None,
        }
    }

    #[test]
    fn test_definition_json_uses_camel_case() {
        let def = sample_definition();
        let value = serde_json::to_value(&def).unwrap();
        assert_eq!(value["tenantId"], "acme");
        assert_eq!(value["trigger"]["type"], "webhook");
        assert_eq!(value["trigger"]["webhookPath"], "/hooks/lead");
        assert_eq!(value["steps"][0]["outputAs"], "contact");
        assert_eq!(value["requiredCredentials"][1], "sms");
        assert!(value.get("outputStep").is_none());
    }

    #[test]
    fn test_definition_defaults_when_fields_absent() {
        let def: WorkflowDefinition = serde_json::from_value(json!({
            "name": "minimal",
            "steps": [{ "name": "a", "module": "core.data.echo" }]
        }))
        .unwrap();
        assert_eq!(def.tenant_id, DEFAULT_TENANT);
        assert_eq!(def.trigger.trigger_type, TriggerType::Manual);
        assert_eq!(def.steps[0].params, json!({}));
        assert!(def.required_credentials.is_empty());
    }

    #[test]
    fn test_definition_yaml_roundtrip() {
        let def = sample_definition();
        let yaml = serde_yaml_ng::to_string(&def).unwrap();
        assert!(yaml.contains("outputAs: contact"));
        let parsed: WorkflowDefinition = serde_yaml_ng::from_str(&yaml).unwrap();
        assert_eq!(parsed, def);
    }

    #[test]
    fn test_run_status_terminal() {
        assert!(!RunStatus::Queued.is_terminal());
        assert!(!RunStatus::Running.is_terminal());
        assert!(RunStatus::Success.is_terminal());
        assert!(RunStatus::Error.is_terminal());
        assert!(RunStatus::Cancelled.is_terminal());
    }

    #[test]
    fn test_error_kind_retryable() {
        assert!(ErrorKind::Timeout.is_retryable());
        assert!(ErrorKind::CircuitOpen.is_retryable());
        assert!(ErrorKind::ModuleExecution.is_retryable());
        assert!(!ErrorKind::MissingVariable.is_retryable());
        assert!(!ErrorKind::Condition.is_retryable());
        assert!(!ErrorKind::Cancelled.is_retryable());
        assert!(!ErrorKind::MalformedVariable.is_retryable());
        assert!(!ErrorKind::InvalidDefinition.is_retryable());
        assert_eq!(
            serde_json::to_value(ErrorKind::InvalidDefinition).unwrap(),
            json!("invalid_definition")
        );
    }

    #[test]
    fn test_queued_run_has_pending_records_in_order() {
        let def = sample_definition();
        let run = WorkflowRun::queued(&def, TriggerType::Manual, json!({ "contactId": 7 }));
        assert_eq!(run.status, RunStatus::Queued);
        assert_eq!(run.attempt, 1);
        let names: Vec<_> = run.steps.iter().map(|s| s.step_name.as_str()).collect();
        assert_eq!(names, vec!["lookup", "notify"]);
        assert!(run.steps.iter().all(|s| s.status == StepStatus::Pending));
    }

    #[test]
    fn test_next_attempt_links_previous_run() {
        let def = sample_definition();
        let first = WorkflowRun::queued(&def, TriggerType::Cron, json!({}));
        let second = first.next_attempt();
        assert_ne!(second.id, first.id);
        assert_eq!(second.attempt, 2);
        assert_eq!(second.retry_of, Some(first.id));
        assert_eq!(second.trigger_type, TriggerType::Cron);
        assert_eq!(second.status, RunStatus::Queued);
    }

    #[test]
    fn test_trigger_type_parse() {
        assert_eq!("chat".parse::<TriggerType>().unwrap(), TriggerType::Chat);
        assert!("email".parse::<TriggerType>().is_err());
    }

    #[test]
    fn test_run_result_serializes_error_step() {
        let def = sample_definition();
        let mut run = WorkflowRun::queued(&def, TriggerType::Manual, json!({}));
        run.status = RunStatus::Error;
        run.error = Some("boom".to_string());
        run.error_kind = Some(ErrorKind::ModuleExecution);
        run.error_step = Some("lookup".to_string());
        let value = serde_json::to_value(run.result()).unwrap();
        assert_eq!(value["status"], "error");
        assert_eq!(value["errorStep"], "lookup");
        assert_eq!(value["errorKind"], "module_execution");
    }
}
