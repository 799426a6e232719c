//! Run progress events.
//!
//! The engine publishes a [`WorkflowEvent`] for every run and step
//! transition on an [`EventBus`]; the CLI subscribes to follow a run live.

pub mod bus;

use serde::Serialize;
use uuid::Uuid;

use stepflow_types::workflow::{ErrorKind, RunStatus};

pub use bus::EventBus;

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "event", rename_all = "snake_case")]
pub enum WorkflowEvent {
    RunStarted {
        run_id: Uuid,
        workflow: String,
        attempt: u32,
    },
    RunFinished {
        run_id: Uuid,
        status: RunStatus,
        error_step: Option<String>,
    },
    StepStarted {
        run_id: Uuid,
        step: String,
        module: String,
    },
    StepSucceeded {
        run_id: Uuid,
        step: String,
        duration_ms: u64,
    },
    StepFailed {
        run_id: Uuid,
        step: String,
        kind: ErrorKind,
        error: String,
    },
    StepSkipped {
        run_id: Uuid,
        step: String,
    },
}

impl WorkflowEvent {
    pub fn run_id(&self) -> Uuid {
        match self {
            WorkflowEvent::RunStarted { run_id, .. }
            | WorkflowEvent::RunFinished { run_id, .. }
            | WorkflowEvent::StepStarted { run_id, .. }
            | WorkflowEvent::StepSucceeded { run_id, .. }
            | WorkflowEvent::StepFailed { run_id, .. }
            | WorkflowEvent::StepSkipped { run_id, .. } => *run_id,
        }
    }
}
