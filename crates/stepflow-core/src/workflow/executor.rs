//! Workflow engine: dependency-driven parallel step execution.
//!
//! `WorkflowEngine` executes one queued run at a time per call to
//! [`WorkflowEngine::execute`]. Steps become ready when every step they
//! reference has succeeded or been skipped; all ready steps are dispatched
//! together onto a `tokio::JoinSet`, and each completion re-evaluates
//! readiness. Every module call goes through the category guard of the
//! module's category.
//!
//! # Execution flow
//!
//! 1. Mark the run `running` (only from `queued`).
//! 2. Build the dependency graph from the definition snapshot.
//! 3. Dispatch ready steps (priority desc, then definition order): evaluate
//!    the condition, resolve params, spawn the guarded module call.
//! 4. On completion, store the output under `outputAs` and record the step.
//! 5. After the first failure or a cancellation request, dispatch nothing
//!    new and drain in-flight steps.
//! 6. Finish the run and publish the outcome.

use std::cmp::Reverse;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use std::time::{Duration, Instant};

use chrono::Utc;
use dashmap::DashMap;
use futures_util::FutureExt;
use serde_json::Value;
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use stepflow_types::error::RepositoryError;
use stepflow_types::workflow::{
    ErrorKind, RunOutcome, RunResult, RunStatus, StepRecord, StepStatus, TriggerType,
    WorkflowDefinition, WorkflowRun,
};

use crate::event::{EventBus, WorkflowEvent};
use crate::module::{ModuleError, ModuleRegistry};
use crate::repository::RunStore;
use crate::resilience::{GuardError, GuardRegistry};

use super::context::OutputBag;
use super::dag::DependencyGraph;
use super::expression::{ExpressionError, WorkflowEvaluator};
use super::variables::{resolve, VariableError};

// ---------------------------------------------------------------------------
// Errors
// ---------------------------------------------------------------------------

#[derive(Debug, thiserror::Error)]
pub enum EngineError {
    #[error("run {0} not found")]
    RunNotFound(Uuid),

    #[error("run {run_id} already finished as {status}")]
    AlreadyFinished { run_id: Uuid, status: RunStatus },

    #[error("run {run_id} is {status}, only queued runs can be executed")]
    NotQueued { run_id: Uuid, status: RunStatus },

    #[error(transparent)]
    Repository(#[from] RepositoryError),
}

/// Why a single step failed.
#[derive(Debug, thiserror::Error)]
pub enum StepError {
    #[error(transparent)]
    MissingVariable(VariableError),

    #[error(transparent)]
    MalformedVariable(VariableError),

    #[error(transparent)]
    Condition(ExpressionError),

    #[error("circuit open for category '{category}' (retry in {}ms)", .retry_in.as_millis())]
    CircuitOpen { category: String, retry_in: Duration },

    #[error("call in category '{category}' timed out after {}ms", .after.as_millis())]
    Timeout { category: String, after: Duration },

    #[error(transparent)]
    Module(ModuleError),

    #[error("module not found: {0}")]
    ModuleNotFound(String),

    #[error("{0}")]
    Internal(String),
}

impl StepError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            StepError::MissingVariable(_) => ErrorKind::MissingVariable,
            StepError::MalformedVariable(_) => ErrorKind::MalformedVariable,
            StepError::Condition(_) => ErrorKind::Condition,
            StepError::CircuitOpen { .. } => ErrorKind::CircuitOpen,
            StepError::Timeout { .. } => ErrorKind::Timeout,
            StepError::Module(_) => ErrorKind::ModuleExecution,
            StepError::ModuleNotFound(_) => ErrorKind::ModuleNotFound,
            StepError::Internal(_) => ErrorKind::Internal,
        }
    }

    /// Error payload reported by the module, if any.
    pub fn details(&self) -> Option<Value> {
        match self {
            StepError::Module(err) => err.details.clone(),
            _ => None,
        }
    }
}

impl From<VariableError> for StepError {
    fn from(err: VariableError) -> Self {
        match err {
            missing @ VariableError::Missing { .. } => StepError::MissingVariable(missing),
            malformed @ VariableError::Malformed { .. } => StepError::MalformedVariable(malformed),
        }
    }
}

impl From<GuardError> for StepError {
    fn from(err: GuardError) -> Self {
        match err {
            GuardError::CircuitOpen { category, retry_in } => {
                StepError::CircuitOpen { category, retry_in }
            }
            GuardError::Timeout { category, after } => StepError::Timeout { category, after },
            GuardError::Module(err) => StepError::Module(err),
            other @ GuardError::LimiterClosed(_) => StepError::Internal(other.to_string()),
        }
    }
}

/// Result of [`WorkflowEngine::cancel`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CancelOutcome {
    /// The run had not started and is now `cancelled`.
    Finished,
    /// The run is executing; it stops at the next dispatch boundary.
    Requested,
}

// ---------------------------------------------------------------------------
// WorkflowEngine
// ---------------------------------------------------------------------------

type StepCompletion = (usize, Result<Value, StepError>, Duration);

/// Executes workflow runs against a module registry and a run store.
///
/// Generic over `S: RunStore` for storage flexibility.
pub struct WorkflowEngine<S: RunStore> {
    modules: Arc<ModuleRegistry>,
    guards: Arc<GuardRegistry>,
    store: Arc<S>,
    events: EventBus,
    /// Cancellation tokens of runs executing in this process.
    cancellations: DashMap<Uuid, CancellationToken>,
}

impl<S: RunStore + 'static> WorkflowEngine<S> {
    pub fn new(modules: Arc<ModuleRegistry>, guards: Arc<GuardRegistry>, store: Arc<S>) -> Self {
        Self {
            modules,
            guards,
            store,
            events: EventBus::default(),
            cancellations: DashMap::new(),
        }
    }

    /// Publish run events on `events` instead of a private bus.
    pub fn with_event_bus(mut self, events: EventBus) -> Self {
        self.events = events;
        self
    }

    pub fn store(&self) -> &Arc<S> {
        &self.store
    }

    pub fn events(&self) -> &EventBus {
        &self.events
    }

    pub fn modules(&self) -> &Arc<ModuleRegistry> {
        &self.modules
    }

    pub fn guards(&self) -> &Arc<GuardRegistry> {
        &self.guards
    }

    /// Create a queued run for `definition` and execute it to completion.
    pub async fn start(
        &self,
        definition: &WorkflowDefinition,
        trigger_type: TriggerType,
        trigger_data: Value,
    ) -> Result<RunResult, EngineError> {
        let run = WorkflowRun::queued(definition, trigger_type, trigger_data);
        self.store.create_run(&run).await?;
        self.execute(run.id).await
    }

    /// Execute a queued run to completion.
    ///
    /// Step failures are not errors here: they finish the run as `error` and
    /// are reported in the returned [`RunResult`]. `Err` means the run could
    /// not be executed at all.
    pub async fn execute(&self, run_id: Uuid) -> Result<RunResult, EngineError> {
        let run = self
            .store
            .get_run(&run_id)
            .await?
            .ok_or(EngineError::RunNotFound(run_id))?;
        if run.status.is_terminal() {
            return Err(EngineError::AlreadyFinished {
                run_id,
                status: run.status,
            });
        }

        let started_at = Utc::now();
        if !self.store.mark_running(&run_id, started_at).await? {
            return Err(EngineError::NotQueued {
                run_id,
                status: run.status,
            });
        }

        let token = CancellationToken::new();
        self.cancellations.insert(run_id, token.clone());

        tracing::info!(
            run_id = %run_id,
            workflow = %run.workflow_name,
            attempt = run.attempt,
            "run started"
        );
        self.events.publish(WorkflowEvent::RunStarted {
            run_id,
            workflow: run.workflow_name.clone(),
            attempt: run.attempt,
        });

        let driven = self.drive(&run, &token).await;
        self.cancellations.remove(&run_id);

        let outcome = match driven {
            Ok(outcome) => outcome,
            Err(RepositoryError::Conflict(reason)) => {
                tracing::warn!(run_id = %run_id, %reason, "run finished elsewhere during execution");
                RunOutcome::failed(ErrorKind::Internal, reason, None)
            }
            Err(e) => {
                tracing::error!(run_id = %run_id, error = %e, "run store failed during execution");
                RunOutcome::failed(ErrorKind::Internal, e.to_string(), None)
            }
        };

        match self.store.finish_run(&run_id, &outcome).await {
            Ok(()) => {}
            Err(RepositoryError::Conflict(reason)) => {
                // Finished elsewhere (cancelled while starting); report what is stored.
                tracing::warn!(run_id = %run_id, %reason, "run already finished");
                let stored = self
                    .store
                    .get_run(&run_id)
                    .await?
                    .ok_or(EngineError::RunNotFound(run_id))?;
                return Ok(stored.result());
            }
            Err(e) => return Err(e.into()),
        }

        tracing::info!(
            run_id = %run_id,
            status = %outcome.status,
            error_step = outcome.error_step.as_deref().unwrap_or(""),
            "run finished"
        );
        self.events.publish(WorkflowEvent::RunFinished {
            run_id,
            status: outcome.status,
            error_step: outcome.error_step.clone(),
        });

        Ok(RunResult {
            run_id,
            status: outcome.status,
            output: outcome.output,
            error: outcome.error,
            error_kind: outcome.error_kind,
            error_step: outcome.error_step,
            started_at: Some(started_at),
            completed_at: Some(outcome.completed_at),
        })
    }

    /// Request cancellation of a run.
    pub async fn cancel(&self, run_id: Uuid) -> Result<CancelOutcome, EngineError> {
        let run = self
            .store
            .get_run(&run_id)
            .await?
            .ok_or(EngineError::RunNotFound(run_id))?;
        if run.status.is_terminal() || !self.store.request_cancel(&run_id).await? {
            return Err(EngineError::AlreadyFinished {
                run_id,
                status: run.status,
            });
        }

        // Only a run still queued in the store may be finished here; one that
        // started meanwhile observes the flag at its next dispatch boundary.
        if self.store.cancel_queued(&run_id).await? {
            tracing::info!(run_id = %run_id, "queued run cancelled");
            self.events.publish(WorkflowEvent::RunFinished {
                run_id,
                status: RunStatus::Cancelled,
                error_step: None,
            });
            return Ok(CancelOutcome::Finished);
        }

        if let Some(token) = self.cancellations.get(&run_id) {
            token.cancel();
        }
        tracing::info!(run_id = %run_id, "cancellation requested");
        Ok(CancelOutcome::Requested)
    }

    async fn cancel_requested(
        &self,
        run_id: &Uuid,
        token: &CancellationToken,
    ) -> Result<bool, RepositoryError> {
        if token.is_cancelled() {
            return Ok(true);
        }
        self.store.is_cancel_requested(run_id).await
    }

    async fn record(
        &self,
        run_id: &Uuid,
        index: usize,
        record: &StepRecord,
    ) -> Result<(), RepositoryError> {
        self.store.record_step(run_id, index, record).await
    }

    /// Mark step `index` failed and publish it.
    async fn fail_step(
        &self,
        run: &WorkflowRun,
        records: &mut [StepRecord],
        index: usize,
        error: &StepError,
    ) -> Result<(), RepositoryError> {
        let record = &mut records[index];
        record.status = StepStatus::Failed;
        record.error = Some(error.to_string());
        record.error_kind = Some(error.kind());
        record.error_details = error.details();
        record.finished_at = Some(Utc::now());
        self.record(&run.id, index, record).await?;

        tracing::warn!(
            run_id = %run.id,
            step = %record.step_name,
            kind = %error.kind(),
            error = %error,
            "step failed"
        );
        self.events.publish(WorkflowEvent::StepFailed {
            run_id: run.id,
            step: record.step_name.clone(),
            kind: error.kind(),
            error: error.to_string(),
        });
        Ok(())
    }

    async fn drive(
        &self,
        run: &WorkflowRun,
        token: &CancellationToken,
    ) -> Result<RunOutcome, RepositoryError> {
        let def = &run.definition;
        let graph = match DependencyGraph::build(def) {
            Ok(graph) => graph,
            Err(e) => {
                tracing::warn!(run_id = %run.id, error = %e, "definition snapshot cannot be scheduled");
                return Ok(RunOutcome::failed(ErrorKind::InvalidDefinition, e.to_string(), None));
            }
        };

        let mut records: Vec<StepRecord> = if run.steps.len() == def.steps.len() {
            run.steps.clone()
        } else {
            def.steps
                .iter()
                .map(|s| StepRecord::pending(&s.name, &s.module))
                .collect()
        };
        let mut bag = OutputBag::new(run.trigger_data.clone());
        let mut in_flight: JoinSet<StepCompletion> = JoinSet::new();
        let mut failure: Option<(usize, StepError)> = None;
        let mut cancelled = false;

        loop {
            if failure.is_none() && !cancelled && self.cancel_requested(&run.id, token).await? {
                tracing::info!(run_id = %run.id, "cancellation observed, draining in-flight steps");
                cancelled = true;
            }

            // Skipping a step can make its dependents ready, so dispatch
            // repeats until a pass skips nothing.
            while failure.is_none() && !cancelled {
                let mut ready: Vec<usize> = (0..def.steps.len())
                    .filter(|&i| {
                        records[i].status == StepStatus::Pending
                            && graph
                                .dependencies(i)
                                .iter()
                                .all(|&d| records[d].status.is_settled())
                    })
                    .collect();
                if ready.is_empty() {
                    break;
                }
                ready.sort_by_key(|&i| (Reverse(def.steps[i].priority.unwrap_or(0)), i));

                let mut skipped_any = false;
                for i in ready {
                    let step = &def.steps[i];

                    if let Some(condition) = &step.condition {
                        match evaluate_condition(condition, &bag) {
                            Ok(true) => {}
                            Ok(false) => {
                                records[i].status = StepStatus::Skipped;
                                records[i].finished_at = Some(Utc::now());
                                self.record(&run.id, i, &records[i]).await?;
                                tracing::debug!(run_id = %run.id, step = %step.name, "condition false, step skipped");
                                self.events.publish(WorkflowEvent::StepSkipped {
                                    run_id: run.id,
                                    step: step.name.clone(),
                                });
                                skipped_any = true;
                                continue;
                            }
                            Err(e) => {
                                let err = StepError::Condition(e);
                                self.fail_step(run, &mut records, i, &err).await?;
                                failure = Some((i, err));
                                break;
                            }
                        }
                    }

                    let input = match resolve(&step.params, &bag, &step.name) {
                        Ok(input) => input,
                        Err(e) => {
                            let err = StepError::from(e);
                            self.fail_step(run, &mut records, i, &err).await?;
                            failure = Some((i, err));
                            break;
                        }
                    };

                    let descriptor = match self.modules.lookup(&step.module) {
                        Ok(descriptor) => descriptor,
                        Err(_) => {
                            let err = StepError::ModuleNotFound(step.module.clone());
                            self.fail_step(run, &mut records, i, &err).await?;
                            failure = Some((i, err));
                            break;
                        }
                    };
                    let guard = self.guards.guard(descriptor.category());
                    let callable = descriptor.callable.clone();
                    let timeout = step.timeout_ms.map(Duration::from_millis);

                    records[i].status = StepStatus::Running;
                    records[i].started_at = Some(Utc::now());
                    self.record(&run.id, i, &records[i]).await?;
                    tracing::debug!(
                        run_id = %run.id,
                        step = %step.name,
                        module = %step.module,
                        "dispatching step"
                    );
                    self.events.publish(WorkflowEvent::StepStarted {
                        run_id: run.id,
                        step: step.name.clone(),
                        module: step.module.clone(),
                    });

                    in_flight.spawn(async move {
                        let started = Instant::now();
                        let call = guard.call(timeout, || callable.call(input));
                        let result = match AssertUnwindSafe(call).catch_unwind().await {
                            Ok(result) => result.map_err(StepError::from),
                            Err(_) => Err(StepError::Internal("module panicked".to_string())),
                        };
                        (i, result, started.elapsed())
                    });
                }

                if !skipped_any {
                    break;
                }
            }

            let Some(joined) = in_flight.join_next().await else {
                break;
            };
            let (i, result, elapsed) = match joined {
                Ok(completion) => completion,
                Err(e) => {
                    // Step tasks are never aborted and catch panics, so this is unexpected.
                    tracing::error!(run_id = %run.id, error = %e, "step task failed to join");
                    continue;
                }
            };

            match result {
                Ok(output) => {
                    let step = &def.steps[i];
                    if let Some(name) = &step.output_as {
                        bag.insert(name.clone(), output.clone());
                    }
                    let record = &mut records[i];
                    record.status = StepStatus::Succeeded;
                    record.output = Some(output);
                    record.finished_at = Some(Utc::now());
                    self.record(&run.id, i, record).await?;
                    tracing::debug!(
                        run_id = %run.id,
                        step = %step.name,
                        duration_ms = elapsed.as_millis() as u64,
                        "step succeeded"
                    );
                    self.events.publish(WorkflowEvent::StepSucceeded {
                        run_id: run.id,
                        step: step.name.clone(),
                        duration_ms: elapsed.as_millis() as u64,
                    });
                }
                Err(err) => {
                    self.fail_step(run, &mut records, i, &err).await?;
                    if failure.is_none() {
                        failure = Some((i, err));
                    }
                }
            }
        }

        if let Some((i, err)) = failure {
            return Ok(RunOutcome::failed(
                err.kind(),
                err.to_string(),
                Some(def.steps[i].name.clone()),
            ));
        }
        if cancelled {
            return Ok(RunOutcome::cancelled());
        }
        if let Some(stuck) = records.iter().find(|r| !r.status.is_settled()) {
            return Ok(RunOutcome::failed(
                ErrorKind::Internal,
                format!("step '{}' never became ready", stuck.step_name),
                Some(stuck.step_name.clone()),
            ));
        }

        Ok(RunOutcome {
            status: RunStatus::Success,
            output: Some(select_output(def, &records)),
            error: None,
            error_kind: None,
            error_step: None,
            completed_at: Utc::now(),
        })
    }
}

/// The evaluator is built per call and never held across an await.
fn evaluate_condition(condition: &str, bag: &OutputBag) -> Result<bool, ExpressionError> {
    WorkflowEvaluator::new().evaluate_condition(condition, bag)
}

/// The declared `outputStep`'s output, else the last succeeded step with an
/// `outputAs`, else `null`.
fn select_output(def: &WorkflowDefinition, records: &[StepRecord]) -> Value {
    let chosen = match &def.output_step {
        Some(name) => records.iter().find(|r| &r.step_name == name),
        None => def
            .steps
            .iter()
            .zip(records)
            .rev()
            .find(|(step, record)| step.output_as.is_some() && record.status == StepStatus::Succeeded)
            .map(|(_, record)| record),
    };
    chosen.and_then(|r| r.output.clone()).unwrap_or(Value::Null)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU32, Ordering};

    use serde_json::json;
    use stepflow_types::config::{GuardOverride, ResilienceConfig};

    use crate::repository::InMemoryRunStore;
    use crate::testing::{definition, registry, Timeline};

    struct Harness {
        engine: WorkflowEngine<InMemoryRunStore>,
        timeline: Timeline,
        failures: Arc<AtomicU32>,
    }

    fn harness_with(resilience: ResilienceConfig) -> Harness {
        let timeline = Timeline::default();
        let failures = Arc::new(AtomicU32::new(0));
        let engine = WorkflowEngine::new(
            Arc::new(registry(&timeline, &failures)),
            Arc::new(GuardRegistry::new(resilience)),
            Arc::new(InMemoryRunStore::new()),
        );
        Harness {
            engine,
            timeline,
            failures,
        }
    }

    fn harness() -> Harness {
        harness_with(ResilienceConfig::default())
    }

    async fn stored(engine: &WorkflowEngine<InMemoryRunStore>, run_id: Uuid) -> WorkflowRun {
        engine.store().get_run(&run_id).await.unwrap().unwrap()
    }

    #[tokio::test]
    async fn test_linear_run_succeeds_with_last_output() {
        let h = harness();
        let def = definition(
            r#"
name: greet
steps:
  - name: lookup
    module: test.data.echo
    params: { email: "{{input.email}}", tier: gold }
    outputAs: contact
  - name: compose
    module: test.data.echo
    params: { to: "{{contact.email}}", text: "Hi {{contact.tier}} member" }
    outputAs: message
"#,
        );

        let result = h
            .engine
            .start(&def, TriggerType::Manual, json!({"email": "ada@example.com"}))
            .await
            .unwrap();

        assert_eq!(result.status, RunStatus::Success);
        assert_eq!(
            result.output,
            Some(json!({"to": "ada@example.com", "text": "Hi gold member"}))
        );
        assert!(result.error_step.is_none());

        let run = stored(&h.engine, result.run_id).await;
        assert_eq!(run.status, RunStatus::Success);
        assert!(run.steps.iter().all(|s| s.status == StepStatus::Succeeded));
    }

    #[tokio::test]
    async fn test_output_step_overrides_default_output() {
        let h = harness();
        let def = definition(
            r#"
name: pick
outputStep: first
steps:
  - name: first
    module: test.data.echo
    params: { n: one }
    outputAs: a
  - name: second
    module: test.data.echo
    params: { n: two }
    outputAs: b
"#,
        );
        let result = h.engine.start(&def, TriggerType::Manual, json!({})).await.unwrap();
        assert_eq!(result.output, Some(json!({"n": "one"})));
    }

    #[tokio::test]
    async fn test_output_is_null_without_output_as() {
        let h = harness();
        let def = definition(
            r#"
name: quiet
steps:
  - name: only
    module: test.data.echo
"#,
        );
        let result = h.engine.start(&def, TriggerType::Manual, json!({})).await.unwrap();
        assert_eq!(result.status, RunStatus::Success);
        assert_eq!(result.output, Some(Value::Null));
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_independent_steps_overlap() {
        let h = harness();
        let def = definition(
            r#"
name: fanout
steps:
  - name: a
    module: test.time.sleep
    params: { ms: 200, label: a }
  - name: b
    module: test.time.sleep
    params: { ms: 200, label: b }
"#,
        );
        let result = h.engine.start(&def, TriggerType::Manual, json!({})).await.unwrap();
        assert_eq!(result.status, RunStatus::Success);
        assert!(h.timeline.window("a").overlaps(&h.timeline.window("b")));
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_dependent_waits_only_for_its_producer() {
        let h = harness();
        let def = definition(
            r#"
name: chain
steps:
  - name: a
    module: test.time.sleep
    params: { ms: 50, label: a, value: { id: 7 } }
    outputAs: first
  - name: b
    module: test.time.sleep
    params: { ms: 400, label: b }
  - name: c
    module: test.time.sleep
    params: { ms: 0, label: c, value: "{{first.id}}" }
    outputAs: last
"#,
        );
        let result = h.engine.start(&def, TriggerType::Manual, json!({})).await.unwrap();
        assert_eq!(result.status, RunStatus::Success);
        assert_eq!(result.output, Some(json!(7)));

        let (a, b, c) = (
            h.timeline.window("a"),
            h.timeline.window("b"),
            h.timeline.window("c"),
        );
        assert!(a.overlaps(&b));
        assert!(c.start >= a.end);
        assert!(c.start < b.end);
    }

    #[tokio::test]
    async fn test_missing_variable_fails_run() {
        let h = harness();
        let def = definition(
            r#"
name: broken
steps:
  - name: send
    module: test.data.echo
    params: { to: "{{input.contact.email}}" }
"#,
        );
        let result = h.engine.start(&def, TriggerType::Manual, json!({})).await.unwrap();
        assert_eq!(result.status, RunStatus::Error);
        assert_eq!(result.error_kind, Some(ErrorKind::MissingVariable));
        assert_eq!(result.error_step.as_deref(), Some("send"));
        assert!(result.error.unwrap().contains("input.contact.email"));
    }

    #[tokio::test]
    async fn test_false_condition_skips_and_dependent_fails() {
        let h = harness();
        let def = definition(
            r#"
name: gated
steps:
  - name: lookup
    module: test.data.echo
    params: { email: a@b.co }
    outputAs: contact
    condition: "{{input.enabled}} == true"
  - name: notify
    module: test.data.echo
    params: { to: "{{contact.email}}" }
"#,
        );
        let result = h
            .engine
            .start(&def, TriggerType::Manual, json!({"enabled": false}))
            .await
            .unwrap();
        assert_eq!(result.status, RunStatus::Error);
        assert_eq!(result.error_kind, Some(ErrorKind::MissingVariable));
        assert_eq!(result.error_step.as_deref(), Some("notify"));

        let run = stored(&h.engine, result.run_id).await;
        assert_eq!(run.steps[0].status, StepStatus::Skipped);
        assert!(run.steps[0].output.is_none());
        assert_eq!(run.steps[1].status, StepStatus::Failed);
    }

    #[tokio::test]
    async fn test_dependent_of_skipped_step_can_skip_too() {
        let h = harness();
        let def = definition(
            r#"
name: gated
steps:
  - name: lookup
    module: test.data.echo
    params: { email: a@b.co }
    outputAs: contact
    condition: "{{input.enabled}} == true"
  - name: notify
    module: test.data.echo
    params: { to: "{{contact.email}}" }
    condition: "{{contact}}"
  - name: done
    module: test.data.echo
    params: { ok: true }
    outputAs: summary
"#,
        );
        let result = h
            .engine
            .start(&def, TriggerType::Manual, json!({"enabled": false}))
            .await
            .unwrap();
        assert_eq!(result.status, RunStatus::Success);
        assert_eq!(result.output, Some(json!({"ok": true})));

        let run = stored(&h.engine, result.run_id).await;
        assert_eq!(run.steps[0].status, StepStatus::Skipped);
        assert_eq!(run.steps[1].status, StepStatus::Skipped);
        assert_eq!(run.steps[2].status, StepStatus::Succeeded);
    }

    #[tokio::test]
    async fn test_module_error_keeps_details_and_drains_siblings() {
        let h = harness();
        let def = definition(
            r#"
name: partial
steps:
  - name: slow
    module: test.time.sleep
    params: { ms: 100, label: slow }
  - name: push
    module: flaky.api.call
    params: { code: 422 }
  - name: after
    module: test.data.echo
    params: { v: "{{pushed}}" }
    outputAs: never
"#,
        );
        let result = h.engine.start(&def, TriggerType::Manual, json!({})).await.unwrap();
        assert_eq!(result.status, RunStatus::Error);
        assert_eq!(result.error_kind, Some(ErrorKind::ModuleExecution));
        assert_eq!(result.error_step.as_deref(), Some("push"));

        let run = stored(&h.engine, result.run_id).await;
        assert_eq!(run.steps[0].status, StepStatus::Succeeded);
        assert_eq!(run.steps[1].status, StepStatus::Failed);
        assert_eq!(run.steps[1].error_details, Some(json!({"code": 422})));
        assert_eq!(run.steps[2].status, StepStatus::Pending);
    }

    #[tokio::test]
    async fn test_open_circuit_fails_fast_across_runs() {
        let mut resilience = ResilienceConfig::default();
        resilience.categories.insert(
            "flaky".to_string(),
            GuardOverride {
                failure_threshold: Some(1),
                cooldown_ms: Some(60_000),
                ..Default::default()
            },
        );
        let h = harness_with(resilience);
        let def = definition(
            r#"
name: flaky
steps:
  - name: push
    module: flaky.api.call
"#,
        );

        let first = h.engine.start(&def, TriggerType::Manual, json!({})).await.unwrap();
        assert_eq!(first.error_kind, Some(ErrorKind::ModuleExecution));

        let second = h.engine.start(&def, TriggerType::Manual, json!({})).await.unwrap();
        assert_eq!(second.error_kind, Some(ErrorKind::CircuitOpen));
        assert_eq!(second.error_step.as_deref(), Some("push"));
        assert_eq!(h.failures.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_step_timeout() {
        let h = harness();
        let def = definition(
            r#"
name: slow
steps:
  - name: wait
    module: test.time.sleep
    params: { ms: 500, label: wait }
    timeoutMs: 50
"#,
        );
        let result = h.engine.start(&def, TriggerType::Manual, json!({})).await.unwrap();
        assert_eq!(result.error_kind, Some(ErrorKind::Timeout));
        assert_eq!(result.error_step.as_deref(), Some("wait"));
    }

    #[tokio::test]
    async fn test_unknown_module_fails_at_run_time() {
        let h = harness();
        let def = definition(
            r#"
name: ghost
steps:
  - name: call
    module: ghost.api.call
"#,
        );
        let result = h.engine.start(&def, TriggerType::Manual, json!({})).await.unwrap();
        assert_eq!(result.error_kind, Some(ErrorKind::ModuleNotFound));
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_cancel_running_run_stops_at_boundary() {
        let h = Arc::new(harness());
        let def = definition(
            r#"
name: long
steps:
  - name: first
    module: test.time.sleep
    params: { ms: 300, label: first, value: 1 }
    outputAs: one
  - name: second
    module: test.data.echo
    params: { v: "{{one}}" }
"#,
        );
        let run = WorkflowRun::queued(&def, TriggerType::Manual, json!({}));
        let run_id = run.id;
        h.engine.store().create_run(&run).await.unwrap();

        let runner = Arc::clone(&h);
        let handle = tokio::spawn(async move { runner.engine.execute(run_id).await });

        tokio::time::sleep(Duration::from_millis(100)).await;
        assert_eq!(h.engine.cancel(run_id).await.unwrap(), CancelOutcome::Requested);

        let result = handle.await.unwrap().unwrap();
        assert_eq!(result.status, RunStatus::Cancelled);
        assert_eq!(result.error_kind, Some(ErrorKind::Cancelled));

        let stored = stored(&h.engine, run_id).await;
        assert_eq!(stored.steps[0].status, StepStatus::Succeeded);
        assert_eq!(stored.steps[1].status, StepStatus::Pending);
    }

    /// Run store whose `request_cancel` stalls before flagging the run.
    struct SlowCancelStore {
        inner: InMemoryRunStore,
        delay: Duration,
    }

    impl RunStore for SlowCancelStore {
        async fn create_run(&self, run: &WorkflowRun) -> Result<(), RepositoryError> {
            self.inner.create_run(run).await
        }

        async fn mark_running(
            &self,
            run_id: &Uuid,
            at: chrono::DateTime<Utc>,
        ) -> Result<bool, RepositoryError> {
            self.inner.mark_running(run_id, at).await
        }

        async fn record_step(
            &self,
            run_id: &Uuid,
            index: usize,
            record: &StepRecord,
        ) -> Result<(), RepositoryError> {
            self.inner.record_step(run_id, index, record).await
        }

        async fn finish_run(&self, run_id: &Uuid, outcome: &RunOutcome) -> Result<(), RepositoryError> {
            self.inner.finish_run(run_id, outcome).await
        }

        async fn request_cancel(&self, run_id: &Uuid) -> Result<bool, RepositoryError> {
            tokio::time::sleep(self.delay).await;
            self.inner.request_cancel(run_id).await
        }

        async fn cancel_queued(&self, run_id: &Uuid) -> Result<bool, RepositoryError> {
            self.inner.cancel_queued(run_id).await
        }

        async fn is_cancel_requested(&self, run_id: &Uuid) -> Result<bool, RepositoryError> {
            self.inner.is_cancel_requested(run_id).await
        }

        async fn get_run(&self, run_id: &Uuid) -> Result<Option<WorkflowRun>, RepositoryError> {
            self.inner.get_run(run_id).await
        }

        async fn list_runs(&self, workflow_id: &Uuid, limit: u32) -> Result<Vec<WorkflowRun>, RepositoryError> {
            self.inner.list_runs(workflow_id, limit).await
        }

        async fn list_tenant_runs(&self, tenant_id: &str, limit: u32) -> Result<Vec<WorkflowRun>, RepositoryError> {
            self.inner.list_tenant_runs(tenant_id, limit).await
        }

        async fn list_stale_runs(&self) -> Result<Vec<WorkflowRun>, RepositoryError> {
            self.inner.list_stale_runs().await
        }
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_cancel_racing_execute_stops_run_instead_of_finishing_it() {
        let timeline = Timeline::default();
        let failures = Arc::new(AtomicU32::new(0));
        let engine = Arc::new(WorkflowEngine::new(
            Arc::new(registry(&timeline, &failures)),
            Arc::new(GuardRegistry::new(ResilienceConfig::default())),
            Arc::new(SlowCancelStore {
                inner: InMemoryRunStore::new(),
                delay: Duration::from_millis(150),
            }),
        ));
        let def = definition(
            r#"
name: raced
steps:
  - name: first
    module: test.time.sleep
    params: { ms: 300, label: first, value: 1 }
    outputAs: one
  - name: second
    module: test.data.echo
    params: { v: "{{one}}" }
"#,
        );
        let run = WorkflowRun::queued(&def, TriggerType::Manual, json!({}));
        let run_id = run.id;
        engine.store().create_run(&run).await.unwrap();

        // The cancel reads the run while queued; execution starts before the
        // flag lands.
        let canceller = Arc::clone(&engine);
        let cancel = tokio::spawn(async move { canceller.cancel(run_id).await });
        tokio::time::sleep(Duration::from_millis(20)).await;
        let result = engine.execute(run_id).await.unwrap();

        assert_eq!(cancel.await.unwrap().unwrap(), CancelOutcome::Requested);
        assert_eq!(result.status, RunStatus::Cancelled);

        let stored = engine.store().get_run(&run_id).await.unwrap().unwrap();
        assert_eq!(stored.status, RunStatus::Cancelled);
        assert_eq!(stored.steps[0].status, StepStatus::Succeeded);
        assert_eq!(stored.steps[1].status, StepStatus::Pending);
        let completed_at = stored.completed_at.unwrap();
        assert!(stored.steps[0].finished_at.unwrap() <= completed_at);
    }

    #[tokio::test]
    async fn test_malformed_marker_in_params_is_its_own_kind() {
        let h = harness();
        let def = definition(
            r#"
name: typo
steps:
  - name: send
    module: test.data.echo
    params: { to: "{{contact..email}}" }
"#,
        );
        let result = h.engine.start(&def, TriggerType::Manual, json!({})).await.unwrap();
        assert_eq!(result.status, RunStatus::Error);
        assert_eq!(result.error_kind, Some(ErrorKind::MalformedVariable));
        assert_eq!(result.error_step.as_deref(), Some("send"));
        assert!(!ErrorKind::MalformedVariable.is_retryable());
    }

    #[tokio::test]
    async fn test_cyclic_snapshot_fails_as_invalid_definition() {
        let h = harness();
        let def = definition(
            r#"
name: loop
steps:
  - name: a
    module: test.data.echo
    params: { v: "{{y}}" }
    outputAs: x
  - name: b
    module: test.data.echo
    params: { v: "{{x}}" }
    outputAs: y
"#,
        );
        let result = h.engine.start(&def, TriggerType::Manual, json!({})).await.unwrap();
        assert_eq!(result.status, RunStatus::Error);
        assert_eq!(result.error_kind, Some(ErrorKind::InvalidDefinition));
        assert!(result.error.unwrap().contains("cycle"));

        let run = stored(&h.engine, result.run_id).await;
        assert!(run.steps.iter().all(|s| s.status == StepStatus::Pending));
    }

    #[tokio::test]
    async fn test_cancel_queued_and_terminal_runs() {
        let h = harness();
        let def = crate::testing::single_echo_definition();
        let run = WorkflowRun::queued(&def, TriggerType::Manual, json!({"name": "x"}));
        h.engine.store().create_run(&run).await.unwrap();

        assert_eq!(h.engine.cancel(run.id).await.unwrap(), CancelOutcome::Finished);
        assert_eq!(stored(&h.engine, run.id).await.status, RunStatus::Cancelled);

        assert!(matches!(
            h.engine.cancel(run.id).await,
            Err(EngineError::AlreadyFinished { .. })
        ));
        assert!(matches!(
            h.engine.execute(run.id).await,
            Err(EngineError::AlreadyFinished { .. })
        ));
        assert!(matches!(
            h.engine.cancel(Uuid::now_v7()).await,
            Err(EngineError::RunNotFound(_))
        ));
    }

    #[tokio::test]
    async fn test_events_cover_run_lifecycle() {
        let h = harness();
        let mut events = h.engine.events().subscribe();
        let def = crate::testing::single_echo_definition();
        let result = h
            .engine
            .start(&def, TriggerType::Manual, json!({"name": "Ada"}))
            .await
            .unwrap();

        let mut seen = Vec::new();
        while let Ok(event) = events.try_recv() {
            assert_eq!(event.run_id(), result.run_id);
            seen.push(event);
        }
        assert!(matches!(seen.first(), Some(WorkflowEvent::RunStarted { .. })));
        assert!(seen
            .iter()
            .any(|e| matches!(e, WorkflowEvent::StepSucceeded { step, .. } if step == "greet")));
        assert!(matches!(
            seen.last(),
            Some(WorkflowEvent::RunFinished {
                status: RunStatus::Success,
                ..
            })
        ));
    }

    #[tokio::test]
    async fn test_priority_orders_dispatch() {
        let mut resilience = ResilienceConfig::default();
        resilience.categories.insert(
            "test".to_string(),
            GuardOverride {
                max_concurrent: Some(1),
                ..Default::default()
            },
        );
        let h = harness_with(resilience);
        let def = definition(
            r#"
name: ranked
steps:
  - name: low
    module: test.time.sleep
    params: { ms: 20, label: low }
  - name: high
    module: test.time.sleep
    params: { ms: 20, label: high }
    priority: 10
"#,
        );
        let result = h.engine.start(&def, TriggerType::Manual, json!({})).await.unwrap();
        assert_eq!(result.status, RunStatus::Success);
        assert!(h.timeline.window("high").start < h.timeline.window("low").start);
    }
}
