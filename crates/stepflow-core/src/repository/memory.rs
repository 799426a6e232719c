//! In-process run and definition stores backed by `DashMap`.

use chrono::{DateTime, Utc};
use dashmap::DashMap;
use stepflow_types::error::RepositoryError;
use stepflow_types::workflow::{RunOutcome, RunStatus, StepRecord, WorkflowDefinition, WorkflowRun};
use uuid::Uuid;

use super::run::RunStore;
use super::workflow::WorkflowStore;

#[derive(Debug, Default)]
pub struct InMemoryRunStore {
    runs: DashMap<Uuid, WorkflowRun>,
}

impl InMemoryRunStore {
    pub fn new() -> Self {
        Self::default()
    }

    fn newest_first(mut runs: Vec<WorkflowRun>, limit: u32) -> Vec<WorkflowRun> {
        runs.sort_by(|a, b| b.queued_at.cmp(&a.queued_at).then(b.id.cmp(&a.id)));
        runs.truncate(limit as usize);
        runs
    }
}

impl RunStore for InMemoryRunStore {
    async fn create_run(&self, run: &WorkflowRun) -> Result<(), RepositoryError> {
        if self.runs.contains_key(&run.id) {
            return Err(RepositoryError::Conflict(format!("run {} already exists", run.id)));
        }
        self.runs.insert(run.id, run.clone());
        Ok(())
    }

    async fn mark_running(&self, run_id: &Uuid, at: DateTime<Utc>) -> Result<bool, RepositoryError> {
        let mut run = self.runs.get_mut(run_id).ok_or(RepositoryError::NotFound)?;
        if run.status != RunStatus::Queued {
            return Ok(false);
        }
        run.status = RunStatus::Running;
        run.started_at = Some(at);
        Ok(true)
    }

    async fn record_step(
        &self,
        run_id: &Uuid,
        index: usize,
        record: &StepRecord,
    ) -> Result<(), RepositoryError> {
        let mut run = self.runs.get_mut(run_id).ok_or(RepositoryError::NotFound)?;
        if run.status.is_terminal() {
            return Err(RepositoryError::Conflict(format!(
                "run {run_id} already finished as {}",
                run.status
            )));
        }
        if let Some(existing) = run.steps.iter_mut().find(|s| s.step_name == record.step_name) {
            *existing = record.clone();
        } else {
            let at = index.min(run.steps.len());
            run.steps.insert(at, record.clone());
        }
        Ok(())
    }

    async fn finish_run(&self, run_id: &Uuid, outcome: &RunOutcome) -> Result<(), RepositoryError> {
        let mut run = self.runs.get_mut(run_id).ok_or(RepositoryError::NotFound)?;
        if run.status.is_terminal() {
            return Err(RepositoryError::Conflict(format!(
                "run {run_id} already finished as {}",
                run.status
            )));
        }
        run.status = outcome.status;
        run.output = outcome.output.clone();
        run.error = outcome.error.clone();
        run.error_kind = outcome.error_kind;
        run.error_step = outcome.error_step.clone();
        run.completed_at = Some(outcome.completed_at);
        Ok(())
    }

    async fn request_cancel(&self, run_id: &Uuid) -> Result<bool, RepositoryError> {
        let mut run = self.runs.get_mut(run_id).ok_or(RepositoryError::NotFound)?;
        if run.status.is_terminal() {
            return Ok(false);
        }
        run.cancel_requested = true;
        Ok(true)
    }

    async fn cancel_queued(&self, run_id: &Uuid) -> Result<bool, RepositoryError> {
        let mut run = self.runs.get_mut(run_id).ok_or(RepositoryError::NotFound)?;
        if run.status != RunStatus::Queued {
            return Ok(false);
        }
        let outcome = RunOutcome::cancelled();
        run.status = outcome.status;
        run.error = outcome.error;
        run.error_kind = outcome.error_kind;
        run.cancel_requested = true;
        run.completed_at = Some(outcome.completed_at);
        Ok(true)
    }

    async fn is_cancel_requested(&self, run_id: &Uuid) -> Result<bool, RepositoryError> {
        self.runs
            .get(run_id)
            .map(|r| r.cancel_requested)
            .ok_or(RepositoryError::NotFound)
    }

    async fn get_run(&self, run_id: &Uuid) -> Result<Option<WorkflowRun>, RepositoryError> {
        Ok(self.runs.get(run_id).map(|r| r.clone()))
    }

    async fn list_runs(&self, workflow_id: &Uuid, limit: u32) -> Result<Vec<WorkflowRun>, RepositoryError> {
        let runs = self
            .runs
            .iter()
            .filter(|r| r.workflow_id == *workflow_id)
            .map(|r| r.clone())
            .collect();
        Ok(Self::newest_first(runs, limit))
    }

    async fn list_tenant_runs(&self, tenant_id: &str, limit: u32) -> Result<Vec<WorkflowRun>, RepositoryError> {
        let runs = self
            .runs
            .iter()
            .filter(|r| r.tenant_id == tenant_id)
            .map(|r| r.clone())
            .collect();
        Ok(Self::newest_first(runs, limit))
    }

    async fn list_stale_runs(&self) -> Result<Vec<WorkflowRun>, RepositoryError> {
        let runs = self
            .runs
            .iter()
            .filter(|r| r.status == RunStatus::Running)
            .map(|r| r.clone())
            .collect();
        Ok(Self::newest_first(runs, u32::MAX))
    }
}

#[derive(Debug, Default)]
pub struct InMemoryWorkflowStore {
    definitions: DashMap<Uuid, WorkflowDefinition>,
}

impl InMemoryWorkflowStore {
    pub fn new() -> Self {
        Self::default()
    }
}

impl WorkflowStore for InMemoryWorkflowStore {
    async fn save_definition(&self, def: &WorkflowDefinition) -> Result<(), RepositoryError> {
        let clash = self.definitions.iter().any(|d| {
            d.id != def.id && d.tenant_id == def.tenant_id && d.name == def.name
        });
        if clash {
            return Err(RepositoryError::Conflict(format!(
                "workflow '{}' already exists for tenant '{}'",
                def.name, def.tenant_id
            )));
        }
        self.definitions.insert(def.id, def.clone());
        Ok(())
    }

    async fn get_definition(&self, id: &Uuid) -> Result<Option<WorkflowDefinition>, RepositoryError> {
        Ok(self.definitions.get(id).map(|d| d.clone()))
    }

    async fn get_definition_by_name(
        &self,
        tenant_id: &str,
        name: &str,
    ) -> Result<Option<WorkflowDefinition>, RepositoryError> {
        Ok(self
            .definitions
            .iter()
            .find(|d| d.tenant_id == tenant_id && d.name == name)
            .map(|d| d.clone()))
    }

    async fn list_definitions(&self, tenant_id: Option<&str>) -> Result<Vec<WorkflowDefinition>, RepositoryError> {
        let mut defs: Vec<WorkflowDefinition> = self
            .definitions
            .iter()
            .filter(|d| tenant_id.is_none_or(|t| d.tenant_id == t))
            .map(|d| d.clone())
            .collect();
        defs.sort_by(|a, b| a.tenant_id.cmp(&b.tenant_id).then(a.name.cmp(&b.name)));
        Ok(defs)
    }

    async fn delete_definition(&self, id: &Uuid) -> Result<bool, RepositoryError> {
        Ok(self.definitions.remove(id).is_some())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use stepflow_types::workflow::{ErrorKind, StepStatus, TriggerType};

    fn definition(name: &str) -> WorkflowDefinition {
        serde_json::from_value(json!({
            "name": name,
            "tenantId": "acme",
            "steps": [
                {"name": "a", "module": "core.data.echo", "outputAs": "x"},
                {"name": "b", "module": "core.data.echo"}
            ]
        }))
        .unwrap()
    }

    #[tokio::test]
    async fn test_run_lifecycle() {
        let store = InMemoryRunStore::new();
        let run = WorkflowRun::queued(&definition("wf"), TriggerType::Manual, json!({}));
        store.create_run(&run).await.unwrap();

        assert!(store.mark_running(&run.id, Utc::now()).await.unwrap());
        assert!(!store.mark_running(&run.id, Utc::now()).await.unwrap());

        let mut record = StepRecord::pending("a", "core.data.echo");
        record.status = StepStatus::Succeeded;
        record.output = Some(json!(1));
        store.record_step(&run.id, 0, &record).await.unwrap();

        store
            .finish_run(&run.id, &RunOutcome::failed(ErrorKind::Timeout, "slow", Some("b".into())))
            .await
            .unwrap();

        let stored = store.get_run(&run.id).await.unwrap().unwrap();
        assert_eq!(stored.status, RunStatus::Error);
        assert_eq!(stored.steps.len(), 2);
        assert_eq!(stored.steps[0].status, StepStatus::Succeeded);
        assert_eq!(stored.steps[1].status, StepStatus::Pending);
        assert_eq!(stored.error_step.as_deref(), Some("b"));
    }

    #[tokio::test]
    async fn test_terminal_run_is_append_only() {
        let store = InMemoryRunStore::new();
        let run = WorkflowRun::queued(&definition("wf"), TriggerType::Manual, json!({}));
        store.create_run(&run).await.unwrap();
        store.finish_run(&run.id, &RunOutcome::cancelled()).await.unwrap();

        let err = store
            .finish_run(&run.id, &RunOutcome::failed(ErrorKind::Internal, "x", None))
            .await
            .unwrap_err();
        assert!(matches!(err, RepositoryError::Conflict(_)));
        assert!(!store.request_cancel(&run.id).await.unwrap());

        let mut late = StepRecord::pending("a", "core.data.echo");
        late.status = StepStatus::Succeeded;
        assert!(matches!(
            store.record_step(&run.id, 0, &late).await,
            Err(RepositoryError::Conflict(_))
        ));
        let stored = store.get_run(&run.id).await.unwrap().unwrap();
        assert_eq!(stored.steps[0].status, StepStatus::Pending);
    }

    #[tokio::test]
    async fn test_cancel_queued_only_from_queued() {
        let store = InMemoryRunStore::new();
        let queued = WorkflowRun::queued(&definition("wf"), TriggerType::Manual, json!({}));
        let started = WorkflowRun::queued(&definition("wf"), TriggerType::Manual, json!({}));
        store.create_run(&queued).await.unwrap();
        store.create_run(&started).await.unwrap();
        store.mark_running(&started.id, Utc::now()).await.unwrap();

        assert!(store.cancel_queued(&queued.id).await.unwrap());
        let stored = store.get_run(&queued.id).await.unwrap().unwrap();
        assert_eq!(stored.status, RunStatus::Cancelled);
        assert!(stored.cancel_requested);
        assert_eq!(stored.error_kind, Some(ErrorKind::Cancelled));
        assert!(stored.completed_at.is_some());
        assert!(!store.cancel_queued(&queued.id).await.unwrap());

        assert!(!store.cancel_queued(&started.id).await.unwrap());
        let still_running = store.get_run(&started.id).await.unwrap().unwrap();
        assert_eq!(still_running.status, RunStatus::Running);
        assert!(matches!(
            store.cancel_queued(&Uuid::now_v7()).await,
            Err(RepositoryError::NotFound)
        ));
    }

    #[tokio::test]
    async fn test_cancel_flag_and_stale_runs() {
        let store = InMemoryRunStore::new();
        let run = WorkflowRun::queued(&definition("wf"), TriggerType::Manual, json!({}));
        store.create_run(&run).await.unwrap();
        store.mark_running(&run.id, Utc::now()).await.unwrap();

        assert!(!store.is_cancel_requested(&run.id).await.unwrap());
        assert!(store.request_cancel(&run.id).await.unwrap());
        assert!(store.is_cancel_requested(&run.id).await.unwrap());
        assert_eq!(store.list_stale_runs().await.unwrap().len(), 1);
        assert!(matches!(
            store.is_cancel_requested(&Uuid::now_v7()).await,
            Err(RepositoryError::NotFound)
        ));
    }

    #[tokio::test]
    async fn test_list_runs_newest_first_with_limit() {
        let store = InMemoryRunStore::new();
        let def = definition("wf");
        let first = WorkflowRun::queued(&def, TriggerType::Manual, json!({}));
        let second = first.next_attempt();
        store.create_run(&first).await.unwrap();
        store.create_run(&second).await.unwrap();

        let runs = store.list_runs(&def.id, 10).await.unwrap();
        assert_eq!(runs[0].id, second.id);
        assert_eq!(store.list_runs(&def.id, 1).await.unwrap().len(), 1);
        assert_eq!(store.list_tenant_runs("acme", 10).await.unwrap().len(), 2);
        assert!(store.list_tenant_runs("other", 10).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_definition_store() {
        let store = InMemoryWorkflowStore::new();
        let def = definition("onboarding");
        store.save_definition(&def).await.unwrap();
        store.save_definition(&def).await.unwrap();

        let found = store.get_definition_by_name("acme", "onboarding").await.unwrap();
        assert_eq!(found.map(|d| d.id), Some(def.id));

        let clash = definition("onboarding");
        assert!(matches!(
            store.save_definition(&clash).await,
            Err(RepositoryError::Conflict(_))
        ));

        assert_eq!(store.list_definitions(Some("acme")).await.unwrap().len(), 1);
        assert!(store.list_definitions(Some("nobody")).await.unwrap().is_empty());
        assert!(store.delete_definition(&def.id).await.unwrap());
        assert!(!store.delete_definition(&def.id).await.unwrap());
    }
}
