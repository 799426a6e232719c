//! Application state wiring stores, the engine and the queue adapter.
//!
//! The core services are generic over their storage ports; AppState pins
//! them to the SQLite implementations from `stepflow-infra`.

use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{Context, Result};
use uuid::Uuid;

use stepflow_core::event::EventBus;
use stepflow_core::module::ModuleRegistry;
use stepflow_core::queue::QueueAdapter;
use stepflow_core::repository::WorkflowStore;
use stepflow_core::resilience::GuardRegistry;
use stepflow_core::workflow::WorkflowEngine;
use stepflow_infra::config::{load_engine_config, resolve_data_dir, resolve_database_url};
use stepflow_infra::modules::register_builtin_modules;
use stepflow_infra::sqlite::{DatabasePool, SqliteJobQueue, SqliteRunStore, SqliteWorkflowStore};
use stepflow_types::config::EngineConfig;
use stepflow_types::workflow::{DEFAULT_TENANT, WorkflowDefinition};

/// Engine pinned to the SQLite run store.
pub type ConcreteEngine = WorkflowEngine<SqliteRunStore>;

/// Queue adapter pinned to the SQLite stores and job queue.
pub type ConcreteAdapter = QueueAdapter<SqliteRunStore, SqliteWorkflowStore, SqliteJobQueue>;

/// Capacity of the in-process event bus.
const EVENT_BUS_CAPACITY: usize = 1024;

/// Shared application state for all CLI commands.
#[derive(Clone)]
pub struct AppState {
    pub data_dir: PathBuf,
    pub config: EngineConfig,
    pub db_pool: DatabasePool,
    pub modules: Arc<ModuleRegistry>,
    pub workflows: Arc<SqliteWorkflowStore>,
    pub queue: Arc<SqliteJobQueue>,
    pub engine: Arc<ConcreteEngine>,
    pub adapter: Arc<ConcreteAdapter>,
}

impl AppState {
    /// Load config, open the database, register modules and wire the engine.
    pub async fn init() -> Result<Self> {
        let data_dir = resolve_data_dir();
        tokio::fs::create_dir_all(&data_dir)
            .await
            .with_context(|| format!("Failed to create data directory {}", data_dir.display()))?;

        let config = load_engine_config(&data_dir).await;
        let db_url = resolve_database_url(&config, &data_dir);
        let db_pool = DatabasePool::new(&db_url)
            .await
            .with_context(|| format!("Failed to open database {db_url}"))?;

        let mut registry = ModuleRegistry::new();
        register_builtin_modules(&mut registry).context("Failed to register built-in modules")?;
        let modules = Arc::new(registry);

        let guards = Arc::new(GuardRegistry::new(config.resilience.clone()));
        let runs = Arc::new(SqliteRunStore::new(db_pool.clone()));
        let workflows = Arc::new(SqliteWorkflowStore::new(db_pool.clone()));
        let queue = Arc::new(SqliteJobQueue::new(db_pool.clone()));

        let engine = Arc::new(
            WorkflowEngine::new(Arc::clone(&modules), guards, runs)
                .with_event_bus(EventBus::new(EVENT_BUS_CAPACITY)),
        );
        let adapter = Arc::new(QueueAdapter::new(
            Arc::clone(&engine),
            Arc::clone(&workflows),
            Some(Arc::clone(&queue)),
            config.queue.clone(),
        ));

        tracing::debug!(data_dir = %data_dir.display(), modules = modules.len(), "application state ready");

        Ok(Self {
            data_dir,
            config,
            db_pool,
            modules,
            workflows,
            queue,
            engine,
            adapter,
        })
    }

    /// Find a stored workflow by UUID, or by name within `tenant`
    /// (default tenant when `None`).
    pub async fn resolve_workflow(
        &self,
        target: &str,
        tenant: Option<&str>,
    ) -> Result<WorkflowDefinition> {
        if let Ok(id) = target.parse::<Uuid>() {
            if let Some(def) = self
                .workflows
                .get_definition(&id)
                .await
                .context("Failed to look up workflow")?
            {
                return Ok(def);
            }
        }

        let tenant = tenant.unwrap_or(DEFAULT_TENANT);
        self.workflows
            .get_definition_by_name(tenant, target)
            .await
            .context("Failed to look up workflow")?
            .ok_or_else(|| anyhow::anyhow!("Workflow '{target}' not found for tenant '{tenant}'"))
    }
}
