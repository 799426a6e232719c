//! Workflow definition store trait.

use stepflow_types::error::RepositoryError;
use stepflow_types::workflow::WorkflowDefinition;
use uuid::Uuid;

/// Persistence for tenant-owned workflow definitions.
///
/// Names are unique per tenant; saving a second definition with an existing
/// tenant and name fails with `RepositoryError::Conflict`.
pub trait WorkflowStore: Send + Sync {
    /// Upsert a definition (insert or replace by ID).
    fn save_definition(
        &self,
        def: &WorkflowDefinition,
    ) -> impl std::future::Future<Output = Result<(), RepositoryError>> + Send;

    fn get_definition(
        &self,
        id: &Uuid,
    ) -> impl std::future::Future<Output = Result<Option<WorkflowDefinition>, RepositoryError>> + Send;

    fn get_definition_by_name(
        &self,
        tenant_id: &str,
        name: &str,
    ) -> impl std::future::Future<Output = Result<Option<WorkflowDefinition>, RepositoryError>> + Send;

    /// List definitions sorted by name, optionally for a single tenant.
    fn list_definitions(
        &self,
        tenant_id: Option<&str>,
    ) -> impl std::future::Future<Output = Result<Vec<WorkflowDefinition>, RepositoryError>> + Send;

    /// Delete a definition by ID. Returns `true` if it existed.
    fn delete_definition(
        &self,
        id: &Uuid,
    ) -> impl std::future::Future<Output = Result<bool, RepositoryError>> + Send;
}
