//! SQLite workflow definition store.
//!
//! Definitions are stored as JSON blobs alongside the tenant and name
//! columns used for lookup and the per-tenant uniqueness constraint.

use chrono::Utc;
use sqlx::Row;
use uuid::Uuid;

use stepflow_core::repository::WorkflowStore;
use stepflow_types::error::RepositoryError;
use stepflow_types::workflow::WorkflowDefinition;

use super::pool::DatabasePool;
use super::{format_datetime, from_json, query_err, to_json};

/// SQLite-backed implementation of `WorkflowStore`.
pub struct SqliteWorkflowStore {
    pool: DatabasePool,
}

impl SqliteWorkflowStore {
    pub fn new(pool: DatabasePool) -> Self {
        Self { pool }
    }
}

struct WorkflowDefRow {
    definition: String,
}

impl WorkflowDefRow {
    fn from_row(row: &sqlx::sqlite::SqliteRow) -> Result<Self, sqlx::Error> {
        Ok(Self {
            definition: row.try_get("definition")?,
        })
    }

    fn into_definition(self) -> Result<WorkflowDefinition, RepositoryError> {
        from_json(&self.definition, "workflow definition")
    }
}

fn decode(row: Option<sqlx::sqlite::SqliteRow>) -> Result<Option<WorkflowDefinition>, RepositoryError> {
    row.map(|row| {
        WorkflowDefRow::from_row(&row)
            .map_err(|e| RepositoryError::Query(e.to_string()))?
            .into_definition()
    })
    .transpose()
}

impl WorkflowStore for SqliteWorkflowStore {
    async fn save_definition(&self, def: &WorkflowDefinition) -> Result<(), RepositoryError> {
        let definition_json = to_json(def)?;
        let now = format_datetime(&Utc::now());

        sqlx::query(
            r#"INSERT INTO workflows (id, tenant_id, name, definition, created_at, updated_at)
               VALUES (?, ?, ?, ?, ?, ?)
               ON CONFLICT(id) DO UPDATE SET
                 tenant_id = excluded.tenant_id,
                 name = excluded.name,
                 definition = excluded.definition,
                 updated_at = excluded.updated_at"#,
        )
        .bind(def.id.to_string())
        .bind(&def.tenant_id)
        .bind(&def.name)
        .bind(&definition_json)
        .bind(&now)
        .bind(&now)
        .execute(&self.pool.writer)
        .await
        .map_err(|e| match e {
            sqlx::Error::Database(db) if db.is_unique_violation() => RepositoryError::Conflict(format!(
                "workflow '{}' already exists for tenant '{}'",
                def.name, def.tenant_id
            )),
            other => query_err(other),
        })?;

        tracing::debug!(workflow_id = %def.id, name = %def.name, "workflow definition saved");
        Ok(())
    }

    async fn get_definition(&self, id: &Uuid) -> Result<Option<WorkflowDefinition>, RepositoryError> {
        let row = sqlx::query("SELECT definition FROM workflows WHERE id = ?")
            .bind(id.to_string())
            .fetch_optional(&self.pool.reader)
            .await
            .map_err(query_err)?;
        decode(row)
    }

    async fn get_definition_by_name(
        &self,
        tenant_id: &str,
        name: &str,
    ) -> Result<Option<WorkflowDefinition>, RepositoryError> {
        let row = sqlx::query("SELECT definition FROM workflows WHERE tenant_id = ? AND name = ?")
            .bind(tenant_id)
            .bind(name)
            .fetch_optional(&self.pool.reader)
            .await
            .map_err(query_err)?;
        decode(row)
    }

    async fn list_definitions(
        &self,
        tenant_id: Option<&str>,
    ) -> Result<Vec<WorkflowDefinition>, RepositoryError> {
        let rows = match tenant_id {
            Some(tenant) => {
                sqlx::query(
                    "SELECT definition FROM workflows WHERE tenant_id = ? ORDER BY name ASC",
                )
                .bind(tenant)
                .fetch_all(&self.pool.reader)
                .await
            }
            None => {
                sqlx::query("SELECT definition FROM workflows ORDER BY tenant_id ASC, name ASC")
                    .fetch_all(&self.pool.reader)
                    .await
            }
        }
        .map_err(query_err)?;

        let mut defs = Vec::with_capacity(rows.len());
        for row in &rows {
            let r = WorkflowDefRow::from_row(row).map_err(|e| RepositoryError::Query(e.to_string()))?;
            defs.push(r.into_definition()?);
        }
        Ok(defs)
    }

    async fn delete_definition(&self, id: &Uuid) -> Result<bool, RepositoryError> {
        let result = sqlx::query("DELETE FROM workflows WHERE id = ?")
            .bind(id.to_string())
            .execute(&self.pool.writer)
            .await
            .map_err(query_err)?;

        Ok(result.rows_affected() > 0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::sqlite::test_pool;
    use serde_json::json;

    fn sample_definition(tenant: &str, name: &str) -> WorkflowDefinition {
        serde_json::from_value(json!({
            "name": name,
            "tenantId": tenant,
            "description": "Look up a lead and message them",
            "trigger": {"type": "cron", "schedule": "every 5 minutes"},
            "steps": [
                {"name": "lookup", "module": "crm.contacts.get",
                 "params": {"id": "{{input.contactId}}"}, "outputAs": "contact"}
            ],
            "requiredCredentials": ["crm"]
        }))
        .unwrap()
    }

    #[tokio::test]
    async fn test_save_and_get_definition() {
        let store = SqliteWorkflowStore::new(test_pool().await);
        let def = sample_definition("acme", "lead-followup");
        store.save_definition(&def).await.unwrap();

        let loaded = store.get_definition(&def.id).await.unwrap().unwrap();
        assert_eq!(loaded, def);
        assert!(store.get_definition(&Uuid::now_v7()).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_save_definition_upsert() {
        let store = SqliteWorkflowStore::new(test_pool().await);
        let mut def = sample_definition("acme", "lead-followup");
        store.save_definition(&def).await.unwrap();

        def.description = Some("updated".to_string());
        store.save_definition(&def).await.unwrap();

        let loaded = store.get_definition(&def.id).await.unwrap().unwrap();
        assert_eq!(loaded.description.as_deref(), Some("updated"));
        assert_eq!(store.list_definitions(None).await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_name_unique_per_tenant() {
        let store = SqliteWorkflowStore::new(test_pool().await);
        store.save_definition(&sample_definition("acme", "sync")).await.unwrap();
        store.save_definition(&sample_definition("globex", "sync")).await.unwrap();

        let clash = store.save_definition(&sample_definition("acme", "sync")).await;
        assert!(matches!(clash, Err(RepositoryError::Conflict(_))));
    }

    #[tokio::test]
    async fn test_get_by_name_and_list_by_tenant() {
        let store = SqliteWorkflowStore::new(test_pool().await);
        let a = sample_definition("acme", "b-flow");
        let b = sample_definition("acme", "a-flow");
        let c = sample_definition("globex", "c-flow");
        for def in [&a, &b, &c] {
            store.save_definition(def).await.unwrap();
        }

        let found = store.get_definition_by_name("acme", "b-flow").await.unwrap();
        assert_eq!(found.map(|d| d.id), Some(a.id));
        assert!(store.get_definition_by_name("globex", "b-flow").await.unwrap().is_none());

        let acme: Vec<String> = store
            .list_definitions(Some("acme"))
            .await
            .unwrap()
            .into_iter()
            .map(|d| d.name)
            .collect();
        assert_eq!(acme, vec!["a-flow", "b-flow"]);
        assert_eq!(store.list_definitions(None).await.unwrap().len(), 3);
    }

    #[tokio::test]
    async fn test_delete_definition() {
        let store = SqliteWorkflowStore::new(test_pool().await);
        let def = sample_definition("acme", "gone");
        store.save_definition(&def).await.unwrap();

        assert!(store.delete_definition(&def.id).await.unwrap());
        assert!(!store.delete_definition(&def.id).await.unwrap());
        assert!(store.get_definition(&def.id).await.unwrap().is_none());
    }
}
