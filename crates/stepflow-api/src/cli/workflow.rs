//! CLI workflow definition subcommands.
//!
//! Provides validate, create, list, show and delete for workflow
//! definitions. Runs are handled in [`super::run`].

use std::path::{Path, PathBuf};

use anyhow::{Context, Result, bail};
use clap::Subcommand;
use comfy_table::{Cell, Color, ContentArrangement, Table, presets};
use console::style;

use stepflow_core::repository::WorkflowStore;
use stepflow_core::workflow::{
    ValidationReport, WorkflowError, load_definition_file, serialize_definition_yaml,
    validate_definition,
};
use stepflow_types::workflow::{TriggerType, WorkflowDefinition};

use super::print_json;
use crate::state::AppState;

/// Workflow definition subcommands.
#[derive(Subcommand)]
pub enum WorkflowCommand {
    /// Validate a workflow file without saving it.
    Validate {
        /// Path to the workflow YAML or JSON file.
        file: PathBuf,
    },

    /// Validate and save a workflow from a YAML or JSON file.
    Create {
        /// Path to the workflow YAML or JSON file.
        file: PathBuf,
    },

    /// List saved workflows.
    List {
        /// Only show workflows of this tenant.
        #[arg(long)]
        tenant: Option<String>,
    },

    /// Show a saved workflow definition.
    Show {
        /// Workflow name or UUID.
        target: String,

        #[arg(long)]
        tenant: Option<String>,
    },

    /// Delete a saved workflow. Existing runs are kept.
    Delete {
        /// Workflow name or UUID.
        target: String,

        #[arg(long)]
        tenant: Option<String>,
    },
}

/// Handle a workflow subcommand.
pub async fn handle_workflow_command(cmd: WorkflowCommand, state: &AppState, json: bool) -> Result<()> {
    match cmd {
        WorkflowCommand::Validate { file } => handle_validate(&file, state, json),
        WorkflowCommand::Create { file } => handle_create(&file, state, json).await,
        WorkflowCommand::List { tenant } => handle_list(tenant.as_deref(), state, json).await,
        WorkflowCommand::Show { target, tenant } => {
            handle_show(&target, tenant.as_deref(), state, json).await
        }
        WorkflowCommand::Delete { target, tenant } => {
            handle_delete(&target, tenant.as_deref(), state, json).await
        }
    }
}

/// Parse and validate a file. Validation errors are printed, then returned
/// as a single failure.
fn load_validated(
    file: &Path,
    state: &AppState,
    json: bool,
) -> Result<(WorkflowDefinition, ValidationReport)> {
    let def = load_definition_file(file).map_err(|e| match e {
        WorkflowError::Io(io) => anyhow::anyhow!("Failed to read {}: {io}", file.display()),
        WorkflowError::Parse(msg) => anyhow::anyhow!("Failed to parse {}: {msg}", file.display()),
        other => anyhow::anyhow!("Failed to load workflow: {other}"),
    })?;

    match validate_definition(&def, &state.modules, state.config.validation.unknown_reference) {
        Ok(report) => Ok((def, report)),
        Err(WorkflowError::Invalid { errors }) => {
            print_findings(&def.name, &errors, &[], json)?;
            bail!("Workflow '{}' has {} validation error(s)", def.name, errors.len())
        }
        Err(other) => {
            let errors = vec![other.to_string()];
            print_findings(&def.name, &errors, &[], json)?;
            bail!("Workflow '{}' is invalid", def.name)
        }
    }
}

fn print_findings(name: &str, errors: &[String], warnings: &[String], json: bool) -> Result<()> {
    if json {
        return print_json(&serde_json::json!({
            "workflow": name,
            "valid": errors.is_empty(),
            "errors": errors,
            "warnings": warnings,
        }));
    }

    println!();
    for err in errors {
        println!("  {} {err}", style("error:").red().bold());
    }
    for warning in warnings {
        println!("  {} {warning}", style("warning:").yellow().bold());
    }
    if errors.is_empty() {
        println!(
            "  {} Workflow '{}' is valid",
            style("*").green().bold(),
            style(name).cyan()
        );
    }
    println!();
    Ok(())
}

// ---------------------------------------------------------------------------
// Validate / Create
// ---------------------------------------------------------------------------

fn handle_validate(file: &Path, state: &AppState, json: bool) -> Result<()> {
    let (def, report) = load_validated(file, state, json)?;
    print_findings(&def.name, &[], &report.warnings, json)
}

async fn handle_create(file: &Path, state: &AppState, json: bool) -> Result<()> {
    let (mut def, report) = load_validated(file, state, json)?;

    // Re-creating a workflow by name updates it in place.
    let existing = state
        .workflows
        .get_definition_by_name(&def.tenant_id, &def.name)
        .await
        .context("Failed to look up existing workflow")?;
    let updated = existing.is_some();
    if let Some(existing) = existing {
        def.id = existing.id;
    }

    state
        .workflows
        .save_definition(&def)
        .await
        .context("Failed to save workflow")?;

    if json {
        return print_json(&serde_json::json!({
            "id": def.id,
            "name": def.name,
            "tenantId": def.tenant_id,
            "steps": def.steps.len(),
            "updated": updated,
            "warnings": report.warnings,
        }));
    }

    println!();
    for warning in &report.warnings {
        println!("  {} {warning}", style("warning:").yellow().bold());
    }
    println!(
        "  {} {} workflow '{}'",
        style("*").green().bold(),
        if updated { "Updated" } else { "Created" },
        style(&def.name).cyan()
    );
    println!("  ID:      {}", def.id);
    println!("  Tenant:  {}", def.tenant_id);
    println!("  Steps:   {}", def.steps.len());
    println!("  Trigger: {}", trigger_label(&def));
    println!();
    Ok(())
}

fn trigger_label(def: &WorkflowDefinition) -> String {
    match (&def.trigger.trigger_type, &def.trigger.schedule) {
        (TriggerType::Cron, Some(schedule)) => format!("cron ({schedule})"),
        (kind, _) => kind.to_string(),
    }
}

// ---------------------------------------------------------------------------
// List / Show / Delete
// ---------------------------------------------------------------------------

async fn handle_list(tenant: Option<&str>, state: &AppState, json: bool) -> Result<()> {
    let defs = state
        .workflows
        .list_definitions(tenant)
        .await
        .context("Failed to list workflows")?;

    if json {
        let out: Vec<_> = defs
            .iter()
            .map(|d| {
                serde_json::json!({
                    "id": d.id,
                    "name": d.name,
                    "tenantId": d.tenant_id,
                    "steps": d.steps.len(),
                    "trigger": d.trigger,
                })
            })
            .collect();
        return print_json(&out);
    }

    if defs.is_empty() {
        println!();
        println!("  No workflows saved.");
        println!(
            "  Create one with: {}",
            style("sflow workflow create <file.yaml>").dim()
        );
        println!();
        return Ok(());
    }

    let mut table = Table::new();
    table
        .load_preset(presets::UTF8_FULL_CONDENSED)
        .set_content_arrangement(ContentArrangement::Dynamic)
        .set_header(vec![
            Cell::new("Name").fg(Color::Cyan),
            Cell::new("Tenant"),
            Cell::new("Steps"),
            Cell::new("Trigger"),
            Cell::new("ID"),
        ]);

    for d in &defs {
        table.add_row(vec![
            Cell::new(&d.name),
            Cell::new(&d.tenant_id),
            Cell::new(d.steps.len()),
            Cell::new(trigger_label(d)),
            Cell::new(d.id),
        ]);
    }

    println!();
    println!("{table}");
    println!();
    Ok(())
}

async fn handle_show(target: &str, tenant: Option<&str>, state: &AppState, json: bool) -> Result<()> {
    let def = state.resolve_workflow(target, tenant).await?;

    if json {
        return print_json(&def);
    }

    let yaml = serialize_definition_yaml(&def).context("Failed to render workflow")?;
    println!("{yaml}");
    Ok(())
}

async fn handle_delete(target: &str, tenant: Option<&str>, state: &AppState, json: bool) -> Result<()> {
    let def = state.resolve_workflow(target, tenant).await?;
    let deleted = state
        .workflows
        .delete_definition(&def.id)
        .await
        .context("Failed to delete workflow")?;

    if json {
        return print_json(&serde_json::json!({ "id": def.id, "deleted": deleted }));
    }

    println!();
    println!(
        "  {} Deleted workflow '{}'",
        style("*").green().bold(),
        style(&def.name).cyan()
    );
    println!();
    Ok(())
}
