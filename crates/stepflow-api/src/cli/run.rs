//! CLI run subcommands: submit, run, status, steps, history, cancel and
//! stale-run inspection.

use std::time::Duration;

use anyhow::{Context, Result, bail};
use clap::Subcommand;
use comfy_table::{Cell, Color, ContentArrangement, Table, presets};
use console::style;
use indicatif::{ProgressBar, ProgressStyle};
use tokio::sync::broadcast;
use uuid::Uuid;

use stepflow_core::event::WorkflowEvent;
use stepflow_core::repository::RunStore;
use stepflow_core::workflow::CancelOutcome;
use stepflow_types::queue::TriggerSubmission;
use stepflow_types::workflow::{RunResult, RunStatus, TriggerType, WorkflowRun};

use super::{parse_data, parse_run_id, print_json, run_status_cell, short_id, step_status_cell};
use crate::state::AppState;

#[derive(Subcommand)]
pub enum RunsCommand {
    /// List runs still marked running (candidates for recovery).
    Stale,
}

// ---------------------------------------------------------------------------
// Submit
// ---------------------------------------------------------------------------

pub struct SubmitArgs<'a> {
    pub workflow: &'a str,
    pub data: Option<&'a str>,
    pub priority: Option<i32>,
    pub trigger: TriggerType,
    pub tenant: Option<&'a str>,
}

pub async fn handle_submit(args: SubmitArgs<'_>, state: &AppState, json: bool) -> Result<()> {
    let def = state.resolve_workflow(args.workflow, args.tenant).await?;
    let mut submission = TriggerSubmission::new(def.id, def.tenant_id.clone(), args.trigger)
        .with_data(parse_data(args.data)?);
    if let Some(priority) = args.priority {
        submission = submission.with_priority(priority);
    }

    let receipt = state
        .adapter
        .submit(submission)
        .await
        .context("Failed to submit run")?;

    if json {
        return print_json(&receipt);
    }

    println!();
    if receipt.queued {
        println!(
            "  {} Queued run of '{}'",
            style("*").green().bold(),
            style(&def.name).cyan()
        );
        println!("  Run ID: {}", receipt.run_id);
        if let Some(job_id) = receipt.job_id {
            println!("  Job ID: {job_id}");
        }
        println!();
        println!(
            "  Check progress: {}",
            style(format!("sflow status {}", receipt.run_id)).dim()
        );
    } else {
        println!(
            "  {} Queue unavailable, ran '{}' inline",
            style("!").yellow().bold(),
            style(&def.name).cyan()
        );
        if let Some(result) = &receipt.result {
            print_result(result);
        }
    }
    println!();
    Ok(())
}

// ---------------------------------------------------------------------------
// Run (inline)
// ---------------------------------------------------------------------------

pub async fn handle_run(
    workflow: &str,
    data: Option<&str>,
    follow: bool,
    tenant: Option<&str>,
    state: &AppState,
    json: bool,
    quiet: bool,
) -> Result<()> {
    let def = state.resolve_workflow(workflow, tenant).await?;
    let submission = TriggerSubmission::new(def.id, def.tenant_id.clone(), TriggerType::Manual)
        .with_data(parse_data(data)?);

    let printer = (follow && !json).then(|| tokio::spawn(follow_events(state.engine.events().subscribe())));
    let spinner = (!follow && !json && !quiet).then(|| {
        let spinner = ProgressBar::new_spinner();
        if let Ok(spinner_style) = ProgressStyle::default_spinner().template("{spinner:.cyan} {msg}") {
            spinner.set_style(spinner_style);
        }
        spinner.set_message(format!("Running '{}'...", def.name));
        spinner.enable_steady_tick(Duration::from_millis(80));
        spinner
    });

    let outcome = state.adapter.execute_inline(submission).await;

    if let Some(spinner) = spinner {
        spinner.finish_and_clear();
    }
    if let Some(printer) = printer {
        printer.abort();
    }
    let result = outcome.context("Failed to run workflow")?;

    if json {
        print_json(&result)?;
    } else if !quiet {
        println!();
        print_result(&result);
        println!();
    }

    if result.status != RunStatus::Success {
        bail!("Run {} finished with status {}", result.run_id, result.status);
    }
    Ok(())
}

/// Print step progress events until the task is aborted.
async fn follow_events(mut rx: broadcast::Receiver<WorkflowEvent>) {
    loop {
        match rx.recv().await {
            Ok(event) => print_event(&event),
            Err(broadcast::error::RecvError::Lagged(missed)) => {
                println!("  {}", style(format!("... {missed} events dropped")).dim());
            }
            Err(broadcast::error::RecvError::Closed) => break,
        }
    }
}

fn print_event(event: &WorkflowEvent) {
    match event {
        WorkflowEvent::RunStarted { run_id, workflow, attempt } => println!(
            "  {} run {} of '{}' started (attempt {attempt})",
            style(">").cyan().bold(),
            short_id(run_id),
            workflow
        ),
        WorkflowEvent::StepStarted { step, module, .. } => {
            println!("  {} {step} ({})", style("~").blue(), style(module).dim())
        }
        WorkflowEvent::StepSucceeded { step, duration_ms, .. } => println!(
            "  {} {step} {}",
            style("✓").green(),
            style(format!("{duration_ms}ms")).dim()
        ),
        WorkflowEvent::StepSkipped { step, .. } => {
            println!("  {} {step} skipped", style("-").magenta())
        }
        WorkflowEvent::StepFailed { step, kind, error, .. } => {
            println!("  {} {step} [{kind}] {}", style("✗").red(), style(error).red())
        }
        WorkflowEvent::RunFinished { .. } => {}
    }
}

fn print_result(result: &RunResult) {
    let status = match result.status {
        RunStatus::Success => style(result.status.as_str()).green(),
        RunStatus::Error => style(result.status.as_str()).red(),
        _ => style(result.status.as_str()).yellow(),
    };
    println!("  Run:     {}", result.run_id);
    println!("  Status:  {status}");
    if let Some(kind) = result.error_kind {
        println!("  Kind:    {kind}");
    }
    if let Some(step) = &result.error_step {
        println!("  Step:    {}", style(step).cyan());
    }
    if let Some(err) = &result.error {
        println!("  Error:   {}", style(err).red());
    }
    if let (Some(started), Some(completed)) = (result.started_at, result.completed_at) {
        println!("  Took:    {}ms", (completed - started).num_milliseconds());
    }
    if let Some(output) = &result.output {
        let rendered = serde_json::to_string_pretty(output).unwrap_or_else(|_| output.to_string());
        println!("  Output:");
        for line in rendered.lines() {
            println!("    {line}");
        }
    }
}

// ---------------------------------------------------------------------------
// Status / Steps
// ---------------------------------------------------------------------------

async fn load_run(state: &AppState, raw_id: &str) -> Result<WorkflowRun> {
    let run_id = parse_run_id(raw_id)?;
    state
        .engine
        .store()
        .get_run(&run_id)
        .await
        .context("Failed to get run")?
        .ok_or_else(|| anyhow::anyhow!("Run {run_id} not found"))
}

pub async fn handle_status(raw_id: &str, state: &AppState, json: bool) -> Result<()> {
    let run = load_run(state, raw_id).await?;

    if json {
        return print_json(&run.result());
    }

    println!();
    println!(
        "  {} '{}' ({} trigger, attempt {})",
        style("Workflow:").bold(),
        style(&run.workflow_name).cyan(),
        run.trigger_type,
        run.attempt
    );
    if let Some(retry_of) = run.retry_of {
        println!("  Retry of: {retry_of}");
    }
    if run.cancel_requested && !run.status.is_terminal() {
        println!("  {}", style("Cancellation requested").yellow());
    }
    print_result(&run.result());
    println!();
    Ok(())
}

pub async fn handle_steps(raw_id: &str, state: &AppState, json: bool) -> Result<()> {
    let run = load_run(state, raw_id).await?;

    if json {
        return print_json(&run.steps);
    }

    let mut table = Table::new();
    table
        .load_preset(presets::UTF8_FULL_CONDENSED)
        .set_content_arrangement(ContentArrangement::Dynamic)
        .set_header(vec![
            Cell::new("#").fg(Color::Cyan),
            Cell::new("Step").fg(Color::Cyan),
            Cell::new("Module"),
            Cell::new("Status"),
            Cell::new("Duration"),
            Cell::new("Error"),
        ]);

    for (i, step) in run.steps.iter().enumerate() {
        let duration = match (step.started_at, step.finished_at) {
            (Some(start), Some(end)) => format!("{}ms", (end - start).num_milliseconds()),
            _ => "-".to_string(),
        };
        let error = match (step.error_kind, &step.error) {
            (Some(kind), Some(err)) => format!("[{kind}] {err}"),
            (None, Some(err)) => err.clone(),
            _ => String::new(),
        };
        table.add_row(vec![
            Cell::new(i + 1),
            Cell::new(&step.step_name),
            Cell::new(&step.module),
            step_status_cell(step.status),
            Cell::new(duration),
            Cell::new(error).fg(Color::Red),
        ]);
    }

    println!();
    println!(
        "  Steps of run {} ('{}', {})",
        style(short_id(&run.id)).cyan(),
        run.workflow_name,
        run.status
    );
    println!();
    println!("{table}");
    for step in run.steps.iter().filter(|s| s.error_details.is_some()) {
        if let Some(details) = &step.error_details {
            println!("  {} details: {details}", style(&step.step_name).red());
        }
    }
    println!();
    Ok(())
}

// ---------------------------------------------------------------------------
// History / stale runs
// ---------------------------------------------------------------------------

fn runs_table(runs: &[WorkflowRun]) -> Table {
    let mut table = Table::new();
    table
        .load_preset(presets::UTF8_FULL_CONDENSED)
        .set_content_arrangement(ContentArrangement::Dynamic)
        .set_header(vec![
            Cell::new("Run ID").fg(Color::Cyan),
            Cell::new("Workflow"),
            Cell::new("Status"),
            Cell::new("Trigger"),
            Cell::new("Attempt"),
            Cell::new("Queued"),
            Cell::new("Error"),
        ]);

    for r in runs {
        table.add_row(vec![
            Cell::new(short_id(&r.id)),
            Cell::new(&r.workflow_name),
            run_status_cell(r.status),
            Cell::new(r.trigger_type),
            Cell::new(r.attempt),
            Cell::new(r.queued_at.format("%Y-%m-%d %H:%M:%S").to_string()),
            Cell::new(r.error_step.as_deref().unwrap_or("")),
        ]);
    }
    table
}

pub async fn handle_history(
    workflow: &str,
    limit: u32,
    tenant: Option<&str>,
    state: &AppState,
    json: bool,
) -> Result<()> {
    let def = state.resolve_workflow(workflow, tenant).await?;
    let runs = state
        .engine
        .store()
        .list_runs(&def.id, limit)
        .await
        .context("Failed to list runs")?;

    if json {
        let out: Vec<RunResult> = runs.iter().map(WorkflowRun::result).collect();
        return print_json(&out);
    }

    if runs.is_empty() {
        println!();
        println!("  No runs for workflow '{}'.", def.name);
        println!();
        return Ok(());
    }

    println!();
    println!("  Runs for workflow '{}'", style(&def.name).cyan());
    println!();
    println!("{}", runs_table(&runs));
    println!();
    Ok(())
}

pub async fn handle_runs_command(cmd: RunsCommand, state: &AppState, json: bool) -> Result<()> {
    match cmd {
        RunsCommand::Stale => {
            let runs = state
                .engine
                .store()
                .list_stale_runs()
                .await
                .context("Failed to list stale runs")?;

            if json {
                let out: Vec<RunResult> = runs.iter().map(WorkflowRun::result).collect();
                return print_json(&out);
            }
            println!();
            if runs.is_empty() {
                println!("  No runs are marked running.");
            } else {
                println!("{}", runs_table(&runs));
            }
            println!();
            Ok(())
        }
    }
}

// ---------------------------------------------------------------------------
// Cancel
// ---------------------------------------------------------------------------

pub async fn handle_cancel(raw_id: &str, state: &AppState, json: bool) -> Result<()> {
    let run_id: Uuid = parse_run_id(raw_id)?;
    let outcome = state
        .engine
        .cancel(run_id)
        .await
        .with_context(|| format!("Failed to cancel run {run_id}"))?;

    let message = match outcome {
        CancelOutcome::Finished => "cancelled",
        CancelOutcome::Requested => "cancellation requested",
    };

    if json {
        return print_json(&serde_json::json!({ "runId": run_id, "outcome": message }));
    }

    println!();
    println!(
        "  {} Run {}: {message}",
        style("*").green().bold(),
        style(short_id(&run_id)).cyan()
    );
    if outcome == CancelOutcome::Requested {
        println!(
            "  {}",
            style("The executing worker stops before its next step.").dim()
        );
    }
    println!();
    Ok(())
}
