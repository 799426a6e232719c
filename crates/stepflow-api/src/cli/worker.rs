//! Worker process and job listing.
//!
//! `sflow worker` runs queue worker loops plus a cron trigger for every
//! stored workflow with a cron schedule, until Ctrl+C or SIGTERM.

use std::sync::Arc;

use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use comfy_table::{Cell, Color, ContentArrangement, Table, presets};
use console::style;
use futures_util::future::BoxFuture;
use serde_json::json;
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use stepflow_core::queue::{JobQueue, spawn_workers};
use stepflow_core::repository::WorkflowStore;
use stepflow_core::workflow::cron::{CronCallback, CronTrigger};
use stepflow_types::queue::{JobStatus, TriggerSubmission};
use stepflow_types::workflow::TriggerType;

use super::{job_status_cell, print_json, short_id};
use crate::state::{AppState, ConcreteAdapter};

// ---------------------------------------------------------------------------
// Worker
// ---------------------------------------------------------------------------

pub async fn handle_worker(
    concurrency: Option<usize>,
    no_cron: bool,
    state: &AppState,
    quiet: bool,
) -> Result<()> {
    let concurrency = concurrency.unwrap_or(state.config.worker.concurrency).max(1);
    let shutdown = CancellationToken::new();

    let mut workers = spawn_workers(
        Arc::clone(&state.engine),
        Arc::clone(&state.queue),
        state.config.queue.clone(),
        concurrency,
        shutdown.clone(),
    )
    .await
    .context("Failed to start workers")?;

    let cron = if no_cron {
        None
    } else {
        Some(start_cron(state).await?)
    };

    if !quiet {
        let scheduled = cron.as_ref().map_or(0, |(_, n)| *n);
        println!();
        println!(
            "  {} stepflow worker running ({concurrency} worker loops, {scheduled} cron workflows)",
            style("⚡").bold(),
        );
        println!("  {}", style("Press Ctrl+C to stop").dim());
        println!();
    }

    shutdown_signal().await;
    tracing::info!("shutdown requested, draining workers");
    shutdown.cancel();

    if let Some((trigger, _)) = cron {
        if let Err(e) = trigger.stop().await {
            tracing::warn!(error = %e, "failed to stop cron trigger");
        }
    }
    while let Some(joined) = workers.join_next().await {
        if let Err(e) = joined {
            tracing::warn!(error = %e, "worker task ended abnormally");
        }
    }
    state.db_pool.close().await;

    if !quiet {
        println!("\n  Worker stopped.");
    }
    Ok(())
}

/// Schedule every stored workflow that has a cron trigger. Returns the
/// running trigger and how many workflows it schedules.
async fn start_cron(state: &AppState) -> Result<(CronTrigger, usize)> {
    let trigger = CronTrigger::new();
    trigger.start().await.context("Failed to start cron scheduler")?;

    let defs = state
        .workflows
        .list_definitions(None)
        .await
        .context("Failed to list workflows")?;

    for def in defs.iter().filter(|d| d.trigger.trigger_type == TriggerType::Cron) {
        let Some(schedule) = def.trigger.schedule.as_deref() else {
            tracing::warn!(workflow = %def.name, "cron workflow has no schedule, skipping");
            continue;
        };
        let callback = submit_on_fire(Arc::clone(&state.adapter), def.tenant_id.clone());
        if let Err(e) = trigger.schedule(def.id, schedule, callback).await {
            tracing::warn!(workflow = %def.name, schedule, error = %e, "failed to schedule workflow");
        }
    }

    let count = trigger.scheduled_count().await;
    Ok((trigger, count))
}

/// Cron callback submitting a `cron` run with `{firedAt}` as trigger data.
fn submit_on_fire(adapter: Arc<ConcreteAdapter>, tenant_id: String) -> CronCallback {
    Arc::new(move |workflow_id: Uuid, fired_at: DateTime<Utc>| -> BoxFuture<'static, ()> {
        let adapter = Arc::clone(&adapter);
        let submission = TriggerSubmission::new(workflow_id, tenant_id.clone(), TriggerType::Cron)
            .with_data(json!({ "firedAt": fired_at.to_rfc3339() }));
        Box::pin(async move {
            match adapter.submit(submission).await {
                Ok(receipt) => tracing::info!(
                    %workflow_id,
                    run_id = %receipt.run_id,
                    queued = receipt.queued,
                    "cron run submitted"
                ),
                Err(e) => tracing::warn!(%workflow_id, error = %e, "cron submission failed"),
            }
        })
    })
}

/// Wait for Ctrl+C or SIGTERM.
async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            tracing::warn!(error = %e, "failed to listen for Ctrl+C");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut signal) => {
                signal.recv().await;
            }
            Err(e) => {
                tracing::warn!(error = %e, "failed to listen for SIGTERM");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {},
        _ = terminate => {},
    }
}

// ---------------------------------------------------------------------------
// Jobs
// ---------------------------------------------------------------------------

pub async fn handle_jobs(status: Option<JobStatus>, limit: u32, state: &AppState, json: bool) -> Result<()> {
    let jobs = state
        .queue
        .list(status, limit)
        .await
        .context("Failed to list jobs")?;

    if json {
        return print_json(&jobs);
    }

    if jobs.is_empty() {
        println!();
        println!("  No jobs.");
        println!();
        return Ok(());
    }

    let mut table = Table::new();
    table
        .load_preset(presets::UTF8_FULL_CONDENSED)
        .set_content_arrangement(ContentArrangement::Dynamic)
        .set_header(vec![
            Cell::new("Job").fg(Color::Cyan),
            Cell::new("Run"),
            Cell::new("Status"),
            Cell::new("Priority"),
            Cell::new("Attempt"),
            Cell::new("Available"),
            Cell::new("Worker"),
            Cell::new("Last error"),
        ]);

    for job in &jobs {
        table.add_row(vec![
            Cell::new(short_id(&job.id)),
            Cell::new(short_id(&job.run_id)),
            job_status_cell(job.status),
            Cell::new(job.priority),
            Cell::new(format!("{}/{}", job.attempt, job.max_attempts)),
            Cell::new(job.available_at.format("%Y-%m-%d %H:%M:%S").to_string()),
            Cell::new(job.claimed_by.as_deref().unwrap_or("-")),
            Cell::new(job.last_error.as_deref().unwrap_or("")),
        ]);
    }

    println!();
    println!("{table}");
    println!();
    Ok(())
}
