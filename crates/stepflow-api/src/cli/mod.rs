//! CLI command definitions for the `sflow` binary.
//!
//! Uses clap derive macros for argument parsing. Workflow definitions live
//! under `sflow workflow ...`; runs, jobs and workers are top-level verbs.

pub mod module;
pub mod run;
pub mod worker;
pub mod workflow;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use clap_complete::Shell;
use comfy_table::{Cell, Color};
use serde::Serialize;
use serde_json::Value;
use uuid::Uuid;

use stepflow_types::queue::JobStatus;
use stepflow_types::workflow::{RunStatus, StepStatus, TriggerType};

/// Run multi-step integration workflows.
#[derive(Parser)]
#[command(name = "sflow", version, about, long_about = None)]
#[command(propagate_version = true)]
pub struct Cli {
    /// Output machine-readable JSON instead of styled text.
    #[arg(long, global = true)]
    pub json: bool,

    /// Suppress all output except errors.
    #[arg(long, global = true)]
    pub quiet: bool,

    /// Detailed output (-v for verbose, -vv for debug/trace).
    #[arg(short, long, action = clap::ArgAction::Count, global = true)]
    pub verbose: u8,

    /// Emit log lines as JSON.
    #[arg(long, global = true)]
    pub log_json: bool,

    /// Export tracing spans through OpenTelemetry (stdout exporter).
    #[arg(long, global = true)]
    pub otel: bool,

    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Subcommand)]
pub enum Commands {
    /// Manage workflow definitions (validate, create, list, show, delete).
    Workflow {
        #[command(subcommand)]
        action: workflow::WorkflowCommand,
    },

    /// Submit a run through the durable queue (runs inline if the queue is down).
    Submit {
        /// Workflow name or UUID.
        workflow: String,

        /// Trigger data as a JSON object.
        #[arg(long)]
        data: Option<String>,

        /// Queue priority, higher is claimed first.
        #[arg(long)]
        priority: Option<i32>,

        /// Trigger type recorded on the run.
        #[arg(long, default_value = "manual", value_parser = parse_trigger_type)]
        trigger: TriggerType,

        /// Tenant owning the workflow (when addressing it by name).
        #[arg(long)]
        tenant: Option<String>,
    },

    /// Execute a run inline and wait for its result.
    Run {
        /// Workflow name or UUID.
        workflow: String,

        /// Trigger data as a JSON object.
        #[arg(long)]
        data: Option<String>,

        /// Print step progress as it happens.
        #[arg(long)]
        follow: bool,

        /// Tenant owning the workflow (when addressing it by name).
        #[arg(long)]
        tenant: Option<String>,
    },

    /// Show the result of a run.
    Status {
        /// Run UUID.
        run_id: String,
    },

    /// Show the step records of a run.
    Steps {
        /// Run UUID.
        run_id: String,
    },

    /// Show recent runs of a workflow.
    History {
        /// Workflow name or UUID.
        workflow: String,

        /// Maximum number of runs to display.
        #[arg(long, default_value = "20")]
        limit: u32,

        /// Tenant owning the workflow (when addressing it by name).
        #[arg(long)]
        tenant: Option<String>,
    },

    /// Cancel a queued or running run.
    Cancel {
        /// Run UUID.
        run_id: String,
    },

    /// Inspect runs across workflows.
    Runs {
        #[command(subcommand)]
        action: run::RunsCommand,
    },

    /// List queued jobs.
    Jobs {
        /// Filter by job status (pending, running, succeeded, failed, cancelled).
        #[arg(long, value_parser = parse_job_status)]
        status: Option<JobStatus>,

        /// Maximum number of jobs to display.
        #[arg(long, default_value = "50")]
        limit: u32,
    },

    /// Run queue workers (and cron triggers) until interrupted.
    Worker {
        /// Number of concurrent worker loops (default from config).
        #[arg(long)]
        concurrency: Option<usize>,

        /// Do not schedule cron-triggered workflows.
        #[arg(long)]
        no_cron: bool,
    },

    /// List registered modules.
    Modules,

    /// Print the effective configuration.
    Config,

    /// Generate shell completions.
    Completions {
        /// Shell to generate completions for.
        shell: Shell,
    },
}

// ---------------------------------------------------------------------------
// Argument parsers
// ---------------------------------------------------------------------------

fn parse_trigger_type(s: &str) -> Result<TriggerType, String> {
    s.parse()
}

fn parse_job_status(s: &str) -> Result<JobStatus, String> {
    s.parse()
}

/// Parse a `--data` argument; absent means an empty object.
pub fn parse_data(raw: Option<&str>) -> Result<Value> {
    match raw {
        Some(raw) => {
            let value: Value = serde_json::from_str(raw).context("Invalid JSON for --data")?;
            if !value.is_object() {
                anyhow::bail!("--data must be a JSON object");
            }
            Ok(value)
        }
        None => Ok(Value::Object(serde_json::Map::new())),
    }
}

pub fn parse_run_id(raw: &str) -> Result<Uuid> {
    raw.parse()
        .with_context(|| format!("Invalid run ID: '{raw}'"))
}

// ---------------------------------------------------------------------------
// Output helpers
// ---------------------------------------------------------------------------

pub fn print_json<T: Serialize>(value: &T) -> Result<()> {
    println!("{}", serde_json::to_string_pretty(value)?);
    Ok(())
}

pub fn short_id(id: &Uuid) -> String {
    id.to_string().chars().take(8).collect()
}

pub fn run_status_cell(status: RunStatus) -> Cell {
    let color = match status {
        RunStatus::Queued => Color::Yellow,
        RunStatus::Running => Color::Blue,
        RunStatus::Success => Color::Green,
        RunStatus::Error => Color::Red,
        RunStatus::Cancelled => Color::DarkYellow,
    };
    Cell::new(status.as_str()).fg(color)
}

pub fn step_status_cell(status: StepStatus) -> Cell {
    let color = match status {
        StepStatus::Pending => Color::DarkGrey,
        StepStatus::Skipped => Color::Magenta,
        StepStatus::Running => Color::Blue,
        StepStatus::Succeeded => Color::Green,
        StepStatus::Failed => Color::Red,
    };
    Cell::new(status.as_str()).fg(color)
}

pub fn job_status_cell(status: JobStatus) -> Cell {
    let color = match status {
        JobStatus::Pending => Color::Yellow,
        JobStatus::Running => Color::Blue,
        JobStatus::Succeeded => Color::Green,
        JobStatus::Failed => Color::Red,
        JobStatus::Cancelled => Color::DarkYellow,
    };
    Cell::new(status.as_str()).fg(color)
}

#[cfg(test)]
mod tests {
    use super::*;
    use clap::CommandFactory;
    use serde_json::json;

    #[test]
    fn test_cli_definition_is_valid() {
        Cli::command().debug_assert();
    }

    #[test]
    fn test_parse_submit_flags() {
        let cli = Cli::try_parse_from([
            "sflow", "--json", "submit", "lead-followup", "--data", r#"{"id":1}"#, "--priority", "5",
            "--trigger", "webhook",
        ])
        .unwrap();
        assert!(cli.json);
        match cli.command {
            Commands::Submit {
                workflow,
                priority,
                trigger,
                ..
            } => {
                assert_eq!(workflow, "lead-followup");
                assert_eq!(priority, Some(5));
                assert_eq!(trigger, TriggerType::Webhook);
            }
            _ => panic!("expected submit"),
        }
    }

    #[test]
    fn test_rejects_unknown_trigger_and_job_status() {
        assert!(Cli::try_parse_from(["sflow", "submit", "wf", "--trigger", "email"]).is_err());
        assert!(Cli::try_parse_from(["sflow", "jobs", "--status", "lost"]).is_err());
    }

    #[test]
    fn test_parse_data() {
        assert_eq!(parse_data(None).unwrap(), json!({}));
        assert_eq!(parse_data(Some(r#"{"a":1}"#)).unwrap(), json!({"a": 1}));
        assert!(parse_data(Some("[1,2]")).is_err());
        assert!(parse_data(Some("{oops")).is_err());
    }

    #[test]
    fn test_short_id() {
        let id: Uuid = "01938e90-1234-7000-8000-000000000001".parse().unwrap();
        assert_eq!(short_id(&id), "01938e90");
    }
}
