//! stepflow CLI entry point.
//!
//! Binary name: `sflow`
//!
//! Parses CLI arguments, sets up tracing, initializes the database and
//! engine, then dispatches to the command handler.

mod cli;
mod state;

use clap::Parser;
use clap_complete::generate;

use cli::{Cli, Commands};
use state::AppState;
use stepflow_observe::tracing_setup::{TracingOptions, init_tracing, shutdown_tracing};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    // Set up tracing based on verbosity
    let default_filter = match cli.verbose {
        0 if cli.quiet => "error",
        0 => "warn",
        1 => "info,stepflow_core=debug,stepflow_infra=debug",
        _ => "trace",
    };
    init_tracing(&TracingOptions {
        json: cli.log_json,
        otel: cli.otel,
        default_filter: default_filter.to_string(),
    })?;

    let result = dispatch(cli).await;
    shutdown_tracing();
    result
}

async fn dispatch(cli: Cli) -> anyhow::Result<()> {
    // Shell completions don't need app state
    if let Commands::Completions { shell } = &cli.command {
        let mut cmd = <Cli as clap::CommandFactory>::command();
        generate(*shell, &mut cmd, "sflow", &mut std::io::stdout());
        return Ok(());
    }

    let state = AppState::init().await?;
    let json = cli.json;

    match cli.command {
        Commands::Workflow { action } => {
            cli::workflow::handle_workflow_command(action, &state, json).await?;
        }

        Commands::Submit {
            workflow,
            data,
            priority,
            trigger,
            tenant,
        } => {
            let args = cli::run::SubmitArgs {
                workflow: &workflow,
                data: data.as_deref(),
                priority,
                trigger,
                tenant: tenant.as_deref(),
            };
            cli::run::handle_submit(args, &state, json).await?;
        }

        Commands::Run {
            workflow,
            data,
            follow,
            tenant,
        } => {
            cli::run::handle_run(
                &workflow,
                data.as_deref(),
                follow,
                tenant.as_deref(),
                &state,
                json,
                cli.quiet,
            )
            .await?;
        }

        Commands::Status { run_id } => cli::run::handle_status(&run_id, &state, json).await?,

        Commands::Steps { run_id } => cli::run::handle_steps(&run_id, &state, json).await?,

        Commands::History {
            workflow,
            limit,
            tenant,
        } => {
            cli::run::handle_history(&workflow, limit, tenant.as_deref(), &state, json).await?;
        }

        Commands::Cancel { run_id } => cli::run::handle_cancel(&run_id, &state, json).await?,

        Commands::Runs { action } => cli::run::handle_runs_command(action, &state, json).await?,

        Commands::Jobs { status, limit } => {
            cli::worker::handle_jobs(status, limit, &state, json).await?;
        }

        Commands::Worker {
            concurrency,
            no_cron,
        } => {
            cli::worker::handle_worker(concurrency, no_cron, &state, cli.quiet).await?;
        }

        Commands::Modules => cli::module::handle_modules(&state, json)?,

        Commands::Config => cli::module::handle_config(&state, json)?,

        Commands::Completions { .. } => {}
    }

    Ok(())
}
