//! kts-runner
//!
//! Command-line front end for the knowledge-base backend. Logs go to stderr;
//! stdout carries only the JSON result of the subcommand.
//! Configuration is passed via the `KTS_RUNNER_CONFIG` env var.

use std::path::PathBuf;
use std::time::Duration;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use serde::Serialize;
use tokio::sync::mpsc;
use tracing::info;
use tracing_subscriber::EnvFilter;

use kts_runner::{
    config::Config, doctor, process::ProcessExecutor, BackendContext, BackendRequest,
};

#[derive(Parser, Debug)]
#[command(name = "kts-runner", version)]
#[command(about = "Runs the knowledge-base backend in a managed environment or packaged executable")]
struct Args {
    /// Log level (trace, debug, info, warn, error)
    #[arg(long, default_value = "info")]
    log_level: String,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Run a backend command and print its parsed result
    Invoke {
        /// Source folder the command works on
        #[arg(long)]
        source: Option<PathBuf>,

        /// Workspace directory override (used only if it exists)
        #[arg(long)]
        workspace: Option<PathBuf>,

        /// Kill the backend after this many seconds
        #[arg(long, default_value_t = 3600)]
        timeout_secs: u64,

        /// Arguments passed to the backend CLI
        #[arg(trailing_var_arg = true, allow_hyphen_values = true, required = true)]
        args: Vec<String>,
    },

    /// Provision the managed environment
    Bootstrap {
        /// Rebuild even if the environment looks valid
        #[arg(long)]
        force: bool,
    },

    /// Print a full diagnostics report
    Doctor,

    /// Print the active backend's version
    Version,
}

fn print_json<T: Serialize>(value: &T) -> Result<()> {
    let json = serde_json::to_string_pretty(value).context("Failed to serialize output")?;
    println!("{json}");
    Ok(())
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    // Initialize logging (stderr so stdout is free for results)
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(&args.log_level)),
        )
        .with_writer(std::io::stderr)
        .init();

    let config = Config::from_env().context("Failed to load configuration")?;

    info!(
        mode = %config.backend_mode,
        channel = %config.backend_channel,
        "Loaded configuration"
    );

    // Forward backend progress lines to the log as they arrive
    let (progress_tx, mut progress_rx) = mpsc::unbounded_channel::<String>();
    let progress = tokio::spawn(async move {
        while let Some(line) = progress_rx.recv().await {
            info!(target: "backend", "{line}");
        }
    });

    let ctx = BackendContext::with_executor(config, ProcessExecutor::with_progress(progress_tx));
    let outcome = run(&ctx, args.command).await;

    drop(ctx);
    let _ = progress.await;
    outcome
}

async fn run(ctx: &BackendContext, command: Command) -> Result<()> {
    match command {
        Command::Invoke {
            source,
            workspace,
            timeout_secs,
            args,
        } => {
            let mut request =
                BackendRequest::new(args).timeout(Duration::from_secs(timeout_secs));
            request.source_path = source;
            request.workspace_override = workspace;

            let result = ctx.invoke_activated(request).await?;
            print_json(&result)
        }
        Command::Bootstrap { force } => {
            if !force && ctx.manager().is_environment_valid().await {
                info!("Managed environment already valid");
            } else {
                ctx.bootstrap().await?;
            }
            print_json(&ctx.manager().paths())
        }
        Command::Doctor => print_json(&doctor::run_doctor(ctx).await),
        Command::Version => {
            let runner = ctx.runner().await?;
            println!("{}", runner.version().await);
            Ok(())
        }
    }
}
