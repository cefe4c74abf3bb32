//! Main entry point for the dlcore CLI

use anyhow::{bail, Context};
use clap::Parser;
use dlcore::cli::output::{OutputFormatter, Summary};
use dlcore::cli::{Args, VerbosityLevel};
use dlcore::download::{HttpTransfer, HttpTransferConfig, RetryConfigBuilder};
use dlcore::{Orchestrator, TaskState};
use std::sync::Arc;
use std::time::Instant;
use tracing::{debug, info};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args = Args::parse();
    init_logging(args.verbosity_level())?;
    debug!(?args, "Parsed arguments");

    let formatter = Arc::new(OutputFormatter::new(
        args.verbosity_level(),
        !args.no_progress && !args.json,
    ));

    if args.urls.is_empty() {
        formatter.print_help();
        return Ok(());
    }

    let config = args.build_config().context("invalid configuration")?;
    let transfer = HttpTransfer::with_config(
        HttpTransferConfig::new(&args.output)
            .with_timeout(args.timeout_duration())
            .with_retry(RetryConfigBuilder::new().max_retries(args.retries).build()),
    )?;

    let orchestrator = Orchestrator::new(config, transfer)?;
    orchestrator.subscribe(formatter.clone());
    orchestrator.start()?;

    for url in &args.urls {
        orchestrator.add_task_default(url.as_str()).await?;
    }
    info!(count = args.urls.len(), "Queued downloads");

    let start_time = Instant::now();
    tokio::select! {
        _ = orchestrator.wait_idle() => {}
        _ = tokio::signal::ctrl_c() => {
            formatter.warning("Interrupted, stopping downloads");
        }
    }
    orchestrator.shutdown().await;
    let elapsed = start_time.elapsed();

    let tasks = orchestrator.tasks().await;
    if args.json {
        let summary = Summary::from_tasks(&tasks, elapsed);
        println!("{}", serde_json::to_string_pretty(&summary)?);
    } else {
        formatter.print_summary(&tasks, elapsed);
    }

    let failed = tasks.iter().filter(|t| t.state == TaskState::Failed).count();
    if failed > 0 {
        bail!("{} of {} downloads failed", failed, tasks.len());
    }
    Ok(())
}

/// Initialize logging system. RUST_LOG wins over the verbosity flags.
fn init_logging(verbosity: VerbosityLevel) -> anyhow::Result<()> {
    let default_level = match verbosity {
        VerbosityLevel::Quiet => "error",
        VerbosityLevel::Normal => "info",
        VerbosityLevel::Verbose => "debug",
    };
    let filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(default_level));

    tracing_subscriber::registry()
        .with(filter)
        .with(
            tracing_subscriber::fmt::layer()
                .with_writer(std::io::stderr)
                .with_target(false)
                .with_thread_ids(true)
                .with_file(true)
                .with_line_number(true)
                .compact(),
        )
        .try_init()
        .context("failed to install tracing subscriber")?;

    Ok(())
}
