mod cli;
mod ui;

use std::collections::HashSet;
use std::process::ExitCode;

use anyhow::Context;
use clap::Parser;
use cli::{Cli, Command};
use photo_jobs::{
    BatchOptions, JobId, JobStatus, Orchestrator, OrchestratorConfig, StartRequest,
};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};
use ui::BatchProgress;

#[tokio::main]
async fn main() -> anyhow::Result<ExitCode> {
    let cli = Cli::parse();
    init_tracing(cli.verbose);

    let mut config = OrchestratorConfig::load(cli.config.as_deref())
        .context("failed to load configuration")?;
    if let Some(worker) = cli.worker {
        config.worker_command = worker;
    }

    let orchestrator = Orchestrator::new(config);
    // Subscribe first so no event of the jobs we start is missed.
    let mut events = orchestrator.subscribe();

    let (job_ids, batch_id) = match cli.command {
        Command::Process {
            image,
            instructions,
            mode,
        } => {
            let mut request = StartRequest::new(&image);
            request.instructions = instructions;
            request.mode = mode;
            let job_id = orchestrator
                .start(request)
                .await
                .with_context(|| format!("failed to start job for {}", image.display()))?;
            (vec![job_id], None)
        }
        Command::Batch {
            dir,
            instructions,
            mode,
            max_concurrent,
        } => {
            let options = BatchOptions {
                instructions,
                mode,
                max_concurrent,
            };
            let batch = orchestrator
                .start_batch(&dir, options)
                .await
                .with_context(|| format!("failed to start batch for {}", dir.display()))?;
            (batch.job_ids, Some(batch.batch_id))
        }
    };

    let mut progress = BatchProgress::new();
    let mut finished: HashSet<JobId> = HashSet::new();
    let mut interrupted = false;

    while finished.len() < job_ids.len() {
        tokio::select! {
            event = events.recv() => {
                let Some(event) = event else { break };
                if cli.json {
                    println!("{}", serde_json::to_string(&event)?);
                } else {
                    progress.handle(&event);
                }
                if event.job.status.is_terminal() {
                    finished.insert(event.job_id);
                }
            }
            signal = tokio::signal::ctrl_c(), if !interrupted => {
                signal.context("failed to listen for Ctrl-C")?;
                interrupted = true;
                tracing::warn!("interrupted; cancelling remaining jobs");
                for job_id in job_ids.iter().filter(|id| !finished.contains(*id)) {
                    orchestrator.cancel(job_id).await;
                }
            }
        }
    }

    let mut any_failed = false;
    for job_id in &job_ids {
        if let Some(job) = orchestrator.get_status(job_id).await {
            any_failed |= job.status == JobStatus::Failed;
        }
    }

    if let Some(batch_id) = batch_id
        && let Some(summary) = orchestrator.batch_summary(&batch_id).await
    {
        if cli.json {
            println!("{}", serde_json::to_string(&summary)?);
        } else {
            progress.print_summary(&summary);
        }
    }

    orchestrator.shutdown().await;

    Ok(if any_failed || interrupted {
        ExitCode::FAILURE
    } else {
        ExitCode::SUCCESS
    })
}

/// Logs go to stderr so `--json` output on stdout stays machine-readable.
fn init_tracing(verbose: bool) {
    let default = if verbose {
        "photo_jobs=debug"
    } else {
        "photo_jobs=info"
    };
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| default.into()),
        )
        .with(tracing_subscriber::fmt::layer().with_writer(std::io::stderr))
        .init();
}
