//! Command-line driver for the splatflow reconstruction pipeline.

use anyhow::Context as _;
use clap::Parser;
use splatflow::prelude::*;
use std::path::PathBuf;
use std::process::ExitCode;
use std::sync::Arc;
use tracing_subscriber::EnvFilter;

/// Runs a resumable 3D reconstruction pipeline (SfM, Gaussian splatting)
/// against a project directory of input photos.
#[derive(Debug, Parser)]
#[command(name = "splatflow", version, about)]
struct Cli {
    /// Path to the task configuration file (JSON or YAML)
    #[arg(short, long)]
    config: PathBuf,

    /// Comma-separated subset of stages to run (sfm, reconstruction, gs_to_pc)
    #[arg(long, value_delimiter = ',')]
    stages: Option<Vec<String>>,

    /// Resume an existing run directory by its identifier
    /// (falls back to the RESUME_ID environment variable)
    #[arg(long)]
    resume: Option<String>,
}

#[tokio::main]
async fn main() -> ExitCode {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    match run(Cli::parse()).await {
        Ok(true) => ExitCode::SUCCESS,
        Ok(false) => ExitCode::FAILURE,
        Err(e) => {
            tracing::error!("{e:#}");
            ExitCode::FAILURE
        }
    }
}

async fn run(cli: Cli) -> anyhow::Result<bool> {
    let config = PipelineConfig::from_file(&cli.config)
        .with_context(|| format!("loading config from {}", cli.config.display()))?;

    let resume = cli.resume.or_else(|| std::env::var("RESUME_ID").ok());

    let cancel = Arc::new(CancellationToken::new());
    spawn_signal_listener(cancel.clone());

    let engine = PipelineEngine::new(
        config,
        resume.as_deref(),
        Some(&cli.config),
        Arc::new(TracingEventSink),
        cancel,
    )?;

    let requested: Option<Vec<&str>> = cli
        .stages
        .as_ref()
        .map(|names| names.iter().map(String::as_str).collect());

    Ok(engine.run(requested.as_deref()).await?)
}

/// Cancels the pipeline on the first interrupt or termination signal.
fn spawn_signal_listener(cancel: Arc<CancellationToken>) {
    tokio::spawn(async move {
        #[cfg(unix)]
        {
            use tokio::signal::unix::{signal, SignalKind};
            let Ok(mut term) = signal(SignalKind::terminate()) else {
                return;
            };
            tokio::select! {
                _ = tokio::signal::ctrl_c() => cancel.cancel("interrupted (Ctrl-C)"),
                _ = term.recv() => cancel.cancel("terminated (SIGTERM)"),
            }
        }
        #[cfg(not(unix))]
        {
            if tokio::signal::ctrl_c().await.is_ok() {
                cancel.cancel("interrupted (Ctrl-C)");
            }
        }
    });
}
