//! lectern - analysis pipeline command-line entry point
//!
//! `lectern analyze <VIDEO>` runs the built-in pipeline over one recording
//! and prints the run summary. `lectern agents` lists the registry.

use std::path::PathBuf;
use std::sync::{Arc, Mutex};

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use lectern_common::config::{resolve_config, resolve_root_folder, TomlConfig};
use lectern_common::events::EventBus;
use lectern_engine::agents::default_registry;
use lectern_engine::models::RunStatus;
use lectern_engine::{PipelineScheduler, PipelineService, TurboEngine};
use tokio::signal;
use tracing::{info, warn};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

/// Command-line arguments for lectern
#[derive(Parser, Debug)]
#[command(name = "lectern")]
#[command(about = "Teaching-session video analysis pipeline")]
#[command(version)]
struct Args {
    /// Config file (TOML)
    #[arg(short, long, global = true, env = "LECTERN_CONFIG")]
    config: Option<PathBuf>,

    /// Root folder for scratch data
    #[arg(short, long, global = true)]
    root_folder: Option<PathBuf>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Run the pipeline on a video
    Analyze {
        video: PathBuf,

        /// Scratch directory for extracted frames and audio
        #[arg(long)]
        work_dir: Option<PathBuf>,

        /// Skip the hardware-accelerated decode path
        #[arg(long)]
        no_hw_accel: bool,

        /// Print the full run and its events as JSON
        #[arg(long)]
        json: bool,
    },

    /// List registered agents
    Agents,
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();
    let mut config = resolve_config(args.config.as_deref()).context("Failed to load configuration")?;
    init_tracing(&config)?;

    let root_folder = resolve_root_folder(args.root_folder.as_deref(), &config);
    info!("Root folder: {}", root_folder.display());

    match args.command {
        Command::Agents => {
            let engine = TurboEngine::from_config(&config.turbo, root_folder.join("work"))?;
            let registry = default_registry(Arc::new(engine))?;
            for d in registry.descriptors() {
                println!(
                    "{:<10} {:<10} fallback={:<5} deps=[{}]  {}",
                    d.name,
                    d.phase,
                    d.fallback_tolerant,
                    d.dependencies.join(", "),
                    d.role
                );
            }
            Ok(())
        }
        Command::Analyze {
            video,
            work_dir,
            no_hw_accel,
            json,
        } => {
            if no_hw_accel {
                config.turbo.use_hw_accel = false;
            }
            let work_root = work_dir.unwrap_or_else(|| root_folder.join("work"));
            analyze(&config, video, work_root, json).await
        }
    }
}

fn init_tracing(config: &TomlConfig) -> Result<()> {
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(format!("lectern_engine={0},lectern_common={0}", config.logging.level)));

    let file_layer = match &config.logging.file {
        Some(path) => {
            let file = std::fs::OpenOptions::new()
                .create(true)
                .append(true)
                .open(path)
                .with_context(|| format!("Failed to open log file {}", path.display()))?;
            Some(
                tracing_subscriber::fmt::layer()
                    .with_ansi(false)
                    .with_writer(Mutex::new(file)),
            )
        }
        None => None,
    };

    tracing_subscriber::registry()
        .with(filter)
        .with(tracing_subscriber::fmt::layer().with_writer(std::io::stderr))
        .with(file_layer)
        .init();
    Ok(())
}

async fn analyze(config: &TomlConfig, video: PathBuf, work_root: PathBuf, json: bool) -> Result<()> {
    let engine = TurboEngine::from_config(&config.turbo, work_root).context("Failed to initialize turbo engine")?;
    info!(workers = engine.workers(), "Turbo engine initialized");

    let registry = Arc::new(default_registry(Arc::new(engine))?);
    let bus = EventBus::new(config.events.history_capacity);
    let scheduler = PipelineScheduler::new(registry, bus.clone()).with_note_capacity(config.progress.note_capacity);
    let service = PipelineService::new(scheduler);

    // Subscribe before starting so the terminal event cannot be missed
    let mut events = bus.subscribe_stream();
    let run_id = service.start_run(video.clone()).await;
    info!(run_id = %run_id, video = %video.display(), "Analysis started");

    loop {
        tokio::select! {
            _ = signal::ctrl_c() => {
                warn!("Received Ctrl+C, cancelling run");
                service.cancel_run(run_id).await;
            }
            received = events.recv() => match received {
                Ok(event) if event.pipeline_id == Some(run_id) && event.event_type.is_terminal() => break,
                Ok(_) => {}
                Err(tokio::sync::broadcast::error::RecvError::Lagged(n)) => {
                    warn!("Event stream lagged by {} events", n);
                }
                Err(tokio::sync::broadcast::error::RecvError::Closed) => break,
            },
        }
    }

    let run = service
        .get_run(run_id)
        .await
        .context("Run disappeared before completion")?;

    if json {
        let report = serde_json::json!({
            "run": &run,
            "events": service.get_run_events(run_id).await?,
        });
        println!("{}", serde_json::to_string_pretty(&report)?);
    } else {
        println!("run {} {}", run.id, run.status);
        for (name, record) in &run.agents {
            let elapsed = record.elapsed_seconds.unwrap_or(0.0);
            match &record.error {
                Some(e) => println!("  {:<10} {:?} ({:.2}s) {}", name, record.state, elapsed, e),
                None => println!("  {:<10} {:?} ({:.2}s)", name, record.state, elapsed),
            }
        }
        if let Some(error) = &run.error {
            println!("error: {}", error);
        }
        if let Some(result) = run.result.as_ref().and_then(|r| r.as_summary()) {
            println!("{}", serde_json::to_string_pretty(result)?);
        }
    }

    if run.status == RunStatus::Failed {
        anyhow::bail!("Run {} failed", run.id);
    }
    Ok(())
}
