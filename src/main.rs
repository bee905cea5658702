//! CodeSwarm - multi-agent project builder
//!
//! CLI entry point: loads config, wires the engine, streams progress events
//! to the console, and writes the full event history as JSONL.

use std::fs;
use std::path::PathBuf;
use std::sync::Arc;

use clap::Parser;
use eyre::{Context, Result};
use tracing::{debug, info};

use codeswarm::cli::{Cli, Command};
use codeswarm::config::Config;
use codeswarm::engine::Engine;
use codeswarm::events::{EngineEvent, EventBus, EventType, spawn_event_logger};

fn data_dir() -> PathBuf {
    dirs::data_local_dir()
        .unwrap_or_else(|| PathBuf::from("."))
        .join("codeswarm")
}

fn setup_logging(cli_log_level: Option<&str>) -> Result<()> {
    let log_dir = data_dir().join("logs");
    fs::create_dir_all(&log_dir).context("Failed to create log directory")?;

    let level = match cli_log_level.map(str::to_uppercase).as_deref() {
        Some("TRACE") => tracing::Level::TRACE,
        Some("DEBUG") => tracing::Level::DEBUG,
        Some("INFO") | None => tracing::Level::INFO,
        Some("WARN") | Some("WARNING") => tracing::Level::WARN,
        Some("ERROR") => tracing::Level::ERROR,
        Some(other) => {
            eprintln!("Warning: Unknown log-level '{}', defaulting to INFO", other);
            tracing::Level::INFO
        }
    };

    let log_file = fs::File::create(log_dir.join("codeswarm.log")).context("Failed to create log file")?;

    tracing_subscriber::fmt()
        .with_writer(log_file)
        .with_ansi(false)
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env().add_directive(level.into()))
        .init();

    info!("Logging initialized (level: {:?})", level);
    Ok(())
}

/// Print a compact progress line for the events worth seeing live
fn print_progress(event: &EngineEvent) {
    match event.event_type {
        EventType::SpecCreated => println!("  Specification ready."),
        EventType::PlanningIteration => {
            println!("  Planning iteration {}", event.data.get("iteration").cloned().unwrap_or_default());
        }
        EventType::TaskDispatched => {
            println!(
                "  -> {} [{}] {}",
                event.task_id.as_deref().unwrap_or("?"),
                event.team.as_deref().unwrap_or("engineering"),
                event.description.as_deref().unwrap_or("")
            );
        }
        EventType::TaskCompleted => {
            println!(
                "  <- {} ({})",
                event.task_id.as_deref().unwrap_or("?"),
                event.status.as_deref().unwrap_or("?")
            );
        }
        EventType::SubplannerStarted => {
            println!("  ** {} decomposing", event.task_id.as_deref().unwrap_or("?"));
        }
        EventType::ReconcilerIssue => {
            println!(
                "  !! reconciler found {} issues",
                event.data.get("issues").cloned().unwrap_or_default()
            );
        }
        EventType::ValidationStarted => println!("  Validating build..."),
        _ => {}
    }
}

async fn cmd_build(config: &Config, request: &str) -> Result<()> {
    let engine = Engine::new(config.clone())?;
    let bus: Arc<EventBus> = Arc::clone(engine.event_bus());

    let _logger = spawn_event_logger(&bus, data_dir().join("events.jsonl"));

    let mut stream = bus.subscribe();
    let printer = tokio::spawn(async move {
        while let Some(event) = stream.recv().await {
            print_progress(&event);
        }
    });

    println!();
    println!("  CodeSwarm — building: {}", request);
    println!("  Output: {}", config.engine.output_dir.display());
    println!();

    let report = engine.run(request).await?;
    printer.abort();

    println!();
    println!("{}", "=".repeat(60));
    println!("  CodeSwarm — All Done");
    println!("  Time:      {:.1}s", report.elapsed_secs);
    println!(
        "  Tasks:     {} dispatched, {} completed",
        report.tasks_dispatched, report.tasks_completed
    );
    println!("  Tokens:    {}", report.total_tokens);
    println!("  API calls: {}", report.api_calls);
    println!("  Output:    {}", config.engine.output_dir.display());
    println!("{}", "=".repeat(60));

    Ok(())
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    setup_logging(cli.log_level.as_deref()).context("Failed to setup logging")?;

    let mut config = Config::load(cli.config.as_ref()).context("Failed to load configuration")?;

    debug!(command = ?cli.command, "main: dispatching command");
    match cli.command {
        Command::Build {
            request,
            output_dir,
            max_workers,
            no_reconciler,
        } => {
            if let Some(dir) = output_dir {
                config.engine.output_dir = dir;
            }
            if let Some(workers) = max_workers {
                config.engine.max_workers = workers;
            }
            if no_reconciler {
                config.reconciler.enabled = false;
            }

            let request = request.join(" ");
            if request.trim().is_empty() {
                eyre::bail!("No request provided");
            }

            cmd_build(&config, &request).await
        }
    }
}
