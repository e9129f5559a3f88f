// src/main.rs
//! Tracking Queue CLI
//!
//! Scheduled entry point for draining the tracking queue, plus status and
//! health commands for operators.

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use std::io::Write;
use std::path::PathBuf;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};
use tracking_queue::observability::{init_metrics, init_tracing};
use tracking_queue::queue::{DrainOutcome, Processor, Queue};
use tracking_queue::utils::config::TrackingConfig;
use tracking_queue::{build_backend, build_sink};

#[derive(Parser)]
#[command(name = "tracking-queue")]
#[command(about = "Deferred tracking ingestion queue")]
#[command(version)]
struct Cli {
    /// Configuration file (defaults to ./tracking-queue.toml)
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Process queued tracking requests if enough are queued and no other
    /// process is already working on them
    Process,
    /// Show queue depth and lock state
    Status,
    /// Verify configuration and backend connectivity
    Check,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    let config = match &cli.config {
        Some(path) => TrackingConfig::load_from(path, true),
        None => TrackingConfig::load(),
    }
    .context("Failed to load configuration")?;

    init_tracing(&config.observability)?;
    init_metrics(&config.observability)?;

    debug!("Configuration loaded: {:?}", config);

    let ct = CancellationToken::new();

    let ct_clone = ct.clone();
    tokio::spawn(async move {
        let _ = tokio::signal::ctrl_c().await;
        info!("Received shutdown signal, stopping after the current batch");
        ct_clone.cancel();
    });

    match cli.command {
        Commands::Process => process(&config, &ct).await,
        Commands::Status => status(&config).await,
        Commands::Check => check(&config).await,
    }
}

async fn process(config: &TrackingConfig, ct: &CancellationToken) -> Result<()> {
    let backend = build_backend(&config.backend).await?;
    let queue = Queue::new(backend.clone(), &config.queue);

    if !queue.is_enabled().await? {
        println!("Queued tracking is disabled, processing what is left in the queue.");
    }

    let queued = queue.size().await?;
    let sink = build_sink(&config.sink).await?;

    let mut processor = Processor::from_config(backend, sink, config)
        .with_iteration_callback(|depth| {
            print!("\r{} left in queue      ", depth);
            let _ = std::io::stdout().flush();
        });

    let report = processor.run_until_cancelled(ct).await?;

    match report.outcome {
        DrainOutcome::Disabled => {
            println!("Nothing to process. Statistics recording is disabled.");
        }
        DrainOutcome::BelowThreshold => {
            println!(
                "Nothing to process. Only {} batches are queued, {} are needed to start processing the queue.",
                queued,
                queue.threshold()
            );
        }
        DrainOutcome::Locked => {
            println!(
                "Nothing to process. {} batches are queued and they are already in process by another script.",
                queued
            );
        }
        DrainOutcome::Drained | DrainOutcome::Cancelled => {
            println!();
            if report.outcome == DrainOutcome::Cancelled {
                println!("Processing cancelled.");
            } else {
                println!("Queue processed.");
            }
            println!(
                "{} events persisted, {} dropped, {} undecodable entries discarded, {} batches requeued, {} left in queue",
                report.events_persisted,
                report.events_dropped,
                report.entries_discarded,
                report.batches_requeued,
                queue.size().await?
            );
        }
    }

    Ok(())
}

async fn status(config: &TrackingConfig) -> Result<()> {
    let backend = build_backend(&config.backend).await?;
    let queue = Queue::new(backend.clone(), &config.queue);

    let holder = backend.get(&config.queue.lock_key).await?;

    println!("enabled:    {}", queue.is_enabled().await?);
    println!("queued:     {}", queue.size().await?);
    println!("threshold:  {}", queue.threshold());
    println!(
        "lock:       {}",
        if holder.is_some() { "held" } else { "free" }
    );

    Ok(())
}

async fn check(config: &TrackingConfig) -> Result<()> {
    let backend = build_backend(&config.backend)
        .await
        .context("Queue backend could not be opened")?;
    backend
        .check_installed()
        .await
        .context("Queue backend is not usable")?;

    build_sink(&config.sink)
        .await
        .context("Persistence sink could not be opened")?;

    println!("Configuration and backend are OK.");

    Ok(())
}
