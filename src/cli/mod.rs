//! Command-line interface for scribeflow.
//!
//! Provides commands for running the consumer and the dead-letter reprocessor,
//! publishing transcripts, inspecting stored records and queues, and running
//! key rotation or retention by hand.

use std::io::{self, IsTerminal, Read};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use tokio::sync::watch;
use tracing::{info, warn};

use crate::app::App;
use crate::config;

/// scribeflow - at-least-once transcript ingestion pipeline
#[derive(Parser, Debug)]
#[command(name = "scribeflow")]
#[command(author, version, about, long_about = None)]
pub struct Cli {
    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Subcommand, Debug)]
pub enum Commands {
    /// Consume the main queue (plus rotation, retention and depth jobs)
    Consume {
        /// Also run the dead-letter reprocessor in this process
        #[arg(long)]
        with_reprocessor: bool,
    },

    /// Run the dead-letter reprocessor
    Reprocess,

    /// Publish a transcript
    Publish {
        /// Source filename the transcript belongs to
        filename: String,

        /// Transcript file (reads from stdin if not provided)
        #[arg(short, long)]
        input: Option<PathBuf>,

        /// Correlation id carried through logs
        #[arg(long)]
        correlation_id: Option<String>,
    },

    /// Show a stored transcript
    Show {
        /// Record id
        id: i64,
    },

    /// Run one key rotation pass now
    RotateKeys,

    /// Purge transcripts older than the retention window
    Purge {
        /// Override the configured retention days
        #[arg(long)]
        days: Option<u32>,
    },

    /// Show queue depths
    Queues,

    /// Show resolved configuration (debug)
    Config,
}

impl Cli {
    /// Execute the CLI command
    pub async fn execute(self) -> Result<()> {
        match self.command {
            Commands::Consume { with_reprocessor } => consume(with_reprocessor).await,
            Commands::Reprocess => reprocess().await,
            Commands::Publish {
                filename,
                input,
                correlation_id,
            } => publish(&filename, input, correlation_id).await,
            Commands::Show { id } => show_transcript(id).await,
            Commands::RotateKeys => rotate_keys().await,
            Commands::Purge { days } => purge(days).await,
            Commands::Queues => show_queues().await,
            Commands::Config => show_config().await,
        }
    }
}

async fn open_app() -> Result<App> {
    let settings = config::settings()?.clone();
    App::open(settings).await
}

/// Flip the shutdown flag on Ctrl-C
fn shutdown_on_ctrl_c() -> watch::Receiver<bool> {
    let (tx, rx) = watch::channel(false);
    tokio::spawn(async move {
        if let Err(e) = tokio::signal::ctrl_c().await {
            warn!(error = %e, "failed to listen for Ctrl-C");
            return;
        }
        info!("shutdown requested; draining");
        let _ = tx.send(true);
    });
    rx
}

/// Await `handle`, giving up after the drain window
async fn drain(name: &str, handle: tokio::task::JoinHandle<()>, wait: Duration) {
    match tokio::time::timeout(wait, handle).await {
        Ok(Ok(())) => {}
        Ok(Err(e)) => warn!(task = name, error = %e, "task ended abnormally"),
        Err(_) => warn!(task = name, "drain window elapsed; exiting with work in flight"),
    }
}

async fn consume(with_reprocessor: bool) -> Result<()> {
    let app = open_app().await?;
    let shutdown = shutdown_on_ctrl_c();
    let wait = Duration::from_secs(app.settings.drain_wait_seconds);

    let jobs = app.jobs(shutdown.clone()).start();

    let consumer = Arc::new(app.consumer());
    let consumer_task = {
        let consumer = consumer.clone();
        let shutdown = shutdown.clone();
        tokio::spawn(async move { consumer.run(shutdown).await })
    };

    let reprocessor_task = with_reprocessor.then(|| {
        let reprocessor = Arc::new(app.reprocessor());
        let shutdown = shutdown.clone();
        tokio::spawn(async move { reprocessor.run(shutdown).await })
    });

    drain("consumer", consumer_task, wait).await;
    if let Some(task) = reprocessor_task {
        drain("reprocessor", task, wait).await;
    }
    jobs.join().await;

    let snapshot = app.metrics.snapshot();
    info!(?snapshot, "consumer exited");
    println!("{}", serde_json::to_string_pretty(&snapshot)?);
    Ok(())
}

async fn reprocess() -> Result<()> {
    let app = open_app().await?;
    let shutdown = shutdown_on_ctrl_c();
    let wait = Duration::from_secs(app.settings.drain_wait_seconds);

    let reprocessor = Arc::new(app.reprocessor());
    let task = tokio::spawn(async move { reprocessor.run(shutdown).await });
    drain("reprocessor", task, wait).await;

    let snapshot = app.metrics.snapshot();
    info!(?snapshot, "reprocessor exited");
    Ok(())
}

async fn publish(filename: &str, input: Option<PathBuf>, correlation_id: Option<String>) -> Result<()> {
    let text = if let Some(path) = input {
        std::fs::read_to_string(&path)
            .with_context(|| format!("Failed to read input file: {}", path.display()))?
    } else if !io::stdin().is_terminal() {
        let mut buffer = String::new();
        io::stdin()
            .read_to_string(&mut buffer)
            .context("Failed to read from stdin")?;
        buffer
    } else {
        anyhow::bail!("No transcript provided. Use --input <file> or pipe to stdin");
    };

    if text.trim().is_empty() {
        anyhow::bail!("Transcript is empty");
    }

    let app = open_app().await?;
    let outcome = app.publisher().publish(filename, &text, correlation_id).await?;
    println!("{}", serde_json::to_string(&outcome)?);
    Ok(())
}

async fn show_transcript(id: i64) -> Result<()> {
    let app = open_app().await?;
    let record = app
        .store
        .get_transcript(id)?
        .with_context(|| format!("Transcript {} not found", id))?;

    if !record.is_fully_readable() {
        eprintln!("[sealed fields: {}]", record.sealed_fields.join(", "));
    }
    println!("{}", serde_json::to_string_pretty(&record)?);
    Ok(())
}

async fn rotate_keys() -> Result<()> {
    let app = open_app().await?;
    if !app.keys.is_enabled() {
        anyhow::bail!("Field encryption is not enabled");
    }

    let job = app.rotation_job();
    let report = tokio::task::spawn_blocking(move || job.run_once())
        .await
        .context("Rotation task aborted")??;

    println!("Scanned: {}", report.scanned);
    println!("Updated: {}", report.updated);
    println!("Batches: {}", report.batches);
    Ok(())
}

async fn purge(days: Option<u32>) -> Result<()> {
    let mut settings = config::settings()?.clone();
    if let Some(days) = days {
        settings.retention_days = days;
    }
    let app = App::open(settings).await?;

    let job = app.retention_job();
    if !job.is_enabled() {
        anyhow::bail!("Retention is disabled (retention_days = 0)");
    }
    let purged = tokio::task::spawn_blocking(move || job.run_once())
        .await
        .context("Purge task aborted")??;

    println!("Purged {} transcript(s)", purged);
    Ok(())
}

async fn show_queues() -> Result<()> {
    let app = open_app().await?;
    let main = app.settings.queue.clone();
    let dlq = app.settings.dead_letter_queue();

    println!("{:<30} {:>8}", "QUEUE", "DEPTH");
    println!("{}", "-".repeat(39));
    for queue in [main, dlq] {
        let depth = app.broker.depth(&queue).await?;
        println!("{:<30} {:>8}", queue, depth);
    }
    println!();
    println!("Stored transcripts: {}", app.records.count()?);
    Ok(())
}

async fn show_config() -> Result<()> {
    let cfg = config::settings()?;

    println!("Scribeflow Configuration");
    println!("========================");
    println!();
    println!(
        "Config file: {}",
        cfg.config_file
            .as_ref()
            .map(|p| p.display().to_string())
            .unwrap_or_else(|| "(none - using defaults)".to_string())
    );
    println!("Environment: {}", cfg.environment);
    println!();
    println!("Paths:");
    println!("  Home:     {}", cfg.home.display());
    println!("  Queues:   {}", cfg.queues_dir().display());
    println!("  Database: {}", cfg.database.display());
    println!();
    println!("Queues:");
    println!("  Main:        {}", cfg.queue);
    println!("  Dead-letter: {}", cfg.dead_letter_queue());
    println!();
    println!("Encryption:");
    println!("  Enabled:  {}", cfg.encryption.enabled);
    println!("  Policy:   {:?}", cfg.key_policy);
    println!("  Key ids:  {:?}", cfg.encryption.keys.keys().collect::<Vec<_>>());
    println!("  Primary:  {}", cfg.encryption.primary_key_id.as_deref().unwrap_or("(none)"));
    println!();
    println!("Downstream:");
    println!("  Clinical document API: {}", cfg.clinical.is_configured());
    println!("  Legacy REST API:       {}", cfg.legacy.api_url.is_some());
    println!();
    println!("Pipeline:");
    println!("{}", serde_yaml::to_string(cfg).context("Failed to render settings")?);
    Ok(())
}
