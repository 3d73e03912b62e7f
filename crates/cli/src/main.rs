//! CLI entry point for the encode queue
//!
//! Loads a queue file, folds in queues left behind by crashed instances, and
//! runs every waiting job through the configured encoder executable.

use clap::{Parser, Subcommand};
use encode_queue::config::ConfigError;
use encode_queue::persistence::load_export;
use encode_queue::{
    find_recoverable_queues, Config, DiskSpaceGate, DriverError, PersistenceError,
    ProcessSupervisor, QueueDriver, QueueError, QueueEvent, QueueManager,
};
use std::path::{Path, PathBuf};
use std::process::ExitCode;
use std::sync::Arc;
use thiserror::Error;
use tokio::sync::broadcast;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

/// Encode Queue - run a list of encodes one at a time, surviving crashes
#[derive(Parser, Debug)]
#[command(name = "encode-queue")]
#[command(author, version, about, long_about = None)]
struct Args {
    /// Path to the configuration file (config.toml)
    #[arg(short, long, default_value = "config.toml")]
    config: PathBuf,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Run the queue until every waiting job has been processed
    Run {
        /// Queue export file to load before running
        #[arg(short, long)]
        queue: Option<PathBuf>,

        /// Do not pick up queues left behind by crashed instances
        #[arg(long, default_value = "false")]
        no_recover: bool,
    },
    /// List queues left behind by crashed instances
    Recover,
    /// Print the jobs in a queue export file
    List {
        #[arg(short, long)]
        queue: PathBuf,
    },
}

#[derive(Debug, Error)]
enum CliError {
    #[error("{0}")]
    Config(#[from] ConfigError),

    #[error(transparent)]
    Queue(#[from] QueueError),

    #[error(transparent)]
    Driver(#[from] DriverError),

    #[error(transparent)]
    Persistence(#[from] PersistenceError),
}

/// Load the config file, or defaults plus environment overrides if it does not exist.
fn load_config(path: &Path) -> Result<Config, CliError> {
    if path.exists() {
        return Ok(Config::load(path)?);
    }
    warn!(path = %path.display(), "Config file not found, using defaults");
    let mut config = Config::default();
    config.apply_env_overrides();
    Ok(config)
}

fn print_event(event: &QueueEvent) {
    match event {
        QueueEvent::QueueChanged => {}
        QueueEvent::JobProcessingStarted { job_id } => println!("[job {}] started", job_id),
        QueueEvent::JobProgress { job_id, sample } => match sample.current_fps {
            Some(fps) => println!(
                "[job {}] pass {}/{} {:.1}% ({:.1} fps)",
                job_id, sample.task_index, sample.task_count, sample.percent, fps
            ),
            None => println!(
                "[job {}] pass {}/{} {:.1}%",
                job_id, sample.task_index, sample.task_count, sample.percent
            ),
        },
        QueueEvent::JobCompleted {
            job_id,
            status,
            error,
        } => match error {
            Some(error) => println!("[job {}] {}: {}", job_id, status, error),
            None => println!("[job {}] {}", job_id, status),
        },
        QueueEvent::QueuePaused { engine_paused } => {
            println!("Queue paused (engine paused: {})", engine_paused)
        }
        QueueEvent::QueueResumed => println!("Queue resumed"),
        QueueEvent::QueueCompleted => println!("Queue completed"),
        QueueEvent::QueueStopped => println!("Queue stopped"),
        QueueEvent::RunAborted { reason } => println!("Queue aborted: {}", reason),
    }
}

async fn run(config: Config, queue_file: Option<PathBuf>, recover: bool) -> Result<bool, CliError> {
    let queue = Arc::new(QueueManager::from_config(&config.queue));

    if recover {
        let recovered = queue.recover_queues(&config.queue.state_dir);
        if recovered > 0 {
            println!("Recovered {} job(s) from previous instances", recovered);
        }
    }
    if let Some(path) = queue_file {
        let imported = queue.import_queue(&path)?;
        info!(path = %path.display(), jobs = imported, "Queue file loaded");
    }

    let supervisor = Arc::new(ProcessSupervisor::from_config(&config.engine));
    let disk_gate = config
        .queue
        .check_disk_space
        .then(|| DiskSpaceGate::new(config.queue.min_free_disk_mb.saturating_mul(1024 * 1024)));
    let driver = QueueDriver::new(
        Arc::clone(&queue),
        supervisor,
        disk_gate,
        config.engine.logging_enabled,
    );

    let mut events = queue.subscribe();
    driver.start()?;

    let mut aborted = false;
    loop {
        tokio::select! {
            event = events.recv() => match event {
                Ok(event) => {
                    print_event(&event);
                    if event.ends_run() {
                        aborted = matches!(event, QueueEvent::RunAborted { .. });
                        break;
                    }
                }
                Err(broadcast::error::RecvError::Lagged(missed)) => {
                    warn!(missed, "Event output fell behind");
                }
                Err(broadcast::error::RecvError::Closed) => break,
            },
            _ = tokio::signal::ctrl_c() => {
                println!("Stopping...");
                driver.stop();
            }
        }
    }
    driver.wait_until_idle().await;

    let stats = queue.stats();
    println!(
        "{} completed, {} failed, {} waiting",
        stats.completed, stats.error, stats.waiting
    );
    Ok(!aborted && stats.error == 0)
}

fn recover(config: &Config) {
    let queues = find_recoverable_queues(&config.queue.state_dir, std::process::id());
    if queues.is_empty() {
        println!("No queues to recover in {}", config.queue.state_dir.display());
        return;
    }
    for queue in queues {
        println!("{} (pid {}): {} job(s)", queue.path.display(), queue.pid, queue.jobs.len());
        for job in &queue.jobs {
            println!("  {} -> {}", job.source.display(), job.destination.display());
        }
    }
}

fn list(path: &Path) -> Result<(), CliError> {
    let export = load_export(path)?;
    for (index, job) in export.jobs.iter().enumerate() {
        println!(
            "{:>3}. {} -> {}",
            index + 1,
            job.source.display(),
            job.destination.display()
        );
    }
    Ok(())
}

#[tokio::main]
async fn main() -> ExitCode {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();

    let args = Args::parse();

    let config = match load_config(&args.config) {
        Ok(config) => config,
        Err(e) => {
            eprintln!("Failed to load config: {}", e);
            return ExitCode::FAILURE;
        }
    };

    let result = match args.command {
        Command::Run { queue, no_recover } => run(config, queue, !no_recover).await,
        Command::Recover => {
            recover(&config);
            Ok(true)
        }
        Command::List { queue } => list(&queue).map(|_| true),
    };

    match result {
        Ok(true) => ExitCode::SUCCESS,
        Ok(false) => ExitCode::FAILURE,
        Err(e) => {
            eprintln!("Error: {}", e);
            ExitCode::FAILURE
        }
    }
}
