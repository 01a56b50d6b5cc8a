use std::path::PathBuf;
use std::time::Duration;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use tokio::signal::unix::{signal, SignalKind};
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

use covrelay::cli::{
    cmd_enqueue, cmd_parse, cmd_report, cmd_report_file, cmd_requeue, cmd_tasks, enqueue_registry,
};
use covrelay::ingest::{self, CoverageJob};
use covrelay::settings::WorkerSettings;
use covrelay::tasks::{StopOutcome, TaskRegistry, Worker, WorkerHandle};
use covrelay::db;

/// covrelay: coverage upload processing and pull request annotation.
#[derive(Parser)]
#[command(name = "covrelay", version, about)]
struct Cli {
    /// Path to the SQLite database.
    #[arg(long, global = true, env = "COVRELAY_DB", default_value = ".covrelay.db")]
    db: PathBuf,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Process queued coverage uploads.
    Worker(WorkerSettings),

    /// Schedule a coverage upload for processing.
    Enqueue {
        /// Path to the upload (plain or gzip-compressed envelope).
        file: PathBuf,

        #[arg(long)]
        org: String,

        #[arg(long)]
        repo: String,

        #[arg(long)]
        branch: String,

        #[arg(long)]
        commit: String,

        /// Named sub-project of the repository.
        #[arg(long)]
        project: Option<String>,

        /// SCM installation the upload belongs to.
        #[arg(long)]
        installation_id: Option<String>,
    },

    /// List queued and failed tasks.
    Tasks {
        /// Only show failed tasks.
        #[arg(long)]
        errors: bool,
    },

    /// Put a failed task back in the queue.
    Requeue {
        /// Task id.
        id: i64,
    },

    /// Parse an upload and print its coverage summary without storing it.
    Parse {
        /// Path to the upload.
        file: PathBuf,
    },

    /// Show a stored report, or one file of it.
    Report {
        #[arg(long)]
        org: String,

        #[arg(long)]
        repo: String,

        #[arg(long)]
        commit: String,

        #[arg(long)]
        project: Option<String>,

        /// Show line-level coverage for this file.
        #[arg(long)]
        file: Option<String>,
    },
}

fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .with_writer(std::io::stderr)
        .init();

    let cli = Cli::parse();

    if let Commands::Parse { file } = &cli.command {
        print!("{}", cmd_parse(file)?);
        return Ok(());
    }

    let conn = db::open(&cli.db).context("Failed to open database")?;
    db::init_schema(&conn).context("Failed to initialize schema")?;

    let output = match cli.command {
        Commands::Worker(settings) => return run_worker(conn, &settings),
        Commands::Enqueue {
            file,
            org,
            repo,
            branch,
            commit,
            project,
            installation_id,
        } => {
            let data = std::fs::read(&file)
                .with_context(|| format!("Failed to read {}", file.display()))?;
            let job = CoverageJob {
                organization: org,
                repo,
                branch,
                commit,
                project,
                installation_id,
                data,
            };
            cmd_enqueue(&conn, &enqueue_registry(), &job)?
        }
        Commands::Tasks { errors } => cmd_tasks(&conn, errors)?,
        Commands::Requeue { id } => cmd_requeue(&conn, id)?,
        Commands::Report {
            org,
            repo,
            commit,
            project,
            file,
        } => match file {
            Some(file) => cmd_report_file(&conn, &org, &repo, &commit, &file, project.as_deref())?,
            None => cmd_report(&conn, &org, &repo, &commit, project.as_deref())?,
        },
        Commands::Parse { .. } => unreachable!("handled before opening the database"),
    };
    print!("{output}");
    Ok(())
}

fn run_worker(conn: rusqlite::Connection, settings: &WorkerSettings) -> Result<()> {
    let provider = settings.scm.provider()?;
    let mut registry = TaskRegistry::new().with_lease(settings.lease());
    ingest::register(&mut registry, provider, settings.public_url.clone());

    let worker = Worker::new(conn, registry, settings.poll_interval());
    if settings.once {
        let ran = worker.drain()?;
        info!(tasks = ran, "queue drained");
        return Ok(());
    }

    let handle = worker.spawn()?;
    let runtime = tokio::runtime::Builder::new_current_thread()
        .enable_all()
        .build()
        .context("Failed to start signal listener")?;
    if !runtime.block_on(wait_for_shutdown(&handle))? {
        // The loop ended on its own, which only a store error does.
        handle.wait()?;
        return Ok(());
    }

    match handle.stop(settings.stop_grace())? {
        StopOutcome::Stopped => info!("shutdown complete"),
        StopOutcome::Abandoned => {
            warn!("exiting with a task still running; it is retried once its lease expires")
        }
    }
    Ok(())
}

/// True on SIGINT or SIGTERM, false once the worker thread exits by itself.
async fn wait_for_shutdown(handle: &WorkerHandle) -> Result<bool> {
    let mut sigterm = signal(SignalKind::terminate()).context("Failed to register SIGTERM")?;
    let mut sigint = signal(SignalKind::interrupt()).context("Failed to register SIGINT")?;

    tokio::select! {
        _ = sigterm.recv() => {
            info!("received SIGTERM");
            Ok(true)
        }
        _ = sigint.recv() => {
            info!("received SIGINT");
            Ok(true)
        }
        _ = worker_exit(handle) => Ok(false),
    }
}

async fn worker_exit(handle: &WorkerHandle) {
    while !handle.is_finished() {
        tokio::time::sleep(Duration::from_millis(200)).await;
    }
}
