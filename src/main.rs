use clap::{Parser, ValueEnum};
use serde::Serialize;
use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tracing_subscriber::EnvFilter;
use uuid::Uuid;

use jobwarden::api::{run_api, ApiState};
use jobwarden::config::{LockConfig, ServiceConfig, SweepConfig};
use jobwarden::job::{JobRecord, JobService, JobStatus};
use jobwarden::lock::LockManager;
use jobwarden::scheduler::{BatchCompleter, Sweeper};
use jobwarden::shutdown::install_shutdown_handler;
use jobwarden::store::{DataFileLock, JsonFileBackend, RecordStore, SearchQuery};

#[derive(Parser, Debug)]
#[command(name = "jobwarden")]
#[command(version)]
#[command(about = "Job tracking service with lock-protected status transitions")]
#[command(propagate_version = true)]
struct Args {
    #[command(subcommand)]
    command: Commands,
}

#[derive(clap::Subcommand, Debug)]
enum Commands {
    /// Run the HTTP API and the periodic sweeper
    Server(ServerArgs),

    /// Complete every pending job in a data file once
    Sweep {
        #[command(flatten)]
        data: DataArgs,
    },

    /// Status index maintenance
    Index {
        #[command(flatten)]
        data: DataArgs,

        #[command(subcommand)]
        command: IndexCommands,
    },

    /// Inspect jobs in a data file
    Job {
        #[command(flatten)]
        data: DataArgs,

        #[command(subcommand)]
        command: JobCommands,
    },
}

// =============================================================================
// Server Arguments
// =============================================================================

#[derive(Parser, Debug)]
struct ServerArgs {
    /// Address to bind the HTTP API to
    #[arg(long, default_value = "127.0.0.1")]
    host: String,

    /// Port for the HTTP API
    #[arg(long, default_value = "8080")]
    port: u16,

    /// JSON data file (kept in memory only if omitted). Locked for as long
    /// as the server runs.
    #[arg(long)]
    data: Option<PathBuf>,

    /// Seconds between automatic completions of pending jobs
    #[arg(long, default_value = "60")]
    sweep_interval_secs: u64,

    /// Append each sweep result to this file
    #[arg(long)]
    sweep_log: Option<PathBuf>,

    /// How long a request waits for a busy job before failing
    #[arg(long, default_value = "10000")]
    lock_timeout_ms: u64,

    /// Age after which a held lock is considered abandoned
    #[arg(long, default_value = "30")]
    lock_expiry_secs: u64,

    /// How often a waiting request re-checks a busy job
    #[arg(long, default_value = "200")]
    lock_poll_ms: u64,
}

// =============================================================================
// Offline Arguments (shared by sweep, index and job commands)
// =============================================================================

#[derive(Parser, Debug)]
struct DataArgs {
    /// JSON data file written by the server. `sweep` and `index rebuild`
    /// refuse to run while a server has it open.
    #[arg(long, short = 'd')]
    data: PathBuf,

    /// Output format
    #[arg(long, short = 'o', default_value = "table")]
    output: OutputFormat,
}

#[derive(Debug, Clone, ValueEnum)]
enum OutputFormat {
    Table,
    Json,
}

#[derive(clap::Subcommand, Debug)]
enum IndexCommands {
    /// Recompute the status index from the stored jobs
    Rebuild,
}

#[derive(clap::Subcommand, Debug)]
enum JobCommands {
    /// List jobs, optionally filtered or paginated
    List {
        /// Only jobs in this status (pending, completed, canceled)
        #[arg(long)]
        status: Option<JobStatus>,

        /// Only jobs whose title contains this text (case-insensitive)
        #[arg(long)]
        title: Option<String>,

        /// Zero-based page number (requires --size)
        #[arg(long, requires = "size")]
        page: Option<usize>,

        /// Page size, clamped to 1..=100. Pages cover all jobs, unfiltered.
        #[arg(long, conflicts_with_all = ["status", "title"])]
        size: Option<usize>,
    },
    /// Show one job
    Show {
        /// The job ID (UUID)
        job_id: Uuid,
    },
}

// =============================================================================
// JSON Output Types
// =============================================================================

#[derive(Serialize)]
struct RepairOutput {
    moved: usize,
    added: usize,
    dropped: usize,
}

#[derive(Serialize)]
struct JobListOutput<'a> {
    jobs: &'a [JobRecord],
    total_count: usize,
    total_pages: Option<usize>,
}

// =============================================================================
// Helper Functions
// =============================================================================

fn init_logging(default_directive: &str) {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_directive)),
        )
        .with_writer(std::io::stderr)
        .init();
}

fn open_data_file(data: &DataArgs) -> Result<RecordStore, Box<dyn std::error::Error>> {
    let backend = JsonFileBackend::open(&data.data)?;
    Ok(RecordStore::new(Arc::new(backend))?)
}

fn print_job_table(jobs: &[JobRecord]) {
    println!("{:<38} {:<10} {:<20} TITLE", "JOB ID", "STATUS", "UPDATED");
    println!("{}", "-".repeat(90));
    for job in jobs {
        // Truncate title if too long
        let title = if job.title.chars().count() > 30 {
            format!("{}...", job.title.chars().take(27).collect::<String>())
        } else {
            job.title.clone()
        };
        println!(
            "{:<38} {:<10} {:<20} {}",
            job.id,
            job.status.as_str().to_uppercase(),
            job.updated_at.format("%Y-%m-%d %H:%M:%S").to_string(),
            title
        );
    }
}

// =============================================================================
// Server Implementation
// =============================================================================

async fn run_server(args: ServerArgs) -> Result<(), Box<dyn std::error::Error>> {
    init_logging("info");

    let listen_addr: SocketAddr = format!("{}:{}", args.host, args.port).parse()?;
    let config = ServiceConfig {
        listen_addr,
        data_path: args.data,
        lock: LockConfig::default()
            .with_poll_interval(Duration::from_millis(args.lock_poll_ms))
            .with_expiry(Duration::from_secs(args.lock_expiry_secs))
            .with_default_timeout(Duration::from_millis(args.lock_timeout_ms)),
        sweep: SweepConfig {
            interval: Duration::from_secs(args.sweep_interval_secs.max(1)),
            log_path: args.sweep_log,
        },
    };

    tracing::info!(
        listen_addr = %config.listen_addr,
        data_path = ?config.data_path,
        sweep_interval_secs = config.sweep.interval.as_secs(),
        sweep_log = ?config.sweep.log_path,
        "Starting jobwarden"
    );

    let _data_lock = config.lock_data_file()?;
    let store = Arc::new(RecordStore::open(config.open_backend()?)?);
    let locks = Arc::new(LockManager::new(config.lock.clone()));
    let service = Arc::new(JobService::new(store.clone(), locks.clone()));

    let shutdown = install_shutdown_handler();

    let sweeper = Sweeper::new(BatchCompleter::new(store, locks), config.sweep.clone());
    let sweeper_handle = tokio::spawn(sweeper.run(shutdown.clone()));

    let result = run_api(config.listen_addr, ApiState { service }, shutdown.clone()).await;
    if let Err(e) = &result {
        tracing::error!(addr = %config.listen_addr, error = %e, "API server failed");
    }

    // Stop the sweeper whether the API exited cleanly or not.
    shutdown.cancel();
    if let Err(e) = sweeper_handle.await {
        tracing::warn!(error = %e, "Sweeper task ended abnormally");
    }

    result?;
    Ok(())
}

// =============================================================================
// Offline Command Handlers
// =============================================================================

async fn handle_sweep(data: &DataArgs) -> Result<(), Box<dyn std::error::Error>> {
    let _data_lock = DataFileLock::acquire(&data.data)?;
    let store = Arc::new(open_data_file(data)?);
    let locks = Arc::new(LockManager::new(LockConfig::default()));
    let outcome = BatchCompleter::new(store, locks).run().await?;

    match data.output {
        OutputFormat::Json => println!("{}", serde_json::to_string_pretty(&outcome)?),
        OutputFormat::Table => {
            println!("Completed {} pending job(s)", outcome.count);
            for id in &outcome.ids {
                println!("  {}", id);
            }
        }
    }
    Ok(())
}

fn handle_index_rebuild(data: &DataArgs) -> Result<(), Box<dyn std::error::Error>> {
    let _data_lock = DataFileLock::acquire(&data.data)?;
    let store = open_data_file(data)?;
    let repair = store.rebuild_status_index()?;

    match data.output {
        OutputFormat::Json => {
            let output = RepairOutput {
                moved: repair.moved,
                added: repair.added,
                dropped: repair.dropped,
            };
            println!("{}", serde_json::to_string_pretty(&output)?);
        }
        OutputFormat::Table => {
            if repair.is_clean() {
                println!("Status index was consistent.");
            } else {
                println!("Status index repaired:");
                println!("  Moved:   {}", repair.moved);
                println!("  Added:   {}", repair.added);
                println!("  Dropped: {}", repair.dropped);
            }
        }
    }
    Ok(())
}

fn handle_job_list(
    data: &DataArgs,
    status: Option<JobStatus>,
    title: Option<String>,
    page: Option<usize>,
    size: Option<usize>,
) -> Result<(), Box<dyn std::error::Error>> {
    let store = open_data_file(data)?;

    let (jobs, total_count, total_pages) = match size {
        Some(size) => {
            let page = store.find_all_paginated(page.unwrap_or(0), size)?;
            let total = page.metadata.total_elements;
            (page.data, total, Some(page.metadata.total_pages))
        }
        None => {
            let jobs = store.search(&SearchQuery { status, title })?;
            let total = jobs.len();
            (jobs, total, None)
        }
    };

    match data.output {
        OutputFormat::Json => {
            let output = JobListOutput {
                jobs: &jobs,
                total_count,
                total_pages,
            };
            println!("{}", serde_json::to_string_pretty(&output)?);
        }
        OutputFormat::Table => {
            if jobs.is_empty() {
                println!("No jobs found.");
            } else {
                print_job_table(&jobs);
                println!();
                println!("Showing {} of {} jobs", jobs.len(), total_count);
            }
        }
    }
    Ok(())
}

fn handle_job_show(data: &DataArgs, job_id: Uuid) -> Result<(), Box<dyn std::error::Error>> {
    let store = open_data_file(data)?;
    let Some(job) = store.find_by_id(&job_id)? else {
        eprintln!("Error: Job not found: {}", job_id);
        std::process::exit(1);
    };

    match data.output {
        OutputFormat::Json => println!("{}", serde_json::to_string_pretty(&job)?),
        OutputFormat::Table => {
            println!("Job ID:       {}", job.id);
            println!("Title:        {}", job.title);
            println!("Status:       {}", job.status.as_str().to_uppercase());
            println!("Created At:   {}", job.created_at.to_rfc3339());
            println!("Updated At:   {}", job.updated_at.to_rfc3339());
            println!("Description:");
            for line in job.description.lines() {
                println!("  {}", line);
            }
        }
    }
    Ok(())
}

// =============================================================================
// Main Entry Point
// =============================================================================

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let args = Args::parse();

    match args.command {
        Commands::Server(server_args) => {
            run_server(server_args).await?;
        }
        Commands::Sweep { data } => {
            init_logging("warn");
            handle_sweep(&data).await?;
        }
        Commands::Index { data, command } => {
            init_logging("warn");
            match command {
                IndexCommands::Rebuild => handle_index_rebuild(&data)?,
            }
        }
        Commands::Job { data, command } => {
            init_logging("warn");
            match command {
                JobCommands::List {
                    status,
                    title,
                    page,
                    size,
                } => handle_job_list(&data, status, title, page, size)?,
                JobCommands::Show { job_id } => handle_job_show(&data, job_id)?,
            }
        }
    }

    Ok(())
}
