//! rowq CLI: operator interface to a queue database.
//!
//! Producer-only. The commit hook is off and no handlers are registered, so
//! pushed jobs wait for the consuming process to pick them up.

use std::path::PathBuf;

use anyhow::Context as _;
use clap::{Parser, Subcommand};
use rowq::config::Config;
use rowq::telemetry::init_telemetry;
use rowq::{Database, Job, JobId, Queue, State};

#[derive(Parser)]
#[command(name = "rowq", about = "Durable job queue on SQLite")]
struct Cli {
    /// Database file (overrides ROWQ_DATABASE_PATH)
    #[arg(long, global = true)]
    database: Option<PathBuf>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Enqueue a job
    Push {
        /// Type tag that selects the handler
        job_type: String,
        /// JSON payload
        #[arg(long, default_value = "{}")]
        payload: String,
    },
    /// List jobs, oldest first
    List {
        /// Only jobs in this state
        #[arg(long)]
        state: Option<State>,
        /// Maximum jobs to show
        #[arg(long, default_value_t = 20)]
        limit: usize,
    },
    /// Show one job as JSON
    Show { id: JobId },
    /// Job counts per state
    Stats,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    dotenvy::dotenv().ok();
    let cli = Cli::parse();

    let mut config = Config::from_env()?;
    if let Some(path) = cli.database {
        config.database_path = Some(path);
    }

    let _telemetry = init_telemetry(config.telemetry_config("rowq"))?;

    let queue_config = config.queue_config().commit_hook(false);
    if queue_config.database == Database::Memory {
        anyhow::bail!("no database file given; set ROWQ_DATABASE_PATH or pass --database");
    }

    let queue = Queue::open(queue_config)?;
    let result = match cli.command {
        Command::Push { job_type, payload } => cmd_push(&queue, &job_type, &payload),
        Command::List { state, limit } => cmd_list(&queue, state, limit),
        Command::Show { id } => cmd_show(&queue, id),
        Command::Stats => cmd_stats(&queue),
    };
    queue.close()?;
    result
}

fn cmd_push(queue: &Queue, job_type: &str, payload: &str) -> anyhow::Result<()> {
    let payload: serde_json::Value =
        serde_json::from_str(payload).context("--payload must be valid JSON")?;
    let id = queue.send_json(job_type, &payload)?;
    println!("Enqueued: {id} (type: {job_type})");
    Ok(())
}

fn cmd_list(queue: &Queue, state: Option<State>, limit: usize) -> anyhow::Result<()> {
    let jobs = match state {
        Some(state) => queue.get_by_state(state, limit)?,
        None => queue.jobs()?.into_iter().take(limit).collect(),
    };

    if jobs.is_empty() {
        println!("No jobs found.");
        return Ok(());
    }

    println!(
        "{:<8}  {:<20}  {:<11}  {:<16}  ERROR",
        "ID", "TYPE", "STATE", "CREATED"
    );
    println!("{}", "-".repeat(80));
    for job in &jobs {
        println!(
            "{:<8}  {:<20}  {:<11}  {:<16}  {}",
            job.id,
            job.job_type,
            job.state,
            job.created_at.format("%Y-%m-%d %H:%M"),
            job.error.as_deref().unwrap_or("-")
        );
    }

    println!("\n{} job(s)", jobs.len());
    Ok(())
}

fn cmd_show(queue: &Queue, id: JobId) -> anyhow::Result<()> {
    let job = queue.get(id)?;
    println!("{}", serde_json::to_string_pretty(&job_view(&job))?);
    Ok(())
}

fn cmd_stats(queue: &Queue) -> anyhow::Result<()> {
    let counts = queue.counts()?;
    let total: u64 = counts.values().sum();
    for state in State::ALL {
        let n = counts.get(&state).copied().unwrap_or_default();
        if n > 0 {
            println!("{:<12} {n}", state.as_str());
        }
    }
    println!("{:<12} {total}", "total");
    Ok(())
}

/// The job with its payload shown as JSON when it parses, text otherwise.
fn job_view(job: &Job) -> serde_json::Value {
    let payload = serde_json::from_slice::<serde_json::Value>(&job.payload).unwrap_or_else(|_| {
        serde_json::Value::String(String::from_utf8_lossy(&job.payload).into_owned())
    });
    serde_json::json!({
        "id": job.id,
        "type": job.job_type,
        "status": job.state,
        "created_at": job.created_at,
        "updated_at": job.updated_at,
        "payload": payload,
        "error": job.error,
    })
}
