use std::sync::Arc;

use chrono::Utc;
use clap::{Parser, Subcommand};
use serde_json::json;
use uuid::Uuid;

use jobflow::api::models::JobView;
use jobflow::config::Config;
use jobflow::db;
use jobflow::jobs::reaper::Reaper;
use jobflow::jobs::{JobStore, JobsRepo, LifecycleEngine, NewJob};
use jobflow::transport::{Notifier, PgNotifier};

#[derive(Parser, Debug)]
#[command(name = "jobflowctl", about = "Operator commands for the jobflow job store", version)]
struct Cli {
    /// Defaults to DATABASE_URL, then TEST_DATABASE_URL.
    #[arg(long, global = true)]
    database_url: Option<String>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Apply pending migrations
    Migrate,
    /// Delete every job row
    Reset,
    /// Insert demo jobs
    Seed {
        #[arg(default_value_t = 10)]
        n: u32,
        #[arg(long, default_value = "webhook-event")]
        job_type: String,
        #[arg(long)]
        queue: Option<String>,
    },
    /// Print one job as JSON
    Show { id: Uuid },
    /// Cancel a queued or failed job
    Cancel { id: Uuid },
    /// Re-enqueue a dead job as a fresh copy
    Replay { id: Uuid },
    /// Run one lock-expiry sweep now
    Reap,
    /// Job counts per queue and status
    Counts,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    dotenvy::dotenv().ok();
    let cli = Cli::parse();

    let database_url = cli
        .database_url
        .clone()
        .or_else(|| std::env::var("DATABASE_URL").ok())
        .or_else(|| std::env::var("TEST_DATABASE_URL").ok());
    let cfg = Config::from_lookup(|key| match key {
        "DATABASE_URL" => database_url.clone(),
        _ => std::env::var(key).ok(),
    })?;
    jobflow::telemetry::init_with("warn", false);

    let pool = db::make_pool(&cfg).await?;
    let repo = JobsRepo::new(pool.clone());
    let notifier = PgNotifier::new(pool.clone());

    match cli.command {
        Command::Migrate => {
            db::run_migrations(&pool).await?;
            println!("migrations applied");
        }
        Command::Reset => {
            db::truncate_jobs(&pool).await?;
            println!("reset OK");
        }
        Command::Seed { n, job_type, queue } => {
            let queue = queue.unwrap_or_else(|| cfg.default_queue.clone());
            for i in 0..n {
                let job = NewJob::now(&queue, &job_type, json!({ "seq": i }), cfg.max_attempts);
                let id = repo.insert(job, Utc::now()).await?;
                notifier.publish(&queue, id).await?;
                println!("+ inserted {job_type} id={id}");
            }
        }
        Command::Show { id } => {
            let job = repo.get(id).await?;
            println!("{}", serde_json::to_string_pretty(&JobView::from(job))?);
        }
        Command::Cancel { id } => {
            let job = repo.cancel(id, Utc::now()).await?;
            println!("{} -> {}", job.id, job.status);
        }
        Command::Replay { id } => {
            let new_id = repo.replay(id, Utc::now()).await?;
            let copy = repo.get(new_id).await?;
            notifier.publish(&copy.queue, new_id).await?;
            println!("{id} replayed as {new_id}");
        }
        Command::Reap => {
            let engine = LifecycleEngine::new(Arc::new(repo), cfg.retry(), cfg.liveness_timeout);
            let reaper = Reaper::new(engine, Arc::new(notifier), cfg.reap_interval);
            let report = reaper.run_once().await?;
            println!(
                "requeued={} dead={}",
                report.requeued.len(),
                report.dead.len()
            );
        }
        Command::Counts => {
            for row in repo.status_counts().await? {
                println!("{:<24} {:<10} {}", row.queue, row.status.as_str(), row.count);
            }
        }
    }

    Ok(())
}
