use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use clap::{Parser, Subcommand};
use sked_core::{DatabaseConfig, SkedConfig, TaskInstance};
use sked_scheduler::SchedulerBuilder;
use sked_store::{ExecutionStore, ScheduledFilter, SqlExecutionStore, SqliteRunner};
use tracing::info;

mod demo;

#[derive(Parser)]
#[command(name = "sked-daemon")]
#[command(about = "Persistent, cluster-safe task scheduler", long_about = None)]
struct Cli {
    /// Config file (falls back to SKED_CONFIG, then ~/.sked/sked.toml)
    #[arg(long)]
    config: Option<String>,
    /// Override scheduler.name
    #[arg(long)]
    name: Option<String>,
    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Subcommand)]
enum Commands {
    /// Run the scheduler until Ctrl-C (default)
    Run,
    /// List scheduled executions
    List {
        /// Only this task name
        #[arg(long)]
        task: Option<String>,
        /// Only picked (true) or unpicked (false) executions
        #[arg(long)]
        picked: Option<bool>,
        #[arg(long, default_value = "50")]
        limit: u32,
    },
    /// Add an execution for a registered task
    Schedule {
        task: String,
        id: String,
        /// Seconds from now
        #[arg(long, default_value = "0")]
        delay: u64,
        /// JSON payload
        #[arg(long)]
        data: Option<String>,
    },
    /// Delete an execution that is not currently running
    Cancel { task: String, id: String },
    /// List executions failing without a success for at least this many minutes
    Failing {
        #[arg(long, default_value = "60")]
        minutes: u64,
    },
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "sked_daemon=info,sked_scheduler=info,sked_store=info".into()),
        )
        .init();

    let cli = Cli::parse();

    // explicit flag > SKED_CONFIG env > ~/.sked/sked.toml
    let config_path = cli.config.or_else(|| std::env::var("SKED_CONFIG").ok());
    let mut config = SkedConfig::load(config_path.as_deref()).context("loading configuration")?;
    if let Some(name) = cli.name {
        config.scheduler.name = name;
    }

    let store = open_store(&config.database)?;
    let registry = demo::registry(Arc::clone(&store))?;
    let scheduler = SchedulerBuilder::from_config(store, registry, &config).build()?;

    match cli.command.unwrap_or(Commands::Run) {
        Commands::Run => {
            scheduler.start()?;
            demo::seed(&scheduler)?;
            info!(scheduler = %scheduler.name(), "sked daemon running, Ctrl-C to stop");

            tokio::signal::ctrl_c().await?;
            info!("shutdown requested");
            scheduler.stop().await?;
        }
        Commands::List { task, picked, limit } => {
            let mut filter = ScheduledFilter::all().limit(limit);
            filter.picked = picked;
            if let Some(task) = task {
                filter = filter.for_task(task);
            }
            let executions = scheduler.scheduled_executions(&filter)?;
            if executions.is_empty() {
                println!("No scheduled executions.");
            }
            for execution in executions {
                println!("{execution}");
            }
        }
        Commands::Schedule { task, id, delay, data } => {
            let mut instance = TaskInstance::new(task, id);
            if let Some(json) = data {
                let value: serde_json::Value =
                    serde_json::from_str(&json).context("--data must be valid JSON")?;
                instance = instance.with_json(&value)?;
            }
            let when = chrono::Duration::from_std(Duration::from_secs(delay))
                .ok()
                .and_then(|delay| chrono::Utc::now().checked_add_signed(delay))
                .context("--delay out of range")?;
            if scheduler.schedule(instance.clone(), when)? {
                println!("Scheduled {instance} at {}", when.to_rfc3339());
            } else {
                println!("{instance} already exists");
            }
        }
        Commands::Cancel { task, id } => {
            let instance = TaskInstance::new(task, id);
            scheduler.cancel(&instance)?;
            println!("Cancelled {instance}");
        }
        Commands::Failing { minutes } => {
            let period = Duration::from_secs(minutes.saturating_mul(60));
            for execution in scheduler.executions_failing_longer_than(period)? {
                println!(
                    "{execution} failures={} last_success={}",
                    execution.consecutive_failures,
                    execution
                        .last_success
                        .map(|t| t.to_rfc3339())
                        .unwrap_or_else(|| "never".into())
                );
            }
        }
    }
    Ok(())
}

fn open_store(db: &DatabaseConfig) -> anyhow::Result<Arc<dyn ExecutionStore>> {
    ensure_parent_dir(&db.path);
    info!(path = %db.path, table = %db.table, "opening SQLite database");

    let runner = SqliteRunner::open(&db.path)?;
    runner.init_schema(&db.table)?;
    let store = SqlExecutionStore::with_table(runner, db.table.clone())?.with_row_locking(db.row_locking);
    Ok(Arc::new(store))
}

fn ensure_parent_dir(path: &str) {
    if let Some(parent) = std::path::Path::new(path).parent() {
        let _ = std::fs::create_dir_all(parent);
    }
}
