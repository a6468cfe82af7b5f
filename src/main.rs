use anyhow::Result;
use clap::{Parser, Subcommand};
use std::sync::Arc;
use tracing::info;

use mondex::import::scheduler::{PgJobQueue, QueueScheduler, Scheduler, TimerScheduler};
use mondex::store::{CatalogStore, MemoryStore, PgStore, StateStore};
use mondex::util::env as env_util;
use mondex::{EngineConfig, ImportEngine, StartOutcome, TickOutcome};

#[derive(Parser)]
#[command(name = "mondex", about = "Tick-driven importer for a game entity catalog dump")]
struct Cli {
    /// Run against an in-memory store (dry run; nothing persists).
    #[arg(long, global = true)]
    memory: bool,
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Start an import and drive ticks in-process until it stops.
    Import {
        path: String,
        /// Reimport even if the document is unchanged since the last run.
        #[arg(long)]
        force: bool,
    },
    /// Run exactly one tick (external-scheduler mode, e.g. a cron job or a
    /// queue worker); follow-up ticks are re-enqueued, not run here.
    Tick,
    /// Print the status poll triple as JSON.
    Status,
    /// Print the last completed run's summary.
    LastRun,
}

#[tokio::main]
async fn main() -> Result<()> {
    env_util::init_env();
    mondex::logging::init_tracing("info,sqlx=warn")?;
    let cli = Cli::parse();
    let config = EngineConfig::from_env();

    if cli.memory {
        let store = Arc::new(MemoryStore::new());
        let tick_queue: Arc<dyn Scheduler> = Arc::new(QueueScheduler::new());
        dispatch(store, cli.command, config, tick_queue).await
    } else {
        let database_url = env_util::db_url()?;
        let max_conns: u32 = env_util::env_parse("DB_MAX_CONNS", 5);
        let store = Arc::new(PgStore::connect(&database_url, max_conns).await?);
        // In external-scheduler mode, follow-up ticks land in import_jobs for
        // whichever worker polls the queue next.
        let tick_queue: Arc<dyn Scheduler> = Arc::new(PgJobQueue::new(store.pool.clone()));
        dispatch(store, cli.command, config, tick_queue).await
    }
}

async fn dispatch<S>(
    store: Arc<S>,
    command: Command,
    config: EngineConfig,
    tick_queue: Arc<dyn Scheduler>,
) -> Result<()>
where
    S: CatalogStore + StateStore + 'static,
{
    match command {
        Command::Import { path, force } => {
            let (scheduler, mut jobs) = TimerScheduler::new();
            let engine = ImportEngine::new(store, Arc::new(scheduler), config);
            match engine.start(&path, force).await? {
                StartOutcome::Unchanged => {
                    println!("document unchanged since last run; use --force to reimport");
                    return Ok(());
                }
                StartOutcome::AlreadyRunning => {
                    println!("another import is in flight; try again later");
                    return Ok(());
                }
                StartOutcome::Started => info!(path = %path, "import started"),
            }
            while let Some((_job_id, _payload)) = jobs.recv().await {
                match engine.tick().await? {
                    TickOutcome::Continue | TickOutcome::Locked => {}
                    TickOutcome::Finished => {
                        if let Some(summary) = engine.last_run().await? {
                            println!("{}", serde_json::to_string_pretty(&summary.counters)?);
                        }
                        break;
                    }
                    TickOutcome::Failed => {
                        let status = engine.status().await?;
                        eprintln!("import failed: {}", status.message);
                        std::process::exit(1);
                    }
                    TickOutcome::Idle => break,
                }
            }
        }
        Command::Tick => {
            let engine = ImportEngine::new(store, tick_queue, config);
            let outcome = engine.tick().await?;
            println!("{outcome:?}");
            if outcome == TickOutcome::Failed {
                std::process::exit(1);
            }
        }
        Command::Status => {
            let engine = ImportEngine::new(store, tick_queue, config);
            let status = engine.status().await?;
            println!("{}", serde_json::to_string_pretty(&status)?);
        }
        Command::LastRun => {
            let engine = ImportEngine::new(store, tick_queue, config);
            match engine.last_run().await? {
                Some(summary) => println!("{}", serde_json::to_string_pretty(&summary)?),
                None => println!("no completed run"),
            }
        }
    }
    Ok(())
}
