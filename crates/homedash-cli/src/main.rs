use std::path::PathBuf;
use std::sync::atomic::Ordering;
use std::time::Duration;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use homedash_migrate::{
    apply_named_migration, run_batch_from_file, DestinationWriter, MigrationRunner, PgDestination,
    RunnerConfig, CREATE_WEATHER_HISTORY, DEFAULT_BATCH_SIZE, WEATHER_HISTORY_DDL,
};
use sqlx::PgPool;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

#[derive(Debug, Parser)]
#[command(name = "homedash")]
#[command(about = "Home automation dashboard backend")]
struct Cli {
    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Debug, Subcommand)]
enum Commands {
    /// Run the web dashboard and API.
    Serve,
    /// Migrate the legacy sqlite archive into Postgres.
    Migrate {
        #[arg(long, default_value_t = 0)]
        start: i64,
        #[arg(long, default_value_t = DEFAULT_BATCH_SIZE)]
        batch: i64,
        /// Process a single batch and print its result instead of looping.
        #[arg(long)]
        once: bool,
    },
    /// Create the destination tables and the migrations ledger.
    Setup,
}

fn init_tracing() {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .init();
}

async fn connect_pg() -> Result<PgPool> {
    let url = std::env::var("DATABASE_URL").context("DATABASE_URL is not set")?;
    PgPool::connect(&url).await.context("connecting to Postgres")
}

fn sqlite_path() -> PathBuf {
    std::env::var("HOMEDASH_SQLITE_PATH")
        .map(PathBuf::from)
        .unwrap_or_else(|_| PathBuf::from("db-to-migrate/energy.db"))
}

#[tokio::main]
async fn main() -> Result<()> {
    init_tracing();
    let cli = Cli::parse();

    match cli.command.unwrap_or(Commands::Serve) {
        Commands::Serve => homedash_web::serve_from_env().await?,
        Commands::Migrate { start, batch, once } => {
            let pool = connect_pg().await?;
            let dest = PgDestination::new(pool);
            let path = sqlite_path();

            if once {
                let result = run_batch_from_file(&path, &dest, start, batch).await?;
                println!("{}", serde_json::to_string_pretty(&result)?);
                return Ok(());
            }

            let runner = MigrationRunner::new(RunnerConfig {
                start_offset: start,
                batch_size: batch,
                batch_delay: Duration::from_secs(1),
            });
            let stop = runner.stop_handle();
            tokio::spawn(async move {
                if tokio::signal::ctrl_c().await.is_ok() {
                    warn!("stop requested; finishing the current batch");
                    stop.store(true, Ordering::SeqCst);
                }
            });

            let summary = runner.run(&path, &dest).await;
            info!(
                run_id = %summary.run_id,
                state = ?summary.state,
                batches = summary.batches,
                successful = summary.successful,
                failed = summary.failed,
                "migration finished"
            );
            println!("{}", serde_json::to_string_pretty(&summary)?);
            if let Some(error) = &summary.error {
                anyhow::bail!("migration failed: {error}");
            }
        }
        Commands::Setup => {
            let pool = connect_pg().await?;
            let dest = PgDestination::new(pool.clone());
            dest.ensure_schema().await?;
            let applied =
                apply_named_migration(&pool, CREATE_WEATHER_HISTORY, WEATHER_HISTORY_DDL).await?;
            println!(
                "setup complete (weather history {})",
                if applied { "created" } else { "already present" }
            );
        }
    }

    Ok(())
}
