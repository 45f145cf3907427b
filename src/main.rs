use aemo_ingest::{BackfillArgs, CollectArgs, backfill, config::Config, daemon, status};
use anyhow::Result;
use clap::{Parser, Subcommand};
use tracing_subscriber::EnvFilter;

#[derive(Parser, Debug)]
#[command(version, about)]
struct Args {
    #[command(subcommand)]
    command: Option<Command>,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Run the continuous ingestion scheduler
    Collect(CollectArgs),
    /// Replay historical archives with staged validation
    Backfill(BackfillArgs),
    /// Print a read-only summary of the canonical datasets
    Status,
}

#[tokio::main]
async fn main() -> Result<()> {
    dotenvy::dotenv().ok();

    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .with_target(false)
        .init();

    let args = Args::parse();
    let config = Config::from_env();

    match args.command {
        Some(Command::Collect(collect_args)) => {
            daemon::execute(config, &collect_args).await?;
        }
        Some(Command::Backfill(backfill_args)) => {
            backfill::execute(config, &backfill_args).await?;
        }
        Some(Command::Status) => {
            status::execute(&config)?;
        }
        None => {
            // default behavior: run the scheduler continuously
            daemon::execute(config, &CollectArgs::default()).await?;
        }
    }
    Ok(())
}
