use anyhow::Result;
use chrono::Utc;
use clap::{Parser, Subcommand};
use mkt_core::Cadence;
use tracing_subscriber::EnvFilter;

#[derive(Debug, Parser)]
#[command(name = "mkt-cli")]
#[command(about = "Market data sync engine")]
struct Cli {
    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Debug, Subcommand)]
enum Commands {
    /// Backfill, then run the cadence scheduler until Ctrl-C.
    Run,
    /// Run the startup backfill once and exit.
    Backfill,
    /// Run a single incremental tick.
    Tick {
        #[arg(long, default_value = "1h")]
        cadence: Cadence,
    },
    Migrate,
    /// Print the backfill plan for the current time as JSON.
    Plan,
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();

    let cli = Cli::parse();

    match cli.command.unwrap_or(Commands::Run) {
        Commands::Run => mkt_sync::run_forever_from_env().await?,
        Commands::Backfill => {
            let summary = mkt_sync::run_backfill_from_env().await?;
            println!(
                "backfill complete: run_id={} windows={} failed={} inserted={} skipped={:?}",
                summary.run_id,
                summary.windows.len(),
                summary.failed_steps.len(),
                summary.inserted(),
                summary.skipped_kinds
            );
        }
        Commands::Tick { cadence } => {
            let summary = mkt_sync::run_tick_from_env(cadence).await?;
            println!(
                "tick complete: run_id={} cadence={} window={} inserted={} expired={}",
                summary.run_id,
                summary.cadence,
                summary.window,
                summary.inserted(),
                summary.expired
            );
        }
        Commands::Migrate => mkt_sync::migrate_from_env().await?,
        Commands::Plan => {
            let plan = mkt_sync::backfill_plan_from_env(Utc::now()).await?;
            println!("{}", serde_json::to_string_pretty(&plan)?);
        }
    }

    Ok(())
}
