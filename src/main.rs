use anyhow::Context;
use btc_price_etl::{FixedIntervalSchedule, Pipeline, PollingLoop, Settings, Trigger};
use chrono::{NaiveDate, Utc};
use clap::{Parser, Subcommand};
use std::path::PathBuf;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};
use tracing_subscriber::filter::LevelFilter;
use tracing_subscriber::EnvFilter;

/// Appends the current BTC price to a date-partitioned CSV log
#[derive(Debug, Parser)]
#[command(name = "btc-price-etl", version, about)]
struct Cli {
    /// Env file to load before reading the environment (defaults to ./.env if present)
    #[arg(long, global = true)]
    env_file: Option<PathBuf>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Debug, Subcommand)]
enum Command {
    /// Fetch, validate and store one price observation
    RunOnce {
        /// Logical date selecting the partition (YYYY-MM-DD, defaults to today in UTC)
        #[arg(long)]
        date: Option<NaiveDate>,
    },
    /// Run on wall-clock aligned ticks (SCHEDULE_INTERVAL_SECS, 15 minutes by default)
    Schedule {
        #[arg(long)]
        max_runs: Option<u32>,
    },
    /// Run in a loop with POLL_DELAY_SECS between runs
    Poll {
        #[arg(long)]
        max_runs: Option<u32>,
    },
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Initialize logging
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::builder()
                .with_default_directive(LevelFilter::INFO.into())
                .from_env_lossy(),
        )
        .init();

    let cli = Cli::parse();

    let settings = Settings::load(cli.env_file.as_deref()).context("failed to load settings")?;
    info!(
        "Price API: {}, data dir: {}",
        settings.price_api_url,
        settings.data_dir.display()
    );

    let pipeline = Pipeline::from_settings(&settings).context("failed to build pipeline")?;

    let trigger: Box<dyn Trigger> = match cli.command {
        Command::RunOnce { date } => {
            let logical_date = date.unwrap_or_else(|| Utc::now().date_naive());
            let report = pipeline.run_once(logical_date).await?;
            info!("BTC price saved to {}", report.csv_path.display());
            return Ok(());
        }
        Command::Schedule { max_runs } => {
            Box::new(FixedIntervalSchedule::from_settings(&settings).with_max_runs(max_runs))
        }
        Command::Poll { max_runs } => {
            Box::new(PollingLoop::from_settings(&settings).with_max_runs(max_runs))
        }
    };

    let shutdown = CancellationToken::new();
    {
        let shutdown = shutdown.clone();
        tokio::spawn(async move {
            match tokio::signal::ctrl_c().await {
                Ok(()) => {
                    info!("Shutdown requested, finishing current run");
                    shutdown.cancel();
                }
                Err(e) => warn!("Cannot listen for Ctrl-C: {}", e),
            }
        });
    }

    info!("Starting {} trigger", trigger.name());
    let stats = trigger.run(&pipeline, shutdown).await;

    if stats.failed > 0 {
        error!("{} of {} runs failed", stats.failed, stats.total());
    }

    Ok(())
}
