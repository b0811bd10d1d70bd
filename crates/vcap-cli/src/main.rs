use std::sync::Arc;

use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use clap::{Parser, Subcommand};
use tracing_subscriber::EnvFilter;
use vcap_core::IntervalWindow;
use vcap_pipeline::{build_scheduler, Pipeline, PipelineConfig};
use vcap_storage::PgContentStore;

#[derive(Debug, Parser)]
#[command(name = "vcap-cli")]
#[command(about = "Interval-partitioned video caption ingestion")]
struct Cli {
    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Debug, Subcommand)]
enum Commands {
    /// Run all stages once for the window ending at the given instant.
    Run {
        /// Window end as RFC 3339; defaults to now. Truncated to the hour.
        #[arg(long)]
        end: Option<DateTime<Utc>>,
    },
    /// Run every window between two instants, oldest first.
    Backfill {
        #[arg(long)]
        from: DateTime<Utc>,
        #[arg(long)]
        to: DateTime<Utc>,
    },
    /// Apply destination store migrations and exit.
    Migrate,
    /// Run windows on the configured cron until interrupted.
    Schedule,
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    let cli = Cli::parse();
    let config = PipelineConfig::from_env()?;
    let window_hours = config.window_hours;

    match cli.command.unwrap_or(Commands::Run { end: None }) {
        Commands::Run { end } => {
            let window = IntervalWindow::ending_at(end.unwrap_or_else(Utc::now), window_hours);
            let pipeline = Pipeline::from_config(config).await?;
            let summary = pipeline.run_interval(&window).await?;
            println!(
                "run complete: run_id={} interval={} discovered={} enriched={}",
                summary.run_id, summary.interval, summary.discovered, summary.enriched
            );
            println!(
                "captions: found={} missing={} failed={}",
                summary.captions_found, summary.captions_missing, summary.captions_failed
            );
            println!(
                "joined={} anomalies={} upserted={}/{}",
                summary.joined,
                summary.join_anomalies,
                summary.upsert_written,
                summary.upsert_attempted
            );
        }
        Commands::Backfill { from, to } => {
            let pipeline = Pipeline::from_config(config).await?;
            let summaries = pipeline.backfill(from, to).await?;
            for summary in &summaries {
                println!(
                    "interval={} discovered={} joined={} upserted={}",
                    summary.interval, summary.discovered, summary.joined, summary.upsert_written
                );
            }
            println!("backfill complete: intervals={}", summaries.len());
        }
        Commands::Migrate => {
            let store = PgContentStore::connect(&config.database_url).await?;
            store.run_migrations().await?;
            println!("migrations applied");
        }
        Commands::Schedule => {
            let pipeline = Arc::new(Pipeline::from_config(config).await?);
            let scheduler = build_scheduler(pipeline).await?;
            scheduler.start().await.context("starting scheduler")?;
            println!("scheduler running, ctrl-c to stop");
            tokio::signal::ctrl_c()
                .await
                .context("waiting for shutdown signal")?;
        }
    }

    Ok(())
}
