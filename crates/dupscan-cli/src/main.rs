use std::path::PathBuf;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use dupscan_core::SimilarityThresholds;
use dupscan_engine::{DetectionRequest, DetectorConfig, DuplicateDetector};
use dupscan_storage::PgStore;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

#[derive(Debug, Parser)]
#[command(name = "dupscan-cli")]
#[command(about = "Near-duplicate detection for captured documents")]
struct Cli {
    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Debug, Subcommand)]
enum Commands {
    /// Run the HTTP API.
    Serve,
    /// Apply database migrations.
    Migrate,
    /// Check one document against its batch (or project) and print the report.
    Check {
        document_id: String,
        batch_id: String,
        #[arg(long)]
        cross_batch: bool,
        #[arg(long)]
        name_threshold: Option<f64>,
        #[arg(long)]
        address_threshold: Option<f64>,
        /// JSON fixture store to use instead of the database.
        #[arg(long)]
        fixtures: Option<PathBuf>,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "dupscan=info,tower_http=info".into()),
        )
        .with(tracing_subscriber::fmt::layer().with_writer(std::io::stderr))
        .init();

    let cli = Cli::parse();

    match cli.command.unwrap_or(Commands::Serve) {
        Commands::Serve => {
            dupscan_web::serve_from_env().await?;
        }
        Commands::Migrate => {
            let config = DetectorConfig::from_env()?;
            PgStore::connect(&config.database_url).await?.migrate().await?;
            tracing::info!("migrations applied");
        }
        Commands::Check {
            document_id,
            batch_id,
            cross_batch,
            name_threshold,
            address_threshold,
            fixtures,
        } => {
            let mut config = DetectorConfig::from_env()?;
            if fixtures.is_some() {
                config.fixtures_path = fixtures;
            }
            let thresholds = SimilarityThresholds {
                name: name_threshold.unwrap_or(config.thresholds.name),
                address: address_threshold.unwrap_or(config.thresholds.address),
                ..config.thresholds
            };

            let detector = DuplicateDetector::from_config(&config).await?;
            let request = DetectionRequest::new(document_id, batch_id)
                .cross_batch(cross_batch)
                .thresholds(thresholds);
            let report = detector.detect(&request).await?;
            println!(
                "{}",
                serde_json::to_string_pretty(&report).context("serializing detection report")?
            );
            if report.truncated {
                eprintln!(
                    "warning: candidate set was capped at {}; some documents were not compared",
                    config.max_candidates
                );
            }
        }
    }

    Ok(())
}
