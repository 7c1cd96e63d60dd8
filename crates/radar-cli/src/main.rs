use std::time::Duration;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use radar_storage::{PgStore, PortalClient, PortalClientConfig};
use radar_sync::{digest_text, IngestConfig, IngestPipeline, SourceRegistry};
use sqlx::postgres::PgPoolOptions;
use tracing_subscriber::EnvFilter;

#[derive(Debug, Parser)]
#[command(name = "radar-cli")]
#[command(about = "Radar de Licitações command-line interface")]
struct Cli {
    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Debug, Subcommand)]
enum Commands {
    /// Run one ingestion pass across the configured portals.
    Ingest,
    /// Print the plain-text digest of recently updated opportunities.
    Digest {
        #[arg(long, default_value_t = 24)]
        hours: i64,
    },
    /// Apply pending database migrations.
    Migrate,
}

fn init_tracing() {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    tracing_subscriber::fmt().with_env_filter(filter).init();
}

async fn connect(config: &IngestConfig) -> Result<PgStore> {
    let pool = PgPoolOptions::new()
        .max_connections(5)
        .connect(&config.database_url)
        .await
        .context("connecting to database")?;
    Ok(PgStore::new(pool))
}

#[tokio::main]
async fn main() -> Result<()> {
    init_tracing();
    let cli = Cli::parse();
    let config = IngestConfig::from_env();

    match cli.command.unwrap_or(Commands::Ingest) {
        Commands::Ingest => {
            let store = connect(&config).await?;
            let registry = SourceRegistry::load_or_builtin(&config.sources_file)?;
            let client = PortalClient::new(PortalClientConfig {
                timeout: Duration::from_secs(config.http_timeout_secs),
                user_agent: config.user_agent.clone(),
                ..Default::default()
            })?;
            let pipeline = IngestPipeline::new(config, registry, client, store);
            let summary = pipeline.run_once().await?;
            println!(
                "ingest complete: run_id={} source={} inserted={} updated={}{}",
                summary.run_id,
                summary.winning_source.as_deref().unwrap_or("none"),
                summary.inserted,
                summary.updated,
                if summary.degraded { " (degraded)" } else { "" }
            );
        }
        Commands::Digest { hours } => {
            let store = connect(&config).await?;
            println!("{}", digest_text(&store, hours).await?);
        }
        Commands::Migrate => {
            let store = connect(&config).await?;
            store.migrate().await.context("applying migrations")?;
            println!("migrations applied");
        }
    }

    Ok(())
}
