use std::path::PathBuf;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use tracing::info;
use tracing_subscriber::{fmt::SubscriberBuilder, EnvFilter};
use wfwiki_core::EntityKind;
use wfwiki_storage::SqliteRecordStore;
use wfwiki_sync::{ExportFormat, SyncConfig, SyncPipeline};

#[derive(Debug, Parser)]
#[command(name = "wfwiki-cli")]
#[command(about = "Warframe reference data sync, export and API server")]
struct Cli {
    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Debug, Subcommand)]
enum Commands {
    /// Fetch, merge and upsert one kind or all of them.
    Sync {
        #[arg(long)]
        kind: Option<EntityKind>,
    },
    /// Create the record tables.
    Migrate,
    /// Serve the JSON API (and the cron sync when enabled).
    Serve,
    Export {
        #[arg(long, default_value = "all")]
        format: ExportFormat,
        #[arg(long)]
        out: Option<PathBuf>,
    },
}

fn init_tracing(default_filter: &str) -> Result<()> {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_filter));
    SubscriberBuilder::default()
        .with_env_filter(filter)
        .with_target(true)
        .try_init()
        .map_err(|e| anyhow::anyhow!("failed to initialize tracing: {}", e))
}

#[tokio::main]
async fn main() -> Result<()> {
    init_tracing("info,wfwiki_sync=debug,wfwiki_adapters=info")?;
    let cli = Cli::parse();

    match cli.command.unwrap_or(Commands::Sync { kind: None }) {
        Commands::Sync { kind } => {
            let kinds = kind.map(|k| vec![k]).unwrap_or_else(|| EntityKind::ALL.to_vec());
            let summary = wfwiki_sync::run_sync_once_from_env(&kinds).await?;
            for batch in &summary.batches {
                let kind = batch.kind.table_name();
                match &batch.error {
                    Some(err) => println!("{kind}: failed: {err}"),
                    None => println!(
                        "{kind}: inserted={} updated={} rejected={} failed={}",
                        batch.inserted, batch.updated, batch.rejected, batch.failed
                    ),
                }
            }
            println!("sync complete: run_id={}", summary.run_id);
            if summary.failed_batches() > 0 {
                anyhow::bail!("{} batch(es) failed", summary.failed_batches());
            }
        }
        Commands::Migrate => {
            let config = SyncConfig::from_env();
            let store = SqliteRecordStore::connect(&config.database_url)
                .await
                .with_context(|| format!("connecting to {}", config.database_url))?;
            store.ensure_schema().await.context("creating tables")?;
            info!(database_url = %config.database_url, "schema ready");
            println!("migrate complete");
        }
        Commands::Serve => {
            wfwiki_web::serve_from_env().await?;
        }
        Commands::Export { format, out } => {
            let pipeline = SyncPipeline::from_config(SyncConfig::from_env()).await?;
            let manifest = pipeline.export(format, out.as_deref()).await?;
            for file in &manifest.files {
                println!("{} {} ({} bytes)", file.sha256, file.path, file.bytes);
            }
        }
    }

    Ok(())
}
