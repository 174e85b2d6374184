use std::sync::Arc;

use anyhow::Result;
use clap::{Parser, Subcommand};
use tracing::info;
use tracing_subscriber::EnvFilter;

use vitrine_embed::{EmbedConfig, Embedder, HttpEmbedder, NoopEmbedder};
use vitrine_storage::{FetcherConfig, PageFetcher, RecordStore, RestRecordStore, StoreConfig};
use vitrine_sync::{PipelineConfig, SyncPipeline};

#[derive(Debug, Parser)]
#[command(name = "vitrine")]
#[command(about = "Catalog scraper and store synchronizer")]
struct Cli {
    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Debug, Subcommand)]
enum Commands {
    /// Scrape the configured storefront and sync the products table.
    Sync {
        /// Cap the number of products scraped this run.
        #[arg(long)]
        limit: Option<usize>,
        /// Compute and report the plan without writing anything.
        #[arg(long)]
        dry_run: bool,
        /// Skip embedding generation for this run.
        #[arg(long)]
        no_embeddings: bool,
        /// Override the mass-deletion guard after inspecting a blocked run.
        #[arg(long)]
        allow_mass_delete: bool,
    },
    /// List every product URL currently discoverable on the storefront.
    Discover,
    /// Verify connectivity to the record store and the storefront.
    Check,
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| "info".into()))
        .init();

    let cli = Cli::parse();

    match cli.command.unwrap_or(Commands::Sync {
        limit: None,
        dry_run: false,
        no_embeddings: false,
        allow_mass_delete: false,
    }) {
        Commands::Sync {
            limit,
            dry_run,
            no_embeddings,
            allow_mass_delete,
        } => {
            let mut config = PipelineConfig::from_env();
            if let Some(limit) = limit {
                config.product_limit = Some(limit);
            }
            config.dry_run = dry_run;
            if allow_mass_delete {
                config.guard.allow_mass_delete = true;
            }

            let pipeline = build_pipeline(config, no_embeddings)?;
            let summary = pipeline.run_once().await?;
            println!(
                "sync complete: source={} discovered={} scraped={} inserted={} updated={} skipped={} deleted={}{}{}",
                summary.source,
                summary.discovered,
                summary.scraped,
                summary.sync.inserted,
                summary.sync.updated,
                summary.sync.skipped,
                summary.sync.deleted,
                if summary.sync.deletes_blocked {
                    " (deletes blocked by guard)"
                } else {
                    ""
                },
                if dry_run { " [dry run]" } else { "" },
            );
        }
        Commands::Discover => {
            let config = PipelineConfig::from_env();
            let pipeline = build_pipeline(config, true)?;
            let urls = pipeline.discover().await?;
            for url in &urls {
                println!("{url}");
            }
            info!(count = urls.len(), "discovery complete");
        }
        Commands::Check => {
            let store = RestRecordStore::new(StoreConfig::from_env()?)?;
            store.check_connection().await?;
            println!("record store reachable");

            let config = PipelineConfig::from_env();
            let fetcher = PageFetcher::new(FetcherConfig::default())?;
            let html = fetcher.fetch_text(&config.base_url).await?;
            println!("storefront reachable ({} bytes)", html.len());
        }
    }

    Ok(())
}

fn build_pipeline(config: PipelineConfig, no_embeddings: bool) -> Result<SyncPipeline> {
    let fetcher = PageFetcher::new(FetcherConfig::default())?;
    let store: Arc<dyn RecordStore> = Arc::new(RestRecordStore::new(StoreConfig::from_env()?)?);
    let embedder: Arc<dyn Embedder> = match EmbedConfig::from_env() {
        Some(embed_config) if !no_embeddings => Arc::new(HttpEmbedder::new(embed_config)?),
        _ => {
            info!("embeddings disabled for this run");
            Arc::new(NoopEmbedder)
        }
    };
    Ok(SyncPipeline::new(config, fetcher, store, embedder))
}
