use std::io::Write;
use std::path::PathBuf;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use goodsale_feed::{FeedReader, OfferOutcome};
use goodsale_storage::PgRecordStore;
use goodsale_sync::{IngestPipeline, SyncConfig};
use tracing_subscriber::EnvFilter;

#[derive(Debug, Parser)]
#[command(name = "goodsale")]
#[command(about = "Catalog feed ingestion and similar-product enrichment")]
struct Cli {
    /// Records per matching page (overrides MATCH_BATCH_SIZE).
    #[arg(long, global = true)]
    batch_size: Option<usize>,

    /// Similarity queries in flight (overrides MAX_CONCURRENT_REQUESTS).
    #[arg(long, global = true)]
    concurrency: Option<usize>,

    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Debug, Subcommand)]
enum Commands {
    /// Fetch, store, index and enrich the configured feed.
    Run,
    /// Apply database migrations.
    Migrate,
    /// Parse a local feed file and print its records as JSON lines.
    Parse {
        #[arg(long)]
        file: PathBuf,
    },
    /// Re-run similarity matching over records already stored and indexed.
    Match,
}

#[tokio::main]
async fn main() -> Result<()> {
    dotenvy::dotenv().ok();
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .with_writer(std::io::stderr)
        .init();

    let cli = Cli::parse();
    let mut config = SyncConfig::from_env();
    if let Some(batch_size) = cli.batch_size {
        config = config.with_batch_size(batch_size);
    }
    if let Some(concurrency) = cli.concurrency {
        config = config.with_concurrency_limit(concurrency);
    }

    match cli.command.unwrap_or(Commands::Run) {
        Commands::Run => {
            let summary = IngestPipeline::connect(config).await?.run_once().await?;
            println!(
                "run complete: run_id={} parsed={} skipped={} inserted={} enriched={} failed={} commit_failed={}",
                summary.run_id,
                summary.feed.offers_parsed,
                summary.feed.offers_skipped,
                summary.inserted,
                summary.matching.enriched,
                summary.matching.failed,
                summary.matching.commit_failed,
            );
            if let Some(error) = &summary.feed_error {
                eprintln!("feed ended early: {error}");
            }
        }
        Commands::Migrate => {
            let store = PgRecordStore::connect(&config.database_url)
                .await
                .context("connecting to postgres")?;
            store.migrate().await?;
            println!("migrations applied");
        }
        Commands::Parse { file } => {
            let mut reader = FeedReader::from_path(&file)?;
            let stdout = std::io::stdout();
            let mut out = stdout.lock();
            for item in reader.by_ref() {
                if let OfferOutcome::Parsed(record) = item? {
                    serde_json::to_writer(&mut out, &record)?;
                    writeln!(out)?;
                }
            }
            let stats = reader.stats();
            eprintln!(
                "parsed {}: categories={} offers={} skipped={}",
                file.display(),
                stats.categories,
                stats.offers_parsed,
                stats.offers_skipped
            );
        }
        Commands::Match => {
            let batch_size = config.batch_size;
            let summary = IngestPipeline::connect(config)
                .await?
                .matcher()
                .process_all(batch_size)
                .await?;
            println!("{}", serde_json::to_string(&summary)?);
        }
    }

    Ok(())
}
