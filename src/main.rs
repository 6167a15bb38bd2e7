use anyhow::Context;
use clap::{Parser, Subcommand};
use feed_etl::config::Config;
use feed_etl::infra::{ReqwestHttp, SqliteDocumentStore, SystemClock};
use feed_etl::logging;
use feed_etl::observability::metrics;
use feed_etl::pipeline::PipelineOrchestrator;
use feed_etl::storage::{DocumentStore, InMemoryDocumentStore, SummaryFields};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tracing::{error, info, warn};

#[derive(Parser)]
#[command(name = "feed_etl")]
#[command(about = "Extract, enrich and load paginated vulnerability feed records")]
#[command(version)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Run one extract -> transform -> load pass
    Run {
        /// TOML config file; environment variables override it
        #[arg(long, default_value = "config.toml")]
        config: PathBuf,
        /// Write to an in-memory collection instead of the configured store
        #[arg(long)]
        dry_run: bool,
        /// Override the configured page cap
        #[arg(long)]
        max_pages: Option<usize>,
    },
    /// Print totals for the stored collection
    Stats {
        #[arg(long, default_value = "config.toml")]
        config: PathBuf,
    },
    /// Load and validate the configuration, then print it
    CheckConfig {
        #[arg(long, default_value = "config.toml")]
        config: PathBuf,
    },
}

fn load_config(path: &PathBuf) -> anyhow::Result<Config> {
    Config::load(Some(path.as_path())).with_context(|| format!("loading configuration from {}", path.display()))
}

async fn run(config: Config, dry_run: bool) -> anyhow::Result<()> {
    if let Err(e) = metrics::init() {
        warn!("Metrics disabled: {}", e);
    }

    let http = ReqwestHttp::new(
        Duration::from_secs(config.api.timeout_seconds),
        config.api.api_key.as_deref(),
        config.api.profile,
    )
    .context("building HTTP client")?;

    let store: Box<dyn DocumentStore> = if dry_run {
        info!("Dry run: writing to an in-memory collection");
        Box::new(InMemoryDocumentStore::new())
    } else {
        Box::new(
            SqliteDocumentStore::open(&config.store.path, &config.store.collection)
                .with_context(|| format!("opening store at {}", config.store.path))?,
        )
    };

    let orchestrator = PipelineOrchestrator::from_config(&config, Arc::new(http), Arc::new(SystemClock), store);
    let run_id = orchestrator.run_id().to_string();
    let result = orchestrator.run().await;

    if let Some(gateway) = config.metrics.pushgateway_url.as_deref() {
        let job = config.metrics.job.as_deref().unwrap_or("feed_etl");
        metrics::push_to_gateway(gateway, job, &run_id).await;
    }

    match result {
        Ok(stats) => {
            println!("\n📊 Pipeline Results:");
            println!("{}", serde_json::to_string_pretty(&stats)?);
            if stats.extraction_truncated {
                println!("⚠️  Extraction ended early; re-run to pick up the remaining pages");
            }
            println!("✅ {}", stats.summary());
            Ok(())
        }
        Err(failure) => {
            error!("Run failed: {}", failure);
            println!("❌ {}", failure.stats.summary());
            Err(failure.into())
        }
    }
}

async fn stats(config: Config) -> anyhow::Result<()> {
    let Some(store) = SqliteDocumentStore::open_existing(&config.store.path, &config.store.collection)
        .with_context(|| format!("opening store at {}", config.store.path))?
    else {
        println!(
            "⚠️  Collection {} does not exist in {}; run the pipeline first",
            config.store.collection, config.store.path
        );
        return Ok(());
    };
    let summary = store
        .summary(&SummaryFields::for_profile(config.api.profile))
        .await
        .context("summarizing collection")?;
    println!("{}", serde_json::to_string_pretty(&summary)?);
    Ok(())
}

fn check_config(config: &Config) {
    println!("✅ Configuration is valid");
    println!("   Profile:          {}", config.api.profile);
    println!("   Base URL:         {}", config.api.resolved_base_url());
    println!("   API key:          {}", if config.api.api_key.is_some() { "set" } else { "not set" });
    println!("   Page size:        {}", config.extract.page_size);
    println!("   Max pages:        {}", config.extract.max_pages);
    println!("   Rate limit delay: {:.1}s", config.extract.rate_limit_delay_secs);
    println!("   Max attempts:     {}", config.extract.max_attempts);
    println!("   Freshness window: {} days", config.transform.freshness_window_days);
    println!("   Source tag:       {}", config.source_tag());
    println!("   Store:            {} ({})", config.store.path, config.store.collection);
    println!("   Batch size:       {}", config.store.batch_size);
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    dotenv::dotenv().ok();
    let _log_guard = logging::init_logging();

    let cli = Cli::parse();

    match cli.command {
        Commands::Run {
            config,
            dry_run,
            max_pages,
        } => {
            let mut config = load_config(&config)?;
            if let Some(max_pages) = max_pages {
                config.extract.max_pages = max_pages;
                config.validate()?;
            }
            run(config, dry_run).await?;
        }
        Commands::Stats { config } => {
            stats(load_config(&config)?).await?;
        }
        Commands::CheckConfig { config } => {
            check_config(&load_config(&config)?);
        }
    }
    Ok(())
}
