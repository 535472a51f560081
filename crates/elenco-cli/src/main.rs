use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{bail, Context, Result};
use clap::{Parser, Subcommand};
use elenco_engine::{load_links, Dispatcher, ScrapeConfig};
use elenco_extract::{SelectorExtractor, SelectorProfile};
use elenco_net::{load_proxy_list, HttpClientConfig, HttpFetchClient, ProxyPool};
use elenco_store::ResultStore;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

#[derive(Debug, Parser)]
#[command(name = "elenco")]
#[command(about = "Directory-site business scraper")]
struct Cli {
    /// SQLite database path.
    #[arg(long, default_value = "elenco.db", global = true)]
    db: PathBuf,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Debug, Subcommand)]
enum Commands {
    /// Run the parallel scrape over a precomputed link list.
    Scrape {
        /// JSON file with the detail-page links (bare array or {"links": [...]}).
        links: PathBuf,
        /// Proxy list, one host:port[:user:pass] per line. Omitted or empty
        /// means direct fetching.
        #[arg(long)]
        proxies: Option<PathBuf>,
        /// JSON selector profile; built-in generic selectors when omitted.
        #[arg(long)]
        profile: Option<PathBuf>,
        #[arg(long)]
        workers: Option<usize>,
        /// Consecutive transient failures before rotating a proxy.
        #[arg(long)]
        failure_threshold: Option<u32>,
        /// Pause between requests per worker, in milliseconds.
        #[arg(long)]
        delay_ms: Option<u64>,
        /// Proxy cooldown after rotation, in seconds.
        #[arg(long)]
        cooldown_secs: Option<u64>,
    },
    /// Print record counts and field-coverage statistics.
    Stats,
    /// Export all records to CSV.
    Export {
        /// Output path; defaults to the database path with a .csv extension.
        #[arg(long)]
        out: Option<PathBuf>,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| "info".into()))
        .init();

    let cli = Cli::parse();

    match cli.command {
        Commands::Scrape {
            links,
            proxies,
            profile,
            workers,
            failure_threshold,
            delay_ms,
            cooldown_secs,
        } => {
            let mut config = ScrapeConfig::from_env();
            if let Some(workers) = workers {
                config.workers = workers;
            }
            if let Some(threshold) = failure_threshold {
                config.failure_threshold = threshold;
            }
            if let Some(ms) = delay_ms {
                config.request_delay = Duration::from_millis(ms);
            }
            if let Some(secs) = cooldown_secs {
                config.proxy_cooldown = Duration::from_secs(secs);
            }
            run_scrape(cli.db, links, proxies, profile, config).await
        }
        Commands::Stats => {
            let store = ResultStore::open(&cli.db).await?;
            let stats = store.stats().await?;
            println!(
                "records={} with_email={} with_website={} with_phone={} with_category={}",
                stats.total, stats.with_email, stats.with_website, stats.with_phone, stats.with_category
            );
            Ok(())
        }
        Commands::Export { out } => {
            let out = out.unwrap_or_else(|| cli.db.with_extension("csv"));
            let store = ResultStore::open(&cli.db).await?;
            let rows = elenco_export::export_csv(&store, &out).await?;
            println!("exported {} rows to {}", rows, out.display());
            Ok(())
        }
    }
}

async fn run_scrape(
    db: PathBuf,
    links_path: PathBuf,
    proxies: Option<PathBuf>,
    profile: Option<PathBuf>,
    config: ScrapeConfig,
) -> Result<()> {
    let links = load_links(&links_path)?;
    if links.is_empty() {
        bail!("no links found in {}", links_path.display());
    }

    let proxy_list = match proxies {
        Some(path) => load_proxy_list(&path),
        None => Vec::new(),
    };
    if proxy_list.is_empty() {
        warn!("no proxies provisioned, fetching directly");
    }

    let profile = match profile {
        Some(path) => SelectorProfile::from_json_file(&path)
            .with_context(|| format!("loading selector profile {}", path.display()))?,
        None => SelectorProfile::default(),
    };
    let extractor = SelectorExtractor::new(&profile).context("compiling selector profile")?;

    let store = ResultStore::open(&db).await?;
    let pool = Arc::new(ProxyPool::new(proxy_list, config.proxy_cooldown));
    let fetch = HttpFetchClient::new(HttpClientConfig::default())?;

    let cancel = CancellationToken::new();
    let signal_guard = cancel.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            info!("interrupt received, stopping workers");
            signal_guard.cancel();
        }
    });

    let dispatcher = Dispatcher::new(
        config,
        Arc::new(fetch),
        Arc::new(extractor),
        store.clone(),
        pool,
    );
    let summary = dispatcher.run(links, cancel).await;

    println!(
        "run {} finished in {:.1}s: links={} inserted={} skipped={} rotations={} transient={} permanent={}",
        summary.run_id,
        summary.elapsed_secs,
        summary.total_links,
        summary.counters.inserted,
        summary.counters.skipped,
        summary.counters.proxy_rotations,
        summary.counters.transient_failures,
        summary.counters.permanent_failures,
    );
    for report in &summary.workers {
        println!(
            "  worker {}: {}/{} processed inserted={} skipped={}{}{}",
            report.worker_id,
            report.processed,
            report.assigned,
            report.inserted,
            report.skipped,
            if report.stalled { " STALLED" } else { "" },
            if report.failed { " FAILED" } else { "" },
        );
    }

    let stats = store.stats().await?;
    println!(
        "pool: cold={} hot={} | db: records={} with_email={} with_website={} with_phone={}",
        summary.pool.cold,
        summary.pool.hot,
        stats.total,
        stats.with_email,
        stats.with_website,
        stats.with_phone,
    );

    if summary.stalled() {
        warn!("one or more workers stalled on proxy exhaustion; rerun picks up remaining links");
    }
    if !summary.any_progress() {
        bail!("run made no progress on {} links", summary.total_links);
    }
    Ok(())
}
