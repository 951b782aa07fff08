use std::fs::OpenOptions;
use std::path::{Path, PathBuf};
use std::process::ExitCode;
use std::sync::Arc;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use civilview_sync::{RunOutcome, SyncConfig};
use tracing::info;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::{fmt, EnvFilter};

#[derive(Debug, Parser)]
#[command(name = "civilview")]
#[command(about = "Civil View foreclosure listing sync")]
struct Cli {
    /// Detail page cache directory.
    #[arg(long, global = true)]
    cache_dir: Option<PathBuf>,
    /// Append-only log file.
    #[arg(long, global = true)]
    log_file: Option<PathBuf>,
    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Debug, Subcommand)]
enum Commands {
    /// Fetch the current listings once and reconcile them into the record store.
    Sync {
        /// Reconcile against an in-memory store instead of Airtable.
        #[arg(long)]
        dry_run: bool,
    },
    /// Delete expired detail pages from the cache.
    EvictCache,
    /// Parse a saved detail page and print the extracted record.
    ParseDetail { file: PathBuf },
}

fn init_logging(log_file: &Path) -> Result<()> {
    if let Some(parent) = log_file.parent().filter(|p| !p.as_os_str().is_empty()) {
        std::fs::create_dir_all(parent)
            .with_context(|| format!("creating {}", parent.display()))?;
    }
    let file = OpenOptions::new()
        .create(true)
        .append(true)
        .open(log_file)
        .with_context(|| format!("opening log file {}", log_file.display()))?;

    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    tracing_subscriber::registry()
        .with(filter)
        .with(fmt::layer().with_writer(std::io::stderr).with_target(true))
        .with(fmt::layer().with_writer(Arc::new(file)).with_ansi(false))
        .try_init()
        .context("installing tracing subscriber")?;
    Ok(())
}

#[tokio::main]
async fn main() -> Result<ExitCode> {
    let cli = Cli::parse();

    let mut config = SyncConfig::from_env();
    if let Some(dir) = cli.cache_dir {
        config.cache_dir = dir;
    }
    if let Some(file) = cli.log_file {
        config.log_file = file;
    }
    init_logging(&config.log_file)?;

    match cli.command.unwrap_or(Commands::Sync { dry_run: false }) {
        Commands::Sync { dry_run } => {
            let summary = civilview_sync::run_sync_once(config, dry_run).await?;
            println!(
                "sync {}: run_id={} pages={} created={} updated={} unchanged={} failed={} report={}",
                summary.outcome.as_str(),
                summary.run_id,
                summary.counters.pages,
                summary.counters.created,
                summary.counters.updated,
                summary.counters.unchanged,
                summary.failures.len(),
                summary.report_path.display()
            );
            if summary.outcome == RunOutcome::Failed {
                return Ok(ExitCode::FAILURE);
            }
        }
        Commands::EvictCache => {
            let cache = config.cache_store();
            let removed = cache.evict_expired().await?;
            info!(removed, dir = %cache.root().display(), "cache eviction finished");
            println!("evicted {removed} cache files from {}", cache.root().display());
        }
        Commands::ParseDetail { file } => {
            let html = std::fs::read_to_string(&file)
                .with_context(|| format!("reading {}", file.display()))?;
            let detail = civilview_portal::parse_detail_page(&html)?;
            let record = detail.fields.to_record()?;
            let out = serde_json::json!({
                "record": record,
                "portal_status": detail.portal_status,
            });
            println!("{}", serde_json::to_string_pretty(&out)?);
        }
    }

    Ok(ExitCode::SUCCESS)
}
