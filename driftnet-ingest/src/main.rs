//! driftnet-ingest: scrape supervision and library reconciliation
//!
//! Drives external extractor tools as child processes, archives what they
//! fetch, and reconciles the download tree against the SQLite index.

use anyhow::{anyhow, Result};
use clap::{Parser, Subcommand};
use tracing::info;
use tracing_subscriber::EnvFilter;

use driftnet_common::config::{self, LibraryPaths};
use driftnet_common::events::{EventBus, IngestEvent};
use driftnet_ingest::db;
use driftnet_ingest::models::job::{ExtractorTool, ScrapeOptions, SourceFamily};
use driftnet_ingest::AppState;

#[derive(Parser)]
#[command(
    name = "driftnet-ingest",
    version,
    about = "Archive extractor-fetched content into a local library"
)]
struct Cli {
    /// Library root folder (overrides DRIFTNET_ROOT and the config file)
    #[arg(long, global = true)]
    root: Option<String>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Start a scrape job for a source and wait for it to finish
    Scrape {
        /// Source id from the registry
        source_id: i64,
        /// Target URL (defaults to the source's registered URL)
        #[arg(long)]
        url: Option<String>,
        #[arg(long, value_enum, default_value = "gallery-dl")]
        tool: ExtractorTool,
        /// Terminate early after this many completed files
        #[arg(long)]
        stop_after: Option<u64>,
        /// Terminate early after this many processed posts
        #[arg(long)]
        stop_after_posts: Option<u64>,
    },
    /// Run one library reconciliation pass
    Scan,
    /// Run a two-phase repair for a content-source family
    Repair {
        #[arg(value_enum)]
        family: SourceFamily,
    },
    /// Show recent scrape history for a source
    History {
        source_id: i64,
        #[arg(long, default_value_t = 10)]
        limit: i64,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    let cli = Cli::parse();

    let root = config::resolve_root_folder(cli.root.as_deref(), "DRIFTNET_ROOT");
    let toml_config = config::load_toml_config(&config::default_config_path()).unwrap_or_default();
    let paths = LibraryPaths::new(root);

    info!(root = %paths.root.display(), version = env!("CARGO_PKG_VERSION"), "Starting driftnet-ingest");

    let event_bus = EventBus::new(1000);
    let state = AppState::new(paths, &toml_config, event_bus.clone()).await?;

    match cli.command {
        Command::Scrape {
            source_id,
            url,
            tool,
            stop_after,
            stop_after_posts,
        } => {
            let opts = ScrapeOptions {
                stop_after_completed: stop_after,
                stop_after_posts,
            };
            run_scrape(&state, source_id, url, tool, opts).await?;
        }
        Command::Scan => {
            if let Some(summary) = state.reconciler.sync_library().await? {
                info!(
                    status = %summary.status,
                    processed = summary.counters.files_processed,
                    added = summary.counters.files_added,
                    updated = summary.counters.files_updated,
                    deleted = summary.counters.files_deleted,
                    errors = summary.counters.errors,
                    "Reconciliation finished"
                );
            }
        }
        Command::Repair { family } => {
            if let Some(summary) = state.repair.run_repair(family).await? {
                info!(
                    status = %summary.status,
                    checked = summary.files_checked,
                    repaired = summary.files_repaired,
                    errors = summary.errors,
                    "Repair finished"
                );
            }
        }
        Command::History { source_id, limit } => {
            for row in db::history::list_recent(&state.db, source_id, limit).await? {
                println!(
                    "#{}  {}  {:9}  files={} bytes={} skipped={} errors={}",
                    row.id,
                    row.start_time.to_rfc3339(),
                    row.status,
                    row.files_downloaded,
                    driftnet_common::bytesize::format_size(row.bytes_downloaded.max(0) as u64),
                    row.skipped_count,
                    row.error_count,
                );
            }
        }
    }

    state.shutdown();
    Ok(())
}

/// Start a scrape, then follow its events until the job and its follow-up
/// reconciliation both finish.
async fn run_scrape(
    state: &AppState,
    source_id: i64,
    url_override: Option<String>,
    tool: ExtractorTool,
    opts: ScrapeOptions,
) -> Result<()> {
    let source = db::sources::load_source(&state.db, source_id)
        .await?
        .ok_or_else(|| anyhow!("Source {} not found or deleted", source_id))?;
    let url = url_override.unwrap_or_else(|| source.url.clone());
    let dest_dir = state.paths.download_root.join(&source.extractor_type);

    let mut events = state.event_bus.subscribe();

    let started = state
        .scrape_manager
        .start_scrape(source_id, tool, url, dest_dir, opts)
        .await?;
    if !started {
        return Ok(());
    }

    let mut scrape_done = false;
    while let Ok(event) = events.recv().await {
        match event {
            IngestEvent::ScrapeProgress {
                source_id: sid,
                downloaded,
                skipped,
                errors,
                total_bytes,
                ..
            } if sid == source_id => {
                info!(
                    downloaded,
                    skipped,
                    errors,
                    size = %driftnet_common::bytesize::format_size(total_bytes),
                    "Progress"
                );
            }
            IngestEvent::ScrapeFinished {
                source_id: sid,
                status,
                files,
                ..
            } if sid == source_id => {
                info!(status = %status, files, "Scrape finished");
                scrape_done = true;
            }
            IngestEvent::ScanFinished {
                status, deleted, ..
            } if scrape_done => {
                info!(status = %status, deleted, "Library reconciliation finished");
                break;
            }
            _ => {}
        }
    }

    Ok(())
}
