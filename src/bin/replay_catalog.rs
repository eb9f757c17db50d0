//! Replay Catalog Tool
//!
//! Inspect raw partitions, warm the catalog, and read back run artifacts.
//!
//! Usage:
//!   cargo run --release --bin replay_catalog -- discover BTCUSDT-PERP.BINANCE --start 2024-01-25T00:00:00Z --end 2024-01-26T00:00:00Z
//!   cargo run --release --bin replay_catalog -- ingest BTCUSDT-PERP.BINANCE --start 2024-01-25T00:00:00Z --end 2024-01-26T00:00:00Z
//!   cargo run --release --bin replay_catalog -- partitions
//!   cargo run --release --bin replay_catalog -- summary <RUN_ID>
//!   cargo run --release --bin replay_catalog -- timeline <RUN_ID> --offset 0 --limit 50

use anyhow::{anyhow, Context, Result};
use clap::{Parser, Subcommand};
use std::path::PathBuf;
use tickreplay_backend::replay::clock::{nanos_to_datetime, parse_timestamp, Nanos, TimeWindow};
use tickreplay_backend::replay::timeline::DEFAULT_PAGE_LIMIT;
use tickreplay_backend::replay::{CoverageOutcome, DataKind, PipelineConfig, PipelineContext};
use tracing_subscriber::EnvFilter;

/// Replay catalog and artifact inspection
#[derive(Parser, Debug)]
#[command(name = "replay_catalog")]
#[command(about = "Inspect raw tick partitions, warm the catalog, and read run artifacts")]
struct Cli {
    /// Pipeline config (TOML). Defaults and REPLAY_* overrides apply when omitted.
    #[arg(short, long, env = "REPLAY_CONFIG_PATH")]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// List raw files covering a window, in replay order
    Discover {
        /// Venue-qualified instrument id
        instrument_id: String,

        /// trades | quotes
        #[arg(short, long, default_value = "trades")]
        kind: String,

        /// RFC3339 window start
        #[arg(long)]
        start: String,

        /// RFC3339 window end (exclusive)
        #[arg(long)]
        end: String,
    },

    /// Convert raw files into the catalog unless the partition already exists
    Ingest {
        instrument_id: String,

        #[arg(short, long, default_value = "trades")]
        kind: String,

        #[arg(long)]
        start: String,

        #[arg(long)]
        end: String,
    },

    /// List catalog partitions with counts and time bounds
    Partitions,

    /// List runs with artifacts under the results root
    Runs,

    /// Print a run summary
    Summary { run_id: String },

    /// Print one page of a run timeline
    Timeline {
        run_id: String,

        #[arg(long, default_value = "0")]
        offset: usize,

        #[arg(long, default_value_t = DEFAULT_PAGE_LIMIT)]
        limit: usize,
    },
}

fn parse_window(start: &str, end: &str) -> Result<TimeWindow> {
    let start_ns = parse_timestamp(start).ok_or_else(|| anyhow!("invalid --start '{}'", start))?;
    let end_ns = parse_timestamp(end).ok_or_else(|| anyhow!("invalid --end '{}'", end))?;
    TimeWindow::new(start_ns, end_ns)
        .ok_or_else(|| anyhow!("window end {} must be after start {}", end, start))
}

fn parse_kind(kind: &str) -> Result<DataKind> {
    DataKind::from_storage_name(kind).ok_or_else(|| anyhow!("unknown data kind '{}'", kind))
}

fn fmt_ns(ns: Option<Nanos>) -> String {
    ns.map(|t| nanos_to_datetime(t).to_rfc3339())
        .unwrap_or_else(|| "-".to_string())
}

fn main() -> Result<()> {
    dotenv::dotenv().ok();
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::from_default_env().add_directive("tickreplay_backend=info".parse()?),
        )
        .init();

    let cli = Cli::parse();

    let config = match &cli.config {
        Some(path) => {
            let mut config = PipelineConfig::load(path)
                .with_context(|| format!("Failed to load config: {:?}", path))?;
            config.apply_overrides(|name| std::env::var(name).ok());
            config
        }
        None => PipelineConfig::from_env(),
    };
    let ctx = PipelineContext::from_config(config).context("Failed to open pipeline")?;

    match cli.command {
        Commands::Discover {
            instrument_id,
            kind,
            start,
            end,
        } => {
            let window = parse_window(&start, &end)?;
            let files = ctx
                .cache()
                .discoverer()
                .discover_window(&instrument_id, parse_kind(&kind)?, &window)?;
            println!("=== {} file(s) in {} ===\n", files.len(), ctx.storage().describe());
            for file in files {
                println!("{}  {}", file.date, file.key);
            }
        }
        Commands::Ingest {
            instrument_id,
            kind,
            start,
            end,
        } => {
            let window = parse_window(&start, &end)?;
            let outcome = ctx
                .cache()
                .ensure_coverage(&instrument_id, parse_kind(&kind)?, &window)
                .with_context(|| format!("Failed to ingest {}", instrument_id))?;
            match outcome {
                CoverageOutcome::Cached => println!("{}: already cached", instrument_id),
                CoverageOutcome::Converted(report) => {
                    println!(
                        "{}: converted {} file(s), {} events, {} of {} rows dropped ({:.4}%)",
                        instrument_id,
                        report.files.len(),
                        report.events_emitted,
                        report.dropped_rows,
                        report.total_rows,
                        report.drop_rate() * 100.0
                    );
                }
            }
        }
        Commands::Partitions => {
            let partitions = ctx.cache().catalog().list_partitions()?;
            println!("=== Catalog Partitions ({}) ===\n", partitions.len());
            println!(
                "{:<32} {:>12} {:>10} {:<32} {:<32}",
                "PARTITION", "EVENTS", "DROPPED", "FIRST", "LAST"
            );
            for p in partitions {
                println!(
                    "{:<32} {:>12} {:>10} {:<32} {:<32}",
                    p.key.to_string(),
                    p.event_count,
                    p.dropped_rows,
                    fmt_ns(p.first_event_ns),
                    fmt_ns(p.last_event_ns)
                );
            }
        }
        Commands::Runs => {
            for run_id in ctx.artifacts().list_runs()? {
                println!("{}", run_id);
            }
        }
        Commands::Summary { run_id } => {
            let summary = ctx
                .artifacts()
                .load_summary(&run_id)
                .with_context(|| format!("Failed to load summary for {}", run_id))?;
            println!("{}", serde_json::to_string_pretty(&summary)?);
        }
        Commands::Timeline {
            run_id,
            offset,
            limit,
        } => {
            let bundle = ctx
                .artifacts()
                .load_bundle(&run_id)
                .with_context(|| format!("Failed to load bundle for {}", run_id))?;
            let page = bundle.timeline.page(offset, limit);
            println!("{}", serde_json::to_string_pretty(&page)?);
        }
    }

    Ok(())
}
