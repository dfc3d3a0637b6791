//! Candlefeed CLI: fetch, inspect, and convert OHLCV candle files.
//!
//! Commands:
//! - `fetch`: resume a candle CSV from its last row up to now
//! - `inspect`: report row count, time range, and gaps of a candle CSV
//! - `convert`: rewrite epoch-ms timestamps as calendar datetimes

use anyhow::{bail, Context, Result};
use candlefeed_core::config::{parse_since, IngestConfig, Since};
use candlefeed_core::data::{
    convert, download_series, AppendStore, CsvStore, ExchangeKind, IngestError, StopReason,
    SystemClock, TracingProgress,
};
use candlefeed_core::domain::{iso8601, Series, Timeframe};
use clap::{Parser, Subcommand};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use tracing::{error, info, warn};
use tracing_subscriber::EnvFilter;

#[derive(Parser)]
#[command(
    name = "candlefeed",
    version,
    about = "Candlefeed: incremental OHLCV downloader with an append-only CSV store"
)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Download candles, resuming from the last row already on disk.
    Fetch(FetchArgs),
    /// Report row count, time range, and gaps of a candle CSV.
    Inspect {
        /// Candle CSV to inspect.
        file: PathBuf,

        /// Timeframe of the file, enables the gap report.
        #[arg(long)]
        timeframe: Option<Timeframe>,
    },
    /// Rewrite the timestamp column as `YYYY-MM-DD HH:MM:SS` (UTC).
    Convert {
        /// Input candle CSV.
        #[arg(short, long)]
        input: PathBuf,

        /// Output CSV. Without it, only a preview is printed.
        #[arg(short, long)]
        output: Option<PathBuf>,
    },
}

#[derive(clap::Args)]
struct FetchArgs {
    /// TOML job file. Flags below override its values.
    #[arg(long)]
    config: Option<PathBuf>,

    /// Exchange: binance or bybit.
    #[arg(long)]
    exchange: Option<ExchangeKind>,

    /// Unified symbol, e.g. BTC/USDT.
    #[arg(long)]
    symbol: Option<String>,

    /// Candle timeframe, e.g. 1m, 1h, 1d.
    #[arg(long)]
    timeframe: Option<Timeframe>,

    /// Candles requested per call.
    #[arg(long)]
    limit: Option<u32>,

    /// Attempts per call before aborting.
    #[arg(long)]
    max_retries: Option<u32>,

    /// Start for an empty file: epoch ms, YYYY-MM-DD, or an ISO-8601 datetime.
    #[arg(long)]
    since: Option<String>,

    /// Output directory.
    #[arg(short = 'd', long)]
    directory: Option<PathBuf>,

    /// Output file, overriding the inferred `{exchange}-{symbol}-{timeframe}.csv`.
    #[arg(short = 'f', long)]
    file: Option<PathBuf>,

    /// Alternative API root (testnet, mirror).
    #[arg(long)]
    base_url: Option<String>,
}

impl FetchArgs {
    fn into_config(self) -> Result<IngestConfig> {
        let mut config = match &self.config {
            Some(path) => IngestConfig::from_file(path)?,
            None => IngestConfig::default(),
        };
        if let Some(exchange) = self.exchange {
            config.exchange = exchange;
        }
        if let Some(symbol) = self.symbol {
            config.symbol = symbol;
        }
        if let Some(timeframe) = self.timeframe {
            config.timeframe = timeframe;
        }
        if let Some(limit) = self.limit {
            config.page_limit = limit;
        }
        if let Some(max_retries) = self.max_retries {
            config.max_retries = max_retries;
        }
        if let Some(since) = self.since {
            config.since = Since::Millis(parse_since(&since)?);
        }
        if let Some(directory) = self.directory {
            config.directory = directory;
        }
        if self.file.is_some() {
            config.file = self.file;
        }
        if self.base_url.is_some() {
            config.base_url = self.base_url;
        }
        Ok(config)
    }
}

fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .with_target(false)
        .init();

    let cli = Cli::parse();

    match cli.command {
        Commands::Fetch(args) => run_fetch(args.into_config()?),
        Commands::Inspect { file, timeframe } => run_inspect(&file, timeframe),
        Commands::Convert { input, output } => run_convert(&input, output.as_deref()),
    }
}

/// Install a Ctrl-C handler that requests a graceful stop.
///
/// A second Ctrl-C is a forced abort: it exits with status 130 as soon as no
/// batch is mid-commit, so the file never keeps a partial batch. Rows from the
/// batch being fetched at that moment are lost and the next run refetches them.
fn spawn_interrupt_watcher(cancel: Arc<AtomicBool>, commit_lock: Arc<Mutex<()>>) -> Result<()> {
    let runtime = tokio::runtime::Builder::new_current_thread()
        .enable_all()
        .build()
        .context("failed to start signal runtime")?;

    std::thread::Builder::new()
        .name("ctrl-c".into())
        .spawn(move || {
            runtime.block_on(async {
                while tokio::signal::ctrl_c().await.is_ok() {
                    if cancel.swap(true, Ordering::SeqCst) {
                        warn!("second interrupt, aborting");
                        let _idle = commit_lock.lock().unwrap_or_else(PoisonError::into_inner);
                        std::process::exit(130);
                    }
                    warn!("interrupt received, stopping after the current batch");
                }
            })
        })
        .context("failed to spawn signal thread")?;
    Ok(())
}

fn run_fetch(config: IngestConfig) -> Result<()> {
    let plan = config.plan()?;
    let path = config.output_path();
    let source = config.exchange.build_source(config.base_url.as_deref())?;
    let mut store = CsvStore::new(&path);

    let cancel = Arc::new(AtomicBool::new(false));
    spawn_interrupt_watcher(Arc::clone(&cancel), store.commit_lock())?;

    info!(
        exchange = %config.exchange,
        file = %path.display(),
        "starting download"
    );

    let result = download_series(
        &source,
        &mut store,
        &plan,
        &SystemClock,
        &cancel,
        &TracingProgress,
    );

    match result {
        Ok(summary) => {
            let outcome = &summary.outcome;
            let reason = match outcome.stop {
                StopReason::LiveEdge => "reached the live edge",
                StopReason::Empty => "no newer candles available",
                StopReason::Cancelled => "interrupted",
            };
            println!("Fetch finished: {reason}");
            println!("  File:      {}", path.display());
            println!("  Resumed:   {}", iso8601(summary.resumed_from));
            println!("  Appended:  {}", outcome.appended);
            if outcome.dropped > 0 {
                println!("  Discarded: {} (before cursor)", outcome.dropped);
            }
            println!("  Total:     {}", summary.total_rows());
            println!("  Next from: {}", iso8601(outcome.cursor));
            Ok(())
        }
        Err(e) => {
            // Whatever was appended before the failure is already durable.
            let persisted = CsvStore::new(&path)
                .read_all()
                .ok()
                .and_then(|s| s.last_timestamp().map(|last| (s.len(), last)));
            match persisted {
                Some((rows, last)) => error!(
                    "aborting; {} holds {rows} candles up to {}",
                    path.display(),
                    iso8601(last)
                ),
                None => error!("aborting; {} holds no readable candles", path.display()),
            }
            if let IngestError::CorruptSeries(_) = e {
                bail!("{} is corrupt and must be repaired: {e}", path.display());
            }
            Err(e.into())
        }
    }
}

fn run_inspect(file: &Path, timeframe: Option<Timeframe>) -> Result<()> {
    let series = CsvStore::new(file).read_all()?;
    print_series_report(file, &series);

    if let Err(e) = series.validate() {
        bail!("{} is corrupt: {e}", file.display());
    }

    if let Some(tf) = timeframe {
        let gaps = series.gaps(tf);
        if gaps.is_empty() {
            println!("  Gaps:    none");
        } else {
            let missing: i64 = gaps.iter().map(|g| g.missing).sum();
            println!("  Gaps:    {} ({missing} missing {tf} candles)", gaps.len());
            for gap in gaps.iter().take(20) {
                println!(
                    "    {} .. {}  ({} missing)",
                    iso8601(gap.after),
                    iso8601(gap.before),
                    gap.missing
                );
            }
            if gaps.len() > 20 {
                println!("    ... {} more", gaps.len() - 20);
            }
        }
    }
    Ok(())
}

fn print_series_report(file: &Path, series: &Series) {
    println!("File: {}", file.display());
    println!("  Rows:    {}", series.len());
    match (series.first_timestamp(), series.last_timestamp()) {
        (Some(first), Some(last)) => {
            println!("  First:   {}", iso8601(first));
            println!("  Last:    {}", iso8601(last));
        }
        _ => println!("  Range:   (empty)"),
    }
}

fn run_convert(input: &Path, output: Option<&Path>) -> Result<()> {
    match output {
        Some(output) => {
            let series = convert::convert_to_datetime_csv(input, output)?;
            println!(
                "Converted {} rows: {} -> {}",
                series.len(),
                input.display(),
                output.display()
            );
        }
        None => {
            let series = CsvStore::new(input).read_all()?;
            series.validate()?;
            let preview = Series::new(series.candles().iter().take(5).cloned().collect());
            let text = convert::to_datetime_csv(&preview)?;
            print!("{text}");
            if series.len() > preview.len() {
                println!(
                    "... {} more rows (pass --output to write them)",
                    series.len() - preview.len()
                );
            }
        }
    }
    Ok(())
}
