//! One-off backfill command.
//!
//! Fetches a time range for one series from the REST endpoint and replays it through
//! the versioned write path, so candles already written by the live feed are kept.

use anyhow::{anyhow, Result};
use chrono::{DateTime, Utc};
use clap::Args;

use candle_sync_core::{SeriesId, Timeframe};
use candle_sync_feed::BackfillOutcome;

use crate::wiring;

/// Arguments for the backfill command.
#[derive(Args, Debug, Clone)]
pub struct BackfillArgs {
    /// Config file path
    #[arg(short, long, default_value = "config/Config.toml")]
    pub config: String,

    /// Profile overlay, loaded from `Config.{profile}.toml` next to the config file
    #[arg(short, long, env = "CANDLE_SYNC_PROFILE")]
    pub profile: Option<String>,

    /// Optional log file path (logs to file instead of stderr)
    #[arg(long)]
    pub log_file: Option<String>,

    /// Trading symbol, e.g. BTCUSDT
    #[arg(long)]
    pub symbol: String,

    /// Candle timeframe
    /// Valid values: 1m, 3m, 5m, 15m, 30m, 1h, 2h, 4h, 6h, 12h, 1d, 1w
    #[arg(long, default_value = "1m")]
    pub timeframe: String,

    /// Start timestamp (ISO 8601 format, e.g., "2026-01-01T00:00:00Z")
    #[arg(long)]
    pub start: String,

    /// End timestamp (ISO 8601 format, e.g., "2026-01-30T00:00:00Z")
    #[arg(long)]
    pub end: String,
}

impl BackfillArgs {
    fn range(&self) -> Result<(DateTime<Utc>, DateTime<Utc>)> {
        let start: DateTime<Utc> = self.start.parse().map_err(|_| {
            anyhow!("Invalid start time. Use ISO 8601 format (e.g., 2026-01-01T00:00:00Z)")
        })?;
        let end: DateTime<Utc> = self.end.parse().map_err(|_| {
            anyhow!("Invalid end time. Use ISO 8601 format (e.g., 2026-01-30T00:00:00Z)")
        })?;
        if start >= end {
            return Err(anyhow!("Start time must be before end time"));
        }
        Ok((start, end))
    }
}

/// Runs the backfill command.
///
/// # Errors
/// Returns an error if the arguments are invalid, or the store or REST source fails.
pub async fn run_backfill(args: BackfillArgs) -> Result<()> {
    let (start, end) = args.range()?;
    let timeframe: Timeframe = args.timeframe.parse()?;
    candle_sync_core::validate_symbols(std::slice::from_ref(&args.symbol))?;

    let config = wiring::load_config(&args.config, args.profile.as_deref())?;
    let store = wiring::build_store(&config).await?;
    let reconciler = wiring::build_reconciler(&config, store, None)?;
    let series = SeriesId::new(&config.feed.exchange, &args.symbol, timeframe);

    tracing::info!(
        "Backfilling {} from {} to {}",
        series,
        start.format("%Y-%m-%d %H:%M"),
        end.format("%Y-%m-%d %H:%M")
    );

    let report = reconciler.backfill(&series, start, end).await?;

    tracing::info!(
        "Fetched {} candles in {} pages: {} written, {} kept existing ({} rate-limit retries)",
        report.fetched,
        report.pages,
        report.written,
        report.discarded,
        report.rate_limit_retries
    );
    if report.outcome == BackfillOutcome::LookbackExceeded {
        tracing::warn!(
            "Range starts beyond the configured maximum lookback; only the most recent {}s were fetched",
            config.reconciliation.max_lookback_secs
        );
    }
    Ok(())
}
