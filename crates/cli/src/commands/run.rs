//! Streaming command: wires the full adapter and runs until a shutdown signal.

use anyhow::{Context, Result};
use clap::Args;
use std::sync::Arc;
use tokio::sync::{broadcast, mpsc};

use candle_sync_feed::{ConnectionEvent, ConnectionManager, WsConnector};

use crate::wiring;

/// Arguments for the run command.
#[derive(Args, Debug, Clone)]
pub struct RunArgs {
    /// Config file path
    #[arg(short, long, default_value = "config/Config.toml")]
    pub config: String,

    /// Profile overlay, loaded from `Config.{profile}.toml` next to the config file
    #[arg(short, long, env = "CANDLE_SYNC_PROFILE")]
    pub profile: Option<String>,

    /// Optional log file path (logs to file instead of stderr)
    #[arg(long)]
    pub log_file: Option<String>,
}

/// Runs the streaming adapter.
///
/// Closed candles are printed to stdout as JSON lines.
///
/// # Errors
/// Returns an error if configuration, the store or the transport cannot be set up.
pub async fn run_feed(args: RunArgs) -> Result<()> {
    let config = wiring::load_config(&args.config, args.profile.as_deref())?;
    let store = wiring::build_store(&config).await?;

    let (closed_tx, closed_rx) = mpsc::channel(config.feed.event_buffer.max(1));
    let reconciler = wiring::build_reconciler(&config, store.clone(), Some(closed_tx.clone()))?;
    let connector = WsConnector::new(config.feed.ws_url.clone(), config.feed.handshake_timeout())
        .context("Invalid feed URL")?;

    let manager = ConnectionManager::new(
        config.feed.clone(),
        Arc::new(connector),
        store,
        reconciler,
        Some(closed_tx),
    );

    if config.feed.subscriptions.is_empty() {
        tracing::warn!("No subscriptions configured, the connection will carry liveness only");
    }
    for subscription in &config.feed.subscriptions {
        manager
            .subscribe(&subscription.symbols, subscription.timeframe)
            .with_context(|| format!("Invalid subscription {:?}", subscription.symbols))?;
        tracing::info!(
            "Subscribed {} symbol(s) at {}",
            subscription.symbols.len(),
            subscription.timeframe
        );
    }

    let printer = tokio::spawn(print_closed_candles(closed_rx));
    let event_logger = tokio::spawn(log_events(manager.events()));

    tracing::info!("Connecting to {}", config.feed.ws_url);
    if let Err(e) = manager.connect().await {
        tracing::warn!("Initial connect failed, retrying in background: {}", e);
    }

    shutdown_signal().await?;

    tracing::info!("Disconnecting...");
    manager.disconnect().await;
    let stats = manager.stats();
    tracing::info!(
        messages = stats.messages_received,
        written = stats.candles_written,
        dropped = stats.frames_dropped,
        gaps = stats.gaps_detected,
        duplicates = stats.duplicates,
        reconnects = stats.reconnect_attempts,
        "Feed stopped"
    );

    event_logger.abort();
    drop(manager);
    // In-flight backfills hold the remaining senders; let them finish.
    if let Err(e) = printer.await {
        tracing::error!("Closed-candle printer failed: {}", e);
    }
    Ok(())
}

async fn print_closed_candles(mut rx: mpsc::Receiver<candle_sync_core::ClosedCandle>) {
    while let Some(closed) = rx.recv().await {
        match serde_json::to_string(&closed) {
            Ok(line) => println!("{line}"),
            Err(e) => tracing::error!("Failed to serialize closed candle: {}", e),
        }
    }
}

async fn log_events(mut rx: broadcast::Receiver<ConnectionEvent>) {
    loop {
        match rx.recv().await {
            Ok(ConnectionEvent::PhaseChanged(_)) => {}
            Ok(event) => tracing::debug!(?event, "Connection event"),
            Err(broadcast::error::RecvError::Lagged(skipped)) => {
                tracing::warn!("Event logger lagged, skipped {} events", skipped);
            }
            Err(broadcast::error::RecvError::Closed) => return,
        }
    }
}

async fn shutdown_signal() -> Result<()> {
    let mut sigterm = tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate())
        .context("Failed to create SIGTERM handler")?;

    tokio::select! {
        _ = sigterm.recv() => {
            tracing::info!("Received SIGTERM, initiating graceful shutdown");
        }
        result = tokio::signal::ctrl_c() => {
            result.context("Failed to listen for Ctrl+C")?;
            tracing::info!("Received SIGINT (Ctrl+C), initiating graceful shutdown");
        }
    }
    Ok(())
}
