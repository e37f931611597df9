//! Builds the adapter's components from configuration.

use anyhow::{Context, Result};
use std::sync::Arc;
use tokio::sync::mpsc;

use candle_sync_core::{AppConfig, ClosedCandle, ConfigLoader, StoreBackendKind, SystemClock};
use candle_sync_data::{MemoryBackend, PostgresBackend, SeriesBackend, VersionedCandleStore};
use candle_sync_feed::{Normalizer, ReconciliationService, RestCandleClient};

pub fn load_config(path: &str, profile: Option<&str>) -> Result<AppConfig> {
    let config = match profile {
        Some(profile) => ConfigLoader::load_with_profile(path, profile)?,
        None => ConfigLoader::load_from(path)?,
    };
    tracing::info!(
        exchange = %config.feed.exchange,
        backend = ?config.store.backend,
        write_tier = %config.store.write_tier.as_str(),
        "Configuration loaded from {}",
        path
    );
    Ok(config)
}

pub async fn build_store(config: &AppConfig) -> Result<VersionedCandleStore> {
    let backend: Arc<dyn SeriesBackend> = match config.store.backend {
        StoreBackendKind::Memory => {
            tracing::warn!("Using in-memory store, candles are lost on exit");
            Arc::new(MemoryBackend::new())
        }
        StoreBackendKind::Postgres => {
            let backend = PostgresBackend::connect(&config.database).await?;
            backend.migrate().await?;
            tracing::info!("Connected to PostgreSQL store");
            Arc::new(backend)
        }
    };
    VersionedCandleStore::from_config(backend, &config.store).context("Invalid store configuration")
}

pub fn build_reconciler(
    config: &AppConfig,
    store: VersionedCandleStore,
    closed_tx: Option<mpsc::Sender<ClosedCandle>>,
) -> Result<ReconciliationService> {
    let normalizer = Normalizer::new(config.feed.exchange.clone(), config.feed.timestamp_unit);
    let client = RestCandleClient::new(&config.reconciliation, normalizer)
        .context("Failed to build REST candle client")?;
    Ok(ReconciliationService::new(
        config.reconciliation.clone(),
        Arc::new(client),
        store,
        Arc::new(SystemClock),
        closed_tx,
    ))
}
