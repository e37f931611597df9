//! Versioned write path and tiered read path over a [`SeriesBackend`].
//!
//! Every candle, live or backfilled, goes through [`VersionedCandleStore::write_if_newer`].
//! Precedence at an occupied timestamp:
//!
//! 1. sequenced over sequenced: only a strictly greater sequence wins
//! 2. unsequenced over sequenced: rejected
//! 3. anything over unsequenced: full replacement
//!
//! The rule is applied atomically per key by the backend, so the live path and the
//! reconciliation path never need to coordinate.

use chrono::{DateTime, Duration, Utc};
use std::sync::Arc;

use candle_sync_core::{SeriesId, StoreConfig, Tier, VersionedCandle, WriteRequest};

use crate::backend::{SeriesBackend, WritePolicy};
use crate::error::StoreError;
use crate::router::{KeyRouter, SeriesKey};

/// What to read from a series.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReadQuery {
    /// Inclusive on both ends.
    Range {
        start: DateTime<Utc>,
        end: DateTime<Utc>,
    },
    /// The most recent `n` candles.
    Latest(usize),
}

#[derive(Debug, Clone)]
pub struct VersionedCandleStore {
    backend: Arc<dyn SeriesBackend>,
    router: KeyRouter,
    max_candles_per_series: usize,
    overflow_ttl: Duration,
}

impl VersionedCandleStore {
    #[must_use]
    pub fn new(
        backend: Arc<dyn SeriesBackend>,
        router: KeyRouter,
        max_candles_per_series: usize,
        overflow_ttl: Duration,
    ) -> Self {
        Self {
            backend,
            router,
            max_candles_per_series,
            overflow_ttl,
        }
    }

    /// # Errors
    /// Returns an error if the tier/tenant combination in `config` is invalid.
    pub fn from_config(
        backend: Arc<dyn SeriesBackend>,
        config: &StoreConfig,
    ) -> Result<Self, StoreError> {
        let router = KeyRouter::from_config(config)?;
        let ttl = Duration::from_std(config.overflow_ttl())
            .unwrap_or_else(|_| Duration::days(36_500));
        Ok(Self::new(
            backend,
            router,
            config.max_candles_per_series,
            ttl,
        ))
    }

    #[must_use]
    pub const fn router(&self) -> &KeyRouter {
        &self.router
    }

    /// Writes the candle unless the stored value at its timestamp takes precedence.
    ///
    /// # Errors
    /// Returns an error if the backend fails; a rejected write is `Ok(false)`.
    pub async fn write_if_newer(&self, request: WriteRequest) -> Result<bool, StoreError> {
        let series = request.candle().series_id();
        let key = self.router.write_key(&series);
        let policy = WritePolicy {
            max_len: self.max_candles_per_series,
            ttl: match key.tier {
                Tier::Shared => None,
                Tier::Overflow => Some(self.overflow_ttl),
            },
        };
        let candle = request.into_versioned();
        let written = self
            .backend
            .write_if_newer(&key.to_string(), &candle, policy)
            .await?;

        tracing::trace!(
            key = %key,
            timestamp = %candle.timestamp(),
            sequence = ?candle.sequence(),
            written,
            "write_if_newer"
        );
        Ok(written)
    }

    /// Reads from the first tier that has data for the series.
    ///
    /// # Errors
    /// Returns an error if a backend read fails.
    pub async fn read(
        &self,
        series: &SeriesId,
        query: ReadQuery,
    ) -> Result<Vec<VersionedCandle>, StoreError> {
        for key in self.router.read_keys(series) {
            let candles = self.read_key(&key, query).await?;
            if !candles.is_empty() {
                return Ok(candles);
            }
        }
        Ok(Vec::new())
    }

    /// Most recent stored candle for the series, with tier fallback.
    ///
    /// # Errors
    /// Returns an error if a backend read fails.
    pub async fn latest(&self, series: &SeriesId) -> Result<Option<VersionedCandle>, StoreError> {
        Ok(self.read(series, ReadQuery::Latest(1)).await?.pop())
    }

    async fn read_key(
        &self,
        key: &SeriesKey,
        query: ReadQuery,
    ) -> Result<Vec<VersionedCandle>, StoreError> {
        let key = key.to_string();
        match query {
            ReadQuery::Range { start, end } => self.backend.range(&key, start, end).await,
            ReadQuery::Latest(0) => Ok(Vec::new()),
            ReadQuery::Latest(count) => self.backend.latest(&key, count).await,
        }
    }
}
