//! Historical candle source used for reconciliation.
//!
//! `GET {base}/candles?symbol=BTCUSDT&timeframe=5m&start=..&end=..&limit=1000`
//! returns a JSON array of bars (`t`, `o`, `h`, `l`, `c`, `v`), ascending by `t`.
//! `start`/`end` and `t` are in the feed's native timestamp unit.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use governor::{
    clock::DefaultClock,
    state::{InMemoryState, NotKeyed},
    Quota, RateLimiter,
};
use reqwest::{Client, StatusCode};
use std::num::NonZeroU32;
use std::sync::Arc;
use std::time::Duration;

use candle_sync_core::{Candle, ReconciliationConfig, SeriesId};

use crate::error::RestError;
use crate::protocol::{Normalizer, RawBar};

const DEFAULT_RETRY_AFTER: Duration = Duration::from_secs(1);

#[async_trait]
pub trait HistoricalCandleSource: Send + Sync + std::fmt::Debug {
    /// Candles of `series` with `start <= timestamp <= end`, ascending, at most `limit`.
    async fn fetch_candles(
        &self,
        series: &SeriesId,
        start: DateTime<Utc>,
        end: DateTime<Utc>,
        limit: usize,
    ) -> Result<Vec<Candle>, RestError>;
}

pub struct RestCandleClient {
    http: Client,
    base_url: url::Url,
    normalizer: Normalizer,
    rate_limiter: Arc<RateLimiter<NotKeyed, InMemoryState, DefaultClock>>,
}

impl std::fmt::Debug for RestCandleClient {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RestCandleClient")
            .field("base_url", &self.base_url.as_str())
            .field("exchange", &self.normalizer.exchange())
            .finish_non_exhaustive()
    }
}

impl RestCandleClient {
    /// # Errors
    /// Returns an error if the base URL is invalid or the HTTP client cannot be built.
    pub fn new(config: &ReconciliationConfig, normalizer: Normalizer) -> Result<Self, RestError> {
        let http = Client::builder()
            .timeout(config.request_timeout())
            .build()?;
        let rps = NonZeroU32::new(config.requests_per_second).unwrap_or(NonZeroU32::MIN);
        let rate_limiter = Arc::new(RateLimiter::direct(Quota::per_second(rps)));

        // `join` replaces the last path segment unless the base ends in a slash.
        let mut base_url = url::Url::parse(&config.rest_url)?;
        if !base_url.path().ends_with('/') {
            let path = format!("{}/", base_url.path());
            base_url.set_path(&path);
        }

        Ok(Self {
            http,
            base_url,
            normalizer,
            rate_limiter,
        })
    }

    fn candles_url(
        &self,
        series: &SeriesId,
        start: DateTime<Utc>,
        end: DateTime<Utc>,
        limit: usize,
    ) -> Result<url::Url, RestError> {
        let mut url = self.base_url.join("candles")?;
        url.query_pairs_mut()
            .append_pair("symbol", &series.symbol)
            .append_pair("timeframe", series.timeframe.as_str())
            .append_pair("start", &self.normalizer.to_native(start).to_string())
            .append_pair("end", &self.normalizer.to_native(end).to_string())
            .append_pair("limit", &limit.to_string());
        Ok(url)
    }
}

#[async_trait]
impl HistoricalCandleSource for RestCandleClient {
    async fn fetch_candles(
        &self,
        series: &SeriesId,
        start: DateTime<Utc>,
        end: DateTime<Utc>,
        limit: usize,
    ) -> Result<Vec<Candle>, RestError> {
        self.rate_limiter.until_ready().await;

        let url = self.candles_url(series, start, end, limit)?;
        tracing::debug!("GET {}", url);

        let response = self
            .http
            .get(url)
            .header("Accept", "application/json")
            .send()
            .await?;

        let status = response.status();
        if status == StatusCode::TOO_MANY_REQUESTS {
            let retry_after = response
                .headers()
                .get("Retry-After")
                .and_then(|v| v.to_str().ok())
                .and_then(|s| s.trim().parse::<u64>().ok())
                .map_or(DEFAULT_RETRY_AFTER, Duration::from_secs);
            return Err(RestError::RateLimited { retry_after });
        }
        if !status.is_success() {
            let message = response.text().await.unwrap_or_default();
            return Err(RestError::Api {
                status: status.as_u16(),
                message,
            });
        }

        let bars: Vec<RawBar> = response.json().await?;
        bars.iter()
            .map(|bar| {
                self.normalizer
                    .bar(&series.symbol, series.timeframe, bar)
                    .map_err(RestError::from)
            })
            .collect()
    }
}
