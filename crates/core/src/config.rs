use serde::{Deserialize, Serialize};
use std::time::Duration;

use crate::error::ValidationError;
use crate::series::Tier;
use crate::timeframe::Timeframe;

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct AppConfig {
    #[serde(default)]
    pub feed: FeedConfig,
    #[serde(default)]
    pub reconciliation: ReconciliationConfig,
    #[serde(default)]
    pub store: StoreConfig,
    #[serde(default)]
    pub database: DatabaseConfig,
}

/// Streaming connection settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct FeedConfig {
    /// Exchange id stamped on every candle from this feed.
    pub exchange: String,
    pub ws_url: String,
    /// Unit of the `t` field on inbound candle messages.
    pub timestamp_unit: TimestampUnit,
    pub handshake_timeout_ms: u64,
    /// Subscribe attempts per connection before the handshake counts as a transport error.
    pub subscribe_retries: u32,
    pub watchdog_interval_secs: u64,
    pub reconnect_base_delay_ms: u64,
    pub reconnect_max_delay_ms: u64,
    /// Fraction of the delay randomised in either direction, in `[0, 1]`.
    pub reconnect_jitter: f64,
    /// Maximum message handlers in flight at once.
    pub handler_concurrency: usize,
    /// Capacity of the closed-candle and connection-event channels.
    pub event_buffer: usize,
    pub subscriptions: Vec<SubscriptionConfig>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SubscriptionConfig {
    pub symbols: Vec<String>,
    pub timeframe: Timeframe,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TimestampUnit {
    Seconds,
    #[default]
    Millis,
    Micros,
    Nanos,
}

/// REST backfill settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ReconciliationConfig {
    pub rest_url: String,
    /// Exchange-imposed cap on candles per request.
    pub page_size: usize,
    /// Oldest point a backfill will reach back to, measured from now.
    pub max_lookback_secs: u64,
    /// Staleness below this (or below one bar, whichever is larger) is never backfilled.
    /// `0` makes the threshold exactly one bar width for every timeframe.
    pub min_gap_secs: u64,
    pub requests_per_second: u32,
    pub request_timeout_secs: u64,
    /// Retries of the same page after a rate-limit response.
    pub rate_limit_retries: u32,
    pub rate_limit_backoff_ms: u64,
    /// Cap on the delay between retries of a failed background pass.
    pub retry_max_delay_ms: u64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StoreBackendKind {
    #[default]
    Memory,
    Postgres,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct StoreConfig {
    pub backend: StoreBackendKind,
    pub max_candles_per_series: usize,
    /// Tenant owning the overflow tier; without one only the shared tier is used.
    pub tenant: Option<String>,
    /// Tier new writes land in.
    pub write_tier: Tier,
    pub overflow_ttl_secs: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct DatabaseConfig {
    pub url: String,
    pub max_connections: u32,
}

impl Default for FeedConfig {
    fn default() -> Self {
        Self {
            exchange: "binance".to_string(),
            ws_url: "wss://stream.example-exchange.com/ws".to_string(),
            timestamp_unit: TimestampUnit::Millis,
            handshake_timeout_ms: 10_000,
            subscribe_retries: 3,
            watchdog_interval_secs: 30,
            reconnect_base_delay_ms: 1_000,
            reconnect_max_delay_ms: 30_000,
            reconnect_jitter: 0.2,
            handler_concurrency: 64,
            event_buffer: 1_024,
            subscriptions: Vec::new(),
        }
    }
}

impl Default for ReconciliationConfig {
    fn default() -> Self {
        Self {
            rest_url: "https://api.example-exchange.com".to_string(),
            page_size: 1_000,
            max_lookback_secs: 86_400,
            min_gap_secs: 300,
            requests_per_second: 10,
            request_timeout_secs: 30,
            rate_limit_retries: 5,
            rate_limit_backoff_ms: 1_000,
            retry_max_delay_ms: 60_000,
        }
    }
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            backend: StoreBackendKind::Memory,
            max_candles_per_series: 5_000,
            tenant: None,
            write_tier: Tier::Shared,
            overflow_ttl_secs: 7 * 86_400,
        }
    }
}

impl Default for DatabaseConfig {
    fn default() -> Self {
        Self {
            url: "postgresql://localhost/candle_sync".to_string(),
            max_connections: 10,
        }
    }
}

impl FeedConfig {
    #[must_use]
    pub const fn handshake_timeout(&self) -> Duration {
        Duration::from_millis(self.handshake_timeout_ms)
    }

    #[must_use]
    pub const fn watchdog_interval(&self) -> Duration {
        Duration::from_secs(self.watchdog_interval_secs)
    }

    #[must_use]
    pub const fn reconnect_base_delay(&self) -> Duration {
        Duration::from_millis(self.reconnect_base_delay_ms)
    }

    #[must_use]
    pub const fn reconnect_max_delay(&self) -> Duration {
        Duration::from_millis(self.reconnect_max_delay_ms)
    }
}

impl ReconciliationConfig {
    #[must_use]
    pub fn max_lookback(&self) -> chrono::Duration {
        chrono::Duration::seconds(i64::try_from(self.max_lookback_secs).unwrap_or(i64::MAX / 1_000))
    }

    #[must_use]
    pub fn min_gap(&self) -> chrono::Duration {
        chrono::Duration::seconds(i64::try_from(self.min_gap_secs).unwrap_or(i64::MAX / 1_000))
    }

    #[must_use]
    pub const fn request_timeout(&self) -> Duration {
        Duration::from_secs(self.request_timeout_secs)
    }

    #[must_use]
    pub const fn rate_limit_backoff(&self) -> Duration {
        Duration::from_millis(self.rate_limit_backoff_ms)
    }

    #[must_use]
    pub const fn retry_max_delay(&self) -> Duration {
        Duration::from_millis(self.retry_max_delay_ms)
    }
}

impl StoreConfig {
    #[must_use]
    pub const fn overflow_ttl(&self) -> Duration {
        Duration::from_secs(self.overflow_ttl_secs)
    }
}

impl AppConfig {
    /// Rejects values that would make the adapter misbehave.
    ///
    /// # Errors
    /// Returns the first invalid field found.
    pub fn validate(&self) -> Result<(), ValidationError> {
        let feed = &self.feed;
        if feed.exchange.trim().is_empty() || feed.exchange.contains(':') {
            return Err(ValidationError::config("feed.exchange", "must be non-empty without ':'"));
        }
        if feed.watchdog_interval_secs == 0 {
            return Err(ValidationError::config("feed.watchdog_interval_secs", "must be > 0"));
        }
        if feed.handshake_timeout_ms == 0 {
            return Err(ValidationError::config("feed.handshake_timeout_ms", "must be > 0"));
        }
        if feed.subscribe_retries == 0 {
            return Err(ValidationError::config("feed.subscribe_retries", "must be > 0"));
        }
        if feed.reconnect_base_delay_ms > feed.reconnect_max_delay_ms {
            return Err(ValidationError::config(
                "feed.reconnect_base_delay_ms",
                "must not exceed reconnect_max_delay_ms",
            ));
        }
        if !(0.0..=1.0).contains(&feed.reconnect_jitter) {
            return Err(ValidationError::config("feed.reconnect_jitter", "must be within [0, 1]"));
        }
        if feed.handler_concurrency == 0 || feed.event_buffer == 0 {
            return Err(ValidationError::config(
                "feed.handler_concurrency",
                "handler_concurrency and event_buffer must be > 0",
            ));
        }
        for subscription in &feed.subscriptions {
            crate::error::validate_symbols(&subscription.symbols)?;
        }

        let rec = &self.reconciliation;
        if rec.page_size == 0 {
            return Err(ValidationError::config("reconciliation.page_size", "must be > 0"));
        }
        if rec.requests_per_second == 0 {
            return Err(ValidationError::config("reconciliation.requests_per_second", "must be > 0"));
        }
        if rec.max_lookback_secs == 0 {
            return Err(ValidationError::config("reconciliation.max_lookback_secs", "must be > 0"));
        }

        let store = &self.store;
        if store.max_candles_per_series == 0 {
            return Err(ValidationError::config("store.max_candles_per_series", "must be > 0"));
        }
        let tenant_missing = store.tenant.as_deref().map_or(true, |t| t.trim().is_empty());
        if store.write_tier == Tier::Overflow && tenant_missing {
            return Err(ValidationError::config(
                "store.write_tier",
                "overflow tier requires store.tenant",
            ));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults_are_valid() {
        let config = AppConfig::default();
        assert!(config.validate().is_ok());
        assert_eq!(config.feed.watchdog_interval(), Duration::from_secs(30));
        assert_eq!(config.reconciliation.min_gap(), chrono::Duration::minutes(5));
    }

    #[test]
    fn test_overflow_write_tier_requires_tenant() {
        let mut config = AppConfig::default();
        config.store.write_tier = Tier::Overflow;
        assert!(config.validate().is_err());

        config.store.tenant = Some("acme".to_string());
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_jitter_out_of_range() {
        let mut config = AppConfig::default();
        config.feed.reconnect_jitter = 1.5;
        let err = config.validate().unwrap_err();
        assert!(err.to_string().contains("reconnect_jitter"));
    }

    #[test]
    fn test_empty_subscription_rejected() {
        let mut config = AppConfig::default();
        config.feed.subscriptions.push(SubscriptionConfig {
            symbols: vec![],
            timeframe: Timeframe::OneMinute,
        });
        assert_eq!(config.validate(), Err(ValidationError::EmptySymbols));
    }

    #[test]
    fn test_partial_json_fills_defaults() {
        let config: AppConfig = serde_json::from_str(
            r#"{"feed": {"exchange": "kraken", "subscriptions": [{"symbols": ["XBTUSD"], "timeframe": "1m"}]}}"#,
        )
        .unwrap();
        assert_eq!(config.feed.exchange, "kraken");
        assert_eq!(config.feed.watchdog_interval_secs, 30);
        assert_eq!(config.feed.subscriptions[0].timeframe, Timeframe::OneMinute);
        assert_eq!(config.store.max_candles_per_series, 5_000);
    }
}
