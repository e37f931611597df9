use async_trait::async_trait;
use chrono::{DateTime, Utc};
use parking_lot::RwLock;
use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;

use candle_sync_core::{Clock, SystemClock, VersionedCandle};

use super::{SeriesBackend, WritePolicy};
use crate::error::StoreError;

#[derive(Debug, Default)]
struct Series {
    candles: BTreeMap<DateTime<Utc>, VersionedCandle>,
    expires_at: Option<DateTime<Utc>>,
}

impl Series {
    fn is_expired(&self, now: DateTime<Utc>) -> bool {
        self.expires_at.is_some_and(|at| at <= now)
    }
}

/// In-process backend. Each write holds the map lock for its whole check-and-set.
#[derive(Debug)]
pub struct MemoryBackend {
    series: RwLock<HashMap<String, Series>>,
    clock: Arc<dyn Clock>,
}

impl Default for MemoryBackend {
    fn default() -> Self {
        Self::new()
    }
}

impl MemoryBackend {
    #[must_use]
    pub fn new() -> Self {
        Self::with_clock(Arc::new(SystemClock))
    }

    #[must_use]
    pub fn with_clock(clock: Arc<dyn Clock>) -> Self {
        Self {
            series: RwLock::new(HashMap::new()),
            clock,
        }
    }

    /// Number of live (unexpired) series.
    #[must_use]
    pub fn series_count(&self) -> usize {
        let now = self.clock.now();
        self.series
            .read()
            .values()
            .filter(|s| !s.is_expired(now))
            .count()
    }
}

#[async_trait]
impl SeriesBackend for MemoryBackend {
    async fn write_if_newer(
        &self,
        key: &str,
        candle: &VersionedCandle,
        policy: WritePolicy,
    ) -> Result<bool, StoreError> {
        let now = self.clock.now();
        let mut map = self.series.write();
        let series = map.entry(key.to_string()).or_default();
        if series.is_expired(now) {
            *series = Series::default();
        }

        let timestamp = candle.timestamp();
        match series.candles.get(&timestamp) {
            Some(existing) => {
                if !candle.version.supersedes(&existing.version) {
                    return Ok(false);
                }
            }
            None => {
                let full = series.candles.len() >= policy.max_len;
                let oldest = series.candles.keys().next().copied();
                if full && oldest.is_some_and(|oldest| timestamp < oldest) {
                    return Ok(false);
                }
            }
        }

        series.candles.insert(timestamp, candle.clone());
        while series.candles.len() > policy.max_len {
            series.candles.pop_first();
        }
        series.expires_at = policy.ttl.map(|ttl| now + ttl);
        Ok(true)
    }

    async fn range(
        &self,
        key: &str,
        start: DateTime<Utc>,
        end: DateTime<Utc>,
    ) -> Result<Vec<VersionedCandle>, StoreError> {
        if start > end {
            return Ok(Vec::new());
        }
        let now = self.clock.now();
        let map = self.series.read();
        Ok(map
            .get(key)
            .filter(|s| !s.is_expired(now))
            .map(|s| s.candles.range(start..=end).map(|(_, c)| c.clone()).collect())
            .unwrap_or_default())
    }

    async fn latest(&self, key: &str, count: usize) -> Result<Vec<VersionedCandle>, StoreError> {
        let now = self.clock.now();
        let map = self.series.read();
        let Some(series) = map.get(key).filter(|s| !s.is_expired(now)) else {
            return Ok(Vec::new());
        };
        let mut candles: Vec<VersionedCandle> =
            series.candles.values().rev().take(count).cloned().collect();
        candles.reverse();
        Ok(candles)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use candle_sync_core::{Candle, ManualClock, Timeframe, WriteRequest};
    use chrono::{Duration, TimeZone};
    use rust_decimal_macros::dec;

    fn t0() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2026, 1, 30, 12, 0, 0).unwrap()
    }

    fn candle_at(minutes: i64) -> Candle {
        Candle {
            exchange: "binance".to_string(),
            symbol: "BTCUSDT".to_string(),
            timeframe: Timeframe::OneMinute,
            timestamp: t0() + Duration::minutes(minutes),
            open: dec!(100),
            high: dec!(110),
            low: dec!(90),
            close: dec!(105),
            volume: dec!(1),
            is_synthetic: false,
        }
    }

    const POLICY: WritePolicy = WritePolicy {
        max_len: 3,
        ttl: None,
    };

    #[tokio::test]
    async fn test_retention_evicts_oldest() {
        let backend = MemoryBackend::new();
        for m in 0..5 {
            let c = WriteRequest::backfill(candle_at(m)).into_versioned();
            assert!(backend.write_if_newer("k", &c, POLICY).await.unwrap());
        }
        let all = backend.latest("k", 10).await.unwrap();
        let stamps: Vec<_> = all.iter().map(VersionedCandle::timestamp).collect();
        assert_eq!(
            stamps,
            vec![
                t0() + Duration::minutes(2),
                t0() + Duration::minutes(3),
                t0() + Duration::minutes(4)
            ]
        );
    }

    #[tokio::test]
    async fn test_full_series_rejects_older_than_oldest() {
        let backend = MemoryBackend::new();
        for m in 2..5 {
            let c = WriteRequest::backfill(candle_at(m)).into_versioned();
            backend.write_if_newer("k", &c, POLICY).await.unwrap();
        }
        let stale = WriteRequest::live(candle_at(0), 1).into_versioned();
        assert!(!backend.write_if_newer("k", &stale, POLICY).await.unwrap());
        assert_eq!(backend.latest("k", 10).await.unwrap().len(), 3);
    }

    #[tokio::test]
    async fn test_ttl_expires_series() {
        let clock = ManualClock::new(t0());
        let backend = MemoryBackend::with_clock(Arc::new(clock.clone()));
        let policy = WritePolicy {
            max_len: 10,
            ttl: Some(Duration::hours(1)),
        };
        let c = WriteRequest::backfill(candle_at(0)).into_versioned();
        backend.write_if_newer("k", &c, policy).await.unwrap();
        assert_eq!(backend.series_count(), 1);

        clock.advance(Duration::minutes(59));
        assert_eq!(backend.latest("k", 1).await.unwrap().len(), 1);

        clock.advance(Duration::minutes(1));
        assert!(backend.latest("k", 1).await.unwrap().is_empty());
        assert!(backend
            .range("k", t0(), t0() + Duration::hours(2))
            .await
            .unwrap()
            .is_empty());
        assert_eq!(backend.series_count(), 0);
    }

    #[tokio::test]
    async fn test_range_is_inclusive_and_ordered() {
        let backend = MemoryBackend::new();
        let policy = WritePolicy {
            max_len: 100,
            ttl: None,
        };
        for m in [3, 1, 2, 0] {
            let c = WriteRequest::backfill(candle_at(m)).into_versioned();
            backend.write_if_newer("k", &c, policy).await.unwrap();
        }
        let got = backend
            .range("k", t0() + Duration::minutes(1), t0() + Duration::minutes(2))
            .await
            .unwrap();
        assert_eq!(got.len(), 2);
        assert!(got[0].timestamp() < got[1].timestamp());
        assert!(backend
            .range("k", t0() + Duration::minutes(2), t0())
            .await
            .unwrap()
            .is_empty());
    }
}
