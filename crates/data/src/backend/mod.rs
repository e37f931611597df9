//! Physical storage for candle series.
//!
//! A backend owns one sorted series per physical key and applies the version
//! precedence rule atomically per write. It knows nothing about tiers or tenants.

pub mod memory;
pub mod postgres;

use async_trait::async_trait;
use chrono::{DateTime, Duration, Utc};

use candle_sync_core::VersionedCandle;

use crate::error::StoreError;

pub use memory::MemoryBackend;
pub use postgres::PostgresBackend;

/// Per-write limits the backend enforces in the same step as the write.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct WritePolicy {
    /// Maximum candles kept for the key; oldest are evicted past this.
    pub max_len: usize,
    /// Series expires this long after its last accepted write.
    pub ttl: Option<Duration>,
}

#[async_trait]
pub trait SeriesBackend: Send + Sync + std::fmt::Debug {
    /// Stores `candle` under `key` unless an existing value at the same timestamp takes
    /// precedence. Returns whether the write was applied.
    async fn write_if_newer(
        &self,
        key: &str,
        candle: &VersionedCandle,
        policy: WritePolicy,
    ) -> Result<bool, StoreError>;

    /// Candles with `start <= timestamp <= end`, ascending.
    async fn range(
        &self,
        key: &str,
        start: DateTime<Utc>,
        end: DateTime<Utc>,
    ) -> Result<Vec<VersionedCandle>, StoreError>;

    /// Most recent `count` candles, ascending.
    async fn latest(&self, key: &str, count: usize) -> Result<Vec<VersionedCandle>, StoreError>;
}
