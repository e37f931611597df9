//! Candle values and the version markers that decide write precedence.

use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};

use crate::series::SeriesId;
use crate::timeframe::Timeframe;

/// One OHLCV bar. Immutable once built; replaced wholesale, never patched.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Candle {
    pub exchange: String,
    pub symbol: String,
    pub timeframe: Timeframe,
    /// Bar open, aligned to the timeframe boundary.
    pub timestamp: DateTime<Utc>,
    pub open: Decimal,
    pub high: Decimal,
    pub low: Decimal,
    pub close: Decimal,
    pub volume: Decimal,
    /// Forward-filled bar for a period with no trades. Set upstream, preserved here.
    #[serde(default)]
    pub is_synthetic: bool,
}

impl Candle {
    #[must_use]
    pub fn series_id(&self) -> SeriesId {
        SeriesId::new(&self.exchange, &self.symbol, self.timeframe)
    }

    /// Instant at which this bar closes.
    #[must_use]
    pub fn close_time(&self) -> DateTime<Utc> {
        self.timestamp + self.timeframe.duration()
    }

    /// Checks OHLC ordering and non-negative volume.
    #[must_use]
    pub fn is_valid(&self) -> bool {
        self.high >= self.open
            && self.high >= self.close
            && self.high >= self.low
            && self.low <= self.open
            && self.low <= self.close
            && self.volume >= Decimal::ZERO
    }
}

/// Where a stored candle came from, and therefore how authoritative it is.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(tag = "source", rename_all = "snake_case")]
pub enum CandleVersion {
    /// Pushed on the live stream with a connection-scoped sequence number.
    Live { sequence: u64 },
    /// Fetched over REST; carries no sequence.
    Backfill,
}

impl CandleVersion {
    #[must_use]
    pub const fn sequence(&self) -> Option<u64> {
        match self {
            Self::Live { sequence } => Some(*sequence),
            Self::Backfill => None,
        }
    }

    /// Decides whether a write carrying `self` replaces a stored value carrying `existing`.
    ///
    /// Sequenced values beat unsequenced ones; between two sequenced values only a
    /// strictly greater sequence wins; anything replaces an unsequenced value.
    #[must_use]
    pub const fn supersedes(&self, existing: &CandleVersion) -> bool {
        match (self, existing) {
            (Self::Live { sequence: incoming }, Self::Live { sequence: stored }) => {
                *incoming > *stored
            }
            (Self::Backfill, Self::Live { .. }) => false,
            (Self::Live { .. } | Self::Backfill, Self::Backfill) => true,
        }
    }
}

/// A candle together with its version marker, as held in the store.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct VersionedCandle {
    pub candle: Candle,
    pub version: CandleVersion,
}

impl VersionedCandle {
    #[must_use]
    pub fn timestamp(&self) -> DateTime<Utc> {
        self.candle.timestamp
    }

    #[must_use]
    pub const fn sequence(&self) -> Option<u64> {
        self.version.sequence()
    }
}

/// A request to write one candle through the versioned write path.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum WriteRequest {
    /// Live push; sequence is scoped to the physical connection that delivered it.
    Sequenced { candle: Candle, sequence: u64 },
    /// REST backfill.
    Unsequenced { candle: Candle },
}

impl WriteRequest {
    #[must_use]
    pub const fn live(candle: Candle, sequence: u64) -> Self {
        Self::Sequenced { candle, sequence }
    }

    #[must_use]
    pub const fn backfill(candle: Candle) -> Self {
        Self::Unsequenced { candle }
    }

    #[must_use]
    pub const fn candle(&self) -> &Candle {
        match self {
            Self::Sequenced { candle, .. } | Self::Unsequenced { candle } => candle,
        }
    }

    #[must_use]
    pub const fn version(&self) -> CandleVersion {
        match self {
            Self::Sequenced { sequence, .. } => CandleVersion::Live {
                sequence: *sequence,
            },
            Self::Unsequenced { .. } => CandleVersion::Backfill,
        }
    }

    #[must_use]
    pub fn into_versioned(self) -> VersionedCandle {
        let version = self.version();
        let candle = match self {
            Self::Sequenced { candle, .. } | Self::Unsequenced { candle } => candle,
        };
        VersionedCandle { candle, version }
    }
}
