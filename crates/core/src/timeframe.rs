//! Bar widths supported by the ingestion layer.

use chrono::{DateTime, Duration, TimeZone, Utc};
use serde::{Deserialize, Deserializer, Serialize, Serializer};
use std::fmt;
use std::str::FromStr;

use crate::error::ValidationError;

/// Fixed candle width.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum Timeframe {
    OneMinute,
    ThreeMinutes,
    FiveMinutes,
    FifteenMinutes,
    ThirtyMinutes,
    OneHour,
    TwoHours,
    FourHours,
    SixHours,
    TwelveHours,
    OneDay,
    OneWeek,
}

impl Timeframe {
    /// Returns the exchange interval string (e.g. "5m").
    #[must_use]
    pub const fn as_str(&self) -> &'static str {
        match self {
            Self::OneMinute => "1m",
            Self::ThreeMinutes => "3m",
            Self::FiveMinutes => "5m",
            Self::FifteenMinutes => "15m",
            Self::ThirtyMinutes => "30m",
            Self::OneHour => "1h",
            Self::TwoHours => "2h",
            Self::FourHours => "4h",
            Self::SixHours => "6h",
            Self::TwelveHours => "12h",
            Self::OneDay => "1d",
            Self::OneWeek => "1w",
        }
    }

    /// Returns the bar width in milliseconds.
    #[must_use]
    pub const fn duration_ms(&self) -> i64 {
        match self {
            Self::OneMinute => 60_000,
            Self::ThreeMinutes => 180_000,
            Self::FiveMinutes => 300_000,
            Self::FifteenMinutes => 900_000,
            Self::ThirtyMinutes => 1_800_000,
            Self::OneHour => 3_600_000,
            Self::TwoHours => 7_200_000,
            Self::FourHours => 14_400_000,
            Self::SixHours => 21_600_000,
            Self::TwelveHours => 43_200_000,
            Self::OneDay => 86_400_000,
            Self::OneWeek => 604_800_000,
        }
    }

    /// Returns the bar width as a chrono duration.
    #[must_use]
    pub fn duration(&self) -> Duration {
        Duration::milliseconds(self.duration_ms())
    }

    /// Floors a timestamp to the open of the bar containing it.
    ///
    /// Boundaries are aligned to the Unix epoch, so weekly bars open on Thursdays.
    #[must_use]
    pub fn align(&self, timestamp: DateTime<Utc>) -> DateTime<Utc> {
        let width = self.duration_ms();
        let millis = timestamp.timestamp_millis();
        let aligned = millis - millis.rem_euclid(width);
        Utc.timestamp_millis_opt(aligned).single().unwrap_or(timestamp)
    }

    /// Returns true if the timestamp sits exactly on a bar boundary.
    #[must_use]
    pub fn is_aligned(&self, timestamp: DateTime<Utc>) -> bool {
        timestamp.timestamp_millis().rem_euclid(self.duration_ms()) == 0
            && timestamp.timestamp_subsec_nanos() % 1_000_000 == 0
    }

    /// All supported timeframes, narrowest first.
    #[must_use]
    pub const fn all() -> &'static [Timeframe] {
        &[
            Self::OneMinute,
            Self::ThreeMinutes,
            Self::FiveMinutes,
            Self::FifteenMinutes,
            Self::ThirtyMinutes,
            Self::OneHour,
            Self::TwoHours,
            Self::FourHours,
            Self::SixHours,
            Self::TwelveHours,
            Self::OneDay,
            Self::OneWeek,
        ]
    }
}

impl fmt::Display for Timeframe {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Timeframe {
    type Err = ValidationError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::all()
            .iter()
            .copied()
            .find(|tf| tf.as_str().eq_ignore_ascii_case(s))
            .ok_or_else(|| ValidationError::UnknownTimeframe(s.to_string()))
    }
}

impl Serialize for Timeframe {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(self.as_str())
    }
}

impl<'de> Deserialize<'de> for Timeframe {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let raw = String::deserialize(deserializer)?;
        raw.parse().map_err(serde::de::Error::custom)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_as_str_round_trips_through_from_str() {
        for tf in Timeframe::all() {
            assert_eq!(Timeframe::from_str(tf.as_str()).unwrap(), *tf);
        }
    }

    #[test]
    fn test_from_str_is_case_insensitive() {
        assert_eq!(Timeframe::from_str("1H").unwrap(), Timeframe::OneHour);
        assert_eq!(Timeframe::from_str("5M").unwrap(), Timeframe::FiveMinutes);
    }

    #[test]
    fn test_from_str_rejects_unknown() {
        let err = Timeframe::from_str("7m").unwrap_err();
        assert!(err.to_string().contains("7m"));
    }

    #[test]
    fn test_duration() {
        assert_eq!(Timeframe::FiveMinutes.duration(), Duration::minutes(5));
        assert_eq!(Timeframe::OneDay.duration(), Duration::days(1));
    }

    #[test]
    fn test_align_floors_to_boundary() {
        let ts = Utc.with_ymd_and_hms(2026, 1, 30, 12, 7, 42).unwrap();
        let aligned = Timeframe::FiveMinutes.align(ts);
        assert_eq!(aligned, Utc.with_ymd_and_hms(2026, 1, 30, 12, 5, 0).unwrap());
        assert!(Timeframe::FiveMinutes.is_aligned(aligned));
        assert!(!Timeframe::FiveMinutes.is_aligned(ts));
    }

    #[test]
    fn test_align_is_idempotent() {
        let ts = Utc.with_ymd_and_hms(2026, 1, 30, 12, 0, 0).unwrap();
        assert_eq!(Timeframe::OneHour.align(ts), ts);
    }

    #[test]
    fn test_serde_uses_interval_string() {
        let json = serde_json::to_string(&Timeframe::FifteenMinutes).unwrap();
        assert_eq!(json, "\"15m\"");
        let parsed: Timeframe = serde_json::from_str("\"4h\"").unwrap();
        assert_eq!(parsed, Timeframe::FourHours);
    }
}
