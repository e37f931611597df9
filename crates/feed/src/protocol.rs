//! JSON wire format of the candle stream and its normalization into [`Candle`]s.
//!
//! # Outbound
//! ```json
//! {"op": "subscribe", "channel": "data", "symbols": ["BTCUSDT"], "timeframe": "5m"}
//! {"op": "subscribe", "channel": "liveness", "symbols": ["BTCUSDT"]}
//! {"op": "unsubscribe", "channel": "data", "symbols": ["BTCUSDT"]}
//! ```
//!
//! # Inbound
//! ```json
//! {"type": "candle", "seq": 42, "symbol": "BTCUSDT", "timeframe": "5m",
//!  "t": 1769774400000, "o": "50000.1", "h": "50100", "l": "49900", "c": "50050",
//!  "v": "12.5", "closed": false}
//! {"type": "heartbeat"}
//! {"type": "subscribed", "channel": "data", "symbols": ["BTCUSDT"]}
//! {"type": "error", "message": "unknown symbol"}
//! ```

use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};

use candle_sync_core::{Candle, TimestampUnit, Timeframe};

use crate::error::ProtocolError;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ControlOp {
    Subscribe,
    Unsubscribe,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ChannelKind {
    Data,
    Liveness,
}

/// Subscribe/unsubscribe control message.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ControlMessage {
    pub op: ControlOp,
    pub channel: ChannelKind,
    pub symbols: Vec<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub timeframe: Option<Timeframe>,
}

impl ControlMessage {
    #[must_use]
    pub fn subscribe_data(symbols: Vec<String>, timeframe: Timeframe) -> Self {
        Self {
            op: ControlOp::Subscribe,
            channel: ChannelKind::Data,
            symbols,
            timeframe: Some(timeframe),
        }
    }

    #[must_use]
    pub fn subscribe_liveness(symbols: Vec<String>) -> Self {
        Self {
            op: ControlOp::Subscribe,
            channel: ChannelKind::Liveness,
            symbols,
            timeframe: None,
        }
    }

    #[must_use]
    pub fn unsubscribe(channel: ChannelKind, symbols: Vec<String>) -> Self {
        Self {
            op: ControlOp::Unsubscribe,
            channel,
            symbols,
            timeframe: None,
        }
    }

    /// # Errors
    /// Returns an error if serialization fails.
    pub fn to_json(&self) -> Result<String, ProtocolError> {
        Ok(serde_json::to_string(self)?)
    }
}

/// OHLCV fields shared by the stream and the REST endpoint.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RawBar {
    /// Bar open in the exchange's native unit.
    pub t: i64,
    pub o: Decimal,
    pub h: Decimal,
    pub l: Decimal,
    pub c: Decimal,
    pub v: Decimal,
    #[serde(default)]
    pub synthetic: bool,
}

#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct CandleMessage {
    pub seq: u64,
    pub symbol: String,
    pub timeframe: String,
    #[serde(flatten)]
    pub bar: RawBar,
    #[serde(default)]
    pub closed: bool,
}

#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum InboundMessage {
    Candle(CandleMessage),
    Heartbeat {
        #[serde(default)]
        ts: Option<i64>,
    },
    Subscribed {
        channel: ChannelKind,
        #[serde(default)]
        symbols: Vec<String>,
    },
    Error {
        #[serde(default)]
        code: Option<i64>,
        message: String,
    },
}

impl InboundMessage {
    /// # Errors
    /// Returns an error if the text is not a recognised message.
    pub fn parse(text: &str) -> Result<Self, ProtocolError> {
        Ok(serde_json::from_str(text)?)
    }
}

/// Converts raw exchange bars into aligned [`Candle`]s for one exchange.
#[derive(Debug, Clone)]
pub struct Normalizer {
    exchange: String,
    unit: TimestampUnit,
}

impl Normalizer {
    pub fn new(exchange: impl Into<String>, unit: TimestampUnit) -> Self {
        Self {
            exchange: exchange.into(),
            unit,
        }
    }

    #[must_use]
    pub fn exchange(&self) -> &str {
        &self.exchange
    }

    #[must_use]
    pub const fn unit(&self) -> TimestampUnit {
        self.unit
    }

    /// Native timestamp to UTC instant.
    ///
    /// # Errors
    /// Returns an error if the value is out of the representable range.
    pub fn timestamp(&self, raw: i64) -> Result<DateTime<Utc>, ProtocolError> {
        let millis = match self.unit {
            TimestampUnit::Seconds => raw.checked_mul(1_000),
            TimestampUnit::Millis => Some(raw),
            TimestampUnit::Micros => Some(raw.div_euclid(1_000)),
            TimestampUnit::Nanos => Some(raw.div_euclid(1_000_000)),
        };
        millis
            .and_then(DateTime::from_timestamp_millis)
            .ok_or(ProtocolError::InvalidTimestamp(raw))
    }

    /// UTC instant to the native unit, for outbound REST queries.
    #[must_use]
    pub fn to_native(&self, instant: DateTime<Utc>) -> i64 {
        let millis = instant.timestamp_millis();
        match self.unit {
            TimestampUnit::Seconds => millis.div_euclid(1_000),
            TimestampUnit::Millis => millis,
            TimestampUnit::Micros => millis.saturating_mul(1_000),
            TimestampUnit::Nanos => millis.saturating_mul(1_000_000),
        }
    }

    /// # Errors
    /// Returns an error if the timestamp is out of range.
    pub fn bar(
        &self,
        symbol: &str,
        timeframe: Timeframe,
        bar: &RawBar,
    ) -> Result<Candle, ProtocolError> {
        let timestamp = timeframe.align(self.timestamp(bar.t)?);
        Ok(Candle {
            exchange: self.exchange.clone(),
            symbol: symbol.to_string(),
            timeframe,
            timestamp,
            open: bar.o,
            high: bar.h,
            low: bar.l,
            close: bar.c,
            volume: bar.v,
            is_synthetic: bar.synthetic,
        })
    }

    /// # Errors
    /// Returns an error if the timeframe is unknown or the timestamp is out of range.
    pub fn live(&self, message: &CandleMessage) -> Result<Candle, ProtocolError> {
        let timeframe: Timeframe = message.timeframe.parse()?;
        self.bar(&message.symbol, timeframe, &message.bar)
    }
}
