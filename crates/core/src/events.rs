use serde::{Deserialize, Serialize};

use crate::candle::VersionedCandle;

/// Notification that a closed candle was written, addressed to its publish channel.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ClosedCandle {
    /// `{tier}:{exchange}:{symbol}:{timeframe}:closed`
    pub channel: String,
    pub candle: VersionedCandle,
}
