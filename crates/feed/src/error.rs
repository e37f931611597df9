//! Error types for the streaming feed and REST reconciliation.

use std::time::Duration;

use candle_sync_core::ValidationError;
use candle_sync_data::StoreError;
use thiserror::Error;

/// A single inbound frame could not be understood. The frame is dropped.
#[derive(Debug, Error)]
pub enum ProtocolError {
    #[error("malformed message: {0}")]
    Json(#[from] serde_json::Error),

    #[error("timestamp {0} out of range")]
    InvalidTimestamp(i64),

    #[error("{0}")]
    Validation(#[from] ValidationError),
}

/// Transport-level failures. Always retried by the reconnect cycle.
#[derive(Debug, Error)]
pub enum TransportError {
    #[error("connection failed: {0}")]
    ConnectFailed(String),

    #[error("connection attempt timed out after {0:?}")]
    Timeout(Duration),

    #[error("websocket error: {0}")]
    WebSocket(#[from] tokio_tungstenite::tungstenite::Error),

    #[error("transport closed")]
    Closed,
}

/// Errors from the historical candle REST endpoint.
#[derive(Debug, Error)]
pub enum RestError {
    #[error("rate limited, retry after {retry_after:?}")]
    RateLimited { retry_after: Duration },

    #[error("API error: {status} - {message}")]
    Api { status: u16, message: String },

    #[error("network error: {0}")]
    Network(#[from] reqwest::Error),

    #[error("invalid URL: {0}")]
    Url(#[from] url::ParseError),

    #[error("bad candle in response: {0}")]
    Protocol(#[from] ProtocolError),
}

#[derive(Debug, Error)]
pub enum FeedError {
    /// Transport could not be established for the first connect.
    #[error("connection error: {0}")]
    Connection(#[from] TransportError),

    /// Subscribe handshake failed after exhausting its retry budget.
    #[error("subscribe handshake failed after {attempts} attempts: {reason}")]
    Handshake { attempts: u32, reason: String },

    /// Caller misuse, such as an empty symbol list.
    #[error(transparent)]
    Validation(#[from] ValidationError),

    #[error("store error: {0}")]
    Store(#[from] StoreError),

    #[error("rest error: {0}")]
    Rest(#[from] RestError),

    /// `disconnect()` was called before the connection came up.
    #[error("connect cancelled by disconnect")]
    Cancelled,
}
