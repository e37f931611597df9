//! Real-time candle ingestion.
//!
//! This crate provides:
//! - `ConnectionManager`, the reconnecting stream lifecycle
//! - `HeartbeatWatchdog` and `SequenceGapDetector` for liveness and loss detection
//! - `ReconciliationService`, REST backfill through the versioned write path
//! - Concrete transports: WebSocket streaming and the REST candle endpoint

pub mod backoff;
pub mod connection;
pub mod error;
pub mod gap;
pub mod protocol;
pub mod reconcile;
pub mod rest;
pub mod transport;
pub mod watchdog;
pub mod ws;

pub use backoff::Backoff;
pub use connection::{
    ConnectionEvent, ConnectionManager, ConnectionPhase, ConnectionState, DisconnectReason,
    FeedStats,
};
pub use error::{FeedError, ProtocolError, RestError, TransportError};
pub use gap::{GapFlags, SequenceGapDetector, SequenceObservation};
pub use protocol::{CandleMessage, ControlMessage, InboundMessage, Normalizer, RawBar};
pub use reconcile::{BackfillOutcome, BackfillReport, ReconciliationService};
pub use rest::{HistoricalCandleSource, RestCandleClient};
pub use transport::{Connector, Session, TransportEvent};
pub use watchdog::{ForceReconnect, HeartbeatWatchdog};
pub use ws::{WsConnector, WsSession};
