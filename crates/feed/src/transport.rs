//! Abstract streaming transport the connection manager drives.

use async_trait::async_trait;

use crate::error::TransportError;

/// What one receive on a live session produced.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TransportEvent {
    /// A text frame to be parsed as a protocol message.
    Text(String),
    /// A frame that carries no payload but proves the peer is alive (ping/pong).
    Liveness,
    /// The peer closed the stream.
    Closed(Option<String>),
}

/// Opens physical connections to the feed.
#[async_trait]
pub trait Connector: Send + Sync + std::fmt::Debug {
    async fn connect(&self) -> Result<Box<dyn Session>, TransportError>;
}

/// One physical connection. Dropped sessions release their transport.
#[async_trait]
pub trait Session: Send {
    async fn send(&mut self, text: String) -> Result<(), TransportError>;

    /// Next inbound event. Must be cancel-safe: it is raced against shutdown and
    /// the watchdog.
    async fn recv(&mut self) -> Result<TransportEvent, TransportError>;

    async fn close(&mut self);
}
