//! WebSocket transport over `tokio-tungstenite`.

use async_trait::async_trait;
use futures_util::stream::{SplitSink, SplitStream};
use futures_util::{SinkExt, StreamExt};
use std::time::Duration;
use tokio::net::TcpStream;
use tokio_tungstenite::{connect_async, tungstenite::Message, MaybeTlsStream, WebSocketStream};
use tracing::{debug, info};

use crate::error::TransportError;
use crate::transport::{Connector, Session, TransportEvent};

type WsStream = WebSocketStream<MaybeTlsStream<TcpStream>>;

#[derive(Debug, Clone)]
pub struct WsConnector {
    url: String,
    connect_timeout: Duration,
}

impl WsConnector {
    /// # Errors
    /// Returns an error if `url` is not a valid `ws://` or `wss://` URL.
    pub fn new(url: impl Into<String>, connect_timeout: Duration) -> Result<Self, TransportError> {
        let url = url.into();
        let parsed = url::Url::parse(&url)
            .map_err(|e| TransportError::ConnectFailed(format!("invalid url {url}: {e}")))?;
        if !matches!(parsed.scheme(), "ws" | "wss") {
            return Err(TransportError::ConnectFailed(format!(
                "unsupported scheme {} in {url}",
                parsed.scheme()
            )));
        }
        Ok(Self {
            url,
            connect_timeout,
        })
    }
}

#[async_trait]
impl Connector for WsConnector {
    async fn connect(&self) -> Result<Box<dyn Session>, TransportError> {
        info!(url = %self.url, "Connecting to candle stream");
        let (stream, _response) = tokio::time::timeout(self.connect_timeout, connect_async(&self.url))
            .await
            .map_err(|_| TransportError::Timeout(self.connect_timeout))?
            .map_err(|e| TransportError::ConnectFailed(e.to_string()))?;

        let (write, read) = stream.split();
        Ok(Box::new(WsSession { write, read }))
    }
}

pub struct WsSession {
    write: SplitSink<WsStream, Message>,
    read: SplitStream<WsStream>,
}

#[async_trait]
impl Session for WsSession {
    async fn send(&mut self, text: String) -> Result<(), TransportError> {
        debug!(message = %text, "Sending control message");
        self.write.send(Message::Text(text)).await?;
        Ok(())
    }

    async fn recv(&mut self) -> Result<TransportEvent, TransportError> {
        loop {
            let Some(frame) = self.read.next().await else {
                return Ok(TransportEvent::Closed(None));
            };
            match frame? {
                Message::Text(text) => return Ok(TransportEvent::Text(text)),
                Message::Binary(data) => match String::from_utf8(data) {
                    Ok(text) => return Ok(TransportEvent::Text(text)),
                    Err(_) => debug!("Ignoring non-UTF-8 binary frame"),
                },
                Message::Ping(data) => {
                    self.write.send(Message::Pong(data)).await?;
                    return Ok(TransportEvent::Liveness);
                }
                Message::Pong(_) => return Ok(TransportEvent::Liveness),
                Message::Close(frame) => {
                    return Ok(TransportEvent::Closed(frame.map(|f| f.reason.to_string())));
                }
                Message::Frame(_) => {}
            }
        }
    }

    async fn close(&mut self) {
        let _ = self.write.close().await;
    }
}
