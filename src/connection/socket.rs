//! Socket Layer
//!
//! Single responsibility: open a WebSocket-class connection and move frames.
//! No knowledge of epochs, backoff or authentication.
//!
//! Everything above this layer talks to a `dyn Connector`, so tests can
//! substitute an in-memory transport for the real network.

use async_trait::async_trait;
use futures_util::{
    stream::{SplitSink, SplitStream},
    SinkExt, StreamExt,
};
use tokio_tungstenite::{
    connect_async_with_config, tungstenite::protocol::Message, MaybeTlsStream, WebSocketStream,
};
use tracing::debug;
use url::Url;

use crate::error::{Result, SessionError};

/// One message on the wire.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Frame {
    Text(String),
    Binary(Vec<u8>),
}

impl Frame {
    pub fn as_text(&self) -> Option<&str> {
        match self {
            Frame::Text(text) => Some(text),
            Frame::Binary(_) => None,
        }
    }
}

impl From<String> for Frame {
    fn from(text: String) -> Self {
        Frame::Text(text)
    }
}

impl From<&str> for Frame {
    fn from(text: &str) -> Self {
        Frame::Text(text.to_string())
    }
}

/// An open connection.
#[async_trait]
pub trait Socket: Send {
    async fn send(&mut self, frame: Frame) -> Result<()>;

    /// Next inbound frame. `None` means the peer closed cleanly.
    ///
    /// Must be cancel safe: the transport drops a pending `recv` whenever it
    /// has something to send.
    async fn recv(&mut self) -> Option<Result<Frame>>;

    async fn close(&mut self);
}

/// Opens sockets. Injected into the transport session.
#[async_trait]
pub trait Connector: Send + Sync + 'static {
    async fn connect(&self, url: &Url) -> Result<Box<dyn Socket>>;
}

type WsSink = SplitSink<WebSocketStream<MaybeTlsStream<tokio::net::TcpStream>>, Message>;
type WsStream = SplitStream<WebSocketStream<MaybeTlsStream<tokio::net::TcpStream>>>;

/// Production connector over `tokio-tungstenite`.
#[derive(Debug, Clone, Copy, Default)]
pub struct WsConnector;

#[async_trait]
impl Connector for WsConnector {
    async fn connect(&self, url: &Url) -> Result<Box<dyn Socket>> {
        debug!(url = %url, "Connecting to WebSocket");

        let (ws, _) = connect_async_with_config(url.as_str(), None, false)
            .await
            .map_err(|e| SessionError::connection(format!("WebSocket connect failed: {}", e)))?;

        let (sink, stream) = ws.split();

        debug!(url = %url, "WebSocket connected");
        Ok(Box::new(WsSocket { sink, stream }))
    }
}

/// A connected WebSocket.
pub struct WsSocket {
    sink: WsSink,
    stream: WsStream,
}

#[async_trait]
impl Socket for WsSocket {
    async fn send(&mut self, frame: Frame) -> Result<()> {
        let message = match frame {
            Frame::Text(text) => Message::Text(text),
            Frame::Binary(data) => Message::Binary(data),
        };
        self.sink
            .send(message)
            .await
            .map_err(|e| SessionError::connection(format!("Failed to send: {}", e)))
    }

    async fn recv(&mut self) -> Option<Result<Frame>> {
        loop {
            match self.stream.next().await {
                Some(Ok(Message::Text(text))) => return Some(Ok(Frame::Text(text))),
                Some(Ok(Message::Binary(data))) => return Some(Ok(Frame::Binary(data))),
                Some(Ok(Message::Close(_))) => return None,
                // Pong is handled automatically by tungstenite
                Some(Ok(_)) => continue,
                Some(Err(e)) => {
                    return Some(Err(SessionError::connection(format!(
                        "WebSocket error: {}",
                        e
                    ))))
                }
                None => return None,
            }
        }
    }

    async fn close(&mut self) {
        if let Err(e) = self.sink.close().await {
            debug!(error = %e, "WebSocket close failed");
        }
    }
}
