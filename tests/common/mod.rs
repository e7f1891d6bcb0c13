//! In-memory transport shared by the integration tests.
//!
//! `MockConnector` hands the client a socket whose other end is a
//! `ServerSide` the test drives directly: push frames, read what the client
//! wrote, drop it to simulate the server going away.

#![allow(dead_code)]

use async_trait::async_trait;
use resilient_session::{
    BackoffConfig, Connector, Frame, SessionError, Socket, TransportConfig,
};
use serde_json::Value;
use std::collections::VecDeque;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::{mpsc, watch};
use tokio::time::Instant;
use url::Url;

/// `{"type":"CHALLENGE"}` carrying base64("nonce").
pub const CHALLENGE: &str = r#"{"type":"CHALLENGE","data":{"payload":"bm9uY2U="}}"#;
pub const AUTHORIZED: &str = r#"{"type":"AUTHORIZED"}"#;

/// Install a tracing subscriber once; honours `RUST_LOG`.
pub fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("warn")),
        )
        .with_test_writer()
        .try_init();
}

/// Deterministic backoff for timing assertions.
pub fn fixed_backoff(base_ms: u64, max_exponent: u32) -> BackoffConfig {
    BackoffConfig {
        base_delay: Duration::from_millis(base_ms),
        max_exponent,
        jitter: false,
    }
}

pub fn transport_config(base_ms: u64) -> TransportConfig {
    TransportConfig {
        backoff: fixed_backoff(base_ms, 7),
        ..Default::default()
    }
}

/// Wait until the watched value satisfies `pred` and return it.
pub async fn wait_for<T: Clone>(rx: &mut watch::Receiver<T>, pred: impl FnMut(&T) -> bool) -> T {
    let value = rx.wait_for(pred).await.expect("status sender dropped");
    (*value).clone()
}

/// Let every runnable task finish its current work.
///
/// With time paused, the clock only moves once all tasks are idle, so a
/// short sleep returns after everything else has settled.
pub async fn settle() {
    tokio::time::sleep(Duration::from_millis(1)).await;
}

/// The server end of one mock socket.
pub struct ServerSide {
    pub url: Url,
    to_client: Option<mpsc::UnboundedSender<Result<Frame, SessionError>>>,
    from_client: mpsc::UnboundedReceiver<Frame>,
}

impl ServerSide {
    pub fn send(&self, text: &str) {
        if let Some(tx) = &self.to_client {
            let _ = tx.send(Ok(Frame::Text(text.to_string())));
        }
    }

    /// Make the client's next `recv` fail.
    pub fn fail(&self, message: &str) {
        if let Some(tx) = &self.to_client {
            let _ = tx.send(Err(SessionError::connection(message)));
        }
    }

    /// Close our end; the client sees a clean close.
    pub fn hang_up(&mut self) {
        self.to_client = None;
    }

    /// Next text frame from the client, or `None` once it closed the socket.
    pub async fn recv(&mut self) -> Option<String> {
        match self.from_client.recv().await? {
            Frame::Text(text) => Some(text),
            Frame::Binary(data) => Some(String::from_utf8_lossy(&data).into_owned()),
        }
    }

    /// Next frame from the client, parsed as JSON.
    pub async fn recv_json(&mut self) -> Value {
        let text = self.recv().await.expect("client closed the socket");
        serde_json::from_str(&text).expect("client sent invalid JSON")
    }

    /// Run the server half of the handshake. Returns the client's response.
    pub async fn authorize(&mut self) -> Value {
        self.send(CHALLENGE);
        let response = self.recv_json().await;
        assert_eq!(response["type"], "CHALLENGE_RESPONSE");
        self.send(AUTHORIZED);
        response
    }

    /// True once the client has dropped or closed its end.
    pub async fn closed_by_client(&mut self) -> bool {
        self.recv().await.is_none()
    }
}

/// Test-side handle receiving every socket the connector opens.
pub struct MockServer {
    accepted: mpsc::UnboundedReceiver<ServerSide>,
}

impl MockServer {
    pub async fn accept(&mut self) -> ServerSide {
        self.accepted.recv().await.expect("connector dropped")
    }
}

#[derive(Default)]
struct Script {
    failures: VecDeque<String>,
    attempts: Vec<Instant>,
}

/// A `Connector` that never touches the network.
pub struct MockConnector {
    accepted: mpsc::UnboundedSender<ServerSide>,
    script: Mutex<Script>,
}

impl MockConnector {
    pub fn new() -> (Arc<Self>, MockServer) {
        let (accepted, accepted_rx) = mpsc::unbounded_channel();
        let connector = Arc::new(Self {
            accepted,
            script: Mutex::new(Script::default()),
        });
        (connector, MockServer { accepted: accepted_rx })
    }

    /// Refuse the next `count` connection attempts.
    pub fn fail_next(&self, count: usize) {
        let mut script = self.script.lock().unwrap();
        for i in 0..count {
            script.failures.push_back(format!("connection refused ({})", i + 1));
        }
    }

    /// When each connection attempt was made.
    pub fn attempts(&self) -> Vec<Instant> {
        self.script.lock().unwrap().attempts.clone()
    }
}

#[async_trait]
impl Connector for MockConnector {
    async fn connect(&self, url: &Url) -> Result<Box<dyn Socket>, SessionError> {
        let refused = {
            let mut script = self.script.lock().unwrap();
            script.attempts.push(Instant::now());
            script.failures.pop_front()
        };
        if let Some(reason) = refused {
            return Err(SessionError::connection(reason));
        }

        let (to_client, inbound) = mpsc::unbounded_channel();
        let (outbound, from_client) = mpsc::unbounded_channel();

        self.accepted
            .send(ServerSide {
                url: url.clone(),
                to_client: Some(to_client),
                from_client,
            })
            .map_err(|_| SessionError::connection("mock server gone"))?;

        Ok(Box::new(MockSocket {
            inbound,
            outbound: Some(outbound),
        }))
    }
}

struct MockSocket {
    inbound: mpsc::UnboundedReceiver<Result<Frame, SessionError>>,
    outbound: Option<mpsc::UnboundedSender<Frame>>,
}

#[async_trait]
impl Socket for MockSocket {
    async fn send(&mut self, frame: Frame) -> Result<(), SessionError> {
        self.outbound
            .as_ref()
            .ok_or(SessionError::NotConnected)?
            .send(frame)
            .map_err(|_| SessionError::connection("mock peer gone"))
    }

    async fn recv(&mut self) -> Option<Result<Frame, SessionError>> {
        self.inbound.recv().await
    }

    async fn close(&mut self) {
        self.outbound = None;
        self.inbound.close();
    }
}
