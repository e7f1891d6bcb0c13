//! Resilient Session
//!
//! Single responsibility: one long-lived session over any number of
//! short-lived authenticated connections.
//!
//! # Lifecycle
//!
//! ```text
//!   ┌──────────────────────────────────────────────────────┐
//!   ▼                                                      │
//! new AuthenticatedConnection ── CONNECTED ── flush buffer │
//!   │                                │                     │
//!   └──────── CLOSED / failure ──────┴── SLEEPING(resume_at) ┘
//! ```
//!
//! The connection's status is re-published here unchanged, plus `SLEEPING`
//! while waiting out the backoff. Application frames from every connection
//! appear on one `message_events()` broadcaster.
//!
//! # Outbound buffer
//!
//! `send` never fails while the session runs. Payloads go to the live
//! connection when there is one and to the buffer otherwise. The buffer is
//! flushed in insertion order on every `CONNECTED`; a payload leaves the
//! buffer only once the socket has accepted it, so nothing is dropped or
//! written twice across reconnects.

use chrono::Utc;
use std::collections::VecDeque;
use std::future::Future;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use super::auth::AuthenticatedConnection;
use super::socket::{Connector, Frame, WsConnector};
use super::status::{CloseReason, ConnectionStatus, SessionStatus, SleepCause};
use super::transport::TransportConfig;
use crate::backoff::Backoff;
use crate::config::SessionConfig;
use crate::error::{Result, SessionError};
use crate::identity::Identity;
use crate::notify::{self, Broadcaster, StatusCell};

enum Command {
    Send(String),
    Close,
}

struct Shared {
    status: StatusCell<SessionStatus>,
    messages: Broadcaster<Frame>,
    buffered: AtomicUsize,
    closed: AtomicBool,
}

/// A session that keeps reconnecting until closed.
pub struct ResilientSession {
    url: String,
    shared: Arc<Shared>,
    commands: mpsc::UnboundedSender<Command>,
    task: JoinHandle<()>,
}

impl ResilientSession {
    /// Start the session. The first connection is opened right away.
    pub fn start(
        config: SessionConfig,
        identity: Arc<dyn Identity>,
        connector: Arc<dyn Connector>,
    ) -> Result<Self> {
        config.validate()?;

        let shared = Arc::new(Shared {
            status: StatusCell::new(SessionStatus::Pending),
            messages: Broadcaster::new(),
            buffered: AtomicUsize::new(0),
            closed: AtomicBool::new(false),
        });

        let (commands, command_rx) = mpsc::unbounded_channel();

        let driver = Driver {
            url: config.url.clone(),
            transport: config.transport_config(),
            identity,
            connector,
            shared: Arc::clone(&shared),
            commands: command_rx,
            backoff: Backoff::new(config.session_backoff.clone()),
            buffer: VecDeque::new(),
        };

        info!(url = %config.url, "Starting resilient session");
        let task = tokio::spawn(driver.run());

        Ok(Self {
            url: config.url,
            shared,
            commands,
            task,
        })
    }

    /// Start over real WebSockets.
    pub fn connect(config: SessionConfig, identity: Arc<dyn Identity>) -> Result<Self> {
        Self::start(config, identity, Arc::new(WsConnector))
    }

    /// Send now if connected, otherwise once the next connection is up.
    pub fn send(&self, text: impl Into<String>) -> Result<()> {
        if self.is_closed() {
            return Err(SessionError::ClientClosed);
        }
        self.commands
            .send(Command::Send(text.into()))
            .map_err(|_| SessionError::ClientClosed)
    }

    /// Close the live connection and stop reconnecting. Buffered payloads
    /// are discarded.
    pub fn close(&self) {
        if !self.shared.closed.swap(true, Ordering::SeqCst) {
            debug!(url = %self.url, "Closing resilient session");
            let _ = self.commands.send(Command::Close);
        }
    }

    pub fn is_closed(&self) -> bool {
        self.shared.closed.load(Ordering::SeqCst)
    }

    pub fn status(&self) -> SessionStatus {
        self.shared.status.get()
    }

    pub fn status_events(&self) -> &Broadcaster<SessionStatus> {
        self.shared.status.changes()
    }

    pub fn watch_status(&self) -> watch::Receiver<SessionStatus> {
        self.shared.status.watch()
    }

    pub fn message_events(&self) -> &Broadcaster<Frame> {
        &self.shared.messages
    }

    /// Resolves with the first frame emitted after this call.
    pub fn next_message(&self) -> impl Future<Output = Option<Frame>> + Send + 'static {
        notify::next(&self.shared.messages)
    }

    pub fn messages(&self) -> impl futures_util::Stream<Item = Frame> + Send + 'static {
        notify::as_sequence(&self.shared.messages)
    }

    /// Payloads waiting for a connection, as of the driver's last update.
    pub fn buffered_len(&self) -> usize {
        self.shared.buffered.load(Ordering::SeqCst)
    }

    pub fn url(&self) -> &str {
        &self.url
    }
}

impl Drop for ResilientSession {
    fn drop(&mut self) {
        self.task.abort();
    }
}

/// Owns the outbound buffer, the session backoff and the live connection.
struct Driver {
    url: String,
    transport: TransportConfig,
    identity: Arc<dyn Identity>,
    connector: Arc<dyn Connector>,
    shared: Arc<Shared>,
    commands: mpsc::UnboundedReceiver<Command>,
    backoff: Backoff,
    buffer: VecDeque<String>,
}

impl Driver {
    async fn run(mut self) {
        loop {
            let opened = AuthenticatedConnection::connect(
                &self.url,
                Arc::clone(&self.identity),
                Arc::clone(&self.connector),
                self.transport.clone(),
            );

            let cause = match opened {
                Ok(connection) => match self.supervise(&connection).await {
                    Some(cause) => cause,
                    None => {
                        connection.close();
                        break;
                    }
                },
                Err(e) => SleepCause::Error(e),
            };

            if !self.sleep(cause).await {
                break;
            }
        }

        self.buffer.clear();
        self.shared.buffered.store(0, Ordering::SeqCst);
        self.publish(SessionStatus::Closed(CloseReason::ClientClosed));
        debug!(url = %self.url, "Resilient session stopped");
    }

    /// Follow one connection until it ends. `None` means the session was
    /// closed.
    async fn supervise(&mut self, connection: &AuthenticatedConnection) -> Option<SleepCause> {
        let mut status = connection.watch_status();
        let mut messages = connection.message_events().subscribe();
        let failed = connection.on_fail().wait();
        tokio::pin!(failed);

        let initial = status.borrow_and_update().clone();
        if let Some(cause) = self.follow(connection, initial).await {
            return Some(cause);
        }

        loop {
            tokio::select! {
                biased;
                command = self.commands.recv() => match command {
                    Some(Command::Send(text)) => {
                        self.enqueue(text);
                        if connection.status().is_connected() {
                            self.flush(connection).await;
                        }
                    }
                    Some(Command::Close) | None => return None,
                },
                Some(frame) = messages.recv() => {
                    self.shared.messages.emit(frame);
                }
                changed = status.changed() => {
                    if changed.is_err() {
                        let stopped = SessionError::connection("Connection stopped");
                        return Some(SleepCause::Error(stopped));
                    }
                    let current = status.borrow_and_update().clone();
                    if let Some(cause) = self.follow(connection, current).await {
                        return Some(cause);
                    }
                }
                error = &mut failed => return Some(error.into()),
            }
        }
    }

    /// Re-publish a connection status and react to it.
    async fn follow(
        &mut self,
        connection: &AuthenticatedConnection,
        status: ConnectionStatus,
    ) -> Option<SleepCause> {
        self.publish(status.clone().into());
        match status {
            ConnectionStatus::Connected => {
                self.backoff.reset();
                info!(url = %self.url, buffered = self.buffer.len(), "Session connected");
                self.flush(connection).await;
                None
            }
            ConnectionStatus::Closed(reason) => Some(reason.into()),
            _ => None,
        }
    }

    fn enqueue(&mut self, text: String) {
        self.buffer.push_back(text);
        self.shared.buffered.store(self.buffer.len(), Ordering::SeqCst);
    }

    /// Write buffered payloads in order, dropping each once accepted.
    async fn flush(&mut self, connection: &AuthenticatedConnection) {
        if self.buffer.is_empty() {
            return;
        }
        debug!(url = %self.url, count = self.buffer.len(), "Flushing outbound buffer");

        while let Some(payload) = self.buffer.front() {
            match connection.send(payload.clone()).await {
                Ok(()) => {
                    self.buffer.pop_front();
                }
                Err(e) => {
                    warn!(
                        url = %self.url,
                        error = %e,
                        remaining = self.buffer.len(),
                        "Flush interrupted, keeping remaining payloads"
                    );
                    break;
                }
            }
        }

        self.shared.buffered.store(self.buffer.len(), Ordering::SeqCst);
    }

    /// Wait out the backoff, buffering sends. Returns false if closed.
    async fn sleep(&mut self, cause: SleepCause) -> bool {
        let delay = self.backoff.delay();
        self.backoff.record_failure();

        let resume_at = Utc::now()
            + chrono::Duration::from_std(delay).unwrap_or_else(|_| chrono::Duration::zero());

        match &cause {
            SleepCause::Error(e) => warn!(
                url = %self.url,
                error = %e,
                delay_ms = delay.as_millis() as u64,
                "Connection failed, reconnecting after backoff"
            ),
            SleepCause::Closed => debug!(
                url = %self.url,
                delay_ms = delay.as_millis() as u64,
                "Connection closed, reconnecting after backoff"
            ),
        }
        self.publish(SessionStatus::Sleeping { resume_at, cause });

        let timer = tokio::time::sleep(delay);
        tokio::pin!(timer);

        loop {
            tokio::select! {
                biased;
                command = self.commands.recv() => match command {
                    Some(Command::Send(text)) => self.enqueue(text),
                    Some(Command::Close) | None => return false,
                },
                _ = &mut timer => return true,
            }
        }
    }

    fn publish(&self, status: SessionStatus) {
        debug!(url = %self.url, status = ?status, "Session status");
        self.shared.status.set(status);
    }
}
