//! Transport Session
//!
//! Single responsibility: keep a socket open, forever, until told to stop.
//!
//! # State Machine
//!
//! ```text
//! PENDING → CONNECTING → CONNECTED → {DISCONNECTED | FAILED} → CONNECTING → …
//!                                                   close() → CLOSED
//! ```
//!
//! # Epochs
//!
//! Every physical attempt gets an epoch number. The epoch is bumped the
//! moment a socket drops (or fails to open), before the next attempt is
//! scheduled, and is never reused. Inbound frames carry the epoch they
//! arrived on, and `send_on(epoch, ..)` refuses to write to any socket but
//! the one that epoch names. That is how higher layers discard work started
//! against a connection that no longer exists.
//!
//! # Outbound frames
//!
//! There is no queue at this layer. `send` while no socket is open fails
//! with `NotConnected`; buffering across reconnects is the supervisor's job.

use chrono::{DateTime, Utc};
use std::future::Future;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, oneshot, watch};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};
use url::Url;

use super::socket::{Connector, Frame, Socket};
use crate::backoff::{Backoff, BackoffConfig};
use crate::error::{Result, SessionError};
use crate::notify::{self, Broadcaster, StatusCell};

/// Configuration for a transport session.
#[derive(Debug, Clone)]
pub struct TransportConfig {
    /// Reconnect backoff
    pub backoff: BackoffConfig,
}

impl Default for TransportConfig {
    fn default() -> Self {
        Self {
            backoff: BackoffConfig::transport(),
        }
    }
}

/// Raw connection status.
#[derive(Debug, Clone, PartialEq)]
pub enum TransportStatus {
    Pending,
    Connecting,
    Connected,
    /// Peer closed the socket.
    Disconnected,
    /// Socket failed to open or errored.
    Failed(SessionError),
    /// `close()` was called. Terminal.
    Closed,
}

/// A status together with the epoch it applies to.
#[derive(Debug, Clone, PartialEq)]
pub struct TransportState {
    pub status: TransportStatus,
    pub epoch: u64,
}

/// A frame tagged with the epoch of the socket it arrived on.
#[derive(Debug, Clone, PartialEq)]
pub struct InboundFrame {
    pub epoch: u64,
    pub frame: Frame,
}

#[derive(Debug, Clone, Copy, Default)]
struct Timing {
    next_connection_at: Option<DateTime<Utc>>,
    connection_started_at: Option<DateTime<Utc>>,
}

enum Command {
    Send {
        epoch: Option<u64>,
        frame: Frame,
        reply: oneshot::Sender<Result<()>>,
    },
    Close,
}

struct Shared {
    state: StatusCell<TransportState>,
    messages: Broadcaster<InboundFrame>,
    timing: watch::Sender<Timing>,
    closed: AtomicBool,
}

/// A self-reconnecting socket.
///
/// All socket state lives in one driver task; this handle only sends it
/// commands and reads what it publishes. Dropping the handle stops the task.
pub struct TransportSession {
    url: Url,
    shared: Arc<Shared>,
    commands: mpsc::UnboundedSender<Command>,
    task: JoinHandle<()>,
}

impl TransportSession {
    /// Start connecting to `url`. Returns immediately; the first attempt
    /// runs after a jittered initial delay.
    pub fn start(url: Url, connector: Arc<dyn Connector>, config: TransportConfig) -> Self {
        let (timing, _) = watch::channel(Timing::default());
        let shared = Arc::new(Shared {
            state: StatusCell::new(TransportState {
                status: TransportStatus::Pending,
                epoch: 0,
            }),
            messages: Broadcaster::new(),
            timing,
            closed: AtomicBool::new(false),
        });

        let (commands, command_rx) = mpsc::unbounded_channel();

        let driver = Driver {
            url: url.clone(),
            connector,
            shared: Arc::clone(&shared),
            commands: command_rx,
            backoff: Backoff::new(config.backoff),
            epoch: 0,
        };
        let task = tokio::spawn(driver.run());

        Self {
            url,
            shared,
            commands,
            task,
        }
    }

    /// Send on whatever socket is currently open.
    pub async fn send(&self, text: impl Into<String>) -> Result<()> {
        self.request(None, Frame::Text(text.into())).await
    }

    /// Send only if `epoch` is still the live socket.
    pub async fn send_on(&self, epoch: u64, text: impl Into<String>) -> Result<()> {
        self.request(Some(epoch), Frame::Text(text.into())).await
    }

    async fn request(&self, epoch: Option<u64>, frame: Frame) -> Result<()> {
        if self.is_closed() {
            return Err(SessionError::ClientClosed);
        }
        let (reply, response) = oneshot::channel();
        self.commands
            .send(Command::Send {
                epoch,
                frame,
                reply,
            })
            .map_err(|_| SessionError::ClientClosed)?;
        response.await.map_err(|_| SessionError::ClientClosed)?
    }

    /// Close the socket and stop reconnecting.
    pub fn close(&self) {
        if !self.shared.closed.swap(true, Ordering::SeqCst) {
            debug!(url = %self.url, "Closing transport session");
            let _ = self.commands.send(Command::Close);
        }
    }

    pub fn is_closed(&self) -> bool {
        self.shared.closed.load(Ordering::SeqCst)
    }

    pub fn state(&self) -> TransportState {
        self.shared.state.get()
    }

    pub fn status(&self) -> TransportStatus {
        self.state().status
    }

    /// Current connection epoch.
    pub fn epoch(&self) -> u64 {
        self.state().epoch
    }

    /// When the pending reconnect is expected to fire, while waiting on backoff.
    pub fn next_connection_at(&self) -> Option<DateTime<Utc>> {
        self.shared.timing.borrow().next_connection_at
    }

    /// When the current open attempt started.
    pub fn connection_started_at(&self) -> Option<DateTime<Utc>> {
        self.shared.timing.borrow().connection_started_at
    }

    pub fn url(&self) -> &Url {
        &self.url
    }

    pub fn message_events(&self) -> &Broadcaster<InboundFrame> {
        &self.shared.messages
    }

    pub fn status_events(&self) -> &Broadcaster<TransportState> {
        self.shared.state.changes()
    }

    pub fn watch_state(&self) -> watch::Receiver<TransportState> {
        self.shared.state.watch()
    }

    /// Resolves with the first frame emitted after this call.
    pub fn next_message(&self) -> impl Future<Output = Option<InboundFrame>> + Send + 'static {
        notify::next(&self.shared.messages)
    }
}

impl Drop for TransportSession {
    fn drop(&mut self) {
        self.task.abort();
    }
}

/// Owns the socket, the epoch counter and the backoff counter.
struct Driver {
    url: Url,
    connector: Arc<dyn Connector>,
    shared: Arc<Shared>,
    commands: mpsc::UnboundedReceiver<Command>,
    backoff: Backoff,
    epoch: u64,
}

impl Driver {
    async fn run(mut self) {
        loop {
            let delay = self.backoff.delay();
            self.publish(TransportStatus::Connecting);
            self.shared.timing.send_replace(Timing {
                next_connection_at: Some(Utc::now() + to_chrono(delay)),
                connection_started_at: None,
            });
            debug!(
                url = %self.url,
                epoch = self.epoch,
                delay_ms = delay.as_millis() as u64,
                exponent = self.backoff.exponent(),
                "Scheduling connection attempt"
            );

            if idle_until(&mut self.commands, self.epoch, tokio::time::sleep(delay))
                .await
                .is_none()
            {
                break;
            }

            self.shared.timing.send_replace(Timing {
                next_connection_at: None,
                connection_started_at: Some(Utc::now()),
            });

            let connector = Arc::clone(&self.connector);
            let url = self.url.clone();
            let opened = idle_until(&mut self.commands, self.epoch, async move {
                connector.connect(&url).await
            })
            .await;

            let status = match opened {
                None => break,
                Some(Ok(socket)) => {
                    self.backoff.reset();
                    info!(url = %self.url, epoch = self.epoch, "Transport connected");
                    self.publish(TransportStatus::Connected);

                    match self.pump(socket).await {
                        Some(status) => status,
                        None => break,
                    }
                }
                Some(Err(e)) => {
                    warn!(
                        url = %self.url,
                        epoch = self.epoch,
                        error = %e,
                        "Transport failed to open"
                    );
                    TransportStatus::Failed(e)
                }
            };

            self.epoch += 1;
            self.backoff.record_failure();
            self.publish(status);
        }

        self.epoch += 1;
        self.shared.timing.send_replace(Timing::default());
        self.publish(TransportStatus::Closed);
        debug!(url = %self.url, "Transport session stopped");
    }

    /// Move frames until the socket drops (`Some(status)`) or `close()`
    /// is requested (`None`).
    async fn pump(&mut self, mut socket: Box<dyn Socket>) -> Option<TransportStatus> {
        loop {
            tokio::select! {
                inbound = socket.recv() => match inbound {
                    Some(Ok(frame)) => {
                        self.shared.messages.emit(InboundFrame { epoch: self.epoch, frame });
                    }
                    Some(Err(e)) => {
                        warn!(url = %self.url, epoch = self.epoch, error = %e, "Transport error");
                        return Some(TransportStatus::Failed(e));
                    }
                    None => {
                        info!(url = %self.url, epoch = self.epoch, "Transport closed by peer");
                        return Some(TransportStatus::Disconnected);
                    }
                },
                command = self.commands.recv() => match command {
                    Some(Command::Send { epoch, frame, reply }) => {
                        if let Some(started) = epoch.filter(|e| *e != self.epoch) {
                            let _ = reply.send(Err(SessionError::StaleEpoch {
                                started,
                                current: self.epoch,
                            }));
                            continue;
                        }
                        match socket.send(frame).await {
                            Ok(()) => {
                                let _ = reply.send(Ok(()));
                            }
                            Err(e) => {
                                warn!(
                                    url = %self.url,
                                    epoch = self.epoch,
                                    error = %e,
                                    "Transport send failed"
                                );
                                let _ = reply.send(Err(e.clone()));
                                return Some(TransportStatus::Failed(e));
                            }
                        }
                    }
                    Some(Command::Close) | None => {
                        socket.close().await;
                        return None;
                    }
                },
            }
        }
    }

    fn publish(&self, status: TransportStatus) {
        self.shared.state.set(TransportState {
            status,
            epoch: self.epoch,
        });
    }
}

/// Drive `fut` to completion while no socket is open, refusing sends.
///
/// Returns `None` if `close()` arrives first.
async fn idle_until<F: Future>(
    commands: &mut mpsc::UnboundedReceiver<Command>,
    epoch: u64,
    fut: F,
) -> Option<F::Output> {
    tokio::pin!(fut);
    loop {
        tokio::select! {
            output = &mut fut => return Some(output),
            command = commands.recv() => match command {
                Some(Command::Send { epoch: requested, reply, .. }) => {
                    let _ = reply.send(Err(match requested {
                        Some(started) if started != epoch => {
                            SessionError::StaleEpoch { started, current: epoch }
                        }
                        _ => SessionError::NotConnected,
                    }));
                }
                Some(Command::Close) | None => return None,
            },
        }
    }
}

fn to_chrono(delay: Duration) -> chrono::Duration {
    chrono::Duration::from_std(delay).unwrap_or_else(|_| chrono::Duration::zero())
}
