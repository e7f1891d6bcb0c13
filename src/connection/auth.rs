//! Authenticated Connection
//!
//! Single responsibility: prove identity over one transport, once, then hand
//! out application frames.
//!
//! # Authentication Flow
//!
//! 1. **Wait for the transport** to report `Connected` on some epoch E
//! 2. **Challenge**: first frame on E must be a `CHALLENGE`; sign the nonce
//!    and answer with `CHALLENGE_RESPONSE` on E only
//! 3. **Authorization**: second frame on E must be `AUTHORIZED`
//! 4. **Connected**: from here on every frame on E goes to `message_events()`
//!
//! Handshake frames are consumed here and never reach `message_events()`.
//!
//! # Epoch Guard
//!
//! After every wait the handshake re-reads the transport epoch. If the
//! transport reconnected in the meantime, the attempt is dropped without
//! sending anything and the handshake starts over on the new socket. This is
//! not a failure and is never reported.
//!
//! # Failure
//!
//! A protocol error, or losing the transport after `Connected`, is terminal:
//! the failure latch fires, status becomes `CLOSED(CONNECTION_ERROR)` and the
//! transport is shut down. A clean close by the peer is reported as
//! `SessionError::ServerClosed`, a socket error as `SessionError::Connection`.
//! A failed connection is never reused; the supervisor builds a new one.

use std::future::Future;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};
use url::Url;

use super::protocol;
use super::socket::{Connector, Frame};
use super::status::{CloseReason, ConnectingPhase, ConnectionStatus};
use super::transport::{
    InboundFrame, TransportConfig, TransportSession, TransportState, TransportStatus,
};
use crate::error::{Result, SessionError};
use crate::identity::Identity;
use crate::notify::{self, Broadcaster, Latch, StatusCell, Subscription};

struct Shared {
    status: StatusCell<ConnectionStatus>,
    messages: Broadcaster<Frame>,
    failed: Latch<SessionError>,
    /// Epoch the handshake succeeded on
    epoch: AtomicU64,
}

/// One attempt at an authenticated session.
///
/// Created with [`AuthenticatedConnection::connect`]; starts working
/// immediately. Dropping it stops the handshake task and the transport.
pub struct AuthenticatedConnection {
    transport: Arc<TransportSession>,
    shared: Arc<Shared>,
    close_tx: watch::Sender<bool>,
    task: JoinHandle<()>,
}

impl AuthenticatedConnection {
    /// Open a connection to `url` as `identity`.
    ///
    /// The `client_id` query parameter is set from the identity, replacing
    /// any value already in the URL.
    pub fn connect(
        url: &str,
        identity: Arc<dyn Identity>,
        connector: Arc<dyn Connector>,
        config: TransportConfig,
    ) -> Result<Self> {
        let url = with_client_id(url, &identity.client_id())?;

        info!(url = %url, "Opening authenticated connection");

        let shared = Arc::new(Shared {
            status: StatusCell::new(ConnectionStatus::Connecting(
                ConnectingPhase::WaitingTransport,
            )),
            messages: Broadcaster::new(),
            failed: Latch::new(),
            epoch: AtomicU64::new(0),
        });

        let transport = Arc::new(TransportSession::start(url, connector, config));
        let frames = transport.message_events().subscribe();
        let (close_tx, close_rx) = watch::channel(false);

        let driver = Driver {
            transport: Arc::clone(&transport),
            identity,
            shared: Arc::clone(&shared),
            closed: close_rx,
        };
        let task = tokio::spawn(driver.run(frames));

        Ok(Self {
            transport,
            shared,
            close_tx,
            task,
        })
    }

    /// Send an application frame. Only valid while `CONNECTED`.
    pub async fn send(&self, text: impl Into<String>) -> Result<()> {
        if !self.status().is_connected() {
            return Err(SessionError::NotConnected);
        }
        let epoch = self.shared.epoch.load(Ordering::SeqCst);
        self.transport.send_on(epoch, text).await
    }

    /// Close the connection. Status becomes `CLOSED(CLIENT_CLOSED)`.
    pub fn close(&self) {
        self.close_tx.send_replace(true);
    }

    pub fn status(&self) -> ConnectionStatus {
        self.shared.status.get()
    }

    pub fn status_events(&self) -> &Broadcaster<ConnectionStatus> {
        self.shared.status.changes()
    }

    pub fn watch_status(&self) -> watch::Receiver<ConnectionStatus> {
        self.shared.status.watch()
    }

    pub fn message_events(&self) -> &Broadcaster<Frame> {
        &self.shared.messages
    }

    /// Resolves with the first frame emitted after this call.
    pub fn next_message(&self) -> impl Future<Output = Option<Frame>> + Send + 'static {
        notify::next(&self.shared.messages)
    }

    /// Application frames from now on, as a stream.
    pub fn messages(&self) -> impl futures_util::Stream<Item = Frame> + Send + 'static {
        notify::as_sequence(&self.shared.messages)
    }

    /// Fires once, with the error that ended this connection.
    pub fn on_fail(&self) -> &Latch<SessionError> {
        &self.shared.failed
    }

    pub fn has_failed(&self) -> bool {
        self.shared.failed.has_fired()
    }

    pub fn is_closed(&self) -> bool {
        self.status().is_closed()
    }

    pub fn url(&self) -> &Url {
        self.transport.url()
    }

    /// The transport underneath, for diagnostics.
    pub fn transport(&self) -> &TransportSession {
        &self.transport
    }
}

impl Drop for AuthenticatedConnection {
    fn drop(&mut self) {
        self.task.abort();
        self.transport.close();
    }
}

/// Set (not append) the `client_id` query parameter.
fn with_client_id(url: &str, client_id: &str) -> Result<Url> {
    let mut url = Url::parse(url)?;
    let kept: Vec<(String, String)> = url
        .query_pairs()
        .filter(|(key, _)| key != "client_id")
        .map(|(key, value)| (key.into_owned(), value.into_owned()))
        .collect();
    url.query_pairs_mut()
        .clear()
        .extend_pairs(kept)
        .append_pair("client_id", client_id);
    Ok(url)
}

/// Resolves once `close()` was called.
async fn close_requested(closed: &mut watch::Receiver<bool>) {
    let _ = closed.wait_for(|closed| *closed).await;
}

/// Runs the handshake, then forwards frames. Owns all handshake state.
struct Driver {
    transport: Arc<TransportSession>,
    identity: Arc<dyn Identity>,
    shared: Arc<Shared>,
    closed: watch::Receiver<bool>,
}

impl Driver {
    async fn run(mut self, mut frames: Subscription<InboundFrame>) {
        let mut state = self.transport.watch_state();

        let outcome = match self.authenticate(&mut state, &mut frames).await {
            Ok(epoch) => {
                self.shared.epoch.store(epoch, Ordering::SeqCst);
                info!(url = %self.transport.url(), epoch = epoch, "Authenticated");
                self.set_status(ConnectionStatus::Connected);
                self.forward(epoch, &mut frames).await
            }
            Err(e) => e,
        };

        self.transport.close();

        match outcome {
            SessionError::ClientClosed => {
                debug!(url = %self.transport.url(), "Connection closed by client");
                self.set_status(ConnectionStatus::Closed(CloseReason::ClientClosed));
            }
            e => {
                if e.is_handshake_failure() {
                    error!(url = %self.transport.url(), error = %e, "Handshake rejected");
                } else if e == SessionError::ServerClosed {
                    info!(url = %self.transport.url(), "Connection closed by server");
                } else {
                    warn!(url = %self.transport.url(), error = %e, "Connection lost");
                }
                self.set_status(ConnectionStatus::Closed(CloseReason::ConnectionError(e.clone())));
                self.shared.failed.trigger(e);
            }
        }
    }

    /// Handshake until it succeeds on some epoch, restarting whenever the
    /// transport moves to a new one.
    async fn authenticate(
        &mut self,
        state: &mut watch::Receiver<TransportState>,
        frames: &mut Subscription<InboundFrame>,
    ) -> Result<u64> {
        loop {
            self.set_status(ConnectionStatus::Connecting(ConnectingPhase::WaitingTransport));
            let epoch = self.wait_for_transport(state).await?;

            match self.handshake(epoch, state, frames).await {
                Ok(()) => return Ok(epoch),
                Err(e) if e.is_stale() => {
                    debug!(error = %e, "Transport reconnected mid-handshake, starting over");
                }
                Err(e) => return Err(e),
            }
        }
    }

    async fn wait_for_transport(
        &mut self,
        state: &mut watch::Receiver<TransportState>,
    ) -> Result<u64> {
        loop {
            let current = state.borrow_and_update().clone();
            match current.status {
                TransportStatus::Connected => return Ok(current.epoch),
                TransportStatus::Closed => return Err(SessionError::ClientClosed),
                _ => {}
            }

            tokio::select! {
                biased;
                _ = close_requested(&mut self.closed) => return Err(SessionError::ClientClosed),
                changed = state.changed() => {
                    if changed.is_err() {
                        return Err(SessionError::connection("Transport stopped"));
                    }
                }
            }
        }
    }

    async fn handshake(
        &mut self,
        epoch: u64,
        state: &mut watch::Receiver<TransportState>,
        frames: &mut Subscription<InboundFrame>,
    ) -> Result<()> {
        self.set_status(ConnectionStatus::Connecting(ConnectingPhase::AwaitingChallenge));
        let first = self.next_frame(epoch, state, frames).await?;
        let challenge = protocol::decode_challenge(first.as_text())?;

        let response = protocol::encode_challenge_response(&challenge, self.identity.as_ref())?;
        match self.transport.send_on(epoch, response).await {
            Ok(()) => {}
            Err(SessionError::ClientClosed) => return Err(SessionError::ClientClosed),
            Err(e) if e.is_stale() => return Err(e),
            // A failed write takes the socket down with it.
            Err(e) => {
                debug!(epoch = epoch, error = %e, "Challenge response not delivered");
                return Err(SessionError::StaleEpoch {
                    started: epoch,
                    current: epoch + 1,
                });
            }
        }

        self.set_status(ConnectionStatus::Connecting(ConnectingPhase::AwaitingAuthorization));
        let second = self.next_frame(epoch, state, frames).await?;
        protocol::decode_authorization(second.as_text())?;

        self.guard(epoch)
    }

    /// Next frame on `epoch`, or `StaleEpoch` once the transport moved on.
    async fn next_frame(
        &mut self,
        epoch: u64,
        state: &mut watch::Receiver<TransportState>,
        frames: &mut Subscription<InboundFrame>,
    ) -> Result<Frame> {
        loop {
            tokio::select! {
                biased;
                _ = close_requested(&mut self.closed) => return Err(SessionError::ClientClosed),
                inbound = frames.recv() => match inbound {
                    None => return Err(SessionError::connection("Transport stopped")),
                    // Leftovers from a socket that is already gone.
                    Some(inbound) if inbound.epoch < epoch => continue,
                    Some(inbound) if inbound.epoch > epoch => {
                        return Err(SessionError::StaleEpoch {
                            started: epoch,
                            current: inbound.epoch,
                        });
                    }
                    Some(inbound) => {
                        self.guard(epoch)?;
                        return Ok(inbound.frame);
                    }
                },
                changed = state.changed() => {
                    if changed.is_err() {
                        return Err(SessionError::connection("Transport stopped"));
                    }
                    let current = state.borrow_and_update().clone();
                    if current.status == TransportStatus::Closed {
                        return Err(SessionError::ClientClosed);
                    }
                    if current.epoch != epoch {
                        return Err(SessionError::StaleEpoch {
                            started: epoch,
                            current: current.epoch,
                        });
                    }
                }
            }
        }
    }

    /// Forward frames on `epoch` until the connection ends. Returns why.
    ///
    /// Follows every transport transition rather than the latest state, so
    /// the error that took the socket down is not lost to a quick reconnect.
    async fn forward(
        &mut self,
        epoch: u64,
        frames: &mut Subscription<InboundFrame>,
    ) -> SessionError {
        let mut transitions = self.transport.status_events().subscribe();
        if self.transport.epoch() != epoch {
            return SessionError::connection("Connection lost during authorization");
        }

        loop {
            tokio::select! {
                biased;
                _ = close_requested(&mut self.closed) => return SessionError::ClientClosed,
                inbound = frames.recv() => match inbound {
                    None => return SessionError::connection("Transport stopped"),
                    Some(inbound) if inbound.epoch == epoch => {
                        self.shared.messages.emit(inbound.frame);
                    }
                    Some(_) => {}
                },
                transition = transitions.recv() => match transition {
                    None => return SessionError::connection("Transport stopped"),
                    Some(state) if state.epoch != epoch => {
                        return match state.status {
                            TransportStatus::Failed(e) => e,
                            _ => SessionError::ServerClosed,
                        };
                    }
                    Some(_) => {}
                },
            }
        }
    }

    fn guard(&self, epoch: u64) -> Result<()> {
        let current = self.transport.epoch();
        if current != epoch {
            return Err(SessionError::StaleEpoch {
                started: epoch,
                current,
            });
        }
        Ok(())
    }

    fn set_status(&self, status: ConnectionStatus) {
        debug!(url = %self.transport.url(), status = ?status, "Connection status");
        self.shared.status.set(status);
    }
}
