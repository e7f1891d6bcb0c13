//! Authenticated WebSocket Session Module
//!
//! # Architecture
//!
//! Three layers, each owning exactly one kind of retry or state:
//!
//! | Module       | Responsibility                                        |
//! |--------------|-------------------------------------------------------|
//! | `socket`     | Open a WebSocket, move frames (swappable in tests)    |
//! | `transport`  | Reconnect with backoff, number attempts with epochs   |
//! | `protocol`   | JSON frames of the challenge-response handshake       |
//! | `auth`       | One authenticated connection on top of a transport    |
//! | `supervisor` | Many connections over time, outbound buffer, sleeping |
//! | `status`     | Status values published by `auth` and `supervisor`    |
//!
//! # Key Design Principles
//!
//! ## 1. One Owner Per Piece of State
//!
//! - The epoch counter belongs to the transport driver
//! - Handshake progress belongs to the connection driver
//! - The outbound buffer and session backoff belong to the supervisor driver
//! - Handles talk to drivers over channels; nothing else mutates their state
//!
//! ## 2. Epochs Instead of Cancellation
//!
//! - Every socket gets a fresh epoch; a dropped socket's epoch is never reused
//! - Work started on epoch E checks E after every wait
//! - `send_on(E, ..)` cannot reach any socket but E's
//!
//! ## 3. Failures Are Terminal Per Connection
//!
//! - An `AuthenticatedConnection` that failed stays failed
//! - Only the `ResilientSession` retries, always with a new connection
//!
//! # Usage
//!
//! ```ignore
//! use resilient_session::{Ed25519Identity, ResilientSession, SessionConfig};
//!
//! let session = ResilientSession::connect(
//!     SessionConfig::new("wss://relay.example.org/ws"),
//!     Arc::new(Ed25519Identity::generate()),
//! )?;
//!
//! session.send(r#"{"type":"PING"}"#)?;
//! while let Some(frame) = session.next_message().await {
//!     println!("{:?}", frame);
//! }
//! ```

mod auth;
mod protocol;
mod socket;
mod status;
mod supervisor;
mod transport;

pub use auth::AuthenticatedConnection;
pub use protocol::{
    decode_authorization, decode_challenge, encode_challenge_response, Challenge, ClientMessage,
};
pub use socket::{Connector, Frame, Socket, WsConnector, WsSocket};
pub use status::{CloseReason, ConnectingPhase, ConnectionStatus, SessionStatus, SleepCause};
pub use supervisor::ResilientSession;
pub use transport::{
    InboundFrame, TransportConfig, TransportSession, TransportState, TransportStatus,
};
