//! Resilient Session - authenticated, self-healing WebSocket sessions
//!
//! A client proves its identity to a server by signing a challenge, then
//! exchanges opaque application frames. Sockets drop, handshakes fail and
//! servers restart; the session keeps reconnecting with exponential backoff
//! and delivers every outbound payload exactly once, in order.
//!
//! ## Layers
//!
//! ```text
//! ResilientSession        retries, outbound buffer, SLEEPING status
//!   └─ AuthenticatedConnection   CHALLENGE → CHALLENGE_RESPONSE → AUTHORIZED
//!        └─ TransportSession     socket reconnects, epochs
//!             └─ Connector       tokio-tungstenite, or a mock in tests
//! ```
//!
//! ## Logging
//!
//! The crate logs through `tracing` and never installs a subscriber.

pub mod backoff;
pub mod config;
pub mod connection;
pub mod error;
pub mod identity;
pub mod notify;

pub use backoff::{Backoff, BackoffConfig};
pub use config::SessionConfig;
pub use connection::{
    AuthenticatedConnection, CloseReason, ConnectingPhase, ConnectionStatus, Connector, Frame,
    InboundFrame, ResilientSession, SessionStatus, SleepCause, Socket, TransportConfig,
    TransportSession, TransportState, TransportStatus, WsConnector,
};
pub use error::{Result, SessionError};
pub use identity::{Ed25519Identity, Identity};
pub use notify::{as_sequence, next, Broadcaster, Latch, ListenerHandle, StatusCell, Subscription};
