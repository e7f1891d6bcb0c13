//! Error types for resilient-session

use thiserror::Error;

/// Result alias used throughout the crate.
pub type Result<T> = std::result::Result<T, SessionError>;

/// Errors surfaced by the transport, the handshake and the supervisor.
///
/// Errors are `Clone` because they travel through latches and status values
/// that may be observed by many listeners.
#[derive(Error, Debug, Clone, PartialEq)]
pub enum SessionError {
    /// First handshake frame was not a well-formed `CHALLENGE`.
    #[error("Got a bad challenge request from the server")]
    BadChallengeRequest,

    /// Second handshake frame was not `AUTHORIZED`. Keeps the decoded body.
    #[error("Got a bad authorization response: {body}")]
    BadAuthorizationResponse { body: serde_json::Value },

    /// The underlying socket signaled an error or went away.
    #[error("Connection error: {0}")]
    Connection(String),

    /// The peer closed an authenticated socket without an error.
    #[error("Connection closed by server")]
    ServerClosed,

    /// `close()` was called locally.
    #[error("Connection closed by client")]
    ClientClosed,

    /// A newer transport epoch superseded the operation. Never surfaced as a
    /// failure; the handshake restarts on the new epoch instead.
    #[error("Stale epoch: operation started on {started}, transport is on {current}")]
    StaleEpoch { started: u64, current: u64 },

    /// No socket (or no authenticated connection) is live.
    #[error("Not connected")]
    NotConnected,

    #[error("Invalid URL: {0}")]
    InvalidUrl(String),

    #[error("Configuration error: {0}")]
    Config(String),
}

impl SessionError {
    /// Create a connection error from anything printable.
    pub fn connection(msg: impl Into<String>) -> Self {
        SessionError::Connection(msg.into())
    }

    /// True for the two protocol-level handshake rejections.
    pub fn is_handshake_failure(&self) -> bool {
        matches!(
            self,
            SessionError::BadChallengeRequest | SessionError::BadAuthorizationResponse { .. }
        )
    }

    /// True when the error only means "a newer epoch took over".
    pub fn is_stale(&self) -> bool {
        matches!(self, SessionError::StaleEpoch { .. })
    }
}

impl From<url::ParseError> for SessionError {
    fn from(e: url::ParseError) -> Self {
        SessionError::InvalidUrl(e.to_string())
    }
}
