//! Status values published by the authenticated connection and the supervisor.

use chrono::{DateTime, Utc};

use crate::error::SessionError;

/// Where a connection is in its handshake.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectingPhase {
    WaitingTransport,
    AwaitingChallenge,
    AwaitingAuthorization,
}

/// Why a connection ended.
#[derive(Debug, Clone, PartialEq)]
pub enum CloseReason {
    ConnectionError(SessionError),
    ClientClosed,
}

/// Status of one authenticated connection.
#[derive(Debug, Clone, PartialEq)]
pub enum ConnectionStatus {
    Pending,
    Connecting(ConnectingPhase),
    Connected,
    Closed(CloseReason),
}

impl ConnectionStatus {
    pub fn is_connected(&self) -> bool {
        matches!(self, ConnectionStatus::Connected)
    }

    pub fn is_closed(&self) -> bool {
        matches!(self, ConnectionStatus::Closed(_))
    }
}

/// What sent the supervisor to sleep.
#[derive(Debug, Clone, PartialEq)]
pub enum SleepCause {
    Closed,
    Error(SessionError),
}

/// Supervisor-level status: a connection status, or backing off between
/// connections.
#[derive(Debug, Clone, PartialEq)]
pub enum SessionStatus {
    Pending,
    Connecting(ConnectingPhase),
    Connected,
    Closed(CloseReason),
    Sleeping {
        resume_at: DateTime<Utc>,
        cause: SleepCause,
    },
}

impl SessionStatus {
    pub fn is_connected(&self) -> bool {
        matches!(self, SessionStatus::Connected)
    }

    pub fn is_sleeping(&self) -> bool {
        matches!(self, SessionStatus::Sleeping { .. })
    }
}

impl From<ConnectionStatus> for SessionStatus {
    fn from(status: ConnectionStatus) -> Self {
        match status {
            ConnectionStatus::Pending => SessionStatus::Pending,
            ConnectionStatus::Connecting(phase) => SessionStatus::Connecting(phase),
            ConnectionStatus::Connected => SessionStatus::Connected,
            ConnectionStatus::Closed(reason) => SessionStatus::Closed(reason),
        }
    }
}

impl From<SessionError> for SleepCause {
    /// A clean close by the server is a close, everything else an error.
    fn from(error: SessionError) -> Self {
        match error {
            SessionError::ServerClosed => SleepCause::Closed,
            e => SleepCause::Error(e),
        }
    }
}

impl From<CloseReason> for SleepCause {
    fn from(reason: CloseReason) -> Self {
        match reason {
            CloseReason::ClientClosed => SleepCause::Closed,
            CloseReason::ConnectionError(e) => e.into(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_sleep_cause_from_close_reason() {
        assert_eq!(SleepCause::from(CloseReason::ClientClosed), SleepCause::Closed);
        assert_eq!(
            SleepCause::from(CloseReason::ConnectionError(SessionError::ServerClosed)),
            SleepCause::Closed
        );
        assert_eq!(
            SleepCause::from(CloseReason::ConnectionError(SessionError::BadChallengeRequest)),
            SleepCause::Error(SessionError::BadChallengeRequest)
        );
    }
}
