//! Error types for replication sessions.

use docsync_core::CoreError;
use docsync_protocol::ProtocolError;
use thiserror::Error;

/// Result type for session operations.
pub type SessionResult<T> = Result<T, SessionError>;

/// Errors that can occur while running a session.
#[derive(Error, Debug)]
pub enum SessionError {
    /// The peer sent something malformed.
    #[error("protocol error: {0}")]
    Protocol(#[from] ProtocolError),

    /// Database error while serving a request.
    #[error("database error: {0}")]
    Core(#[from] CoreError),

    /// No mutually supported protocol version.
    #[error("no supported protocol version in {offered:?}")]
    UnsupportedVersion {
        /// Versions the peer offered.
        offered: Vec<String>,
    },

    /// The connection went away.
    #[error("peer disconnected")]
    Disconnected,

    /// The session was closed while the operation was pending.
    #[error("session cancelled")]
    Cancelled,

    /// A request arrived in a state that does not accept it.
    #[error("invalid state transition from {from} to {to}")]
    InvalidState {
        /// Current state.
        from: String,
        /// Requested state or profile.
        to: String,
    },

    /// The peer answered with an error response.
    #[error("peer error {code}: {message}")]
    Remote {
        /// HTTP-style status.
        code: u16,
        /// Error text from the response body.
        message: String,
    },

    /// The peer did not answer in time.
    #[error("request timed out")]
    Timeout,

    /// The peer may not access the requested resource.
    #[error("forbidden: {0}")]
    Forbidden(String),

    /// A server-side task failed unexpectedly.
    #[error("internal error: {0}")]
    Internal(String),

    /// The server is at its session limit.
    #[error("too many sessions (limit {limit})")]
    TooManySessions {
        /// Configured limit.
        limit: usize,
    },
}

impl SessionError {
    /// Returns true if reconnecting may succeed.
    pub fn is_retryable(&self) -> bool {
        match self {
            SessionError::Disconnected
            | SessionError::Timeout
            | SessionError::TooManySessions { .. } => true,
            SessionError::Core(e) => e.is_retryable(),
            SessionError::Remote { code, .. } => *code >= 500 || *code == 408 || *code == 409,
            _ => false,
        }
    }

    /// HTTP-style status reported to the peer.
    pub fn status_code(&self) -> u16 {
        match self {
            SessionError::Protocol(e) => e.status_code(),
            SessionError::Core(e) => e.status_code(),
            SessionError::UnsupportedVersion { .. } => 426,
            SessionError::InvalidState { .. } => 409,
            SessionError::Forbidden(_) => 403,
            SessionError::Internal(_) => 500,
            SessionError::Remote { code, .. } => *code,
            SessionError::Timeout => 408,
            SessionError::TooManySessions { .. } => 503,
            SessionError::Disconnected | SessionError::Cancelled => 499,
        }
    }

    /// Returns true if the session cannot continue after this error.
    pub fn is_fatal(&self) -> bool {
        matches!(
            self,
            SessionError::UnsupportedVersion { .. }
                | SessionError::Disconnected
                | SessionError::Cancelled
        )
    }
}
