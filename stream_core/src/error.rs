use std::time::Duration;

use thiserror::Error;

use crate::protocol::SessionId;

/// Transport-level failures.
///
/// Every variant is `Clone` because a single connect attempt resolves all of
/// the completions queued behind it with the same outcome.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum ConnectionError {
    #[error("connection is not ready")]
    NotReady,

    #[error("a transport to {active} is already active (requested {requested})")]
    EndpointMismatch { active: String, requested: String },

    #[error("transport closed: {0}")]
    TransportClosed(String),

    #[error("failed to connect to {endpoint}: {reason}")]
    ConnectFailed { endpoint: String, reason: String },

    #[error("connect to {endpoint} timed out after {after_ms}ms")]
    ConnectTimeout { endpoint: String, after_ms: u64 },

    #[error("invalid endpoint: {0}")]
    InvalidEndpoint(String),
}

/// Inbound frame problems seen by the router.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum ProtocolError {
    #[error("malformed frame: {0}")]
    Malformed(String),

    #[error("frame for session {received} does not match the active session")]
    UnexpectedSessionId { received: SessionId },

    #[error("failed to encode frame: {0}")]
    Encode(String),
}

/// Why a session ended up `Failed`.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum FailureReason {
    #[error("{0} consecutive malformed frames")]
    MalformedFrames(u32),

    #[error("connection lost: {0}")]
    ConnectionLost(String),

    #[error("upstream error: {0}")]
    Upstream(String),

    #[error("failed to send to upstream: {0}")]
    SendFailed(String),

    #[error("connection never became ready: {0}")]
    ConnectFailed(String),
}

/// Errors surfaced to the caller that opened a session.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum SessionError {
    #[error("session was cancelled")]
    Cancelled,

    #[error("session failed: {0}")]
    Failed(FailureReason),

    #[error("connection was not ready within {0:?}")]
    Timeout(Duration),

    #[error(transparent)]
    Connection(#[from] ConnectionError),

    #[error("invalid asset: {0}")]
    InvalidAsset(String),

    #[error("invalid input: {0}")]
    InvalidInput(String),
}

impl From<FailureReason> for SessionError {
    fn from(reason: FailureReason) -> Self {
        SessionError::Failed(reason)
    }
}
