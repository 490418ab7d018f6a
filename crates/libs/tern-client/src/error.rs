//! Client-level error taxonomy.

use tern_cache::CacheError;
use tern_connection::CommandError;
use tern_wire::command::ErrorPayload;

/// Every asynchronous client operation resolves exactly once with success or
/// one of these.
#[derive(Debug, thiserror::Error)]
pub enum ClientError {
    /// The transport failed or never connected. Reconnection is handled by
    /// the engine; this only surfaces as an explicit operation failure.
    #[error("transport failure: {0}")]
    Transport(String),

    /// A malformed or unexpected frame. Non-fatal for the connection.
    #[error("protocol failure: {0}")]
    Protocol(String),

    #[error("command timed out")]
    Timeout,

    #[error("operation cancelled")]
    Cancelled,

    /// Session credentials rejected. Open retries once with a forced-refresh
    /// signature before surfacing this.
    #[error("session credentials rejected: {0}")]
    Auth(String),

    #[error(transparent)]
    Cache(#[from] CacheError),

    /// The server rejected the command for a non-auth reason.
    #[error("server rejected command ({code}): {reason}")]
    Rejected { code: u32, reason: String },

    #[error("invalid session status: expected {expected}, currently {actual}")]
    InvalidState { expected: &'static str, actual: &'static str },

    #[error("client id must be 1-64 letters, digits, or underscores")]
    InvalidClientId,

    #[error("tag must not be \"default\"")]
    InvalidTag,
}

impl From<CommandError> for ClientError {
    fn from(err: CommandError) -> Self {
        match err {
            CommandError::Transport(reason) => Self::Transport(reason),
            CommandError::Protocol(reason) => Self::Protocol(reason),
            CommandError::Timeout => Self::Timeout,
            CommandError::Cancelled => Self::Cancelled,
        }
    }
}

impl ClientError {
    /// Map a server `ErrorResponse` payload onto the taxonomy.
    pub(crate) fn from_rejection(payload: ErrorPayload) -> Self {
        if payload.is_auth_rejection() {
            Self::Auth(payload.reason)
        } else {
            Self::Rejected { code: payload.code, reason: payload.reason }
        }
    }
}
