//! Command-level error taxonomy.

/// How a command failed to produce a matched response.
///
/// Every command resolves with exactly one of these or the response frame.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum CommandError {
    /// The transport failed or was not connected; the state machine handles
    /// reconnection separately.
    #[error("transport failure: {0}")]
    Transport(String),

    /// A malformed or unexpected frame. Non-fatal for the connection.
    #[error("protocol failure: {0}")]
    Protocol(String),

    /// The command's TTL elapsed without a matched response.
    #[error("command timed out")]
    Timeout,

    /// The connection was explicitly closed while the command was pending.
    #[error("command cancelled")]
    Cancelled,
}
