//! Connection delegate contract.

use async_trait::async_trait;
use tern_wire::Frame;

/// Why the connection left `Connected`/`Connecting`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ConnectionEvent {
    /// `disconnect()` was invoked by the owner.
    DisconnectInvoked,
    /// The app moved to the background and the policy suspends the link.
    AppInBackground,
    /// The network became unreachable.
    NetworkNotReachable,
    /// The transport failed or was closed by the peer.
    TransportFailure(String),
}

impl std::fmt::Display for ConnectionEvent {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::DisconnectInvoked => f.write_str("disconnect invoked"),
            Self::AppInBackground => f.write_str("app in background"),
            Self::NetworkNotReachable => f.write_str("network not reachable"),
            Self::TransportFailure(reason) => write!(f, "transport failure: {reason}"),
        }
    }
}

/// Receives connection lifecycle events and server-pushed frames.
///
/// Callbacks run on a dispatcher task outside the engine's serial context, so
/// implementations may take their own locks and issue new commands freely.
/// All methods default to no-ops; override the ones you care about.
#[async_trait]
pub trait ConnectionDelegate: Send + Sync {
    async fn in_connecting(&self) {}

    async fn did_connect(&self) {}

    async fn failed_connecting(&self, _event: ConnectionEvent) {}

    async fn did_disconnect(&self, _event: ConnectionEvent) {}

    /// A server-pushed frame, or a correlated response whose command already
    /// resolved (for example after a timeout).
    async fn received_frame(&self, _frame: Frame) {}

    /// A malformed inbound frame. The transport is kept open.
    async fn protocol_error(&self, _reason: String) {}
}

/// Delegate that ignores everything.
pub struct NoopDelegate;

#[async_trait]
impl ConnectionDelegate for NoopDelegate {}
