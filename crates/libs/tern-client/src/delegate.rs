//! Client delegate contract.

use async_trait::async_trait;

use tern_connection::ConnectionEvent;
use tern_wire::command::{ConvNotifyPayload, MessageItem, UnreadEntry};

use crate::error::ClientError;

/// Receives session lifecycle events and server pushes.
///
/// Callbacks run outside the orchestrator's operation queue; implementations
/// may call back into the client freely. All methods default to no-ops.
#[async_trait]
pub trait ClientDelegate: Send + Sync {
    /// The transport dropped while the session was opened; the engine is
    /// recovering in the background.
    async fn did_pause(&self, _event: ConnectionEvent) {}

    /// The session was silently replayed after a reconnect.
    async fn did_resume(&self) {}

    /// The session ended without a local `close()`: resume failed fatally or
    /// the server closed it.
    async fn did_close(&self, _error: ClientError) {}

    /// A reconnection resumed with a gap: cached conversation state was
    /// invalidated wholesale. Fires once per gap.
    async fn did_miss_events(&self) {}

    async fn did_receive_message(&self, _conversation_id: &str, _message: &MessageItem) {}

    async fn conversation_event(&self, _conversation_id: &str, _event: &ConvNotifyPayload) {}

    /// Unread counts pushed after login (`tern.rtm.3` only).
    async fn did_update_unread(&self, _entries: &[UnreadEntry]) {}
}

/// Delegate that ignores everything.
pub struct NoopClientDelegate;

#[async_trait]
impl ClientDelegate for NoopClientDelegate {}
