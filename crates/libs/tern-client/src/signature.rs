//! Signature collaborator boundary.
//!
//! Signature computation is application business: the engine asks this trait
//! for a signature per conversation+action and attaches whatever comes back.

use async_trait::async_trait;

use tern_wire::command::SignaturePayload;

use crate::error::ClientError;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Signature {
    pub signature: String,
    pub timestamp: i64,
    pub nonce: String,
}

impl From<Signature> for SignaturePayload {
    fn from(signature: Signature) -> Self {
        Self {
            signature: signature.signature,
            timestamp: signature.timestamp,
            nonce: signature.nonce,
        }
    }
}

/// The action a signature is requested for.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SignatureAction {
    /// Session open / token refresh.
    Open,
    /// Conversation creation.
    Create,
    /// Adding members.
    Invite,
    /// Removing members.
    Kick,
    /// Blocking members.
    Block,
    /// Unblocking members.
    Unblock,
}

/// Supplies signatures on demand. Returning `Ok(None)` sends the command
/// unsigned; the server decides whether that is acceptable.
#[async_trait]
pub trait SignatureSource: Send + Sync {
    async fn signature(
        &self,
        client_id: &str,
        conversation_id: Option<&str>,
        action: SignatureAction,
        target_ids: &[String],
    ) -> Result<Option<Signature>, ClientError>;
}

/// Signature source for applications that do not sign operations.
pub struct NoSignature;

#[async_trait]
impl SignatureSource for NoSignature {
    async fn signature(
        &self,
        _client_id: &str,
        _conversation_id: Option<&str>,
        _action: SignatureAction,
        _target_ids: &[String],
    ) -> Result<Option<Signature>, ClientError> {
        Ok(None)
    }
}
