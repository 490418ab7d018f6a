//! Command payload types.
//!
//! Every opcode carries one msgpack-encoded payload struct from this module.
//! Payloads are encoded map-keyed (`to_vec_named`) so servers and clients can
//! add fields without breaking older peers.

use std::collections::BTreeSet;

use serde::{de::DeserializeOwned, Deserialize, Serialize};
use serde_json::Value as JsonValue;

use crate::frame::WireError;
use crate::variant::ProtocolVariant;

/// Encode a payload struct to msgpack bytes.
pub fn encode_payload<T: Serialize>(payload: &T) -> Result<Vec<u8>, WireError> {
    Ok(rmp_serde::to_vec_named(payload)?)
}

/// Decode a payload struct from msgpack bytes.
pub fn decode_payload<T: DeserializeOwned>(bytes: &[u8]) -> Result<T, WireError> {
    Ok(rmp_serde::from_slice(bytes)?)
}

// ── Error responses ───────────────────────────────────────────────────────────

/// Server rejection codes carried by `Opcode::ErrorResponse`.
pub mod code {
    /// Session credentials rejected.
    pub const UNAUTHORIZED: u32 = 4101;
    /// Cached session token expired; reopen with a fresh signature.
    pub const SESSION_TOKEN_EXPIRED: u32 = 4112;
    /// Target conversation does not exist.
    pub const CONVERSATION_NOT_FOUND: u32 = 4301;
    /// Operation rejected by conversation permissions.
    pub const FORBIDDEN: u32 = 4302;
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ErrorPayload {
    pub code: u32,
    pub reason: String,
}

impl ErrorPayload {
    /// True when the rejection means the presented session token is no longer
    /// acceptable and open should be retried with a forced-refresh signature.
    pub fn is_auth_rejection(&self) -> bool {
        matches!(self.code, code::UNAUTHORIZED | code::SESSION_TOKEN_EXPIRED)
    }
}

// ── Signature ─────────────────────────────────────────────────────────────────

/// A signature issued by the application's signature collaborator.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SignaturePayload {
    pub signature: String,
    pub timestamp: i64,
    pub nonce: String,
}

// ── Session ───────────────────────────────────────────────────────────────────

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SessionOpenPayload {
    pub client_id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tag: Option<String>,
    pub variant: ProtocolVariant,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub session_token: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub signature: Option<SignaturePayload>,
    /// True when silently replaying session open after a reconnect.
    #[serde(default)]
    pub reconnect: bool,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SessionOpenedPayload {
    pub session_token: String,
    /// Seconds until the issued token expires.
    pub token_ttl_secs: i64,
    /// True when the server resumed the previous session.
    #[serde(default)]
    pub resumed: bool,
    /// True when the resumed session may have missed events; local
    /// conversation state must be treated as possibly stale.
    #[serde(default)]
    pub gap: bool,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct SessionClosePayload {}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct SessionClosedPayload {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub code: Option<u32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reason: Option<String>,
}

// ── Conversation ──────────────────────────────────────────────────────────────

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ConvCreatePayload {
    pub members: BTreeSet<String>,
    /// Reuse an existing conversation with the identical member set.
    #[serde(default)]
    pub unique: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub attributes: Option<JsonValue>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub signature: Option<SignaturePayload>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ConvCreatedPayload {
    pub conversation_id: String,
    pub created_at: i64,
    /// True when `unique` matched an existing conversation.
    #[serde(default)]
    pub existing: bool,
}

/// Membership mutations: add/remove/mute/unmute/block/unblock all share this
/// shape; the opcode distinguishes the operation.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MembersPayload {
    pub conversation_id: String,
    pub member_ids: BTreeSet<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub signature: Option<SignaturePayload>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MembersResultPayload {
    pub conversation_id: String,
    /// Members the server applied the operation to.
    pub member_ids: BTreeSet<String>,
    pub updated_at: i64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ConvQueryPayload {
    pub conversation_ids: Vec<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ConvQueryResultPayload {
    pub conversations: Vec<ConvItem>,
}

/// Authoritative conversation state as reported by the server.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ConvItem {
    pub conversation_id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub creator: Option<String>,
    #[serde(default)]
    pub members: BTreeSet<String>,
    #[serde(default)]
    pub muted_members: BTreeSet<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub attributes: Option<JsonValue>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_message: Option<MessageItem>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub unread_count: Option<u32>,
    pub created_at: i64,
    pub updated_at: i64,
}

// ── Messaging ─────────────────────────────────────────────────────────────────

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MessageSendPayload {
    pub conversation_id: String,
    pub body: String,
    #[serde(default)]
    pub mention_all: bool,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub mention_ids: Vec<String>,
    /// Transient messages are not persisted server-side and never become a
    /// conversation's last message.
    #[serde(default)]
    pub transient: bool,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MessageSentPayload {
    pub message_id: String,
    pub timestamp: i64,
}

/// One anchored end of a history query.
///
/// The `(message_id, timestamp)` pair must reference a message that actually
/// exists in the conversation; supplying a pair that does not match a real
/// message yields undefined continuity. The engine passes bounds through
/// without validation.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct IntervalBound {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub message_id: Option<String>,
    pub timestamp: i64,
    /// True when the bound message itself is part of the result.
    pub closed: bool,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub enum QueryDirection {
    /// From newer to older.
    #[default]
    NewToOld,
    /// From older to newer.
    OldToNew,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MessageQueryPayload {
    pub conversation_id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub start: Option<IntervalBound>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub end: Option<IntervalBound>,
    #[serde(default)]
    pub direction: QueryDirection,
    pub limit: u16,
}

/// Results are ordered strictly by timestamp, ties broken by message id.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MessageQueryResultPayload {
    pub conversation_id: String,
    pub messages: Vec<MessageItem>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct MessageItem {
    pub message_id: String,
    pub from: String,
    pub timestamp: i64,
    pub body: String,
    #[serde(default)]
    pub mention_all: bool,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub mention_ids: Vec<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MessageReadPayload {
    pub conversation_id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub message_id: Option<String>,
    pub timestamp: i64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MessageReadDonePayload {
    pub conversation_id: String,
}

// ── Server pushes ─────────────────────────────────────────────────────────────

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MessageNotifyPayload {
    pub conversation_id: String,
    pub message: MessageItem,
    #[serde(default)]
    pub transient: bool,
}

/// Conversation-level events pushed by the server.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum ConvOp {
    Joined,
    Left,
    MembersJoined,
    MembersLeft,
    MembersMuted,
    MembersUnmuted,
    MembersBlocked,
    MembersUnblocked,
    /// Conversation data changed in a way not carried by the push; local
    /// state for that conversation is possibly stale.
    Updated,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ConvNotifyPayload {
    pub conversation_id: String,
    pub op: ConvOp,
    #[serde(default)]
    pub member_ids: BTreeSet<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub initiated_by: Option<String>,
    pub timestamp: i64,
}

/// Per-conversation unread counts, pushed after login under
/// [`ProtocolVariant::V3`].
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct UnreadNotifyPayload {
    pub entries: Vec<UnreadEntry>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct UnreadEntry {
    pub conversation_id: String,
    pub unread_count: u32,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_message: Option<MessageItem>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct GoawayPayload {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reason: Option<String>,
}
