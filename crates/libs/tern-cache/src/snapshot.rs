//! Conversation snapshot model.

use std::collections::BTreeSet;

use serde::{Deserialize, Serialize};
use serde_json::Value as JsonValue;

/// Denormalized summary of a conversation's newest message.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LastMessageSummary {
    pub message_id: String,
    pub from: String,
    pub text: String,
    #[serde(default)]
    pub mention_all: bool,
    #[serde(default)]
    pub mention_ids: Vec<String>,
    pub timestamp: i64,
}

/// Locally cached state of one conversation.
///
/// `should_fetch` marks the snapshot as possibly stale: it is raised when a
/// reconnection resumed with a gap or an out-of-band notification implied
/// missed updates, and cleared only by the next authoritative fetch of this
/// specific conversation. The flag is persisted in its own column, not inside
/// the serialized snapshot, so whole-table invalidation is one UPDATE.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ConversationSnapshot {
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
    pub last_message: Option<LastMessageSummary>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_message_at: Option<i64>,
    #[serde(default)]
    pub unread_count: u32,
    #[serde(default)]
    pub created_at: i64,
    #[serde(default)]
    pub updated_at: i64,
    #[serde(skip)]
    pub should_fetch: bool,
}

impl ConversationSnapshot {
    pub fn new(conversation_id: impl Into<String>) -> Self {
        Self { conversation_id: conversation_id.into(), ..Self::default() }
    }
}

/// Partial update against a cached snapshot.
///
/// The typed rendition of a column patch: unset fields leave the stored value
/// alone; member deltas apply on top of the stored sets.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct SnapshotPatch {
    pub name: Option<String>,
    pub attributes: Option<JsonValue>,
    pub members: Option<BTreeSet<String>>,
    pub members_joined: BTreeSet<String>,
    pub members_left: BTreeSet<String>,
    pub muted_added: BTreeSet<String>,
    pub muted_removed: BTreeSet<String>,
    pub last_message: Option<LastMessageSummary>,
    pub unread_count: Option<u32>,
    pub updated_at: Option<i64>,
}

impl SnapshotPatch {
    pub fn is_empty(&self) -> bool {
        *self == Self::default()
    }

    /// Apply onto `snapshot`. `last_message` also refreshes the denormalized
    /// `last_message_at` used for ordering.
    pub fn apply(&self, snapshot: &mut ConversationSnapshot) {
        if let Some(name) = &self.name {
            snapshot.name = Some(name.clone());
        }
        if let Some(attributes) = &self.attributes {
            snapshot.attributes = Some(attributes.clone());
        }
        if let Some(members) = &self.members {
            snapshot.members = members.clone();
        }
        for member in &self.members_joined {
            snapshot.members.insert(member.clone());
        }
        for member in &self.members_left {
            snapshot.members.remove(member);
            snapshot.muted_members.remove(member);
        }
        for member in &self.muted_added {
            snapshot.muted_members.insert(member.clone());
        }
        for member in &self.muted_removed {
            snapshot.muted_members.remove(member);
        }
        if let Some(last_message) = &self.last_message {
            snapshot.last_message_at = Some(last_message.timestamp);
            snapshot.last_message = Some(last_message.clone());
        }
        if let Some(unread_count) = self.unread_count {
            snapshot.unread_count = unread_count;
        }
        if let Some(updated_at) = self.updated_at {
            snapshot.updated_at = updated_at;
        }
    }
}
