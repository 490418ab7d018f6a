//! Protocol variant negotiated at connect time.

use serde::{Deserialize, Serialize};

/// RTM protocol variant.
///
/// The variant is sent during session open and controls whether the server
/// issues per-conversation unread counts (`UnreadNotify` pushes) after login
/// or delivers concrete offline messages instead.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ProtocolVariant {
    /// `tern.rtm.1`: offline messages are delivered concretely.
    #[default]
    #[serde(rename = "tern.rtm.1")]
    V1,
    /// `tern.rtm.3`: the server pushes unread counts per conversation.
    #[serde(rename = "tern.rtm.3")]
    V3,
}

impl ProtocolVariant {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::V1 => "tern.rtm.1",
            Self::V3 => "tern.rtm.3",
        }
    }

    /// True when the server is expected to push `UnreadNotify` frames.
    pub fn supports_unread(self) -> bool {
        matches!(self, Self::V3)
    }
}

impl std::fmt::Display for ProtocolVariant {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}
