//! Session status and token state.

use serde::{Deserialize, Serialize};

/// Client-id constraints carried by the protocol.
pub const CLIENT_ID_LENGTH_LIMIT: usize = 64;

/// The reserved tag value a client must not claim for itself.
pub const RESERVED_TAG: &str = "default";

/// Expiry slack so a token is refreshed slightly before the server would
/// reject it.
const EXPIRY_SKEW_MS: i64 = 5_000;

/// Cache kv key holding the persisted session token.
pub(crate) const KV_SESSION_TOKEN: &str = "session_token";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionStatus {
    Closed,
    Opening,
    Opened,
    Closing,
}

impl SessionStatus {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Closed => "closed",
            Self::Opening => "opening",
            Self::Opened => "opened",
            Self::Closing => "closing",
        }
    }
}

/// An issued session token, held in memory and persisted in the cache kv
/// table across restarts.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub(crate) struct SessionToken {
    pub token: String,
    pub expires_at_ms: i64,
}

impl SessionToken {
    pub fn is_expired(&self, now_ms: i64) -> bool {
        now_ms >= self.expires_at_ms - EXPIRY_SKEW_MS
    }
}

pub(crate) fn now_ms() -> i64 {
    use std::time::{SystemTime, UNIX_EPOCH};
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|elapsed| elapsed.as_millis() as i64)
        .unwrap_or(0)
}

/// Letters, digits, and underscores, 1 to 64 characters.
pub(crate) fn valid_client_id(client_id: &str) -> bool {
    !client_id.is_empty()
        && client_id.len() <= CLIENT_ID_LENGTH_LIMIT
        && client_id.chars().all(|c| c.is_ascii_alphanumeric() || c == '_')
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn client_id_validation() {
        assert!(valid_client_id("alice_01"));
        assert!(valid_client_id(&"x".repeat(64)));
        assert!(!valid_client_id(""));
        assert!(!valid_client_id(&"x".repeat(65)));
        assert!(!valid_client_id("no spaces"));
        assert!(!valid_client_id("no:colons"));
    }

    #[test]
    fn token_expiry_includes_skew() {
        let token = SessionToken { token: "t".to_owned(), expires_at_ms: 10_000 };
        assert!(!token.is_expired(4_000));
        assert!(token.is_expired(5_000));
        assert!(token.is_expired(11_000));
    }
}
