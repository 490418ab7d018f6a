//! # tern-cache
//!
//! The conversation cache: a serialized persistent store of conversation
//! snapshots keeping local state usable offline, with whole-table
//! gap-invalidation after reconnection gaps.
//!
//! [`ConversationStore`] is the synchronous sqlite layer; [`ConversationCache`]
//! wraps it behind one tokio mutex (the cache serial context) so the store
//! is never touched by two contexts at once and reads observe prior writes.

pub mod cache;
pub mod error;
pub mod snapshot;
pub mod store;

pub use cache::ConversationCache;
pub use error::CacheError;
pub use snapshot::{ConversationSnapshot, LastMessageSummary, SnapshotPatch};
pub use store::{store_path, ConversationStore};
