//! Serialized async wrapper over the store.

use std::path::Path;
use std::sync::Arc;

use tokio::sync::Mutex;

use crate::error::CacheError;
use crate::snapshot::{ConversationSnapshot, SnapshotPatch};
use crate::store::ConversationStore;

/// The cache serial context.
///
/// Every operation takes the one store lock, so the underlying sqlite handle
/// is never driven by two contexts at once and a read after a write observes
/// that write. Cloning shares the same store.
#[derive(Clone)]
pub struct ConversationCache {
    store: Arc<Mutex<ConversationStore>>,
}

impl ConversationCache {
    pub fn open(path: &Path) -> Result<Self, CacheError> {
        Ok(Self { store: Arc::new(Mutex::new(ConversationStore::open(path)?)) })
    }

    pub fn in_memory() -> Result<Self, CacheError> {
        Ok(Self { store: Arc::new(Mutex::new(ConversationStore::in_memory()?)) })
    }

    pub async fn insert_or_replace(
        &self,
        snapshot: &ConversationSnapshot,
    ) -> Result<(), CacheError> {
        self.store.lock().await.insert_or_replace(snapshot)
    }

    pub async fn update(
        &self,
        conversation_id: &str,
        patch: &SnapshotPatch,
    ) -> Result<(), CacheError> {
        self.store.lock().await.update(conversation_id, patch)
    }

    pub async fn get(
        &self,
        conversation_id: &str,
    ) -> Result<Option<ConversationSnapshot>, CacheError> {
        self.store.lock().await.get(conversation_id)
    }

    pub async fn query_order_by_ids(
        &self,
        ids: &[String],
    ) -> Result<Vec<ConversationSnapshot>, CacheError> {
        self.store.lock().await.query_order_by_ids(ids)
    }

    pub async fn query_order_by_last_message(
        &self,
    ) -> Result<Vec<ConversationSnapshot>, CacheError> {
        self.store.lock().await.query_order_by_last_message()
    }

    pub async fn invalidate_all(&self) -> Result<usize, CacheError> {
        self.store.lock().await.invalidate_all()
    }

    pub async fn set_should_fetch(
        &self,
        conversation_id: &str,
        should_fetch: bool,
    ) -> Result<bool, CacheError> {
        self.store.lock().await.set_should_fetch(conversation_id, should_fetch)
    }

    pub async fn remove(&self, ids: &[String]) -> Result<(), CacheError> {
        self.store.lock().await.remove(ids)
    }

    pub async fn kv_put(&self, key: &str, value: &str) -> Result<(), CacheError> {
        self.store.lock().await.kv_put(key, value)
    }

    pub async fn kv_get(&self, key: &str) -> Result<Option<String>, CacheError> {
        self.store.lock().await.kv_get(key)
    }

    pub async fn kv_delete(&self, key: &str) -> Result<(), CacheError> {
        self.store.lock().await.kv_delete(key)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn snapshot(id: &str, last_message_at: Option<i64>) -> ConversationSnapshot {
        let mut snapshot = ConversationSnapshot::new(id);
        snapshot.last_message_at = last_message_at;
        snapshot
    }

    #[tokio::test]
    async fn concurrent_writers_serialize_cleanly() {
        let cache = ConversationCache::in_memory().expect("cache");

        let mut tasks = Vec::new();
        for i in 0..16i64 {
            let cache = cache.clone();
            tasks.push(tokio::spawn(async move {
                cache.insert_or_replace(&snapshot(&format!("c{i:02}"), Some(i))).await
            }));
        }
        for task in tasks {
            task.await.expect("join").expect("insert");
        }

        let all = cache.query_order_by_last_message().await.expect("query");
        assert_eq!(all.len(), 16);
        assert_eq!(all[0].conversation_id, "c15");
    }

    #[tokio::test]
    async fn read_observes_prior_write() {
        let cache = ConversationCache::in_memory().expect("cache");
        cache.insert_or_replace(&snapshot("c1", None)).await.expect("insert");
        assert!(cache.get("c1").await.expect("get").is_some());
    }

    #[tokio::test]
    async fn gap_invalidation_then_selective_refetch() {
        let cache = ConversationCache::in_memory().expect("cache");
        cache.insert_or_replace(&snapshot("a", None)).await.expect("insert");
        cache.insert_or_replace(&snapshot("b", None)).await.expect("insert");

        assert_eq!(cache.invalidate_all().await.expect("invalidate"), 2);

        // Authoritative refetch of "b" only.
        cache.insert_or_replace(&snapshot("b", None)).await.expect("refetch");
        assert!(cache.get("a").await.expect("get").expect("present").should_fetch);
        assert!(!cache.get("b").await.expect("get").expect("present").should_fetch);
    }
}
