//! Synchronous sqlite store layer.
//!
//! One row per conversation: the serialized snapshot plus a denormalized
//! `last_message_at` column for the timestamp-ordered query and the
//! `should_fetch` flag column for one-pass invalidation. A small `kv` table
//! holds the session token and other settings.

use std::path::{Path, PathBuf};

use rusqlite::{params, Connection, OptionalExtension};

use crate::error::CacheError;
use crate::snapshot::{ConversationSnapshot, SnapshotPatch};

/// Application-scoped store location:
/// `<data dir>/tern/<app id>/<client id>/conversations.sqlite3`.
pub fn store_path(app_id: &str, client_id: &str) -> Result<PathBuf, CacheError> {
    let base = dirs::data_dir().ok_or(CacheError::NoDataDir)?;
    let dir = base.join("tern").join(app_id).join(client_id);
    std::fs::create_dir_all(&dir)?;
    Ok(dir.join("conversations.sqlite3"))
}

pub struct ConversationStore {
    conn: Connection,
}

impl ConversationStore {
    pub fn in_memory() -> Result<Self, CacheError> {
        let conn = Connection::open_in_memory()?;
        let store = Self { conn };
        store.init_schema()?;
        Ok(store)
    }

    pub fn open(path: &Path) -> Result<Self, CacheError> {
        let conn = Connection::open(path)?;
        let store = Self { conn };
        store.init_schema()?;
        Ok(store)
    }

    /// Upsert keyed by conversation id. Writes the snapshot's `should_fetch`
    /// as-is: an authoritative fetch passes `false` and thereby clears the
    /// staleness flag for exactly this conversation.
    pub fn insert_or_replace(&self, snapshot: &ConversationSnapshot) -> Result<(), CacheError> {
        let serialized = serde_json::to_string(snapshot)?;
        self.conn.execute(
            "INSERT OR REPLACE INTO conversations (conversation_id, snapshot, last_message_at, should_fetch) VALUES (?1, ?2, ?3, ?4)",
            params![
                &snapshot.conversation_id,
                serialized,
                snapshot.last_message_at,
                snapshot.should_fetch,
            ],
        )?;
        Ok(())
    }

    /// Partial update. Fails with [`CacheError::NotFound`] when the
    /// conversation is not cached; updates never insert implicitly. The
    /// snapshot and its denormalized column move in one transaction.
    pub fn update(&mut self, conversation_id: &str, patch: &SnapshotPatch) -> Result<(), CacheError> {
        let tx = self.conn.transaction()?;
        let row: Option<(String, bool)> = tx
            .query_row(
                "SELECT snapshot, should_fetch FROM conversations WHERE conversation_id = ?1",
                params![conversation_id],
                |row| Ok((row.get(0)?, row.get(1)?)),
            )
            .optional()?;
        let Some((serialized, should_fetch)) = row else {
            return Err(CacheError::NotFound(conversation_id.to_owned()));
        };

        let mut snapshot: ConversationSnapshot = serde_json::from_str(&serialized)?;
        snapshot.should_fetch = should_fetch;
        patch.apply(&mut snapshot);

        let serialized = serde_json::to_string(&snapshot)?;
        tx.execute(
            "UPDATE conversations SET snapshot = ?1, last_message_at = ?2 WHERE conversation_id = ?3",
            params![serialized, snapshot.last_message_at, conversation_id],
        )?;
        tx.commit()?;
        Ok(())
    }

    pub fn get(&self, conversation_id: &str) -> Result<Option<ConversationSnapshot>, CacheError> {
        let row: Option<(String, bool)> = self
            .conn
            .query_row(
                "SELECT snapshot, should_fetch FROM conversations WHERE conversation_id = ?1",
                params![conversation_id],
                |row| Ok((row.get(0)?, row.get(1)?)),
            )
            .optional()?;
        match row {
            Some((serialized, should_fetch)) => {
                let mut snapshot: ConversationSnapshot = serde_json::from_str(&serialized)?;
                snapshot.should_fetch = should_fetch;
                Ok(Some(snapshot))
            }
            None => Ok(None),
        }
    }

    /// Present records in the exact order of `ids`; absent ids are omitted,
    /// never an error.
    pub fn query_order_by_ids(
        &self,
        ids: &[String],
    ) -> Result<Vec<ConversationSnapshot>, CacheError> {
        let mut results = Vec::with_capacity(ids.len());
        for id in ids {
            if let Some(snapshot) = self.get(id)? {
                results.push(snapshot);
            }
        }
        Ok(results)
    }

    /// All records, newest conversation first: `last_message_at` DESC with
    /// `conversation_id` ASC breaking ties. Conversations without any message
    /// sort last.
    pub fn query_order_by_last_message(&self) -> Result<Vec<ConversationSnapshot>, CacheError> {
        let mut stmt = self.conn.prepare(
            "SELECT snapshot, should_fetch FROM conversations ORDER BY last_message_at DESC, conversation_id ASC",
        )?;
        let mut rows = stmt.query([])?;
        let mut results = Vec::new();
        while let Some(row) = rows.next()? {
            let serialized: String = row.get(0)?;
            let should_fetch: bool = row.get(1)?;
            let mut snapshot: ConversationSnapshot = serde_json::from_str(&serialized)?;
            snapshot.should_fetch = should_fetch;
            results.push(snapshot);
        }
        Ok(results)
    }

    /// Mark every cached conversation possibly stale in one pass. Returns the
    /// number of records touched.
    pub fn invalidate_all(&self) -> Result<usize, CacheError> {
        Ok(self.conn.execute("UPDATE conversations SET should_fetch = 1", [])?)
    }

    /// Single-conversation staleness flag. Returns false when the
    /// conversation is not cached.
    pub fn set_should_fetch(
        &self,
        conversation_id: &str,
        should_fetch: bool,
    ) -> Result<bool, CacheError> {
        let updated = self.conn.execute(
            "UPDATE conversations SET should_fetch = ?1 WHERE conversation_id = ?2",
            params![should_fetch, conversation_id],
        )?;
        Ok(updated > 0)
    }

    /// Remove the listed conversations in one transaction: either every
    /// present id is gone on return, or a failure rolled everything back and
    /// the cache is unchanged. Absent ids are not an error.
    pub fn remove(&mut self, ids: &[String]) -> Result<(), CacheError> {
        let tx = self.conn.transaction()?;
        for id in ids {
            tx.execute("DELETE FROM conversations WHERE conversation_id = ?1", params![id])?;
        }
        tx.commit()?;
        Ok(())
    }

    pub fn kv_put(&self, key: &str, value: &str) -> Result<(), CacheError> {
        self.conn.execute(
            "INSERT OR REPLACE INTO kv (key, value) VALUES (?1, ?2)",
            params![key, value],
        )?;
        Ok(())
    }

    pub fn kv_get(&self, key: &str) -> Result<Option<String>, CacheError> {
        Ok(self
            .conn
            .query_row("SELECT value FROM kv WHERE key = ?1", params![key], |row| row.get(0))
            .optional()?)
    }

    pub fn kv_delete(&self, key: &str) -> Result<(), CacheError> {
        self.conn.execute("DELETE FROM kv WHERE key = ?1", params![key])?;
        Ok(())
    }

    fn init_schema(&self) -> Result<(), CacheError> {
        self.conn.execute_batch(
            "CREATE TABLE IF NOT EXISTS conversations (
                conversation_id TEXT PRIMARY KEY,
                snapshot TEXT NOT NULL,
                last_message_at INTEGER,
                should_fetch INTEGER NOT NULL DEFAULT 0
            );
            CREATE INDEX IF NOT EXISTS idx_conversations_last_message_at
                ON conversations (last_message_at DESC, conversation_id ASC);
            CREATE TABLE IF NOT EXISTS kv (
                key TEXT PRIMARY KEY,
                value TEXT NOT NULL
            );",
        )?;
        Ok(())
    }
}
