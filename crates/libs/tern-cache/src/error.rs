//! Cache error taxonomy.

/// Store failures. A failed write never leaves a partially-applied record:
/// multi-row mutations run in one transaction and roll back on error.
#[derive(Debug, thiserror::Error)]
pub enum CacheError {
    #[error("store failure: {0}")]
    Storage(#[from] rusqlite::Error),

    #[error("snapshot serialization failure: {0}")]
    Serialize(#[from] serde_json::Error),

    #[error("i/o failure: {0}")]
    Io(#[from] std::io::Error),

    /// Partial update against a conversation that is not cached. Updates
    /// never insert implicitly.
    #[error("conversation {0} is not cached")]
    NotFound(String),

    /// No usable application data directory on this platform.
    #[error("no application data directory available")]
    NoDataDir,
}
