//! Storage seam behind [`BlobStore`](crate::BlobStore).

use std::time::Duration;

use async_trait::async_trait;

#[derive(Debug, thiserror::Error)]
pub enum BlobError {
    /// The key expired or never existed. Unrecoverable; never retried.
    #[error("Blob not found: {0}")]
    NotFound(String),

    /// The reference token was not issued by this store.
    #[error("Not a reference issued by this store: {0}")]
    ForeignReference(String),

    #[error("Redis error: {0}")]
    Redis(#[from] redis::RedisError),
}

/// Minimal key/value operations the blob store needs.
///
/// Implementations must be safe to share across concurrent jobs.
#[async_trait]
pub trait BlobBackend: Send + Sync {
    /// Store `value` under `key`, expiring after `ttl`.
    async fn set_with_ttl(&self, key: &str, value: &str, ttl: Duration) -> Result<(), BlobError>;

    /// Fetch the value under `key`, `None` if absent or expired.
    async fn get(&self, key: &str) -> Result<Option<String>, BlobError>;

    /// Append `items` to the list under `key`, refresh its expiry, and
    /// return the full list, as one atomic step.
    async fn append_list(
        &self,
        key: &str,
        items: &[String],
        ttl: Duration,
    ) -> Result<Vec<String>, BlobError>;

    /// Read the list under `key` (empty if absent).
    async fn read_list(&self, key: &str) -> Result<Vec<String>, BlobError>;
}
