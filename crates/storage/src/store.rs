//! Reference-token blob store and per-job tracking set.
//!
//! Key layout (with the default namespace):
//!
//! ```text
//! sdrelay:blob:<uuid>        base64 image, expires after `blob_ttl`
//! sdrelay:job:<job_id>       list of reference tokens, expires after `tracking_ttl`
//! ```
//!
//! A reference token is `<public_base_url>/<uuid>`: derived only from the
//! key, so any process sharing the configuration can resolve it.

use std::sync::Arc;
use std::time::Duration;

use crate::backend::{BlobBackend, BlobError};

/// Settings shared by every worker that reads or writes blobs.
#[derive(Debug, Clone)]
pub struct BlobStoreConfig {
    /// Redis key prefix.
    pub namespace: String,
    /// Prefix of every reference token, e.g. `https://blobs.example.com`.
    pub public_base_url: String,
    pub blob_ttl: Duration,
    pub tracking_ttl: Duration,
}

impl Default for BlobStoreConfig {
    fn default() -> Self {
        Self {
            namespace: "sdrelay".into(),
            public_base_url: "https://blobs.localhost".into(),
            blob_ttl: Duration::from_secs(24 * 60 * 60),
            tracking_ttl: Duration::from_secs(24 * 60 * 60),
        }
    }
}

/// Shared handle over a [`BlobBackend`].
#[derive(Clone)]
pub struct BlobStore {
    backend: Arc<dyn BlobBackend>,
    config: BlobStoreConfig,
}

impl BlobStore {
    pub fn new(backend: Arc<dyn BlobBackend>, config: BlobStoreConfig) -> Self {
        Self { backend, config }
    }

    pub fn config(&self) -> &BlobStoreConfig {
        &self.config
    }

    /// Store a base64 image under a fresh key and return its reference.
    pub async fn put(&self, data: &str) -> Result<String, BlobError> {
        let key = uuid::Uuid::new_v4().simple().to_string();
        self.backend
            .set_with_ttl(&self.storage_key(&key), data, self.config.blob_ttl)
            .await?;
        let reference = self.reference_for(&key);
        tracing::debug!(reference = %reference, bytes = data.len(), "Blob stored");
        Ok(reference)
    }

    /// Resolve a reference issued by [`put`](Self::put).
    ///
    /// Fails with [`BlobError::NotFound`] once the TTL has passed.
    pub async fn get(&self, reference: &str) -> Result<String, BlobError> {
        let key = self.key_of(reference)?;
        self.backend
            .get(&self.storage_key(key))
            .await?
            .ok_or_else(|| BlobError::NotFound(reference.to_string()))
    }

    /// Append references to a job's tracking set and return the whole set.
    pub async fn track(
        &self,
        job_id: &str,
        references: &[String],
    ) -> Result<Vec<String>, BlobError> {
        self.backend
            .append_list(&self.tracking_key(job_id), references, self.config.tracking_ttl)
            .await
    }

    /// Current tracking set of a job.
    pub async fn tracked(&self, job_id: &str) -> Result<Vec<String>, BlobError> {
        self.backend.read_list(&self.tracking_key(job_id)).await
    }

    // ---- key helpers ----

    fn reference_for(&self, key: &str) -> String {
        format!("{}/{key}", self.config.public_base_url.trim_end_matches('/'))
    }

    fn key_of<'a>(&self, reference: &'a str) -> Result<&'a str, BlobError> {
        let base = self.config.public_base_url.trim_end_matches('/');
        reference
            .strip_prefix(base)
            .and_then(|rest| rest.strip_prefix('/'))
            .filter(|key| !key.is_empty() && !key.contains('/'))
            .ok_or_else(|| BlobError::ForeignReference(reference.to_string()))
    }

    fn storage_key(&self, key: &str) -> String {
        format!("{}:blob:{key}", self.config.namespace)
    }

    fn tracking_key(&self, job_id: &str) -> String {
        format!("{}:job:{job_id}", self.config.namespace)
    }
}
