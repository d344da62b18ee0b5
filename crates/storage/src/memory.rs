//! In-process [`BlobBackend`] with TTL expiry.
//!
//! Expiry is checked lazily on read against [`tokio::time::Instant`], so
//! tests can drive it with a paused clock.

use std::collections::HashMap;
use std::sync::Mutex;
use std::time::Duration;

use async_trait::async_trait;
use tokio::time::Instant;

use crate::backend::{BlobBackend, BlobError};

#[derive(Debug, Clone)]
enum Entry {
    Value(String),
    List(Vec<String>),
}

#[derive(Debug, Default)]
pub struct MemoryBackend {
    entries: Mutex<HashMap<String, (Entry, Instant)>>,
}

impl MemoryBackend {
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of live (unexpired) keys.
    pub fn len(&self) -> usize {
        let now = Instant::now();
        self.lock().values().filter(|(_, exp)| *exp > now).count()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, HashMap<String, (Entry, Instant)>> {
        // A poisoned map only means a test panicked mid-write.
        self.entries.lock().unwrap_or_else(|e| e.into_inner())
    }

    fn live(&self, key: &str) -> Option<Entry> {
        live_entry(&mut self.lock(), key).cloned()
    }
}

/// The unexpired entry under `key`, evicting it if it has expired.
fn live_entry<'a>(
    entries: &'a mut HashMap<String, (Entry, Instant)>,
    key: &str,
) -> Option<&'a mut Entry> {
    if entries
        .get(key)
        .is_some_and(|(_, expires)| *expires <= Instant::now())
    {
        entries.remove(key);
    }
    entries.get_mut(key).map(|(entry, _)| entry)
}

#[async_trait]
impl BlobBackend for MemoryBackend {
    async fn set_with_ttl(&self, key: &str, value: &str, ttl: Duration) -> Result<(), BlobError> {
        self.lock().insert(
            key.to_string(),
            (Entry::Value(value.to_string()), Instant::now() + ttl),
        );
        Ok(())
    }

    async fn get(&self, key: &str) -> Result<Option<String>, BlobError> {
        Ok(match self.live(key) {
            Some(Entry::Value(v)) => Some(v),
            _ => None,
        })
    }

    async fn append_list(
        &self,
        key: &str,
        items: &[String],
        ttl: Duration,
    ) -> Result<Vec<String>, BlobError> {
        let mut entries = self.lock();
        let mut list = match live_entry(&mut entries, key) {
            Some(Entry::List(list)) => std::mem::take(list),
            _ => Vec::new(),
        };
        if items.is_empty() {
            return Ok(list);
        }
        list.extend(items.iter().cloned());
        entries.insert(
            key.to_string(),
            (Entry::List(list.clone()), Instant::now() + ttl),
        );
        Ok(list)
    }

    async fn read_list(&self, key: &str) -> Result<Vec<String>, BlobError> {
        Ok(match self.live(key) {
            Some(Entry::List(list)) => list,
            _ => Vec::new(),
        })
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use super::*;

    #[tokio::test(start_paused = true)]
    async fn values_expire_after_ttl() {
        let backend = MemoryBackend::new();
        backend
            .set_with_ttl("k", "v", Duration::from_secs(10))
            .await
            .unwrap();
        assert_eq!(backend.get("k").await.unwrap().as_deref(), Some("v"));

        tokio::time::advance(Duration::from_secs(11)).await;
        assert_eq!(backend.get("k").await.unwrap(), None);
        assert!(backend.is_empty());
    }

    #[tokio::test]
    async fn append_list_accumulates() {
        let backend = MemoryBackend::new();
        let ttl = Duration::from_secs(60);
        backend.append_list("l", &["a".into()], ttl).await.unwrap();
        let list = backend
            .append_list("l", &["b".into(), "c".into()], ttl)
            .await
            .unwrap();
        assert_eq!(list, vec!["a", "b", "c"]);
        assert_eq!(backend.read_list("l").await.unwrap(), list);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn concurrent_appends_keep_every_item() {
        let backend = Arc::new(MemoryBackend::new());
        let ttl = Duration::from_secs(60);

        let appends: Vec<_> = (0..64)
            .map(|i| {
                let backend = Arc::clone(&backend);
                tokio::spawn(async move {
                    backend.append_list("l", &[format!("ref-{i}")], ttl).await
                })
            })
            .collect();
        for append in appends {
            append.await.unwrap().unwrap();
        }

        let mut list = backend.read_list("l").await.unwrap();
        list.sort();
        let mut expected: Vec<String> = (0..64).map(|i| format!("ref-{i}")).collect();
        expected.sort();
        assert_eq!(list, expected);
    }
}
