//! Blob store behaviour over the in-memory backend.

use std::sync::Arc;
use std::time::Duration;

use assert_matches::assert_matches;

use sdrelay_storage::{BlobError, BlobStore, BlobStoreConfig, MemoryBackend};

fn store(blob_ttl: Duration) -> BlobStore {
    BlobStore::new(
        Arc::new(MemoryBackend::new()),
        BlobStoreConfig {
            blob_ttl,
            ..Default::default()
        },
    )
}

#[tokio::test(start_paused = true)]
async fn round_trip_until_expiry() {
    let store = store(Duration::from_secs(30));
    let reference = store.put("aGVsbG8=").await.unwrap();
    assert!(reference.starts_with("https://blobs.localhost/"));
    assert_eq!(store.get(&reference).await.unwrap(), "aGVsbG8=");

    tokio::time::advance(Duration::from_secs(31)).await;
    assert_matches!(store.get(&reference).await, Err(BlobError::NotFound(r)) if r == reference);
}

#[tokio::test]
async fn every_put_gets_a_fresh_reference() {
    let store = store(Duration::from_secs(30));
    let a = store.put("QQ==").await.unwrap();
    let b = store.put("QQ==").await.unwrap();
    assert_ne!(a, b);
}

#[tokio::test]
async fn unknown_reference_is_not_found() {
    let store = store(Duration::from_secs(30));
    assert_matches!(
        store.get("https://blobs.localhost/deadbeef").await,
        Err(BlobError::NotFound(_))
    );
}

#[tokio::test]
async fn tracking_set_appends_per_job() {
    let store = store(Duration::from_secs(30));
    let first = store.track("job-1", &["r1".into()]).await.unwrap();
    assert_eq!(first, vec!["r1"]);

    let second = store.track("job-1", &["r2".into(), "r3".into()]).await.unwrap();
    assert_eq!(second, vec!["r1", "r2", "r3"]);

    assert!(store.tracked("job-2").await.unwrap().is_empty());
    assert_eq!(store.tracked("job-1").await.unwrap(), second);
}
