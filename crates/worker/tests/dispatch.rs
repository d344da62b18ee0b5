//! Dispatcher behaviour over the in-memory bus.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use serde_json::json;
use tokio_util::sync::CancellationToken;
use wiremock::matchers::{method, path};
use wiremock::{Mock, MockServer, ResponseTemplate};

use sdrelay_events::{CallbackPublisher, MemoryBus, MessageBus};
use sdrelay_pipeline::{JobProcessor, Pipeline};
use sdrelay_sdwebui::{ResilientClient, RetryPolicy, SdWebUiApi};
use sdrelay_storage::{BlobStore, BlobStoreConfig, MemoryBackend};
use sdrelay_worker::dispatcher::{DeliveryHandler, Dispatcher};

// ---------------------------------------------------------------------------
// Test handlers
// ---------------------------------------------------------------------------

/// Sleeps briefly and records the highest number of concurrent calls.
#[derive(Default)]
struct CountingHandler {
    running: AtomicUsize,
    peak: AtomicUsize,
    handled: AtomicUsize,
}

#[async_trait]
impl DeliveryHandler for CountingHandler {
    async fn handle(&self, _body: &[u8]) {
        let now = self.running.fetch_add(1, Ordering::SeqCst) + 1;
        self.peak.fetch_max(now, Ordering::SeqCst);
        tokio::time::sleep(Duration::from_millis(20)).await;
        self.running.fetch_sub(1, Ordering::SeqCst);
        self.handled.fetch_add(1, Ordering::SeqCst);
    }
}

struct PanickingHandler;

#[async_trait]
impl DeliveryHandler for PanickingHandler {
    async fn handle(&self, body: &[u8]) {
        if body == b"boom" {
            panic!("handler exploded");
        }
    }
}

async fn run_to_close<H: DeliveryHandler>(
    bus: Arc<MemoryBus>,
    handler: Arc<H>,
    concurrency: usize,
) {
    bus.close();
    Dispatcher::new(bus, handler, concurrency)
        .run(CancellationToken::new())
        .await;
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[tokio::test]
async fn every_delivery_is_handled_then_acked() {
    let bus = Arc::new(MemoryBus::new());
    let ids: Vec<String> = (0..5).map(|i| bus.push(format!("job-{i}"))).collect();
    let handler = Arc::new(CountingHandler::default());

    run_to_close(bus.clone(), handler.clone(), 2).await;

    assert_eq!(handler.handled.load(Ordering::SeqCst), 5);
    let mut acked = bus.acked();
    acked.sort();
    let mut expected = ids;
    expected.sort();
    assert_eq!(acked, expected);
}

#[tokio::test]
async fn concurrency_never_exceeds_the_bound() {
    let bus = Arc::new(MemoryBus::new());
    for i in 0..8 {
        bus.push(format!("job-{i}"));
    }
    let handler = Arc::new(CountingHandler::default());

    run_to_close(bus.clone(), handler.clone(), 3).await;

    assert!(handler.peak.load(Ordering::SeqCst) <= 3);
    assert_eq!(bus.acked().len(), 8);
}

#[tokio::test]
async fn single_slot_leaves_the_rest_on_the_bus() {
    let bus = Arc::new(MemoryBus::new());
    for i in 0..4 {
        bus.push(format!("job-{i}"));
    }
    let handler = Arc::new(CountingHandler::default());
    let cancel = CancellationToken::new();

    let dispatcher = Dispatcher::new(bus.clone(), handler.clone(), 1);
    let run = tokio::spawn({
        let cancel = cancel.clone();
        async move { dispatcher.run(cancel).await }
    });

    tokio::time::sleep(Duration::from_millis(5)).await;
    assert!(bus.pending() >= 2, "only one delivery may be held at a time");

    cancel.cancel();
    run.await.unwrap();
    assert_eq!(handler.peak.load(Ordering::SeqCst), 1);
    assert_eq!(bus.acked().len(), handler.handled.load(Ordering::SeqCst));
}

#[tokio::test]
async fn panicking_handler_still_acks() {
    let bus = Arc::new(MemoryBus::new());
    let boom = bus.push("boom");
    let fine = bus.push("fine");

    run_to_close(bus.clone(), Arc::new(PanickingHandler), 1).await;

    let acked = bus.acked();
    assert!(acked.contains(&boom));
    assert!(acked.contains(&fine));
}

#[tokio::test]
async fn failed_job_is_answered_once_and_acked() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path("/sdapi/v1/txt2img"))
        .respond_with(ResponseTemplate::new(503))
        .mount(&server)
        .await;

    let policy = RetryPolicy::new(1, 0.0, Duration::from_secs(5));
    let api = SdWebUiApi::new(ResilientClient::with_client(
        reqwest::Client::new(),
        server.uri(),
        policy,
        policy,
    ));
    let blobs = BlobStore::new(Arc::new(MemoryBackend::new()), BlobStoreConfig::default());
    let bus = Arc::new(MemoryBus::new());
    let publisher = CallbackPublisher::new(bus.clone() as Arc<dyn MessageBus>);
    let processor = JobProcessor::new(Pipeline::new(api, blobs.clone()), blobs, publisher);

    let id = bus.push(
        serde_json::to_vec(&json!({
            "callback_message": {"routing_key": "api.callback", "payload": {"job_id": "j"}},
            "requests": [{"endpoint": "sdapi/v1/txt2img", "payload": {"prompt": "a"}}]
        }))
        .unwrap(),
    );

    run_to_close(bus.clone(), Arc::new(processor), 1).await;

    assert_eq!(bus.acked(), vec![id]);
    let published = bus.published();
    assert_eq!(published.len(), 1);
    let payload = published[0].json().unwrap();
    assert!(payload["result_images"].is_null());
    assert_eq!(payload["job_id"], "j");
}
