//! Integration tests for the resilient transport and readiness gate,
//! against a mock WebUI served by `wiremock`.

use std::time::Duration;

use assert_matches::assert_matches;
use serde_json::json;
use wiremock::matchers::{body_partial_json, method, path};
use wiremock::{Mock, MockServer, ResponseTemplate};

use sdrelay_sdwebui::readiness::{wait_until_ready, ReadinessConfig, ReadinessError};
use sdrelay_sdwebui::{
    CallKind, ResilientClient, RetryPolicy, SdWebUiApi, SdWebUiError, TransportError,
};

fn fast_policy(retries: u32) -> RetryPolicy {
    RetryPolicy::new(retries, 0.0, Duration::from_secs(5))
}

fn client(server: &MockServer, retries: u32) -> ResilientClient {
    ResilientClient::with_client(
        reqwest::Client::new(),
        server.uri(),
        fast_policy(retries),
        fast_policy(retries),
    )
}

// ---------------------------------------------------------------------------
// Transport
// ---------------------------------------------------------------------------

#[tokio::test]
async fn retries_server_errors_then_succeeds() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path("/sdapi/v1/txt2img"))
        .respond_with(ResponseTemplate::new(503))
        .up_to_n_times(2)
        .expect(2)
        .mount(&server)
        .await;
    Mock::given(method("POST"))
        .and(path("/sdapi/v1/txt2img"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({"ok": true})))
        .expect(1)
        .mount(&server)
        .await;

    let value = client(&server, 3)
        .post_json("sdapi/v1/txt2img", &json!({}), CallKind::Post)
        .await
        .unwrap();
    assert_eq!(value, json!({"ok": true}));
}

#[tokio::test]
async fn exhausts_retry_budget_on_persistent_500() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .respond_with(ResponseTemplate::new(500).set_body_string("boom"))
        .expect(3)
        .mount(&server)
        .await;

    let err = client(&server, 2)
        .post_json("sdapi/v1/txt2img", &json!({}), CallKind::Post)
        .await
        .unwrap_err();
    assert_matches!(
        err,
        TransportError::Exhausted { attempts: 3, ref last_error, .. } if last_error.contains("boom")
    );
}

#[tokio::test]
async fn does_not_retry_client_errors() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .respond_with(ResponseTemplate::new(422).set_body_string("bad payload"))
        .expect(1)
        .mount(&server)
        .await;

    let err = client(&server, 5)
        .post_json("sdapi/v1/img2img", &json!({}), CallKind::Post)
        .await
        .unwrap_err();
    assert_eq!(err.status(), Some(422));
    assert_matches!(err, TransportError::Application { ref body, .. } if body == "bad payload");
}

#[tokio::test]
async fn connection_refused_is_retried_then_exhausted() {
    // Nothing listens on this port once the server is dropped.
    let uri = {
        let server = MockServer::start().await;
        server.uri()
    };
    let transport = ResilientClient::with_client(
        reqwest::Client::new(),
        uri,
        fast_policy(1),
        fast_policy(1),
    );

    let err = transport
        .get_json("sdapi/v1/progress", CallKind::Check)
        .await
        .unwrap_err();
    assert_matches!(err, TransportError::Exhausted { attempts: 2, .. });
}

#[tokio::test]
async fn empty_success_body_is_null() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path("/sdapi/v1/options/"))
        .respond_with(ResponseTemplate::new(200))
        .mount(&server)
        .await;

    let value = client(&server, 0)
        .post_json("sdapi/v1/options/", &json!({"sd_model_checkpoint": "x"}), CallKind::Post)
        .await
        .unwrap();
    assert!(value.is_null());
}

#[tokio::test]
async fn non_json_success_body_is_a_decode_error() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .respond_with(ResponseTemplate::new(200).set_body_string("<html>"))
        .expect(1)
        .mount(&server)
        .await;

    let err = client(&server, 3)
        .post_json("sdapi/v1/txt2img", &json!({}), CallKind::Post)
        .await
        .unwrap_err();
    assert_matches!(err, TransportError::Decode { .. });
}

// ---------------------------------------------------------------------------
// API wrappers
// ---------------------------------------------------------------------------

#[tokio::test]
async fn interrogate_sends_image_and_model() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path("/sdapi/v1/interrogate"))
        .and(body_partial_json(json!({"image": "AAAA", "model": "clip"})))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({"caption": "a cat"})))
        .expect(1)
        .mount(&server)
        .await;

    let api = SdWebUiApi::new(client(&server, 0));
    assert_eq!(api.interrogate("AAAA", "clip").await.unwrap(), "a cat");
}

#[tokio::test]
async fn generate_reports_unparseable_success() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({"images": []})))
        .mount(&server)
        .await;

    let api = SdWebUiApi::new(client(&server, 0));
    let err = api
        .generate("sdapi/v1/txt2img", &json!({}), None)
        .await
        .unwrap_err();
    assert_matches!(err, SdWebUiError::Response { .. });
}

// ---------------------------------------------------------------------------
// Readiness
// ---------------------------------------------------------------------------

fn readiness(max_polls: u32) -> ReadinessConfig {
    ReadinessConfig {
        initial_delay: Duration::ZERO,
        poll_interval: Duration::from_millis(10),
        max_polls,
    }
}

#[tokio::test]
async fn ready_once_queue_drains() {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .and(path("/sdapi/v1/progress"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({"state": {"job_count": 1}})))
        .up_to_n_times(2)
        .mount(&server)
        .await;
    Mock::given(method("GET"))
        .and(path("/sdapi/v1/progress"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({"state": {"job_count": 0}})))
        .mount(&server)
        .await;

    let api = SdWebUiApi::new(client(&server, 0));
    wait_until_ready(&api, &readiness(10)).await.unwrap();
}

#[tokio::test]
async fn stays_busy_is_fatal() {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .and(path("/sdapi/v1/progress"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({"state": {"job_count": 3}})))
        .expect(3)
        .mount(&server)
        .await;

    let api = SdWebUiApi::new(client(&server, 0));
    let err = wait_until_ready(&api, &readiness(3)).await.unwrap_err();
    assert_matches!(err, ReadinessError::Busy { polls: 3, job_count: 3 });
}

#[tokio::test]
async fn unreachable_backend_is_fatal() {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .respond_with(ResponseTemplate::new(502))
        .expect(2)
        .mount(&server)
        .await;

    let api = SdWebUiApi::new(client(&server, 1));
    let err = wait_until_ready(&api, &readiness(10)).await.unwrap_err();
    assert_matches!(err, ReadinessError::Unreachable(_));
}
