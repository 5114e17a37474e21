//! Integration tests for the HTTP gateway.
//!
//! Requests go straight into the axum router with `tower::ServiceExt::oneshot`;
//! no socket is opened. Sessions run the built-in `echo-cli` tool.
//!
//! Tests CAN use `.unwrap()` and `.expect()`.

use std::sync::Arc;
use std::time::Duration;

use axum::body::Body;
use axum::http::{Request, Response, StatusCode};
use axum::Router;
use futures_util::StreamExt;
use serde_json::{json, Value};
use tempfile::TempDir;
use tokio::time::timeout;
use tower::ServiceExt;

use clibridge_protocol::{ProtocolVersion, PROTOCOL_HEADER};
use clibridged::certs::{CertMode, CertificateConfig, CertificateManager};
use clibridged::gateway::{router, AppState, GatewayConfig, API_KEY_HEADER, DEVICE_ID_HEADER};
use clibridged::registry::{spawn_registry, RegistryConfig, RegistryHandle};

const KEY: &str = "test-key";

// ============================================================================
// Test Helpers
// ============================================================================

struct Harness {
    app: Router,
    registry: RegistryHandle,
    certs: Arc<CertificateManager>,
    _tmp: TempDir,
}

fn test_registry_config() -> RegistryConfig {
    RegistryConfig {
        sweep_interval: Duration::from_secs(3600),
        grace_period: Duration::from_millis(500),
        ..RegistryConfig::default()
    }
}

fn harness() -> Harness {
    harness_with(test_registry_config())
}

fn harness_with(registry_config: RegistryConfig) -> Harness {
    let tmp = tempfile::tempdir().unwrap();
    let certs = Arc::new(CertificateManager::new(CertificateConfig {
        mode: CertMode::SelfSigned,
        self_signed_dir: tmp.path().join("self_signed"),
        external_cert_path: tmp.path().join("cert.pem"),
        external_key_path: tmp.path().join("key.pem"),
        hostname: "localhost".to_string(),
        subject_alt_names: vec!["127.0.0.1".to_string()],
    }));

    let registry = spawn_registry(registry_config);

    let state = AppState::new(
        registry.clone(),
        GatewayConfig {
            api_key: KEY.to_string(),
            heartbeat_interval: Duration::from_secs(15),
            event_rate_limit: Duration::ZERO,
        },
        Arc::clone(&certs),
    );

    Harness {
        app: router(state),
        registry,
        certs,
        _tmp: tmp,
    }
}

fn request(method: &str, uri: &str, device: &str, body: Option<Value>) -> Request<Body> {
    let builder = Request::builder()
        .method(method)
        .uri(uri)
        .header(API_KEY_HEADER, KEY)
        .header(DEVICE_ID_HEADER, device);

    match body {
        Some(body) => builder
            .header("content-type", "application/json")
            .body(Body::from(body.to_string()))
            .unwrap(),
        None => builder.body(Body::empty()).unwrap(),
    }
}

impl Harness {
    async fn send(&self, request: Request<Body>) -> Response<Body> {
        self.app.clone().oneshot(request).await.unwrap()
    }

    async fn call(&self, method: &str, uri: &str, body: Option<Value>) -> (StatusCode, Value) {
        let response = self.send(request(method, uri, "phone", body)).await;
        let status = response.status();
        let bytes = axum::body::to_bytes(response.into_body(), usize::MAX)
            .await
            .unwrap();
        let value = if bytes.is_empty() {
            Value::Null
        } else {
            serde_json::from_slice(&bytes).unwrap()
        };
        (status, value)
    }

    async fn create_echo(&self) -> String {
        let (status, body) = self.call("POST", "/session", Some(json!({"tool": "echo-cli"}))).await;
        assert_eq!(status, StatusCode::CREATED);
        body["session_id"].as_str().unwrap().to_string()
    }

    async fn cleanup(&self, id: &str) {
        let _ = self.call("DELETE", &format!("/session/{id}"), None).await;
    }
}

/// Reads an SSE body until the accumulated text contains `needle`.
async fn read_until(body: &mut axum::body::BodyDataStream, seen: &mut String, needle: &str) {
    timeout(Duration::from_secs(10), async {
        while !seen.contains(needle) {
            match body.next().await {
                Some(Ok(chunk)) => seen.push_str(&String::from_utf8_lossy(&chunk)),
                _ => break,
            }
        }
    })
    .await
    .expect("stream did not produce expected text");
    assert!(seen.contains(needle), "stream ended before {needle:?}: {seen}");
}

/// SSE `id:` values in the order they appeared.
fn event_ids(text: &str) -> Vec<u64> {
    text.lines()
        .filter_map(|line| line.strip_prefix("id: "))
        .map(|id| id.trim().parse().unwrap())
        .collect()
}

fn events_request(id: &str, last_event_id: Option<u64>) -> Request<Body> {
    let mut req = request("GET", &format!("/session/{id}/events"), "phone", None);
    if let Some(last) = last_event_id {
        req.headers_mut()
            .insert("last-event-id", last.to_string().parse().unwrap());
    }
    req
}

async fn wait_until_detached(registry: &RegistryHandle, id: &str) {
    for _ in 0..100 {
        let view = registry.get_session(id.to_string().into()).await.unwrap();
        if !view.attached {
            return;
        }
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
    panic!("consumer never detached from {id}");
}

// ============================================================================
// Authentication
// ============================================================================

#[tokio::test]
async fn test_missing_key_rejected_without_side_effects() {
    let h = harness();

    let response = h
        .send(
            Request::builder()
                .method("POST")
                .uri("/session")
                .header("content-type", "application/json")
                .body(Body::from(json!({"tool": "echo-cli"}).to_string()))
                .unwrap(),
        )
        .await;
    assert_eq!(response.status(), StatusCode::UNAUTHORIZED);
    assert_eq!(h.registry.session_count().await, 0);
}

#[tokio::test]
async fn test_wrong_key_and_bearer_token() {
    let h = harness();

    let wrong = Request::builder()
        .uri("/sessions")
        .header(API_KEY_HEADER, "nope")
        .body(Body::empty())
        .unwrap();
    assert_eq!(h.send(wrong).await.status(), StatusCode::UNAUTHORIZED);

    let bearer = Request::builder()
        .uri("/sessions")
        .header("authorization", format!("Bearer {KEY}"))
        .body(Body::empty())
        .unwrap();
    assert_eq!(h.send(bearer).await.status(), StatusCode::OK);
}

#[tokio::test]
async fn test_invalid_device_id() {
    let h = harness();
    let response = h.send(request("GET", "/sessions", "bad id!", None)).await;
    assert_eq!(response.status(), StatusCode::BAD_REQUEST);
}

// ============================================================================
// Sessions
// ============================================================================

#[tokio::test]
async fn test_unknown_tool_is_bad_request() {
    let h = harness();
    let (status, body) = h.call("POST", "/session", Some(json!({"tool": "vim"}))).await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
    assert_eq!(body["error"], "bad_request");
    assert!(h.registry.list_sessions(None).await.is_empty());
}

#[tokio::test]
async fn test_malformed_body_is_bad_request() {
    let h = harness();
    let response = h
        .send(
            Request::builder()
                .method("POST")
                .uri("/session")
                .header(API_KEY_HEADER, KEY)
                .header("content-type", "application/json")
                .body(Body::from("{not json"))
                .unwrap(),
        )
        .await;
    assert_eq!(response.status(), StatusCode::BAD_REQUEST);
}

#[tokio::test]
async fn test_create_list_get() {
    let h = harness();
    let id = h.create_echo().await;

    let (status, body) = h.call("GET", "/sessions", None).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["sessions"].as_array().unwrap().len(), 1);

    let (status, body) = h.call("GET", &format!("/session/{id}"), None).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["tool"], "echo-cli");
    assert_eq!(body["state"], "running");

    let (status, _) = h.call("GET", "/session/does-not-exist", None).await;
    assert_eq!(status, StatusCode::NOT_FOUND);

    let other = h.send(request("GET", &format!("/session/{id}"), "laptop", None)).await;
    assert_eq!(other.status(), StatusCode::FORBIDDEN);

    h.cleanup(&id).await;
}

#[tokio::test]
async fn test_resume_by_session_id() {
    let h = harness();
    let id = h.create_echo().await;

    let (status, body) = h
        .call("POST", "/session", Some(json!({"tool": "echo-cli", "session_id": id})))
        .await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["resumed"], true);
    assert_eq!(body["session_id"], id.as_str());

    let (status, _) = h
        .call("POST", "/session", Some(json!({"tool": "claude", "session_id": id})))
        .await;
    assert_eq!(status, StatusCode::CONFLICT);

    h.cleanup(&id).await;
}

#[tokio::test]
async fn test_input_and_terminate() {
    let h = harness();
    let id = h.create_echo().await;

    let (status, body) = h
        .call("POST", &format!("/session/{id}/input"), Some(json!({"line": "hi"})))
        .await;
    assert_eq!(status, StatusCode::ACCEPTED);
    assert_eq!(body["bytes"], 3);

    let (status, _) = h
        .call(
            "POST",
            &format!("/session/{id}/input"),
            Some(json!({"line": "a", "text": "b"})),
        )
        .await;
    assert_eq!(status, StatusCode::BAD_REQUEST);

    let (status, _) = h.call("DELETE", &format!("/session/{id}"), None).await;
    assert_eq!(status, StatusCode::NO_CONTENT);

    let (status, body) = h
        .call("POST", &format!("/session/{id}/input"), Some(json!({"line": "late"})))
        .await;
    assert_eq!(status, StatusCode::GONE);
    assert_eq!(body["error"], "process_gone");
}

// ============================================================================
// Event Streams
// ============================================================================

#[tokio::test]
async fn test_event_stream_delivers_output_and_exit() {
    let h = harness();
    let id = h.create_echo().await;

    let response = h
        .send(request("GET", &format!("/session/{id}/events"), "phone", None))
        .await;
    assert_eq!(response.status(), StatusCode::OK);
    assert_eq!(
        response.headers().get("content-type").unwrap(),
        "text/event-stream"
    );
    let mut body = response.into_body().into_data_stream();

    // Only one consumer at a time
    let second = h
        .send(request("GET", &format!("/session/{id}/events"), "phone", None))
        .await;
    assert_eq!(second.status(), StatusCode::CONFLICT);

    let (status, _) = h
        .call("POST", &format!("/session/{id}/input"), Some(json!({"line": "hello"})))
        .await;
    assert_eq!(status, StatusCode::ACCEPTED);

    let mut seen = String::new();
    read_until(&mut body, &mut seen, "ack hello").await;
    assert!(seen.contains("event: output"));
    assert!(seen.contains("id: 1"));

    let (status, _) = h.call("DELETE", &format!("/session/{id}"), None).await;
    assert_eq!(status, StatusCode::NO_CONTENT);

    read_until(&mut body, &mut seen, "event: exit").await;

    // Stream ends after EXIT and the acknowledged session is removed
    let end = timeout(Duration::from_secs(5), body.next()).await.unwrap();
    assert!(end.is_none());

    let mut removed = false;
    for _ in 0..50 {
        if h.registry.get_session(id.clone().into()).await.is_none() {
            removed = true;
            break;
        }
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
    assert!(removed);
}

#[tokio::test]
async fn test_reconnect_resumes_after_last_event_id() {
    let h = harness();
    let id = h.create_echo().await;

    let response = h.send(events_request(&id, None)).await;
    let mut body = response.into_body().into_data_stream();
    let mut first = String::new();
    for line in ["one", "two"] {
        h.call("POST", &format!("/session/{id}/input"), Some(json!({"line": line})))
            .await;
        read_until(&mut body, &mut first, &format!("ack {line}")).await;
    }
    let first_ids = event_ids(&first);
    let last_seen = *first_ids.last().unwrap();
    assert_eq!(first_ids, (1..=last_seen).collect::<Vec<_>>());

    // Disconnect, then produce output while nobody is attached
    drop(body);
    wait_until_detached(&h.registry, &id).await;
    let (status, _) = h
        .call("POST", &format!("/session/{id}/input"), Some(json!({"line": "three"})))
        .await;
    assert_eq!(status, StatusCode::ACCEPTED);

    let response = h.send(events_request(&id, Some(last_seen))).await;
    assert_eq!(response.status(), StatusCode::OK);
    let mut body = response.into_body().into_data_stream();
    let mut second = String::new();
    read_until(&mut body, &mut second, "ack three").await;

    let second_ids = event_ids(&second);
    assert_eq!(second_ids.first(), Some(&(last_seen + 1)));
    let expected: Vec<u64> = (last_seen + 1..=*second_ids.last().unwrap()).collect();
    assert_eq!(second_ids, expected);
    assert!(!second.contains("ack two"));
    assert!(!second.contains("event: gap"));

    drop(body);
    h.cleanup(&id).await;
}

#[tokio::test]
async fn test_gap_frame_after_eviction() {
    let h = harness_with(RegistryConfig {
        event_log_capacity: 2,
        ..test_registry_config()
    });
    let id = h.create_echo().await;

    for line in ["one", "two", "three"] {
        h.call("POST", &format!("/session/{id}/input"), Some(json!({"line": line})))
            .await;
    }

    // Wait for the last ack without holding the consumer slot
    let phone = clibridge_core::Principal::parse("phone").unwrap();
    let mut done = false;
    for _ in 0..200 {
        let lease = h.registry.attach(id.clone().into(), phone.clone()).await.unwrap();
        let tail: String = lease
            .feed()
            .replay_from(0)
            .events()
            .iter()
            .map(|e| String::from_utf8_lossy(e.payload.bytes()).into_owned())
            .collect();
        lease.release().await;
        if tail.contains("ack three") {
            done = true;
            break;
        }
        tokio::time::sleep(Duration::from_millis(25)).await;
    }
    assert!(done, "echo never acknowledged the last line");

    let response = h.send(events_request(&id, Some(0))).await;
    let mut body = response.into_body().into_data_stream();
    let mut seen = String::new();
    read_until(&mut body, &mut seen, "ack three").await;

    assert!(seen.starts_with("event: gap"), "gap must come first: {seen}");
    assert!(seen.contains("\"requested_after\":0"));
    let ids = event_ids(&seen);
    assert!(ids.len() <= 2);
    assert!(ids[0] > 1);

    drop(body);
    h.cleanup(&id).await;
}

#[tokio::test]
async fn test_reconnect_after_exit_ends_stream() {
    let h = harness_with(RegistryConfig {
        tool_overrides: clibridge_core::ToolOverrides {
            codex: Some("true".to_string()),
            ..Default::default()
        },
        ..test_registry_config()
    });
    let (status, created) = h.call("POST", "/session", Some(json!({"tool": "codex"}))).await;
    assert_eq!(status, StatusCode::CREATED);
    let id = created["session_id"].as_str().unwrap().to_string();

    let mut exited = false;
    for _ in 0..100 {
        let view = h.registry.get_session(id.clone().into()).await.unwrap();
        if view.state.is_terminal() {
            exited = true;
            break;
        }
        tokio::time::sleep(Duration::from_millis(50)).await;
    }
    assert!(exited);

    // The only event is EXIT with id 1; the client already saw it
    let response = h.send(events_request(&id, Some(1))).await;
    assert_eq!(response.status(), StatusCode::OK);
    let mut body = response.into_body().into_data_stream();
    let end = timeout(Duration::from_secs(5), body.next()).await.unwrap();
    assert!(end.is_none());

    assert!(h.registry.get_session(id.into()).await.is_none());
}

#[tokio::test]
async fn test_invalid_last_event_id() {
    let h = harness();
    let id = h.create_echo().await;

    let mut req = request("GET", &format!("/session/{id}/events"), "phone", None);
    req.headers_mut()
        .insert("last-event-id", "yesterday".parse().unwrap());
    assert_eq!(h.send(req).await.status(), StatusCode::BAD_REQUEST);

    h.cleanup(&id).await;
}

// ============================================================================
// Daemon Routes
// ============================================================================

#[tokio::test]
async fn test_health_is_public_and_versioned() {
    let h = harness();
    let response = h
        .send(Request::builder().uri("/health").body(Body::empty()).unwrap())
        .await;
    assert_eq!(response.status(), StatusCode::OK);
    assert_eq!(
        response.headers().get(PROTOCOL_HEADER).unwrap(),
        ProtocolVersion::CURRENT.to_string().as_str()
    );
}

#[tokio::test]
async fn test_incompatible_protocol_rejected() {
    let h = harness();
    let response = h
        .send(
            Request::builder()
                .uri("/health")
                .header(PROTOCOL_HEADER, "99.0")
                .body(Body::empty())
                .unwrap(),
        )
        .await;
    assert_eq!(response.status(), StatusCode::BAD_REQUEST);
}

#[tokio::test]
async fn test_newer_minor_protocol_accepted() {
    let h = harness();
    let newer = ProtocolVersion::new(ProtocolVersion::CURRENT.major, ProtocolVersion::CURRENT.minor + 1);
    let response = h
        .send(
            Request::builder()
                .uri("/health")
                .header(PROTOCOL_HEADER, newer.to_string())
                .body(Body::empty())
                .unwrap(),
        )
        .await;
    assert_eq!(response.status(), StatusCode::OK);
}

#[tokio::test]
async fn test_certificate_routes() {
    let h = harness();

    let (status, _) = h.call("GET", "/certificate", None).await;
    assert_eq!(status, StatusCode::SERVICE_UNAVAILABLE);

    let material = h.certs.ensure().unwrap();
    let (status, body) = h.call("GET", "/certificate", None).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["fingerprint"], material.fingerprint.as_str());
    assert_eq!(body["provenance"], "self_signed");

    let (status, body) = h.call("POST", "/certificate/reload", None).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["changed"], false);
    assert_eq!(body["fingerprint"], material.fingerprint.as_str());

    let unauthenticated = h
        .send(
            Request::builder()
                .method("POST")
                .uri("/certificate/reload")
                .body(Body::empty())
                .unwrap(),
        )
        .await;
    assert_eq!(unauthenticated.status(), StatusCode::UNAUTHORIZED);
}
