// SPDX-License-Identifier: MIT OR Apache-2.0
//! HTTP pipeline tests against a live server on a random port.

use asap_core::{AgentUrn, Capabilities, Endpoints, Envelope, Manifest, Skill};
use asap_protocol::CompressionAlgorithm;
use asap_server::{
    AppState, HandlerError, HandlerRegistry, blocking_token_validator, build_app, handler_fn,
};
use asap_protocol::validate::ValidationConfig;
use asap_telemetry::MetricsCollector;
use serde_json::{Value, json};
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

fn urn(name: &str) -> AgentUrn {
    AgentUrn::parse(format!("urn:asap:agent:{name}")).unwrap()
}

fn manifest() -> Manifest {
    Manifest {
        id: urn("server"),
        version: "1.0.0".into(),
        name: "Test Agent".into(),
        description: "Echo agent for tests".into(),
        capabilities: Capabilities {
            asap_version: "0.1".into(),
            skills: vec![Skill {
                id: "echo".into(),
                description: Some("Echo input back".into()),
            }],
            features: Default::default(),
        },
        endpoints: Endpoints {
            asap: "http://localhost:8000/asap".into(),
            events: None,
        },
        auth: None,
        signature: None,
    }
}

fn echo_registry() -> Arc<HandlerRegistry> {
    let registry = Arc::new(HandlerRegistry::new());
    registry.register(
        "task.request",
        handler_fn(|envelope: Envelope, _manifest| async move {
            let input = envelope.payload().get("input").cloned().unwrap_or(Value::Null);
            envelope
                .reply()
                .payload_type("task.response")
                .payload_json(json!({
                    "task_id": format!("task-{}", envelope.id()),
                    "status": "completed",
                    "result": {"echoed": input},
                }))
                .map_err(|e| HandlerError::Failed(e.to_string()))?
                .build()
                .map_err(|e| HandlerError::Failed(e.to_string()))
        }),
    );
    registry
}

fn base_state() -> Arc<AppState> {
    AppState::builder(manifest(), echo_registry())
        .metrics(MetricsCollector::new())
        .build()
        .unwrap()
}

async fn spawn(state: Arc<AppState>) -> SocketAddr {
    let app = build_app(state);
    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(async move {
        axum::serve(listener, app).await.unwrap();
    });
    addr
}

fn request_envelope() -> Envelope {
    Envelope::builder()
        .sender(urn("a"))
        .recipient(urn("b"))
        .payload_type("task.request")
        .payload_json(json!({"conversation_id": "c1", "skill_id": "echo", "input": {"message": "hi"}}))
        .unwrap()
        .build()
        .unwrap()
}

fn rpc_frame(envelope: &Envelope, id: Value) -> Value {
    json!({
        "jsonrpc": "2.0",
        "method": "asap.send",
        "params": {"envelope": envelope},
        "id": id,
    })
}

async fn post_frame(addr: SocketAddr, frame: &Value) -> (u16, Value) {
    let client = reqwest::Client::new();
    let resp = client
        .post(format!("http://{addr}/asap"))
        .json(frame)
        .send()
        .await
        .unwrap();
    let status = resp.status().as_u16();
    let body: Value = resp.json().await.unwrap();
    (status, body)
}

#[tokio::test]
async fn health_and_ready_answer_ok() {
    let addr = spawn(base_state()).await;
    for path in ["/health", "/ready"] {
        let resp = reqwest::get(format!("http://{addr}{path}")).await.unwrap();
        assert_eq!(resp.status().as_u16(), 200);
        let body: Value = resp.json().await.unwrap();
        assert_eq!(body["status"], "ok");
    }
}

#[tokio::test]
async fn happy_path_echo_round_trip() {
    let addr = spawn(base_state()).await;
    let envelope = request_envelope();
    let (status, body) = post_frame(addr, &rpc_frame(&envelope, json!("req-1"))).await;

    assert_eq!(status, 200);
    assert_eq!(body["jsonrpc"], "2.0");
    assert_eq!(body["id"], "req-1");
    let reply = &body["result"]["envelope"];
    assert_eq!(reply["payload_type"], "task.response");
    assert_eq!(reply["correlation_id"], envelope.id());
    assert_eq!(reply["payload"]["status"], "completed");
    assert_eq!(reply["payload"]["result"]["echoed"], json!({"message": "hi"}));
    assert_eq!(reply["sender"], "urn:asap:agent:b");
    assert_eq!(reply["recipient"], "urn:asap:agent:a");
}

#[tokio::test]
async fn trace_id_is_preserved_through_the_handler() {
    let addr = spawn(base_state()).await;
    let envelope = Envelope::builder()
        .sender(urn("a"))
        .recipient(urn("b"))
        .payload_type("task.request")
        .payload_json(json!({"conversation_id": "c", "skill_id": "echo", "input": {}}))
        .unwrap()
        .trace_id("trace-abc")
        .build()
        .unwrap();
    let (_, body) = post_frame(addr, &rpc_frame(&envelope, json!(1))).await;
    assert_eq!(body["result"]["envelope"]["trace_id"], "trace-abc");
}

#[tokio::test]
async fn invalid_json_body_is_a_parse_error_with_null_id() {
    let addr = spawn(base_state()).await;
    let client = reqwest::Client::new();
    let resp = client
        .post(format!("http://{addr}/asap"))
        .header("Content-Type", "application/json")
        .body("{not json")
        .send()
        .await
        .unwrap();
    assert_eq!(resp.status().as_u16(), 200);
    let body: Value = resp.json().await.unwrap();
    assert_eq!(body["error"]["code"], -32700);
    assert_eq!(body["id"], Value::Null);
}

#[tokio::test]
async fn non_object_body_is_invalid_request() {
    let addr = spawn(base_state()).await;
    let (_, body) = post_frame(addr, &json!([1, 2, 3])).await;
    assert_eq!(body["error"]["code"], -32600);
}

#[tokio::test]
async fn unknown_method_is_method_not_found() {
    let addr = spawn(base_state()).await;
    let frame = json!({"jsonrpc": "2.0", "method": "asap.unknown", "params": {}, "id": 5});
    let (_, body) = post_frame(addr, &frame).await;
    assert_eq!(body["error"]["code"], -32601);
    assert_eq!(body["id"], 5);
}

#[tokio::test]
async fn non_object_params_is_invalid_params() {
    let addr = spawn(base_state()).await;
    let frame = json!({"jsonrpc": "2.0", "method": "asap.send", "params": [1], "id": 6});
    let (_, body) = post_frame(addr, &frame).await;
    assert_eq!(body["error"]["code"], -32602);
}

#[tokio::test]
async fn missing_envelope_is_invalid_params() {
    let addr = spawn(base_state()).await;
    let frame = json!({"jsonrpc": "2.0", "method": "asap.send", "params": {}, "id": 7});
    let (_, body) = post_frame(addr, &frame).await;
    assert_eq!(body["error"]["code"], -32602);
    assert!(body["error"]["message"].as_str().unwrap().contains("envelope"));
}

#[tokio::test]
async fn malformed_envelope_reports_validation_errors() {
    let addr = spawn(base_state()).await;
    let frame = json!({
        "jsonrpc": "2.0",
        "method": "asap.send",
        "params": {"envelope": {"sender": "not-a-urn"}},
        "id": 8,
    });
    let (_, body) = post_frame(addr, &frame).await;
    assert_eq!(body["error"]["code"], -32602);
    assert!(body["error"]["data"]["validation_errors"].is_array());
}

#[tokio::test]
async fn unknown_payload_type_is_method_not_found_with_data() {
    let addr = spawn(base_state()).await;
    let envelope = Envelope::builder()
        .sender(urn("a"))
        .recipient(urn("b"))
        .payload_type("mystery.op")
        .payload_json(json!({}))
        .unwrap()
        .build()
        .unwrap();
    let (_, body) = post_frame(addr, &rpc_frame(&envelope, json!(9))).await;
    assert_eq!(body["error"]["code"], -32601);
    assert_eq!(body["error"]["data"]["payload_type"], "mystery.op");
}

#[tokio::test]
async fn handler_failure_is_internal_error_with_detail_only_in_debug() {
    let failing = Arc::new(HandlerRegistry::new());
    failing.register(
        "task.request",
        handler_fn(|_envelope, _manifest| async move {
            Err(HandlerError::Failed("boom".into()))
        }),
    );

    // Non-debug: no detail.
    let state = AppState::builder(manifest(), failing.clone())
        .metrics(MetricsCollector::new())
        .build()
        .unwrap();
    let addr = spawn(state).await;
    let (_, body) = post_frame(addr, &rpc_frame(&request_envelope(), json!(10))).await;
    assert_eq!(body["error"]["code"], -32603);
    assert!(body["error"].get("data").is_none());

    // Debug: detail present.
    let state = AppState::builder(manifest(), failing)
        .metrics(MetricsCollector::new())
        .debug(true)
        .build()
        .unwrap();
    let addr = spawn(state).await;
    let (_, body) = post_frame(addr, &rpc_frame(&request_envelope(), json!(11))).await;
    assert_eq!(body["error"]["code"], -32603);
    assert!(body["error"]["data"]["error"].as_str().unwrap().contains("boom"));
}

#[tokio::test]
async fn duplicate_nonce_is_rejected_on_the_second_request() {
    let state = AppState::builder(manifest(), echo_registry())
        .metrics(MetricsCollector::new())
        .validation(ValidationConfig {
            require_nonce: true,
            ..ValidationConfig::default()
        })
        .build()
        .unwrap();
    let addr = spawn(state).await;

    let make = || {
        Envelope::builder()
            .sender(urn("a"))
            .recipient(urn("b"))
            .payload_type("task.request")
            .payload_json(json!({"conversation_id": "c", "skill_id": "echo", "input": {}}))
            .unwrap()
            .nonce("n1")
            .build()
            .unwrap()
    };

    let (_, first) = post_frame(addr, &rpc_frame(&make(), json!(1))).await;
    assert!(first.get("result").is_some(), "first request should pass: {first}");

    let (_, second) = post_frame(addr, &rpc_frame(&make(), json!(2))).await;
    assert_eq!(second["error"]["code"], -32602);
    assert!(second["error"]["message"].as_str().unwrap().contains("nonce"));
}

#[tokio::test]
async fn stale_timestamp_is_rejected_before_the_nonce_is_stored() {
    let state = AppState::builder(manifest(), echo_registry())
        .metrics(MetricsCollector::new())
        .validation(ValidationConfig {
            require_nonce: true,
            ..ValidationConfig::default()
        })
        .build()
        .unwrap();
    let addr = spawn(state).await;

    let stale = Envelope::builder()
        .sender(urn("a"))
        .recipient(urn("b"))
        .payload_type("task.request")
        .payload_json(json!({"conversation_id": "c", "skill_id": "echo", "input": {}}))
        .unwrap()
        .nonce("n2")
        .timestamp(chrono::Utc::now() - chrono::Duration::minutes(10))
        .build()
        .unwrap();
    let (_, body) = post_frame(addr, &rpc_frame(&stale, json!(1))).await;
    assert_eq!(body["error"]["code"], -32602);
    assert!(body["error"]["message"].as_str().unwrap().contains("timestamp"));

    // The nonce was never stored: a fresh envelope reusing it passes.
    let fresh = Envelope::builder()
        .sender(urn("a"))
        .recipient(urn("b"))
        .payload_type("task.request")
        .payload_json(json!({"conversation_id": "c", "skill_id": "echo", "input": {}}))
        .unwrap()
        .nonce("n2")
        .build()
        .unwrap();
    let (_, body) = post_frame(addr, &rpc_frame(&fresh, json!(2))).await;
    assert!(body.get("result").is_some(), "nonce n2 should still be fresh: {body}");
}

#[tokio::test]
async fn oversized_request_is_413() {
    let state = AppState::builder(manifest(), echo_registry())
        .metrics(MetricsCollector::new())
        .max_request_size(2048)
        .build()
        .unwrap();
    let addr = spawn(state).await;

    let client = reqwest::Client::new();
    let resp = client
        .post(format!("http://{addr}/asap"))
        .header("Content-Type", "application/json")
        .body("x".repeat(4096))
        .send()
        .await
        .unwrap();
    assert_eq!(resp.status().as_u16(), 413);
    let body: Value = resp.json().await.unwrap();
    assert_eq!(body["code"], "asap:transport/request_too_large");
}

#[tokio::test]
async fn compressed_request_body_is_accepted() {
    let addr = spawn(base_state()).await;
    let frame = rpc_frame(&request_envelope(), json!("req-gz"));
    let raw = serde_json::to_vec(&frame).unwrap();
    let compressed = asap_protocol::encode(CompressionAlgorithm::Gzip, &raw).unwrap();

    let client = reqwest::Client::new();
    let resp = client
        .post(format!("http://{addr}/asap"))
        .header("Content-Type", "application/json")
        .header("Content-Encoding", "gzip")
        .body(compressed)
        .send()
        .await
        .unwrap();
    assert_eq!(resp.status().as_u16(), 200);
    let body: Value = resp.json().await.unwrap();
    assert_eq!(body["result"]["envelope"]["payload_type"], "task.response");
}

#[tokio::test]
async fn decompression_bomb_is_413() {
    let state = AppState::builder(manifest(), echo_registry())
        .metrics(MetricsCollector::new())
        .max_request_size(4096)
        .build()
        .unwrap();
    let addr = spawn(state).await;

    // ~1 MiB of zeros compresses well under the 4 KiB request cap.
    let bomb = asap_protocol::encode(CompressionAlgorithm::Gzip, &vec![0u8; 1 << 20]).unwrap();
    assert!(bomb.len() < 4096);

    let client = reqwest::Client::new();
    let resp = client
        .post(format!("http://{addr}/asap"))
        .header("Content-Encoding", "gzip")
        .body(bomb)
        .send()
        .await
        .unwrap();
    assert_eq!(resp.status().as_u16(), 413);
}

#[tokio::test]
async fn unknown_encoding_is_415_and_corrupt_body_is_400() {
    let addr = spawn(base_state()).await;
    let client = reqwest::Client::new();

    let resp = client
        .post(format!("http://{addr}/asap"))
        .header("Content-Encoding", "snappy")
        .body("{}")
        .send()
        .await
        .unwrap();
    assert_eq!(resp.status().as_u16(), 415);

    let resp = client
        .post(format!("http://{addr}/asap"))
        .header("Content-Encoding", "gzip")
        .body("definitely not gzip")
        .send()
        .await
        .unwrap();
    assert_eq!(resp.status().as_u16(), 400);
}

#[tokio::test]
async fn responses_are_compressed_when_the_client_accepts_gzip() {
    let addr = spawn(base_state()).await;

    // A large input makes the reply exceed the compression threshold.
    let envelope = Envelope::builder()
        .sender(urn("a"))
        .recipient(urn("b"))
        .payload_type("task.request")
        .payload_json(json!({
            "conversation_id": "c",
            "skill_id": "echo",
            "input": {"blob": "z".repeat(4096)},
        }))
        .unwrap()
        .build()
        .unwrap();

    let client = reqwest::Client::new();
    let resp = client
        .post(format!("http://{addr}/asap"))
        .header("Accept-Encoding", "gzip")
        .json(&rpc_frame(&envelope, json!(1)))
        .send()
        .await
        .unwrap();
    assert_eq!(resp.status().as_u16(), 200);
    assert_eq!(
        resp.headers().get("content-encoding").map(|v| v.to_str().unwrap()),
        Some("gzip")
    );
    let raw = resp.bytes().await.unwrap();
    let decoded =
        asap_protocol::decompress(CompressionAlgorithm::Gzip, &raw, 10 * 1024 * 1024).unwrap();
    let body: Value = serde_json::from_slice(&decoded).unwrap();
    assert_eq!(body["result"]["envelope"]["payload_type"], "task.response");
}

#[tokio::test]
async fn bearer_auth_gates_the_pipeline() {
    let mut manifest = manifest();
    manifest.auth = Some(asap_core::AuthScheme {
        schemes: vec!["bearer".into()],
        oauth2: None,
    });
    let state = AppState::builder(manifest, echo_registry())
        .metrics(MetricsCollector::new())
        .token_validator(blocking_token_validator(|token| {
            (token == "sekrit").then(|| AgentUrn::parse("urn:asap:agent:a").unwrap())
        }))
        .build()
        .unwrap();
    let addr = spawn(state).await;
    let client = reqwest::Client::new();
    let frame = rpc_frame(&request_envelope(), json!(1));

    // Missing credentials: HTTP 200 with a JSON-RPC invalid-request body.
    let resp = client
        .post(format!("http://{addr}/asap"))
        .json(&frame)
        .send()
        .await
        .unwrap();
    assert_eq!(resp.status().as_u16(), 200);
    let body: Value = resp.json().await.unwrap();
    assert_eq!(body["error"]["code"], -32600);
    assert_eq!(body["error"]["data"]["error"], "Authentication required");
    assert_eq!(body["id"], 1);

    // Wrong token.
    let resp = client
        .post(format!("http://{addr}/asap"))
        .bearer_auth("wrong")
        .json(&frame)
        .send()
        .await
        .unwrap();
    assert_eq!(resp.status().as_u16(), 200);
    let body: Value = resp.json().await.unwrap();
    assert_eq!(body["error"]["code"], -32600);
    assert_eq!(body["error"]["data"]["error"], "Invalid authentication token");

    // Valid token and matching sender.
    let resp = client
        .post(format!("http://{addr}/asap"))
        .bearer_auth("sekrit")
        .json(&frame)
        .send()
        .await
        .unwrap();
    assert_eq!(resp.status().as_u16(), 200);
    let body: Value = resp.json().await.unwrap();
    assert!(body.get("result").is_some());

    // Valid token but spoofed sender: 403 with an invalid-request body.
    let spoofed = Envelope::builder()
        .sender(urn("spoofed"))
        .recipient(urn("b"))
        .payload_type("task.request")
        .payload_json(json!({"conversation_id": "c", "skill_id": "echo", "input": {}}))
        .unwrap()
        .build()
        .unwrap();
    let resp = client
        .post(format!("http://{addr}/asap"))
        .bearer_auth("sekrit")
        .json(&rpc_frame(&spoofed, json!(2)))
        .send()
        .await
        .unwrap();
    assert_eq!(resp.status().as_u16(), 403);
    let body: Value = resp.json().await.unwrap();
    assert_eq!(body["error"]["code"], -32600);
}

#[tokio::test]
async fn missing_token_validator_is_a_configuration_error() {
    let mut manifest = manifest();
    manifest.auth = Some(asap_core::AuthScheme {
        schemes: vec!["bearer".into()],
        oauth2: None,
    });
    let err = AppState::builder(manifest, echo_registry()).build().unwrap_err();
    assert!(err.to_string().contains("token validator"));
}

#[tokio::test]
async fn rate_limited_requests_get_429_with_retry_after() {
    let state = AppState::builder(manifest(), echo_registry())
        .metrics(MetricsCollector::new())
        .rate_limit(2, Duration::from_secs(60))
        .build()
        .unwrap();
    let addr = spawn(state).await;
    let client = reqwest::Client::new();

    for _ in 0..2 {
        let resp = client
            .post(format!("http://{addr}/asap"))
            .json(&rpc_frame(&request_envelope(), json!(1)))
            .send()
            .await
            .unwrap();
        assert_eq!(resp.status().as_u16(), 200);
    }
    let resp = client
        .post(format!("http://{addr}/asap"))
        .json(&rpc_frame(&request_envelope(), json!(1)))
        .send()
        .await
        .unwrap();
    assert_eq!(resp.status().as_u16(), 429);
    assert!(resp.headers().get("retry-after").is_some());
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn pool_exhaustion_returns_structured_503() {
    let registry = Arc::new(HandlerRegistry::with_max_threads(1));
    registry.register_blocking("task.request", |envelope: Envelope, _manifest| {
        std::thread::sleep(Duration::from_millis(500));
        envelope
            .reply()
            .payload_type("task.response")
            .payload_json(json!({"task_id": "t", "status": "completed"}))
            .map_err(|e| HandlerError::Failed(e.to_string()))?
            .build()
            .map_err(|e| HandlerError::Failed(e.to_string()))
    });
    let state = AppState::builder(manifest(), registry)
        .metrics(MetricsCollector::new())
        .build()
        .unwrap();
    let addr = spawn(state).await;

    let first = tokio::spawn(async move {
        let client = reqwest::Client::new();
        client
            .post(format!("http://{addr}/asap"))
            .json(&rpc_frame(&request_envelope(), json!(1)))
            .send()
            .await
            .unwrap()
            .status()
            .as_u16()
    });
    tokio::time::sleep(Duration::from_millis(100)).await;

    let client = reqwest::Client::new();
    let resp = client
        .post(format!("http://{addr}/asap"))
        .json(&rpc_frame(&request_envelope(), json!(2)))
        .send()
        .await
        .unwrap();
    assert_eq!(resp.status().as_u16(), 503);
    let body: Value = resp.json().await.unwrap();
    assert_eq!(body["code"], "asap:transport/thread_pool_exhausted");
    assert_eq!(body["details"]["max_threads"], 1);

    assert_eq!(first.await.unwrap(), 200);
}

#[tokio::test]
async fn manifest_endpoint_sets_cache_headers_and_serves_304() {
    let addr = spawn(base_state()).await;
    let client = reqwest::Client::new();

    let resp = client
        .get(format!("http://{addr}/.well-known/asap/manifest.json"))
        .send()
        .await
        .unwrap();
    assert_eq!(resp.status().as_u16(), 200);
    assert_eq!(
        resp.headers().get("cache-control").unwrap().to_str().unwrap(),
        "public, max-age=300"
    );
    let etag = resp.headers().get("etag").unwrap().to_str().unwrap().to_string();
    let body: Value = resp.json().await.unwrap();
    assert_eq!(body["id"], "urn:asap:agent:server");

    let resp = client
        .get(format!("http://{addr}/.well-known/asap/manifest.json"))
        .header("If-None-Match", &etag)
        .send()
        .await
        .unwrap();
    assert_eq!(resp.status().as_u16(), 304);
    assert!(resp.bytes().await.unwrap().is_empty());
}

#[tokio::test]
async fn metrics_endpoint_exposes_request_counters() {
    let metrics = MetricsCollector::new();
    let state = AppState::builder(manifest(), echo_registry())
        .metrics(metrics.clone())
        .build()
        .unwrap();
    let addr = spawn(state).await;

    post_frame(addr, &rpc_frame(&request_envelope(), json!(1))).await;

    let text = reqwest::get(format!("http://{addr}/asap/metrics"))
        .await
        .unwrap()
        .text()
        .await
        .unwrap();
    assert!(text.contains("asap_server_requests_total"));
    assert!(text.contains("payload_type=\"task.request\""));
}

#[tokio::test]
async fn unknown_payload_types_bucket_under_other_in_metrics() {
    let metrics = MetricsCollector::new();
    let state = AppState::builder(manifest(), echo_registry())
        .metrics(metrics.clone())
        .build()
        .unwrap();
    let addr = spawn(state).await;

    for i in 0..3 {
        let envelope = Envelope::builder()
            .sender(urn("a"))
            .recipient(urn("b"))
            .payload_type(format!("random.type.{i}"))
            .payload_json(json!({}))
            .unwrap()
            .build()
            .unwrap();
        post_frame(addr, &rpc_frame(&envelope, json!(i))).await;
    }

    let labels = asap_telemetry::labels(&[("payload_type", "other"), ("status", "error")]);
    assert_eq!(metrics.counter_value("asap_server_requests_total", &labels), 3);
}

#[tokio::test]
async fn usage_routes_are_absent_without_a_store() {
    let addr = spawn(base_state()).await;
    let resp = reqwest::get(format!("http://{addr}/usage")).await.unwrap();
    assert_eq!(resp.status().as_u16(), 404);
}
