//! Integration tests that run the API in-process
//!
//! The worker pool uses in-process workers with the echo backend, so these
//! tests need no GPU and no child processes.

use axum_test::TestServer;
use infer_mux::{
    InProcessSpawner, ServingConfig, TransportKind, WorkerPool,
    api::routes::{AppState, create_router},
    config::{BackendConfig, EchoConfig, ModelConfig, WorkerPlacement},
    metrics,
};
use serde_json::{Value, json};
use std::sync::{Arc, OnceLock};

// Global metrics handle - only initialize once per test process
static METRICS_HANDLE: OnceLock<metrics_exporter_prometheus::PrometheusHandle> = OnceLock::new();

fn get_metrics_handle() -> metrics_exporter_prometheus::PrometheusHandle {
    METRICS_HANDLE
        .get_or_init(|| metrics::setup_metrics().expect("Failed to setup metrics"))
        .clone()
}

fn echo_model(prefix: &str, workers: usize, enable: bool) -> ModelConfig {
    ModelConfig {
        enable,
        workers: (0..workers)
            .map(|i| WorkerPlacement {
                device_id: vec![i as u32],
            })
            .collect(),
        backend: BackendConfig::Echo(EchoConfig {
            prefix: prefix.to_string(),
            fragment_delay_ms: 0,
            fail_marker: Some("!fail".to_string()),
        }),
    }
}

fn test_config() -> ServingConfig {
    let mut config = ServingConfig {
        transport: TransportKind::InProcess,
        shutdown_grace_secs: 1,
        ..Default::default()
    };
    config
        .models
        .insert("echo".to_string(), echo_model("echo: ", 2, true));
    config
        .models
        .insert("plain".to_string(), echo_model("", 1, true));
    config
        .models
        .insert("disabled".to_string(), echo_model("", 1, false));
    config
}

/// Helper to create a test server with the API
async fn create_test_server() -> (TestServer, WorkerPool) {
    let pool = WorkerPool::start(&test_config(), Arc::new(InProcessSpawner::new()))
        .await
        .expect("Failed to start worker pool");

    let state = AppState {
        router: pool.router(),
        prometheus_handle: get_metrics_handle(),
    };

    let app = create_router(state);
    let server = TestServer::try_new(app).expect("Failed to create test server");

    (server, pool)
}

fn ndjson_lines(body: &str) -> Vec<Value> {
    body.lines()
        .filter(|line| !line.is_empty())
        .map(|line| serde_json::from_str(line).expect("line is not JSON"))
        .collect()
}

#[tokio::test]
async fn test_health_endpoint() {
    let (server, _pool) = create_test_server().await;

    let response = server.get("/health").await;

    assert_eq!(response.status_code(), 200);

    let body: Value = response.json();
    assert_eq!(body["status"], "healthy");
    assert!(body["timestamp"].is_string());
    assert_eq!(body["pending_requests"], 0);

    let workers = body["workers"].as_array().unwrap();
    assert_eq!(workers.len(), 3);
    assert_eq!(workers[0]["model"], "echo");
    assert_eq!(workers[1]["index"], 1);
    assert_eq!(workers[1]["devices"], json!([1]));
    assert!(workers.iter().all(|w| w["alive"] == true));
}

#[tokio::test]
async fn test_health_reports_shutdown() {
    let (server, pool) = create_test_server().await;
    pool.coordinator().trigger();

    let response = server.get("/health").await;
    assert_eq!(response.status_code(), 503);
    assert_eq!(response.json::<Value>()["status"], "shutting_down");
}

#[tokio::test]
async fn test_list_models() {
    let (server, _pool) = create_test_server().await;

    let response = server.get("/v1/models").await;
    assert_eq!(response.status_code(), 200);

    let body: Value = response.json();
    assert_eq!(body["object"], "list");
    let ids: Vec<&str> = body["data"]
        .as_array()
        .unwrap()
        .iter()
        .map(|m| m["id"].as_str().unwrap())
        .collect();
    assert_eq!(ids, vec!["echo", "plain"]);
}

#[tokio::test]
async fn test_generate() {
    let (server, _pool) = create_test_server().await;

    let response = server
        .post("/generate")
        .json(&json!({
            "model": "echo",
            "texts": ["a", "b"],
            "max_new_tokens": 16
        }))
        .await;

    assert_eq!(response.status_code(), 200);
    let body: Value = response.json();
    assert_eq!(body["code"], 0);
    assert_eq!(body["msg"], "ok");
    assert_eq!(body["complete"], true);
    assert_eq!(body["response"], json!(["echo: a", "echo: b"]));
}

#[tokio::test]
async fn test_generate_requires_texts() {
    let (server, _pool) = create_test_server().await;

    let response = server
        .post("/generate")
        .json(&json!({"model": "echo", "texts": []}))
        .await;

    assert_eq!(response.status_code(), 400);
    let body: Value = response.json();
    assert_eq!(body["code"], -1);
    assert!(body["msg"].as_str().unwrap().contains("texts"));
}

#[tokio::test]
async fn test_unknown_and_disabled_models() {
    let (server, _pool) = create_test_server().await;

    for model in ["missing", "disabled"] {
        let response = server
            .post("/generate")
            .json(&json!({"model": model, "texts": ["a"]}))
            .await;

        assert_eq!(response.status_code(), 404);
        let msg = response.json::<Value>()["msg"].as_str().unwrap().to_string();
        assert!(msg.contains(model));
        assert!(msg.contains("echo, plain"));
    }
}

#[tokio::test]
async fn test_chat_appends_turn() {
    let (server, _pool) = create_test_server().await;

    let response = server
        .post("/chat")
        .json(&json!({
            "model": "echo",
            "query": "hello",
            "history": [{"q": "hi", "a": "there"}]
        }))
        .await;

    assert_eq!(response.status_code(), 200);
    let body: Value = response.json();
    assert_eq!(body["response"], "echo: hello");
    assert_eq!(
        body["history"],
        json!([{"q": "hi", "a": "there"}, {"q": "hello", "a": "echo: hello"}])
    );
}

#[tokio::test]
async fn test_chat_validation() {
    let (server, _pool) = create_test_server().await;

    let empty = server
        .post("/chat")
        .json(&json!({"model": "echo", "query": ""}))
        .await;
    assert_eq!(empty.status_code(), 400);

    let half_turn = server
        .post("/chat")
        .json(&json!({"model": "echo", "query": "x", "history": [{"q": "only"}]}))
        .await;
    assert_eq!(half_turn.status_code(), 400);

    let malformed = server
        .post("/chat")
        .text("{not json")
        .content_type("application/json")
        .await;
    assert_eq!(malformed.status_code(), 400);
    assert_eq!(malformed.json::<Value>()["code"], -1);
}

#[tokio::test]
async fn test_chat_backend_failure() {
    let (server, _pool) = create_test_server().await;

    let response = server
        .post("/chat")
        .json(&json!({"model": "echo", "query": "please !fail"}))
        .await;

    assert_eq!(response.status_code(), 500);
    let msg = response.json::<Value>()["msg"].as_str().unwrap().to_string();
    assert!(msg.contains("failure marker"));

    // The worker keeps serving
    let response = server
        .post("/chat")
        .json(&json!({"model": "echo", "query": "again"}))
        .await;
    assert_eq!(response.status_code(), 200);
}

#[tokio::test]
async fn test_chat_stream_total() {
    let (server, _pool) = create_test_server().await;

    let response = server
        .post("/chat_stream")
        .json(&json!({"model": "plain", "query": "abcdefghij", "n": 4}))
        .await;

    assert_eq!(response.status_code(), 200);
    assert_eq!(
        response.headers().get("content-type").unwrap(),
        "application/x-ndjson"
    );

    let lines = ndjson_lines(&response.text());
    let texts: Vec<&str> = lines
        .iter()
        .map(|l| l["response"].as_str().unwrap())
        .collect();
    let complete: Vec<bool> = lines
        .iter()
        .map(|l| l["complete"].as_bool().unwrap())
        .collect();

    assert_eq!(texts, vec!["abcd", "abcdefgh", "abcdefghij"]);
    assert_eq!(complete, vec![false, false, true]);

    let ids: Vec<&Value> = lines.iter().map(|l| &l["id"]).collect();
    assert!(ids.windows(2).all(|w| w[0] == w[1]));
    assert_eq!(
        lines[2]["history"],
        json!([{"q": "abcdefghij", "a": "abcdefghij"}])
    );
}

#[tokio::test]
async fn test_chat_stream_increase_alias() {
    let (server, _pool) = create_test_server().await;

    let response = server
        .post("/chat_stream")
        .json(&json!({
            "model": "plain",
            "query": "abcdefghij",
            "n": 4,
            "gtype": "increace"
        }))
        .await;

    assert_eq!(response.status_code(), 200);
    let texts: Vec<String> = ndjson_lines(&response.text())
        .iter()
        .map(|l| l["response"].as_str().unwrap().to_string())
        .collect();
    assert_eq!(texts, vec!["abcd", "efgh", "ij"]);
}

#[tokio::test]
async fn test_chat_stream_validation() {
    let (server, _pool) = create_test_server().await;

    let no_sample = server
        .post("/chat_stream")
        .json(&json!({"model": "plain", "query": "x", "do_sample": false}))
        .await;
    assert_eq!(no_sample.status_code(), 400);
    assert!(
        no_sample.json::<Value>()["msg"]
            .as_str()
            .unwrap()
            .contains("do_sample")
    );

    let zero_n = server
        .post("/chat_stream")
        .json(&json!({"model": "plain", "query": "x", "n": 0}))
        .await;
    assert_eq!(zero_n.status_code(), 400);

    let bad_gtype = server
        .post("/chat_stream")
        .json(&json!({"model": "plain", "query": "x", "gtype": "sometimes"}))
        .await;
    assert_eq!(bad_gtype.status_code(), 400);
}

#[tokio::test]
async fn test_chat_stream_backend_failure() {
    let (server, _pool) = create_test_server().await;

    let response = server
        .post("/chat_stream")
        .json(&json!({"model": "plain", "query": "!fail"}))
        .await;

    assert_eq!(response.status_code(), 200);
    let lines = ndjson_lines(&response.text());
    assert_eq!(lines.len(), 1);
    assert_eq!(lines[0]["code"], -1);
    assert_eq!(lines[0]["complete"], true);
}

#[tokio::test]
async fn test_metrics_endpoint() {
    let (server, _pool) = create_test_server().await;

    server
        .post("/chat")
        .json(&json!({"model": "echo", "query": "count me"}))
        .await;

    let response = server.get("/metrics").await;
    assert_eq!(response.status_code(), 200);
    assert!(response.text().contains("infer_mux_tasks_submitted_total"));
}

#[tokio::test]
async fn test_pool_shutdown_rejects_requests() {
    let (server, pool) = create_test_server().await;
    let router = pool.router();
    pool.shutdown().await.unwrap();

    assert!(router.is_shutting_down());
    let response = server
        .post("/chat")
        .json(&json!({"model": "echo", "query": "late"}))
        .await;
    assert_eq!(response.status_code(), 503);
}
