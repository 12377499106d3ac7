//! API request handlers

use super::models::{
    ChatRequest, ChatStreamRequest, GenerateRequest, HealthResponse, ModelList,
};
use super::routes::AppState;
use crate::error::{ErrorResponse, ServeError, ServeResult};
use crate::task::{CODE_ERROR, Payload, TaskResult};
use axum::{
    Json,
    body::{Body, Bytes},
    extract::{State, rejection::JsonRejection},
    http::{StatusCode, header},
    response::{IntoResponse, Response},
};
use futures::StreamExt;
use serde_json::Value;

/// Media type of the streaming chat response: one JSON result per line
pub const NDJSON: &str = "application/x-ndjson";

fn invalid_body(rejection: JsonRejection) -> ServeError {
    ServeError::InvalidRequest(rejection.body_text())
}

/// Terminal result of a single-shot request; an error status becomes a 500
fn into_reply(result: TaskResult) -> ServeResult<Json<TaskResult>> {
    if result.is_ok() {
        Ok(Json(result))
    } else {
        Err(ServeError::BackendFailure(result.status.msg))
    }
}

/// GET /health - Service and worker liveness
pub async fn health(State(state): State<AppState>) -> (StatusCode, Json<HealthResponse>) {
    let workers = state.router.worker_status();

    let (code, status) = if state.router.is_shutting_down() {
        (StatusCode::SERVICE_UNAVAILABLE, "shutting_down")
    } else if workers.iter().all(|w| w.alive) {
        (StatusCode::OK, "healthy")
    } else {
        (StatusCode::OK, "degraded")
    };

    (
        code,
        Json(HealthResponse {
            status: status.to_string(),
            timestamp: chrono::Utc::now(),
            pending_requests: state.router.pending_count(),
            workers,
        }),
    )
}

/// GET /metrics - Prometheus metrics
pub async fn metrics(State(state): State<AppState>) -> String {
    state.prometheus_handle.render()
}

/// GET /v1/models - Enabled models
pub async fn list_models(State(state): State<AppState>) -> Json<ModelList> {
    Json(ModelList::new(state.router.enabled_models()))
}

/// POST /generate - One output per input text
pub async fn generate(
    State(state): State<AppState>,
    body: Result<Json<GenerateRequest>, JsonRejection>,
) -> ServeResult<Json<TaskResult>> {
    let Json(req) = body.map_err(invalid_body)?;

    if req.texts.is_empty() {
        return Err(ServeError::InvalidRequest(
            "texts must be a non-empty list".to_string(),
        ));
    }

    tracing::info!(model = %req.model, texts = req.texts.len(), "Generate request");

    let id = state.router.submit(
        &req.model,
        Payload::Generate {
            texts: req.texts,
            params: req.params,
        },
    )?;
    into_reply(state.router.await_complete(id).await?)
}

/// POST /chat - Single reply with updated history
pub async fn chat(
    State(state): State<AppState>,
    body: Result<Json<ChatRequest>, JsonRejection>,
) -> ServeResult<Json<TaskResult>> {
    let Json(req) = body.map_err(invalid_body)?;

    if req.query.is_empty() {
        return Err(ServeError::InvalidRequest("query must not be empty".to_string()));
    }

    tracing::info!(model = %req.model, history = req.history.len(), "Chat request");

    let id = state.router.submit(
        &req.model,
        Payload::Chat {
            query: req.query,
            history: req.history,
            params: req.params,
        },
    )?;
    into_reply(state.router.await_complete(id).await?)
}

/// POST /chat_stream - Reply streamed as newline-delimited JSON results.
///
/// The response ends after the result with `complete = true`. Errors after
/// the stream started are sent as a final `{code: -1, msg}` line.
pub async fn chat_stream(
    State(state): State<AppState>,
    body: Result<Json<ChatStreamRequest>, JsonRejection>,
) -> ServeResult<Response> {
    let Json(mut req) = body.map_err(invalid_body)?;

    if req.do_sample == Some(false) {
        return Err(ServeError::InvalidRequest(
            "streaming does not support do_sample=false".to_string(),
        ));
    }
    if req.n <= 0 {
        return Err(ServeError::InvalidRequest(format!(
            "n must be greater than zero (got {})",
            req.n
        )));
    }
    if req.query.is_empty() {
        return Err(ServeError::InvalidRequest("query must not be empty".to_string()));
    }

    req.params.insert("do_sample".to_string(), Value::Bool(true));

    tracing::info!(
        model = %req.model,
        n = req.n,
        gtype = ?req.gtype,
        "Chat stream request"
    );

    let id = state.router.submit(
        &req.model,
        Payload::ChatStream {
            query: req.query,
            history: req.history,
            n: req.n as usize,
            gtype: req.gtype,
            params: req.params,
        },
    )?;

    let lines = state.router.results(id).map(|item| -> Result<Bytes, serde_json::Error> {
        let mut line = match item {
            Ok(result) => serde_json::to_vec(&result)?,
            Err(e) => serde_json::to_vec(&ErrorResponse {
                code: CODE_ERROR,
                msg: e.to_string(),
                timestamp: chrono::Utc::now(),
            })?,
        };
        line.push(b'\n');
        Ok(Bytes::from(line))
    });

    Ok(([(header::CONTENT_TYPE, NDJSON)], Body::from_stream(lines)).into_response())
}
