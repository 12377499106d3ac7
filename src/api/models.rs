//! API request and response models

use crate::router::WorkerStatus;
use crate::task::{Params, StreamMode, Turn};
use serde::{Deserialize, Serialize};

/// Body of `POST /generate`.
///
/// Fields other than `model` and `texts` are generation parameters and are
/// forwarded to the backend untouched.
#[derive(Debug, Serialize, Deserialize)]
pub struct GenerateRequest {
    #[serde(default)]
    pub model: String,

    #[serde(default)]
    pub texts: Vec<String>,

    #[serde(flatten)]
    pub params: Params,
}

/// Body of `POST /chat`
#[derive(Debug, Serialize, Deserialize)]
pub struct ChatRequest {
    #[serde(default)]
    pub model: String,

    #[serde(default)]
    pub query: String,

    /// Each item must carry both `q` and `a`
    #[serde(default)]
    pub history: Vec<Turn>,

    #[serde(flatten)]
    pub params: Params,
}

/// Body of `POST /chat_stream`
#[derive(Debug, Serialize, Deserialize)]
pub struct ChatStreamRequest {
    #[serde(default)]
    pub model: String,

    #[serde(default)]
    pub query: String,

    #[serde(default)]
    pub history: Vec<Turn>,

    /// Produced units per flush; must be positive
    #[serde(default = "default_n")]
    pub n: i64,

    #[serde(default)]
    pub gtype: StreamMode,

    /// Streaming always samples; `false` is rejected
    #[serde(default)]
    pub do_sample: Option<bool>,

    #[serde(flatten)]
    pub params: Params,
}

fn default_n() -> i64 {
    4
}

/// Response of `GET /v1/models`
#[derive(Debug, Serialize, Deserialize)]
pub struct ModelList {
    pub object: String,
    pub data: Vec<ModelCard>,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct ModelCard {
    pub id: String,
    pub object: String,
    pub owned_by: String,
}

impl ModelList {
    pub fn new(models: Vec<String>) -> Self {
        Self {
            object: "list".to_string(),
            data: models
                .into_iter()
                .map(|id| ModelCard {
                    id,
                    object: "model".to_string(),
                    owned_by: env!("CARGO_PKG_NAME").to_string(),
                })
                .collect(),
        }
    }
}

/// Health check response
#[derive(Debug, Serialize, Deserialize)]
pub struct HealthResponse {
    /// `healthy`, `degraded` (some worker lost) or `shutting_down`
    pub status: String,
    pub timestamp: chrono::DateTime<chrono::Utc>,
    pub pending_requests: usize,
    pub workers: Vec<WorkerStatus>,
}
