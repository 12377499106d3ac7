//! Tasks routed to workers and the results they produce

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::fmt;

/// Router-assigned request identifier
pub type RequestId = u64;

/// Opaque generation parameters forwarded untouched to the backend
pub type Params = Map<String, Value>;

/// Status code carried by successful results
pub const CODE_OK: i32 = 0;

/// Status code carried by failed results
pub const CODE_ERROR: i32 = -1;

/// One question/answer pair of a chat history
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Turn {
    pub q: String,
    pub a: String,
}

/// Flush policy for streamed chat replies
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum StreamMode {
    /// Every flush carries the whole reply produced so far
    #[default]
    Total,
    /// Every flush carries only the text produced since the previous flush
    #[serde(alias = "increace")]
    Increase,
}

/// Request method, derived from the payload variant
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Method {
    Generate,
    Chat,
    ChatStream,
}

impl Method {
    pub fn as_str(&self) -> &'static str {
        match self {
            Method::Generate => "generate",
            Method::Chat => "chat",
            Method::ChatStream => "chat_stream",
        }
    }
}

impl fmt::Display for Method {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Validated request payload, one variant per method
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "method", rename_all = "snake_case")]
pub enum Payload {
    Generate {
        texts: Vec<String>,
        #[serde(default)]
        params: Params,
    },
    Chat {
        query: String,
        #[serde(default)]
        history: Vec<Turn>,
        #[serde(default)]
        params: Params,
    },
    ChatStream {
        query: String,
        #[serde(default)]
        history: Vec<Turn>,
        n: usize,
        #[serde(default)]
        gtype: StreamMode,
        #[serde(default)]
        params: Params,
    },
}

impl Payload {
    pub fn method(&self) -> Method {
        match self {
            Payload::Generate { .. } => Method::Generate,
            Payload::Chat { .. } => Method::Chat,
            Payload::ChatStream { .. } => Method::ChatStream,
        }
    }
}

/// A unit of work delivered to one worker
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Task {
    pub id: RequestId,
    pub model: String,
    pub payload: Payload,
}

impl Task {
    pub fn method(&self) -> Method {
        self.payload.method()
    }
}

/// Result status: `0`/`"ok"` on success, `-1` and a message on failure
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Status {
    pub code: i32,
    pub msg: String,
}

impl Status {
    pub fn ok() -> Self {
        Self {
            code: CODE_OK,
            msg: "ok".to_string(),
        }
    }

    pub fn error(msg: impl Into<String>) -> Self {
        Self {
            code: CODE_ERROR,
            msg: msg.into(),
        }
    }

    pub fn is_ok(&self) -> bool {
        self.code == CODE_OK
    }
}

/// Backend output carried by a result
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum Response {
    Text(String),
    Batch(Vec<String>),
}

/// One unit of output for a request.
///
/// Streaming requests produce several results sharing an id; exactly one of
/// them has `complete` set and it is always the last.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TaskResult {
    pub id: RequestId,
    pub complete: bool,
    #[serde(flatten)]
    pub status: Status,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub response: Option<Response>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub history: Option<Vec<Turn>>,
}

impl TaskResult {
    /// Non-terminal streaming chunk
    pub fn chunk(id: RequestId, text: String, history: Vec<Turn>) -> Self {
        Self {
            id,
            complete: false,
            status: Status::ok(),
            response: Some(Response::Text(text)),
            history: Some(history),
        }
    }

    /// Terminal chat result (streamed or not)
    pub fn chat(id: RequestId, text: String, history: Vec<Turn>) -> Self {
        Self {
            complete: true,
            ..Self::chunk(id, text, history)
        }
    }

    /// Terminal generate result, one output per input text
    pub fn batch(id: RequestId, outputs: Vec<String>) -> Self {
        Self {
            id,
            complete: true,
            status: Status::ok(),
            response: Some(Response::Batch(outputs)),
            history: None,
        }
    }

    /// Terminal error result
    pub fn failure(id: RequestId, msg: impl Into<String>) -> Self {
        Self {
            id,
            complete: true,
            status: Status::error(msg),
            response: None,
            history: None,
        }
    }

    pub fn is_ok(&self) -> bool {
        self.status.is_ok()
    }

    /// Text of a chat result, if any
    pub fn text(&self) -> Option<&str> {
        match &self.response {
            Some(Response::Text(text)) => Some(text),
            _ => None,
        }
    }
}
