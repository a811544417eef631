//! Wire protocol between the client and the AI bridge.
//!
//! Every frame is one JSON text message on the WebSocket.
//!
//! Outbound:
//!
//! ```text
//! {"id": "msg_…", "type": "chat"|"code"|"explain"|"fix", "message": "…",
//!  "context": {…}?, "stream": bool}
//! {"type": "heartbeat"}
//! ```
//!
//! Inbound:
//!
//! ```text
//! {"type": "response", "id": "…", "content": "…", "metadata": {…}?}
//! {"type": "stream",   "id": "…", "chunk": "…", "done": bool}
//! {"type": "error",    "id": "…"?, "error": "…"}
//! {"type": "heartbeat"} | {"type": "pong"}          heartbeat ack
//! {"type": "status", …} | {"type": "connected", …}  status broadcast
//! ```

use std::time::{SystemTime, UNIX_EPOCH};

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use thiserror::Error;

/// Heartbeat control frame, sent verbatim.
pub const HEARTBEAT_FRAME: &str = r#"{"type":"heartbeat"}"#;

/// Server-side routing hint for a request. Does not change client behaviour.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RequestKind {
    Chat,
    Code,
    Explain,
    Fix,
}

impl RequestKind {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Chat => "chat",
            Self::Code => "code",
            Self::Explain => "explain",
            Self::Fix => "fix",
        }
    }
}

impl std::str::FromStr for RequestKind {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "chat" => Ok(Self::Chat),
            "code" => Ok(Self::Code),
            "explain" => Ok(Self::Explain),
            "fix" => Ok(Self::Fix),
            other => Err(format!("unknown request kind: {other}")),
        }
    }
}

/// A request frame as it goes over the wire.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct OutboundRequest {
    pub id: String,
    #[serde(rename = "type")]
    pub kind: RequestKind,
    pub message: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub context: Option<Map<String, Value>>,
    pub stream: bool,
}

impl OutboundRequest {
    /// New non-streaming request with a freshly generated id.
    pub fn new(kind: RequestKind, message: impl Into<String>) -> Self {
        Self {
            id: generate_request_id(),
            kind,
            message: message.into(),
            context: None,
            stream: false,
        }
    }

    #[must_use]
    pub fn with_context(mut self, context: Map<String, Value>) -> Self {
        self.context = Some(context);
        self
    }

    #[must_use]
    pub fn with_stream(mut self, stream: bool) -> Self {
        self.stream = stream;
        self
    }

    /// Encode as a JSON text frame.
    pub fn to_frame(&self) -> Result<String, serde_json::Error> {
        serde_json::to_string(self)
    }
}

/// Generate a process-unique request id: `msg_<unix-ms>_<9 random hex chars>`.
pub fn generate_request_id() -> String {
    #[allow(clippy::cast_possible_truncation)]
    let millis = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map_or(0, |d| d.as_millis() as u64);
    let random = uuid::Uuid::new_v4().simple().to_string();
    format!("msg_{millis}_{}", &random[..9])
}

/// Final result of a request.
#[derive(Debug, Clone, PartialEq)]
pub struct Reply {
    pub id: String,
    pub content: String,
    pub done: bool,
    pub metadata: Option<Value>,
}

/// One piece of a streamed reply.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StreamChunk {
    pub text: String,
    pub done: bool,
}

/// A decoded inbound frame.
#[derive(Debug, Clone, PartialEq)]
pub enum InboundFrame {
    Response {
        id: String,
        content: String,
        metadata: Option<Value>,
    },
    Stream {
        id: String,
        chunk: String,
        done: bool,
    },
    Error {
        id: Option<String>,
        error: String,
    },
    HeartbeatAck,
    /// Provider/session status broadcast, passed through as-is.
    Status(Value),
    /// A frame type this client does not know. Carries the type name.
    Unknown(String),
}

/// Why an inbound text could not be decoded.
#[derive(Debug, Error)]
pub enum FrameError {
    #[error("invalid JSON: {0}")]
    Json(#[from] serde_json::Error),
    #[error("frame has no type field")]
    MissingType,
    #[error("{kind} frame is missing {field}")]
    MissingField {
        kind: &'static str,
        field: &'static str,
    },
}

impl InboundFrame {
    /// Decode one text frame.
    pub fn parse(text: &str) -> Result<Self, FrameError> {
        let msg: Value = serde_json::from_str(text)?;
        let msg_type = msg["type"].as_str().ok_or(FrameError::MissingType)?;

        let frame = match msg_type {
            "response" => Self::Response {
                id: required_id(&msg, "response")?,
                content: response_content(&msg),
                metadata: msg.get("metadata").filter(|v| !v.is_null()).cloned(),
            },
            "stream" => Self::Stream {
                id: required_id(&msg, "stream")?,
                chunk: msg["chunk"].as_str().unwrap_or("").to_string(),
                done: msg["done"].as_bool().unwrap_or(false),
            },
            "error" => Self::Error {
                id: msg["id"].as_str().map(String::from),
                error: msg["error"]
                    .as_str()
                    .or_else(|| msg["message"].as_str())
                    .unwrap_or("Unknown error")
                    .to_string(),
            },
            "heartbeat" | "pong" => Self::HeartbeatAck,
            "status" | "connected" => Self::Status(msg),
            other => Self::Unknown(other.to_string()),
        };
        Ok(frame)
    }

    /// Request id this frame correlates to, if any.
    pub fn request_id(&self) -> Option<&str> {
        match self {
            Self::Response { id, .. } | Self::Stream { id, .. } => Some(id),
            Self::Error { id, .. } => id.as_deref(),
            _ => None,
        }
    }
}

fn required_id(msg: &Value, kind: &'static str) -> Result<String, FrameError> {
    msg["id"]
        .as_str()
        .map(String::from)
        .ok_or(FrameError::MissingField { kind, field: "id" })
}

/// `content` when present; status replies carry a `data` object instead.
fn response_content(msg: &Value) -> String {
    if let Some(s) = msg["content"].as_str() {
        return s.to_string();
    }
    match msg.get("data") {
        Some(data) if !data.is_null() => data.to_string(),
        _ => String::new(),
    }
}
