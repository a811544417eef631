//! HTTP fallback client for the bridge REST API.
//!
//! [`BridgeHttpClient`] wraps `reqwest::Client` and is used for one-shot
//! requests when the WebSocket session is unavailable. It has no retry logic
//! of its own; the caller decides when to fall back.
//!
//! ## Error handling
//!
//! Non-2xx responses are parsed for an `error` (or FastAPI-style `detail`)
//! field in the JSON body. If parsing fails, the raw response body is returned
//! as the error message.

use std::time::Duration;

use serde_json::Value;

use crate::error::ClientError;
use crate::protocol::{generate_request_id, Reply};

/// HTTP client for one bridge.
pub struct BridgeHttpClient {
    http: reqwest::Client,
    base_url: String,
}

impl BridgeHttpClient {
    /// Create a client for the bridge API rooted at `api_url`
    /// (e.g. `http://localhost:8766/api`).
    pub fn new(api_url: &str) -> Result<Self, ClientError> {
        let mut default_headers = reqwest::header::HeaderMap::new();
        default_headers.insert(
            reqwest::header::HeaderName::from_static("x-bridge-client"),
            reqwest::header::HeaderValue::from_static("bridge-client"),
        );
        let http = reqwest::Client::builder()
            .default_headers(default_headers)
            .connect_timeout(Duration::from_secs(10))
            .timeout(Duration::from_secs(60))
            .build()?;
        // Strip trailing slash for consistent URL construction
        let base_url = api_url.trim_end_matches('/').to_string();
        Ok(Self { http, base_url })
    }

    /// The API base URL (without trailing slash).
    pub fn base_url(&self) -> &str {
        &self.base_url
    }

    /// `POST /chat`: send one message and wait for the complete reply.
    pub async fn chat(&self, message: &str) -> Result<Reply, ClientError> {
        let resp = self
            .http
            .post(format!("{}/chat", self.base_url))
            .json(&serde_json::json!({ "message": message }))
            .send()
            .await?;
        let status = resp.status();
        let body = resp.text().await?;
        if !status.is_success() {
            return Err(bridge_error(status.as_u16(), body));
        }
        Ok(reply_from_body(&body))
    }

    /// `GET /status`: server and provider status.
    pub async fn status(&self) -> Result<Value, ClientError> {
        let resp = self
            .http
            .get(format!("{}/status", self.base_url))
            .send()
            .await?;
        Self::handle_response(resp).await
    }

    /// Parse an HTTP response. Returns the JSON body on success, or a
    /// [`ClientError`] with the error message on failure.
    async fn handle_response(resp: reqwest::Response) -> Result<Value, ClientError> {
        let status = resp.status();
        let body = resp.text().await?;

        if status.is_success() {
            serde_json::from_str(&body)
                .map_err(|e| ClientError::Protocol(format!("Invalid JSON from bridge: {e}")))
        } else {
            Err(bridge_error(status.as_u16(), body))
        }
    }
}

/// Build a [`Reply`] from a `/chat` response body.
///
/// Content is the JSON `content` field, else `message`, else the raw body
/// (also when the body is not JSON at all).
fn reply_from_body(body: &str) -> Reply {
    let parsed = serde_json::from_str::<Value>(body).ok();
    let field = |name: &str| {
        parsed
            .as_ref()
            .and_then(|v| v[name].as_str())
            .filter(|s| !s.is_empty())
            .map(String::from)
    };
    let content = field("content")
        .or_else(|| field("message"))
        .unwrap_or_else(|| body.to_string());
    let metadata = parsed
        .as_ref()
        .and_then(|v| v.get("metadata"))
        .filter(|m| !m.is_null())
        .cloned();

    Reply {
        id: generate_request_id(),
        content,
        done: true,
        metadata,
    }
}

fn bridge_error(status: u16, body: String) -> ClientError {
    let message = serde_json::from_str::<Value>(&body)
        .ok()
        .and_then(|v| {
            v["error"]
                .as_str()
                .or_else(|| v["detail"].as_str())
                .map(String::from)
        })
        .unwrap_or(body);
    ClientError::Bridge { status, message }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn content_field_preferred() {
        let reply = reply_from_body(
            r#"{"content":"hi","message":"ignored","metadata":{"provider":"groq"}}"#,
        );
        assert_eq!(reply.content, "hi");
        assert!(reply.done);
        assert!(reply.id.starts_with("msg_"));
        assert_eq!(reply.metadata.unwrap()["provider"], "groq");
    }

    #[test]
    fn falls_back_to_message_then_raw_body() {
        assert_eq!(reply_from_body(r#"{"message":"from message"}"#).content, "from message");
        assert_eq!(reply_from_body(r#"{"content":"","message":"m"}"#).content, "m");
        assert_eq!(reply_from_body(r#"{"other":1}"#).content, r#"{"other":1}"#);
        assert_eq!(reply_from_body("plain text").content, "plain text");
        assert!(reply_from_body("plain text").metadata.is_none());
    }

    #[test]
    fn error_message_extraction() {
        let err = bridge_error(503, r#"{"detail":"AI provider not configured"}"#.into());
        assert!(matches!(
            err,
            ClientError::Bridge { status: 503, ref message }
                if message == "AI provider not configured"
        ));

        let err = bridge_error(500, r#"{"error":"boom"}"#.into());
        assert!(matches!(err, ClientError::Bridge { ref message, .. } if message == "boom"));

        let err = bridge_error(502, "Bad Gateway".into());
        assert!(matches!(err, ClientError::Bridge { ref message, .. } if message == "Bad Gateway"));
    }

    #[test]
    fn base_url_trailing_slash_stripped() {
        let client = BridgeHttpClient::new("http://localhost:8766/api/").unwrap();
        assert_eq!(client.base_url(), "http://localhost:8766/api");
    }
}
