//! Error types shared across the session, transport, and history layers.

use thiserror::Error;

/// Errors surfaced to callers of [`crate::Session`].
///
/// `Clone` because a single failure (e.g. a connect timeout) is delivered to
/// every caller waiting on it.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum SessionError {
    /// The transport did not signal open within the connect timeout.
    #[error("Connection timeout")]
    ConnectionTimeout,
    /// The transport failed before or during the connection.
    #[error("Connection error: {0}")]
    ConnectionError(String),
    /// No terminal frame arrived for the request before its deadline.
    #[error("Request timeout - no reply for {id}")]
    RequestTimeout { id: String },
    /// The bridge answered with an explicit error frame.
    #[error("{0}")]
    RemoteError(String),
    /// A request with this id is already pending.
    #[error("Duplicate request id: {0}")]
    DuplicateId(String),
    /// The outbound frame could not be encoded.
    #[error("Protocol error: {0}")]
    Protocol(String),
    /// The session driver has shut down.
    #[error("Session closed")]
    SessionClosed,
}

impl SessionError {
    /// Connection-level failures, as opposed to failures of one request.
    pub fn is_connection_error(&self) -> bool {
        matches!(
            self,
            SessionError::ConnectionTimeout
                | SessionError::ConnectionError(_)
                | SessionError::SessionClosed
        )
    }
}

/// Errors reported by a [`crate::transport::Transport`] or its connection.
#[derive(Debug, Error)]
pub enum TransportError {
    #[error("invalid bridge URL: {0}")]
    InvalidUrl(String),
    #[error("WebSocket error: {0}")]
    WebSocket(#[from] tokio_tungstenite::tungstenite::Error),
    #[error("{0}")]
    Other(String),
}

impl From<TransportError> for SessionError {
    fn from(e: TransportError) -> Self {
        SessionError::ConnectionError(e.to_string())
    }
}

/// Errors returned by [`crate::client::BridgeHttpClient`].
#[derive(Debug, Error)]
pub enum ClientError {
    /// HTTP transport error (connection refused, timeout, DNS failure, etc.).
    #[error("HTTP request failed: {0}")]
    Request(#[from] reqwest::Error),
    /// The bridge returned a non-2xx HTTP status.
    #[error("Bridge error (HTTP {status}): {message}")]
    Bridge { status: u16, message: String },
    /// The response body was not what the endpoint promises.
    #[error("Protocol error: {0}")]
    Protocol(String),
}

/// Errors from the conversation store and its backends.
#[derive(Debug, Error)]
pub enum HistoryError {
    #[error("history I/O failed: {0}")]
    Io(#[from] std::io::Error),
    #[error("history serialization failed: {0}")]
    Json(#[from] serde_json::Error),
    /// The snapshot was not a JSON array of records.
    #[error("invalid history snapshot: {0}")]
    InvalidSnapshot(String),
}

/// Errors while loading configuration.
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to read config file {path}: {source}")]
    Read {
        path: String,
        source: std::io::Error,
    },
    #[error("failed to parse config file {path}: {source}")]
    Parse {
        path: String,
        source: toml::de::Error,
    },
    #[error("invalid config: {0}")]
    Invalid(String),
}

/// Errors returned by [`crate::assistant::Assistant::ask`].
#[derive(Debug, Error)]
pub enum AssistantError {
    /// The session request failed and no HTTP fallback applied.
    #[error(transparent)]
    Session(#[from] SessionError),
    /// The HTTP fallback was used and failed.
    #[error(transparent)]
    Http(#[from] ClientError),
    /// HTTP was requested but no fallback client is configured.
    #[error("HTTP fallback is not configured")]
    NoFallback,
}
