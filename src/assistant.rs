//! Chat assistant facade.
//!
//! [`Assistant`] is what a front end (the CLI, an editor panel) talks to. It
//! records each exchange in the [`ConversationStore`], sends the request over
//! the [`Session`], and falls back to the one-shot HTTP client when the
//! session is unusable:
//!
//! - the session is `Failed` (reconnects exhausted): straight to HTTP;
//! - the session request failed while the connection was down: retried once
//!   over HTTP.
//!
//! A remote error on a live connection is final; it is not retried.

use serde_json::{Map, Value};
use tracing::{debug, info, warn};

use crate::client::BridgeHttpClient;
use crate::error::{AssistantError, SessionError};
use crate::history::{ChatMessage, ConversationStore, Role, StateBackend};
use crate::prompts::CodeAction;
use crate::protocol::{OutboundRequest, Reply, RequestKind};
use crate::session::{ConnectionState, Session};

/// Which path delivered an answer.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Via {
    Session,
    Http,
}

/// A completed exchange.
#[derive(Debug, Clone, PartialEq)]
pub struct Answer {
    pub id: String,
    pub content: String,
    pub metadata: Option<Value>,
    pub via: Via,
}

pub struct Assistant<B: StateBackend> {
    session: Session,
    http: Option<BridgeHttpClient>,
    history: ConversationStore<B>,
    stream_response: bool,
    context_turns: usize,
}

impl<B: StateBackend> Assistant<B> {
    pub fn new(
        session: Session,
        http: Option<BridgeHttpClient>,
        history: ConversationStore<B>,
    ) -> Self {
        Self {
            session,
            http,
            history,
            stream_response: true,
            context_turns: 0,
        }
    }

    /// Ask the bridge to stream replies (default on).
    #[must_use]
    pub fn with_streaming(mut self, stream: bool) -> Self {
        self.stream_response = stream;
        self
    }

    /// Attach the last `turns` user/assistant messages as `context.history`
    /// on each request (default 0, off).
    #[must_use]
    pub fn with_context_turns(mut self, turns: usize) -> Self {
        self.context_turns = turns;
        self
    }

    pub fn session(&self) -> &Session {
        &self.session
    }

    pub fn history(&self) -> &ConversationStore<B> {
        &self.history
    }

    pub fn history_mut(&mut self) -> &mut ConversationStore<B> {
        &mut self.history
    }

    /// Send `message` and record both sides of the exchange. `on_chunk` sees
    /// the reply text as it arrives (once, whole, for unstreamed replies).
    pub async fn ask(
        &mut self,
        kind: RequestKind,
        message: &str,
        mut on_chunk: impl FnMut(&str),
    ) -> Result<Answer, AssistantError> {
        let request = self.build_request(kind, message);
        self.record(ChatMessage::new(Role::User, message));

        let result = if self.session.state() == ConnectionState::Failed && self.http.is_some() {
            info!("session failed, using HTTP fallback");
            self.via_http(message, &mut on_chunk).await
        } else {
            match self.via_session(request, &mut on_chunk).await {
                Ok(answer) => Ok(answer),
                Err(e) if self.should_fall_back(&e) => {
                    warn!("session request failed while disconnected ({e}), retrying over HTTP");
                    self.via_http(message, &mut on_chunk).await
                }
                Err(e) => Err(e.into()),
            }
        };

        self.record_outcome(&result);
        result
    }

    /// Send over HTTP only, skipping the session.
    pub async fn ask_http(&mut self, message: &str) -> Result<Answer, AssistantError> {
        self.record(ChatMessage::new(Role::User, message));
        let result = self.via_http(message, &mut |_: &str| {}).await;
        self.record_outcome(&result);
        result
    }

    /// Run a code action on a selection.
    pub async fn run_action(
        &mut self,
        action: CodeAction,
        language: &str,
        code: &str,
        on_chunk: impl FnMut(&str),
    ) -> Result<Answer, AssistantError> {
        let prompt = action.prompt(language, code);
        self.ask(action.kind(), &prompt, on_chunk).await
    }

    fn build_request(&self, kind: RequestKind, message: &str) -> OutboundRequest {
        let mut request = OutboundRequest::new(kind, message).with_stream(self.stream_response);
        if self.context_turns > 0 {
            let turns = self.history.context_for_ai(self.context_turns);
            if !turns.is_empty() {
                let mut context = Map::new();
                context.insert(
                    "history".to_string(),
                    serde_json::to_value(turns).unwrap_or(Value::Null),
                );
                request = request.with_context(context);
            }
        }
        request
    }

    async fn via_session(
        &self,
        request: OutboundRequest,
        on_chunk: &mut impl FnMut(&str),
    ) -> Result<Answer, SessionError> {
        let reply = if request.stream {
            let mut stream = self.session.send_streaming(request).await?;
            let mut text = String::new();
            while let Some(chunk) = stream.next_chunk().await {
                on_chunk(&chunk.text);
                text.push_str(&chunk.text);
            }
            let reply = stream.finish().await?;
            if text.is_empty() {
                // Bridge answered with a plain response frame.
                on_chunk(&reply.content);
                reply
            } else {
                Reply {
                    content: text,
                    ..reply
                }
            }
        } else {
            let reply = self.session.request(request).await?;
            on_chunk(&reply.content);
            reply
        };
        Ok(answer(reply, Via::Session))
    }

    async fn via_http(
        &self,
        message: &str,
        on_chunk: &mut impl FnMut(&str),
    ) -> Result<Answer, AssistantError> {
        let http = self.http.as_ref().ok_or(AssistantError::NoFallback)?;
        let reply = http.chat(message).await?;
        on_chunk(&reply.content);
        Ok(answer(reply, Via::Http))
    }

    fn should_fall_back(&self, error: &SessionError) -> bool {
        self.http.is_some()
            && !matches!(error, SessionError::RemoteError(_) | SessionError::DuplicateId(_))
            && !self.session.state().is_connected()
    }

    fn record_outcome(&mut self, result: &Result<Answer, AssistantError>) {
        let message = match result {
            Ok(answer) => {
                let mut message = ChatMessage::new(Role::Assistant, answer.content.clone())
                    .with_id(answer.id.clone());
                if let Some(Value::Object(meta)) = &answer.metadata {
                    message = message.with_metadata(meta.clone());
                }
                message
            }
            Err(e) => ChatMessage::new(Role::Error, format!("Error: {e}")),
        };
        self.record(message);
    }

    /// History write failures are logged; the exchange itself still stands.
    fn record(&mut self, message: ChatMessage) {
        debug!(id = %message.id, role = message.role.as_str(), "recording message");
        if let Err(e) = self.history.append(message) {
            warn!("failed to persist history: {e}");
        }
    }
}

fn answer(reply: Reply, via: Via) -> Answer {
    Answer {
        id: reply.id,
        content: reply.content,
        metadata: reply.metadata,
        via,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::history::MemoryBackend;
    use crate::prompts::RefactorGoal;
    use crate::reconnect::ReconnectPolicy;
    use crate::session::SessionConfig;
    use crate::transport::memory::{MemoryTransport, Peer};
    use serde_json::json;
    use std::sync::Arc;
    use std::time::Duration;
    use tokio::io::{AsyncReadExt, AsyncWriteExt};

    fn history() -> ConversationStore<MemoryBackend> {
        ConversationStore::open(MemoryBackend::new(), 100).unwrap()
    }

    async fn connected() -> (Assistant<MemoryBackend>, Peer) {
        let transport = Arc::new(MemoryTransport::new());
        let peer = transport.accept();
        let session = Session::spawn(transport, SessionConfig::default());
        session.connect().await.unwrap();
        (Assistant::new(session, None, history()), peer)
    }

    /// One-shot HTTP server answering every request with `body`.
    async fn http_stub(status: &str, body: &'static str) -> String {
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let status = status.to_string();
        tokio::spawn(async move {
            let (mut socket, _) = listener.accept().await.unwrap();
            read_request(&mut socket).await;
            let response = format!(
                "HTTP/1.1 {status}\r\nContent-Type: application/json\r\n\
                 Content-Length: {}\r\nConnection: close\r\n\r\n{body}",
                body.len()
            );
            socket.write_all(response.as_bytes()).await.unwrap();
        });
        format!("http://{addr}/api")
    }

    /// Read headers and the `Content-Length` body so the client sees a clean close.
    async fn read_request(socket: &mut tokio::net::TcpStream) {
        let mut data = Vec::new();
        let mut buf = [0u8; 1024];
        loop {
            let n = socket.read(&mut buf).await.unwrap();
            if n == 0 {
                return;
            }
            data.extend_from_slice(&buf[..n]);
            let text = String::from_utf8_lossy(&data);
            if let Some(end) = text.find("\r\n\r\n") {
                let body_len = text[..end]
                    .lines()
                    .find_map(|l| {
                        let (name, value) = l.split_once(':')?;
                        name.eq_ignore_ascii_case("content-length")
                            .then(|| value.trim().parse::<usize>().ok())
                            .flatten()
                    })
                    .unwrap_or(0);
                if data.len() >= end + 4 + body_len {
                    return;
                }
            }
        }
    }

    #[tokio::test]
    async fn streamed_answer_is_concatenated_and_recorded() {
        let (mut assistant, mut peer) = connected().await;

        let responder = tokio::spawn(async move {
            let frame = peer.recv().await.unwrap();
            assert_eq!(frame["stream"], true);
            assert_eq!(frame["type"], "chat");
            let id = frame["id"].as_str().unwrap().to_string();
            peer.send(&json!({"type": "stream", "id": id, "chunk": "Hel", "done": false}));
            peer.send(&json!({"type": "stream", "id": id, "chunk": "lo", "done": true}));
            peer
        });

        let mut seen = Vec::new();
        let answer = assistant
            .ask(RequestKind::Chat, "hi", |c| seen.push(c.to_string()))
            .await
            .unwrap();
        responder.await.unwrap();

        assert_eq!(seen, ["Hel", "lo"]);
        assert_eq!(answer.content, "Hello");
        assert_eq!(answer.via, Via::Session);

        let log = assistant.history().all();
        assert_eq!(log.len(), 2);
        assert_eq!((log[0].role, log[0].content.as_str()), (Role::User, "hi"));
        assert_eq!((log[1].role, log[1].content.as_str()), (Role::Assistant, "Hello"));
    }

    #[tokio::test]
    async fn remote_error_recorded_without_fallback() {
        let (assistant, mut peer) = connected().await;
        let mut assistant = assistant.with_streaming(false);

        tokio::spawn(async move {
            let frame = peer.recv().await.unwrap();
            let id = frame["id"].as_str().unwrap().to_string();
            peer.send(&json!({"type": "error", "id": id, "error": "quota exceeded"}));
            peer
        });

        let err = assistant
            .ask(RequestKind::Code, "write it", |_| {})
            .await
            .unwrap_err();
        assert!(matches!(err, AssistantError::Session(SessionError::RemoteError(_))));

        let log = assistant.history().all();
        assert_eq!(log[1].role, Role::Error);
        assert_eq!(log[1].content, "Error: quota exceeded");
    }

    #[tokio::test]
    async fn context_turns_attached() {
        let (assistant, mut peer) = connected().await;
        let mut assistant = assistant.with_streaming(false).with_context_turns(4);
        assistant
            .history_mut()
            .append(ChatMessage::new(Role::User, "earlier question"))
            .unwrap();

        tokio::spawn(async move {
            let frame = peer.recv().await.unwrap();
            assert_eq!(
                frame["context"]["history"],
                json!([{"role": "user", "content": "earlier question"}])
            );
            let id = frame["id"].as_str().unwrap().to_string();
            peer.send(&json!({"type": "response", "id": id, "content": "ok"}));
            peer
        });

        let answer = assistant.ask(RequestKind::Chat, "follow up", |_| {}).await.unwrap();
        assert_eq!(answer.content, "ok");
    }

    #[tokio::test]
    async fn refactor_action_sent_as_code_request() {
        let (assistant, mut peer) = connected().await;
        let mut assistant = assistant.with_streaming(false);

        tokio::spawn(async move {
            let frame = peer.recv().await.unwrap();
            assert_eq!(frame["type"], "code");
            let message = frame["message"].as_str().unwrap();
            assert!(message.starts_with("Refactor this rust code to simplify logic:"));
            let id = frame["id"].as_str().unwrap().to_string();
            let content = "```rust\nlet y = 2;\n```";
            peer.send(&json!({"type": "response", "id": id, "content": content}));
            peer
        });

        let action = CodeAction::Refactor(RefactorGoal::Simplify);
        let answer = assistant
            .run_action(action, "rust", "let y = 1 + 1;", |_| {})
            .await
            .unwrap();
        assert_eq!(crate::prompts::extract_code(&answer.content), "let y = 2;");
    }

    #[tokio::test]
    async fn failed_session_goes_straight_to_http() {
        // No reconnects allowed: the first refused open leaves the session Failed.
        let transport = Arc::new(MemoryTransport::new());
        let config = SessionConfig {
            reconnect: ReconnectPolicy::new(Duration::from_millis(10), 0),
            ..SessionConfig::default()
        };
        let session = Session::spawn(transport.clone(), config);
        assert!(session.connect().await.is_err());
        assert_eq!(session.state(), ConnectionState::Failed);

        let api = http_stub(
            "200 OK",
            r#"{"content":"from http","metadata":{"provider":"groq"}}"#,
        )
        .await;
        let http = BridgeHttpClient::new(&api).unwrap();
        let mut assistant = Assistant::new(session, Some(http), history());

        let answer = assistant.ask(RequestKind::Chat, "hello?", |_| {}).await.unwrap();
        assert_eq!(answer.via, Via::Http);
        assert_eq!(answer.content, "from http");
        assert_eq!(transport.open_count(), 1);

        let log = assistant.history().all();
        assert_eq!(log[1].metadata.as_ref().unwrap()["provider"], "groq");
    }

    #[tokio::test]
    async fn timeout_while_disconnected_falls_back() {
        let transport = Arc::new(MemoryTransport::new());
        let config = SessionConfig {
            request_timeout: Duration::from_millis(200),
            reconnect: ReconnectPolicy::new(Duration::from_secs(30), 3),
            ..SessionConfig::default()
        };
        let session = Session::spawn(transport, config);

        let api = http_stub("200 OK", r#"{"message":"fallback reply"}"#).await;
        let http = BridgeHttpClient::new(&api).unwrap();
        let mut assistant = Assistant::new(session, Some(http), history()).with_streaming(false);

        let answer = assistant.ask(RequestKind::Chat, "anyone?", |_| {}).await.unwrap();
        assert_eq!(answer.via, Via::Http);
        assert_eq!(answer.content, "fallback reply");
    }

    #[tokio::test]
    async fn http_error_is_recorded() {
        let transport = Arc::new(MemoryTransport::new());
        let session = Session::spawn(transport, SessionConfig::default());
        let api = http_stub(
            "503 Service Unavailable",
            r#"{"detail":"AI provider not configured"}"#,
        )
        .await;
        let http = BridgeHttpClient::new(&api).unwrap();
        let mut assistant = Assistant::new(session, Some(http), history());

        let err = assistant.ask_http("ping").await.unwrap_err();
        assert!(matches!(
            err,
            AssistantError::Http(crate::error::ClientError::Bridge { status: 503, .. })
        ));
        assert!(assistant.history().all()[1].content.contains("AI provider not configured"));
    }
}
