//! Session controller: the client's single authority over the bridge
//! connection.
//!
//! [`Session`] is a cloneable handle to a driver task (see [`driver`]) that
//! owns the connection, correlates requests with replies, queues requests
//! while disconnected, heartbeats, and reconnects with backoff.
//!
//! ## Observing the connection
//!
//! - [`Session::state`] / [`Session::watch_state`]: current [`ConnectionState`]
//!   (a `tokio::sync::watch` value).
//! - [`Session::subscribe`]: every [`SessionEvent`] on a
//!   `tokio::sync::broadcast` channel. A slow subscriber lags and loses old
//!   events; it never holds up the session or other subscribers.
//!
//! ## Requests
//!
//! [`Session::send`] always returns a handle, connected or not. While
//! disconnected the request is queued (and a connection attempt started);
//! queued requests are sent in order as soon as the connection opens, before
//! anything issued afterwards. Every request has its own deadline, counted
//! from the moment it was handed to the session, and queuing does not pause
//! it.
//!
//! Requests in flight when the connection drops are *not* failed: they stay
//! registered and either get their reply after the reconnect or time out.

mod driver;

use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use serde_json::Value;
use tokio::sync::{broadcast, mpsc, oneshot, watch};

use crate::correlator::Completion;
use crate::error::SessionError;
use crate::protocol::{InboundFrame, OutboundRequest, Reply, StreamChunk};
use crate::reconnect::ReconnectPolicy;
use crate::transport::Transport;

use driver::Driver;

const COMMAND_BUFFER: usize = 256;
const EVENT_BUFFER: usize = 256;

/// Session tunables. Defaults match the bridge's documented settings.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct SessionConfig {
    /// How long `connect()` waits for the transport to open.
    pub connect_timeout: Duration,
    /// Default per-request deadline.
    pub request_timeout: Duration,
    /// Heartbeat period while connected.
    pub heartbeat_interval: Duration,
    pub reconnect: ReconnectPolicy,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            connect_timeout: Duration::from_secs(10),
            request_timeout: Duration::from_secs(60),
            heartbeat_interval: Duration::from_secs(30),
            reconnect: ReconnectPolicy::new(Duration::from_millis(5000), 5),
        }
    }
}

/// Connection lifecycle. Exactly one holds at a time.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    Disconnected,
    Connecting,
    Connected,
    /// Backoff timer armed for reconnect `attempt`.
    Reconnecting { attempt: u32, delay: Duration },
    /// Automatic reconnects exhausted; a manual `connect()` retries.
    Failed,
}

impl ConnectionState {
    pub fn is_connected(self) -> bool {
        self == Self::Connected
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Self::Disconnected => "disconnected",
            Self::Connecting => "connecting",
            Self::Connected => "connected",
            Self::Reconnecting { .. } => "reconnecting",
            Self::Failed => "failed",
        }
    }
}

impl fmt::Display for ConnectionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Reconnecting { attempt, delay } => {
                write!(f, "reconnecting (attempt {attempt}, in {}ms)", delay.as_millis())
            }
            other => f.write_str(other.as_str()),
        }
    }
}

/// Notifications broadcast to subscribers.
#[derive(Debug, Clone)]
pub enum SessionEvent {
    StateChanged(ConnectionState),
    /// A correlated frame (response, stream chunk, or error) was processed.
    Message(InboundFrame),
    /// A transport failure, malformed frame, or uncorrelated error frame.
    Error(String),
    /// Provider/session status broadcast from the bridge.
    Status(Value),
}

/// Point-in-time counters from the driver.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SessionStats {
    pub state: ConnectionState,
    pub pending: usize,
    pub queued: usize,
    pub reconnect_attempts: u32,
}

pub(crate) enum Command {
    Connect {
        reply: oneshot::Sender<Result<(), SessionError>>,
    },
    Disconnect {
        reply: oneshot::Sender<()>,
    },
    Send {
        request: OutboundRequest,
        completion: Completion,
        timeout: Duration,
        ack: oneshot::Sender<Result<(), SessionError>>,
    },
    Stats {
        reply: oneshot::Sender<SessionStats>,
    },
}

/// Handle to a bridge session. Clones share the same driver; the driver stops
/// when the last handle is dropped.
#[derive(Clone)]
pub struct Session {
    commands: mpsc::Sender<Command>,
    state: watch::Receiver<ConnectionState>,
    events: broadcast::Sender<SessionEvent>,
    request_timeout: Duration,
}

impl Session {
    /// Start a session driver on the current tokio runtime. Does not connect.
    pub fn spawn(transport: Arc<dyn Transport>, config: SessionConfig) -> Self {
        let (cmd_tx, cmd_rx) = mpsc::channel(COMMAND_BUFFER);
        let (state_tx, state_rx) = watch::channel(ConnectionState::Disconnected);
        let (events, _) = broadcast::channel(EVENT_BUFFER);

        let driver = Driver::new(transport, config, cmd_rx, state_tx, events.clone());
        tokio::spawn(driver.run());

        Self {
            commands: cmd_tx,
            state: state_rx,
            events,
            request_timeout: config.request_timeout,
        }
    }

    /// Connect to the bridge. Returns at once if already connecting or
    /// connected.
    pub async fn connect(&self) -> Result<(), SessionError> {
        self.call(|reply| Command::Connect { reply }).await?
    }

    /// Close the connection and stop reconnecting. Idempotent.
    pub async fn disconnect(&self) {
        let _ = self.call(|reply| Command::Disconnect { reply }).await;
    }

    /// Send a request and get a handle to its final reply.
    pub async fn send(&self, request: OutboundRequest) -> Result<PendingReply, SessionError> {
        self.send_with_timeout(request, self.request_timeout).await
    }

    /// [`Session::send`] with an explicit deadline.
    pub async fn send_with_timeout(
        &self,
        request: OutboundRequest,
        timeout: Duration,
    ) -> Result<PendingReply, SessionError> {
        let id = request.id.clone();
        let (tx, rx) = oneshot::channel();
        self.call(|ack| Command::Send {
            request,
            completion: Completion::Single(tx),
            timeout,
            ack,
        })
        .await??;
        Ok(PendingReply { id, rx })
    }

    /// Send a request with `stream` set and receive its chunks as they arrive.
    pub async fn send_streaming(
        &self,
        request: OutboundRequest,
    ) -> Result<ResponseStream, SessionError> {
        let request = request.with_stream(true);
        let id = request.id.clone();
        let (chunk_tx, chunk_rx) = mpsc::unbounded_channel();
        let (tx, rx) = oneshot::channel();
        let timeout = self.request_timeout;
        self.call(|ack| Command::Send {
            request,
            completion: Completion::Streaming {
                chunks: chunk_tx,
                terminal: tx,
            },
            timeout,
            ack,
        })
        .await??;
        Ok(ResponseStream {
            id,
            chunks: chunk_rx,
            terminal: rx,
        })
    }

    /// Send and wait for the final reply.
    pub async fn request(&self, request: OutboundRequest) -> Result<Reply, SessionError> {
        self.send(request).await?.wait().await
    }

    pub fn state(&self) -> ConnectionState {
        *self.state.borrow()
    }

    pub fn watch_state(&self) -> watch::Receiver<ConnectionState> {
        self.state.clone()
    }

    pub fn subscribe(&self) -> broadcast::Receiver<SessionEvent> {
        self.events.subscribe()
    }

    pub async fn stats(&self) -> Result<SessionStats, SessionError> {
        self.call(|reply| Command::Stats { reply }).await
    }

    async fn call<T>(
        &self,
        make: impl FnOnce(oneshot::Sender<T>) -> Command,
    ) -> Result<T, SessionError> {
        let (tx, rx) = oneshot::channel();
        self.commands
            .send(make(tx))
            .await
            .map_err(|_| SessionError::SessionClosed)?;
        rx.await.map_err(|_| SessionError::SessionClosed)
    }
}

/// Final reply of a request sent with [`Session::send`].
#[derive(Debug)]
pub struct PendingReply {
    id: String,
    rx: oneshot::Receiver<Result<Reply, SessionError>>,
}

impl PendingReply {
    pub fn id(&self) -> &str {
        &self.id
    }

    pub async fn wait(self) -> Result<Reply, SessionError> {
        self.rx.await.unwrap_or(Err(SessionError::SessionClosed))
    }
}

/// Chunks of a request sent with [`Session::send_streaming`].
#[derive(Debug)]
pub struct ResponseStream {
    id: String,
    chunks: mpsc::UnboundedReceiver<StreamChunk>,
    terminal: oneshot::Receiver<Result<Reply, SessionError>>,
}

impl ResponseStream {
    pub fn id(&self) -> &str {
        &self.id
    }

    /// Next chunk, or `None` once the request has ended (either way).
    pub async fn next_chunk(&mut self) -> Option<StreamChunk> {
        self.chunks.recv().await
    }

    /// Wait for the outcome. For a streamed reply this is the final chunk.
    pub async fn finish(self) -> Result<Reply, SessionError> {
        self.terminal.await.unwrap_or(Err(SessionError::SessionClosed))
    }
}
