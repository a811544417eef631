//! The session driver task.
//!
//! One driver runs per [`super::Session`]. It is the only owner of the
//! connection, the [`Correlator`], the outbound queue, and every timer
//! (connect bound, heartbeat, reconnect backoff, request deadlines), and the
//! only code that changes [`ConnectionState`]. Handles talk to it over a
//! command channel; everything below runs on this single task.

use std::collections::VecDeque;
use std::sync::Arc;
use std::time::Duration;

use futures_util::future::BoxFuture;
use tokio::sync::{broadcast, mpsc, oneshot, watch};
use tokio::time::{Instant, Interval, MissedTickBehavior};
use tracing::{debug, info, trace, warn};

use super::{Command, ConnectionState, SessionConfig, SessionEvent, SessionStats};
use crate::correlator::{Completion, Correlator};
use crate::error::SessionError;
use crate::protocol::{InboundFrame, OutboundRequest, Reply, HEARTBEAT_FRAME};
use crate::transport::{Connection, Transport, TransportEvent};

/// Upper bound on a graceful close before the socket is just dropped.
const CLOSE_TIMEOUT: Duration = Duration::from_secs(2);

type OpenFuture = BoxFuture<'static, Result<Box<dyn Connection>, SessionError>>;

pub(super) struct Driver {
    transport: Arc<dyn Transport>,
    config: SessionConfig,
    commands: mpsc::Receiver<Command>,
    state: ConnectionState,
    state_tx: watch::Sender<ConnectionState>,
    events: broadcast::Sender<SessionEvent>,
    correlator: Correlator,
    queue: VecDeque<OutboundRequest>,
    link: Option<Box<dyn Connection>>,
    opening: Option<OpenFuture>,
    connect_waiters: Vec<oneshot::Sender<Result<(), SessionError>>>,
    heartbeat: Option<Interval>,
    reconnect_at: Option<Instant>,
    reconnect_attempts: u32,
}

impl Driver {
    pub(super) fn new(
        transport: Arc<dyn Transport>,
        config: SessionConfig,
        commands: mpsc::Receiver<Command>,
        state_tx: watch::Sender<ConnectionState>,
        events: broadcast::Sender<SessionEvent>,
    ) -> Self {
        Self {
            transport,
            config,
            commands,
            state: ConnectionState::Disconnected,
            state_tx,
            events,
            correlator: Correlator::new(),
            queue: VecDeque::new(),
            link: None,
            opening: None,
            connect_waiters: Vec::new(),
            heartbeat: None,
            reconnect_at: None,
            reconnect_attempts: 0,
        }
    }

    /// Run until every [`super::Session`] handle is dropped.
    pub(super) async fn run(mut self) {
        loop {
            let request_deadline = self.correlator.next_deadline();
            tokio::select! {
                cmd = self.commands.recv() => match cmd {
                    Some(cmd) => self.handle_command(cmd).await,
                    None => break,
                },
                result = finish_open(&mut self.opening) => self.on_open_finished(result).await,
                event = next_event(&mut self.link) => self.on_transport_event(event),
                () = heartbeat_tick(&mut self.heartbeat) => self.send_heartbeat().await,
                () = sleep_until(self.reconnect_at) => {
                    self.reconnect_at = None;
                    self.start_connect();
                }
                () = sleep_until(request_deadline) => {
                    let expired = self.correlator.expire(Instant::now());
                    if !expired.is_empty() {
                        warn!(count = expired.len(), "requests timed out");
                    }
                }
            }
        }

        debug!("all session handles dropped, shutting down driver");
        self.close_link().await;
    }

    async fn handle_command(&mut self, cmd: Command) {
        match cmd {
            Command::Connect { reply } => self.connect(reply),
            Command::Disconnect { reply } => {
                self.disconnect().await;
                let _ = reply.send(());
            }
            Command::Send {
                request,
                completion,
                timeout,
                ack,
            } => {
                let result = self.send(request, completion, timeout).await;
                let _ = ack.send(result);
            }
            Command::Stats { reply } => {
                let _ = reply.send(SessionStats {
                    state: self.state,
                    pending: self.correlator.len(),
                    queued: self.queue.len(),
                    reconnect_attempts: self.reconnect_attempts,
                });
            }
        }
    }

    // --- lifecycle ---

    fn connect(&mut self, reply: oneshot::Sender<Result<(), SessionError>>) {
        match self.state {
            ConnectionState::Connecting | ConnectionState::Connected => {
                let _ = reply.send(Ok(()));
            }
            ConnectionState::Disconnected
            | ConnectionState::Reconnecting { .. }
            | ConnectionState::Failed => {
                if self.state == ConnectionState::Failed {
                    // Manual retry after giving up gets a fresh budget.
                    self.reconnect_attempts = 0;
                }
                self.reconnect_at = None;
                self.connect_waiters.push(reply);
                self.start_connect();
            }
        }
    }

    fn start_connect(&mut self) {
        info!("connecting to bridge");
        self.transition(ConnectionState::Connecting);

        let transport = Arc::clone(&self.transport);
        let bound = self.config.connect_timeout;
        self.opening = Some(Box::pin(async move {
            match tokio::time::timeout(bound, transport.open()).await {
                Ok(Ok(conn)) => Ok(conn),
                Ok(Err(e)) => Err(SessionError::from(e)),
                Err(_) => Err(SessionError::ConnectionTimeout),
            }
        }));
    }

    async fn on_open_finished(&mut self, result: Result<Box<dyn Connection>, SessionError>) {
        match result {
            Ok(conn) => {
                self.link = Some(conn);
                self.reconnect_attempts = 0;

                let period = self.config.heartbeat_interval;
                let mut interval = tokio::time::interval_at(Instant::now() + period, period);
                interval.set_missed_tick_behavior(MissedTickBehavior::Delay);
                self.heartbeat = Some(interval);

                // A failed flush write drops the link and schedules a reconnect.
                self.flush_queue().await;
                let outcome = if self.link.is_some() {
                    info!("connected to bridge");
                    self.transition(ConnectionState::Connected);
                    Ok(())
                } else {
                    Err(SessionError::ConnectionError(
                        "connection lost while sending queued requests".into(),
                    ))
                };
                for waiter in self.connect_waiters.drain(..) {
                    let _ = waiter.send(outcome.clone());
                }
            }
            Err(e) => {
                warn!("connection to bridge failed: {e}");
                self.transition(ConnectionState::Disconnected);
                self.schedule_reconnect();
                for waiter in self.connect_waiters.drain(..) {
                    let _ = waiter.send(Err(e.clone()));
                }
            }
        }
    }

    async fn disconnect(&mut self) {
        self.heartbeat = None;
        self.reconnect_at = None;
        self.reconnect_attempts = 0;
        let aborted_open = self.opening.take().is_some();
        self.close_link().await;
        self.transition(ConnectionState::Disconnected);
        if aborted_open {
            for waiter in self.connect_waiters.drain(..) {
                let _ = waiter.send(Err(SessionError::ConnectionError(
                    "connection attempt aborted by disconnect".into(),
                )));
            }
        }
    }

    async fn close_link(&mut self) {
        if let Some(mut link) = self.link.take() {
            let _ = tokio::time::timeout(CLOSE_TIMEOUT, link.close()).await;
            info!("disconnected from bridge");
        }
    }

    /// The open connection closed or failed. Pending requests stay registered
    /// and end by their own deadline or a reply after reconnecting.
    fn on_connection_lost(&mut self) {
        self.heartbeat = None;
        self.link = None;
        self.transition(ConnectionState::Disconnected);
        self.schedule_reconnect();
    }

    fn schedule_reconnect(&mut self) {
        let policy = self.config.reconnect;
        match policy.next(self.reconnect_attempts) {
            Some((attempt, delay)) => {
                self.reconnect_attempts = attempt;
                info!(
                    "reconnecting in {}ms (attempt {attempt}/{})",
                    delay.as_millis(),
                    policy.max_attempts
                );
                self.reconnect_at = Some(Instant::now() + delay);
                self.transition(ConnectionState::Reconnecting { attempt, delay });
            }
            None => {
                warn!(
                    "max reconnect attempts ({}) reached, waiting for manual retry",
                    policy.max_attempts
                );
                self.transition(ConnectionState::Failed);
            }
        }
    }

    fn transition(&mut self, next: ConnectionState) {
        if self.state == next {
            return;
        }
        debug!(from = %self.state, to = %next, "connection state change");
        self.state = next;
        self.state_tx.send_replace(next);
        self.emit(SessionEvent::StateChanged(next));
    }

    fn emit(&self, event: SessionEvent) {
        // No subscribers is fine.
        let _ = self.events.send(event);
    }

    // --- outbound ---

    async fn send(
        &mut self,
        request: OutboundRequest,
        completion: Completion,
        timeout: Duration,
    ) -> Result<(), SessionError> {
        self.correlator.register(&request.id, completion, timeout)?;

        if self.state == ConnectionState::Connected {
            self.transmit(request).await;
            return Ok(());
        }

        debug!(id = %request.id, "not connected, request queued");
        self.queue.push_back(request);
        if matches!(
            self.state,
            ConnectionState::Disconnected | ConnectionState::Failed
        ) {
            // Opportunistic; a failure is handled by the reconnect policy.
            self.start_connect();
        }
        Ok(())
    }

    /// Send in enqueue order. Requests that already timed out are skipped.
    async fn flush_queue(&mut self) {
        if !self.queue.is_empty() {
            debug!(count = self.queue.len(), "flushing queued requests");
        }
        while let Some(request) = self.queue.pop_front() {
            if !self.correlator.is_pending(&request.id) {
                debug!(id = %request.id, "queued request already finished, not sending");
                continue;
            }
            if !self.transmit(request).await {
                break;
            }
        }
    }

    /// Write one request to the connection. On a failed write the request goes
    /// back to the head of the queue and the connection is treated as lost.
    /// Returns `false` if the connection is no longer usable.
    async fn transmit(&mut self, request: OutboundRequest) -> bool {
        let frame = match request.to_frame() {
            Ok(frame) => frame,
            Err(e) => {
                self.correlator
                    .reject(&request.id, SessionError::Protocol(e.to_string()));
                return true;
            }
        };

        let Some(link) = self.link.as_mut() else {
            self.queue.push_front(request);
            return false;
        };

        let result = link.send(frame).await;
        match result {
            Ok(()) => {
                trace!(id = %request.id, kind = request.kind.as_str(), "request sent");
                true
            }
            Err(e) => {
                warn!(id = %request.id, "send failed: {e}");
                self.queue.push_front(request);
                self.on_connection_lost();
                false
            }
        }
    }

    async fn send_heartbeat(&mut self) {
        let Some(link) = self.link.as_mut() else {
            return;
        };
        trace!("sending heartbeat");
        let result = link.send(HEARTBEAT_FRAME.to_string()).await;
        if let Err(e) = result {
            warn!("heartbeat failed: {e}");
            self.on_connection_lost();
        }
    }

    // --- inbound ---

    fn on_transport_event(&mut self, event: TransportEvent) {
        match event {
            TransportEvent::Message(text) => self.dispatch(&text),
            TransportEvent::Closed => {
                info!("bridge closed the connection");
                self.on_connection_lost();
            }
            TransportEvent::Error(e) => {
                warn!("transport error: {e}");
                self.emit(SessionEvent::Error(e.to_string()));
                self.on_connection_lost();
            }
        }
    }

    /// Route one inbound frame. Malformed frames are logged and dropped.
    fn dispatch(&mut self, text: &str) {
        let frame = match InboundFrame::parse(text) {
            Ok(frame) => frame,
            Err(e) => {
                warn!("dropping malformed frame: {e}");
                self.emit(SessionEvent::Error(format!("malformed frame: {e}")));
                return;
            }
        };

        match &frame {
            InboundFrame::Response {
                id,
                content,
                metadata,
            } => {
                self.correlator.resolve(
                    id,
                    Reply {
                        id: id.clone(),
                        content: content.clone(),
                        done: true,
                        metadata: metadata.clone(),
                    },
                );
            }
            InboundFrame::Stream { id, chunk, done } => {
                self.correlator.stream_chunk(id, chunk.clone(), *done);
            }
            InboundFrame::Error {
                id: Some(id),
                error,
            } => {
                self.correlator
                    .reject(id, SessionError::RemoteError(error.clone()));
            }
            InboundFrame::Error { id: None, error } => {
                warn!("bridge error: {error}");
                self.emit(SessionEvent::Error(error.clone()));
                return;
            }
            InboundFrame::HeartbeatAck => {
                trace!("heartbeat acknowledged");
                return;
            }
            InboundFrame::Status(status) => {
                self.emit(SessionEvent::Status(status.clone()));
                return;
            }
            InboundFrame::Unknown(kind) => {
                debug!(kind = %kind, "ignoring unknown frame type");
                return;
            }
        }
        self.emit(SessionEvent::Message(frame));
    }
}

async fn finish_open(
    opening: &mut Option<OpenFuture>,
) -> Result<Box<dyn Connection>, SessionError> {
    match opening.as_mut() {
        Some(fut) => {
            let result = fut.await;
            *opening = None;
            result
        }
        None => std::future::pending().await,
    }
}

async fn next_event(link: &mut Option<Box<dyn Connection>>) -> TransportEvent {
    match link {
        Some(conn) => conn.next_event().await,
        None => std::future::pending().await,
    }
}

async fn heartbeat_tick(heartbeat: &mut Option<Interval>) {
    match heartbeat {
        Some(interval) => {
            interval.tick().await;
        }
        None => std::future::pending().await,
    }
}

async fn sleep_until(deadline: Option<Instant>) {
    match deadline {
        Some(deadline) => tokio::time::sleep_until(deadline).await,
        None => std::future::pending().await,
    }
}
