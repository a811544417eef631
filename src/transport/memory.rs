//! In-process transport for driving the session in tests.
//!
//! Each `open()` consumes the next scripted outcome. An accepted connection is
//! paired with a [`Peer`] that the test uses to read what the client sent and
//! to inject inbound frames or a close.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Mutex;

use async_trait::async_trait;
use serde_json::Value;
use tokio::sync::mpsc;

use super::{Connection, Transport, TransportEvent};
use crate::error::TransportError;

enum OpenOutcome {
    Accept(MemoryConnection),
    AcceptUnwritable(MemoryConnection),
    Refuse(String),
    Hang,
}

#[derive(Default)]
pub(crate) struct MemoryTransport {
    script: Mutex<VecDeque<OpenOutcome>>,
    opens: AtomicUsize,
}

impl MemoryTransport {
    pub(crate) fn new() -> Self {
        Self::default()
    }

    /// Next open succeeds; returns the server side of that connection.
    pub(crate) fn accept(&self) -> Peer {
        let (conn, peer) = pair();
        self.push(OpenOutcome::Accept(conn));
        peer
    }

    /// Next open succeeds, but every write on that connection fails.
    pub(crate) fn accept_unwritable(&self) -> Peer {
        let (conn, peer) = pair();
        self.push(OpenOutcome::AcceptUnwritable(conn));
        peer
    }

    /// Next open fails with `reason`.
    pub(crate) fn refuse(&self, reason: &str) {
        self.push(OpenOutcome::Refuse(reason.to_string()));
    }

    /// Next open never completes.
    pub(crate) fn hang(&self) {
        self.push(OpenOutcome::Hang);
    }

    /// Number of `open()` calls so far.
    pub(crate) fn open_count(&self) -> usize {
        self.opens.load(Ordering::SeqCst)
    }

    fn push(&self, outcome: OpenOutcome) {
        self.script.lock().unwrap().push_back(outcome);
    }
}

#[async_trait]
impl Transport for MemoryTransport {
    async fn open(&self) -> Result<Box<dyn Connection>, TransportError> {
        self.opens.fetch_add(1, Ordering::SeqCst);
        let outcome = self.script.lock().unwrap().pop_front();
        match outcome {
            Some(OpenOutcome::Accept(conn)) => Ok(Box::new(conn)),
            Some(OpenOutcome::AcceptUnwritable(mut conn)) => {
                conn.writable = false;
                Ok(Box::new(conn))
            }
            Some(OpenOutcome::Refuse(reason)) => Err(TransportError::Other(reason)),
            Some(OpenOutcome::Hang) => std::future::pending().await,
            None => Err(TransportError::Other("connection refused".into())),
        }
    }
}

pub(crate) struct MemoryConnection {
    outbound: mpsc::UnboundedSender<String>,
    inbound: mpsc::UnboundedReceiver<TransportEvent>,
    writable: bool,
}

#[async_trait]
impl Connection for MemoryConnection {
    async fn send(&mut self, frame: String) -> Result<(), TransportError> {
        if !self.writable {
            return Err(TransportError::Other("broken pipe".into()));
        }
        self.outbound
            .send(frame)
            .map_err(|_| TransportError::Other("peer gone".into()))
    }

    async fn next_event(&mut self) -> TransportEvent {
        self.inbound.recv().await.unwrap_or(TransportEvent::Closed)
    }

    async fn close(&mut self) {
        self.inbound.close();
    }
}

/// Server side of a [`MemoryConnection`].
pub(crate) struct Peer {
    sent: mpsc::UnboundedReceiver<String>,
    inject: mpsc::UnboundedSender<TransportEvent>,
}

impl Peer {
    /// Next frame the client sent, decoded.
    pub(crate) async fn recv(&mut self) -> Option<Value> {
        let text = self.sent.recv().await?;
        Some(serde_json::from_str(&text).expect("client sent invalid JSON"))
    }

    /// Frame already sent by the client, without waiting.
    pub(crate) fn try_recv(&mut self) -> Option<Value> {
        let text = self.sent.try_recv().ok()?;
        Some(serde_json::from_str(&text).expect("client sent invalid JSON"))
    }

    pub(crate) fn send(&self, frame: &Value) {
        let _ = self.inject.send(TransportEvent::Message(frame.to_string()));
    }

    pub(crate) fn send_raw(&self, text: &str) {
        let _ = self.inject.send(TransportEvent::Message(text.to_string()));
    }

    pub(crate) fn close(&self) {
        let _ = self.inject.send(TransportEvent::Closed);
    }
}

fn pair() -> (MemoryConnection, Peer) {
    let (out_tx, out_rx) = mpsc::unbounded_channel();
    let (in_tx, in_rx) = mpsc::unbounded_channel();
    (
        MemoryConnection {
            outbound: out_tx,
            inbound: in_rx,
            writable: true,
        },
        Peer {
            sent: out_rx,
            inject: in_tx,
        },
    )
}
