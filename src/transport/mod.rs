//! Duplex transport abstraction.
//!
//! A [`Transport`] knows how to open a [`Connection`] to the bridge. The
//! connection carries text frames both ways and reports the end of the
//! channel as an event rather than an error return, so the session driver can
//! treat "peer closed" and "socket failed" uniformly.
//!
//! - [`websocket`]: the real transport, on `tokio-tungstenite`.
//! - `memory` (tests only): an in-process pair driven by the test body.

use async_trait::async_trait;

use crate::error::TransportError;

#[cfg(test)]
pub(crate) mod memory;
pub mod websocket;

pub use websocket::WsTransport;

/// What a connection produced next.
#[derive(Debug)]
pub enum TransportEvent {
    /// One complete text frame.
    Message(String),
    /// The peer closed the channel (close frame or EOF).
    Closed,
    /// The channel failed.
    Error(TransportError),
}

/// Factory for connections to the bridge.
#[async_trait]
pub trait Transport: Send + Sync {
    /// Open a new connection. Resolving `Ok` is the "opened" signal.
    async fn open(&self) -> Result<Box<dyn Connection>, TransportError>;
}

/// One open duplex channel.
#[async_trait]
pub trait Connection: Send {
    /// Send one text frame.
    async fn send(&mut self, frame: String) -> Result<(), TransportError>;

    /// Wait for the next inbound event. Must be cancel-safe: the session
    /// driver polls it inside `select!`.
    async fn next_event(&mut self) -> TransportEvent;

    /// Close the channel. Errors are ignored; the connection is dropped after.
    async fn close(&mut self);
}
