//! WebSocket transport to the bridge.
//!
//! Accepts `ws://`/`wss://` URLs as-is and maps `http://`/`https://` to their
//! WebSocket schemes, so the same base URL can be shared with the HTTP
//! fallback. Ping/pong is answered by tungstenite; only text frames (and
//! UTF-8 binary frames) are surfaced.

use async_trait::async_trait;
use futures_util::stream::{SplitSink, SplitStream};
use futures_util::{SinkExt, StreamExt};
use tokio_tungstenite::tungstenite::Message;
use tracing::debug;

use super::{Connection, Transport, TransportEvent};
use crate::error::TransportError;

type WsStream =
    tokio_tungstenite::WebSocketStream<tokio_tungstenite::MaybeTlsStream<tokio::net::TcpStream>>;

/// Opens WebSocket connections to a fixed URL.
pub struct WsTransport {
    url: String,
}

impl WsTransport {
    pub fn new(server_url: &str) -> Result<Self, TransportError> {
        Ok(Self {
            url: build_ws_url(server_url)?,
        })
    }

    pub fn url(&self) -> &str {
        &self.url
    }
}

#[async_trait]
impl Transport for WsTransport {
    async fn open(&self) -> Result<Box<dyn Connection>, TransportError> {
        debug!(url = %self.url, "opening WebSocket");
        let (ws_stream, _response) = tokio_tungstenite::connect_async(&self.url).await?;
        let (sink, stream) = ws_stream.split();
        Ok(Box::new(WsConnection { sink, stream }))
    }
}

struct WsConnection {
    sink: SplitSink<WsStream, Message>,
    stream: SplitStream<WsStream>,
}

#[async_trait]
impl Connection for WsConnection {
    async fn send(&mut self, frame: String) -> Result<(), TransportError> {
        self.sink.send(Message::Text(frame.into())).await?;
        Ok(())
    }

    async fn next_event(&mut self) -> TransportEvent {
        loop {
            match self.stream.next().await {
                Some(Ok(Message::Text(text))) => {
                    return TransportEvent::Message(text.as_str().to_owned());
                }
                Some(Ok(Message::Binary(bytes))) => match String::from_utf8(bytes.to_vec()) {
                    Ok(text) => return TransportEvent::Message(text),
                    Err(_) => debug!("dropping non-UTF-8 binary frame"),
                },
                Some(Ok(Message::Close(_))) | None => return TransportEvent::Closed,
                Some(Ok(_)) => {} // Ping/Pong/Frame
                Some(Err(e)) => return TransportEvent::Error(e.into()),
            }
        }
    }

    async fn close(&mut self) {
        let _ = self.sink.close().await;
    }
}

/// Normalize a bridge URL to a WebSocket URL.
fn build_ws_url(base_url: &str) -> Result<String, TransportError> {
    let base = base_url.trim_end_matches('/');
    if base.starts_with("ws://") || base.starts_with("wss://") {
        Ok(base.to_string())
    } else if base.starts_with("https://") {
        Ok(base.replacen("https://", "wss://", 1))
    } else if base.starts_with("http://") {
        Ok(base.replacen("http://", "ws://", 1))
    } else {
        Err(TransportError::InvalidUrl(format!(
            "unsupported scheme in {base}"
        )))
    }
}
