#![deny(clippy::all)]
#![warn(clippy::pedantic)]
#![allow(clippy::module_name_repetitions)]
#![allow(clippy::must_use_candidate)]
#![allow(clippy::missing_errors_doc)]
#![allow(clippy::missing_panics_doc)]
#![allow(clippy::doc_markdown)]
#![allow(clippy::cast_possible_truncation)]

//! bridge-client library: a session client for a local AI bridge service.
//!
//! Building blocks:
//! - `session`: connection lifecycle, request queueing, heartbeat, reconnect
//! - `correlator`: pending request table with per-request deadlines
//! - `protocol`: wire frames (outbound requests, inbound frame decoding)
//! - `transport`: duplex channel abstraction and the WebSocket implementation
//! - `reconnect`: backoff policy
//! - `client`: one-shot HTTP fallback
//! - `history`: bounded, persisted conversation log
//! - `assistant`: chat facade tying the above together
//! - `prompts`: code action prompt builders
//! - `config`: TOML + env-var configuration

pub mod assistant;
pub mod client;
pub mod config;
pub mod correlator;
pub mod error;
pub mod history;
pub mod prompts;
pub mod protocol;
pub mod reconnect;
pub mod session;
pub mod transport;

// Re-export key types at crate root for convenience.
pub use assistant::{Answer, Assistant, Via};
pub use client::BridgeHttpClient;
pub use config::Config;
pub use error::{AssistantError, ClientError, HistoryError, SessionError, TransportError};
pub use history::{ChatMessage, ConversationStore, FileBackend, MemoryBackend, Role, StateBackend};
pub use protocol::{OutboundRequest, Reply, RequestKind, StreamChunk};
pub use session::{ConnectionState, Session, SessionConfig, SessionEvent};
pub use transport::WsTransport;
