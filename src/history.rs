//! Conversation history.
//!
//! [`ConversationStore`] keeps an ordered, capped log of [`ChatMessage`]s
//! (oldest evicted first) and writes the whole log through a [`StateBackend`]
//! after every change. The persisted form is a JSON array of records:
//!
//! ```text
//! [{"id": "…", "role": "user", "content": "…", "timestamp": 1718000000000,
//!   "metadata": {…}?}, …]
//! ```
//!
//! Snapshots coming from outside (import, or a stored blob written by an
//! older version) are validated record by record: entries without a
//! non-empty `id`, `role`, and `content`, or with an unknown role, are
//! dropped rather than failing the whole import.

use std::collections::VecDeque;
use std::path::{Path, PathBuf};
use std::sync::Mutex;
use std::time::{SystemTime, UNIX_EPOCH};

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use tracing::{debug, warn};

use crate::error::HistoryError;
use crate::protocol::generate_request_id;

/// Default number of messages kept.
pub const DEFAULT_CAPACITY: usize = 100;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    User,
    Assistant,
    Error,
    System,
}

impl Role {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::User => "user",
            Self::Assistant => "assistant",
            Self::Error => "error",
            Self::System => "system",
        }
    }

    fn parse(s: &str) -> Option<Self> {
        match s {
            "user" => Some(Self::User),
            "assistant" => Some(Self::Assistant),
            "error" => Some(Self::Error),
            "system" => Some(Self::System),
            _ => None,
        }
    }
}

/// One entry of the conversation log.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ChatMessage {
    pub id: String,
    pub role: Role,
    pub content: String,
    /// Unix milliseconds.
    #[serde(rename = "timestamp")]
    pub timestamp_ms: u64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub metadata: Option<Map<String, Value>>,
}

impl ChatMessage {
    /// New message with a fresh id, stamped now.
    pub fn new(role: Role, content: impl Into<String>) -> Self {
        Self {
            id: generate_request_id(),
            role,
            content: content.into(),
            timestamp_ms: now_ms(),
            metadata: None,
        }
    }

    #[must_use]
    pub fn with_id(mut self, id: impl Into<String>) -> Self {
        self.id = id.into();
        self
    }

    #[must_use]
    pub fn with_metadata(mut self, metadata: Map<String, Value>) -> Self {
        self.metadata = Some(metadata);
        self
    }

    /// Validate one record of an external snapshot.
    fn from_record(record: &Value) -> Option<Self> {
        let non_empty = |key: &str| {
            record
                .get(key)
                .and_then(Value::as_str)
                .filter(|s| !s.is_empty())
        };
        let id = non_empty("id")?;
        let role = Role::parse(non_empty("role")?)?;
        let content = non_empty("content")?;
        // Non-numeric timestamps (e.g. ISO strings) are restamped.
        let timestamp_ms = record
            .get("timestamp")
            .and_then(Value::as_u64)
            .unwrap_or_else(now_ms);
        let metadata = record.get("metadata").and_then(Value::as_object).cloned();
        Some(Self {
            id: id.to_string(),
            role,
            content: content.to_string(),
            timestamp_ms,
            metadata,
        })
    }
}

/// `{role, content}` pair handed to the bridge as conversation context.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ContextTurn {
    pub role: Role,
    pub content: String,
}

/// Outcome of [`ConversationStore::import_snapshot`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct ImportReport {
    /// Records now in the store.
    pub accepted: usize,
    /// Records dropped as invalid.
    pub rejected: usize,
    /// Valid records dropped because they exceeded the capacity.
    pub evicted: usize,
}

// ---------------------------------------------------------------------------
// Backends
// ---------------------------------------------------------------------------

/// Key/value persistence for the serialized log.
pub trait StateBackend: Send {
    /// The stored blob, or `None` if nothing was saved yet.
    fn load(&self) -> Result<Option<String>, HistoryError>;
    fn save(&self, data: &str) -> Result<(), HistoryError>;
}

impl<B: StateBackend + ?Sized> StateBackend for Box<B> {
    fn load(&self) -> Result<Option<String>, HistoryError> {
        (**self).load()
    }

    fn save(&self, data: &str) -> Result<(), HistoryError> {
        (**self).save(data)
    }
}

/// Keeps the blob in memory. Used when no history path is configured.
#[derive(Debug, Default)]
pub struct MemoryBackend {
    data: Mutex<Option<String>>,
}

impl MemoryBackend {
    pub fn new() -> Self {
        Self::default()
    }

    /// Backend pre-loaded with `data`.
    pub fn with_data(data: impl Into<String>) -> Self {
        Self {
            data: Mutex::new(Some(data.into())),
        }
    }
}

impl StateBackend for MemoryBackend {
    fn load(&self) -> Result<Option<String>, HistoryError> {
        Ok(self
            .data
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
            .clone())
    }

    fn save(&self, data: &str) -> Result<(), HistoryError> {
        *self
            .data
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner) = Some(data.to_string());
        Ok(())
    }
}

/// Stores the blob in a JSON file. Writes go to a sibling temp file that is
/// then renamed over the target, so a crash never leaves a torn file.
#[derive(Debug, Clone)]
pub struct FileBackend {
    path: PathBuf,
}

impl FileBackend {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

impl StateBackend for FileBackend {
    fn load(&self) -> Result<Option<String>, HistoryError> {
        match std::fs::read_to_string(&self.path) {
            Ok(data) => Ok(Some(data)),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
            Err(e) => Err(e.into()),
        }
    }

    fn save(&self, data: &str) -> Result<(), HistoryError> {
        if let Some(parent) = self.path.parent().filter(|p| !p.as_os_str().is_empty()) {
            std::fs::create_dir_all(parent)?;
        }
        let mut temp_name = self.path.file_name().unwrap_or_default().to_os_string();
        temp_name.push(".tmp");
        let temp_path = self.path.with_file_name(temp_name);

        std::fs::write(&temp_path, data)?;
        if let Err(e) = std::fs::rename(&temp_path, &self.path) {
            let _ = std::fs::remove_file(&temp_path);
            return Err(e.into());
        }
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// Store
// ---------------------------------------------------------------------------

/// Bounded, persisted conversation log.
pub struct ConversationStore<B: StateBackend> {
    backend: B,
    capacity: usize,
    messages: VecDeque<ChatMessage>,
}

impl<B: StateBackend> ConversationStore<B> {
    /// Open the store, loading whatever the backend holds. A stored blob that
    /// is not a valid snapshot is discarded with a warning.
    pub fn open(backend: B, capacity: usize) -> Result<Self, HistoryError> {
        let mut store = Self {
            backend,
            capacity: capacity.max(1),
            messages: VecDeque::new(),
        };
        if let Some(data) = store.backend.load()? {
            match store.validate(&data) {
                Ok((messages, report)) => {
                    if report.rejected > 0 {
                        warn!(
                            rejected = report.rejected,
                            "dropped invalid records from stored history"
                        );
                    }
                    store.messages = messages;
                }
                Err(e) => warn!("stored history unreadable, starting empty: {e}"),
            }
        }
        debug!(count = store.messages.len(), "history loaded");
        Ok(store)
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    pub fn len(&self) -> usize {
        self.messages.len()
    }

    pub fn is_empty(&self) -> bool {
        self.messages.is_empty()
    }

    /// Append a message, evicting the oldest beyond capacity.
    pub fn append(&mut self, message: ChatMessage) -> Result<(), HistoryError> {
        self.messages.push_back(message);
        while self.messages.len() > self.capacity {
            self.messages.pop_front();
        }
        self.persist()
    }

    /// Every message, oldest first.
    pub fn all(&self) -> Vec<ChatMessage> {
        self.messages.iter().cloned().collect()
    }

    /// The last `count` messages, oldest first.
    pub fn recent(&self, count: usize) -> Vec<ChatMessage> {
        let skip = self.messages.len().saturating_sub(count);
        self.messages.iter().skip(skip).cloned().collect()
    }

    pub fn get(&self, id: &str) -> Option<&ChatMessage> {
        self.messages.iter().find(|m| m.id == id)
    }

    /// Remove the message with `id`. Returns whether it existed.
    pub fn delete(&mut self, id: &str) -> Result<bool, HistoryError> {
        let Some(index) = self.messages.iter().position(|m| m.id == id) else {
            return Ok(false);
        };
        self.messages.remove(index);
        self.persist()?;
        Ok(true)
    }

    /// Case-insensitive substring search over message content.
    pub fn search(&self, query: &str) -> Vec<&ChatMessage> {
        let needle = query.to_lowercase();
        self.messages
            .iter()
            .filter(|m| m.content.to_lowercase().contains(&needle))
            .collect()
    }

    /// The last `max` user/assistant turns, for sending as request context.
    pub fn context_for_ai(&self, max: usize) -> Vec<ContextTurn> {
        let turns: Vec<&ChatMessage> = self
            .messages
            .iter()
            .filter(|m| matches!(m.role, Role::User | Role::Assistant))
            .collect();
        let skip = turns.len().saturating_sub(max);
        turns[skip..]
            .iter()
            .map(|m| ContextTurn {
                role: m.role,
                content: m.content.clone(),
            })
            .collect()
    }

    pub fn clear(&mut self) -> Result<(), HistoryError> {
        self.messages.clear();
        self.persist()
    }

    /// Replace the log with the valid records of `snapshot` (a JSON array),
    /// keeping the last `capacity` of them in order. Nothing changes if the
    /// snapshot is not an array.
    pub fn import_snapshot(&mut self, snapshot: &str) -> Result<ImportReport, HistoryError> {
        let (messages, report) = self.validate(snapshot)?;
        if report.rejected > 0 {
            warn!(rejected = report.rejected, "dropped invalid history records on import");
        }
        self.messages = messages;
        self.persist()?;
        Ok(report)
    }

    /// The log as a pretty-printed JSON array.
    pub fn export_snapshot(&self) -> Result<String, HistoryError> {
        Ok(serde_json::to_string_pretty(&self.messages)?)
    }

    fn validate(
        &self,
        snapshot: &str,
    ) -> Result<(VecDeque<ChatMessage>, ImportReport), HistoryError> {
        let value: Value = serde_json::from_str(snapshot)?;
        let Value::Array(records) = value else {
            return Err(HistoryError::InvalidSnapshot(
                "expected a JSON array of messages".into(),
            ));
        };

        let total = records.len();
        let valid: Vec<ChatMessage> = records.iter().filter_map(ChatMessage::from_record).collect();
        let rejected = total - valid.len();
        let evicted = valid.len().saturating_sub(self.capacity);
        let messages: VecDeque<ChatMessage> = valid.into_iter().skip(evicted).collect();

        Ok((
            messages,
            ImportReport {
                accepted: total - rejected - evicted,
                rejected,
                evicted,
            },
        ))
    }

    fn persist(&self) -> Result<(), HistoryError> {
        let data = serde_json::to_string(&self.messages)?;
        self.backend.save(&data)
    }
}

fn now_ms() -> u64 {
    #[allow(clippy::cast_possible_truncation)]
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map_or(0, |d| d.as_millis() as u64)
}
