//! Request correlation: request id → pending completion.
//!
//! The [`Correlator`] is owned by the session driver task, so nothing here is
//! locked. Each entry is resolved at most once: the entry is removed from the
//! map before its completion is invoked, and every later frame for the same
//! id finds nothing and is ignored.

use std::collections::HashMap;
use std::time::Duration;

use tokio::sync::{mpsc, oneshot};
use tokio::time::Instant;
use tracing::debug;

use crate::error::SessionError;
use crate::protocol::{Reply, StreamChunk};

/// Sending half of a request's final outcome.
pub type ReplySender = oneshot::Sender<Result<Reply, SessionError>>;

/// How a pending request reports back to its caller.
pub enum Completion {
    /// One final result.
    Single(ReplySender),
    /// Every chunk goes to `chunks`; the final outcome goes to `terminal`.
    Streaming {
        chunks: mpsc::UnboundedSender<StreamChunk>,
        terminal: ReplySender,
    },
}

impl Completion {
    fn finish(self, result: Result<Reply, SessionError>) {
        let terminal = match self {
            Completion::Single(tx) | Completion::Streaming { terminal: tx, .. } => tx,
        };
        // The caller may have stopped waiting.
        let _ = terminal.send(result);
    }
}

struct PendingRequest {
    completion: Completion,
    deadline: Instant,
}

/// Table of outstanding requests.
#[derive(Default)]
pub struct Correlator {
    pending: HashMap<String, PendingRequest>,
}

impl Correlator {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a completion for `id`, failing it with `RequestTimeout` once
    /// `timeout` elapses without a terminal frame.
    pub fn register(
        &mut self,
        id: &str,
        completion: Completion,
        timeout: Duration,
    ) -> Result<(), SessionError> {
        if self.pending.contains_key(id) {
            return Err(SessionError::DuplicateId(id.to_string()));
        }
        self.pending.insert(
            id.to_string(),
            PendingRequest {
                completion,
                deadline: Instant::now() + timeout,
            },
        );
        Ok(())
    }

    /// Resolve `id` with a final reply. Returns `false` if nothing was pending.
    pub fn resolve(&mut self, id: &str, reply: Reply) -> bool {
        match self.pending.remove(id) {
            Some(entry) => {
                entry.completion.finish(Ok(reply));
                true
            }
            None => {
                debug!(id, "reply for unknown or finished request ignored");
                false
            }
        }
    }

    /// Fail `id`. Returns `false` if nothing was pending.
    pub fn reject(&mut self, id: &str, error: SessionError) -> bool {
        match self.pending.remove(id) {
            Some(entry) => {
                entry.completion.finish(Err(error));
                true
            }
            None => {
                debug!(id, "error for unknown or finished request ignored");
                false
            }
        }
    }

    /// Deliver one stream chunk. The final chunk ends the request and resolves
    /// its terminal completion with the final chunk's text.
    ///
    /// Returns `false` if nothing was pending for `id`.
    pub fn stream_chunk(&mut self, id: &str, text: String, done: bool) -> bool {
        let Some(entry) = self.pending.get(id) else {
            debug!(id, "stream chunk for unknown or finished request ignored");
            return false;
        };

        if let Completion::Streaming { chunks, .. } = &entry.completion {
            let _ = chunks.send(StreamChunk {
                text: text.clone(),
                done,
            });
        }

        if done {
            if let Some(entry) = self.pending.remove(id) {
                entry.completion.finish(Ok(Reply {
                    id: id.to_string(),
                    content: text,
                    done: true,
                    metadata: None,
                }));
            }
        }
        true
    }

    /// Fail every request whose deadline is at or before `now`.
    /// Returns the ids that timed out.
    pub fn expire(&mut self, now: Instant) -> Vec<String> {
        let expired: Vec<String> = self
            .pending
            .iter()
            .filter(|(_, p)| p.deadline <= now)
            .map(|(id, _)| id.clone())
            .collect();

        for id in &expired {
            if let Some(entry) = self.pending.remove(id) {
                debug!(id = %id, "request timed out");
                entry
                    .completion
                    .finish(Err(SessionError::RequestTimeout { id: id.clone() }));
            }
        }
        expired
    }

    /// Earliest deadline among pending requests.
    pub fn next_deadline(&self) -> Option<Instant> {
        self.pending.values().map(|p| p.deadline).min()
    }

    pub fn is_pending(&self, id: &str) -> bool {
        self.pending.contains_key(id)
    }

    pub fn len(&self) -> usize {
        self.pending.len()
    }

    pub fn is_empty(&self) -> bool {
        self.pending.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const MINUTE: Duration = Duration::from_secs(60);

    fn reply(id: &str, content: &str) -> Reply {
        Reply {
            id: id.into(),
            content: content.into(),
            done: true,
            metadata: None,
        }
    }

    #[tokio::test]
    async fn resolve_delivers_once() {
        let mut c = Correlator::new();
        let (tx, rx) = oneshot::channel();
        c.register("r1", Completion::Single(tx), MINUTE).unwrap();

        assert!(c.resolve("r1", reply("r1", "hi")));
        assert!(!c.resolve("r1", reply("r1", "again")));
        assert!(!c.reject("r1", SessionError::RemoteError("late".into())));
        assert!(c.is_empty());

        assert_eq!(rx.await.unwrap().unwrap().content, "hi");
    }

    #[tokio::test]
    async fn reject_delivers_error() {
        let mut c = Correlator::new();
        let (tx, rx) = oneshot::channel();
        c.register("r1", Completion::Single(tx), MINUTE).unwrap();

        assert!(c.reject("r1", SessionError::RemoteError("boom".into())));
        assert_eq!(
            rx.await.unwrap(),
            Err(SessionError::RemoteError("boom".into()))
        );
    }

    #[test]
    fn duplicate_id_is_rejected() {
        let mut c = Correlator::new();
        let (tx1, _rx1) = oneshot::channel();
        let (tx2, _rx2) = oneshot::channel();
        c.register("r1", Completion::Single(tx1), MINUTE).unwrap();
        assert_eq!(
            c.register("r1", Completion::Single(tx2), MINUTE),
            Err(SessionError::DuplicateId("r1".into()))
        );
        assert_eq!(c.len(), 1);
    }

    #[tokio::test]
    async fn streaming_chunks_then_terminal() {
        let mut c = Correlator::new();
        let (chunk_tx, mut chunk_rx) = mpsc::unbounded_channel();
        let (tx, mut rx) = oneshot::channel();
        c.register(
            "r1",
            Completion::Streaming {
                chunks: chunk_tx,
                terminal: tx,
            },
            MINUTE,
        )
        .unwrap();

        assert!(c.stream_chunk("r1", "He".into(), false));
        assert!(c.is_pending("r1"));
        assert!(rx.try_recv().is_err());

        assert!(c.stream_chunk("r1", "llo".into(), true));
        assert!(!c.is_pending("r1"));

        assert_eq!(
            chunk_rx.recv().await.unwrap(),
            StreamChunk {
                text: "He".into(),
                done: false
            }
        );
        assert_eq!(
            chunk_rx.recv().await.unwrap(),
            StreamChunk {
                text: "llo".into(),
                done: true
            }
        );
        // Sender dropped with the entry.
        assert!(chunk_rx.recv().await.is_none());

        let terminal = rx.await.unwrap().unwrap();
        assert_eq!(terminal.content, "llo");
        assert!(terminal.done);
    }

    #[tokio::test]
    async fn single_completion_waits_for_final_chunk() {
        let mut c = Correlator::new();
        let (tx, mut rx) = oneshot::channel();
        c.register("r1", Completion::Single(tx), MINUTE).unwrap();

        c.stream_chunk("r1", "He".into(), false);
        assert!(rx.try_recv().is_err());
        c.stream_chunk("r1", "llo".into(), true);
        assert_eq!(rx.await.unwrap().unwrap().content, "llo");
    }

    #[tokio::test(start_paused = true)]
    async fn expire_times_out_and_ignores_late_frames() {
        let mut c = Correlator::new();
        let (tx_short, rx_short) = oneshot::channel();
        let (tx_long, _rx_long) = oneshot::channel();
        c.register("short", Completion::Single(tx_short), Duration::from_secs(5))
            .unwrap();
        c.register("long", Completion::Single(tx_long), MINUTE)
            .unwrap();

        assert_eq!(
            c.next_deadline(),
            Some(Instant::now() + Duration::from_secs(5))
        );
        assert!(c.expire(Instant::now()).is_empty());

        tokio::time::advance(Duration::from_secs(5)).await;
        assert_eq!(c.expire(Instant::now()), vec!["short".to_string()]);
        assert_eq!(
            rx_short.await.unwrap(),
            Err(SessionError::RequestTimeout { id: "short".into() })
        );

        assert!(!c.resolve("short", reply("short", "late")));
        assert!(!c.stream_chunk("short", "late".into(), true));
        assert!(c.is_pending("long"));
    }

    #[test]
    fn unknown_ids_are_noops() {
        let mut c = Correlator::new();
        assert!(!c.resolve("nope", reply("nope", "")));
        assert!(!c.reject("nope", SessionError::ConnectionTimeout));
        assert!(!c.stream_chunk("nope", String::new(), true));
        assert_eq!(c.next_deadline(), None);
    }
}
