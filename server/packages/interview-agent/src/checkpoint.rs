//! Periodic snapshots of in-flight turns.
//!
//! Every write goes through a per-turn writer task so the streaming path never
//! waits on storage. The writer applies writes in submission order.

use std::sync::Arc;

use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio::time::Instant;
use uuid::Uuid;

use crate::config::CheckpointConfig;
use crate::store::{now_ms, Checkpoint, CheckpointStatus, CheckpointStore, ToolCallRecord};

#[derive(Debug)]
enum CheckpointWrite {
    Upsert(Checkpoint),
    Delete { session_id: String, message_id: String },
}

pub struct CheckpointManager {
    config: CheckpointConfig,
    template: Checkpoint,
    status: CheckpointStatus,
    last_saved: Instant,
    writes: mpsc::UnboundedSender<CheckpointWrite>,
    writer: JoinHandle<()>,
}

impl CheckpointManager {
    pub fn start(
        store: Arc<dyn CheckpointStore>,
        config: CheckpointConfig,
        session_id: &str,
        message_id: &str,
        user_message: &str,
        question_id: Option<String>,
    ) -> Self {
        let (writes, rx) = mpsc::unbounded_channel();
        let writer = tokio::spawn(run_writer(store, rx));
        let template = Checkpoint {
            checkpoint_id: format!("ckpt_{}", Uuid::new_v4().simple()),
            session_id: session_id.to_string(),
            message_id: message_id.to_string(),
            user_message: user_message.to_string(),
            partial_response: String::new(),
            tool_calls: Vec::new(),
            status: CheckpointStatus::Streaming,
            last_checkpoint_at: now_ms(),
            question_id,
            error: None,
            revision: 0,
        };
        Self {
            config,
            template,
            status: CheckpointStatus::Streaming,
            last_saved: Instant::now(),
            writes,
            writer,
        }
    }

    pub fn checkpoint_id(&self) -> &str {
        &self.template.checkpoint_id
    }

    pub fn status(&self) -> CheckpointStatus {
        self.status
    }

    /// Queues a streaming snapshot when the interval has elapsed and enough
    /// text has accumulated. Returns whether a write was queued.
    pub fn maybe_checkpoint(&mut self, partial: &str, tool_calls: &[ToolCallRecord]) -> bool {
        if self.status != CheckpointStatus::Streaming {
            return false;
        }
        if self.last_saved.elapsed() < self.config.interval() {
            return false;
        }
        if partial.chars().count() < self.config.min_content_chars {
            return false;
        }
        self.queue_upsert(CheckpointStatus::Streaming, partial, tool_calls, None);
        true
    }

    /// Writes a snapshot with the given status. `Completed` removes the row;
    /// `Failed` persists regardless of thresholds. Both are final.
    pub fn save(
        &mut self,
        status: CheckpointStatus,
        partial: &str,
        tool_calls: &[ToolCallRecord],
        error: Option<String>,
    ) {
        if self.status != CheckpointStatus::Streaming {
            return;
        }
        match status {
            CheckpointStatus::Completed => self.clear(),
            CheckpointStatus::Streaming | CheckpointStatus::Failed => {
                self.queue_upsert(status, partial, tool_calls, error);
                self.status = status;
            }
        }
    }

    /// Drops the turn's checkpoint after a successful turn.
    pub fn clear(&mut self) {
        if self.status != CheckpointStatus::Streaming {
            return;
        }
        self.status = CheckpointStatus::Completed;
        self.send(CheckpointWrite::Delete {
            session_id: self.template.session_id.clone(),
            message_id: self.template.message_id.clone(),
        });
    }

    /// Closes the queue. Awaiting the handle waits for pending writes.
    pub fn finish(self) -> JoinHandle<()> {
        drop(self.writes);
        self.writer
    }

    fn queue_upsert(
        &mut self,
        status: CheckpointStatus,
        partial: &str,
        tool_calls: &[ToolCallRecord],
        error: Option<String>,
    ) {
        self.template.revision += 1;
        self.last_saved = Instant::now();
        let checkpoint = Checkpoint {
            partial_response: partial.to_string(),
            tool_calls: tool_calls.to_vec(),
            status,
            last_checkpoint_at: now_ms(),
            error,
            ..self.template.clone()
        };
        self.send(CheckpointWrite::Upsert(checkpoint));
    }

    fn send(&self, write: CheckpointWrite) {
        if self.writes.send(write).is_err() {
            tracing::warn!(
                session_id = %self.template.session_id,
                message_id = %self.template.message_id,
                "checkpoint writer stopped; dropping write"
            );
        }
    }
}

async fn run_writer(
    store: Arc<dyn CheckpointStore>,
    mut rx: mpsc::UnboundedReceiver<CheckpointWrite>,
) {
    while let Some(write) = rx.recv().await {
        match write {
            CheckpointWrite::Upsert(checkpoint) => {
                if let Err(err) = store.upsert_checkpoint(checkpoint.clone()).await {
                    tracing::warn!(
                        session_id = %checkpoint.session_id,
                        message_id = %checkpoint.message_id,
                        status = checkpoint.status.as_str(),
                        error = %err,
                        "failed to save checkpoint"
                    );
                }
            }
            CheckpointWrite::Delete {
                session_id,
                message_id,
            } => {
                if let Err(err) = store.delete_checkpoint(&session_id, &message_id).await {
                    tracing::warn!(
                        session_id = %session_id,
                        message_id = %message_id,
                        error = %err,
                        "failed to clear checkpoint"
                    );
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use super::*;
    use crate::store::InMemoryStore;

    fn config(interval_ms: u64, min_content_chars: usize) -> CheckpointConfig {
        CheckpointConfig {
            interval_ms,
            min_content_chars,
        }
    }

    fn manager(store: &Arc<InMemoryStore>, config: CheckpointConfig) -> CheckpointManager {
        CheckpointManager::start(store.clone(), config, "s1", "m1", "help me", None)
    }

    #[tokio::test]
    async fn streaming_snapshots_respect_floor() {
        let store = Arc::new(InMemoryStore::new());
        let mut manager = manager(&store, config(0, 10));
        assert!(!manager.maybe_checkpoint("short", &[]));
        assert!(manager.maybe_checkpoint("long enough text", &[]));
        manager.finish().await.expect("writer");

        let rows = store.checkpoints("s1").await.expect("list");
        assert_eq!(rows.len(), 1);
        assert_eq!(rows[0].status, CheckpointStatus::Streaming);
        assert!(rows[0].partial_response.len() >= 10);
    }

    #[tokio::test(start_paused = true)]
    async fn streaming_snapshots_respect_interval() {
        let store = Arc::new(InMemoryStore::new());
        let mut manager = manager(&store, config(2_000, 1));
        assert!(!manager.maybe_checkpoint("some text", &[]));
        tokio::time::advance(Duration::from_millis(2_001)).await;
        assert!(manager.maybe_checkpoint("some text", &[]));
        assert!(!manager.maybe_checkpoint("some more text", &[]));
        manager.finish().await.expect("writer");
    }

    #[tokio::test]
    async fn completed_turn_leaves_no_row() {
        let store = Arc::new(InMemoryStore::new());
        let mut manager = manager(&store, config(0, 1));
        assert!(manager.maybe_checkpoint("partial answer", &[]));
        manager.clear();
        assert!(!manager.maybe_checkpoint("partial answer and more", &[]));
        manager.finish().await.expect("writer");
        assert!(store.checkpoints("s1").await.expect("list").is_empty());
    }

    #[tokio::test]
    async fn failure_is_persisted_once_and_final() {
        let store = Arc::new(InMemoryStore::new());
        let mut manager = manager(&store, config(60_000, 1_000));
        let checkpoint_id = manager.checkpoint_id().to_string();
        manager.save(
            CheckpointStatus::Failed,
            "ab",
            &[],
            Some("client disconnected".to_string()),
        );
        manager.save(CheckpointStatus::Failed, "abcdef", &[], None);
        manager.clear();
        assert_eq!(manager.status(), CheckpointStatus::Failed);
        manager.finish().await.expect("writer");

        let rows = store.checkpoints("s1").await.expect("list");
        assert_eq!(rows.len(), 1);
        assert_eq!(rows[0].checkpoint_id, checkpoint_id);
        assert_eq!(rows[0].status, CheckpointStatus::Failed);
        assert_eq!(rows[0].partial_response, "ab");
        assert_eq!(rows[0].error.as_deref(), Some("client disconnected"));
    }
}
