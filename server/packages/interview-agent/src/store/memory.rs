use std::collections::HashMap;

use futures::future::BoxFuture;
use tokio::sync::Mutex;

use super::{Checkpoint, CheckpointStore, SessionRecord, SessionStore, StoreError, TurnRecord};
use crate::assignment::BackendAssignment;

#[derive(Debug, Default)]
struct MemoryState {
    sessions: HashMap<String, SessionRecord>,
    turns: HashMap<String, Vec<TurnRecord>>,
    files: HashMap<String, Vec<String>>,
    checkpoints: HashMap<String, Vec<Checkpoint>>,
}

/// Process-local store. State is lost on restart.
#[derive(Debug, Default)]
pub struct InMemoryStore {
    state: Mutex<MemoryState>,
}

impl InMemoryStore {
    pub fn new() -> Self {
        Self::default()
    }
}

impl SessionStore for InMemoryStore {
    fn create_session<'a>(
        &'a self,
        record: SessionRecord,
    ) -> BoxFuture<'a, Result<SessionRecord, StoreError>> {
        Box::pin(async move {
            let mut state = self.state.lock().await;
            let stored = state
                .sessions
                .entry(record.session_id.clone())
                .or_insert(record);
            Ok(stored.clone())
        })
    }

    fn session<'a>(
        &'a self,
        session_id: &'a str,
    ) -> BoxFuture<'a, Result<Option<SessionRecord>, StoreError>> {
        Box::pin(async move { Ok(self.state.lock().await.sessions.get(session_id).cloned()) })
    }

    fn set_assignment<'a>(
        &'a self,
        session_id: &'a str,
        assignment: BackendAssignment,
    ) -> BoxFuture<'a, Result<(), StoreError>> {
        Box::pin(async move {
            if let Some(session) = self.state.lock().await.sessions.get_mut(session_id) {
                session.assignment = Some(assignment);
            }
            Ok(())
        })
    }

    fn append_turns<'a>(
        &'a self,
        session_id: &'a str,
        turns: Vec<TurnRecord>,
    ) -> BoxFuture<'a, Result<Vec<TurnRecord>, StoreError>> {
        Box::pin(async move {
            let mut state = self.state.lock().await;
            let history = state.turns.entry(session_id.to_string()).or_default();
            let mut next = history.last().map(|turn| turn.sequence + 1).unwrap_or(1);
            let mut stored = Vec::with_capacity(turns.len());
            for mut turn in turns {
                turn.session_id = session_id.to_string();
                turn.sequence = next;
                next += 1;
                history.push(turn.clone());
                stored.push(turn);
            }
            Ok(stored)
        })
    }

    fn turns<'a>(
        &'a self,
        session_id: &'a str,
    ) -> BoxFuture<'a, Result<Vec<TurnRecord>, StoreError>> {
        Box::pin(async move {
            Ok(self
                .state
                .lock()
                .await
                .turns
                .get(session_id)
                .cloned()
                .unwrap_or_default())
        })
    }

    fn record_file<'a>(
        &'a self,
        session_id: &'a str,
        path: &'a str,
    ) -> BoxFuture<'a, Result<bool, StoreError>> {
        Box::pin(async move {
            let mut state = self.state.lock().await;
            let files = state.files.entry(session_id.to_string()).or_default();
            if files.iter().any(|existing| existing == path) {
                return Ok(false);
            }
            files.push(path.to_string());
            Ok(true)
        })
    }

    fn files<'a>(&'a self, session_id: &'a str) -> BoxFuture<'a, Result<Vec<String>, StoreError>> {
        Box::pin(async move {
            Ok(self
                .state
                .lock()
                .await
                .files
                .get(session_id)
                .cloned()
                .unwrap_or_default())
        })
    }
}

impl CheckpointStore for InMemoryStore {
    fn upsert_checkpoint<'a>(
        &'a self,
        checkpoint: Checkpoint,
    ) -> BoxFuture<'a, Result<(), StoreError>> {
        Box::pin(async move {
            let mut state = self.state.lock().await;
            let rows = state
                .checkpoints
                .entry(checkpoint.session_id.clone())
                .or_default();
            match rows
                .iter_mut()
                .find(|row| row.message_id == checkpoint.message_id)
            {
                Some(row) => *row = checkpoint,
                None => rows.push(checkpoint),
            }
            Ok(())
        })
    }

    fn delete_checkpoint<'a>(
        &'a self,
        session_id: &'a str,
        message_id: &'a str,
    ) -> BoxFuture<'a, Result<(), StoreError>> {
        Box::pin(async move {
            if let Some(rows) = self.state.lock().await.checkpoints.get_mut(session_id) {
                rows.retain(|row| row.message_id != message_id);
            }
            Ok(())
        })
    }

    fn checkpoints<'a>(
        &'a self,
        session_id: &'a str,
    ) -> BoxFuture<'a, Result<Vec<Checkpoint>, StoreError>> {
        Box::pin(async move {
            Ok(self
                .state
                .lock()
                .await
                .checkpoints
                .get(session_id)
                .cloned()
                .unwrap_or_default())
        })
    }
}
