use std::path::{Path, PathBuf};
use std::str::FromStr;

use futures::future::BoxFuture;
use interview_agent_stream_schema::{BackendKind, TurnRole};
use sqlx::sqlite::{SqliteConnectOptions, SqlitePoolOptions, SqliteRow};
use sqlx::{Row, SqlitePool};
use tokio::sync::OnceCell;

use super::{
    Checkpoint, CheckpointStatus, CheckpointStore, SessionRecord, SessionStore, StoreError,
    TurnRecord,
};
use crate::assignment::BackendAssignment;

/// SQLite-backed store. The pool is opened and migrated on first use.
#[derive(Debug)]
pub struct SqliteStore {
    path: PathBuf,
    connect_options: SqliteConnectOptions,
    pool: OnceCell<SqlitePool>,
    initialized: OnceCell<()>,
}

impl SqliteStore {
    pub fn new(path: impl AsRef<Path>) -> Self {
        let path = path.as_ref().to_path_buf();
        let connect_options = SqliteConnectOptions::new()
            .filename(&path)
            .create_if_missing(true);
        Self {
            path,
            connect_options,
            pool: OnceCell::new(),
            initialized: OnceCell::new(),
        }
    }

    async fn pool(&self) -> Result<&SqlitePool, StoreError> {
        self.pool
            .get_or_try_init(|| async {
                if let Some(parent) = self.path.parent() {
                    if !parent.as_os_str().is_empty() {
                        std::fs::create_dir_all(parent)
                            .map_err(|err| StoreError::Setup(err.to_string()))?;
                    }
                }
                let pool = SqlitePoolOptions::new()
                    .max_connections(1)
                    .connect_with(self.connect_options.clone())
                    .await?;
                Ok::<SqlitePool, StoreError>(pool)
            })
            .await
    }

    async fn ready(&self) -> Result<&SqlitePool, StoreError> {
        let pool = self.pool().await?;
        self.initialized
            .get_or_try_init(|| async {
                sqlx::query("PRAGMA journal_mode=WAL;").execute(pool).await?;
                sqlx::query("PRAGMA synchronous=NORMAL;")
                    .execute(pool)
                    .await?;
                sqlx::query(include_str!("../../migrations/0001_init.sql"))
                    .execute(pool)
                    .await?;
                tracing::debug!(path = %self.path.display(), "sqlite store ready");
                Ok::<(), StoreError>(())
            })
            .await?;
        Ok(pool)
    }

    async fn create_session_inner(&self, record: SessionRecord) -> Result<SessionRecord, StoreError> {
        let pool = self.ready().await?;
        let assignment_json = record
            .assignment
            .as_ref()
            .map(serde_json::to_string)
            .transpose()?;
        sqlx::query(
            r#"INSERT INTO sessions (
                id, candidate_id, organization_id, assessment_id, question_id, created_at, assignment_json
            ) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)
            ON CONFLICT(id) DO NOTHING"#,
        )
        .bind(&record.session_id)
        .bind(&record.candidate_id)
        .bind(&record.organization_id)
        .bind(&record.assessment_id)
        .bind(&record.question_id)
        .bind(record.created_at)
        .bind(assignment_json)
        .execute(pool)
        .await?;
        self.session_inner(&record.session_id)
            .await?
            .ok_or_else(|| StoreError::Corrupt(format!("session {} vanished", record.session_id)))
    }

    async fn session_inner(&self, session_id: &str) -> Result<Option<SessionRecord>, StoreError> {
        let pool = self.ready().await?;
        let row = sqlx::query(
            r#"SELECT id, candidate_id, organization_id, assessment_id, question_id, created_at, assignment_json
               FROM sessions WHERE id = ?1"#,
        )
        .bind(session_id)
        .fetch_optional(pool)
        .await?;
        row.map(|row| session_from_row(&row)).transpose()
    }

    async fn set_assignment_inner(
        &self,
        session_id: &str,
        assignment: BackendAssignment,
    ) -> Result<(), StoreError> {
        let pool = self.ready().await?;
        let assignment_json = serde_json::to_string(&assignment)?;
        sqlx::query("UPDATE sessions SET assignment_json = ?2 WHERE id = ?1")
            .bind(session_id)
            .bind(assignment_json)
            .execute(pool)
            .await?;
        Ok(())
    }

    async fn append_turns_inner(
        &self,
        session_id: &str,
        turns: Vec<TurnRecord>,
    ) -> Result<Vec<TurnRecord>, StoreError> {
        let pool = self.ready().await?;
        let mut tx = pool.begin().await?;
        let last: i64 = sqlx::query("SELECT COALESCE(MAX(sequence), 0) AS last FROM turns WHERE session_id = ?1")
            .bind(session_id)
            .fetch_one(&mut *tx)
            .await?
            .try_get("last")?;
        let mut next = last as u64 + 1;
        let mut stored = Vec::with_capacity(turns.len());
        for mut turn in turns {
            turn.session_id = session_id.to_string();
            turn.sequence = next;
            next += 1;
            sqlx::query(
                r#"INSERT INTO turns (
                    session_id, sequence, message_id, role, content, created_at,
                    prompt_quality, tools_used_json, files_modified_json, backend
                ) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10)"#,
            )
            .bind(&turn.session_id)
            .bind(turn.sequence as i64)
            .bind(&turn.message_id)
            .bind(turn.role.as_str())
            .bind(&turn.content)
            .bind(turn.created_at)
            .bind(turn.prompt_quality.map(f64::from))
            .bind(serde_json::to_string(&turn.tools_used)?)
            .bind(serde_json::to_string(&turn.files_modified)?)
            .bind(turn.backend.map(|backend| backend.as_str()))
            .execute(&mut *tx)
            .await?;
            stored.push(turn);
        }
        tx.commit().await?;
        Ok(stored)
    }

    async fn turns_inner(&self, session_id: &str) -> Result<Vec<TurnRecord>, StoreError> {
        let pool = self.ready().await?;
        let rows = sqlx::query(
            r#"SELECT session_id, sequence, message_id, role, content, created_at,
                      prompt_quality, tools_used_json, files_modified_json, backend
               FROM turns WHERE session_id = ?1
               ORDER BY sequence ASC"#,
        )
        .bind(session_id)
        .fetch_all(pool)
        .await?;
        rows.iter().map(turn_from_row).collect()
    }

    async fn record_file_inner(&self, session_id: &str, path: &str) -> Result<bool, StoreError> {
        let pool = self.ready().await?;
        let result = sqlx::query(
            r#"INSERT INTO session_files (session_id, path, recorded_at)
               VALUES (?1, ?2, ?3)
               ON CONFLICT(session_id, path) DO NOTHING"#,
        )
        .bind(session_id)
        .bind(path)
        .bind(super::now_ms())
        .execute(pool)
        .await?;
        Ok(result.rows_affected() > 0)
    }

    async fn files_inner(&self, session_id: &str) -> Result<Vec<String>, StoreError> {
        let pool = self.ready().await?;
        let rows = sqlx::query(
            "SELECT path FROM session_files WHERE session_id = ?1 ORDER BY recorded_at ASC, rowid ASC",
        )
        .bind(session_id)
        .fetch_all(pool)
        .await?;
        rows.iter()
            .map(|row| row.try_get::<String, _>("path").map_err(StoreError::from))
            .collect()
    }

    async fn upsert_checkpoint_inner(&self, checkpoint: Checkpoint) -> Result<(), StoreError> {
        let pool = self.ready().await?;
        let tool_calls_json = serde_json::to_string(&checkpoint.tool_calls)?;
        sqlx::query(
            r#"INSERT INTO checkpoints (
                id, session_id, message_id, user_message, partial_response, tool_calls_json,
                status, last_checkpoint_at, question_id, error, revision
            ) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11)
            ON CONFLICT(session_id, message_id) DO UPDATE SET
                id = excluded.id,
                user_message = excluded.user_message,
                partial_response = excluded.partial_response,
                tool_calls_json = excluded.tool_calls_json,
                status = excluded.status,
                last_checkpoint_at = excluded.last_checkpoint_at,
                question_id = excluded.question_id,
                error = excluded.error,
                revision = excluded.revision"#,
        )
        .bind(&checkpoint.checkpoint_id)
        .bind(&checkpoint.session_id)
        .bind(&checkpoint.message_id)
        .bind(&checkpoint.user_message)
        .bind(&checkpoint.partial_response)
        .bind(tool_calls_json)
        .bind(checkpoint.status.as_str())
        .bind(checkpoint.last_checkpoint_at)
        .bind(&checkpoint.question_id)
        .bind(&checkpoint.error)
        .bind(checkpoint.revision as i64)
        .execute(pool)
        .await?;
        Ok(())
    }

    async fn delete_checkpoint_inner(
        &self,
        session_id: &str,
        message_id: &str,
    ) -> Result<(), StoreError> {
        let pool = self.ready().await?;
        sqlx::query("DELETE FROM checkpoints WHERE session_id = ?1 AND message_id = ?2")
            .bind(session_id)
            .bind(message_id)
            .execute(pool)
            .await?;
        Ok(())
    }

    async fn checkpoints_inner(&self, session_id: &str) -> Result<Vec<Checkpoint>, StoreError> {
        let pool = self.ready().await?;
        let rows = sqlx::query(
            r#"SELECT id, session_id, message_id, user_message, partial_response, tool_calls_json,
                      status, last_checkpoint_at, question_id, error, revision
               FROM checkpoints WHERE session_id = ?1
               ORDER BY last_checkpoint_at ASC, message_id ASC"#,
        )
        .bind(session_id)
        .fetch_all(pool)
        .await?;
        rows.iter().map(checkpoint_from_row).collect()
    }
}

fn session_from_row(row: &SqliteRow) -> Result<SessionRecord, StoreError> {
    let assignment_json: Option<String> = row.try_get("assignment_json")?;
    Ok(SessionRecord {
        session_id: row.try_get("id")?,
        candidate_id: row.try_get("candidate_id")?,
        organization_id: row.try_get("organization_id")?,
        assessment_id: row.try_get("assessment_id")?,
        question_id: row.try_get("question_id")?,
        created_at: row.try_get("created_at")?,
        assignment: assignment_json
            .as_deref()
            .map(serde_json::from_str)
            .transpose()?,
    })
}

fn turn_from_row(row: &SqliteRow) -> Result<TurnRecord, StoreError> {
    let role: String = row.try_get("role")?;
    let role = match role.as_str() {
        "user" => TurnRole::User,
        "assistant" => TurnRole::Assistant,
        other => return Err(StoreError::Corrupt(format!("unknown turn role: {other}"))),
    };
    let backend: Option<String> = row.try_get("backend")?;
    let backend = backend
        .as_deref()
        .map(BackendKind::from_str)
        .transpose()
        .map_err(StoreError::Corrupt)?;
    let sequence: i64 = row.try_get("sequence")?;
    let prompt_quality: Option<f64> = row.try_get("prompt_quality")?;
    let tools_used: String = row.try_get("tools_used_json")?;
    let files_modified: String = row.try_get("files_modified_json")?;
    Ok(TurnRecord {
        session_id: row.try_get("session_id")?,
        message_id: row.try_get("message_id")?,
        role,
        content: row.try_get("content")?,
        sequence: sequence as u64,
        created_at: row.try_get("created_at")?,
        prompt_quality: prompt_quality.map(|value| value as f32),
        tools_used: serde_json::from_str(&tools_used)?,
        files_modified: serde_json::from_str(&files_modified)?,
        backend,
    })
}

fn checkpoint_from_row(row: &SqliteRow) -> Result<Checkpoint, StoreError> {
    let status: String = row.try_get("status")?;
    let tool_calls: String = row.try_get("tool_calls_json")?;
    let revision: i64 = row.try_get("revision")?;
    Ok(Checkpoint {
        checkpoint_id: row.try_get("id")?,
        session_id: row.try_get("session_id")?,
        message_id: row.try_get("message_id")?,
        user_message: row.try_get("user_message")?,
        partial_response: row.try_get("partial_response")?,
        tool_calls: serde_json::from_str(&tool_calls)?,
        status: CheckpointStatus::from_str(&status).map_err(StoreError::Corrupt)?,
        last_checkpoint_at: row.try_get("last_checkpoint_at")?,
        question_id: row.try_get("question_id")?,
        error: row.try_get("error")?,
        revision: revision as u64,
    })
}

impl SessionStore for SqliteStore {
    fn create_session<'a>(
        &'a self,
        record: SessionRecord,
    ) -> BoxFuture<'a, Result<SessionRecord, StoreError>> {
        Box::pin(self.create_session_inner(record))
    }

    fn session<'a>(
        &'a self,
        session_id: &'a str,
    ) -> BoxFuture<'a, Result<Option<SessionRecord>, StoreError>> {
        Box::pin(self.session_inner(session_id))
    }

    fn set_assignment<'a>(
        &'a self,
        session_id: &'a str,
        assignment: BackendAssignment,
    ) -> BoxFuture<'a, Result<(), StoreError>> {
        Box::pin(self.set_assignment_inner(session_id, assignment))
    }

    fn append_turns<'a>(
        &'a self,
        session_id: &'a str,
        turns: Vec<TurnRecord>,
    ) -> BoxFuture<'a, Result<Vec<TurnRecord>, StoreError>> {
        Box::pin(self.append_turns_inner(session_id, turns))
    }

    fn turns<'a>(
        &'a self,
        session_id: &'a str,
    ) -> BoxFuture<'a, Result<Vec<TurnRecord>, StoreError>> {
        Box::pin(self.turns_inner(session_id))
    }

    fn record_file<'a>(
        &'a self,
        session_id: &'a str,
        path: &'a str,
    ) -> BoxFuture<'a, Result<bool, StoreError>> {
        Box::pin(self.record_file_inner(session_id, path))
    }

    fn files<'a>(&'a self, session_id: &'a str) -> BoxFuture<'a, Result<Vec<String>, StoreError>> {
        Box::pin(self.files_inner(session_id))
    }
}

impl CheckpointStore for SqliteStore {
    fn upsert_checkpoint<'a>(
        &'a self,
        checkpoint: Checkpoint,
    ) -> BoxFuture<'a, Result<(), StoreError>> {
        Box::pin(self.upsert_checkpoint_inner(checkpoint))
    }

    fn delete_checkpoint<'a>(
        &'a self,
        session_id: &'a str,
        message_id: &'a str,
    ) -> BoxFuture<'a, Result<(), StoreError>> {
        Box::pin(self.delete_checkpoint_inner(session_id, message_id))
    }

    fn checkpoints<'a>(
        &'a self,
        session_id: &'a str,
    ) -> BoxFuture<'a, Result<Vec<Checkpoint>, StoreError>> {
        Box::pin(self.checkpoints_inner(session_id))
    }
}
