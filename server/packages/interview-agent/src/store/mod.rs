//! Session, turn and checkpoint persistence.

use std::str::FromStr;

use futures::future::BoxFuture;
use interview_agent_error::InterviewError;
use interview_agent_stream_schema::{BackendKind, TurnRole};
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use thiserror::Error;
use utoipa::ToSchema;

use crate::assignment::BackendAssignment;

mod memory;
mod sqlite;

pub use memory::InMemoryStore;
pub use sqlite::SqliteStore;

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("database error: {0}")]
    Database(#[from] sqlx::Error),
    #[error("invalid stored json: {0}")]
    Json(#[from] serde_json::Error),
    #[error("invalid stored value: {0}")]
    Corrupt(String),
    #[error("failed to prepare storage: {0}")]
    Setup(String),
}

impl From<StoreError> for InterviewError {
    fn from(err: StoreError) -> Self {
        InterviewError::Persistence {
            message: err.to_string(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, JsonSchema, ToSchema)]
#[serde(rename_all = "camelCase")]
pub struct SessionRecord {
    pub session_id: String,
    pub candidate_id: String,
    pub organization_id: String,
    pub assessment_id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub question_id: Option<String>,
    /// Unix epoch milliseconds.
    pub created_at: i64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub assignment: Option<BackendAssignment>,
}

/// One persisted message of a session's conversation.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, JsonSchema, ToSchema)]
#[serde(rename_all = "camelCase")]
pub struct TurnRecord {
    pub session_id: String,
    pub message_id: String,
    pub role: TurnRole,
    pub content: String,
    /// Assigned by the store; position in the session's history.
    pub sequence: u64,
    pub created_at: i64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub prompt_quality: Option<f32>,
    #[serde(default)]
    pub tools_used: Vec<String>,
    #[serde(default)]
    pub files_modified: Vec<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub backend: Option<BackendKind>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, JsonSchema, ToSchema)]
#[serde(rename_all = "snake_case")]
pub enum CheckpointStatus {
    Streaming,
    Completed,
    Failed,
}

impl CheckpointStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Streaming => "streaming",
            Self::Completed => "completed",
            Self::Failed => "failed",
        }
    }
}

impl FromStr for CheckpointStatus {
    type Err = String;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        match value {
            "streaming" => Ok(Self::Streaming),
            "completed" => Ok(Self::Completed),
            "failed" => Ok(Self::Failed),
            other => Err(format!("unknown checkpoint status: {other}")),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, JsonSchema, ToSchema)]
#[serde(rename_all = "camelCase")]
pub struct ToolCallRecord {
    pub id: String,
    pub name: String,
    pub arguments: Value,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub result: Option<Value>,
    #[serde(default)]
    pub is_error: bool,
}

/// Snapshot of one in-flight turn.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, JsonSchema, ToSchema)]
#[serde(rename_all = "camelCase")]
pub struct Checkpoint {
    pub checkpoint_id: String,
    pub session_id: String,
    pub message_id: String,
    pub user_message: String,
    pub partial_response: String,
    pub tool_calls: Vec<ToolCallRecord>,
    pub status: CheckpointStatus,
    pub last_checkpoint_at: i64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub question_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    /// Incremented on every write of the same row.
    pub revision: u64,
}

pub trait SessionStore: Send + Sync {
    /// Registers a session. Returns the existing record when the id is taken.
    fn create_session<'a>(
        &'a self,
        record: SessionRecord,
    ) -> BoxFuture<'a, Result<SessionRecord, StoreError>>;

    fn session<'a>(
        &'a self,
        session_id: &'a str,
    ) -> BoxFuture<'a, Result<Option<SessionRecord>, StoreError>>;

    fn set_assignment<'a>(
        &'a self,
        session_id: &'a str,
        assignment: BackendAssignment,
    ) -> BoxFuture<'a, Result<(), StoreError>>;

    /// Appends turns in order, assigning each the next sequence number.
    fn append_turns<'a>(
        &'a self,
        session_id: &'a str,
        turns: Vec<TurnRecord>,
    ) -> BoxFuture<'a, Result<Vec<TurnRecord>, StoreError>>;

    fn turns<'a>(&'a self, session_id: &'a str)
        -> BoxFuture<'a, Result<Vec<TurnRecord>, StoreError>>;

    /// Returns `true` when the path had not been recorded for the session yet.
    fn record_file<'a>(
        &'a self,
        session_id: &'a str,
        path: &'a str,
    ) -> BoxFuture<'a, Result<bool, StoreError>>;

    fn files<'a>(&'a self, session_id: &'a str) -> BoxFuture<'a, Result<Vec<String>, StoreError>>;
}

pub trait CheckpointStore: Send + Sync {
    /// Inserts or replaces the row keyed by session id and message id.
    fn upsert_checkpoint<'a>(
        &'a self,
        checkpoint: Checkpoint,
    ) -> BoxFuture<'a, Result<(), StoreError>>;

    fn delete_checkpoint<'a>(
        &'a self,
        session_id: &'a str,
        message_id: &'a str,
    ) -> BoxFuture<'a, Result<(), StoreError>>;

    fn checkpoints<'a>(
        &'a self,
        session_id: &'a str,
    ) -> BoxFuture<'a, Result<Vec<Checkpoint>, StoreError>>;
}

pub(crate) fn now_ms() -> i64 {
    chrono::Utc::now().timestamp_millis()
}
