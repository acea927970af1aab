use interview_agent_stream_schema::BackendKind;
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};
use utoipa::ToSchema;

use crate::assignment::BackendAssignment;
use crate::store::{Checkpoint, SessionRecord, TurnRecord};

/// The file the candidate is looking at when they send a message.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, JsonSchema, ToSchema)]
#[serde(rename_all = "camelCase")]
pub struct CodeContext {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub file_name: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub language: Option<String>,
    pub content: String,
}

/// How much the assistant may do on the candidate's behalf.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, JsonSchema, ToSchema)]
#[serde(rename_all = "snake_case")]
pub enum HelpfulnessLevel {
    Consultant,
    PairProgrammer,
    FullCopilot,
}

impl HelpfulnessLevel {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Consultant => "consultant",
            Self::PairProgrammer => "pair_programmer",
            Self::FullCopilot => "full_copilot",
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema, ToSchema)]
#[serde(rename_all = "camelCase")]
pub struct ChatRequest {
    pub message: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub code_context: Option<CodeContext>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub helpfulness_level: Option<HelpfulnessLevel>,
    /// Requested backend. Only honored on the session's first turn.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub backend: Option<BackendKind>,
}

#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema, ToSchema)]
#[serde(rename_all = "camelCase")]
pub struct CreateSessionRequest {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub session_id: Option<String>,
    pub candidate_id: String,
    pub organization_id: String,
    pub assessment_id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub question_id: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema, ToSchema)]
#[serde(rename_all = "camelCase")]
pub struct SessionInfo {
    pub session_id: String,
    pub candidate_id: String,
    pub organization_id: String,
    pub assessment_id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub question_id: Option<String>,
    pub created_at: i64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub assignment: Option<BackendAssignment>,
}

impl From<SessionRecord> for SessionInfo {
    fn from(record: SessionRecord) -> Self {
        Self {
            session_id: record.session_id,
            candidate_id: record.candidate_id,
            organization_id: record.organization_id,
            assessment_id: record.assessment_id,
            question_id: record.question_id,
            created_at: record.created_at,
            assignment: record.assignment,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema, ToSchema)]
pub struct HealthResponse {
    pub status: String,
}

#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema, ToSchema)]
pub struct MessagesResponse {
    pub messages: Vec<TurnRecord>,
}

#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema, ToSchema)]
pub struct CheckpointListResponse {
    pub checkpoints: Vec<Checkpoint>,
}

#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema, ToSchema)]
pub struct FilesResponse {
    pub files: Vec<String>,
}
