//! Deterministic conversation threads for the graph backend.

use std::sync::Arc;

use interview_agent_error::InterviewError;
use interview_agent_graph_client::{GraphApi, GraphClientError};
use serde_json::json;
use uuid::Uuid;

/// Namespace for session thread ids. Changing it orphans every existing thread.
pub const THREAD_NAMESPACE: Uuid = Uuid::from_u128(0x3b6a_1c9e_84f2_4d07_a5b1_92e6_0c4f_7d38);

/// Corruption-driven thread rebuilds allowed per request.
pub const MAX_CORRUPTION_RETRIES: usize = 1;

pub fn thread_id_for(session_id: &str, agent_type: &str) -> String {
    let name = format!("{agent_type}:{session_id}");
    Uuid::new_v5(&THREAD_NAMESPACE, name.as_bytes()).to_string()
}

/// Whether a backend error means the stored thread history is unusable.
pub fn is_thread_corruption(message: &str) -> bool {
    let lower = message.to_ascii_lowercase();
    let unpaired_tool_use = lower.contains("tool_use") && lower.contains("tool_result");
    let orphan_tool_call = lower.contains("tool_call_id")
        && (lower.contains("tool result")
            || lower.contains("tool message")
            || lower.contains("role 'tool'")
            || lower.contains("role \"tool\""));
    let scattered_system = lower.contains("system message")
        && (lower.contains("consecutive") || lower.contains("must be at the beginning"));
    unpaired_tool_use || orphan_tool_call || scattered_system
}

#[derive(Clone)]
pub struct ThreadManager {
    client: Arc<dyn GraphApi>,
}

impl ThreadManager {
    pub fn new(client: Arc<dyn GraphApi>) -> Self {
        Self { client }
    }

    /// Returns the session's thread id and whether the thread was just created.
    pub async fn resolve_thread(
        &self,
        session_id: &str,
        agent_type: &str,
    ) -> Result<(String, bool), InterviewError> {
        let thread_id = thread_id_for(session_id, agent_type);
        let existing = self
            .client
            .get_thread(&thread_id)
            .await
            .map_err(unavailable)?;
        if existing.is_some() {
            return Ok((thread_id, false));
        }
        self.create(&thread_id, session_id, agent_type).await?;
        tracing::info!(session_id, thread_id = %thread_id, "created conversation thread");
        Ok((thread_id, true))
    }

    /// Drops the thread's history and recreates it under the same id.
    pub async fn recreate_thread(
        &self,
        session_id: &str,
        agent_type: &str,
    ) -> Result<String, InterviewError> {
        let thread_id = thread_id_for(session_id, agent_type);
        tracing::warn!(session_id, thread_id = %thread_id, "recreating corrupted thread");
        self.client
            .delete_thread(&thread_id)
            .await
            .map_err(unavailable)?;
        self.create(&thread_id, session_id, agent_type).await?;
        Ok(thread_id)
    }

    async fn create(
        &self,
        thread_id: &str,
        session_id: &str,
        agent_type: &str,
    ) -> Result<(), InterviewError> {
        let metadata = json!({ "session_id": session_id, "agent_type": agent_type });
        self.client
            .create_thread(thread_id, metadata)
            .await
            .map(|_| ())
            .map_err(unavailable)
    }
}

fn unavailable(err: GraphClientError) -> InterviewError {
    if err.is_timeout() {
        return InterviewError::Timeout {
            message: Some(err.to_string()),
        };
    }
    InterviewError::BackendUnavailable {
        backend: "graph".to_string(),
        message: Some(err.to_string()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn thread_id_is_deterministic_per_session_and_agent() {
        let first = thread_id_for("session-1", "coding_assistant");
        assert_eq!(first, thread_id_for("session-1", "coding_assistant"));
        assert_ne!(first, thread_id_for("session-2", "coding_assistant"));
        assert_ne!(first, thread_id_for("session-1", "reviewer"));
        let parsed = Uuid::parse_str(&first).expect("uuid");
        assert_eq!(parsed.get_version_num(), 5);
    }

    #[test]
    fn corruption_signatures() {
        assert!(is_thread_corruption(
            "messages.3: `tool_use` ids were found without `tool_result` blocks immediately after"
        ));
        assert!(is_thread_corruption(
            "An assistant message with 'tool_calls' must be followed by tool messages responding to each 'tool_call_id'. Missing tool result."
        ));
        assert!(is_thread_corruption(
            "Received multiple non-consecutive system messages."
        ));
        assert!(!is_thread_corruption("rate limit exceeded"));
        assert!(!is_thread_corruption("tool_result missing"));
    }
}
