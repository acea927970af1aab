use schemars::JsonSchema;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use thiserror::Error;
use utoipa::ToSchema;

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, JsonSchema, ToSchema)]
#[serde(rename_all = "snake_case")]
pub enum ErrorType {
    InvalidRequest,
    SessionNotFound,
    TokenInvalid,
    BackendUnavailable,
    BackendOverloaded,
    BackendFailed,
    ThreadCorrupted,
    Persistence,
    StreamError,
    Timeout,
}

impl ErrorType {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::InvalidRequest => "invalid_request",
            Self::SessionNotFound => "session_not_found",
            Self::TokenInvalid => "token_invalid",
            Self::BackendUnavailable => "backend_unavailable",
            Self::BackendOverloaded => "backend_overloaded",
            Self::BackendFailed => "backend_failed",
            Self::ThreadCorrupted => "thread_corrupted",
            Self::Persistence => "persistence",
            Self::StreamError => "stream_error",
            Self::Timeout => "timeout",
        }
    }

    pub fn as_urn(&self) -> &'static str {
        match self {
            Self::InvalidRequest => "urn:interview-agent:error:invalid_request",
            Self::SessionNotFound => "urn:interview-agent:error:session_not_found",
            Self::TokenInvalid => "urn:interview-agent:error:token_invalid",
            Self::BackendUnavailable => "urn:interview-agent:error:backend_unavailable",
            Self::BackendOverloaded => "urn:interview-agent:error:backend_overloaded",
            Self::BackendFailed => "urn:interview-agent:error:backend_failed",
            Self::ThreadCorrupted => "urn:interview-agent:error:thread_corrupted",
            Self::Persistence => "urn:interview-agent:error:persistence",
            Self::StreamError => "urn:interview-agent:error:stream_error",
            Self::Timeout => "urn:interview-agent:error:timeout",
        }
    }

    pub fn title(&self) -> &'static str {
        match self {
            Self::InvalidRequest => "Invalid Request",
            Self::SessionNotFound => "Session Not Found",
            Self::TokenInvalid => "Token Invalid",
            Self::BackendUnavailable => "Backend Unavailable",
            Self::BackendOverloaded => "Backend Overloaded",
            Self::BackendFailed => "Backend Failed",
            Self::ThreadCorrupted => "Thread Corrupted",
            Self::Persistence => "Persistence Failure",
            Self::StreamError => "Stream Error",
            Self::Timeout => "Timeout",
        }
    }

    pub fn status_code(&self) -> u16 {
        match self {
            Self::InvalidRequest => 400,
            Self::SessionNotFound => 404,
            Self::TokenInvalid => 401,
            Self::BackendUnavailable => 503,
            Self::BackendOverloaded => 503,
            Self::BackendFailed => 502,
            Self::ThreadCorrupted => 502,
            Self::Persistence => 500,
            Self::StreamError => 502,
            Self::Timeout => 504,
        }
    }

    /// Whether a client may reasonably resend the same message.
    pub fn retryable(&self) -> bool {
        matches!(self, Self::BackendOverloaded | Self::Timeout)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema, ToSchema)]
pub struct ProblemDetails {
    #[serde(rename = "type")]
    pub type_: String,
    pub title: String,
    pub status: u16,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub detail: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub instance: Option<String>,
    #[serde(flatten, default, skip_serializing_if = "Map::is_empty")]
    pub extensions: Map<String, Value>,
}

impl ProblemDetails {
    pub fn new(error_type: ErrorType, detail: Option<String>) -> Self {
        Self {
            type_: error_type.as_urn().to_string(),
            title: error_type.title().to_string(),
            status: error_type.status_code(),
            detail,
            instance: None,
            extensions: Map::new(),
        }
    }
}

#[derive(Debug, Error)]
pub enum InterviewError {
    #[error("invalid request: {message}")]
    InvalidRequest { message: String },
    #[error("session not found: {session_id}")]
    SessionNotFound { session_id: String },
    #[error("token invalid")]
    TokenInvalid { message: Option<String> },
    #[error("backend unavailable: {backend}")]
    BackendUnavailable { backend: String, message: Option<String> },
    #[error("backend overloaded: {backend}")]
    BackendOverloaded { backend: String, message: String },
    #[error("backend failed: {message}")]
    BackendFailed { backend: String, message: String },
    #[error("conversation thread corrupted: {thread_id}")]
    ThreadCorrupted { thread_id: String, message: String },
    #[error("persistence failure: {message}")]
    Persistence { message: String },
    #[error("stream error: {message}")]
    StreamError { message: String },
    #[error("timeout")]
    Timeout { message: Option<String> },
}

impl InterviewError {
    pub fn error_type(&self) -> ErrorType {
        match self {
            Self::InvalidRequest { .. } => ErrorType::InvalidRequest,
            Self::SessionNotFound { .. } => ErrorType::SessionNotFound,
            Self::TokenInvalid { .. } => ErrorType::TokenInvalid,
            Self::BackendUnavailable { .. } => ErrorType::BackendUnavailable,
            Self::BackendOverloaded { .. } => ErrorType::BackendOverloaded,
            Self::BackendFailed { .. } => ErrorType::BackendFailed,
            Self::ThreadCorrupted { .. } => ErrorType::ThreadCorrupted,
            Self::Persistence { .. } => ErrorType::Persistence,
            Self::StreamError { .. } => ErrorType::StreamError,
            Self::Timeout { .. } => ErrorType::Timeout,
        }
    }

    pub fn retryable(&self) -> bool {
        self.error_type().retryable()
    }

    /// Maps a raw failure reported by a backend into the error taxonomy.
    ///
    /// Rate limit and overload signals become `BackendOverloaded`; everything
    /// else is a plain `BackendFailed`.
    pub fn from_backend_message(backend: impl Into<String>, message: impl Into<String>) -> Self {
        let backend = backend.into();
        let message = message.into();
        if is_overloaded_message(&message) {
            Self::BackendOverloaded { backend, message }
        } else {
            Self::BackendFailed { backend, message }
        }
    }

    /// Human readable text suitable for the `message` field of a stream error.
    pub fn client_message(&self) -> String {
        match self {
            Self::BackendOverloaded { .. } => {
                "The assistant is temporarily overloaded. Please try again.".to_string()
            }
            Self::BackendFailed { message, .. } => message.clone(),
            Self::ThreadCorrupted { .. } => {
                "The conversation state could not be recovered.".to_string()
            }
            Self::Timeout { message } => message
                .clone()
                .unwrap_or_else(|| "The assistant took too long to respond.".to_string()),
            other => other.to_string(),
        }
    }

    fn details(&self) -> (Option<String>, Option<String>, Option<Value>) {
        match self {
            Self::InvalidRequest { .. } => (None, None, None),
            Self::SessionNotFound { session_id } => (None, Some(session_id.clone()), None),
            Self::TokenInvalid { message } => (None, None, message_details(message.as_deref())),
            Self::BackendUnavailable { backend, message } => (
                Some(backend.clone()),
                None,
                message_details(message.as_deref()),
            ),
            Self::BackendOverloaded { backend, message }
            | Self::BackendFailed { backend, message } => {
                (Some(backend.clone()), None, message_details(Some(message)))
            }
            Self::ThreadCorrupted { thread_id, message } => {
                let mut map = Map::new();
                map.insert("threadId".to_string(), Value::String(thread_id.clone()));
                map.insert("message".to_string(), Value::String(message.clone()));
                (None, None, Some(Value::Object(map)))
            }
            Self::Persistence { message } | Self::StreamError { message } => {
                (None, None, message_details(Some(message)))
            }
            Self::Timeout { message } => (None, None, message_details(message.as_deref())),
        }
    }

    pub fn to_problem_details(&self) -> ProblemDetails {
        let mut problem = ProblemDetails::new(self.error_type(), Some(self.to_string()));
        let (backend, session_id, details) = self.details();

        let mut extensions = Map::new();
        if let Some(backend) = backend {
            extensions.insert("backend".to_string(), Value::String(backend));
        }
        if let Some(session_id) = session_id {
            extensions.insert("sessionId".to_string(), Value::String(session_id));
        }
        if let Some(details) = details {
            extensions.insert("details".to_string(), details);
        }
        extensions.insert("retryable".to_string(), Value::Bool(self.retryable()));
        problem.extensions = extensions;
        problem
    }
}

fn message_details(message: Option<&str>) -> Option<Value> {
    message.map(|msg| {
        let mut map = Map::new();
        map.insert("message".to_string(), Value::String(msg.to_string()));
        Value::Object(map)
    })
}

/// Detects upstream throttling in free-form backend error text.
pub fn is_overloaded_message(message: &str) -> bool {
    let lower = message.to_ascii_lowercase();
    lower.contains("overloaded")
        || lower.contains("rate limit")
        || lower.contains("rate_limit")
        || lower.contains("too many requests")
        || lower.contains("status 429")
        || lower.contains("status 529")
}

impl From<InterviewError> for ProblemDetails {
    fn from(value: InterviewError) -> Self {
        value.to_problem_details()
    }
}

impl From<&InterviewError> for ProblemDetails {
    fn from(value: &InterviewError) -> Self {
        value.to_problem_details()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn overload_signals_are_retryable() {
        let err = InterviewError::from_backend_message("graph", "Error: Overloaded (529)");
        assert_eq!(err.error_type(), ErrorType::BackendOverloaded);
        assert!(err.retryable());

        let err = InterviewError::from_backend_message("tool_agent", "rate_limit_error: slow down");
        assert!(err.retryable());
    }

    #[test]
    fn generic_failures_are_not_retryable() {
        let err = InterviewError::from_backend_message("graph", "boom");
        assert_eq!(err.error_type(), ErrorType::BackendFailed);
        assert!(!err.retryable());
        assert_eq!(err.client_message(), "boom");
    }

    #[test]
    fn problem_details_carry_backend_and_retryable() {
        let err = InterviewError::BackendOverloaded {
            backend: "graph".to_string(),
            message: "overloaded".to_string(),
        };
        let problem = err.to_problem_details();
        assert_eq!(problem.status, 503);
        assert_eq!(problem.type_, "urn:interview-agent:error:backend_overloaded");
        assert_eq!(problem.extensions["backend"], "graph");
        assert_eq!(problem.extensions["retryable"], true);
    }

    #[test]
    fn session_not_found_maps_to_404() {
        let err = InterviewError::SessionNotFound {
            session_id: "s1".to_string(),
        };
        let problem: ProblemDetails = (&err).into();
        assert_eq!(problem.status, 404);
        assert_eq!(problem.extensions["sessionId"], "s1");
    }
}
