use std::fmt;
use std::str::FromStr;

use schemars::JsonSchema;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use utoipa::ToSchema;

pub mod agents;
pub mod normalize;

pub use agents::{graph as convert_graph, tool_agent as convert_tool_agent};
pub use normalize::{extract, NormalizedToolResult};

/// The two interchangeable agent backends a session can be routed to.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, JsonSchema, ToSchema,
)]
#[serde(rename_all = "snake_case")]
pub enum BackendKind {
    /// Backend A: in-process tool-using agent.
    ToolAgent,
    /// Backend B: external graph-orchestration service.
    Graph,
}

impl BackendKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::ToolAgent => "tool_agent",
            Self::Graph => "graph",
        }
    }

    pub fn all() -> [BackendKind; 2] {
        [Self::ToolAgent, Self::Graph]
    }
}

impl fmt::Display for BackendKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for BackendKind {
    type Err = String;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        match value.trim().to_ascii_lowercase().as_str() {
            "tool_agent" | "tool-agent" | "a" => Ok(Self::ToolAgent),
            "graph" | "b" => Ok(Self::Graph),
            other => Err(format!("unknown backend: {other}")),
        }
    }
}

/// How a session's backend was chosen.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, JsonSchema, ToSchema)]
#[serde(rename_all = "snake_case")]
pub enum AssignmentSource {
    Explicit,
    Sticky,
    Experiment,
    Default,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, JsonSchema, ToSchema)]
#[serde(rename_all = "snake_case")]
pub enum TurnRole {
    User,
    Assistant,
}

impl TurnRole {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::User => "user",
            Self::Assistant => "assistant",
        }
    }
}

/// One prior turn handed to a backend as conversation history.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, JsonSchema, ToSchema)]
pub struct ConversationTurn {
    pub role: TurnRole,
    pub content: String,
}

#[derive(
    Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize, JsonSchema, ToSchema,
)]
#[serde(rename_all = "camelCase")]
pub struct TokenUsage {
    pub input_tokens: u64,
    pub output_tokens: u64,
    pub total_tokens: u64,
}

impl TokenUsage {
    pub fn new(input_tokens: u64, output_tokens: u64) -> Self {
        Self {
            input_tokens,
            output_tokens,
            total_tokens: input_tokens + output_tokens,
        }
    }

    pub fn add(&mut self, other: &TokenUsage) {
        self.input_tokens += other.input_tokens;
        self.output_tokens += other.output_tokens;
        self.total_tokens += other.total_tokens;
    }

    /// Reads the `input_tokens`/`output_tokens` pair most providers report.
    pub fn from_value(value: &Value) -> Option<Self> {
        let input = value.get("input_tokens").and_then(Value::as_u64);
        let output = value.get("output_tokens").and_then(Value::as_u64);
        if input.is_none() && output.is_none() {
            return None;
        }
        let mut usage = Self::new(input.unwrap_or(0), output.unwrap_or(0));
        if let Some(total) = value.get("total_tokens").and_then(Value::as_u64) {
            usage.total_tokens = total;
        }
        Some(usage)
    }
}

/// Backend-neutral event produced by the native converters.
#[derive(Debug, Clone, PartialEq)]
pub enum AgentEvent {
    TextDelta {
        text: String,
    },
    ToolStart {
        tool_id: String,
        tool_name: String,
        input: Value,
    },
    ToolResult {
        tool_id: String,
        tool_name: Option<String>,
        output: Value,
        is_error: bool,
    },
    Usage(TokenUsage),
    Completed {
        text: Option<String>,
        usage: Option<TokenUsage>,
    },
    Failed {
        message: String,
    },
}

#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema, ToSchema)]
#[serde(rename_all = "camelCase")]
pub struct StreamStartData {
    pub message_id: String,
}

#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema, ToSchema)]
#[serde(rename_all = "camelCase")]
pub struct ContentData {
    pub delta: String,
}

#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema, ToSchema)]
#[serde(rename_all = "camelCase")]
pub struct ToolUseStartData {
    pub tool_name: String,
    pub tool_id: String,
    pub input: Value,
}

#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema, ToSchema)]
#[serde(rename_all = "camelCase")]
pub struct ToolResultData {
    pub tool_name: String,
    pub tool_id: String,
    pub output: Map<String, Value>,
    pub is_error: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema, ToSchema)]
#[serde(rename_all = "camelCase")]
pub struct DoneMetadata {
    pub message_id: String,
    pub backend: BackendKind,
    pub assignment_source: AssignmentSource,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub experiment_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub thread_id: Option<String>,
    pub latency_ms: u64,
    pub prompt_quality: f32,
}

#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema, ToSchema)]
#[serde(rename_all = "camelCase")]
pub struct DoneData {
    pub response: String,
    pub tools_used: Vec<String>,
    pub files_modified: Vec<String>,
    pub usage: TokenUsage,
    pub metadata: DoneMetadata,
}

#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema, ToSchema)]
#[serde(rename_all = "camelCase")]
pub struct ErrorEventData {
    /// Machine readable error code, e.g. `backend_overloaded`.
    pub error: String,
    pub message: String,
    pub retryable: bool,
    pub message_id: String,
}

/// One event of the outbound SSE protocol.
#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema, ToSchema)]
#[serde(tag = "event", content = "data", rename_all = "snake_case")]
pub enum StreamEvent {
    StreamStart(StreamStartData),
    Content(ContentData),
    ToolUseStart(ToolUseStartData),
    ToolResult(ToolResultData),
    Done(DoneData),
    Error(ErrorEventData),
}

impl StreamEvent {
    pub fn name(&self) -> &'static str {
        match self {
            Self::StreamStart(_) => "stream_start",
            Self::Content(_) => "content",
            Self::ToolUseStart(_) => "tool_use_start",
            Self::ToolResult(_) => "tool_result",
            Self::Done(_) => "done",
            Self::Error(_) => "error",
        }
    }

    pub fn data(&self) -> Value {
        let result = match self {
            Self::StreamStart(data) => serde_json::to_value(data),
            Self::Content(data) => serde_json::to_value(data),
            Self::ToolUseStart(data) => serde_json::to_value(data),
            Self::ToolResult(data) => serde_json::to_value(data),
            Self::Done(data) => serde_json::to_value(data),
            Self::Error(data) => serde_json::to_value(data),
        };
        result.unwrap_or(Value::Null)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn tool_start_payload_uses_camel_case() {
        let event = StreamEvent::ToolUseStart(ToolUseStartData {
            tool_name: "write_file".to_string(),
            tool_id: "call_1".to_string(),
            input: json!({ "path": "main.py" }),
        });
        assert_eq!(event.name(), "tool_use_start");
        assert_eq!(
            event.data(),
            json!({ "toolName": "write_file", "toolId": "call_1", "input": { "path": "main.py" } })
        );
    }

    #[test]
    fn error_event_payload_shape() {
        let event = StreamEvent::Error(ErrorEventData {
            error: "backend_overloaded".to_string(),
            message: "try again".to_string(),
            retryable: true,
            message_id: "msg_1".to_string(),
        });
        assert_eq!(event.name(), "error");
        assert_eq!(
            event.data(),
            json!({
                "error": "backend_overloaded",
                "message": "try again",
                "retryable": true,
                "messageId": "msg_1"
            })
        );
    }

    #[test]
    fn backend_kind_parses_aliases() {
        assert_eq!("A".parse::<BackendKind>(), Ok(BackendKind::ToolAgent));
        assert_eq!("graph".parse::<BackendKind>(), Ok(BackendKind::Graph));
        assert!("other".parse::<BackendKind>().is_err());
    }

    #[test]
    fn usage_reads_provider_fields() {
        let usage = TokenUsage::from_value(&json!({ "input_tokens": 10, "output_tokens": 5 }))
            .expect("usage");
        assert_eq!(usage, TokenUsage::new(10, 5));
        assert_eq!(usage.total_tokens, 15);
        assert!(TokenUsage::from_value(&json!({})).is_none());
    }
}
