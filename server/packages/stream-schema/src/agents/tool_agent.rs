use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};

use serde_json::Value;

use crate::{AgentEvent, TokenUsage};

static TEMP_ID: AtomicU64 = AtomicU64::new(1);

fn next_temp_id(prefix: &str) -> String {
    let id = TEMP_ID.fetch_add(1, Ordering::Relaxed);
    format!("{prefix}_{id}")
}

/// Converts the tool agent's stream-json lines for a single turn.
///
/// The runtime reports text twice: once as `stream_event` deltas and again in
/// the aggregated `assistant` message. Aggregated text is only used when no
/// deltas were seen for the turn.
#[derive(Debug, Default)]
pub struct ToolAgentConverter {
    saw_text_delta: bool,
    tool_names: HashMap<String, String>,
}

impl ToolAgentConverter {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn convert_line(&mut self, line: &str) -> Result<Vec<AgentEvent>, String> {
        let trimmed = line.trim();
        if trimmed.is_empty() {
            return Ok(Vec::new());
        }
        let value: Value = serde_json::from_str(trimmed)
            .map_err(|err| format!("invalid tool agent event: {err}"))?;
        self.convert(&value)
    }

    pub fn convert(&mut self, event: &Value) -> Result<Vec<AgentEvent>, String> {
        let event_type = event.get("type").and_then(Value::as_str).unwrap_or("");
        let events = match event_type {
            "system" => Vec::new(),
            "stream_event" => self.stream_event(event),
            "assistant" => self.assistant_event(event),
            "user" => self.user_event(event),
            "result" => result_event(event),
            "error" => vec![AgentEvent::Failed {
                message: error_message(event),
            }],
            _ => return Err(format!("unsupported tool agent event type: {event_type}")),
        };
        Ok(events)
    }

    fn stream_event(&mut self, event: &Value) -> Vec<AgentEvent> {
        let Some(inner) = event.get("event") else {
            return Vec::new();
        };
        if inner.get("type").and_then(Value::as_str) != Some("content_block_delta") {
            return Vec::new();
        }
        let delta = inner.get("delta");
        if delta.and_then(|d| d.get("type")).and_then(Value::as_str) != Some("text_delta") {
            return Vec::new();
        }
        match delta.and_then(|d| d.get("text")).and_then(Value::as_str) {
            Some(text) if !text.is_empty() => {
                self.saw_text_delta = true;
                vec![AgentEvent::TextDelta {
                    text: text.to_string(),
                }]
            }
            _ => Vec::new(),
        }
    }

    fn assistant_event(&mut self, event: &Value) -> Vec<AgentEvent> {
        let mut events = Vec::new();
        let content = event
            .get("message")
            .and_then(|msg| msg.get("content"))
            .and_then(Value::as_array)
            .cloned()
            .unwrap_or_default();

        for block in content {
            match block.get("type").and_then(Value::as_str).unwrap_or("") {
                "text" => {
                    if self.saw_text_delta {
                        continue;
                    }
                    if let Some(text) = block.get("text").and_then(Value::as_str) {
                        if !text.is_empty() {
                            events.push(AgentEvent::TextDelta {
                                text: text.to_string(),
                            });
                        }
                    }
                }
                "tool_use" => {
                    let Some(name) = block.get("name").and_then(Value::as_str) else {
                        continue;
                    };
                    let tool_id = block
                        .get("id")
                        .and_then(Value::as_str)
                        .map(|s| s.to_string())
                        .unwrap_or_else(|| next_temp_id("tmp_tool"));
                    if self.tool_names.contains_key(&tool_id) {
                        continue;
                    }
                    self.tool_names.insert(tool_id.clone(), name.to_string());
                    events.push(AgentEvent::ToolStart {
                        tool_id,
                        tool_name: name.to_string(),
                        input: block.get("input").cloned().unwrap_or(Value::Null),
                    });
                }
                _ => {}
            }
        }

        if let Some(usage) = event
            .get("message")
            .and_then(|msg| msg.get("usage"))
            .and_then(TokenUsage::from_value)
        {
            events.push(AgentEvent::Usage(usage));
        }
        events
    }

    fn user_event(&mut self, event: &Value) -> Vec<AgentEvent> {
        let content = event
            .get("message")
            .and_then(|msg| msg.get("content"))
            .and_then(Value::as_array)
            .cloned()
            .unwrap_or_default();

        content
            .into_iter()
            .filter(|block| block.get("type").and_then(Value::as_str) == Some("tool_result"))
            .map(|block| {
                let tool_id = block
                    .get("tool_use_id")
                    .and_then(Value::as_str)
                    .map(|s| s.to_string())
                    .unwrap_or_else(|| next_temp_id("tmp_tool"));
                let tool_name = self.tool_names.get(&tool_id).cloned();
                let is_error = block
                    .get("is_error")
                    .and_then(Value::as_bool)
                    .unwrap_or(false);
                // Keep the wrapper so the normalizer sees `content` the way the
                // runtime reported it.
                let output = match block.get("content") {
                    Some(content) => serde_json::json!({ "content": content }),
                    None => Value::Null,
                };
                AgentEvent::ToolResult {
                    tool_id,
                    tool_name,
                    output,
                    is_error,
                }
            })
            .collect()
    }
}

fn result_event(event: &Value) -> Vec<AgentEvent> {
    let subtype = event.get("subtype").and_then(Value::as_str).unwrap_or("success");
    let is_error = event
        .get("is_error")
        .and_then(Value::as_bool)
        .unwrap_or(false)
        || subtype.starts_with("error");
    if is_error {
        return vec![AgentEvent::Failed {
            message: error_message(event),
        }];
    }
    vec![AgentEvent::Completed {
        text: event
            .get("result")
            .and_then(Value::as_str)
            .map(|s| s.to_string()),
        usage: event.get("usage").and_then(TokenUsage::from_value),
    }]
}

fn error_message(event: &Value) -> String {
    event
        .get("error")
        .and_then(|err| {
            err.get("message")
                .and_then(Value::as_str)
                .or_else(|| err.as_str())
        })
        .or_else(|| event.get("result").and_then(Value::as_str))
        .or_else(|| event.get("message").and_then(Value::as_str))
        .map(|s| s.to_string())
        .unwrap_or_else(|| {
            let subtype = event.get("subtype").and_then(Value::as_str).unwrap_or("error");
            format!("tool agent reported {subtype}")
        })
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn text_delta(text: &str) -> Value {
        json!({
            "type": "stream_event",
            "event": { "type": "content_block_delta", "delta": { "type": "text_delta", "text": text } }
        })
    }

    #[test]
    fn deltas_win_over_aggregated_text() {
        let mut converter = ToolAgentConverter::new();
        let events = converter.convert(&text_delta("Hel")).expect("delta");
        assert_eq!(
            events,
            vec![AgentEvent::TextDelta {
                text: "Hel".to_string()
            }]
        );
        let events = converter
            .convert(&json!({
                "type": "assistant",
                "message": { "content": [{ "type": "text", "text": "Hello" }] }
            }))
            .expect("assistant");
        assert!(events.is_empty());
    }

    #[test]
    fn aggregated_text_used_without_deltas() {
        let mut converter = ToolAgentConverter::new();
        let events = converter
            .convert(&json!({
                "type": "assistant",
                "message": { "content": [{ "type": "text", "text": "Hello" }] }
            }))
            .expect("assistant");
        assert_eq!(
            events,
            vec![AgentEvent::TextDelta {
                text: "Hello".to_string()
            }]
        );
    }

    #[test]
    fn tool_use_and_result_pair_by_id() {
        let mut converter = ToolAgentConverter::new();
        let started = converter
            .convert(&json!({
                "type": "assistant",
                "message": { "content": [
                    { "type": "tool_use", "id": "toolu_1", "name": "write_file", "input": { "path": "a.py" } }
                ] }
            }))
            .expect("tool use");
        assert_eq!(
            started,
            vec![AgentEvent::ToolStart {
                tool_id: "toolu_1".to_string(),
                tool_name: "write_file".to_string(),
                input: json!({ "path": "a.py" }),
            }]
        );

        let finished = converter
            .convert(&json!({
                "type": "user",
                "message": { "content": [
                    { "type": "tool_result", "tool_use_id": "toolu_1", "content": "{\"success\":true}" }
                ] }
            }))
            .expect("tool result");
        assert_eq!(
            finished,
            vec![AgentEvent::ToolResult {
                tool_id: "toolu_1".to_string(),
                tool_name: Some("write_file".to_string()),
                output: json!({ "content": "{\"success\":true}" }),
                is_error: false,
            }]
        );
    }

    #[test]
    fn result_event_completes_or_fails() {
        let mut converter = ToolAgentConverter::new();
        let done = converter
            .convert(&json!({
                "type": "result",
                "subtype": "success",
                "result": "All done",
                "usage": { "input_tokens": 12, "output_tokens": 3 }
            }))
            .expect("result");
        assert_eq!(
            done,
            vec![AgentEvent::Completed {
                text: Some("All done".to_string()),
                usage: Some(TokenUsage::new(12, 3)),
            }]
        );

        let failed = converter
            .convert(&json!({ "type": "result", "subtype": "error_during_execution", "is_error": true }))
            .expect("result");
        assert_eq!(
            failed,
            vec![AgentEvent::Failed {
                message: "tool agent reported error_during_execution".to_string()
            }]
        );
    }

    #[test]
    fn unknown_types_are_rejected() {
        let mut converter = ToolAgentConverter::new();
        assert!(converter.convert(&json!({ "type": "mystery" })).is_err());
        assert!(converter.convert_line("not json").is_err());
        assert!(converter.convert_line("   ").expect("blank").is_empty());
    }
}
