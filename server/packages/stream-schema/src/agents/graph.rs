use std::collections::{HashMap, HashSet};

use serde_json::{json, Value};

use crate::{AgentEvent, TokenUsage};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum MessageMode {
    /// `messages` stream mode: each payload is a `[chunk, metadata]` pair and
    /// chunk content is already a delta.
    Tuple,
    /// `messages/partial`: payloads carry the accumulated message so far.
    Partial,
    /// `messages/complete`: final form of each message.
    Complete,
}

/// A tool call whose arguments may still be streaming in.
#[derive(Debug)]
struct PendingTool {
    index: Option<u64>,
    id: String,
    name: String,
    args: PendingArgs,
}

#[derive(Debug)]
enum PendingArgs {
    /// Raw JSON text assembled from `tool_call_chunks`.
    Fragments(String),
    Value(Value),
}

impl PendingArgs {
    fn into_input(self) -> Value {
        match self {
            Self::Value(value) => value,
            Self::Fragments(text) if text.trim().is_empty() => json!({}),
            Self::Fragments(text) => {
                serde_json::from_str(&text).unwrap_or_else(|_| json!({ "rawArguments": text }))
            }
        }
    }
}

/// Converts the graph service's SSE events for a single run.
///
/// Tool starts are held back until their arguments are complete: at the next
/// chunk without tool call data, at a complete AI message, before any tool
/// message, or at the end of the run.
#[derive(Debug, Default)]
pub struct GraphConverter {
    emitted_chars: HashMap<String, usize>,
    tool_names: HashMap<String, String>,
    pending_tools: Vec<PendingTool>,
    finished_tools: HashSet<String>,
}

impl GraphConverter {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn convert(&mut self, event: &str, data: &Value) -> Result<Vec<AgentEvent>, String> {
        // Subgraph events arrive as `messages|node:task`.
        let base = event.split('|').next().unwrap_or(event);
        let events = match base {
            "metadata" | "messages/metadata" | "updates" | "values" | "debug" | "custom"
            | "events" | "tasks" | "checkpoints" | "feedback" => Vec::new(),
            "messages" => match data.as_array().and_then(|pair| pair.first()) {
                Some(chunk) => self.message(chunk, MessageMode::Tuple),
                None => self.message(data, MessageMode::Tuple),
            },
            "messages/partial" => self.messages(data, MessageMode::Partial),
            "messages/complete" => self.messages(data, MessageMode::Complete),
            "error" => vec![AgentEvent::Failed {
                message: error_message(data),
            }],
            "end" => {
                let mut events = self.flush_tools();
                events.push(AgentEvent::Completed {
                    text: None,
                    usage: None,
                });
                events
            }
            other => return Err(format!("unsupported graph event: {other}")),
        };
        Ok(events)
    }

    /// Releases tool starts still held when the stream closes without `end`.
    pub fn finish(&mut self) -> Vec<AgentEvent> {
        self.flush_tools()
    }

    fn messages(&mut self, data: &Value, mode: MessageMode) -> Vec<AgentEvent> {
        match data.as_array() {
            Some(messages) => messages
                .iter()
                .flat_map(|message| self.message(message, mode))
                .collect(),
            None => self.message(data, mode),
        }
    }

    fn message(&mut self, message: &Value, mode: MessageMode) -> Vec<AgentEvent> {
        let kind = message.get("type").and_then(Value::as_str).unwrap_or("");
        match kind {
            "AIMessageChunk" => self.ai_message(message, mode, true),
            "AIMessage" | "ai" => self.ai_message(message, mode, false),
            "tool" | "ToolMessage" => {
                let mut events = self.flush_tools();
                events.extend(self.tool_message(message));
                events
            }
            _ => Vec::new(),
        }
    }

    fn ai_message(
        &mut self,
        message: &Value,
        mode: MessageMode,
        is_chunk: bool,
    ) -> Vec<AgentEvent> {
        let mut events = Vec::new();
        let text = content_text(message.get("content"));
        let call_chunks = non_empty_array(message.get("tool_call_chunks"));
        let calls = non_empty_array(message.get("tool_calls"));

        match mode {
            MessageMode::Tuple => {
                if call_chunks.is_none() && calls.is_none() {
                    events.extend(self.flush_tools());
                }
                if !text.is_empty() {
                    events.push(AgentEvent::TextDelta { text });
                }
            }
            MessageMode::Partial | MessageMode::Complete => {
                let id = message
                    .get("id")
                    .and_then(Value::as_str)
                    .unwrap_or("")
                    .to_string();
                let emitted = self.emitted_chars.entry(id).or_insert(0);
                if let Some(delta) = text.get(*emitted..) {
                    if !delta.is_empty() {
                        events.push(AgentEvent::TextDelta {
                            text: delta.to_string(),
                        });
                    }
                    *emitted = text.len();
                }
            }
        }

        match (mode, call_chunks, calls) {
            (MessageMode::Tuple, Some(chunks), _) => {
                for chunk in chunks {
                    self.record_tool_chunk(chunk);
                }
            }
            (_, _, Some(calls)) => {
                for call in calls {
                    self.record_tool_call(call);
                }
            }
            _ => {}
        }
        if mode == MessageMode::Complete || (mode == MessageMode::Tuple && !is_chunk) {
            events.extend(self.flush_tools());
        }

        if mode != MessageMode::Partial {
            if let Some(usage) = message
                .get("usage_metadata")
                .and_then(TokenUsage::from_value)
            {
                events.push(AgentEvent::Usage(usage));
            }
        }
        events
    }

    /// Appends one streamed `tool_call_chunks` entry. Continuation chunks
    /// usually carry only `index` and an `args` fragment.
    fn record_tool_chunk(&mut self, chunk: &Value) {
        let index = chunk.get("index").and_then(Value::as_u64);
        let id = chunk.get("id").and_then(Value::as_str).unwrap_or("");
        let name = chunk.get("name").and_then(Value::as_str).unwrap_or("");
        let fragment = chunk.get("args").and_then(Value::as_str).unwrap_or("");
        if self.tool_names.contains_key(id) {
            return;
        }

        let position = self.pending_tools.iter().position(|pending| match index {
            Some(index) => pending.index == Some(index),
            None => !id.is_empty() && pending.id == id,
        });
        match position {
            Some(position) => {
                let pending = &mut self.pending_tools[position];
                if pending.id.is_empty() {
                    pending.id = id.to_string();
                }
                if pending.name.is_empty() {
                    pending.name = name.to_string();
                }
                if let PendingArgs::Fragments(args) = &mut pending.args {
                    args.push_str(fragment);
                }
            }
            None if !id.is_empty() => self.pending_tools.push(PendingTool {
                index,
                id: id.to_string(),
                name: name.to_string(),
                args: PendingArgs::Fragments(fragment.to_string()),
            }),
            None => {}
        }
    }

    /// Records a parsed tool call. Later sightings of the same id replace the
    /// arguments, as partial messages carry the accumulated form.
    fn record_tool_call(&mut self, call: &Value) {
        let id = call.get("id").and_then(Value::as_str).unwrap_or("");
        let name = call.get("name").and_then(Value::as_str).unwrap_or("");
        if id.is_empty() || self.tool_names.contains_key(id) {
            return;
        }
        let args = PendingArgs::Value(call.get("args").cloned().unwrap_or_else(|| json!({})));
        match self.pending_tools.iter_mut().find(|pending| pending.id == id) {
            Some(pending) => {
                if !name.is_empty() {
                    pending.name = name.to_string();
                }
                pending.args = args;
            }
            None => self.pending_tools.push(PendingTool {
                index: None,
                id: id.to_string(),
                name: name.to_string(),
                args,
            }),
        }
    }

    fn flush_tools(&mut self) -> Vec<AgentEvent> {
        let mut events = Vec::new();
        for pending in std::mem::take(&mut self.pending_tools) {
            if pending.id.is_empty()
                || pending.name.is_empty()
                || self.tool_names.contains_key(&pending.id)
            {
                continue;
            }
            self.tool_names
                .insert(pending.id.clone(), pending.name.clone());
            events.push(AgentEvent::ToolStart {
                tool_id: pending.id,
                tool_name: pending.name,
                input: pending.args.into_input(),
            });
        }
        events
    }

    fn tool_message(&mut self, message: &Value) -> Option<AgentEvent> {
        let tool_id = message.get("tool_call_id").and_then(Value::as_str)?;
        if !self.finished_tools.insert(tool_id.to_string()) {
            return None;
        }
        let tool_name = message
            .get("name")
            .and_then(Value::as_str)
            .map(|s| s.to_string())
            .or_else(|| self.tool_names.get(tool_id).cloned());
        let is_error = message.get("status").and_then(Value::as_str) == Some("error");
        Some(AgentEvent::ToolResult {
            tool_id: tool_id.to_string(),
            tool_name,
            output: json!({ "content": message.get("content").cloned().unwrap_or(Value::Null) }),
            is_error,
        })
    }
}

fn non_empty_array(value: Option<&Value>) -> Option<&Vec<Value>> {
    value
        .and_then(Value::as_array)
        .filter(|items| !items.is_empty())
}

fn content_text(content: Option<&Value>) -> String {
    match content {
        Some(Value::String(text)) => text.clone(),
        Some(Value::Array(blocks)) => blocks
            .iter()
            .filter(|block| block.get("type").and_then(Value::as_str) == Some("text"))
            .filter_map(|block| block.get("text").and_then(Value::as_str))
            .collect(),
        _ => String::new(),
    }
}

fn error_message(data: &Value) -> String {
    if let Some(text) = data.as_str() {
        return text.to_string();
    }
    let error = data.get("error").and_then(Value::as_str);
    let message = data.get("message").and_then(Value::as_str);
    match (error, message) {
        (Some(error), Some(message)) => format!("{error}: {message}"),
        (None, Some(message)) => message.to_string(),
        (Some(error), None) => error.to_string(),
        (None, None) => data.to_string(),
    }
}
