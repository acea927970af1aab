//! Backend adapters behind a single streaming interface.

use std::collections::HashMap;
use std::sync::Arc;

use futures::future::BoxFuture;
use interview_agent_error::InterviewError;
use interview_agent_stream_schema::{AgentEvent, BackendKind, ConversationTurn, TokenUsage};
use serde_json::Value;

use crate::types::HelpfulnessLevel;

pub mod graph;
pub mod tool_agent;

pub use graph::GraphAdapter;
pub use tool_agent::{MockToolAgent, ProcessToolAgent, ToolAgentAdapter, ToolAgentRuntime};

/// Receives a turn's progress as the backend produces it.
pub trait TurnCallbacks: Send {
    fn on_text_delta(&mut self, text: &str);
    fn on_tool_start(&mut self, tool_id: &str, tool_name: &str, input: &Value);
    fn on_tool_result(
        &mut self,
        tool_id: &str,
        tool_name: Option<&str>,
        output: &Value,
        is_error: bool,
    );
}

#[derive(Debug, Clone, Default)]
pub struct TurnOptions {
    pub helpfulness_level: Option<HelpfulnessLevel>,
    pub question_id: Option<String>,
}

#[derive(Debug, Clone)]
pub struct TurnRequest {
    pub session_id: String,
    /// Message with code context already prepended.
    pub message: String,
    /// Earlier turns, oldest first.
    pub history: Vec<ConversationTurn>,
    pub options: TurnOptions,
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct TurnResult {
    pub text: String,
    pub usage: TokenUsage,
    pub thread_id: Option<String>,
}

pub trait BackendAdapter: Send + Sync {
    fn kind(&self) -> BackendKind;

    /// Runs one turn, reporting progress through `callbacks` in order.
    fn send<'a>(
        &'a self,
        request: TurnRequest,
        callbacks: &'a mut dyn TurnCallbacks,
    ) -> BoxFuture<'a, Result<TurnResult, InterviewError>>;
}

#[derive(Clone, Default)]
pub struct AdapterRegistry {
    adapters: HashMap<BackendKind, Arc<dyn BackendAdapter>>,
}

impl AdapterRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&mut self, adapter: Arc<dyn BackendAdapter>) {
        self.adapters.insert(adapter.kind(), adapter);
    }

    pub fn with(mut self, adapter: Arc<dyn BackendAdapter>) -> Self {
        self.register(adapter);
        self
    }

    pub fn get(&self, kind: BackendKind) -> Option<Arc<dyn BackendAdapter>> {
        self.adapters.get(&kind).cloned()
    }

    pub fn kinds(&self) -> Vec<BackendKind> {
        BackendKind::all()
            .into_iter()
            .filter(|kind| self.adapters.contains_key(kind))
            .collect()
    }
}

/// Folds converted backend events into callbacks and a final result.
#[derive(Debug, Default)]
pub(crate) struct TurnAccumulator {
    text: String,
    usage: TokenUsage,
    completed: bool,
    failure: Option<String>,
}

impl TurnAccumulator {
    pub(crate) fn new() -> Self {
        Self::default()
    }

    pub(crate) fn apply(&mut self, event: AgentEvent, callbacks: &mut dyn TurnCallbacks) {
        match event {
            AgentEvent::TextDelta { text } => {
                self.text.push_str(&text);
                callbacks.on_text_delta(&text);
            }
            AgentEvent::ToolStart {
                tool_id,
                tool_name,
                input,
            } => callbacks.on_tool_start(&tool_id, &tool_name, &input),
            AgentEvent::ToolResult {
                tool_id,
                tool_name,
                output,
                is_error,
            } => callbacks.on_tool_result(&tool_id, tool_name.as_deref(), &output, is_error),
            AgentEvent::Usage(usage) => self.usage.add(&usage),
            AgentEvent::Completed { text, usage } => {
                if self.text.is_empty() {
                    if let Some(text) = text.filter(|text| !text.is_empty()) {
                        callbacks.on_text_delta(&text);
                        self.text = text;
                    }
                }
                if let Some(usage) = usage {
                    self.usage = usage;
                }
                self.completed = true;
            }
            AgentEvent::Failed { message } => {
                if self.failure.is_none() {
                    self.failure = Some(message);
                }
            }
        }
    }

    /// Whether the backend has reported the end of the turn.
    pub(crate) fn is_finished(&self) -> bool {
        self.completed || self.failure.is_some()
    }

    pub(crate) fn failure(&self) -> Option<&str> {
        self.failure.as_deref()
    }

    pub(crate) fn mark_completed(&mut self) {
        self.completed = true;
    }

    pub(crate) fn is_completed(&self) -> bool {
        self.completed
    }

    pub(crate) fn into_result(self, thread_id: Option<String>) -> TurnResult {
        TurnResult {
            text: self.text,
            usage: self.usage,
            thread_id,
        }
    }
}
