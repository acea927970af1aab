//! Drives one chat turn from request validation to the terminal stream event.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Instant;

use interview_agent_error::InterviewError;
use interview_agent_stream_schema::{
    ContentData, ConversationTurn, DoneData, DoneMetadata, ErrorEventData, NormalizedToolResult,
    StreamEvent, StreamStartData, ToolResultData, ToolUseStartData, TurnRole,
};
use serde_json::{json, Value};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use uuid::Uuid;

use crate::adapters::{AdapterRegistry, BackendAdapter, TurnCallbacks, TurnOptions, TurnRequest};
use crate::assignment::{AssignmentRequest, BackendAssigner, BackendAssignment};
use crate::broadcast::{FileChangeBroadcaster, FileChangeEvent, FileChangeType};
use crate::checkpoint::CheckpointManager;
use crate::config::{CheckpointConfig, MAX_MESSAGE_CHARS};
use crate::prompt::{enrich_message, prompt_quality_score};
use crate::store::{
    now_ms, CheckpointStatus, CheckpointStore, SessionRecord, SessionStore, ToolCallRecord,
    TurnRecord,
};
use crate::types::ChatRequest;

const DISCONNECTED: &str = "client disconnected";

/// A running turn. Events arrive in callback order and end with `done` or
/// `error`.
pub struct TurnStream {
    pub message_id: String,
    pub assignment: BackendAssignment,
    pub events: mpsc::UnboundedReceiver<StreamEvent>,
    pub task: JoinHandle<()>,
}

pub struct Orchestrator {
    sessions: Arc<dyn SessionStore>,
    checkpoints: Arc<dyn CheckpointStore>,
    adapters: AdapterRegistry,
    assigner: Arc<BackendAssigner>,
    broadcaster: Arc<dyn FileChangeBroadcaster>,
    checkpoint_config: CheckpointConfig,
}

impl Orchestrator {
    pub fn new(
        sessions: Arc<dyn SessionStore>,
        checkpoints: Arc<dyn CheckpointStore>,
        adapters: AdapterRegistry,
        assigner: Arc<BackendAssigner>,
        broadcaster: Arc<dyn FileChangeBroadcaster>,
        checkpoint_config: CheckpointConfig,
    ) -> Self {
        Self {
            sessions,
            checkpoints,
            adapters,
            assigner,
            broadcaster,
            checkpoint_config,
        }
    }

    /// Validates the request and starts the turn.
    ///
    /// Errors returned here happen before any stream exists; everything after
    /// that point is reported as an `error` event.
    pub async fn handle(
        &self,
        session_id: &str,
        request: ChatRequest,
    ) -> Result<TurnStream, InterviewError> {
        validate_message(&request.message)?;
        let session = self
            .sessions
            .session(session_id)
            .await?
            .ok_or_else(|| InterviewError::SessionNotFound {
                session_id: session_id.to_string(),
            })?;

        let assignment = self
            .assigner
            .resolve(AssignmentRequest {
                session_id,
                candidate_id: &session.candidate_id,
                organization_id: &session.organization_id,
                assessment_id: &session.assessment_id,
                explicit: request.backend,
            })
            .await;
        let adapter = self.adapters.get(assignment.backend).ok_or_else(|| {
            InterviewError::BackendUnavailable {
                backend: assignment.backend.to_string(),
                message: Some("no adapter registered for backend".to_string()),
            }
        })?;

        let message_id = format!("msg_{}", Uuid::new_v4().simple());
        tracing::info!(
            session_id,
            message_id = %message_id,
            backend = %assignment.backend,
            "starting turn"
        );

        let (tx, events) = mpsc::unbounded_channel();
        let turn = Turn {
            session,
            message_id: message_id.clone(),
            assignment: assignment.clone(),
            request,
            adapter,
            sessions: self.sessions.clone(),
            checkpoints: self.checkpoints.clone(),
            broadcaster: self.broadcaster.clone(),
            checkpoint_config: self.checkpoint_config,
        };
        let task = tokio::spawn(turn.run(tx));

        Ok(TurnStream {
            message_id,
            assignment,
            events,
            task,
        })
    }
}

fn validate_message(message: &str) -> Result<(), InterviewError> {
    if message.trim().is_empty() {
        return Err(InterviewError::InvalidRequest {
            message: "message must not be empty".to_string(),
        });
    }
    if message.chars().count() > MAX_MESSAGE_CHARS {
        return Err(InterviewError::InvalidRequest {
            message: format!("message exceeds {MAX_MESSAGE_CHARS} characters"),
        });
    }
    Ok(())
}

struct Turn {
    session: SessionRecord,
    message_id: String,
    assignment: BackendAssignment,
    request: ChatRequest,
    adapter: Arc<dyn BackendAdapter>,
    sessions: Arc<dyn SessionStore>,
    checkpoints: Arc<dyn CheckpointStore>,
    broadcaster: Arc<dyn FileChangeBroadcaster>,
    checkpoint_config: CheckpointConfig,
}

impl Turn {
    async fn run(self, tx: mpsc::UnboundedSender<StreamEvent>) {
        let started = Instant::now();
        let session_id = self.session.session_id.clone();

        let checkpoint = CheckpointManager::start(
            self.checkpoints.clone(),
            self.checkpoint_config,
            &session_id,
            &self.message_id,
            &self.request.message,
            self.session.question_id.clone(),
        );
        let mut callbacks = StreamCallbacks {
            session_id: session_id.clone(),
            message_id: self.message_id.clone(),
            tx,
            disconnected: false,
            delivered: String::new(),
            checkpoint,
            tool_calls: Vec::new(),
            started_tools: HashMap::new(),
            tools_used: Vec::new(),
            files_modified: Vec::new(),
            file_tasks: Vec::new(),
            sessions: self.sessions.clone(),
            broadcaster: self.broadcaster.clone(),
        };
        callbacks.emit(StreamEvent::StreamStart(StreamStartData {
            message_id: self.message_id.clone(),
        }));

        let history = match self.sessions.turns(&session_id).await {
            Ok(turns) => turns
                .into_iter()
                .map(|turn| ConversationTurn {
                    role: turn.role,
                    content: turn.content,
                })
                .collect(),
            Err(err) => {
                tracing::warn!(session_id = %session_id, error = %err, "failed to load history");
                Vec::new()
            }
        };
        let turn_request = TurnRequest {
            session_id: session_id.clone(),
            message: enrich_message(&self.request.message, self.request.code_context.as_ref()),
            history,
            options: TurnOptions {
                helpfulness_level: self.request.helpfulness_level,
                question_id: self.session.question_id.clone(),
            },
        };

        let outcome = self.adapter.send(turn_request, &mut callbacks).await;
        callbacks.settle_file_tasks().await;

        match outcome {
            Ok(result) => {
                let prompt_quality = prompt_quality_score(
                    &self.request.message,
                    self.request.code_context.is_some(),
                );
                self.persist_turns(&callbacks, &result.text, prompt_quality)
                    .await;

                if !callbacks.disconnected && callbacks.tx.is_closed() {
                    callbacks.mark_disconnected();
                }
                if !callbacks.disconnected {
                    callbacks.checkpoint.clear();
                }

                let latency_ms = started.elapsed().as_millis() as u64;
                tracing::info!(
                    session_id = %session_id,
                    message_id = %self.message_id,
                    latency_ms,
                    disconnected = callbacks.disconnected,
                    "turn completed"
                );
                let done = StreamEvent::Done(DoneData {
                    response: result.text,
                    tools_used: callbacks.tools_used.clone(),
                    files_modified: callbacks.files_modified.clone(),
                    usage: result.usage,
                    metadata: DoneMetadata {
                        message_id: self.message_id.clone(),
                        backend: self.assignment.backend,
                        assignment_source: self.assignment.source,
                        experiment_id: self.assignment.experiment_id.clone(),
                        thread_id: result.thread_id,
                        latency_ms,
                        prompt_quality,
                    },
                });
                callbacks.finish(done).await;
            }
            Err(err) => {
                tracing::warn!(
                    session_id = %session_id,
                    message_id = %self.message_id,
                    error = %err,
                    retryable = err.retryable(),
                    "turn failed"
                );
                let delivered = callbacks.delivered.clone();
                let tool_calls = callbacks.tool_calls.clone();
                callbacks.checkpoint.save(
                    CheckpointStatus::Failed,
                    &delivered,
                    &tool_calls,
                    Some(err.to_string()),
                );
                let error = StreamEvent::Error(ErrorEventData {
                    error: err.error_type().as_str().to_string(),
                    message: err.client_message(),
                    retryable: err.retryable(),
                    message_id: self.message_id.clone(),
                });
                callbacks.finish(error).await;
            }
        }
    }

    async fn persist_turns(&self, callbacks: &StreamCallbacks, response: &str, quality: f32) {
        let created_at = now_ms();
        let user = TurnRecord {
            session_id: self.session.session_id.clone(),
            message_id: self.message_id.clone(),
            role: TurnRole::User,
            content: self.request.message.clone(),
            sequence: 0,
            created_at,
            prompt_quality: Some(quality),
            tools_used: Vec::new(),
            files_modified: Vec::new(),
            backend: None,
        };
        let assistant = TurnRecord {
            role: TurnRole::Assistant,
            content: response.to_string(),
            tools_used: callbacks.tools_used.clone(),
            files_modified: callbacks.files_modified.clone(),
            backend: Some(self.assignment.backend),
            ..user.clone()
        };
        if let Err(err) = self
            .sessions
            .append_turns(&self.session.session_id, vec![user, assistant])
            .await
        {
            tracing::error!(
                session_id = %self.session.session_id,
                message_id = %self.message_id,
                error = %err,
                "failed to persist turns"
            );
        }
    }
}

/// Forwards adapter callbacks to the client and the checkpoint manager.
struct StreamCallbacks {
    session_id: String,
    message_id: String,
    tx: mpsc::UnboundedSender<StreamEvent>,
    disconnected: bool,
    /// Text the client actually received.
    delivered: String,
    checkpoint: CheckpointManager,
    tool_calls: Vec<ToolCallRecord>,
    started_tools: HashMap<String, String>,
    tools_used: Vec<String>,
    files_modified: Vec<String>,
    file_tasks: Vec<JoinHandle<()>>,
    sessions: Arc<dyn SessionStore>,
    broadcaster: Arc<dyn FileChangeBroadcaster>,
}

impl StreamCallbacks {
    /// Returns whether the client received the event.
    fn emit(&mut self, event: StreamEvent) -> bool {
        if self.disconnected {
            return false;
        }
        if self.tx.send(event).is_err() {
            self.mark_disconnected();
            return false;
        }
        true
    }

    fn mark_disconnected(&mut self) {
        self.disconnected = true;
        tracing::info!(
            session_id = %self.session_id,
            message_id = %self.message_id,
            delivered_chars = self.delivered.chars().count(),
            "client disconnected; freezing checkpoint"
        );
        self.checkpoint.save(
            CheckpointStatus::Failed,
            &self.delivered,
            &self.tool_calls,
            Some(DISCONNECTED.to_string()),
        );
    }

    fn snapshot(&mut self) {
        self.checkpoint
            .maybe_checkpoint(&self.delivered, &self.tool_calls);
    }

    fn start_tool(&mut self, tool_id: &str, tool_name: &str, input: &Value) {
        self.started_tools
            .insert(tool_id.to_string(), tool_name.to_string());
        if !self.tools_used.iter().any(|name| name == tool_name) {
            self.tools_used.push(tool_name.to_string());
        }
        self.tool_calls.push(ToolCallRecord {
            id: tool_id.to_string(),
            name: tool_name.to_string(),
            arguments: input.clone(),
            result: None,
            is_error: false,
        });
        self.emit(StreamEvent::ToolUseStart(ToolUseStartData {
            tool_name: tool_name.to_string(),
            tool_id: tool_id.to_string(),
            input: input.clone(),
        }));
    }

    fn track_file(&mut self, path: String, created: bool) {
        if !self.files_modified.contains(&path) {
            self.files_modified.push(path.clone());
        }
        let sessions = self.sessions.clone();
        let broadcaster = self.broadcaster.clone();
        let session_id = self.session_id.clone();
        self.file_tasks.push(tokio::spawn(async move {
            let first_sighting = match sessions.record_file(&session_id, &path).await {
                Ok(first) => first,
                Err(err) => {
                    tracing::warn!(session_id = %session_id, path = %path, error = %err, "failed to record file");
                    false
                }
            };
            let change_type = if created && first_sighting {
                FileChangeType::Create
            } else {
                FileChangeType::Update
            };
            let event = FileChangeEvent::new(&session_id, change_type, &path);
            if let Err(err) = broadcaster.publish(event) {
                tracing::warn!(session_id = %session_id, path = %path, error = %err, "failed to publish file change");
            }
        }));
    }

    async fn settle_file_tasks(&mut self) {
        for task in self.file_tasks.drain(..) {
            if let Err(err) = task.await {
                tracing::warn!(session_id = %self.session_id, error = %err, "file change task failed");
            }
        }
    }

    /// Sends the terminal event after pending checkpoint writes land.
    async fn finish(mut self, terminal: StreamEvent) {
        let writer = self.checkpoint.finish();
        if let Err(err) = writer.await {
            tracing::warn!(session_id = %self.session_id, error = %err, "checkpoint writer failed");
        }
        if !self.disconnected && self.tx.send(terminal).is_err() {
            tracing::debug!(session_id = %self.session_id, "client left before terminal event");
        }
    }
}

impl TurnCallbacks for StreamCallbacks {
    fn on_text_delta(&mut self, text: &str) {
        let delivered = self.emit(StreamEvent::Content(ContentData {
            delta: text.to_string(),
        }));
        if delivered {
            self.delivered.push_str(text);
        }
        self.snapshot();
    }

    fn on_tool_start(&mut self, tool_id: &str, tool_name: &str, input: &Value) {
        if self.started_tools.contains_key(tool_id) {
            return;
        }
        self.start_tool(tool_id, tool_name, input);
        self.snapshot();
    }

    fn on_tool_result(
        &mut self,
        tool_id: &str,
        tool_name: Option<&str>,
        output: &Value,
        is_error: bool,
    ) {
        let name = tool_name
            .map(str::to_string)
            .or_else(|| self.started_tools.get(tool_id).cloned())
            .unwrap_or_else(|| "unknown".to_string());
        if !self.started_tools.contains_key(tool_id) {
            self.start_tool(tool_id, &name, &json!({}));
        }

        let normalized = NormalizedToolResult::new(tool_id, &name, output, is_error);
        let input = match self.tool_calls.iter_mut().find(|call| call.id == tool_id) {
            Some(call) => {
                call.result = Some(Value::Object(normalized.output.clone()));
                call.is_error = normalized.is_error;
                Some(call.arguments.clone())
            }
            None => None,
        };
        if let Some(mutation) = normalized.modified_path(input.as_ref()) {
            self.track_file(mutation.path, mutation.created);
        }

        self.emit(StreamEvent::ToolResult(ToolResultData {
            tool_name: normalized.tool_name,
            tool_id: normalized.tool_id,
            output: normalized.output,
            is_error: normalized.is_error,
        }));
        self.snapshot();
    }
}
