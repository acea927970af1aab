use std::collections::{BTreeMap, VecDeque};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use futures::future::BoxFuture;
use futures::stream::{self, BoxStream};
use futures::StreamExt;
use interview_agent_error::InterviewError;
use interview_agent_stream_schema::convert_tool_agent::ToolAgentConverter;
use interview_agent_stream_schema::BackendKind;
use serde_json::{json, Value};
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::process::Command;

use super::{BackendAdapter, TurnAccumulator, TurnCallbacks, TurnRequest, TurnResult};
use crate::config::ToolAgentConfig;

const BACKEND: &str = "tool_agent";
const MOCK_WORD_STREAM_DELAY_MS: u64 = 30;

/// Raw stream-json lines produced by one tool agent turn.
pub type LineStream = BoxStream<'static, Result<String, InterviewError>>;

/// Launches the tool agent for a single turn.
pub trait ToolAgentRuntime: Send + Sync {
    fn run<'a>(
        &'a self,
        request: &'a TurnRequest,
    ) -> BoxFuture<'a, Result<LineStream, InterviewError>>;
}

pub struct ToolAgentAdapter {
    runtime: Arc<dyn ToolAgentRuntime>,
}

impl ToolAgentAdapter {
    pub fn new(runtime: Arc<dyn ToolAgentRuntime>) -> Self {
        Self { runtime }
    }

    async fn send_inner(
        &self,
        request: TurnRequest,
        callbacks: &mut dyn TurnCallbacks,
    ) -> Result<TurnResult, InterviewError> {
        let mut lines = self.runtime.run(&request).await?;
        let mut converter = ToolAgentConverter::new();
        let mut accumulator = TurnAccumulator::new();

        while let Some(line) = lines.next().await {
            let line = line?;
            match converter.convert_line(&line) {
                Ok(events) => {
                    for event in events {
                        accumulator.apply(event, callbacks);
                    }
                }
                Err(err) => {
                    tracing::debug!(
                        session_id = %request.session_id,
                        error = %err,
                        "skipping tool agent line"
                    );
                }
            }
            if accumulator.is_finished() {
                break;
            }
        }

        if let Some(message) = accumulator.failure() {
            return Err(InterviewError::from_backend_message(BACKEND, message));
        }
        if !accumulator.is_completed() {
            return Err(InterviewError::BackendFailed {
                backend: BACKEND.to_string(),
                message: "tool agent exited before completing the turn".to_string(),
            });
        }
        Ok(accumulator.into_result(None))
    }
}

impl BackendAdapter for ToolAgentAdapter {
    fn kind(&self) -> BackendKind {
        BackendKind::ToolAgent
    }

    fn send<'a>(
        &'a self,
        request: TurnRequest,
        callbacks: &'a mut dyn TurnCallbacks,
    ) -> BoxFuture<'a, Result<TurnResult, InterviewError>> {
        Box::pin(self.send_inner(request, callbacks))
    }
}

/// Runs the tool agent as a child process speaking stream-json.
///
/// The turn is written to stdin as one JSON line, then stdin is closed. Each
/// stdout line is one event. The child is killed if the stream is dropped.
#[derive(Debug, Clone)]
pub struct ProcessToolAgent {
    program: String,
    args: Vec<String>,
    env: BTreeMap<String, String>,
    idle_timeout: Duration,
}

impl ProcessToolAgent {
    pub fn new(program: impl Into<String>, args: Vec<String>, idle_timeout: Duration) -> Self {
        Self {
            program: program.into(),
            args,
            env: BTreeMap::new(),
            idle_timeout,
        }
    }

    /// Returns `None` when no command is configured.
    pub fn from_config(config: &ToolAgentConfig) -> Option<Self> {
        let program = config.command.as_deref()?.trim();
        if program.is_empty() {
            return None;
        }
        Some(Self {
            program: program.to_string(),
            args: config.args.clone(),
            env: config.env.clone(),
            idle_timeout: Duration::from_secs(config.idle_timeout_secs),
        })
    }

    async fn run_inner(&self, request: &TurnRequest) -> Result<LineStream, InterviewError> {
        let mut command = Command::new(&self.program);
        command
            .args(&self.args)
            .stdin(std::process::Stdio::piped())
            .stdout(std::process::Stdio::piped())
            .stderr(std::process::Stdio::piped())
            .kill_on_drop(true);
        for (key, value) in &self.env {
            command.env(key, value);
        }

        tracing::info!(
            program = ?self.program,
            args = ?self.args,
            session_id = %request.session_id,
            "spawning agent process"
        );
        let mut child = command.spawn().map_err(|err| {
            tracing::error!(
                program = ?self.program,
                error = %err,
                "failed to spawn agent process"
            );
            unavailable(format!("failed to spawn `{}`: {err}", self.program))
        })?;

        let mut stdin = child
            .stdin
            .take()
            .ok_or_else(|| unavailable("failed to capture subprocess stdin".to_string()))?;
        let stdout = child
            .stdout
            .take()
            .ok_or_else(|| unavailable("failed to capture subprocess stdout".to_string()))?;
        let stderr = child
            .stderr
            .take()
            .ok_or_else(|| unavailable("failed to capture subprocess stderr".to_string()))?;

        let mut payload = serde_json::to_string(&turn_payload(request)).map_err(|err| {
            InterviewError::StreamError {
                message: format!("failed to encode turn: {err}"),
            }
        })?;
        payload.push('\n');
        stdin
            .write_all(payload.as_bytes())
            .await
            .map_err(|err| unavailable(format!("failed to write subprocess stdin: {err}")))?;
        drop(stdin);

        let session_id = request.session_id.clone();
        tokio::spawn(async move {
            let mut lines = BufReader::new(stderr).lines();
            while let Ok(Some(line)) = lines.next_line().await {
                tracing::debug!(session_id = %session_id, line = %line, "agent stderr");
            }
        });

        let idle_timeout = self.idle_timeout;
        let lines = BufReader::new(stdout).lines();
        let stream = stream::unfold(Some((lines, child)), move |state| async move {
            let (mut lines, child) = state?;
            match tokio::time::timeout(idle_timeout, lines.next_line()).await {
                Ok(Ok(Some(line))) => Some((Ok(line), Some((lines, child)))),
                Ok(Ok(None)) => None,
                Ok(Err(err)) => Some((
                    Err(InterviewError::StreamError {
                        message: format!("failed to read agent output: {err}"),
                    }),
                    None,
                )),
                Err(_) => Some((
                    Err(InterviewError::Timeout {
                        message: Some(format!(
                            "tool agent produced no output for {}s",
                            idle_timeout.as_secs()
                        )),
                    }),
                    None,
                )),
            }
        });
        Ok(stream.boxed())
    }
}

impl ToolAgentRuntime for ProcessToolAgent {
    fn run<'a>(
        &'a self,
        request: &'a TurnRequest,
    ) -> BoxFuture<'a, Result<LineStream, InterviewError>> {
        Box::pin(self.run_inner(request))
    }
}

fn turn_payload(request: &TurnRequest) -> Value {
    json!({
        "type": "user",
        "session_id": request.session_id,
        "message": { "role": "user", "content": request.message },
        "history": request.history,
        "options": {
            "helpfulness_level": request.options.helpfulness_level.map(|level| level.as_str()),
            "question_id": request.options.question_id,
        },
    })
}

fn unavailable(message: String) -> InterviewError {
    InterviewError::BackendUnavailable {
        backend: BACKEND.to_string(),
        message: Some(message),
    }
}

/// Stand-in runtime used when no tool agent command is configured.
///
/// Queued scripts are replayed verbatim, one per turn. Without a script the
/// mock echoes the message word by word.
pub struct MockToolAgent {
    scripts: Mutex<VecDeque<Vec<Value>>>,
    word_delay: Duration,
}

impl MockToolAgent {
    pub fn new() -> Self {
        Self {
            scripts: Mutex::new(VecDeque::new()),
            word_delay: Duration::from_millis(MOCK_WORD_STREAM_DELAY_MS),
        }
    }

    pub fn without_delay(mut self) -> Self {
        self.word_delay = Duration::ZERO;
        self
    }

    /// Queues the stream-json events for the next turn.
    pub fn push_script(&self, events: Vec<Value>) {
        self.scripts
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .push_back(events);
    }

    fn next_script(&self) -> Option<Vec<Value>> {
        self.scripts
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .pop_front()
    }
}

impl Default for MockToolAgent {
    fn default() -> Self {
        Self::new()
    }
}

impl ToolAgentRuntime for MockToolAgent {
    fn run<'a>(
        &'a self,
        request: &'a TurnRequest,
    ) -> BoxFuture<'a, Result<LineStream, InterviewError>> {
        let lines: Vec<String> = match self.next_script() {
            Some(script) => script.iter().map(Value::to_string).collect(),
            None => echo_script(request).iter().map(Value::to_string).collect(),
        };
        let delay = self.word_delay;
        let stream = stream::iter(lines.into_iter().enumerate())
            .then(move |(index, line)| async move {
                if index > 0 && !delay.is_zero() {
                    tokio::time::sleep(delay).await;
                }
                Ok(line)
            })
            .boxed();
        Box::pin(futures::future::ready(Ok(stream)))
    }
}

fn echo_script(request: &TurnRequest) -> Vec<Value> {
    // Code context is prepended, so the question itself is the last block.
    let question = request
        .message
        .rsplit("\n\n")
        .next()
        .unwrap_or(&request.message)
        .trim();
    if question.to_ascii_lowercase().contains("crash") {
        return vec![json!({
            "type": "result",
            "subtype": "error_during_execution",
            "is_error": true,
            "result": "mock process crashed",
        })];
    }

    let response = format!("mock: {question}");
    let mut events: Vec<Value> = split_text_into_word_chunks(&response)
        .into_iter()
        .map(|chunk| {
            json!({
                "type": "stream_event",
                "event": {
                    "type": "content_block_delta",
                    "delta": { "type": "text_delta", "text": chunk },
                },
            })
        })
        .collect();
    let words = response.split_whitespace().count() as u64;
    events.push(json!({
        "type": "result",
        "subtype": "success",
        "is_error": false,
        "result": response,
        "usage": {
            "input_tokens": request.message.split_whitespace().count(),
            "output_tokens": words,
        },
    }));
    events
}

fn split_text_into_word_chunks(text: &str) -> Vec<String> {
    let words: Vec<&str> = text.split_whitespace().collect();
    if words.is_empty() {
        return vec![text.to_string()];
    }
    let last = words.len() - 1;
    words
        .into_iter()
        .enumerate()
        .map(|(index, word)| {
            if index == last {
                word.to_string()
            } else {
                format!("{word} ")
            }
        })
        .collect()
}
