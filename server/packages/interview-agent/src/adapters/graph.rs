use std::sync::Arc;

use futures::future::BoxFuture;
use futures::StreamExt;
use interview_agent_error::InterviewError;
use interview_agent_graph_client::{GraphApi, GraphClientError, RunRequest};
use interview_agent_stream_schema::convert_graph::GraphConverter;
use interview_agent_stream_schema::BackendKind;
use serde_json::{json, Value};

use super::{BackendAdapter, TurnAccumulator, TurnCallbacks, TurnRequest, TurnResult};
use crate::threads::{is_thread_corruption, ThreadManager, MAX_CORRUPTION_RETRIES};

const BACKEND: &str = "graph";

/// Runs turns on the graph service, one deterministic thread per session.
pub struct GraphAdapter {
    client: Arc<dyn GraphApi>,
    threads: ThreadManager,
    assistant_id: String,
    agent_type: String,
}

impl GraphAdapter {
    pub fn new(
        client: Arc<dyn GraphApi>,
        assistant_id: impl Into<String>,
        agent_type: impl Into<String>,
    ) -> Self {
        Self {
            threads: ThreadManager::new(client.clone()),
            client,
            assistant_id: assistant_id.into(),
            agent_type: agent_type.into(),
        }
    }

    async fn send_inner(
        &self,
        request: TurnRequest,
        callbacks: &mut dyn TurnCallbacks,
    ) -> Result<TurnResult, InterviewError> {
        let (mut thread_id, mut fresh) = self
            .threads
            .resolve_thread(&request.session_id, &self.agent_type)
            .await?;
        let mut retries = 0;

        loop {
            match self.run_once(&thread_id, fresh, &request, callbacks).await {
                Err(InterviewError::ThreadCorrupted { message, .. }) => {
                    if retries >= MAX_CORRUPTION_RETRIES {
                        tracing::error!(
                            session_id = %request.session_id,
                            thread_id = %thread_id,
                            error = %message,
                            "thread still corrupted after recreation"
                        );
                        return Err(InterviewError::BackendFailed {
                            backend: BACKEND.to_string(),
                            message: format!("conversation thread is corrupted: {message}"),
                        });
                    }
                    retries += 1;
                    tracing::warn!(
                        session_id = %request.session_id,
                        thread_id = %thread_id,
                        error = %message,
                        "thread corrupted; recreating and retrying"
                    );
                    thread_id = self
                        .threads
                        .recreate_thread(&request.session_id, &self.agent_type)
                        .await?;
                    fresh = true;
                }
                other => return other,
            }
        }
    }

    async fn run_once(
        &self,
        thread_id: &str,
        fresh: bool,
        request: &TurnRequest,
        callbacks: &mut dyn TurnCallbacks,
    ) -> Result<TurnResult, InterviewError> {
        let mut run = RunRequest::messages(self.assistant_id.clone(), run_input(request, fresh));
        run.config = Some(json!({
            "configurable": {
                "session_id": request.session_id,
                "helpfulness_level": request.options.helpfulness_level.map(|level| level.as_str()),
                "question_id": request.options.question_id,
            }
        }));

        let mut events = self
            .client
            .stream_run(thread_id, run)
            .await
            .map_err(|err| client_error(thread_id, err))?;
        let mut converter = GraphConverter::new();
        let mut accumulator = TurnAccumulator::new();

        while let Some(event) = events.next().await {
            let event = match event {
                Ok(event) => event,
                Err(GraphClientError::Json(err)) => {
                    tracing::debug!(thread_id, error = %err, "skipping malformed graph event");
                    continue;
                }
                Err(err) => return Err(client_error(thread_id, err)),
            };
            match converter.convert(&event.event, &event.data) {
                Ok(converted) => {
                    for agent_event in converted {
                        accumulator.apply(agent_event, callbacks);
                    }
                }
                Err(err) => {
                    tracing::debug!(thread_id, error = %err, "skipping graph event");
                }
            }
            if accumulator.is_finished() {
                break;
            }
        }

        if let Some(message) = accumulator.failure() {
            return Err(backend_error(thread_id, message));
        }
        // A run stream that closes cleanly is a completed run.
        for agent_event in converter.finish() {
            accumulator.apply(agent_event, callbacks);
        }
        accumulator.mark_completed();
        Ok(accumulator.into_result(Some(thread_id.to_string())))
    }
}

impl BackendAdapter for GraphAdapter {
    fn kind(&self) -> BackendKind {
        BackendKind::Graph
    }

    fn send<'a>(
        &'a self,
        request: TurnRequest,
        callbacks: &'a mut dyn TurnCallbacks,
    ) -> BoxFuture<'a, Result<TurnResult, InterviewError>> {
        Box::pin(self.send_inner(request, callbacks))
    }
}

/// New threads get the whole conversation; existing ones only the new message.
fn run_input(request: &TurnRequest, fresh: bool) -> Value {
    let mut messages: Vec<Value> = Vec::new();
    if fresh {
        messages.extend(
            request
                .history
                .iter()
                .map(|turn| json!({ "role": turn.role.as_str(), "content": turn.content })),
        );
    }
    messages.push(json!({ "role": "user", "content": request.message }));
    json!({ "messages": messages })
}

fn client_error(thread_id: &str, err: GraphClientError) -> InterviewError {
    if err.is_timeout() {
        return InterviewError::Timeout {
            message: Some(err.to_string()),
        };
    }
    match err {
        GraphClientError::Http(err) if err.is_connect() => InterviewError::BackendUnavailable {
            backend: BACKEND.to_string(),
            message: Some(err.to_string()),
        },
        other => backend_error(thread_id, &other.to_string()),
    }
}

fn backend_error(thread_id: &str, message: &str) -> InterviewError {
    if is_thread_corruption(message) {
        return InterviewError::ThreadCorrupted {
            thread_id: thread_id.to_string(),
            message: message.to_string(),
        };
    }
    InterviewError::from_backend_message(BACKEND, message)
}
