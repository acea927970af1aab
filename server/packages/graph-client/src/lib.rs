//! HTTP client for the graph-orchestration service (backend B).
//!
//! The service keeps one durable thread per conversation and streams run
//! output as server-sent events. Only the handful of endpoints the interview
//! engine needs are wrapped here.

use std::collections::VecDeque;
use std::time::Duration;

use futures::future::BoxFuture;
use futures::stream::{self, BoxStream};
use futures::StreamExt;
use reqwest::{Client, StatusCode};
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use thiserror::Error;

pub const DEFAULT_TIMEOUT: Duration = Duration::from_secs(120);

#[derive(Debug, Error)]
pub enum GraphClientError {
    #[error("graph request failed: {0}")]
    Http(#[from] reqwest::Error),
    #[error("graph service returned status {status}: {body}")]
    Status { status: u16, body: String },
    #[error("invalid graph payload: {0}")]
    Json(#[from] serde_json::Error),
}

impl GraphClientError {
    pub fn is_timeout(&self) -> bool {
        matches!(self, Self::Http(err) if err.is_timeout())
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Thread {
    pub thread_id: String,
    #[serde(default)]
    pub metadata: Value,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub created_at: Option<String>,
}

#[derive(Debug, Clone, Serialize)]
pub struct RunRequest {
    pub assistant_id: String,
    pub input: Value,
    pub stream_mode: Vec<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub config: Option<Value>,
}

impl RunRequest {
    /// A run streaming `messages-tuple` chunks, which the service delivers as
    /// `messages` events.
    pub fn messages(assistant_id: impl Into<String>, input: Value) -> Self {
        Self {
            assistant_id: assistant_id.into(),
            input,
            stream_mode: vec!["messages-tuple".to_string(), "updates".to_string()],
            config: None,
        }
    }
}

/// One server-sent event from a run stream.
#[derive(Debug, Clone, PartialEq)]
pub struct GraphStreamEvent {
    pub event: String,
    pub data: Value,
}

pub type GraphEventStream = BoxStream<'static, Result<GraphStreamEvent, GraphClientError>>;

pub trait GraphApi: Send + Sync {
    fn get_thread<'a>(
        &'a self,
        thread_id: &'a str,
    ) -> BoxFuture<'a, Result<Option<Thread>, GraphClientError>>;

    /// Creates a thread with a caller-chosen id. A thread that already exists
    /// is not an error.
    fn create_thread<'a>(
        &'a self,
        thread_id: &'a str,
        metadata: Value,
    ) -> BoxFuture<'a, Result<Thread, GraphClientError>>;

    fn delete_thread<'a>(&'a self, thread_id: &'a str)
        -> BoxFuture<'a, Result<(), GraphClientError>>;

    fn stream_run<'a>(
        &'a self,
        thread_id: &'a str,
        request: RunRequest,
    ) -> BoxFuture<'a, Result<GraphEventStream, GraphClientError>>;
}

#[derive(Debug, Clone)]
pub struct GraphClient {
    http: Client,
    base_url: String,
    api_key: Option<String>,
}

impl GraphClient {
    pub fn new(
        base_url: impl Into<String>,
        api_key: Option<String>,
        timeout: Duration,
    ) -> Result<Self, GraphClientError> {
        let http = Client::builder().timeout(timeout).build()?;
        Ok(Self {
            http,
            base_url: base_url.into().trim_end_matches('/').to_string(),
            api_key,
        })
    }

    fn request(&self, method: reqwest::Method, path: &str) -> reqwest::RequestBuilder {
        let mut builder = self
            .http
            .request(method, format!("{}{}", self.base_url, path));
        if let Some(key) = &self.api_key {
            builder = builder.header("x-api-key", key);
        }
        builder
    }

    async fn get_thread_inner(&self, thread_id: &str) -> Result<Option<Thread>, GraphClientError> {
        let response = self
            .request(reqwest::Method::GET, &format!("/threads/{thread_id}"))
            .send()
            .await?;
        if response.status() == StatusCode::NOT_FOUND {
            return Ok(None);
        }
        let response = ensure_success(response).await?;
        Ok(Some(response.json::<Thread>().await?))
    }

    async fn create_thread_inner(
        &self,
        thread_id: &str,
        metadata: Value,
    ) -> Result<Thread, GraphClientError> {
        let response = self
            .request(reqwest::Method::POST, "/threads")
            .json(&json!({
                "thread_id": thread_id,
                "metadata": metadata,
                "if_exists": "do_nothing",
            }))
            .send()
            .await?;
        if response.status() == StatusCode::CONFLICT {
            tracing::debug!(thread_id, "graph thread already exists");
            return Ok(Thread {
                thread_id: thread_id.to_string(),
                metadata,
                created_at: None,
            });
        }
        let response = ensure_success(response).await?;
        Ok(response.json::<Thread>().await?)
    }

    async fn delete_thread_inner(&self, thread_id: &str) -> Result<(), GraphClientError> {
        let response = self
            .request(reqwest::Method::DELETE, &format!("/threads/{thread_id}"))
            .send()
            .await?;
        if response.status() == StatusCode::NOT_FOUND {
            return Ok(());
        }
        ensure_success(response).await?;
        Ok(())
    }

    async fn stream_run_inner(
        &self,
        thread_id: &str,
        request: RunRequest,
    ) -> Result<GraphEventStream, GraphClientError> {
        let response = self
            .request(
                reqwest::Method::POST,
                &format!("/threads/{thread_id}/runs/stream"),
            )
            .header(reqwest::header::ACCEPT, "text/event-stream")
            .json(&request)
            .send()
            .await?;
        let response = ensure_success(response).await?;
        Ok(sse_events(response.bytes_stream()))
    }
}

impl GraphApi for GraphClient {
    fn get_thread<'a>(
        &'a self,
        thread_id: &'a str,
    ) -> BoxFuture<'a, Result<Option<Thread>, GraphClientError>> {
        Box::pin(self.get_thread_inner(thread_id))
    }

    fn create_thread<'a>(
        &'a self,
        thread_id: &'a str,
        metadata: Value,
    ) -> BoxFuture<'a, Result<Thread, GraphClientError>> {
        Box::pin(self.create_thread_inner(thread_id, metadata))
    }

    fn delete_thread<'a>(
        &'a self,
        thread_id: &'a str,
    ) -> BoxFuture<'a, Result<(), GraphClientError>> {
        Box::pin(self.delete_thread_inner(thread_id))
    }

    fn stream_run<'a>(
        &'a self,
        thread_id: &'a str,
        request: RunRequest,
    ) -> BoxFuture<'a, Result<GraphEventStream, GraphClientError>> {
        Box::pin(self.stream_run_inner(thread_id, request))
    }
}

async fn ensure_success(response: reqwest::Response) -> Result<reqwest::Response, GraphClientError> {
    let status = response.status();
    if status.is_success() {
        return Ok(response);
    }
    let body = response.text().await.unwrap_or_default();
    Err(GraphClientError::Status {
        status: status.as_u16(),
        body,
    })
}

fn sse_events<S, B>(bytes: S) -> GraphEventStream
where
    S: futures::Stream<Item = Result<B, reqwest::Error>> + Send + 'static,
    B: AsRef<[u8]> + Send + 'static,
{
    struct State<S> {
        bytes: S,
        accumulator: SseAccumulator,
        pending: VecDeque<RawSseEvent>,
        finished: bool,
    }

    let state = State {
        bytes: Box::pin(bytes),
        accumulator: SseAccumulator::new(),
        pending: VecDeque::new(),
        finished: false,
    };

    stream::unfold(state, |mut state| async move {
        loop {
            if let Some(raw) = state.pending.pop_front() {
                return Some((raw.into_event(), state));
            }
            if state.finished {
                return None;
            }
            match state.bytes.next().await {
                Some(Ok(chunk)) => {
                    state.pending.extend(state.accumulator.push(chunk.as_ref()));
                }
                Some(Err(err)) => {
                    state.finished = true;
                    return Some((Err(GraphClientError::Http(err)), state));
                }
                None => {
                    state.finished = true;
                    state.pending.extend(state.accumulator.finish());
                }
            }
        }
    })
    .boxed()
}

#[derive(Debug, Clone, PartialEq)]
struct RawSseEvent {
    event: String,
    data: String,
}

impl RawSseEvent {
    fn into_event(self) -> Result<GraphStreamEvent, GraphClientError> {
        let data = if self.data.is_empty() {
            Value::Null
        } else {
            serde_json::from_str(&self.data)?
        };
        Ok(GraphStreamEvent {
            event: self.event,
            data,
        })
    }
}

/// Incremental `event:`/`data:` frame parser over arbitrary chunk boundaries.
///
/// Bytes are buffered until a full line arrives, so a UTF-8 sequence split
/// across two chunks is decoded whole.
struct SseAccumulator {
    buffer: Vec<u8>,
    event: Option<String>,
    data_lines: Vec<String>,
}

impl SseAccumulator {
    fn new() -> Self {
        Self {
            buffer: Vec::new(),
            event: None,
            data_lines: Vec::new(),
        }
    }

    fn push(&mut self, chunk: &[u8]) -> Vec<RawSseEvent> {
        self.buffer.extend_from_slice(chunk);
        let mut events = Vec::new();
        while let Some(pos) = self.buffer.iter().position(|byte| *byte == b'\n') {
            let raw: Vec<u8> = self.buffer.drain(..=pos).collect();
            let mut line = String::from_utf8_lossy(&raw[..pos]).into_owned();
            if line.ends_with('\r') {
                line.pop();
            }
            if line.is_empty() {
                events.extend(self.dispatch());
                continue;
            }
            if let Some(name) = line.strip_prefix("event:") {
                self.event = Some(name.trim().to_string());
            } else if let Some(data) = line.strip_prefix("data:") {
                self.data_lines.push(data.trim_start().to_string());
            }
        }
        events
    }

    /// Flushes a final frame the server did not terminate with a blank line.
    fn finish(&mut self) -> Vec<RawSseEvent> {
        let mut events = Vec::new();
        if !self.buffer.is_empty() {
            events = self.push(b"\n");
        }
        events.extend(self.dispatch());
        events
    }

    fn dispatch(&mut self) -> Option<RawSseEvent> {
        if self.data_lines.is_empty() && self.event.is_none() {
            return None;
        }
        let event = RawSseEvent {
            event: self.event.take().unwrap_or_else(|| "message".to_string()),
            data: self.data_lines.join("\n"),
        };
        self.data_lines.clear();
        Some(event)
    }
}
