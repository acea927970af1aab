#![allow(dead_code)]

use std::collections::VecDeque;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};

use axum::body::Body;
use axum::http::{header, HeaderValue, Method, Request, StatusCode};
use axum::Router;
use futures::future::BoxFuture;
use futures::{stream, StreamExt};
use http_body_util::BodyExt;
use serde_json::{json, Value};
use tower::util::ServiceExt;

use interview_agent::adapters::{AdapterRegistry, GraphAdapter, MockToolAgent, ToolAgentAdapter};
use interview_agent::assignment::{Experiment, StaticExperiment};
use interview_agent::config::AppConfig;
use interview_agent::router::{build_router_with_state, AppState, AuthConfig, Stores};
use interview_agent_graph_client::{
    GraphApi, GraphClientError, GraphEventStream, GraphStreamEvent, RunRequest, Thread,
};

pub const CORRUPTED: &str =
    "messages.6: `tool_use` ids were found without `tool_result` blocks immediately after: toolu_9";

pub struct TestApp {
    pub app: Router,
    pub state: Arc<AppState>,
    pub tool_agent: Arc<MockToolAgent>,
    pub graph: Arc<FakeGraph>,
}

pub struct TestAppBuilder {
    auth: AuthConfig,
    config: AppConfig,
    experiment: Option<Experiment>,
}

impl TestAppBuilder {
    pub fn auth(mut self, auth: AuthConfig) -> Self {
        self.auth = auth;
        self
    }

    pub fn config(mut self, config: AppConfig) -> Self {
        self.config = config;
        self
    }

    pub fn experiment(mut self, experiment: Experiment) -> Self {
        self.experiment = Some(experiment);
        self
    }

    pub fn build(self) -> TestApp {
        let tool_agent = Arc::new(MockToolAgent::new().without_delay());
        let graph = Arc::new(FakeGraph::default());
        let adapters = AdapterRegistry::new()
            .with(Arc::new(ToolAgentAdapter::new(tool_agent.clone())))
            .with(Arc::new(GraphAdapter::new(
                graph.clone(),
                "interview_assistant",
                "coding_assistant",
            )));
        let state = Arc::new(AppState::new(
            self.auth,
            Stores::in_memory(),
            adapters,
            Arc::new(StaticExperiment::new(self.experiment)),
            &self.config,
        ));
        let (app, state) = build_router_with_state(state);
        TestApp {
            app,
            state,
            tool_agent,
            graph,
        }
    }
}

impl TestApp {
    pub fn new() -> Self {
        Self::builder().build()
    }

    pub fn builder() -> TestAppBuilder {
        TestAppBuilder {
            auth: AuthConfig::disabled(),
            config: AppConfig::default(),
            experiment: None,
        }
    }
}

/// Graph server double with scripted runs, one per `stream_run` call.
#[derive(Default)]
pub struct FakeGraph {
    threads: Mutex<Vec<String>>,
    runs: Mutex<VecDeque<Vec<GraphStreamEvent>>>,
    pub inputs: Mutex<Vec<Value>>,
    pub deletes: AtomicUsize,
}

impl FakeGraph {
    pub fn script(&self, events: Vec<(&str, Value)>) {
        let events = events
            .into_iter()
            .map(|(event, data)| GraphStreamEvent {
                event: event.to_string(),
                data,
            })
            .collect();
        self.runs.lock().expect("runs").push_back(events);
    }

    pub fn runs_started(&self) -> usize {
        self.inputs.lock().expect("inputs").len()
    }

    pub fn deletes(&self) -> usize {
        self.deletes.load(Ordering::SeqCst)
    }
}

impl GraphApi for FakeGraph {
    fn get_thread<'a>(
        &'a self,
        thread_id: &'a str,
    ) -> BoxFuture<'a, Result<Option<Thread>, GraphClientError>> {
        let known = self
            .threads
            .lock()
            .expect("threads")
            .iter()
            .any(|id| id == thread_id);
        let thread = known.then(|| Thread {
            thread_id: thread_id.to_string(),
            metadata: Value::Null,
            created_at: None,
        });
        Box::pin(futures::future::ready(Ok(thread)))
    }

    fn create_thread<'a>(
        &'a self,
        thread_id: &'a str,
        metadata: Value,
    ) -> BoxFuture<'a, Result<Thread, GraphClientError>> {
        self.threads
            .lock()
            .expect("threads")
            .push(thread_id.to_string());
        Box::pin(futures::future::ready(Ok(Thread {
            thread_id: thread_id.to_string(),
            metadata,
            created_at: None,
        })))
    }

    fn delete_thread<'a>(&'a self, thread_id: &'a str) -> BoxFuture<'a, Result<(), GraphClientError>> {
        self.deletes.fetch_add(1, Ordering::SeqCst);
        self.threads
            .lock()
            .expect("threads")
            .retain(|id| id != thread_id);
        Box::pin(futures::future::ready(Ok(())))
    }

    fn stream_run<'a>(
        &'a self,
        _thread_id: &'a str,
        request: RunRequest,
    ) -> BoxFuture<'a, Result<GraphEventStream, GraphClientError>> {
        self.inputs.lock().expect("inputs").push(request.input);
        let events = self
            .runs
            .lock()
            .expect("runs")
            .pop_front()
            .unwrap_or_default();
        let stream: GraphEventStream = stream::iter(events.into_iter().map(Ok)).boxed();
        Box::pin(futures::future::ready(Ok(stream)))
    }
}

pub fn graph_chunk(text: &str) -> Value {
    json!([{ "type": "AIMessageChunk", "id": "run-1", "content": text }, {}])
}

/// One parsed `event:`/`data:` frame of an SSE body.
#[derive(Debug, Clone)]
pub struct SseFrame {
    pub event: String,
    pub data: Value,
}

pub fn event_names(frames: &[SseFrame]) -> String {
    frames
        .iter()
        .map(|frame| frame.event.as_str())
        .collect::<Vec<_>>()
        .join(" ")
}

pub fn parse_sse(body: &str) -> Vec<SseFrame> {
    body.split("\n\n")
        .filter_map(|block| {
            let mut event = None;
            let mut data = Vec::new();
            for line in block.lines() {
                if let Some(value) = line.strip_prefix("event:") {
                    event = Some(value.trim().to_string());
                } else if let Some(value) = line.strip_prefix("data:") {
                    data.push(value.strip_prefix(' ').unwrap_or(value).to_string());
                }
            }
            let event = event?;
            let data = serde_json::from_str(&data.join("\n")).unwrap_or(Value::Null);
            Some(SseFrame { event, data })
        })
        .collect()
}

pub async fn send_request(
    app: &Router,
    method: Method,
    path: &str,
    body: Option<Value>,
    token: Option<&str>,
) -> (StatusCode, String) {
    let mut builder = Request::builder().method(method).uri(path);
    if let Some(token) = token {
        builder = builder.header(header::AUTHORIZATION, format!("Bearer {token}"));
    }
    let body = match body {
        Some(value) => {
            builder = builder.header(header::CONTENT_TYPE, HeaderValue::from_static("application/json"));
            Body::from(value.to_string())
        }
        None => Body::empty(),
    };
    let request = builder.body(body).expect("request");
    let response = app.clone().oneshot(request).await.expect("response");
    let status = response.status();
    let bytes = response
        .into_body()
        .collect()
        .await
        .expect("read body")
        .to_bytes();
    (status, String::from_utf8_lossy(&bytes).into_owned())
}

pub async fn send_json(
    app: &Router,
    method: Method,
    path: &str,
    body: Option<Value>,
) -> (StatusCode, Value) {
    let (status, text) = send_request(app, method, path, body, None).await;
    let payload = if text.is_empty() {
        Value::Null
    } else {
        serde_json::from_str(&text).unwrap_or(Value::Null)
    };
    (status, payload)
}

pub async fn create_session(app: &Router, session_id: &str, candidate_id: &str) -> Value {
    let (status, payload) = send_json(
        app,
        Method::POST,
        "/v1/sessions",
        Some(json!({
            "sessionId": session_id,
            "candidateId": candidate_id,
            "organizationId": "org_1",
            "assessmentId": "asmt_1",
            "questionId": "q_1",
        })),
    )
    .await;
    assert_eq!(status, StatusCode::CREATED, "create session");
    payload
}

/// Runs one chat turn and returns the SSE frames once the stream closes.
pub async fn chat(app: &Router, session_id: &str, body: Value) -> Vec<SseFrame> {
    let (status, text) = send_request(
        app,
        Method::POST,
        &format!("/v1/sessions/{session_id}/chat/stream"),
        Some(body),
        None,
    )
    .await;
    assert_eq!(status, StatusCode::OK, "chat stream: {text}");
    parse_sse(&text)
}

pub async fn messages(app: &Router, session_id: &str) -> Vec<Value> {
    let (status, payload) =
        send_json(app, Method::GET, &format!("/v1/sessions/{session_id}/messages"), None).await;
    assert_eq!(status, StatusCode::OK, "list messages");
    payload["messages"].as_array().cloned().unwrap_or_default()
}

pub async fn checkpoints(app: &Router, session_id: &str) -> Vec<Value> {
    let (status, payload) = send_json(
        app,
        Method::GET,
        &format!("/v1/sessions/{session_id}/checkpoints"),
        None,
    )
    .await;
    assert_eq!(status, StatusCode::OK, "list checkpoints");
    payload["checkpoints"].as_array().cloned().unwrap_or_default()
}
