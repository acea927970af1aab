use std::convert::Infallible;
use std::sync::Arc;
use std::time::Duration;

use axum::extract::{Path, State};
use axum::http::{HeaderMap, Request, StatusCode};
use axum::middleware::Next;
use axum::response::sse::Event;
use axum::response::{IntoResponse, Response, Sse};
use axum::routing::{get, post};
use axum::{Json, Router};
use futures::{Stream, StreamExt};
use interview_agent_error::{ErrorType, InterviewError, ProblemDetails};
use interview_agent_stream_schema::{
    AssignmentSource, BackendKind, ContentData, DoneData, DoneMetadata, ErrorEventData,
    StreamEvent, StreamStartData, TokenUsage, ToolResultData, ToolUseStartData, TurnRole,
};
use tokio::sync::broadcast;
use tokio_stream::wrappers::{BroadcastStream, UnboundedReceiverStream};
use tower_http::trace::TraceLayer;
use tracing::Span;
use utoipa::{Modify, OpenApi};
use uuid::Uuid;

use crate::adapters::AdapterRegistry;
use crate::assignment::{BackendAssigner, BackendAssignment, ExperimentSource};
use crate::broadcast::{ChannelBroadcaster, FileChangeEvent, FileChangeType};
use crate::config::AppConfig;
use crate::orchestrator::Orchestrator;
use crate::store::{
    now_ms, Checkpoint, CheckpointStatus, CheckpointStore, InMemoryStore, SessionRecord,
    SessionStore, ToolCallRecord, TurnRecord,
};
use crate::types::{
    ChatRequest, CheckpointListResponse, CodeContext, CreateSessionRequest, FilesResponse,
    HealthResponse, HelpfulnessLevel, MessagesResponse, SessionInfo,
};

const SERVER_INFO: &str = "\
This is an Interview Agent server. Available endpoints:
  - GET  /v1/health                          - Health check
  - POST /v1/sessions                        - Register an interview session
  - POST /v1/sessions/{id}/chat/stream       - Chat turn (SSE)
  - GET  /v1/openapi.json                    - OpenAPI document";

pub struct AppState {
    auth: AuthConfig,
    sessions: Arc<dyn SessionStore>,
    checkpoints: Arc<dyn CheckpointStore>,
    orchestrator: Orchestrator,
    files: Arc<ChannelBroadcaster>,
}

impl AppState {
    pub fn new(
        auth: AuthConfig,
        stores: Stores,
        adapters: AdapterRegistry,
        experiments: Arc<dyn ExperimentSource>,
        config: &AppConfig,
    ) -> Self {
        let files = Arc::new(ChannelBroadcaster::new());
        let assigner = Arc::new(BackendAssigner::new(
            config.assignment.default_backend,
            experiments,
            stores.sessions.clone(),
        ));
        let orchestrator = Orchestrator::new(
            stores.sessions.clone(),
            stores.checkpoints.clone(),
            adapters,
            assigner,
            files.clone(),
            config.checkpoint,
        );
        Self {
            auth,
            sessions: stores.sessions,
            checkpoints: stores.checkpoints,
            orchestrator,
            files,
        }
    }

    /// Live feed of every file change, across sessions.
    pub fn file_events(&self) -> broadcast::Receiver<FileChangeEvent> {
        self.files.subscribe()
    }

    async fn require_session(&self, session_id: &str) -> Result<SessionRecord, InterviewError> {
        self.sessions
            .session(session_id)
            .await?
            .ok_or_else(|| InterviewError::SessionNotFound {
                session_id: session_id.to_string(),
            })
    }
}

/// Session and checkpoint persistence handed to the server.
#[derive(Clone)]
pub struct Stores {
    pub sessions: Arc<dyn SessionStore>,
    pub checkpoints: Arc<dyn CheckpointStore>,
}

impl Stores {
    pub fn shared<S>(store: Arc<S>) -> Self
    where
        S: SessionStore + CheckpointStore + 'static,
    {
        Self {
            sessions: store.clone(),
            checkpoints: store,
        }
    }

    pub fn in_memory() -> Self {
        Self::shared(Arc::new(InMemoryStore::new()))
    }
}

#[derive(Debug, Clone)]
pub struct AuthConfig {
    pub token: Option<String>,
}

impl AuthConfig {
    pub fn disabled() -> Self {
        Self { token: None }
    }

    pub fn with_token(token: String) -> Self {
        Self { token: Some(token) }
    }
}

pub fn build_router(state: AppState) -> Router {
    build_router_with_state(Arc::new(state)).0
}

pub fn build_router_with_state(shared: Arc<AppState>) -> (Router, Arc<AppState>) {
    let mut v1_router = Router::new()
        .route("/health", get(get_health))
        .route("/openapi.json", get(get_openapi))
        .route("/sessions", post(create_session))
        .route("/sessions/:session_id", get(get_session))
        .route("/sessions/:session_id/chat/stream", post(post_chat_stream))
        .route("/sessions/:session_id/messages", get(get_messages))
        .route("/sessions/:session_id/checkpoints", get(get_checkpoints))
        .route("/sessions/:session_id/files", get(get_files))
        .route("/sessions/:session_id/files/events", get(get_file_events))
        .with_state(shared.clone());

    if shared.auth.token.is_some() {
        v1_router = v1_router.layer(axum::middleware::from_fn_with_state(
            shared.clone(),
            require_token,
        ));
    }

    let mut router = Router::new()
        .route("/", get(get_root))
        .nest("/v1", v1_router)
        .fallback(not_found);

    let http_logging = match std::env::var("INTERVIEW_AGENT_LOG_HTTP") {
        Ok(value) if value == "0" || value.eq_ignore_ascii_case("false") => false,
        _ => true,
    };
    if http_logging {
        let trace_layer = TraceLayer::new_for_http()
            .make_span_with(|req: &Request<_>| {
                tracing::info_span!(
                    "http.request",
                    method = %req.method(),
                    uri = %req.uri()
                )
            })
            .on_request(|_req: &Request<_>, span: &Span| {
                tracing::info!(parent: span, "request");
            })
            .on_response(|res: &Response<_>, latency: Duration, span: &Span| {
                tracing::info!(
                    parent: span,
                    status = %res.status(),
                    latency_ms = latency.as_millis()
                );
            });
        router = router.layer(trace_layer);
    }

    (router, shared)
}

#[derive(OpenApi)]
#[openapi(
    paths(
        get_health,
        create_session,
        get_session,
        post_chat_stream,
        get_messages,
        get_checkpoints,
        get_files,
        get_file_events
    ),
    components(
        schemas(
            HealthResponse,
            CreateSessionRequest,
            SessionInfo,
            BackendAssignment,
            BackendKind,
            AssignmentSource,
            ChatRequest,
            CodeContext,
            HelpfulnessLevel,
            MessagesResponse,
            TurnRecord,
            TurnRole,
            CheckpointListResponse,
            Checkpoint,
            CheckpointStatus,
            ToolCallRecord,
            FilesResponse,
            FileChangeEvent,
            FileChangeType,
            StreamEvent,
            StreamStartData,
            ContentData,
            ToolUseStartData,
            ToolResultData,
            DoneData,
            DoneMetadata,
            TokenUsage,
            ErrorEventData,
            ProblemDetails,
            ErrorType
        )
    ),
    tags(
        (name = "meta", description = "Service metadata"),
        (name = "sessions", description = "Interview sessions and chat turns")
    ),
    modifiers(&ServerAddon)
)]
pub struct ApiDoc;

struct ServerAddon;

impl Modify for ServerAddon {
    fn modify(&self, openapi: &mut utoipa::openapi::OpenApi) {
        openapi.servers = Some(vec![utoipa::openapi::Server::new("http://localhost:2480")]);
    }
}

#[derive(Debug, thiserror::Error)]
pub enum ApiError {
    #[error(transparent)]
    Interview(#[from] InterviewError),
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let problem: ProblemDetails = match &self {
            ApiError::Interview(err) => err.to_problem_details(),
        };
        let status =
            StatusCode::from_u16(problem.status).unwrap_or(StatusCode::INTERNAL_SERVER_ERROR);
        let mut response = (status, Json(problem)).into_response();
        response.headers_mut().insert(
            axum::http::header::CONTENT_TYPE,
            axum::http::HeaderValue::from_static("application/problem+json"),
        );
        response
    }
}

async fn require_token(
    State(state): State<Arc<AppState>>,
    req: Request<axum::body::Body>,
    next: Next,
) -> Result<Response, ApiError> {
    let path = req.uri().path();
    if path == "/v1/health" || path == "/health" {
        return Ok(next.run(req).await);
    }

    let expected = match &state.auth.token {
        Some(token) => token.as_str(),
        None => return Ok(next.run(req).await),
    };

    let provided = extract_token(req.headers());
    if provided.as_deref() == Some(expected) {
        Ok(next.run(req).await)
    } else {
        Err(InterviewError::TokenInvalid {
            message: Some("missing or invalid token".to_string()),
        }
        .into())
    }
}

fn extract_token(headers: &HeaderMap) -> Option<String> {
    let value = headers.get(axum::http::header::AUTHORIZATION)?.to_str().ok()?;
    let (scheme, rest) = value.trim().split_once(' ')?;
    match scheme.to_ascii_lowercase().as_str() {
        "bearer" | "token" => Some(rest.trim().to_string()),
        _ => None,
    }
}

async fn get_root() -> &'static str {
    SERVER_INFO
}

async fn not_found() -> (StatusCode, String) {
    (
        StatusCode::NOT_FOUND,
        format!("404 Not Found\n\n{SERVER_INFO}"),
    )
}

async fn get_openapi() -> Json<utoipa::openapi::OpenApi> {
    Json(ApiDoc::openapi())
}

#[utoipa::path(
    get,
    path = "/v1/health",
    responses((status = 200, body = HealthResponse)),
    tag = "meta"
)]
async fn get_health() -> Json<HealthResponse> {
    Json(HealthResponse {
        status: "ok".to_string(),
    })
}

#[utoipa::path(
    post,
    path = "/v1/sessions",
    request_body = CreateSessionRequest,
    responses(
        (status = 201, body = SessionInfo, description = "Session registered"),
        (status = 200, body = SessionInfo, description = "Session already registered"),
        (status = 400, body = ProblemDetails)
    ),
    tag = "sessions"
)]
async fn create_session(
    State(state): State<Arc<AppState>>,
    Json(request): Json<CreateSessionRequest>,
) -> Result<(StatusCode, Json<SessionInfo>), ApiError> {
    for (field, value) in [
        ("candidateId", &request.candidate_id),
        ("organizationId", &request.organization_id),
        ("assessmentId", &request.assessment_id),
    ] {
        if value.trim().is_empty() {
            return Err(InterviewError::InvalidRequest {
                message: format!("{field} must not be empty"),
            }
            .into());
        }
    }
    let session_id = match request.session_id {
        Some(id) if !id.trim().is_empty() => id,
        Some(_) => {
            return Err(InterviewError::InvalidRequest {
                message: "sessionId must not be empty".to_string(),
            }
            .into())
        }
        None => format!("sess_{}", Uuid::new_v4().simple()),
    };

    let record = SessionRecord {
        session_id,
        candidate_id: request.candidate_id,
        organization_id: request.organization_id,
        assessment_id: request.assessment_id,
        question_id: request.question_id,
        created_at: now_ms(),
        assignment: None,
    };
    let stored = state.sessions.create_session(record.clone()).await.map_err(InterviewError::from)?;
    let status = if stored == record {
        tracing::info!(session_id = %stored.session_id, "session registered");
        StatusCode::CREATED
    } else {
        StatusCode::OK
    };
    Ok((status, Json(stored.into())))
}

#[utoipa::path(
    get,
    path = "/v1/sessions/{session_id}",
    params(("session_id" = String, Path, description = "Session id")),
    responses(
        (status = 200, body = SessionInfo),
        (status = 404, body = ProblemDetails)
    ),
    tag = "sessions"
)]
async fn get_session(
    State(state): State<Arc<AppState>>,
    Path(session_id): Path<String>,
) -> Result<Json<SessionInfo>, ApiError> {
    let record = state.require_session(&session_id).await?;
    Ok(Json(record.into()))
}

#[utoipa::path(
    post,
    path = "/v1/sessions/{session_id}/chat/stream",
    request_body = ChatRequest,
    params(("session_id" = String, Path, description = "Session id")),
    responses(
        (status = 200, description = "SSE stream of turn events", body = StreamEvent),
        (status = 400, body = ProblemDetails),
        (status = 404, body = ProblemDetails),
        (status = 503, body = ProblemDetails)
    ),
    tag = "sessions"
)]
async fn post_chat_stream(
    State(state): State<Arc<AppState>>,
    Path(session_id): Path<String>,
    Json(request): Json<ChatRequest>,
) -> Result<Sse<impl Stream<Item = Result<Event, Infallible>>>, ApiError> {
    let turn = state.orchestrator.handle(&session_id, request).await?;
    let stream = UnboundedReceiverStream::new(turn.events).map(|event| Ok(to_sse_event(&event)));
    Ok(Sse::new(stream))
}

#[utoipa::path(
    get,
    path = "/v1/sessions/{session_id}/messages",
    params(("session_id" = String, Path, description = "Session id")),
    responses(
        (status = 200, body = MessagesResponse),
        (status = 404, body = ProblemDetails)
    ),
    tag = "sessions"
)]
async fn get_messages(
    State(state): State<Arc<AppState>>,
    Path(session_id): Path<String>,
) -> Result<Json<MessagesResponse>, ApiError> {
    state.require_session(&session_id).await?;
    let messages = state.sessions.turns(&session_id).await.map_err(InterviewError::from)?;
    Ok(Json(MessagesResponse { messages }))
}

#[utoipa::path(
    get,
    path = "/v1/sessions/{session_id}/checkpoints",
    params(("session_id" = String, Path, description = "Session id")),
    responses(
        (status = 200, body = CheckpointListResponse),
        (status = 404, body = ProblemDetails)
    ),
    tag = "sessions"
)]
async fn get_checkpoints(
    State(state): State<Arc<AppState>>,
    Path(session_id): Path<String>,
) -> Result<Json<CheckpointListResponse>, ApiError> {
    state.require_session(&session_id).await?;
    let checkpoints = state
        .checkpoints
        .checkpoints(&session_id)
        .await
        .map_err(InterviewError::from)?;
    Ok(Json(CheckpointListResponse { checkpoints }))
}

#[utoipa::path(
    get,
    path = "/v1/sessions/{session_id}/files",
    params(("session_id" = String, Path, description = "Session id")),
    responses(
        (status = 200, body = FilesResponse),
        (status = 404, body = ProblemDetails)
    ),
    tag = "sessions"
)]
async fn get_files(
    State(state): State<Arc<AppState>>,
    Path(session_id): Path<String>,
) -> Result<Json<FilesResponse>, ApiError> {
    state.require_session(&session_id).await?;
    let files = state.sessions.files(&session_id).await.map_err(InterviewError::from)?;
    Ok(Json(FilesResponse { files }))
}

#[utoipa::path(
    get,
    path = "/v1/sessions/{session_id}/files/events",
    params(("session_id" = String, Path, description = "Session id")),
    responses(
        (status = 200, description = "SSE stream of file_change events", body = FileChangeEvent),
        (status = 404, body = ProblemDetails)
    ),
    tag = "sessions"
)]
async fn get_file_events(
    State(state): State<Arc<AppState>>,
    Path(session_id): Path<String>,
) -> Result<Sse<impl Stream<Item = Result<Event, Infallible>>>, ApiError> {
    state.require_session(&session_id).await?;
    let rx = state.file_events();
    let stream = BroadcastStream::new(rx).filter_map(move |item| {
        let session_id = session_id.clone();
        async move {
            match item {
                Ok(change) if change.session_id == session_id => Some(Ok(Event::default()
                    .event("file_change")
                    .json_data(&change)
                    .unwrap_or_else(|_| Event::default().event("file_change").data("{}")))),
                _ => None,
            }
        }
    });
    Ok(Sse::new(stream))
}

fn to_sse_event(event: &StreamEvent) -> Event {
    Event::default()
        .event(event.name())
        .data(event.data().to_string())
}
