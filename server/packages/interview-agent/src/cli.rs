use std::io::Write;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use clap::{Args, Parser, Subcommand};
use interview_agent_graph_client::GraphClient;
use interview_agent_stream_schema::BackendKind;
use thiserror::Error;
use tower_http::cors::{Any, CorsLayer};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};
use utoipa::OpenApi;

use crate::adapters::{
    AdapterRegistry, GraphAdapter, MockToolAgent, ProcessToolAgent, ToolAgentAdapter,
    ToolAgentRuntime,
};
use crate::assignment::{Experiment, StaticExperiment};
use crate::config::{AppConfig, ConfigError, ENV_TOKEN};
use crate::router::{build_router_with_state, ApiDoc, AppState, AuthConfig, Stores};
use crate::store::SqliteStore;

const DEFAULT_HOST: &str = "127.0.0.1";
const DEFAULT_PORT: u16 = 2480;

#[derive(Parser, Debug)]
#[command(name = "interview-agent", bin_name = "interview-agent")]
#[command(about = "Streaming and recovery engine for AI-assisted interviews", version)]
#[command(arg_required_else_help = true)]
pub struct InterviewAgentCli {
    #[command(subcommand)]
    command: Command,

    #[arg(long, short = 't', global = true)]
    token: Option<String>,

    #[arg(long, short = 'n', global = true)]
    no_token: bool,
}

#[derive(Subcommand, Debug)]
pub enum Command {
    /// Run the interview agent HTTP server.
    Server(ServerArgs),
    /// Print the OpenAPI document to stdout.
    Openapi,
}

#[derive(Args, Debug)]
pub struct ServerArgs {
    #[arg(long, short = 'H', default_value = DEFAULT_HOST)]
    host: String,

    #[arg(long, short = 'p', default_value_t = DEFAULT_PORT)]
    port: u16,

    /// TOML configuration file.
    #[arg(long, short = 'c')]
    config: Option<PathBuf>,

    /// Persist sessions and checkpoints in this SQLite file instead of memory.
    #[arg(long)]
    sqlite_path: Option<PathBuf>,

    /// Backend for sessions not covered by an explicit choice or experiment.
    #[arg(long)]
    default_backend: Option<BackendKind>,

    #[arg(long = "cors-allow-origin", short = 'O')]
    cors_allow_origin: Vec<String>,

    #[arg(long = "cors-allow-method", short = 'M')]
    cors_allow_method: Vec<String>,

    #[arg(long = "cors-allow-header", short = 'A')]
    cors_allow_header: Vec<String>,

    #[arg(long = "cors-allow-credentials", short = 'C')]
    cors_allow_credentials: bool,
}

#[derive(Debug, Error)]
pub enum CliError {
    #[error("invalid cors origin: {0}")]
    InvalidCorsOrigin(String),
    #[error("invalid cors method: {0}")]
    InvalidCorsMethod(String),
    #[error("invalid cors header: {0}")]
    InvalidCorsHeader(String),
    #[error("config error: {0}")]
    Config(#[from] ConfigError),
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
    #[error("json error: {0}")]
    Json(#[from] serde_json::Error),
    #[error("server error: {0}")]
    Server(String),
}

pub struct CliConfig {
    pub token: Option<String>,
    pub no_token: bool,
}

pub fn run_interview_agent() -> Result<(), CliError> {
    let cli = InterviewAgentCli::parse();
    let InterviewAgentCli {
        command,
        token,
        no_token,
    } = cli;
    let config = CliConfig { token, no_token };
    if let Err(err) = init_logging() {
        eprintln!("failed to init logging: {err}");
        return Err(err);
    }
    run_command(&command, &config)
}

pub fn init_logging() -> Result<(), CliError> {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    tracing_subscriber::registry()
        .with(filter)
        .with(
            tracing_logfmt::builder()
                .layer()
                .with_writer(std::io::stderr),
        )
        .init();
    Ok(())
}

pub fn run_command(command: &Command, cli: &CliConfig) -> Result<(), CliError> {
    match command {
        Command::Server(args) => run_server(cli, args),
        Command::Openapi => print_openapi(),
    }
}

fn print_openapi() -> Result<(), CliError> {
    let doc = serde_json::to_string_pretty(&ApiDoc::openapi())?;
    let mut out = std::io::stdout();
    out.write_all(doc.as_bytes())?;
    out.write_all(b"\n")?;
    out.flush()?;
    Ok(())
}

fn run_server(cli: &CliConfig, server: &ServerArgs) -> Result<(), CliError> {
    let auth = match resolve_token(cli, |key| std::env::var(key).ok()) {
        Some(token) => AuthConfig::with_token(token),
        None => {
            tracing::warn!("authentication disabled; pass --token to require one");
            AuthConfig::disabled()
        }
    };

    let mut config = AppConfig::load(server.config.as_deref())?;
    config.apply_env();
    if let Some(path) = &server.sqlite_path {
        config.storage.sqlite_path = Some(path.clone());
    }
    if let Some(backend) = server.default_backend {
        config.assignment.default_backend = backend;
    }

    let stores = match &config.storage.sqlite_path {
        Some(path) => {
            tracing::info!(path = %path.display(), "using sqlite store");
            Stores::shared(Arc::new(SqliteStore::new(path)))
        }
        None => {
            tracing::info!("using in-memory store; sessions are lost on restart");
            Stores::in_memory()
        }
    };
    let adapters = build_adapters(&config)?;
    tracing::info!(backends = ?adapters.kinds(), "backend adapters registered");
    let experiments = Arc::new(StaticExperiment::new(
        config.assignment.experiment.clone().map(Experiment::from),
    ));

    let state = Arc::new(AppState::new(auth, stores, adapters, experiments, &config));
    let (mut router, _state) = build_router_with_state(state);

    let cors = build_cors_layer(server)?;
    router = router.layer(cors);

    let addr = format!("{}:{}", server.host, server.port);
    let runtime = tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .build()
        .map_err(|err| CliError::Server(err.to_string()))?;

    runtime.block_on(async move {
        let listener = tokio::net::TcpListener::bind(&addr).await?;
        tracing::info!(
            addr = %addr,
            default_backend = %config.assignment.default_backend,
            "server listening"
        );
        axum::serve(listener, router)
            .with_graceful_shutdown(async move {
                let _ = tokio::signal::ctrl_c().await;
            })
            .await
            .map_err(|err| CliError::Server(err.to_string()))
    })
}

/// CLI flag first, then the environment. `--no-token` wins over both.
fn resolve_token(cli: &CliConfig, lookup: impl Fn(&str) -> Option<String>) -> Option<String> {
    if cli.no_token {
        return None;
    }
    cli.token
        .clone()
        .or_else(|| lookup(ENV_TOKEN))
        .filter(|token| !token.trim().is_empty())
}

fn build_adapters(config: &AppConfig) -> Result<AdapterRegistry, CliError> {
    let runtime: Arc<dyn ToolAgentRuntime> = match ProcessToolAgent::from_config(&config.tool_agent)
    {
        Some(process) => Arc::new(process),
        None => {
            tracing::warn!("no tool agent command configured; using the mock runtime");
            Arc::new(MockToolAgent::new())
        }
    };
    let mut adapters = AdapterRegistry::new().with(Arc::new(ToolAgentAdapter::new(runtime)));

    match &config.graph.url {
        Some(url) => {
            let client = GraphClient::new(
                url.clone(),
                config.graph.api_key.clone(),
                Duration::from_secs(config.graph.timeout_secs),
            )
            .map_err(|err| CliError::Server(format!("failed to build graph client: {err}")))?;
            tracing::info!(url = %url, assistant_id = %config.graph.assistant_id, "graph backend enabled");
            adapters.register(Arc::new(GraphAdapter::new(
                Arc::new(client),
                config.graph.assistant_id.clone(),
                config.graph.agent_type.clone(),
            )));
        }
        None => tracing::info!("graph backend disabled; no url configured"),
    }
    Ok(adapters)
}

fn build_cors_layer(server: &ServerArgs) -> Result<CorsLayer, CliError> {
    let mut cors = CorsLayer::new();

    let mut origins = Vec::new();
    for origin in &server.cors_allow_origin {
        let value = origin
            .parse()
            .map_err(|_| CliError::InvalidCorsOrigin(origin.clone()))?;
        origins.push(value);
    }
    if origins.is_empty() {
        cors = cors.allow_origin(tower_http::cors::AllowOrigin::predicate(|_, _| false));
    } else {
        cors = cors.allow_origin(origins);
    }

    if server.cors_allow_method.is_empty() {
        cors = cors.allow_methods(Any);
    } else {
        let mut methods = Vec::new();
        for method in &server.cors_allow_method {
            let parsed = method
                .parse()
                .map_err(|_| CliError::InvalidCorsMethod(method.clone()))?;
            methods.push(parsed);
        }
        cors = cors.allow_methods(methods);
    }

    if server.cors_allow_header.is_empty() {
        cors = cors.allow_headers(Any);
    } else {
        let mut headers = Vec::new();
        for header in &server.cors_allow_header {
            let parsed = header
                .parse()
                .map_err(|_| CliError::InvalidCorsHeader(header.clone()))?;
            headers.push(parsed);
        }
        cors = cors.allow_headers(headers);
    }

    if server.cors_allow_credentials {
        cors = cors.allow_credentials(true);
    }

    Ok(cors)
}
