//! Runtime configuration.
//!
//! Values come from an optional TOML file, then environment overrides, then
//! CLI flags (applied by the caller).

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::time::Duration;

use interview_agent_stream_schema::BackendKind;
use serde::Deserialize;
use thiserror::Error;

/// Longest chat message accepted, in characters.
pub const MAX_MESSAGE_CHARS: usize = 20_000;

pub const DEFAULT_CHECKPOINT_INTERVAL_MS: u64 = 2_000;
pub const DEFAULT_CHECKPOINT_MIN_CHARS: usize = 50;

pub const ENV_TOKEN: &str = "INTERVIEW_AGENT_TOKEN";
pub const ENV_GRAPH_URL: &str = "INTERVIEW_AGENT_GRAPH_URL";
pub const ENV_GRAPH_API_KEY: &str = "INTERVIEW_AGENT_GRAPH_API_KEY";

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to read config {path}: {source}")]
    Read {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("invalid config: {0}")]
    Parse(#[from] toml::de::Error),
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct AppConfig {
    pub checkpoint: CheckpointConfig,
    pub assignment: AssignmentConfig,
    pub tool_agent: ToolAgentConfig,
    pub graph: GraphConfig,
    pub storage: StorageConfig,
}

impl AppConfig {
    pub fn load(path: Option<&Path>) -> Result<Self, ConfigError> {
        let Some(path) = path else {
            return Ok(Self::default());
        };
        let raw = std::fs::read_to_string(path).map_err(|source| ConfigError::Read {
            path: path.to_path_buf(),
            source,
        })?;
        Self::from_toml(&raw)
    }

    pub fn from_toml(raw: &str) -> Result<Self, ConfigError> {
        Ok(toml::from_str(raw)?)
    }

    pub fn apply_env(&mut self) {
        self.apply_env_from(|key| std::env::var(key).ok());
    }

    pub fn apply_env_from(&mut self, lookup: impl Fn(&str) -> Option<String>) {
        if let Some(url) = lookup(ENV_GRAPH_URL).filter(|value| !value.trim().is_empty()) {
            self.graph.url = Some(url);
        }
        if let Some(key) = lookup(ENV_GRAPH_API_KEY).filter(|value| !value.trim().is_empty()) {
            self.graph.api_key = Some(key);
        }
    }
}

/// Tuning for in-flight turn snapshots.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(default)]
pub struct CheckpointConfig {
    /// Minimum time between two streaming snapshots of the same turn.
    pub interval_ms: u64,
    /// Streaming snapshots are skipped until the partial response has at
    /// least this many characters.
    pub min_content_chars: usize,
}

impl CheckpointConfig {
    pub fn interval(&self) -> Duration {
        Duration::from_millis(self.interval_ms)
    }
}

impl Default for CheckpointConfig {
    fn default() -> Self {
        Self {
            interval_ms: DEFAULT_CHECKPOINT_INTERVAL_MS,
            min_content_chars: DEFAULT_CHECKPOINT_MIN_CHARS,
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct AssignmentConfig {
    pub default_backend: BackendKind,
    pub experiment: Option<ExperimentConfig>,
}

impl Default for AssignmentConfig {
    fn default() -> Self {
        Self {
            default_backend: BackendKind::ToolAgent,
            experiment: None,
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct ExperimentConfig {
    pub id: String,
    #[serde(default = "default_true")]
    pub enabled: bool,
    /// Share of candidates, 0 to 100, routed to the graph backend.
    #[serde(default)]
    pub graph_percentage: u8,
    /// When non-empty, only these organizations take part.
    #[serde(default)]
    pub organizations: Vec<String>,
}

fn default_true() -> bool {
    true
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct ToolAgentConfig {
    /// Agent executable. The scripted mock runtime is used when unset.
    pub command: Option<String>,
    pub args: Vec<String>,
    pub env: BTreeMap<String, String>,
    pub idle_timeout_secs: u64,
}

impl Default for ToolAgentConfig {
    fn default() -> Self {
        Self {
            command: None,
            args: Vec::new(),
            env: BTreeMap::new(),
            idle_timeout_secs: 300,
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct GraphConfig {
    /// Base URL of the graph service. The graph backend is disabled when unset.
    pub url: Option<String>,
    pub api_key: Option<String>,
    pub assistant_id: String,
    pub agent_type: String,
    pub timeout_secs: u64,
}

impl Default for GraphConfig {
    fn default() -> Self {
        Self {
            url: None,
            api_key: None,
            assistant_id: "interview_assistant".to_string(),
            agent_type: "coding_assistant".to_string(),
            timeout_secs: 120,
        }
    }
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct StorageConfig {
    /// SQLite database file. Sessions are kept in memory when unset.
    pub sqlite_path: Option<PathBuf>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_without_file() {
        let config = AppConfig::load(None).expect("defaults");
        assert_eq!(config.checkpoint, CheckpointConfig::default());
        assert_eq!(config.checkpoint.interval(), Duration::from_millis(2_000));
        assert_eq!(config.checkpoint.min_content_chars, 50);
        assert_eq!(config.assignment.default_backend, BackendKind::ToolAgent);
        assert!(config.graph.url.is_none());
    }

    #[test]
    fn parses_sections() {
        let config = AppConfig::from_toml(
            r#"
            [checkpoint]
            interval_ms = 500

            [assignment]
            default_backend = "graph"

            [assignment.experiment]
            id = "exp-graph-rollout"
            graph_percentage = 25
            organizations = ["org-1"]

            [graph]
            url = "http://graph.internal:8123"
            "#,
        )
        .expect("config");
        assert_eq!(config.checkpoint.interval_ms, 500);
        assert_eq!(config.checkpoint.min_content_chars, 50);
        assert_eq!(config.assignment.default_backend, BackendKind::Graph);
        let experiment = config.assignment.experiment.expect("experiment");
        assert!(experiment.enabled);
        assert_eq!(experiment.graph_percentage, 25);
        assert_eq!(experiment.organizations, vec!["org-1".to_string()]);
        assert_eq!(config.graph.assistant_id, "interview_assistant");
    }

    #[test]
    fn env_overrides_file() {
        let mut config =
            AppConfig::from_toml("[graph]\nurl = \"http://file\"\n").expect("config");
        config.apply_env_from(|key| match key {
            ENV_GRAPH_URL => Some("http://env".to_string()),
            ENV_GRAPH_API_KEY => Some(String::new()),
            _ => None,
        });
        assert_eq!(config.graph.url.as_deref(), Some("http://env"));
        assert!(config.graph.api_key.is_none());
    }

    #[test]
    fn rejects_bad_toml() {
        assert!(matches!(
            AppConfig::from_toml("[checkpoint]\ninterval_ms = \"soon\""),
            Err(ConfigError::Parse(_))
        ));
    }
}
