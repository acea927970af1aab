//! Sticky backend selection per session.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use futures::future::BoxFuture;
use interview_agent_error::InterviewError;
use interview_agent_stream_schema::{AssignmentSource, BackendKind};
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};
use utoipa::ToSchema;
use uuid::Uuid;

use crate::config::ExperimentConfig;
use crate::store::SessionStore;

/// Namespace for experiment bucketing ids.
const EXPERIMENT_NAMESPACE: Uuid = Uuid::from_u128(0x6f1d_2a0e_57c4_4b9a_9d1e_3c8b_7a52_e410);

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, JsonSchema, ToSchema)]
#[serde(rename_all = "camelCase")]
pub struct BackendAssignment {
    pub backend: BackendKind,
    pub source: AssignmentSource,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub experiment_id: Option<String>,
}

#[derive(Debug, Clone)]
pub struct AssignmentRequest<'a> {
    pub session_id: &'a str,
    pub candidate_id: &'a str,
    pub organization_id: &'a str,
    pub assessment_id: &'a str,
    pub explicit: Option<BackendKind>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Experiment {
    pub id: String,
    pub enabled: bool,
    pub graph_percentage: u8,
    pub organizations: Vec<String>,
}

impl Experiment {
    fn applies_to(&self, organization_id: &str) -> bool {
        self.enabled
            && (self.organizations.is_empty()
                || self.organizations.iter().any(|org| org == organization_id))
    }
}

impl From<ExperimentConfig> for Experiment {
    fn from(config: ExperimentConfig) -> Self {
        Self {
            id: config.id,
            enabled: config.enabled,
            graph_percentage: config.graph_percentage.min(100),
            organizations: config.organizations,
        }
    }
}

/// Supplies the experiment currently steering backend selection.
pub trait ExperimentSource: Send + Sync {
    fn active_experiment<'a>(
        &'a self,
        organization_id: &'a str,
        assessment_id: &'a str,
    ) -> BoxFuture<'a, Result<Option<Experiment>, InterviewError>>;
}

/// Experiment fixed at startup from configuration.
#[derive(Debug, Clone, Default)]
pub struct StaticExperiment {
    experiment: Option<Experiment>,
}

impl StaticExperiment {
    pub fn new(experiment: Option<Experiment>) -> Self {
        Self { experiment }
    }
}

impl ExperimentSource for StaticExperiment {
    fn active_experiment<'a>(
        &'a self,
        _organization_id: &'a str,
        _assessment_id: &'a str,
    ) -> BoxFuture<'a, Result<Option<Experiment>, InterviewError>> {
        Box::pin(futures::future::ready(Ok(self.experiment.clone())))
    }
}

/// Deterministic bucket in `0..100` for a candidate within an experiment.
pub fn experiment_bucket(experiment_id: &str, candidate_id: &str) -> u8 {
    let name = format!("{experiment_id}:{candidate_id}");
    let id = Uuid::new_v5(&EXPERIMENT_NAMESPACE, name.as_bytes());
    (id.as_u128() % 100) as u8
}

pub struct BackendAssigner {
    default_backend: BackendKind,
    experiments: Arc<dyn ExperimentSource>,
    sessions: Arc<dyn SessionStore>,
    cache: Mutex<HashMap<String, BackendAssignment>>,
}

impl BackendAssigner {
    pub fn new(
        default_backend: BackendKind,
        experiments: Arc<dyn ExperimentSource>,
        sessions: Arc<dyn SessionStore>,
    ) -> Self {
        Self {
            default_backend,
            experiments,
            sessions,
            cache: Mutex::new(HashMap::new()),
        }
    }

    /// Returns the session's backend, computing it on first use.
    ///
    /// Later calls always return the first answer with source `sticky`, no
    /// matter what the request or experiment says by then. Never fails: lookup
    /// problems fall back to the default backend.
    pub async fn resolve(&self, request: AssignmentRequest<'_>) -> BackendAssignment {
        if let Some(existing) = self.cached(request.session_id) {
            return sticky(existing);
        }

        match self.sessions.session(request.session_id).await {
            Ok(Some(record)) => {
                if let Some(stored) = record.assignment {
                    let stored = self.remember(request.session_id, stored);
                    return sticky(stored);
                }
            }
            Ok(None) => {}
            Err(err) => {
                tracing::warn!(
                    session_id = request.session_id,
                    error = %err,
                    "failed to load stored backend assignment"
                );
            }
        }

        let computed = self.compute(&request).await;
        let assignment = self.remember(request.session_id, computed.clone());
        if assignment != computed {
            // Another request assigned the session first.
            return sticky(assignment);
        }

        tracing::info!(
            session_id = request.session_id,
            backend = %assignment.backend,
            source = ?assignment.source,
            experiment_id = ?assignment.experiment_id,
            "backend assigned"
        );
        if let Err(err) = self
            .sessions
            .set_assignment(request.session_id, assignment.clone())
            .await
        {
            tracing::warn!(
                session_id = request.session_id,
                error = %err,
                "failed to persist backend assignment"
            );
        }
        assignment
    }

    async fn compute(&self, request: &AssignmentRequest<'_>) -> BackendAssignment {
        if let Some(backend) = request.explicit {
            return BackendAssignment {
                backend,
                source: AssignmentSource::Explicit,
                experiment_id: None,
            };
        }

        match self
            .experiments
            .active_experiment(request.organization_id, request.assessment_id)
            .await
        {
            Ok(Some(experiment)) if experiment.applies_to(request.organization_id) => {
                let bucket = experiment_bucket(&experiment.id, request.candidate_id);
                let backend = if bucket < experiment.graph_percentage {
                    BackendKind::Graph
                } else {
                    BackendKind::ToolAgent
                };
                BackendAssignment {
                    backend,
                    source: AssignmentSource::Experiment,
                    experiment_id: Some(experiment.id),
                }
            }
            Ok(_) => self.default_assignment(),
            Err(err) => {
                tracing::warn!(
                    session_id = request.session_id,
                    error = %err,
                    "experiment lookup failed; using default backend"
                );
                self.default_assignment()
            }
        }
    }

    fn default_assignment(&self) -> BackendAssignment {
        BackendAssignment {
            backend: self.default_backend,
            source: AssignmentSource::Default,
            experiment_id: None,
        }
    }

    fn cached(&self, session_id: &str) -> Option<BackendAssignment> {
        self.cache
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .get(session_id)
            .cloned()
    }

    fn remember(&self, session_id: &str, assignment: BackendAssignment) -> BackendAssignment {
        self.cache
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .entry(session_id.to_string())
            .or_insert(assignment)
            .clone()
    }
}

fn sticky(assignment: BackendAssignment) -> BackendAssignment {
    BackendAssignment {
        source: AssignmentSource::Sticky,
        ..assignment
    }
}
