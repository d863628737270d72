//! Request handlers.

use std::collections::HashMap;
use std::sync::Arc;

use axum::extract::{Path, Query, State};
use axum::http::StatusCode;
use axum::response::IntoResponse;
use axum::Json;
use chrono::Utc;
use serde::{Deserialize, Serialize};
use tracing::info;

use super::{ApiError, AppState};
use crate::detect::layers::ResourceRef;
use crate::error::EngineError;
use crate::inference::PredictRequest;
use crate::remediate::IssueContext;
use crate::store::{Incident, IncidentFilter, IncidentStatus, NewIncident, Severity};

/// Crate version reported by the health endpoint.
const VERSION: &str = env!("CARGO_PKG_VERSION");

// --- health ---

#[derive(Debug, Serialize)]
pub struct HealthResponse {
    status: &'static str,
    version: &'static str,
    dependencies: DependencyHealth,
    timestamp: chrono::DateTime<Utc>,
}

#[derive(Debug, Serialize)]
pub struct DependencyHealth {
    cluster: bool,
    ml: bool,
    gitops: bool,
}

pub async fn health(State(state): State<Arc<AppState>>) -> impl IntoResponse {
    let (cluster, ml, gitops) = tokio::join!(
        state.cluster.health_check(),
        state.inference.health_check(),
        state.gitops.health_check(),
    );

    let status = if cluster { "healthy" } else { "degraded" };
    Json(HealthResponse {
        status,
        version: VERSION,
        dependencies: DependencyHealth { cluster, ml, gitops },
        timestamp: Utc::now(),
    })
}

// --- remediation trigger ---

#[derive(Debug, Deserialize)]
pub struct TriggerRequest {
    incident_id: Option<String>,
    namespace: Option<String>,
    resource: Option<TriggerResource>,
    issue: Option<TriggerIssue>,
    /// Additional resources implicated beyond the primary target.
    #[serde(default)]
    affected_resources: Vec<ResourceRef>,
}

#[derive(Debug, Deserialize)]
pub struct TriggerResource {
    kind: Option<String>,
    name: Option<String>,
}

#[derive(Debug, Deserialize)]
pub struct TriggerIssue {
    #[serde(rename = "type")]
    issue_type: Option<String>,
    description: Option<String>,
    severity: Option<String>,
}

#[derive(Debug, Serialize)]
pub struct TriggerResponse {
    workflow_id: String,
    status: String,
    deployment_method: String,
    /// Rough end-to-end estimate in seconds.
    estimated_duration: u64,
}

fn required<T>(value: Option<T>, field: &str) -> Result<T, ApiError> {
    value.ok_or_else(|| {
        ApiError(EngineError::Validation(format!(
            "missing required field: {field}"
        )))
    })
}

pub async fn trigger_remediation(
    State(state): State<Arc<AppState>>,
    Json(request): Json<TriggerRequest>,
) -> Result<impl IntoResponse, ApiError> {
    let incident_id = required(request.incident_id, "incident_id")?;
    let namespace = required(request.namespace, "namespace")?;
    let resource = required(request.resource, "resource")?;
    let issue = required(request.issue, "issue")?;

    let context = IssueContext {
        issue_type: required(issue.issue_type, "issue.type")?,
        description: required(issue.description, "issue.description")?,
        severity: issue.severity.unwrap_or_else(|| "medium".to_string()),
        namespace,
        resource_kind: required(resource.kind, "resource.kind")?,
        resource_name: required(resource.name, "resource.name")?,
    };

    info!(
        incident = %incident_id,
        namespace = %context.namespace,
        resource = %context.resource_name,
        issue = %context.issue_type,
        "Remediation trigger received"
    );

    let receipt = state
        .orchestrator
        .clone()
        .trigger(&incident_id, context, request.affected_resources)
        .await?;

    Ok((
        StatusCode::ACCEPTED,
        Json(TriggerResponse {
            workflow_id: receipt.workflow.id,
            status: receipt.workflow.status.to_string(),
            deployment_method: receipt.workflow.deployment_method.to_string(),
            estimated_duration: receipt.estimated_duration.as_secs(),
        }),
    ))
}

// --- incidents ---

#[derive(Debug, Deserialize)]
pub struct CreateIncidentRequest {
    title: Option<String>,
    description: Option<String>,
    severity: Option<String>,
    target: Option<String>,
    #[serde(default)]
    affected_resources: Vec<ResourceRef>,
    #[serde(default)]
    labels: HashMap<String, String>,
}

#[derive(Debug, Serialize)]
pub struct CreateIncidentResponse {
    status: &'static str,
    incident_id: String,
    created_at: chrono::DateTime<Utc>,
    incident: Incident,
}

pub async fn create_incident(
    State(state): State<Arc<AppState>>,
    Json(request): Json<CreateIncidentRequest>,
) -> Result<impl IntoResponse, ApiError> {
    let severity_raw = required(request.severity, "severity")?;
    let severity = Severity::parse(&severity_raw).ok_or_else(|| {
        ApiError(EngineError::Validation(format!(
            "unknown severity: {severity_raw}"
        )))
    })?;

    let incident = state
        .store
        .create_incident(NewIncident {
            title: required(request.title, "title")?,
            description: request.description.unwrap_or_default(),
            severity,
            target: required(request.target, "target")?,
            affected_resources: request.affected_resources,
            labels: request.labels,
        })
        .await?;

    Ok((
        StatusCode::CREATED,
        Json(CreateIncidentResponse {
            status: "created",
            incident_id: incident.id.clone(),
            created_at: incident.created_at,
            incident,
        }),
    ))
}

#[derive(Debug, Deserialize)]
pub struct ListIncidentsQuery {
    namespace: Option<String>,
    severity: Option<String>,
    status: Option<String>,
    limit: Option<usize>,
}

#[derive(Debug, Serialize)]
pub struct ListIncidentsResponse {
    incidents: Vec<Incident>,
    total: usize,
    filters: HashMap<String, String>,
}

/// Query values equal to this sentinel mean "no filter".
const ALL_SENTINEL: &str = "all";

fn filter_value(raw: Option<String>) -> Option<String> {
    raw.filter(|v| v != ALL_SENTINEL && !v.is_empty())
}

pub async fn list_incidents(
    State(state): State<Arc<AppState>>,
    Query(query): Query<ListIncidentsQuery>,
) -> Result<impl IntoResponse, ApiError> {
    let namespace = filter_value(query.namespace);
    let severity_raw = filter_value(query.severity);
    let status_raw = filter_value(query.status);

    let severity = match &severity_raw {
        None => None,
        Some(raw) => Some(Severity::parse(raw).ok_or_else(|| {
            ApiError(EngineError::Validation(format!("unknown severity: {raw}")))
        })?),
    };
    let status = match &status_raw {
        None => None,
        Some(raw) => Some(IncidentStatus::parse(raw).ok_or_else(|| {
            ApiError(EngineError::Validation(format!("unknown status: {raw}")))
        })?),
    };

    let filter = IncidentFilter {
        namespace: namespace.clone(),
        severity,
        status,
        limit: query.limit,
    };
    let incidents = state.store.list_incidents(&filter).await;

    let mut filters = HashMap::new();
    if let Some(v) = namespace {
        filters.insert("namespace".to_string(), v);
    }
    if let Some(v) = severity_raw {
        filters.insert("severity".to_string(), v);
    }
    if let Some(v) = status_raw {
        filters.insert("status".to_string(), v);
    }

    Ok(Json(ListIncidentsResponse {
        total: incidents.len(),
        incidents,
        filters,
    }))
}

// --- workflows ---

pub async fn get_workflow(
    State(state): State<Arc<AppState>>,
    Path(id): Path<String>,
) -> Result<impl IntoResponse, ApiError> {
    let workflow = state.orchestrator.get_workflow(&id).await?;
    Ok(Json(workflow))
}

// --- inference passthrough ---

#[derive(Debug, Deserialize)]
pub struct DetectRequest {
    model: Option<String>,
    instances: Option<Vec<Vec<f64>>>,
}

pub async fn detect(
    State(state): State<Arc<AppState>>,
    Json(request): Json<DetectRequest>,
) -> Result<impl IntoResponse, ApiError> {
    let predict = PredictRequest {
        model: required(request.model, "model")?,
        instances: required(request.instances, "instances")?,
    };
    let response = state.inference.predict(&predict).await?;
    Ok(Json(response))
}

// --- recommendations & metrics ---

#[derive(Debug, Serialize)]
pub struct RecommendationsResponse {
    recommendations: Vec<crate::recommend::Recommendation>,
    generated_at: chrono::DateTime<Utc>,
}

pub async fn recommendations(State(state): State<Arc<AppState>>) -> impl IntoResponse {
    let recommendations = state.recommendations.analyze().await;
    Json(RecommendationsResponse {
        recommendations,
        generated_at: Utc::now(),
    })
}

pub async fn metrics(State(state): State<Arc<AppState>>) -> impl IntoResponse {
    state.metrics.render().await
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_filter_value_sentinel() {
        assert_eq!(filter_value(Some("all".to_string())), None);
        assert_eq!(filter_value(Some(String::new())), None);
        assert_eq!(
            filter_value(Some("prod".to_string())),
            Some("prod".to_string())
        );
        assert_eq!(filter_value(None), None);
    }

    #[test]
    fn test_required_reports_field() {
        let err = required::<String>(None, "incident_id").unwrap_err();
        assert!(err.0.to_string().contains("incident_id"));
        assert_eq!(required(Some(1), "x").unwrap(), 1);
    }

    #[test]
    fn test_trigger_request_parses_type_keyword() {
        let request: TriggerRequest = serde_json::from_value(serde_json::json!({
            "incident_id": "inc-1",
            "namespace": "prod",
            "resource": {"kind": "Deployment", "name": "payment"},
            "issue": {"type": "crash_loop", "description": "pods crashlooping", "severity": "high"}
        }))
        .unwrap();
        assert_eq!(request.issue.unwrap().issue_type.as_deref(), Some("crash_loop"));
    }
}
