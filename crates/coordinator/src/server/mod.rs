//! HTTP surface of the engine.
//!
//! Read/trigger endpoints over the orchestrator and store, the inference
//! passthrough, and the health and metrics exports. Handlers map engine
//! error kinds onto HTTP statuses; everything else lives below this layer.

pub mod handlers;

use std::sync::Arc;

use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use axum::{Json, Router};
use tower_http::trace::TraceLayer;

use crate::cluster::ClusterClient;
use crate::error::EngineError;
use crate::inference::InferenceClient;
use crate::metrics::MetricsCollector;
use crate::orchestrate::Orchestrator;
use crate::recommend::RecommendationEngine;
use crate::remediate::gitops::ArgoClient;
use crate::store::Store;
use crate::telemetry::TelemetryReader;

/// Shared state behind every handler.
pub struct AppState {
    pub orchestrator: Arc<Orchestrator>,
    pub store: Arc<Store>,
    pub inference: InferenceClient,
    pub telemetry: TelemetryReader,
    pub gitops: ArgoClient,
    pub cluster: ClusterClient,
    pub recommendations: RecommendationEngine,
    pub metrics: MetricsCollector,
}

/// Build the API router.
pub fn build_router(state: Arc<AppState>) -> Router {
    Router::new()
        .route("/api/v1/health", get(handlers::health))
        .route("/api/v1/remediation/trigger", post(handlers::trigger_remediation))
        .route("/api/v1/incidents", post(handlers::create_incident))
        .route("/api/v1/incidents", get(handlers::list_incidents))
        .route("/api/v1/workflows/{id}", get(handlers::get_workflow))
        .route("/api/v1/detect", post(handlers::detect))
        .route("/api/v1/recommendations", get(handlers::recommendations))
        .route("/metrics", get(handlers::metrics))
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

/// Engine errors rendered as HTTP responses with a machine-readable code.
#[derive(Debug)]
pub struct ApiError(pub EngineError);

impl From<EngineError> for ApiError {
    fn from(err: EngineError) -> Self {
        Self(err)
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let status = match &self.0 {
            EngineError::Validation(_) => StatusCode::BAD_REQUEST,
            EngineError::NotFound { .. } => StatusCode::NOT_FOUND,
            EngineError::PermissionDenied(_) => StatusCode::FORBIDDEN,
            EngineError::BackendUnavailable { .. } => StatusCode::SERVICE_UNAVAILABLE,
            EngineError::Timeout(_) => StatusCode::GATEWAY_TIMEOUT,
            _ => StatusCode::INTERNAL_SERVER_ERROR,
        };
        let body = Json(serde_json::json!({
            "error": self.0.code(),
            "message": self.0.to_string(),
        }));
        (status, body).into_response()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_status_mapping() {
        let cases = [
            (EngineError::Validation("x".into()), StatusCode::BAD_REQUEST),
            (EngineError::not_found("model", "m"), StatusCode::NOT_FOUND),
            (
                EngineError::unavailable("ml", "down"),
                StatusCode::SERVICE_UNAVAILABLE,
            ),
            (
                EngineError::PermissionDenied("rbac".into()),
                StatusCode::FORBIDDEN,
            ),
            (EngineError::Timeout("poll".into()), StatusCode::GATEWAY_TIMEOUT),
        ];
        for (err, expected) in cases {
            let response = ApiError(err).into_response();
            assert_eq!(response.status(), expected);
        }
    }
}
