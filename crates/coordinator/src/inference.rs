//! Client for out-of-process model servers.
//!
//! Forwards feature vectors to named model endpoints and exposes the
//! layer-analysis call consumed by the layer detector. Responses use a fixed
//! schema; unknown fields are rejected so a drifting model server fails
//! loudly instead of mis-parsing.

use std::collections::HashMap;

use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::config::InferenceConfig;
use crate::error::{EngineError, Result};

/// Generic prediction request forwarded to a model endpoint.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PredictRequest {
    /// Model name, resolved to an endpoint path by the server.
    pub model: String,
    /// Feature vectors, one per instance.
    pub instances: Vec<Vec<f64>>,
}

/// Generic prediction response passed through to the caller.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PredictResponse {
    pub predictions: Vec<serde_json::Value>,
}

/// Per-layer verdict from the layer-analysis model.
#[derive(Debug, Clone, Deserialize, Serialize, PartialEq)]
#[serde(deny_unknown_fields)]
pub struct LayerVerdict {
    pub affected: bool,
    pub probability: f64,
    pub is_root_cause: bool,
}

/// Layer-analysis response. Field set is exact; anything else is a schema
/// violation.
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(deny_unknown_fields)]
pub struct LayerAnalysis {
    /// Verdict per layer name (`infrastructure`, `platform`, `application`).
    pub layers: HashMap<String, LayerVerdict>,
    pub overall_confidence: f64,
}

#[derive(Debug, Serialize)]
struct LayerAnalysisRequest<'a> {
    description: &'a str,
    resource_kinds: &'a [String],
}

/// HTTP proxy to the model servers.
#[derive(Debug, Clone)]
pub struct InferenceClient {
    base_url: String,
    client: reqwest::Client,
}

impl InferenceClient {
    /// Create a client from configuration.
    ///
    /// # Errors
    ///
    /// Returns an error if the HTTP client cannot be constructed.
    pub fn new(config: &InferenceConfig) -> Result<Self> {
        let client = reqwest::Client::builder()
            .timeout(config.timeout)
            .build()
            .map_err(|e| EngineError::unavailable("inference", e))?;

        Ok(Self {
            base_url: config.base_url.trim_end_matches('/').to_string(),
            client,
        })
    }

    /// Forward a feature-vector prediction to a named model.
    ///
    /// Fails with `not_found` for unknown models and `backend_unavailable`
    /// when the model server does not answer.
    pub async fn predict(&self, request: &PredictRequest) -> Result<PredictResponse> {
        let url = format!("{}/v1/models/{}:predict", self.base_url, request.model);
        debug!(model = %request.model, instances = request.instances.len(), "Forwarding prediction");

        let response = self
            .client
            .post(&url)
            .json(&serde_json::json!({ "instances": request.instances }))
            .send()
            .await
            .map_err(|e| EngineError::unavailable("inference", e))?;

        match response.status().as_u16() {
            404 => Err(EngineError::not_found("model", &request.model)),
            code if code >= 400 => Err(EngineError::unavailable(
                "inference",
                format!("model server returned HTTP {code}"),
            )),
            _ => response
                .json::<PredictResponse>()
                .await
                .map_err(|e| EngineError::unavailable("inference", e)),
        }
    }

    /// Ask the layer-analysis model for per-layer verdicts on an issue.
    pub async fn analyze_layers(
        &self,
        description: &str,
        resource_kinds: &[String],
    ) -> Result<LayerAnalysis> {
        let url = format!("{}/v1/models/layer-analysis:predict", self.base_url);

        let response = self
            .client
            .post(&url)
            .json(&LayerAnalysisRequest {
                description,
                resource_kinds,
            })
            .send()
            .await
            .map_err(|e| EngineError::unavailable("inference", e))?;

        match response.status().as_u16() {
            404 => Err(EngineError::not_found("model", "layer-analysis")),
            code if code >= 400 => Err(EngineError::unavailable(
                "inference",
                format!("layer analysis returned HTTP {code}"),
            )),
            _ => response
                .json::<LayerAnalysis>()
                .await
                .map_err(|e| EngineError::unavailable("inference", e)),
        }
    }

    /// Probe model server liveness.
    pub async fn health_check(&self) -> bool {
        let url = format!("{}/v1/health", self.base_url);
        match self.client.get(&url).send().await {
            Ok(response) => response.status().is_success(),
            Err(_) => false,
        }
    }
}
