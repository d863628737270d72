//! Stack-layer detection.
//!
//! Computes which layers of the cluster stack an issue touches and which
//! one is the root cause. The keyword path always runs; the inference proxy
//! can sharpen the result but its failure never fails detection.

use std::collections::HashMap;

use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use crate::config::DetectionConfig;
use crate::error::Result;
use crate::inference::InferenceClient;
use crate::metrics::MetricsCollector;

/// A level of the cluster stack. Lower ordinal remediates first.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Layer {
    Infrastructure = 0,
    Platform = 1,
    Application = 2,
}

impl Layer {
    pub const ALL: [Layer; 3] = [Layer::Infrastructure, Layer::Platform, Layer::Application];

    #[must_use]
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Infrastructure => "infrastructure",
            Self::Platform => "platform",
            Self::Application => "application",
        }
    }

    #[must_use]
    pub fn from_name(name: &str) -> Option<Self> {
        match name {
            "infrastructure" => Some(Self::Infrastructure),
            "platform" => Some(Self::Platform),
            "application" => Some(Self::Application),
            _ => None,
        }
    }
}

impl std::fmt::Display for Layer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A cluster resource implicated in an issue.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct ResourceRef {
    pub kind: String,
    #[serde(default)]
    pub namespace: String,
    pub name: String,
    /// Free-form issue annotation for this resource.
    #[serde(default)]
    pub issue: String,
}

/// How the layer verdict was reached.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DetectionMethod {
    Keyword,
    MlEnhanced,
    MlOnly,
}

/// The layered view of one issue, input to the planner.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LayeredIssue {
    pub id: String,
    pub description: String,
    /// Affected layers in priority order (infrastructure first).
    pub affected_layers: Vec<Layer>,
    pub root_cause_layer: Layer,
    pub impacted_resources: HashMap<Layer, Vec<ResourceRef>>,
    pub severity: String,
    pub detection_method: DetectionMethod,
    pub layer_confidence: HashMap<Layer, f64>,
    /// Summary of a recurring historical pattern, when one was found.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub historical_pattern: Option<String>,
    /// Raw per-layer ML probabilities when the ML path contributed.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub ml_predictions: Option<HashMap<Layer, f64>>,
}

const INFRASTRUCTURE_KEYWORDS: &[&str] = &[
    "node",
    "kernel",
    "kubelet",
    "disk pressure",
    "memory pressure",
    "pid pressure",
    "machine config",
    "machineconfig",
    "filesystem",
    "ntp",
];

const PLATFORM_KEYWORDS: &[&str] = &[
    "operator",
    "sdn",
    "ovn",
    "ingress",
    "api server",
    "apiserver",
    "etcd",
    "controller manager",
    "scheduler",
    "cluster version",
    "networkpolicy",
];

const APPLICATION_KEYWORDS: &[&str] = &[
    "pod",
    "deployment",
    "replica",
    "crashloop",
    "crash loop",
    "imagepull",
    "image pull",
    "oom",
    "container",
    "service endpoint",
    "probe failure",
];

fn keywords_for(layer: Layer) -> &'static [&'static str] {
    match layer {
        Layer::Infrastructure => INFRASTRUCTURE_KEYWORDS,
        Layer::Platform => PLATFORM_KEYWORDS,
        Layer::Application => APPLICATION_KEYWORDS,
    }
}

/// Map a resource kind onto the layer it lives in.
#[must_use]
pub fn layer_of_kind(kind: &str) -> Option<Layer> {
    match kind {
        "Node" | "MachineConfig" | "MachineConfigPool" | "MachineSet" => {
            Some(Layer::Infrastructure)
        }
        "ClusterOperator" | "ClusterVersion" | "NetworkPolicy" | "Ingress" | "IngressController" => {
            Some(Layer::Platform)
        }
        "Pod" | "Deployment" | "StatefulSet" | "ReplicaSet" | "DaemonSet" | "Job" | "CronJob" => {
            Some(Layer::Application)
        }
        other if other.ends_with("Operator") => Some(Layer::Platform),
        _ => None,
    }
}

/// Initial confidence assigned to keyword-detected layers.
const KEYWORD_CONFIDENCE: f64 = 0.70;

/// Layer detector: keyword base with optional ML enhancement.
pub struct LayerDetector {
    inference: Option<InferenceClient>,
    ml_layer_threshold: f64,
    root_cause_threshold: f64,
    metrics: MetricsCollector,
}

impl LayerDetector {
    #[must_use]
    pub fn new(
        inference: Option<InferenceClient>,
        config: &DetectionConfig,
        metrics: MetricsCollector,
    ) -> Self {
        Self {
            inference: if config.ml_enabled { inference } else { None },
            ml_layer_threshold: config.ml_layer_threshold,
            root_cause_threshold: config.root_cause_threshold,
            metrics,
        }
    }

    /// Compute the layered view of an issue.
    ///
    /// Infallible by design: ML trouble degrades to the keyword result.
    pub async fn detect_layers(
        &self,
        issue_id: &str,
        description: &str,
        severity: &str,
        resources: &[ResourceRef],
    ) -> LayeredIssue {
        let mut issue = detect_by_keywords(issue_id, description, severity, resources);

        if let Some(inference) = &self.inference {
            match self.enhance(inference, &mut issue).await {
                Ok(()) => {}
                Err(e) => {
                    warn!(issue = %issue_id, error = %e, "Layer ML enhancement degraded to keyword result");
                    self.metrics.layer_detection_degraded().await;
                }
            }
        }

        issue
    }

    async fn enhance(&self, inference: &InferenceClient, issue: &mut LayeredIssue) -> Result<()> {
        let kinds: Vec<String> = issue
            .impacted_resources
            .values()
            .flatten()
            .map(|r| r.kind.clone())
            .collect();

        let analysis = inference
            .analyze_layers(&issue.description, &kinds)
            .await?;

        let mut ml_predictions = HashMap::new();
        let mut ml_root_cause = None;

        for (name, verdict) in &analysis.layers {
            let Some(layer) = Layer::from_name(name) else {
                debug!(layer = %name, "Ignoring unknown layer name from model");
                continue;
            };
            ml_predictions.insert(layer, verdict.probability);
            if verdict.is_root_cause {
                ml_root_cause = Some(layer);
            }

            if verdict.probability >= self.ml_layer_threshold {
                if !issue.affected_layers.contains(&layer) {
                    issue.affected_layers.push(layer);
                }
                let entry = issue.layer_confidence.entry(layer).or_insert(0.0);
                if verdict.probability > *entry {
                    *entry = verdict.probability;
                }
            }
        }

        issue.affected_layers.sort_unstable();

        if analysis.overall_confidence >= self.root_cause_threshold {
            if let Some(root) = ml_root_cause {
                if issue.affected_layers.contains(&root) {
                    issue.root_cause_layer = root;
                }
            }
        }

        issue.detection_method = DetectionMethod::MlEnhanced;
        issue.ml_predictions = Some(ml_predictions);
        Ok(())
    }
}

/// The always-available keyword path.
fn detect_by_keywords(
    issue_id: &str,
    description: &str,
    severity: &str,
    resources: &[ResourceRef],
) -> LayeredIssue {
    let haystack = description.to_lowercase();
    let mut affected = Vec::new();
    let mut impacted: HashMap<Layer, Vec<ResourceRef>> = HashMap::new();

    for layer in Layer::ALL {
        if keywords_for(layer).iter().any(|kw| haystack.contains(kw)) {
            affected.push(layer);
        }
    }

    for resource in resources {
        if let Some(layer) = layer_of_kind(&resource.kind) {
            if !affected.contains(&layer) {
                affected.push(layer);
            }
            impacted.entry(layer).or_default().push(resource.clone());
        } else {
            // Unmapped kinds ride with the application layer.
            impacted
                .entry(Layer::Application)
                .or_default()
                .push(resource.clone());
        }
    }

    if affected.is_empty() {
        affected.push(Layer::Application);
    }
    affected.sort_unstable();

    let root_cause_layer = affected[0];
    let layer_confidence = affected
        .iter()
        .map(|layer| (*layer, KEYWORD_CONFIDENCE))
        .collect();

    LayeredIssue {
        id: issue_id.to_string(),
        description: description.to_string(),
        affected_layers: affected,
        root_cause_layer,
        impacted_resources: impacted,
        severity: severity.to_string(),
        detection_method: DetectionMethod::Keyword,
        layer_confidence,
        historical_pattern: None,
        ml_predictions: None,
    }
}
