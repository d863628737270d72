//! Remediation planning.
//!
//! Turns a layered issue into an ordered step list with per-layer health
//! checkpoints and a reverse-order rollback list. Plans are immutable once
//! generated; execution is the orchestrator's job.

use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tracing::debug;
use uuid::Uuid;

use crate::detect::layers::{Layer, LayeredIssue, ResourceRef};

/// Prefix marking a step as the inverse of a forward step.
pub const ROLLBACK_PREFIX: &str = "rollback_";

/// One remediation action.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct RemediationStep {
    pub layer: Layer,
    /// Unique, ascending across the whole plan.
    pub order: u32,
    pub description: String,
    pub action_type: String,
    pub target: String,
    /// Settle time after the action completes.
    #[serde(with = "duration_secs")]
    pub wait_time: Duration,
    /// Optional steps may be skipped once a prior checkpoint passed.
    pub required: bool,
}

/// Verification gate after the last step of a layer.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct HealthCheckpoint {
    pub layer: Layer,
    /// `order` of the step this checkpoint follows.
    pub after_step: u32,
    pub checks: Vec<String>,
    #[serde(with = "duration_secs")]
    pub timeout: Duration,
}

/// A complete multi-layer remediation plan.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RemediationPlan {
    pub id: String,
    pub issue_id: String,
    /// Layers in execution order.
    pub layers: Vec<Layer>,
    pub steps: Vec<RemediationStep>,
    pub checkpoints: Vec<HealthCheckpoint>,
    /// `steps` reversed, each with its inverse action type.
    pub rollback_steps: Vec<RemediationStep>,
    pub created_at: DateTime<Utc>,
}

impl RemediationPlan {
    /// The checkpoint gating progression right after `order`, if any.
    #[must_use]
    pub fn checkpoint_after(&self, order: u32) -> Option<&HealthCheckpoint> {
        self.checkpoints.iter().find(|c| c.after_step == order)
    }
}

/// Plan generator.
pub struct Planner {
    checkpoint_timeout: Duration,
}

impl Planner {
    #[must_use]
    pub fn new(checkpoint_timeout: Duration) -> Self {
        Self { checkpoint_timeout }
    }

    /// Generate the ordered plan for an issue.
    #[must_use]
    pub fn generate_plan(&self, issue: &LayeredIssue) -> RemediationPlan {
        let mut layers = issue.affected_layers.clone();
        layers.sort_unstable();

        let mut steps = Vec::new();
        let mut checkpoints = Vec::new();
        let mut order: u32 = 0;

        for layer in &layers {
            let resources = issue.impacted_resources.get(layer);
            let target = target_of(*layer, resources);

            for template in templates_for(*layer) {
                order += 1;
                steps.push(RemediationStep {
                    layer: *layer,
                    order,
                    description: format!("{} ({target})", template.description),
                    action_type: template.action_type.to_string(),
                    target: target.clone(),
                    wait_time: template.wait_time,
                    required: template.required,
                });
            }

            checkpoints.push(HealthCheckpoint {
                layer: *layer,
                after_step: order,
                checks: checks_for(*layer),
                timeout: self.checkpoint_timeout,
            });
        }

        let rollback_steps = steps.iter().rev().map(invert).collect();

        let plan = RemediationPlan {
            id: Uuid::new_v4().to_string(),
            issue_id: issue.id.clone(),
            layers,
            steps,
            checkpoints,
            rollback_steps,
            created_at: Utc::now(),
        };
        debug!(
            plan = %plan.id,
            issue = %plan.issue_id,
            steps = plan.steps.len(),
            checkpoints = plan.checkpoints.len(),
            "Generated remediation plan"
        );
        plan
    }
}

struct StepTemplate {
    description: &'static str,
    action_type: &'static str,
    wait_time: Duration,
    required: bool,
}

fn templates_for(layer: Layer) -> Vec<StepTemplate> {
    match layer {
        Layer::Infrastructure => vec![
            StepTemplate {
                description: "Monitor node rollout",
                action_type: "monitor_node_rollout",
                wait_time: Duration::from_secs(300),
                required: true,
            },
            StepTemplate {
                description: "Wait for machine config convergence",
                action_type: "apply_infra_config",
                wait_time: Duration::from_secs(600),
                required: true,
            },
        ],
        Layer::Platform => vec![StepTemplate {
            description: "Restart platform operator",
            action_type: "restart_operator",
            wait_time: Duration::from_secs(180),
            required: true,
        }],
        // A healthy higher layer often resolves the application symptom, so
        // this step is skippable once a prior checkpoint passed.
        Layer::Application => vec![StepTemplate {
            description: "Restart workload",
            action_type: "restart_workload",
            wait_time: Duration::from_secs(120),
            required: false,
        }],
    }
}

fn checks_for(layer: Layer) -> Vec<String> {
    let checks: &[&str] = match layer {
        Layer::Infrastructure => &["nodes-ready", "infra-stable", "storage-available"],
        Layer::Platform => &["operators-ready", "networking-functional", "ingress-available"],
        Layer::Application => &["pods-running", "endpoints-healthy", "services-responding"],
    };
    checks.iter().map(ToString::to_string).collect()
}

fn target_of(layer: Layer, resources: Option<&Vec<ResourceRef>>) -> String {
    match resources {
        Some(list) if !list.is_empty() => list
            .iter()
            .map(|r| {
                if r.namespace.is_empty() {
                    format!("{}/{}", r.kind, r.name)
                } else {
                    format!("{}/{}@{}", r.kind, r.name, r.namespace)
                }
            })
            .collect::<Vec<_>>()
            .join(","),
        _ => match layer {
            Layer::Infrastructure => "cluster-nodes".to_string(),
            Layer::Platform => "platform-operators".to_string(),
            Layer::Application => "workloads".to_string(),
        },
    }
}

/// Inverse of a forward step. Inverting twice restores the action type.
#[must_use]
pub fn invert(step: &RemediationStep) -> RemediationStep {
    let action_type = step
        .action_type
        .strip_prefix(ROLLBACK_PREFIX)
        .map_or_else(
            || format!("{ROLLBACK_PREFIX}{}", step.action_type),
            ToString::to_string,
        );
    RemediationStep {
        layer: step.layer,
        order: step.order,
        description: format!("Roll back: {}", step.description),
        action_type,
        target: step.target.clone(),
        wait_time: step.wait_time,
        required: step.required,
    }
}

mod duration_secs {
    use serde::{Deserialize, Deserializer, Serializer};
    use std::time::Duration;

    pub fn serialize<S: Serializer>(value: &Duration, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_u64(value.as_secs())
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Duration, D::Error> {
        Ok(Duration::from_secs(u64::deserialize(deserializer)?))
    }
}
