//! Internal adapters for non-application layers.
//!
//! Application-layer steps go through the selected remediator; steps on the
//! infrastructure and platform layers act through these adapters instead.
//! The engine observes infrastructure (machine-config rollout, node
//! readiness) rather than authoring it, and restarts platform operators by
//! deleting their pods so the deployment controller recreates them.

use std::time::Duration;

use async_trait::async_trait;
use k8s_openapi::api::core::v1::{Node, Pod};
use kube::api::{Api, DeleteParams, ListParams};
use kube::core::GroupVersionKind;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::cluster::{nested_array, nested_str, ClusterClient};
use crate::detect::layers::{Layer, LayeredIssue};
use crate::error::{EngineError, Result};
use crate::plan::RemediationStep;
use crate::remediate::RemediationOutcome;

/// Interval between rollout-state polls.
const ROLLOUT_POLL_INTERVAL: Duration = Duration::from_secs(15);

/// Executes infrastructure- and platform-layer steps.
#[async_trait]
pub trait InternalAdapter: Send + Sync {
    /// Run a non-application step.
    async fn execute(
        &self,
        cancel: &CancellationToken,
        step: &RemediationStep,
        issue: &LayeredIssue,
    ) -> Result<RemediationOutcome>;

    /// Best-effort inverse of a non-application step.
    async fn rollback(
        &self,
        cancel: &CancellationToken,
        step: &RemediationStep,
        issue: &LayeredIssue,
    ) -> Result<RemediationOutcome>;
}

/// Production adapter acting on the cluster.
pub struct ClusterAdapter {
    cluster: ClusterClient,
    mco_stability_timeout: Duration,
}

impl ClusterAdapter {
    #[must_use]
    pub fn new(cluster: ClusterClient, mco_stability_timeout: Duration) -> Self {
        Self {
            cluster,
            mco_stability_timeout,
        }
    }

    /// Wait until every node reports ready, bounded by the stability
    /// timeout.
    async fn wait_nodes_ready(&self, cancel: &CancellationToken) -> Result<()> {
        let deadline = tokio::time::Instant::now() + self.mco_stability_timeout;
        let nodes: Api<Node> = Api::all(self.cluster.kube());

        loop {
            let list = self
                .cluster
                .throttled("nodes", nodes.list(&ListParams::default()))
                .await?;
            let not_ready: Vec<String> = list
                .items
                .iter()
                .filter(|node| {
                    !node
                        .status
                        .as_ref()
                        .and_then(|s| s.conditions.as_ref())
                        .and_then(|c| c.iter().find(|c| c.type_ == "Ready"))
                        .is_some_and(|c| c.status == "True")
                })
                .filter_map(|node| node.metadata.name.clone())
                .collect();

            if not_ready.is_empty() {
                return Ok(());
            }
            debug!(pending = ?not_ready, "Nodes not ready yet");

            if tokio::time::Instant::now() + ROLLOUT_POLL_INTERVAL > deadline {
                return Err(EngineError::Timeout(format!(
                    "node rollout; still not ready: {}",
                    not_ready.join(", ")
                )));
            }
            tokio::select! {
                () = cancel.cancelled() => {
                    return Err(EngineError::Timeout("node rollout wait cancelled".to_string()));
                }
                () = tokio::time::sleep(ROLLOUT_POLL_INTERVAL) => {}
            }
        }
    }

    /// Wait until machine config pools converge (all `Updated`, none
    /// `Degraded`). Clusters without the machine-config operator pass
    /// trivially.
    async fn wait_machine_config_converged(&self, cancel: &CancellationToken) -> Result<()> {
        let gvk = GroupVersionKind::gvk(
            "machineconfiguration.openshift.io",
            "v1",
            "MachineConfigPool",
        );
        let Ok((ar, _)) = self.cluster.resource_for(&gvk).await else {
            debug!("MachineConfigPool not served, config convergence is a no-op");
            return Ok(());
        };
        let api = self.cluster.dynamic_api_all(&ar);
        let deadline = tokio::time::Instant::now() + self.mco_stability_timeout;

        loop {
            let pools = self
                .cluster
                .throttled("machineconfigpools", api.list(&ListParams::default()))
                .await?;

            let mut pending = Vec::new();
            for pool in &pools.items {
                let name = pool.metadata.name.clone().unwrap_or_default();
                if pool_condition(&pool.data, "Degraded")? == Some(true) {
                    return Err(EngineError::SyncFailed(format!(
                        "machine config pool {name} degraded during rollout"
                    )));
                }
                if pool_condition(&pool.data, "Updated")? != Some(true) {
                    pending.push(name);
                }
            }

            if pending.is_empty() {
                return Ok(());
            }
            debug!(pending = ?pending, "Machine config pools still updating");

            if tokio::time::Instant::now() + ROLLOUT_POLL_INTERVAL > deadline {
                return Err(EngineError::Timeout(format!(
                    "machine config convergence; pools still updating: {}",
                    pending.join(", ")
                )));
            }
            tokio::select! {
                () = cancel.cancelled() => {
                    return Err(EngineError::Timeout(
                        "machine config convergence wait cancelled".to_string(),
                    ));
                }
                () = tokio::time::sleep(ROLLOUT_POLL_INTERVAL) => {}
            }
        }
    }

    /// Restart the operators behind the issue's platform resources by
    /// deleting their pods. Without namespaced platform resources there is
    /// nothing safe to restart; the step degrades to an observation.
    async fn restart_platform_operators(&self, issue: &LayeredIssue) -> Result<RemediationOutcome> {
        let mut outcome = RemediationOutcome::default();
        let platform_resources = issue
            .impacted_resources
            .get(&Layer::Platform)
            .map(Vec::as_slice)
            .unwrap_or_default();

        let mut acted = false;
        for resource in platform_resources {
            if resource.namespace.is_empty() {
                continue;
            }
            let pods: Api<Pod> = Api::namespaced(self.cluster.kube(), &resource.namespace);
            let list = self
                .cluster
                .throttled("pods", pods.list(&ListParams::default()))
                .await?;
            let prefix = format!("{}-", resource.name);
            for pod in list.items {
                let Some(pod_name) = pod.metadata.name else {
                    continue;
                };
                if !pod_name.starts_with(&prefix) && pod_name != resource.name {
                    continue;
                }
                self.cluster
                    .throttled(&pod_name, pods.delete(&pod_name, &DeleteParams::default()))
                    .await?;
                info!(
                    pod = %pod_name,
                    namespace = %resource.namespace,
                    "Deleted operator pod for restart"
                );
                outcome.push(&format!("delete_pod:{pod_name}"));
                acted = true;
            }
        }

        if !acted {
            debug!("No namespaced platform resources; operator restart degraded to observation");
            outcome.push("observe_platform_operators");
        }
        Ok(outcome)
    }
}

fn pool_condition(data: &serde_json::Value, condition: &str) -> Result<Option<bool>> {
    let Some(conditions) = nested_array(data, &["status", "conditions"])? else {
        return Ok(None);
    };
    for entry in conditions {
        if nested_str(entry, &["type"])? == Some(condition) {
            return Ok(nested_str(entry, &["status"])?.map(|s| s == "True"));
        }
    }
    Ok(None)
}

#[async_trait]
impl InternalAdapter for ClusterAdapter {
    async fn execute(
        &self,
        cancel: &CancellationToken,
        step: &RemediationStep,
        issue: &LayeredIssue,
    ) -> Result<RemediationOutcome> {
        match step.action_type.as_str() {
            "monitor_node_rollout" => {
                self.wait_nodes_ready(cancel).await?;
                Ok(RemediationOutcome::action("nodes_ready"))
            }
            "apply_infra_config" => {
                // Configuration authoring stays with the machine-config
                // operator; the engine waits for its rollout to converge.
                self.wait_machine_config_converged(cancel).await?;
                Ok(RemediationOutcome::action("machine_config_converged"))
            }
            "restart_operator" => self.restart_platform_operators(issue).await,
            other => Err(EngineError::Validation(format!(
                "internal adapter has no action {other}"
            ))),
        }
    }

    async fn rollback(
        &self,
        _cancel: &CancellationToken,
        step: &RemediationStep,
        _issue: &LayeredIssue,
    ) -> Result<RemediationOutcome> {
        // Node rollouts and operator restarts have no meaningful inverse;
        // the cluster converges forward. Record the observation.
        warn!(
            action = %step.action_type,
            target = %step.target,
            "Rolling back non-application step as observation only"
        );
        Ok(RemediationOutcome::action("observe"))
    }
}
