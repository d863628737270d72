//! Layer-specific readiness probes.
//!
//! Each checkpoint runs its layer's probes sequentially against live
//! cluster state; the first failing probe aborts the checkpoint with its
//! reason. A per-checkpoint deadline bounds the whole set.

use k8s_openapi::api::core::v1::{Endpoints, Node, PersistentVolume, Service};
use kube::api::{Api, ListParams};
use kube::core::GroupVersionKind;
use tracing::{debug, info};

use crate::cluster::{nested_array, nested_str, ClusterClient};
use crate::error::{EngineError, Result};
use crate::plan::HealthCheckpoint;

/// Outcome of one checkpoint.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CheckpointVerdict {
    Passed,
    Failed { probe: String, reason: String },
}

impl CheckpointVerdict {
    #[must_use]
    pub fn failed(probe: &str, reason: impl Into<String>) -> Self {
        Self::Failed {
            probe: probe.to_string(),
            reason: reason.into(),
        }
    }
}

/// Runs readiness probes against the cluster.
pub struct HealthChecker {
    cluster: ClusterClient,
}

impl HealthChecker {
    #[must_use]
    pub fn new(cluster: ClusterClient) -> Self {
        Self { cluster }
    }

    /// Run a checkpoint's probes in order, under its deadline.
    ///
    /// Probe falsity is a verdict; only infrastructure trouble (API server
    /// unreachable, deadline elapsed) is an error.
    pub async fn run_checkpoint(
        &self,
        checkpoint: &HealthCheckpoint,
        namespace: &str,
    ) -> Result<CheckpointVerdict> {
        let layer = checkpoint.layer;
        let verdict = tokio::time::timeout(checkpoint.timeout, async {
            for probe in &checkpoint.checks {
                let result = self.run_probe(probe, namespace).await?;
                if let CheckpointVerdict::Failed { probe, reason } = result {
                    info!(layer = %layer, probe = %probe, reason = %reason, "Checkpoint probe failed");
                    return Ok::<CheckpointVerdict, EngineError>(CheckpointVerdict::Failed { probe, reason });
                }
                debug!(layer = %layer, probe = %probe, "Checkpoint probe passed");
            }
            Ok(CheckpointVerdict::Passed)
        })
        .await
        .map_err(|_| EngineError::Timeout(format!("checkpoint for layer {layer}")))??;

        Ok(verdict)
    }

    async fn run_probe(&self, probe: &str, namespace: &str) -> Result<CheckpointVerdict> {
        match probe {
            "nodes-ready" => self.probe_nodes_ready().await,
            "infra-stable" => self.probe_infra_stable().await,
            "storage-available" => self.probe_storage_available().await,
            "operators-ready" => self.probe_operators_ready().await,
            "networking-functional" => self.probe_networking().await,
            "ingress-available" => self.probe_ingress().await,
            "pods-running" => self.probe_pods_running(namespace).await,
            "endpoints-healthy" => self.probe_endpoints_healthy(namespace).await,
            "services-responding" => self.probe_services_responding(namespace).await,
            unknown => Err(EngineError::Validation(format!("unknown probe {unknown}"))),
        }
    }

    async fn probe_nodes_ready(&self) -> Result<CheckpointVerdict> {
        let nodes: Api<Node> = Api::all(self.cluster.kube());
        let list = self
            .cluster
            .throttled("nodes", nodes.list(&ListParams::default()))
            .await?;
        Ok(nodes_ready(&list.items))
    }

    async fn probe_infra_stable(&self) -> Result<CheckpointVerdict> {
        let gvk = GroupVersionKind::gvk(
            "machineconfiguration.openshift.io",
            "v1",
            "MachineConfigPool",
        );
        let Ok((ar, _)) = self.cluster.resource_for(&gvk).await else {
            // No machine-config operator on this cluster; nothing to wait on.
            debug!("MachineConfigPool not served, skipping infra-stable probe");
            return Ok(CheckpointVerdict::Passed);
        };
        let api = self.cluster.dynamic_api_all(&ar);
        let pools = self
            .cluster
            .throttled("machineconfigpools", api.list(&ListParams::default()))
            .await?;

        for pool in &pools.items {
            let name = pool.metadata.name.clone().unwrap_or_default();
            let data = serde_json::to_value(&pool.data)?;
            if condition_status(&data, "Degraded")? == Some(true) {
                return Ok(CheckpointVerdict::failed(
                    "infra-stable",
                    format!("machine config pool {name} is degraded"),
                ));
            }
            if condition_status(&data, "Updated")? == Some(false) {
                return Ok(CheckpointVerdict::failed(
                    "infra-stable",
                    format!("machine config pool {name} is still updating"),
                ));
            }
        }
        Ok(CheckpointVerdict::Passed)
    }

    async fn probe_storage_available(&self) -> Result<CheckpointVerdict> {
        let volumes: Api<PersistentVolume> = Api::all(self.cluster.kube());
        let list = self
            .cluster
            .throttled("persistentvolumes", volumes.list(&ListParams::default()))
            .await?;
        for volume in &list.items {
            let phase = volume
                .status
                .as_ref()
                .and_then(|s| s.phase.as_deref())
                .unwrap_or_default();
            if phase == "Failed" {
                let name = volume.metadata.name.clone().unwrap_or_default();
                return Ok(CheckpointVerdict::failed(
                    "storage-available",
                    format!("persistent volume {name} is in phase Failed"),
                ));
            }
        }
        Ok(CheckpointVerdict::Passed)
    }

    async fn probe_operators_ready(&self) -> Result<CheckpointVerdict> {
        let gvk = GroupVersionKind::gvk("config.openshift.io", "v1", "ClusterOperator");
        let Ok((ar, _)) = self.cluster.resource_for(&gvk).await else {
            debug!("ClusterOperator not served, skipping operators-ready probe");
            return Ok(CheckpointVerdict::Passed);
        };
        let api = self.cluster.dynamic_api_all(&ar);
        let operators = self
            .cluster
            .throttled("clusteroperators", api.list(&ListParams::default()))
            .await?;

        for operator in &operators.items {
            let name = operator.metadata.name.clone().unwrap_or_default();
            let data = serde_json::to_value(&operator.data)?;
            if condition_status(&data, "Available")? == Some(false) {
                return Ok(CheckpointVerdict::failed(
                    "operators-ready",
                    format!("cluster operator {name} is unavailable"),
                ));
            }
            if condition_status(&data, "Degraded")? == Some(true) {
                return Ok(CheckpointVerdict::failed(
                    "operators-ready",
                    format!("cluster operator {name} is degraded"),
                ));
            }
        }
        Ok(CheckpointVerdict::Passed)
    }

    async fn probe_networking(&self) -> Result<CheckpointVerdict> {
        let nodes: Api<Node> = Api::all(self.cluster.kube());
        let list = self
            .cluster
            .throttled("nodes", nodes.list(&ListParams::default()))
            .await?;
        Ok(network_available(&list.items))
    }

    async fn probe_ingress(&self) -> Result<CheckpointVerdict> {
        let gvk = GroupVersionKind::gvk("config.openshift.io", "v1", "ClusterOperator");
        let Ok((ar, _)) = self.cluster.resource_for(&gvk).await else {
            debug!("ClusterOperator not served, skipping ingress-available probe");
            return Ok(CheckpointVerdict::Passed);
        };
        let api = self.cluster.dynamic_api_all(&ar);
        match self.cluster.throttled("ingress", api.get("ingress")).await {
            Ok(operator) => {
                let data = serde_json::to_value(&operator.data)?;
                if condition_status(&data, "Available")? == Some(false) {
                    return Ok(CheckpointVerdict::failed(
                        "ingress-available",
                        "ingress cluster operator is unavailable",
                    ));
                }
                Ok(CheckpointVerdict::Passed)
            }
            Err(EngineError::NotFound { .. }) => Ok(CheckpointVerdict::Passed),
            Err(e) => Err(e),
        }
    }

    async fn probe_pods_running(&self, namespace: &str) -> Result<CheckpointVerdict> {
        let pods: Api<k8s_openapi::api::core::v1::Pod> =
            Api::namespaced(self.cluster.kube(), namespace);
        let list = self
            .cluster
            .throttled("pods", pods.list(&ListParams::default()))
            .await?;

        for pod in &list.items {
            let phase = pod
                .status
                .as_ref()
                .and_then(|s| s.phase.as_deref())
                .unwrap_or_default();
            if !matches!(phase, "Running" | "Succeeded") {
                let name = pod.metadata.name.clone().unwrap_or_default();
                return Ok(CheckpointVerdict::failed(
                    "pods-running",
                    format!("pod {namespace}/{name} is in phase {phase}"),
                ));
            }
        }
        Ok(CheckpointVerdict::Passed)
    }

    async fn probe_endpoints_healthy(&self, namespace: &str) -> Result<CheckpointVerdict> {
        let endpoints: Api<Endpoints> = Api::namespaced(self.cluster.kube(), namespace);
        let list = self
            .cluster
            .throttled("endpoints", endpoints.list(&ListParams::default()))
            .await?;

        for endpoint in &list.items {
            let Some(subsets) = &endpoint.subsets else {
                continue;
            };
            let has_ready = subsets
                .iter()
                .any(|s| s.addresses.as_ref().is_some_and(|a| !a.is_empty()));
            if !has_ready {
                let name = endpoint.metadata.name.clone().unwrap_or_default();
                return Ok(CheckpointVerdict::failed(
                    "endpoints-healthy",
                    format!("endpoints {namespace}/{name} has no ready addresses"),
                ));
            }
        }
        Ok(CheckpointVerdict::Passed)
    }

    async fn probe_services_responding(&self, namespace: &str) -> Result<CheckpointVerdict> {
        let services: Api<Service> = Api::namespaced(self.cluster.kube(), namespace);
        let endpoints: Api<Endpoints> = Api::namespaced(self.cluster.kube(), namespace);

        let service_list = self
            .cluster
            .throttled("services", services.list(&ListParams::default()))
            .await?;
        let endpoint_list = self
            .cluster
            .throttled("endpoints", endpoints.list(&ListParams::default()))
            .await?;

        let endpoint_names: std::collections::HashSet<_> = endpoint_list
            .items
            .iter()
            .filter_map(|e| e.metadata.name.clone())
            .collect();

        for service in &service_list.items {
            // Selector-less and headless services resolve out of band.
            let has_selector = service
                .spec
                .as_ref()
                .and_then(|s| s.selector.as_ref())
                .is_some_and(|s| !s.is_empty());
            if !has_selector {
                continue;
            }
            let name = service.metadata.name.clone().unwrap_or_default();
            if !endpoint_names.contains(&name) {
                return Ok(CheckpointVerdict::failed(
                    "services-responding",
                    format!("service {namespace}/{name} has no endpoints object"),
                ));
            }
        }
        Ok(CheckpointVerdict::Passed)
    }
}

/// All nodes report a `Ready=True` condition.
fn nodes_ready(nodes: &[Node]) -> CheckpointVerdict {
    for node in nodes {
        let name = node.metadata.name.clone().unwrap_or_default();
        let ready = node
            .status
            .as_ref()
            .and_then(|s| s.conditions.as_ref())
            .and_then(|conditions| conditions.iter().find(|c| c.type_ == "Ready"))
            .is_some_and(|c| c.status == "True");
        if !ready {
            return CheckpointVerdict::failed("nodes-ready", format!("node {name} is not ready"));
        }
    }
    CheckpointVerdict::Passed
}

/// No node reports `NetworkUnavailable=True`.
fn network_available(nodes: &[Node]) -> CheckpointVerdict {
    for node in nodes {
        let name = node.metadata.name.clone().unwrap_or_default();
        let unavailable = node
            .status
            .as_ref()
            .and_then(|s| s.conditions.as_ref())
            .and_then(|conditions| {
                conditions.iter().find(|c| c.type_ == "NetworkUnavailable")
            })
            .is_some_and(|c| c.status == "True");
        if unavailable {
            return CheckpointVerdict::failed(
                "networking-functional",
                format!("node {name} reports network unavailable"),
            );
        }
    }
    CheckpointVerdict::Passed
}

/// Read a `status.conditions[type=...]` entry from an untyped object.
/// `Ok(None)` when the condition is absent.
fn condition_status(data: &serde_json::Value, condition: &str) -> Result<Option<bool>> {
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
