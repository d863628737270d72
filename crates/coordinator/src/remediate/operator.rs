//! Operator remediation via custom-resource touch.
//!
//! Walks a pod's owner references past the standard workload controllers to
//! the custom resource that ultimately owns it, then writes a
//! reconciliation-trigger annotation so the operator re-reconciles. The
//! walk is bounded and cycle-safe; with no custom-resource owner the
//! adapter reports `owner_cr_not_found` so the caller can fall back.

use std::collections::HashSet;

use async_trait::async_trait;
use chrono::Utc;
use k8s_openapi::api::apps::v1::{DaemonSet, Deployment, ReplicaSet, StatefulSet};
use k8s_openapi::api::batch::v1::{CronJob, Job};
use k8s_openapi::api::core::v1::Pod;
use k8s_openapi::apimachinery::pkg::apis::meta::v1::OwnerReference;
use kube::api::{Api, Patch, PatchParams};
use kube::core::GroupVersionKind;
use kube::Resource as KubeResource;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

use super::{IssueContext, RemediationOutcome, Remediator};
use crate::cluster::ClusterClient;
use crate::detect::deployment::{DeploymentInfo, DeploymentMethod};
use crate::error::{EngineError, Result};

/// Annotation whose timestamp update triggers operator reconciliation.
pub const REMEDIATE_ANNOTATION: &str = "coordination.engine/remediate-at";

/// Workload controllers the walk passes through on its way to a custom
/// resource.
fn is_intermediate(kind: &str) -> bool {
    matches!(
        kind,
        "ReplicaSet" | "Deployment" | "StatefulSet" | "DaemonSet" | "Job" | "CronJob"
    )
}

/// The owner to follow: the controller reference when present, otherwise
/// the first.
fn next_owner(refs: &[OwnerReference]) -> Option<&OwnerReference> {
    refs.iter()
        .find(|r| r.controller.unwrap_or(false))
        .or_else(|| refs.first())
}

/// Split an `apiVersion` into group and version. Core resources carry no
/// group.
fn parse_api_version(api_version: &str) -> (String, String) {
    match api_version.split_once('/') {
        Some((group, version)) => (group.to_string(), version.to_string()),
        None => (String::new(), api_version.to_string()),
    }
}

/// Remediator for operator-managed workloads.
pub struct OperatorRemediator {
    cluster: ClusterClient,
    max_owner_depth: usize,
}

impl OperatorRemediator {
    #[must_use]
    pub fn new(cluster: ClusterClient, max_owner_depth: usize) -> Self {
        Self {
            cluster,
            max_owner_depth,
        }
    }

    /// Walk owner references from the pod up to a custom resource.
    async fn find_custom_resource_owner(
        &self,
        namespace: &str,
        pod_name: &str,
    ) -> Result<OwnerReference> {
        let pods: Api<Pod> = Api::namespaced(self.cluster.kube(), namespace);
        let pod = self.cluster.throttled(pod_name, pods.get(pod_name)).await?;

        let mut refs = pod.metadata.owner_references.unwrap_or_default();
        let mut visited: HashSet<(String, String)> = HashSet::new();

        for depth in 0..self.max_owner_depth {
            let Some(owner) = next_owner(&refs).cloned() else {
                debug!(pod = %pod_name, depth, "Owner chain ended without a custom resource");
                return Err(EngineError::OwnerCrNotFound(pod_name.to_string()));
            };

            if !visited.insert((owner.kind.clone(), owner.name.clone())) {
                debug!(pod = %pod_name, kind = %owner.kind, name = %owner.name, "Owner cycle detected");
                return Err(EngineError::OwnerCrNotFound(pod_name.to_string()));
            }

            if !is_intermediate(&owner.kind) {
                return Ok(owner);
            }

            refs = self
                .intermediate_owner_refs(namespace, &owner.kind, &owner.name)
                .await?;
        }

        debug!(pod = %pod_name, "Owner walk exhausted its depth limit");
        Err(EngineError::OwnerCrNotFound(pod_name.to_string()))
    }

    async fn intermediate_owner_refs(
        &self,
        namespace: &str,
        kind: &str,
        name: &str,
    ) -> Result<Vec<OwnerReference>> {
        match kind {
            "ReplicaSet" => self.owner_refs_of::<ReplicaSet>(namespace, name).await,
            "Deployment" => self.owner_refs_of::<Deployment>(namespace, name).await,
            "StatefulSet" => self.owner_refs_of::<StatefulSet>(namespace, name).await,
            "DaemonSet" => self.owner_refs_of::<DaemonSet>(namespace, name).await,
            "Job" => self.owner_refs_of::<Job>(namespace, name).await,
            "CronJob" => self.owner_refs_of::<CronJob>(namespace, name).await,
            other => Err(EngineError::Validation(format!(
                "unexpected intermediate kind {other}"
            ))),
        }
    }

    async fn owner_refs_of<K>(&self, namespace: &str, name: &str) -> Result<Vec<OwnerReference>>
    where
        K: kube::Resource<Scope = k8s_openapi::NamespaceResourceScope>
            + Clone
            + serde::de::DeserializeOwned
            + std::fmt::Debug,
        <K as KubeResource>::DynamicType: Default,
    {
        let api: Api<K> = Api::namespaced(self.cluster.kube(), namespace);
        let object = self.cluster.throttled(name, api.get(name)).await?;
        Ok(object.meta().owner_references.clone().unwrap_or_default())
    }

    /// Touch the custom resource with a fresh reconciliation-trigger
    /// annotation through the dynamic API.
    async fn touch_custom_resource(
        &self,
        namespace: &str,
        owner: &OwnerReference,
    ) -> Result<()> {
        let (group, version) = parse_api_version(&owner.api_version);
        let gvk = GroupVersionKind::gvk(&group, &version, &owner.kind);
        let (ar, caps) = self.cluster.resource_for(&gvk).await?;

        let api = if caps.scope == kube::discovery::Scope::Namespaced {
            self.cluster.dynamic_api(&ar, namespace)
        } else {
            self.cluster.dynamic_api_all(&ar)
        };

        let patch = serde_json::json!({
            "metadata": {
                "annotations": {
                    REMEDIATE_ANNOTATION: Utc::now().to_rfc3339(),
                }
            }
        });

        self.cluster
            .throttled(
                &owner.name,
                api.patch(&owner.name, &PatchParams::default(), &Patch::Merge(&patch)),
            )
            .await?;

        info!(
            kind = %owner.kind,
            name = %owner.name,
            namespace = %namespace,
            "Touched custom resource to trigger reconciliation"
        );
        Ok(())
    }

    /// Resolve the pod to act on: the issue's resource when it is a pod.
    fn pod_of(issue: &IssueContext) -> Result<&str> {
        if issue.resource_kind == "Pod" {
            Ok(&issue.resource_name)
        } else {
            Err(EngineError::Validation(format!(
                "operator remediation needs a pod reference, got {}",
                issue.resource_kind
            )))
        }
    }
}

#[async_trait]
impl Remediator for OperatorRemediator {
    fn name(&self) -> &'static str {
        "operator"
    }

    fn can_remediate(&self, info: &DeploymentInfo) -> bool {
        info.method == DeploymentMethod::Operator
    }

    async fn remediate(
        &self,
        cancel: &CancellationToken,
        _info: &DeploymentInfo,
        issue: &IssueContext,
    ) -> Result<RemediationOutcome> {
        if cancel.is_cancelled() {
            return Err(EngineError::Timeout(
                "operator remediation cancelled".to_string(),
            ));
        }

        let pod = Self::pod_of(issue)?;
        let owner = self
            .find_custom_resource_owner(&issue.namespace, pod)
            .await?;

        self.touch_custom_resource(&issue.namespace, &owner).await?;

        let mut outcome = RemediationOutcome::action("walk_owner_references");
        outcome.push("touch_custom_resource");
        outcome.advisory = Some(format!(
            "triggered reconciliation of {}/{}",
            owner.kind, owner.name
        ));
        Ok(outcome)
    }
}
