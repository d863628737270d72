//! Deployment-method detection.
//!
//! Classifies how a workload was brought into being by inspecting its
//! metadata: Argo CD tracking annotations, Helm release annotations, or an
//! operator's managed-by label. First matching tier wins; each tier carries
//! a fixed confidence, with annotations trusted above labels.

use std::collections::{BTreeMap, HashMap};

use chrono::{DateTime, Utc};
use k8s_openapi::api::apps::v1::{DaemonSet, Deployment, StatefulSet};
use k8s_openapi::api::core::v1::Pod;
use kube::api::Api;
use kube::Resource as KubeResource;
use serde::{Deserialize, Serialize};
use tracing::{debug, info};

use super::cache::DetectionCache;
use crate::cluster::ClusterClient;
use crate::config::DetectionConfig;
use crate::error::{EngineError, Result};
use crate::metrics::MetricsCollector;

/// Annotation carrying the Argo CD application tracking id.
pub const ANNOTATION_GITOPS_TRACKING: &str = "argocd.argoproj.io/tracking-id";
/// Annotation carrying the Argo CD source repository.
pub const ANNOTATION_GITOPS_REPO: &str = "argocd.argoproj.io/repo-url";
/// Annotation naming the owning Argo CD application instance.
pub const ANNOTATION_GITOPS_INSTANCE: &str = "argocd.argoproj.io/instance";
/// Label naming the owning application instance (lower-trust gitops signal).
pub const LABEL_GITOPS_INSTANCE: &str = "app.kubernetes.io/instance";
/// Annotation carrying the Helm release name.
pub const ANNOTATION_HELM_RELEASE: &str = "meta.helm.sh/release-name";
/// Annotation carrying the Helm release namespace.
pub const ANNOTATION_HELM_RELEASE_NAMESPACE: &str = "meta.helm.sh/release-namespace";
/// Label naming the managing controller.
pub const LABEL_MANAGED_BY: &str = "app.kubernetes.io/managed-by";
/// Canonical managed-by value written by the Helm tooling itself.
const HELM_MANAGED_BY_VALUE: &str = "Helm";

/// How a workload was deployed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DeploymentMethod {
    Gitops,
    Package,
    Operator,
    Manual,
    Unknown,
}

impl DeploymentMethod {
    #[must_use]
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Gitops => "gitops",
            Self::Package => "package",
            Self::Operator => "operator",
            Self::Manual => "manual",
            Self::Unknown => "unknown",
        }
    }
}

impl std::fmt::Display for DeploymentMethod {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Result of a deployment-method classification.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DeploymentInfo {
    pub method: DeploymentMethod,
    /// Whether an external controller will overwrite hand edits.
    pub managed: bool,
    /// Source of truth for the deployment (repo URL, `package:<release>`).
    #[serde(skip_serializing_if = "Option::is_none")]
    pub source: Option<String>,
    /// Name of the managing controller or release.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub managed_by: Option<String>,
    pub namespace: String,
    pub resource_name: String,
    pub resource_kind: String,
    /// Classification confidence in `[0, 1]`, monotone per signal tier.
    pub confidence: f64,
    pub detected_at: DateTime<Utc>,
    /// Raw signals that drove the classification.
    pub details: HashMap<String, String>,
}

impl DeploymentInfo {
    fn base(method: DeploymentMethod, namespace: &str, name: &str, kind: &str) -> Self {
        Self {
            method,
            managed: false,
            source: None,
            managed_by: None,
            namespace: namespace.to_string(),
            resource_name: name.to_string(),
            resource_kind: kind.to_string(),
            confidence: 0.0,
            detected_at: Utc::now(),
            details: HashMap::new(),
        }
    }

    /// The fallthrough classification for resources carrying no tool marks.
    #[must_use]
    pub fn manual(namespace: &str, name: &str, kind: &str) -> Self {
        let mut info = Self::base(DeploymentMethod::Manual, namespace, name, kind);
        info.confidence = 0.60;
        info
    }

    /// Classification used when the cluster lookup itself failed and no
    /// metadata was available at all.
    #[must_use]
    pub fn unknown(namespace: &str, name: &str, kind: &str) -> Self {
        Self::base(DeploymentMethod::Unknown, namespace, name, kind)
    }
}

/// Classification seam consumed by the orchestrator.
#[async_trait::async_trait]
pub trait DeploymentClassifier: Send + Sync {
    /// Classify a cluster resource's deployment method.
    async fn classify(&self, namespace: &str, name: &str, kind: &str) -> Result<DeploymentInfo>;
}

#[async_trait::async_trait]
impl DeploymentClassifier for DeploymentDetector {
    async fn classify(&self, namespace: &str, name: &str, kind: &str) -> Result<DeploymentInfo> {
        self.detect_from_cluster(namespace, name, kind).await
    }
}

/// Deployment-method detector with its TTL cache.
pub struct DeploymentDetector {
    cluster: ClusterClient,
    cache: DetectionCache,
    metrics: MetricsCollector,
}

impl DeploymentDetector {
    #[must_use]
    pub fn new(
        cluster: ClusterClient,
        config: &DetectionConfig,
        metrics: MetricsCollector,
    ) -> Self {
        Self {
            cluster,
            cache: DetectionCache::new(config.cache_ttl),
            metrics,
        }
    }

    /// The detector owns its cache; the orchestration layer starts the
    /// sweeper and hands out invalidations through this handle.
    #[must_use]
    pub fn cache(&self) -> &DetectionCache {
        &self.cache
    }

    /// Classify from metadata alone. Never fails.
    #[must_use]
    pub fn detect(
        &self,
        namespace: &str,
        name: &str,
        kind: &str,
        labels: &BTreeMap<String, String>,
        annotations: &BTreeMap<String, String>,
    ) -> DeploymentInfo {
        let info = classify(namespace, name, kind, labels, annotations);
        debug!(
            namespace = %namespace,
            name = %name,
            kind = %kind,
            method = %info.method,
            confidence = info.confidence,
            "Classified deployment method"
        );
        info
    }

    /// Classify by fetching metadata from the cluster, consulting the cache
    /// first.
    ///
    /// # Errors
    ///
    /// `not_found` when the object is absent; `backend_unavailable` when the
    /// API server cannot be reached.
    pub async fn detect_from_cluster(
        &self,
        namespace: &str,
        name: &str,
        kind: &str,
    ) -> Result<DeploymentInfo> {
        if let Some(cached) = self.cache.get(kind, namespace, name).await {
            self.metrics.cache_hit().await;
            return Ok(cached);
        }
        self.metrics.cache_miss().await;

        let (labels, annotations) = self.fetch_metadata(namespace, name, kind).await?;
        let info = self.detect(namespace, name, kind, &labels, &annotations);
        self.cache.set(kind, namespace, name, info.clone()).await;
        info!(
            namespace = %namespace,
            name = %name,
            kind = %kind,
            method = %info.method,
            "Detected deployment method from cluster"
        );
        Ok(info)
    }

    async fn fetch_metadata(
        &self,
        namespace: &str,
        name: &str,
        kind: &str,
    ) -> Result<(BTreeMap<String, String>, BTreeMap<String, String>)> {
        match kind {
            "Deployment" => self.typed_metadata::<Deployment>(namespace, name).await,
            "StatefulSet" => self.typed_metadata::<StatefulSet>(namespace, name).await,
            "DaemonSet" => self.typed_metadata::<DaemonSet>(namespace, name).await,
            "Pod" => self.typed_metadata::<Pod>(namespace, name).await,
            other => self.dynamic_metadata(namespace, name, other).await,
        }
    }

    async fn typed_metadata<K>(
        &self,
        namespace: &str,
        name: &str,
    ) -> Result<(BTreeMap<String, String>, BTreeMap<String, String>)>
    where
        K: kube::Resource<Scope = k8s_openapi::NamespaceResourceScope>
            + Clone
            + serde::de::DeserializeOwned
            + std::fmt::Debug,
        <K as KubeResource>::DynamicType: Default,
    {
        let api: Api<K> = Api::namespaced(self.cluster.kube(), namespace);
        let object = self
            .cluster
            .throttled(name, api.get(name))
            .await
            .map_err(|e| match e {
                EngineError::NotFound { .. } => EngineError::not_found(
                    K::kind(&<K as KubeResource>::DynamicType::default()).as_ref(),
                    name,
                ),
                other => other,
            })?;
        let meta = object.meta();
        Ok((
            meta.labels.clone().unwrap_or_default(),
            meta.annotations.clone().unwrap_or_default(),
        ))
    }

    async fn dynamic_metadata(
        &self,
        namespace: &str,
        name: &str,
        kind: &str,
    ) -> Result<(BTreeMap<String, String>, BTreeMap<String, String>)> {
        let Some((ar, namespaced)) = self.cluster.find_resource_by_kind(kind).await? else {
            return Err(EngineError::not_found(kind, name));
        };
        let api = if namespaced {
            self.cluster.dynamic_api(&ar, namespace)
        } else {
            self.cluster.dynamic_api_all(&ar)
        };
        let object = self.cluster.throttled(name, api.get(name)).await?;
        Ok((
            object.metadata.labels.clone().unwrap_or_default(),
            object.metadata.annotations.clone().unwrap_or_default(),
        ))
    }
}

/// The priority cascade. First match wins.
fn classify(
    namespace: &str,
    name: &str,
    kind: &str,
    labels: &BTreeMap<String, String>,
    annotations: &BTreeMap<String, String>,
) -> DeploymentInfo {
    if let Some(tracking) = annotations.get(ANNOTATION_GITOPS_TRACKING) {
        let mut info = DeploymentInfo::base(DeploymentMethod::Gitops, namespace, name, kind);
        info.managed = true;
        info.confidence = 0.95;
        info.source = annotations.get(ANNOTATION_GITOPS_REPO).cloned();
        info.managed_by = annotations
            .get(ANNOTATION_GITOPS_INSTANCE)
            .cloned()
            .or_else(|| app_name_from_tracking(tracking));
        info.details
            .insert("tracking_id".to_string(), tracking.clone());
        return info;
    }

    if let Some(instance) = labels.get(LABEL_GITOPS_INSTANCE) {
        let mut info = DeploymentInfo::base(DeploymentMethod::Gitops, namespace, name, kind);
        info.managed = true;
        info.confidence = 0.85;
        info.managed_by = Some(instance.clone());
        info.details
            .insert("instance_label".to_string(), instance.clone());
        return info;
    }

    if let Some(release) = annotations.get(ANNOTATION_HELM_RELEASE) {
        let mut info = DeploymentInfo::base(DeploymentMethod::Package, namespace, name, kind);
        info.managed = false;
        info.confidence = 0.90;
        info.source = Some(format!("package:{release}"));
        info.managed_by = Some(release.clone());
        // Releases may be installed into a namespace other than the one the
        // resource lives in.
        if let Some(release_ns) = annotations.get(ANNOTATION_HELM_RELEASE_NAMESPACE) {
            info.namespace = release_ns.clone();
            info.details
                .insert("release_namespace".to_string(), release_ns.clone());
        }
        info.details.insert("release".to_string(), release.clone());
        return info;
    }

    if let Some(manager) = labels.get(LABEL_MANAGED_BY) {
        if manager != HELM_MANAGED_BY_VALUE {
            let mut info = DeploymentInfo::base(DeploymentMethod::Operator, namespace, name, kind);
            info.managed = true;
            info.confidence = 0.80;
            info.managed_by = Some(manager.clone());
            info.details.insert("managed_by".to_string(), manager.clone());
            return info;
        }
    }

    DeploymentInfo::manual(namespace, name, kind)
}

/// Argo CD tracking ids look like `app-name:Group/Kind:namespace/name`.
fn app_name_from_tracking(tracking: &str) -> Option<String> {
    let app = tracking.split(':').next()?.trim();
    if app.is_empty() {
        None
    } else {
        Some(app.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn labels(pairs: &[(&str, &str)]) -> BTreeMap<String, String> {
        pairs
            .iter()
            .map(|(k, v)| ((*k).to_string(), (*v).to_string()))
            .collect()
    }

    #[test]
    fn test_gitops_annotation_wins_with_highest_confidence() {
        let annotations = labels(&[
            (ANNOTATION_GITOPS_TRACKING, "payment:apps/Deployment:prod/payment"),
            (ANNOTATION_GITOPS_REPO, "https://git.example.com/payment.git"),
            (ANNOTATION_HELM_RELEASE, "payment-v3"),
        ]);
        let info = classify("prod", "payment", "Deployment", &BTreeMap::new(), &annotations);

        assert_eq!(info.method, DeploymentMethod::Gitops);
        assert!(info.managed);
        assert_eq!(info.confidence, 0.95);
        assert_eq!(info.source.as_deref(), Some("https://git.example.com/payment.git"));
        assert_eq!(info.managed_by.as_deref(), Some("payment"));
    }

    #[test]
    fn test_gitops_label_tier_lower_confidence() {
        let instance_labels = labels(&[(LABEL_GITOPS_INSTANCE, "payment")]);
        let info = classify("prod", "payment", "Deployment", &instance_labels, &BTreeMap::new());

        assert_eq!(info.method, DeploymentMethod::Gitops);
        assert!(info.managed);
        assert_eq!(info.confidence, 0.85);
        assert_eq!(info.managed_by.as_deref(), Some("payment"));

        // The annotation tier must stay strictly above the label tier.
        let annotations = labels(&[(ANNOTATION_GITOPS_TRACKING, "payment:apps/Deployment:prod/payment")]);
        let stronger = classify("prod", "payment", "Deployment", &BTreeMap::new(), &annotations);
        assert!(stronger.confidence > info.confidence);
    }

    #[test]
    fn test_package_release_with_namespace_override() {
        let annotations = labels(&[
            (ANNOTATION_HELM_RELEASE, "billing-v12"),
            (ANNOTATION_HELM_RELEASE_NAMESPACE, "billing-system"),
        ]);
        let info = classify("prod", "billing", "Deployment", &BTreeMap::new(), &annotations);

        assert_eq!(info.method, DeploymentMethod::Package);
        assert!(!info.managed);
        assert_eq!(info.confidence, 0.90);
        assert_eq!(info.source.as_deref(), Some("package:billing-v12"));
        assert_eq!(info.managed_by.as_deref(), Some("billing-v12"));
        assert_eq!(info.namespace, "billing-system");
    }

    #[test]
    fn test_operator_managed_by_label() {
        let operator_labels = labels(&[(LABEL_MANAGED_BY, "postgres-operator")]);
        let info = classify("prod", "orders-db", "StatefulSet", &operator_labels, &BTreeMap::new());

        assert_eq!(info.method, DeploymentMethod::Operator);
        assert!(info.managed);
        assert_eq!(info.confidence, 0.80);
        assert_eq!(info.managed_by.as_deref(), Some("postgres-operator"));
    }

    #[test]
    fn test_helm_managed_by_label_is_not_operator() {
        // `managed-by: Helm` without release annotations is the tooling's
        // own label; it must not classify as operator-managed.
        let helm_labels = labels(&[(LABEL_MANAGED_BY, "Helm")]);
        let info = classify("prod", "app", "Deployment", &helm_labels, &BTreeMap::new());
        assert_eq!(info.method, DeploymentMethod::Manual);
    }

    #[test]
    fn test_empty_metadata_is_manual() {
        let info = classify("prod", "app", "Deployment", &BTreeMap::new(), &BTreeMap::new());
        assert_eq!(info.method, DeploymentMethod::Manual);
        assert!(!info.managed);
        assert_eq!(info.confidence, 0.60);
    }

    #[test]
    fn test_confidence_always_in_unit_interval() {
        let cases = [
            classify("p", "a", "Deployment", &BTreeMap::new(), &BTreeMap::new()),
            classify(
                "p",
                "a",
                "Deployment",
                &labels(&[(LABEL_GITOPS_INSTANCE, "x")]),
                &BTreeMap::new(),
            ),
            classify(
                "p",
                "a",
                "Deployment",
                &BTreeMap::new(),
                &labels(&[(ANNOTATION_HELM_RELEASE, "r")]),
            ),
        ];
        for info in cases {
            assert!((0.0..=1.0).contains(&info.confidence));
        }
    }

    #[test]
    fn test_tracking_id_app_name_extraction() {
        assert_eq!(
            app_name_from_tracking("payment:apps/Deployment:prod/payment").as_deref(),
            Some("payment")
        );
        assert_eq!(app_name_from_tracking(":x").as_deref(), None);
    }
}
