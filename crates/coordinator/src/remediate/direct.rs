//! Direct remediation for manually deployed workloads.
//!
//! The last resort when no deployment tool owns the workload: act on the
//! pods themselves and let the owning controller (if any) reconcile.
//! Issues the engine refuses to auto-remediate come back as advisory
//! failures.

use async_trait::async_trait;
use k8s_openapi::api::core::v1::Pod;
use kube::api::{Api, DeleteParams, ListParams};
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use super::{IssueContext, RemediationOutcome, Remediator};
use crate::cluster::ClusterClient;
use crate::detect::deployment::DeploymentInfo;
use crate::error::{EngineError, Result};

/// Remediator acting directly on pods.
pub struct DirectRemediator {
    cluster: ClusterClient,
}

impl DirectRemediator {
    #[must_use]
    pub fn new(cluster: ClusterClient) -> Self {
        Self { cluster }
    }

    /// Delete the pods behind the issue's resource. A pod reference deletes
    /// that pod; a workload reference deletes its name-prefixed pods.
    async fn delete_target_pods(&self, issue: &IssueContext) -> Result<Vec<String>> {
        let pods: Api<Pod> = Api::namespaced(self.cluster.kube(), &issue.namespace);

        let names: Vec<String> = if issue.resource_kind == "Pod" {
            vec![issue.resource_name.clone()]
        } else {
            let list = self
                .cluster
                .throttled("pods", pods.list(&ListParams::default()))
                .await?;
            // Workload pods inherit their owner's name as a prefix.
            let prefix = format!("{}-", issue.resource_name);
            list.items
                .into_iter()
                .filter_map(|p| p.metadata.name)
                .filter(|name| name.starts_with(&prefix))
                .collect()
        };

        if names.is_empty() {
            return Err(EngineError::not_found("pod", &issue.resource_name));
        }

        for name in &names {
            self.cluster
                .throttled(name, pods.delete(name, &DeleteParams::default()))
                .await?;
            info!(pod = %name, namespace = %issue.namespace, "Deleted pod for controller recreate");
        }
        Ok(names)
    }
}

#[async_trait]
impl Remediator for DirectRemediator {
    fn name(&self) -> &'static str {
        "direct"
    }

    fn can_remediate(&self, _info: &DeploymentInfo) -> bool {
        // Direct remediation is the universal fallback.
        true
    }

    async fn remediate(
        &self,
        cancel: &CancellationToken,
        _info: &DeploymentInfo,
        issue: &IssueContext,
    ) -> Result<RemediationOutcome> {
        if cancel.is_cancelled() {
            return Err(EngineError::Timeout(
                "direct remediation cancelled".to_string(),
            ));
        }

        match issue.issue_type.as_str() {
            "crash_loop" => {
                let deleted = self.delete_target_pods(issue).await?;
                Ok(RemediationOutcome {
                    actions: deleted.iter().map(|p| format!("delete_pod:{p}")).collect(),
                    advisory: None,
                })
            }
            "image_pull_backoff" => {
                // A broken image reference will pull-fail again on recreate;
                // restarting only burns registry quota.
                warn!(
                    resource = %issue.resource_name,
                    namespace = %issue.namespace,
                    "Image pull failure needs a corrected image reference"
                );
                Err(EngineError::ManualInterventionRequired(format!(
                    "image pull failure for {}/{}: verify the image reference and registry credentials",
                    issue.namespace, issue.resource_name
                )))
            }
            "oom_killed" => {
                let deleted = self.delete_target_pods(issue).await?;
                let mut outcome = RemediationOutcome {
                    actions: deleted.iter().map(|p| format!("delete_pod:{p}")).collect(),
                    advisory: Some(format!(
                        "pods of {}/{} were OOM killed; raise the container memory limit",
                        issue.namespace, issue.resource_name
                    )),
                };
                outcome.push("advise_memory_limit");
                Ok(outcome)
            }
            other => {
                info!(issue_type = %other, "Generic restart for unclassified issue");
                let deleted = self.delete_target_pods(issue).await?;
                Ok(RemediationOutcome {
                    actions: deleted.iter().map(|p| format!("delete_pod:{p}")).collect(),
                    advisory: None,
                })
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::ClusterConfig;

    fn issue(issue_type: &str) -> IssueContext {
        IssueContext {
            issue_type: issue_type.to_string(),
            description: String::new(),
            severity: "high".to_string(),
            namespace: "prod".to_string(),
            resource_kind: "Pod".to_string(),
            resource_name: "app-1".to_string(),
        }
    }

    fn remediator() -> DirectRemediator {
        // Client construction is lazy; no cluster traffic happens in these
        // tests because the paths under test fail before any call.
        let config = kube::Config::new("http://localhost:1".parse().unwrap());
        let client = kube::Client::try_from(config).unwrap();
        DirectRemediator::new(ClusterClient::from_client(
            client,
            &ClusterConfig {
                qps: 50,
                burst: 100,
                request_timeout: std::time::Duration::from_millis(100),
            },
        ))
    }

    #[tokio::test]
    async fn test_image_pull_backoff_is_advisory_failure() {
        let err = remediator()
            .remediate(
                &CancellationToken::new(),
                &DeploymentInfo::manual("prod", "app-1", "Pod"),
                &issue("image_pull_backoff"),
            )
            .await
            .unwrap_err();
        assert_eq!(err.code(), "manual_intervention_required");
        assert!(err.to_string().contains("image reference"));
    }

    #[tokio::test]
    async fn test_cancelled_before_start() {
        let cancel = CancellationToken::new();
        cancel.cancel();
        let err = remediator()
            .remediate(
                &cancel,
                &DeploymentInfo::manual("prod", "app-1", "Pod"),
                &issue("crash_loop"),
            )
            .await
            .unwrap_err();
        assert_eq!(err.code(), "timeout");
    }

    #[tokio::test]
    async fn test_direct_accepts_any_method() {
        let remediator = remediator();
        let mut info = DeploymentInfo::manual("prod", "app", "Deployment");
        assert!(remediator.can_remediate(&info));
        info.method = crate::detect::deployment::DeploymentMethod::Unknown;
        assert!(remediator.can_remediate(&info));
    }
}
