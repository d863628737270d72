//! Package remediation through the Helm CLI.
//!
//! Helm is driven as an opaque command with structured (JSON) output. A
//! failed or superseded release rolls back to its previous revision; a
//! release in any other state is redeployed with its prior values under
//! atomic+wait semantics.

use std::time::Duration;

use async_trait::async_trait;
use serde::Deserialize;
use tokio::process::Command;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

use super::{IssueContext, RemediationOutcome, Remediator};
use crate::detect::deployment::{DeploymentInfo, DeploymentMethod};
use crate::error::{EngineError, Result};

/// Release status as reported by the package tool.
#[derive(Debug, Clone, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "kebab-case")]
pub enum ReleaseStatus {
    Deployed,
    Failed,
    Superseded,
    PendingInstall,
    PendingUpgrade,
    PendingRollback,
    Uninstalling,
    Uninstalled,
    #[serde(other)]
    Unknown,
}

impl ReleaseStatus {
    /// Whether the release needs a rollback rather than a redeploy.
    #[must_use]
    pub fn needs_rollback(&self) -> bool {
        matches!(self, Self::Failed | Self::Superseded)
    }
}

/// Release metadata consumed before an upgrade.
#[derive(Debug, Clone, Deserialize)]
pub struct ReleaseMetadata {
    pub chart: String,
    pub version: String,
    pub revision: u32,
    pub status: ReleaseStatus,
}

/// Backend contract over the package tool. The CLI implementation is the
/// production one; tests mock this seam.
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait PackageBackend: Send + Sync {
    /// Current status of a release.
    async fn status(&self, release: &str, namespace: &str) -> Result<ReleaseStatus>;

    /// Chart and revision metadata of a release.
    async fn metadata(&self, release: &str, namespace: &str) -> Result<ReleaseMetadata>;

    /// Roll back to the previous revision, waiting for resources.
    async fn rollback(&self, release: &str, namespace: &str) -> Result<()>;

    /// Redeploy reusing prior values, atomically, waiting for resources.
    async fn upgrade(&self, release: &str, namespace: &str, chart: &str) -> Result<()>;
}

/// Production backend shelling out to `helm`.
pub struct HelmCli {
    timeout: Duration,
}

impl HelmCli {
    #[must_use]
    pub fn new(timeout: Duration) -> Self {
        Self { timeout }
    }

    async fn run(&self, args: &[&str]) -> Result<String> {
        debug!(args = ?args, "Invoking helm");
        let output = tokio::time::timeout(self.timeout, Command::new("helm").args(args).output())
            .await
            .map_err(|_| EngineError::Timeout(format!("helm {}", args.join(" "))))?
            .map_err(|e| EngineError::unavailable("package tool", e))?;

        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr);
            return Err(EngineError::unavailable(
                "package tool",
                format!(
                    "helm {} exited {}: {}",
                    args.join(" "),
                    output.status,
                    stderr.trim()
                ),
            ));
        }
        Ok(String::from_utf8_lossy(&output.stdout).into_owned())
    }
}

#[derive(Debug, Deserialize)]
struct HelmStatusDocument {
    info: HelmStatusInfo,
}

#[derive(Debug, Deserialize)]
struct HelmStatusInfo {
    status: ReleaseStatus,
}

#[derive(Debug, Deserialize)]
struct HelmMetadataDocument {
    chart: String,
    version: String,
    revision: u32,
    /// Absent on older tool versions.
    status: Option<ReleaseStatus>,
}

#[async_trait]
impl PackageBackend for HelmCli {
    async fn status(&self, release: &str, namespace: &str) -> Result<ReleaseStatus> {
        let raw = self
            .run(&["status", release, "--namespace", namespace, "--output", "json"])
            .await?;
        let document: HelmStatusDocument = serde_json::from_str(&raw)
            .map_err(|e| EngineError::unavailable("package tool", format!("bad status JSON: {e}")))?;
        Ok(document.info.status)
    }

    async fn metadata(&self, release: &str, namespace: &str) -> Result<ReleaseMetadata> {
        let raw = self
            .run(&[
                "get",
                "metadata",
                release,
                "--namespace",
                namespace,
                "--output",
                "json",
            ])
            .await?;
        let document: HelmMetadataDocument = serde_json::from_str(&raw).map_err(|e| {
            EngineError::unavailable("package tool", format!("bad metadata JSON: {e}"))
        })?;
        Ok(ReleaseMetadata {
            chart: document.chart,
            version: document.version,
            revision: document.revision,
            status: document.status.unwrap_or(ReleaseStatus::Unknown),
        })
    }

    async fn rollback(&self, release: &str, namespace: &str) -> Result<()> {
        // Without an explicit revision helm rolls back to the previous one.
        self.run(&["rollback", release, "--namespace", namespace, "--wait"])
            .await?;
        Ok(())
    }

    async fn upgrade(&self, release: &str, namespace: &str, chart: &str) -> Result<()> {
        self.run(&[
            "upgrade",
            release,
            chart,
            "--namespace",
            namespace,
            "--reuse-values",
            "--atomic",
            "--wait",
        ])
        .await?;
        Ok(())
    }
}

/// Remediator for package-managed workloads.
pub struct HelmRemediator {
    backend: std::sync::Arc<dyn PackageBackend>,
}

impl HelmRemediator {
    #[must_use]
    pub fn new(backend: std::sync::Arc<dyn PackageBackend>) -> Self {
        Self { backend }
    }

    fn release_of(info: &DeploymentInfo) -> Result<&str> {
        info.managed_by.as_deref().ok_or_else(|| {
            EngineError::Validation("package deployment carries no release name".to_string())
        })
    }
}

#[async_trait]
impl Remediator for HelmRemediator {
    fn name(&self) -> &'static str {
        "helm"
    }

    fn can_remediate(&self, info: &DeploymentInfo) -> bool {
        info.method == DeploymentMethod::Package && info.managed_by.is_some()
    }

    async fn remediate(
        &self,
        cancel: &CancellationToken,
        info: &DeploymentInfo,
        issue: &IssueContext,
    ) -> Result<RemediationOutcome> {
        let release = Self::release_of(info)?;
        let namespace = &info.namespace;

        if cancel.is_cancelled() {
            return Err(EngineError::Timeout(format!(
                "package remediation of release '{release}' cancelled"
            )));
        }

        let status = self.backend.status(release, namespace).await?;
        info!(
            release = %release,
            namespace = %namespace,
            status = ?status,
            issue = %issue.issue_type,
            "Remediating package release"
        );

        let mut outcome = RemediationOutcome::action("status");

        if status.needs_rollback() {
            self.backend.rollback(release, namespace).await?;
            outcome.push("rollback_previous_revision");
        } else {
            let metadata = self.backend.metadata(release, namespace).await?;
            self.backend
                .upgrade(release, namespace, &metadata.chart)
                .await?;
            outcome.push("upgrade_reuse_values");
        }

        Ok(outcome)
    }

    async fn rollback(
        &self,
        _cancel: &CancellationToken,
        info: &DeploymentInfo,
        _issue: &IssueContext,
    ) -> Result<RemediationOutcome> {
        let release = Self::release_of(info)?;
        self.backend.rollback(release, &info.namespace).await?;
        Ok(RemediationOutcome::action("rollback_previous_revision"))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use mockall::predicate::eq;
    use std::sync::Arc;

    fn package_info(release: &str) -> DeploymentInfo {
        let mut info = DeploymentInfo::manual("prod", "billing", "Deployment");
        info.method = DeploymentMethod::Package;
        info.managed_by = Some(release.to_string());
        info.source = Some(format!("package:{release}"));
        info.confidence = 0.90;
        info
    }

    fn issue() -> IssueContext {
        IssueContext {
            issue_type: "crash_loop".to_string(),
            description: "billing pods failing".to_string(),
            severity: "high".to_string(),
            namespace: "prod".to_string(),
            resource_kind: "Deployment".to_string(),
            resource_name: "billing".to_string(),
        }
    }

    #[tokio::test]
    async fn test_failed_release_rolls_back() {
        let mut backend = MockPackageBackend::new();
        backend
            .expect_status()
            .with(eq("billing-v12"), eq("prod"))
            .returning(|_, _| Ok(ReleaseStatus::Failed));
        backend
            .expect_rollback()
            .with(eq("billing-v12"), eq("prod"))
            .times(1)
            .returning(|_, _| Ok(()));

        let remediator = HelmRemediator::new(Arc::new(backend));
        let outcome = remediator
            .remediate(&CancellationToken::new(), &package_info("billing-v12"), &issue())
            .await
            .unwrap();
        assert_eq!(outcome.actions, vec!["status", "rollback_previous_revision"]);
    }

    #[tokio::test]
    async fn test_deployed_release_upgrades_with_prior_values() {
        let mut backend = MockPackageBackend::new();
        backend
            .expect_status()
            .returning(|_, _| Ok(ReleaseStatus::Deployed));
        backend.expect_metadata().returning(|_, _| {
            Ok(ReleaseMetadata {
                chart: "billing".to_string(),
                version: "1.4.2".to_string(),
                revision: 12,
                status: ReleaseStatus::Deployed,
            })
        });
        backend
            .expect_upgrade()
            .with(eq("billing-v12"), eq("prod"), eq("billing"))
            .times(1)
            .returning(|_, _, _| Ok(()));

        let remediator = HelmRemediator::new(Arc::new(backend));
        let outcome = remediator
            .remediate(&CancellationToken::new(), &package_info("billing-v12"), &issue())
            .await
            .unwrap();
        assert_eq!(outcome.actions, vec!["status", "upgrade_reuse_values"]);
    }

    #[tokio::test]
    async fn test_backend_failure_surfaces_unavailable() {
        let mut backend = MockPackageBackend::new();
        backend.expect_status().returning(|_, _| {
            Err(EngineError::unavailable("package tool", "helm status exited 1"))
        });

        let remediator = HelmRemediator::new(Arc::new(backend));
        let err = remediator
            .remediate(&CancellationToken::new(), &package_info("billing-v12"), &issue())
            .await
            .unwrap_err();
        assert_eq!(err.code(), "backend_unavailable");
    }

    #[tokio::test]
    async fn test_cancelled_before_start() {
        let backend = MockPackageBackend::new();
        let remediator = HelmRemediator::new(Arc::new(backend));
        let cancel = CancellationToken::new();
        cancel.cancel();

        let err = remediator
            .remediate(&cancel, &package_info("billing-v12"), &issue())
            .await
            .unwrap_err();
        assert_eq!(err.code(), "timeout");
    }

    #[test]
    fn test_status_parsing() {
        let parsed: ReleaseStatus = serde_json::from_str("\"pending-upgrade\"").unwrap();
        assert_eq!(parsed, ReleaseStatus::PendingUpgrade);
        assert!(ReleaseStatus::Failed.needs_rollback());
        assert!(ReleaseStatus::Superseded.needs_rollback());
        assert!(!ReleaseStatus::Deployed.needs_rollback());
    }
}
