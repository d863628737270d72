//! Remediation strategies.
//!
//! Four adapters implement a common contract and a selector picks the first
//! one whose capability matches the detected deployment method. Each adapter
//! acts *through* the tool that owns the workload; none of them edits
//! resources out from under a managing controller.

pub mod direct;
pub mod gitops;
pub mod helm;
pub mod operator;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tracing::debug;

use crate::detect::deployment::DeploymentInfo;
use crate::error::Result;

/// The triggering issue as the remediators see it.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct IssueContext {
    /// Issue class (`crash_loop`, `image_pull_backoff`, `oom_killed`, ...).
    pub issue_type: String,
    pub description: String,
    pub severity: String,
    pub namespace: String,
    pub resource_kind: String,
    pub resource_name: String,
}

/// What a remediation actually did, for the workflow record.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct RemediationOutcome {
    /// Actions taken, in order (`refresh`, `sync`, `rollback`, ...).
    pub actions: Vec<String>,
    /// Operator-facing advisory, when the fix needs a human follow-up.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub advisory: Option<String>,
}

impl RemediationOutcome {
    #[must_use]
    pub fn action(name: &str) -> Self {
        Self {
            actions: vec![name.to_string()],
            advisory: None,
        }
    }

    pub fn push(&mut self, name: &str) {
        self.actions.push(name.to_string());
    }
}

/// Common contract implemented by every remediation strategy.
#[async_trait]
pub trait Remediator: Send + Sync {
    /// Stable adapter name used in workflow records and metrics.
    fn name(&self) -> &'static str;

    /// Whether this adapter can act on a workload deployed this way.
    fn can_remediate(&self, info: &DeploymentInfo) -> bool;

    /// Execute the remediation. Observes `cancel` at every suspension point.
    async fn remediate(
        &self,
        cancel: &CancellationToken,
        info: &DeploymentInfo,
        issue: &IssueContext,
    ) -> Result<RemediationOutcome>;

    /// Best-effort inverse of a previously executed remediation. Errors are
    /// the caller's to log; default is a no-op.
    async fn rollback(
        &self,
        _cancel: &CancellationToken,
        _info: &DeploymentInfo,
        _issue: &IssueContext,
    ) -> Result<RemediationOutcome> {
        Ok(RemediationOutcome::action("noop"))
    }
}

/// First-match selection over the closed adapter set.
pub struct RemediatorSelector {
    remediators: Vec<Arc<dyn Remediator>>,
    fallback: Arc<dyn Remediator>,
}

impl RemediatorSelector {
    /// Build a selector from adapters in priority order plus the fallback
    /// used when nothing matches (the direct adapter in production).
    #[must_use]
    pub fn new(remediators: Vec<Arc<dyn Remediator>>, fallback: Arc<dyn Remediator>) -> Self {
        Self {
            remediators,
            fallback,
        }
    }

    /// Pick the first adapter whose capability matches.
    #[must_use]
    pub fn select(&self, info: &DeploymentInfo) -> Arc<dyn Remediator> {
        for remediator in &self.remediators {
            if remediator.can_remediate(info) {
                debug!(
                    method = %info.method,
                    remediator = remediator.name(),
                    "Selected remediator"
                );
                return Arc::clone(remediator);
            }
        }
        debug!(
            method = %info.method,
            remediator = self.fallback.name(),
            "No capability match, using fallback remediator"
        );
        Arc::clone(&self.fallback)
    }
}
