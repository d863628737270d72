//! GitOps remediation through the Argo CD control plane.
//!
//! The engine never edits resources an Argo CD application owns. It nudges
//! the control plane: refresh, inspect, sync if the application sits in a
//! failed terminal state, then poll until synced and healthy.

use std::time::Duration;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use super::{IssueContext, RemediationOutcome, Remediator};
use crate::config::GitOpsConfig;
use crate::detect::deployment::{DeploymentInfo, DeploymentMethod};
use crate::error::{EngineError, Result};

/// Interval between sync-state polls.
const POLL_INTERVAL: Duration = Duration::from_secs(5);

/// Application state as reported by the control plane.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AppState {
    /// `Synced`, `OutOfSync`, or `Unknown`.
    pub sync_status: String,
    /// `Healthy`, `Progressing`, `Degraded`, `Missing`, `Suspended`, `Unknown`.
    pub health_status: String,
    /// Deployed revision.
    pub revision: Option<String>,
    /// Source repository.
    pub source: Option<String>,
    /// Phase of the last sync operation (`Succeeded`, `Failed`, `Error`, ...).
    pub operation_phase: Option<String>,
}

impl AppState {
    /// Whether the application is settled green.
    #[must_use]
    pub fn is_settled(&self) -> bool {
        self.sync_status == "Synced" && self.health_status == "Healthy"
    }

    /// Whether the application sits in a state that will not recover
    /// without a new sync.
    #[must_use]
    pub fn is_terminal_failure(&self) -> bool {
        self.sync_status == "OutOfSync"
            || matches!(self.health_status.as_str(), "Degraded" | "Missing")
    }
}

/// Thin client over the Argo CD application API.
#[derive(Debug, Clone)]
pub struct ArgoClient {
    base_url: String,
    token: String,
    client: reqwest::Client,
    sync_timeout: Duration,
}

impl ArgoClient {
    /// Create a client from configuration.
    ///
    /// # Errors
    ///
    /// Returns an error if the HTTP client cannot be constructed.
    pub fn new(config: &GitOpsConfig) -> Result<Self> {
        let client = reqwest::Client::builder()
            .timeout(config.request_timeout)
            .danger_accept_invalid_certs(false)
            .build()
            .map_err(|e| EngineError::unavailable("gitops", e))?;

        Ok(Self {
            base_url: config.base_url.trim_end_matches('/').to_string(),
            token: config.token.clone(),
            client,
            sync_timeout: config.sync_timeout,
        })
    }

    fn request(&self, builder: reqwest::RequestBuilder) -> reqwest::RequestBuilder {
        if self.token.is_empty() {
            builder
        } else {
            builder.bearer_auth(&self.token)
        }
    }

    /// Ask the control plane to re-read the application's live state.
    pub async fn refresh_application(&self, name: &str) -> Result<()> {
        let url = format!("{}/api/v1/applications/{name}", self.base_url);
        let response = self
            .request(self.client.get(&url).query(&[("refresh", "normal")]))
            .send()
            .await
            .map_err(|e| EngineError::unavailable("gitops", e))?;
        check_app_response(name, response.status())?;
        debug!(app = %name, "Refreshed gitops application");
        Ok(())
    }

    /// Read the application's sync and health state.
    pub async fn get_application_state(&self, name: &str) -> Result<AppState> {
        let url = format!("{}/api/v1/applications/{name}", self.base_url);
        let response = self
            .request(self.client.get(&url))
            .send()
            .await
            .map_err(|e| EngineError::unavailable("gitops", e))?;
        check_app_response(name, response.status())?;

        let body: serde_json::Value = response
            .json()
            .await
            .map_err(|e| EngineError::unavailable("gitops", e))?;

        Ok(AppState {
            sync_status: crate::cluster::nested_str(&body, &["status", "sync", "status"])?
                .unwrap_or("Unknown")
                .to_string(),
            health_status: crate::cluster::nested_str(&body, &["status", "health", "status"])?
                .unwrap_or("Unknown")
                .to_string(),
            revision: crate::cluster::nested_str(&body, &["status", "sync", "revision"])?
                .map(ToString::to_string),
            source: crate::cluster::nested_str(&body, &["spec", "source", "repoURL"])?
                .map(ToString::to_string),
            operation_phase: crate::cluster::nested_str(
                &body,
                &["status", "operationState", "phase"],
            )?
            .map(ToString::to_string),
        })
    }

    /// Trigger a sync. Never prunes and never dry-runs from this engine.
    pub async fn sync_application(&self, name: &str) -> Result<()> {
        let url = format!("{}/api/v1/applications/{name}/sync", self.base_url);
        let response = self
            .request(self.client.post(&url).json(&serde_json::json!({
                "prune": false,
                "dryRun": false,
            })))
            .send()
            .await
            .map_err(|e| EngineError::unavailable("gitops", e))?;
        check_app_response(name, response.status())?;
        info!(app = %name, "Issued gitops sync");
        Ok(())
    }

    /// Probe control plane liveness.
    pub async fn health_check(&self) -> bool {
        let url = format!("{}/healthz", self.base_url);
        match self.client.get(&url).send().await {
            Ok(response) => response.status().is_success(),
            Err(_) => false,
        }
    }

    /// Poll until the application settles, the deadline passes, or the
    /// caller cancels.
    pub async fn wait_until_settled(
        &self,
        cancel: &CancellationToken,
        name: &str,
    ) -> Result<AppState> {
        let deadline = tokio::time::Instant::now() + self.sync_timeout;

        loop {
            let state = self.get_application_state(name).await?;
            if state.is_settled() {
                return Ok(state);
            }
            if matches!(state.operation_phase.as_deref(), Some("Failed" | "Error")) {
                return Err(EngineError::SyncFailed(format!(
                    "sync operation for application '{name}' ended {}",
                    state.operation_phase.as_deref().unwrap_or_default()
                )));
            }
            debug!(
                app = %name,
                sync = %state.sync_status,
                health = %state.health_status,
                "Application not settled yet"
            );

            if tokio::time::Instant::now() + POLL_INTERVAL > deadline {
                return Err(EngineError::Timeout(format!(
                    "gitops sync of application '{name}' (last: sync={}, health={})",
                    state.sync_status, state.health_status
                )));
            }

            tokio::select! {
                () = cancel.cancelled() => {
                    return Err(EngineError::Timeout(format!(
                        "gitops sync of application '{name}' cancelled"
                    )));
                }
                () = tokio::time::sleep(POLL_INTERVAL) => {}
            }
        }
    }
}

fn check_app_response(name: &str, status: reqwest::StatusCode) -> Result<()> {
    match status.as_u16() {
        404 => Err(EngineError::not_found("application", name)),
        401 | 403 => Err(EngineError::PermissionDenied(format!(
            "gitops API rejected request for application '{name}'"
        ))),
        code if code >= 400 => Err(EngineError::unavailable(
            "gitops",
            format!("application '{name}' request returned HTTP {code}"),
        )),
        _ => Ok(()),
    }
}

/// Remediator for gitops-managed workloads.
pub struct GitopsRemediator {
    client: ArgoClient,
}

impl GitopsRemediator {
    #[must_use]
    pub fn new(client: ArgoClient) -> Self {
        Self { client }
    }

    fn application_of(info: &DeploymentInfo) -> Result<&str> {
        info.managed_by.as_deref().ok_or_else(|| {
            EngineError::Validation(
                "gitops deployment carries no application name".to_string(),
            )
        })
    }
}

#[async_trait]
impl Remediator for GitopsRemediator {
    fn name(&self) -> &'static str {
        "gitops"
    }

    fn can_remediate(&self, info: &DeploymentInfo) -> bool {
        info.method == DeploymentMethod::Gitops && info.managed_by.is_some()
    }

    async fn remediate(
        &self,
        cancel: &CancellationToken,
        info: &DeploymentInfo,
        issue: &IssueContext,
    ) -> Result<RemediationOutcome> {
        let app = Self::application_of(info)?;
        info!(
            app = %app,
            issue = %issue.issue_type,
            "Remediating through gitops control plane"
        );

        let mut outcome = RemediationOutcome::default();

        self.client.refresh_application(app).await?;
        outcome.push("refresh");

        let state = self.client.get_application_state(app).await?;
        outcome.push("read_state");

        if state.is_settled() {
            // Refresh alone may clear a stale view; nothing more to do.
            info!(app = %app, "Application already synced and healthy after refresh");
            return Ok(outcome);
        }

        if state.is_terminal_failure() {
            self.client.sync_application(app).await?;
            outcome.push("sync");
        } else {
            debug!(
                app = %app,
                sync = %state.sync_status,
                health = %state.health_status,
                "Application progressing, waiting without a new sync"
            );
        }

        self.client.wait_until_settled(cancel, app).await?;
        outcome.push("wait_settled");
        Ok(outcome)
    }

    async fn rollback(
        &self,
        _cancel: &CancellationToken,
        info: &DeploymentInfo,
        _issue: &IssueContext,
    ) -> Result<RemediationOutcome> {
        // The control plane owns the desired state; a forced local rollback
        // would fight it. Refresh so it reconverges on its own.
        let app = Self::application_of(info)?;
        warn!(app = %app, "Rolling back gitops remediation via refresh only");
        self.client.refresh_application(app).await?;
        Ok(RemediationOutcome::action("refresh"))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use wiremock::matchers::{method, path, query_param};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    fn config_for(server: &MockServer) -> GitOpsConfig {
        GitOpsConfig {
            base_url: server.uri(),
            token: "token-1".to_string(),
            sync_timeout: Duration::from_secs(1),
            request_timeout: Duration::from_secs(2),
        }
    }

    fn gitops_info(app: &str) -> DeploymentInfo {
        let mut info = DeploymentInfo::manual("prod", "payment", "Deployment");
        info.method = DeploymentMethod::Gitops;
        info.managed = true;
        info.managed_by = Some(app.to_string());
        info.confidence = 0.95;
        info
    }

    fn issue() -> IssueContext {
        IssueContext {
            issue_type: "crash_loop".to_string(),
            description: "payment pods crashlooping".to_string(),
            severity: "high".to_string(),
            namespace: "prod".to_string(),
            resource_kind: "Deployment".to_string(),
            resource_name: "payment".to_string(),
        }
    }

    fn app_body(sync: &str, health: &str) -> serde_json::Value {
        serde_json::json!({
            "status": {
                "sync": {"status": sync, "revision": "abc123"},
                "health": {"status": health}
            },
            "spec": {"source": {"repoURL": "https://git.example.com/payment.git"}}
        })
    }

    #[tokio::test]
    async fn test_state_classification() {
        let settled = AppState {
            sync_status: "Synced".to_string(),
            health_status: "Healthy".to_string(),
            revision: None,
            source: None,
            operation_phase: None,
        };
        assert!(settled.is_settled());
        assert!(!settled.is_terminal_failure());

        let degraded = AppState {
            sync_status: "Synced".to_string(),
            health_status: "Degraded".to_string(),
            revision: None,
            source: None,
            operation_phase: None,
        };
        assert!(degraded.is_terminal_failure());

        let out_of_sync = AppState {
            sync_status: "OutOfSync".to_string(),
            health_status: "Progressing".to_string(),
            revision: None,
            source: None,
            operation_phase: None,
        };
        assert!(out_of_sync.is_terminal_failure());
    }

    #[tokio::test]
    async fn test_remediate_refresh_then_sync_until_settled() {
        let server = MockServer::start().await;

        Mock::given(method("GET"))
            .and(path("/api/v1/applications/payment"))
            .and(query_param("refresh", "normal"))
            .respond_with(ResponseTemplate::new(200).set_body_json(app_body("OutOfSync", "Degraded")))
            .mount(&server)
            .await;
        // First plain read: degraded. Poll reads: settled.
        Mock::given(method("GET"))
            .and(path("/api/v1/applications/payment"))
            .respond_with(ResponseTemplate::new(200).set_body_json(app_body("OutOfSync", "Degraded")))
            .up_to_n_times(1)
            .mount(&server)
            .await;
        Mock::given(method("GET"))
            .and(path("/api/v1/applications/payment"))
            .respond_with(ResponseTemplate::new(200).set_body_json(app_body("Synced", "Healthy")))
            .mount(&server)
            .await;
        let sync_mock = Mock::given(method("POST"))
            .and(path("/api/v1/applications/payment/sync"))
            .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({})))
            .expect(1)
            .mount_as_scoped(&server)
            .await;

        let remediator = GitopsRemediator::new(ArgoClient::new(&config_for(&server)).unwrap());
        let outcome = remediator
            .remediate(&CancellationToken::new(), &gitops_info("payment"), &issue())
            .await
            .unwrap();

        assert_eq!(outcome.actions, vec!["refresh", "read_state", "sync", "wait_settled"]);
        drop(sync_mock);
    }

    #[tokio::test]
    async fn test_remediate_times_out_when_never_settled() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/api/v1/applications/payment"))
            .respond_with(ResponseTemplate::new(200).set_body_json(app_body("OutOfSync", "Degraded")))
            .mount(&server)
            .await;
        Mock::given(method("POST"))
            .and(path("/api/v1/applications/payment/sync"))
            .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({})))
            .mount(&server)
            .await;

        let remediator = GitopsRemediator::new(ArgoClient::new(&config_for(&server)).unwrap());
        let err = remediator
            .remediate(&CancellationToken::new(), &gitops_info("payment"), &issue())
            .await
            .unwrap_err();
        assert_eq!(err.code(), "timeout");
    }

    #[tokio::test]
    async fn test_failed_sync_operation_maps_to_sync_failed() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/api/v1/applications/payment"))
            .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({
                "status": {
                    "sync": {"status": "OutOfSync"},
                    "health": {"status": "Degraded"},
                    "operationState": {"phase": "Failed"}
                }
            })))
            .mount(&server)
            .await;
        Mock::given(method("POST"))
            .and(path("/api/v1/applications/payment/sync"))
            .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({})))
            .mount(&server)
            .await;

        let remediator = GitopsRemediator::new(ArgoClient::new(&config_for(&server)).unwrap());
        let err = remediator
            .remediate(&CancellationToken::new(), &gitops_info("payment"), &issue())
            .await
            .unwrap_err();
        assert_eq!(err.code(), "sync_failed");
    }

    #[tokio::test]
    async fn test_missing_application_maps_to_not_found() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .respond_with(ResponseTemplate::new(404))
            .mount(&server)
            .await;

        let remediator = GitopsRemediator::new(ArgoClient::new(&config_for(&server)).unwrap());
        let err = remediator
            .remediate(&CancellationToken::new(), &gitops_info("payment"), &issue())
            .await
            .unwrap_err();
        assert_eq!(err.code(), "not_found");
    }

    #[test]
    fn test_can_remediate_requires_application_name() {
        let server_config = GitOpsConfig {
            base_url: "http://localhost:1".to_string(),
            token: String::new(),
            sync_timeout: Duration::from_secs(1),
            request_timeout: Duration::from_secs(1),
        };
        let remediator = GitopsRemediator::new(ArgoClient::new(&server_config).unwrap());

        let mut info = gitops_info("payment");
        assert!(remediator.can_remediate(&info));
        info.managed_by = None;
        assert!(!remediator.can_remediate(&info));
        info.method = DeploymentMethod::Manual;
        assert!(!remediator.can_remediate(&info));
    }
}
