//! The coordination core.
//!
//! Wires detection, planning, remediation, and health checking into one
//! control flow per incident: detect how the workload was deployed, compute
//! the affected layers, generate the plan, execute steps in order with
//! interleaved checkpoints, and roll back executed steps in reverse when
//! anything fails. Every workflow transition is persisted before the next
//! action runs.

pub mod adapters;
pub mod workflow;

use std::sync::Arc;

use async_trait::async_trait;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

use crate::detect::deployment::{DeploymentClassifier, DeploymentInfo};
use crate::detect::layers::{Layer, LayerDetector, LayeredIssue, ResourceRef};
use crate::error::{EngineError, Result};
use crate::health::{CheckpointVerdict, HealthChecker};
use crate::metrics::MetricsCollector;
use crate::plan::{invert, HealthCheckpoint, Planner, RemediationPlan, RemediationStep};
use crate::remediate::{IssueContext, RemediationOutcome, Remediator, RemediatorSelector};
use crate::store::{NewIncident, Severity, Store};

use adapters::InternalAdapter;
use workflow::{StepRecord, StepStatus, Workflow, WorkflowStatus};

/// Checkpoint-execution seam; the health checker is the production
/// implementation.
#[async_trait]
pub trait CheckpointRunner: Send + Sync {
    async fn run(
        &self,
        checkpoint: &HealthCheckpoint,
        namespace: &str,
    ) -> Result<CheckpointVerdict>;
}

#[async_trait]
impl CheckpointRunner for HealthChecker {
    async fn run(
        &self,
        checkpoint: &HealthCheckpoint,
        namespace: &str,
    ) -> Result<CheckpointVerdict> {
        self.run_checkpoint(checkpoint, namespace).await
    }
}

/// What a trigger call hands back: the persisted record plus a rough
/// duration estimate derived from the plan's settle times.
#[derive(Debug, Clone)]
pub struct TriggerReceipt {
    pub workflow: Workflow,
    pub estimated_duration: std::time::Duration,
}

/// The control-flow heart of the engine.
pub struct Orchestrator {
    store: Arc<Store>,
    classifier: Arc<dyn DeploymentClassifier>,
    layer_detector: Arc<LayerDetector>,
    planner: Planner,
    selector: Arc<RemediatorSelector>,
    checkpoints: Arc<dyn CheckpointRunner>,
    internal: Arc<dyn InternalAdapter>,
    metrics: MetricsCollector,
    root_cancel: CancellationToken,
    active: Arc<std::sync::atomic::AtomicUsize>,
}

impl Orchestrator {
    #[allow(clippy::too_many_arguments)]
    #[must_use]
    pub fn new(
        store: Arc<Store>,
        classifier: Arc<dyn DeploymentClassifier>,
        layer_detector: Arc<LayerDetector>,
        planner: Planner,
        selector: Arc<RemediatorSelector>,
        checkpoints: Arc<dyn CheckpointRunner>,
        internal: Arc<dyn InternalAdapter>,
        metrics: MetricsCollector,
        root_cancel: CancellationToken,
    ) -> Self {
        Self {
            store,
            classifier,
            layer_detector,
            planner,
            selector,
            checkpoints,
            internal,
            metrics,
            root_cancel,
            active: Arc::new(std::sync::atomic::AtomicUsize::new(0)),
        }
    }

    /// Number of workflow tasks still executing. Drives the shutdown grace
    /// wait.
    #[must_use]
    pub fn active_workflows(&self) -> usize {
        self.active.load(std::sync::atomic::Ordering::SeqCst)
    }

    /// Start a remediation workflow for an incident. Returns the persisted
    /// in-progress record; execution continues in a spawned task.
    pub async fn trigger(
        self: Arc<Self>,
        incident_id: &str,
        issue: IssueContext,
        extra_resources: Vec<ResourceRef>,
    ) -> Result<TriggerReceipt> {
        let info = match self
            .classifier
            .classify(&issue.namespace, &issue.resource_name, &issue.resource_kind)
            .await
        {
            Ok(info) => info,
            Err(e) => {
                // Detection trouble must not block remediation; the direct
                // adapter handles unknown methods.
                warn!(
                    incident = %incident_id,
                    error = %e,
                    "Deployment detection failed, continuing with unknown method"
                );
                DeploymentInfo::unknown(&issue.namespace, &issue.resource_name, &issue.resource_kind)
            }
        };

        let mut resources = vec![ResourceRef {
            kind: issue.resource_kind.clone(),
            namespace: issue.namespace.clone(),
            name: issue.resource_name.clone(),
            issue: issue.issue_type.clone(),
        }];
        resources.extend(extra_resources);

        let layered = self
            .layer_detector
            .detect_layers(incident_id, &issue.description, &issue.severity, &resources)
            .await;

        let plan = self.planner.generate_plan(&layered);
        let remediator = self.selector.select(&info);
        self.metrics.remediation_selected(remediator.name()).await;

        self.ensure_incident(incident_id, &issue).await?;

        let mut record = Workflow::new(
            incident_id,
            info.method,
            &issue.namespace,
            &issue.resource_kind,
            &issue.resource_name,
            &issue.issue_type,
            remediator.name(),
        );
        self.store.save_workflow(&record).await?;

        record.transition(WorkflowStatus::InProgress);
        self.store.save_workflow(&record).await?;
        self.metrics.workflow_started().await;
        self.link_incident(incident_id, &record.id).await;

        info!(
            workflow = %record.id,
            incident = %incident_id,
            method = %info.method,
            remediator = remediator.name(),
            steps = plan.steps.len(),
            "Starting remediation workflow"
        );

        let estimated_duration = plan
            .steps
            .iter()
            .map(|s| s.wait_time)
            .sum::<std::time::Duration>();

        let orchestrator = Arc::clone(&self);
        let snapshot = record.clone();
        let cancel = self.root_cancel.child_token();
        self.active.fetch_add(1, std::sync::atomic::Ordering::SeqCst);
        tokio::spawn(async move {
            orchestrator
                .execute(cancel, record, plan, layered, info, issue, remediator)
                .await;
            orchestrator
                .active
                .fetch_sub(1, std::sync::atomic::Ordering::SeqCst);
        });

        Ok(TriggerReceipt {
            workflow: snapshot,
            estimated_duration,
        })
    }

    pub async fn get_workflow(&self, id: &str) -> Result<Workflow> {
        self.store.get_workflow(id).await
    }

    pub async fn list_workflows(&self) -> Vec<Workflow> {
        self.store.list_workflows().await
    }

    /// Run the plan to completion, rollback, or cancellation.
    #[allow(clippy::too_many_arguments)]
    async fn execute(
        &self,
        cancel: CancellationToken,
        mut record: Workflow,
        plan: RemediationPlan,
        layered: LayeredIssue,
        info: DeploymentInfo,
        issue: IssueContext,
        remediator: Arc<dyn Remediator>,
    ) {
        let mut checkpoint_passed = false;

        for step in &plan.steps {
            // Optional steps are skippable once a prior layer's checkpoint
            // verified the stack above them.
            if !step.required && checkpoint_passed {
                info!(
                    workflow = %record.id,
                    step = step.order,
                    action = %step.action_type,
                    "Skipping optional step after passed checkpoint"
                );
                record.executed_steps.push(StepRecord {
                    order: step.order,
                    action_type: step.action_type.clone(),
                    target: step.target.clone(),
                    status: StepStatus::Skipped,
                    actions: Vec::new(),
                    error: None,
                    started_at: chrono::Utc::now(),
                    completed_at: Some(chrono::Utc::now()),
                });
                if let Err(e) = self.store.save_workflow(&record).await {
                    error!(workflow = %record.id, error = %e, "Failed to persist skipped step");
                }
                continue;
            }

            let started_at = chrono::Utc::now();
            let result = self
                .run_step(&cancel, step, &layered, &info, &issue, &remediator)
                .await;

            match result {
                Ok(outcome) => {
                    record.executed_steps.push(StepRecord {
                        order: step.order,
                        action_type: step.action_type.clone(),
                        target: step.target.clone(),
                        status: StepStatus::Succeeded,
                        actions: outcome.actions,
                        error: None,
                        started_at,
                        completed_at: Some(chrono::Utc::now()),
                    });
                    if let Err(e) = self.store.save_workflow(&record).await {
                        error!(workflow = %record.id, error = %e, "Failed to persist step result");
                    }
                }
                Err(e) => {
                    let failure = e.into_step_failure(step.order, &step.action_type);
                    record.executed_steps.push(StepRecord {
                        order: step.order,
                        action_type: step.action_type.clone(),
                        target: step.target.clone(),
                        status: StepStatus::Failed,
                        actions: Vec::new(),
                        error: Some(failure.to_string()),
                        started_at,
                        completed_at: Some(chrono::Utc::now()),
                    });
                    self.fail_and_rollback(record, &plan, &layered, &info, &issue, &remediator, failure)
                        .await;
                    return;
                }
            }

            // Settle time, then the gating checkpoint if this was the
            // layer's last step. Cancellation at either point fails the step.
            if let Err(e) = self.wait_step(&cancel, step).await {
                self.fail_and_rollback(record, &plan, &layered, &info, &issue, &remediator, e)
                    .await;
                return;
            }

            if let Some(checkpoint) = plan.checkpoint_after(step.order) {
                match self.run_checkpoint(&cancel, checkpoint, &issue.namespace).await {
                    Ok(()) => checkpoint_passed = true,
                    Err(e) => {
                        self.metrics.checkpoint_failed().await;
                        let failure = e.into_step_failure(step.order, &step.action_type);
                        self.fail_and_rollback(
                            record, &plan, &layered, &info, &issue, &remediator, failure,
                        )
                        .await;
                        return;
                    }
                }
            }
        }

        record.transition(WorkflowStatus::Completed);
        if let Err(e) = self.store.save_workflow(&record).await {
            error!(workflow = %record.id, error = %e, "Failed to persist completed workflow");
        }
        self.metrics.workflow_completed().await;
        self.resolve_incident(&record).await;
        info!(workflow = %record.id, "Remediation workflow completed");
    }

    async fn run_step(
        &self,
        cancel: &CancellationToken,
        step: &RemediationStep,
        layered: &LayeredIssue,
        info: &DeploymentInfo,
        issue: &IssueContext,
        remediator: &Arc<dyn Remediator>,
    ) -> Result<RemediationOutcome> {
        if cancel.is_cancelled() {
            return Err(EngineError::Timeout("workflow cancelled".to_string()));
        }
        match step.layer {
            Layer::Application => remediator.remediate(cancel, info, issue).await,
            Layer::Infrastructure | Layer::Platform => {
                self.internal.execute(cancel, step, layered).await
            }
        }
    }

    async fn wait_step(&self, cancel: &CancellationToken, step: &RemediationStep) -> Result<()> {
        tokio::select! {
            () = cancel.cancelled() => Err(EngineError::Timeout(format!(
                "wait after step {} cancelled",
                step.order
            ))
            .into_step_failure(step.order, &step.action_type)),
            () = tokio::time::sleep(step.wait_time) => Ok(()),
        }
    }

    async fn run_checkpoint(
        &self,
        cancel: &CancellationToken,
        checkpoint: &HealthCheckpoint,
        namespace: &str,
    ) -> Result<()> {
        let verdict = tokio::select! {
            () = cancel.cancelled() => {
                return Err(EngineError::Timeout(format!(
                    "checkpoint for layer {} cancelled",
                    checkpoint.layer
                )));
            }
            verdict = self.checkpoints.run(checkpoint, namespace) => verdict?,
        };

        match verdict {
            CheckpointVerdict::Passed => {
                info!(layer = %checkpoint.layer, "Checkpoint passed");
                Ok(())
            }
            CheckpointVerdict::Failed { probe, reason } => Err(EngineError::CheckpointFailed {
                layer: checkpoint.layer.to_string(),
                probe,
                reason,
            }),
        }
    }

    /// Mark the workflow failed, roll executed steps back in reverse, then
    /// mark it rolled back. Rollback errors are logged, never propagated.
    #[allow(clippy::too_many_arguments)]
    async fn fail_and_rollback(
        &self,
        mut record: Workflow,
        plan: &RemediationPlan,
        layered: &LayeredIssue,
        info: &DeploymentInfo,
        issue: &IssueContext,
        remediator: &Arc<dyn Remediator>,
        failure: EngineError,
    ) {
        error!(workflow = %record.id, error = %failure, "Workflow step failed, rolling back");
        record.error = Some(failure.to_string());
        record.transition(WorkflowStatus::Failed);
        if let Err(e) = self.store.save_workflow(&record).await {
            error!(workflow = %record.id, error = %e, "Failed to persist failed workflow");
        }
        self.metrics.workflow_failed().await;

        // Rollback ignores the caller's cancellation: a half-rolled-back
        // cluster is worse than a slow shutdown.
        let rollback_cancel = CancellationToken::new();
        let succeeded: Vec<u32> = record
            .executed_steps
            .iter()
            .filter(|r| r.status == StepStatus::Succeeded)
            .map(|r| r.order)
            .collect();

        for order in succeeded.into_iter().rev() {
            let Some(forward) = plan.steps.iter().find(|s| s.order == order) else {
                continue;
            };
            let inverse = invert(forward);
            let result = match inverse.layer {
                Layer::Application => remediator.rollback(&rollback_cancel, info, issue).await,
                Layer::Infrastructure | Layer::Platform => {
                    self.internal.rollback(&rollback_cancel, &inverse, layered).await
                }
            };

            match result {
                Ok(outcome) => {
                    if let Some(step_record) = record
                        .executed_steps
                        .iter_mut()
                        .find(|r| r.order == order)
                    {
                        step_record.status = StepStatus::RolledBack;
                        step_record.actions.extend(outcome.actions);
                    }
                }
                Err(e) => {
                    warn!(
                        workflow = %record.id,
                        step = order,
                        error = %e,
                        "Rollback of step failed, continuing with remaining steps"
                    );
                }
            }
            if let Err(e) = self.store.save_workflow(&record).await {
                error!(workflow = %record.id, error = %e, "Failed to persist rollback progress");
            }
        }

        record.transition(WorkflowStatus::RolledBack);
        if let Err(e) = self.store.save_workflow(&record).await {
            error!(workflow = %record.id, error = %e, "Failed to persist rolled back workflow");
        }
        self.metrics.workflow_rolled_back().await;
    }

    /// Make sure the incident record exists so the workflow has something
    /// durable to hang off.
    async fn ensure_incident(&self, incident_id: &str, issue: &IssueContext) -> Result<()> {
        if self.store.get_incident(incident_id).await.is_ok() {
            return Ok(());
        }
        let severity = Severity::parse(&issue.severity).unwrap_or(Severity::Medium);
        let mut title = format!("{}: {}/{}", issue.issue_type, issue.namespace, issue.resource_name);
        title.truncate(crate::store::incidents::MAX_TITLE_LEN);
        let mut description = issue.description.clone();
        description.truncate(crate::store::incidents::MAX_DESCRIPTION_LEN);
        let mut target = format!("{}/{}", issue.namespace, issue.resource_name);
        target.truncate(crate::store::incidents::MAX_TARGET_LEN);

        let mut incident = crate::store::Incident::from_new(NewIncident {
            title,
            description,
            severity,
            target,
            affected_resources: vec![ResourceRef {
                kind: issue.resource_kind.clone(),
                namespace: issue.namespace.clone(),
                name: issue.resource_name.clone(),
                issue: issue.issue_type.clone(),
            }],
            labels: std::collections::HashMap::from([(
                "namespace".to_string(),
                issue.namespace.clone(),
            )]),
        })?;
        // Keep the externally reported id so later lookups resolve.
        incident.id = incident_id.to_string();
        self.store.put_incident(incident).await?;
        Ok(())
    }

    async fn link_incident(&self, incident_id: &str, workflow_id: &str) {
        if let Ok(mut incident) = self.store.get_incident(incident_id).await {
            incident.workflow_id = Some(workflow_id.to_string());
            if let Err(e) = self.store.update_incident(incident).await {
                warn!(incident = %incident_id, error = %e, "Failed to link workflow to incident");
            }
        }
    }

    async fn resolve_incident(&self, record: &Workflow) {
        if let Ok(mut incident) = self.store.get_incident(&record.incident_id).await {
            incident.resolve();
            if let Err(e) = self.store.update_incident(incident).await {
                warn!(
                    incident = %record.incident_id,
                    error = %e,
                    "Failed to mark incident resolved"
                );
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::EngineConfig;
    use crate::detect::deployment::DeploymentMethod;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::Duration;
    use tokio::sync::Mutex;

    struct StubClassifier {
        method: DeploymentMethod,
    }

    #[async_trait]
    impl DeploymentClassifier for StubClassifier {
        async fn classify(&self, namespace: &str, name: &str, kind: &str) -> Result<DeploymentInfo> {
            let mut info = DeploymentInfo::manual(namespace, name, kind);
            info.method = self.method;
            if self.method == DeploymentMethod::Gitops {
                info.managed = true;
                info.managed_by = Some(name.to_string());
                info.confidence = 0.95;
            }
            Ok(info)
        }
    }

    #[derive(Default)]
    struct StubRemediator {
        fail: bool,
        remediations: AtomicUsize,
        rollbacks: AtomicUsize,
    }

    #[async_trait]
    impl Remediator for StubRemediator {
        fn name(&self) -> &'static str {
            "stub"
        }

        fn can_remediate(&self, _info: &DeploymentInfo) -> bool {
            true
        }

        async fn remediate(
            &self,
            _cancel: &CancellationToken,
            _info: &DeploymentInfo,
            _issue: &IssueContext,
        ) -> Result<RemediationOutcome> {
            self.remediations.fetch_add(1, Ordering::SeqCst);
            if self.fail {
                Err(EngineError::unavailable("stub", "induced failure"))
            } else {
                Ok(RemediationOutcome::action("remediate"))
            }
        }

        async fn rollback(
            &self,
            _cancel: &CancellationToken,
            _info: &DeploymentInfo,
            _issue: &IssueContext,
        ) -> Result<RemediationOutcome> {
            self.rollbacks.fetch_add(1, Ordering::SeqCst);
            Ok(RemediationOutcome::action("rollback"))
        }
    }

    struct StubCheckpoints {
        verdicts: Mutex<Vec<CheckpointVerdict>>,
    }

    impl StubCheckpoints {
        fn passing() -> Self {
            Self {
                verdicts: Mutex::new(Vec::new()),
            }
        }

        fn with_verdicts(verdicts: Vec<CheckpointVerdict>) -> Self {
            Self {
                verdicts: Mutex::new(verdicts),
            }
        }
    }

    #[async_trait]
    impl CheckpointRunner for StubCheckpoints {
        async fn run(
            &self,
            _checkpoint: &HealthCheckpoint,
            _namespace: &str,
        ) -> Result<CheckpointVerdict> {
            let mut verdicts = self.verdicts.lock().await;
            if verdicts.is_empty() {
                Ok(CheckpointVerdict::Passed)
            } else {
                Ok(verdicts.remove(0))
            }
        }
    }

    #[derive(Default)]
    struct StubInternal {
        executions: AtomicUsize,
        rollbacks: AtomicUsize,
    }

    #[async_trait]
    impl InternalAdapter for StubInternal {
        async fn execute(
            &self,
            _cancel: &CancellationToken,
            _step: &RemediationStep,
            _issue: &LayeredIssue,
        ) -> Result<RemediationOutcome> {
            self.executions.fetch_add(1, Ordering::SeqCst);
            Ok(RemediationOutcome::action("internal"))
        }

        async fn rollback(
            &self,
            _cancel: &CancellationToken,
            _step: &RemediationStep,
            _issue: &LayeredIssue,
        ) -> Result<RemediationOutcome> {
            self.rollbacks.fetch_add(1, Ordering::SeqCst);
            Ok(RemediationOutcome::action("internal_rollback"))
        }
    }

    struct Harness {
        orchestrator: Arc<Orchestrator>,
        store: Arc<Store>,
        remediator: Arc<StubRemediator>,
        internal: Arc<StubInternal>,
        _dir: tempfile::TempDir,
    }

    async fn harness(
        remediator: StubRemediator,
        checkpoints: StubCheckpoints,
        method: DeploymentMethod,
    ) -> Harness {
        let dir = tempfile::tempdir().unwrap();
        let store = Arc::new(Store::open(dir.path()).await.unwrap());
        let config = EngineConfig::default();
        let metrics = MetricsCollector::new();

        let remediator = Arc::new(remediator);
        let internal = Arc::new(StubInternal::default());
        let selector = Arc::new(RemediatorSelector::new(
            vec![remediator.clone() as Arc<dyn Remediator>],
            remediator.clone() as Arc<dyn Remediator>,
        ));

        let orchestrator = Arc::new(Orchestrator::new(
            store.clone(),
            Arc::new(StubClassifier { method }),
            Arc::new(LayerDetector::new(None, &config.detection, metrics.clone())),
            Planner::new(Duration::from_secs(1)),
            selector,
            Arc::new(checkpoints),
            internal.clone() as Arc<dyn InternalAdapter>,
            metrics,
            CancellationToken::new(),
        ));

        Harness {
            orchestrator,
            store,
            remediator,
            internal,
            _dir: dir,
        }
    }

    fn crash_loop_issue(description: &str) -> IssueContext {
        IssueContext {
            issue_type: "crash_loop".to_string(),
            description: description.to_string(),
            severity: "high".to_string(),
            namespace: "prod".to_string(),
            resource_kind: "Deployment".to_string(),
            resource_name: "payment".to_string(),
        }
    }

    async fn wait_terminal(store: &Store, id: &str) -> Workflow {
        for _ in 0..200 {
            let workflow = store.get_workflow(id).await.unwrap();
            if workflow.status.is_terminal()
                && workflow.status != WorkflowStatus::Failed
            {
                return workflow;
            }
            tokio::time::sleep(Duration::from_millis(50)).await;
        }
        panic!("workflow {id} did not terminate");
    }

    #[tokio::test(start_paused = true)]
    async fn test_single_layer_happy_path() {
        let h = harness(
            StubRemediator::default(),
            StubCheckpoints::passing(),
            DeploymentMethod::Gitops,
        )
        .await;

        let snapshot = h
            .orchestrator
            .clone()
            .trigger("inc-1", crash_loop_issue("pod crashloop backoff"), vec![])
            .await
            .unwrap()
            .workflow;
        assert_eq!(snapshot.status, WorkflowStatus::InProgress);

        let done = wait_terminal(&h.store, &snapshot.id).await;
        assert_eq!(done.status, WorkflowStatus::Completed);
        assert!(done.completed_at.is_some());
        assert_eq!(done.executed_steps.len(), 1);
        assert_eq!(done.executed_steps[0].status, StepStatus::Succeeded);
        assert_eq!(h.remediator.remediations.load(Ordering::SeqCst), 1);

        // Incident was created and resolved.
        let incidents = h
            .store
            .list_incidents(&crate::store::IncidentFilter::default())
            .await;
        assert_eq!(incidents.len(), 1);
        assert_eq!(incidents[0].status, crate::store::IncidentStatus::Resolved);
        assert!(incidents[0].workflow_id.is_some());
    }

    #[tokio::test(start_paused = true)]
    async fn test_multi_layer_checkpoint_failure_rolls_back() {
        // Infrastructure checkpoint fails after both infra steps ran.
        let h = harness(
            StubRemediator::default(),
            StubCheckpoints::with_verdicts(vec![CheckpointVerdict::failed(
                "nodes-ready",
                "node worker-1 is not ready",
            )]),
            DeploymentMethod::Manual,
        )
        .await;

        let snapshot = h
            .orchestrator
            .clone()
            .trigger(
                "inc-2",
                crash_loop_issue("node disk pressure causing pod evictions"),
                vec![ResourceRef {
                    kind: "Node".to_string(),
                    namespace: String::new(),
                    name: "worker-1".to_string(),
                    issue: String::new(),
                }],
            )
            .await
            .unwrap()
            .workflow;

        let done = wait_terminal(&h.store, &snapshot.id).await;
        assert_eq!(done.status, WorkflowStatus::RolledBack);
        assert!(done.error.as_deref().unwrap().contains("nodes-ready"));

        // Both infra steps ran forward, then were rolled back in reverse.
        assert_eq!(h.internal.executions.load(Ordering::SeqCst), 2);
        assert_eq!(h.internal.rollbacks.load(Ordering::SeqCst), 2);
        let rolled: Vec<_> = done
            .executed_steps
            .iter()
            .filter(|s| s.status == StepStatus::RolledBack)
            .collect();
        assert_eq!(rolled.len(), 2);
        // The application step never ran.
        assert_eq!(h.remediator.remediations.load(Ordering::SeqCst), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_optional_step_skipped_after_checkpoint() {
        // Multi-layer issue: infra checkpoint passes, so the optional
        // application step is recorded as skipped.
        let h = harness(
            StubRemediator::default(),
            StubCheckpoints::passing(),
            DeploymentMethod::Manual,
        )
        .await;

        let snapshot = h
            .orchestrator
            .clone()
            .trigger(
                "inc-3",
                crash_loop_issue("node disk pressure causing pod evictions"),
                vec![],
            )
            .await
            .unwrap()
            .workflow;

        let done = wait_terminal(&h.store, &snapshot.id).await;
        assert_eq!(done.status, WorkflowStatus::Completed);

        let app_step = done
            .executed_steps
            .iter()
            .find(|s| s.action_type == "restart_workload")
            .unwrap();
        assert_eq!(app_step.status, StepStatus::Skipped);
        assert_eq!(h.remediator.remediations.load(Ordering::SeqCst), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_remediator_failure_fails_workflow() {
        let h = harness(
            StubRemediator {
                fail: true,
                ..StubRemediator::default()
            },
            StubCheckpoints::passing(),
            DeploymentMethod::Gitops,
        )
        .await;

        let snapshot = h
            .orchestrator
            .clone()
            .trigger("inc-4", crash_loop_issue("pod crashloop backoff"), vec![])
            .await
            .unwrap()
            .workflow;

        let done = wait_terminal(&h.store, &snapshot.id).await;
        assert_eq!(done.status, WorkflowStatus::RolledBack);
        assert_eq!(done.executed_steps[0].status, StepStatus::Failed);
        // A failed step is not rolled back; only succeeded ones are.
        assert_eq!(h.remediator.rollbacks.load(Ordering::SeqCst), 0);

        let incidents = h
            .store
            .list_incidents(&crate::store::IncidentFilter::default())
            .await;
        assert_eq!(incidents[0].status, crate::store::IncidentStatus::Active);
    }

    #[tokio::test(start_paused = true)]
    async fn test_cancellation_triggers_rollback() {
        let h = harness(
            StubRemediator::default(),
            StubCheckpoints::passing(),
            DeploymentMethod::Manual,
        )
        .await;

        let snapshot = h
            .orchestrator
            .clone()
            .trigger(
                "inc-5",
                crash_loop_issue("node disk pressure causing pod evictions"),
                vec![],
            )
            .await
            .unwrap()
            .workflow;

        // Cancel while the first step's settle wait is in progress.
        tokio::time::sleep(Duration::from_millis(10)).await;
        h.orchestrator.root_cancel.cancel();

        let done = wait_terminal(&h.store, &snapshot.id).await;
        assert_eq!(done.status, WorkflowStatus::RolledBack);
    }
}
