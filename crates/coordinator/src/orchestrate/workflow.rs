//! Durable workflow records.
//!
//! One workflow tracks one remediation attempt against one incident. Every
//! status transition is persisted before the orchestrator takes its next
//! action, so a restarted engine sees where each attempt stopped.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::detect::deployment::DeploymentMethod;

/// Lifecycle states of a workflow.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum WorkflowStatus {
    Pending,
    InProgress,
    Completed,
    Failed,
    RolledBack,
}

impl WorkflowStatus {
    /// Terminal states carry a completion timestamp.
    #[must_use]
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Completed | Self::Failed | Self::RolledBack)
    }

    /// Legal transitions form a DAG; rollback is only reachable from failed.
    #[must_use]
    pub fn can_transition_to(&self, next: WorkflowStatus) -> bool {
        matches!(
            (self, next),
            (Self::Pending, Self::InProgress)
                | (Self::Pending | Self::InProgress, Self::Failed)
                | (Self::InProgress, Self::Completed)
                | (Self::Failed, Self::RolledBack)
        )
    }
}

impl std::fmt::Display for WorkflowStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            Self::Pending => "pending",
            Self::InProgress => "in_progress",
            Self::Completed => "completed",
            Self::Failed => "failed",
            Self::RolledBack => "rolled_back",
        };
        f.write_str(name)
    }
}

/// How one executed step ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StepStatus {
    Succeeded,
    Failed,
    Skipped,
    RolledBack,
}

/// Record of one executed (or skipped) plan step.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StepRecord {
    pub order: u32,
    pub action_type: String,
    pub target: String,
    pub status: StepStatus,
    /// Actions the remediator reported for this step.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub actions: Vec<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    pub started_at: DateTime<Utc>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub completed_at: Option<DateTime<Utc>>,
}

/// The durable lifecycle record of one remediation attempt.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Workflow {
    pub id: String,
    pub incident_id: String,
    pub status: WorkflowStatus,
    pub deployment_method: DeploymentMethod,
    pub namespace: String,
    pub resource_kind: String,
    pub resource_name: String,
    pub issue_type: String,
    pub remediator_name: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    #[serde(default)]
    pub executed_steps: Vec<StepRecord>,
    pub created_at: DateTime<Utc>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub started_at: Option<DateTime<Utc>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub completed_at: Option<DateTime<Utc>>,
}

impl Workflow {
    /// Fresh pending workflow for an incident.
    #[must_use]
    pub fn new(
        incident_id: &str,
        deployment_method: DeploymentMethod,
        namespace: &str,
        resource_kind: &str,
        resource_name: &str,
        issue_type: &str,
        remediator_name: &str,
    ) -> Self {
        Self {
            id: Uuid::new_v4().to_string(),
            incident_id: incident_id.to_string(),
            status: WorkflowStatus::Pending,
            deployment_method,
            namespace: namespace.to_string(),
            resource_kind: resource_kind.to_string(),
            resource_name: resource_name.to_string(),
            issue_type: issue_type.to_string(),
            remediator_name: remediator_name.to_string(),
            error: None,
            executed_steps: Vec::new(),
            created_at: Utc::now(),
            started_at: None,
            completed_at: None,
        }
    }

    /// Move to a new status, stamping the transition timestamps.
    ///
    /// Illegal transitions are ignored with the record unchanged; the
    /// orchestrator drives transitions and the guard protects the invariant
    /// rather than control flow.
    pub fn transition(&mut self, next: WorkflowStatus) -> bool {
        if !self.status.can_transition_to(next) {
            return false;
        }
        self.status = next;
        match next {
            WorkflowStatus::InProgress => self.started_at = Some(Utc::now()),
            status if status.is_terminal() => self.completed_at = Some(Utc::now()),
            _ => {}
        }
        true
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn workflow() -> Workflow {
        Workflow::new(
            "inc-1",
            DeploymentMethod::Gitops,
            "prod",
            "Deployment",
            "payment",
            "crash_loop",
            "gitops",
        )
    }

    #[test]
    fn test_happy_path_transitions() {
        let mut w = workflow();
        assert_eq!(w.status, WorkflowStatus::Pending);
        assert!(w.completed_at.is_none());

        assert!(w.transition(WorkflowStatus::InProgress));
        assert!(w.started_at.is_some());
        assert!(w.completed_at.is_none());

        assert!(w.transition(WorkflowStatus::Completed));
        assert!(w.status.is_terminal());
        assert!(w.completed_at.is_some());
    }

    #[test]
    fn test_failure_then_rollback() {
        let mut w = workflow();
        assert!(w.transition(WorkflowStatus::InProgress));
        assert!(w.transition(WorkflowStatus::Failed));
        assert!(w.completed_at.is_some());
        assert!(w.transition(WorkflowStatus::RolledBack));
        assert_eq!(w.status, WorkflowStatus::RolledBack);
    }

    #[test]
    fn test_illegal_transitions_rejected() {
        let mut w = workflow();
        // Straight to completed without starting.
        assert!(!w.transition(WorkflowStatus::Completed));
        assert_eq!(w.status, WorkflowStatus::Pending);

        assert!(w.transition(WorkflowStatus::InProgress));
        assert!(w.transition(WorkflowStatus::Completed));
        // Terminal states are final except failed -> rolled_back.
        assert!(!w.transition(WorkflowStatus::InProgress));
        assert!(!w.transition(WorkflowStatus::RolledBack));
    }

    #[test]
    fn test_rollback_only_from_failed() {
        let mut w = workflow();
        assert!(!w.transition(WorkflowStatus::RolledBack));
        assert!(w.transition(WorkflowStatus::InProgress));
        assert!(!w.transition(WorkflowStatus::RolledBack));
        assert!(w.transition(WorkflowStatus::Failed));
        assert!(w.transition(WorkflowStatus::RolledBack));
    }

    #[test]
    fn test_terminal_iff_completed_at() {
        let mut w = workflow();
        w.transition(WorkflowStatus::InProgress);
        assert!(!w.status.is_terminal());
        assert!(w.completed_at.is_none());
        w.transition(WorkflowStatus::Failed);
        assert!(w.status.is_terminal());
        assert!(w.completed_at.is_some());
    }

    #[test]
    fn test_serde_round_trip() {
        let w = workflow();
        let json = serde_json::to_string(&w).unwrap();
        assert!(json.contains("\"status\":\"pending\""));
        assert!(json.contains("\"deployment_method\":\"gitops\""));
        let back: Workflow = serde_json::from_str(&json).unwrap();
        assert_eq!(back.id, w.id);
        assert_eq!(back.status, WorkflowStatus::Pending);
    }
}
