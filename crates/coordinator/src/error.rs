//! Engine-wide error taxonomy.
//!
//! Every fallible surface in the engine reports one of these kinds. The
//! orchestrator wraps step-level failures in [`EngineError::StepFailed`];
//! the HTTP layer maps kinds to status codes via [`EngineError::code`].

use thiserror::Error;

/// Errors produced by the coordination engine.
#[derive(Debug, Error)]
pub enum EngineError {
    /// Request or record malformed.
    #[error("validation failed: {0}")]
    Validation(String),

    /// Referenced resource, model, or workflow absent.
    #[error("{kind} '{name}' not found")]
    NotFound { kind: String, name: String },

    /// Downstream did not respond within its deadline or is unreachable.
    #[error("{service} unavailable: {reason}")]
    BackendUnavailable { service: String, reason: String },

    /// Authorization check against the cluster failed.
    #[error("permission denied: {0}")]
    PermissionDenied(String),

    /// A bounded wait elapsed without satisfaction.
    #[error("timed out waiting for {0}")]
    Timeout(String),

    /// GitOps reported a non-synced or non-healthy terminal state.
    #[error("gitops sync failed: {0}")]
    SyncFailed(String),

    /// Operator remediator could not locate a custom resource owner.
    #[error("no custom resource owner found for pod '{0}'")]
    OwnerCrNotFound(String),

    /// Advisory failure for issues the engine refuses to auto-remediate.
    #[error("manual intervention required: {0}")]
    ManualInterventionRequired(String),

    /// A health checkpoint's probe came back false.
    #[error("checkpoint for layer {layer} failed at probe {probe}: {reason}")]
    CheckpointFailed {
        layer: String,
        probe: String,
        reason: String,
    },

    /// Step-level wrapper used by the orchestrator during execution.
    #[error("step {order} ({action}) failed: {source}")]
    StepFailed {
        order: u32,
        action: String,
        #[source]
        source: Box<EngineError>,
    },

    /// Backing-file read or write failed.
    #[error("store io error: {0}")]
    StoreIo(#[from] std::io::Error),

    /// Record could not be serialized or deserialized.
    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

/// Result alias used throughout the engine.
pub type Result<T, E = EngineError> = std::result::Result<T, E>;

impl EngineError {
    /// Wrap a kube API error, distinguishing missing objects and RBAC
    /// denials from generic backend failures.
    #[must_use]
    pub fn from_kube(err: &kube::Error, kind: &str, name: &str) -> Self {
        match err {
            kube::Error::Api(resp) if resp.code == 404 => Self::NotFound {
                kind: kind.to_string(),
                name: name.to_string(),
            },
            kube::Error::Api(resp) if resp.code == 403 => {
                Self::PermissionDenied(resp.message.clone())
            }
            other => Self::BackendUnavailable {
                service: "cluster".to_string(),
                reason: other.to_string(),
            },
        }
    }

    /// Machine-readable code from the engine taxonomy.
    #[must_use]
    pub fn code(&self) -> &'static str {
        match self {
            Self::Validation(_) => "validation_failed",
            Self::NotFound { .. } => "not_found",
            Self::BackendUnavailable { .. } => "backend_unavailable",
            Self::PermissionDenied(_) => "permission_denied",
            Self::Timeout(_) => "timeout",
            Self::SyncFailed(_) => "sync_failed",
            Self::OwnerCrNotFound(_) => "owner_cr_not_found",
            Self::ManualInterventionRequired(_) => "manual_intervention_required",
            Self::CheckpointFailed { .. } => "step_failed",
            Self::StepFailed { .. } => "step_failed",
            Self::StoreIo(_) => "backend_io_error",
            Self::Serialization(_) => "backend_io_error",
        }
    }

    /// Whether retrying the same operation could succeed.
    #[must_use]
    pub fn is_recoverable(&self) -> bool {
        matches!(
            self,
            Self::BackendUnavailable { .. } | Self::Timeout(_) | Self::StoreIo(_)
        )
    }

    /// Wrap this error as a step failure for workflow records.
    #[must_use]
    pub fn into_step_failure(self, order: u32, action: &str) -> Self {
        Self::StepFailed {
            order,
            action: action.to_string(),
            source: Box::new(self),
        }
    }

    /// Convenience constructor for downstream unavailability.
    #[must_use]
    pub fn unavailable(service: &str, reason: impl std::fmt::Display) -> Self {
        Self::BackendUnavailable {
            service: service.to_string(),
            reason: reason.to_string(),
        }
    }

    /// Convenience constructor for missing objects.
    #[must_use]
    pub fn not_found(kind: &str, name: &str) -> Self {
        Self::NotFound {
            kind: kind.to_string(),
            name: name.to_string(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_codes_cover_taxonomy() {
        assert_eq!(EngineError::Validation(String::new()).code(), "validation_failed");
        assert_eq!(EngineError::not_found("Pod", "x").code(), "not_found");
        assert_eq!(
            EngineError::unavailable("ml", "connection refused").code(),
            "backend_unavailable"
        );
        assert_eq!(EngineError::Timeout("checkpoint".into()).code(), "timeout");
        assert_eq!(EngineError::SyncFailed("degraded".into()).code(), "sync_failed");
        assert_eq!(
            EngineError::OwnerCrNotFound("pod-1".into()).code(),
            "owner_cr_not_found"
        );
        assert_eq!(
            EngineError::ManualInterventionRequired("imagepull".into()).code(),
            "manual_intervention_required"
        );
    }

    #[test]
    fn test_step_failure_wraps_source() {
        let err = EngineError::Timeout("sync".into()).into_step_failure(3, "sync_application");
        assert_eq!(err.code(), "step_failed");
        assert!(err.to_string().contains("step 3"));
        assert!(err.to_string().contains("sync_application"));
        assert!(err.to_string().contains("timed out"));
    }

    #[test]
    fn test_recoverable_classification() {
        assert!(EngineError::unavailable("helm", "exit 1").is_recoverable());
        assert!(EngineError::Timeout("poll".into()).is_recoverable());
        assert!(!EngineError::Validation("bad".into()).is_recoverable());
        assert!(!EngineError::OwnerCrNotFound("p".into()).is_recoverable());
    }
}
