//! Incident records and validation.

use std::collections::HashMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::detect::layers::ResourceRef;
use crate::error::{EngineError, Result};

/// Maximum accepted lengths for free-form fields.
pub const MAX_TITLE_LEN: usize = 200;
pub const MAX_DESCRIPTION_LEN: usize = 2000;
pub const MAX_TARGET_LEN: usize = 100;

/// Incident severity.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Severity {
    Low,
    Medium,
    High,
    Critical,
}

impl Severity {
    #[must_use]
    pub fn parse(raw: &str) -> Option<Self> {
        match raw {
            "low" => Some(Self::Low),
            "medium" => Some(Self::Medium),
            "high" => Some(Self::High),
            "critical" => Some(Self::Critical),
            _ => None,
        }
    }
}

/// Incident lifecycle status.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum IncidentStatus {
    Active,
    Resolved,
    Cancelled,
}

impl IncidentStatus {
    #[must_use]
    pub fn parse(raw: &str) -> Option<Self> {
        match raw {
            "active" => Some(Self::Active),
            "resolved" => Some(Self::Resolved),
            "cancelled" => Some(Self::Cancelled),
            _ => None,
        }
    }
}

/// An externally reported incident.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Incident {
    pub id: String,
    pub title: String,
    pub description: String,
    pub severity: Severity,
    /// The workload or component the incident points at.
    pub target: String,
    pub status: IncidentStatus,
    #[serde(default)]
    pub affected_resources: Vec<ResourceRef>,
    #[serde(default)]
    pub labels: HashMap<String, String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub resolved_at: Option<DateTime<Utc>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub workflow_id: Option<String>,
}

/// Fields a caller supplies to open an incident.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NewIncident {
    pub title: String,
    pub description: String,
    pub severity: Severity,
    pub target: String,
    #[serde(default)]
    pub affected_resources: Vec<ResourceRef>,
    #[serde(default)]
    pub labels: HashMap<String, String>,
}

impl Incident {
    /// Build a validated incident from caller input.
    pub fn from_new(new: NewIncident) -> Result<Self> {
        validate_lengths(&new.title, &new.description, &new.target)?;
        let now = Utc::now();
        Ok(Self {
            id: Uuid::new_v4().to_string(),
            title: new.title,
            description: new.description,
            severity: new.severity,
            target: new.target,
            status: IncidentStatus::Active,
            affected_resources: new.affected_resources,
            labels: new.labels,
            created_at: now,
            updated_at: now,
            resolved_at: None,
            workflow_id: None,
        })
    }

    /// Re-validate an incident before an update is accepted.
    pub fn validate(&self) -> Result<()> {
        validate_lengths(&self.title, &self.description, &self.target)?;
        if self.status == IncidentStatus::Resolved && self.resolved_at.is_none() {
            return Err(EngineError::Validation(
                "resolved incident is missing resolved_at".to_string(),
            ));
        }
        if self.status != IncidentStatus::Resolved && self.resolved_at.is_some() {
            return Err(EngineError::Validation(
                "resolved_at set on a non-resolved incident".to_string(),
            ));
        }
        Ok(())
    }

    /// Mark the incident resolved, stamping both timestamps.
    pub fn resolve(&mut self) {
        self.status = IncidentStatus::Resolved;
        let now = Utc::now();
        self.resolved_at = Some(now);
        self.updated_at = now;
    }
}

fn validate_lengths(title: &str, description: &str, target: &str) -> Result<()> {
    if title.is_empty() {
        return Err(EngineError::Validation("title must not be empty".to_string()));
    }
    if title.len() > MAX_TITLE_LEN {
        return Err(EngineError::Validation(format!(
            "title exceeds {MAX_TITLE_LEN} characters"
        )));
    }
    if description.len() > MAX_DESCRIPTION_LEN {
        return Err(EngineError::Validation(format!(
            "description exceeds {MAX_DESCRIPTION_LEN} characters"
        )));
    }
    if target.len() > MAX_TARGET_LEN {
        return Err(EngineError::Validation(format!(
            "target exceeds {MAX_TARGET_LEN} characters"
        )));
    }
    Ok(())
}

/// Conjunctive filter for incident listings.
#[derive(Debug, Clone, Default)]
pub struct IncidentFilter {
    pub namespace: Option<String>,
    pub severity: Option<Severity>,
    pub status: Option<IncidentStatus>,
    pub limit: Option<usize>,
}

/// Hard cap on listing size.
pub const MAX_LIST_LIMIT: usize = 500;

impl IncidentFilter {
    /// Effective limit after applying the cap.
    #[must_use]
    pub fn effective_limit(&self) -> usize {
        self.limit.unwrap_or(MAX_LIST_LIMIT).min(MAX_LIST_LIMIT)
    }

    /// Whether an incident satisfies every set criterion.
    #[must_use]
    pub fn matches(&self, incident: &Incident) -> bool {
        if let Some(namespace) = &self.namespace {
            let in_namespace = incident
                .affected_resources
                .iter()
                .any(|r| &r.namespace == namespace)
                || incident.labels.get("namespace") == Some(namespace);
            if !in_namespace {
                return false;
            }
        }
        if let Some(severity) = self.severity {
            if incident.severity != severity {
                return false;
            }
        }
        if let Some(status) = self.status {
            if incident.status != status {
                return false;
            }
        }
        true
    }
}
