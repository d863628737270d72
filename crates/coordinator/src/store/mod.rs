//! Durable incident and workflow repository.
//!
//! In-memory maps guarded by a multi-reader/single-writer lock, persisted
//! as one JSON document per collection. Writes go through temp-file plus
//! rename so a crash never leaves a torn document. The store assumes a
//! single active writer process.

pub mod incidents;

use std::collections::HashMap;
use std::path::{Path, PathBuf};

use tokio::fs;
use tokio::sync::RwLock;
use tracing::{debug, info, warn};

pub use incidents::{Incident, IncidentFilter, IncidentStatus, NewIncident, Severity};

use crate::error::{EngineError, Result};
use crate::orchestrate::workflow::Workflow;

/// File name of the incident document inside the data directory.
const INCIDENTS_FILE: &str = "incidents.json";
/// File name of the workflow document inside the data directory.
const WORKFLOWS_FILE: &str = "workflows.json";

/// The durable repository.
pub struct Store {
    incidents: RwLock<HashMap<String, Incident>>,
    workflows: RwLock<HashMap<String, Workflow>>,
    incidents_path: PathBuf,
    workflows_path: PathBuf,
}

impl Store {
    /// Open the store, loading any existing documents from `data_dir`.
    ///
    /// # Errors
    ///
    /// Returns an error when the directory cannot be created or an existing
    /// document is unreadable.
    pub async fn open(data_dir: impl AsRef<Path>) -> Result<Self> {
        let data_dir = data_dir.as_ref();
        fs::create_dir_all(data_dir).await?;

        let incidents_path = data_dir.join(INCIDENTS_FILE);
        let workflows_path = data_dir.join(WORKFLOWS_FILE);

        let incidents: HashMap<String, Incident> = load_document(&incidents_path).await?;
        let workflows: HashMap<String, Workflow> = load_document(&workflows_path).await?;
        info!(
            incidents = incidents.len(),
            workflows = workflows.len(),
            dir = %data_dir.display(),
            "Opened incident store"
        );

        Ok(Self {
            incidents: RwLock::new(incidents),
            workflows: RwLock::new(workflows),
            incidents_path,
            workflows_path,
        })
    }

    // --- incidents ---

    /// Validate and persist a new incident, assigning id and timestamps.
    pub async fn create_incident(&self, new: NewIncident) -> Result<Incident> {
        let incident = Incident::from_new(new)?;
        {
            let mut incidents = self.incidents.write().await;
            incidents.insert(incident.id.clone(), incident.clone());
            persist_document(&self.incidents_path, &*incidents).await?;
        }
        debug!(incident = %incident.id, "Created incident");
        Ok(incident)
    }

    /// Insert an incident under its existing id (used when the caller
    /// supplies the identifier, e.g. an externally reported incident).
    pub async fn put_incident(&self, incident: Incident) -> Result<Incident> {
        incident.validate()?;
        let mut incidents = self.incidents.write().await;
        incidents.insert(incident.id.clone(), incident.clone());
        persist_document(&self.incidents_path, &*incidents).await?;
        Ok(incident)
    }

    pub async fn get_incident(&self, id: &str) -> Result<Incident> {
        self.incidents
            .read()
            .await
            .get(id)
            .cloned()
            .ok_or_else(|| EngineError::not_found("incident", id))
    }

    /// Replace an existing incident after re-validation.
    pub async fn update_incident(&self, mut incident: Incident) -> Result<Incident> {
        incident.validate()?;
        incident.updated_at = chrono::Utc::now();
        let mut incidents = self.incidents.write().await;
        if !incidents.contains_key(&incident.id) {
            return Err(EngineError::not_found("incident", &incident.id));
        }
        incidents.insert(incident.id.clone(), incident.clone());
        persist_document(&self.incidents_path, &*incidents).await?;
        Ok(incident)
    }

    pub async fn delete_incident(&self, id: &str) -> Result<()> {
        let mut incidents = self.incidents.write().await;
        if incidents.remove(id).is_none() {
            return Err(EngineError::not_found("incident", id));
        }
        persist_document(&self.incidents_path, &*incidents).await?;
        Ok(())
    }

    /// Filtered listing, newest first.
    pub async fn list_incidents(&self, filter: &IncidentFilter) -> Vec<Incident> {
        let incidents = self.incidents.read().await;
        let mut matched: Vec<Incident> = incidents
            .values()
            .filter(|incident| filter.matches(incident))
            .cloned()
            .collect();
        matched.sort_by(|a, b| b.created_at.cmp(&a.created_at));
        matched.truncate(filter.effective_limit());
        matched
    }

    /// Total incident count, unfiltered.
    pub async fn incident_count(&self) -> usize {
        self.incidents.read().await.len()
    }

    // --- workflows ---

    /// Insert or replace a workflow record and persist the collection.
    ///
    /// The orchestrator calls this on every transition, so the durable
    /// record never lags the in-memory one past a single mutation.
    pub async fn save_workflow(&self, workflow: &Workflow) -> Result<()> {
        let mut workflows = self.workflows.write().await;
        workflows.insert(workflow.id.clone(), workflow.clone());
        persist_document(&self.workflows_path, &*workflows).await?;
        Ok(())
    }

    pub async fn get_workflow(&self, id: &str) -> Result<Workflow> {
        self.workflows
            .read()
            .await
            .get(id)
            .cloned()
            .ok_or_else(|| EngineError::not_found("workflow", id))
    }

    /// All workflows, newest first.
    pub async fn list_workflows(&self) -> Vec<Workflow> {
        let workflows = self.workflows.read().await;
        let mut all: Vec<Workflow> = workflows.values().cloned().collect();
        all.sort_by(|a, b| b.created_at.cmp(&a.created_at));
        all
    }

    /// Workflows recorded against a namespace, newest first. Feeds the
    /// recommendation engine's recurrence analysis.
    pub async fn workflows_in_namespace(&self, namespace: &str) -> Vec<Workflow> {
        let workflows = self.workflows.read().await;
        let mut matched: Vec<Workflow> = workflows
            .values()
            .filter(|w| w.namespace == namespace)
            .cloned()
            .collect();
        matched.sort_by(|a, b| b.created_at.cmp(&a.created_at));
        matched
    }
}

async fn load_document<T: serde::de::DeserializeOwned>(
    path: &Path,
) -> Result<HashMap<String, T>> {
    match fs::read_to_string(path).await {
        Ok(content) => {
            let map = serde_json::from_str(&content)?;
            Ok(map)
        }
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(HashMap::new()),
        Err(e) => {
            warn!(path = %path.display(), error = %e, "Failed to read store document");
            Err(EngineError::StoreIo(e))
        }
    }
}

/// Write the document atomically: serialize to a temp file in the same
/// directory, then rename over the target.
async fn persist_document<T: serde::Serialize>(
    path: &Path,
    map: &HashMap<String, T>,
) -> Result<()> {
    let content = serde_json::to_string_pretty(map)?;
    let tmp = path.with_extension("json.tmp");
    fs::write(&tmp, content).await?;
    fs::rename(&tmp, path).await?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::detect::deployment::DeploymentMethod;
    use crate::detect::layers::ResourceRef;
    use crate::orchestrate::workflow::WorkflowStatus;

    fn new_incident(title: &str, severity: Severity, namespace: &str) -> NewIncident {
        NewIncident {
            title: title.to_string(),
            description: "test incident".to_string(),
            severity,
            target: format!("{namespace}/app"),
            affected_resources: vec![ResourceRef {
                kind: "Deployment".to_string(),
                namespace: namespace.to_string(),
                name: "app".to_string(),
                issue: String::new(),
            }],
            labels: HashMap::new(),
        }
    }

    async fn store() -> (Store, tempfile::TempDir) {
        let dir = tempfile::tempdir().unwrap();
        let store = Store::open(dir.path()).await.unwrap();
        (store, dir)
    }

    #[tokio::test]
    async fn test_create_get_update_delete() {
        let (store, _dir) = store().await;

        let created = store
            .create_incident(new_incident("a", Severity::High, "prod"))
            .await
            .unwrap();
        let fetched = store.get_incident(&created.id).await.unwrap();
        assert_eq!(fetched.title, "a");

        let mut updated = fetched.clone();
        updated.resolve();
        let saved = store.update_incident(updated).await.unwrap();
        assert_eq!(saved.status, IncidentStatus::Resolved);

        store.delete_incident(&created.id).await.unwrap();
        let err = store.get_incident(&created.id).await.unwrap_err();
        assert_eq!(err.code(), "not_found");
    }

    #[tokio::test]
    async fn test_list_sorted_desc_and_filtered() {
        let (store, _dir) = store().await;

        for (title, severity, namespace) in [
            ("first", Severity::Low, "prod"),
            ("second", Severity::High, "prod"),
            ("third", Severity::High, "staging"),
        ] {
            store
                .create_incident(new_incident(title, severity, namespace))
                .await
                .unwrap();
            tokio::time::sleep(std::time::Duration::from_millis(5)).await;
        }

        let all = store.list_incidents(&IncidentFilter::default()).await;
        assert_eq!(all.len(), 3);
        assert!(all.windows(2).all(|w| w[0].created_at >= w[1].created_at));
        assert_eq!(all[0].title, "third");

        let prod_high = store
            .list_incidents(&IncidentFilter {
                namespace: Some("prod".to_string()),
                severity: Some(Severity::High),
                ..IncidentFilter::default()
            })
            .await;
        assert_eq!(prod_high.len(), 1);
        assert_eq!(prod_high[0].title, "second");

        let limited = store
            .list_incidents(&IncidentFilter {
                limit: Some(2),
                ..IncidentFilter::default()
            })
            .await;
        assert_eq!(limited.len(), 2);
    }

    #[tokio::test]
    async fn test_persistence_survives_reopen() {
        let dir = tempfile::tempdir().unwrap();

        let id = {
            let store = Store::open(dir.path()).await.unwrap();
            let incident = store
                .create_incident(new_incident("durable", Severity::Critical, "prod"))
                .await
                .unwrap();

            let workflow = Workflow::new(
                &incident.id,
                DeploymentMethod::Gitops,
                "prod",
                "Deployment",
                "app",
                "crash_loop",
                "gitops",
            );
            store.save_workflow(&workflow).await.unwrap();
            incident.id
        };

        let reopened = Store::open(dir.path()).await.unwrap();
        let incident = reopened.get_incident(&id).await.unwrap();
        assert_eq!(incident.title, "durable");
        assert_eq!(reopened.list_workflows().await.len(), 1);
    }

    #[tokio::test]
    async fn test_no_temp_file_left_behind() {
        let dir = tempfile::tempdir().unwrap();
        let store = Store::open(dir.path()).await.unwrap();
        store
            .create_incident(new_incident("a", Severity::Low, "prod"))
            .await
            .unwrap();

        let leftovers: Vec<_> = std::fs::read_dir(dir.path())
            .unwrap()
            .filter_map(|e| e.ok())
            .filter(|e| e.path().extension().is_some_and(|ext| ext == "tmp"))
            .collect();
        assert!(leftovers.is_empty());
        assert!(dir.path().join(INCIDENTS_FILE).exists());
    }

    #[tokio::test]
    async fn test_validation_rejected_before_write() {
        let (store, dir) = store().await;
        let mut bad = new_incident("x", Severity::Low, "prod");
        bad.title = "t".repeat(500);
        let err = store.create_incident(bad).await.unwrap_err();
        assert_eq!(err.code(), "validation_failed");
        assert!(!dir.path().join(INCIDENTS_FILE).exists());
    }

    #[tokio::test]
    async fn test_workflow_updates_replace_record() {
        let (store, _dir) = store().await;
        let mut workflow = Workflow::new(
            "inc-1",
            DeploymentMethod::Package,
            "prod",
            "Deployment",
            "billing",
            "crash_loop",
            "helm",
        );
        store.save_workflow(&workflow).await.unwrap();

        workflow.transition(WorkflowStatus::InProgress);
        workflow.transition(WorkflowStatus::Completed);
        store.save_workflow(&workflow).await.unwrap();

        let fetched = store.get_workflow(&workflow.id).await.unwrap();
        assert_eq!(fetched.status, WorkflowStatus::Completed);
        assert_eq!(store.list_workflows().await.len(), 1);
    }
}
