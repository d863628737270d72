//! Proactive recommendations.
//!
//! Correlates current telemetry with the historical workflow record to
//! surface conditions worth fixing before they page anyone. Strictly
//! read-only; a recommendation never mutates cluster state.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use chrono::{Duration as ChronoDuration, Utc};
use serde::Serialize;
use tracing::debug;

use crate::orchestrate::workflow::Workflow;
use crate::store::Store;
use crate::telemetry::{TelemetryReader, Trend};

/// How far back the recurrence analysis looks.
const HISTORY_WINDOW_HOURS: i64 = 24 * 7;

/// Occurrences of the same issue in the window before it counts as
/// recurring.
const RECURRENCE_THRESHOLD: usize = 3;

/// A single proactive recommendation.
#[derive(Debug, Clone, Serialize)]
pub struct Recommendation {
    /// What the recommendation points at (`namespace/issue_type`, node, ...).
    pub target: String,
    /// Recommendation class (`recurring_incident`, `memory_trend`, ...).
    pub kind: String,
    pub reason: String,
    /// Heuristic confidence in `[0, 1]`.
    pub confidence: f64,
}

/// Derives recommendations from telemetry and incident history.
pub struct RecommendationEngine {
    telemetry: TelemetryReader,
    store: Arc<Store>,
}

impl RecommendationEngine {
    #[must_use]
    pub fn new(telemetry: TelemetryReader, store: Arc<Store>) -> Self {
        Self { telemetry, store }
    }

    /// Compute the current recommendation set. Telemetry trouble shrinks
    /// the result instead of failing it.
    pub async fn analyze(&self) -> Vec<Recommendation> {
        let mut recommendations = Vec::new();

        let workflows = self.store.list_workflows().await;
        recommendations.extend(recurring_patterns(&workflows));

        recommendations.extend(self.telemetry_signals().await);

        recommendations.sort_by(|a, b| {
            b.confidence
                .partial_cmp(&a.confidence)
                .unwrap_or(std::cmp::Ordering::Equal)
        });
        recommendations
    }

    async fn telemetry_signals(&self) -> Vec<Recommendation> {
        let mut signals = Vec::new();
        let window = Duration::from_secs(3600);

        match self
            .telemetry
            .trend(
                "sum(container_memory_working_set_bytes)",
                window,
            )
            .await
        {
            Ok(Trend::Rising) => signals.push(Recommendation {
                target: "cluster".to_string(),
                kind: "memory_trend".to_string(),
                reason: "cluster working-set memory has been rising over the last hour"
                    .to_string(),
                confidence: 0.6,
            }),
            Ok(_) => {}
            Err(e) => debug!(error = %e, "Skipping memory trend signal"),
        }

        match self
            .telemetry
            .current_value("sum(increase(kube_pod_container_status_restarts_total[1h]))")
            .await
        {
            Ok(Some(restarts)) if restarts >= 10.0 => signals.push(Recommendation {
                target: "cluster".to_string(),
                kind: "restart_churn".to_string(),
                reason: format!(
                    "{restarts:.0} container restarts in the last hour across the cluster"
                ),
                confidence: 0.7,
            }),
            Ok(_) => {}
            Err(e) => debug!(error = %e, "Skipping restart churn signal"),
        }

        signals
    }
}

/// Issue types that keep coming back in the same namespace.
fn recurring_patterns(workflows: &[Workflow]) -> Vec<Recommendation> {
    let cutoff = Utc::now() - ChronoDuration::hours(HISTORY_WINDOW_HOURS);
    let mut counts: HashMap<(String, String), usize> = HashMap::new();

    for workflow in workflows {
        if workflow.created_at < cutoff {
            continue;
        }
        *counts
            .entry((workflow.namespace.clone(), workflow.issue_type.clone()))
            .or_insert(0) += 1;
    }

    let mut recommendations: Vec<Recommendation> = counts
        .into_iter()
        .filter(|(_, count)| *count >= RECURRENCE_THRESHOLD)
        .map(|((namespace, issue_type), count)| Recommendation {
            target: format!("{namespace}/{issue_type}"),
            kind: "recurring_incident".to_string(),
            reason: format!(
                "{issue_type} remediated {count} times in {namespace} over the last week; \
                 the underlying cause likely persists"
            ),
            confidence: (0.5 + 0.1 * count as f64).min(0.95),
        })
        .collect();
    recommendations.sort_by(|a, b| a.target.cmp(&b.target));
    recommendations
}
