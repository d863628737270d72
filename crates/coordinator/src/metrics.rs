//! In-process metrics collection.
//!
//! Counters for the remediation lifecycle and detector degradation, exported
//! as Prometheus text by the HTTP layer. Kept deliberately small; the
//! telemetry backend owns everything else.

use std::collections::HashMap;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use tokio::sync::RwLock;

/// Central metrics collector shared across the engine.
#[derive(Debug, Clone)]
pub struct MetricsCollector {
    inner: Arc<RwLock<Counters>>,
    start_time: DateTime<Utc>,
}

#[derive(Debug, Default)]
struct Counters {
    workflows_started_total: u64,
    workflows_completed_total: u64,
    workflows_failed_total: u64,
    workflows_rolled_back_total: u64,
    layer_detection_degraded_total: u64,
    detection_cache_hits_total: u64,
    detection_cache_misses_total: u64,
    remediations_by_method: HashMap<String, u64>,
    checkpoint_failures_total: u64,
}

impl Default for MetricsCollector {
    fn default() -> Self {
        Self::new()
    }
}

impl MetricsCollector {
    #[must_use]
    pub fn new() -> Self {
        Self {
            inner: Arc::new(RwLock::new(Counters::default())),
            start_time: Utc::now(),
        }
    }

    pub async fn workflow_started(&self) {
        self.inner.write().await.workflows_started_total += 1;
    }

    pub async fn workflow_completed(&self) {
        self.inner.write().await.workflows_completed_total += 1;
    }

    pub async fn workflow_failed(&self) {
        self.inner.write().await.workflows_failed_total += 1;
    }

    pub async fn workflow_rolled_back(&self) {
        self.inner.write().await.workflows_rolled_back_total += 1;
    }

    /// The layer detector fell back to the keyword-only path.
    pub async fn layer_detection_degraded(&self) {
        self.inner.write().await.layer_detection_degraded_total += 1;
    }

    pub async fn cache_hit(&self) {
        self.inner.write().await.detection_cache_hits_total += 1;
    }

    pub async fn cache_miss(&self) {
        self.inner.write().await.detection_cache_misses_total += 1;
    }

    pub async fn remediation_selected(&self, method: &str) {
        *self
            .inner
            .write()
            .await
            .remediations_by_method
            .entry(method.to_string())
            .or_insert(0) += 1;
    }

    pub async fn checkpoint_failed(&self) {
        self.inner.write().await.checkpoint_failures_total += 1;
    }

    /// Current degradation count, used by tests and the health handler.
    pub async fn degraded_count(&self) -> u64 {
        self.inner.read().await.layer_detection_degraded_total
    }

    /// Render the Prometheus text exposition format.
    pub async fn render(&self) -> String {
        let counters = self.inner.read().await;
        let uptime = (Utc::now() - self.start_time).num_seconds();

        let mut out = String::new();
        let scalar = [
            ("coordinator_workflows_started_total", counters.workflows_started_total),
            ("coordinator_workflows_completed_total", counters.workflows_completed_total),
            ("coordinator_workflows_failed_total", counters.workflows_failed_total),
            (
                "coordinator_workflows_rolled_back_total",
                counters.workflows_rolled_back_total,
            ),
            (
                "coordinator_layer_detection_degraded_total",
                counters.layer_detection_degraded_total,
            ),
            ("coordinator_detection_cache_hits_total", counters.detection_cache_hits_total),
            (
                "coordinator_detection_cache_misses_total",
                counters.detection_cache_misses_total,
            ),
            ("coordinator_checkpoint_failures_total", counters.checkpoint_failures_total),
        ];
        for (name, value) in scalar {
            out.push_str(&format!("# TYPE {name} counter\n{name} {value}\n"));
        }

        out.push_str("# TYPE coordinator_remediations_total counter\n");
        let mut methods: Vec<_> = counters.remediations_by_method.iter().collect();
        methods.sort_by(|a, b| a.0.cmp(b.0));
        for (method, value) in methods {
            out.push_str(&format!(
                "coordinator_remediations_total{{method=\"{method}\"}} {value}\n"
            ));
        }

        out.push_str(&format!(
            "# TYPE coordinator_uptime_seconds gauge\ncoordinator_uptime_seconds {uptime}\n"
        ));
        out
    }
}
