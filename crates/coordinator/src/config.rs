//! Engine configuration.
//!
//! All inputs are read from the environment at startup with sensible
//! in-cluster defaults, so the binary runs unconfigured inside a pod and
//! fully pinned in tests.

use std::time::Duration;

use anyhow::{Context, Result};

/// Default telemetry backend URL (internal Kubernetes DNS).
const DEFAULT_TELEMETRY_URL: &str =
    "http://prometheus-server.observability.svc.cluster.local:80";

/// Default inference service URL.
const DEFAULT_INFERENCE_URL: &str = "http://model-server.ml.svc.cluster.local:8501";

/// Default GitOps control plane URL.
const DEFAULT_GITOPS_URL: &str = "https://argocd-server.argocd.svc.cluster.local";

/// Top-level engine configuration.
#[derive(Debug, Clone)]
pub struct EngineConfig {
    /// Address the HTTP API listens on.
    pub listen_addr: String,
    /// Grace window for in-flight work on shutdown.
    pub shutdown_grace: Duration,
    /// Directory holding the persisted incident and workflow documents.
    pub data_dir: String,
    pub telemetry: TelemetryConfig,
    pub inference: InferenceConfig,
    pub gitops: GitOpsConfig,
    pub cluster: ClusterConfig,
    pub detection: DetectionConfig,
    pub execution: ExecutionConfig,
}

/// Telemetry backend (read-only metrics) settings.
#[derive(Debug, Clone)]
pub struct TelemetryConfig {
    pub base_url: String,
    pub timeout: Duration,
}

/// ML inference proxy settings.
#[derive(Debug, Clone)]
pub struct InferenceConfig {
    pub base_url: String,
    pub timeout: Duration,
}

/// GitOps control plane settings.
#[derive(Debug, Clone)]
pub struct GitOpsConfig {
    pub base_url: String,
    /// Bearer token for the control plane API. Empty means unauthenticated.
    pub token: String,
    /// Deadline for the whole sync poll loop.
    pub sync_timeout: Duration,
    /// Deadline for each individual request.
    pub request_timeout: Duration,
}

/// Cluster API client settings.
#[derive(Debug, Clone)]
pub struct ClusterConfig {
    /// Sustained request rate against the API server.
    pub qps: u32,
    /// Burst allowance above the sustained rate.
    pub burst: u32,
    /// Per-call deadline.
    pub request_timeout: Duration,
}

/// Detection settings shared by the deployment and layer detectors.
#[derive(Debug, Clone)]
pub struct DetectionConfig {
    /// TTL for cached deployment-detection results.
    pub cache_ttl: Duration,
    /// Eviction sweep interval for the detection cache.
    pub cache_sweep_interval: Duration,
    /// Whether the layer detector consults the inference proxy.
    pub ml_enabled: bool,
    /// Per-layer probability above which ML marks a layer affected.
    pub ml_layer_threshold: f64,
    /// Overall confidence above which the ML root-cause suggestion is adopted.
    pub root_cause_threshold: f64,
}

/// Execution timeouts for plans and checkpoints.
#[derive(Debug, Clone)]
pub struct ExecutionConfig {
    /// Deadline per health checkpoint.
    pub checkpoint_timeout: Duration,
    /// Deadline for package-tool invocations.
    pub helm_timeout: Duration,
    /// Deadline for machine-config rollout stability waits.
    pub mco_stability_timeout: Duration,
    /// Maximum owner-reference hops when searching for a custom resource.
    pub max_owner_depth: usize,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            listen_addr: "0.0.0.0:8080".to_string(),
            shutdown_grace: Duration::from_secs(30),
            data_dir: "/var/lib/coordinator".to_string(),
            telemetry: TelemetryConfig {
                base_url: DEFAULT_TELEMETRY_URL.to_string(),
                timeout: Duration::from_secs(30),
            },
            inference: InferenceConfig {
                base_url: DEFAULT_INFERENCE_URL.to_string(),
                timeout: Duration::from_secs(5),
            },
            gitops: GitOpsConfig {
                base_url: DEFAULT_GITOPS_URL.to_string(),
                token: String::new(),
                sync_timeout: Duration::from_secs(600),
                request_timeout: Duration::from_secs(30),
            },
            cluster: ClusterConfig {
                qps: 50,
                burst: 100,
                request_timeout: Duration::from_secs(10),
            },
            detection: DetectionConfig {
                cache_ttl: Duration::from_secs(300),
                cache_sweep_interval: Duration::from_secs(60),
                ml_enabled: true,
                ml_layer_threshold: 0.75,
                root_cause_threshold: 0.85,
            },
            execution: ExecutionConfig {
                checkpoint_timeout: Duration::from_secs(600),
                helm_timeout: Duration::from_secs(300),
                mco_stability_timeout: Duration::from_secs(600),
                max_owner_depth: 8,
            },
        }
    }
}

impl EngineConfig {
    /// Build the configuration from the environment, falling back to
    /// defaults for anything unset.
    ///
    /// # Errors
    ///
    /// Returns an error if a set variable fails to parse.
    pub fn from_env() -> Result<Self> {
        let mut config = Self::default();

        if let Ok(addr) = std::env::var("LISTEN_ADDR") {
            config.listen_addr = addr;
        }
        if let Some(secs) = env_u64("SHUTDOWN_GRACE_SECS")? {
            config.shutdown_grace = Duration::from_secs(secs);
        }
        if let Ok(dir) = std::env::var("DATA_DIR") {
            config.data_dir = dir;
        }

        if let Ok(url) = std::env::var("TELEMETRY_URL") {
            config.telemetry.base_url = url;
        }
        if let Some(secs) = env_u64("TELEMETRY_TIMEOUT_SECS")? {
            config.telemetry.timeout = Duration::from_secs(secs);
        }

        if let Ok(url) = std::env::var("INFERENCE_URL") {
            config.inference.base_url = url;
        }
        if let Some(secs) = env_u64("INFERENCE_TIMEOUT_SECS")? {
            config.inference.timeout = Duration::from_secs(secs);
        }

        if let Ok(url) = std::env::var("GITOPS_URL") {
            config.gitops.base_url = url;
        }
        if let Ok(token) = std::env::var("GITOPS_TOKEN") {
            config.gitops.token = token;
        }
        if let Some(secs) = env_u64("SYNC_TIMEOUT_SECS")? {
            config.gitops.sync_timeout = Duration::from_secs(secs);
        }

        if let Some(qps) = env_u64("CLUSTER_QPS")? {
            config.cluster.qps = u32::try_from(qps).context("CLUSTER_QPS out of range")?;
        }
        if let Some(burst) = env_u64("CLUSTER_BURST")? {
            config.cluster.burst = u32::try_from(burst).context("CLUSTER_BURST out of range")?;
        }

        if let Some(secs) = env_u64("DETECTION_CACHE_TTL_SECS")? {
            config.detection.cache_ttl = Duration::from_secs(secs);
        }
        if let Ok(raw) = std::env::var("LAYER_ML_ENABLED") {
            config.detection.ml_enabled = raw
                .parse::<bool>()
                .with_context(|| format!("LAYER_ML_ENABLED is not a bool: {raw}"))?;
        }
        if let Some(v) = env_f64("ML_LAYER_THRESHOLD")? {
            config.detection.ml_layer_threshold = v;
        }
        if let Some(v) = env_f64("ROOT_CAUSE_THRESHOLD")? {
            config.detection.root_cause_threshold = v;
        }

        if let Some(secs) = env_u64("CHECKPOINT_TIMEOUT_SECS")? {
            config.execution.checkpoint_timeout = Duration::from_secs(secs);
        }
        if let Some(secs) = env_u64("HELM_TIMEOUT_SECS")? {
            config.execution.helm_timeout = Duration::from_secs(secs);
        }

        Ok(config)
    }
}

fn env_u64(key: &str) -> Result<Option<u64>> {
    match std::env::var(key) {
        Ok(raw) => {
            let value = raw
                .parse::<u64>()
                .with_context(|| format!("{key} is not an integer: {raw}"))?;
            Ok(Some(value))
        }
        Err(_) => Ok(None),
    }
}

fn env_f64(key: &str) -> Result<Option<f64>> {
    match std::env::var(key) {
        Ok(raw) => {
            let value = raw
                .parse::<f64>()
                .with_context(|| format!("{key} is not a number: {raw}"))?;
            Ok(Some(value))
        }
        Err(_) => Ok(None),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serial_test::serial;

    #[test]
    #[serial]
    fn test_from_env_overrides() {
        std::env::set_var("LISTEN_ADDR", "127.0.0.1:9999");
        std::env::set_var("CLUSTER_QPS", "25");
        std::env::set_var("LAYER_ML_ENABLED", "false");
        std::env::set_var("ML_LAYER_THRESHOLD", "0.9");

        let config = EngineConfig::from_env().unwrap();
        assert_eq!(config.listen_addr, "127.0.0.1:9999");
        assert_eq!(config.cluster.qps, 25);
        assert!(!config.detection.ml_enabled);
        assert_eq!(config.detection.ml_layer_threshold, 0.9);

        std::env::remove_var("LISTEN_ADDR");
        std::env::remove_var("CLUSTER_QPS");
        std::env::remove_var("LAYER_ML_ENABLED");
        std::env::remove_var("ML_LAYER_THRESHOLD");
    }

    #[test]
    #[serial]
    fn test_from_env_rejects_garbage() {
        std::env::set_var("CLUSTER_QPS", "not-a-number");
        assert!(EngineConfig::from_env().is_err());
        std::env::remove_var("CLUSTER_QPS");
    }

    #[test]
    #[serial]
    fn test_defaults() {
        let config = EngineConfig::default();
        assert_eq!(config.cluster.qps, 50);
        assert_eq!(config.cluster.burst, 100);
        assert_eq!(config.detection.cache_ttl, Duration::from_secs(300));
        assert_eq!(config.detection.ml_layer_threshold, 0.75);
        assert_eq!(config.detection.root_cause_threshold, 0.85);
        assert_eq!(config.gitops.sync_timeout, Duration::from_secs(600));
        assert_eq!(config.execution.checkpoint_timeout, Duration::from_secs(600));
        assert!(config.detection.ml_enabled);
    }
}
