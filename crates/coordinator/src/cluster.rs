//! Shared cluster API access.
//!
//! Wraps the kube client with a token-bucket rate limit and the dynamic
//! object helpers used when the engine interacts with resources it has no
//! typed bindings for (custom resources, MachineConfigPools,
//! ClusterOperators).

use std::time::Duration;

use kube::api::{Api, DynamicObject};
use kube::core::GroupVersionKind;
use kube::discovery::{oneshot, ApiCapabilities, ApiResource, Scope};
use kube::{Client, Discovery};
use serde_json::Value;
use tokio::sync::Mutex;
use tokio::time::Instant;
use tracing::debug;

use crate::config::ClusterConfig;
use crate::error::{EngineError, Result};

/// Token bucket guarding calls to the API server.
///
/// kube does not carry client-side throttling, so the engine enforces its
/// own sustained rate with a burst allowance.
#[derive(Debug)]
pub struct RateLimiter {
    state: Mutex<BucketState>,
    qps: f64,
    burst: f64,
}

#[derive(Debug)]
struct BucketState {
    tokens: f64,
    last_refill: Instant,
}

impl RateLimiter {
    #[must_use]
    pub fn new(qps: u32, burst: u32) -> Self {
        Self {
            state: Mutex::new(BucketState {
                tokens: f64::from(burst),
                last_refill: Instant::now(),
            }),
            qps: f64::from(qps.max(1)),
            burst: f64::from(burst.max(1)),
        }
    }

    /// Take one token, sleeping until the bucket refills if empty.
    pub async fn acquire(&self) {
        loop {
            let wait = {
                let mut state = self.state.lock().await;
                let now = Instant::now();
                let elapsed = now.duration_since(state.last_refill).as_secs_f64();
                state.tokens = (state.tokens + elapsed * self.qps).min(self.burst);
                state.last_refill = now;

                if state.tokens >= 1.0 {
                    state.tokens -= 1.0;
                    None
                } else {
                    Some(Duration::from_secs_f64((1.0 - state.tokens) / self.qps))
                }
            };

            match wait {
                None => return,
                Some(delay) => tokio::time::sleep(delay).await,
            }
        }
    }
}

/// Shared handle to the cluster: kube client plus the rate limiter and the
/// per-call deadline every caller must respect.
#[derive(Clone)]
pub struct ClusterClient {
    client: Client,
    limiter: std::sync::Arc<RateLimiter>,
    request_timeout: Duration,
}

impl ClusterClient {
    /// Infer the client from the environment (in-cluster service account or
    /// local kubeconfig).
    ///
    /// # Errors
    ///
    /// Returns an error if no usable configuration is found.
    pub async fn infer(config: &ClusterConfig) -> Result<Self> {
        let client = Client::try_default()
            .await
            .map_err(|e| EngineError::unavailable("cluster", e))?;
        Ok(Self::from_client(client, config))
    }

    /// Wrap an existing kube client (tests inject fakes through this).
    #[must_use]
    pub fn from_client(client: Client, config: &ClusterConfig) -> Self {
        Self {
            client,
            limiter: std::sync::Arc::new(RateLimiter::new(config.qps, config.burst)),
            request_timeout: config.request_timeout,
        }
    }

    /// Raw kube client for typed `Api` construction. Callers go through
    /// [`ClusterClient::throttled`] for each request.
    #[must_use]
    pub fn kube(&self) -> Client {
        self.client.clone()
    }

    /// Per-call deadline.
    #[must_use]
    pub fn request_timeout(&self) -> Duration {
        self.request_timeout
    }

    /// Run one API call under the rate limit and the per-call deadline.
    pub async fn throttled<T, F>(&self, what: &str, fut: F) -> Result<T>
    where
        F: std::future::Future<Output = std::result::Result<T, kube::Error>>,
    {
        self.limiter.acquire().await;
        match tokio::time::timeout(self.request_timeout, fut).await {
            Err(_) => Err(EngineError::Timeout(format!("cluster call: {what}"))),
            Ok(Err(e)) => Err(EngineError::from_kube(&e, "object", what)),
            Ok(Ok(value)) => Ok(value),
        }
    }

    /// Resolve the `ApiResource` for an exact group/version/kind.
    pub async fn resource_for(&self, gvk: &GroupVersionKind) -> Result<(ApiResource, ApiCapabilities)> {
        self.limiter.acquire().await;
        oneshot::pinned_kind(&self.client, gvk)
            .await
            .map_err(|e| EngineError::unavailable("cluster discovery", e))
    }

    /// Find an `ApiResource` by kind name across all served groups.
    ///
    /// Returns the resource and whether it is namespaced; `None` when no
    /// group serves the kind.
    pub async fn find_resource_by_kind(
        &self,
        kind: &str,
    ) -> Result<Option<(ApiResource, bool)>> {
        self.limiter.acquire().await;
        let discovery = Discovery::new(self.client.clone())
            .run()
            .await
            .map_err(|e| EngineError::unavailable("cluster discovery", e))?;

        for group in discovery.groups() {
            for (ar, caps) in group.recommended_resources() {
                if ar.kind == kind {
                    debug!(kind = %kind, group = %ar.group, "Resolved kind via discovery");
                    return Ok(Some((ar, caps.scope == Scope::Namespaced)));
                }
            }
        }
        Ok(None)
    }

    /// Probe API server reachability.
    pub async fn health_check(&self) -> bool {
        self.limiter.acquire().await;
        self.client.apiserver_version().await.is_ok()
    }

    /// Dynamic API handle for a namespaced resource.
    #[must_use]
    pub fn dynamic_api(&self, ar: &ApiResource, namespace: &str) -> Api<DynamicObject> {
        Api::namespaced_with(self.client.clone(), namespace, ar)
    }

    /// Dynamic API handle for a cluster-scoped resource.
    #[must_use]
    pub fn dynamic_api_all(&self, ar: &ApiResource) -> Api<DynamicObject> {
        Api::all_with(self.client.clone(), ar)
    }
}

/// Look up a nested string in an untyped cluster object.
///
/// `Ok(None)` means the path is absent; `Err` means a segment exists with a
/// non-object or non-string shape, which callers must treat differently.
pub fn nested_str<'a>(value: &'a Value, path: &[&str]) -> Result<Option<&'a str>> {
    match nested_value(value, path)? {
        None => Ok(None),
        Some(v) => v
            .as_str()
            .map(Some)
            .ok_or_else(|| malformed(path, "string", v)),
    }
}

/// Look up a nested boolean; same absence/malformed contract as
/// [`nested_str`].
pub fn nested_bool(value: &Value, path: &[&str]) -> Result<Option<bool>> {
    match nested_value(value, path)? {
        None => Ok(None),
        Some(v) => v
            .as_bool()
            .map(Some)
            .ok_or_else(|| malformed(path, "bool", v)),
    }
}

/// Look up a nested array; same absence/malformed contract as [`nested_str`].
pub fn nested_array<'a>(value: &'a Value, path: &[&str]) -> Result<Option<&'a Vec<Value>>> {
    match nested_value(value, path)? {
        None => Ok(None),
        Some(v) => v
            .as_array()
            .map(Some)
            .ok_or_else(|| malformed(path, "array", v)),
    }
}

fn nested_value<'a>(value: &'a Value, path: &[&str]) -> Result<Option<&'a Value>> {
    let mut current = value;
    for (i, segment) in path.iter().enumerate() {
        let map = current.as_object().ok_or_else(|| {
            EngineError::Validation(format!(
                "object path {} traverses non-object at '{}'",
                path.join("."),
                path[..i].join(".")
            ))
        })?;
        match map.get(*segment) {
            None => return Ok(None),
            Some(next) => current = next,
        }
    }
    Ok(Some(current))
}

fn malformed(path: &[&str], expected: &str, got: &Value) -> EngineError {
    EngineError::Validation(format!(
        "field {} is not a {expected}: {got}",
        path.join(".")
    ))
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_nested_str_absent_vs_malformed() {
        let obj = json!({
            "status": {"sync": {"status": "Synced"}, "replicas": 3}
        });

        assert_eq!(
            nested_str(&obj, &["status", "sync", "status"]).unwrap(),
            Some("Synced")
        );
        // Absent path is Ok(None).
        assert_eq!(nested_str(&obj, &["status", "health"]).unwrap(), None);
        // Present with the wrong shape is an error.
        assert!(nested_str(&obj, &["status", "replicas"]).is_err());
        // Traversing through a scalar is an error, not absence.
        assert!(nested_str(&obj, &["status", "replicas", "x"]).is_err());
    }

    #[test]
    fn test_nested_bool_and_array() {
        let obj = json!({
            "status": {"ready": true, "conditions": [{"type": "Ready"}]}
        });
        assert_eq!(nested_bool(&obj, &["status", "ready"]).unwrap(), Some(true));
        assert_eq!(nested_bool(&obj, &["status", "missing"]).unwrap(), None);
        assert_eq!(
            nested_array(&obj, &["status", "conditions"]).unwrap().map(Vec::len),
            Some(1)
        );
        assert!(nested_array(&obj, &["status", "ready"]).is_err());
    }

    #[tokio::test]
    async fn test_rate_limiter_allows_burst() {
        let limiter = RateLimiter::new(10, 5);
        let start = Instant::now();
        for _ in 0..5 {
            limiter.acquire().await;
        }
        // The whole burst fits without refill waits.
        assert!(start.elapsed() < Duration::from_millis(100));
    }

    #[tokio::test(start_paused = true)]
    async fn test_rate_limiter_throttles_past_burst() {
        let limiter = RateLimiter::new(10, 1);
        limiter.acquire().await;
        let start = Instant::now();
        limiter.acquire().await;
        // Second acquire needed one token at 10 qps: ~100ms of virtual time.
        assert!(start.elapsed() >= Duration::from_millis(90));
    }
}
