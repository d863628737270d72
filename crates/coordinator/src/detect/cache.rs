//! TTL cache for deployment-detection results.
//!
//! Keyed by `(kind, namespace, name)`. Expired entries are never returned;
//! a background sweeper evicts them on a fixed tick so the map does not grow
//! with one-shot lookups.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use tokio::sync::RwLock;
use tokio_util::sync::CancellationToken;
use tracing::debug;

use super::deployment::DeploymentInfo;

/// Cache key: resource coordinates.
pub type CacheKey = (String, String, String);

#[derive(Debug, Clone)]
struct Entry {
    info: DeploymentInfo,
    inserted_at: DateTime<Utc>,
}

/// TTL cache over detection results. Concurrent readers are permitted;
/// writers serialize for the write window only.
#[derive(Debug, Clone)]
pub struct DetectionCache {
    entries: Arc<RwLock<HashMap<CacheKey, Entry>>>,
    ttl: Duration,
}

impl DetectionCache {
    #[must_use]
    pub fn new(ttl: Duration) -> Self {
        Self {
            entries: Arc::new(RwLock::new(HashMap::new())),
            ttl,
        }
    }

    fn key(kind: &str, namespace: &str, name: &str) -> CacheKey {
        (kind.to_string(), namespace.to_string(), name.to_string())
    }

    /// Fetch a live entry. Expired entries read as a miss.
    pub async fn get(&self, kind: &str, namespace: &str, name: &str) -> Option<DeploymentInfo> {
        let entries = self.entries.read().await;
        let entry = entries.get(&Self::key(kind, namespace, name))?;
        if self.expired(entry) {
            return None;
        }
        Some(entry.info.clone())
    }

    pub async fn set(&self, kind: &str, namespace: &str, name: &str, info: DeploymentInfo) {
        let mut entries = self.entries.write().await;
        entries.insert(
            Self::key(kind, namespace, name),
            Entry {
                info,
                inserted_at: Utc::now(),
            },
        );
    }

    pub async fn invalidate(&self, kind: &str, namespace: &str, name: &str) {
        self.entries
            .write()
            .await
            .remove(&Self::key(kind, namespace, name));
    }

    pub async fn clear(&self) {
        self.entries.write().await.clear();
    }

    /// Number of entries including not-yet-swept expired ones.
    pub async fn len(&self) -> usize {
        self.entries.read().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.entries.read().await.is_empty()
    }

    fn expired(&self, entry: &Entry) -> bool {
        let age = Utc::now() - entry.inserted_at;
        age.to_std().map_or(true, |age| age >= self.ttl)
    }

    /// Drop all expired entries.
    pub async fn sweep(&self) {
        let mut entries = self.entries.write().await;
        let before = entries.len();
        entries.retain(|_, entry| !self.expired(entry));
        let evicted = before - entries.len();
        if evicted > 0 {
            debug!(evicted, "Swept expired detection cache entries");
        }
    }

    /// Spawn the background sweeper. Stops when `cancel` fires.
    pub fn start_sweeper(&self, tick: Duration, cancel: CancellationToken) {
        let cache = self.clone();
        tokio::spawn(async move {
            let mut interval = tokio::time::interval(tick);
            interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
            loop {
                tokio::select! {
                    () = cancel.cancelled() => break,
                    _ = interval.tick() => cache.sweep().await,
                }
            }
            debug!("Detection cache sweeper stopped");
        });
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::detect::deployment::{DeploymentInfo, DeploymentMethod};

    fn info() -> DeploymentInfo {
        DeploymentInfo::manual("prod", "payment", "Deployment")
    }

    #[tokio::test]
    async fn test_get_set_invalidate() {
        let cache = DetectionCache::new(Duration::from_secs(60));
        assert!(cache.get("Deployment", "prod", "payment").await.is_none());

        cache.set("Deployment", "prod", "payment", info()).await;
        let cached = cache.get("Deployment", "prod", "payment").await.unwrap();
        assert_eq!(cached.method, DeploymentMethod::Manual);

        cache.invalidate("Deployment", "prod", "payment").await;
        assert!(cache.get("Deployment", "prod", "payment").await.is_none());
    }

    #[tokio::test]
    async fn test_expired_entry_is_a_miss() {
        let cache = DetectionCache::new(Duration::from_millis(10));
        cache.set("Pod", "prod", "app-1", info()).await;
        tokio::time::sleep(Duration::from_millis(25)).await;
        assert!(cache.get("Pod", "prod", "app-1").await.is_none());
        // Still resident until swept.
        assert_eq!(cache.len().await, 1);
        cache.sweep().await;
        assert!(cache.is_empty().await);
    }

    #[tokio::test]
    async fn test_clear() {
        let cache = DetectionCache::new(Duration::from_secs(60));
        cache.set("Pod", "a", "x", info()).await;
        cache.set("Pod", "b", "y", info()).await;
        cache.clear().await;
        assert!(cache.is_empty().await);
    }
}
