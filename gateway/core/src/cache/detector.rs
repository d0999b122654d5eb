//! Detector Metadata Cache
//!
//! Detector configuration fetched from the cloud, refreshed once it is
//! older than the staleness threshold. A failed refresh keeps serving the
//! last good value; only a key that was never fetched can fail a request.

use std::sync::Arc;
use std::time::Duration;

use thiserror::Error;
use tracing::{debug, warn};

use super::{RefreshOutcome, StaleTolerantCache};
use crate::backend::{CloudClient, CloudError, DetectorMetadata};

/// Metadata cache errors
#[derive(Debug, Error)]
pub enum CacheError {
    /// No cached value and the fetch failed
    #[error("failed to fetch metadata for detector {detector_id}: {source}")]
    Fetch {
        /// Detector requested
        detector_id: String,
        /// Cloud failure
        #[source]
        source: CloudError,
    },
}

/// Per-process cache of detector metadata
pub struct DetectorMetadataCache {
    cache: StaleTolerantCache<String, DetectorMetadata>,
    cloud: Arc<dyn CloudClient>,
}

impl DetectorMetadataCache {
    /// Cache backed by `cloud`, refreshing after `staleness`
    pub fn new(cloud: Arc<dyn CloudClient>, staleness: Duration) -> Self {
        Self {
            cache: StaleTolerantCache::new(staleness),
            cloud,
        }
    }

    /// Underlying cache, for inspection
    #[must_use]
    pub fn entries(&self) -> &StaleTolerantCache<String, DetectorMetadata> {
        &self.cache
    }

    /// Refresh this detector's entry if it has gone stale
    pub async fn refresh_if_stale(&self, detector_id: &str) -> RefreshOutcome<CloudError> {
        let key = detector_id.to_string();
        let outcome = self
            .cache
            .refresh_if_stale(&key, || self.cloud.get_detector_metadata(detector_id))
            .await;
        match &outcome {
            RefreshOutcome::Refreshed => {
                debug!(detector_id = %detector_id, "Refreshed detector metadata");
            }
            RefreshOutcome::Restored(e) => {
                warn!(
                    detector_id = %detector_id,
                    error = %e,
                    "Metadata refresh failed, serving stale value"
                );
            }
            RefreshOutcome::NotStale => {}
        }
        outcome
    }

    /// Metadata for a detector, fetching on a miss
    ///
    /// # Errors
    ///
    /// Returns `CacheError::Fetch` only when nothing is cached and the
    /// cloud cannot be reached.
    pub async fn get(&self, detector_id: &str) -> Result<DetectorMetadata, CacheError> {
        self.refresh_if_stale(detector_id).await;

        let key = detector_id.to_string();
        if let Some(cached) = self.cache.get(&key) {
            return Ok(cached.value);
        }

        let metadata = self
            .cloud
            .get_detector_metadata(detector_id)
            .await
            .map_err(|source| CacheError::Fetch {
                detector_id: detector_id.to_string(),
                source,
            })?;
        self.cache.insert(key, metadata.clone());
        debug!(detector_id = %detector_id, "Cached detector metadata");
        Ok(metadata)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::DetectorMode;
    use crate::escalation::SubmitParams;
    use crate::backend::ImageQuery;
    use async_trait::async_trait;
    use parking_lot::Mutex;
    use std::sync::atomic::{AtomicUsize, Ordering};

    struct ScriptedCloud {
        threshold: Mutex<f64>,
        online: Mutex<bool>,
        fetches: AtomicUsize,
    }

    impl ScriptedCloud {
        fn new(threshold: f64) -> Self {
            Self {
                threshold: Mutex::new(threshold),
                online: Mutex::new(true),
                fetches: AtomicUsize::new(0),
            }
        }
    }

    #[async_trait]
    impl CloudClient for ScriptedCloud {
        async fn submit_image_query(
            &self,
            _detector_id: &str,
            _image: &[u8],
            _params: &SubmitParams,
        ) -> Result<ImageQuery, CloudError> {
            Err(CloudError::Connectivity("not used".into()))
        }

        async fn get_detector_metadata(
            &self,
            detector_id: &str,
        ) -> Result<DetectorMetadata, CloudError> {
            self.fetches.fetch_add(1, Ordering::SeqCst);
            if !*self.online.lock() {
                return Err(CloudError::Connectivity("offline".into()));
            }
            Ok(DetectorMetadata {
                id: detector_id.to_string(),
                name: "door open".to_string(),
                mode: DetectorMode::Binary,
                confidence_threshold: *self.threshold.lock(),
            })
        }
    }

    #[tokio::test]
    async fn test_miss_fetches_then_hits() {
        let cloud = Arc::new(ScriptedCloud::new(0.9));
        let cache = DetectorMetadataCache::new(cloud.clone(), Duration::from_secs(30));

        assert_eq!(cache.get("det_1").await.unwrap().confidence_threshold, 0.9);
        assert_eq!(cache.get("det_1").await.unwrap().confidence_threshold, 0.9);
        assert_eq!(cloud.fetches.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_offline_refresh_serves_stale_value() {
        let cloud = Arc::new(ScriptedCloud::new(0.8));
        let cache = DetectorMetadataCache::new(cloud.clone(), Duration::ZERO);
        cache.get("det_1").await.unwrap();
        let before = cache.entries().get(&"det_1".to_string()).unwrap();

        *cloud.online.lock() = false;
        tokio::time::sleep(Duration::from_millis(5)).await;

        let metadata = cache.get("det_1").await.unwrap();
        assert_eq!(metadata.confidence_threshold, 0.8);
        let after = cache.entries().get(&"det_1".to_string()).unwrap();
        assert_eq!(after.refreshed_at, before.refreshed_at);
    }

    #[tokio::test]
    async fn test_cold_miss_while_offline_fails() {
        let cloud = Arc::new(ScriptedCloud::new(0.8));
        *cloud.online.lock() = false;
        let cache = DetectorMetadataCache::new(cloud, Duration::from_secs(30));

        assert!(matches!(
            cache.get("det_1").await,
            Err(CacheError::Fetch { .. })
        ));
    }

    #[tokio::test]
    async fn test_stale_value_refreshed_when_online() {
        let cloud = Arc::new(ScriptedCloud::new(0.8));
        let cache = DetectorMetadataCache::new(cloud.clone(), Duration::ZERO);
        cache.get("det_1").await.unwrap();

        *cloud.threshold.lock() = 0.95;
        tokio::time::sleep(Duration::from_millis(5)).await;

        assert_eq!(cache.get("det_1").await.unwrap().confidence_threshold, 0.95);
    }
}
