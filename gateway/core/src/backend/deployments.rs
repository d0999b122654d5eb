//! In-memory record of detectors that wanted local inference but had none.
//!
//! The deployment manager polls this set to decide which models to roll
//! out; the gateway only ever adds to it.

use chrono::{DateTime, Utc};
use dashmap::DashMap;
use tracing::info;

use super::traits::DeploymentRecorder;

/// Detectors awaiting a local inference deployment
#[derive(Debug, Default)]
pub struct PendingDeployments {
    pending: DashMap<String, DateTime<Utc>>,
}

impl PendingDeployments {
    /// Empty set
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Whether a detector has been recorded
    #[must_use]
    pub fn contains(&self, detector_id: &str) -> bool {
        self.pending.contains_key(detector_id)
    }

    /// When a detector was first recorded
    #[must_use]
    pub fn first_requested(&self, detector_id: &str) -> Option<DateTime<Utc>> {
        self.pending.get(detector_id).map(|at| *at)
    }

    /// Recorded detector ids, sorted
    #[must_use]
    pub fn pending(&self) -> Vec<String> {
        let mut ids: Vec<String> = self.pending.iter().map(|e| e.key().clone()).collect();
        ids.sort();
        ids
    }

    /// Forget a detector once its deployment exists
    pub fn mark_deployed(&self, detector_id: &str) -> bool {
        self.pending.remove(detector_id).is_some()
    }
}

impl DeploymentRecorder for PendingDeployments {
    fn record_inference_needed(&self, detector_id: &str) {
        let mut first = false;
        self.pending.entry(detector_id.to_string()).or_insert_with(|| {
            first = true;
            Utc::now()
        });
        if first {
            info!(detector_id = %detector_id, "Local inference deployment requested");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_records_each_detector_once() {
        let deployments = PendingDeployments::new();
        deployments.record_inference_needed("det_b");
        let first = deployments.first_requested("det_b").unwrap();
        deployments.record_inference_needed("det_b");
        deployments.record_inference_needed("det_a");

        assert_eq!(deployments.pending(), vec!["det_a".to_string(), "det_b".to_string()]);
        assert_eq!(deployments.first_requested("det_b"), Some(first));
    }

    #[test]
    fn test_mark_deployed() {
        let deployments = PendingDeployments::new();
        deployments.record_inference_needed("det_a");

        assert!(deployments.mark_deployed("det_a"));
        assert!(!deployments.contains("det_a"));
        assert!(!deployments.mark_deployed("det_a"));
    }
}
