//! Shared mock collaborators for integration tests

#![allow(dead_code)]

use std::path::Path;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use parking_lot::Mutex;

use gateway_core::backend::{DetectorMetadata, DetectorMode, InferenceOutput};
use gateway_core::escalation::QueueLayout;
use gateway_core::{
    CloudClient, CloudError, EdgeInference, EscalationRecord, ImageQuery, InferenceError,
    SubmitParams,
};

// =============================================================================
// Cloud
// =============================================================================

/// Cloud that records submissions and can be switched offline
pub struct MockCloud {
    pub threshold: f64,
    pub online: AtomicBool,
    pub reject_with: Mutex<Option<u16>>,
    pub submissions: Mutex<Vec<(String, SubmitParams)>>,
    pub metadata_fetches: AtomicUsize,
}

impl MockCloud {
    pub fn new(threshold: f64) -> Arc<Self> {
        Arc::new(Self {
            threshold,
            online: AtomicBool::new(true),
            reject_with: Mutex::new(None),
            submissions: Mutex::new(Vec::new()),
            metadata_fetches: AtomicUsize::new(0),
        })
    }

    pub fn set_online(&self, online: bool) {
        self.online.store(online, Ordering::SeqCst);
    }

    pub fn submission_count(&self) -> usize {
        self.submissions.lock().len()
    }
}

#[async_trait]
impl CloudClient for MockCloud {
    async fn submit_image_query(
        &self,
        detector_id: &str,
        _image: &[u8],
        params: &SubmitParams,
    ) -> Result<ImageQuery, CloudError> {
        if !self.online.load(Ordering::SeqCst) {
            return Err(CloudError::Connectivity("connection refused".into()));
        }
        if let Some(status) = *self.reject_with.lock() {
            return Err(CloudError::from_status(status, "rejected"));
        }
        self.submissions
            .lock()
            .push((detector_id.to_string(), params.clone()));
        Ok(ImageQuery {
            id: params
                .image_query_id
                .clone()
                .unwrap_or_else(|| "iq_cloud".to_string()),
            detector_id: detector_id.to_string(),
            created_at: chrono::Utc::now(),
            result_type: "binary_classification".to_string(),
            result: None,
            rois: Vec::new(),
            text: None,
            is_edge_result: false,
            done_processing: false,
            metadata: params.metadata.clone(),
        })
    }

    async fn get_detector_metadata(
        &self,
        detector_id: &str,
    ) -> Result<DetectorMetadata, CloudError> {
        self.metadata_fetches.fetch_add(1, Ordering::SeqCst);
        if !self.online.load(Ordering::SeqCst) {
            return Err(CloudError::Connectivity("connection refused".into()));
        }
        Ok(DetectorMetadata {
            id: detector_id.to_string(),
            name: "test detector".to_string(),
            mode: DetectorMode::Binary,
            confidence_threshold: self.threshold,
        })
    }
}

// =============================================================================
// Edge
// =============================================================================

/// Local model with a fixed answer
pub struct MockEdge {
    pub available: AtomicBool,
    pub confidence: Mutex<f64>,
    pub fail: AtomicBool,
    pub inferences: AtomicUsize,
}

impl MockEdge {
    pub fn new(confidence: f64) -> Arc<Self> {
        Arc::new(Self {
            available: AtomicBool::new(true),
            confidence: Mutex::new(confidence),
            fail: AtomicBool::new(false),
            inferences: AtomicUsize::new(0),
        })
    }

    pub fn unavailable() -> Arc<Self> {
        let edge = Self::new(0.0);
        edge.available.store(false, Ordering::SeqCst);
        edge
    }

    pub fn inference_count(&self) -> usize {
        self.inferences.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl EdgeInference for MockEdge {
    async fn is_available(&self, _detector_id: &str) -> bool {
        self.available.load(Ordering::SeqCst)
    }

    async fn infer(
        &self,
        detector_id: &str,
        _image: &[u8],
    ) -> Result<InferenceOutput, InferenceError> {
        self.inferences.fetch_add(1, Ordering::SeqCst);
        if self.fail.load(Ordering::SeqCst) {
            return Err(InferenceError::Failed(format!("{detector_id}: model crashed")));
        }
        Ok(InferenceOutput {
            label: "YES".to_string(),
            confidence: *self.confidence.lock(),
            rois: Vec::new(),
            text: None,
        })
    }
}

// =============================================================================
// Queue helpers
// =============================================================================

/// Every record currently waiting in `writing/`, oldest segment first
pub fn queued_records(base: &Path) -> Vec<EscalationRecord> {
    let layout = QueueLayout::new(base);
    let dir = layout.writing_dir();
    QueueLayout::list_segments(&dir)
        .unwrap()
        .into_iter()
        .flat_map(|name| {
            std::fs::read_to_string(dir.join(name))
                .unwrap_or_default()
                .lines()
                .filter_map(|line| EscalationRecord::from_line(line).ok())
                .collect::<Vec<_>>()
        })
        .collect()
}

/// Poll until `count` records are queued or the timeout passes
pub async fn wait_for_queued(base: &Path, count: usize, timeout: Duration) -> Vec<EscalationRecord> {
    let deadline = Instant::now() + timeout;
    loop {
        let records = queued_records(base);
        if records.len() >= count || Instant::now() >= deadline {
            return records;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
}
