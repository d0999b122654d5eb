//! Collaborator Traits
//!
//! Trait definitions for the services the gateway talks to. The routing
//! engine and the escalation consumer only see these traits, so the local
//! inference runtime, the cloud API and the deployment manager can be
//! swapped (or mocked in tests) without touching core logic.
//!
//! # Collaborators
//!
//! - [`EdgeInference`]: the local model-serving process
//! - [`CloudClient`]: the cloud ML service
//! - [`DeploymentRecorder`]: whoever schedules inference deployments

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::escalation::SubmitParams;

// ============================================================================
// Detector Metadata
// ============================================================================

/// Answer shape of a detector
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum DetectorMode {
    /// Yes/no questions
    #[default]
    Binary,
    /// Object counting
    Count,
    /// One of several labels
    MultiClass,
    /// Text recognition
    Text,
    /// Bounding boxes around objects
    BoundingBox,
}

impl DetectorMode {
    /// Result type reported on image queries for this mode
    #[must_use]
    pub fn result_type(&self) -> &'static str {
        match self {
            Self::Binary => "binary_classification",
            Self::Count => "counting",
            Self::MultiClass => "multi_classification",
            Self::Text => "text_recognition",
            Self::BoundingBox => "bounding_box",
        }
    }
}

/// Server-side detector configuration
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct DetectorMetadata {
    /// Detector id
    pub id: String,
    /// Human-readable name
    #[serde(default)]
    pub name: String,
    /// Answer shape
    #[serde(default)]
    pub mode: DetectorMode,
    /// Default confidence threshold for answers
    pub confidence_threshold: f64,
}

// ============================================================================
// Inference Results
// ============================================================================

/// Axis-aligned box in normalized image coordinates
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct BoundingBox {
    /// Left edge
    pub left: f64,
    /// Top edge
    pub top: f64,
    /// Right edge
    pub right: f64,
    /// Bottom edge
    pub bottom: f64,
}

/// Region of interest reported by a model
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Roi {
    /// Object label
    pub label: String,
    /// Detection score
    pub score: f64,
    /// Location in the image
    pub geometry: BoundingBox,
}

/// Output of one local inference call
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct InferenceOutput {
    /// Predicted label
    pub label: String,
    /// Confidence in [0, 1]
    pub confidence: f64,
    /// Regions of interest, if the model produces them
    #[serde(default)]
    pub rois: Vec<Roi>,
    /// Recognized text, if any
    #[serde(default)]
    pub text: Option<String>,
}

/// Who produced an answer
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ResultSource {
    /// Local model on this gateway
    Edge,
    /// Cloud model
    Cloud,
    /// Rule-based answer (no model involved)
    Algorithm,
}

/// Answer attached to an image query
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct QueryResult {
    /// Label
    pub label: String,
    /// Confidence, absent when the producer reports none
    #[serde(default)]
    pub confidence: Option<f64>,
    /// Producer of the answer
    pub source: ResultSource,
}

/// An image query as returned to clients
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct ImageQuery {
    /// Query id (`iqe_` prefix for edge-created queries)
    pub id: String,
    /// Detector id
    pub detector_id: String,
    /// Creation time
    pub created_at: DateTime<Utc>,
    /// Result type, derived from the detector mode
    pub result_type: String,
    /// Answer, if one is available yet
    #[serde(default)]
    pub result: Option<QueryResult>,
    /// Regions of interest
    #[serde(default)]
    pub rois: Vec<Roi>,
    /// Recognized text
    #[serde(default)]
    pub text: Option<String>,
    /// Whether the answer came from this gateway
    #[serde(default)]
    pub is_edge_result: bool,
    /// Whether processing has finished
    #[serde(default)]
    pub done_processing: bool,
    /// Client metadata
    #[serde(default)]
    pub metadata: Option<serde_json::Value>,
}

impl ImageQuery {
    /// Prefix for ids minted on the edge
    pub const EDGE_ID_PREFIX: &'static str = "iqe_";

    /// Mint a fresh edge image query id
    #[must_use]
    pub fn new_edge_id() -> String {
        format!("{}{}", Self::EDGE_ID_PREFIX, uuid::Uuid::new_v4().simple())
    }

    /// Build an answered query from a local inference result
    #[must_use]
    pub fn from_edge_output(
        id: String,
        detector_id: &str,
        mode: DetectorMode,
        output: &InferenceOutput,
    ) -> Self {
        Self {
            id,
            detector_id: detector_id.to_string(),
            created_at: Utc::now(),
            result_type: mode.result_type().to_string(),
            result: Some(QueryResult {
                label: output.label.clone(),
                confidence: Some(output.confidence),
                source: ResultSource::Edge,
            }),
            rois: output.rois.clone(),
            text: output.text.clone(),
            is_edge_result: true,
            done_processing: true,
            metadata: None,
        }
    }
}

// ============================================================================
// Errors
// ============================================================================

/// Errors from the cloud API
#[derive(Clone, Debug, Error, PartialEq)]
pub enum CloudError {
    /// The cloud could not be reached at all
    #[error("cloud unreachable: {0}")]
    Connectivity(String),

    /// The cloud answered with a retryable status (429 or 5xx)
    #[error("cloud returned {status}: {message}")]
    Server {
        /// HTTP status
        status: u16,
        /// Response body or reason
        message: String,
    },

    /// The cloud permanently rejected the request (4xx)
    #[error("cloud rejected request with {status}: {message}")]
    Rejected {
        /// HTTP status
        status: u16,
        /// Response body or reason
        message: String,
    },

    /// The response could not be decoded
    #[error("unexpected cloud response: {0}")]
    InvalidResponse(String),
}

impl CloudError {
    /// Classify an HTTP error status
    pub fn from_status(status: u16, message: impl Into<String>) -> Self {
        let message = message.into();
        if status == 429 || status >= 500 {
            Self::Server { status, message }
        } else {
            Self::Rejected { status, message }
        }
    }

    /// Whether the same request may succeed later
    #[must_use]
    pub fn is_retryable(&self) -> bool {
        matches!(self, Self::Connectivity(_) | Self::Server { .. })
    }

    /// Whether the failure was a connectivity problem
    #[must_use]
    pub fn is_connectivity(&self) -> bool {
        matches!(self, Self::Connectivity(_))
    }
}

/// Errors from the local inference runtime
#[derive(Clone, Debug, Error, PartialEq)]
pub enum InferenceError {
    /// No model is serving this detector
    #[error("no inference deployment for detector {0}")]
    NotDeployed(String),

    /// The inference server failed
    #[error("inference failed: {0}")]
    Failed(String),
}

// ============================================================================
// Traits
// ============================================================================

/// Local model-serving runtime
#[async_trait]
pub trait EdgeInference: Send + Sync {
    /// Whether a model is currently serving this detector
    async fn is_available(&self, detector_id: &str) -> bool;

    /// Run the local model on one image
    async fn infer(&self, detector_id: &str, image: &[u8])
        -> Result<InferenceOutput, InferenceError>;
}

/// Cloud ML service
#[async_trait]
pub trait CloudClient: Send + Sync {
    /// Submit an image query
    async fn submit_image_query(
        &self,
        detector_id: &str,
        image: &[u8],
        params: &SubmitParams,
    ) -> Result<ImageQuery, CloudError>;

    /// Fetch detector configuration
    async fn get_detector_metadata(&self, detector_id: &str)
        -> Result<DetectorMetadata, CloudError>;
}

/// Sink for "this detector needs a local deployment" requests
pub trait DeploymentRecorder: Send + Sync {
    /// Record that inference for this detector was wanted but unavailable
    fn record_inference_needed(&self, detector_id: &str);
}
