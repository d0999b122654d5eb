//! Escalation Records
//!
//! The unit of work carried by the escalation queue. One record is one
//! pending cloud submission; the image bytes it refers to live in a
//! separate file written before the record itself.

use std::fmt;
use std::path::PathBuf;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

// ============================================================================
// Human Review
// ============================================================================

/// Human review mode requested for an image query
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum HumanReview {
    /// Let the cloud decide (reviews only when unconfident)
    #[default]
    Default,
    /// Always send to a human; skips local inference entirely
    Always,
    /// Never send to a human
    Never,
}

impl HumanReview {
    /// Wire representation
    #[must_use]
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Default => "DEFAULT",
            Self::Always => "ALWAYS",
            Self::Never => "NEVER",
        }
    }
}

impl fmt::Display for HumanReview {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for HumanReview {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_uppercase().as_str() {
            "DEFAULT" => Ok(Self::Default),
            "ALWAYS" => Ok(Self::Always),
            "NEVER" => Ok(Self::Never),
            other => Err(format!("unknown human review mode: {other}")),
        }
    }
}

// ============================================================================
// Submit Parameters
// ============================================================================

/// Parameters forwarded to the cloud when a record is submitted
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct SubmitParams {
    /// Seconds the client is willing to wait for a confident answer
    #[serde(default)]
    pub patience_time: Option<f64>,

    /// Confidence threshold override
    #[serde(default)]
    pub confidence_threshold: Option<f64>,

    /// Human review mode
    #[serde(default)]
    pub human_review: HumanReview,

    /// Free-form metadata attached to the image query
    #[serde(default)]
    pub metadata: Option<serde_json::Value>,

    /// Image query id to reuse in the cloud (idempotency key)
    #[serde(default)]
    pub image_query_id: Option<String>,

    /// Whether the cloud should accept the query without answering inline
    #[serde(default)]
    pub want_async: bool,
}

impl SubmitParams {
    /// Set the image query id
    #[must_use]
    pub fn with_image_query_id(mut self, id: impl Into<String>) -> Self {
        self.image_query_id = Some(id.into());
        self
    }

    /// Set metadata
    #[must_use]
    pub fn with_metadata(mut self, metadata: serde_json::Value) -> Self {
        self.metadata = Some(metadata);
        self
    }

    /// Set async submission
    #[must_use]
    pub fn with_want_async(mut self, want_async: bool) -> Self {
        self.want_async = want_async;
        self
    }
}

// ============================================================================
// Escalation Record
// ============================================================================

/// One pending cloud submission, serialized as a single queue line
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct EscalationRecord {
    /// When the record was created
    pub timestamp: DateTime<Utc>,

    /// Detector the query belongs to
    pub detector_id: String,

    /// Where the image bytes were persisted
    #[serde(rename = "image_path_str")]
    pub image_path: PathBuf,

    /// Globally unique id used for idempotency
    pub request_id: String,

    /// Parameters for the cloud submission
    #[serde(rename = "submit_iq_params")]
    pub submit_params: SubmitParams,
}

impl EscalationRecord {
    /// Create a record with a fresh request id
    pub fn new(
        detector_id: impl Into<String>,
        image_path: impl Into<PathBuf>,
        submit_params: SubmitParams,
    ) -> Self {
        Self {
            timestamp: Utc::now(),
            detector_id: detector_id.into(),
            image_path: image_path.into(),
            request_id: uuid::Uuid::new_v4().to_string(),
            submit_params,
        }
    }

    /// Override the request id (used when the client supplied one)
    #[must_use]
    pub fn with_request_id(mut self, request_id: impl Into<String>) -> Self {
        self.request_id = request_id.into();
        self
    }

    /// Keys under which this record is deduplicated
    pub fn dedup_keys(&self) -> impl Iterator<Item = &str> {
        std::iter::once(self.request_id.as_str())
            .chain(self.submit_params.image_query_id.as_deref())
    }

    /// Encode as one queue line (no trailing newline)
    ///
    /// # Errors
    ///
    /// Returns an error if the metadata cannot be serialized.
    pub fn to_line(&self) -> serde_json::Result<String> {
        serde_json::to_string(self)
    }

    /// Decode from one queue line
    ///
    /// # Errors
    ///
    /// Returns an error if the line is not a valid record.
    pub fn from_line(line: &str) -> serde_json::Result<Self> {
        serde_json::from_str(line.trim_end())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_line_uses_wire_field_names() {
        let record = EscalationRecord::new("det_1", "/tmp/img", SubmitParams::default())
            .with_request_id("req-1");
        let line = record.to_line().unwrap();

        assert!(line.contains("\"image_path_str\""));
        assert!(line.contains("\"submit_iq_params\""));
        assert!(line.contains("\"human_review\":\"DEFAULT\""));
        assert!(!line.contains('\n'));
    }

    #[test]
    fn test_from_line_accepts_sparse_params() {
        let line = r#"{"timestamp":"2024-05-01T12:00:00Z","detector_id":"det_1","image_path_str":"/x","request_id":"r","submit_iq_params":{"want_async":true}}"#;
        let record = EscalationRecord::from_line(line).unwrap();

        assert!(record.submit_params.want_async);
        assert_eq!(record.submit_params.human_review, HumanReview::Default);
        assert_eq!(record.submit_params.patience_time, None);
    }

    #[test]
    fn test_dedup_keys_include_image_query_id() {
        let record = EscalationRecord::new(
            "det_1",
            "/x",
            SubmitParams::default().with_image_query_id("iqe_abc"),
        )
        .with_request_id("req-9");

        let keys: Vec<&str> = record.dedup_keys().collect();
        assert_eq!(keys, vec!["req-9", "iqe_abc"]);
    }

    #[test]
    fn test_human_review_parse() {
        assert_eq!("always".parse::<HumanReview>(), Ok(HumanReview::Always));
        assert_eq!("NEVER".parse::<HumanReview>(), Ok(HumanReview::Never));
        assert!("sometimes".parse::<HumanReview>().is_err());
    }
}
