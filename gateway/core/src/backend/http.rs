//! HTTP Collaborators
//!
//! Thin `reqwest` clients for the cloud API and the local inference server.
//!
//! # Endpoints
//!
//! ```text
//! cloud:  POST {endpoint}/v1/image-queries?detector_id=..   body = image bytes
//!         GET  {endpoint}/v1/detectors/{id}
//! edge:   GET  {url}/v1/models/{id}/ready
//!         POST {url}/v1/models/{id}/infer                    body = image bytes
//! ```

use std::time::Duration;

use async_trait::async_trait;
use reqwest::StatusCode;
use serde::de::DeserializeOwned;
use tracing::debug;

use super::traits::{
    CloudClient, CloudError, DetectorMetadata, EdgeInference, ImageQuery, InferenceError,
    InferenceOutput,
};
use crate::config::{CloudConfig, EdgeConfig};
use crate::escalation::SubmitParams;

/// Header carrying the cloud API token
pub const API_TOKEN_HEADER: &str = "x-api-token";

const IMAGE_CONTENT_TYPE: &str = "image/jpeg";

// ============================================================================
// Cloud
// ============================================================================

/// Cloud API client
#[derive(Clone)]
pub struct HttpCloudClient {
    endpoint: String,
    api_token: Option<String>,
    http_client: reqwest::Client,
}

impl HttpCloudClient {
    /// Create a client for `endpoint`
    ///
    /// # Errors
    ///
    /// Returns an error if the HTTP client cannot be built.
    pub fn new(
        endpoint: impl Into<String>,
        api_token: Option<String>,
        timeout: Duration,
    ) -> reqwest::Result<Self> {
        Ok(Self {
            endpoint: endpoint.into().trim_end_matches('/').to_string(),
            api_token,
            http_client: reqwest::Client::builder().timeout(timeout).build()?,
        })
    }

    /// Create from the `[cloud]` config section
    ///
    /// # Errors
    ///
    /// Returns an error if the HTTP client cannot be built.
    pub fn from_config(config: &CloudConfig) -> reqwest::Result<Self> {
        Self::new(
            config.endpoint.clone(),
            config.api_token(),
            Duration::from_millis(config.timeout_ms),
        )
    }

    fn image_queries_url(&self) -> String {
        format!("{}/v1/image-queries", self.endpoint)
    }

    fn detector_url(&self, detector_id: &str) -> String {
        format!("{}/v1/detectors/{}", self.endpoint, detector_id)
    }

    fn authorize(&self, request: reqwest::RequestBuilder) -> reqwest::RequestBuilder {
        match &self.api_token {
            Some(token) => request.header(API_TOKEN_HEADER, token),
            None => request,
        }
    }
}

/// Query-string pairs for a submission
fn submit_query(detector_id: &str, params: &SubmitParams) -> Vec<(&'static str, String)> {
    let mut query = vec![
        ("detector_id", detector_id.to_string()),
        ("human_review", params.human_review.as_str().to_string()),
        ("want_async", params.want_async.to_string()),
    ];
    if let Some(patience) = params.patience_time {
        query.push(("patience_time", patience.to_string()));
    }
    if let Some(threshold) = params.confidence_threshold {
        query.push(("confidence_threshold", threshold.to_string()));
    }
    if let Some(id) = &params.image_query_id {
        query.push(("image_query_id", id.clone()));
    }
    if let Some(metadata) = &params.metadata {
        query.push(("metadata", metadata.to_string()));
    }
    query
}

async fn decode_cloud<T: DeserializeOwned>(
    result: reqwest::Result<reqwest::Response>,
) -> Result<T, CloudError> {
    let response = result.map_err(|e| CloudError::Connectivity(e.to_string()))?;
    let status = response.status();
    if !status.is_success() {
        let body = response.text().await.unwrap_or_default();
        return Err(CloudError::from_status(status.as_u16(), body));
    }
    response
        .json::<T>()
        .await
        .map_err(|e| CloudError::InvalidResponse(e.to_string()))
}

#[async_trait]
impl CloudClient for HttpCloudClient {
    async fn submit_image_query(
        &self,
        detector_id: &str,
        image: &[u8],
        params: &SubmitParams,
    ) -> Result<ImageQuery, CloudError> {
        debug!(detector_id = %detector_id, bytes = image.len(), "Submitting image query");
        let request = self
            .http_client
            .post(self.image_queries_url())
            .query(&submit_query(detector_id, params))
            .header(reqwest::header::CONTENT_TYPE, IMAGE_CONTENT_TYPE)
            .body(image.to_vec());
        decode_cloud(self.authorize(request).send().await).await
    }

    async fn get_detector_metadata(
        &self,
        detector_id: &str,
    ) -> Result<DetectorMetadata, CloudError> {
        let request = self.http_client.get(self.detector_url(detector_id));
        decode_cloud(self.authorize(request).send().await).await
    }
}

// ============================================================================
// Edge
// ============================================================================

/// Local inference server client
#[derive(Clone)]
pub struct HttpEdgeInference {
    base_url: String,
    http_client: reqwest::Client,
}

impl HttpEdgeInference {
    /// Create a client for the server at `base_url`
    ///
    /// # Errors
    ///
    /// Returns an error if the HTTP client cannot be built.
    pub fn new(base_url: impl Into<String>, timeout: Duration) -> reqwest::Result<Self> {
        Ok(Self {
            base_url: base_url.into().trim_end_matches('/').to_string(),
            http_client: reqwest::Client::builder().timeout(timeout).build()?,
        })
    }

    /// Create from the `[edge]` config section
    ///
    /// # Errors
    ///
    /// Returns an error if the HTTP client cannot be built.
    pub fn from_config(config: &EdgeConfig) -> reqwest::Result<Self> {
        Self::new(
            config.inference_url.clone(),
            Duration::from_millis(config.timeout_ms),
        )
    }

    fn model_url(&self, detector_id: &str, action: &str) -> String {
        format!("{}/v1/models/{}/{}", self.base_url, detector_id, action)
    }
}

#[async_trait]
impl EdgeInference for HttpEdgeInference {
    async fn is_available(&self, detector_id: &str) -> bool {
        match self
            .http_client
            .get(self.model_url(detector_id, "ready"))
            .send()
            .await
        {
            Ok(response) => response.status().is_success(),
            Err(e) => {
                debug!(detector_id = %detector_id, error = %e, "Inference server unreachable");
                false
            }
        }
    }

    async fn infer(
        &self,
        detector_id: &str,
        image: &[u8],
    ) -> Result<InferenceOutput, InferenceError> {
        let response = self
            .http_client
            .post(self.model_url(detector_id, "infer"))
            .header(reqwest::header::CONTENT_TYPE, IMAGE_CONTENT_TYPE)
            .body(image.to_vec())
            .send()
            .await
            .map_err(|e| InferenceError::Failed(e.to_string()))?;

        match response.status() {
            StatusCode::NOT_FOUND => Err(InferenceError::NotDeployed(detector_id.to_string())),
            status if !status.is_success() => Err(InferenceError::Failed(format!(
                "inference server returned {status}"
            ))),
            _ => response
                .json::<InferenceOutput>()
                .await
                .map_err(|e| InferenceError::Failed(e.to_string())),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::escalation::HumanReview;

    #[test]
    fn test_urls_trim_trailing_slash() {
        let cloud =
            HttpCloudClient::new("https://cloud.example/api/", None, Duration::from_secs(1))
                .unwrap();
        assert_eq!(cloud.image_queries_url(), "https://cloud.example/api/v1/image-queries");
        assert_eq!(
            cloud.detector_url("det_1"),
            "https://cloud.example/api/v1/detectors/det_1"
        );

        let edge = HttpEdgeInference::new("http://localhost:8000/", Duration::from_secs(1)).unwrap();
        assert_eq!(
            edge.model_url("det_1", "infer"),
            "http://localhost:8000/v1/models/det_1/infer"
        );
    }

    #[test]
    fn test_submit_query_includes_only_set_params() {
        let params = SubmitParams {
            human_review: HumanReview::Always,
            confidence_threshold: Some(0.75),
            ..Default::default()
        }
        .with_image_query_id("iq_1");

        let query = submit_query("det_1", &params);
        let get = |key: &str| query.iter().find(|(k, _)| *k == key).map(|(_, v)| v.as_str());

        assert_eq!(get("detector_id"), Some("det_1"));
        assert_eq!(get("human_review"), Some("ALWAYS"));
        assert_eq!(get("confidence_threshold"), Some("0.75"));
        assert_eq!(get("image_query_id"), Some("iq_1"));
        assert_eq!(get("patience_time"), None);
        assert_eq!(get("metadata"), None);
    }

    #[tokio::test]
    async fn test_unreachable_cloud_is_connectivity_error() {
        let cloud =
            HttpCloudClient::new("http://127.0.0.1:9", None, Duration::from_millis(500)).unwrap();
        let err = cloud.get_detector_metadata("det_1").await.unwrap_err();
        assert!(err.is_connectivity());
    }
}
