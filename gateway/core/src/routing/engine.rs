//! Routing Decision Engine
//!
//! Decides, per image query, whether the local model answers or the query
//! goes to the cloud, and makes sure anything bound for the cloud gets
//! there even while the network is down.
//!
//! # Decision Flow
//!
//! ```text
//! want_async ──────────────────────────────────────────────> cloud (or queue)
//! human_review=ALWAYS ─────────────────────────────────────> cloud (or queue)
//! edge available ──> infer ──> confident or always-return ──> edge answer
//!                      │               │                        ├─ confident: maybe audit
//!                      │               │                        └─ otherwise: escalate if cooldown elapsed
//!                      │               └─ not confident ───────> cloud (or queue)
//!                      └─ failed ──┐
//! edge unavailable ────────────────┴─> record deployment need ─> 503 if edge required,
//!                                                                else cloud (or queue)
//! ```
//!
//! Audits and low-confidence escalations are written to the queue from
//! detached blocking tasks; the response never waits for them.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Instant;

use serde_json::json;
use thiserror::Error;
use tracing::{debug, error, info, warn};

use super::policy::{AuditSampler, ConnectivityState, CooldownTracker, DetectorPolicy};
use crate::backend::{
    CloudClient, CloudError, DeploymentRecorder, EdgeInference, ImageQuery, InferenceOutput,
};
use crate::cache::{CacheError, DetectorMetadataCache, ImageQueryCache};
use crate::config::{ConfigError, EdgeInferenceConfig, GatewayConfig};
use crate::escalation::{HumanReview, QueueError, QueueWriter, SubmitParams};

// ============================================================================
// Request
// ============================================================================

/// One incoming image query
#[derive(Clone, Debug)]
pub struct ImageQueryRequest {
    /// Detector to ask
    pub detector_id: String,

    /// Encoded image
    pub image: Arc<[u8]>,

    /// Seconds the client will wait for a confident answer
    pub patience_time: Option<f64>,

    /// Confidence threshold override
    pub confidence_threshold: Option<f64>,

    /// Human review mode
    pub human_review: HumanReview,

    /// Submit to the cloud without waiting for an answer
    pub want_async: bool,

    /// Client-chosen image query id
    pub image_query_id: Option<String>,

    /// Inspection the query belongs to
    pub inspection_id: Option<String>,

    /// Free-form metadata
    pub metadata: Option<serde_json::Value>,

    /// Client-supplied idempotency key
    pub request_id: Option<String>,
}

impl ImageQueryRequest {
    /// Request with default parameters
    pub fn new(detector_id: impl Into<String>, image: impl Into<Arc<[u8]>>) -> Self {
        Self {
            detector_id: detector_id.into(),
            image: image.into(),
            patience_time: None,
            confidence_threshold: None,
            human_review: HumanReview::Default,
            want_async: false,
            image_query_id: None,
            inspection_id: None,
            metadata: None,
            request_id: None,
        }
    }

    /// Override the confidence threshold
    #[must_use]
    pub fn with_confidence_threshold(mut self, threshold: f64) -> Self {
        self.confidence_threshold = Some(threshold);
        self
    }

    /// Set human review mode
    #[must_use]
    pub fn with_human_review(mut self, human_review: HumanReview) -> Self {
        self.human_review = human_review;
        self
    }

    /// Ask for async submission
    #[must_use]
    pub fn with_want_async(mut self, want_async: bool) -> Self {
        self.want_async = want_async;
        self
    }

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

    /// Set the idempotency key
    #[must_use]
    pub fn with_request_id(mut self, request_id: impl Into<String>) -> Self {
        self.request_id = Some(request_id.into());
        self
    }

    fn validate(&self) -> Result<(), RouteError> {
        if self.image.is_empty() {
            return Err(RouteError::InvalidRequest("image is empty".into()));
        }
        if let Some(threshold) = self.confidence_threshold {
            if !(0.0..=1.0).contains(&threshold) {
                return Err(RouteError::InvalidRequest(format!(
                    "confidence_threshold must be within [0, 1], got {threshold}"
                )));
            }
        }
        if let Some(patience) = self.patience_time {
            if !patience.is_finite() || patience <= 0.0 {
                return Err(RouteError::InvalidRequest(format!(
                    "patience_time must be positive, got {patience}"
                )));
            }
        }
        Ok(())
    }

    /// Parameters this gateway cannot honour when answering locally
    fn reject_edge_unsupported(&self) -> Result<(), RouteError> {
        let unsupported = [
            ("image_query_id", self.image_query_id.is_some()),
            ("inspection_id", self.inspection_id.is_some()),
            ("metadata", self.metadata.is_some()),
        ];
        match unsupported.iter().find(|(_, set)| *set) {
            Some((name, _)) => Err(RouteError::InvalidRequest(format!(
                "{name} is not supported for queries answered on the edge"
            ))),
            None => Ok(()),
        }
    }

    /// Cloud submission parameters as the client asked for them
    fn submit_params(&self) -> SubmitParams {
        SubmitParams {
            patience_time: self.patience_time,
            confidence_threshold: self.confidence_threshold,
            human_review: self.human_review,
            metadata: self.metadata.clone(),
            image_query_id: self.image_query_id.clone(),
            want_async: self.want_async,
        }
    }
}

// ============================================================================
// Response & Errors
// ============================================================================

/// How a query was answered
#[derive(Clone, Debug, PartialEq)]
pub enum RoutedResponse {
    /// Answered by the local model
    Edge(ImageQuery),
    /// Answered (or accepted) by the cloud
    Cloud(ImageQuery),
    /// Persisted for later delivery to the cloud
    Queued {
        /// Id the cloud will create the query under
        image_query_id: String,
        /// Idempotency key of the queued record
        request_id: String,
    },
}

impl RoutedResponse {
    /// Image query id of the response
    #[must_use]
    pub fn image_query_id(&self) -> &str {
        match self {
            Self::Edge(query) | Self::Cloud(query) => &query.id,
            Self::Queued { image_query_id, .. } => image_query_id,
        }
    }
}

/// Errors surfaced to the client
#[derive(Debug, Error)]
pub enum RouteError {
    /// Bad or incompatible parameters
    #[error("invalid request: {0}")]
    InvalidRequest(String),

    /// The detector requires edge answers and none could be produced
    #[error("edge inference unavailable for detector {0}")]
    EdgeUnavailable(String),

    /// Detector metadata could not be obtained
    #[error(transparent)]
    Metadata(#[from] CacheError),

    /// The cloud failed and the query could not be queued either
    #[error("cloud unavailable and escalation queue failed: {0}")]
    QueueUnavailable(String),

    /// The cloud answered with an error
    #[error(transparent)]
    Cloud(CloudError),
}

impl RouteError {
    /// HTTP status equivalent
    #[must_use]
    pub fn status_code(&self) -> u16 {
        match self {
            Self::InvalidRequest(_) => 400,
            Self::EdgeUnavailable(_) | Self::Metadata(_) | Self::QueueUnavailable(_) => 503,
            Self::Cloud(CloudError::Rejected { status, .. }) => *status,
            Self::Cloud(CloudError::InvalidResponse(_)) => 502,
            Self::Cloud(CloudError::Server { .. } | CloudError::Connectivity(_)) => 503,
        }
    }
}

/// Errors building an engine
#[derive(Debug, Error)]
pub enum EngineError {
    /// The configuration is invalid
    #[error(transparent)]
    Config(#[from] ConfigError),

    /// The escalation queue could not be opened
    #[error(transparent)]
    Queue(#[from] QueueError),
}

// ============================================================================
// Engine
// ============================================================================

/// The services the engine talks to
#[derive(Clone)]
pub struct Collaborators {
    /// Local inference runtime
    pub edge: Arc<dyn EdgeInference>,
    /// Cloud API
    pub cloud: Arc<dyn CloudClient>,
    /// Deployment manager
    pub deployments: Arc<dyn DeploymentRecorder>,
}

/// Per-query edge-vs-cloud router
pub struct RoutingEngine {
    edge: Arc<dyn EdgeInference>,
    cloud: Arc<dyn CloudClient>,
    deployments: Arc<dyn DeploymentRecorder>,
    writer: Arc<QueueWriter>,
    metadata: DetectorMetadataCache,
    image_queries: ImageQueryCache,
    cooldowns: Arc<CooldownTracker>,
    sampler: AuditSampler,
    connectivity: ConnectivityState,
    edge_configs: HashMap<String, EdgeInferenceConfig>,
    default_edge_config: EdgeInferenceConfig,
    audit_rate: f64,
}

impl RoutingEngine {
    /// Build an engine from configuration
    ///
    /// # Errors
    ///
    /// Returns an error if the configuration fails validation or the
    /// escalation queue directories cannot be created.
    pub fn new(config: &GatewayConfig, collaborators: Collaborators) -> Result<Self, EngineError> {
        config.validate()?;
        let writer =
            QueueWriter::with_max_lines(&config.queue.base_dir, config.queue.max_lines_per_segment)?;
        Ok(Self {
            metadata: DetectorMetadataCache::new(
                Arc::clone(&collaborators.cloud),
                config.cache.metadata_staleness(),
            ),
            image_queries: ImageQueryCache::new(
                config.cache.image_query_ttl(),
                config.cache.image_query_max_entries,
            ),
            edge: collaborators.edge,
            cloud: collaborators.cloud,
            deployments: collaborators.deployments,
            writer: Arc::new(writer),
            cooldowns: Arc::new(CooldownTracker::new()),
            sampler: AuditSampler::new(),
            connectivity: ConnectivityState::new(config.routing.connectivity_backoff()),
            edge_configs: config.detectors.clone(),
            default_edge_config: config.routing.default_edge_config.clone(),
            audit_rate: config.routing.confident_audit_rate,
        })
    }

    /// Replace the audit random source
    #[must_use]
    pub fn with_audit_sampler(mut self, sampler: AuditSampler) -> Self {
        self.sampler = sampler;
        self
    }

    /// Queue writer used for escalations
    #[must_use]
    pub fn writer(&self) -> &QueueWriter {
        &self.writer
    }

    /// Detector metadata cache
    #[must_use]
    pub fn metadata_cache(&self) -> &DetectorMetadataCache {
        &self.metadata
    }

    /// Edge-created answer by id, while it is retained
    #[must_use]
    pub fn get_image_query(&self, id: &str) -> Option<ImageQuery> {
        self.image_queries.get(id)
    }

    fn edge_config_for(&self, detector_id: &str) -> &EdgeInferenceConfig {
        self.edge_configs
            .get(detector_id)
            .unwrap_or(&self.default_edge_config)
    }

    /// Route one query
    ///
    /// # Errors
    ///
    /// See [`RouteError::status_code`] for how each failure maps to a
    /// client-facing status.
    pub async fn route(&self, request: ImageQueryRequest) -> Result<RoutedResponse, RouteError> {
        request.validate()?;
        let detector_id = request.detector_id.as_str();
        let edge_config = self.edge_config_for(detector_id);

        if request.want_async {
            if edge_config.always_return_edge_prediction {
                return Err(RouteError::InvalidRequest(
                    "want_async cannot be combined with a detector that always returns edge predictions"
                        .into(),
                ));
            }
            return self.submit_or_enqueue(&request, request.submit_params()).await;
        }

        let metadata = self.metadata.get(detector_id).await?;
        let policy = DetectorPolicy::new(&metadata, edge_config);

        if request.human_review == HumanReview::Always {
            if policy.disable_cloud_escalation {
                return Err(RouteError::InvalidRequest(format!(
                    "human review requested but cloud escalation is disabled for {detector_id}"
                )));
            }
            debug!(detector_id = %detector_id, "Human review requested, skipping local inference");
        } else {
            let output = if policy.edge_enabled && self.edge.is_available(detector_id).await {
                request.reject_edge_unsupported()?;
                match self.edge.infer(detector_id, &request.image).await {
                    Ok(output) => Some(output),
                    Err(e) => {
                        warn!(detector_id = %detector_id, error = %e, "Local inference failed");
                        None
                    }
                }
            } else {
                None
            };

            match output {
                Some(output) => {
                    if let Some(response) = self.answer_from_edge(&request, &policy, output) {
                        return Ok(response);
                    }
                }
                None => {
                    if policy.edge_enabled {
                        self.deployments.record_inference_needed(detector_id);
                    }
                    if policy.always_return_edge {
                        return Err(RouteError::EdgeUnavailable(detector_id.to_string()));
                    }
                }
            }
        }

        // Every path with cloud escalation disabled has returned by now;
        // `new` rejects configs where that would not hold
        assert!(
            !policy.disable_cloud_escalation,
            "cloud escalation disabled for {detector_id} but no edge answer was returned"
        );
        self.submit_or_enqueue(&request, request.submit_params()).await
    }

    /// Build the edge answer if policy allows returning it
    ///
    /// Schedules the audit or low-confidence escalation that goes with it.
    fn answer_from_edge(
        &self,
        request: &ImageQueryRequest,
        policy: &DetectorPolicy,
        output: InferenceOutput,
    ) -> Option<RoutedResponse> {
        let detector_id = request.detector_id.as_str();
        let confident = policy.is_confident(output.confidence, request.confidence_threshold);
        if !confident && !policy.always_return_edge {
            debug!(
                detector_id = %detector_id,
                confidence = output.confidence,
                "Edge answer not confident, escalating"
            );
            return None;
        }

        let query = ImageQuery::from_edge_output(
            ImageQuery::new_edge_id(),
            detector_id,
            policy.mode,
            &output,
        );
        self.image_queries.insert(query.clone());

        if policy.disable_cloud_escalation {
            return Some(RoutedResponse::Edge(query));
        }

        // The client already has its answer, so the cloud need not block
        let escalation = |is_audit: bool| {
            request
                .submit_params()
                .with_image_query_id(query.id.clone())
                .with_want_async(true)
                .with_metadata(json!({
                    "is_edge_audit": is_audit,
                    "edge_result": &output,
                }))
        };

        if confident {
            if self.sampler.should_audit(self.audit_rate) {
                debug!(detector_id = %detector_id, image_query_id = %query.id, "Sampling edge answer for audit");
                self.spawn_escalation(request, escalation(true), None);
            }
        } else if let Some(acquired_at) = self.cooldowns.try_acquire(detector_id, policy.cooldown) {
            self.spawn_escalation(request, escalation(false), Some(acquired_at));
        } else {
            debug!(
                detector_id = %detector_id,
                cooldown_secs = policy.cooldown.as_secs_f64(),
                "Escalation cooldown active, not escalating"
            );
        }

        Some(RoutedResponse::Edge(query))
    }

    /// Queue an escalation from a detached blocking task
    ///
    /// A cooldown slot claimed for this escalation is released if the write
    /// fails, so the next unconfident answer can try again.
    fn spawn_escalation(
        &self,
        request: &ImageQueryRequest,
        params: SubmitParams,
        cooldown_slot: Option<Instant>,
    ) {
        let writer = Arc::clone(&self.writer);
        let cooldowns = Arc::clone(&self.cooldowns);
        let detector_id = request.detector_id.clone();
        let image = Arc::clone(&request.image);
        tokio::task::spawn_blocking(move || {
            let audit = cooldown_slot.is_none();
            match writer.write_escalation(&detector_id, &image, params, None) {
                Ok(record) => info!(
                    detector_id = %detector_id,
                    request_id = %record.request_id,
                    audit,
                    "Background escalation queued"
                ),
                Err(e) => {
                    if let Some(acquired_at) = cooldown_slot {
                        cooldowns.release(&detector_id, acquired_at);
                    }
                    error!(
                        detector_id = %detector_id,
                        audit,
                        error = %e,
                        "Failed to queue background escalation"
                    );
                }
            }
        });
    }

    async fn submit_or_enqueue(
        &self,
        request: &ImageQueryRequest,
        params: SubmitParams,
    ) -> Result<RoutedResponse, RouteError> {
        let detector_id = request.detector_id.as_str();
        if self.connectivity.is_down() {
            debug!(detector_id = %detector_id, "Cloud recently unreachable, queueing directly");
            return self.enqueue(request, params).await;
        }

        match self
            .cloud
            .submit_image_query(detector_id, &request.image, &params)
            .await
        {
            Ok(query) => {
                self.connectivity.mark_up();
                Ok(RoutedResponse::Cloud(query))
            }
            Err(e) if e.is_retryable() => {
                warn!(detector_id = %detector_id, error = %e, "Cloud submission failed, queueing");
                if e.is_connectivity() {
                    self.connectivity.mark_down();
                }
                self.enqueue(request, params).await
            }
            Err(e) => Err(RouteError::Cloud(e)),
        }
    }

    async fn enqueue(
        &self,
        request: &ImageQueryRequest,
        mut params: SubmitParams,
    ) -> Result<RoutedResponse, RouteError> {
        // The client is answered with `Queued`; nobody waits on the submission
        params.want_async = true;
        let image_query_id = params
            .image_query_id
            .get_or_insert_with(|| format!("iq_{}", uuid::Uuid::new_v4().simple()))
            .clone();

        let writer = Arc::clone(&self.writer);
        let detector_id = request.detector_id.clone();
        let image = Arc::clone(&request.image);
        let request_id = request.request_id.clone();
        let record = tokio::task::spawn_blocking(move || {
            writer.write_escalation(&detector_id, &image, params, request_id)
        })
        .await
        .map_err(|e| RouteError::QueueUnavailable(e.to_string()))?
        .map_err(|e| {
            error!(detector_id = %request.detector_id, error = %e, "Failed to queue escalation");
            RouteError::QueueUnavailable(e.to_string())
        })?;

        info!(
            detector_id = %record.detector_id,
            request_id = %record.request_id,
            image_query_id = %image_query_id,
            "Query queued for cloud delivery"
        );
        Ok(RoutedResponse::Queued {
            image_query_id,
            request_id: record.request_id,
        })
    }
}
