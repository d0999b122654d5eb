//! Gateway Core - Edge Inference Routing and Durable Escalation
//!
//! This crate sits between camera/application clients and a cloud ML
//! service. For every image query it decides whether a locally running
//! model can answer confidently enough, and if not, gets the query to the
//! cloud reliably across network outages, restarts and crashes, without
//! losing queries or submitting duplicates.
//!
//! # Architecture
//!
//! ```text
//! ┌──────────────────────────────────────────────────────────────────┐
//! │                        RoutingEngine                              │
//! │  ┌────────────────┐  ┌──────────────┐  ┌──────────────────────┐  │
//! │  │ DetectorPolicy │  │  Cooldowns   │  │    AuditSampler      │  │
//! │  └───────┬────────┘  └──────────────┘  └──────────────────────┘  │
//! │          │                                                        │
//! │  ┌───────┴──────────────┐   ┌────────────────┐                   │
//! │  │ DetectorMetadataCache│   │ ImageQueryCache│                   │
//! │  └──────────────────────┘   └────────────────┘                   │
//! └────────────┬──────────────────────┬───────────────┬──────────────┘
//!              │                      │               │
//!        EdgeInference           CloudClient     QueueWriter
//!                                     ▲               │
//!                                     │          writing/ ─rename─> reading/
//!                                     │               │
//! ┌───────────────────────────────────┴───────────────┴──────────────┐
//! │                     EscalationConsumer                            │
//! │   QueueReader ─> RequestCache ─> CloudClient ─> FailureRecorder   │
//! └──────────────────────────────────────────────────────────────────┘
//! ```
//!
//! # Quick Start
//!
//! ```ignore
//! use std::sync::Arc;
//! use gateway_core::{
//!     load_config, Collaborators, HttpCloudClient, HttpEdgeInference, ImageQueryRequest,
//!     PendingDeployments, RoutingEngine,
//! };
//!
//! let config = load_config(None)?;
//! let engine = RoutingEngine::new(&config, Collaborators {
//!     edge: Arc::new(HttpEdgeInference::from_config(&config.edge)?),
//!     cloud: Arc::new(HttpCloudClient::from_config(&config.cloud)?),
//!     deployments: Arc::new(PendingDeployments::new()),
//! })?;
//!
//! let response = engine.route(ImageQueryRequest::new("det_2abc", jpeg_bytes)).await?;
//! ```
//!
//! # Module Overview
//!
//! - [`backend`]: collaborator traits and their HTTP implementations
//! - [`cache`]: stale-tolerant in-memory caches
//! - [`config`]: layered TOML + environment configuration
//! - [`dedup`]: filesystem-backed request id cache
//! - [`escalation`]: durable queue writer, reader and consumer
//! - [`failures`]: dropped/failed escalation recorder
//! - [`routing`]: the per-query decision engine

#![warn(missing_docs)]
#![deny(clippy::all)]
#![warn(clippy::pedantic)]
#![allow(clippy::module_name_repetitions)]

pub mod backend;
pub mod cache;
pub mod config;
pub mod dedup;
pub mod escalation;
pub mod failures;
pub mod routing;

// Collaborator exports
pub use backend::{
    CloudClient, CloudError, DeploymentRecorder, DetectorMetadata, DetectorMode, EdgeInference,
    HttpCloudClient, HttpEdgeInference, ImageQuery, InferenceError, InferenceOutput,
    PendingDeployments,
};

// Cache exports
pub use cache::{CacheError, DetectorMetadataCache, ImageQueryCache, StaleTolerantCache};

// Config exports
pub use config::{
    default_config_path, load_config, load_config_from_path, ConfigError, EdgeInferenceConfig,
    GatewayConfig, RetryConfig,
};

// Queue exports
pub use dedup::{DedupError, RequestCache};
pub use escalation::{
    ConsumerConfig, ConsumerError, EscalationConsumer, EscalationRecord, HumanReview, Outcome,
    QueueError, QueueReader, QueueWriter, SubmitParams,
};
pub use failures::{FailureReason, FailureRecorder, RecorderError, RecorderSummary, RetentionPolicy};

// Routing exports
pub use routing::{
    Collaborators, EngineError, ImageQueryRequest, RouteError, RoutedResponse, RoutingEngine,
};
