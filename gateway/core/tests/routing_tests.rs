//! Routing engine integration tests
//!
//! Drive the engine end to end against mock edge and cloud collaborators,
//! checking both the response and what ends up in the escalation queue.

mod common;

use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use pretty_assertions::assert_eq;
use serde_json::json;

use gateway_core::routing::AuditSampler;
use gateway_core::{
    Collaborators, ConfigError, ConsumerConfig, EdgeInferenceConfig, EngineError,
    EscalationConsumer, GatewayConfig, HumanReview, ImageQueryRequest, Outcome,
    PendingDeployments, RouteError, RoutedResponse, RoutingEngine,
};

use common::{queued_records, wait_for_queued, MockCloud, MockEdge};

const DETECTOR: &str = "det_dock_door";
const IMAGE: &[u8] = b"\xff\xd8jpeg";

struct Harness {
    _dir: tempfile::TempDir,
    queue_dir: std::path::PathBuf,
    cloud: Arc<MockCloud>,
    edge: Arc<MockEdge>,
    deployments: Arc<PendingDeployments>,
    engine: RoutingEngine,
}

fn harness(edge: Arc<MockEdge>, edge_config: EdgeInferenceConfig) -> Harness {
    harness_with(edge, edge_config, |_| {})
}

fn harness_with(
    edge: Arc<MockEdge>,
    edge_config: EdgeInferenceConfig,
    tweak: impl FnOnce(&mut GatewayConfig),
) -> Harness {
    let dir = tempfile::tempdir().unwrap();
    let mut config = GatewayConfig::default();
    config.queue.base_dir = dir.path().join("queue");
    config.routing.confident_audit_rate = 0.0;
    config.detectors.insert(DETECTOR.to_string(), edge_config);
    tweak(&mut config);
    config.validate().unwrap();

    let cloud = MockCloud::new(0.9);
    let deployments = Arc::new(PendingDeployments::new());
    let engine = RoutingEngine::new(
        &config,
        Collaborators {
            edge: edge.clone(),
            cloud: cloud.clone(),
            deployments: deployments.clone(),
        },
    )
    .unwrap();

    Harness {
        queue_dir: config.queue.base_dir.clone(),
        _dir: dir,
        cloud,
        edge,
        deployments,
        engine,
    }
}

fn always_edge(cooldown_secs: f64) -> EdgeInferenceConfig {
    EdgeInferenceConfig {
        always_return_edge_prediction: true,
        min_time_between_escalations: cooldown_secs,
        ..Default::default()
    }
}

fn request() -> ImageQueryRequest {
    ImageQueryRequest::new(DETECTOR, IMAGE)
}

async fn settle(queue_dir: &Path, expected: usize) -> usize {
    let found = wait_for_queued(queue_dir, expected, Duration::from_secs(2)).await;
    // Give any unexpected extra background write a chance to show up
    tokio::time::sleep(Duration::from_millis(100)).await;
    found.len().max(queued_records(queue_dir).len())
}

// =============================================================================
// Confidence
// =============================================================================

#[tokio::test]
async fn test_confidence_equal_to_threshold_is_answered_on_edge() {
    let h = harness(MockEdge::new(0.9), EdgeInferenceConfig::default());

    let response = h.engine.route(request()).await.unwrap();

    let RoutedResponse::Edge(query) = &response else {
        panic!("expected an edge answer, got {response:?}");
    };
    assert!(query.id.starts_with("iqe_"));
    assert!(query.is_edge_result);
    assert_eq!(h.cloud.submission_count(), 0);
    assert_eq!(h.engine.get_image_query(&query.id).as_ref(), Some(query));
}

#[tokio::test]
async fn test_confidence_just_below_threshold_goes_to_cloud() {
    let just_below = f64::from_bits(0.9_f64.to_bits() - 1);
    let h = harness(MockEdge::new(just_below), EdgeInferenceConfig::default());

    let response = h.engine.route(request()).await.unwrap();

    assert!(matches!(response, RoutedResponse::Cloud(_)));
    assert_eq!(h.cloud.submission_count(), 1);
}

#[tokio::test]
async fn test_request_threshold_override() {
    let h = harness(MockEdge::new(0.6), EdgeInferenceConfig::default());

    let response = h
        .engine
        .route(request().with_confidence_threshold(0.5))
        .await
        .unwrap();

    assert!(matches!(response, RoutedResponse::Edge(_)));
}

// =============================================================================
// Escalation policy
// =============================================================================

#[tokio::test]
async fn test_cooldown_limits_low_confidence_escalations() {
    let h = harness(MockEdge::new(0.5), always_edge(2.0));

    let first = h.engine.route(request()).await.unwrap();
    tokio::time::sleep(Duration::from_millis(500)).await;
    let second = h.engine.route(request()).await.unwrap();

    assert!(matches!(first, RoutedResponse::Edge(_)));
    assert!(matches!(second, RoutedResponse::Edge(_)));
    assert_eq!(settle(&h.queue_dir, 1).await, 1);

    let escalation = &queued_records(&h.queue_dir)[0];
    assert_eq!(escalation.detector_id, DETECTOR);
    assert_eq!(
        escalation.submit_params.image_query_id.as_deref(),
        Some(first.image_query_id())
    );
    assert!(escalation.submit_params.want_async);
    let metadata = escalation.submit_params.metadata.as_ref().unwrap();
    assert_eq!(metadata["is_edge_audit"], json!(false));
    assert_eq!(metadata["edge_result"]["label"], json!("YES"));
    assert_eq!(h.cloud.submission_count(), 0);
}

#[tokio::test]
async fn test_confident_answers_are_sampled_for_audit() {
    let h = harness_with(MockEdge::new(0.99), EdgeInferenceConfig::default(), |config| {
        config.routing.confident_audit_rate = 1.0;
    });
    let engine = h.engine.with_audit_sampler(AuditSampler::seeded(42));

    let response = engine.route(request()).await.unwrap();
    assert!(matches!(response, RoutedResponse::Edge(_)));

    let queued = wait_for_queued(&h.queue_dir, 1, Duration::from_secs(2)).await;
    assert_eq!(queued.len(), 1);
    assert!(queued[0].submit_params.want_async);
    assert_eq!(
        queued[0].submit_params.metadata.as_ref().unwrap()["is_edge_audit"],
        json!(true)
    );
}

#[tokio::test]
async fn test_disabled_escalation_has_no_side_effects() {
    let config = EdgeInferenceConfig {
        always_return_edge_prediction: true,
        disable_cloud_escalation: true,
        min_time_between_escalations: 0.0,
        ..Default::default()
    };
    let h = harness(MockEdge::new(0.1), config);

    for _ in 0..3 {
        assert!(matches!(
            h.engine.route(request()).await.unwrap(),
            RoutedResponse::Edge(_)
        ));
    }

    assert_eq!(settle(&h.queue_dir, 0).await, 0);
    assert_eq!(h.cloud.submission_count(), 0);
}

#[tokio::test]
async fn test_engine_rejects_contradictory_detector_config() {
    let dir = tempfile::tempdir().unwrap();
    let mut config = GatewayConfig::default();
    config.queue.base_dir = dir.path().join("queue");
    config.detectors.insert(
        DETECTOR.to_string(),
        EdgeInferenceConfig {
            disable_cloud_escalation: true,
            always_return_edge_prediction: false,
            ..Default::default()
        },
    );

    let built = RoutingEngine::new(
        &config,
        Collaborators {
            edge: MockEdge::new(0.1),
            cloud: MockCloud::new(0.9),
            deployments: Arc::new(PendingDeployments::new()),
        },
    );

    assert!(matches!(
        built,
        Err(EngineError::Config(ConfigError::Invalid(_)))
    ));
}

// =============================================================================
// Request validation
// =============================================================================

#[tokio::test]
async fn test_human_review_always_skips_local_inference() {
    let h = harness(MockEdge::new(0.99), EdgeInferenceConfig::default());

    let response = h
        .engine
        .route(request().with_human_review(HumanReview::Always))
        .await
        .unwrap();

    assert!(matches!(response, RoutedResponse::Cloud(_)));
    assert_eq!(h.edge.inference_count(), 0);
    assert_eq!(h.cloud.submissions.lock()[0].1.human_review, HumanReview::Always);
}

#[tokio::test]
async fn test_human_review_with_disabled_escalation_is_rejected() {
    let config = EdgeInferenceConfig {
        always_return_edge_prediction: true,
        disable_cloud_escalation: true,
        ..Default::default()
    };
    let h = harness(MockEdge::new(0.99), config);

    let err = h
        .engine
        .route(request().with_human_review(HumanReview::Always))
        .await
        .unwrap_err();
    assert_eq!(err.status_code(), 400);
}

#[tokio::test]
async fn test_want_async_with_always_edge_is_rejected() {
    let h = harness(MockEdge::new(0.99), always_edge(2.0));

    let err = h
        .engine
        .route(request().with_want_async(true))
        .await
        .unwrap_err();
    assert!(matches!(err, RouteError::InvalidRequest(_)));
    assert_eq!(h.edge.inference_count(), 0);
}

#[tokio::test]
async fn test_edge_routed_request_rejects_metadata_before_inference() {
    let h = harness(MockEdge::new(0.99), EdgeInferenceConfig::default());

    let err = h
        .engine
        .route(request().with_metadata(json!({"line": 4})))
        .await
        .unwrap_err();
    assert_eq!(err.status_code(), 400);
    assert_eq!(h.edge.inference_count(), 0);
}

#[tokio::test]
async fn test_cloud_rejection_surfaces_status() {
    let h = harness(MockEdge::unavailable(), EdgeInferenceConfig::default());
    h.engine.metadata_cache().get(DETECTOR).await.unwrap();
    *h.cloud.reject_with.lock() = Some(413);

    let err = h.engine.route(request()).await.unwrap_err();
    assert_eq!(err.status_code(), 413);
}

// =============================================================================
// Edge unavailable / outages
// =============================================================================

#[tokio::test]
async fn test_unavailable_edge_records_deployment_and_uses_cloud() {
    let h = harness(MockEdge::unavailable(), EdgeInferenceConfig::default());

    let response = h.engine.route(request()).await.unwrap();

    assert!(matches!(response, RoutedResponse::Cloud(_)));
    assert!(h.deployments.contains(DETECTOR));
}

#[tokio::test]
async fn test_failed_inference_counts_as_unavailable() {
    let edge = MockEdge::new(0.99);
    edge.fail.store(true, std::sync::atomic::Ordering::SeqCst);
    let h = harness(edge, always_edge(2.0));

    let err = h.engine.route(request()).await.unwrap_err();

    assert!(matches!(err, RouteError::EdgeUnavailable(_)));
    assert_eq!(err.status_code(), 503);
    assert!(h.deployments.contains(DETECTOR));
}

#[tokio::test]
async fn test_outage_queues_then_consumer_delivers() {
    let h = harness(MockEdge::unavailable(), EdgeInferenceConfig::default());

    // Metadata is cached while online
    assert!(matches!(
        h.engine.route(request()).await.unwrap(),
        RoutedResponse::Cloud(_)
    ));

    h.cloud.set_online(false);
    let first = h.engine.route(request().with_request_id("req-a")).await.unwrap();
    let second = h.engine.route(request().with_request_id("req-b")).await.unwrap();

    let RoutedResponse::Queued { request_id, .. } = &first else {
        panic!("expected queued, got {first:?}");
    };
    assert_eq!(request_id, "req-a");
    assert!(matches!(second, RoutedResponse::Queued { .. }));
    let queued = queued_records(&h.queue_dir);
    assert_eq!(queued.len(), 2);
    assert!(queued.iter().all(|record| record.submit_params.want_async));

    h.cloud.set_online(true);
    let mut config = ConsumerConfig::rooted_at(h._dir.path());
    config.queue_dir = h.queue_dir.clone();
    let mut consumer = EscalationConsumer::new(config, h.cloud.clone()).unwrap();

    assert_eq!(consumer.process_next().await.unwrap(), Some(Outcome::Delivered));
    assert_eq!(consumer.process_next().await.unwrap(), Some(Outcome::Delivered));
    assert_eq!(consumer.process_next().await.unwrap(), None);

    let submissions = h.cloud.submissions.lock();
    assert_eq!(submissions.len(), 3);
    assert_eq!(
        submissions[1].1.image_query_id.as_deref(),
        Some(first.image_query_id())
    );
}

#[tokio::test]
async fn test_want_async_offline_is_queued() {
    let h = harness(MockEdge::new(0.99), EdgeInferenceConfig::default());
    h.cloud.set_online(false);

    let response = h
        .engine
        .route(request().with_want_async(true))
        .await
        .unwrap();

    assert!(matches!(response, RoutedResponse::Queued { .. }));
    let queued = queued_records(&h.queue_dir);
    assert_eq!(queued.len(), 1);
    assert!(queued[0].submit_params.want_async);
}

#[tokio::test]
async fn test_cold_metadata_miss_while_offline_is_unavailable() {
    let h = harness(MockEdge::new(0.99), EdgeInferenceConfig::default());
    h.cloud.set_online(false);

    let err = h.engine.route(request()).await.unwrap_err();
    assert!(matches!(err, RouteError::Metadata(_)));
    assert_eq!(err.status_code(), 503);
}
