//! Routing Policy
//!
//! The small pieces of state and arithmetic the engine consults for every
//! query:
//!
//! - [`DetectorPolicy`]: cloud metadata merged with local edge config
//! - [`CooldownTracker`]: per-detector escalation rate limit
//! - [`AuditSampler`]: uniform draw for confident-answer audits
//! - [`ConnectivityState`]: remembers a recent cloud outage

use std::time::{Duration, Instant};

use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use parking_lot::Mutex;
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};

use crate::backend::{DetectorMetadata, DetectorMode};
use crate::config::EdgeInferenceConfig;

// ============================================================================
// Detector Policy
// ============================================================================

/// Everything the engine needs to know about one detector
#[derive(Clone, Debug, PartialEq)]
pub struct DetectorPolicy {
    /// Default confidence threshold from the cloud
    pub confidence_threshold: f64,

    /// Answer shape
    pub mode: DetectorMode,

    /// Whether local inference is attempted
    pub edge_enabled: bool,

    /// Return the edge answer even when not confident
    pub always_return_edge: bool,

    /// Never send anything to the cloud
    pub disable_cloud_escalation: bool,

    /// Minimum time between escalations
    pub cooldown: Duration,
}

impl DetectorPolicy {
    /// Merge cloud metadata with local edge config
    #[must_use]
    pub fn new(metadata: &DetectorMetadata, edge: &EdgeInferenceConfig) -> Self {
        Self {
            confidence_threshold: metadata.confidence_threshold,
            mode: metadata.mode,
            edge_enabled: edge.enabled,
            always_return_edge: edge.always_return_edge_prediction,
            disable_cloud_escalation: edge.disable_cloud_escalation,
            cooldown: edge.cooldown(),
        }
    }

    /// Request override if given, detector default otherwise
    #[must_use]
    pub fn effective_threshold(&self, requested: Option<f64>) -> f64 {
        requested.unwrap_or(self.confidence_threshold)
    }

    /// Whether a confidence meets the effective threshold (inclusive)
    #[must_use]
    pub fn is_confident(&self, confidence: f64, requested: Option<f64>) -> bool {
        confidence >= self.effective_threshold(requested)
    }
}

// ============================================================================
// Cooldown
// ============================================================================

/// Per-detector "last escalated at" with atomic check-and-set
#[derive(Debug, Default)]
pub struct CooldownTracker {
    last_escalation: DashMap<String, Instant>,
}

impl CooldownTracker {
    /// Empty tracker
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Claim an escalation slot if the cooldown has elapsed
    ///
    /// Returns the claim time, recorded as the last escalation, or `None`
    /// if the previous escalation was less than `cooldown` ago.
    pub fn try_acquire(&self, detector_id: &str, cooldown: Duration) -> Option<Instant> {
        let now = Instant::now();
        match self.last_escalation.entry(detector_id.to_string()) {
            Entry::Occupied(mut last) => {
                if now.duration_since(*last.get()) >= cooldown {
                    last.insert(now);
                    Some(now)
                } else {
                    None
                }
            }
            Entry::Vacant(slot) => {
                slot.insert(now);
                Some(now)
            }
        }
    }

    /// Give back a slot whose escalation never happened
    ///
    /// No-op if another escalation has claimed the detector since.
    pub fn release(&self, detector_id: &str, acquired_at: Instant) {
        self.last_escalation
            .remove_if(detector_id, |_, last| *last == acquired_at);
    }

    /// When a detector last escalated
    #[must_use]
    pub fn last_escalation(&self, detector_id: &str) -> Option<Instant> {
        self.last_escalation.get(detector_id).map(|at| *at)
    }
}

// ============================================================================
// Audit Sampling
// ============================================================================

/// Uniform random source for audit sampling
#[derive(Debug)]
pub struct AuditSampler {
    rng: Mutex<StdRng>,
}

impl AuditSampler {
    /// Sampler seeded from OS entropy
    #[must_use]
    pub fn new() -> Self {
        Self {
            rng: Mutex::new(StdRng::from_entropy()),
        }
    }

    /// Deterministic sampler for tests and replays
    #[must_use]
    pub fn seeded(seed: u64) -> Self {
        Self {
            rng: Mutex::new(StdRng::seed_from_u64(seed)),
        }
    }

    /// Draw once; true with probability `rate`
    pub fn should_audit(&self, rate: f64) -> bool {
        if rate <= 0.0 {
            return false;
        }
        if rate >= 1.0 {
            return true;
        }
        self.rng.lock().gen::<f64>() < rate
    }
}

impl Default for AuditSampler {
    fn default() -> Self {
        Self::new()
    }
}

// ============================================================================
// Connectivity
// ============================================================================

/// Whether the cloud failed to connect recently
#[derive(Debug)]
pub struct ConnectivityState {
    down_since: Mutex<Option<Instant>>,
    backoff: Duration,
}

impl ConnectivityState {
    /// Treat the cloud as down for `backoff` after each connectivity failure
    #[must_use]
    pub fn new(backoff: Duration) -> Self {
        Self {
            down_since: Mutex::new(None),
            backoff,
        }
    }

    /// Whether a connectivity failure happened within the backoff window
    #[must_use]
    pub fn is_down(&self) -> bool {
        self.down_since
            .lock()
            .is_some_and(|since| since.elapsed() < self.backoff)
    }

    /// Record a connectivity failure
    pub fn mark_down(&self) {
        *self.down_since.lock() = Some(Instant::now());
    }

    /// Record a successful cloud call
    pub fn mark_up(&self) {
        *self.down_since.lock() = None;
    }
}
