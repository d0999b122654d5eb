//! Gateway Configuration
//!
//! Configuration is layered: built-in defaults, then an optional TOML file,
//! then `EDGE_GATEWAY_*` environment variables. The result is validated
//! before anything is constructed from it.
//!
//! # Example
//!
//! ```toml
//! [queue]
//! base_dir = "/var/lib/edge-gateway/escalation-queue"
//!
//! [routing]
//! confident_audit_rate = 0.001
//!
//! [detectors.det_2abc]
//! always_return_edge_prediction = true
//! min_time_between_escalations = 5.0
//! ```

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Environment variable prefix for overrides
pub const ENV_PREFIX: &str = "EDGE_GATEWAY_";

/// Lines written to a segment before the writer rotates
pub const DEFAULT_MAX_LINES_PER_SEGMENT: usize = 200;

/// Age after which detector metadata is refreshed
pub const DEFAULT_METADATA_STALENESS: Duration = Duration::from_secs(30);

fn data_dir(name: &str) -> PathBuf {
    dirs::data_local_dir()
        .unwrap_or_else(std::env::temp_dir)
        .join("edge-gateway")
        .join(name)
}

// ============================================================================
// Errors
// ============================================================================

/// Configuration loading errors
#[derive(Debug, Error)]
pub enum ConfigError {
    /// The config file could not be read
    #[error("failed to read config {path}: {source}")]
    Io {
        /// File that failed
        path: PathBuf,
        /// Underlying error
        source: std::io::Error,
    },

    /// The config file is not valid TOML for this schema
    #[error("failed to parse config {path}: {source}")]
    Parse {
        /// File that failed
        path: PathBuf,
        /// Underlying error
        source: toml::de::Error,
    },

    /// The configuration is self-contradictory
    #[error("invalid configuration: {0}")]
    Invalid(String),
}

// ============================================================================
// Per-Detector Edge Configuration
// ============================================================================

/// Local policy for answering a detector on the edge
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct EdgeInferenceConfig {
    /// Whether local inference is attempted at all
    pub enabled: bool,

    /// Return the edge prediction even when it is not confident
    pub always_return_edge_prediction: bool,

    /// Never send anything for this detector to the cloud
    ///
    /// Only valid together with `always_return_edge_prediction`.
    pub disable_cloud_escalation: bool,

    /// Minimum seconds between escalations for this detector
    pub min_time_between_escalations: f64,
}

impl Default for EdgeInferenceConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            always_return_edge_prediction: false,
            disable_cloud_escalation: false,
            min_time_between_escalations: 2.0,
        }
    }
}

impl EdgeInferenceConfig {
    /// Escalation cooldown as a Duration
    #[must_use]
    pub fn cooldown(&self) -> Duration {
        Duration::from_secs_f64(self.min_time_between_escalations.max(0.0))
    }

    fn validate(&self, name: &str) -> Result<(), ConfigError> {
        if self.disable_cloud_escalation && !self.always_return_edge_prediction {
            return Err(ConfigError::Invalid(format!(
                "{name}: disable_cloud_escalation requires always_return_edge_prediction"
            )));
        }
        if !self.min_time_between_escalations.is_finite() || self.min_time_between_escalations < 0.0
        {
            return Err(ConfigError::Invalid(format!(
                "{name}: min_time_between_escalations must be a non-negative number"
            )));
        }
        Ok(())
    }
}

// ============================================================================
// Sections
// ============================================================================

/// Escalation queue settings
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(default)]
pub struct QueueConfig {
    /// Root holding `writing/`, `reading/` and `images/`
    pub base_dir: PathBuf,

    /// Lines per segment before rotation
    pub max_lines_per_segment: usize,

    /// Reader sleep when no segment is available
    pub poll_interval_ms: u64,
}

impl Default for QueueConfig {
    fn default() -> Self {
        Self {
            base_dir: data_dir("escalation-queue"),
            max_lines_per_segment: DEFAULT_MAX_LINES_PER_SEGMENT,
            poll_interval_ms: 1_000,
        }
    }
}

impl QueueConfig {
    /// Poll interval as a Duration
    #[must_use]
    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.poll_interval_ms)
    }
}

/// Request deduplication cache settings
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(default)]
pub struct DedupConfig {
    /// Directory of marker files
    pub dir: PathBuf,

    /// Markers kept before the oldest are evicted
    pub max_entries: usize,
}

impl Default for DedupConfig {
    fn default() -> Self {
        Self {
            dir: data_dir("request-cache"),
            max_entries: 100_000,
        }
    }
}

/// Dropped/failed escalation retention
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(default)]
pub struct FailureConfig {
    /// Dropped records (`records/`) and counters (`counters/`)
    pub dropped_dir: PathBuf,

    /// Failed records
    pub failed_dir: PathBuf,

    /// Records kept per directory
    pub max_records: usize,

    /// Total record bytes kept per directory
    pub max_bytes: u64,
}

impl Default for FailureConfig {
    fn default() -> Self {
        Self {
            dropped_dir: data_dir("dropped-escalations"),
            failed_dir: data_dir("failed-escalations"),
            max_records: 10_000,
            max_bytes: 100 * 1024 * 1024,
        }
    }
}

/// In-memory cache settings
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(default)]
pub struct CacheConfig {
    /// Age after which detector metadata is refreshed
    pub metadata_staleness_secs: u64,

    /// How long edge-created answers stay retrievable
    pub image_query_ttl_secs: u64,

    /// Edge-created answers kept at most
    pub image_query_max_entries: usize,
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            metadata_staleness_secs: DEFAULT_METADATA_STALENESS.as_secs(),
            image_query_ttl_secs: 60,
            image_query_max_entries: 1_000,
        }
    }
}

impl CacheConfig {
    /// Metadata staleness threshold
    #[must_use]
    pub fn metadata_staleness(&self) -> Duration {
        Duration::from_secs(self.metadata_staleness_secs)
    }

    /// Edge answer time-to-live
    #[must_use]
    pub fn image_query_ttl(&self) -> Duration {
        Duration::from_secs(self.image_query_ttl_secs)
    }
}

/// Routing policy settings
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(default)]
pub struct RoutingConfig {
    /// Fraction of confident edge answers also sent to the cloud for audit
    pub confident_audit_rate: f64,

    /// After a connectivity failure, skip blocking cloud calls for this long
    pub connectivity_backoff_ms: u64,

    /// Edge policy for detectors without their own entry
    pub default_edge_config: EdgeInferenceConfig,
}

impl Default for RoutingConfig {
    fn default() -> Self {
        Self {
            confident_audit_rate: 1e-5,
            connectivity_backoff_ms: 30_000,
            default_edge_config: EdgeInferenceConfig::default(),
        }
    }
}

impl RoutingConfig {
    /// Connectivity backoff as a Duration
    #[must_use]
    pub fn connectivity_backoff(&self) -> Duration {
        Duration::from_millis(self.connectivity_backoff_ms)
    }
}

/// Retry configuration for escalations that failed transiently
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(default)]
pub struct RetryConfig {
    /// Initial backoff delay
    pub initial_backoff_ms: u64,

    /// Maximum backoff delay
    pub max_backoff_ms: u64,

    /// Backoff multiplier
    pub backoff_multiplier: f32,

    /// Add jitter to backoff
    pub use_jitter: bool,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            initial_backoff_ms: 500,
            max_backoff_ms: 60_000,
            backoff_multiplier: 2.0,
            use_jitter: true,
        }
    }
}

impl RetryConfig {
    /// Calculate backoff duration for attempt N (0-indexed)
    #[must_use]
    pub fn backoff_for_attempt(&self, attempt: u32) -> Duration {
        let exponent = i32::try_from(attempt).unwrap_or(i32::MAX);
        let base = self.initial_backoff_ms as f64 * f64::from(self.backoff_multiplier).powi(exponent);
        let capped = base.min(self.max_backoff_ms as f64);

        let duration_ms = if self.use_jitter {
            // Add up to 25% jitter
            let jitter = rand::random::<f64>() * 0.25;
            (capped * (1.0 + jitter)) as u64
        } else {
            capped as u64
        };

        Duration::from_millis(duration_ms)
    }
}

/// Cloud API settings
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(default)]
pub struct CloudConfig {
    /// Base URL of the cloud API
    pub endpoint: String,

    /// Environment variable holding the API token
    pub api_token_env: String,

    /// Request timeout
    pub timeout_ms: u64,
}

impl Default for CloudConfig {
    fn default() -> Self {
        Self {
            endpoint: "https://api.groundlight.ai/device-api".to_string(),
            api_token_env: "GROUNDLIGHT_API_TOKEN".to_string(),
            timeout_ms: 30_000,
        }
    }
}

impl CloudConfig {
    /// Resolve the API token from the configured environment variable
    #[must_use]
    pub fn api_token(&self) -> Option<String> {
        std::env::var(&self.api_token_env).ok().filter(|t| !t.is_empty())
    }
}

/// Local inference server settings
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(default)]
pub struct EdgeConfig {
    /// Base URL of the local inference server
    pub inference_url: String,

    /// Request timeout
    pub timeout_ms: u64,
}

impl Default for EdgeConfig {
    fn default() -> Self {
        Self {
            inference_url: "http://localhost:8000".to_string(),
            timeout_ms: 5_000,
        }
    }
}

// ============================================================================
// Full Gateway Configuration
// ============================================================================

/// Complete gateway configuration
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct GatewayConfig {
    /// Escalation queue
    pub queue: QueueConfig,
    /// Request deduplication cache
    pub dedup: DedupConfig,
    /// Dropped/failed escalation retention
    pub failures: FailureConfig,
    /// In-memory caches
    pub cache: CacheConfig,
    /// Routing policy
    pub routing: RoutingConfig,
    /// Transient failure retry
    pub retry: RetryConfig,
    /// Cloud API
    pub cloud: CloudConfig,
    /// Local inference server
    pub edge: EdgeConfig,
    /// Per-detector edge policy
    pub detectors: HashMap<String, EdgeInferenceConfig>,
}

impl GatewayConfig {
    /// Parse from TOML text
    ///
    /// # Errors
    ///
    /// Returns `ConfigError::Parse` if the text does not match the schema.
    pub fn from_toml_str(text: &str, origin: &Path) -> Result<Self, ConfigError> {
        toml::from_str(text).map_err(|source| ConfigError::Parse {
            path: origin.to_path_buf(),
            source,
        })
    }

    /// Edge policy for a detector, falling back to the default
    #[must_use]
    pub fn edge_config_for(&self, detector_id: &str) -> &EdgeInferenceConfig {
        self.detectors
            .get(detector_id)
            .unwrap_or(&self.routing.default_edge_config)
    }

    /// Apply `EDGE_GATEWAY_*` overrides from the process environment
    pub fn apply_env(&mut self) {
        self.apply_overrides(|key| std::env::var(key).ok());
    }

    /// Apply overrides from an arbitrary lookup
    ///
    /// Keys (without prefix): `QUEUE_DIR`, `DEDUP_DIR`, `DEDUP_MAX_ENTRIES`,
    /// `DROPPED_DIR`, `FAILED_DIR`, `CLOUD_ENDPOINT`, `INFERENCE_URL`,
    /// `AUDIT_RATE`, `POLL_INTERVAL_MS`.
    pub fn apply_overrides(&mut self, lookup: impl Fn(&str) -> Option<String>) {
        let get = |name: &str| lookup(&format!("{ENV_PREFIX}{name}")).filter(|v| !v.is_empty());

        if let Some(dir) = get("QUEUE_DIR") {
            self.queue.base_dir = PathBuf::from(dir);
        }
        if let Some(ms) = get("POLL_INTERVAL_MS").and_then(|v| v.parse().ok()) {
            self.queue.poll_interval_ms = ms;
        }
        if let Some(dir) = get("DEDUP_DIR") {
            self.dedup.dir = PathBuf::from(dir);
        }
        if let Some(max) = get("DEDUP_MAX_ENTRIES").and_then(|v| v.parse().ok()) {
            self.dedup.max_entries = max;
        }
        if let Some(dir) = get("DROPPED_DIR") {
            self.failures.dropped_dir = PathBuf::from(dir);
        }
        if let Some(dir) = get("FAILED_DIR") {
            self.failures.failed_dir = PathBuf::from(dir);
        }
        if let Some(url) = get("CLOUD_ENDPOINT") {
            self.cloud.endpoint = url;
        }
        if let Some(url) = get("INFERENCE_URL") {
            self.edge.inference_url = url;
        }
        if let Some(rate) = get("AUDIT_RATE").and_then(|v| v.parse().ok()) {
            self.routing.confident_audit_rate = rate;
        }
    }

    /// Reject contradictory settings
    ///
    /// # Errors
    ///
    /// Returns `ConfigError::Invalid` describing the first problem found.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.queue.max_lines_per_segment == 0 {
            return Err(ConfigError::Invalid(
                "queue.max_lines_per_segment must be positive".into(),
            ));
        }
        if self.dedup.max_entries == 0 {
            return Err(ConfigError::Invalid("dedup.max_entries must be positive".into()));
        }
        let rate = self.routing.confident_audit_rate;
        if !(0.0..=1.0).contains(&rate) {
            return Err(ConfigError::Invalid(format!(
                "routing.confident_audit_rate must be within [0, 1], got {rate}"
            )));
        }
        self.routing
            .default_edge_config
            .validate("routing.default_edge_config")?;
        for (detector_id, edge) in &self.detectors {
            edge.validate(&format!("detectors.{detector_id}"))?;
        }
        Ok(())
    }
}

// ============================================================================
// Loading
// ============================================================================

/// Default config file location (`$XDG_CONFIG_HOME/edge-gateway/gateway.toml`)
#[must_use]
pub fn default_config_path() -> Option<PathBuf> {
    dirs::config_dir().map(|dir| dir.join("edge-gateway").join("gateway.toml"))
}

/// Load a config file without environment overrides
///
/// # Errors
///
/// Returns an error if the file cannot be read or parsed.
pub fn load_config_from_path(path: &Path) -> Result<GatewayConfig, ConfigError> {
    let text = std::fs::read_to_string(path).map_err(|source| ConfigError::Io {
        path: path.to_path_buf(),
        source,
    })?;
    GatewayConfig::from_toml_str(&text, path)
}

/// Load the full layered configuration
///
/// An explicit path must exist; the default path is used only if present.
///
/// # Errors
///
/// Returns an error if a file cannot be loaded or validation fails.
pub fn load_config(path: Option<&Path>) -> Result<GatewayConfig, ConfigError> {
    let mut config = match path {
        Some(path) => load_config_from_path(path)?,
        None => match default_config_path().filter(|p| p.exists()) {
            Some(path) => {
                tracing::info!(path = ?path, "Loading default config file");
                load_config_from_path(&path)?
            }
            None => GatewayConfig::default(),
        },
    };
    config.apply_env();
    config.validate()?;
    Ok(config)
}
