//! Escalation Consumer
//!
//! The single background drain loop over the escalation queue:
//!
//! ```text
//! reader -> decode -> dedup check -> image check -> cloud submit -> dedup add -> image cleanup
//! ```
//!
//! Transient cloud failures are retried in place with exponential backoff,
//! so a record is never dropped because the network is down. Everything
//! else that stops a record ends up in one of two recorders:
//!
//! | Situation                     | Recorder | Reason           |
//! |-------------------------------|----------|------------------|
//! | line is not a record          | dropped  | `malformed_line` |
//! | image file is gone            | dropped  | `missing_image`  |
//! | cloud rejected the query      | failed   | `client_error`   |
//! | any other error, or a panic   | failed   | `unhandled`      |

use std::any::Any;
use std::future::Future;
use std::io;
use std::panic::AssertUnwindSafe;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use futures::FutureExt;
use serde_json::json;
use thiserror::Error;
use tracing::{debug, error, info, warn};

use super::reader::{EntryContent, QueueEntry, QueueReader};
use super::record::EscalationRecord;
use super::QueueError;
use crate::backend::{CloudClient, CloudError};
use crate::config::{GatewayConfig, RetryConfig};
use crate::dedup::{DedupError, RequestCache};
use crate::failures::{FailureReason, FailureRecorder, RecorderError, RetentionPolicy};

// ============================================================================
// Configuration
// ============================================================================

/// Where the consumer reads from and records to
#[derive(Clone, Debug)]
pub struct ConsumerConfig {
    /// Queue root
    pub queue_dir: PathBuf,
    /// Request deduplication cache directory
    pub dedup_dir: PathBuf,
    /// Dedup cache capacity
    pub dedup_max_entries: usize,
    /// Dropped-escalation recorder directory (with counters)
    pub dropped_dir: PathBuf,
    /// Failed-escalation recorder directory (flat)
    pub failed_dir: PathBuf,
    /// Retention applied to both recorders
    pub retention: RetentionPolicy,
    /// Sleep between polls of an empty queue
    pub poll_interval: Duration,
    /// Backoff for transient cloud failures
    pub retry: RetryConfig,
}

impl ConsumerConfig {
    /// Derive consumer settings from the gateway configuration
    #[must_use]
    pub fn from_gateway(config: &GatewayConfig) -> Self {
        Self {
            queue_dir: config.queue.base_dir.clone(),
            dedup_dir: config.dedup.dir.clone(),
            dedup_max_entries: config.dedup.max_entries,
            dropped_dir: config.failures.dropped_dir.clone(),
            failed_dir: config.failures.failed_dir.clone(),
            retention: RetentionPolicy {
                max_records: config.failures.max_records,
                max_bytes: config.failures.max_bytes,
            },
            poll_interval: config.queue.poll_interval(),
            retry: config.retry.clone(),
        }
    }

    /// Every directory under one root, default limits
    #[must_use]
    pub fn rooted_at(root: &Path) -> Self {
        Self {
            queue_dir: root.join("escalation-queue"),
            dedup_dir: root.join("request-cache"),
            dedup_max_entries: 100_000,
            dropped_dir: root.join("dropped-escalations"),
            failed_dir: root.join("failed-escalations"),
            retention: RetentionPolicy::default(),
            poll_interval: super::reader::DEFAULT_POLL_INTERVAL,
            retry: RetryConfig::default(),
        }
    }
}

// ============================================================================
// Outcomes & Errors
// ============================================================================

/// What happened to one queue entry
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Outcome {
    /// Submitted to the cloud
    Delivered,
    /// Already submitted earlier; discarded
    Duplicate,
    /// Could not be processed at all; recorded as dropped
    Dropped(FailureReason),
    /// Processing failed terminally; recorded as failed
    Failed(FailureReason),
}

/// Consumer setup and queue errors
#[derive(Debug, Error)]
pub enum ConsumerError {
    /// Queue access failed
    #[error(transparent)]
    Queue(#[from] QueueError),

    /// Dedup cache could not be opened
    #[error(transparent)]
    Dedup(#[from] DedupError),

    /// A recorder could not be opened
    #[error(transparent)]
    Recorder(#[from] RecorderError),
}

// ============================================================================
// Consumer
// ============================================================================

/// Drains the escalation queue into the cloud
pub struct EscalationConsumer {
    reader: QueueReader,
    dedup: RequestCache,
    cloud: Arc<dyn CloudClient>,
    dropped: FailureRecorder,
    failed: FailureRecorder,
    retry: RetryConfig,
    poll_interval: Duration,
}

impl EscalationConsumer {
    /// Open the queue, dedup cache and recorders
    ///
    /// # Errors
    ///
    /// Returns an error if any directory cannot be created.
    pub fn new(config: ConsumerConfig, cloud: Arc<dyn CloudClient>) -> Result<Self, ConsumerError> {
        let reader = QueueReader::new(&config.queue_dir)?.with_poll_interval(config.poll_interval);
        Ok(Self {
            reader,
            dedup: RequestCache::new(&config.dedup_dir, config.dedup_max_entries)?,
            cloud,
            dropped: FailureRecorder::with_counters(&config.dropped_dir, config.retention)?,
            failed: FailureRecorder::flat(&config.failed_dir, config.retention)?,
            retry: config.retry,
            poll_interval: config.poll_interval,
        })
    }

    /// Dedup cache in use
    #[must_use]
    pub fn dedup(&self) -> &RequestCache {
        &self.dedup
    }

    /// Dropped-escalation recorder
    #[must_use]
    pub fn dropped(&self) -> &FailureRecorder {
        &self.dropped
    }

    /// Failed-escalation recorder
    #[must_use]
    pub fn failed(&self) -> &FailureRecorder {
        &self.failed
    }

    /// Process one queue entry, or return `None` if the queue is empty
    ///
    /// The entry is committed once its outcome is settled. A future dropped
    /// mid-processing leaves it uncommitted, so it is redelivered after a
    /// restart.
    ///
    /// # Errors
    ///
    /// Returns an error only for queue filesystem failures.
    pub async fn process_next(&mut self) -> Result<Option<Outcome>, ConsumerError> {
        let Some(entry) = self.reader.next_entry()? else {
            return Ok(None);
        };
        let outcome = self.handle_entry(entry).await;
        self.reader.commit()?;
        Ok(Some(outcome))
    }

    /// Drain the queue until `shutdown` resolves
    ///
    /// # Errors
    ///
    /// Never returns an error today; queue failures are logged and retried
    /// after a poll interval.
    pub async fn run<F>(&mut self, shutdown: F) -> Result<(), ConsumerError>
    where
        F: Future<Output = ()>,
    {
        tokio::pin!(shutdown);
        info!(queue = ?self.reader.layout().base(), "Escalation consumer started");

        loop {
            let idle = tokio::select! {
                () = &mut shutdown => break,
                result = self.process_next() => match result {
                    Ok(Some(outcome)) => {
                        debug!(outcome = ?outcome, "Processed escalation");
                        false
                    }
                    Ok(None) => true,
                    Err(e) => {
                        error!(error = %e, "Escalation queue error");
                        true
                    }
                },
            };

            if idle {
                tokio::select! {
                    () = &mut shutdown => break,
                    () = tokio::time::sleep(self.poll_interval) => {}
                }
            }
        }

        info!("Escalation consumer stopped");
        Ok(())
    }

    async fn handle_entry(&self, entry: QueueEntry) -> Outcome {
        let record = match entry.content {
            EntryContent::Record(record) => record,
            EntryContent::Malformed { raw, error } => {
                warn!(
                    segment = %entry.segment,
                    line = entry.line_index,
                    error = %error,
                    "Dropping malformed queue line"
                );
                let context = json!({
                    "segment": entry.segment,
                    "line_index": entry.line_index,
                    "raw": raw,
                });
                Self::note(&self.dropped, FailureReason::MalformedLine, &error, context);
                return Outcome::Dropped(FailureReason::MalformedLine);
            }
        };

        let handled = AssertUnwindSafe(self.deliver(&record))
            .catch_unwind()
            .await;
        let detail = match handled {
            Ok(Ok(outcome)) => return outcome,
            Ok(Err(e)) => format!("{e:#}"),
            Err(panic) => format!("panic: {}", panic_message(panic.as_ref())),
        };

        error!(
            request_id = %record.request_id,
            detector_id = %record.detector_id,
            error = %detail,
            "Escalation failed"
        );
        Self::note(
            &self.failed,
            FailureReason::Unhandled,
            &detail,
            record_context(&record),
        );
        remove_image(&record.image_path).await;
        Outcome::Failed(FailureReason::Unhandled)
    }

    async fn deliver(&self, record: &EscalationRecord) -> anyhow::Result<Outcome> {
        if let Some(key) = record.dedup_keys().find(|key| self.dedup.contains(key)) {
            debug!(
                request_id = %record.request_id,
                key = %key,
                "Discarding duplicate escalation"
            );
            remove_image(&record.image_path).await;
            return Ok(Outcome::Duplicate);
        }

        let image = match tokio::fs::read(&record.image_path).await {
            Ok(image) => image,
            Err(e) if e.kind() == io::ErrorKind::NotFound => {
                warn!(
                    request_id = %record.request_id,
                    path = ?record.image_path,
                    "Dropping escalation with missing image"
                );
                Self::note(
                    &self.dropped,
                    FailureReason::MissingImage,
                    &e.to_string(),
                    record_context(record),
                );
                return Ok(Outcome::Dropped(FailureReason::MissingImage));
            }
            Err(e) => {
                return Err(e)
                    .with_context(|| format!("failed to read image {}", record.image_path.display()))
            }
        };

        let mut attempt = 0u32;
        let query = loop {
            match self
                .cloud
                .submit_image_query(&record.detector_id, &image, &record.submit_params)
                .await
            {
                Ok(query) => break query,
                Err(e) if e.is_retryable() => {
                    let delay = self.retry.backoff_for_attempt(attempt);
                    warn!(
                        request_id = %record.request_id,
                        attempt = attempt + 1,
                        delay_ms = delay.as_millis() as u64,
                        error = %e,
                        "Cloud unavailable, retrying escalation"
                    );
                    tokio::time::sleep(delay).await;
                    attempt = attempt.saturating_add(1);
                }
                Err(e @ CloudError::Rejected { .. }) => {
                    warn!(
                        request_id = %record.request_id,
                        error = %e,
                        "Cloud rejected escalation"
                    );
                    Self::note(
                        &self.failed,
                        FailureReason::ClientError,
                        &e.to_string(),
                        record_context(record),
                    );
                    remove_image(&record.image_path).await;
                    return Ok(Outcome::Failed(FailureReason::ClientError));
                }
                Err(e) => return Err(e).context("cloud submission failed"),
            }
        };

        for key in record.dedup_keys() {
            if let Err(e) = self.dedup.add(key) {
                warn!(key = %key, error = %e, "Failed to record delivered request id");
            }
        }
        remove_image(&record.image_path).await;
        info!(
            request_id = %record.request_id,
            detector_id = %record.detector_id,
            image_query_id = %query.id,
            "Escalation delivered"
        );
        Ok(Outcome::Delivered)
    }

    fn note(recorder: &FailureRecorder, reason: FailureReason, detail: &str, context: serde_json::Value) {
        if let Err(e) = recorder.record(reason, detail, context) {
            error!(reason = reason.as_str(), error = %e, "Failed to record escalation failure");
        }
    }
}

fn record_context(record: &EscalationRecord) -> serde_json::Value {
    serde_json::to_value(record).unwrap_or_else(|_| json!({ "request_id": record.request_id }))
}

async fn remove_image(path: &Path) {
    match tokio::fs::remove_file(path).await {
        Ok(()) => {}
        Err(e) if e.kind() == io::ErrorKind::NotFound => {}
        Err(e) => warn!(path = ?path, error = %e, "Failed to remove escalation image"),
    }
}

fn panic_message(payload: &(dyn Any + Send)) -> String {
    if let Some(message) = payload.downcast_ref::<&str>() {
        (*message).to_string()
    } else if let Some(message) = payload.downcast_ref::<String>() {
        message.clone()
    } else {
        "unknown panic payload".to_string()
    }
}
