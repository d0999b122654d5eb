//! Dropped and Failed Escalation Recorder
//!
//! Terminal diagnostics for escalations the consumer gave up on. Each event
//! is one JSON file; the pipeline never reads them back. Optional counter
//! files keep lifetime, per-reason and per-hour totals so summaries do not
//! need to rescan records.
//!
//! # Layouts
//!
//! ```text
//! with counters:  <dir>/records/<timestamp>-<id>.json
//!                 <dir>/counters/{total, reason-<reason>, hour-<YYYYMMDDHH>}
//! flat:           <dir>/<timestamp>-<id>.json
//! ```
//!
//! Retention prunes the oldest records (by modification time) once either
//! the record count or the total byte size exceeds its cap.

use std::collections::BTreeMap;
use std::fs;
use std::io;
use std::path::{Path, PathBuf};
use std::time::SystemTime;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::{debug, warn};

use crate::escalation::unique_stem;

/// Hour buckets kept in the counters directory (one week)
const MAX_HOUR_BUCKETS: usize = 24 * 7;

const TOTAL_COUNTER: &str = "total";
const REASON_COUNTER_PREFIX: &str = "reason-";
const HOUR_COUNTER_PREFIX: &str = "hour-";

// ============================================================================
// Types
// ============================================================================

/// Why an escalation was dropped or failed
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FailureReason {
    /// Queue line could not be decoded
    MalformedLine,
    /// The referenced image file does not exist
    MissingImage,
    /// The cloud permanently rejected the submission
    ClientError,
    /// Anything else raised while processing the record
    Unhandled,
}

impl FailureReason {
    /// Stable name used in counters and records
    #[must_use]
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::MalformedLine => "malformed_line",
            Self::MissingImage => "missing_image",
            Self::ClientError => "client_error",
            Self::Unhandled => "unhandled",
        }
    }
}

/// One recorded event
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct FailureEntry {
    /// When it was recorded
    pub recorded_at: DateTime<Utc>,
    /// Why
    pub reason: FailureReason,
    /// Human-readable detail (error message)
    pub detail: String,
    /// The escalation or raw line involved
    pub context: serde_json::Value,
}

/// Retention caps for one record directory
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct RetentionPolicy {
    /// Records kept at most
    pub max_records: usize,
    /// Total bytes kept at most
    pub max_bytes: u64,
}

impl Default for RetentionPolicy {
    fn default() -> Self {
        Self {
            max_records: 10_000,
            max_bytes: 100 * 1024 * 1024,
        }
    }
}

/// Totals reported by [`FailureRecorder::summary`]
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize)]
pub struct RecorderSummary {
    /// Lifetime total
    pub total: u64,
    /// Lifetime totals per reason
    pub by_reason: BTreeMap<String, u64>,
    /// Totals per UTC hour (`YYYYMMDDHH`)
    pub by_hour: BTreeMap<String, u64>,
    /// Records currently retained on disk
    pub retained: usize,
}

/// Recorder errors
#[derive(Debug, Error)]
pub enum RecorderError {
    /// Filesystem operation failed
    #[error("recorder I/O error at {path}: {source}")]
    Io {
        /// Path involved
        path: PathBuf,
        /// Underlying error
        source: io::Error,
    },

    /// Entry could not be encoded
    #[error("failed to encode failure entry: {0}")]
    Encode(#[from] serde_json::Error),
}

fn io_error(path: &Path) -> impl FnOnce(io::Error) -> RecorderError + '_ {
    move |source| RecorderError::Io {
        path: path.to_path_buf(),
        source,
    }
}

// ============================================================================
// Recorder
// ============================================================================

/// Writes terminal failure diagnostics with bounded retention
#[derive(Clone, Debug)]
pub struct FailureRecorder {
    records_dir: PathBuf,
    counters_dir: Option<PathBuf>,
    retention: RetentionPolicy,
}

impl FailureRecorder {
    /// Recorder with `records/` and `counters/` under `dir`
    ///
    /// # Errors
    ///
    /// Returns an error if the directories cannot be created.
    pub fn with_counters(
        dir: impl AsRef<Path>,
        retention: RetentionPolicy,
    ) -> Result<Self, RecorderError> {
        let dir = dir.as_ref();
        Self::create(dir.join("records"), Some(dir.join("counters")), retention)
    }

    /// Recorder writing records directly into `dir`
    ///
    /// # Errors
    ///
    /// Returns an error if the directory cannot be created.
    pub fn flat(dir: impl Into<PathBuf>, retention: RetentionPolicy) -> Result<Self, RecorderError> {
        Self::create(dir.into(), None, retention)
    }

    fn create(
        records_dir: PathBuf,
        counters_dir: Option<PathBuf>,
        retention: RetentionPolicy,
    ) -> Result<Self, RecorderError> {
        fs::create_dir_all(&records_dir).map_err(io_error(&records_dir))?;
        if let Some(dir) = &counters_dir {
            fs::create_dir_all(dir).map_err(io_error(dir))?;
        }
        Ok(Self {
            records_dir,
            counters_dir,
            retention,
        })
    }

    /// Directory holding the JSON records
    #[must_use]
    pub fn records_dir(&self) -> &Path {
        &self.records_dir
    }

    /// Record one event, bump counters, enforce retention
    ///
    /// # Errors
    ///
    /// Returns an error if the record cannot be written. Counter and
    /// pruning failures are logged, not returned.
    pub fn record(
        &self,
        reason: FailureReason,
        detail: impl Into<String>,
        context: serde_json::Value,
    ) -> Result<PathBuf, RecorderError> {
        let entry = FailureEntry {
            recorded_at: Utc::now(),
            reason,
            detail: detail.into(),
            context,
        };
        let bytes = serde_json::to_vec_pretty(&entry)?;

        let stem = unique_stem();
        let path = self.records_dir.join(format!("{stem}.json"));
        write_atomic(&self.records_dir, &path, &bytes)?;
        debug!(reason = reason.as_str(), path = ?path, "Recorded escalation failure");

        if let Some(counters) = &self.counters_dir {
            let hour = format!("{HOUR_COUNTER_PREFIX}{}", entry.recorded_at.format("%Y%m%d%H"));
            let reason_counter = format!("{REASON_COUNTER_PREFIX}{}", reason.as_str());
            for name in [TOTAL_COUNTER, reason_counter.as_str(), hour.as_str()] {
                if let Err(e) = increment_counter(counters, name) {
                    warn!(counter = name, error = %e, "Failed to bump failure counter");
                }
            }
            if let Err(e) = prune_hour_counters(counters) {
                warn!(error = %e, "Failed to prune hour counters");
            }
        }

        if let Err(e) = self.enforce_retention() {
            warn!(error = %e, "Failed to prune failure records");
        }
        Ok(path)
    }

    /// Number of records retained on disk
    ///
    /// # Errors
    ///
    /// Returns an error if the directory cannot be listed.
    pub fn retained(&self) -> Result<usize, RecorderError> {
        Ok(self.list_records()?.len())
    }

    /// Delete oldest records until both caps are satisfied
    ///
    /// # Errors
    ///
    /// Returns an error if the directory cannot be listed or a file removed.
    pub fn enforce_retention(&self) -> Result<(), RecorderError> {
        let mut records = self.list_records()?;
        records.sort_by(|a, b| (a.modified, &a.path).cmp(&(b.modified, &b.path)));

        let mut count = records.len();
        let mut bytes: u64 = records.iter().map(|r| r.size).sum();
        for record in records {
            if count <= self.retention.max_records && bytes <= self.retention.max_bytes {
                break;
            }
            match fs::remove_file(&record.path) {
                Ok(()) => {}
                Err(e) if e.kind() == io::ErrorKind::NotFound => {}
                Err(e) => return Err(io_error(&record.path)(e)),
            }
            count -= 1;
            bytes = bytes.saturating_sub(record.size);
        }
        Ok(())
    }

    /// Totals from the counters (or a record scan for flat recorders)
    ///
    /// # Errors
    ///
    /// Returns an error if a directory cannot be listed.
    pub fn summary(&self) -> Result<RecorderSummary, RecorderError> {
        let retained = self.retained()?;
        let Some(counters) = &self.counters_dir else {
            return self.scan_summary(retained);
        };

        let mut summary = RecorderSummary {
            retained,
            ..Default::default()
        };
        for entry in fs::read_dir(counters).map_err(io_error(counters))? {
            let entry = entry.map_err(io_error(counters))?;
            let Some(name) = entry.file_name().to_str().map(str::to_owned) else {
                continue;
            };
            if name.starts_with('.') {
                continue;
            }
            let value = read_counter(&entry.path());
            if name == TOTAL_COUNTER {
                summary.total = value;
            } else if let Some(reason) = name.strip_prefix(REASON_COUNTER_PREFIX) {
                summary.by_reason.insert(reason.to_string(), value);
            } else if let Some(hour) = name.strip_prefix(HOUR_COUNTER_PREFIX) {
                summary.by_hour.insert(hour.to_string(), value);
            }
        }
        Ok(summary)
    }

    fn scan_summary(&self, retained: usize) -> Result<RecorderSummary, RecorderError> {
        let mut summary = RecorderSummary {
            retained,
            ..Default::default()
        };
        for record in self.list_records()? {
            let Ok(bytes) = fs::read(&record.path) else {
                continue;
            };
            let Ok(entry) = serde_json::from_slice::<FailureEntry>(&bytes) else {
                continue;
            };
            summary.total += 1;
            *summary
                .by_reason
                .entry(entry.reason.as_str().to_string())
                .or_default() += 1;
            *summary
                .by_hour
                .entry(entry.recorded_at.format("%Y%m%d%H").to_string())
                .or_default() += 1;
        }
        Ok(summary)
    }

    fn list_records(&self) -> Result<Vec<RecordFile>, RecorderError> {
        let dir = &self.records_dir;
        let mut records = Vec::new();
        for entry in fs::read_dir(dir).map_err(io_error(dir))? {
            let entry = entry.map_err(io_error(dir))?;
            let path = entry.path();
            if path.extension().map_or(true, |ext| ext != "json") {
                continue;
            }
            let Ok(meta) = entry.metadata() else {
                continue;
            };
            records.push(RecordFile {
                modified: meta.modified().unwrap_or(SystemTime::UNIX_EPOCH),
                size: meta.len(),
                path,
            });
        }
        Ok(records)
    }
}

struct RecordFile {
    modified: SystemTime,
    size: u64,
    path: PathBuf,
}

// ============================================================================
// File Helpers
// ============================================================================

/// Write through a hidden temp file and rename into place
fn write_atomic(dir: &Path, path: &Path, bytes: &[u8]) -> Result<(), RecorderError> {
    let tmp = dir.join(format!(".{}.tmp", unique_stem()));
    fs::write(&tmp, bytes).map_err(io_error(&tmp))?;
    fs::rename(&tmp, path).map_err(io_error(path))
}

fn read_counter(path: &Path) -> u64 {
    fs::read_to_string(path)
        .ok()
        .and_then(|s| s.trim().parse().ok())
        .unwrap_or(0)
}

fn increment_counter(dir: &Path, name: &str) -> Result<u64, RecorderError> {
    let path = dir.join(name);
    let value = read_counter(&path).saturating_add(1);
    write_atomic(dir, &path, value.to_string().as_bytes())?;
    Ok(value)
}

fn prune_hour_counters(dir: &Path) -> Result<(), RecorderError> {
    let mut hours: Vec<PathBuf> = fs::read_dir(dir)
        .map_err(io_error(dir))?
        .filter_map(Result::ok)
        .filter(|e| {
            e.file_name()
                .to_str()
                .is_some_and(|n| n.starts_with(HOUR_COUNTER_PREFIX))
        })
        .map(|e| e.path())
        .collect();
    if hours.len() <= MAX_HOUR_BUCKETS {
        return Ok(());
    }
    hours.sort();
    let excess = hours.len() - MAX_HOUR_BUCKETS;
    for path in hours.into_iter().take(excess) {
        fs::remove_file(&path).map_err(io_error(&path))?;
    }
    Ok(())
}
