//! Durable Escalation Queue
//!
//! Crash-safe, at-least-once file queue for queries that must reach the
//! cloud. Many writers append to their own segment files; one consumer
//! claims segments oldest-first and drains them.
//!
//! # Layout
//!
//! ```text
//! <base>/writing/<YYYYMMDD_HHMMSS_ffffff>-<uniqueid>.txt   open for appends
//! <base>/reading/<same name>.txt                           claimed by the consumer
//! <base>/reading/tracking-<same name>.txt                  consumption progress
//! <base>/images/<detector_id>/<timestamp>-<uniqueid>       image bytes
//! ```
//!
//! # Coordination
//!
//! There are no locks between processes. Writers never share a segment
//! (names are unique), the consumer claims a segment with an atomic rename
//! from `writing/` to `reading/`, and progress within a claimed segment is
//! an append-only tracking file that lags the yielded count by at most one.
//! Exactly-once submission is restored above the queue by the
//! [`RequestCache`](crate::dedup::RequestCache).

use std::io;
use std::path::{Path, PathBuf};

use chrono::Utc;
use thiserror::Error;

pub mod consumer;
pub mod reader;
pub mod record;
pub mod writer;

pub use consumer::{ConsumerConfig, ConsumerError, EscalationConsumer, Outcome};
pub use reader::{EntryContent, QueueEntry, QueueReader};
pub use record::{EscalationRecord, HumanReview, SubmitParams};
pub use writer::QueueWriter;

/// Extension of segment files
pub const SEGMENT_EXTENSION: &str = "txt";

/// Prefix of tracking files in `reading/`
pub const TRACKING_PREFIX: &str = "tracking-";

// ============================================================================
// Errors
// ============================================================================

/// Escalation queue errors
#[derive(Debug, Error)]
pub enum QueueError {
    /// Filesystem operation failed
    #[error("queue I/O error at {path}: {source}")]
    Io {
        /// Path involved
        path: PathBuf,
        /// Underlying error
        source: io::Error,
    },

    /// Record could not be encoded
    #[error("failed to encode escalation record: {0}")]
    Encode(#[from] serde_json::Error),

    /// A name that would escape its directory
    #[error("unsafe file name: {0:?}")]
    UnsafeName(String),
}

pub(crate) fn io_error(path: &Path) -> impl FnOnce(io::Error) -> QueueError + '_ {
    move |source| QueueError::Io {
        path: path.to_path_buf(),
        source,
    }
}

/// Whether a string can be used as a single path component
pub(crate) fn is_safe_file_name(name: &str) -> bool {
    !name.is_empty()
        && name != "."
        && name != ".."
        && !name.contains(['/', '\\', '\0'])
}

/// Time-sortable unique name stem: `YYYYMMDD_HHMMSS_ffffff-<hex>`
pub(crate) fn unique_stem() -> String {
    format!(
        "{}-{}",
        Utc::now().format("%Y%m%d_%H%M%S_%6f"),
        hex::encode(rand::random::<[u8; 8]>())
    )
}

// ============================================================================
// Layout
// ============================================================================

/// Directory layout of one queue
#[derive(Clone, Debug)]
pub struct QueueLayout {
    base: PathBuf,
}

impl QueueLayout {
    /// Layout rooted at `base`
    pub fn new(base: impl Into<PathBuf>) -> Self {
        Self { base: base.into() }
    }

    /// Queue root
    #[must_use]
    pub fn base(&self) -> &Path {
        &self.base
    }

    /// Segments open for appends
    #[must_use]
    pub fn writing_dir(&self) -> PathBuf {
        self.base.join("writing")
    }

    /// Claimed segments and tracking files
    #[must_use]
    pub fn reading_dir(&self) -> PathBuf {
        self.base.join("reading")
    }

    /// Persisted image bytes
    #[must_use]
    pub fn images_dir(&self) -> PathBuf {
        self.base.join("images")
    }

    /// Tracking file for a claimed segment
    #[must_use]
    pub fn tracking_path(&self, segment_name: &str) -> PathBuf {
        self.reading_dir()
            .join(format!("{TRACKING_PREFIX}{segment_name}"))
    }

    /// Create all queue directories
    ///
    /// # Errors
    ///
    /// Returns an error if a directory cannot be created.
    pub fn ensure_dirs(&self) -> Result<(), QueueError> {
        for dir in [self.writing_dir(), self.reading_dir(), self.images_dir()] {
            std::fs::create_dir_all(&dir).map_err(io_error(&dir))?;
        }
        Ok(())
    }

    /// Segment file names in a directory, sorted oldest first
    ///
    /// # Errors
    ///
    /// Returns an error if the directory cannot be listed.
    pub fn list_segments(dir: &Path) -> Result<Vec<String>, QueueError> {
        let mut names = Vec::new();
        let entries = match std::fs::read_dir(dir) {
            Ok(entries) => entries,
            Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(names),
            Err(e) => return Err(io_error(dir)(e)),
        };
        for entry in entries {
            let entry = entry.map_err(io_error(dir))?;
            let Some(name) = entry.file_name().to_str().map(str::to_owned) else {
                continue;
            };
            if is_segment_name(&name) {
                names.push(name);
            }
        }
        names.sort();
        Ok(names)
    }

    /// Segments waiting in `writing/` plus claimed ones in `reading/`
    ///
    /// # Errors
    ///
    /// Returns an error if a directory cannot be listed.
    pub fn pending_segment_count(&self) -> Result<usize, QueueError> {
        Ok(Self::list_segments(&self.writing_dir())?.len()
            + Self::list_segments(&self.reading_dir())?.len())
    }
}

/// Visible segment file: `*.txt`, not hidden, not a tracking file
pub(crate) fn is_segment_name(name: &str) -> bool {
    !name.starts_with('.')
        && !name.starts_with(TRACKING_PREFIX)
        && Path::new(name)
            .extension()
            .is_some_and(|ext| ext == SEGMENT_EXTENSION)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_safe_file_names() {
        assert!(is_safe_file_name("req-123"));
        assert!(is_safe_file_name("det_2abc"));
        assert!(!is_safe_file_name(""));
        assert!(!is_safe_file_name(".."));
        assert!(!is_safe_file_name("a/b"));
        assert!(!is_safe_file_name("a\\b"));
    }

    #[test]
    fn test_segment_names() {
        assert!(is_segment_name("20240501_120000_000001-ab.txt"));
        assert!(!is_segment_name("tracking-20240501_120000_000001-ab.txt"));
        assert!(!is_segment_name(".20240501_120000_000001-ab.txt.tmp"));
        assert!(!is_segment_name("20240501_120000_000001-ab.json"));
    }

    #[test]
    fn test_unique_stems_sort_by_time() {
        let first = unique_stem();
        std::thread::sleep(std::time::Duration::from_millis(2));
        let second = unique_stem();
        assert!(first < second);
    }
}
