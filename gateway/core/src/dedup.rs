//! Request Deduplication Cache
//!
//! Remembers which request ids have already reached the cloud, as one
//! zero-byte marker file per id. Being filesystem-backed it survives
//! restarts, which is what turns the queue's at-least-once delivery into
//! at-most-one cloud submission per id.
//!
//! The directory is bounded: when an insert pushes it past `max_entries`,
//! the oldest markers by modification time are evicted.
//!
//! Ids that are not usable as a file name (or that collide with the encoded
//! form) are stored hex-encoded under an `hex.` prefix, so every id is
//! cacheable.

use std::fs::{self, File};
use std::io;
use std::path::{Path, PathBuf};
use std::time::SystemTime;

use thiserror::Error;
use tracing::debug;

use crate::escalation::is_safe_file_name;

/// Dedup cache errors
#[derive(Debug, Error)]
pub enum DedupError {
    /// Filesystem operation failed
    #[error("request cache I/O error at {path}: {source}")]
    Io {
        /// Path involved
        path: PathBuf,
        /// Underlying error
        source: io::Error,
    },
}

const ENCODED_PREFIX: &str = "hex.";

/// File name a request id is stored under
fn marker_name(request_id: &str) -> String {
    if is_safe_file_name(request_id) && !request_id.starts_with(ENCODED_PREFIX) {
        request_id.to_string()
    } else {
        format!("{ENCODED_PREFIX}{}", hex::encode(request_id))
    }
}

/// Filesystem-backed set of seen request ids
#[derive(Clone, Debug)]
pub struct RequestCache {
    dir: PathBuf,
    max_entries: usize,
}

impl RequestCache {
    /// Open (creating if needed) a cache directory
    ///
    /// # Errors
    ///
    /// Returns an error if the directory cannot be created.
    pub fn new(dir: impl Into<PathBuf>, max_entries: usize) -> Result<Self, DedupError> {
        let dir = dir.into();
        fs::create_dir_all(&dir).map_err(|source| DedupError::Io {
            path: dir.clone(),
            source,
        })?;
        Ok(Self {
            dir,
            max_entries: max_entries.max(1),
        })
    }

    /// Cache directory
    #[must_use]
    pub fn dir(&self) -> &Path {
        &self.dir
    }

    fn marker_path(&self, request_id: &str) -> PathBuf {
        self.dir.join(marker_name(request_id))
    }

    /// Whether this id has been recorded
    #[must_use]
    pub fn contains(&self, request_id: &str) -> bool {
        self.marker_path(request_id).exists()
    }

    /// Record an id, evicting the oldest markers if over capacity
    ///
    /// # Errors
    ///
    /// Returns an error if the marker cannot be written.
    pub fn add(&self, request_id: &str) -> Result<(), DedupError> {
        let path = self.marker_path(request_id);
        let io_err = |source| DedupError::Io {
            path: path.clone(),
            source,
        };

        let file = File::create(&path).map_err(io_err)?;
        // Re-adding an existing id refreshes its age
        file.set_modified(SystemTime::now()).map_err(io_err)?;
        drop(file);

        self.evict_over_capacity()
    }

    /// Number of markers currently stored
    ///
    /// # Errors
    ///
    /// Returns an error if the directory cannot be listed.
    pub fn len(&self) -> Result<usize, DedupError> {
        Ok(self.markers()?.len())
    }

    /// Whether the cache is empty
    ///
    /// # Errors
    ///
    /// Returns an error if the directory cannot be listed.
    pub fn is_empty(&self) -> Result<bool, DedupError> {
        Ok(self.len()? == 0)
    }

    fn markers(&self) -> Result<Vec<(SystemTime, PathBuf)>, DedupError> {
        let io_err = |source| DedupError::Io {
            path: self.dir.clone(),
            source,
        };
        let mut markers = Vec::new();
        for entry in fs::read_dir(&self.dir).map_err(io_err)? {
            let entry = entry.map_err(io_err)?;
            // A concurrent eviction may remove entries while listing
            let Ok(meta) = entry.metadata() else {
                continue;
            };
            if meta.is_file() {
                let modified = meta.modified().unwrap_or(SystemTime::UNIX_EPOCH);
                markers.push((modified, entry.path()));
            }
        }
        Ok(markers)
    }

    fn evict_over_capacity(&self) -> Result<(), DedupError> {
        let mut markers = self.markers()?;
        if markers.len() <= self.max_entries {
            return Ok(());
        }
        markers.sort();
        let excess = markers.len() - self.max_entries;
        for (_, path) in markers.into_iter().take(excess) {
            match fs::remove_file(&path) {
                Ok(()) => debug!(path = ?path, "Evicted request cache entry"),
                Err(e) if e.kind() == io::ErrorKind::NotFound => {}
                Err(source) => return Err(DedupError::Io { path, source }),
            }
        }
        Ok(())
    }
}
