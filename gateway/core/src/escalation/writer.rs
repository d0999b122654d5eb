//! Queue Writer
//!
//! Appends escalation records to this writer's own segment file, one JSON
//! line per record. A segment becomes visible in `writing/` only once its
//! first line is on disk, and the writer rotates to a fresh segment after
//! the configured line count or when the consumer has claimed the current
//! one.

use std::fs::{self, File, OpenOptions};
use std::io::{self, Write};
use std::path::{Path, PathBuf};

use parking_lot::Mutex;
use tracing::{debug, info};

use super::record::{EscalationRecord, SubmitParams};
use super::{io_error, is_safe_file_name, unique_stem, QueueError, QueueLayout, SEGMENT_EXTENSION};
use crate::config::DEFAULT_MAX_LINES_PER_SEGMENT;

/// Segment currently owned by this writer
#[derive(Debug)]
struct OpenSegment {
    path: PathBuf,
    lines: usize,
}

/// Appends records to the escalation queue
///
/// Safe to share between tasks; appends from one writer are serialized.
#[derive(Debug)]
pub struct QueueWriter {
    layout: QueueLayout,
    max_lines: usize,
    current: Mutex<Option<OpenSegment>>,
}

impl QueueWriter {
    /// Create a writer with the default rotation size
    ///
    /// # Errors
    ///
    /// Returns an error if the queue directories cannot be created.
    pub fn new(base: impl Into<PathBuf>) -> Result<Self, QueueError> {
        Self::with_max_lines(base, DEFAULT_MAX_LINES_PER_SEGMENT)
    }

    /// Create a writer rotating after `max_lines` lines
    ///
    /// # Errors
    ///
    /// Returns an error if the queue directories cannot be created.
    pub fn with_max_lines(base: impl Into<PathBuf>, max_lines: usize) -> Result<Self, QueueError> {
        let layout = QueueLayout::new(base);
        layout.ensure_dirs()?;
        Ok(Self {
            layout,
            max_lines: max_lines.max(1),
            current: Mutex::new(None),
        })
    }

    /// Queue layout this writer appends to
    #[must_use]
    pub fn layout(&self) -> &QueueLayout {
        &self.layout
    }

    /// Append one record, returning the segment it landed in
    ///
    /// # Errors
    ///
    /// Returns an error if the record cannot be encoded or written.
    pub fn write(&self, record: &EscalationRecord) -> Result<PathBuf, QueueError> {
        let mut line = record.to_line()?;
        line.push('\n');

        let mut current = self.current.lock();

        if let Some(segment) = current.as_mut().filter(|s| s.lines < self.max_lines) {
            match OpenOptions::new().append(true).open(&segment.path) {
                Ok(mut file) => {
                    file.write_all(line.as_bytes())
                        .and_then(|()| file.flush())
                        .map_err(io_error(&segment.path))?;
                    segment.lines += 1;
                    return Ok(segment.path.clone());
                }
                Err(e) if e.kind() == io::ErrorKind::NotFound => {
                    debug!(path = ?segment.path, "Segment claimed by reader, rotating");
                }
                Err(e) => return Err(io_error(&segment.path)(e)),
            }
        }

        let path = self.start_segment(&line)?;
        *current = Some(OpenSegment {
            path: path.clone(),
            lines: 1,
        });
        Ok(path)
    }

    /// Create a new segment holding `first_line`
    ///
    /// The line is written under a hidden temporary name and renamed into
    /// place, so the reader never sees an empty segment.
    fn start_segment(&self, first_line: &str) -> Result<PathBuf, QueueError> {
        let dir = self.layout.writing_dir();
        let name = format!("{}.{SEGMENT_EXTENSION}", unique_stem());
        let tmp = dir.join(format!(".{name}.tmp"));
        let path = dir.join(&name);

        let mut file = OpenOptions::new()
            .write(true)
            .create_new(true)
            .open(&tmp)
            .map_err(io_error(&tmp))?;
        file.write_all(first_line.as_bytes())
            .and_then(|()| file.flush())
            .map_err(io_error(&tmp))?;
        fs::rename(&tmp, &path).map_err(io_error(&path))?;

        info!(segment = %name, "Started escalation segment");
        Ok(path)
    }

    /// Persist image bytes for a record that is about to be written
    ///
    /// # Errors
    ///
    /// Returns an error if the detector id is not a safe directory name or
    /// the bytes cannot be written.
    pub fn persist_image(&self, detector_id: &str, image: &[u8]) -> Result<PathBuf, QueueError> {
        if !is_safe_file_name(detector_id) {
            return Err(QueueError::UnsafeName(detector_id.to_string()));
        }
        let dir = self.layout.images_dir().join(detector_id);
        fs::create_dir_all(&dir).map_err(io_error(&dir))?;

        let path = dir.join(unique_stem());
        write_synced(&path, image)?;
        Ok(path)
    }

    /// Persist the image, then append a record pointing at it
    ///
    /// # Errors
    ///
    /// Returns an error if either step fails. A failed append leaves the
    /// image behind; it is never referenced.
    pub fn write_escalation(
        &self,
        detector_id: &str,
        image: &[u8],
        submit_params: SubmitParams,
        request_id: Option<String>,
    ) -> Result<EscalationRecord, QueueError> {
        let image_path = self.persist_image(detector_id, image)?;
        let mut record = EscalationRecord::new(detector_id, image_path, submit_params);
        if let Some(request_id) = request_id {
            record = record.with_request_id(request_id);
        }
        let segment = self.write(&record)?;
        debug!(
            detector_id = %detector_id,
            request_id = %record.request_id,
            segment = ?segment,
            "Escalation queued"
        );
        Ok(record)
    }
}

fn write_synced(path: &Path, bytes: &[u8]) -> Result<(), QueueError> {
    let mut file = File::create(path).map_err(io_error(path))?;
    file.write_all(bytes)
        .and_then(|()| file.sync_all())
        .map_err(io_error(path))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::escalation::QueueLayout;

    fn record(n: usize) -> EscalationRecord {
        EscalationRecord::new("det_1", "/img", SubmitParams::default())
            .with_request_id(format!("req-{n}"))
    }

    #[test]
    fn test_rotation_after_max_lines() {
        let dir = tempfile::tempdir().unwrap();
        let writer = QueueWriter::with_max_lines(dir.path(), 3).unwrap();

        for n in 0..4 {
            writer.write(&record(n)).unwrap();
        }

        let segments = QueueLayout::list_segments(&writer.layout().writing_dir()).unwrap();
        assert_eq!(segments.len(), 2);

        let first = fs::read_to_string(writer.layout().writing_dir().join(&segments[0])).unwrap();
        assert_eq!(first.lines().count(), 3);
    }

    #[test]
    fn test_claimed_segment_starts_new_file() {
        let dir = tempfile::tempdir().unwrap();
        let writer = QueueWriter::new(dir.path()).unwrap();

        let first = writer.write(&record(0)).unwrap();
        let claimed = writer
            .layout()
            .reading_dir()
            .join(first.file_name().unwrap());
        fs::rename(&first, &claimed).unwrap();

        let second = writer.write(&record(1)).unwrap();
        assert_ne!(first, second);
        assert!(!first.exists());
        assert_eq!(fs::read_to_string(&claimed).unwrap().lines().count(), 1);
    }

    #[test]
    fn test_image_written_before_record() {
        let dir = tempfile::tempdir().unwrap();
        let writer = QueueWriter::new(dir.path()).unwrap();

        let record = writer
            .write_escalation("det_1", b"jpeg-bytes", SubmitParams::default(), None)
            .unwrap();

        assert!(record.image_path.starts_with(writer.layout().images_dir().join("det_1")));
        assert_eq!(fs::read(&record.image_path).unwrap(), b"jpeg-bytes");
    }

    #[test]
    fn test_rejects_unsafe_detector_id() {
        let dir = tempfile::tempdir().unwrap();
        let writer = QueueWriter::new(dir.path()).unwrap();

        let result = writer.persist_image("../escape", b"x");
        assert!(matches!(result, Err(QueueError::UnsafeName(_))));
    }
}
