//! Queue Reader
//!
//! Single-consumer reader over the escalation queue, written as an explicit
//! state machine rather than a generator.
//!
//! # File Selection
//!
//! ```text
//! 1. A segment already in reading/ (interrupted read)   -> resume it
//! 2. Oldest segment in writing/                         -> rename into reading/
//! 3. Nothing                                            -> no entry until next poll
//! ```
//!
//! # Consumption Protocol
//!
//! Each line is yielded first and only marked consumed (one marker appended
//! to the tracking file) when the caller asks for the next entry or calls
//! [`QueueReader::commit`]. A crash between yielding line k and that marker
//! re-yields line k on restart: at-least-once, never lost.
//!
//! Only one reader may run against a queue at a time. Two readers can race
//! on claiming the same oldest segment; that is not handled here.

use std::fs::{self, File, OpenOptions};
use std::io::{self, BufRead, BufReader, Write};
use std::path::PathBuf;
use std::time::Duration;

use tracing::{debug, info, warn};

use super::record::EscalationRecord;
use super::{io_error, QueueError, QueueLayout, TRACKING_PREFIX};

/// Marker appended to a tracking file per consumed line
const TRACKING_MARKER: &[u8] = b"1\n";

/// Default sleep between polls when the queue is empty
pub const DEFAULT_POLL_INTERVAL: Duration = Duration::from_secs(1);

// ============================================================================
// Entries
// ============================================================================

/// What a queue line turned out to contain
#[derive(Clone, Debug, PartialEq)]
pub enum EntryContent {
    /// A well-formed record
    Record(EscalationRecord),
    /// A line that could not be decoded
    Malformed {
        /// The raw line
        raw: String,
        /// Decode error
        error: String,
    },
}

/// One line yielded by the reader
#[derive(Clone, Debug, PartialEq)]
pub struct QueueEntry {
    /// Segment file name the line came from
    pub segment: String,
    /// Zero-based line index within the segment
    pub line_index: usize,
    /// Decoded content
    pub content: EntryContent,
}

impl QueueEntry {
    /// The record, if the line was well formed
    #[must_use]
    pub fn record(&self) -> Option<&EscalationRecord> {
        match &self.content {
            EntryContent::Record(record) => Some(record),
            EntryContent::Malformed { .. } => None,
        }
    }
}

// ============================================================================
// Active Segment
// ============================================================================

/// A claimed segment being consumed
struct ActiveSegment {
    name: String,
    segment_path: PathBuf,
    tracking_path: PathBuf,
    lines: BufReader<File>,
    tracking: File,
    /// Lines fully consumed (markers in the tracking file)
    consumed: usize,
    /// A line has been yielded but not yet marked
    uncommitted: bool,
}

impl ActiveSegment {
    /// Open a segment in `reading/`, skipping lines already consumed
    fn open(layout: &QueueLayout, name: &str) -> Result<Self, QueueError> {
        let segment_path = layout.reading_dir().join(name);
        let tracking_path = layout.tracking_path(name);

        let consumed = match File::open(&tracking_path) {
            Ok(file) => BufReader::new(file).lines().count(),
            Err(e) if e.kind() == io::ErrorKind::NotFound => 0,
            Err(e) => return Err(io_error(&tracking_path)(e)),
        };

        let tracking = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&tracking_path)
            .map_err(io_error(&tracking_path))?;
        let file = File::open(&segment_path).map_err(io_error(&segment_path))?;

        let mut segment = Self {
            name: name.to_string(),
            segment_path,
            tracking_path,
            lines: BufReader::new(file),
            tracking,
            consumed,
            uncommitted: false,
        };

        let mut skipped = 0;
        let mut scratch = String::new();
        while skipped < consumed {
            scratch.clear();
            if segment.read_raw_line(&mut scratch)? == 0 {
                break;
            }
            skipped += 1;
        }

        if consumed > 0 {
            info!(segment = %name, consumed, "Resuming interrupted segment");
        }
        Ok(segment)
    }

    fn read_raw_line(&mut self, buf: &mut String) -> Result<usize, QueueError> {
        self.lines
            .read_line(buf)
            .map_err(io_error(&self.segment_path))
    }

    /// Append one marker for the line most recently handed out
    fn mark_consumed(&mut self) -> Result<(), QueueError> {
        self.tracking
            .write_all(TRACKING_MARKER)
            .and_then(|()| self.tracking.flush())
            .map_err(io_error(&self.tracking_path))?;
        self.consumed += 1;
        self.uncommitted = false;
        Ok(())
    }

    fn commit(&mut self) -> Result<(), QueueError> {
        if self.uncommitted {
            self.mark_consumed()?;
        }
        Ok(())
    }

    /// Delete the segment, then its tracking file
    ///
    /// A crash between the two leaves an orphaned tracking file, which the
    /// next selection pass removes.
    fn finish(self) -> Result<(), QueueError> {
        let Self {
            name,
            segment_path,
            tracking_path,
            consumed,
            ..
        } = self;
        remove_if_exists(&segment_path)?;
        remove_if_exists(&tracking_path)?;
        info!(segment = %name, lines = consumed, "Finished escalation segment");
        Ok(())
    }
}

fn remove_if_exists(path: &std::path::Path) -> Result<(), QueueError> {
    match fs::remove_file(path) {
        Ok(()) => Ok(()),
        Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(()),
        Err(e) => Err(io_error(path)(e)),
    }
}

// ============================================================================
// Reader
// ============================================================================

/// Single consumer of the escalation queue
pub struct QueueReader {
    layout: QueueLayout,
    poll_interval: Duration,
    current: Option<ActiveSegment>,
}

impl QueueReader {
    /// Create a reader over the queue rooted at `base`
    ///
    /// # Errors
    ///
    /// Returns an error if the queue directories cannot be created.
    pub fn new(base: impl Into<PathBuf>) -> Result<Self, QueueError> {
        let layout = QueueLayout::new(base);
        layout.ensure_dirs()?;
        Ok(Self {
            layout,
            poll_interval: DEFAULT_POLL_INTERVAL,
            current: None,
        })
    }

    /// Set the sleep between polls of an empty queue
    #[must_use]
    pub fn with_poll_interval(mut self, poll_interval: Duration) -> Self {
        self.poll_interval = poll_interval;
        self
    }

    /// Queue layout this reader consumes
    #[must_use]
    pub fn layout(&self) -> &QueueLayout {
        &self.layout
    }

    /// Mark the most recently yielded line as consumed
    ///
    /// Called implicitly by the next `next_entry`; call it explicitly before
    /// a graceful shutdown.
    ///
    /// # Errors
    ///
    /// Returns an error if the tracking file cannot be appended to.
    pub fn commit(&mut self) -> Result<(), QueueError> {
        match self.current.as_mut() {
            Some(segment) => segment.commit(),
            None => Ok(()),
        }
    }

    /// Yield the next line, or `None` if the queue is currently empty
    ///
    /// # Errors
    ///
    /// Returns an error on filesystem failures; the reader stays usable.
    pub fn next_entry(&mut self) -> Result<Option<QueueEntry>, QueueError> {
        loop {
            if self.current.is_none() {
                match self.select_segment()? {
                    Some(segment) => self.current = Some(segment),
                    None => return Ok(None),
                }
            }
            let Some(segment) = self.current.as_mut() else {
                continue;
            };

            segment.commit()?;

            let mut line = String::new();
            if segment.read_raw_line(&mut line)? == 0 {
                if let Some(done) = self.current.take() {
                    done.finish()?;
                }
                continue;
            }

            if line.trim().is_empty() {
                segment.mark_consumed()?;
                continue;
            }

            let line_index = segment.consumed;
            segment.uncommitted = true;
            let content = match EscalationRecord::from_line(&line) {
                Ok(record) => EntryContent::Record(record),
                Err(e) => EntryContent::Malformed {
                    raw: line.trim_end().to_string(),
                    error: e.to_string(),
                },
            };
            return Ok(Some(QueueEntry {
                segment: segment.name.clone(),
                line_index,
                content,
            }));
        }
    }

    /// Yield the next line, sleeping the thread while the queue is empty
    ///
    /// # Errors
    ///
    /// Returns an error on filesystem failures.
    pub fn next_entry_blocking(&mut self) -> Result<QueueEntry, QueueError> {
        loop {
            if let Some(entry) = self.next_entry()? {
                return Ok(entry);
            }
            std::thread::sleep(self.poll_interval);
        }
    }

    /// Yield the next line, sleeping the task while the queue is empty
    ///
    /// # Errors
    ///
    /// Returns an error on filesystem failures.
    pub async fn next_entry_async(&mut self) -> Result<QueueEntry, QueueError> {
        loop {
            if let Some(entry) = self.next_entry()? {
                return Ok(entry);
            }
            tokio::time::sleep(self.poll_interval).await;
        }
    }

    /// Pick the segment to consume next
    fn select_segment(&mut self) -> Result<Option<ActiveSegment>, QueueError> {
        let reading_dir = self.layout.reading_dir();
        let claimed = QueueLayout::list_segments(&reading_dir)?;
        self.remove_orphaned_tracking(&claimed)?;

        if let Some(name) = claimed.first() {
            return ActiveSegment::open(&self.layout, name).map(Some);
        }

        let writing_dir = self.layout.writing_dir();
        for name in QueueLayout::list_segments(&writing_dir)? {
            let from = writing_dir.join(&name);
            let to = reading_dir.join(&name);
            match fs::rename(&from, &to) {
                Ok(()) => {
                    debug!(segment = %name, "Claimed escalation segment");
                    return ActiveSegment::open(&self.layout, &name).map(Some);
                }
                Err(e) if e.kind() == io::ErrorKind::NotFound => {
                    warn!(segment = %name, "Segment vanished before claim");
                }
                Err(e) => return Err(io_error(&from)(e)),
            }
        }
        Ok(None)
    }

    /// Remove tracking files whose segment is gone
    fn remove_orphaned_tracking(&self, claimed: &[String]) -> Result<(), QueueError> {
        let reading_dir = self.layout.reading_dir();
        let entries = fs::read_dir(&reading_dir).map_err(io_error(&reading_dir))?;
        for entry in entries {
            let entry = entry.map_err(io_error(&reading_dir))?;
            let file_name = entry.file_name();
            let Some(name) = file_name.to_str() else {
                continue;
            };
            let Some(segment) = name.strip_prefix(TRACKING_PREFIX) else {
                continue;
            };
            if !claimed.iter().any(|c| c == segment) {
                warn!(tracking = %name, "Removing orphaned tracking file");
                remove_if_exists(&entry.path())?;
            }
        }
        Ok(())
    }
}

impl Iterator for QueueReader {
    type Item = Result<QueueEntry, QueueError>;

    /// Blocks until an entry is available; never returns `None`
    fn next(&mut self) -> Option<Self::Item> {
        Some(self.next_entry_blocking())
    }
}
