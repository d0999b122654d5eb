//! `status` subcommand: a point-in-time snapshot of the drain pipeline.

use anyhow::{Context, Result};
use serde::Serialize;

use gateway_core::escalation::QueueLayout;
use gateway_core::{ConsumerConfig, FailureRecorder, RecorderSummary, RequestCache};

/// Totals printed by `gateway-daemon status`
#[derive(Debug, Serialize)]
pub struct StatusReport {
    /// Segments not yet fully drained
    pub pending_segments: usize,
    /// Request ids remembered as delivered
    pub dedup_entries: usize,
    /// Escalations that could not be processed at all
    pub dropped: RecorderSummary,
    /// Escalations whose processing failed terminally
    pub failed: RecorderSummary,
}

/// Read queue, dedup and recorder state from disk
pub fn collect(config: &ConsumerConfig) -> Result<StatusReport> {
    let layout = QueueLayout::new(&config.queue_dir);
    let dedup = RequestCache::new(&config.dedup_dir, config.dedup_max_entries)
        .context("Failed to open request cache")?;
    let dropped = FailureRecorder::with_counters(&config.dropped_dir, config.retention)
        .context("Failed to open dropped-escalation records")?;
    let failed = FailureRecorder::flat(&config.failed_dir, config.retention)
        .context("Failed to open failed-escalation records")?;

    Ok(StatusReport {
        pending_segments: layout.pending_segment_count()?,
        dedup_entries: dedup.len()?,
        dropped: dropped.summary()?,
        failed: failed.summary()?,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use gateway_core::{FailureReason, QueueWriter, SubmitParams};

    #[test]
    fn test_empty_state() {
        let dir = tempfile::tempdir().unwrap();
        let report = collect(&ConsumerConfig::rooted_at(dir.path())).unwrap();

        assert_eq!(report.pending_segments, 0);
        assert_eq!(report.dedup_entries, 0);
        assert_eq!(report.dropped.total, 0);
        assert_eq!(report.failed.retained, 0);
    }

    #[test]
    fn test_reports_pending_and_dropped() {
        let dir = tempfile::tempdir().unwrap();
        let config = ConsumerConfig::rooted_at(dir.path());

        QueueWriter::new(&config.queue_dir)
            .unwrap()
            .write_escalation("det_1", b"jpeg", SubmitParams::default(), None)
            .unwrap();
        FailureRecorder::with_counters(&config.dropped_dir, config.retention)
            .unwrap()
            .record(FailureReason::MalformedLine, "bad json", serde_json::Value::Null)
            .unwrap();

        let report = collect(&config).unwrap();
        assert_eq!(report.pending_segments, 1);
        assert_eq!(report.dropped.total, 1);
        assert_eq!(report.dropped.by_reason.get("malformed_line"), Some(&1));

        let json = serde_json::to_value(&report).unwrap();
        assert_eq!(json["dropped"]["total"], 1);
    }
}
