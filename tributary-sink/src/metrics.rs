use prometheus::{IntCounter, IntGauge};
use tributary_metrics::{counter_for_task, gauge_for_task};
use tributary_types::TaskInfo;

pub const RECORDS_WRITTEN: &str = "tributary_sink_records_written";
pub const BYTES_WRITTEN: &str = "tributary_sink_bytes_written";
pub const FILES_COMMITTED: &str = "tributary_sink_files_committed";
pub const ACTIVE_BUCKETS: &str = "tributary_sink_active_buckets";
pub const PENDING_FILES: &str = "tributary_sink_pending_files";

/// Per-subtask sink metrics. A subtask started again in the same process picks up the same
/// series. A metric is missing only if its name is taken by an unrelated collector.
#[derive(Debug, Clone, Default)]
pub struct SinkMetrics {
    records_written: Option<IntCounter>,
    bytes_written: Option<IntCounter>,
    files_committed: Option<IntCounter>,
    active_buckets: Option<IntGauge>,
    pending_files: Option<IntGauge>,
}

impl SinkMetrics {
    pub fn register(task_info: &TaskInfo) -> Self {
        Self {
            records_written: counter_for_task(
                task_info,
                RECORDS_WRITTEN,
                "Count of records written by this subtask",
            ),
            bytes_written: counter_for_task(
                task_info,
                BYTES_WRITTEN,
                "Count of encoded bytes written by this subtask",
            ),
            files_committed: counter_for_task(
                task_info,
                FILES_COMMITTED,
                "Count of part files committed by this subtask",
            ),
            active_buckets: gauge_for_task(
                task_info,
                ACTIVE_BUCKETS,
                "Number of buckets this subtask is tracking",
            ),
            pending_files: gauge_for_task(
                task_info,
                PENDING_FILES,
                "Number of closed part files waiting for a checkpoint to complete",
            ),
        }
    }

    pub fn record_write(&self, bytes: usize) {
        if let Some(c) = &self.records_written {
            c.inc();
        }
        if let Some(c) = &self.bytes_written {
            c.inc_by(bytes as u64);
        }
    }

    pub fn files_committed(&self, count: usize) {
        if let Some(c) = &self.files_committed {
            c.inc_by(count as u64);
        }
    }

    pub fn set_buckets(&self, active: usize, pending_files: usize) {
        if let Some(g) = &self.active_buckets {
            g.set(active as i64);
        }
        if let Some(g) = &self.pending_files {
            g.set(pending_files as i64);
        }
    }
}
