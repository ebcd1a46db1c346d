use serde::{Deserialize, Serialize};

/// Number of queue rows per status.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct QueueCounts {
    pub queued: usize,
    pub running: usize,
    pub succeeded: usize,
    pub failed: usize,
    pub dead_letter: usize,
}

impl QueueCounts {
    /// Rows that may still be claimed (queued or holding a lease).
    pub fn in_flight(&self) -> usize {
        self.queued + self.running
    }
}

/// Metric names emitted through [`crate::ports::MetricsSink`].
pub mod metrics {
    pub const STAGE_SUCCEEDED: &str = "pipeline.stage.succeeded";
    pub const RETRY_SCHEDULED: &str = "job.retry_scheduled";
    pub const DEAD_LETTER: &str = "job.dead_letter";
}
