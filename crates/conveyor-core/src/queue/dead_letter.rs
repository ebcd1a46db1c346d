//! Dead-letter records.
//!
//! 書き込んだら変更しない（append-only）。オペレータが後から調べるためのスナップショット。

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use super::JobKind;
use crate::domain::{AdapterCode, ErrorKind, JobId, PipelineStage, TaskId};

/// Why a job ended up in the DLQ.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DeadLetterReason {
    /// Retryable, but `max_attempts` was used up.
    Exhausted,
    /// Classified as non-retryable.
    Fatal,
    /// Forced through `move_to_dlq`.
    Forced,
    /// Lease expired after the last allowed attempt.
    LeaseExhausted,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DeadLetterRecord {
    pub job_id: JobId,
    pub task_id: TaskId,
    pub kind: JobKind,
    pub stage: PipelineStage,
    pub attempts: u32,
    pub last_error: ErrorKind,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_error_code: Option<AdapterCode>,
    pub reason: DeadLetterReason,
    pub moved_at: DateTime<Utc>,
}
