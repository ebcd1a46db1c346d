//! Queue module: job rows, retry policy, DLQ, and the in-memory implementation.

mod dead_letter;
mod memory;
mod record;
mod retry;

pub use dead_letter::{DeadLetterReason, DeadLetterRecord};
pub use memory::InMemoryJobQueue;
pub use record::{JobKind, Lease, QueueJob};
pub use retry::{RetryDecision, RetryPolicy};

use std::time::Duration;

use async_trait::async_trait;

use crate::domain::{Failure, JobId, PipelineStage, TaskId};
use crate::error::ConveyorError;
use crate::observability::QueueCounts;

/// What `mark_failed` did with the job.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FailureDisposition {
    /// Back to QUEUED, claimable again after `delay`.
    Retry { job: QueueJob, delay: Duration },
    /// Moved to DEAD_LETTER; `record` was appended to the DLQ.
    DeadLettered {
        job: QueueJob,
        record: DeadLetterRecord,
    },
}

impl FailureDisposition {
    pub fn is_retry(&self) -> bool {
        matches!(self, FailureDisposition::Retry { .. })
    }

    pub fn job(&self) -> &QueueJob {
        match self {
            FailureDisposition::Retry { job, .. } | FailureDisposition::DeadLettered { job, .. } => {
                job
            }
        }
    }
}

/// What `ensure_enqueued` found for the task.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Enqueued {
    /// No live row existed; this one was inserted.
    New(QueueJob),
    /// The task already had a QUEUED or RUNNING row.
    Existing(QueueJob),
}

impl Enqueued {
    pub fn is_new(&self) -> bool {
        matches!(self, Enqueued::New(_))
    }

    pub fn job(&self) -> &QueueJob {
        match self {
            Enqueued::New(job) | Enqueued::Existing(job) => job,
        }
    }

    pub fn into_job(self) -> QueueJob {
        match self {
            Enqueued::New(job) | Enqueued::Existing(job) => job,
        }
    }
}

/// Durable job queue port.
///
/// # 契約
/// - すべての変更操作は個別に原子的（status と attempt が半端に更新されることはない）
/// - `claim_next` は並行呼び出しでも 1 行につき勝者は 1 人だけ
/// - 同じステージの再試行では同じ行を使い回す
/// - DLQ は追記のみ
/// - `lease` を渡した ack / fail は、その lease がまだ有効な時だけ通る（`LeaseLost`）
/// - `ensure_enqueued` はタスクごとの「生きている行（QUEUED / RUNNING）」を高々 1 つに保つ
///
/// SQL 実装なら `UPDATE ... WHERE status = 'queued' ... RETURNING` や
/// `FOR UPDATE SKIP LOCKED` で claim を書く想定。
#[async_trait]
pub trait JobQueue: Send + Sync {
    /// New row: QUEUED, attempt 0, available now.
    async fn enqueue(
        &self,
        task_id: TaskId,
        kind: JobKind,
        stage: PipelineStage,
    ) -> Result<QueueJob, ConveyorError>;

    /// Insert a row only if the task has no live row; otherwise return that row.
    /// The check and the insert are one atomic step.
    async fn ensure_enqueued(
        &self,
        task_id: TaskId,
        kind: JobKind,
        stage: PipelineStage,
    ) -> Result<Enqueued, ConveyorError>;

    /// Claim one eligible row (queued and due, or running with an expired lease).
    /// `Ok(None)` when nothing is eligible.
    async fn claim_next(&self, worker_id: &str) -> Result<Option<QueueJob>, ConveyorError>;

    /// `LeaseLost` unless the row is still running under `lease`. Changes nothing.
    async fn verify_lease(&self, job_id: JobId, lease: &Lease) -> Result<QueueJob, ConveyorError>;

    /// Ack. With `Some(lease)` the ack only lands for the current holder;
    /// `None` is the operator path and skips the ownership check.
    async fn mark_succeeded(
        &self,
        job_id: JobId,
        lease: Option<&Lease>,
    ) -> Result<QueueJob, ConveyorError>;

    /// Report a failed attempt; the queue consults its [`RetryPolicy`].
    /// `lease` works as in [`JobQueue::mark_succeeded`].
    async fn mark_failed(
        &self,
        job_id: JobId,
        failure: Failure,
        retryable: bool,
        lease: Option<&Lease>,
    ) -> Result<FailureDisposition, ConveyorError>;

    /// Manual restart of a QUEUED row: attempt 0, claimable now.
    async fn restart(&self, job_id: JobId) -> Result<QueueJob, ConveyorError>;

    /// Force DEAD_LETTER without consulting the retry policy.
    async fn move_to_dlq(
        &self,
        job_id: JobId,
        failure: Failure,
    ) -> Result<DeadLetterRecord, ConveyorError>;

    async fn get(&self, job_id: JobId) -> Result<Option<QueueJob>, ConveyorError>;

    async fn counts(&self) -> Result<QueueCounts, ConveyorError>;

    /// DLQ records, oldest first.
    async fn dead_letters(
        &self,
        limit: usize,
        offset: usize,
    ) -> Result<Vec<DeadLetterRecord>, ConveyorError>;

    async fn dead_letter(&self, job_id: JobId) -> Result<Option<DeadLetterRecord>, ConveyorError>;
}
