//! QueueJob: キューの 1 行。
//!
//! 同じステージの再試行では同じ行を使い回します（attempt をその場で増やす）。
//! 成功か DEAD_LETTER で行は終端になり、次のステージは新しい行として積まれます。
//!
//! 状態遷移はすべてここのメソッド経由。ストレージ実装（in-memory / SQL）は
//! 「どの行を選ぶか」と「原子的に書き戻すこと」だけを担当します。

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use super::dead_letter::{DeadLetterReason, DeadLetterRecord};
use crate::domain::{AdapterCode, ErrorKind, Failure, JobId, JobStatus, PipelineStage, TaskId};
use crate::error::ConveyorError;

const ENTITY: &str = "queue_job";

/// What a job asks the worker to do. The pipeline has a single kind of work.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum JobKind {
    AdvancePipeline,
}

impl JobKind {
    pub fn as_str(self) -> &'static str {
        match self {
            JobKind::AdvancePipeline => "advance_pipeline",
        }
    }
}

/// Proof of a claim: the worker that claimed the row and on which attempt.
///
/// lease 切れで別のワーカーが claim し直すと `attempt` が進むので、古い lease は一致しなくなる。
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Lease {
    pub worker_id: String,
    pub attempt: u32,
}

impl Lease {
    pub fn new(worker_id: impl Into<String>, attempt: u32) -> Self {
        Self {
            worker_id: worker_id.into(),
            attempt,
        }
    }
}

/// Durable queue row.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct QueueJob {
    pub id: JobId,
    pub task_id: TaskId,
    pub kind: JobKind,
    /// Stage the job was enqueued for. PipelineState stays authoritative.
    pub stage: PipelineStage,
    pub status: JobStatus,
    /// Number of claims so far (1 after the first claim).
    pub attempt: u32,
    pub last_error_kind: Option<ErrorKind>,
    pub last_error_code: Option<AdapterCode>,
    pub available_at: DateTime<Utc>,
    pub locked_at: Option<DateTime<Utc>>,
    pub locked_by: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl QueueJob {
    pub fn new(id: JobId, task_id: TaskId, stage: PipelineStage, now: DateTime<Utc>) -> Self {
        Self {
            id,
            task_id,
            kind: JobKind::AdvancePipeline,
            stage,
            status: JobStatus::Queued,
            attempt: 0,
            last_error_kind: None,
            last_error_code: None,
            available_at: now,
            locked_at: None,
            locked_by: None,
            created_at: now,
            updated_at: now,
        }
    }

    /// いつから claim 可能か。claim できない行は `None`。
    ///
    /// - QUEUED: `available_at` 以降
    /// - RUNNING: lease 切れ (`locked_at + lease_timeout`) 以降
    pub fn claimable_since(
        &self,
        now: DateTime<Utc>,
        lease_timeout: chrono::Duration,
    ) -> Option<DateTime<Utc>> {
        let since = match self.status {
            JobStatus::Queued => self.available_at,
            JobStatus::Running => self.locked_at? + lease_timeout,
            _ => return None,
        };
        (since <= now).then_some(since)
    }

    pub fn is_lease_expired(&self, now: DateTime<Utc>, lease_timeout: chrono::Duration) -> bool {
        self.status == JobStatus::Running
            && self
                .locked_at
                .is_some_and(|locked_at| locked_at + lease_timeout <= now)
    }

    /// Current lease, if the row is running.
    pub fn lease(&self) -> Option<Lease> {
        if self.status != JobStatus::Running {
            return None;
        }
        self.locked_by
            .as_ref()
            .map(|worker_id| Lease::new(worker_id.clone(), self.attempt))
    }

    /// `LeaseLost` unless the row is still running under `lease`.
    pub fn check_lease(&self, lease: &Lease) -> Result<(), ConveyorError> {
        if self.lease().as_ref() != Some(lease) {
            return Err(ConveyorError::LeaseLost(self.id));
        }
        Ok(())
    }

    pub fn claim(&mut self, worker_id: &str, now: DateTime<Utc>) -> Result<(), ConveyorError> {
        if !matches!(self.status, JobStatus::Queued | JobStatus::Running) {
            return Err(ConveyorError::transition(ENTITY, self.status, "claim"));
        }
        self.status = JobStatus::Running;
        self.attempt += 1;
        self.locked_at = Some(now);
        self.locked_by = Some(worker_id.to_string());
        self.updated_at = now;
        Ok(())
    }

    pub fn mark_succeeded(&mut self, now: DateTime<Utc>) -> Result<(), ConveyorError> {
        if self.status != JobStatus::Running {
            return Err(ConveyorError::transition(ENTITY, self.status, "mark_succeeded"));
        }
        self.status = JobStatus::Succeeded;
        self.release(now);
        Ok(())
    }

    pub fn schedule_retry(
        &mut self,
        failure: Failure,
        available_at: DateTime<Utc>,
        now: DateTime<Utc>,
    ) -> Result<(), ConveyorError> {
        if self.status != JobStatus::Running {
            return Err(ConveyorError::transition(ENTITY, self.status, "schedule_retry"));
        }
        self.status = JobStatus::Queued;
        self.available_at = available_at;
        self.record_failure(failure);
        self.release(now);
        Ok(())
    }

    /// DEAD_LETTER へ移し、DLQ に積むスナップショットを返す。
    ///
    /// QUEUED / RUNNING / FAILED から移せる。終端（SUCCEEDED, DEAD_LETTER）からは不可。
    pub fn dead_letter(
        &mut self,
        failure: Failure,
        reason: DeadLetterReason,
        now: DateTime<Utc>,
    ) -> Result<DeadLetterRecord, ConveyorError> {
        if self.status.is_terminal() {
            return Err(ConveyorError::transition(ENTITY, self.status, "dead_letter"));
        }
        self.status = JobStatus::DeadLetter;
        self.record_failure(failure);
        self.release(now);
        Ok(DeadLetterRecord {
            job_id: self.id,
            task_id: self.task_id,
            kind: self.kind,
            stage: self.stage,
            attempts: self.attempt,
            last_error: failure.kind,
            last_error_code: failure.code,
            reason,
            moved_at: now,
        })
    }

    /// Manual restart of a queued row: attempt back to 0, due immediately.
    pub fn restart(&mut self, now: DateTime<Utc>) -> Result<(), ConveyorError> {
        if self.status != JobStatus::Queued {
            return Err(ConveyorError::transition(ENTITY, self.status, "restart"));
        }
        self.attempt = 0;
        self.available_at = now;
        self.updated_at = now;
        Ok(())
    }

    pub fn is_live(&self) -> bool {
        matches!(self.status, JobStatus::Queued | JobStatus::Running)
    }

    fn record_failure(&mut self, failure: Failure) {
        self.last_error_kind = Some(failure.kind);
        self.last_error_code = failure.code;
    }

    fn release(&mut self, now: DateTime<Utc>) {
        self.locked_at = None;
        self.locked_by = None;
        self.updated_at = now;
    }
}
