//! In-memory queue implementation.
//!
//! 単一ノードがキューを所有する前提の実装です。すべての変更操作は 1 つの
//! `tokio::sync::Mutex` の中で完結するので、claim は「条件付き遷移を 1 回」
//! 行うのと同じ意味になります（ロックを跨いで await しない）。

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use tokio::sync::Mutex;
use tracing::{debug, warn};

use super::{
    DeadLetterReason, DeadLetterRecord, Enqueued, FailureDisposition, JobKind, JobQueue, Lease,
    QueueJob, RetryDecision, RetryPolicy,
};
use crate::domain::{ErrorKind, Failure, JobId, JobStatus, PipelineStage, TaskId};
use crate::error::ConveyorError;
use crate::observability::QueueCounts;
use crate::ports::clock::to_chrono;
use crate::ports::{Clock, IdGenerator};

/// In-memory queue state.
#[derive(Default)]
struct InMemoryQueueState {
    /// All job rows (single source of truth).
    jobs: HashMap<JobId, QueueJob>,

    /// Append-only DLQ.
    dead_letters: Vec<DeadLetterRecord>,
}

impl InMemoryQueueState {
    fn job_mut(&mut self, job_id: JobId) -> Result<&mut QueueJob, ConveyorError> {
        self.jobs
            .get_mut(&job_id)
            .ok_or(ConveyorError::JobNotFound(job_id))
    }

    /// Running row that is still held under `lease`.
    fn leased_mut(
        &mut self,
        job_id: JobId,
        lease: Option<&Lease>,
    ) -> Result<&mut QueueJob, ConveyorError> {
        let job = self.job_mut(job_id)?;
        if let Some(lease) = lease {
            job.check_lease(lease)?;
        }
        Ok(job)
    }

    fn live_job(&self, task_id: TaskId) -> Option<&QueueJob> {
        self.jobs
            .values()
            .find(|job| job.task_id == task_id && job.is_live())
    }

    /// Eligible rows, earliest first (`claimable_since`, then `created_at`, then id).
    fn candidates(&self, now: DateTime<Utc>, lease: chrono::Duration) -> Vec<JobId> {
        let mut eligible: Vec<(DateTime<Utc>, DateTime<Utc>, JobId)> = self
            .jobs
            .values()
            .filter_map(|job| {
                job.claimable_since(now, lease)
                    .map(|since| (since, job.created_at, job.id))
            })
            .collect();
        eligible.sort();
        eligible.into_iter().map(|(_, _, id)| id).collect()
    }

    fn counts(&self) -> QueueCounts {
        let mut counts = QueueCounts::default();
        for job in self.jobs.values() {
            match job.status {
                JobStatus::Queued => counts.queued += 1,
                JobStatus::Running => counts.running += 1,
                JobStatus::Succeeded => counts.succeeded += 1,
                JobStatus::Failed => counts.failed += 1,
                JobStatus::DeadLetter => counts.dead_letter += 1,
            }
        }
        counts
    }
}

/// In-memory queue implementation.
pub struct InMemoryJobQueue {
    state: Arc<Mutex<InMemoryQueueState>>,
    retry_policy: RetryPolicy,
    lease_timeout: Duration,
    clock: Arc<dyn Clock>,
    ids: Arc<dyn IdGenerator>,
}

impl InMemoryJobQueue {
    pub fn new(
        retry_policy: RetryPolicy,
        lease_timeout: Duration,
        clock: Arc<dyn Clock>,
        ids: Arc<dyn IdGenerator>,
    ) -> Self {
        Self {
            state: Arc::new(Mutex::new(InMemoryQueueState::default())),
            retry_policy,
            lease_timeout,
            clock,
            ids,
        }
    }

    pub fn retry_policy(&self) -> &RetryPolicy {
        &self.retry_policy
    }
}

#[async_trait]
impl JobQueue for InMemoryJobQueue {
    async fn enqueue(
        &self,
        task_id: TaskId,
        kind: JobKind,
        stage: PipelineStage,
    ) -> Result<QueueJob, ConveyorError> {
        let now = self.clock.now();
        let mut job = QueueJob::new(self.ids.generate_job_id(), task_id, stage, now);
        job.kind = kind;

        let mut state = self.state.lock().await;
        state.jobs.insert(job.id, job.clone());
        Ok(job)
    }

    async fn ensure_enqueued(
        &self,
        task_id: TaskId,
        kind: JobKind,
        stage: PipelineStage,
    ) -> Result<Enqueued, ConveyorError> {
        let now = self.clock.now();
        let mut state = self.state.lock().await;
        if let Some(existing) = state.live_job(task_id) {
            return Ok(Enqueued::Existing(existing.clone()));
        }

        let mut job = QueueJob::new(self.ids.generate_job_id(), task_id, stage, now);
        job.kind = kind;
        state.jobs.insert(job.id, job.clone());
        Ok(Enqueued::New(job))
    }

    async fn claim_next(&self, worker_id: &str) -> Result<Option<QueueJob>, ConveyorError> {
        let now = self.clock.now();
        let lease = to_chrono(self.lease_timeout);
        let mut state = self.state.lock().await;

        for job_id in state.candidates(now, lease) {
            let job = state.job_mut(job_id)?;

            // lease 切れで戻ってきた行が最後の試行だったなら、もう一度は渡さない
            if job.is_lease_expired(now, lease) && job.attempt >= self.retry_policy.max_attempts {
                let failure = Failure::new(ErrorKind::InternalError);
                let record = job.dead_letter(failure, DeadLetterReason::LeaseExhausted, now)?;
                warn!(
                    job_id = %record.job_id,
                    task_id = %record.task_id,
                    attempts = record.attempts,
                    "lease expired on final attempt, dead-lettering"
                );
                state.dead_letters.push(record);
                continue;
            }

            let reclaimed = job.status == JobStatus::Running;
            job.claim(worker_id, now)?;
            if reclaimed {
                debug!(job_id = %job.id, worker_id, attempt = job.attempt, "reclaimed expired lease");
            }
            return Ok(Some(job.clone()));
        }

        Ok(None)
    }

    async fn verify_lease(&self, job_id: JobId, lease: &Lease) -> Result<QueueJob, ConveyorError> {
        let state = self.state.lock().await;
        let job = state
            .jobs
            .get(&job_id)
            .ok_or(ConveyorError::JobNotFound(job_id))?;
        job.check_lease(lease)?;
        Ok(job.clone())
    }

    async fn mark_succeeded(
        &self,
        job_id: JobId,
        lease: Option<&Lease>,
    ) -> Result<QueueJob, ConveyorError> {
        let now = self.clock.now();
        let mut state = self.state.lock().await;
        let job = state.leased_mut(job_id, lease)?;
        job.mark_succeeded(now)?;
        Ok(job.clone())
    }

    async fn mark_failed(
        &self,
        job_id: JobId,
        failure: Failure,
        retryable: bool,
        lease: Option<&Lease>,
    ) -> Result<FailureDisposition, ConveyorError> {
        let now = self.clock.now();
        let mut state = self.state.lock().await;
        let job = state.leased_mut(job_id, lease)?;

        if job.status != JobStatus::Running {
            return Err(ConveyorError::transition("queue_job", job.status, "mark_failed"));
        }

        match self.retry_policy.decide(&failure, retryable, job.attempt) {
            RetryDecision::Retry { delay } => {
                job.schedule_retry(failure, now + to_chrono(delay), now)?;
                Ok(FailureDisposition::Retry {
                    job: job.clone(),
                    delay,
                })
            }
            RetryDecision::DeadLetter { reason } => {
                let record = job.dead_letter(failure, reason, now)?;
                let job = job.clone();
                state.dead_letters.push(record.clone());
                Ok(FailureDisposition::DeadLettered { job, record })
            }
        }
    }

    async fn move_to_dlq(
        &self,
        job_id: JobId,
        failure: Failure,
    ) -> Result<DeadLetterRecord, ConveyorError> {
        let now = self.clock.now();
        let mut state = self.state.lock().await;
        let record = state
            .job_mut(job_id)?
            .dead_letter(failure, DeadLetterReason::Forced, now)?;
        state.dead_letters.push(record.clone());
        Ok(record)
    }

    async fn restart(&self, job_id: JobId) -> Result<QueueJob, ConveyorError> {
        let now = self.clock.now();
        let mut state = self.state.lock().await;
        let job = state.job_mut(job_id)?;
        job.restart(now)?;
        Ok(job.clone())
    }

    async fn get(&self, job_id: JobId) -> Result<Option<QueueJob>, ConveyorError> {
        let state = self.state.lock().await;
        Ok(state.jobs.get(&job_id).cloned())
    }

    async fn counts(&self) -> Result<QueueCounts, ConveyorError> {
        let state = self.state.lock().await;
        Ok(state.counts())
    }

    async fn dead_letters(
        &self,
        limit: usize,
        offset: usize,
    ) -> Result<Vec<DeadLetterRecord>, ConveyorError> {
        let state = self.state.lock().await;
        Ok(state
            .dead_letters
            .iter()
            .skip(offset)
            .take(limit)
            .cloned()
            .collect())
    }

    async fn dead_letter(&self, job_id: JobId) -> Result<Option<DeadLetterRecord>, ConveyorError> {
        let state = self.state.lock().await;
        Ok(state
            .dead_letters
            .iter()
            .find(|record| record.job_id == job_id)
            .cloned())
    }
}
