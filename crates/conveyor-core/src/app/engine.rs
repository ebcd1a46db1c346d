//! PipelineEngine - コアの API 面
//!
//! HTTP / CLI などの薄い外側の層はこの型だけを使います。
//! 中身はすべて起動時に組み立てたポート（`EngineBuilder`）で、`Clone` は Arc のコピーだけ。
//!
//! - `create_task` / `submit_task`: 冪等なタスク受付
//! - `enqueue_advance` / `restart_task`: キュー投入（タスクごとに生きている job は高々 1 つ）
//! - `claim_next` / `mark_succeeded` / `mark_failed` / `move_to_dlq`: キュー操作
//! - `tick`: 1 件 claim して 1 ステージ進める（[`TickOrchestrator`]）
//! - `task_status` / `task_outputs` / `dead_letters` / `queue_counts`: 参照系

use std::sync::Arc;

use serde::Serialize;
use serde_json::json;
use tracing::{info, warn};

use super::admission::{Admission, IdempotencyGuard};
use super::registry::IntegrationRegistry;
use super::tick::{TickOrchestrator, TickOutcome};
use crate::domain::{
    AuditAction, AuditEvent, AuditTarget, ErrorKind, Failure, JobId, JobStatus, PipelineState,
    TaskId,
};
use crate::error::ConveyorError;
use crate::observability::{QueueCounts, metrics};
use crate::ports::{
    AuditSink, Clock, IdGenerator, MetricTags, MetricsSink, PipelineStateStore, TaskOutputStore,
    TaskOutputs,
};
use crate::queue::{DeadLetterRecord, Enqueued, FailureDisposition, JobKind, JobQueue, QueueJob};

/// Worker id used by `claim_next` / `tick` when the caller does not run its own workers.
pub const DEFAULT_WORKER_ID: &str = "engine";

/// Result of task admission.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct TaskAdmission {
    pub task_id: TaskId,
    pub created: bool,
}

#[derive(Clone)]
pub struct PipelineEngine {
    pub(crate) queue: Arc<dyn JobQueue>,
    pub(crate) pipelines: Arc<dyn PipelineStateStore>,
    pub(crate) outputs: Arc<dyn TaskOutputStore>,
    pub(crate) audit: Arc<dyn AuditSink>,
    pub(crate) metrics: Arc<dyn MetricsSink>,
    pub(crate) integrations: Arc<IntegrationRegistry>,
    pub(crate) guard: IdempotencyGuard,
    pub(crate) ids: Arc<dyn IdGenerator>,
    pub(crate) clock: Arc<dyn Clock>,
}

impl PipelineEngine {
    /// Idempotent task creation keyed by `(actor_id, idempotency_key)`.
    ///
    /// 初回だけ PipelineState を作る。2 回目以降は同じ TaskId を返し、
    /// `task.create.idempotency_hit` を記録する。
    pub async fn create_task(
        &self,
        actor_id: &str,
        idempotency_key: &str,
    ) -> Result<TaskAdmission, ConveyorError> {
        let admission = self
            .guard
            .create_or_get(actor_id, idempotency_key, || async {
                let task_id = self.ids.generate_task_id();
                self.pipelines
                    .insert(PipelineState::create(task_id, self.clock.now()))
                    .await?;
                Ok::<_, ConveyorError>(task_id)
            })
            .await?;

        if let Admission::LostRace { discarded, .. } = admission {
            self.pipelines.remove(discarded).await?;
        }

        let task_id = admission.task_id();
        let action = if admission.was_created() {
            info!(%task_id, actor_id, "task created");
            AuditAction::TaskCreated
        } else {
            AuditAction::TaskIdempotencyHit
        };
        self.record(
            AuditEvent::new(
                action,
                AuditTarget::Task,
                task_id,
                json!({ "idempotency_key": idempotency_key }),
                self.clock.now(),
            )
            .with_actor(actor_id),
        )
        .await;

        Ok(TaskAdmission {
            task_id,
            created: admission.was_created(),
        })
    }

    /// `create_task`, then make sure the task has a job.
    ///
    /// 冪等ヒットでも、未完了のタスクに生きている job がなければ積み直す。
    /// 前回の受付が enqueue の手前で失敗していても、同じキーの再送で回復できる。
    pub async fn submit_task(
        &self,
        actor_id: &str,
        idempotency_key: &str,
    ) -> Result<TaskAdmission, ConveyorError> {
        let admission = self.create_task(actor_id, idempotency_key).await?;
        let state = self.load_state(admission.task_id).await?;
        if !state.status().is_terminal() {
            let enqueued = self.ensure_job(&state).await?;
            if enqueued.is_new() && !admission.created {
                warn!(task_id = %admission.task_id, "admitted task had no live job, re-enqueued");
            }
        }
        Ok(admission)
    }

    /// Make sure the task's current stage has a job; returns the live job's id.
    pub async fn enqueue_advance(&self, task_id: TaskId) -> Result<JobId, ConveyorError> {
        let state = self.load_state(task_id).await?;
        if state.status().is_terminal() {
            return Err(ConveyorError::transition(
                "pipeline_state",
                state.status(),
                "enqueue_advance",
            ));
        }
        Ok(self.ensure_job(&state).await?.into_job().id)
    }

    /// Manual restart of the task's current stage (`PipelineState::start`).
    ///
    /// backoff 待ちの job があればそれを巻き戻して再利用し、なければ新しく積む。
    /// 実行中の job はそのまま。そのワーカーの保存は revision 不一致で弾かれる。
    pub async fn restart_task(&self, task_id: TaskId) -> Result<JobId, ConveyorError> {
        let mut state = self.load_state(task_id).await?;
        state.start(self.clock.now())?;
        self.pipelines.save(&state).await?;
        info!(%task_id, stage = %state.stage(), "task restarted");

        let job = match self.ensure_job(&state).await? {
            Enqueued::Existing(job) if job.status == JobStatus::Queued => {
                match self.queue.restart(job.id).await {
                    Ok(job) => job,
                    // claim されたばかり。そのまま走らせる
                    Err(e) if e.is_invalid_transition() => job,
                    Err(e) => return Err(e),
                }
            }
            enqueued => enqueued.into_job(),
        };
        Ok(job.id)
    }

    /// `ensure_enqueued` for the state's current stage, auditing only new rows.
    pub(crate) async fn ensure_job(&self, state: &PipelineState) -> Result<Enqueued, ConveyorError> {
        let enqueued = self
            .queue
            .ensure_enqueued(state.task_id(), JobKind::AdvancePipeline, state.stage())
            .await?;
        if let Enqueued::New(job) = &enqueued {
            self.record_enqueued(job).await;
        }
        Ok(enqueued)
    }

    pub async fn claim_next(&self) -> Result<Option<QueueJob>, ConveyorError> {
        self.claim_as(DEFAULT_WORKER_ID).await
    }

    pub(crate) async fn claim_as(&self, worker_id: &str) -> Result<Option<QueueJob>, ConveyorError> {
        let job = self.queue.claim_next(worker_id).await?;
        if let Some(job) = &job {
            self.record(AuditEvent::new(
                AuditAction::JobClaimed,
                AuditTarget::Job,
                job.id,
                json!({
                    "task_id": job.task_id.to_string(),
                    "attempt": job.attempt,
                    "worker_id": worker_id,
                }),
                self.clock.now(),
            ))
            .await;
        }
        Ok(job)
    }

    /// Operator ack; no lease check.
    pub async fn mark_succeeded(&self, job_id: JobId) -> Result<QueueJob, ConveyorError> {
        let job = self.queue.mark_succeeded(job_id, None).await?;
        self.record_job_succeeded(&job).await;
        Ok(job)
    }

    pub async fn mark_failed(
        &self,
        job_id: JobId,
        kind: ErrorKind,
        retryable: bool,
    ) -> Result<FailureDisposition, ConveyorError> {
        let disposition = self
            .queue
            .mark_failed(job_id, kind.into(), retryable, None)
            .await?;
        self.record_disposition(&disposition, kind.into()).await;
        Ok(disposition)
    }

    /// Force the job into the DLQ (contract violations, operator kill).
    pub async fn move_to_dlq(
        &self,
        job_id: JobId,
        kind: ErrorKind,
    ) -> Result<DeadLetterRecord, ConveyorError> {
        let record = self.queue.move_to_dlq(job_id, kind.into()).await?;
        self.record_dead_letter(&record).await;
        Ok(record)
    }

    /// Claim one job and advance its task by one stage.
    pub async fn tick(&self) -> Result<TickOutcome, ConveyorError> {
        self.worker(DEFAULT_WORKER_ID).tick().await
    }

    pub fn worker(&self, worker_id: impl Into<String>) -> TickOrchestrator {
        TickOrchestrator::new(self.clone(), worker_id)
    }

    pub async fn task_status(&self, task_id: TaskId) -> Result<PipelineState, ConveyorError> {
        self.load_state(task_id).await
    }

    pub async fn task_outputs(&self, task_id: TaskId) -> Result<TaskOutputs, ConveyorError> {
        self.load_state(task_id).await?;
        self.outputs.read(task_id).await
    }

    pub async fn job(&self, job_id: JobId) -> Result<QueueJob, ConveyorError> {
        self.queue
            .get(job_id)
            .await?
            .ok_or(ConveyorError::JobNotFound(job_id))
    }

    pub async fn dead_letters(
        &self,
        limit: usize,
        offset: usize,
    ) -> Result<Vec<DeadLetterRecord>, ConveyorError> {
        self.queue.dead_letters(limit, offset).await
    }

    pub async fn queue_counts(&self) -> Result<QueueCounts, ConveyorError> {
        self.queue.counts().await
    }

    pub(crate) async fn load_state(&self, task_id: TaskId) -> Result<PipelineState, ConveyorError> {
        self.pipelines
            .load(task_id)
            .await?
            .ok_or(ConveyorError::TaskNotFound(task_id))
    }

    // ---- audit / metrics helpers -------------------------------------------------

    /// 監査の書き込み失敗で状態遷移は巻き戻さない。ログに残して続行。
    pub(crate) async fn record(&self, event: AuditEvent) {
        let action = event.action;
        if let Err(e) = self.audit.record(event).await {
            warn!(%action, error = %e, "audit sink rejected event");
        }
    }

    pub(crate) fn emit(&self, name: &'static str, tags: MetricTags) {
        self.metrics.emit(name, tags);
    }

    pub(crate) async fn record_enqueued(&self, job: &QueueJob) {
        self.record(AuditEvent::new(
            AuditAction::JobEnqueued,
            AuditTarget::Job,
            job.id,
            json!({
                "task_id": job.task_id.to_string(),
                "kind": job.kind.as_str(),
                "stage": job.stage,
            }),
            self.clock.now(),
        ))
        .await;
    }

    pub(crate) async fn record_job_succeeded(&self, job: &QueueJob) {
        self.record(AuditEvent::new(
            AuditAction::JobSucceeded,
            AuditTarget::Job,
            job.id,
            json!({ "task_id": job.task_id.to_string(), "attempt": job.attempt }),
            self.clock.now(),
        ))
        .await;
    }

    pub(crate) async fn record_disposition(&self, disposition: &FailureDisposition, failure: Failure) {
        match disposition {
            FailureDisposition::Retry { job, delay } => {
                self.emit(
                    metrics::RETRY_SCHEDULED,
                    vec![
                        ("stage", job.stage.to_string()),
                        ("error_kind", failure.kind.to_string()),
                    ],
                );
                self.record(AuditEvent::new(
                    AuditAction::JobRetryScheduled,
                    AuditTarget::Job,
                    job.id,
                    json!({
                        "task_id": job.task_id.to_string(),
                        "stage": job.stage,
                        "attempt": job.attempt,
                        "error_kind": failure.kind,
                        "error_code": failure.code,
                        "delay_secs": delay.as_secs(),
                        "available_at": job.available_at,
                    }),
                    self.clock.now(),
                ))
                .await;
            }
            FailureDisposition::DeadLettered { record, .. } => {
                self.record_dead_letter(record).await;
            }
        }
    }

    pub(crate) async fn record_dead_letter(&self, record: &DeadLetterRecord) {
        warn!(
            job_id = %record.job_id,
            task_id = %record.task_id,
            stage = %record.stage,
            attempts = record.attempts,
            error_kind = %record.last_error,
            reason = ?record.reason,
            "job moved to dead-letter queue"
        );
        self.emit(
            metrics::DEAD_LETTER,
            vec![
                ("stage", record.stage.to_string()),
                ("error_kind", record.last_error.to_string()),
            ],
        );
        self.record(AuditEvent::new(
            AuditAction::JobDeadLetter,
            AuditTarget::Job,
            record.job_id,
            json!({
                "task_id": record.task_id.to_string(),
                "stage": record.stage,
                "attempts": record.attempts,
                "error_kind": record.last_error,
                "error_code": record.last_error_code,
                "reason": record.reason,
            }),
            self.clock.now(),
        ))
        .await;
    }
}
