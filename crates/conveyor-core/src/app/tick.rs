//! TickOrchestrator - 1 回分の「claim → 実行 → 遷移」
//!
//! # フロー
//! 1. `claim_next` で 1 件取る。なければ `Idle`
//! 2. タスクの PipelineState を読み、`mark_running`
//! 3. 現ステージの連携を呼ぶ（失敗も値で返ってくる。panic は spawn 境界で拾う）
//! 4. 成功: 出力を保存 → lease 確認 → `mark_succeeded` → 保存 → 次ステージを積む → job を ack
//! 5. 失敗: `mark_failed` → キューに retry / DLQ を判断させる（lease 確認込み）→
//!    `schedule_retry` か `move_to_dead_letter` → 保存
//!
//! PipelineState はメモリ上で遷移させ、キュー側の結果が決まってから保存します。
//! 途中でプロセスが落ちても保存済みの状態は QUEUED のままで、
//! job は lease 切れで別のワーカーに回収されます。
//!
//! 止まっていたワーカーが後から戻ってきても状態は巻き戻りません。
//! - lease が別のワーカーに移っていれば何も保存せず `Skipped(LeaseLost)`
//! - 保存は読み込んだ revision との CAS。先を越されたら自分の job を閉じて `Skipped(Superseded)`
//!
//! job はステージを運ばない「このタスクを進めよ」という合図です。
//! どのステージを実行するかは常に PipelineState が決めます。

use std::sync::Arc;

use serde::Serialize;
use serde_json::json;
use tracing::{debug, error, info, warn};

use super::engine::PipelineEngine;
use crate::domain::{
    AdapterCode, AuditAction, AuditEvent, AuditTarget, ErrorKind, Failure, IntegrationResult,
    JobId, PipelineStage, PipelineState, TaskId,
};
use crate::error::ConveyorError;
use crate::observability::metrics;
use crate::queue::{FailureDisposition, JobKind, Lease, QueueJob};

/// Why a claimed job was acknowledged without running a stage.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum SkipReason {
    /// The pipeline already finished its last stage.
    AlreadyDone,
    /// The pipeline is in the dead-letter state.
    PipelineDeadLettered,
    /// The lease expired and another worker took the job over; nothing was saved.
    LeaseLost,
    /// Another writer saved the pipeline state first; this run's result was dropped.
    Superseded,
}

/// Outcome of one tick, shaped for synchronous tick endpoints.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum TickOutcome {
    /// Nothing was eligible.
    Idle,
    /// A stage completed and the next stage's job was enqueued.
    Advanced {
        task_id: TaskId,
        job_id: JobId,
        completed_stage: PipelineStage,
        next_stage: PipelineStage,
        next_job_id: JobId,
    },
    /// The last stage completed; the task is done.
    Succeeded {
        task_id: TaskId,
        job_id: JobId,
        completed_stage: PipelineStage,
    },
    /// The stage failed. `retryable` tells whether the job was requeued.
    Failed {
        task_id: TaskId,
        job_id: JobId,
        stage: PipelineStage,
        error_kind: ErrorKind,
        #[serde(skip_serializing_if = "Option::is_none")]
        error_code: Option<AdapterCode>,
        retryable: bool,
    },
    Skipped {
        task_id: TaskId,
        job_id: JobId,
        reason: SkipReason,
    },
}

impl TickOutcome {
    pub fn status(&self) -> &'static str {
        match self {
            TickOutcome::Idle => "idle",
            TickOutcome::Advanced { .. } => "advanced",
            TickOutcome::Succeeded { .. } => "succeeded",
            TickOutcome::Failed { .. } => "failed",
            TickOutcome::Skipped { .. } => "skipped",
        }
    }

    pub fn is_idle(&self) -> bool {
        matches!(self, TickOutcome::Idle)
    }

    pub fn completed_stage(&self) -> Option<PipelineStage> {
        match self {
            TickOutcome::Advanced {
                completed_stage, ..
            }
            | TickOutcome::Succeeded {
                completed_stage, ..
            } => Some(*completed_stage),
            _ => None,
        }
    }

    pub fn retryable(&self) -> Option<bool> {
        match self {
            TickOutcome::Failed { retryable, .. } => Some(*retryable),
            _ => None,
        }
    }
}

/// Runs ticks on behalf of one worker id (stamped into `locked_by`).
#[derive(Clone)]
pub struct TickOrchestrator {
    engine: PipelineEngine,
    worker_id: String,
}

impl TickOrchestrator {
    pub fn new(engine: PipelineEngine, worker_id: impl Into<String>) -> Self {
        Self {
            engine,
            worker_id: worker_id.into(),
        }
    }

    pub fn worker_id(&self) -> &str {
        &self.worker_id
    }

    #[tracing::instrument(skip(self), fields(worker_id = %self.worker_id))]
    pub async fn tick(&self) -> Result<TickOutcome, ConveyorError> {
        let engine = &self.engine;

        let Some(job) = engine.claim_as(&self.worker_id).await? else {
            return Ok(TickOutcome::Idle);
        };

        let Some(mut state) = engine.pipelines.load(job.task_id).await? else {
            return self.orphaned(job).await;
        };

        if state.is_done() || state.is_in_dead_letter() {
            let reason = if state.is_done() {
                SkipReason::AlreadyDone
            } else {
                SkipReason::PipelineDeadLettered
            };
            debug!(job_id = %job.id, task_id = %job.task_id, ?reason, "skipping job");
            self.ack(&job).await?;
            return Ok(skipped(&job, reason));
        }

        if let Err(e) = state.mark_running(engine.clock.now()) {
            // 保存済みの状態が QUEUED 以外なのは整合性の破綻。job は DLQ に退避して報告する
            error!(job_id = %job.id, task_id = %job.task_id, error = %e, "pipeline state out of sync");
            engine.move_to_dlq(job.id, ErrorKind::InternalError).await?;
            return Err(e);
        }

        let stage = state.stage();
        debug!(
            job_id = %job.id,
            task_id = %job.task_id,
            %stage,
            attempt = state.attempt_count(),
            "running stage"
        );

        match self.run_stage(stage, job.task_id).await {
            IntegrationResult::Succeeded { payload } => {
                self.on_success(job, state, stage, payload).await
            }
            IntegrationResult::Failed {
                error_kind,
                retryable,
                code,
                message,
            } => {
                if let Some(message) = &message {
                    debug!(job_id = %job.id, %stage, detail = %message, "stage failed");
                }
                let failure = Failure {
                    kind: error_kind,
                    code,
                };
                self.on_failure(job, state, stage, failure, retryable).await
            }
        }
    }

    /// Run the integration on its own task so a panic becomes a failure value.
    async fn run_stage(&self, stage: PipelineStage, task_id: TaskId) -> IntegrationResult {
        let integration = Arc::clone(self.engine.integrations.get(stage));
        match tokio::spawn(async move { integration.run(task_id).await }).await {
            Ok(result) => result,
            Err(join_error) => {
                error!(%task_id, %stage, error = %join_error, "stage integration aborted");
                IntegrationResult::failure(ErrorKind::InternalError, true)
                    .with_message(join_error.to_string())
            }
        }
    }

    async fn on_success(
        &self,
        job: QueueJob,
        mut state: PipelineState,
        stage: PipelineStage,
        payload: serde_json::Value,
    ) -> Result<TickOutcome, ConveyorError> {
        let engine = &self.engine;

        engine.outputs.write(job.task_id, stage, payload).await?;
        if let Err(e) = engine.queue.verify_lease(job.id, &self.lease(&job)).await {
            return self.lease_lost(&job, e);
        }
        state.mark_succeeded(engine.clock.now())?;
        if let Err(e) = engine.pipelines.save(&state).await {
            return self.superseded(&job, e).await;
        }

        let next_job = if state.is_done() {
            None
        } else {
            let next = engine
                .queue
                .enqueue(job.task_id, JobKind::AdvancePipeline, state.stage())
                .await?;
            engine.record_enqueued(&next).await;
            Some(next)
        };

        match self.ack(&job).await {
            Ok(()) => {}
            // 保存と次の job は済んでいる。回収した側は新しい状態を見て動く
            Err(e) if e.is_lease_lost() => {
                warn!(job_id = %job.id, task_id = %job.task_id, "lease lost after the stage was saved");
            }
            Err(e) => return Err(e),
        }

        let next_stage = next_job.as_ref().map(|next| next.stage);
        engine.emit(metrics::STAGE_SUCCEEDED, vec![("stage", stage.to_string())]);
        engine
            .record(AuditEvent::new(
                AuditAction::StageSucceeded,
                AuditTarget::Task,
                job.task_id,
                json!({ "stage": stage, "next_stage": next_stage }),
                engine.clock.now(),
            ))
            .await;

        Ok(match next_job {
            Some(next) => {
                info!(task_id = %job.task_id, completed = %stage, next = %next.stage, "stage advanced");
                TickOutcome::Advanced {
                    task_id: job.task_id,
                    job_id: job.id,
                    completed_stage: stage,
                    next_stage: next.stage,
                    next_job_id: next.id,
                }
            }
            None => {
                info!(task_id = %job.task_id, "pipeline finished");
                TickOutcome::Succeeded {
                    task_id: job.task_id,
                    job_id: job.id,
                    completed_stage: stage,
                }
            }
        })
    }

    async fn on_failure(
        &self,
        job: QueueJob,
        mut state: PipelineState,
        stage: PipelineStage,
        failure: Failure,
        retryable: bool,
    ) -> Result<TickOutcome, ConveyorError> {
        let engine = &self.engine;

        state.mark_failed(failure.kind, engine.clock.now())?;
        let lease = self.lease(&job);
        let disposition = match engine
            .queue
            .mark_failed(job.id, failure, retryable, Some(&lease))
            .await
        {
            Ok(disposition) => disposition,
            Err(e) => return self.lease_lost(&job, e),
        };

        let now = engine.clock.now();
        match &disposition {
            FailureDisposition::Retry { delay, .. } => {
                state.schedule_retry(now)?;
                warn!(
                    task_id = %job.task_id,
                    %stage,
                    error = %failure,
                    attempt = state.attempt_count(),
                    delay_secs = delay.as_secs(),
                    "stage failed, retry scheduled"
                );
            }
            FailureDisposition::DeadLettered { .. } => {
                state.move_to_dead_letter(now)?;
            }
        }
        engine.record_disposition(&disposition, failure).await;
        if let Err(e) = engine.pipelines.save(&state).await {
            if !e.is_stale_state() {
                return Err(e);
            }
            // job 側の処理は済んでいる。状態は先に保存した側に任せる
            warn!(job_id = %job.id, task_id = %job.task_id, "pipeline state moved on, failure not recorded on it");
            self.heal(job.task_id).await?;
            return Ok(skipped(&job, SkipReason::Superseded));
        }

        Ok(TickOutcome::Failed {
            task_id: job.task_id,
            job_id: job.id,
            stage,
            error_kind: failure.kind,
            error_code: failure.code,
            retryable: disposition.is_retry(),
        })
    }

    fn lease(&self, job: &QueueJob) -> Lease {
        Lease::new(self.worker_id.clone(), job.attempt)
    }

    async fn ack(&self, job: &QueueJob) -> Result<(), ConveyorError> {
        let lease = self.lease(job);
        let acked = self.engine.queue.mark_succeeded(job.id, Some(&lease)).await?;
        self.engine.record_job_succeeded(&acked).await;
        Ok(())
    }

    /// Our lease is gone: the new holder owns the job and the state.
    fn lease_lost(&self, job: &QueueJob, e: ConveyorError) -> Result<TickOutcome, ConveyorError> {
        if !e.is_lease_lost() {
            return Err(e);
        }
        warn!(job_id = %job.id, task_id = %job.task_id, "lease lost while the stage ran, dropping result");
        Ok(skipped(job, SkipReason::LeaseLost))
    }

    /// Another writer saved first. Close our job and keep the task's own job alive.
    async fn superseded(
        &self,
        job: &QueueJob,
        e: ConveyorError,
    ) -> Result<TickOutcome, ConveyorError> {
        if !e.is_stale_state() {
            return Err(e);
        }
        warn!(job_id = %job.id, task_id = %job.task_id, "pipeline state moved on, dropping result");
        match self.ack(job).await {
            Ok(()) => {}
            Err(e) if e.is_lease_lost() => return Ok(skipped(job, SkipReason::LeaseLost)),
            Err(e) => return Err(e),
        }
        self.heal(job.task_id).await?;
        Ok(skipped(job, SkipReason::Superseded))
    }

    /// Re-enqueue if the task is unfinished and no job is left for it.
    async fn heal(&self, task_id: TaskId) -> Result<(), ConveyorError> {
        let Some(state) = self.engine.pipelines.load(task_id).await? else {
            return Ok(());
        };
        if !state.status().is_terminal() {
            self.engine.ensure_job(&state).await?;
        }
        Ok(())
    }

    /// Job whose task has no pipeline state: nothing can ever run it.
    async fn orphaned(&self, job: QueueJob) -> Result<TickOutcome, ConveyorError> {
        warn!(job_id = %job.id, task_id = %job.task_id, "job references unknown task");
        self.engine.move_to_dlq(job.id, ErrorKind::NotFound).await?;
        Ok(TickOutcome::Failed {
            task_id: job.task_id,
            job_id: job.id,
            stage: job.stage,
            error_kind: ErrorKind::NotFound,
            error_code: None,
            retryable: false,
        })
    }
}

fn skipped(job: &QueueJob, reason: SkipReason) -> TickOutcome {
    TickOutcome::Skipped {
        task_id: job.task_id,
        job_id: job.id,
        reason,
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicU32, Ordering};
    use std::time::Duration;

    use async_trait::async_trait;
    use tokio::sync::Notify;
    use chrono::{TimeZone, Utc};
    use rstest::rstest;
    use ulid::Ulid;

    use super::*;
    use crate::app::EngineBuilder;
    use crate::config::EngineConfig;
    use crate::domain::JobStatus;
    use crate::impls::{
        InMemoryPipelineStore, RecordingAuditSink, RecordingMetricsSink, ScriptedIntegration,
        StaticIntegration,
    };
    use crate::ports::{AuditSink, FixedClock, StageIntegration};
    use crate::queue::DeadLetterReason;

    struct Harness {
        engine: PipelineEngine,
        clock: Arc<FixedClock>,
        pipelines: Arc<InMemoryPipelineStore>,
        audit: Arc<RecordingAuditSink>,
        metrics: Arc<RecordingMetricsSink>,
    }

    fn harness() -> Harness {
        build_harness(None)
    }

    /// Static integrations everywhere except `stage`.
    fn harness_with(stage: PipelineStage, integration: Arc<dyn StageIntegration>) -> Harness {
        build_harness(Some((stage, integration)))
    }

    fn build_harness(replaced: Option<(PipelineStage, Arc<dyn StageIntegration>)>) -> Harness {
        let clock = Arc::new(FixedClock::new(
            Utc.with_ymd_and_hms(2026, 1, 1, 0, 0, 0).unwrap(),
        ));
        let pipelines = Arc::new(InMemoryPipelineStore::new());
        let audit = Arc::new(RecordingAuditSink::new());
        let metrics = Arc::new(RecordingMetricsSink::new());

        let mut builder = EngineBuilder::new(EngineConfig::default())
            .with_clock(clock.clone())
            .with_pipeline_store(pipelines.clone())
            .with_audit_sink(audit.clone())
            .with_metrics_sink(metrics.clone());
        for stage in PipelineStage::ALL {
            let integration: Arc<dyn StageIntegration> = match &replaced {
                Some((s, integration)) if *s == stage => Arc::clone(integration),
                _ => Arc::new(StaticIntegration::new(stage)),
            };
            builder = builder.register_arc(stage, integration).unwrap();
        }

        Harness {
            engine: builder.build().unwrap(),
            clock,
            pipelines,
            audit,
            metrics,
        }
    }

    struct Panicking;

    #[async_trait]
    impl StageIntegration for Panicking {
        async fn run(&self, _task_id: TaskId) -> IntegrationResult {
            panic!("integration blew up");
        }
    }

    /// First call parks until `release` is notified; later calls succeed at once.
    #[derive(Default)]
    struct Gate {
        calls: AtomicU32,
        entered: Notify,
        release: Notify,
    }

    #[async_trait]
    impl StageIntegration for Gate {
        async fn run(&self, task_id: TaskId) -> IntegrationResult {
            if self.calls.fetch_add(1, Ordering::SeqCst) == 0 {
                self.entered.notify_one();
                self.release.notified().await;
            }
            IntegrationResult::success(json!({ "task_id": task_id.to_string() }))
        }
    }

    struct BrokenAudit;

    #[async_trait]
    impl AuditSink for BrokenAudit {
        async fn record(&self, _event: AuditEvent) -> Result<(), ConveyorError> {
            Err(ConveyorError::Storage("audit table locked".into()))
        }
    }

    #[tokio::test]
    async fn empty_queue_is_idle() {
        let h = harness();
        assert_eq!(h.engine.tick().await.unwrap(), TickOutcome::Idle);
    }

    #[tokio::test]
    async fn pipeline_runs_every_stage_in_order() {
        let h = harness();
        let task_id = h.engine.submit_task("actor", "key").await.unwrap().task_id;

        let mut completed = Vec::new();
        for _ in 0..PipelineStage::ALL.len() {
            let outcome = h.engine.tick().await.unwrap();
            completed.push(outcome.completed_stage().unwrap());
        }
        assert_eq!(completed, PipelineStage::ALL.to_vec());
        assert_eq!(h.engine.tick().await.unwrap(), TickOutcome::Idle);

        let state = h.engine.task_status(task_id).await.unwrap();
        assert!(state.is_done());
        assert_eq!(state.stage(), PipelineStage::Cleanup);
        assert_eq!(state.status(), JobStatus::Succeeded);

        let outputs = h.engine.task_outputs(task_id).await.unwrap();
        assert_eq!(
            outputs.keys().copied().collect::<Vec<_>>(),
            PipelineStage::ALL.to_vec()
        );
        assert_eq!(outputs[&PipelineStage::Photos].payload["stage"], "photos");

        let counts = h.engine.queue_counts().await.unwrap();
        assert_eq!(counts.succeeded, 5);
        assert_eq!(counts.in_flight(), 0);
        assert_eq!(h.metrics.count(metrics::STAGE_SUCCEEDED), 5);
        assert_eq!(h.audit.count(AuditAction::StageSucceeded), 5);
        assert_eq!(h.audit.count(AuditAction::JobEnqueued), 5);
    }

    #[tokio::test]
    async fn advanced_outcome_points_at_the_next_job() {
        let h = harness();
        h.engine.submit_task("actor", "key").await.unwrap();

        let outcome = h.engine.tick().await.unwrap();
        let TickOutcome::Advanced {
            next_stage,
            next_job_id,
            ..
        } = outcome
        else {
            panic!("expected advanced, got {outcome:?}");
        };
        assert_eq!(next_stage, PipelineStage::Photos);

        let next = h.engine.job(next_job_id).await.unwrap();
        assert_eq!(next.status, JobStatus::Queued);
        assert_eq!(next.stage, PipelineStage::Photos);
    }

    #[tokio::test]
    async fn flaky_stage_is_retried_after_backoff() {
        let photos = Arc::new(ScriptedIntegration::flaky(2));
        let h = harness_with(PipelineStage::Photos, photos.clone());
        let task_id = h.engine.submit_task("actor", "key").await.unwrap().task_id;

        h.engine.tick().await.unwrap();

        let first = h.engine.tick().await.unwrap();
        assert_eq!(first.retryable(), Some(true));
        let state = h.engine.task_status(task_id).await.unwrap();
        assert_eq!(state.status(), JobStatus::Queued);
        assert_eq!(state.attempt_count(), 1);
        assert_eq!(state.last_error(), Some(ErrorKind::IntegrationUnavailable));

        // 60s backoff
        assert!(h.engine.tick().await.unwrap().is_idle());
        h.clock.advance(Duration::from_secs(60));
        assert_eq!(h.engine.tick().await.unwrap().retryable(), Some(true));
        assert_eq!(
            h.engine.task_status(task_id).await.unwrap().attempt_count(),
            2
        );

        // 300s backoff
        h.clock.advance(Duration::from_secs(299));
        assert!(h.engine.tick().await.unwrap().is_idle());
        h.clock.advance(Duration::from_secs(1));
        let outcome = h.engine.tick().await.unwrap();
        assert_eq!(outcome.completed_stage(), Some(PipelineStage::Photos));

        let state = h.engine.task_status(task_id).await.unwrap();
        assert_eq!(state.stage(), PipelineStage::Publish);
        assert_eq!(state.attempt_count(), 0);
        assert_eq!(state.last_error(), None);
        assert_eq!(photos.calls(), 3);
        assert_eq!(h.audit.count(AuditAction::JobRetryScheduled), 2);
        assert_eq!(h.metrics.count(metrics::RETRY_SCHEDULED), 2);
    }

    #[tokio::test]
    async fn exhausted_retries_dead_letter_the_task() {
        let failing = ScriptedIntegration::new(IntegrationResult::adapter_failure(
            ErrorKind::IntegrationUnavailable,
            AdapterCode::Http5xx,
            true,
        ));
        let h = harness_with(PipelineStage::Parse, Arc::new(failing));
        let task_id = h.engine.submit_task("actor", "key").await.unwrap().task_id;

        let mut last = TickOutcome::Idle;
        for _ in 0..3 {
            last = h.engine.tick().await.unwrap();
            h.clock.advance(Duration::from_secs(900));
        }
        assert_eq!(last.retryable(), Some(false));
        assert!(h.engine.tick().await.unwrap().is_idle());

        let state = h.engine.task_status(task_id).await.unwrap();
        assert!(state.is_in_dead_letter());
        assert_eq!(state.attempt_count(), 3);

        let dead = h.engine.dead_letters(10, 0).await.unwrap();
        assert_eq!(dead.len(), 1);
        assert_eq!(dead[0].task_id, task_id);
        assert_eq!(dead[0].reason, DeadLetterReason::Exhausted);
        assert_eq!(dead[0].attempts, 3);
        assert_eq!(dead[0].last_error_code, Some(AdapterCode::Http5xx));
        assert_eq!(h.metrics.count(metrics::DEAD_LETTER), 1);
    }

    #[rstest]
    #[case::fatal_kind(IntegrationResult::failure(ErrorKind::ValidationError, true))]
    #[case::caller_says_final(IntegrationResult::failure(ErrorKind::IntegrationUnavailable, false))]
    #[case::contract_mismatch(IntegrationResult::adapter_failure(
        ErrorKind::IntegrationUnavailable,
        AdapterCode::ContractMismatch,
        true
    ))]
    #[tokio::test]
    async fn non_retryable_failures_dead_letter_on_first_attempt(#[case] result: IntegrationResult) {
        let h = harness_with(
            PipelineStage::Publish,
            Arc::new(ScriptedIntegration::new(result)),
        );
        let task_id = h.engine.submit_task("actor", "key").await.unwrap().task_id;
        h.engine.tick().await.unwrap();
        h.engine.tick().await.unwrap();

        let outcome = h.engine.tick().await.unwrap();
        assert!(matches!(
            outcome,
            TickOutcome::Failed {
                stage: PipelineStage::Publish,
                retryable: false,
                ..
            }
        ));

        let state = h.engine.task_status(task_id).await.unwrap();
        assert!(state.is_in_dead_letter());
        assert_eq!(state.stage(), PipelineStage::Publish);
        assert_eq!(state.attempt_count(), 1);

        let dead = h.engine.dead_letters(10, 0).await.unwrap();
        assert_eq!(dead[0].reason, DeadLetterReason::Fatal);
        assert_eq!(dead[0].attempts, 1);

        // 出力は完了済みステージの分だけ
        let outputs = h.engine.task_outputs(task_id).await.unwrap();
        assert_eq!(outputs.len(), 2);
        assert!(h.engine.tick().await.unwrap().is_idle());
    }

    #[tokio::test]
    async fn panicking_integration_becomes_a_retryable_internal_error() {
        let h = harness_with(PipelineStage::Parse, Arc::new(Panicking));
        let task_id = h.engine.submit_task("actor", "key").await.unwrap().task_id;

        let outcome = h.engine.tick().await.unwrap();
        assert!(matches!(
            outcome,
            TickOutcome::Failed {
                error_kind: ErrorKind::InternalError,
                retryable: true,
                ..
            }
        ));
        let state = h.engine.task_status(task_id).await.unwrap();
        assert_eq!(state.status(), JobStatus::Queued);
        assert_eq!(state.last_error(), Some(ErrorKind::InternalError));
    }

    #[tokio::test]
    async fn job_without_pipeline_state_goes_to_the_dlq() {
        let h = harness();
        let ghost = TaskId::from_ulid(Ulid::new());
        let job = h
            .engine
            .queue
            .enqueue(ghost, JobKind::AdvancePipeline, PipelineStage::Parse)
            .await
            .unwrap();

        let outcome = h.engine.tick().await.unwrap();
        assert_eq!(
            outcome,
            TickOutcome::Failed {
                task_id: ghost,
                job_id: job.id,
                stage: PipelineStage::Parse,
                error_kind: ErrorKind::NotFound,
                error_code: None,
                retryable: false,
            }
        );
        let record = h.engine.queue.dead_letter(job.id).await.unwrap().unwrap();
        assert_eq!(record.last_error, ErrorKind::NotFound);
        assert_eq!(record.reason, DeadLetterReason::Forced);
    }

    #[tokio::test]
    async fn stray_job_for_finished_task_is_skipped() {
        let h = harness();
        let task_id = h.engine.submit_task("actor", "key").await.unwrap().task_id;
        for _ in 0..5 {
            h.engine.tick().await.unwrap();
        }

        let stray = h
            .engine
            .queue
            .enqueue(task_id, JobKind::AdvancePipeline, PipelineStage::Export)
            .await
            .unwrap();
        let outcome = h.engine.tick().await.unwrap();
        assert_eq!(
            outcome,
            TickOutcome::Skipped {
                task_id,
                job_id: stray.id,
                reason: SkipReason::AlreadyDone,
            }
        );
        assert_eq!(
            h.engine.job(stray.id).await.unwrap().status,
            JobStatus::Succeeded
        );
        assert_eq!(h.engine.task_outputs(task_id).await.unwrap().len(), 5);
    }

    #[tokio::test]
    async fn idempotent_creation_records_one_create_and_one_hit() {
        let h = harness();

        let first = h.engine.submit_task("actor", "key").await.unwrap();
        let second = h.engine.submit_task("actor", "key").await.unwrap();
        let other_actor = h.engine.submit_task("someone-else", "key").await.unwrap();

        assert!(first.created);
        assert!(!second.created);
        assert_eq!(first.task_id, second.task_id);
        assert_ne!(first.task_id, other_actor.task_id);

        assert_eq!(h.audit.count(AuditAction::TaskCreated), 2);
        assert_eq!(h.audit.count(AuditAction::TaskIdempotencyHit), 1);
        assert_eq!(h.engine.queue_counts().await.unwrap().queued, 2);
        assert_eq!(h.pipelines.len().await, 2);

        let hit = h
            .audit
            .events()
            .into_iter()
            .find(|e| e.action == AuditAction::TaskIdempotencyHit)
            .unwrap();
        assert_eq!(hit.actor_id.as_deref(), Some("actor"));
        assert_eq!(hit.target_id, first.task_id.to_string());
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn concurrent_duplicate_creates_converge_on_one_task() {
        let h = harness();

        let handles: Vec<_> = (0..8)
            .map(|_| {
                let engine = h.engine.clone();
                tokio::spawn(async move { engine.create_task("actor", "same").await })
            })
            .collect();
        let mut admissions = Vec::new();
        for handle in handles {
            admissions.push(handle.await.unwrap().unwrap());
        }

        let task_id = admissions[0].task_id;
        assert!(admissions.iter().all(|a| a.task_id == task_id));
        assert_eq!(admissions.iter().filter(|a| a.created).count(), 1);
        assert_eq!(h.pipelines.len().await, 1);
        assert_eq!(h.audit.count(AuditAction::TaskCreated), 1);
        assert_eq!(h.audit.count(AuditAction::TaskIdempotencyHit), 7);
    }

    #[tokio::test]
    async fn restart_resets_a_retrying_stage_but_not_a_dead_letter() {
        let h = harness_with(
            PipelineStage::Parse,
            Arc::new(ScriptedIntegration::flaky(1)),
        );
        let task_id = h.engine.submit_task("actor", "key").await.unwrap().task_id;
        let failed = h.engine.tick().await.unwrap();
        assert_eq!(
            h.engine.task_status(task_id).await.unwrap().attempt_count(),
            1
        );

        let restarted = h.engine.restart_task(task_id).await.unwrap();
        let state = h.engine.task_status(task_id).await.unwrap();
        assert_eq!(state.attempt_count(), 0);
        assert_eq!(state.last_error(), None);

        // backoff 待ちの job を巻き戻して使う。生きている job は 1 つだけ
        let TickOutcome::Failed { job_id, .. } = failed else {
            panic!("expected failed, got {failed:?}");
        };
        assert_eq!(restarted, job_id);
        assert_eq!(h.engine.queue_counts().await.unwrap().in_flight(), 1);
        assert_eq!(h.engine.job(job_id).await.unwrap().attempt, 0);

        // 新しい job は backoff を待たずに claim できる
        let outcome = h.engine.tick().await.unwrap();
        assert_eq!(outcome.completed_stage(), Some(PipelineStage::Parse));

        let ghost = TaskId::from_ulid(Ulid::new());
        assert!(matches!(
            h.engine.restart_task(ghost).await,
            Err(ConveyorError::TaskNotFound(id)) if id == ghost
        ));
    }

    #[tokio::test]
    async fn restart_is_rejected_for_dead_lettered_tasks() {
        let denied = IntegrationResult::failure(ErrorKind::SecurityDenied, false);
        let h = harness_with(
            PipelineStage::Parse,
            Arc::new(ScriptedIntegration::new(denied)),
        );
        let task_id = h.engine.submit_task("actor", "key").await.unwrap().task_id;
        h.engine.tick().await.unwrap();

        let err = h.engine.restart_task(task_id).await.unwrap_err();
        assert!(err.is_invalid_transition());
        assert!(h.engine.enqueue_advance(task_id).await.is_err());
    }

    #[tokio::test]
    async fn stalled_worker_cannot_move_the_stage_back() {
        let gate = Arc::new(Gate::default());
        let h = harness_with(PipelineStage::Parse, gate.clone());
        let task_id = h.engine.submit_task("actor", "key").await.unwrap().task_id;

        let stalled = h.engine.worker("worker-a");
        let handle = tokio::spawn(async move { stalled.tick().await });
        gate.entered.notified().await;

        // lease 切れ。worker-b が回収して 3 ステージ進める
        h.clock.advance(Duration::from_secs(601));
        let worker_b = h.engine.worker("worker-b");
        let first = worker_b.tick().await.unwrap();
        let TickOutcome::Advanced { job_id: parse_job, .. } = first else {
            panic!("expected advanced, got {first:?}");
        };
        for expected in [PipelineStage::Photos, PipelineStage::Publish] {
            let outcome = worker_b.tick().await.unwrap();
            assert_eq!(outcome.completed_stage(), Some(expected));
        }

        gate.release.notify_one();
        let outcome = handle.await.unwrap().unwrap();
        assert_eq!(
            outcome,
            TickOutcome::Skipped {
                task_id,
                job_id: parse_job,
                reason: SkipReason::LeaseLost,
            }
        );

        let state = h.engine.task_status(task_id).await.unwrap();
        assert_eq!(state.stage(), PipelineStage::Export);
        assert_eq!(state.status(), JobStatus::Queued);

        let counts = h.engine.queue_counts().await.unwrap();
        assert_eq!(counts.queued, 1);
        assert_eq!(counts.running, 0);
        assert_eq!(counts.succeeded, 3);
        assert_eq!(gate.calls.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn duplicate_job_loses_the_race_without_rewinding_state() {
        let gate = Arc::new(Gate::default());
        let h = harness_with(PipelineStage::Parse, gate.clone());
        let task_id = h.engine.submit_task("actor", "key").await.unwrap().task_id;

        // ensure_enqueued を経由しない重複行
        h.clock.advance(Duration::from_secs(1));
        let duplicate = h
            .engine
            .queue
            .enqueue(task_id, JobKind::AdvancePipeline, PipelineStage::Parse)
            .await
            .unwrap();

        let slow = h.engine.worker("worker-a");
        let handle = tokio::spawn(async move { slow.tick().await });
        gate.entered.notified().await;

        let fast = h.engine.worker("worker-b").tick().await.unwrap();
        let TickOutcome::Advanced {
            job_id,
            next_job_id,
            ..
        } = fast
        else {
            panic!("expected advanced, got {fast:?}");
        };
        assert_eq!(job_id, duplicate.id);

        gate.release.notify_one();
        let outcome = handle.await.unwrap().unwrap();
        assert!(matches!(
            outcome,
            TickOutcome::Skipped {
                reason: SkipReason::Superseded,
                ..
            }
        ));

        let state = h.engine.task_status(task_id).await.unwrap();
        assert_eq!(state.stage(), PipelineStage::Photos);
        assert_eq!(state.attempt_count(), 0);

        // 負けた側の job は閉じられ、残るのは worker-b が積んだ Photos の job だけ
        let counts = h.engine.queue_counts().await.unwrap();
        assert_eq!(counts.in_flight(), 1);
        assert_eq!(
            h.engine.job(next_job_id).await.unwrap().status,
            JobStatus::Queued
        );
    }

    #[tokio::test]
    async fn restart_during_a_running_stage_discards_that_run() {
        let gate = Arc::new(Gate::default());
        let h = harness_with(PipelineStage::Parse, gate.clone());
        let task_id = h.engine.submit_task("actor", "key").await.unwrap().task_id;

        let running = h.engine.worker("worker-a");
        let handle = tokio::spawn(async move { running.tick().await });
        gate.entered.notified().await;

        h.engine.restart_task(task_id).await.unwrap();
        gate.release.notify_one();
        let outcome = handle.await.unwrap().unwrap();
        assert!(matches!(
            outcome,
            TickOutcome::Skipped {
                reason: SkipReason::Superseded,
                ..
            }
        ));

        // 状態は PARSE のまま、新しい job で最初からやり直す
        let state = h.engine.task_status(task_id).await.unwrap();
        assert_eq!(state.stage(), PipelineStage::Parse);
        assert_eq!(h.engine.queue_counts().await.unwrap().queued, 1);

        let again = h.engine.tick().await.unwrap();
        assert_eq!(again.completed_stage(), Some(PipelineStage::Parse));
        assert_eq!(gate.calls.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn audit_failures_do_not_stop_the_pipeline() {
        let clock = Arc::new(FixedClock::new(Utc::now()));
        let engine = PipelineStage::ALL
            .into_iter()
            .try_fold(
                EngineBuilder::new(EngineConfig::default())
                    .with_clock(clock)
                    .with_audit_sink(Arc::new(BrokenAudit)),
                |builder, stage| builder.register(stage, StaticIntegration::new(stage)),
            )
            .unwrap()
            .build()
            .unwrap();

        let task_id = engine.submit_task("actor", "key").await.unwrap().task_id;
        for _ in 0..5 {
            engine.tick().await.unwrap();
        }
        assert!(engine.task_status(task_id).await.unwrap().is_done());
    }

    #[test]
    fn outcome_serializes_with_a_status_tag() {
        let task_id = TaskId::from_ulid(Ulid::new());
        let job_id = JobId::from_ulid(Ulid::new());

        let json = serde_json::to_value(TickOutcome::Failed {
            task_id,
            job_id,
            stage: PipelineStage::Export,
            error_kind: ErrorKind::IntegrationUnavailable,
            error_code: None,
            retryable: true,
        })
        .unwrap();
        assert_eq!(json["status"], "failed");
        assert_eq!(json["stage"], "export");
        assert_eq!(json["error_kind"], "integration_unavailable");
        assert!(json.get("error_code").is_none());

        let idle = serde_json::to_value(TickOutcome::Idle).unwrap();
        assert_eq!(idle, serde_json::json!({ "status": "idle" }));
        assert_eq!(TickOutcome::Idle.status(), "idle");
    }
}
