//! PipelineState - タスクごとのステージ状態機械
//!
//! # 遷移
//! ```text
//! create ──► QUEUED ──mark_running──► RUNNING ──mark_succeeded──► QUEUED (次のステージ)
//!              ▲                         │                       SUCCEEDED (最終ステージ)
//!              │                    mark_failed
//!        schedule_retry                  ▼
//!              └──────────────────── FAILED ──move_to_dead_letter──► DEAD_LETTER
//! ```
//!
//! # 不変条件
//! - `attempt_count` は `mark_running` でのみ増え、ステージが進んだ時にだけ 0 に戻る
//! - `last_error` は成功でクリア、`mark_failed` でセット、`schedule_retry` では保持
//! - `DEAD_LETTER` に入ったら何も変えられない（全操作が `InvalidStateTransition`）
//! - 失敗した操作は状態を一切変更しない
//!
//! パイプラインの識別子はタスク ID そのものです（1 タスクにつき 1 インスタンス）。
//!
//! `revision` は遷移メソッドでは変わりません。ストアが保存のたびに 1 つ進め、
//! 読み込んだ時点の値と一致しない保存を拒否します（楽観ロック）。

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use super::{ErrorKind, JobStatus, PipelineStage, TaskId};
use crate::error::ConveyorError;

const ENTITY: &str = "pipeline_state";

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PipelineState {
    task_id: TaskId,
    stage: PipelineStage,
    status: JobStatus,
    attempt_count: u32,
    last_error: Option<ErrorKind>,
    updated_at: DateTime<Utc>,
    #[serde(default)]
    revision: u64,
}

impl PipelineState {
    /// New pipeline at the first stage, queued, no attempts yet.
    pub fn create(task_id: TaskId, now: DateTime<Utc>) -> Self {
        Self {
            task_id,
            stage: PipelineStage::FIRST,
            status: JobStatus::Queued,
            attempt_count: 0,
            last_error: None,
            updated_at: now,
            revision: 0,
        }
    }

    pub fn task_id(&self) -> TaskId {
        self.task_id
    }

    pub fn stage(&self) -> PipelineStage {
        self.stage
    }

    pub fn status(&self) -> JobStatus {
        self.status
    }

    pub fn attempt_count(&self) -> u32 {
        self.attempt_count
    }

    pub fn last_error(&self) -> Option<ErrorKind> {
        self.last_error
    }

    pub fn updated_at(&self) -> DateTime<Utc> {
        self.updated_at
    }

    /// Store revision this copy was loaded at.
    pub fn revision(&self) -> u64 {
        self.revision
    }

    /// For store implementations: the revision the stored row takes after a save.
    pub fn bump_revision(&mut self) {
        self.revision += 1;
    }

    pub fn is_done(&self) -> bool {
        self.stage.is_last() && self.status == JobStatus::Succeeded
    }

    pub fn is_in_dead_letter(&self) -> bool {
        self.status == JobStatus::DeadLetter
    }

    pub fn mark_running(&mut self, now: DateTime<Utc>) -> Result<(), ConveyorError> {
        self.require(JobStatus::Queued, "mark_running")?;
        self.status = JobStatus::Running;
        self.attempt_count += 1;
        self.updated_at = now;
        Ok(())
    }

    /// 現ステージの完了。次があれば進めて QUEUED、最終ステージなら SUCCEEDED。
    pub fn mark_succeeded(&mut self, now: DateTime<Utc>) -> Result<(), ConveyorError> {
        self.require(JobStatus::Running, "mark_succeeded")?;
        match self.stage.next() {
            Some(next) => {
                self.stage = next;
                self.status = JobStatus::Queued;
                self.attempt_count = 0;
            }
            None => {
                self.status = JobStatus::Succeeded;
            }
        }
        self.last_error = None;
        self.updated_at = now;
        Ok(())
    }

    pub fn mark_failed(&mut self, kind: ErrorKind, now: DateTime<Utc>) -> Result<(), ConveyorError> {
        self.require(JobStatus::Running, "mark_failed")?;
        self.status = JobStatus::Failed;
        self.last_error = Some(kind);
        self.updated_at = now;
        Ok(())
    }

    pub fn schedule_retry(&mut self, now: DateTime<Utc>) -> Result<(), ConveyorError> {
        self.require(JobStatus::Failed, "schedule_retry")?;
        self.status = JobStatus::Queued;
        self.updated_at = now;
        Ok(())
    }

    pub fn move_to_dead_letter(&mut self, now: DateTime<Utc>) -> Result<(), ConveyorError> {
        self.require(JobStatus::Failed, "move_to_dead_letter")?;
        self.status = JobStatus::DeadLetter;
        self.updated_at = now;
        Ok(())
    }

    /// Administrative reset of the current stage for a manual restart.
    ///
    /// 終端（DEAD_LETTER / 完了済み）からは戻せません。ステージは変えない。
    pub fn start(&mut self, now: DateTime<Utc>) -> Result<(), ConveyorError> {
        if self.status.is_terminal() {
            return Err(ConveyorError::transition(ENTITY, self.status, "start"));
        }
        self.status = JobStatus::Queued;
        self.attempt_count = 0;
        self.last_error = None;
        self.updated_at = now;
        Ok(())
    }

    fn require(&self, expected: JobStatus, action: &'static str) -> Result<(), ConveyorError> {
        if self.status != expected {
            return Err(ConveyorError::transition(ENTITY, self.status, action));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;
    use rstest::rstest;
    use ulid::Ulid;

    fn now() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2024, 1, 1, 0, 0, 0).unwrap()
    }

    fn fresh() -> PipelineState {
        PipelineState::create(TaskId::from_ulid(Ulid::new()), now())
    }

    fn dead_lettered() -> PipelineState {
        let mut state = fresh();
        state.mark_running(now()).unwrap();
        state.mark_failed(ErrorKind::ValidationError, now()).unwrap();
        state.move_to_dead_letter(now()).unwrap();
        state
    }

    #[test]
    fn create_starts_at_parse_queued() {
        let state = fresh();
        assert_eq!(state.stage(), PipelineStage::Parse);
        assert_eq!(state.status(), JobStatus::Queued);
        assert_eq!(state.attempt_count(), 0);
        assert_eq!(state.last_error(), None);
        assert!(!state.is_done());
    }

    #[test]
    fn stages_advance_in_order_without_skipping() {
        let mut state = fresh();
        let mut seen = vec![state.stage()];

        while !state.is_done() {
            state.mark_running(now()).unwrap();
            state.mark_succeeded(now()).unwrap();
            if !state.is_done() {
                seen.push(state.stage());
            }
        }

        assert_eq!(seen, PipelineStage::ALL.to_vec());
        assert_eq!(state.stage(), PipelineStage::Cleanup);
        assert_eq!(state.status(), JobStatus::Succeeded);
    }

    #[test]
    fn attempt_count_survives_retries_and_resets_on_advance() {
        let mut state = fresh();

        for _ in 0..2 {
            state.mark_running(now()).unwrap();
            state
                .mark_failed(ErrorKind::IntegrationUnavailable, now())
                .unwrap();
            state.schedule_retry(now()).unwrap();
            assert_eq!(state.last_error(), Some(ErrorKind::IntegrationUnavailable));
        }

        state.mark_running(now()).unwrap();
        assert_eq!(state.attempt_count(), 3);

        state.mark_succeeded(now()).unwrap();
        assert_eq!(state.attempt_count(), 0);
        assert_eq!(state.stage(), PipelineStage::Photos);
        assert_eq!(state.last_error(), None);
    }

    #[test]
    fn mark_failed_keeps_attempt_count() {
        let mut state = fresh();
        state.mark_running(now()).unwrap();
        state.mark_failed(ErrorKind::RateLimited, now()).unwrap();

        assert_eq!(state.status(), JobStatus::Failed);
        assert_eq!(state.attempt_count(), 1);
    }

    #[rstest]
    #[case::mark_running("mark_running")]
    #[case::mark_succeeded("mark_succeeded")]
    #[case::mark_failed("mark_failed")]
    #[case::schedule_retry("schedule_retry")]
    #[case::move_to_dead_letter("move_to_dead_letter")]
    #[case::start("start")]
    fn dead_letter_is_immutable(#[case] op: &str) {
        let mut state = dead_lettered();
        let before = state.clone();

        let result = match op {
            "mark_running" => state.mark_running(now()),
            "mark_succeeded" => state.mark_succeeded(now()),
            "mark_failed" => state.mark_failed(ErrorKind::InternalError, now()),
            "schedule_retry" => state.schedule_retry(now()),
            "move_to_dead_letter" => state.move_to_dead_letter(now()),
            "start" => state.start(now()),
            other => unreachable!("unknown op {other}"),
        };

        assert!(result.unwrap_err().is_invalid_transition());
        assert_eq!(state, before);
        assert!(state.is_in_dead_letter());
    }

    #[test]
    fn wrong_status_is_rejected_without_mutation() {
        let mut state = fresh();
        let before = state.clone();

        assert!(state.mark_succeeded(now()).is_err());
        assert!(state.mark_failed(ErrorKind::InternalError, now()).is_err());
        assert!(state.schedule_retry(now()).is_err());
        assert!(state.move_to_dead_letter(now()).is_err());
        assert_eq!(state, before);

        state.mark_running(now()).unwrap();
        assert!(state.mark_running(now()).is_err());
        assert_eq!(state.attempt_count(), 1);
    }

    #[test]
    fn start_resets_current_stage() {
        let mut state = fresh();
        state.mark_running(now()).unwrap();
        state.mark_succeeded(now()).unwrap();
        state.mark_running(now()).unwrap();
        state.mark_failed(ErrorKind::InternalError, now()).unwrap();

        state.start(now()).unwrap();

        assert_eq!(state.stage(), PipelineStage::Photos);
        assert_eq!(state.status(), JobStatus::Queued);
        assert_eq!(state.attempt_count(), 0);
        assert_eq!(state.last_error(), None);
    }

    #[test]
    fn finished_pipeline_cannot_be_restarted() {
        let mut state = fresh();
        while !state.is_done() {
            state.mark_running(now()).unwrap();
            state.mark_succeeded(now()).unwrap();
        }
        assert!(state.start(now()).unwrap_err().is_invalid_transition());
    }
}
