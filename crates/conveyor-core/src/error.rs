use thiserror::Error;

use crate::domain::{JobId, PipelineStage, TaskId};

/// Crate-wide error.
///
/// ステージ連携の業務エラーはここには来ません（`IntegrationResult` の値として返る）。
/// ここに来るのは状態遷移違反・参照切れ・設定ミス・ストレージ障害だけです。
#[derive(Debug, Error)]
pub enum ConveyorError {
    #[error("invalid state transition: cannot {action} {entity} in status {from}")]
    InvalidStateTransition {
        entity: &'static str,
        from: String,
        action: &'static str,
    },

    #[error("job not found: {0}")]
    JobNotFound(JobId),

    #[error("task not found: {0}")]
    TaskNotFound(TaskId),

    #[error("pipeline state already exists for {0}")]
    TaskAlreadyExists(TaskId),

    /// 保存しようとした PipelineState が読み込み後に別の書き手に更新されていた
    #[error("pipeline state for {0} changed since it was loaded")]
    StaleState(TaskId),

    /// claim した lease が切れて別のワーカーに移った（または行がもう終端）
    #[error("lease on job {0} is no longer held")]
    LeaseLost(JobId),

    #[error("unknown {kind}: {value:?}")]
    UnknownValue { kind: &'static str, value: String },

    #[error("duplicate integration for stage={0}")]
    DuplicateIntegration(PipelineStage),

    #[error("missing integrations for stages: {0:?}")]
    MissingIntegrations(Vec<PipelineStage>),

    #[error("invalid config: {0}")]
    InvalidConfig(String),

    #[error("storage error: {0}")]
    Storage(String),
}

impl ConveyorError {
    pub(crate) fn transition(
        entity: &'static str,
        from: impl ToString,
        action: &'static str,
    ) -> Self {
        Self::InvalidStateTransition {
            entity,
            from: from.to_string(),
            action,
        }
    }

    pub fn is_invalid_transition(&self) -> bool {
        matches!(self, Self::InvalidStateTransition { .. })
    }

    pub fn is_stale_state(&self) -> bool {
        matches!(self, Self::StaleState(_))
    }

    pub fn is_lease_lost(&self) -> bool {
        matches!(self, Self::LeaseLost(_))
    }
}
