//! PipelineStateStore port - PipelineState の正本
//!
//! 1 タスクにつき 1 行。パイプラインが完了しても消さない（完了記録として残る）。

use async_trait::async_trait;

use crate::domain::{PipelineState, TaskId};
use crate::error::ConveyorError;

#[async_trait]
pub trait PipelineStateStore: Send + Sync {
    /// Fails with `TaskAlreadyExists` if a state is already stored for the task.
    async fn insert(&self, state: PipelineState) -> Result<(), ConveyorError>;

    async fn load(&self, task_id: TaskId) -> Result<Option<PipelineState>, ConveyorError>;

    /// Compare-and-swap on `state.revision()`.
    ///
    /// 保存済みの revision が `state.revision()` と一致する時だけ上書きし、revision を 1 進める。
    /// 一致しなければ `StaleState`（他の書き手が先に保存した）。未登録なら `TaskNotFound`。
    /// SQL 実装なら `UPDATE ... WHERE task_id = ? AND revision = ?` の更新件数で判定する想定。
    async fn save(&self, state: &PipelineState) -> Result<(), ConveyorError>;

    /// Returns whether something was removed.
    async fn remove(&self, task_id: TaskId) -> Result<bool, ConveyorError>;
}
