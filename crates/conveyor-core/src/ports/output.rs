//! Task output port.

use std::collections::BTreeMap;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::domain::{PipelineStage, TaskId};
use crate::error::ConveyorError;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StageOutput {
    pub payload: serde_json::Value,
    pub written_at: DateTime<Utc>,
}

/// Outputs of one task, keyed (and therefore ordered) by stage.
pub type TaskOutputs = BTreeMap<PipelineStage, StageOutput>;

/// One row per `(task, stage)`; the last write for a stage wins.
#[async_trait]
pub trait TaskOutputStore: Send + Sync {
    async fn write(
        &self,
        task_id: TaskId,
        stage: PipelineStage,
        payload: serde_json::Value,
    ) -> Result<(), ConveyorError>;

    /// Always in `PipelineStage` order, whatever the write order was.
    async fn read(&self, task_id: TaskId) -> Result<TaskOutputs, ConveyorError>;
}
