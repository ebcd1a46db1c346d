//! InMemoryOutputStore - ステージ出力の保存（開発用）

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use tokio::sync::Mutex;

use crate::domain::{PipelineStage, TaskId};
use crate::error::ConveyorError;
use crate::ports::{Clock, StageOutput, TaskOutputStore, TaskOutputs};

/// `BTreeMap` に入れるだけで読み出しはステージ順になる。
pub struct InMemoryOutputStore {
    outputs: Mutex<HashMap<TaskId, TaskOutputs>>,
    clock: Arc<dyn Clock>,
}

impl InMemoryOutputStore {
    pub fn new(clock: Arc<dyn Clock>) -> Self {
        Self {
            outputs: Mutex::new(HashMap::new()),
            clock,
        }
    }
}

#[async_trait]
impl TaskOutputStore for InMemoryOutputStore {
    async fn write(
        &self,
        task_id: TaskId,
        stage: PipelineStage,
        payload: serde_json::Value,
    ) -> Result<(), ConveyorError> {
        let output = StageOutput {
            payload,
            written_at: self.clock.now(),
        };
        let mut outputs = self.outputs.lock().await;
        outputs.entry(task_id).or_default().insert(stage, output);
        Ok(())
    }

    async fn read(&self, task_id: TaskId) -> Result<TaskOutputs, ConveyorError> {
        let outputs = self.outputs.lock().await;
        Ok(outputs.get(&task_id).cloned().unwrap_or_default())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ports::SystemClock;
    use serde_json::json;
    use ulid::Ulid;

    #[tokio::test]
    async fn read_is_in_stage_order_regardless_of_write_order() {
        let store = InMemoryOutputStore::new(Arc::new(SystemClock));
        let task_id = TaskId::from_ulid(Ulid::new());

        for stage in [
            PipelineStage::Cleanup,
            PipelineStage::Parse,
            PipelineStage::Export,
            PipelineStage::Photos,
            PipelineStage::Publish,
        ] {
            store
                .write(task_id, stage, json!({ "stage": stage.as_str() }))
                .await
                .unwrap();
        }

        let keys: Vec<&str> = store
            .read(task_id)
            .await
            .unwrap()
            .keys()
            .map(|stage| stage.as_str())
            .collect();
        assert_eq!(keys, ["parse", "photos", "publish", "export", "cleanup"]);
    }

    #[tokio::test]
    async fn last_write_for_a_stage_wins() {
        let store = InMemoryOutputStore::new(Arc::new(SystemClock));
        let task_id = TaskId::from_ulid(Ulid::new());

        store.write(task_id, PipelineStage::Parse, json!(1)).await.unwrap();
        store.write(task_id, PipelineStage::Parse, json!(2)).await.unwrap();

        let outputs = store.read(task_id).await.unwrap();
        assert_eq!(outputs.len(), 1);
        assert_eq!(outputs[&PipelineStage::Parse].payload, json!(2));
    }

    #[tokio::test]
    async fn unknown_task_reads_empty() {
        let store = InMemoryOutputStore::new(Arc::new(SystemClock));
        let outputs = store.read(TaskId::from_ulid(Ulid::new())).await.unwrap();
        assert!(outputs.is_empty());
    }
}
