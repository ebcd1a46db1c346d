//! InMemoryPipelineStore - 開発用・テスト用の PipelineState 正本

use std::collections::HashMap;

use async_trait::async_trait;
use tokio::sync::Mutex;

use crate::domain::{PipelineState, TaskId};
use crate::error::ConveyorError;
use crate::ports::PipelineStateStore;

#[derive(Default)]
pub struct InMemoryPipelineStore {
    states: Mutex<HashMap<TaskId, PipelineState>>,
}

impl InMemoryPipelineStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn len(&self) -> usize {
        self.states.lock().await.len()
    }
}

#[async_trait]
impl PipelineStateStore for InMemoryPipelineStore {
    async fn insert(&self, state: PipelineState) -> Result<(), ConveyorError> {
        let mut states = self.states.lock().await;
        let task_id = state.task_id();
        if states.contains_key(&task_id) {
            return Err(ConveyorError::TaskAlreadyExists(task_id));
        }
        states.insert(task_id, state);
        Ok(())
    }

    async fn load(&self, task_id: TaskId) -> Result<Option<PipelineState>, ConveyorError> {
        Ok(self.states.lock().await.get(&task_id).cloned())
    }

    async fn save(&self, state: &PipelineState) -> Result<(), ConveyorError> {
        let mut states = self.states.lock().await;
        let slot = states
            .get_mut(&state.task_id())
            .ok_or(ConveyorError::TaskNotFound(state.task_id()))?;
        if slot.revision() != state.revision() {
            return Err(ConveyorError::StaleState(state.task_id()));
        }
        *slot = state.clone();
        slot.bump_revision();
        Ok(())
    }

    async fn remove(&self, task_id: TaskId) -> Result<bool, ConveyorError> {
        Ok(self.states.lock().await.remove(&task_id).is_some())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::{JobStatus, PipelineStage};
    use chrono::Utc;
    use ulid::Ulid;

    #[tokio::test]
    async fn insert_is_exclusive_and_save_requires_existing() {
        let store = InMemoryPipelineStore::new();
        let task_id = TaskId::from_ulid(Ulid::new());
        let mut state = PipelineState::create(task_id, Utc::now());

        assert!(matches!(
            store.save(&state).await,
            Err(ConveyorError::TaskNotFound(_))
        ));

        store.insert(state.clone()).await.unwrap();
        assert!(matches!(
            store.insert(state.clone()).await,
            Err(ConveyorError::TaskAlreadyExists(_))
        ));

        state.mark_running(Utc::now()).unwrap();
        store.save(&state).await.unwrap();
        let stored = store.load(task_id).await.unwrap().unwrap();
        assert_eq!(stored.status(), JobStatus::Running);
        assert_eq!(stored.revision(), 1);

        assert!(store.remove(task_id).await.unwrap());
        assert!(!store.remove(task_id).await.unwrap());
        assert_eq!(store.len().await, 0);
    }

    #[tokio::test]
    async fn save_from_an_outdated_copy_is_rejected() {
        let store = InMemoryPipelineStore::new();
        let task_id = TaskId::from_ulid(Ulid::new());
        store
            .insert(PipelineState::create(task_id, Utc::now()))
            .await
            .unwrap();

        let mut ahead = store.load(task_id).await.unwrap().unwrap();
        let mut behind = ahead.clone();

        ahead.mark_running(Utc::now()).unwrap();
        ahead.mark_succeeded(Utc::now()).unwrap();
        store.save(&ahead).await.unwrap();

        behind.mark_running(Utc::now()).unwrap();
        behind
            .mark_failed(crate::domain::ErrorKind::InternalError, Utc::now())
            .unwrap();
        behind.schedule_retry(Utc::now()).unwrap();
        assert!(store.save(&behind).await.unwrap_err().is_stale_state());

        let stored = store.load(task_id).await.unwrap().unwrap();
        assert_eq!(stored.stage(), PipelineStage::Photos);
        assert_eq!(stored.revision(), 1);
    }
}
