//! InMemoryIdempotencyStore - `(actor, key)` の一意制約を HashMap の entry で表現

use std::collections::HashMap;
use std::collections::hash_map::Entry;

use async_trait::async_trait;
use tokio::sync::Mutex;

use crate::domain::TaskId;
use crate::error::ConveyorError;
use crate::ports::{IdempotencyStore, KeyInsert};

#[derive(Default)]
pub struct InMemoryIdempotencyStore {
    keys: Mutex<HashMap<(String, String), TaskId>>,
}

impl InMemoryIdempotencyStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl IdempotencyStore for InMemoryIdempotencyStore {
    async fn get(&self, actor_id: &str, key: &str) -> Result<Option<TaskId>, ConveyorError> {
        let keys = self.keys.lock().await;
        Ok(keys.get(&(actor_id.to_string(), key.to_string())).copied())
    }

    async fn insert_if_absent(
        &self,
        actor_id: &str,
        key: &str,
        task_id: TaskId,
    ) -> Result<KeyInsert, ConveyorError> {
        let mut keys = self.keys.lock().await;
        match keys.entry((actor_id.to_string(), key.to_string())) {
            Entry::Occupied(existing) => Ok(KeyInsert::Existing(*existing.get())),
            Entry::Vacant(slot) => {
                slot.insert(task_id);
                Ok(KeyInsert::Inserted)
            }
        }
    }
}
