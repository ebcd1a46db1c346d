//! IdempotencyStore port
//!
//! `(actor_id, idempotency_key) → task_id` の一意制約をストレージ境界で持つ。
//! SQL 実装なら UNIQUE 制約 + `INSERT ... ON CONFLICT DO NOTHING` を想定。

use async_trait::async_trait;

use crate::domain::TaskId;
use crate::error::ConveyorError;

/// Result of [`IdempotencyStore::insert_if_absent`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum KeyInsert {
    Inserted,
    /// Someone already owns the key; carries the stored task id.
    Existing(TaskId),
}

#[async_trait]
pub trait IdempotencyStore: Send + Sync {
    async fn get(&self, actor_id: &str, key: &str) -> Result<Option<TaskId>, ConveyorError>;

    /// Atomic insert-or-get.
    async fn insert_if_absent(
        &self,
        actor_id: &str,
        key: &str,
        task_id: TaskId,
    ) -> Result<KeyInsert, ConveyorError>;
}
