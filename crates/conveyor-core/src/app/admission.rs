//! IdempotencyGuard - タスク作成の重複排除
//!
//! # フロー
//! 1. `(actor, key)` を引く。あれば既存の TaskId を返す（作り直さない）
//! 2. なければ initializer で Task + 初期 PipelineState を作る
//! 3. `insert_if_absent` で対応を登録（ストレージの一意制約で原子的）
//! 4. 登録で負けた（同時に同じキーで作られた）場合は勝者の TaskId を返し、
//!    自分が作った分は呼び出し側が片付ける（[`Admission::LostRace`]）

use std::future::Future;
use std::sync::Arc;

use tracing::debug;

use crate::domain::TaskId;
use crate::error::ConveyorError;
use crate::ports::{IdempotencyStore, KeyInsert};

/// Result of [`IdempotencyGuard::create_or_get`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Admission {
    /// The initializer ran and its task owns the key.
    Created(TaskId),
    /// The key was already taken before we looked.
    Existing(TaskId),
    /// The initializer ran, but another caller registered the key first.
    /// `discarded` is the task we created and must clean up.
    LostRace { winner: TaskId, discarded: TaskId },
}

impl Admission {
    /// The task id the caller should use.
    pub fn task_id(&self) -> TaskId {
        match *self {
            Admission::Created(id) | Admission::Existing(id) => id,
            Admission::LostRace { winner, .. } => winner,
        }
    }

    pub fn was_created(&self) -> bool {
        matches!(self, Admission::Created(_))
    }
}

#[derive(Clone)]
pub struct IdempotencyGuard {
    store: Arc<dyn IdempotencyStore>,
}

impl IdempotencyGuard {
    pub fn new(store: Arc<dyn IdempotencyStore>) -> Self {
        Self { store }
    }

    pub async fn create_or_get<F, Fut>(
        &self,
        actor_id: &str,
        key: &str,
        initializer: F,
    ) -> Result<Admission, ConveyorError>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<TaskId, ConveyorError>>,
    {
        if let Some(existing) = self.store.get(actor_id, key).await? {
            return Ok(Admission::Existing(existing));
        }

        let created = initializer().await?;

        match self.store.insert_if_absent(actor_id, key, created).await? {
            KeyInsert::Inserted => Ok(Admission::Created(created)),
            KeyInsert::Existing(winner) => {
                debug!(actor_id, %winner, discarded = %created, "lost idempotency race");
                Ok(Admission::LostRace {
                    winner,
                    discarded: created,
                })
            }
        }
    }
}
