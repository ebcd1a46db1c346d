//! Stage integration port - ステージごとの外部連携
//!
//! parser / photo masking / publisher / exporter / cleanup の各サービスへの呼び出しは
//! この trait の実装として起動時に登録します（`app::IntegrationRegistry`）。
//!
//! # 契約
//! - `run` は失敗しても `Err` を返さない。必ず [`IntegrationResult`] に正規化する
//! - 同じ `(task_id, stage)` で複数回呼ばれても壊れないこと（at-least-once）
//! - 1 回の呼び出しのタイムアウトは実装側の責任（`impls::TimeoutIntegration` を参照）

use async_trait::async_trait;

use crate::domain::{IntegrationResult, TaskId};

#[async_trait]
pub trait StageIntegration: Send + Sync {
    /// Short name for logs.
    fn name(&self) -> &str {
        std::any::type_name::<Self>()
    }

    async fn run(&self, task_id: TaskId) -> IntegrationResult;
}
