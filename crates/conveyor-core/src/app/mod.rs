//! App - アプリケーション層
//!
//! ports を組み合わせてパイプライン実行を組み立てます。
//!
//! # 主要コンポーネント
//! - **EngineBuilder**: 起動時のワイヤリングと検証
//! - **PipelineEngine**: タスク受付・キュー操作・参照系の API 面
//! - **TickOrchestrator**: claim → ステージ実行 → 遷移 の 1 サイクル
//! - **WorkerGroup**: tick を回し続けるワーカー群
//! - **IdempotencyGuard**: タスク作成の重複排除
//! - **IntegrationRegistry**: ステージ → 連携実装

pub mod admission;
pub mod builder;
pub mod engine;
pub mod registry;
pub mod tick;
pub mod worker_loop;

pub use self::admission::{Admission, IdempotencyGuard};
pub use self::builder::EngineBuilder;
pub use self::engine::{DEFAULT_WORKER_ID, PipelineEngine, TaskAdmission};
pub use self::registry::{IntegrationRegistry, IntegrationRegistryBuilder};
pub use self::tick::{SkipReason, TickOrchestrator, TickOutcome};
pub use self::worker_loop::WorkerGroup;
