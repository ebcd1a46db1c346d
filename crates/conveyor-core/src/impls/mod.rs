//! Impls - 実装（開発用・テスト用）
//!
//! # 含まれる実装
//! - **InMemoryPipelineStore / InMemoryOutputStore / InMemoryIdempotencyStore**: 単一プロセス用の正本
//! - **Tracing\*Sink / Recording\*Sink**: 監査・メトリクスの出力先
//! - **StaticIntegration / ScriptedIntegration / TimeoutIntegration**: ステージ連携の補助
//!
//! キュー本体の in-memory 実装は `queue::InMemoryJobQueue`。
//! SQL などの本番用実装は別クレートに置く想定です。

pub mod inmem_idempotency;
pub mod inmem_outputs;
pub mod inmem_pipeline;
pub mod integrations;
pub mod sinks;

pub use self::inmem_idempotency::InMemoryIdempotencyStore;
pub use self::inmem_outputs::InMemoryOutputStore;
pub use self::inmem_pipeline::InMemoryPipelineStore;
pub use self::integrations::{ScriptedIntegration, StaticIntegration, TimeoutIntegration};
pub use self::sinks::{
    MetricPoint, RecordingAuditSink, RecordingMetricsSink, TracingAuditSink, TracingMetricsSink,
};
