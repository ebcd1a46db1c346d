//! Ports - 抽象化レイヤー
//!
//! Hexagonal Architecture の「ポート」。ストレージや外部サービスへの
//! インターフェースだけを定義し、実装は `impls`（in-memory）か別クレートに置きます。
//!
//! すべてのポートは起動時に一度だけ組み立てて、`app::EngineBuilder` から
//! 明示的に渡します（グローバルな singleton は持たない）。

pub mod audit;
pub mod clock;
pub mod id_generator;
pub mod idempotency;
pub mod integration;
pub mod metrics;
pub mod output;
pub mod pipeline_store;

pub use self::audit::AuditSink;
pub use self::clock::{Clock, FixedClock, SystemClock};
pub use self::id_generator::{IdGenerator, UlidGenerator};
pub use self::idempotency::{IdempotencyStore, KeyInsert};
pub use self::integration::StageIntegration;
pub use self::metrics::{MetricTags, MetricsSink};
pub use self::output::{StageOutput, TaskOutputStore, TaskOutputs};
pub use self::pipeline_store::PipelineStateStore;
