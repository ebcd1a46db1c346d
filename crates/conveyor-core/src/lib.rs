//! conveyor-core
//!
//! Durable, retrying pipeline engine: PARSE → PHOTOS → PUBLISH → EXPORT → CLEANUP.
//!
//! # モジュール構成
//! - **domain**: ドメインモデル（ids, stage, status, errors, pipeline, audit, integration）
//! - **queue**: JobQueue trait、retry policy、DLQ、in-memory 実装
//! - **ports**: 抽象化レイヤー（Clock, IdGenerator, StageIntegration, ストア, sink）
//! - **impls**: ports の in-memory / tracing 実装
//! - **app**: builder, engine, tick, worker group
//! - **config**: `EngineConfig`（デフォルト + 環境変数）
//! - **observability**: キュー集計とメトリクス名

pub mod app;
pub mod config;
pub mod domain;
pub mod error;
pub mod impls;
pub mod observability;
pub mod ports;
pub mod queue;

pub use app::{EngineBuilder, PipelineEngine, TickOutcome, WorkerGroup};
pub use config::EngineConfig;
pub use error::ConveyorError;
