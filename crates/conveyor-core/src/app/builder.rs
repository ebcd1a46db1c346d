//! EngineBuilder - エンジンの構築とワイヤリング
//!
//! # 起動時検証（Fail-fast）
//! - `EngineConfig::validate` が通らなければ `InvalidConfig`
//! - 同じステージへの二重登録は `register` の時点で `DuplicateIntegration`
//! - 全ステージに連携が揃っていなければ `build()` が `MissingIntegrations`
//!
//! 差し替えなかったポートは in-memory 実装 / `SystemClock` / `Tracing*Sink` になります。
//!
//! ```ignore
//! let engine = EngineBuilder::new(EngineConfig::from_environment())
//!     .register(PipelineStage::Parse, ParseClient::new(..))?
//!     // ... 残りのステージ
//!     .build()?;
//! ```

use std::sync::Arc;

use tracing::debug;

use super::admission::IdempotencyGuard;
use super::engine::PipelineEngine;
use super::registry::{IntegrationRegistry, IntegrationRegistryBuilder};
use crate::config::EngineConfig;
use crate::domain::PipelineStage;
use crate::error::ConveyorError;
use crate::impls::{
    InMemoryIdempotencyStore, InMemoryOutputStore, InMemoryPipelineStore, TracingAuditSink,
    TracingMetricsSink,
};
use crate::ports::{
    AuditSink, Clock, IdGenerator, IdempotencyStore, MetricsSink, PipelineStateStore,
    StageIntegration, SystemClock, TaskOutputStore, UlidGenerator,
};
use crate::queue::{InMemoryJobQueue, JobQueue};

pub struct EngineBuilder {
    config: EngineConfig,
    integrations: IntegrationRegistryBuilder,
    clock: Option<Arc<dyn Clock>>,
    ids: Option<Arc<dyn IdGenerator>>,
    queue: Option<Arc<dyn JobQueue>>,
    pipelines: Option<Arc<dyn PipelineStateStore>>,
    outputs: Option<Arc<dyn TaskOutputStore>>,
    idempotency: Option<Arc<dyn IdempotencyStore>>,
    audit: Option<Arc<dyn AuditSink>>,
    metrics: Option<Arc<dyn MetricsSink>>,
}

impl EngineBuilder {
    pub fn new(config: EngineConfig) -> Self {
        Self {
            config,
            integrations: IntegrationRegistry::builder(),
            clock: None,
            ids: None,
            queue: None,
            pipelines: None,
            outputs: None,
            idempotency: None,
            audit: None,
            metrics: None,
        }
    }

    /// Bind `stage` to `integration`.
    pub fn register<I: StageIntegration + 'static>(
        self,
        stage: PipelineStage,
        integration: I,
    ) -> Result<Self, ConveyorError> {
        self.register_arc(stage, Arc::new(integration))
    }

    pub fn register_arc(
        mut self,
        stage: PipelineStage,
        integration: Arc<dyn StageIntegration>,
    ) -> Result<Self, ConveyorError> {
        debug!(%stage, integration = integration.name(), "registering stage integration");
        self.integrations.register(stage, integration)?;
        Ok(self)
    }

    #[must_use]
    pub fn with_clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = Some(clock);
        self
    }

    #[must_use]
    pub fn with_id_generator(mut self, ids: Arc<dyn IdGenerator>) -> Self {
        self.ids = Some(ids);
        self
    }

    /// Replaces the queue. `retry_policy` / `lease_timeout` from the config are then unused.
    #[must_use]
    pub fn with_queue(mut self, queue: Arc<dyn JobQueue>) -> Self {
        self.queue = Some(queue);
        self
    }

    #[must_use]
    pub fn with_pipeline_store(mut self, store: Arc<dyn PipelineStateStore>) -> Self {
        self.pipelines = Some(store);
        self
    }

    #[must_use]
    pub fn with_output_store(mut self, store: Arc<dyn TaskOutputStore>) -> Self {
        self.outputs = Some(store);
        self
    }

    #[must_use]
    pub fn with_idempotency_store(mut self, store: Arc<dyn IdempotencyStore>) -> Self {
        self.idempotency = Some(store);
        self
    }

    #[must_use]
    pub fn with_audit_sink(mut self, sink: Arc<dyn AuditSink>) -> Self {
        self.audit = Some(sink);
        self
    }

    #[must_use]
    pub fn with_metrics_sink(mut self, sink: Arc<dyn MetricsSink>) -> Self {
        self.metrics = Some(sink);
        self
    }

    pub fn build(self) -> Result<PipelineEngine, ConveyorError> {
        self.config.validate()?;
        let integrations = self.integrations.build()?;

        let clock = self.clock.unwrap_or_else(|| Arc::new(SystemClock));
        let ids = self
            .ids
            .unwrap_or_else(|| Arc::new(UlidGenerator::new(Arc::clone(&clock))));
        let queue = match self.queue {
            Some(queue) => queue,
            None => Arc::new(InMemoryJobQueue::new(
                self.config.retry_policy(),
                self.config.lease_timeout(),
                Arc::clone(&clock),
                Arc::clone(&ids),
            )),
        };
        let outputs = match self.outputs {
            Some(outputs) => outputs,
            None => Arc::new(InMemoryOutputStore::new(Arc::clone(&clock))),
        };
        let idempotency = self
            .idempotency
            .unwrap_or_else(|| Arc::new(InMemoryIdempotencyStore::new()));

        Ok(PipelineEngine {
            queue,
            pipelines: self
                .pipelines
                .unwrap_or_else(|| Arc::new(InMemoryPipelineStore::new())),
            outputs,
            audit: self.audit.unwrap_or_else(|| Arc::new(TracingAuditSink)),
            metrics: self.metrics.unwrap_or_else(|| Arc::new(TracingMetricsSink)),
            integrations: Arc::new(integrations),
            guard: IdempotencyGuard::new(idempotency),
            ids,
            clock,
        })
    }
}
