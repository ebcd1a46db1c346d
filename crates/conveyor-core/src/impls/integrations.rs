//! Stage integration helpers.
//!
//! 実際の parser / publisher などへのアダプタはこのクレートの外に置きます。
//! ここにあるのは配線確認・デモ・テスト用の小さな実装と、タイムアウトのラッパーだけ。

use std::collections::VecDeque;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::{Mutex, PoisonError};
use std::time::Duration;

use async_trait::async_trait;
use tracing::warn;

use crate::domain::{AdapterCode, ErrorKind, IntegrationResult, PipelineStage, TaskId};
use crate::ports::StageIntegration;

/// Always succeeds with `{ "stage": ..., "task_id": ... }` merged into a fixed payload.
pub struct StaticIntegration {
    stage: PipelineStage,
    extra: serde_json::Value,
}

impl StaticIntegration {
    pub fn new(stage: PipelineStage) -> Self {
        Self {
            stage,
            extra: serde_json::Value::Null,
        }
    }

    #[must_use]
    pub fn with_payload(mut self, extra: serde_json::Value) -> Self {
        self.extra = extra;
        self
    }
}

#[async_trait]
impl StageIntegration for StaticIntegration {
    fn name(&self) -> &str {
        self.stage.as_str()
    }

    async fn run(&self, task_id: TaskId) -> IntegrationResult {
        IntegrationResult::success(serde_json::json!({
            "stage": self.stage,
            "task_id": task_id.to_string(),
            "data": self.extra,
        }))
    }
}

/// Plays back queued results in order, then keeps returning `fallback`.
pub struct ScriptedIntegration {
    script: Mutex<VecDeque<IntegrationResult>>,
    fallback: IntegrationResult,
    calls: AtomicU32,
}

impl ScriptedIntegration {
    pub fn new(fallback: IntegrationResult) -> Self {
        Self {
            script: Mutex::new(VecDeque::new()),
            fallback,
            calls: AtomicU32::new(0),
        }
    }

    /// Fails `n` times with a retryable `integration_unavailable`, then succeeds.
    pub fn flaky(n: u32) -> Self {
        let failures = (0..n).map(|_| {
            IntegrationResult::adapter_failure(
                ErrorKind::IntegrationUnavailable,
                AdapterCode::NetworkError,
                true,
            )
        });
        Self::new(IntegrationResult::success(serde_json::json!({ "flaky": n })))
            .then_all(failures)
    }

    #[must_use]
    pub fn then(self, result: IntegrationResult) -> Self {
        self.script
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push_back(result);
        self
    }

    #[must_use]
    pub fn then_all(self, results: impl IntoIterator<Item = IntegrationResult>) -> Self {
        results.into_iter().fold(self, Self::then)
    }

    pub fn calls(&self) -> u32 {
        self.calls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl StageIntegration for ScriptedIntegration {
    fn name(&self) -> &str {
        "scripted"
    }

    async fn run(&self, _task_id: TaskId) -> IntegrationResult {
        self.calls.fetch_add(1, Ordering::SeqCst);
        self.script
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .pop_front()
            .unwrap_or_else(|| self.fallback.clone())
    }
}

/// Bounds a single stage invocation.
///
/// 時間切れは `integration_unavailable` + `timeout`（retryable）として返す。
pub struct TimeoutIntegration<I> {
    inner: I,
    timeout: Duration,
}

impl<I: StageIntegration> TimeoutIntegration<I> {
    pub fn new(inner: I, timeout: Duration) -> Self {
        Self { inner, timeout }
    }
}

#[async_trait]
impl<I: StageIntegration> StageIntegration for TimeoutIntegration<I> {
    fn name(&self) -> &str {
        self.inner.name()
    }

    async fn run(&self, task_id: TaskId) -> IntegrationResult {
        match tokio::time::timeout(self.timeout, self.inner.run(task_id)).await {
            Ok(result) => result,
            Err(_) => {
                warn!(
                    integration = self.inner.name(),
                    %task_id,
                    timeout_ms = self.timeout.as_millis() as u64,
                    "stage integration timed out"
                );
                IntegrationResult::adapter_failure(
                    ErrorKind::IntegrationUnavailable,
                    AdapterCode::Timeout,
                    true,
                )
                .with_message(format!("timed out after {:?}", self.timeout))
            }
        }
    }
}
