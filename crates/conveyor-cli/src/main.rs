use async_trait::async_trait;
use serde::Serialize;
use std::sync::Arc;
use std::sync::atomic::{AtomicU32, Ordering};
use tokio::time::{Duration, sleep};
use tracing::{error, info};
use tracing_subscriber::EnvFilter;

use conveyor_core::domain::{
    AdapterCode, ErrorKind, IntegrationResult, PipelineStage, PipelineState, TaskId,
};
use conveyor_core::impls::{StaticIntegration, TimeoutIntegration};
use conveyor_core::observability::QueueCounts;
use conveyor_core::ports::{StageIntegration, TaskOutputs};
use conveyor_core::queue::DeadLetterRecord;
use conveyor_core::{ConveyorError, EngineBuilder, EngineConfig, PipelineEngine, WorkerGroup};

/// 最初の n 回は写真サーバーが落ちている想定
struct FlakyPhotos {
    remaining_failures: AtomicU32,
}

impl FlakyPhotos {
    fn new(n: u32) -> Self {
        Self {
            remaining_failures: AtomicU32::new(n),
        }
    }
}

#[async_trait]
impl StageIntegration for FlakyPhotos {
    fn name(&self) -> &str {
        "flaky-photos"
    }

    async fn run(&self, task_id: TaskId) -> IntegrationResult {
        let left = self.remaining_failures.load(Ordering::Relaxed);
        if left > 0 {
            self.remaining_failures.fetch_sub(1, Ordering::Relaxed);
            return IntegrationResult::adapter_failure(
                ErrorKind::IntegrationUnavailable,
                AdapterCode::Http5xx,
                true,
            )
            .with_message(format!("photo service returned 503 (left={left})"));
        }
        IntegrationResult::success(serde_json::json!({
            "task_id": task_id.to_string(),
            "photos": ["front.jpg", "side.jpg"],
        }))
    }
}

#[derive(Serialize)]
struct TaskReport {
    state: PipelineState,
    outputs: TaskOutputs,
}

#[derive(Serialize)]
struct RunReport {
    tasks: Vec<TaskReport>,
    counts: QueueCounts,
    dead_letters: Vec<DeadLetterRecord>,
}

fn build_engine(config: EngineConfig) -> Result<PipelineEngine, ConveyorError> {
    let stage_timeout = Duration::from_secs(5);
    EngineBuilder::new(config)
        .register(PipelineStage::Parse, StaticIntegration::new(PipelineStage::Parse))?
        .register(
            PipelineStage::Photos,
            TimeoutIntegration::new(FlakyPhotos::new(2), stage_timeout),
        )?
        .register(
            PipelineStage::Publish,
            StaticIntegration::new(PipelineStage::Publish)
                .with_payload(serde_json::json!({ "channel": "web" })),
        )?
        .register(PipelineStage::Export, StaticIntegration::new(PipelineStage::Export))?
        .register(PipelineStage::Cleanup, StaticIntegration::new(PipelineStage::Cleanup))?
        .build()
}

async fn wait_until_drained(engine: &PipelineEngine) -> Result<(), ConveyorError> {
    loop {
        if engine.queue_counts().await?.in_flight() == 0 {
            return Ok(());
        }
        sleep(Duration::from_millis(50)).await;
    }
}

async fn run() -> Result<(), ConveyorError> {
    // デモなので backoff は短め（環境変数で上書き可）
    let config = EngineConfig {
        backoff_secs: vec![1, 2, 4],
        poll_interval_ms: 50,
        ..EngineConfig::default()
    }
    .with_env_overrides();
    config.validate()?;
    config.log_configuration();

    let workers = config.workers;
    let poll_interval = config.poll_interval();
    let engine = build_engine(config)?;

    let mut task_ids = Vec::new();
    for key in ["listing-1001", "listing-1002", "listing-1001"] {
        let admission = engine.submit_task("demo-actor", key).await?;
        info!(key, task_id = %admission.task_id, created = admission.created, "submitted");
        if admission.created {
            task_ids.push(admission.task_id);
        }
    }

    let group = WorkerGroup::spawn(workers, engine.clone(), poll_interval);
    tokio::select! {
        drained = wait_until_drained(&engine) => drained?,
        _ = tokio::signal::ctrl_c() => info!("interrupted, stopping workers"),
    }
    group.shutdown_and_join().await;

    let mut tasks = Vec::with_capacity(task_ids.len());
    for task_id in task_ids {
        tasks.push(TaskReport {
            state: engine.task_status(task_id).await?,
            outputs: engine.task_outputs(task_id).await?,
        });
    }
    let report = RunReport {
        tasks,
        counts: engine.queue_counts().await?,
        dead_letters: engine.dead_letters(100, 0).await?,
    };
    match serde_json::to_string_pretty(&report) {
        Ok(json) => println!("{json}"),
        Err(e) => error!(error = %e, "failed to render report"),
    }
    Ok(())
}

#[tokio::main]
async fn main() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .try_init();

    if let Err(e) = run().await {
        error!(error = %e, "conveyor demo failed");
        std::process::exit(1);
    }
}
