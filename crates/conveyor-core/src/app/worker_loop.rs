//! WorkerGroup - tick を回し続けるワーカー群
//!
//! 各ワーカーは `worker-{i}` という id で [`TickOrchestrator::tick`] を呼び続けます。
//! - `Idle` なら `poll_interval` だけ待つ（shutdown と select で競合させる）
//! - エラーはログに出して同じだけ待つ（ループは止めない）
//!
//! shutdown は「新しい claim をやめる」だけで、実行中のステージは最後まで走らせます。

use std::time::Duration;

use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{debug, error, info};

use super::engine::PipelineEngine;
use super::tick::TickOrchestrator;

/// Worker group handle.
/// - `request_shutdown()` で全ワーカーに停止を伝える
/// - `shutdown_and_join()` で全ワーカーの終了を待てる
pub struct WorkerGroup {
    shutdown_tx: watch::Sender<bool>,
    joins: Vec<JoinHandle<()>>,
}

impl WorkerGroup {
    /// Spawn `n` workers on the current runtime.
    pub fn spawn(n: usize, engine: PipelineEngine, poll_interval: Duration) -> Self {
        let (shutdown_tx, shutdown_rx) = watch::channel(false);

        let joins = (0..n)
            .map(|i| {
                let worker = engine.worker(format!("worker-{i}"));
                let rx = shutdown_rx.clone();
                tokio::spawn(async move { worker_loop(worker, poll_interval, rx).await })
            })
            .collect();

        info!(workers = n, poll_interval_ms = poll_interval.as_millis() as u64, "worker group started");
        Self { shutdown_tx, joins }
    }

    pub fn len(&self) -> usize {
        self.joins.len()
    }

    pub fn is_empty(&self) -> bool {
        self.joins.is_empty()
    }

    pub fn request_shutdown(&self) {
        // receivers may already be gone
        let _ = self.shutdown_tx.send(true);
    }

    pub async fn shutdown_and_join(self) {
        self.request_shutdown();
        for join in self.joins {
            if let Err(e) = join.await {
                error!(error = %e, "worker task ended abnormally");
            }
        }
        info!("worker group stopped");
    }
}

async fn worker_loop(
    worker: TickOrchestrator,
    poll_interval: Duration,
    mut shutdown_rx: watch::Receiver<bool>,
) {
    debug!(worker_id = worker.worker_id(), "worker started");
    loop {
        if *shutdown_rx.borrow() {
            break;
        }

        let idle = match worker.tick().await {
            Ok(outcome) => outcome.is_idle(),
            Err(e) => {
                error!(worker_id = worker.worker_id(), error = %e, "tick failed");
                true
            }
        };
        if !idle {
            continue;
        }

        tokio::select! {
            changed = shutdown_rx.changed() => {
                // sender dropped: nobody can stop us anymore, so stop now
                if changed.is_err() {
                    break;
                }
            }
            _ = tokio::time::sleep(poll_interval) => {}
        }
    }
    debug!(worker_id = worker.worker_id(), "worker stopped");
}
