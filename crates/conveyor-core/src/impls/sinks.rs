//! Audit / metrics sinks.
//!
//! - `Tracing*`: 構造化ログとして出すだけ（デフォルト）
//! - `Recording*`: メモリに溜める。テストで「何が何回出たか」を確認する用

use std::sync::{Mutex, PoisonError};

use async_trait::async_trait;
use tracing::info;

use crate::domain::{AuditAction, AuditEvent};
use crate::error::ConveyorError;
use crate::ports::{AuditSink, MetricTags, MetricsSink};

/// Logs every audit event at `info` under the `conveyor::audit` target.
#[derive(Debug, Default, Clone, Copy)]
pub struct TracingAuditSink;

#[async_trait]
impl AuditSink for TracingAuditSink {
    async fn record(&self, event: AuditEvent) -> Result<(), ConveyorError> {
        info!(
            target: "conveyor::audit",
            action = %event.action,
            target_type = ?event.target_type,
            target_id = %event.target_id,
            actor_id = event.actor_id.as_deref(),
            metadata = %event.metadata,
            "audit"
        );
        Ok(())
    }
}

#[derive(Debug, Default)]
pub struct RecordingAuditSink {
    events: Mutex<Vec<AuditEvent>>,
}

impl RecordingAuditSink {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn events(&self) -> Vec<AuditEvent> {
        self.events
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    pub fn count(&self, action: AuditAction) -> usize {
        self.events
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .iter()
            .filter(|event| event.action == action)
            .count()
    }
}

#[async_trait]
impl AuditSink for RecordingAuditSink {
    async fn record(&self, event: AuditEvent) -> Result<(), ConveyorError> {
        self.events
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push(event);
        Ok(())
    }
}

#[derive(Debug, Default, Clone, Copy)]
pub struct TracingMetricsSink;

impl MetricsSink for TracingMetricsSink {
    fn emit(&self, name: &'static str, tags: MetricTags) {
        info!(target: "conveyor::metrics", metric = name, tags = ?tags, "increment");
    }
}

/// One emitted metric point.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MetricPoint {
    pub name: &'static str,
    pub tags: MetricTags,
}

impl MetricPoint {
    pub fn tag(&self, key: &str) -> Option<&str> {
        self.tags
            .iter()
            .find(|(k, _)| *k == key)
            .map(|(_, v)| v.as_str())
    }
}

#[derive(Debug, Default)]
pub struct RecordingMetricsSink {
    points: Mutex<Vec<MetricPoint>>,
}

impl RecordingMetricsSink {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn points(&self) -> Vec<MetricPoint> {
        self.points
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    pub fn count(&self, name: &str) -> usize {
        self.points
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .iter()
            .filter(|point| point.name == name)
            .count()
    }
}

impl MetricsSink for RecordingMetricsSink {
    fn emit(&self, name: &'static str, tags: MetricTags) {
        self.points
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push(MetricPoint { name, tags });
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::AuditTarget;
    use chrono::Utc;

    #[tokio::test]
    async fn recording_audit_counts_by_action() {
        let sink = RecordingAuditSink::new();
        for action in [
            AuditAction::TaskCreated,
            AuditAction::JobEnqueued,
            AuditAction::JobEnqueued,
        ] {
            sink.record(AuditEvent::new(
                action,
                AuditTarget::Job,
                "job-x",
                serde_json::json!({}),
                Utc::now(),
            ))
            .await
            .unwrap();
        }

        assert_eq!(sink.count(AuditAction::JobEnqueued), 2);
        assert_eq!(sink.count(AuditAction::TaskCreated), 1);
        assert_eq!(sink.events().len(), 3);
    }

    #[test]
    fn recording_metrics_keeps_tags() {
        let sink = RecordingMetricsSink::new();
        sink.emit("job.dead_letter", vec![("stage", "parse".to_string())]);

        let points = sink.points();
        assert_eq!(sink.count("job.dead_letter"), 1);
        assert_eq!(points[0].tag("stage"), Some("parse"));
        assert_eq!(points[0].tag("kind"), None);
    }
}
