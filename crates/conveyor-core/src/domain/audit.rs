//! Audit events emitted by the engine.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Closed set of audit actions.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum AuditAction {
    #[serde(rename = "task.created")]
    TaskCreated,
    #[serde(rename = "task.create.idempotency_hit")]
    TaskIdempotencyHit,
    #[serde(rename = "job.enqueued")]
    JobEnqueued,
    #[serde(rename = "job.claimed")]
    JobClaimed,
    #[serde(rename = "job.succeeded")]
    JobSucceeded,
    #[serde(rename = "pipeline.stage.succeeded")]
    StageSucceeded,
    #[serde(rename = "job.retry_scheduled")]
    JobRetryScheduled,
    #[serde(rename = "job.dead_letter")]
    JobDeadLetter,
}

impl AuditAction {
    pub fn as_str(self) -> &'static str {
        match self {
            AuditAction::TaskCreated => "task.created",
            AuditAction::TaskIdempotencyHit => "task.create.idempotency_hit",
            AuditAction::JobEnqueued => "job.enqueued",
            AuditAction::JobClaimed => "job.claimed",
            AuditAction::JobSucceeded => "job.succeeded",
            AuditAction::StageSucceeded => "pipeline.stage.succeeded",
            AuditAction::JobRetryScheduled => "job.retry_scheduled",
            AuditAction::JobDeadLetter => "job.dead_letter",
        }
    }
}

impl std::fmt::Display for AuditAction {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// What the event is about.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AuditTarget {
    Task,
    Job,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AuditEvent {
    pub action: AuditAction,
    pub target_type: AuditTarget,
    pub target_id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub actor_id: Option<String>,
    pub metadata: serde_json::Value,
    pub timestamp: DateTime<Utc>,
}

impl AuditEvent {
    pub fn new(
        action: AuditAction,
        target_type: AuditTarget,
        target_id: impl ToString,
        metadata: serde_json::Value,
        timestamp: DateTime<Utc>,
    ) -> Self {
        Self {
            action,
            target_type,
            target_id: target_id.to_string(),
            actor_id: None,
            metadata,
            timestamp,
        }
    }

    #[must_use]
    pub fn with_actor(mut self, actor_id: impl Into<String>) -> Self {
        self.actor_id = Some(actor_id.into());
        self
    }
}
