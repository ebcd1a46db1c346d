//! Domain model (ids, stages, statuses, error taxonomy, pipeline state, events).

pub mod audit;
pub mod errors;
pub mod ids;
pub mod integration;
pub mod pipeline;
pub mod stage;
pub mod status;

pub use audit::{AuditAction, AuditEvent, AuditTarget};
pub use errors::{AdapterCode, ErrorKind, Failure};
pub use ids::{JobId, TaskId};
pub use integration::IntegrationResult;
pub use pipeline::PipelineState;
pub use stage::PipelineStage;
pub use status::JobStatus;
