//! Metrics port.
//!
//! 名前は `observability::metrics` の定数を使う。

/// Tag list attached to a metric point.
pub type MetricTags = Vec<(&'static str, String)>;

pub trait MetricsSink: Send + Sync {
    /// Increment counter `name` by one.
    fn emit(&self, name: &'static str, tags: MetricTags);
}
