//! Engine configuration.
//!
//! デフォルト値 → JSON（任意）→ 環境変数の順に上書きします。
//! 適用した上書きは `info!`、読めなかった値は `warn!` を出して無視します。
//!
//! | env | field |
//! |---|---|
//! | `CONVEYOR_MAX_ATTEMPTS` | `max_attempts` |
//! | `CONVEYOR_BACKOFF_SECS` | `backoff_secs`（カンマ区切り） |
//! | `CONVEYOR_FATAL_KINDS` | `fatal_kinds`（カンマ区切り、例: `validation_error,not_found`） |
//! | `CONVEYOR_LEASE_TIMEOUT_SECS` | `lease_timeout_secs` |
//! | `CONVEYOR_POLL_INTERVAL_MS` | `poll_interval_ms` |
//! | `CONVEYOR_WORKERS` | `workers` |

use std::env;
use std::str::FromStr;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tracing::{info, warn};

use crate::domain::ErrorKind;
use crate::error::ConveyorError;
use crate::queue::RetryPolicy;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct EngineConfig {
    pub max_attempts: u32,
    pub backoff_secs: Vec<u64>,
    pub fatal_kinds: Vec<ErrorKind>,
    pub lease_timeout_secs: u64,
    pub poll_interval_ms: u64,
    pub workers: usize,
}

impl Default for EngineConfig {
    fn default() -> Self {
        let policy = RetryPolicy::default();
        Self {
            max_attempts: policy.max_attempts,
            backoff_secs: policy.backoff.iter().map(Duration::as_secs).collect(),
            fatal_kinds: policy.fatal_kinds,
            lease_timeout_secs: 600,
            poll_interval_ms: 1000,
            workers: 2,
        }
    }
}

impl EngineConfig {
    /// Defaults plus environment overrides.
    pub fn from_environment() -> Self {
        Self::default().with_env_overrides()
    }

    pub fn from_json_str(json: &str) -> Result<Self, ConveyorError> {
        serde_json::from_str(json).map_err(|e| ConveyorError::InvalidConfig(e.to_string()))
    }

    pub fn with_env_overrides(self) -> Self {
        self.with_overrides_from(|key| env::var(key).ok())
    }

    /// Apply overrides from an arbitrary lookup (the process env in production).
    pub fn with_overrides_from(mut self, lookup: impl Fn(&str) -> Option<String>) -> Self {
        if let Some(v) = parse_var::<u32>(&lookup, "CONVEYOR_MAX_ATTEMPTS") {
            info!("Max attempts override: {}", v);
            self.max_attempts = v;
        }
        if let Some(v) = parse_list::<u64>(&lookup, "CONVEYOR_BACKOFF_SECS") {
            info!("Backoff table override: {:?}s", v);
            self.backoff_secs = v;
        }
        if let Some(v) = parse_list::<ErrorKind>(&lookup, "CONVEYOR_FATAL_KINDS") {
            info!("Fatal kinds override: {:?}", v);
            self.fatal_kinds = v;
        }
        if let Some(v) = parse_var::<u64>(&lookup, "CONVEYOR_LEASE_TIMEOUT_SECS") {
            info!("Lease timeout override: {}s", v);
            self.lease_timeout_secs = v;
        }
        if let Some(v) = parse_var::<u64>(&lookup, "CONVEYOR_POLL_INTERVAL_MS") {
            info!("Poll interval override: {}ms", v);
            self.poll_interval_ms = v;
        }
        if let Some(v) = parse_var::<usize>(&lookup, "CONVEYOR_WORKERS") {
            info!("Worker count override: {}", v);
            self.workers = v;
        }
        self
    }

    pub fn validate(&self) -> Result<(), ConveyorError> {
        if self.max_attempts == 0 {
            return Err(ConveyorError::InvalidConfig(
                "max_attempts must be at least 1".into(),
            ));
        }
        if self.backoff_secs.is_empty() {
            return Err(ConveyorError::InvalidConfig(
                "backoff_secs must not be empty".into(),
            ));
        }
        if self.lease_timeout_secs == 0 {
            return Err(ConveyorError::InvalidConfig(
                "lease_timeout_secs must be positive".into(),
            ));
        }
        if self.workers == 0 {
            return Err(ConveyorError::InvalidConfig(
                "workers must be at least 1".into(),
            ));
        }
        Ok(())
    }

    pub fn retry_policy(&self) -> RetryPolicy {
        RetryPolicy::default()
            .with_max_attempts(self.max_attempts)
            .with_backoff(
                self.backoff_secs
                    .iter()
                    .copied()
                    .map(Duration::from_secs)
                    .collect(),
            )
            .with_fatal_kinds(self.fatal_kinds.clone())
    }

    pub fn lease_timeout(&self) -> Duration {
        Duration::from_secs(self.lease_timeout_secs)
    }

    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.poll_interval_ms)
    }

    pub fn log_configuration(&self) {
        info!("Engine Configuration:");
        info!("  Max attempts: {}", self.max_attempts);
        info!("  Backoff: {:?}s", self.backoff_secs);
        info!("  Fatal kinds: {:?}", self.fatal_kinds);
        info!("  Lease timeout: {}s", self.lease_timeout_secs);
        info!("  Poll interval: {}ms", self.poll_interval_ms);
        info!("  Workers: {}", self.workers);
    }
}

fn parse_var<T: FromStr>(lookup: &impl Fn(&str) -> Option<String>, key: &str) -> Option<T> {
    let raw = lookup(key)?;
    match raw.trim().parse() {
        Ok(v) => Some(v),
        Err(_) => {
            warn!("Ignoring unparsable {}={:?}", key, raw);
            None
        }
    }
}

fn parse_list<T: FromStr>(lookup: &impl Fn(&str) -> Option<String>, key: &str) -> Option<Vec<T>> {
    let raw = lookup(key)?;
    let parsed: Result<Vec<T>, _> = raw
        .split(',')
        .map(str::trim)
        .filter(|item| !item.is_empty())
        .map(|item| item.parse::<T>())
        .collect();
    match parsed {
        Ok(items) => Some(items),
        Err(_) => {
            warn!("Ignoring unparsable {}={:?}", key, raw);
            None
        }
    }
}
