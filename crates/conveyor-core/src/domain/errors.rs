//! Errors - 失敗の分類
//!
//! - [`ErrorKind`]: ビジネス上の失敗分類（閉じた集合）
//! - [`AdapterCode`]: 外部連携アダプタの転送レベルのコード
//! - [`Failure`]: 上の二つをまとめたもの。RetryPolicy はこれを見て retry/fatal を決める
//!
//! インフラ障害（ストレージが落ちている等）はここには含めず、
//! `crate::error::ConveyorError` 側で扱います。

use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

use crate::error::ConveyorError;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorKind {
    ValidationError,
    SecurityDenied,
    NotFound,
    InternalError,
    IntegrationUnavailable,
    RateLimited,
}

impl ErrorKind {
    pub const ALL: [ErrorKind; 6] = [
        ErrorKind::ValidationError,
        ErrorKind::SecurityDenied,
        ErrorKind::NotFound,
        ErrorKind::InternalError,
        ErrorKind::IntegrationUnavailable,
        ErrorKind::RateLimited,
    ];

    pub fn as_str(self) -> &'static str {
        match self {
            ErrorKind::ValidationError => "validation_error",
            ErrorKind::SecurityDenied => "security_denied",
            ErrorKind::NotFound => "not_found",
            ErrorKind::InternalError => "internal_error",
            ErrorKind::IntegrationUnavailable => "integration_unavailable",
            ErrorKind::RateLimited => "rate_limited",
        }
    }
}

impl fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for ErrorKind {
    type Err = ConveyorError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::ALL
            .into_iter()
            .find(|kind| kind.as_str() == s)
            .ok_or_else(|| ConveyorError::UnknownValue {
                kind: "error_kind",
                value: s.to_string(),
            })
    }
}

/// Transport-level code reported by an integration adapter.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AdapterCode {
    Timeout,
    NetworkError,
    #[serde(rename = "http_5xx")]
    Http5xx,
    /// 相手のスキーマ/契約が想定と違う。何度やっても直らないので常に fatal。
    ContractMismatch,
}

impl AdapterCode {
    pub fn is_always_fatal(self) -> bool {
        matches!(self, AdapterCode::ContractMismatch)
    }

    pub fn as_str(self) -> &'static str {
        match self {
            AdapterCode::Timeout => "timeout",
            AdapterCode::NetworkError => "network_error",
            AdapterCode::Http5xx => "http_5xx",
            AdapterCode::ContractMismatch => "contract_mismatch",
        }
    }
}

impl fmt::Display for AdapterCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A classified failure: business kind plus optional adapter code.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Failure {
    pub kind: ErrorKind,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub code: Option<AdapterCode>,
}

impl Failure {
    pub fn new(kind: ErrorKind) -> Self {
        Self { kind, code: None }
    }

    pub fn with_code(mut self, code: AdapterCode) -> Self {
        self.code = Some(code);
        self
    }
}

impl From<ErrorKind> for Failure {
    fn from(kind: ErrorKind) -> Self {
        Self::new(kind)
    }
}

impl fmt::Display for Failure {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.code {
            Some(code) => write!(f, "{}({})", self.kind, code),
            None => write!(f, "{}", self.kind),
        }
    }
}
