//! IntegrationResult: what a stage integration hands back to the orchestrator.
//!
//! 連携側の失敗は例外ではなく値として返す。オーケストレータはこの値だけを見て
//! PipelineState とキューを動かします。

use serde::{Deserialize, Serialize};

use super::{AdapterCode, ErrorKind, Failure};

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "result", rename_all = "snake_case")]
pub enum IntegrationResult {
    Succeeded {
        #[serde(default)]
        payload: serde_json::Value,
    },
    Failed {
        error_kind: ErrorKind,
        retryable: bool,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        code: Option<AdapterCode>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        message: Option<String>,
    },
}

impl IntegrationResult {
    pub fn success(payload: serde_json::Value) -> Self {
        Self::Succeeded { payload }
    }

    pub fn failure(error_kind: ErrorKind, retryable: bool) -> Self {
        Self::Failed {
            error_kind,
            retryable,
            code: None,
            message: None,
        }
    }

    /// Failure carrying an adapter code.
    pub fn adapter_failure(error_kind: ErrorKind, code: AdapterCode, retryable: bool) -> Self {
        Self::Failed {
            error_kind,
            retryable,
            code: Some(code),
            message: None,
        }
    }

    #[must_use]
    pub fn with_message(mut self, text: impl Into<String>) -> Self {
        if let Self::Failed { message, .. } = &mut self {
            *message = Some(text.into());
        }
        self
    }

    pub fn is_success(&self) -> bool {
        matches!(self, Self::Succeeded { .. })
    }

    /// The classified failure, if this is a failure.
    pub fn failure_info(&self) -> Option<Failure> {
        match self {
            Self::Succeeded { .. } => None,
            Self::Failed {
                error_kind, code, ..
            } => Some(Failure {
                kind: *error_kind,
                code: *code,
            }),
        }
    }
}
