//! PipelineStage - 固定順序のステージ列
//!
//! `PARSE → PHOTOS → PUBLISH → EXPORT → CLEANUP` の 5 段。分岐はありません。
//! `Ord` は宣言順なので、`BTreeMap<PipelineStage, _>` はそのままステージ順に並びます。

use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

use crate::error::ConveyorError;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PipelineStage {
    Parse,
    Photos,
    Publish,
    Export,
    Cleanup,
}

impl PipelineStage {
    /// All stages in execution order.
    pub const ALL: [PipelineStage; 5] = [
        PipelineStage::Parse,
        PipelineStage::Photos,
        PipelineStage::Publish,
        PipelineStage::Export,
        PipelineStage::Cleanup,
    ];

    pub const FIRST: PipelineStage = PipelineStage::Parse;
    pub const LAST: PipelineStage = PipelineStage::Cleanup;

    /// 次のステージ。`Cleanup` の先は存在しないので `None`。
    pub fn next(self) -> Option<PipelineStage> {
        match self {
            PipelineStage::Parse => Some(PipelineStage::Photos),
            PipelineStage::Photos => Some(PipelineStage::Publish),
            PipelineStage::Publish => Some(PipelineStage::Export),
            PipelineStage::Export => Some(PipelineStage::Cleanup),
            PipelineStage::Cleanup => None,
        }
    }

    pub fn is_last(self) -> bool {
        self == Self::LAST
    }

    /// Position in [`PipelineStage::ALL`].
    pub fn index(self) -> usize {
        self as usize
    }

    pub fn as_str(self) -> &'static str {
        match self {
            PipelineStage::Parse => "parse",
            PipelineStage::Photos => "photos",
            PipelineStage::Publish => "publish",
            PipelineStage::Export => "export",
            PipelineStage::Cleanup => "cleanup",
        }
    }
}

impl fmt::Display for PipelineStage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for PipelineStage {
    type Err = ConveyorError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::ALL
            .into_iter()
            .find(|stage| stage.as_str() == s)
            .ok_or_else(|| ConveyorError::UnknownValue {
                kind: "pipeline_stage",
                value: s.to_string(),
            })
    }
}
