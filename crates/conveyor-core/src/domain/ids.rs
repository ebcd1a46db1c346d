//! Domain identifiers (strongly-typed IDs).
//!
//! ULID ベースの ID を Phantom type で型付けしています。
//! `TaskId` と `JobId` は同じ表現 (128-bit ULID) ですが、コンパイル時に混同できません。
//!
//! - 時刻でソート可能なので、同じ時刻の生成でも順序がほぼ保たれる
//! - 一度発行した ID は再利用しない（ストレージ側でも一意）
//! - Display は `task-01H...` / `job-01H...` のようにプレフィックス付き

use serde::{Deserialize, Serialize};
use std::fmt;
use std::marker::PhantomData;
use std::str::FromStr;
use ulid::Ulid;

use crate::error::ConveyorError;

/// 各 ID 型のマーカー trait。
pub trait IdMarker: Send + Sync + 'static {
    /// Display で使うプレフィックス（例: "job-", "task-"）
    fn prefix() -> &'static str;

    /// エラーメッセージ用の名前
    fn kind() -> &'static str;
}

/// ジェネリック ID 型
///
/// シリアライズ時はプレフィックスなしの ULID 文字列になります。
#[repr(transparent)]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Id<T: IdMarker> {
    ulid: Ulid,
    #[serde(skip)]
    _marker: PhantomData<T>,
}

impl<T: IdMarker> Id<T> {
    pub fn from_ulid(ulid: Ulid) -> Self {
        Self {
            ulid,
            _marker: PhantomData,
        }
    }

    pub fn as_ulid(&self) -> Ulid {
        self.ulid
    }
}

impl<T: IdMarker> From<Ulid> for Id<T> {
    fn from(ulid: Ulid) -> Self {
        Self::from_ulid(ulid)
    }
}

impl<T: IdMarker> fmt::Display for Id<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}{}", T::prefix(), self.ulid)
    }
}

/// `task-01H...` でも `01H...` でも受け付ける。
/// 別の種類のプレフィックス（`job-` を TaskId として読むなど）は拒否する。
impl<T: IdMarker> FromStr for Id<T> {
    type Err = ConveyorError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let raw = s.strip_prefix(T::prefix()).unwrap_or(s);
        Ulid::from_string(raw)
            .map(Self::from_ulid)
            .map_err(|_| ConveyorError::UnknownValue {
                kind: T::kind(),
                value: s.to_string(),
            })
    }
}

/// Job のマーカー型
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum Job {}

impl IdMarker for Job {
    fn prefix() -> &'static str {
        "job-"
    }

    fn kind() -> &'static str {
        "job_id"
    }
}

/// Task のマーカー型
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum Task {}

impl IdMarker for Task {
    fn prefix() -> &'static str {
        "task-"
    }

    fn kind() -> &'static str {
        "task_id"
    }
}

/// Identifier of a queue job (one claimable unit of work for a task's stage).
pub type JobId = Id<Job>;

/// Identifier of a task (end-to-end unit progressing through all stages).
pub type TaskId = Id<Task>;
