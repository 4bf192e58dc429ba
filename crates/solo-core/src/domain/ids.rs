//! Domain identifiers (strongly-typed IDs).
//!
//! # 文字列ベースの ID + Phantom type
//! Task と Node の ID はどちらも人間が読める文字列です（ledger ファイルに直接書かれるため）。
//! `Id<T>` というジェネリック型で共通実装を提供しつつ、マーカー型 `T` で
//! TaskId と NodeId を混同できないようにしています。
//!
//! - **TaskId**: 元 issue の identity から導出（例: `github-rust-lang-rust-1234`）
//! - **NodeId**: ハードウェア fingerprint から導出（例: `node-3fa94c01b2de`）

use serde::{Deserialize, Serialize};
use std::fmt;
use std::marker::PhantomData;

/// IdMarker は各 ID 型のマーカー trait
pub trait IdMarker: Send + Sync + 'static {
    /// エラーメッセージやログで使う種別名（例: "task", "node"）
    fn kind() -> &'static str;
}

/// ジェネリック ID 型
///
/// `T` は PhantomData で、シリアライズ時は中身の文字列だけが出力されます。
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Id<T: IdMarker> {
    value: String,
    #[serde(skip)]
    _marker: PhantomData<T>,
}

impl<T: IdMarker> Id<T> {
    pub fn new(value: impl Into<String>) -> Self {
        Self {
            value: value.into(),
            _marker: PhantomData,
        }
    }

    /// CLI など外部入力から ID を作る（空文字と空白を含む値は拒否）
    pub fn parse(value: &str) -> Result<Self, InvalidId> {
        let trimmed = value.trim();
        if trimmed.is_empty() || trimmed.chars().any(char::is_whitespace) {
            return Err(InvalidId {
                kind: T::kind(),
                value: value.to_string(),
            });
        }
        Ok(Self::new(trimmed))
    }

    pub fn as_str(&self) -> &str {
        &self.value
    }

    pub fn is_valid(&self) -> bool {
        !self.value.is_empty() && !self.value.chars().any(char::is_whitespace)
    }
}

impl<T: IdMarker> fmt::Display for Id<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.value)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("invalid {kind} id: {value:?}")]
pub struct InvalidId {
    pub kind: &'static str,
    pub value: String,
}

// ========================================
// マーカー型の定義
// ========================================

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum TaskKind {}

impl IdMarker for TaskKind {
    fn kind() -> &'static str {
        "task"
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum NodeKind {}

impl IdMarker for NodeKind {
    fn kind() -> &'static str {
        "node"
    }
}

/// Identifier of a Task (stable, derived from the source issue).
pub type TaskId = Id<TaskKind>;

/// Identifier of a Node (derived from a hardware fingerprint).
pub type NodeId = Id<NodeKind>;

impl TaskId {
    /// Derive a stable id from the origin system and its locator.
    ///
    /// `("github", "rust-lang/rust#1234")` -> `github-rust-lang-rust-1234`
    pub fn from_source(system: &str, locator: &str) -> Self {
        let mut slug = String::with_capacity(system.len() + locator.len() + 1);
        let mut last_dash = true;
        for c in system.chars().chain(std::iter::once('-')).chain(locator.chars()) {
            if c.is_ascii_alphanumeric() {
                slug.push(c.to_ascii_lowercase());
                last_dash = false;
            } else if !last_dash {
                slug.push('-');
                last_dash = true;
            }
        }
        while slug.ends_with('-') {
            slug.pop();
        }
        Self::new(slug)
    }
}
