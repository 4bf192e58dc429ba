//! Errors - エラー型と分類
//!
//! ledger 操作・claim・レプリケーションのエラーを 1 つの enum にまとめ、
//! ループ側は `ErrorKind` を見て「ローカルで再試行 / 表に出す / 停止」を判断します。

use std::path::PathBuf;

use thiserror::Error;

use super::ids::{NodeId, TaskId};
use super::stage::Stage;

/// ErrorKind は実行エラーの運用分類
///
/// - Transient: 一時的なエラー（バックオフ付きでリトライ）
/// - Permanent: 恒久的なエラー（リトライ無意味、呼び出し側に返す）
/// - Infrastructure: レプリケーション層の競合（pull してから再試行）
/// - Fatal: ローカル ledger が信用できない（タスクループ停止、heartbeat は継続）
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    Transient,
    Permanent,
    Infrastructure,
    Fatal,
}

#[derive(Debug, Error)]
pub enum LedgerError {
    #[error("stale revision for {task}: expected {expected}, found {actual}")]
    StaleRevision {
        task: TaskId,
        expected: u64,
        actual: u64,
    },

    #[error("claim on {task} was lost to {}", .winner.as_ref().map(|n| n.as_str()).unwrap_or("a reclaim"))]
    ClaimLost { task: TaskId, winner: Option<NodeId> },

    #[error("{task} is already claimed by {owner}")]
    AlreadyClaimed { task: TaskId, owner: NodeId },

    #[error("{task} is not claimable in stage {stage}")]
    NotClaimable { task: TaskId, stage: Stage },

    #[error("node {node} already works on {active}")]
    NodeBusy { node: NodeId, active: TaskId },

    #[error("invalid transition for {task}: {from} -> {to}")]
    InvalidTransition { task: TaskId, from: Stage, to: Stage },

    #[error("{task} already holds a different artifact for stage {stage}")]
    ArtifactConflict { task: TaskId, stage: Stage },

    #[error("{task} is not owned by {node}")]
    NotOwner { task: TaskId, node: NodeId },

    #[error("claim on {task} is not confirmed by replication yet")]
    ClaimUnconfirmed { task: TaskId },

    #[error("{task} was cancelled")]
    Cancelled { task: TaskId },

    #[error("task not found: {0}")]
    TaskNotFound(TaskId),

    #[error("node not found: {0}")]
    NodeNotFound(NodeId),

    #[error("resource gate closed: {reason}")]
    ResourceGated { reason: String },

    #[error("merge conflict: {0}")]
    MergeConflict(String),

    #[error("push rejected (non fast-forward): {0}")]
    RejectedNonFastForward(String),

    #[error("network unavailable: {0}")]
    NetworkUnavailable(String),

    #[error("corrupt ledger {}: {reason}", .path.display())]
    CorruptLedger { path: PathBuf, reason: String },

    #[error("ledger not initialized at {}", .0.display())]
    NotInitialized(PathBuf),

    #[error("write conflict: on-disk revision {on_disk} is not older than {ours}")]
    WriteConflict { on_disk: u64, ours: u64 },

    #[error("timed out waiting for ledger lock {}", .0.display())]
    LockTimeout(PathBuf),

    #[error("replication failed: {0}")]
    Replication(String),

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    #[error("serialization error: {0}")]
    Serde(#[from] serde_json::Error),
}

impl LedgerError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            LedgerError::StaleRevision { .. }
            | LedgerError::NetworkUnavailable(_)
            | LedgerError::LockTimeout(_)
            | LedgerError::ResourceGated { .. }
            | LedgerError::Io(_) => ErrorKind::Transient,
            LedgerError::MergeConflict(_)
            | LedgerError::RejectedNonFastForward(_)
            | LedgerError::WriteConflict { .. }
            | LedgerError::Replication(_) => ErrorKind::Infrastructure,
            LedgerError::CorruptLedger { .. } | LedgerError::NotInitialized(_) => {
                ErrorKind::Fatal
            }
            _ => ErrorKind::Permanent,
        }
    }

    /// Replication-layer errors that a fresh pull may resolve.
    pub fn needs_pull(&self) -> bool {
        matches!(
            self,
            LedgerError::MergeConflict(_) | LedgerError::RejectedNonFastForward(_)
        )
    }

    pub fn corrupt(path: impl Into<PathBuf>, reason: impl Into<String>) -> Self {
        LedgerError::CorruptLedger {
            path: path.into(),
            reason: reason.into(),
        }
    }
}
