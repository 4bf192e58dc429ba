//! Replicator port - ledger の pull / push
//!
//! 実際の同期手段（git, クラウドフォルダ, Syncthing 等の peer sync）は外部にあり、
//! アダプタはそれを `pull` / `push` の 2 操作に翻訳します。
//!
//! # 設計原則
//! - マージは常にアプリケーション層（`Ledger::merge`）で行う。
//!   ストレージ層の「最後に書いた方が勝ち」は信用しない。
//! - pull は取得したリモートの ledger を `LedgerStore::merge_remote` に渡すだけ。
//! - push はローカルの ledger をそのまま公開する。リモートが先に進んでいれば
//!   `RejectedNonFastForward` を返し、呼び出し側が pull してから再試行する。

use async_trait::async_trait;

use crate::domain::LedgerError;
use crate::store::LedgerStore;

/// Result of a pull.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct PullReport {
    /// Revision of the remote copy, if one exists yet.
    pub remote_revision: Option<u64>,
    /// Local revision after the merge.
    pub local_revision: u64,
    /// Whether the merge changed the local ledger.
    pub changed: bool,
}

/// Result of a push.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct PushReport {
    pub revision: u64,
    /// False when the remote already had this revision.
    pub published: bool,
}

#[async_trait]
pub trait Replicator: Send + Sync {
    /// Short name for logs ("git", "cloud", ...).
    fn kind(&self) -> &'static str;

    /// Merge the remote copy into the local store.
    ///
    /// Fails with `NetworkUnavailable` or `MergeConflict`.
    async fn pull(&self, store: &LedgerStore) -> Result<PullReport, LedgerError>;

    /// Publish the local ledger.
    ///
    /// Fails with `NetworkUnavailable` or `RejectedNonFastForward`.
    async fn push(&self, store: &LedgerStore) -> Result<PushReport, LedgerError>;
}
