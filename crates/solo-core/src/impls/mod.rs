//! Impls - ports の実装
//!
//! # 含まれる実装
//! - **GitReplicator / CloudReplicator / PeerReplicator**: 本番用の同期アダプタ
//! - **MemoryReplicator**: テスト・デモ用（プロセス内の共有リモート）
//! - **NoReplication**: 同期なし（単独ノード）
//! - **PriorityScheduler / HeuristicScorer**: スケジューリング方針
//! - **SystemMeter / StaticMeter**: ホストの計測

pub mod cloud;
pub mod command;
pub mod git;
pub mod memory;
pub mod meter;
pub mod peer;
pub mod scheduler;

use async_trait::async_trait;

use crate::domain::LedgerError;
use crate::ports::{PullReport, PushReport, Replicator};
use crate::store::LedgerStore;

pub use self::cloud::{CloudReplicator, RemoteFolder};
pub use self::git::GitReplicator;
pub use self::memory::{MemoryReplicator, SharedRemote};
pub use self::meter::{StaticMeter, SystemMeter};
pub use self::peer::PeerReplicator;
pub use self::scheduler::{HeuristicScorer, IssueFacts, PriorityScheduler};

/// Single-node mode: pull and push only report the local revision.
#[derive(Debug, Clone, Copy, Default)]
pub struct NoReplication;

#[async_trait]
impl Replicator for NoReplication {
    fn kind(&self) -> &'static str {
        "none"
    }

    async fn pull(&self, store: &LedgerStore) -> Result<PullReport, LedgerError> {
        let local = store.load().await?;
        Ok(PullReport {
            remote_revision: None,
            local_revision: local.revision,
            changed: false,
        })
    }

    async fn push(&self, store: &LedgerStore) -> Result<PushReport, LedgerError> {
        let local = store.load().await?;
        Ok(PushReport {
            revision: local.revision,
            published: false,
        })
    }
}
