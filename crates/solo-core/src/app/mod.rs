//! App - アプリケーション層
//!
//! このモジュールは、ports と store を組み合わせてノードの振る舞いを実装します。
//!
//! # 主要コンポーネント
//! - **NodeBuilder**: 1 ノード分のワイヤリング（起動時検証つき）
//! - **ClaimProtocol**: 楽観的並行制御による claim と確認
//! - **NodeMachine**: コラボレーター向けのステージ遷移 API
//! - **LivenessMonitor**: heartbeat と死んだノードからの回収
//! - **WorkerLoop**: pull → reconcile → claim → confirm
//! - **SyncDriver**: レプリケーションの再試行
//! - **NodeRuntime**: heartbeat と worker の 2 ループ
//! - **SwarmStatus**: swarm 全体の健康状態

pub mod builder;
pub mod claim;
pub mod context;
pub mod liveness;
pub mod machine;
pub mod runtime;
pub mod status;
pub mod sync;
pub mod worker_loop;

#[cfg(test)]
mod scenarios;

// 主要な型を再エクスポート
pub use self::builder::{BuildError, Node, NodeBuilder};
pub use self::claim::{confirm_pending, ClaimProtocol};
pub use self::context::{NodeContext, NodeSettings};
pub use self::liveness::{LivenessMonitor, TickReport};
pub use self::machine::{Checkpoint, NodeMachine};
pub use self::runtime::NodeRuntime;
pub use self::status::{NodeSummary, SwarmStatus};
pub use self::sync::{SyncDriver, SyncOptions};
pub use self::worker_loop::{CycleReport, Reconciled, WorkerLoop};
