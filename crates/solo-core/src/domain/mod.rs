//! Domain model (IDs, stages, tasks, nodes, the ledger aggregate, errors, decisions).
//!
//! ここにあるものは全て純粋なデータと純粋な関数です。
//! I/O や時刻の取得は `ports` / `store` / `app` 側で行います。

pub mod decision;
pub mod errors;
pub mod history;
pub mod ids;
pub mod ledger;
pub mod node;
pub mod retry;
pub mod stage;
pub mod task;

pub use decision::{Decider, Decision, DefaultDecider};
pub use errors::{ErrorKind, LedgerError};
pub use history::{HistoryEntry, HistoryEvent};
pub use ids::{InvalidId, NodeId, TaskId};
pub use ledger::Ledger;
pub use node::{NodeRecord, NodeStatus};
pub use retry::RetryPolicy;
pub use stage::Stage;
pub use task::{ArtifactRef, ClaimStamp, Source, Task};
