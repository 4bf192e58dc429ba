//! SchedulerPolicy port - 次に取るタスクの選択
//!
//! スケジューラは ledger を読むだけで変更しません。
//! claim の成否は Claim Protocol が決めます。

use crate::domain::{Ledger, NodeRecord, TaskId};

pub trait SchedulerPolicy: Send + Sync {
    /// Pick the next task `node` should try to claim, if any.
    fn next_candidate(&self, ledger: &Ledger, node: &NodeRecord) -> Option<TaskId>;
}
