//! WorkerLoop - 1 ノード 1 タスクの主ループ
//!
//! # フロー（1 サイクル）
//! 1. pull（失敗してもオフラインで続行）
//! 2. reconcile: active task の owner が変わっていれば ClaimLost を記録して手放す
//! 3. 手が空いていて degraded でなければ claim を試みる
//! 4. 未確認の claim があれば push → pull → confirm
//!
//! ステージの実作業は外部コラボレーターが `NodeMachine` 経由で進めます。
//! このループは「次に何を持つか」と「まだ持っているか」だけを管理します。
//! `CorruptLedger` を見たらループを止めて degraded にします（heartbeat は続く）。

use tokio::sync::watch;

use super::claim::{confirm_pending, ClaimProtocol};
use super::context::NodeContext;
use crate::domain::{ErrorKind, LedgerError, NodeId, TaskId};

/// What `reconcile` found about the active task.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Reconciled {
    Idle,
    Holding(TaskId),
    /// Another node won the task; local progress must be discarded.
    Lost { task: TaskId, winner: Option<NodeId> },
    /// The task reached a terminal stage and was let go.
    Finished(TaskId),
}

/// What one cycle did.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CycleReport {
    pub reconciled: Reconciled,
    pub claimed: Option<TaskId>,
    pub confirmed: Option<TaskId>,
    pub offline: bool,
}

pub struct WorkerLoop {
    ctx: NodeContext,
    claims: ClaimProtocol,
}

impl WorkerLoop {
    pub fn new(ctx: NodeContext, claims: ClaimProtocol) -> Self {
        Self { ctx, claims }
    }

    /// Check the active task against the (freshly pulled) ledger.
    pub async fn reconcile(&self) -> Result<Reconciled, LedgerError> {
        let ctx = &self.ctx;
        let ledger = ctx.store.load().await?;
        let now = ctx.clock.now();
        let Some(active) = ledger.node(&ctx.node_id).and_then(|n| n.active_task_id.clone()) else {
            if ledger.owned_task(&ctx.node_id).is_none() {
                return Ok(Reconciled::Idle);
            }
            let applied = ctx
                .store
                .update(|l| Ok(l.restore_active(&ctx.node_id, now)))
                .await?;
            return Ok(match applied.output {
                Some(task) => {
                    tracing::warn!(task = %task, node = %ctx.node_id, "active task restored from ownership");
                    Reconciled::Holding(task)
                }
                None => Reconciled::Idle,
            });
        };

        let Ok(task) = ledger.task(&active) else {
            ctx.store
                .update(|l| {
                    l.clear_active(&ctx.node_id, &active);
                    Ok(())
                })
                .await?;
            tracing::warn!(task = %active, "active task missing from ledger, cleared");
            return Ok(Reconciled::Lost {
                task: active,
                winner: None,
            });
        };

        if task.stage.is_terminal() {
            let stage = task.stage;
            ctx.store
                .update(|l| {
                    l.clear_active(&ctx.node_id, &active);
                    Ok(())
                })
                .await?;
            tracing::info!(task = %active, %stage, "active task finished");
            return Ok(Reconciled::Finished(active));
        }

        if task.is_owned_by(&ctx.node_id) {
            return Ok(Reconciled::Holding(active));
        }

        let applied = ctx
            .store
            .update(|l| l.record_claim_lost(&active, &ctx.node_id, now))
            .await?;
        let winner = applied.output;
        tracing::warn!(
            task = %active,
            node = %ctx.node_id,
            winner = ?winner,
            "claim lost, discarding local progress"
        );
        Ok(Reconciled::Lost {
            task: active,
            winner,
        })
    }

    pub async fn run_once(&self) -> Result<CycleReport, LedgerError> {
        let ctx = &self.ctx;
        let offline = match ctx.sync.pull(&ctx.store).await {
            Ok(_) => false,
            Err(e) if matches!(e.kind(), ErrorKind::Transient | ErrorKind::Infrastructure) => {
                tracing::debug!(node = %ctx.node_id, error = %e, "pull failed, working offline");
                true
            }
            Err(e) => return Err(e),
        };

        let reconciled = self.reconcile().await?;
        let mut claimed = None;
        if !matches!(reconciled, Reconciled::Holding(_)) && !ctx.is_degraded() {
            match self.claims.claim_next().await {
                Ok(task) => claimed = task,
                Err(LedgerError::ResourceGated { reason }) => {
                    tracing::debug!(node = %ctx.node_id, %reason, "claiming paused");
                }
                Err(LedgerError::NodeBusy { active, .. }) => {
                    tracing::debug!(node = %ctx.node_id, task = %active, "node busy");
                }
                Err(e) => return Err(e),
            }
        }

        let confirmed = if offline {
            None
        } else {
            match confirm_pending(ctx).await {
                Ok(task) => task,
                Err(e) if matches!(e.kind(), ErrorKind::Transient | ErrorKind::Infrastructure) => {
                    tracing::debug!(node = %ctx.node_id, error = %e, "confirmation deferred");
                    None
                }
                Err(e) => return Err(e),
            }
        };

        Ok(CycleReport {
            reconciled,
            claimed,
            confirmed,
            offline,
        })
    }

    /// Cycle every `poll_interval` until `shutdown` flips or the ledger is corrupt.
    pub async fn run(&self, mut shutdown: watch::Receiver<bool>) {
        loop {
            if *shutdown.borrow() {
                break;
            }
            match self.run_once().await {
                Ok(report) => {
                    if let Some(task) = &report.claimed {
                        tracing::debug!(node = %self.ctx.node_id, task = %task, "cycle claimed");
                    }
                }
                Err(e) if e.kind() == ErrorKind::Fatal => {
                    self.ctx.set_degraded(true);
                    tracing::error!(
                        node = %self.ctx.node_id,
                        error = %e,
                        "task loop halted; re-sync the ledger from a trusted peer"
                    );
                    break;
                }
                Err(e) => {
                    tracing::warn!(node = %self.ctx.node_id, error = %e, "worker cycle failed");
                }
            }
            tokio::select! {
                _ = shutdown.changed() => {}
                _ = tokio::time::sleep(self.ctx.settings.poll_interval) => {}
            }
        }
    }
}
