//! LivenessMonitor - heartbeat と死んだノードのタスク回収
//!
//! # 1 tick のフロー
//! 1. pull（ネットワークが無ければオフラインのまま続行）
//! 2. 自分の NodeRecord に heartbeat・バッテリー・capabilities・status を書く
//! 3. 自分の active task の lease を延長
//! 4. 全 NodeRecord を見て、死んだ owner の lease 切れタスクを queued に戻す
//! 5. push
//!
//! 回収は claim と同じ `apply_transition` 経路を通るので、2 ノードが同時に
//! 回収しても片方は `StaleRevision` で止まり、複製後はマージで収束します。
//! ledger が壊れていても heartbeat ループ自体は止めません（degraded として報告）。

use std::sync::Arc;

use serde::Serialize;
use tokio::sync::watch;

use super::context::NodeContext;
use crate::domain::{ErrorKind, LedgerError, NodeId, NodeRecord, NodeStatus, TaskId};
use crate::ports::ResourceMeter;

/// What one heartbeat tick did.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct TickReport {
    pub revision: u64,
    /// Active task whose lease was extended.
    pub renewed: Option<TaskId>,
    /// Reclaimed tasks with the dead owner they were taken from.
    pub reclaimed: Vec<(TaskId, NodeId)>,
    /// Pull or push could not reach the remote.
    pub offline: bool,
    pub working: bool,
}

pub struct LivenessMonitor {
    ctx: NodeContext,
    meter: Arc<dyn ResourceMeter>,
}

impl LivenessMonitor {
    pub fn new(ctx: NodeContext, meter: Arc<dyn ResourceMeter>) -> Self {
        Self { ctx, meter }
    }

    pub async fn tick(&self) -> Result<TickReport, LedgerError> {
        let mut report = TickReport::default();
        let pulled = self.ctx.sync.pull(&self.ctx.store).await;
        report.offline |= !self.reachable("pull", pulled)?;

        let record = self.beat().await?;
        report.working = record.active_task_id.is_some();
        report.renewed = self.renew().await?;
        report.reclaimed = self.reap().await?;

        let pushed = self.ctx.sync.push(&self.ctx.store).await;
        report.offline |= !self.reachable("push", pushed)?;
        report.revision = self.ctx.store.load().await?.revision;
        Ok(report)
    }

    /// Stamp this node's record with a fresh heartbeat.
    pub async fn beat(&self) -> Result<NodeRecord, LedgerError> {
        let ctx = &self.ctx;
        let sample = self.meter.sample().await;
        let now = ctx.clock.now();
        let degraded = ctx.is_degraded();
        let capabilities = ctx.settings.capabilities.clone();
        let applied = ctx
            .store
            .update_node(&ctx.node_id, now, |record| {
                record.last_heartbeat_at = now;
                record.battery_level = sample.battery;
                record.capabilities = capabilities;
                record.status = if degraded {
                    NodeStatus::Degraded
                } else if record.active_task_id.is_some() {
                    NodeStatus::Working
                } else {
                    NodeStatus::Idle
                };
            })
            .await?;
        tracing::debug!(
            node = %ctx.node_id,
            status = %applied.output.status,
            revision = applied.ledger.revision,
            "heartbeat"
        );
        Ok(applied.output)
    }

    /// Extend the lease on this node's active task, if it still owns it.
    async fn renew(&self) -> Result<Option<TaskId>, LedgerError> {
        let ctx = &self.ctx;
        let ledger = ctx.store.load().await?;
        let Some(active) = ledger.active_task(&ctx.node_id) else {
            return Ok(None);
        };
        match ledger.task(&active) {
            Ok(task) if task.is_owned_by(&ctx.node_id) && !task.stage.is_terminal() => {}
            // ownership changes are recorded by the worker's reconcile
            _ => return Ok(None),
        }
        let now = ctx.clock.now();
        match ctx
            .transition(&active, |l| l.renew_lease(&active, &ctx.node_id, now, ctx.settings.lease))
            .await
        {
            Ok(_) => Ok(Some(active)),
            Err(e @ (LedgerError::NotOwner { .. } | LedgerError::StaleRevision { .. })) => {
                tracing::debug!(task = %active, error = %e, "lease not renewed");
                Ok(None)
            }
            Err(e) => Err(e),
        }
    }

    /// Return tasks held by dead owners to the queue.
    ///
    /// Each reclaim re-checks liveness inside the mutation, since the task's
    /// revision does not cover the owner's node record.
    pub async fn reap(&self) -> Result<Vec<(TaskId, NodeId)>, LedgerError> {
        let ctx = &self.ctx;
        let dead_after = ctx.settings.dead_after;
        let now = ctx.clock.now();
        let candidates = ctx.store.load().await?.dead_claims(now, dead_after);

        let mut reclaimed = Vec::new();
        for task_id in candidates {
            let result = ctx
                .transition(&task_id, |l| {
                    if !l.dead_claims(now, dead_after).contains(&task_id) {
                        return Ok(None);
                    }
                    l.reclaim(&task_id, &ctx.node_id, now).map(Some)
                })
                .await;
            match result {
                Ok(applied) => {
                    if let Some(dead) = applied.output {
                        tracing::info!(
                            task = %task_id,
                            abandoned_by = %dead,
                            node = %ctx.node_id,
                            revision = applied.ledger.revision,
                            "reclaimed task from dead node"
                        );
                        reclaimed.push((task_id, dead));
                    }
                }
                Err(
                    e @ (LedgerError::StaleRevision { .. }
                    | LedgerError::AlreadyClaimed { .. }
                    | LedgerError::NotClaimable { .. }),
                ) => {
                    tracing::debug!(task = %task_id, error = %e, "reclaim skipped");
                }
                Err(e) => return Err(e),
            }
        }
        Ok(reclaimed)
    }

    /// Stamp `offline` and publish it.
    pub async fn shutdown(&self) -> Result<(), LedgerError> {
        let ctx = &self.ctx;
        let now = ctx.clock.now();
        ctx.store
            .update_node(&ctx.node_id, now, |record| {
                record.last_heartbeat_at = now;
                record.status = NodeStatus::Offline;
            })
            .await?;
        let pushed = ctx.sync.push(&ctx.store).await;
        self.reachable("push", pushed)?;
        tracing::info!(node = %ctx.node_id, "node offline");
        Ok(())
    }

    /// Heartbeat until `shutdown` flips, then go offline.
    pub async fn run(&self, mut shutdown: watch::Receiver<bool>) {
        loop {
            if *shutdown.borrow() {
                break;
            }
            let interval = match self.tick().await {
                Ok(report) if report.working => self.ctx.settings.heartbeat_interval,
                Ok(_) => self.ctx.settings.idle_heartbeat_interval,
                Err(e) => {
                    tracing::error!(node = %self.ctx.node_id, error = %e, "heartbeat tick failed");
                    self.ctx.settings.heartbeat_interval
                }
            };
            tokio::select! {
                _ = shutdown.changed() => {}
                _ = tokio::time::sleep(interval) => {}
            }
        }
        if let Err(e) = self.shutdown().await {
            tracing::warn!(node = %self.ctx.node_id, error = %e, "could not publish offline status");
        }
    }

    /// `Ok(false)` when the remote is unreachable; the node keeps working offline.
    fn reachable<T>(&self, op: &'static str, result: Result<T, LedgerError>) -> Result<bool, LedgerError> {
        match result {
            Ok(_) => Ok(true),
            Err(e) if matches!(e.kind(), ErrorKind::Transient | ErrorKind::Infrastructure) => {
                tracing::debug!(node = %self.ctx.node_id, op, error = %e, "working offline");
                Ok(false)
            }
            Err(e) => Err(e),
        }
    }
}
