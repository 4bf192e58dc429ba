//! Claim Protocol - 楽観的並行制御によるタスクの取得
//!
//! # フロー
//! 1. リソースゲート（バッテリー・負荷・メモリ・ディスク）を確認
//! 2. スケジューラに候補を聞く（最後に読んだ revision を覚えておく）
//! 3. その revision を expected にして `apply_transition` で claim を書く
//! 4. `StaleRevision` なら読み直して再試行（上限あり）。それでも駄目なら別の候補へ
//! 5. 成功したらすぐ push、続けて pull。まだ自分が owner なら claim を確認済みにする
//!
//! 確認前の claim は「負けるかもしれない」claim です。publishing への遷移は
//! 確認済みになるまで拒否されるので、負けた側の途中成果は安全に捨てられます。

use std::sync::Arc;

use super::context::NodeContext;
use crate::domain::{LedgerError, NodeRecord, TaskId};
use crate::ports::{ResourceMeter, SchedulerPolicy};

pub struct ClaimProtocol {
    ctx: NodeContext,
    scheduler: Arc<dyn SchedulerPolicy>,
    meter: Arc<dyn ResourceMeter>,
}

impl ClaimProtocol {
    pub fn new(
        ctx: NodeContext,
        scheduler: Arc<dyn SchedulerPolicy>,
        meter: Arc<dyn ResourceMeter>,
    ) -> Self {
        Self {
            ctx,
            scheduler,
            meter,
        }
    }

    /// Claim `task_id`, starting from the revision the caller last saw.
    ///
    /// Returns the task's revision after the claim.
    pub async fn try_claim(&self, task_id: &TaskId, seen_revision: u64) -> Result<u64, LedgerError> {
        let ctx = &self.ctx;
        let attempts = ctx.settings.max_claim_attempts.max(1);
        let mut expected = seen_revision;
        let mut attempt = 1;
        loop {
            let now = ctx.clock.now();
            let result = ctx
                .store
                .apply_transition(task_id, expected, |l| {
                    l.claim(task_id, &ctx.node_id, now, ctx.settings.lease)
                })
                .await;
            match result {
                Ok(applied) => {
                    let revision = applied.ledger.task(task_id)?.revision;
                    tracing::info!(
                        task = %task_id,
                        node = %ctx.node_id,
                        revision,
                        lease_secs = ctx.settings.lease.num_seconds(),
                        "claimed task"
                    );
                    return Ok(revision);
                }
                Err(LedgerError::StaleRevision { actual, .. }) if attempt < attempts => {
                    tracing::debug!(task = %task_id, expected, actual, attempt, "claim raced, re-reading");
                    expected = actual;
                    attempt += 1;
                }
                Err(e) => return Err(e),
            }
        }
    }

    /// Gate, pick, claim, publish and confirm. `Ok(None)` when nothing was claimable.
    pub async fn claim_next(&self) -> Result<Option<TaskId>, LedgerError> {
        let ctx = &self.ctx;
        let sample = self.meter.sample().await;
        ctx.settings
            .limits
            .check(&sample)
            .map_err(|reason| LedgerError::ResourceGated { reason })?;

        let mut view = ctx.store.load().await?;
        let mut me = view
            .node(&ctx.node_id)
            .cloned()
            .unwrap_or_else(|| NodeRecord::new(ctx.node_id.clone(), ctx.clock.now()));
        if let Some(active) = view.active_task(&ctx.node_id) {
            return Err(LedgerError::NodeBusy {
                node: ctx.node_id.clone(),
                active,
            });
        }
        me.capabilities.extend(ctx.settings.capabilities.iter().cloned());

        while let Some(candidate) = self.scheduler.next_candidate(&view, &me) {
            let seen = view.task(&candidate)?.revision;
            match self.try_claim(&candidate, seen).await {
                Ok(_) => {
                    self.publish(&candidate).await;
                    return Ok(Some(candidate));
                }
                Err(
                    e @ (LedgerError::StaleRevision { .. }
                    | LedgerError::AlreadyClaimed { .. }
                    | LedgerError::NotClaimable { .. }
                    | LedgerError::TaskNotFound(_)),
                ) => {
                    tracing::info!(task = %candidate, error = %e, "candidate skipped");
                    view.tasks.remove(&candidate);
                }
                Err(e) => return Err(e),
            }
        }
        Ok(None)
    }

    /// Push right away to shrink the race window, then confirm if we still own it.
    async fn publish(&self, task_id: &TaskId) {
        match confirm_pending(&self.ctx).await {
            Ok(Some(confirmed)) if confirmed == *task_id => {}
            Ok(_) => {
                tracing::debug!(task = %task_id, "claim not confirmed yet");
            }
            Err(e) => {
                tracing::warn!(task = %task_id, error = %e, "claim published locally only, will retry");
            }
        }
    }
}

/// Push, pull, and confirm this node's unconfirmed active claim if it survived.
///
/// Returns the confirmed task. Claim loss found on the pull is left for
/// `reconcile` to record.
pub async fn confirm_pending(ctx: &NodeContext) -> Result<Option<TaskId>, LedgerError> {
    let ledger = ctx.store.load().await?;
    let Some(active) = ledger.active_task(&ctx.node_id) else {
        return Ok(None);
    };
    match ledger.task(&active) {
        Ok(task) if task.is_owned_by(&ctx.node_id) && !task.is_confirmed() => {}
        _ => return Ok(None),
    }

    ctx.sync.push(&ctx.store).await?;
    ctx.sync.pull(&ctx.store).await?;

    let ledger = ctx.store.load().await?;
    let task = ledger.task(&active)?;
    if !task.is_owned_by(&ctx.node_id) || task.stage.is_terminal() {
        return Ok(None);
    }
    let now = ctx.clock.now();
    ctx.transition(&active, |l| l.confirm_claim(&active, &ctx.node_id, now))
        .await?;
    tracing::info!(task = %active, node = %ctx.node_id, "claim confirmed");
    Ok(Some(active))
}
