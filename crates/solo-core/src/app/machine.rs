//! NodeMachine - 外部コラボレーター向けのステージ遷移 API
//!
//! スキャナ・スコアラ・プロンプト生成・応答取り込み・パブリッシャは
//! それぞれの成果物を持ってここを呼びます。コアは遷移を冪等に記録し、
//! 順序違反を拒否するだけで、コラボレーターを待つことはありません。
//!
//! すべての操作は `NodeContext::transition`（StaleRevision は上限付きで再試行）を通ります。

use std::collections::BTreeSet;
use std::sync::Arc;

use super::context::NodeContext;
use crate::domain::{
    ArtifactRef, Decider, Decision, HistoryEvent, Ledger, LedgerError, Source, Stage, Task, TaskId,
};
use crate::impls::{HeuristicScorer, IssueFacts};

/// What a collaborator should do at a checkpoint.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Checkpoint {
    /// Keep going; the task is at this stage.
    Continue(Stage),
    /// Task reached `archived` or `failed`.
    Finished(Stage),
}

pub struct NodeMachine {
    ctx: NodeContext,
    decider: Arc<dyn Decider>,
}

impl NodeMachine {
    pub fn new(ctx: NodeContext, decider: Arc<dyn Decider>) -> Self {
        Self { ctx, decider }
    }

    pub fn context(&self) -> &NodeContext {
        &self.ctx
    }

    /// Record a newly discovered task. Re-discovering a known id is a no-op.
    pub async fn discover(
        &self,
        source: Source,
        requires: BTreeSet<String>,
    ) -> Result<(TaskId, bool), LedgerError> {
        let id = TaskId::from_source(&source.system, &source.locator);
        let mut task = Task::discovered(id.clone(), source, self.ctx.node_id.clone(), self.ctx.clock.now());
        task.requires = requires;
        let applied = self.ctx.store.insert_task(task).await?;
        if applied.output {
            tracing::info!(task = %id, revision = applied.ledger.revision, "task discovered");
        }
        Ok((id, applied.output))
    }

    /// Discover, score and queue in one go (scanner and scorer both local).
    pub async fn enqueue(
        &self,
        source: Source,
        score: f64,
        requires: BTreeSet<String>,
    ) -> Result<TaskId, LedgerError> {
        let (id, _) = self.discover(source, requires).await?;
        let stage = self.ctx.store.load().await?.task(&id)?.stage;
        if stage == Stage::Discovered {
            let now = self.ctx.clock.now();
            self.ctx
                .transition(&id, |l| {
                    l.task_mut(&id)?.score = score;
                    l.advance(&id, &self.ctx.node_id, Stage::Scoring, ArtifactRef::new(format!("score:{score}")), now)
                })
                .await?;
        }
        if matches!(stage, Stage::Discovered | Stage::Scoring) {
            self.submit_artifact(&id, Stage::Queued, ArtifactRef::new("queued"))
                .await?;
        }
        Ok(id)
    }

    /// Enqueue an issue with the heuristic score of its metadata.
    pub async fn enqueue_issue(
        &self,
        mut source: Source,
        facts: &IssueFacts,
        requires: BTreeSet<String>,
    ) -> Result<(TaskId, f64), LedgerError> {
        let score = HeuristicScorer.score(facts);
        if source.title.is_none() && !facts.title.is_empty() {
            source.title = Some(facts.title.clone());
        }
        let id = self.enqueue(source, score, requires).await?;
        Ok((id, score))
    }

    /// Stage callback: record `stage` with its artifact.
    ///
    /// Same artifact twice: no new history, no revision bump.
    pub async fn submit_artifact(
        &self,
        task_id: &TaskId,
        stage: Stage,
        payload: ArtifactRef,
    ) -> Result<Ledger, LedgerError> {
        let now = self.ctx.clock.now();
        let node = &self.ctx.node_id;
        let applied = self
            .ctx
            .transition(task_id, |l| l.advance(task_id, node, stage, payload.clone(), now))
            .await?;
        if applied.changed {
            tracing::info!(task = %task_id, %stage, revision = applied.ledger.revision, "stage recorded");
        } else {
            tracing::debug!(task = %task_id, %stage, "artifact already recorded");
        }
        Ok(applied.ledger)
    }

    /// A collaborator failed at the current stage. The decider picks retry or `failed`.
    pub async fn report_failure(&self, task_id: &TaskId, reason: &str) -> Result<Decision, LedgerError> {
        let now = self.ctx.clock.now();
        let node = &self.ctx.node_id;
        let decider = &self.decider;
        let applied = self
            .ctx
            .transition(task_id, |l| {
                l.record_failure(task_id, node, reason, now)?;
                let decision = decider.decide(l.task(task_id)?, reason);
                if let Decision::MarkFailed { reason } = &decision {
                    l.fail(task_id, node, reason, now)?;
                }
                Ok(decision)
            })
            .await?;
        match &applied.output {
            Decision::Retry { delay, reason } => {
                tracing::warn!(task = %task_id, ?delay, %reason, "stage failed, will retry");
            }
            Decision::MarkFailed { reason } => {
                tracing::error!(task = %task_id, %reason, "task failed");
            }
        }
        Ok(applied.output)
    }

    /// Hand the active task back to the queue.
    pub async fn release(&self, task_id: &TaskId) -> Result<(), LedgerError> {
        let now = self.ctx.clock.now();
        let node = &self.ctx.node_id;
        self.ctx
            .transition(task_id, |l| l.release(task_id, node, now))
            .await?;
        tracing::info!(task = %task_id, node = %node, "task released");
        Ok(())
    }

    /// Give up on the active task (e.g. resources exhausted).
    pub async fn abandon(&self, task_id: &TaskId, reason: &str) -> Result<(), LedgerError> {
        let now = self.ctx.clock.now();
        let node = &self.ctx.node_id;
        self.ctx
            .transition(task_id, |l| l.abandon(task_id, node, reason, now))
            .await?;
        tracing::warn!(task = %task_id, %reason, "task abandoned");
        Ok(())
    }

    /// Operator cancel.
    pub async fn cancel(&self, task_id: &TaskId, reason: &str) -> Result<(), LedgerError> {
        let now = self.ctx.clock.now();
        let node = &self.ctx.node_id;
        let applied = self
            .ctx
            .transition(task_id, |l| l.cancel(task_id, node, reason, now))
            .await?;
        if applied.changed {
            tracing::warn!(task = %task_id, operator = %node, %reason, "task cancelled");
        }
        Ok(())
    }

    /// Called by in-flight work between steps: should it keep going?
    pub async fn checkpoint(&self, task_id: &TaskId) -> Result<Checkpoint, LedgerError> {
        let ledger = self.ctx.store.load().await?;
        let task = ledger.task(task_id)?;
        match task.stage {
            Stage::Abandoned => {
                let lost = task.history.iter().rev().find_map(|e| match &e.event {
                    HistoryEvent::ClaimLost { winner } if e.node == self.ctx.node_id => {
                        Some(winner.clone())
                    }
                    _ => None,
                });
                match lost {
                    Some(winner) => Err(LedgerError::ClaimLost {
                        task: task_id.clone(),
                        winner,
                    }),
                    None => Err(LedgerError::Cancelled {
                        task: task_id.clone(),
                    }),
                }
            }
            stage if stage.is_terminal() => Ok(Checkpoint::Finished(stage)),
            stage if stage.requires_owner() && !task.is_owned_by(&self.ctx.node_id) => {
                Err(LedgerError::ClaimLost {
                    task: task_id.clone(),
                    winner: task.owner_node_id.clone(),
                })
            }
            Stage::Queued if self.reclaimed_from_me(task) => Err(LedgerError::ClaimLost {
                task: task_id.clone(),
                winner: None,
            }),
            stage => Ok(Checkpoint::Continue(stage)),
        }
    }

    /// The last ownership change was a reclaim of this node's claim.
    fn reclaimed_from_me(&self, task: &Task) -> bool {
        let last = task.history.iter().rev().find(|e| {
            matches!(
                e.event,
                HistoryEvent::Claimed { .. } | HistoryEvent::Released | HistoryEvent::Reclaimed { .. }
            )
        });
        matches!(
            last.map(|e| &e.event),
            Some(HistoryEvent::Reclaimed { abandoned_by, .. }) if *abandoned_by == self.ctx.node_id
        )
    }
}
