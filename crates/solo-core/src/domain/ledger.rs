//! Ledger - 全タスクと全ノードの集約
//!
//! # 役割
//! ledger はスワームで唯一の共有状態です。ここにあるのは **純粋な** 変更操作だけで、
//! ファイル I/O・ロック・revision の採番は `store::LedgerStore` が担当します。
//!
//! # revision の付け方
//! 各 Task / NodeRecord は「最後に変更された ledger revision」を持ちます。
//! 変更操作の前後を `stamp_changes` で比較し、実際に変わったレコードだけに
//! 新しい revision を付けます。何も変わらなければ revision は動きません
//! （同じ artifact の再送が no-op になるのはこのため）。
//!
//! # マージ（レプリカ間の調停）
//! - Task はレコード単位でマージ。`claim_stamp`（時刻, node）が大きい方が勝ち、
//!   同じなら stage の進み具合 → updated_at → updated_by → 正規化テキストの順で決定。
//! - history は和集合（同じ dead claim に対する reclaim の重複は勝者の 1 件に畳む）。
//! - NodeRecord は (last_heartbeat_at, revision) の大きい方。
//! - マージで内容が変わったレコードは max(両 revision) + 1 で再スタンプされるので、
//!   古い revision を前提にした変更は必ず `StaleRevision` になります。

use std::cmp::Ordering;
use std::collections::BTreeMap;

use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};

use super::errors::LedgerError;
use super::history::{merge_histories, HistoryEntry, HistoryEvent};
use super::ids::{NodeId, TaskId};
use super::node::{NodeRecord, NodeStatus};
use super::stage::Stage;
use super::task::{ArtifactRef, ClaimStamp, Task};

#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct Ledger {
    pub revision: u64,
    pub tasks: BTreeMap<TaskId, Task>,
    pub nodes: BTreeMap<NodeId, NodeRecord>,
}

impl Ledger {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn task(&self, id: &TaskId) -> Result<&Task, LedgerError> {
        self.tasks
            .get(id)
            .ok_or_else(|| LedgerError::TaskNotFound(id.clone()))
    }

    pub fn task_mut(&mut self, id: &TaskId) -> Result<&mut Task, LedgerError> {
        self.tasks
            .get_mut(id)
            .ok_or_else(|| LedgerError::TaskNotFound(id.clone()))
    }

    pub fn node(&self, id: &NodeId) -> Option<&NodeRecord> {
        self.nodes.get(id)
    }

    pub fn node_entry(&mut self, id: &NodeId, now: DateTime<Utc>) -> &mut NodeRecord {
        self.nodes
            .entry(id.clone())
            .or_insert_with(|| NodeRecord::new(id.clone(), now))
    }

    /// Insert a task unless one with the same id exists. Returns true if inserted.
    pub fn insert_task(&mut self, task: Task) -> bool {
        if self.tasks.contains_key(&task.id) {
            return false;
        }
        self.tasks.insert(task.id.clone(), task);
        true
    }

    pub fn stage_counts(&self) -> BTreeMap<Stage, usize> {
        let mut counts = BTreeMap::new();
        for task in self.tasks.values() {
            *counts.entry(task.stage).or_insert(0) += 1;
        }
        counts
    }

    // ========================================
    // Claim protocol
    // ========================================

    /// Take ownership of a queued task.
    pub fn claim(
        &mut self,
        task_id: &TaskId,
        node: &NodeId,
        now: DateTime<Utc>,
        lease: Duration,
    ) -> Result<(), LedgerError> {
        if let Some(active) = self.active_task(node) {
            return Err(LedgerError::NodeBusy {
                node: node.clone(),
                active,
            });
        }

        let task = self.task_mut(task_id)?;
        if task.has_live_claim(now) {
            if let Some(owner) = task.owner_node_id.clone() {
                return Err(LedgerError::AlreadyClaimed {
                    task: task_id.clone(),
                    owner,
                });
            }
        }
        if task.stage != Stage::Queued {
            return Err(LedgerError::NotClaimable {
                task: task_id.clone(),
                stage: task.stage,
            });
        }

        let lease_expires_at = now + lease;
        task.stage = Stage::Claimed;
        task.owner_node_id = Some(node.clone());
        task.claimed_at = Some(now);
        task.lease_expires_at = Some(lease_expires_at);
        task.claim_confirmed_at = None;
        task.claim_stamp = Some(ClaimStamp::new(now, node.clone()));
        task.failures = 0;
        task.record(now, node, HistoryEvent::Claimed { lease_expires_at });

        let record = self.node_entry(node, now);
        record.active_task_id = Some(task_id.clone());
        record.status = NodeStatus::Working;
        Ok(())
    }

    /// Mark the claim as having survived a push and a pull.
    pub fn confirm_claim(
        &mut self,
        task_id: &TaskId,
        node: &NodeId,
        now: DateTime<Utc>,
    ) -> Result<(), LedgerError> {
        let task = self.task_mut(task_id)?;
        if !task.is_owned_by(node) || task.stage.is_terminal() {
            return Err(LedgerError::ClaimLost {
                task: task_id.clone(),
                winner: task.owner_node_id.clone(),
            });
        }
        if task.claim_confirmed_at.is_none() {
            task.claim_confirmed_at = Some(now);
            task.record(now, node, HistoryEvent::Confirmed);
        }
        Ok(())
    }

    pub fn renew_lease(
        &mut self,
        task_id: &TaskId,
        node: &NodeId,
        now: DateTime<Utc>,
        lease: Duration,
    ) -> Result<(), LedgerError> {
        let task = self.task_mut(task_id)?;
        if !task.is_owned_by(node) || task.stage.is_terminal() {
            return Err(LedgerError::NotOwner {
                task: task_id.clone(),
                node: node.clone(),
            });
        }
        task.lease_expires_at = Some(now + lease);
        task.touch(now, node);
        Ok(())
    }

    // ========================================
    // Stage transitions
    // ========================================

    /// Record a forward transition carrying the stage's artifact.
    ///
    /// Re-delivering an artifact that is already recorded is a no-op.
    pub fn advance(
        &mut self,
        task_id: &TaskId,
        node: &NodeId,
        to: Stage,
        artifact: ArtifactRef,
        now: DateTime<Utc>,
    ) -> Result<(), LedgerError> {
        let task = self.task_mut(task_id)?;

        match task.artifacts.get(&to) {
            Some(existing) if *existing == artifact => return Ok(()),
            Some(_) => {
                return Err(LedgerError::ArtifactConflict {
                    task: task_id.clone(),
                    stage: to,
                });
            }
            None => {}
        }

        let from = task.stage;
        if to == Stage::Claimed || from.is_terminal() || !from.can_advance_to(to) {
            return Err(LedgerError::InvalidTransition {
                task: task_id.clone(),
                from,
                to,
            });
        }
        if (to.requires_owner() || to == Stage::Archived) && !task.is_owned_by(node) {
            return Err(LedgerError::NotOwner {
                task: task_id.clone(),
                node: node.clone(),
            });
        }
        if to == Stage::Publishing && !task.is_confirmed() {
            return Err(LedgerError::ClaimUnconfirmed {
                task: task_id.clone(),
            });
        }

        task.stage = to;
        task.failures = 0;
        task.artifacts.insert(to, artifact);
        task.record(now, node, HistoryEvent::Transition { from, to });

        if to.is_terminal() {
            self.finish(task_id);
        }
        Ok(())
    }

    /// Count a failure at the current stage. Returns the new failure count.
    pub fn record_failure(
        &mut self,
        task_id: &TaskId,
        node: &NodeId,
        reason: &str,
        now: DateTime<Utc>,
    ) -> Result<u32, LedgerError> {
        let task = self.task_mut(task_id)?;
        if task.stage.is_terminal() {
            return Err(LedgerError::InvalidTransition {
                task: task_id.clone(),
                from: task.stage,
                to: Stage::Failed,
            });
        }
        if task.stage.requires_owner() && !task.is_owned_by(node) {
            return Err(LedgerError::NotOwner {
                task: task_id.clone(),
                node: node.clone(),
            });
        }
        task.failures += 1;
        let failures = task.failures;
        let stage = task.stage;
        task.record(
            now,
            node,
            HistoryEvent::Failure {
                stage,
                reason: reason.to_string(),
                failures,
            },
        );
        Ok(failures)
    }

    /// Terminal `failed`.
    pub fn fail(
        &mut self,
        task_id: &TaskId,
        node: &NodeId,
        reason: &str,
        now: DateTime<Utc>,
    ) -> Result<(), LedgerError> {
        let task = self.task_mut(task_id)?;
        if task.stage.is_terminal() {
            return Err(LedgerError::InvalidTransition {
                task: task_id.clone(),
                from: task.stage,
                to: Stage::Failed,
            });
        }
        task.stage = Stage::Failed;
        task.record(
            now,
            node,
            HistoryEvent::Failed {
                reason: reason.to_string(),
            },
        );
        self.finish(task_id);
        Ok(())
    }

    /// Owner hands the task back to the queue.
    pub fn release(
        &mut self,
        task_id: &TaskId,
        node: &NodeId,
        now: DateTime<Utc>,
    ) -> Result<(), LedgerError> {
        let task = self.task_mut(task_id)?;
        if task.stage.is_terminal() {
            return Err(LedgerError::InvalidTransition {
                task: task_id.clone(),
                from: task.stage,
                to: Stage::Queued,
            });
        }
        if !task.is_owned_by(node) {
            return Err(LedgerError::NotOwner {
                task: task_id.clone(),
                node: node.clone(),
            });
        }
        requeue(task, node, now);
        task.record(now, node, HistoryEvent::Released);
        self.clear_active(node, task_id);
        Ok(())
    }

    /// Owner gives up on the task (e.g. resources exhausted). Terminal.
    pub fn abandon(
        &mut self,
        task_id: &TaskId,
        node: &NodeId,
        reason: &str,
        now: DateTime<Utc>,
    ) -> Result<(), LedgerError> {
        let task = self.task_mut(task_id)?;
        if task.stage.is_terminal() {
            return Err(LedgerError::InvalidTransition {
                task: task_id.clone(),
                from: task.stage,
                to: Stage::Abandoned,
            });
        }
        if !task.is_owned_by(node) {
            return Err(LedgerError::NotOwner {
                task: task_id.clone(),
                node: node.clone(),
            });
        }
        task.stage = Stage::Abandoned;
        task.record(
            now,
            node,
            HistoryEvent::Abandoned {
                reason: reason.to_string(),
            },
        );
        self.finish(task_id);
        Ok(())
    }

    /// Operator cancel: any node may do it, at any stage. Cancelling an
    /// already-cancelled task is a no-op.
    pub fn cancel(
        &mut self,
        task_id: &TaskId,
        operator: &NodeId,
        reason: &str,
        now: DateTime<Utc>,
    ) -> Result<(), LedgerError> {
        let task = self.task_mut(task_id)?;
        match task.stage {
            Stage::Abandoned => return Ok(()),
            stage if stage.is_terminal() => {
                return Err(LedgerError::InvalidTransition {
                    task: task_id.clone(),
                    from: stage,
                    to: Stage::Abandoned,
                });
            }
            _ => {}
        }
        task.stage = Stage::Abandoned;
        task.claim_stamp = Some(ClaimStamp::new(now, operator.clone()));
        task.record(
            now,
            operator,
            HistoryEvent::Cancelled {
                reason: reason.to_string(),
            },
        );
        self.finish(task_id);
        Ok(())
    }

    // ========================================
    // Liveness
    // ========================================

    /// Tasks whose owner is dead (no record, offline, or silent for longer
    /// than `dead_after`) and whose lease has expired.
    pub fn dead_claims(&self, now: DateTime<Utc>, dead_after: Duration) -> Vec<TaskId> {
        self.tasks
            .values()
            .filter(|task| !task.stage.is_terminal() && task.lease_expired(now))
            .filter(|task| match &task.owner_node_id {
                Some(owner) => self
                    .node(owner)
                    .is_none_or(|record| !record.is_alive(now, dead_after)),
                None => false,
            })
            .map(|task| task.id.clone())
            .collect()
    }

    /// Return a dead owner's task to the queue.
    pub fn reclaim(
        &mut self,
        task_id: &TaskId,
        reclaimer: &NodeId,
        now: DateTime<Utc>,
    ) -> Result<NodeId, LedgerError> {
        let task = self.task_mut(task_id)?;
        let Some(dead) = task.owner_node_id.clone() else {
            return Err(LedgerError::NotClaimable {
                task: task_id.clone(),
                stage: task.stage,
            });
        };
        if task.stage.is_terminal() || !task.lease_expired(now) {
            return Err(LedgerError::AlreadyClaimed {
                task: task_id.clone(),
                owner: dead,
            });
        }
        let claim = task.claim_stamp.clone();
        requeue(task, reclaimer, now);
        task.record(
            now,
            reclaimer,
            HistoryEvent::Reclaimed {
                abandoned_by: dead.clone(),
                claim,
            },
        );
        self.clear_active(&dead, task_id);
        Ok(dead)
    }

    /// Called by a node that finds its active task owned by someone else.
    /// Records the loss on the task and frees the node.
    pub fn record_claim_lost(
        &mut self,
        task_id: &TaskId,
        node: &NodeId,
        now: DateTime<Utc>,
    ) -> Result<Option<NodeId>, LedgerError> {
        let task = self.task_mut(task_id)?;
        let winner = task.owner_node_id.clone();
        task.history.push(HistoryEntry::new(
            now,
            node.clone(),
            HistoryEvent::ClaimLost {
                winner: winner.clone(),
            },
        ));
        self.clear_active(node, task_id);
        Ok(winner)
    }

    /// Clear lease and the owner's active task after a terminal transition.
    fn finish(&mut self, task_id: &TaskId) {
        let Some(task) = self.tasks.get_mut(task_id) else {
            return;
        };
        task.lease_expires_at = None;
        let archived = task.stage == Stage::Archived;
        let Some(owner) = task.owner_node_id.clone() else {
            return;
        };
        if let Some(record) = self.nodes.get_mut(&owner) {
            if record.active_task_id.as_ref() == Some(task_id) {
                record.active_task_id = None;
                if record.status == NodeStatus::Working {
                    record.status = NodeStatus::Idle;
                }
            }
            if archived {
                record.completed_tasks += 1;
            }
        }
    }

    /// A non-terminal task owned by `node`, whatever its node record says.
    pub fn owned_task(&self, node: &NodeId) -> Option<TaskId> {
        self.tasks
            .values()
            .find(|task| !task.stage.is_terminal() && task.is_owned_by(node))
            .map(|task| task.id.clone())
    }

    /// The node's active task: its record's pointer, else any task it still owns.
    pub fn active_task(&self, node: &NodeId) -> Option<TaskId> {
        self.node(node)
            .and_then(|n| n.active_task_id.clone())
            .or_else(|| self.owned_task(node))
    }

    /// Point the node record back at a task it still owns.
    ///
    /// A merged node record can predate the claim that made the task ours.
    pub fn restore_active(&mut self, node: &NodeId, now: DateTime<Utc>) -> Option<TaskId> {
        if self.node(node).is_some_and(|n| n.active_task_id.is_some()) {
            return None;
        }
        let task_id = self.owned_task(node)?;
        let record = self.node_entry(node, now);
        record.active_task_id = Some(task_id.clone());
        record.status = NodeStatus::Working;
        Some(task_id)
    }

    pub fn clear_active(&mut self, node: &NodeId, task_id: &TaskId) {
        if let Some(record) = self.nodes.get_mut(node) {
            if record.active_task_id.as_ref() == Some(task_id) {
                record.active_task_id = None;
                if record.status == NodeStatus::Working {
                    record.status = NodeStatus::Idle;
                }
            }
        }
    }

    // ========================================
    // Revisions & merge
    // ========================================

    /// Stamp every record that differs from `before` with `revision`.
    /// Returns false (and leaves the ledger revision alone) if nothing changed.
    pub fn stamp_changes(&mut self, before: &Ledger, revision: u64) -> bool {
        let mut changed = false;
        for (id, task) in self.tasks.iter_mut() {
            if before.tasks.get(id) != Some(&*task) {
                task.revision = revision;
                changed = true;
            }
        }
        for (id, node) in self.nodes.iter_mut() {
            let prior = before.nodes.get(id);
            if prior != Some(&*node) {
                node.seq = prior.map_or(0, |p| p.seq) + 1;
                node.revision = revision;
                changed = true;
            }
        }
        if changed {
            self.revision = revision;
        }
        changed
    }

    /// Merge a replica into this one.
    ///
    /// The result is the same whichever side is `self`, except for revision
    /// numbers: records that differ from `self` are stamped with a fresh
    /// revision above both inputs.
    pub fn merge(&self, remote: &Ledger) -> Ledger {
        let mut merged = Ledger {
            revision: self.revision.max(remote.revision),
            tasks: BTreeMap::new(),
            nodes: BTreeMap::new(),
        };

        for id in self.tasks.keys().chain(remote.tasks.keys()) {
            if merged.tasks.contains_key(id) {
                continue;
            }
            let task = match (self.tasks.get(id), remote.tasks.get(id)) {
                (Some(ours), Some(theirs)) => merge_task(ours, theirs),
                (Some(only), None) | (None, Some(only)) => only.clone(),
                (None, None) => continue,
            };
            merged.tasks.insert(id.clone(), task);
        }

        for id in self.nodes.keys().chain(remote.nodes.keys()) {
            if merged.nodes.contains_key(id) {
                continue;
            }
            let node = match (self.nodes.get(id), remote.nodes.get(id)) {
                (Some(ours), Some(theirs)) => pick_node(ours, theirs).clone(),
                (Some(only), None) | (None, Some(only)) => only.clone(),
                (None, None) => continue,
            };
            merged.nodes.insert(id.clone(), node);
        }

        let next = merged.revision + 1;
        let mut changed = false;
        for (id, task) in merged.tasks.iter_mut() {
            match self.tasks.get(id) {
                Some(ours) if same_task(ours, task) => task.revision = ours.revision,
                _ => {
                    task.revision = next;
                    changed = true;
                }
            }
        }
        for (id, node) in merged.nodes.iter_mut() {
            match self.nodes.get(id) {
                Some(ours) if same_node(ours, node) => node.revision = ours.revision,
                _ => {
                    node.revision = next;
                    changed = true;
                }
            }
        }
        if changed {
            merged.revision = next;
        }
        merged
    }

    /// Structural checks run on every load.
    pub fn validate(&self) -> Result<(), String> {
        for (id, task) in &self.tasks {
            if task.id != *id {
                return Err(format!("task key {id} does not match record id {}", task.id));
            }
            if task.revision > self.revision {
                return Err(format!(
                    "task {id} revision {} is above ledger revision {}",
                    task.revision, self.revision
                ));
            }
        }
        for (id, node) in &self.nodes {
            if node.node_id != *id {
                return Err(format!(
                    "node key {id} does not match record id {}",
                    node.node_id
                ));
            }
            if node.revision > self.revision {
                return Err(format!(
                    "node {id} revision {} is above ledger revision {}",
                    node.revision, self.revision
                ));
            }
        }
        Ok(())
    }
}

/// Back to `queued` under a new ownership stamp, dropping post-claim artifacts.
fn requeue(task: &mut Task, by: &NodeId, now: DateTime<Utc>) {
    task.stage = Stage::Queued;
    task.clear_claim();
    task.failures = 0;
    task.claim_stamp = Some(ClaimStamp::new(now, by.clone()));
    task.artifacts.retain(|stage, _| !stage.requires_owner() && !stage.is_terminal());
}

fn task_order(a: &Task, b: &Task) -> Ordering {
    a.claim_stamp
        .cmp(&b.claim_stamp)
        .then_with(|| a.stage.progress_rank().cmp(&b.stage.progress_rank()))
        .then_with(|| a.updated_at.cmp(&b.updated_at))
        .then_with(|| a.updated_by.cmp(&b.updated_by))
        .then_with(|| a.canonical_without_history().cmp(&b.canonical_without_history()))
}

fn merge_task(ours: &Task, theirs: &Task) -> Task {
    let winner = match task_order(ours, theirs) {
        Ordering::Less => theirs,
        _ => ours,
    };
    let mut merged = winner.clone();
    merged.history = merge_histories(&ours.history, &theirs.history, winner.claim_stamp.as_ref());
    merged
}

fn same_task(a: &Task, b: &Task) -> bool {
    let mut b = b.clone();
    b.revision = a.revision;
    *a == b
}

fn same_node(a: &NodeRecord, b: &NodeRecord) -> bool {
    let mut b = b.clone();
    b.revision = a.revision;
    *a == b
}

/// Newer edit wins. `revision` is local to each replica and never compared.
fn pick_node<'a>(ours: &'a NodeRecord, theirs: &'a NodeRecord) -> &'a NodeRecord {
    let key = |n: &NodeRecord| (n.seq, n.last_heartbeat_at, n.completed_tasks);
    match key(ours).cmp(&key(theirs)) {
        Ordering::Less => theirs,
        Ordering::Greater => ours,
        Ordering::Equal => {
            let canonical = |n: &NodeRecord| {
                let mut copy = n.clone();
                copy.revision = 0;
                serde_json::to_string(&copy).unwrap_or_default()
            };
            if canonical(theirs) > canonical(ours) { theirs } else { ours }
        }
    }
}

impl Task {
    fn canonical_without_history(&self) -> String {
        let mut copy = self.clone();
        copy.history.clear();
        copy.revision = 0;
        copy.canonical()
    }
}
