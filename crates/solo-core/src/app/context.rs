//! NodeContext - 1 ノード分の依存をまとめたもの
//!
//! ledger store は常に明示的に渡します（グローバル状態にはしない）。
//! heartbeat と worker はそれぞれ `NodeContext` のクローンを持ちます。

use std::collections::BTreeSet;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use chrono::Duration;

use super::sync::SyncDriver;
use crate::domain::{Ledger, LedgerError, NodeId, TaskId};
use crate::ports::{Clock, ResourceLimits};
use crate::store::{Applied, LedgerStore};

#[derive(Debug, Clone, PartialEq)]
pub struct NodeSettings {
    pub lease: Duration,
    pub dead_after: Duration,
    pub max_claim_attempts: u32,
    pub heartbeat_interval: std::time::Duration,
    pub idle_heartbeat_interval: std::time::Duration,
    pub poll_interval: std::time::Duration,
    pub capabilities: BTreeSet<String>,
    pub limits: ResourceLimits,
}

impl Default for NodeSettings {
    fn default() -> Self {
        Self {
            lease: Duration::seconds(600),
            dead_after: Duration::seconds(600),
            max_claim_attempts: 3,
            heartbeat_interval: std::time::Duration::from_secs(30),
            idle_heartbeat_interval: std::time::Duration::from_secs(30),
            poll_interval: std::time::Duration::from_secs(15),
            capabilities: BTreeSet::new(),
            limits: ResourceLimits::default(),
        }
    }
}

#[derive(Clone)]
pub struct NodeContext {
    pub node_id: NodeId,
    pub store: LedgerStore,
    pub sync: Arc<SyncDriver>,
    pub clock: Arc<dyn Clock>,
    pub settings: NodeSettings,
    degraded: Arc<AtomicBool>,
}

impl NodeContext {
    pub fn new(
        node_id: NodeId,
        store: LedgerStore,
        sync: Arc<SyncDriver>,
        clock: Arc<dyn Clock>,
        settings: NodeSettings,
    ) -> Self {
        Self {
            node_id,
            store,
            sync,
            clock,
            settings,
            degraded: Arc::new(AtomicBool::new(false)),
        }
    }

    /// Task loop halted on a corrupt ledger; the heartbeat reports it.
    pub fn is_degraded(&self) -> bool {
        self.degraded.load(Ordering::SeqCst)
    }

    pub fn set_degraded(&self, degraded: bool) {
        self.degraded.store(degraded, Ordering::SeqCst);
    }

    /// `apply_transition` against the task's current revision, re-read and
    /// retried on `StaleRevision` up to `max_claim_attempts` times.
    pub async fn transition<T, F>(&self, task_id: &TaskId, mut mutation: F) -> Result<Applied<T>, LedgerError>
    where
        F: FnMut(&mut Ledger) -> Result<T, LedgerError>,
    {
        let attempts = self.settings.max_claim_attempts.max(1);
        let mut expected = self.store.load().await?.task(task_id)?.revision;
        let mut attempt = 1;
        loop {
            match self
                .store
                .apply_transition(task_id, expected, |l| mutation(l))
                .await
            {
                Err(LedgerError::StaleRevision { actual, .. }) if attempt < attempts => {
                    tracing::debug!(task = %task_id, expected, actual, attempt, "stale revision, retrying");
                    expected = actual;
                    attempt += 1;
                }
                other => return other,
            }
        }
    }
}
