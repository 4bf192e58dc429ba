//! In-process replication: several stores sharing one remote.
//!
//! The remote behaves like a git branch: a push is a fast-forward only when
//! the remote has not moved since this replica last pulled. A switch takes the
//! replica offline to simulate partitions.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};

use async_trait::async_trait;

use crate::domain::{Ledger, LedgerError};
use crate::ports::{PullReport, PushReport, Replicator};
use crate::store::LedgerStore;

#[derive(Debug, Clone, Default)]
pub struct SharedRemote {
    inner: Arc<Mutex<Option<Ledger>>>,
}

impl SharedRemote {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn snapshot(&self) -> Option<Ledger> {
        match self.inner.lock() {
            Ok(guard) => guard.clone(),
            Err(poisoned) => poisoned.into_inner().clone(),
        }
    }

    pub fn revision(&self) -> Option<u64> {
        self.snapshot().map(|l| l.revision)
    }

    fn compare_and_set(&self, base: Option<u64>, ledger: Ledger) -> Result<bool, LedgerError> {
        let mut guard = self
            .inner
            .lock()
            .map_err(|_| LedgerError::Replication("shared remote poisoned".into()))?;
        let current = guard.as_ref().map(|l| l.revision);
        if current.is_some() && current != base {
            return Err(LedgerError::RejectedNonFastForward(format!(
                "remote at {current:?}, last pulled {base:?}"
            )));
        }
        if guard.as_ref() == Some(&ledger) {
            return Ok(false);
        }
        *guard = Some(ledger);
        Ok(true)
    }
}

#[derive(Debug)]
pub struct MemoryReplicator {
    remote: SharedRemote,
    online: AtomicBool,
    base: Mutex<Option<u64>>,
}

impl MemoryReplicator {
    pub fn new(remote: SharedRemote) -> Self {
        Self {
            remote,
            online: AtomicBool::new(true),
            base: Mutex::new(None),
        }
    }

    pub fn set_online(&self, online: bool) {
        self.online.store(online, Ordering::SeqCst);
    }

    pub fn remote(&self) -> &SharedRemote {
        &self.remote
    }

    fn ensure_online(&self) -> Result<(), LedgerError> {
        if self.online.load(Ordering::SeqCst) {
            Ok(())
        } else {
            Err(LedgerError::NetworkUnavailable("replica is offline".into()))
        }
    }

    fn base(&self) -> Option<u64> {
        self.base.lock().ok().and_then(|b| *b)
    }

    fn set_base(&self, revision: Option<u64>) {
        if let Ok(mut base) = self.base.lock() {
            *base = revision;
        }
    }
}

#[async_trait]
impl Replicator for MemoryReplicator {
    fn kind(&self) -> &'static str {
        "memory"
    }

    async fn pull(&self, store: &LedgerStore) -> Result<PullReport, LedgerError> {
        self.ensure_online()?;
        let Some(remote) = self.remote.snapshot() else {
            self.set_base(None);
            let local = store.load().await?;
            return Ok(PullReport {
                remote_revision: None,
                local_revision: local.revision,
                changed: false,
            });
        };
        let applied = store.merge_remote(&remote).await?;
        self.set_base(Some(remote.revision));
        Ok(PullReport {
            remote_revision: Some(remote.revision),
            local_revision: applied.ledger.revision,
            changed: applied.changed,
        })
    }

    async fn push(&self, store: &LedgerStore) -> Result<PushReport, LedgerError> {
        self.ensure_online()?;
        let local = store.load().await?;
        let revision = local.revision;
        let published = self.remote.compare_and_set(self.base(), local)?;
        self.set_base(Some(revision));
        Ok(PushReport {
            revision,
            published,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::{NodeId, Source, Stage, Task, TaskId};
    use chrono::Utc;

    async fn store(dir: &tempfile::TempDir, name: &str) -> LedgerStore {
        let store = LedgerStore::new(dir.path().join(name).join("ledger.jsonl"));
        store.bootstrap().await.unwrap();
        store
    }

    fn task(id: &str) -> Task {
        let mut task = Task::discovered(
            TaskId::new(id),
            Source::new("github", id),
            NodeId::new("scanner"),
            Utc::now(),
        );
        task.stage = Stage::Queued;
        task
    }

    #[tokio::test]
    async fn push_without_pull_is_rejected_once_remote_moved() {
        let dir = tempfile::tempdir().unwrap();
        let remote = SharedRemote::new();
        let (a, b) = (store(&dir, "a").await, store(&dir, "b").await);
        let (ra, rb) = (
            MemoryReplicator::new(remote.clone()),
            MemoryReplicator::new(remote.clone()),
        );

        a.insert_task(task("t-1")).await.unwrap();
        ra.pull(&a).await.unwrap();
        assert!(ra.push(&a).await.unwrap().published);

        b.insert_task(task("t-2")).await.unwrap();
        let err = rb.push(&b).await.unwrap_err();
        assert!(err.needs_pull());

        let report = rb.pull(&b).await.unwrap();
        assert!(report.changed);
        rb.push(&b).await.unwrap();

        let merged = remote.snapshot().unwrap();
        assert_eq!(merged.tasks.len(), 2);
    }

    #[tokio::test]
    async fn offline_replica_reports_network_unavailable() {
        let dir = tempfile::tempdir().unwrap();
        let a = store(&dir, "a").await;
        let ra = MemoryReplicator::new(SharedRemote::new());
        ra.set_online(false);
        assert!(matches!(
            ra.pull(&a).await,
            Err(LedgerError::NetworkUnavailable(_))
        ));
        ra.set_online(true);
        assert_eq!(ra.pull(&a).await.unwrap().remote_revision, None);
    }
}
