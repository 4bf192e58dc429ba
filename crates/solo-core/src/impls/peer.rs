//! Peer-sync replication (Syncthing and similar).
//!
//! The sync tool moves the ledger file itself. When two peers change it
//! concurrently it keeps one version and saves the other beside it as
//! `<stem>.sync-conflict-<date>-<time>-<device>.<ext>`. Pulling merges every
//! such copy into the ledger and deletes it; pushing is left to the tool.

use std::path::{Path, PathBuf};

use async_trait::async_trait;

use crate::domain::LedgerError;
use crate::ports::{PullReport, PushReport, Replicator};
use crate::store::{codec, LedgerStore};

#[derive(Debug, Clone, Copy, Default)]
pub struct PeerReplicator;

impl PeerReplicator {
    pub fn new() -> Self {
        Self
    }
}

/// Conflict copies of `ledger` in its directory, oldest name first.
async fn conflict_copies(ledger: &Path) -> Result<Vec<PathBuf>, LedgerError> {
    let Some(dir) = ledger.parent() else {
        return Ok(Vec::new());
    };
    let Some(name) = ledger.file_name().and_then(|n| n.to_str()) else {
        return Ok(Vec::new());
    };
    let (stem, ext) = match name.rsplit_once('.') {
        Some((stem, ext)) => (stem, Some(ext)),
        None => (name, None),
    };
    let prefix = format!("{stem}.sync-conflict-");

    let mut found = Vec::new();
    let mut entries = match tokio::fs::read_dir(if dir.as_os_str().is_empty() {
        Path::new(".")
    } else {
        dir
    })
    .await
    {
        Ok(entries) => entries,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(found),
        Err(e) => return Err(e.into()),
    };
    while let Some(entry) = entries.next_entry().await? {
        let file_name = entry.file_name();
        let Some(candidate) = file_name.to_str() else {
            continue;
        };
        let ext_ok = ext.is_none_or(|ext| candidate.ends_with(&format!(".{ext}")));
        if candidate.starts_with(&prefix) && ext_ok {
            found.push(entry.path());
        }
    }
    found.sort();
    Ok(found)
}

#[async_trait]
impl Replicator for PeerReplicator {
    fn kind(&self) -> &'static str {
        "peer"
    }

    async fn pull(&self, store: &LedgerStore) -> Result<PullReport, LedgerError> {
        let mut report = PullReport {
            local_revision: store.load().await?.revision,
            ..PullReport::default()
        };
        for copy in conflict_copies(store.path()).await? {
            let text = tokio::fs::read_to_string(&copy).await?;
            let remote = match codec::decode(&copy, &text) {
                Ok(remote) => remote,
                Err(e) => {
                    tracing::warn!(copy = %copy.display(), error = %e, "skipping unreadable conflict copy");
                    continue;
                }
            };
            let applied = store.merge_remote(&remote).await?;
            tokio::fs::remove_file(&copy).await?;
            tracing::info!(
                copy = %copy.display(),
                revision = applied.ledger.revision,
                "merged peer conflict copy"
            );
            report.remote_revision = report.remote_revision.max(Some(remote.revision));
            report.local_revision = applied.ledger.revision;
            report.changed |= applied.changed;
        }
        Ok(report)
    }

    async fn push(&self, store: &LedgerStore) -> Result<PushReport, LedgerError> {
        let local = store.load().await?;
        tracing::debug!(revision = local.revision, "peer sync publishes on its own");
        Ok(PushReport {
            revision: local.revision,
            published: false,
        })
    }
}
