//! Cloud-folder replication (rclone remote or a mounted sync folder).
//!
//! Cloud storage only knows whole-file overwrite, so every pull downloads the
//! complete remote ledger and merges it record by record in-process, and every
//! push merges the latest remote copy before uploading. Whatever the storage
//! layer decides about write order, no local record is ever dropped: a change
//! lost to a concurrent upload is simply uploaded again on the next push.

use std::path::{Path, PathBuf};

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use ulid::Ulid;

use super::command;
use crate::domain::{Ledger, LedgerError};
use crate::ports::{PullReport, PushReport, Replicator};
use crate::store::{codec, LedgerStore};

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum RemoteFolder {
    /// `rclone` remote spec, e.g. `gdrive:solo-swarm`.
    Rclone { remote: String },
    /// A folder kept in sync by a desktop client (Dropbox, Drive, OneDrive).
    Local { path: PathBuf },
}

#[derive(Debug, Clone)]
pub struct CloudReplicator {
    folder: RemoteFolder,
    file_name: String,
}

impl CloudReplicator {
    pub fn new(folder: RemoteFolder, file_name: impl Into<String>) -> Self {
        Self {
            folder,
            file_name: file_name.into(),
        }
    }

    fn remote_label(&self) -> String {
        match &self.folder {
            RemoteFolder::Rclone { remote } => {
                format!("{}/{}", remote.trim_end_matches('/'), self.file_name)
            }
            RemoteFolder::Local { path } => path.join(&self.file_name).display().to_string(),
        }
    }

    /// Download and parse the remote ledger. `Ok(None)` when there is none yet.
    async fn download(&self, store: &LedgerStore) -> Result<Option<Ledger>, LedgerError> {
        let text = match &self.folder {
            RemoteFolder::Local { path } => {
                if !tokio::fs::try_exists(path).await.unwrap_or(false) {
                    return Err(LedgerError::NetworkUnavailable(format!(
                        "cloud folder {} is not mounted",
                        path.display()
                    )));
                }
                match tokio::fs::read_to_string(path.join(&self.file_name)).await {
                    Ok(text) => text,
                    Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(None),
                    Err(e) => return Err(e.into()),
                }
            }
            RemoteFolder::Rclone { .. } => {
                let tmp = scratch_path(store.path(), "download");
                let target = tmp.to_string_lossy().to_string();
                let out = rclone(&["copyto", &self.remote_label(), &target]).await?;
                if !out.success {
                    let _ = tokio::fs::remove_file(&tmp).await;
                    return match classify_rclone(&out.stderr) {
                        RcloneFailure::NotFound => Ok(None),
                        RcloneFailure::Network => {
                            Err(LedgerError::NetworkUnavailable(first_line(&out.stderr)))
                        }
                        RcloneFailure::Other => {
                            Err(LedgerError::Replication(first_line(&out.stderr)))
                        }
                    };
                }
                let text = tokio::fs::read_to_string(&tmp).await;
                let _ = tokio::fs::remove_file(&tmp).await;
                text?
            }
        };
        match codec::decode(Path::new(&self.remote_label()), &text) {
            Ok(ledger) => Ok(Some(ledger)),
            Err(LedgerError::CorruptLedger { reason, .. }) => Err(LedgerError::MergeConflict(
                format!("remote ledger unreadable: {reason}"),
            )),
            Err(e) => Err(e),
        }
    }

    async fn upload(&self, store: &LedgerStore) -> Result<(), LedgerError> {
        match &self.folder {
            RemoteFolder::Local { path } => {
                let ledger = store.load().await?;
                let text = codec::encode(&ledger)?;
                let tmp = path.join(format!(".{}.upload-{}", self.file_name, Ulid::new()));
                tokio::fs::write(&tmp, text).await?;
                if let Err(e) = tokio::fs::rename(&tmp, path.join(&self.file_name)).await {
                    let _ = tokio::fs::remove_file(&tmp).await;
                    return Err(e.into());
                }
                Ok(())
            }
            RemoteFolder::Rclone { .. } => {
                let source = store.path().to_string_lossy().to_string();
                let out = rclone(&["copyto", &source, &self.remote_label()]).await?;
                if out.success {
                    return Ok(());
                }
                match classify_rclone(&out.stderr) {
                    RcloneFailure::Network => {
                        Err(LedgerError::NetworkUnavailable(first_line(&out.stderr)))
                    }
                    _ => Err(LedgerError::Replication(first_line(&out.stderr))),
                }
            }
        }
    }
}

#[async_trait]
impl Replicator for CloudReplicator {
    fn kind(&self) -> &'static str {
        "cloud"
    }

    async fn pull(&self, store: &LedgerStore) -> Result<PullReport, LedgerError> {
        let Some(remote) = self.download(store).await? else {
            let local = store.load().await?;
            return Ok(PullReport {
                remote_revision: None,
                local_revision: local.revision,
                changed: false,
            });
        };
        let applied = store.merge_remote(&remote).await?;
        Ok(PullReport {
            remote_revision: Some(remote.revision),
            local_revision: applied.ledger.revision,
            changed: applied.changed,
        })
    }

    async fn push(&self, store: &LedgerStore) -> Result<PushReport, LedgerError> {
        // an unreadable remote is never overwritten; it needs a trusted copy
        let remote = self.download(store).await?;
        if let Some(remote) = &remote {
            store.merge_remote(remote).await?;
        }
        let local = store.load().await?;
        if remote.as_ref() == Some(&local) {
            return Ok(PushReport {
                revision: local.revision,
                published: false,
            });
        }
        self.upload(store).await?;
        Ok(PushReport {
            revision: local.revision,
            published: true,
        })
    }
}

async fn rclone(args: &[&str]) -> Result<command::CommandOutput, LedgerError> {
    command::run("rclone", args, None).await.map_err(|e| {
        if e.kind() == std::io::ErrorKind::NotFound {
            LedgerError::Replication("rclone is not installed".into())
        } else {
            e.into()
        }
    })
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum RcloneFailure {
    NotFound,
    Network,
    Other,
}

fn classify_rclone(stderr: &str) -> RcloneFailure {
    let s = stderr.to_ascii_lowercase();
    if s.contains("not found") || s.contains("doesn't exist") || s.contains("directory not found")
    {
        RcloneFailure::NotFound
    } else if s.contains("no such host")
        || s.contains("dial tcp")
        || s.contains("timeout")
        || s.contains("connection refused")
        || s.contains("network is unreachable")
    {
        RcloneFailure::Network
    } else {
        RcloneFailure::Other
    }
}

fn first_line(s: &str) -> String {
    s.lines().next().unwrap_or("").trim().to_string()
}

fn scratch_path(ledger: &Path, what: &str) -> PathBuf {
    let mut name = ledger.file_name().map(|n| n.to_os_string()).unwrap_or_default();
    name.push(format!(".{what}-{}", Ulid::new()));
    ledger.with_file_name(name)
}
