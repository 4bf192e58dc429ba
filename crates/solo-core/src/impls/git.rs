//! Git replication.
//!
//! The ledger file lives inside a git working tree. Git's own line merge is
//! never used: pull reads the upstream blob with `git show` and merges it in
//! process, push commits the merged file directly on top of the upstream tip
//! and pushes it. A rejected push means someone else got there first; the
//! sync driver pulls and pushes again.

use std::path::{Path, PathBuf};

use async_trait::async_trait;

use super::command::{self, CommandOutput};
use crate::domain::{Ledger, LedgerError, NodeId};
use crate::ports::{PullReport, PushReport, Replicator};
use crate::store::{codec, LedgerStore};

#[derive(Debug, Clone)]
pub struct GitReplicator {
    repo_dir: PathBuf,
    remote: String,
    branch: String,
    node_id: NodeId,
}

impl GitReplicator {
    pub fn new(
        repo_dir: impl Into<PathBuf>,
        remote: impl Into<String>,
        branch: impl Into<String>,
        node_id: NodeId,
    ) -> Self {
        Self {
            repo_dir: repo_dir.into(),
            remote: remote.into(),
            branch: branch.into(),
            node_id,
        }
    }

    fn upstream(&self) -> String {
        format!("{}/{}", self.remote, self.branch)
    }

    /// Ledger path relative to the work tree, with `/` separators.
    fn rel_path(&self, store: &LedgerStore) -> Result<String, LedgerError> {
        let rel = store
            .path()
            .strip_prefix(&self.repo_dir)
            .map_err(|_| {
                LedgerError::Replication(format!(
                    "ledger {} is outside repository {}",
                    store.path().display(),
                    self.repo_dir.display()
                ))
            })?;
        Ok(rel
            .components()
            .map(|c| c.as_os_str().to_string_lossy())
            .collect::<Vec<_>>()
            .join("/"))
    }

    async fn git(&self, args: &[&str]) -> Result<CommandOutput, LedgerError> {
        command::run("git", args, Some(&self.repo_dir))
            .await
            .map_err(|e| {
                if e.kind() == std::io::ErrorKind::NotFound {
                    LedgerError::Replication("git is not installed".into())
                } else {
                    e.into()
                }
            })
    }

    /// `Ok(false)` when the upstream branch does not exist yet.
    async fn fetch(&self) -> Result<bool, LedgerError> {
        let out = self.git(&["fetch", "--quiet", &self.remote, &self.branch]).await?;
        if out.success {
            return Ok(true);
        }
        match classify(&out.stderr) {
            GitFailure::MissingRef => Ok(false),
            failure => Err(failure.into_error(&out.stderr)),
        }
    }

    async fn upstream_ledger(&self, rel: &str) -> Result<Option<Ledger>, LedgerError> {
        let spec = format!("{}:{rel}", self.upstream());
        let out = self.git(&["show", &spec]).await?;
        if !out.success {
            return match classify(&out.stderr) {
                GitFailure::MissingRef | GitFailure::MissingPath => Ok(None),
                failure => Err(failure.into_error(&out.stderr)),
            };
        }
        match codec::decode(Path::new(&spec), &out.stdout) {
            Ok(ledger) => Ok(Some(ledger)),
            Err(LedgerError::CorruptLedger { reason, .. }) => Err(LedgerError::MergeConflict(
                format!("upstream ledger unreadable: {reason}"),
            )),
            Err(e) => Err(e),
        }
    }

    async fn merge_upstream(
        &self,
        store: &LedgerStore,
        rel: &str,
    ) -> Result<PullReport, LedgerError> {
        let Some(remote) = self.upstream_ledger(rel).await? else {
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
}

#[async_trait]
impl Replicator for GitReplicator {
    fn kind(&self) -> &'static str {
        "git"
    }

    async fn pull(&self, store: &LedgerStore) -> Result<PullReport, LedgerError> {
        let rel = self.rel_path(store)?;
        if !self.fetch().await? {
            let local = store.load().await?;
            return Ok(PullReport {
                remote_revision: None,
                local_revision: local.revision,
                changed: false,
            });
        }
        self.merge_upstream(store, &rel).await
    }

    async fn push(&self, store: &LedgerStore) -> Result<PushReport, LedgerError> {
        let rel = self.rel_path(store)?;
        let has_upstream = self.fetch().await?;
        if has_upstream {
            // the commit goes on top of the upstream tip, so it must carry its records
            self.merge_upstream(store, &rel).await?;
            let reset = self.git(&["reset", "--quiet", "--mixed", &self.upstream()]).await?;
            if !reset.success {
                return Err(LedgerError::Replication(first_line(&reset.stderr)));
            }
        }

        let revision = store.load().await?.revision;
        let add = self.git(&["add", "--", &rel]).await?;
        if !add.success {
            return Err(LedgerError::Replication(first_line(&add.stderr)));
        }
        let diff = self.git(&["diff", "--cached", "--quiet", "--", &rel]).await?;
        if diff.success {
            return Ok(PushReport {
                revision,
                published: false,
            });
        }

        let message = format!("ledger r{revision} from {}", self.node_id);
        let email = format!("user.email={}@solo.local", self.node_id);
        let name = format!("user.name={}", self.node_id);
        let commit = self
            .git(&["-c", &name, "-c", &email, "commit", "--quiet", "-m", &message, "--", &rel])
            .await?;
        if !commit.success {
            return Err(LedgerError::Replication(first_line(&commit.stderr)));
        }

        let refspec = format!("HEAD:{}", self.branch);
        let push = self.git(&["push", "--quiet", &self.remote, &refspec]).await?;
        if !push.success {
            return Err(classify(&push.stderr).into_error(&push.stderr));
        }
        tracing::debug!(revision, remote = %self.remote, branch = %self.branch, "pushed ledger");
        Ok(PushReport {
            revision,
            published: true,
        })
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum GitFailure {
    /// The branch does not exist on the remote yet.
    MissingRef,
    /// The branch exists but has no ledger file.
    MissingPath,
    Rejected,
    Network,
    Conflict,
    Other,
}

impl GitFailure {
    fn into_error(self, stderr: &str) -> LedgerError {
        let msg = first_line(stderr);
        match self {
            GitFailure::Rejected => LedgerError::RejectedNonFastForward(msg),
            GitFailure::Network => LedgerError::NetworkUnavailable(msg),
            GitFailure::Conflict => LedgerError::MergeConflict(msg),
            GitFailure::MissingRef | GitFailure::MissingPath | GitFailure::Other => {
                LedgerError::Replication(msg)
            }
        }
    }
}

fn classify(stderr: &str) -> GitFailure {
    let s = stderr.to_ascii_lowercase();
    if s.contains("couldn't find remote ref") || s.contains("invalid object name") {
        GitFailure::MissingRef
    } else if s.contains("does not exist in") || s.contains("exists on disk, but not in") {
        GitFailure::MissingPath
    } else if s.contains("[rejected]")
        || s.contains("non-fast-forward")
        || s.contains("fetch first")
        || s.contains("failed to push some refs")
    {
        GitFailure::Rejected
    } else if s.contains("could not resolve host")
        || s.contains("unable to access")
        || s.contains("could not read from remote repository")
        || s.contains("connection timed out")
        || s.contains("network is unreachable")
    {
        GitFailure::Network
    } else if s.contains("conflict") || s.contains("unmerged") {
        GitFailure::Conflict
    } else {
        GitFailure::Other
    }
}

fn first_line(s: &str) -> String {
    s.lines()
        .map(str::trim)
        .find(|l| !l.is_empty())
        .unwrap_or("")
        .to_string()
}
