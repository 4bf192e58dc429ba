//! Ledger Store - ローカルの ledger ファイル
//!
//! # 唯一の変更経路
//! すべての変更は「ロック取得 → ディスクから再読込 → 検証 → 変更 → 一時ファイルに書いて
//! fsync → rename」で行います。途中でクラッシュしても半端なファイルは残りません。
//!
//! - `apply_transition`: タスク単位の楽観的並行制御（expected revision の確認付き）
//! - `update` / `update_node`: 自ノードのレコード（heartbeat 等）
//! - `merge_remote`: レプリケーションで取得したコピーのマージ
//! - `replace`: 破損後のオペレーターによる再同期
//!
//! 変更が何も起きなかった場合は書き込まず、revision も動きません。

pub mod codec;
pub mod lock;

use std::path::{Path, PathBuf};

use tokio::io::AsyncWriteExt;
use ulid::Ulid;

use crate::domain::{Ledger, LedgerError, NodeId, NodeRecord, Task, TaskId};

pub use lock::LockOptions;

/// Outcome of a mutation: the ledger as written (or as found, if unchanged).
#[derive(Debug, Clone)]
pub struct Applied<T> {
    pub ledger: Ledger,
    pub output: T,
    pub changed: bool,
}

#[derive(Debug, Clone)]
pub struct LedgerStore {
    path: PathBuf,
    lock: LockOptions,
}

impl LedgerStore {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            lock: LockOptions::default(),
        }
    }

    pub fn with_lock_options(mut self, lock: LockOptions) -> Self {
        self.lock = lock;
        self
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    fn lock_path(&self) -> PathBuf {
        sibling(&self.path, "lock")
    }

    pub async fn exists(&self) -> bool {
        tokio::fs::try_exists(&self.path).await.unwrap_or(false)
    }

    /// Create an empty ledger (revision 0) if none exists. Returns true if created.
    pub async fn bootstrap(&self) -> Result<bool, LedgerError> {
        if let Some(parent) = self.path.parent() {
            if !parent.as_os_str().is_empty() {
                tokio::fs::create_dir_all(parent).await?;
            }
        }
        let _guard = lock::acquire(&self.lock_path(), self.lock).await?;
        if self.exists().await {
            return Ok(false);
        }
        self.write(&Ledger::new()).await?;
        tracing::info!(ledger = %self.path.display(), "bootstrapped empty ledger");
        Ok(true)
    }

    pub async fn load(&self) -> Result<Ledger, LedgerError> {
        let text = match tokio::fs::read_to_string(&self.path).await {
            Ok(text) => text,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                return Err(LedgerError::NotInitialized(self.path.clone()));
            }
            Err(e) => return Err(e.into()),
        };
        codec::decode(&self.path, &text)
    }

    /// Overwrite the ledger, refusing unless `ledger` is newer than the file.
    pub async fn save(&self, ledger: &Ledger) -> Result<(), LedgerError> {
        let _guard = lock::acquire(&self.lock_path(), self.lock).await?;
        match self.load().await {
            Ok(on_disk) if on_disk.revision >= ledger.revision => {
                return Err(LedgerError::WriteConflict {
                    on_disk: on_disk.revision,
                    ours: ledger.revision,
                });
            }
            Ok(_) | Err(LedgerError::NotInitialized(_)) => {}
            Err(e) => return Err(e),
        }
        self.write(ledger).await
    }

    /// Mutate under optimistic concurrency: `expected` must equal the task's
    /// current revision on disk.
    pub async fn apply_transition<T, F>(
        &self,
        task_id: &TaskId,
        expected: u64,
        mutation: F,
    ) -> Result<Applied<T>, LedgerError>
    where
        F: FnOnce(&mut Ledger) -> Result<T, LedgerError>,
    {
        self.mutate(|ledger| {
            let actual = ledger.task(task_id)?.revision;
            if actual != expected {
                return Err(LedgerError::StaleRevision {
                    task: task_id.clone(),
                    expected,
                    actual,
                });
            }
            mutation(ledger)
        })
        .await
    }

    /// Mutate without a revision check (own node record, inserts).
    pub async fn update<T, F>(&self, mutation: F) -> Result<Applied<T>, LedgerError>
    where
        F: FnOnce(&mut Ledger) -> Result<T, LedgerError>,
    {
        self.mutate(mutation).await
    }

    /// Mutate one node's record, creating it if missing.
    pub async fn update_node<F>(
        &self,
        node_id: &NodeId,
        now: chrono::DateTime<chrono::Utc>,
        f: F,
    ) -> Result<Applied<NodeRecord>, LedgerError>
    where
        F: FnOnce(&mut NodeRecord),
    {
        self.mutate(|ledger| {
            let record = ledger.node_entry(node_id, now);
            f(record);
            Ok(record.clone())
        })
        .await
    }

    /// Insert a task unless the id is already present (terminal tasks included).
    pub async fn insert_task(&self, task: Task) -> Result<Applied<bool>, LedgerError> {
        self.mutate(|ledger| Ok(ledger.insert_task(task))).await
    }

    /// Merge a pulled copy into the local ledger.
    pub async fn merge_remote(&self, remote: &Ledger) -> Result<Applied<()>, LedgerError> {
        let _guard = lock::acquire(&self.lock_path(), self.lock).await?;
        let local = self.load().await?;
        let merged = local.merge(remote);
        let changed = merged != local;
        if changed {
            self.write(&merged).await?;
            tracing::debug!(
                local = local.revision,
                remote = remote.revision,
                revision = merged.revision,
                "merged remote ledger"
            );
        }
        Ok(Applied {
            ledger: merged,
            output: (),
            changed,
        })
    }

    /// Replace the local ledger wholesale (operator re-sync after corruption).
    pub async fn replace(&self, ledger: &Ledger) -> Result<(), LedgerError> {
        ledger
            .validate()
            .map_err(|reason| LedgerError::corrupt(&self.path, reason))?;
        let _guard = lock::acquire(&self.lock_path(), self.lock).await?;
        self.write(ledger).await?;
        tracing::warn!(
            ledger = %self.path.display(),
            revision = ledger.revision,
            "local ledger replaced"
        );
        Ok(())
    }

    async fn mutate<T, F>(&self, mutation: F) -> Result<Applied<T>, LedgerError>
    where
        F: FnOnce(&mut Ledger) -> Result<T, LedgerError>,
    {
        let _guard = lock::acquire(&self.lock_path(), self.lock).await?;
        let before = self.load().await?;
        let mut ledger = before.clone();
        let output = mutation(&mut ledger)?;
        let changed = ledger.stamp_changes(&before, before.revision + 1);
        if changed {
            self.write(&ledger).await?;
        }
        Ok(Applied {
            ledger,
            output,
            changed,
        })
    }

    /// Temp file in the same directory, fsync, rename over the ledger.
    async fn write(&self, ledger: &Ledger) -> Result<(), LedgerError> {
        let text = codec::encode(ledger)?;
        let tmp = sibling(
            &self.path,
            &format!("tmp-{}-{}", std::process::id(), Ulid::new()),
        );
        let result = async {
            let mut file = tokio::fs::File::create(&tmp).await?;
            file.write_all(text.as_bytes()).await?;
            file.sync_all().await?;
            drop(file);
            tokio::fs::rename(&tmp, &self.path).await
        }
        .await;
        if let Err(e) = result {
            let _ = tokio::fs::remove_file(&tmp).await;
            return Err(e.into());
        }
        Ok(())
    }
}

/// `ledger.jsonl` -> `ledger.jsonl.<suffix>`
fn sibling(path: &Path, suffix: &str) -> PathBuf {
    let mut name = path.file_name().map(|n| n.to_os_string()).unwrap_or_default();
    name.push(".");
    name.push(suffix);
    path.with_file_name(name)
}
