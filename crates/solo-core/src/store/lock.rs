//! Lock file beside the ledger.
//!
//! Serializes read-modify-write cycles between processes (the `solo` CLI and a
//! running node) and between the heartbeat and worker activities of one node.
//! A lock older than `stale_after` belongs to a crashed writer and is broken.

use std::path::{Path, PathBuf};
use std::time::{Duration, SystemTime};

use tokio::io::{AsyncWrite, AsyncWriteExt};
use ulid::Ulid;

use crate::domain::LedgerError;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LockOptions {
    pub stale_after: Duration,
    pub timeout: Duration,
    pub poll: Duration,
}

impl Default for LockOptions {
    fn default() -> Self {
        Self {
            stale_after: Duration::from_secs(30),
            timeout: Duration::from_secs(5),
            poll: Duration::from_millis(10),
        }
    }
}

/// Held lock. Removing the file on drop releases it.
#[derive(Debug)]
pub struct LockGuard {
    path: PathBuf,
}

impl Drop for LockGuard {
    fn drop(&mut self) {
        let _ = std::fs::remove_file(&self.path);
    }
}

pub async fn acquire(path: &Path, opts: LockOptions) -> Result<LockGuard, LedgerError> {
    let started = tokio::time::Instant::now();
    loop {
        match tokio::fs::OpenOptions::new()
            .write(true)
            .create_new(true)
            .open(path)
            .await
        {
            Ok(file) => {
                let guard = LockGuard {
                    path: path.to_path_buf(),
                };
                return write_owner(file, guard).await;
            }
            Err(e) if e.kind() == std::io::ErrorKind::AlreadyExists => {
                if is_stale(path, opts.stale_after).await {
                    tracing::warn!(lock = %path.display(), "breaking stale ledger lock");
                    let _ = tokio::fs::remove_file(path).await;
                    continue;
                }
            }
            Err(e) => return Err(e.into()),
        }
        if started.elapsed() >= opts.timeout {
            return Err(LedgerError::LockTimeout(path.to_path_buf()));
        }
        tokio::time::sleep(opts.poll).await;
    }
}

/// On failure the guard drops and the lock file goes with it.
async fn write_owner<W>(mut file: W, guard: LockGuard) -> Result<LockGuard, LedgerError>
where
    W: AsyncWrite + Unpin,
{
    let owner = format!("{} {}\n", std::process::id(), Ulid::new());
    file.write_all(owner.as_bytes()).await?;
    Ok(guard)
}

async fn is_stale(path: &Path, stale_after: Duration) -> bool {
    let Ok(meta) = tokio::fs::metadata(path).await else {
        return false;
    };
    let Ok(modified) = meta.modified() else {
        return false;
    };
    SystemTime::now()
        .duration_since(modified)
        .is_ok_and(|age| age > stale_after)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn quick() -> LockOptions {
        LockOptions {
            stale_after: Duration::from_secs(30),
            timeout: Duration::from_millis(50),
            poll: Duration::from_millis(5),
        }
    }

    #[tokio::test]
    async fn second_acquire_times_out_until_release() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("ledger.jsonl.lock");

        let guard = acquire(&path, quick()).await.unwrap();
        let err = acquire(&path, quick()).await.unwrap_err();
        assert!(matches!(err, LedgerError::LockTimeout(_)));

        drop(guard);
        assert!(!path.exists());
        let _again = acquire(&path, quick()).await.unwrap();
    }

    struct DiskFull;

    impl AsyncWrite for DiskFull {
        fn poll_write(
            self: std::pin::Pin<&mut Self>,
            _: &mut std::task::Context<'_>,
            _: &[u8],
        ) -> std::task::Poll<std::io::Result<usize>> {
            std::task::Poll::Ready(Err(std::io::Error::other("no space left on device")))
        }

        fn poll_flush(
            self: std::pin::Pin<&mut Self>,
            _: &mut std::task::Context<'_>,
        ) -> std::task::Poll<std::io::Result<()>> {
            std::task::Poll::Ready(Ok(()))
        }

        fn poll_shutdown(
            self: std::pin::Pin<&mut Self>,
            _: &mut std::task::Context<'_>,
        ) -> std::task::Poll<std::io::Result<()>> {
            std::task::Poll::Ready(Ok(()))
        }
    }

    #[tokio::test]
    async fn failed_owner_write_releases_the_lock() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("ledger.jsonl.lock");
        std::fs::write(&path, "").unwrap();

        let guard = LockGuard { path: path.clone() };
        assert!(write_owner(DiskFull, guard).await.is_err());
        assert!(!path.exists());
        let _guard = acquire(&path, quick()).await.unwrap();
    }

    #[tokio::test]
    async fn stale_lock_is_broken() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("ledger.jsonl.lock");
        std::fs::write(&path, "crashed").unwrap();

        let opts = LockOptions {
            stale_after: Duration::ZERO,
            ..quick()
        };
        tokio::time::sleep(Duration::from_millis(10)).await;
        let _guard = acquire(&path, opts).await.unwrap();
    }
}
