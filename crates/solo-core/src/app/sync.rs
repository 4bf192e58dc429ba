//! SyncDriver - レプリケーションの再試行とエスカレーション
//!
//! # フロー
//! - pull: `NetworkUnavailable` / `MergeConflict` はバックオフ付きで再試行
//! - push: `RejectedNonFastForward` / `MergeConflict` なら pull してから再試行、
//!   `NetworkUnavailable` はバックオフ付きで再試行
//! - 連続失敗が `warn_after` 回に達するまでは debug、それ以降は warn でログ
//!
//! 上限まで失敗した場合はエラーを返します。呼び出し側（worker / heartbeat）は
//! `NetworkUnavailable` ならオフラインのまま作業を続けます。

use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;

use crate::domain::{ErrorKind, LedgerError, RetryPolicy};
use crate::ports::{PullReport, PushReport, Replicator};
use crate::store::LedgerStore;

#[derive(Debug, Clone, PartialEq)]
pub struct SyncOptions {
    pub max_attempts: u32,
    pub retry: RetryPolicy,
    /// Consecutive failures before logging at warn.
    pub warn_after: u32,
}

impl Default for SyncOptions {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            retry: RetryPolicy::default_v1().with_jitter(0.2),
            warn_after: 3,
        }
    }
}

pub struct SyncDriver {
    replicator: Arc<dyn Replicator>,
    options: SyncOptions,
    consecutive_failures: AtomicU32,
}

impl SyncDriver {
    pub fn new(replicator: Arc<dyn Replicator>, options: SyncOptions) -> Self {
        Self {
            replicator,
            options,
            consecutive_failures: AtomicU32::new(0),
        }
    }

    pub fn kind(&self) -> &'static str {
        self.replicator.kind()
    }

    pub fn consecutive_failures(&self) -> u32 {
        self.consecutive_failures.load(Ordering::SeqCst)
    }

    pub async fn pull(&self, store: &LedgerStore) -> Result<PullReport, LedgerError> {
        let mut attempt = 0;
        loop {
            attempt += 1;
            match self.replicator.pull(store).await {
                Ok(report) => {
                    self.succeeded();
                    return Ok(report);
                }
                Err(e) if retryable(&e) && attempt < self.options.max_attempts => {
                    self.failed("pull", attempt, &e);
                    self.backoff(attempt).await;
                }
                Err(e) => {
                    self.failed("pull", attempt, &e);
                    return Err(e);
                }
            }
        }
    }

    pub async fn push(&self, store: &LedgerStore) -> Result<PushReport, LedgerError> {
        let mut attempt = 0;
        loop {
            attempt += 1;
            match self.replicator.push(store).await {
                Ok(report) => {
                    self.succeeded();
                    return Ok(report);
                }
                Err(e) if retryable(&e) && attempt < self.options.max_attempts => {
                    self.failed("push", attempt, &e);
                    if e.needs_pull() {
                        // a newer remote must be merged before our commit can fast-forward
                        if let Err(pull_err) = self.replicator.pull(store).await {
                            self.failed("pull", attempt, &pull_err);
                            self.backoff(attempt).await;
                        }
                    } else {
                        self.backoff(attempt).await;
                    }
                }
                Err(e) => {
                    self.failed("push", attempt, &e);
                    return Err(e);
                }
            }
        }
    }

    /// Pull, then push.
    pub async fn sync(&self, store: &LedgerStore) -> Result<(PullReport, PushReport), LedgerError> {
        let pulled = self.pull(store).await?;
        let pushed = self.push(store).await?;
        Ok((pulled, pushed))
    }

    fn succeeded(&self) {
        let before = self.consecutive_failures.swap(0, Ordering::SeqCst);
        if before >= self.options.warn_after {
            tracing::info!(
                via = self.replicator.kind(),
                failures = before,
                "replication recovered"
            );
        }
    }

    fn failed(&self, op: &str, attempt: u32, err: &LedgerError) {
        let failures = self.consecutive_failures.fetch_add(1, Ordering::SeqCst) + 1;
        if failures >= self.options.warn_after {
            tracing::warn!(via = self.replicator.kind(), op, attempt, failures, error = %err, "replication failing");
        } else {
            tracing::debug!(via = self.replicator.kind(), op, attempt, failures, error = %err, "replication attempt failed");
        }
    }

    async fn backoff(&self, attempt: u32) {
        tokio::time::sleep(self.options.retry.next_delay_jittered(attempt)).await;
    }
}

fn retryable(err: &LedgerError) -> bool {
    matches!(err.kind(), ErrorKind::Transient | ErrorKind::Infrastructure)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::VecDeque;
    use std::sync::Mutex;
    use std::time::Duration;

    use async_trait::async_trait;

    /// Replays scripted results, counting calls.
    #[derive(Default)]
    struct Scripted {
        pulls: Mutex<VecDeque<Result<PullReport, LedgerError>>>,
        pushes: Mutex<VecDeque<Result<PushReport, LedgerError>>>,
        pull_calls: AtomicU32,
        push_calls: AtomicU32,
    }

    #[async_trait]
    impl Replicator for Scripted {
        fn kind(&self) -> &'static str {
            "scripted"
        }

        async fn pull(&self, _store: &LedgerStore) -> Result<PullReport, LedgerError> {
            self.pull_calls.fetch_add(1, Ordering::SeqCst);
            self.pulls
                .lock()
                .unwrap()
                .pop_front()
                .unwrap_or(Ok(PullReport::default()))
        }

        async fn push(&self, _store: &LedgerStore) -> Result<PushReport, LedgerError> {
            self.push_calls.fetch_add(1, Ordering::SeqCst);
            self.pushes
                .lock()
                .unwrap()
                .pop_front()
                .unwrap_or(Ok(PushReport::default()))
        }
    }

    fn fast() -> SyncOptions {
        SyncOptions {
            max_attempts: 3,
            retry: RetryPolicy::new(Duration::from_millis(1), 1.0),
            warn_after: 2,
        }
    }

    #[tokio::test]
    async fn rejected_push_pulls_then_retries() {
        let scripted = Arc::new(Scripted::default());
        scripted
            .pushes
            .lock()
            .unwrap()
            .push_back(Err(LedgerError::RejectedNonFastForward("behind".into())));
        let driver = SyncDriver::new(scripted.clone(), fast());
        let store = LedgerStore::new("unused.jsonl");

        driver.push(&store).await.unwrap();
        assert_eq!(scripted.push_calls.load(Ordering::SeqCst), 2);
        assert_eq!(scripted.pull_calls.load(Ordering::SeqCst), 1);
        assert_eq!(driver.consecutive_failures(), 0);
    }

    #[tokio::test]
    async fn network_failures_are_bounded() {
        let scripted = Arc::new(Scripted::default());
        for _ in 0..5 {
            scripted
                .pulls
                .lock()
                .unwrap()
                .push_back(Err(LedgerError::NetworkUnavailable("down".into())));
        }
        let driver = SyncDriver::new(scripted.clone(), fast());
        let store = LedgerStore::new("unused.jsonl");

        let err = driver.pull(&store).await.unwrap_err();
        assert!(matches!(err, LedgerError::NetworkUnavailable(_)));
        assert_eq!(scripted.pull_calls.load(Ordering::SeqCst), 3);
        assert_eq!(driver.consecutive_failures(), 3);
    }

    #[tokio::test]
    async fn permanent_errors_are_not_retried() {
        let scripted = Arc::new(Scripted::default());
        scripted
            .pulls
            .lock()
            .unwrap()
            .push_back(Err(LedgerError::corrupt("x", "bad")));
        let driver = SyncDriver::new(scripted.clone(), fast());
        let store = LedgerStore::new("unused.jsonl");

        assert!(driver.pull(&store).await.is_err());
        assert_eq!(scripted.pull_calls.load(Ordering::SeqCst), 1);
    }
}
