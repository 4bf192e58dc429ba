//! NodeRuntime - heartbeat と worker の 2 つのループを動かす
//!
//! 2 つは同じ `LedgerStore` を共有しますが、書き込みはロックファイル付きの
//! atomic replace なので、プロセス内ロックは持ちません。

use std::sync::Arc;

use tokio::sync::watch;
use tokio::task::JoinHandle;

use super::liveness::LivenessMonitor;
use super::worker_loop::WorkerLoop;

/// Running node handle.
/// - `request_shutdown()` で両ループに停止を通知
/// - `shutdown_and_join()` で停止を待つ（heartbeat は最後に offline を書く）
pub struct NodeRuntime {
    shutdown_tx: watch::Sender<bool>,
    worker: JoinHandle<()>,
    heartbeat: JoinHandle<()>,
}

impl NodeRuntime {
    pub fn spawn(liveness: Arc<LivenessMonitor>, worker: Arc<WorkerLoop>) -> Self {
        let (shutdown_tx, shutdown_rx) = watch::channel(false);

        let rx = shutdown_rx.clone();
        let heartbeat = tokio::spawn(async move {
            liveness.run(rx).await;
        });
        let worker = tokio::spawn(async move {
            worker.run(shutdown_rx).await;
        });

        Self {
            shutdown_tx,
            worker,
            heartbeat,
        }
    }

    /// Stop taking new claims. In-flight collaborator work is not interrupted.
    pub fn request_shutdown(&self) {
        // receivers may already be gone
        let _ = self.shutdown_tx.send(true);
    }

    pub fn is_finished(&self) -> bool {
        self.worker.is_finished() && self.heartbeat.is_finished()
    }

    pub async fn shutdown_and_join(self) {
        self.request_shutdown();
        if let Err(e) = self.worker.await {
            tracing::error!(error = %e, "worker loop panicked");
        }
        if let Err(e) = self.heartbeat.await {
            tracing::error!(error = %e, "heartbeat loop panicked");
        }
    }
}
