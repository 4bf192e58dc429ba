//! NodeBuilder - 1 ノード分のワイヤリング
//!
//! # Fail-fast 設計
//! - build() 時に設定の整合性（lease > 0、dead timeout >= 2 × heartbeat 等）をチェック
//! - 不足・矛盾があれば BuildError を返す
//!
//! 指定されなかった依存はデフォルト（同期なし・システム時計・優先度スケジューラ・
//! ホストの計測・失敗 3 回で failed）で埋めます。

use std::path::PathBuf;
use std::sync::Arc;

use chrono::Duration;

use super::claim::ClaimProtocol;
use super::context::{NodeContext, NodeSettings};
use super::liveness::LivenessMonitor;
use super::machine::NodeMachine;
use super::runtime::NodeRuntime;
use super::status::SwarmStatus;
use super::sync::{SyncDriver, SyncOptions};
use super::worker_loop::WorkerLoop;
use crate::config::{SwarmConfig, SyncConfig};
use crate::domain::{Decider, DefaultDecider, LedgerError, NodeId};
use crate::impls::{
    CloudReplicator, GitReplicator, NoReplication, PeerReplicator, PriorityScheduler, SystemMeter,
};
use crate::ports::{Clock, Replicator, ResourceMeter, SchedulerPolicy, SystemClock};
use crate::store::LedgerStore;

#[derive(Debug, thiserror::Error)]
pub enum BuildError {
    #[error("node id is required")]
    MissingNodeId,

    #[error("ledger path is required")]
    MissingLedgerPath,

    #[error("invalid node settings: {0}")]
    InvalidSettings(String),
}

/// # 使用例
/// ```ignore
/// let node = NodeBuilder::from_config(&config, node_id, capabilities).build()?;
/// let runtime = node.spawn();
/// ```
pub struct NodeBuilder {
    node_id: Option<NodeId>,
    ledger_path: Option<PathBuf>,
    replicator: Option<Arc<dyn Replicator>>,
    clock: Option<Arc<dyn Clock>>,
    scheduler: Option<Arc<dyn SchedulerPolicy>>,
    meter: Option<Arc<dyn ResourceMeter>>,
    decider: Option<Arc<dyn Decider>>,
    settings: NodeSettings,
    sync_options: SyncOptions,
}

impl NodeBuilder {
    pub fn new() -> Self {
        Self {
            node_id: None,
            ledger_path: None,
            replicator: None,
            clock: None,
            scheduler: None,
            meter: None,
            decider: None,
            settings: NodeSettings::default(),
            sync_options: SyncOptions::default(),
        }
    }

    /// Everything a configured node needs; tests override pieces afterwards.
    pub fn from_config(config: &SwarmConfig, node_id: NodeId, detected: std::collections::BTreeSet<String>) -> Self {
        let ledger_path = config.ledger_path();
        let replicator = replicator_for(&config.sync, &ledger_path, &node_id);
        Self::new()
            .node_id(node_id)
            .ledger_path(ledger_path)
            .replicator(replicator)
            .meter(Arc::new(SystemMeter::new(config.data_dir.clone())))
            .decider(Arc::new(config.decider()))
            .settings(config.to_settings(detected))
            .sync_options(config.sync_options())
    }

    pub fn node_id(mut self, node_id: NodeId) -> Self {
        self.node_id = Some(node_id);
        self
    }

    pub fn ledger_path(mut self, path: impl Into<PathBuf>) -> Self {
        self.ledger_path = Some(path.into());
        self
    }

    pub fn replicator(mut self, replicator: Arc<dyn Replicator>) -> Self {
        self.replicator = Some(replicator);
        self
    }

    pub fn clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = Some(clock);
        self
    }

    pub fn scheduler(mut self, scheduler: Arc<dyn SchedulerPolicy>) -> Self {
        self.scheduler = Some(scheduler);
        self
    }

    pub fn meter(mut self, meter: Arc<dyn ResourceMeter>) -> Self {
        self.meter = Some(meter);
        self
    }

    pub fn decider(mut self, decider: Arc<dyn Decider>) -> Self {
        self.decider = Some(decider);
        self
    }

    pub fn settings(mut self, settings: NodeSettings) -> Self {
        self.settings = settings;
        self
    }

    pub fn sync_options(mut self, options: SyncOptions) -> Self {
        self.sync_options = options;
        self
    }

    pub fn build(self) -> Result<Node, BuildError> {
        let node_id = self.node_id.ok_or(BuildError::MissingNodeId)?;
        let ledger_path = self.ledger_path.ok_or(BuildError::MissingLedgerPath)?;
        validate(&self.settings, &self.sync_options)?;

        let clock = self.clock.unwrap_or_else(|| Arc::new(SystemClock));
        let replicator = self.replicator.unwrap_or_else(|| Arc::new(NoReplication));
        let scheduler = self
            .scheduler
            .unwrap_or_else(|| Arc::new(PriorityScheduler::new(clock.clone())));
        let meter = self.meter.unwrap_or_else(|| {
            let dir = ledger_path
                .parent()
                .map(PathBuf::from)
                .unwrap_or_else(|| PathBuf::from("."));
            Arc::new(SystemMeter::new(dir))
        });
        let decider = self
            .decider
            .unwrap_or_else(|| Arc::new(DefaultDecider::default_v1()));

        let sync = Arc::new(SyncDriver::new(replicator, self.sync_options));
        let ctx = NodeContext::new(
            node_id,
            LedgerStore::new(ledger_path),
            sync,
            clock,
            self.settings,
        );
        Ok(Node {
            machine: NodeMachine::new(ctx.clone(), decider),
            ctx,
            scheduler,
            meter,
        })
    }
}

impl Default for NodeBuilder {
    fn default() -> Self {
        Self::new()
    }
}

fn validate(settings: &NodeSettings, sync: &SyncOptions) -> Result<(), BuildError> {
    let invalid = |msg: String| Err(BuildError::InvalidSettings(msg));
    if settings.lease <= Duration::zero() {
        return invalid("lease must be positive".into());
    }
    let beat = settings
        .heartbeat_interval
        .max(settings.idle_heartbeat_interval);
    if beat.is_zero() || settings.poll_interval.is_zero() {
        return invalid("heartbeat and poll intervals must be positive".into());
    }
    let beat = Duration::from_std(beat).unwrap_or(Duration::MAX);
    if settings.dead_after < beat * 2 {
        return invalid(format!(
            "dead-node timeout {}s is shorter than two heartbeats ({}s)",
            settings.dead_after.num_seconds(),
            (beat * 2).num_seconds()
        ));
    }
    if settings.max_claim_attempts == 0 || sync.max_attempts == 0 {
        return invalid("retry attempts must be at least 1".into());
    }
    Ok(())
}

/// Pick the adapter for the configured sync method.
pub fn replicator_for(sync: &SyncConfig, ledger_path: &std::path::Path, node_id: &NodeId) -> Arc<dyn Replicator> {
    match sync {
        SyncConfig::None => Arc::new(NoReplication),
        SyncConfig::Git {
            repo_dir,
            remote,
            branch,
        } => Arc::new(GitReplicator::new(
            repo_dir.clone(),
            remote.clone(),
            branch.clone(),
            node_id.clone(),
        )),
        SyncConfig::Cloud { remote } => {
            let file_name = ledger_path
                .file_name()
                .map(|n| n.to_string_lossy().into_owned())
                .unwrap_or_else(|| "ledger.jsonl".to_string());
            Arc::new(CloudReplicator::new(remote.clone(), file_name))
        }
        SyncConfig::Peer { .. } => Arc::new(PeerReplicator::new()),
    }
}

/// A wired node: context, collaborator API and the pieces the loops need.
pub struct Node {
    ctx: NodeContext,
    machine: NodeMachine,
    scheduler: Arc<dyn SchedulerPolicy>,
    meter: Arc<dyn ResourceMeter>,
}

impl Node {
    pub fn context(&self) -> &NodeContext {
        &self.ctx
    }

    pub fn node_id(&self) -> &NodeId {
        &self.ctx.node_id
    }

    pub fn store(&self) -> &LedgerStore {
        &self.ctx.store
    }

    pub fn sync(&self) -> &SyncDriver {
        &self.ctx.sync
    }

    /// Stage callbacks for external collaborators.
    pub fn machine(&self) -> &NodeMachine {
        &self.machine
    }

    pub fn claims(&self) -> ClaimProtocol {
        ClaimProtocol::new(self.ctx.clone(), self.scheduler.clone(), self.meter.clone())
    }

    pub fn liveness(&self) -> LivenessMonitor {
        LivenessMonitor::new(self.ctx.clone(), self.meter.clone())
    }

    pub fn worker(&self) -> WorkerLoop {
        WorkerLoop::new(self.ctx.clone(), self.claims())
    }

    /// Create the local ledger if needed. Returns true when it was created.
    pub async fn bootstrap(&self) -> Result<bool, LedgerError> {
        self.ctx.store.bootstrap().await
    }

    pub async fn status(&self) -> Result<SwarmStatus, LedgerError> {
        let ledger = self.ctx.store.load().await?;
        Ok(SwarmStatus::from_ledger(
            &ledger,
            self.ctx.clock.now(),
            self.ctx.settings.dead_after,
        ))
    }

    /// Start the heartbeat and worker loops.
    pub fn spawn(&self) -> NodeRuntime {
        NodeRuntime::spawn(Arc::new(self.liveness()), Arc::new(self.worker()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::impls::RemoteFolder;

    fn builder() -> NodeBuilder {
        NodeBuilder::new()
            .node_id(NodeId::new("n1"))
            .ledger_path("ledger.jsonl")
    }

    #[test]
    fn build_with_defaults() {
        let node = builder().build().unwrap();
        assert_eq!(node.node_id(), &NodeId::new("n1"));
        assert_eq!(node.sync().kind(), "none");
    }

    #[test]
    fn build_requires_node_id() {
        let err = NodeBuilder::new().ledger_path("l.jsonl").build().err();
        assert!(matches!(err, Some(BuildError::MissingNodeId)));
    }

    #[test]
    fn build_rejects_short_dead_timeout() {
        let settings = NodeSettings {
            heartbeat_interval: std::time::Duration::from_secs(400),
            ..NodeSettings::default()
        };
        let err = builder().settings(settings).build().err();
        assert!(matches!(err, Some(BuildError::InvalidSettings(_))));
    }

    #[test]
    fn sync_method_selects_adapter() {
        let node = NodeId::new("n1");
        let path = std::path::Path::new("/data/ledger.jsonl");
        let cloud = SyncConfig::Cloud {
            remote: RemoteFolder::Rclone {
                remote: "gdrive:swarm".into(),
            },
        };
        assert_eq!(replicator_for(&SyncConfig::None, path, &node).kind(), "none");
        assert_eq!(replicator_for(&cloud, path, &node).kind(), "cloud");
        assert_eq!(
            replicator_for(&SyncConfig::Peer { folder: "/sync".into() }, path, &node).kind(),
            "peer"
        );
    }
}
