use std::collections::BTreeSet;
use std::fmt;

use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};

use super::ids::{NodeId, TaskId};

/// What a node last reported about itself.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum NodeStatus {
    #[default]
    Idle,
    Working,
    /// Task loop halted (corrupt local ledger); heartbeat still running.
    Degraded,
    /// Graceful shutdown.
    Offline,
}

impl NodeStatus {
    pub fn as_str(self) -> &'static str {
        match self {
            NodeStatus::Idle => "idle",
            NodeStatus::Working => "working",
            NodeStatus::Degraded => "degraded",
            NodeStatus::Offline => "offline",
        }
    }
}

impl fmt::Display for NodeStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Liveness and capability descriptor of one node.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NodeRecord {
    pub node_id: NodeId,
    pub last_heartbeat_at: DateTime<Utc>,
    #[serde(default)]
    pub capabilities: BTreeSet<String>,
    #[serde(default)]
    pub battery_level: Option<u8>,
    #[serde(default)]
    pub active_task_id: Option<TaskId>,
    #[serde(default)]
    pub status: NodeStatus,
    #[serde(default)]
    pub completed_tasks: u64,
    /// Edit counter of this record. Bumped by every local mutation and
    /// carried unchanged through merges, unlike `revision`.
    #[serde(default)]
    pub seq: u64,
    #[serde(default)]
    pub revision: u64,
}

impl NodeRecord {
    pub fn new(node_id: NodeId, now: DateTime<Utc>) -> Self {
        Self {
            node_id,
            last_heartbeat_at: now,
            capabilities: BTreeSet::new(),
            battery_level: None,
            active_task_id: None,
            status: NodeStatus::Idle,
            completed_tasks: 0,
            seq: 0,
            revision: 0,
        }
    }

    /// Alive = not offline and heard from within `dead_after`.
    pub fn is_alive(&self, now: DateTime<Utc>, dead_after: Duration) -> bool {
        self.status != NodeStatus::Offline && now - self.last_heartbeat_at <= dead_after
    }

    pub fn is_busy(&self) -> bool {
        self.active_task_id.is_some()
    }

    pub fn has_capabilities(&self, required: &BTreeSet<String>) -> bool {
        required.is_subset(&self.capabilities)
    }
}
