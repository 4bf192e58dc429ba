//! Status - swarm 全体の健康状態
//!
//! ledger を読むだけのビューです。CLI の `status` と heartbeat のログで使います。

use std::collections::BTreeMap;

use chrono::{DateTime, Duration, Utc};
use serde::Serialize;

use crate::domain::{Ledger, NodeId, NodeStatus, Stage, TaskId};

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct NodeSummary {
    pub node_id: NodeId,
    pub status: NodeStatus,
    pub alive: bool,
    pub last_heartbeat_at: DateTime<Utc>,
    pub active_task_id: Option<TaskId>,
    pub battery_level: Option<u8>,
    pub completed_tasks: u64,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct SwarmStatus {
    pub revision: u64,
    pub total_nodes: usize,
    pub alive_nodes: usize,
    /// Task count per stage, keyed by stage name.
    pub stages: BTreeMap<String, usize>,
    /// Tasks in an owner-held stage with a live lease.
    pub active_claims: usize,
    /// alive / total nodes (0 with no nodes).
    pub node_health: f64,
    /// terminal / total tasks (0 with no tasks).
    pub task_progress: f64,
    pub nodes: Vec<NodeSummary>,
}

impl SwarmStatus {
    pub fn from_ledger(ledger: &Ledger, now: DateTime<Utc>, dead_after: Duration) -> Self {
        let nodes: Vec<NodeSummary> = ledger
            .nodes
            .values()
            .map(|n| NodeSummary {
                node_id: n.node_id.clone(),
                status: n.status,
                alive: n.is_alive(now, dead_after),
                last_heartbeat_at: n.last_heartbeat_at,
                active_task_id: n.active_task_id.clone(),
                battery_level: n.battery_level,
                completed_tasks: n.completed_tasks,
            })
            .collect();
        let alive_nodes = nodes.iter().filter(|n| n.alive).count();

        let counts = ledger.stage_counts();
        let stages = Stage::all()
            .iter()
            .map(|s| (s.as_str().to_string(), counts.get(s).copied().unwrap_or(0)))
            .collect();
        let active_claims = ledger
            .tasks
            .values()
            .filter(|t| t.stage.requires_owner() && t.has_live_claim(now))
            .count();
        let finished = ledger
            .tasks
            .values()
            .filter(|t| t.stage.is_terminal())
            .count();

        Self {
            revision: ledger.revision,
            total_nodes: nodes.len(),
            alive_nodes,
            stages,
            active_claims,
            node_health: ratio(alive_nodes, nodes.len()),
            task_progress: ratio(finished, ledger.tasks.len()),
            nodes,
        }
    }
}

fn ratio(part: usize, whole: usize) -> f64 {
    if whole == 0 {
        0.0
    } else {
        part as f64 / whole as f64
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::{NodeRecord, Source, Task};
    use chrono::TimeZone;

    #[test]
    fn empty_ledger_reports_zero_ratios() {
        let status = SwarmStatus::from_ledger(&Ledger::new(), Utc::now(), Duration::seconds(600));
        assert_eq!(status.total_nodes, 0);
        assert_eq!(status.node_health, 0.0);
        assert_eq!(status.task_progress, 0.0);
        assert_eq!(status.stages["queued"], 0);
    }

    #[test]
    fn counts_alive_nodes_claims_and_progress() {
        let t0 = Utc.timestamp_opt(1_700_000_000, 0).unwrap();
        let now = t0 + Duration::seconds(700);
        let mut ledger = Ledger::new();
        ledger.nodes.insert(NodeId::new("n1"), NodeRecord::new(NodeId::new("n1"), now));
        ledger.nodes.insert(NodeId::new("n2"), NodeRecord::new(NodeId::new("n2"), t0));

        for (id, stage) in [("t-1", Stage::Queued), ("t-2", Stage::Archived), ("t-3", Stage::Queued)] {
            let mut task = Task::discovered(TaskId::new(id), Source::new("github", id), NodeId::new("n1"), t0);
            task.stage = stage;
            ledger.tasks.insert(task.id.clone(), task);
        }
        ledger
            .claim(&TaskId::new("t-3"), &NodeId::new("n1"), now, Duration::seconds(600))
            .unwrap();

        let status = SwarmStatus::from_ledger(&ledger, now, Duration::seconds(600));
        assert_eq!(status.alive_nodes, 1);
        assert_eq!(status.node_health, 0.5);
        assert_eq!(status.active_claims, 1);
        assert_eq!(status.stages["claimed"], 1);
        assert!((status.task_progress - 1.0 / 3.0).abs() < 1e-9);
    }
}
