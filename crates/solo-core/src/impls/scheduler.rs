//! Priority scheduling and the heuristic issue scorer.

use std::cmp::Ordering;
use std::sync::Arc;

use serde::{Deserialize, Serialize};

use crate::domain::{Ledger, NodeRecord, Task, TaskId};
use crate::ports::{Clock, SchedulerPolicy};

/// Highest score first; ties go to the task discovered earliest, then to the
/// smallest id. Only queued tasks without a live claim whose requirements the
/// node covers are considered.
pub struct PriorityScheduler {
    clock: Arc<dyn Clock>,
}

impl PriorityScheduler {
    pub fn new(clock: Arc<dyn Clock>) -> Self {
        Self { clock }
    }
}

impl SchedulerPolicy for PriorityScheduler {
    fn next_candidate(&self, ledger: &Ledger, node: &NodeRecord) -> Option<TaskId> {
        let now = self.clock.now();
        ledger
            .tasks
            .values()
            .filter(|t| t.is_claimable(now) && node.has_capabilities(&t.requires))
            .max_by(|a, b| priority(a, b))
            .map(|t| t.id.clone())
    }
}

fn priority(a: &Task, b: &Task) -> Ordering {
    a.score
        .total_cmp(&b.score)
        .then_with(|| b.discovered_at.cmp(&a.discovered_at))
        .then_with(|| b.id.cmp(&a.id))
}

/// Issue metadata the scorer looks at.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct IssueFacts {
    pub title: String,
    pub body: String,
    pub comments: u32,
}

/// Initial priority for a discovered issue.
#[derive(Debug, Clone, Copy, Default)]
pub struct HeuristicScorer;

impl HeuristicScorer {
    const SEVERE: [&'static str; 4] = ["critical", "crash", "fail", "leak"];

    pub fn score(&self, facts: &IssueFacts) -> f64 {
        let title = facts.title.to_lowercase();
        let body = facts.body.to_lowercase();
        let mut score = 0.0;
        if facts.comments > 5 {
            score += 20.0;
        }
        if Self::SEVERE.iter().any(|w| title.contains(w)) {
            score += 30.0;
        }
        if body.contains("reproduc") || body.contains("steps") {
            score += 10.0;
        }
        if body.chars().count() > 500 {
            score += 10.0;
        }
        score
    }
}
