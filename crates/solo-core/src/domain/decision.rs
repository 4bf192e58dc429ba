//! Decision model: what to do after a stage failed.
//!
//! Collaborators report failures through the node state machine; the Decider
//! turns the task's failure count into either a retry (with backoff) or a
//! terminal `failed` stage.

use std::time::Duration;

use super::retry::RetryPolicy;
use super::task::Task;

/// The next action to take for a task after a failure.
#[derive(Debug, Clone, PartialEq)]
pub enum Decision {
    /// Retry the current stage after a delay.
    Retry { delay: Duration, reason: String },

    /// Give up: the task moves to `failed`.
    MarkFailed { reason: String },
}

impl Decision {
    pub fn reason(&self) -> &str {
        match self {
            Decision::Retry { reason, .. } | Decision::MarkFailed { reason } => reason,
        }
    }
}

/// Deciders are pure: given the task (with its failure count already
/// incremented) and the failure reason, they return the next action.
pub trait Decider: Send + Sync {
    fn decide(&self, task: &Task, failure: &str) -> Decision;
}

/// Failure-count budget with exponential backoff.
#[derive(Debug, Clone)]
pub struct DefaultDecider {
    retry_policy: RetryPolicy,
    max_failures: u32,
}

impl DefaultDecider {
    pub fn new(retry_policy: RetryPolicy, max_failures: u32) -> Self {
        Self {
            retry_policy,
            max_failures: max_failures.max(1),
        }
    }

    /// 2s base, 2.0 multiplier, three failures per stage.
    pub fn default_v1() -> Self {
        Self::new(RetryPolicy::default_v1(), 3)
    }

    pub fn max_failures(&self) -> u32 {
        self.max_failures
    }
}

impl Decider for DefaultDecider {
    fn decide(&self, task: &Task, failure: &str) -> Decision {
        if task.failures >= self.max_failures {
            Decision::MarkFailed {
                reason: format!(
                    "{failure} (max failures reached at {}: {}/{})",
                    task.stage, task.failures, self.max_failures
                ),
            }
        } else {
            let delay = self.retry_policy.next_delay(task.failures);
            Decision::Retry {
                delay,
                reason: format!(
                    "retry {}/{} of {} after {:?}",
                    task.failures + 1,
                    self.max_failures,
                    task.stage,
                    delay
                ),
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::ids::{NodeId, TaskId};
    use crate::domain::stage::Stage;
    use crate::domain::task::Source;
    use chrono::Utc;

    fn task_with_failures(failures: u32) -> Task {
        let mut task = Task::discovered(
            TaskId::new("t-1"),
            Source::new("github", "a/b#1"),
            NodeId::new("n1"),
            Utc::now(),
        );
        task.stage = Stage::Generating;
        task.failures = failures;
        task
    }

    #[test]
    fn retries_until_budget_then_fails() {
        let decider = DefaultDecider::default_v1();

        match decider.decide(&task_with_failures(1), "timeout") {
            Decision::Retry { delay, .. } => assert_eq!(delay, Duration::from_secs(2)),
            other => panic!("expected retry, got {other:?}"),
        }
        match decider.decide(&task_with_failures(2), "timeout") {
            Decision::Retry { delay, .. } => assert_eq!(delay, Duration::from_secs(4)),
            other => panic!("expected retry, got {other:?}"),
        }

        let decision = decider.decide(&task_with_failures(3), "timeout");
        assert!(matches!(decision, Decision::MarkFailed { .. }));
        assert!(decision.reason().contains("generating"));
    }
}
