//! Task stage machine.

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

/// Stage of a task in the processing pipeline.
///
/// Forward pipeline:
/// - Discovered -> Scoring -> Queued -> Claimed -> Prompting -> AwaitingSpec
///   -> Generating -> Validating -> Publishing -> Archived
///
/// Alternate terminals:
/// - Abandoned (claim lost, resource exhaustion, explicit cancel)
/// - Failed (unrecoverable error, retry budget exhausted)
///
/// `Idle` is never stored on a task; it is what a node reports while it has no
/// active task.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Stage {
    Idle,
    Discovered,
    Scoring,
    Queued,
    Claimed,
    Prompting,
    AwaitingSpec,
    Generating,
    Validating,
    Publishing,
    Archived,
    Abandoned,
    Failed,
}

impl Stage {
    /// The forward pipeline, in order.
    pub const PIPELINE: [Stage; 11] = [
        Stage::Idle,
        Stage::Discovered,
        Stage::Scoring,
        Stage::Queued,
        Stage::Claimed,
        Stage::Prompting,
        Stage::AwaitingSpec,
        Stage::Generating,
        Stage::Validating,
        Stage::Publishing,
        Stage::Archived,
    ];

    /// Is this a terminal stage (no further transitions)?
    pub fn is_terminal(self) -> bool {
        matches!(self, Stage::Archived | Stage::Abandoned | Stage::Failed)
    }

    /// Stages during which a task must have an owner.
    pub fn requires_owner(self) -> bool {
        matches!(
            self,
            Stage::Claimed
                | Stage::Prompting
                | Stage::AwaitingSpec
                | Stage::Generating
                | Stage::Validating
                | Stage::Publishing
        )
    }

    /// Successor in the forward pipeline.
    pub fn next(self) -> Option<Stage> {
        let idx = Self::PIPELINE.iter().position(|s| *s == self)?;
        Self::PIPELINE.get(idx + 1).copied()
    }

    pub fn can_advance_to(self, to: Stage) -> bool {
        self.next() == Some(to)
    }

    /// Progress used when two replicas of the same claim disagree.
    /// Terminal stages outrank everything.
    pub fn progress_rank(self) -> u8 {
        if self.is_terminal() {
            return u8::MAX;
        }
        Self::PIPELINE
            .iter()
            .position(|s| *s == self)
            .map(|p| p as u8)
            .unwrap_or(0)
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Stage::Idle => "idle",
            Stage::Discovered => "discovered",
            Stage::Scoring => "scoring",
            Stage::Queued => "queued",
            Stage::Claimed => "claimed",
            Stage::Prompting => "prompting",
            Stage::AwaitingSpec => "awaiting_spec",
            Stage::Generating => "generating",
            Stage::Validating => "validating",
            Stage::Publishing => "publishing",
            Stage::Archived => "archived",
            Stage::Abandoned => "abandoned",
            Stage::Failed => "failed",
        }
    }

    pub fn all() -> [Stage; 13] {
        [
            Stage::Idle,
            Stage::Discovered,
            Stage::Scoring,
            Stage::Queued,
            Stage::Claimed,
            Stage::Prompting,
            Stage::AwaitingSpec,
            Stage::Generating,
            Stage::Validating,
            Stage::Publishing,
            Stage::Archived,
            Stage::Abandoned,
            Stage::Failed,
        ]
    }
}

impl fmt::Display for Stage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("unknown stage: {0:?}")]
pub struct ParseStageError(pub String);

impl FromStr for Stage {
    type Err = ParseStageError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let wanted = s.trim().to_ascii_lowercase().replace('-', "_");
        Stage::all()
            .into_iter()
            .find(|stage| stage.as_str() == wanted)
            .ok_or_else(|| ParseStageError(s.to_string()))
    }
}
