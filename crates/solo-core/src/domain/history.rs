//! Task history: the append-only audit trail.
//!
//! Every stage transition, claim, reclaim and failure leaves an entry, so a task
//! that ended up abandoned or failed can always be explained after the fact.
//! Replicas merge histories as a union, so entries written on a losing branch of
//! a conflict are kept for audit even though their state change was discarded.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use super::ids::NodeId;
use super::stage::Stage;
use super::task::ClaimStamp;

/// What happened.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "event", rename_all = "snake_case")]
pub enum HistoryEvent {
    Discovered,

    Transition {
        from: Stage,
        to: Stage,
    },

    Claimed {
        lease_expires_at: DateTime<Utc>,
    },

    /// The owner saw its claim survive a push and a pull.
    Confirmed,

    /// The owner handed the task back to the queue.
    Released,

    /// A live node returned a dead owner's task to the queue.
    Reclaimed {
        abandoned_by: NodeId,
        claim: Option<ClaimStamp>,
    },

    /// Recorded by the losing node after arbitration picked another claim.
    ClaimLost {
        winner: Option<NodeId>,
    },

    Failure {
        stage: Stage,
        reason: String,
        failures: u32,
    },

    Abandoned {
        reason: String,
    },

    Cancelled {
        reason: String,
    },

    Failed {
        reason: String,
    },
}

impl HistoryEvent {
    fn sort_tag(&self) -> String {
        serde_json::to_string(self).unwrap_or_default()
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct HistoryEntry {
    pub at: DateTime<Utc>,
    pub node: NodeId,
    #[serde(flatten)]
    pub event: HistoryEvent,
}

impl HistoryEntry {
    pub fn new(at: DateTime<Utc>, node: NodeId, event: HistoryEvent) -> Self {
        Self { at, node, event }
    }

    fn stamp(&self) -> ClaimStamp {
        ClaimStamp {
            at: self.at,
            node: self.node.clone(),
        }
    }
}

/// Union of two histories, ordered by (time, node, event).
///
/// Racing reclaims of the same abandoned claim collapse to a single entry: the
/// one written by `winner` when it is among them, otherwise the latest.
pub fn merge_histories(
    ours: &[HistoryEntry],
    theirs: &[HistoryEntry],
    winner: Option<&ClaimStamp>,
) -> Vec<HistoryEntry> {
    let mut merged: Vec<HistoryEntry> = ours.iter().chain(theirs.iter()).cloned().collect();
    merged.sort_by(|a, b| {
        a.at.cmp(&b.at)
            .then_with(|| a.node.cmp(&b.node))
            .then_with(|| a.event.sort_tag().cmp(&b.event.sort_tag()))
    });
    merged.dedup();

    let mut keep = vec![true; merged.len()];
    for i in 0..merged.len() {
        let HistoryEvent::Reclaimed {
            abandoned_by,
            claim,
        } = &merged[i].event
        else {
            continue;
        };
        for j in (i + 1)..merged.len() {
            let same_claim = matches!(
                &merged[j].event,
                HistoryEvent::Reclaimed { abandoned_by: b, claim: c } if b == abandoned_by && c == claim
            );
            if !same_claim || !keep[i] || !keep[j] {
                continue;
            }
            let i_wins = winner == Some(&merged[i].stamp());
            // j is later in the ordering, so it wins unless i is the arbitration winner
            if i_wins {
                keep[j] = false;
            } else {
                keep[i] = false;
            }
        }
    }

    merged
        .into_iter()
        .zip(keep)
        .filter_map(|(entry, keep)| keep.then_some(entry))
        .collect()
}
