use std::collections::{BTreeMap, BTreeSet};
use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use super::history::{HistoryEntry, HistoryEvent};
use super::ids::{NodeId, TaskId};
use super::stage::Stage;

/// Where a task came from: the origin system and a locator inside it.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Source {
    pub system: String,
    pub locator: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub title: Option<String>,
}

impl Source {
    pub fn new(system: impl Into<String>, locator: impl Into<String>) -> Self {
        Self {
            system: system.into(),
            locator: locator.into(),
            title: None,
        }
    }

    pub fn with_title(mut self, title: impl Into<String>) -> Self {
        self.title = Some(title.into());
        self
    }
}

/// Opaque reference to a stage artifact (a spec path, a repository URL, ...).
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ArtifactRef(String);

impl ArtifactRef {
    pub fn new(s: impl Into<String>) -> Self {
        Self(s.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for ArtifactRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.0.fmt(f)
    }
}

/// Last ownership change of a task: `(at, node)`.
///
/// Compared field by field, so the later change wins and the node id breaks
/// exact ties. This is the arbitration key between replicas.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct ClaimStamp {
    pub at: DateTime<Utc>,
    pub node: NodeId,
}

impl ClaimStamp {
    pub fn new(at: DateTime<Utc>, node: NodeId) -> Self {
        Self { at, node }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Task {
    pub id: TaskId,
    pub source: Source,
    #[serde(default)]
    pub score: f64,
    pub stage: Stage,
    #[serde(default)]
    pub owner_node_id: Option<NodeId>,
    #[serde(default)]
    pub claimed_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub lease_expires_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub claim_stamp: Option<ClaimStamp>,
    #[serde(default)]
    pub claim_confirmed_at: Option<DateTime<Utc>>,
    /// Capability tags a node must offer to be scheduled this task.
    #[serde(default)]
    pub requires: BTreeSet<String>,
    /// Failures at the current stage since the last successful transition.
    #[serde(default)]
    pub failures: u32,
    /// Ledger revision at which this record last changed.
    #[serde(default)]
    pub revision: u64,
    pub discovered_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    #[serde(default)]
    pub updated_by: Option<NodeId>,
    #[serde(default)]
    pub history: Vec<HistoryEntry>,
    #[serde(default)]
    pub artifacts: BTreeMap<Stage, ArtifactRef>,
}

impl Task {
    /// A freshly discovered task, not yet scored or queued.
    pub fn discovered(id: TaskId, source: Source, by: NodeId, now: DateTime<Utc>) -> Self {
        Self {
            id,
            source,
            score: 0.0,
            stage: Stage::Discovered,
            owner_node_id: None,
            claimed_at: None,
            lease_expires_at: None,
            claim_stamp: None,
            claim_confirmed_at: None,
            requires: BTreeSet::new(),
            failures: 0,
            revision: 0,
            discovered_at: now,
            updated_at: now,
            updated_by: Some(by.clone()),
            history: vec![HistoryEntry::new(now, by, HistoryEvent::Discovered)],
            artifacts: BTreeMap::new(),
        }
    }

    /// Owner set and lease still in the future.
    pub fn has_live_claim(&self, now: DateTime<Utc>) -> bool {
        self.owner_node_id.is_some() && self.lease_expires_at.is_some_and(|l| l > now)
    }

    pub fn lease_expired(&self, now: DateTime<Utc>) -> bool {
        self.lease_expires_at.is_none_or(|l| l <= now)
    }

    pub fn is_claimable(&self, now: DateTime<Utc>) -> bool {
        self.stage == Stage::Queued && !self.has_live_claim(now)
    }

    pub fn is_owned_by(&self, node: &NodeId) -> bool {
        self.owner_node_id.as_ref() == Some(node)
    }

    pub fn is_confirmed(&self) -> bool {
        self.claim_confirmed_at.is_some()
    }

    pub fn record(&mut self, at: DateTime<Utc>, node: &NodeId, event: HistoryEvent) {
        self.history.push(HistoryEntry::new(at, node.clone(), event));
        self.touch(at, node);
    }

    pub fn touch(&mut self, at: DateTime<Utc>, node: &NodeId) {
        self.updated_at = at;
        self.updated_by = Some(node.clone());
    }

    /// Drop ownership and lease. Stage is left to the caller.
    pub fn clear_claim(&mut self) {
        self.owner_node_id = None;
        self.claimed_at = None;
        self.lease_expires_at = None;
        self.claim_confirmed_at = None;
    }

    /// Canonical text used as the last tie-break between equal replicas.
    pub fn canonical(&self) -> String {
        serde_json::to_string(self).unwrap_or_default()
    }
}
