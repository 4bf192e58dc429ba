//! Ledger file codec (JSON Lines).
//!
//! ```text
//! {"format":"solo-ledger","version":1,"revision":9}
//! {"task":{"id":"github-acme-widgets-42",...}}
//! {"node":{"node_id":"node-3fa94c01b2de",...}}
//! ```
//!
//! One record per line, tasks then nodes, each sorted by id, so two replicas
//! that touched different records produce non-overlapping line diffs.

use std::path::Path;

use serde::{Deserialize, Serialize};

use crate::domain::{Ledger, LedgerError, NodeRecord, Task};

pub const FORMAT: &str = "solo-ledger";
pub const VERSION: u32 = 1;

#[derive(Debug, Serialize, Deserialize)]
struct Header {
    format: String,
    version: u32,
    revision: u64,
}

#[derive(Debug, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
enum Line {
    Task(Box<Task>),
    Node(NodeRecord),
}

pub fn encode(ledger: &Ledger) -> Result<String, LedgerError> {
    let mut out = serde_json::to_string(&Header {
        format: FORMAT.to_string(),
        version: VERSION,
        revision: ledger.revision,
    })?;
    out.push('\n');
    for task in ledger.tasks.values() {
        out.push_str(&serde_json::to_string(&Line::Task(Box::new(task.clone())))?);
        out.push('\n');
    }
    for node in ledger.nodes.values() {
        out.push_str(&serde_json::to_string(&Line::Node(node.clone()))?);
        out.push('\n');
    }
    Ok(out)
}

/// Parse and validate. `path` only labels the error.
pub fn decode(path: &Path, text: &str) -> Result<Ledger, LedgerError> {
    let mut lines = text
        .lines()
        .enumerate()
        .map(|(i, line)| (i + 1, line))
        .filter(|(_, line)| !line.trim().is_empty());

    let Some((no, first)) = lines.next() else {
        return Err(LedgerError::corrupt(path, "empty ledger file"));
    };
    let header: Header = serde_json::from_str(first)
        .map_err(|e| LedgerError::corrupt(path, format!("line {no}: bad header: {e}")))?;
    if header.format != FORMAT {
        return Err(LedgerError::corrupt(
            path,
            format!("line {no}: unknown format {:?}", header.format),
        ));
    }
    if header.version != VERSION {
        return Err(LedgerError::corrupt(
            path,
            format!("line {no}: unsupported version {}", header.version),
        ));
    }

    let mut ledger = Ledger {
        revision: header.revision,
        ..Ledger::default()
    };
    for (no, line) in lines {
        let parsed: Line = serde_json::from_str(line)
            .map_err(|e| LedgerError::corrupt(path, format!("line {no}: {e}")))?;
        match parsed {
            Line::Task(task) => {
                let id = task.id.clone();
                if ledger.tasks.insert(id.clone(), *task).is_some() {
                    return Err(LedgerError::corrupt(
                        path,
                        format!("line {no}: duplicate task {id}"),
                    ));
                }
            }
            Line::Node(node) => {
                let id = node.node_id.clone();
                if ledger.nodes.insert(id.clone(), node).is_some() {
                    return Err(LedgerError::corrupt(
                        path,
                        format!("line {no}: duplicate node {id}"),
                    ));
                }
            }
        }
    }

    ledger
        .validate()
        .map_err(|reason| LedgerError::corrupt(path, reason))?;
    Ok(ledger)
}
