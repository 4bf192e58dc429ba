//! Multi-node scenarios: several nodes, one fixed clock, either one shared
//! ledger file or one ledger per node replicated through an in-memory remote.

use std::collections::BTreeSet;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration as StdDuration;

use chrono::{DateTime, Duration, TimeZone, Utc};
use tempfile::TempDir;

use super::*;
use crate::domain::{
    ArtifactRef, Decision, HistoryEvent, Ledger, LedgerError, NodeId, RetryPolicy, Source, Stage,
    Task, TaskId,
};
use crate::impls::{IssueFacts, MemoryReplicator, NoReplication, SharedRemote, StaticMeter};
use crate::ports::{Clock, FixedClock, Replicator, ResourceSample};

fn t0() -> DateTime<Utc> {
    Utc.timestamp_opt(1_700_000_000, 0).unwrap()
}

fn n(id: &str) -> NodeId {
    NodeId::new(id)
}

struct Swarm {
    dir: TempDir,
    remote: SharedRemote,
    clock: Arc<FixedClock>,
}

impl Swarm {
    fn new() -> Self {
        Self {
            dir: tempfile::tempdir().unwrap(),
            remote: SharedRemote::new(),
            clock: Arc::new(FixedClock::new(t0())),
        }
    }

    /// A node with its own ledger, replicated through the shared remote.
    async fn replica(&self, name: &str) -> (Node, Arc<MemoryReplicator>) {
        let replicator = Arc::new(MemoryReplicator::new(self.remote.clone()));
        let path = self.dir.path().join(name).join("ledger.jsonl");
        let node = self.build(name, path, replicator.clone()).await;
        (node, replicator)
    }

    /// A node sharing one ledger file with the other local nodes.
    async fn local(&self, name: &str) -> Node {
        let path = self.dir.path().join("shared").join("ledger.jsonl");
        self.build(name, path, Arc::new(NoReplication)).await
    }

    async fn build(&self, name: &str, path: PathBuf, replicator: Arc<dyn Replicator>) -> Node {
        let node = NodeBuilder::new()
            .node_id(n(name))
            .ledger_path(path)
            .replicator(replicator)
            .clock(self.clock.clone())
            .meter(Arc::new(StaticMeter(ResourceSample::default())))
            .sync_options(SyncOptions {
                max_attempts: 2,
                retry: RetryPolicy::new(StdDuration::from_millis(1), 1.0),
                warn_after: 2,
            })
            .build()
            .unwrap();
        node.bootstrap().await.unwrap();
        node
    }
}

async fn enqueue(node: &Node, locator: &str) -> TaskId {
    node.machine()
        .enqueue(Source::new("github", locator), 10.0, BTreeSet::new())
        .await
        .unwrap()
}

async fn task(node: &Node, id: &TaskId) -> Task {
    node.store().load().await.unwrap().task(id).unwrap().clone()
}

fn reclaims(task: &Task) -> Vec<&crate::domain::HistoryEntry> {
    task.history
        .iter()
        .filter(|e| matches!(e.event, HistoryEvent::Reclaimed { .. }))
        .collect()
}

#[tokio::test]
async fn stale_claim_is_refused_and_dead_owner_is_reclaimed() {
    let swarm = Swarm::new();
    let n1 = swarm.local("n1").await;
    let n2 = swarm.local("n2").await;
    let t42 = TaskId::new("t-42");

    let mut queued = Task::discovered(t42.clone(), Source::new("github", "org/repo#42"), n("scanner"), t0());
    queued.stage = Stage::Queued;
    queued.revision = 7;
    let mut seeded = Ledger::new();
    seeded.revision = 7;
    seeded.insert_task(queued);
    n1.store().replace(&seeded).await.unwrap();

    assert_eq!(n1.claims().try_claim(&t42, 7).await.unwrap(), 8);
    let ledger = n1.store().load().await.unwrap();
    assert_eq!(ledger.revision, 8);
    let claimed = ledger.task(&t42).unwrap();
    assert_eq!(claimed.stage, Stage::Claimed);
    assert_eq!(claimed.owner_node_id, Some(n("n1")));
    assert_eq!(claimed.lease_expires_at, Some(t0() + Duration::seconds(600)));

    // n2 still believes the task is at revision 7
    let stale = n2
        .store()
        .apply_transition(&t42, 7, |l| l.claim(&t42, &n("n2"), t0(), Duration::seconds(600)))
        .await;
    assert!(matches!(
        stale,
        Err(LedgerError::StaleRevision { expected: 7, actual: 8, .. })
    ));
    let err = n2.claims().try_claim(&t42, 7).await.unwrap_err();
    assert!(matches!(err, LedgerError::AlreadyClaimed { owner, .. } if owner == n("n1")));

    swarm.clock.advance(Duration::seconds(601));
    let reclaimed = n2.liveness().reap().await.unwrap();
    assert_eq!(reclaimed, vec![(t42.clone(), n("n1"))]);

    let ledger = n2.store().load().await.unwrap();
    assert_eq!(ledger.revision, 9);
    let task = ledger.task(&t42).unwrap();
    assert_eq!(task.stage, Stage::Queued);
    assert_eq!(task.owner_node_id, None);
    assert_eq!(task.lease_expires_at, None);

    let claim = task
        .history
        .iter()
        .find(|e| matches!(e.event, HistoryEvent::Claimed { .. }))
        .unwrap();
    assert_eq!((&claim.node, claim.at), (&n("n1"), t0()));
    let reclaim = task.history.last().unwrap();
    assert_eq!(reclaim.at, t0() + Duration::seconds(601));
    assert!(matches!(
        &reclaim.event,
        HistoryEvent::Reclaimed { abandoned_by, .. } if *abandoned_by == n("n1")
    ));
    assert_eq!(ledger.node(&n("n1")).unwrap().active_task_id, None);
}

#[tokio::test]
async fn partitioned_claim_loses_to_the_later_claim() {
    let swarm = Swarm::new();
    let (n1, r1) = swarm.replica("n1").await;
    let (n2, _r2) = swarm.replica("n2").await;
    let id = enqueue(&n1, "org/repo#1").await;
    n1.sync().push(n1.store()).await.unwrap();
    n2.sync().pull(n2.store()).await.unwrap();

    r1.set_online(false);
    assert_eq!(n1.claims().claim_next().await.unwrap(), Some(id.clone()));
    assert!(!task(&n1, &id).await.is_confirmed());

    swarm.clock.advance(Duration::seconds(5));
    assert_eq!(n2.claims().claim_next().await.unwrap(), Some(id.clone()));
    assert!(task(&n2, &id).await.is_confirmed());
    let published = swarm.remote.snapshot().unwrap();
    assert_eq!(published.task(&id).unwrap().owner_node_id, Some(n("n2")));

    r1.set_online(true);
    let before = n1.store().load().await.unwrap().revision;
    let report = n1.worker().run_once().await.unwrap();
    assert_eq!(
        report.reconciled,
        Reconciled::Lost {
            task: id.clone(),
            winner: Some(n("n2")),
        }
    );
    assert_eq!(report.claimed, None);

    let ledger = n1.store().load().await.unwrap();
    assert!(ledger.revision > before);
    assert_eq!(ledger.node(&n("n1")).unwrap().active_task_id, None);
    let lost = ledger.task(&id).unwrap();
    assert_eq!(lost.owner_node_id, Some(n("n2")));
    assert!(lost
        .history
        .iter()
        .any(|e| e.node == n("n1") && matches!(e.event, HistoryEvent::ClaimLost { .. })));

    let err = n1.machine().checkpoint(&id).await.unwrap_err();
    assert!(matches!(err, LedgerError::ClaimLost { winner: Some(w), .. } if w == n("n2")));
    let err = n1
        .machine()
        .submit_artifact(&id, Stage::Prompting, ArtifactRef::new("prompt"))
        .await
        .unwrap_err();
    assert!(matches!(err, LedgerError::NotOwner { .. }));
}

#[tokio::test]
async fn simultaneous_claims_resolve_by_node_id() {
    let swarm = Swarm::new();
    let (n1, r1) = swarm.replica("n1").await;
    let (n2, r2) = swarm.replica("n2").await;
    let id = enqueue(&n1, "org/repo#2").await;
    n1.sync().push(n1.store()).await.unwrap();
    n2.sync().pull(n2.store()).await.unwrap();

    r1.set_online(false);
    r2.set_online(false);
    assert!(n1.claims().claim_next().await.unwrap().is_some());
    assert!(n2.claims().claim_next().await.unwrap().is_some());
    r1.set_online(true);
    r2.set_online(true);

    // n1 publishes first; the tie still goes to the greater node id
    n1.sync().sync(n1.store()).await.unwrap();
    n2.sync().sync(n2.store()).await.unwrap();
    n1.sync().pull(n1.store()).await.unwrap();

    for node in [&n1, &n2] {
        assert_eq!(task(node, &id).await.owner_node_id, Some(n("n2")));
    }
    assert_eq!(n2.worker().reconcile().await.unwrap(), Reconciled::Holding(id.clone()));
    assert!(matches!(
        n1.worker().reconcile().await.unwrap(),
        Reconciled::Lost { winner: Some(w), .. } if w == n("n2")
    ));
}

#[tokio::test]
async fn heartbeat_reclaims_tasks_of_dead_nodes() {
    let swarm = Swarm::new();
    let (n1, _r1) = swarm.replica("n1").await;
    let (n2, _r2) = swarm.replica("n2").await;
    let id = enqueue(&n1, "org/repo#3").await;
    assert_eq!(n1.claims().claim_next().await.unwrap(), Some(id.clone()));
    n2.sync().pull(n2.store()).await.unwrap();

    // before the timeout nothing happens
    swarm.clock.advance(Duration::seconds(300));
    assert!(n2.liveness().tick().await.unwrap().reclaimed.is_empty());

    swarm.clock.advance(Duration::seconds(301));
    let report = n2.liveness().tick().await.unwrap();
    assert_eq!(report.reclaimed, vec![(id.clone(), n("n1"))]);
    assert!(!report.working);
    assert!(!report.offline);

    let reclaimed = task(&n2, &id).await;
    assert_eq!(reclaimed.stage, Stage::Queued);
    assert_eq!(reclaimed.owner_node_id, None);
    assert!(matches!(
        &reclaims(&reclaimed)[..],
        [entry] if matches!(&entry.event, HistoryEvent::Reclaimed { abandoned_by, claim: Some(c) }
            if *abandoned_by == n("n1") && c.node == n("n1") && c.at == t0())
    ));

    assert_eq!(n2.claims().claim_next().await.unwrap(), Some(id.clone()));

    // n1 comes back and its collaborators are told to stop
    n1.worker().run_once().await.unwrap();
    let err = n1.machine().checkpoint(&id).await.unwrap_err();
    assert!(matches!(err, LedgerError::ClaimLost { winner: Some(w), .. } if w == n("n2")));
}

#[tokio::test]
async fn relayed_node_record_does_not_erase_a_fresh_claim() {
    let swarm = Swarm::new();
    let (n1, _r1) = swarm.replica("n1").await;
    let (n2, _r2) = swarm.replica("n2").await;

    n1.liveness().tick().await.unwrap();
    for locator in ["org/repo-a", "org/repo-b", "org/repo-c", "org/repo-d", "org/repo-e"] {
        enqueue(&n2, locator).await;
    }
    // n2 merges n1's record and republishes it under its own, higher revision
    n2.sync().sync(n2.store()).await.unwrap();
    n1.sync().pull(n1.store()).await.unwrap();

    let first = n1.claims().claim_next().await.unwrap();
    let Some(first) = first else {
        panic!("n1 should have claimed a task");
    };
    let ledger = n1.store().load().await.unwrap();
    assert_eq!(ledger.node(&n("n1")).unwrap().active_task_id, Some(first.clone()));

    let err = n1.claims().claim_next().await.unwrap_err();
    assert!(matches!(err, LedgerError::NodeBusy { active, .. } if active == first));

    // the lease keeps being renewed while n1 is alive
    for _ in 0..30 {
        swarm.clock.advance(Duration::seconds(30));
        n2.liveness().tick().await.unwrap();
        n1.liveness().tick().await.unwrap();
    }
    let ledger = n1.store().load().await.unwrap();
    let owned: Vec<_> = ledger
        .tasks
        .values()
        .filter(|t| t.is_owned_by(&n("n1")) && !t.stage.is_terminal())
        .collect();
    assert_eq!(owned.len(), 1);
    assert_eq!(owned[0].id, first);
    assert!(owned[0].lease_expires_at.is_some_and(|l| l > swarm.clock.now()));
    assert_eq!(ledger.node(&n("n1")).unwrap().active_task_id, Some(first));
}

#[tokio::test]
async fn owned_task_is_restored_as_the_active_task() {
    let swarm = Swarm::new();
    let n1 = swarm.local("n1").await;
    let a = enqueue(&n1, "org/repo#20").await;
    enqueue(&n1, "org/repo#21").await;
    assert_eq!(n1.claims().claim_next().await.unwrap(), Some(a.clone()));

    n1.store()
        .update(|l| {
            l.node_entry(&n("n1"), t0()).active_task_id = None;
            Ok(())
        })
        .await
        .unwrap();

    let err = n1.claims().claim_next().await.unwrap_err();
    assert!(matches!(err, LedgerError::NodeBusy { active, .. } if active == a));

    assert_eq!(n1.worker().reconcile().await.unwrap(), Reconciled::Holding(a.clone()));
    let ledger = n1.store().load().await.unwrap();
    assert_eq!(ledger.node(&n("n1")).unwrap().active_task_id, Some(a));
}

#[tokio::test]
async fn issue_metadata_sets_the_initial_score() {
    let swarm = Swarm::new();
    let n1 = swarm.local("n1").await;
    let facts = IssueFacts {
        title: "Crash on startup".into(),
        body: "Steps to reproduce: run it".into(),
        comments: 7,
    };
    let (id, score) = n1
        .machine()
        .enqueue_issue(Source::new("github", "org/repo#30"), &facts, BTreeSet::new())
        .await
        .unwrap();
    assert_eq!(score, 60.0);

    let queued = task(&n1, &id).await;
    assert_eq!(queued.stage, Stage::Queued);
    assert_eq!(queued.score, 60.0);
    assert_eq!(queued.source.title.as_deref(), Some("Crash on startup"));

    // the higher score is claimed first
    enqueue(&n1, "org/repo#31").await;
    assert_eq!(n1.claims().claim_next().await.unwrap(), Some(id));
}

#[tokio::test]
async fn racing_reclaims_converge_without_duplicates() {
    let swarm = Swarm::new();
    let (n1, _r1) = swarm.replica("n1").await;
    let (n2, r2) = swarm.replica("n2").await;
    let (n3, r3) = swarm.replica("n3").await;
    let id = enqueue(&n1, "org/repo#4").await;
    n1.claims().claim_next().await.unwrap();
    n2.sync().pull(n2.store()).await.unwrap();
    n3.sync().pull(n3.store()).await.unwrap();

    swarm.clock.advance(Duration::seconds(601));
    r2.set_online(false);
    r3.set_online(false);
    assert_eq!(n2.liveness().reap().await.unwrap().len(), 1);
    assert_eq!(n3.liveness().reap().await.unwrap().len(), 1);
    r2.set_online(true);
    r3.set_online(true);

    n2.sync().sync(n2.store()).await.unwrap();
    n3.sync().sync(n3.store()).await.unwrap();
    n2.sync().pull(n2.store()).await.unwrap();

    let (a, b) = (task(&n2, &id).await, task(&n3, &id).await);
    assert_eq!(a.history, b.history);
    for converged in [&a, &b] {
        assert_eq!(converged.stage, Stage::Queued);
        assert_eq!(converged.owner_node_id, None);
        let entries = reclaims(converged);
        assert_eq!(entries.len(), 1);
        assert_eq!(entries[0].node, n("n3"));
    }
}

#[tokio::test]
async fn artifact_redelivery_is_a_no_op() {
    let swarm = Swarm::new();
    let n1 = swarm.local("n1").await;
    let id = enqueue(&n1, "org/repo#5").await;

    let err = n1
        .machine()
        .submit_artifact(&id, Stage::Generating, ArtifactRef::new("code"))
        .await
        .unwrap_err();
    assert!(matches!(
        err,
        LedgerError::InvalidTransition {
            from: Stage::Queued,
            to: Stage::Generating,
            ..
        }
    ));

    n1.claims().claim_next().await.unwrap();
    let first = n1
        .machine()
        .submit_artifact(&id, Stage::Prompting, ArtifactRef::new("prompt:v1"))
        .await
        .unwrap();
    let second = n1
        .machine()
        .submit_artifact(&id, Stage::Prompting, ArtifactRef::new("prompt:v1"))
        .await
        .unwrap();
    assert_eq!(first.revision, second.revision);
    assert_eq!(
        first.task(&id).unwrap().history.len(),
        second.task(&id).unwrap().history.len()
    );

    let err = n1
        .machine()
        .submit_artifact(&id, Stage::Prompting, ArtifactRef::new("prompt:v2"))
        .await
        .unwrap_err();
    assert!(matches!(err, LedgerError::ArtifactConflict { .. }));
}

#[tokio::test]
async fn publishing_waits_for_a_confirmed_claim() {
    let swarm = Swarm::new();
    let (n1, r1) = swarm.replica("n1").await;
    let id = enqueue(&n1, "org/repo#6").await;

    r1.set_online(false);
    n1.claims().claim_next().await.unwrap();
    for (stage, artifact) in [
        (Stage::Prompting, "prompt"),
        (Stage::AwaitingSpec, "spec"),
        (Stage::Generating, "patch"),
        (Stage::Validating, "tests:ok"),
    ] {
        n1.machine()
            .submit_artifact(&id, stage, ArtifactRef::new(artifact))
            .await
            .unwrap();
    }
    let err = n1
        .machine()
        .submit_artifact(&id, Stage::Publishing, ArtifactRef::new("pr"))
        .await
        .unwrap_err();
    assert!(matches!(err, LedgerError::ClaimUnconfirmed { .. }));

    r1.set_online(true);
    let report = n1.worker().run_once().await.unwrap();
    assert_eq!(report.reconciled, Reconciled::Holding(id.clone()));
    assert_eq!(report.confirmed, Some(id.clone()));

    n1.machine()
        .submit_artifact(&id, Stage::Publishing, ArtifactRef::new("pr"))
        .await
        .unwrap();
    n1.machine()
        .submit_artifact(&id, Stage::Archived, ArtifactRef::new("https://example.invalid/pr/1"))
        .await
        .unwrap();

    assert_eq!(
        n1.machine().checkpoint(&id).await.unwrap(),
        Checkpoint::Finished(Stage::Archived)
    );
    let ledger = n1.store().load().await.unwrap();
    let record = ledger.node(&n("n1")).unwrap();
    assert_eq!(record.active_task_id, None);
    assert_eq!(record.completed_tasks, 1);
    assert_eq!(ledger.task(&id).unwrap().lease_expires_at, None);
}

#[tokio::test]
async fn operator_cancel_stops_in_flight_work() {
    let swarm = Swarm::new();
    let n1 = swarm.local("n1").await;
    let operator = swarm.local("operator").await;
    let id = enqueue(&n1, "org/repo#7").await;
    n1.claims().claim_next().await.unwrap();
    assert_eq!(
        n1.machine().checkpoint(&id).await.unwrap(),
        Checkpoint::Continue(Stage::Claimed)
    );

    operator.machine().cancel(&id, "duplicate").await.unwrap();
    let revision = n1.store().load().await.unwrap().revision;
    operator.machine().cancel(&id, "duplicate").await.unwrap();
    assert_eq!(n1.store().load().await.unwrap().revision, revision);

    let err = n1.machine().checkpoint(&id).await.unwrap_err();
    assert!(matches!(err, LedgerError::Cancelled { .. }));
    let ledger = n1.store().load().await.unwrap();
    assert_eq!(ledger.task(&id).unwrap().stage, Stage::Abandoned);
    assert_eq!(ledger.node(&n("n1")).unwrap().active_task_id, None);
}

#[tokio::test]
async fn failure_budget_marks_the_task_failed() {
    let swarm = Swarm::new();
    let n1 = swarm.local("n1").await;
    let id = enqueue(&n1, "org/repo#8").await;
    n1.claims().claim_next().await.unwrap();

    for _ in 0..2 {
        let decision = n1.machine().report_failure(&id, "llm timeout").await.unwrap();
        assert!(matches!(decision, Decision::Retry { .. }));
    }
    let decision = n1.machine().report_failure(&id, "llm timeout").await.unwrap();
    assert!(matches!(decision, Decision::MarkFailed { .. }));

    assert_eq!(
        n1.machine().checkpoint(&id).await.unwrap(),
        Checkpoint::Finished(Stage::Failed)
    );
    let ledger = n1.store().load().await.unwrap();
    assert_eq!(ledger.node(&n("n1")).unwrap().active_task_id, None);
}

#[tokio::test]
async fn released_task_can_be_claimed_by_another_node() {
    let swarm = Swarm::new();
    let n1 = swarm.local("n1").await;
    let n2 = swarm.local("n2").await;
    let id = enqueue(&n1, "org/repo#9").await;
    n1.claims().claim_next().await.unwrap();

    let err = n1.claims().claim_next().await.unwrap_err();
    assert!(matches!(err, LedgerError::NodeBusy { .. }));

    n1.machine().release(&id).await.unwrap();
    assert_eq!(task(&n1, &id).await.stage, Stage::Queued);
    assert_eq!(n2.claims().claim_next().await.unwrap(), Some(id.clone()));
    assert_eq!(task(&n2, &id).await.owner_node_id, Some(n("n2")));
}

#[tokio::test]
async fn resource_gate_blocks_claims() {
    let swarm = Swarm::new();
    let n1 = swarm.local("n1").await;
    enqueue(&n1, "org/repo#10").await;
    let drained = NodeBuilder::new()
        .node_id(n("phone"))
        .ledger_path(n1.store().path().to_path_buf())
        .clock(swarm.clock.clone())
        .meter(Arc::new(StaticMeter(ResourceSample {
            battery: Some(5),
            charging: Some(false),
            ..ResourceSample::default()
        })))
        .build()
        .unwrap();

    let err = drained.claims().claim_next().await.unwrap_err();
    assert!(matches!(err, LedgerError::ResourceGated { .. }));
    let report = drained.worker().run_once().await.unwrap();
    assert_eq!(report.claimed, None);
}

#[tokio::test]
async fn corrupt_ledger_halts_the_worker_and_marks_the_node_degraded() {
    let swarm = Swarm::new();
    let n1 = swarm.local("n1").await;
    tokio::fs::write(n1.store().path(), "not a ledger\n").await.unwrap();

    let (tx, rx) = tokio::sync::watch::channel(false);
    n1.worker().run(rx).await;
    assert!(n1.context().is_degraded());
    drop(tx);
}
