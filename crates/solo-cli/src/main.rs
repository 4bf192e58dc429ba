//! `solo` - swarm ノードの CLI
//!
//! - `run`: heartbeat と worker の 2 ループを起動（Ctrl-C で停止）
//! - それ以外: コラボレーターとオペレーター向けの 1 回きりの操作

use std::collections::BTreeSet;
use std::path::PathBuf;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use serde_json::json;
use tracing_subscriber::EnvFilter;

use solo_core::app::{Checkpoint, Node, NodeBuilder};
use solo_core::config::{DEFAULT_CONFIG_FILE, SwarmConfig};
use solo_core::domain::{ArtifactRef, Decision, Source, Stage, TaskId};
use solo_core::identity::{detect_capabilities, resolve_node_id};
use solo_core::impls::IssueFacts;
use solo_core::store::codec;

#[derive(Parser, Debug)]
#[command(name = "solo", about = "Serverless one-task-at-a-time swarm node")]
struct Cli {
    /// Path to the swarm config file.
    #[arg(long, global = true, env = "SOLO_CONFIG", default_value = DEFAULT_CONFIG_FILE)]
    config: PathBuf,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Write the default config (if missing) and create the local ledger.
    Init,

    /// Run the heartbeat and worker loops until Ctrl-C.
    Run,

    /// Discover, score and queue a task.
    Enqueue {
        /// Origin system (e.g. github).
        system: String,
        /// Locator inside the origin system (e.g. org/repo#12).
        locator: String,
        #[arg(long)]
        title: Option<String>,
        /// Fixed score. Without it the score is computed from the issue metadata.
        #[arg(long)]
        score: Option<f64>,
        /// Issue body, for scoring.
        #[arg(long, default_value = "")]
        body: String,
        /// Issue comment count, for scoring.
        #[arg(long, default_value_t = 0)]
        comments: u32,
        /// Capability the claiming node must have. Repeatable.
        #[arg(long = "requires")]
        requires: Vec<String>,
    },

    /// Record a stage artifact for a task.
    Submit {
        task: String,
        /// Stage being recorded (e.g. prompting, awaiting_spec).
        stage: Stage,
        artifact: String,
    },

    /// Report a failure at the task's current stage.
    Fail { task: String, reason: String },

    /// Hand the active task back to the queue.
    Release { task: String },

    /// Give up on the active task.
    Abandon { task: String, reason: String },

    /// Operator cancel.
    Cancel {
        task: String,
        #[arg(long, default_value = "cancelled by operator")]
        reason: String,
    },

    /// Exit non-zero if in-flight work on the task should stop.
    Checkpoint { task: String },

    /// Print one task with its history.
    Show { task: String },

    /// Print swarm health.
    Status,

    /// Run a single heartbeat tick.
    Heartbeat,

    /// Pull then push once.
    Sync,

    /// Replace the local ledger with a trusted copy.
    Resync {
        /// Ledger file to install.
        from: PathBuf,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| "info".into()))
        .init();

    let cli = Cli::parse();
    let config = SwarmConfig::load_or_init(&cli.config)
        .with_context(|| format!("loading config {}", cli.config.display()))?;
    let node = open_node(&config).await?;

    match cli.command {
        Commands::Init => {
            let created = node.bootstrap().await?;
            print(json!({
                "node_id": node.node_id(),
                "ledger": node.store().path(),
                "created": created,
                "sync": node.sync().kind(),
            }))
        }
        Commands::Run => run(node).await,
        Commands::Enqueue {
            system,
            locator,
            title,
            score,
            body,
            comments,
            requires,
        } => {
            node.bootstrap().await?;
            let source = Source::new(system, locator);
            let requires: BTreeSet<String> = requires.into_iter().collect();
            let (id, score) = match score {
                Some(score) => {
                    let source = match title {
                        Some(title) => source.with_title(title),
                        None => source,
                    };
                    (node.machine().enqueue(source, score, requires).await?, score)
                }
                None => {
                    let facts = IssueFacts {
                        title: title.unwrap_or_default(),
                        body,
                        comments,
                    };
                    node.machine().enqueue_issue(source, &facts, requires).await?
                }
            };
            print(json!({ "task": id, "score": score }))
        }
        Commands::Submit {
            task,
            stage,
            artifact,
        } => {
            let task = task_id(&task)?;
            let ledger = node
                .machine()
                .submit_artifact(&task, stage, ArtifactRef::new(artifact))
                .await
                .with_context(|| format!("recording {stage} for {task}"))?;
            print(json!({ "task": task, "stage": stage, "revision": ledger.revision }))
        }
        Commands::Fail { task, reason } => {
            let task = task_id(&task)?;
            let decision = node.machine().report_failure(&task, &reason).await?;
            let out = match decision {
                Decision::Retry { delay, reason } => {
                    json!({ "decision": "retry", "delay_secs": delay.as_secs_f64(), "reason": reason })
                }
                Decision::MarkFailed { reason } => {
                    json!({ "decision": "failed", "reason": reason })
                }
            };
            print(out)
        }
        Commands::Release { task } => {
            node.machine().release(&task_id(&task)?).await?;
            Ok(())
        }
        Commands::Abandon { task, reason } => {
            node.machine().abandon(&task_id(&task)?, &reason).await?;
            Ok(())
        }
        Commands::Cancel { task, reason } => {
            node.machine().cancel(&task_id(&task)?, &reason).await?;
            Ok(())
        }
        Commands::Checkpoint { task } => {
            let task = task_id(&task)?;
            let out = match node.machine().checkpoint(&task).await? {
                Checkpoint::Continue(stage) => json!({ "task": task, "continue": true, "stage": stage }),
                Checkpoint::Finished(stage) => json!({ "task": task, "continue": false, "stage": stage }),
            };
            print(out)
        }
        Commands::Show { task } => {
            let task = task_id(&task)?;
            let ledger = node.store().load().await?;
            print(serde_json::to_value(ledger.task(&task)?)?)
        }
        Commands::Status => print(serde_json::to_value(node.status().await?)?),
        Commands::Heartbeat => {
            node.bootstrap().await?;
            let report = node.liveness().tick().await?;
            print(serde_json::to_value(report)?)
        }
        Commands::Sync => {
            node.bootstrap().await?;
            let (pulled, pushed) = node.sync().sync(node.store()).await?;
            print(json!({
                "remote_revision": pulled.remote_revision,
                "local_revision": pulled.local_revision,
                "merged": pulled.changed,
                "pushed_revision": pushed.revision,
                "published": pushed.published,
            }))
        }
        Commands::Resync { from } => {
            let text = tokio::fs::read_to_string(&from)
                .await
                .with_context(|| format!("reading {}", from.display()))?;
            let ledger = codec::decode(&from, &text)?;
            node.store().replace(&ledger).await?;
            print(json!({ "revision": ledger.revision, "tasks": ledger.tasks.len() }))
        }
    }
}

async fn open_node(config: &SwarmConfig) -> Result<Node> {
    let node_id = resolve_node_id(config.node_id.as_deref(), &config.data_dir)
        .await
        .context("resolving node id")?;
    let detected = detect_capabilities().await;
    let node = NodeBuilder::from_config(config, node_id, detected)
        .build()
        .context("building node")?;
    Ok(node)
}

async fn run(node: Node) -> Result<()> {
    node.bootstrap().await?;
    tracing::info!(
        node = %node.node_id(),
        ledger = %node.store().path().display(),
        sync = node.sync().kind(),
        "starting node"
    );

    let runtime = node.spawn();
    tokio::select! {
        res = tokio::signal::ctrl_c() => {
            res.context("waiting for Ctrl-C")?;
            tracing::info!("shutdown requested");
        }
        _ = wait_until_finished(&runtime) => {
            tracing::warn!("node loops exited on their own");
        }
    }
    runtime.shutdown_and_join().await;
    Ok(())
}

async fn wait_until_finished(runtime: &solo_core::app::NodeRuntime) {
    while !runtime.is_finished() {
        tokio::time::sleep(std::time::Duration::from_secs(1)).await;
    }
}

fn task_id(raw: &str) -> Result<TaskId> {
    TaskId::parse(raw).with_context(|| format!("invalid task id {raw:?}"))
}

fn print(value: serde_json::Value) -> Result<()> {
    println!("{}", serde_json::to_string_pretty(&value)?);
    Ok(())
}
