//! solo-core
//!
//! Core building blocks for a swarm of "one task at a time" nodes that
//! coordinate through a replicated ledger file instead of a server.
//!
//! # モジュール構成
//! - **domain**: ドメインモデル（ids, stage, task, node, history, ledger, errors, decision, retry）
//! - **ports**: 抽象化レイヤー（Clock, Replicator, SchedulerPolicy, ResourceMeter）
//! - **store**: ledger ファイルの読み書き（JSONL, atomic replace, ロックファイル）
//! - **impls**: 実装（git / cloud / peer / memory レプリケーション、スケジューラ、計測）
//! - **app**: アプリケーションロジック（claim, node machine, liveness, worker loop, runtime）
//! - **config**: `swarm.json`
//! - **identity**: ノード ID と capabilities の検出

pub mod app;
pub mod config;
pub mod domain;
pub mod identity;
pub mod impls;
pub mod ports;
pub mod store;
