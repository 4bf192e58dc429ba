//! Ports - 抽象化レイヤー
//!
//! このモジュールは Hexagonal Architecture の「ポート」を定義します。
//! 各 trait は外部のもの（時刻、同期手段、スケジューリング方針、ホストの計測値）への
//! インターフェースを提供し、実装の詳細を隠蔽します。
//!
//! # 設計原則
//! - ledger ファイルが source of truth（正本）
//! - 同期手段は差し替え可能（git / cloud / peer / memory）
//! - スケジューラは ledger を読むだけ

pub mod clock;
pub mod replicator;
pub mod resources;
pub mod scheduler;

pub use self::clock::{Clock, FixedClock, SystemClock};
pub use self::replicator::{PullReport, PushReport, Replicator};
pub use self::resources::{ResourceLimits, ResourceMeter, ResourceSample};
pub use self::scheduler::SchedulerPolicy;
