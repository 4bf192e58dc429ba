//! Config - `swarm.json`
//!
//! 全フィールドにデフォルトがあり、ファイルが無ければデフォルトを書き出して使います。
//! 読み込み後に `validate()` で起動時検証（Fail-fast）を行います。

use std::collections::BTreeSet;
use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::app::{NodeSettings, SyncOptions};
use crate::domain::{DefaultDecider, RetryPolicy};
use crate::impls::RemoteFolder;
use crate::ports::ResourceLimits;

pub const DEFAULT_CONFIG_FILE: &str = "swarm.json";

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("cannot access config {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("cannot parse config {path}: {source}")]
    Parse {
        path: PathBuf,
        #[source]
        source: serde_json::Error,
    },

    #[error("invalid config: {0}")]
    Invalid(String),
}

/// How the ledger travels between nodes.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(tag = "method", rename_all = "snake_case")]
pub enum SyncConfig {
    /// Single node, no replication.
    #[default]
    None,
    Git {
        repo_dir: PathBuf,
        #[serde(default = "default_git_remote")]
        remote: String,
        #[serde(default = "default_git_branch")]
        branch: String,
    },
    Cloud {
        remote: RemoteFolder,
    },
    /// Folder kept in sync by a peer-to-peer tool (Syncthing).
    Peer {
        folder: PathBuf,
    },
}

fn default_git_remote() -> String {
    "origin".to_string()
}

fn default_git_branch() -> String {
    "main".to_string()
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ReplicationConfig {
    pub max_attempts: u32,
    pub base_delay_ms: u64,
    pub multiplier: f64,
    /// Consecutive failures before replication errors are logged at warn.
    pub warn_after: u32,
}

impl Default for ReplicationConfig {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            base_delay_ms: 2_000,
            multiplier: 2.0,
            warn_after: 3,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SwarmConfig {
    /// Overrides the hardware fingerprint.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub node_id: Option<String>,
    pub data_dir: PathBuf,
    /// Relative paths resolve against `data_dir`, or the sync folder for `peer`.
    pub ledger_file: PathBuf,
    pub sync: SyncConfig,
    pub heartbeat_interval_secs: u64,
    /// Defaults to `heartbeat_interval_secs`.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub idle_heartbeat_interval_secs: Option<u64>,
    pub poll_interval_secs: u64,
    pub claim_lease_secs: u64,
    pub dead_node_timeout_secs: u64,
    pub max_claim_attempts: u32,
    pub max_stage_failures: u32,
    pub replication: ReplicationConfig,
    pub resources: ResourceLimits,
    /// Extra capability tags added to the detected ones.
    pub capabilities: BTreeSet<String>,
}

impl Default for SwarmConfig {
    fn default() -> Self {
        Self {
            node_id: None,
            data_dir: PathBuf::from(".solo"),
            ledger_file: PathBuf::from("ledger.jsonl"),
            sync: SyncConfig::None,
            heartbeat_interval_secs: 30,
            idle_heartbeat_interval_secs: None,
            poll_interval_secs: 15,
            claim_lease_secs: 600,
            dead_node_timeout_secs: 600,
            max_claim_attempts: 3,
            max_stage_failures: 3,
            replication: ReplicationConfig::default(),
            resources: ResourceLimits::default(),
            capabilities: BTreeSet::new(),
        }
    }
}

impl SwarmConfig {
    /// Load `path`, writing the defaults there first if it does not exist.
    pub fn load_or_init(path: &Path) -> Result<Self, ConfigError> {
        if !path.exists() {
            let config = Self::default();
            config.save(path)?;
            tracing::info!(config = %path.display(), "wrote default config");
            return Ok(config);
        }
        Self::load(path)
    }

    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        let text = std::fs::read_to_string(path).map_err(|source| ConfigError::Io {
            path: path.to_path_buf(),
            source,
        })?;
        let config = Self::parse(path, &text)?;
        config.validate()?;
        Ok(config)
    }

    pub fn parse(path: &Path, text: &str) -> Result<Self, ConfigError> {
        serde_json::from_str(text).map_err(|source| ConfigError::Parse {
            path: path.to_path_buf(),
            source,
        })
    }

    pub fn save(&self, path: &Path) -> Result<(), ConfigError> {
        let io = |source| ConfigError::Io {
            path: path.to_path_buf(),
            source,
        };
        if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
            std::fs::create_dir_all(parent).map_err(io)?;
        }
        let mut text = serde_json::to_string_pretty(self).map_err(|source| ConfigError::Parse {
            path: path.to_path_buf(),
            source,
        })?;
        text.push('\n');
        std::fs::write(path, text).map_err(io)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        let invalid = |msg: &str| Err(ConfigError::Invalid(msg.to_string()));
        if self.claim_lease_secs == 0 {
            return invalid("claim_lease_secs must be greater than zero");
        }
        if self.heartbeat_interval_secs == 0 || self.idle_heartbeat_interval_secs == Some(0) {
            return invalid("heartbeat intervals must be greater than zero");
        }
        if self.dead_node_timeout_secs == 0 {
            return invalid("dead_node_timeout_secs must be greater than zero");
        }
        let slowest_beat = self
            .heartbeat_interval_secs
            .max(self.idle_heartbeat_interval_secs.unwrap_or(0));
        if self.dead_node_timeout_secs < 2 * slowest_beat {
            return Err(ConfigError::Invalid(format!(
                "dead_node_timeout_secs ({}) must be at least twice the heartbeat interval ({slowest_beat})",
                self.dead_node_timeout_secs
            )));
        }
        if self.poll_interval_secs == 0 {
            return invalid("poll_interval_secs must be greater than zero");
        }
        if self.max_claim_attempts == 0 || self.replication.max_attempts == 0 {
            return invalid("retry attempts must be at least 1");
        }
        if self.max_stage_failures == 0 {
            return invalid("max_stage_failures must be at least 1");
        }
        if self.replication.multiplier < 1.0 {
            return invalid("replication.multiplier must be at least 1.0");
        }
        Ok(())
    }

    /// Where the ledger lives on this node.
    pub fn ledger_path(&self) -> PathBuf {
        if self.ledger_file.is_absolute() {
            return self.ledger_file.clone();
        }
        match &self.sync {
            SyncConfig::Peer { folder } => folder.join(&self.ledger_file),
            SyncConfig::Git { repo_dir, .. } => repo_dir.join(&self.ledger_file),
            _ => self.data_dir.join(&self.ledger_file),
        }
    }

    pub fn to_settings(&self, detected: BTreeSet<String>) -> NodeSettings {
        let heartbeat = Duration::from_secs(self.heartbeat_interval_secs);
        let mut capabilities = detected;
        capabilities.extend(self.capabilities.iter().cloned());
        NodeSettings {
            lease: chrono::Duration::seconds(secs_i64(self.claim_lease_secs)),
            dead_after: chrono::Duration::seconds(secs_i64(self.dead_node_timeout_secs)),
            max_claim_attempts: self.max_claim_attempts,
            heartbeat_interval: heartbeat,
            idle_heartbeat_interval: self
                .idle_heartbeat_interval_secs
                .map(Duration::from_secs)
                .unwrap_or(heartbeat),
            poll_interval: Duration::from_secs(self.poll_interval_secs),
            capabilities,
            limits: self.resources,
        }
    }

    pub fn sync_options(&self) -> SyncOptions {
        let r = &self.replication;
        SyncOptions {
            max_attempts: r.max_attempts,
            retry: RetryPolicy::new(Duration::from_millis(r.base_delay_ms), r.multiplier)
                .with_jitter(0.2),
            warn_after: r.warn_after,
        }
    }

    pub fn decider(&self) -> DefaultDecider {
        DefaultDecider::new(RetryPolicy::default_v1(), self.max_stage_failures)
    }
}

fn secs_i64(secs: u64) -> i64 {
    i64::try_from(secs).unwrap_or(i64::MAX / 1_000)
}

#[cfg(test)]
mod tests {
    use super::*;
    use rstest::rstest;

    #[test]
    fn missing_file_writes_defaults() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("conf").join("swarm.json");

        let config = SwarmConfig::load_or_init(&path).unwrap();
        assert_eq!(config, SwarmConfig::default());
        assert!(path.exists());
        assert_eq!(SwarmConfig::load(&path).unwrap(), config);
    }

    #[test]
    fn partial_file_fills_defaults() {
        let text = r#"{
            "sync": {"method": "cloud", "remote": {"kind": "rclone", "remote": "gdrive:swarm"}},
            "heartbeat_interval_secs": 10,
            "resources": {"min_battery": 30}
        }"#;
        let config = SwarmConfig::parse(Path::new("swarm.json"), text).unwrap();
        assert_eq!(
            config.sync,
            SyncConfig::Cloud {
                remote: RemoteFolder::Rclone {
                    remote: "gdrive:swarm".into()
                }
            }
        );
        assert_eq!(config.claim_lease_secs, 600);
        assert_eq!(config.resources.min_battery, 30);
        assert_eq!(config.resources.max_disk_pct, 95.0);

        let settings = config.to_settings(BTreeSet::from(["git".to_string()]));
        assert_eq!(settings.idle_heartbeat_interval, Duration::from_secs(10));
        assert_eq!(settings.lease, chrono::Duration::seconds(600));
    }

    #[test]
    fn git_sync_defaults_remote_and_branch() {
        let text = r#"{"sync": {"method": "git", "repo_dir": "/srv/swarm"}}"#;
        let config = SwarmConfig::parse(Path::new("swarm.json"), text).unwrap();
        assert_eq!(
            config.sync,
            SyncConfig::Git {
                repo_dir: "/srv/swarm".into(),
                remote: "origin".into(),
                branch: "main".into(),
            }
        );
        assert_eq!(config.ledger_path(), PathBuf::from("/srv/swarm/ledger.jsonl"));
    }

    #[rstest]
    #[case::zero_lease(r#"{"claim_lease_secs": 0}"#)]
    #[case::zero_heartbeat(r#"{"heartbeat_interval_secs": 0}"#)]
    #[case::timeout_too_short(r#"{"heartbeat_interval_secs": 30, "dead_node_timeout_secs": 59}"#)]
    #[case::idle_beat_too_slow(r#"{"idle_heartbeat_interval_secs": 400}"#)]
    #[case::zero_attempts(r#"{"max_claim_attempts": 0}"#)]
    fn rejects_invalid_settings(#[case] text: &str) {
        let config = SwarmConfig::parse(Path::new("swarm.json"), text).unwrap();
        assert!(matches!(config.validate(), Err(ConfigError::Invalid(_))));
    }

    #[test]
    fn unknown_sync_method_is_a_parse_error() {
        let err = SwarmConfig::parse(Path::new("swarm.json"), r#"{"sync": {"method": "ftp"}}"#)
            .unwrap_err();
        assert!(matches!(err, ConfigError::Parse { .. }));
    }
}
