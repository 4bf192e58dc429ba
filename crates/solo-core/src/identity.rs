//! Identity - ノード ID と capabilities の検出
//!
//! ノード ID はホストの安定した事実（ホスト名・アーキテクチャ・最初の MAC アドレス・
//! Android のシリアル）の SHA-256 から作ります。ハードウェア情報が取れない環境では
//! `data_dir` に保存したフォールバック ID を混ぜます。

use std::collections::BTreeSet;
use std::path::Path;

use sha2::{Digest, Sha256};
use ulid::Ulid;

use crate::domain::NodeId;
use crate::impls::command;

const FALLBACK_FILE: &str = "node-id";

/// Stable facts the node id is derived from.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct HostFacts {
    pub hostname: Option<String>,
    pub arch: String,
    pub mac: Option<String>,
    pub android_serial: Option<String>,
    /// Persisted random id, only used without hardware facts.
    pub fallback: Option<String>,
}

impl HostFacts {
    pub async fn gather(data_dir: &Path) -> std::io::Result<Self> {
        let mut facts = HostFacts {
            hostname: hostname().await,
            arch: std::env::consts::ARCH.to_string(),
            mac: first_mac().await,
            android_serial: android_serial().await,
            fallback: None,
        };
        if facts.mac.is_none() && facts.android_serial.is_none() {
            facts.fallback = Some(fallback_id(data_dir).await?);
        }
        Ok(facts)
    }

    pub fn node_id(&self) -> NodeId {
        let mut hasher = Sha256::new();
        for part in [
            self.hostname.as_deref().unwrap_or(""),
            self.arch.as_str(),
            self.mac.as_deref().unwrap_or(""),
            self.android_serial.as_deref().unwrap_or(""),
            self.fallback.as_deref().unwrap_or(""),
        ] {
            hasher.update(part.as_bytes());
            hasher.update([0u8]);
        }
        let digest = hex::encode(hasher.finalize());
        NodeId::new(format!("node-{}", &digest[..12]))
    }
}

/// Configured override, or the fingerprint of this host.
pub async fn resolve_node_id(configured: Option<&str>, data_dir: &Path) -> std::io::Result<NodeId> {
    if let Some(id) = configured {
        return Ok(NodeId::new(id));
    }
    Ok(HostFacts::gather(data_dir).await?.node_id())
}

/// Runtimes found on this host plus a platform tag.
pub async fn detect_capabilities() -> BTreeSet<String> {
    let mut caps = BTreeSet::new();
    for (program, tag) in [
        ("python3", "python"),
        ("node", "javascript"),
        ("java", "java"),
        ("git", "git"),
        ("cargo", "rust"),
    ] {
        if command::version_of(program).await.is_some() {
            caps.insert(tag.to_string());
        }
    }
    caps.insert(platform_tag(std::env::var_os("ANDROID_DATA").is_some()).to_string());
    caps
}

fn platform_tag(android: bool) -> &'static str {
    if android {
        "android"
    } else {
        std::env::consts::OS
    }
}

async fn hostname() -> Option<String> {
    for path in ["/proc/sys/kernel/hostname", "/etc/hostname"] {
        if let Ok(name) = tokio::fs::read_to_string(path).await {
            let name = name.trim();
            if !name.is_empty() {
                return Some(name.to_string());
            }
        }
    }
    std::env::var("HOSTNAME")
        .or_else(|_| std::env::var("COMPUTERNAME"))
        .ok()
        .filter(|n| !n.is_empty())
}

/// First non-loopback hardware address, by interface name.
async fn first_mac() -> Option<String> {
    let mut entries = tokio::fs::read_dir("/sys/class/net").await.ok()?;
    let mut interfaces = Vec::new();
    while let Ok(Some(entry)) = entries.next_entry().await {
        interfaces.push(entry.path());
    }
    interfaces.sort();
    for dir in interfaces {
        if dir.file_name().is_some_and(|n| n == "lo") {
            continue;
        }
        if let Ok(addr) = tokio::fs::read_to_string(dir.join("address")).await {
            if let Some(mac) = usable_mac(&addr) {
                return Some(mac);
            }
        }
    }
    None
}

fn usable_mac(raw: &str) -> Option<String> {
    let mac = raw.trim().to_ascii_lowercase();
    let zero = mac.chars().all(|c| c == '0' || c == ':');
    (!mac.is_empty() && !zero).then_some(mac)
}

async fn android_serial() -> Option<String> {
    let out = command::run("getprop", &["ro.serialno"], None).await.ok()?;
    let serial = out.stdout.trim();
    (out.success && !serial.is_empty() && serial != "unknown").then(|| serial.to_string())
}

/// Read the persisted fallback id, creating it on first use.
async fn fallback_id(data_dir: &Path) -> std::io::Result<String> {
    let path = data_dir.join(FALLBACK_FILE);
    match tokio::fs::read_to_string(&path).await {
        Ok(id) if !id.trim().is_empty() => return Ok(id.trim().to_string()),
        Ok(_) => {}
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
        Err(e) => return Err(e),
    }
    tokio::fs::create_dir_all(data_dir).await?;
    let id = Ulid::new().to_string();
    tokio::fs::write(&path, format!("{id}\n")).await?;
    tracing::info!(path = %path.display(), "generated fallback node id");
    Ok(id)
}

#[cfg(test)]
mod tests {
    use super::*;
    use rstest::rstest;

    fn facts() -> HostFacts {
        HostFacts {
            hostname: Some("pixel".into()),
            arch: "aarch64".into(),
            mac: Some("aa:bb:cc:dd:ee:ff".into()),
            android_serial: Some("R58M123".into()),
            fallback: None,
        }
    }

    #[test]
    fn node_id_is_stable_and_prefixed() {
        let id = facts().node_id();
        assert_eq!(id, facts().node_id());
        assert!(id.as_str().starts_with("node-"));
        assert_eq!(id.as_str().len(), "node-".len() + 12);
        assert!(id.as_str()[5..].chars().all(|c| c.is_ascii_hexdigit()));
    }

    #[test]
    fn any_fact_changes_the_id() {
        let mut other = facts();
        other.mac = Some("aa:bb:cc:dd:ee:00".into());
        assert_ne!(facts().node_id(), other.node_id());
    }

    #[rstest]
    #[case("AA:BB:CC:00:11:22\n", Some("aa:bb:cc:00:11:22"))]
    #[case("00:00:00:00:00:00\n", None)]
    #[case("", None)]
    fn mac_filtering(#[case] raw: &str, #[case] expected: Option<&str>) {
        assert_eq!(usable_mac(raw).as_deref(), expected);
    }

    #[tokio::test]
    async fn fallback_id_is_persisted() {
        let dir = tempfile::tempdir().unwrap();
        let first = fallback_id(dir.path()).await.unwrap();
        let second = fallback_id(dir.path()).await.unwrap();
        assert_eq!(first, second);
        assert!(dir.path().join(FALLBACK_FILE).exists());
    }

    #[tokio::test]
    async fn configured_id_wins() {
        let dir = tempfile::tempdir().unwrap();
        let id = resolve_node_id(Some("n1"), dir.path()).await.unwrap();
        assert_eq!(id, NodeId::new("n1"));
    }

    #[test]
    fn android_overrides_platform() {
        assert_eq!(platform_tag(true), "android");
        assert_eq!(platform_tag(false), std::env::consts::OS);
    }
}
